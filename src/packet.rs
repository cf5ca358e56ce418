//! The packet framing: `[len:u16 BE][type:u8][payload:len-1]`.
//!
//! The length prefix counts the type byte, so it is always `1 + payload len`
//! and a prefix of zero is invalid. Fixed-size packet types carry exactly the
//! payload their type prescribes; the three data-carrying types (debug,
//! sequenced, unsequenced) are variable.

use std::borrow::Cow;
use std::fmt;
use std::fmt::{Debug, Formatter};

use bytes::{BufMut, Bytes, BytesMut};
use num_enum::{IntoPrimitive, TryFromPrimitive};
use tokio::io::{AsyncRead, AsyncReadExt};

use crate::error::SoupError;
use crate::fields::{
    Password, Payload, SequenceNumber, SessionId, Username, PASSWORD_LEN, SEQUENCE_NUMBER_LEN,
    SESSION_ID_LEN, USERNAME_LEN,
};
use crate::safe_converter::{PrecheckedCast, SafeCast};

pub const LOGIN_ACCEPTED_PAYLOAD_LEN: usize = SESSION_ID_LEN + SEQUENCE_NUMBER_LEN;
pub const LOGIN_REQUEST_PAYLOAD_LEN: usize =
    USERNAME_LEN + PASSWORD_LEN + SESSION_ID_LEN + SEQUENCE_NUMBER_LEN;

const PREFIX_LEN: usize = 3;

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, IntoPrimitive, TryFromPrimitive)]
#[repr(u8)]
pub enum PacketType {
    Debug = b'+',
    LoginAccepted = b'A',
    LoginReject = b'J',
    SequencedData = b'S',
    UnsequencedData = b'U',
    ServerHeartbeat = b'H',
    EndOfSession = b'Z',
    LoginRequest = b'L',
    ClientHeartbeat = b'R',
    LogoutRequest = b'O',
}

impl PacketType {
    /// The payload length this type must carry on the wire. The data-carrying
    /// types accept whatever the length prefix announced.
    fn expected_payload_len(self, announced: usize) -> usize {
        match self {
            PacketType::ServerHeartbeat
            | PacketType::EndOfSession
            | PacketType::ClientHeartbeat
            | PacketType::LogoutRequest => 0,
            PacketType::LoginReject => 1,
            PacketType::LoginAccepted => LOGIN_ACCEPTED_PAYLOAD_LEN,
            PacketType::LoginRequest => LOGIN_REQUEST_PAYLOAD_LEN,
            PacketType::Debug | PacketType::SequencedData | PacketType::UnsequencedData => announced,
        }
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, IntoPrimitive, TryFromPrimitive)]
#[repr(u8)]
pub enum LoginRejectReason {
    NotAuthorized = b'A',
    SessionNotAvail = b'S',
}

/// A complete packet, owning its wire representation.
///
/// Cloning is cheap (the bytes are shared), which is what the broadcast
/// fan-out relies on.
#[derive(Clone, PartialEq, Eq)]
pub struct Packet {
    buf: Bytes,
}

impl Packet {
    fn new(packet_type: PacketType, payload: &[u8]) -> Packet {
        let mut buf = BytesMut::with_capacity(PREFIX_LEN + payload.len());
        buf.put_u16((payload.len() + 1).prechecked_cast());
        buf.put_u8(packet_type.into());
        buf.put_slice(payload);
        Packet { buf: buf.freeze() }
    }

    pub fn debug(payload: Payload) -> Packet {
        Packet::new(PacketType::Debug, payload.as_bytes())
    }

    pub fn login_accepted(session: SessionId, seq_num: SequenceNumber) -> Packet {
        let mut payload = [0u8; LOGIN_ACCEPTED_PAYLOAD_LEN];
        payload[..SESSION_ID_LEN].copy_from_slice(session.as_bytes());
        payload[SESSION_ID_LEN..].copy_from_slice(seq_num.as_bytes());
        Packet::new(PacketType::LoginAccepted, &payload)
    }

    pub fn login_reject(reason: LoginRejectReason) -> Packet {
        Packet::new(PacketType::LoginReject, &[reason.into()])
    }

    pub fn sequenced_data(payload: Payload) -> Packet {
        Packet::new(PacketType::SequencedData, payload.as_bytes())
    }

    pub fn unsequenced_data(payload: Payload) -> Packet {
        Packet::new(PacketType::UnsequencedData, payload.as_bytes())
    }

    pub fn server_heartbeat() -> Packet {
        Packet::new(PacketType::ServerHeartbeat, &[])
    }

    pub fn end_of_session() -> Packet {
        Packet::new(PacketType::EndOfSession, &[])
    }

    pub fn login_request(
        username: Username,
        password: Password,
        session: SessionId,
        seq_num: SequenceNumber,
    ) -> Packet {
        let mut payload = [0u8; LOGIN_REQUEST_PAYLOAD_LEN];
        payload[..USERNAME_LEN].copy_from_slice(username.as_bytes());
        payload[USERNAME_LEN..USERNAME_LEN + PASSWORD_LEN].copy_from_slice(password.as_bytes());
        payload[USERNAME_LEN + PASSWORD_LEN..USERNAME_LEN + PASSWORD_LEN + SESSION_ID_LEN]
            .copy_from_slice(session.as_bytes());
        payload[USERNAME_LEN + PASSWORD_LEN + SESSION_ID_LEN..].copy_from_slice(seq_num.as_bytes());
        Packet::new(PacketType::LoginRequest, &payload)
    }

    pub fn client_heartbeat() -> Packet {
        Packet::new(PacketType::ClientHeartbeat, &[])
    }

    pub fn logout_request() -> Packet {
        Packet::new(PacketType::LogoutRequest, &[])
    }

    /// Parses a packet from a byte slice. The slice must contain the complete
    /// packet; trailing bytes are ignored.
    pub fn parse(b: &[u8]) -> Result<Packet, SoupError> {
        if b.len() < PREFIX_LEN {
            return Err(SoupError::UnexpectedEof);
        }
        let (packet_type, _, want) = validate_prefix([b[0], b[1], b[2]])?;
        if b.len() < PREFIX_LEN + want {
            return Err(SoupError::UnexpectedEof);
        }
        Ok(Packet::new(packet_type, &b[PREFIX_LEN..PREFIX_LEN + want]))
    }

    pub fn packet_type(&self) -> PacketType {
        PacketType::try_from(self.buf[2]).expect("packet was constructed with a validated type byte")
    }

    pub fn payload(&self) -> &[u8] {
        &self.buf[PREFIX_LEN..]
    }

    /// The payload as shared bytes, without copying.
    pub(crate) fn payload_bytes(&self) -> Bytes {
        self.buf.slice(PREFIX_LEN..)
    }

    /// The full wire representation, length prefix included.
    pub fn bytes(&self) -> &[u8] {
        &self.buf
    }

    pub fn payload_text(&self) -> Cow<'_, str> {
        String::from_utf8_lossy(self.payload())
    }

    /// The username and password of a login request; `None` for any other
    /// packet type.
    pub fn credentials(&self) -> Option<(Username, Password)> {
        Some((self.username()?, self.password()?))
    }

    pub fn username(&self) -> Option<Username> {
        if self.packet_type() != PacketType::LoginRequest || self.payload().len() < USERNAME_LEN {
            return None;
        }
        Some(Username::from_bytes_trunc(&self.payload()[..USERNAME_LEN]))
    }

    pub fn password(&self) -> Option<Password> {
        if self.packet_type() != PacketType::LoginRequest
            || self.payload().len() < USERNAME_LEN + PASSWORD_LEN
        {
            return None;
        }
        Some(Password::from_bytes_trunc(
            &self.payload()[USERNAME_LEN..USERNAME_LEN + PASSWORD_LEN],
        ))
    }

    /// The session id of a login request or login accepted packet.
    pub fn session_id(&self) -> Option<SessionId> {
        let payload = self.payload();
        match self.packet_type() {
            PacketType::LoginRequest => {
                let start = USERNAME_LEN + PASSWORD_LEN;
                if payload.len() < start + SESSION_ID_LEN {
                    return None;
                }
                Some(SessionId::from_bytes_trunc(&payload[start..start + SESSION_ID_LEN]))
            }
            PacketType::LoginAccepted => {
                if payload.len() < SESSION_ID_LEN {
                    return None;
                }
                Some(SessionId::from_bytes_trunc(&payload[..SESSION_ID_LEN]))
            }
            _ => None,
        }
    }

    /// The sequence number of a login request or login accepted packet.
    pub fn sequence_number(&self) -> Option<SequenceNumber> {
        let payload = self.payload();
        match self.packet_type() {
            PacketType::LoginRequest => {
                let start = USERNAME_LEN + PASSWORD_LEN + SESSION_ID_LEN;
                if payload.len() < start + SEQUENCE_NUMBER_LEN {
                    return None;
                }
                Some(SequenceNumber::from_bytes_trunc(
                    &payload[start..start + SEQUENCE_NUMBER_LEN],
                ))
            }
            PacketType::LoginAccepted => {
                if payload.len() < LOGIN_ACCEPTED_PAYLOAD_LEN {
                    return None;
                }
                Some(SequenceNumber::from_bytes_trunc(
                    &payload[SESSION_ID_LEN..LOGIN_ACCEPTED_PAYLOAD_LEN],
                ))
            }
            _ => None,
        }
    }

    /// The reason of a login reject packet.
    pub fn reject_reason(&self) -> Option<LoginRejectReason> {
        if self.packet_type() != PacketType::LoginReject || self.payload().is_empty() {
            return None;
        }
        LoginRejectReason::try_from(self.payload()[0]).ok()
    }
}

impl Debug for Packet {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Packet({:?}, payload len: {})",
            self.packet_type(),
            self.payload().len()
        )
    }
}

/// Validates the 3-byte prefix and returns the packet type, the announced
/// payload length and the number of payload bytes that must follow.
fn validate_prefix(prefix: [u8; 3]) -> Result<(PacketType, usize, usize), SoupError> {
    let len: usize = u16::from_be_bytes([prefix[0], prefix[1]]).safe_cast();
    if len == 0 {
        return Err(SoupError::InvalidPacketLen);
    }
    let announced = len - 1;
    let packet_type =
        PacketType::try_from(prefix[2]).map_err(|_| SoupError::InvalidPacketType(prefix[2]))?;
    let want = packet_type.expected_payload_len(announced);
    if announced < want {
        return Err(SoupError::MismatchPacketLen { want, got: announced });
    }
    Ok((packet_type, announced, want))
}

async fn read_payload<R: AsyncRead + Unpin>(
    r: &mut R,
    packet_type: PacketType,
    want: usize,
) -> Result<Packet, SoupError> {
    let mut payload = vec![0u8; want];
    r.read_exact(&mut payload).await?;
    Ok(Packet::new(packet_type, &payload))
}

/// Reads one packet: exactly 3 prefix bytes, then exactly the payload the
/// packet type prescribes. A short read fails with [`SoupError::UnexpectedEof`].
pub async fn read_packet_from<R: AsyncRead + Unpin>(r: &mut R) -> Result<Packet, SoupError> {
    let mut prefix = [0u8; PREFIX_LEN];
    r.read_exact(&mut prefix).await?;
    let (packet_type, _, want) = validate_prefix(prefix)?;
    read_payload(r, packet_type, want).await
}

/// Like [`read_packet_from`], but fails with
/// [`SoupError::UnexpectedPacketType`] before touching the payload when the
/// type byte is not `want`.
pub async fn try_read_packet_from_as<R: AsyncRead + Unpin>(
    r: &mut R,
    want: PacketType,
) -> Result<Packet, SoupError> {
    let mut prefix = [0u8; PREFIX_LEN];
    r.read_exact(&mut prefix).await?;
    let len: usize = u16::from_be_bytes([prefix[0], prefix[1]]).safe_cast();
    if len == 0 {
        return Err(SoupError::InvalidPacketLen);
    }
    if prefix[2] != u8::from(want) {
        return Err(SoupError::UnexpectedPacketType {
            want,
            got: prefix[2],
            payload_len: len - 1,
        });
    }
    let (packet_type, _, want_len) = validate_prefix(prefix)?;
    read_payload(r, packet_type, want_len).await
}
