use std::io;
use std::sync::{Arc, OnceLock};
use thiserror::Error;

use crate::packet::{LoginRejectReason, PacketType};

/// All errors produced by this crate.
///
/// Terminal errors are stored in write-once [`ErrorSlot`]s on clients, sessions
/// and servers, so the enum is `Clone`; I/O errors are shared through an `Arc`
/// for that reason.
#[derive(Clone, Debug, Error)]
pub enum SoupError {
    #[error("invalid packet length")]
    InvalidPacketLen,
    #[error("expected packet length of {want}, got {got}")]
    MismatchPacketLen { want: usize, got: usize },
    #[error("invalid packet type {0:#04x}")]
    InvalidPacketType(u8),
    #[error("expected packet type {want:?}, got {got:#04x} (payload len: {payload_len})")]
    UnexpectedPacketType {
        want: PacketType,
        got: u8,
        payload_len: usize,
    },
    #[error("invalid packet (type: {packet_type:?}): {reason}")]
    InvalidPacket {
        packet_type: PacketType,
        reason: &'static str,
    },
    #[error("unexpected EOF while reading packet")]
    UnexpectedEof,
    #[error("payload too large")]
    PayloadTooLarge,
    #[error("{0} too long")]
    FieldTooLong(&'static str),

    #[error("login rejected (reason: {0:?})")]
    LoginRejected(LoginRejectReason),

    #[error("logged out")]
    LoggedOut,
    #[error("client logged out")]
    ClientLoggedOut,
    #[error("session ended")]
    SessionEnded,
    #[error("closed")]
    Closed,
    #[error("shutdown")]
    Shutdown,

    #[error("server timed out")]
    ServerTimedOut,
    #[error("client timed out")]
    ClientTimedOut,
    #[error("slow client")]
    SlowClient,

    #[error("sequence number not found")]
    NotFound,
    #[error("duplicate sequence number")]
    Duplicate,

    #[error("session already owned by a manager")]
    SessionOwned,
    #[error("session with this id already exists")]
    SessionExists,

    #[error("i/o: {0}")]
    Io(#[source] Arc<io::Error>),
}

impl From<io::Error> for SoupError {
    fn from(err: io::Error) -> SoupError {
        if err.kind() == io::ErrorKind::UnexpectedEof {
            SoupError::UnexpectedEof
        } else {
            SoupError::Io(Arc::new(err))
        }
    }
}

/// A write-once slot holding the terminal reason an object was closed.
///
/// The first write wins and is never cleared; every later write is discarded
/// and the caller gets the originally stored error back.
pub(crate) struct ErrorSlot(OnceLock<SoupError>);

impl ErrorSlot {
    pub fn new() -> ErrorSlot {
        ErrorSlot(OnceLock::new())
    }

    /// Stores `err` if the slot is still empty and returns whatever the slot
    /// holds afterwards.
    pub fn fire(&self, err: SoupError) -> SoupError {
        let _ = self.0.set(err);
        self.0.get().expect("slot was just written").clone()
    }

    pub fn get(&self) -> Option<SoupError> {
        self.0.get().cloned()
    }

    pub fn is_set(&self) -> bool {
        self.0.get().is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_slot_first_write_wins() {
        let slot = ErrorSlot::new();
        assert!(slot.get().is_none());
        assert!(!slot.is_set());

        assert!(matches!(slot.fire(SoupError::SlowClient), SoupError::SlowClient));
        assert!(matches!(slot.fire(SoupError::Closed), SoupError::SlowClient));
        assert!(matches!(slot.get(), Some(SoupError::SlowClient)));
        assert!(slot.is_set());
    }

    #[test]
    fn test_io_eof_mapping() {
        let eof = io::Error::new(io::ErrorKind::UnexpectedEof, "early eof");
        assert!(matches!(SoupError::from(eof), SoupError::UnexpectedEof));

        let refused = io::Error::new(io::ErrorKind::ConnectionRefused, "refused");
        assert!(matches!(SoupError::from(refused), SoupError::Io(_)));
    }
}
