//! Configuration for sessions, the server and the connector.

use std::sync::Arc;
use std::time::Duration;

use crate::fields::{Password, SequenceNumber, SessionId, Username};
use crate::handler::{ClientHandler, SessionHandler};

/// Interval at which the server emits heartbeats to every session's clients.
pub const SERVER_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(1);

/// How long a session tolerates silence from a client before evicting it.
pub const DEFAULT_CLIENT_TIMEOUT: Duration = Duration::from_secs(15);

/// How long a connector tolerates silence from the server before closing.
pub const DEFAULT_SERVER_TIMEOUT: Duration = Duration::from_secs(15);

/// A connector sends a heartbeat after this much send silence.
pub const CLIENT_HEARTBEAT_INTERVAL: Duration = Duration::from_millis(1000);

/// Default capacity of a session's input channel and of each client's
/// outbound queue.
pub const DEFAULT_PACKET_CHAN_LEN: usize = 15;

#[derive(Clone)]
pub struct SessionOpts {
    pub id: SessionId,
    /// The last sequence number already assigned; 0 for a fresh session.
    pub sequence_number: u64,
    /// Capacity of the session input channel and the per-client outbound
    /// queues. 0 falls back to [`DEFAULT_PACKET_CHAN_LEN`].
    pub packet_chan_len: usize,
    /// 0 falls back to [`DEFAULT_CLIENT_TIMEOUT`].
    pub client_timeout: Duration,
    pub new_client_handler: Option<Arc<dyn SessionHandler>>,
    pub debug_handler: Option<Arc<dyn SessionHandler>>,
}

impl Default for SessionOpts {
    fn default() -> SessionOpts {
        SessionOpts {
            id: SessionId::BLANK,
            sequence_number: 0,
            packet_chan_len: DEFAULT_PACKET_CHAN_LEN,
            client_timeout: DEFAULT_CLIENT_TIMEOUT,
            new_client_handler: None,
            debug_handler: None,
        }
    }
}

/// The single credential pair the server accepts.
#[derive(Copy, Clone)]
pub struct ServerOpts {
    pub username: Username,
    pub password: Password,
}

#[derive(Clone)]
pub struct ConnectOpts {
    /// Blank resolves to the server's current session.
    pub session: SessionId,
    /// 0 subscribes from the next new message; n > 0 requests replay from n.
    pub sequence_number: SequenceNumber,
    pub username: Username,
    pub password: Password,
    /// 0 falls back to [`DEFAULT_SERVER_TIMEOUT`].
    pub server_timeout: Duration,
    /// Upper bound on the connect + login handshake; no limit if `None`.
    /// Applies to the handshake only.
    pub handshake_deadline: Option<Duration>,
    pub debug_handler: Option<Arc<dyn ClientHandler>>,
}

impl Default for ConnectOpts {
    fn default() -> ConnectOpts {
        ConnectOpts {
            session: SessionId::BLANK,
            sequence_number: SequenceNumber::ZERO,
            username: Username::from_bytes_trunc(b""),
            password: Password::from_bytes_trunc(b""),
            server_timeout: DEFAULT_SERVER_TIMEOUT,
            handshake_deadline: None,
            debug_handler: None,
        }
    }
}
