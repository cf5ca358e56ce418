//! An implementation of the SoupBinTCP v4 session layer: reliable, ordered,
//! session-oriented framing over TCP, delivering a persistent and recoverable
//! stream of sequenced messages from a server to many logged-in clients, plus
//! an unsequenced best-effort back-channel in either direction.
//!
//! ## Protocol sketch
//!
//! * A server hosts named *sessions*. Each session owns a monotonically
//!   increasing sequence counter and a pluggable store of every sequenced
//!   payload it ever sent.
//! * A client connects over TCP and logs in with a username/password pair, a
//!   session id (blank selects the server's current session) and a requested
//!   sequence number (0 subscribes from the next new message, n > 0 requests
//!   replay starting at n).
//! * Sequenced messages are assigned contiguous sequence numbers, persisted,
//!   and delivered to every logged-in client in order. A client that joins
//!   late gets the missed range replayed from the store before live traffic.
//! * Both sides exchange heartbeats; a silent peer is disconnected after a
//!   timeout. A client that cannot keep up with the outbound stream is
//!   disconnected rather than allowed to stall the session.
//! * Ending a session broadcasts an end-of-session packet to every client.
//!
//! ## Wire format
//!
//! Every packet is a length-prefixed frame; all integers are big-endian:
//!
//! ```ascii
//! 0: packet length (u16) - counts the type byte plus the payload, so it is
//!     never 0
//! 2: packet type (u8)
//! 3: payload (packet length - 1 bytes)
//! ```
//!
//! Packet types and their payloads:
//!
//! ```ascii
//! '+' Debug            variable
//! 'A' LoginAccepted    session id [10] ++ sequence number [20]
//! 'J' LoginReject      reason (u8): 'A' not authorized / 'S' session not available
//! 'S' SequencedData    variable
//! 'U' UnsequencedData  variable
//! 'H' ServerHeartbeat  empty
//! 'Z' EndOfSession     empty
//! 'L' LoginRequest     username [6] ++ password [10] ++ session id [10]
//!                       ++ sequence number [20]
//! 'R' ClientHeartbeat  empty
//! 'O' LogoutRequest    empty
//! ```
//!
//! Text fields are ASCII: username and password are right-padded with spaces
//! and compare case-insensitively; session ids and sequence numbers are
//! left-padded with spaces. Sequence numbers are transmitted as decimal text.
//!
//! ## Task model
//!
//! Every logged-in connection runs a reader task and a writer task; the writer
//! drains a bounded per-client queue and is the single place that enforces
//! in-order delivery of sequenced packets. Each session runs one broadcast
//! worker that assigns sequence numbers, persists payloads and fans packets
//! out to its clients. One ticker task per manager emits server heartbeats.
//! There is no cancellation token: teardown propagates through write-once
//! close-error slots, channel closes and socket closes.

pub mod client;
pub mod config;
pub mod data_store;
pub mod error;
pub mod fields;
pub mod handler;
mod heartbeat;
pub mod packet;
pub mod safe_converter;
pub mod server;
pub mod session;
pub mod session_client;
pub mod sessions_manager;

pub use client::Client;
pub use config::{ConnectOpts, ServerOpts, SessionOpts};
pub use data_store::{DataStore, MapDataStore, VecDataStore};
pub use error::SoupError;
pub use fields::{Password, Payload, SequenceNumber, SessionId, Username};
pub use handler::{ClientHandler, SessionHandler};
pub use packet::{LoginRejectReason, Packet, PacketType};
pub use server::Server;
pub use session::Session;
pub use session_client::SessionClient;
pub use sessions_manager::SessionsManager;

#[cfg(test)]
mod tests {
    use tracing::Level;

    #[ctor::ctor]
    fn init_test_logging() {
        tracing_subscriber::fmt()
            .with_test_writer()
            .with_max_level(Level::DEBUG)
            .try_init()
            .ok();
    }
}
