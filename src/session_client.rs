//! One logged-in TCP connection participating in a session.
//!
//! Each client runs two tasks: a reader draining the socket and a writer
//! draining the bounded outbound queue. The writer is what enforces in-order
//! delivery of sequenced packets: entries arriving ahead of the client's
//! position are parked, entries behind it are dropped.

use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex, RwLock, Weak};
use std::time::{SystemTime, UNIX_EPOCH};

use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::Notify;
use tracing::{debug, trace};

use crate::error::{ErrorSlot, SoupError};
use crate::fields::Payload;
use crate::packet::{read_packet_from, Packet, PacketType};
use crate::session::Session;

/// A packet queued for one client, tagged with its sequence number.
/// `seq_num == 0` means "not sequenced" and passes through immediately.
pub(crate) struct SequencedPacket {
    pub seq_num: u64,
    pub packet: Packet,
}

pub(crate) fn unix_now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("system clock is before the unix epoch")
        .as_secs() as i64
}

pub struct SessionClient {
    /// cleared exactly once on removal; the winner performs the detach
    session: Mutex<Option<Weak<Session>>>,
    local_addr: SocketAddr,
    peer_addr: SocketAddr,

    packet_tx: RwLock<Option<mpsc::Sender<SequencedPacket>>>,

    start_seq_num: u64,

    /// second-precision timestamp of the last packet read from this client
    last_heartbeat: AtomicI64,

    close_notify: Notify,
    close_err: ErrorSlot,
}

impl SessionClient {
    pub(crate) fn new(
        session: &Arc<Session>,
        start_seq_num: u64,
        local_addr: SocketAddr,
        peer_addr: SocketAddr,
        queue_len: usize,
    ) -> (Arc<SessionClient>, mpsc::Receiver<SequencedPacket>) {
        let (packet_tx, packet_rx) = mpsc::channel(queue_len);
        let client = Arc::new(SessionClient {
            session: Mutex::new(Some(Arc::downgrade(session))),
            local_addr,
            peer_addr,
            packet_tx: RwLock::new(Some(packet_tx)),
            start_seq_num,
            last_heartbeat: AtomicI64::new(unix_now()),
            close_notify: Notify::new(),
            close_err: ErrorSlot::new(),
        });
        (client, packet_rx)
    }

    pub(crate) fn start(
        self: &Arc<Self>,
        read: impl AsyncRead + Unpin + Send + 'static,
        write: impl AsyncWrite + Unpin + Send + 'static,
        packet_rx: mpsc::Receiver<SequencedPacket>,
    ) {
        let writer = self.clone();
        tokio::spawn(writer.run_writer(write, packet_rx));
        let reader = self.clone();
        tokio::spawn(reader.run_reader(read));
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn remote_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    /// Sends unsequenced data to this client, best effort.
    pub fn send_unsequenced(&self, payload: Payload) -> Result<(), SoupError> {
        self.send_packet(SequencedPacket {
            seq_num: 0,
            packet: Packet::unsequenced_data(payload),
        })
    }

    /// Sends a debug packet to this client.
    pub fn send_debug(&self, payload: Payload) -> Result<(), SoupError> {
        self.send_packet(SequencedPacket {
            seq_num: 0,
            packet: Packet::debug(payload),
        })
    }

    /// Non-blocking enqueue. A full queue closes the client with
    /// [`SoupError::SlowClient`] - the caller must not retry.
    pub(crate) fn send_packet(&self, packet: SequencedPacket) -> Result<(), SoupError> {
        if let Some(err) = self.close_err.get() {
            return Err(err);
        }
        let guard = self.packet_tx.read().unwrap();
        let Some(tx) = guard.as_ref() else {
            return Err(self.close_err.get().unwrap_or(SoupError::Closed));
        };
        match tx.try_send(packet) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_)) => Err(self.close_with_err(SoupError::SlowClient)),
            Err(TrySendError::Closed(_)) => Err(self.close_err.get().unwrap_or(SoupError::Closed)),
        }
    }

    /// Closes this client, detaching it from its session. Safe to call more
    /// than once; the terminal error never changes after the first close.
    pub fn close(&self) {
        self.close_with_err(SoupError::Closed);
        self.close_and_remove();
    }

    pub fn close_err(&self) -> Option<SoupError> {
        self.close_err.get()
    }

    pub fn is_closed(&self) -> bool {
        self.close_err.is_set()
    }

    pub(crate) fn close_with_err(&self, err: SoupError) -> SoupError {
        self.close_err.fire(err)
    }

    pub(crate) fn update_heartbeat(&self) {
        self.last_heartbeat.store(unix_now(), Ordering::Relaxed);
    }

    pub(crate) fn last_heartbeat_unix(&self) -> i64 {
        self.last_heartbeat.load(Ordering::Relaxed)
    }

    #[cfg(test)]
    pub(crate) fn force_last_heartbeat(&self, unix_secs: i64) {
        self.last_heartbeat.store(unix_secs, Ordering::Relaxed);
    }

    fn current_session(&self) -> Option<Arc<Session>> {
        self.session.lock().unwrap().as_ref().and_then(Weak::upgrade)
    }

    /// Clears the session back pointer and closes the queue, without removing
    /// this client from the session's list. Used by the session itself when it
    /// already holds its clients lock.
    pub(crate) fn detach(&self) {
        self.session.lock().unwrap().take();
        self.close_queue();
    }

    fn close_and_remove(&self) {
        let session = self.session.lock().unwrap().take();
        if let Some(session) = session.as_ref().and_then(Weak::upgrade) {
            session.remove_client(self);
        }
        self.close_queue();
    }

    fn close_queue(&self) {
        self.packet_tx.write().unwrap().take();
        self.close_notify.notify_one();
    }

    async fn run_writer(
        self: Arc<Self>,
        mut write: impl AsyncWrite + Unpin + Send + 'static,
        mut packet_rx: mpsc::Receiver<SequencedPacket>,
    ) {
        let mut next_seq_num = self.start_seq_num;
        let mut parked: VecDeque<SequencedPacket> = VecDeque::new();

        'outer: while let Some(spkt) = packet_rx.recv().await {
            if spkt.seq_num != 0 {
                if spkt.seq_num > next_seq_num {
                    trace!("parking packet #{} for {} (next is #{})", spkt.seq_num, self.peer_addr, next_seq_num);
                    parked.push_back(spkt);
                    continue;
                }
                if spkt.seq_num < next_seq_num {
                    trace!("dropping already-sent packet #{} for {}", spkt.seq_num, self.peer_addr);
                    continue;
                }
            }

            if let Err(e) = write.write_all(spkt.packet.bytes()).await {
                self.close_with_err(e.into());
                break 'outer;
            }
            if spkt.seq_num != 0 {
                next_seq_num += 1;
            }

            // a successful sequenced write may release parked successors
            while let Some(head) = parked.front() {
                if head.seq_num > next_seq_num {
                    break;
                }
                let head = parked.pop_front().expect("front was just inspected");
                if head.seq_num == next_seq_num {
                    if let Err(e) = write.write_all(head.packet.bytes()).await {
                        self.close_with_err(e.into());
                        break 'outer;
                    }
                    next_seq_num += 1;
                }
            }
        }

        let _ = write.shutdown().await;
        self.close_and_remove();
    }

    async fn run_reader(self: Arc<Self>, mut read: impl AsyncRead + Unpin + Send + 'static) {
        loop {
            let packet = tokio::select! {
                _ = self.close_notify.notified() => break,
                res = read_packet_from(&mut read) => match res {
                    Ok(packet) => packet,
                    Err(e) => {
                        self.close_with_err(e);
                        break;
                    }
                },
            };
            self.update_heartbeat();

            let Some(session) = self.current_session() else {
                break;
            };
            match packet.packet_type() {
                PacketType::Debug => {
                    if let Some(handler) = session.debug_handler() {
                        handler.on_packet(&self, packet).await;
                    }
                }
                PacketType::UnsequencedData => {
                    if let Some(handler) = session.handler() {
                        handler.on_packet(&self, packet).await;
                    }
                }
                PacketType::ClientHeartbeat => {}
                PacketType::LogoutRequest => {
                    debug!("client {} logged out", self.peer_addr);
                    self.close_with_err(SoupError::ClientLoggedOut);
                    break;
                }
                other => {
                    self.close_with_err(SoupError::InvalidPacket {
                        packet_type: other,
                        reason: "unexpected packet type from client",
                    });
                    break;
                }
            }
        }
        self.close_and_remove();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SessionOpts;
    use crate::fields::SessionId;
    use tokio::io::AsyncReadExt;

    fn test_addr() -> SocketAddr {
        SocketAddr::from(([127, 0, 0, 1], 0))
    }

    fn test_session() -> Arc<Session> {
        Session::new(
            None,
            None,
            SessionOpts {
                id: SessionId::from_string_trunc("t"),
                ..Default::default()
            },
        )
    }

    fn seq_packet(seq_num: u64) -> SequencedPacket {
        SequencedPacket {
            seq_num,
            packet: Packet::sequenced_data(Payload::from_string(&format!("p{}", seq_num)).unwrap()),
        }
    }

    #[tokio::test]
    async fn test_writer_orders_sequenced_packets() {
        let session = test_session();
        let (client, packet_rx) = SessionClient::new(&session, 5, test_addr(), test_addr(), 16);

        let (write_ours, mut write_theirs) = tokio::io::duplex(4096);
        let (read_ours, _read_theirs) = tokio::io::duplex(64);
        client.start(read_ours, write_ours, packet_rx);

        // ahead of the client's position: parked
        client.send_packet(seq_packet(7)).unwrap();
        // behind: dropped
        client.send_packet(seq_packet(4)).unwrap();
        // unsequenced passes through immediately
        client
            .send_packet(SequencedPacket { seq_num: 0, packet: Packet::server_heartbeat() })
            .unwrap();
        client.send_packet(seq_packet(5)).unwrap();
        client.send_packet(seq_packet(6)).unwrap();

        let heartbeat = read_packet_from(&mut write_theirs).await.unwrap();
        assert_eq!(heartbeat.packet_type(), PacketType::ServerHeartbeat);
        for expected in ["p5", "p6", "p7"] {
            let packet = read_packet_from(&mut write_theirs).await.unwrap();
            assert_eq!(packet.payload(), expected.as_bytes());
        }
    }

    #[tokio::test]
    async fn test_full_queue_closes_with_slow_client() {
        let session = test_session();
        // the receiver is held but never drained, so the queue stays full
        let (client, _packet_rx) = SessionClient::new(&session, 1, test_addr(), test_addr(), 2);

        client.send_packet(seq_packet(1)).unwrap();
        client.send_packet(seq_packet(2)).unwrap();
        assert!(matches!(
            client.send_packet(seq_packet(3)),
            Err(SoupError::SlowClient)
        ));
        // the stored error is permanent
        assert!(matches!(
            client.send_packet(seq_packet(4)),
            Err(SoupError::SlowClient)
        ));
        assert!(matches!(client.close_err(), Some(SoupError::SlowClient)));
    }

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let session = test_session();
        let (client, _packet_rx) = SessionClient::new(&session, 1, test_addr(), test_addr(), 4);

        client.close();
        client.close();
        assert!(matches!(client.close_err(), Some(SoupError::Closed)));
        assert!(matches!(
            client.send_unsequenced(Payload::from_string("x").unwrap()),
            Err(SoupError::Closed)
        ));
    }

    #[tokio::test]
    async fn test_reader_handles_logout() {
        let session = test_session();
        let (client, packet_rx) = SessionClient::new(&session, 1, test_addr(), test_addr(), 4);

        let (write_ours, _write_theirs) = tokio::io::duplex(4096);
        let (read_ours, mut read_theirs) = tokio::io::duplex(4096);
        client.start(read_ours, write_ours, packet_rx);

        read_theirs
            .write_all(Packet::logout_request().bytes())
            .await
            .unwrap();

        // the reader closes the client and drops its half of the stream
        let mut buf = Vec::new();
        let _ = read_theirs.read_to_end(&mut buf).await;
        assert!(matches!(client.close_err(), Some(SoupError::ClientLoggedOut)));
    }

    #[tokio::test]
    async fn test_reader_rejects_unexpected_packet_type() {
        let session = test_session();
        let (client, packet_rx) = SessionClient::new(&session, 1, test_addr(), test_addr(), 4);

        let (write_ours, _write_theirs) = tokio::io::duplex(4096);
        let (read_ours, mut read_theirs) = tokio::io::duplex(4096);
        client.start(read_ours, write_ours, packet_rx);

        // a client must never send server-to-client packet types
        read_theirs
            .write_all(Packet::server_heartbeat().bytes())
            .await
            .unwrap();

        let mut buf = Vec::new();
        let _ = read_theirs.read_to_end(&mut buf).await;
        assert!(matches!(
            client.close_err(),
            Some(SoupError::InvalidPacket { .. })
        ));
    }
}
