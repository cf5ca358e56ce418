//! A named, long-lived stream of sequenced messages.
//!
//! All outbound traffic of a session funnels through one input channel that a
//! single broadcast worker drains. The worker is the only place sequence
//! numbers are assigned, which is what makes them contiguous: assign, persist
//! to the store, then fan out to every enrolled client.

use std::mem;
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Mutex, RwLock, Weak};
use std::time::Duration;

use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tracing::{debug, error, trace, warn};

use crate::config::SessionOpts;
use crate::data_store::{DataStore, VecDataStore};
use crate::error::{ErrorSlot, SoupError};
use crate::fields::{Payload, SequenceNumber, SessionId};
use crate::handler::SessionHandler;
use crate::packet::{Packet, PacketType};
use crate::safe_converter::SafeCast;
use crate::session_client::{unix_now, SequencedPacket, SessionClient};
use crate::sessions_manager::SessionsManager;

const NOT_STARTED: u8 = 0;
const RUNNING: u8 = 1;
const STOPPED: u8 = 2;

pub struct Session {
    /// cleared by the manager before it ends this session during shutdown, so
    /// `do_end` does not re-enter the manager
    manager: Mutex<Option<Weak<SessionsManager>>>,

    id: SessionId,
    /// the last assigned sequence number; 0 means none assigned yet
    seq_num: AtomicU64,
    handler: Option<Arc<dyn SessionHandler>>,
    client_timeout: Duration,
    packet_chan_len: usize,
    new_client_handler: Option<Arc<dyn SessionHandler>>,
    debug_handler: Option<Arc<dyn SessionHandler>>,

    packet_tx: RwLock<Option<mpsc::Sender<Packet>>>,
    packet_rx: Mutex<Option<mpsc::Receiver<Packet>>>,
    clients: Mutex<Vec<Arc<SessionClient>>>,
    store: Arc<dyn DataStore>,

    running: AtomicU8,

    close_err: ErrorSlot,
}

impl Session {
    /// `handler` receives unsequenced data from clients; `None` drops it.
    /// Without an explicit store, an in-memory [`VecDataStore`] starting right
    /// after the configured sequence number is used.
    pub fn new(
        handler: Option<Arc<dyn SessionHandler>>,
        store: Option<Arc<dyn DataStore>>,
        opts: SessionOpts,
    ) -> Arc<Session> {
        let packet_chan_len = if opts.packet_chan_len == 0 {
            crate::config::DEFAULT_PACKET_CHAN_LEN
        } else {
            opts.packet_chan_len
        };
        let client_timeout = if opts.client_timeout.is_zero() {
            crate::config::DEFAULT_CLIENT_TIMEOUT
        } else {
            opts.client_timeout
        };
        let store =
            store.unwrap_or_else(|| Arc::new(VecDataStore::new(opts.sequence_number + 1)));

        let (packet_tx, packet_rx) = mpsc::channel(packet_chan_len);

        Arc::new(Session {
            manager: Mutex::new(None),
            id: opts.id,
            seq_num: AtomicU64::new(opts.sequence_number),
            handler,
            client_timeout,
            packet_chan_len,
            new_client_handler: opts.new_client_handler,
            debug_handler: opts.debug_handler,
            packet_tx: RwLock::new(Some(packet_tx)),
            packet_rx: Mutex::new(Some(packet_rx)),
            clients: Mutex::new(Vec::new()),
            store,
            running: AtomicU8::new(NOT_STARTED),
            close_err: ErrorSlot::new(),
        })
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    /// The sequence number of the last sequenced packet.
    pub fn last_seq_num(&self) -> u64 {
        self.seq_num.load(Ordering::SeqCst)
    }

    /// The sequence number the next sequenced packet will get.
    pub fn next_seq_num(&self) -> u64 {
        self.last_seq_num() + 1
    }

    pub fn last_sequence_number(&self) -> SequenceNumber {
        SequenceNumber::from_u64(self.last_seq_num())
    }

    pub fn next_sequence_number(&self) -> SequenceNumber {
        SequenceNumber::from_u64(self.next_seq_num())
    }

    /// Queues a payload for sequenced broadcast. The sequence number is
    /// assigned by the broadcast worker, not here.
    pub async fn send_sequenced(&self, payload: Payload) -> Result<(), SoupError> {
        if let Some(err) = self.close_err.get() {
            return Err(err);
        }
        let tx = self.packet_tx.read().unwrap().clone();
        let Some(tx) = tx else {
            return Err(self.close_err.get().unwrap_or(SoupError::Closed));
        };
        tx.send(Packet::sequenced_data(payload))
            .await
            .map_err(|_| self.close_err.get().unwrap_or(SoupError::Closed))
    }

    /// Queues a server heartbeat. A full input channel drops the heartbeat
    /// rather than stalling the ticker - data packets already queued serve as
    /// a liveness signal just as well.
    pub(crate) fn send_heartbeat(&self) -> Result<(), SoupError> {
        if let Some(err) = self.close_err.get() {
            return Err(err);
        }
        let guard = self.packet_tx.read().unwrap();
        let Some(tx) = guard.as_ref() else {
            return Err(self.close_err.get().unwrap_or(SoupError::Closed));
        };
        if tx.try_send(Packet::server_heartbeat()).is_err() {
            trace!("session {} input channel full, skipping heartbeat", self.id);
        }
        Ok(())
    }

    /// Ends the session: every enrolled client receives EndOfSession and is
    /// closed with [`SoupError::SessionEnded`]. Idempotent; a second call
    /// returns the stored terminal error.
    pub fn end(&self) -> Result<(), SoupError> {
        if let Some(err) = self.close_err.get() {
            return Err(err);
        }
        self.close_err.fire(SoupError::SessionEnded);
        self.do_end();
        Ok(())
    }

    pub(crate) fn do_end(&self) {
        self.running.store(STOPPED, Ordering::SeqCst);

        let manager = self.manager.lock().unwrap().take();
        if let Some(manager) = manager.as_ref().and_then(Weak::upgrade) {
            manager.remove_session(self.id, None);
        }

        // closing the input channel lets the broadcast worker drain and exit
        self.packet_tx.write().unwrap().take();

        let clients = mem::take(&mut *self.clients.lock().unwrap());
        for client in &clients {
            let _ = client.send_packet(SequencedPacket {
                seq_num: 0,
                packet: Packet::end_of_session(),
            });
            client.close_with_err(SoupError::SessionEnded);
            client.detach();
        }
    }

    /// The broadcast worker. Started by the owning manager; runs until the
    /// input channel closes or the store fails.
    pub(crate) async fn run(self: Arc<Self>) {
        if self
            .running
            .compare_exchange(NOT_STARTED, RUNNING, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return;
        }
        let packet_rx = self.packet_rx.lock().unwrap().take();
        let Some(mut packet_rx) = packet_rx else {
            return;
        };

        let timeout_secs: i64 = self.client_timeout.as_secs().safe_cast();

        while let Some(packet) = packet_rx.recv().await {
            let is_heartbeat = packet.packet_type() == PacketType::ServerHeartbeat;
            let mut seq_num = 0u64;

            if packet.packet_type() == PacketType::SequencedData {
                seq_num = self.seq_num.fetch_add(1, Ordering::SeqCst) + 1;
                let stored = self
                    .store
                    .set(SequenceNumber::from_u64(seq_num), packet.payload_bytes())
                    .await;
                if let Err(err) = stored {
                    error!("session {}: storing payload #{} failed: {}", self.id, seq_num, err);
                    self.close_err.fire(err);
                    self.do_end();
                    break;
                }
            }

            let now = unix_now();
            let mut clients = self.clients.lock().unwrap();
            clients.retain(|client| {
                if is_heartbeat && now - client.last_heartbeat_unix() > timeout_secs {
                    client.close_with_err(SoupError::ClientTimedOut);
                }
                match client.send_packet(SequencedPacket {
                    seq_num,
                    packet: packet.clone(),
                }) {
                    Ok(()) => true,
                    Err(err) => {
                        debug!("session {}: dropping client {}: {}", self.id, client.remote_addr(), err);
                        client.detach();
                        false
                    }
                }
            });
        }

        // input channel closed: close whatever clients remained
        let leftover = mem::take(&mut *self.clients.lock().unwrap());
        for client in leftover {
            client.detach();
        }
    }

    /// Completes the login of an authenticated connection: accept, enroll,
    /// replay, then hand the login packet to the new-client handler.
    pub(crate) async fn handle(self: &Arc<Self>, mut conn: TcpStream, login_packet: Packet) {
        let Some(seq_field) = login_packet.sequence_number() else {
            return;
        };
        let Some(num) = seq_field.to_u64_checked() else {
            debug!("session {}: login with unparsable sequence number, dropping", self.id);
            return;
        };

        let mut next_num = self.next_seq_num();
        if num != 0 && num < next_num {
            next_num = num;
        }
        //TODO a requested number beyond next_seq_num is silently clamped to it - reject instead?

        let accepted = Packet::login_accepted(self.id, SequenceNumber::from_u64(next_num));
        if let Err(e) = conn.write_all(accepted.bytes()).await {
            debug!("session {}: writing login accept failed: {}", self.id, e);
            return;
        }
        let (Ok(local_addr), Ok(peer_addr)) = (conn.local_addr(), conn.peer_addr()) else {
            return;
        };

        let (read_half, write_half) = conn.into_split();
        let (client, packet_rx) =
            SessionClient::new(self, next_num, local_addr, peer_addr, self.packet_chan_len);
        client.start(read_half, write_half, packet_rx);
        self.enroll(client.clone());
        debug!("session {}: client {} joined at #{}", self.id, peer_addr, next_num);

        // replay everything from the client's start up to the current head;
        // the client's writer reorders against concurrent broadcasts
        let mut n = next_num;
        while n < self.next_seq_num() {
            let lookup = self.store.get(SequenceNumber::from_u64(n)).await;
            let payload = match lookup.and_then(Payload::new) {
                Ok(payload) => payload,
                Err(err) => {
                    warn!("session {}: replay lookup for #{} failed: {}", self.id, n, err);
                    client.close_with_err(err);
                    client.detach();
                    return;
                }
            };
            let _ = client.send_packet(SequencedPacket {
                seq_num: n,
                packet: Packet::sequenced_data(payload),
            });
            n += 1;
        }

        if let Some(handler) = &self.new_client_handler {
            handler.on_packet(&client, login_packet).await;
        }
    }

    pub(crate) fn enroll(&self, client: Arc<SessionClient>) {
        self.clients.lock().unwrap().push(client);
    }

    pub(crate) fn remove_client(&self, target: &SessionClient) {
        self.clients
            .lock()
            .unwrap()
            .retain(|c| !std::ptr::eq(c.as_ref(), target));
    }

    pub(crate) fn client_count(&self) -> usize {
        self.clients.lock().unwrap().len()
    }

    pub(crate) fn handler(&self) -> Option<Arc<dyn SessionHandler>> {
        self.handler.clone()
    }

    pub(crate) fn debug_handler(&self) -> Option<Arc<dyn SessionHandler>> {
        self.debug_handler.clone()
    }

    /// Adopts this session into `manager`. Fails with
    /// [`SoupError::SessionOwned`] if some manager already owns it.
    pub(crate) fn try_adopt(&self, manager: &Arc<SessionsManager>) -> Result<(), SoupError> {
        let mut guard = self.manager.lock().unwrap();
        if guard.is_some() {
            return Err(SoupError::SessionOwned);
        }
        *guard = Some(Arc::downgrade(manager));
        Ok(())
    }

    pub(crate) fn clear_manager(&self) {
        self.manager.lock().unwrap().take();
    }

    pub(crate) fn close_with_err(&self, err: SoupError) -> SoupError {
        self.close_err.fire(err)
    }

    pub fn close_err(&self) -> Option<SoupError> {
        self.close_err.get()
    }

    pub fn is_closed(&self) -> bool {
        self.close_err.is_set()
    }

    pub fn running(&self) -> bool {
        self.running.load(Ordering::SeqCst) == RUNNING
    }
}
