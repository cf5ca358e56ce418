//! The connector: the client side of a session.
//!
//! After the login handshake a client runs in one of two modes. With a
//! handler, a reader task dispatches every received packet (automatic mode);
//! sequenced packets are dispatched from that single task, so handler
//! invocations observe them in sequence-number order. Without a handler the
//! caller pumps [`Client::read_packet`] explicitly (manual mode).

use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use tokio::io::AsyncWriteExt;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpStream, ToSocketAddrs};
use tokio::sync::watch;
use tokio::time::{sleep_until, Instant};
use tracing::debug;

use crate::config::{ConnectOpts, CLIENT_HEARTBEAT_INTERVAL, DEFAULT_SERVER_TIMEOUT};
use crate::error::{ErrorSlot, SoupError};
use crate::fields::{Password, Payload, SequenceNumber, SessionId, Username};
use crate::handler::ClientHandler;
use crate::packet::{read_packet_from, Packet, PacketType};

struct ClientInner {
    local_addr: SocketAddr,
    peer_addr: SocketAddr,

    read_half: tokio::sync::Mutex<Option<OwnedReadHalf>>,
    write_half: tokio::sync::Mutex<Option<OwnedWriteHalf>>,

    handler: Option<Arc<dyn ClientHandler>>,
    debug_handler: Option<Arc<dyn ClientHandler>>,

    server_timeout: std::time::Duration,
    session_id: SessionId,

    /// the sequence number of the next sequenced packet this client expects
    next_seq_num: AtomicU64,

    last_recv: Mutex<Instant>,
    last_send: Mutex<Instant>,

    close_err: ErrorSlot,
    closed_tx: watch::Sender<bool>,
}

/// A logged-in connection to a server. Cheap to clone; all clones share the
/// same connection.
#[derive(Clone)]
pub struct Client {
    inner: Arc<ClientInner>,
}

impl std::fmt::Debug for Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client")
            .field("local_addr", &self.inner.local_addr)
            .field("peer_addr", &self.inner.peer_addr)
            .finish_non_exhaustive()
    }
}

impl Client {
    /// Connects and logs in to the server's current session with default
    /// options. A `None` handler selects manual mode.
    pub async fn connect(
        addr: impl ToSocketAddrs,
        username: Username,
        password: Password,
        handler: Option<Arc<dyn ClientHandler>>,
    ) -> Result<Client, SoupError> {
        Client::connect_with_opts(
            addr,
            handler,
            ConnectOpts {
                username,
                password,
                ..Default::default()
            },
        )
        .await
    }

    pub async fn connect_with_opts(
        addr: impl ToSocketAddrs,
        handler: Option<Arc<dyn ClientHandler>>,
        mut opts: ConnectOpts,
    ) -> Result<Client, SoupError> {
        if opts.server_timeout.is_zero() {
            opts.server_timeout = DEFAULT_SERVER_TIMEOUT;
        }
        if !opts.sequence_number.is_valid() {
            opts.sequence_number = SequenceNumber::ZERO;
        }

        let login = handshake(addr, &opts);
        let (conn, session_id, next_seq_num) = match opts.handshake_deadline {
            Some(limit) => match tokio::time::timeout(limit, login).await {
                Ok(res) => res?,
                Err(_) => {
                    return Err(SoupError::Io(Arc::new(io::Error::new(
                        io::ErrorKind::TimedOut,
                        "login handshake deadline exceeded",
                    ))))
                }
            },
            None => login.await?,
        };

        let local_addr = conn.local_addr()?;
        let peer_addr = conn.peer_addr()?;
        let (read_half, write_half) = conn.into_split();

        // in automatic mode the reader task owns the read half
        let (stored_read, reader_read) = if handler.is_some() {
            (None, Some(read_half))
        } else {
            (Some(read_half), None)
        };

        let now = Instant::now();
        let client = Client {
            inner: Arc::new(ClientInner {
                local_addr,
                peer_addr,
                read_half: tokio::sync::Mutex::new(stored_read),
                write_half: tokio::sync::Mutex::new(Some(write_half)),
                handler,
                debug_handler: opts.debug_handler.clone(),
                server_timeout: opts.server_timeout,
                session_id,
                next_seq_num: AtomicU64::new(next_seq_num),
                last_recv: Mutex::new(now),
                last_send: Mutex::new(now),
                close_err: ErrorSlot::new(),
                closed_tx: watch::channel(false).0,
            }),
        };

        tokio::spawn(client.clone().run_heartbeats());
        tokio::spawn(client.clone().run_server_watchdog());
        if let Some(read) = reader_read {
            tokio::spawn(client.clone().run_reader(read));
        }
        Ok(client)
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.inner.local_addr
    }

    pub fn remote_addr(&self) -> SocketAddr {
        self.inner.peer_addr
    }

    /// The session id the server reported on login.
    pub fn session_id(&self) -> SessionId {
        self.inner.session_id
    }

    pub fn handler(&self) -> Option<Arc<dyn ClientHandler>> {
        self.inner.handler.clone()
    }

    /// The sequence number of the next sequenced packet this client expects.
    pub fn next_seq_num(&self) -> u64 {
        self.inner.next_seq_num.load(Ordering::SeqCst)
    }

    pub fn next_sequence_number(&self) -> SequenceNumber {
        SequenceNumber::from_u64(self.next_seq_num())
    }

    /// Advances the expected sequence number. Only meaningful in manual mode;
    /// automatic mode advances it internally and ignores this call.
    pub fn incr_sequence_number(&self) {
        if self.inner.handler.is_some() {
            return;
        }
        self.inner.next_seq_num.fetch_add(1, Ordering::SeqCst);
    }

    pub async fn send_unsequenced(&self, payload: Payload) -> Result<(), SoupError> {
        self.send_packet(&Packet::unsequenced_data(payload)).await
    }

    pub async fn send_debug(&self, payload: Payload) -> Result<(), SoupError> {
        self.send_packet(&Packet::debug(payload)).await
    }

    /// Sends a logout request and closes the connection. A clean logout
    /// stores [`SoupError::LoggedOut`] as the terminal error and returns Ok.
    pub async fn logout(&self) -> Result<(), SoupError> {
        let send_result = self.send_packet(&Packet::logout_request()).await;
        {
            let mut guard = self.inner.write_half.lock().await;
            if let Some(mut write) = guard.take() {
                let _ = write.shutdown().await;
            }
        }
        let terminal = self.close_with_err(match send_result {
            Ok(()) => SoupError::LoggedOut,
            Err(err) => err,
        });
        match terminal {
            SoupError::LoggedOut => Ok(()),
            other => Err(other),
        }
    }

    /// Reads one packet in manual mode. An end-of-session packet closes the
    /// client with [`SoupError::SessionEnded`] but is still returned so the
    /// caller sees it.
    pub async fn read_packet(&self) -> Result<Packet, SoupError> {
        if let Some(err) = self.close_err() {
            return Err(err);
        }
        let mut guard = self.inner.read_half.lock().await;
        let Some(read) = guard.as_mut() else {
            return Err(self.close_err().unwrap_or(SoupError::Closed));
        };

        let mut closed_rx = self.inner.closed_tx.subscribe();
        if *closed_rx.borrow() {
            return Err(self.close_err().unwrap_or(SoupError::Closed));
        }
        let result = tokio::select! {
            _ = closed_rx.changed() => {
                return Err(self.close_err().unwrap_or(SoupError::Closed));
            }
            result = read_packet_from(read) => result,
        };

        match result {
            Ok(packet) => {
                self.touch_recv();
                if packet.packet_type() == PacketType::EndOfSession {
                    guard.take();
                    self.close_with_err(SoupError::SessionEnded);
                }
                Ok(packet)
            }
            Err(err) => {
                guard.take();
                Err(self.close_with_err(err))
            }
        }
    }

    /// The terminal error, if the client is closed. A clean logout reads as
    /// [`SoupError::LoggedOut`].
    pub fn close_err(&self) -> Option<SoupError> {
        self.inner.close_err.get()
    }

    pub fn is_closed(&self) -> bool {
        self.inner.close_err.is_set()
    }

    /// Waits until the client reaches its terminal state.
    pub async fn wait_closed(&self) {
        let mut closed_rx = self.inner.closed_tx.subscribe();
        if *closed_rx.borrow() {
            return;
        }
        let _ = closed_rx.changed().await;
    }

    async fn send_packet(&self, packet: &Packet) -> Result<(), SoupError> {
        if let Some(err) = self.close_err() {
            return Err(err);
        }
        let mut guard = self.inner.write_half.lock().await;
        let Some(write) = guard.as_mut() else {
            return Err(self.close_err().unwrap_or(SoupError::Closed));
        };
        match write.write_all(packet.bytes()).await {
            Ok(()) => {
                drop(guard);
                self.touch_send();
                Ok(())
            }
            Err(err) => {
                guard.take();
                Err(self.close_with_err(err.into()))
            }
        }
    }

    fn close_with_err(&self, err: SoupError) -> SoupError {
        let stored = self.inner.close_err.fire(err);
        self.inner.closed_tx.send_replace(true);
        stored
    }

    fn touch_send(&self) {
        *self.inner.last_send.lock().unwrap() = Instant::now();
    }

    fn touch_recv(&self) {
        *self.inner.last_recv.lock().unwrap() = Instant::now();
    }

    /// Automatic-mode reader: dispatches every packet from this one task.
    async fn run_reader(self, mut read: OwnedReadHalf) {
        let handler = self
            .inner
            .handler
            .clone()
            .expect("automatic mode requires a handler");
        let mut closed_rx = self.inner.closed_tx.subscribe();

        loop {
            if *closed_rx.borrow() {
                return;
            }
            let packet = tokio::select! {
                _ = closed_rx.changed() => return,
                result = read_packet_from(&mut read) => match result {
                    Ok(packet) => packet,
                    Err(err) => {
                        self.close_with_err(err);
                        return;
                    }
                },
            };
            self.touch_recv();

            match packet.packet_type() {
                PacketType::ServerHeartbeat => {}
                PacketType::Debug => {
                    if let Some(debug_handler) = &self.inner.debug_handler {
                        debug_handler.on_packet(&self, packet).await;
                    }
                }
                PacketType::SequencedData => {
                    self.inner.next_seq_num.fetch_add(1, Ordering::SeqCst);
                    handler.on_packet(&self, packet).await;
                }
                PacketType::EndOfSession => {
                    debug!("session ended by server");
                    self.close_with_err(SoupError::SessionEnded);
                    handler.on_packet(&self, packet).await;
                    return;
                }
                _ => handler.on_packet(&self, packet).await,
            }
        }
    }

    /// Sends a client heartbeat whenever nothing has been sent for a full
    /// heartbeat interval. Every successful send pushes the deadline out.
    async fn run_heartbeats(self) {
        let mut closed_rx = self.inner.closed_tx.subscribe();
        loop {
            if *closed_rx.borrow() {
                return;
            }
            let deadline = *self.inner.last_send.lock().unwrap() + CLIENT_HEARTBEAT_INTERVAL;
            tokio::select! {
                _ = closed_rx.changed() => return,
                _ = sleep_until(deadline) => {
                    let silent_for_full_interval = *self.inner.last_send.lock().unwrap()
                        + CLIENT_HEARTBEAT_INTERVAL
                        <= Instant::now();
                    if silent_for_full_interval
                        && self.send_packet(&Packet::client_heartbeat()).await.is_err()
                    {
                        return;
                    }
                }
            }
        }
    }

    /// Closes the client when the server stays silent past the timeout. Any
    /// received packet (in either mode) resets the deadline.
    async fn run_server_watchdog(self) {
        let mut closed_rx = self.inner.closed_tx.subscribe();
        loop {
            if *closed_rx.borrow() {
                return;
            }
            let deadline = *self.inner.last_recv.lock().unwrap() + self.inner.server_timeout;
            tokio::select! {
                _ = closed_rx.changed() => return,
                _ = sleep_until(deadline) => {
                    if self.inner.last_recv.lock().unwrap().elapsed() >= self.inner.server_timeout {
                        debug!("no traffic from server for {:?}", self.inner.server_timeout);
                        self.close_with_err(SoupError::ServerTimedOut);
                        return;
                    }
                }
            }
        }
    }
}

async fn handshake(
    addr: impl ToSocketAddrs,
    opts: &ConnectOpts,
) -> Result<(TcpStream, SessionId, u64), SoupError> {
    let mut conn = TcpStream::connect(addr).await?;

    let request =
        Packet::login_request(opts.username, opts.password, opts.session, opts.sequence_number);
    conn.write_all(request.bytes()).await?;

    let reply = read_packet_from(&mut conn).await?;
    match reply.packet_type() {
        PacketType::LoginAccepted => {}
        PacketType::LoginReject => {
            let reason = reply.reject_reason().ok_or(SoupError::InvalidPacket {
                packet_type: PacketType::LoginReject,
                reason: "missing reject reason",
            })?;
            return Err(SoupError::LoginRejected(reason));
        }
        other => {
            return Err(SoupError::InvalidPacket {
                packet_type: other,
                reason: "expected a login response",
            })
        }
    }

    let session_id = reply.session_id().ok_or(SoupError::InvalidPacket {
        packet_type: PacketType::LoginAccepted,
        reason: "missing session id",
    })?;
    let next_seq_num = reply
        .sequence_number()
        .and_then(|sn| sn.to_u64_checked())
        .ok_or(SoupError::InvalidPacket {
            packet_type: PacketType::LoginAccepted,
            reason: "invalid sequence number",
        })?;
    Ok((conn, session_id, next_seq_num))
}
