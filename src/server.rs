//! The TCP accept loop and the server side of the login handshake.

use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream, ToSocketAddrs};
use tokio::sync::watch;
use tracing::{debug, warn};

use crate::config::ServerOpts;
use crate::error::{ErrorSlot, SoupError};
use crate::packet::{try_read_packet_from_as, LoginRejectReason, Packet, PacketType};
use crate::sessions_manager::SessionsManager;

pub struct Server {
    opts: ServerOpts,
    sessions: Arc<SessionsManager>,
    close_err: ErrorSlot,
    addrs: Mutex<Vec<SocketAddr>>,
    shutdown_tx: watch::Sender<bool>,
}

impl Server {
    /// Without an explicit manager a fresh one is created; it is started when
    /// the first accept loop runs.
    pub fn new(sessions: Option<Arc<SessionsManager>>, opts: ServerOpts) -> Arc<Server> {
        Arc::new(Server {
            opts,
            sessions: sessions.unwrap_or_else(SessionsManager::new),
            close_err: ErrorSlot::new(),
            addrs: Mutex::new(Vec::new()),
            shutdown_tx: watch::channel(false).0,
        })
    }

    pub fn sessions_manager(&self) -> &Arc<SessionsManager> {
        &self.sessions
    }

    /// The local addresses of all listeners this server has accepted on.
    pub fn addrs(&self) -> Vec<SocketAddr> {
        self.addrs.lock().unwrap().clone()
    }

    /// Binds to `addr` and accepts until shutdown. Several accept loops on
    /// different addresses may run concurrently for the same server.
    pub async fn run(self: Arc<Self>, addr: impl ToSocketAddrs) -> anyhow::Result<()> {
        let listener = TcpListener::bind(addr).await?;
        self.run_with_listener(listener).await
    }

    /// Accepts connections on an already bound listener until shutdown. Each
    /// accepted connection gets its own login-handshake task.
    pub async fn run_with_listener(self: Arc<Self>, listener: TcpListener) -> anyhow::Result<()> {
        if let Some(err) = self.close_err.get() {
            return Err(err.into());
        }
        self.addrs.lock().unwrap().push(listener.local_addr()?);
        self.sessions.start();

        let mut shutdown_rx = self.shutdown_tx.subscribe();
        loop {
            if *shutdown_rx.borrow() {
                return Err(self.close_err.get().unwrap_or(SoupError::Shutdown).into());
            }
            tokio::select! {
                _ = shutdown_rx.changed() => {
                    return Err(self.close_err.get().unwrap_or(SoupError::Shutdown).into());
                }
                accepted = listener.accept() => {
                    let (conn, peer_addr) = accepted?;
                    debug!("accepted connection from {}", peer_addr);
                    let server = self.clone();
                    tokio::spawn(async move {
                        if let Err(e) = server.handle_connection(conn).await {
                            debug!("connection from {} dropped during login: {}", peer_addr, e);
                        }
                    });
                }
            }
        }
    }

    /// Runs the login handshake on one fresh connection and hands it to its
    /// session. Framing errors drop the connection silently; bad credentials
    /// and unknown sessions are answered with a login reject.
    async fn handle_connection(&self, mut conn: TcpStream) -> Result<(), SoupError> {
        let login = try_read_packet_from_as(&mut conn, PacketType::LoginRequest).await?;

        let Some((username, password)) = login.credentials() else {
            return Err(SoupError::InvalidPacket {
                packet_type: PacketType::LoginRequest,
                reason: "missing credentials",
            });
        };
        if !username.eq_ignore_ascii_case(&self.opts.username)
            || !password.eq_ignore_ascii_case(&self.opts.password)
        {
            warn!("rejecting login of {:?}: not authorized", username);
            let reject = Packet::login_reject(LoginRejectReason::NotAuthorized);
            let _ = conn.write_all(reject.bytes()).await;
            return Ok(());
        }

        let session = login
            .session_id()
            .and_then(|id| self.sessions.get_session(id));
        let Some(session) = session else {
            warn!("rejecting login of {:?}: session not available", username);
            let reject = Packet::login_reject(LoginRejectReason::SessionNotAvail);
            let _ = conn.write_all(reject.bytes()).await;
            return Ok(());
        };

        session.handle(conn, login).await;
        Ok(())
    }

    /// Stops all accept loops. With `end_sessions`, additionally shuts the
    /// sessions manager down. Idempotent; returns false if already shut down.
    pub fn shutdown(&self, end_sessions: bool) -> bool {
        if self.close_err.is_set() {
            return false;
        }
        self.close_err.fire(SoupError::Shutdown);
        self.shutdown_tx.send_replace(true);
        if end_sessions {
            self.sessions.shutdown();
        }
        true
    }

    pub fn close_err(&self) -> Option<SoupError> {
        self.close_err.get()
    }

    pub fn is_closed(&self) -> bool {
        self.close_err.is_set()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SessionOpts;
    use crate::fields::{Password, SequenceNumber, SessionId, Username};
    use crate::packet::read_packet_from;
    use crate::session::Session;

    fn test_opts() -> ServerOpts {
        ServerOpts {
            username: Username::from_string("utest").unwrap(),
            password: Password::from_string("ptest").unwrap(),
        }
    }

    async fn started_server() -> (Arc<Server>, SocketAddr) {
        let manager = SessionsManager::new();
        let session = Session::new(
            None,
            None,
            SessionOpts {
                id: SessionId::from_string_trunc("1"),
                ..Default::default()
            },
        );
        manager.try_add_current(session).unwrap();

        let server = Server::new(Some(manager), test_opts());
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(server.clone().run_with_listener(listener));
        tokio::task::yield_now().await;
        (server, addr)
    }

    #[tokio::test]
    async fn test_wrong_credentials_rejected() {
        let (_server, addr) = started_server().await;

        let mut conn = TcpStream::connect(addr).await.unwrap();
        let login = Packet::login_request(
            Username::from_string("utest").unwrap(),
            Password::from_string("bad").unwrap(),
            SessionId::BLANK,
            SequenceNumber::ZERO,
        );
        conn.write_all(login.bytes()).await.unwrap();

        let reply = read_packet_from(&mut conn).await.unwrap();
        assert_eq!(reply.packet_type(), PacketType::LoginReject);
        assert_eq!(reply.reject_reason(), Some(LoginRejectReason::NotAuthorized));
    }

    #[tokio::test]
    async fn test_unknown_session_rejected() {
        let (_server, addr) = started_server().await;

        let mut conn = TcpStream::connect(addr).await.unwrap();
        let login = Packet::login_request(
            Username::from_string("utest").unwrap(),
            Password::from_string("ptest").unwrap(),
            SessionId::from_string("9").unwrap(),
            SequenceNumber::ZERO,
        );
        conn.write_all(login.bytes()).await.unwrap();

        let reply = read_packet_from(&mut conn).await.unwrap();
        assert_eq!(reply.packet_type(), PacketType::LoginReject);
        assert_eq!(reply.reject_reason(), Some(LoginRejectReason::SessionNotAvail));
    }

    #[tokio::test]
    async fn test_credentials_are_case_insensitive() {
        let (_server, addr) = started_server().await;

        let mut conn = TcpStream::connect(addr).await.unwrap();
        let login = Packet::login_request(
            Username::from_string("UTEST").unwrap(),
            Password::from_string("PTEST").unwrap(),
            SessionId::BLANK,
            SequenceNumber::ZERO,
        );
        conn.write_all(login.bytes()).await.unwrap();

        let reply = read_packet_from(&mut conn).await.unwrap();
        assert_eq!(reply.packet_type(), PacketType::LoginAccepted);
    }

    #[tokio::test]
    async fn test_non_login_first_packet_drops_silently() {
        let (_server, addr) = started_server().await;

        let mut conn = TcpStream::connect(addr).await.unwrap();
        conn.write_all(Packet::client_heartbeat().bytes()).await.unwrap();

        // the server closes the connection without replying
        assert!(matches!(
            read_packet_from(&mut conn).await,
            Err(SoupError::UnexpectedEof)
        ));
    }

    #[tokio::test]
    async fn test_shutdown_stops_accepting() {
        let (server, addr) = started_server().await;
        assert_eq!(server.addrs().len(), 1);

        assert!(server.shutdown(true));
        assert!(!server.shutdown(true));
        assert!(matches!(server.close_err(), Some(SoupError::Shutdown)));
        assert!(server.sessions_manager().is_closed());

        // the accept loop is gone; new connections fail or are never served
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        if let Ok(mut conn) = TcpStream::connect(addr).await {
            let login = Packet::login_request(
                Username::from_string("utest").unwrap(),
                Password::from_string("ptest").unwrap(),
                SessionId::BLANK,
                SequenceNumber::ZERO,
            );
            let _ = conn.write_all(login.bytes()).await;
            assert!(read_packet_from(&mut conn).await.is_err());
        }
    }
}
