//! A small demo server: every unsequenced payload a client sends is echoed
//! back to all clients as sequenced data.
//!
//! Run with `cargo run --example echo_server`, then connect one or more
//! `echo_client` instances.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{info, warn};

use soupbintcp::{
    Password, Payload, Server, ServerOpts, Session, SessionClient, SessionHandler, SessionId,
    SessionOpts, SessionsManager, Username,
};

struct EchoHandler {
    session: std::sync::Mutex<Option<Arc<Session>>>,
}

#[async_trait]
impl SessionHandler for EchoHandler {
    async fn on_packet(&self, client: &Arc<SessionClient>, packet: soupbintcp::Packet) {
        info!("echoing {} bytes from {}", packet.payload().len(), client.remote_addr());
        let session = self.session.lock().unwrap().clone();
        let Some(session) = session else { return };
        let Ok(payload) = Payload::new(packet.payload().to_vec()) else {
            return;
        };
        if let Err(e) = session.send_sequenced(payload).await {
            warn!("echo failed: {}", e);
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt().init();

    let handler = Arc::new(EchoHandler {
        session: std::sync::Mutex::new(None),
    });
    let session = Session::new(
        Some(handler.clone()),
        None,
        SessionOpts {
            id: SessionId::from_string("echo")?,
            ..Default::default()
        },
    );
    *handler.session.lock().unwrap() = Some(session.clone());

    let manager = SessionsManager::new();
    manager.try_add_current(session)?;

    let server = Server::new(
        Some(manager),
        ServerOpts {
            username: Username::from_string("utest")?,
            password: Password::from_string("ptest")?,
        },
    );
    info!("echo server listening on 127.0.0.1:9200");
    server.run("127.0.0.1:9200").await
}
