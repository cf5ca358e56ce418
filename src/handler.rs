//! The seams through which applications receive packets.

use std::sync::Arc;

use async_trait::async_trait;

use crate::client::Client;
use crate::packet::Packet;
use crate::session_client::SessionClient;

/// Server-side packet handler.
///
/// A session uses one instance as its main handler (invoked for unsequenced
/// data), optionally another as its debug handler, and optionally a third as
/// its new-client handler (invoked once per successful login, with the login
/// request packet).
#[async_trait]
pub trait SessionHandler: Send + Sync + 'static {
    async fn on_packet(&self, client: &Arc<SessionClient>, packet: Packet);
}

/// Client-side packet handler, invoked by the connector's automatic mode for
/// every received packet that is not consumed internally. Invocations for
/// sequenced data observe strictly increasing, contiguous sequence numbers.
#[async_trait]
pub trait ClientHandler: Send + Sync + 'static {
    async fn on_packet(&self, client: &Client, packet: Packet);
}
