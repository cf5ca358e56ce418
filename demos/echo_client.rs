//! A small demo client for the echo server: sends a few unsequenced messages
//! and prints every sequenced packet it gets back.
//!
//! Run with `cargo run --example echo_client` against a running `echo_server`.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::info;

use soupbintcp::{Client, ClientHandler, Packet, PacketType, Password, Payload, Username};

struct PrintHandler;

#[async_trait]
impl ClientHandler for PrintHandler {
    async fn on_packet(&self, client: &Client, packet: Packet) {
        match packet.packet_type() {
            PacketType::SequencedData => {
                info!("#{}: {}", client.next_seq_num() - 1, packet.payload_text());
            }
            other => info!("received {:?}", other),
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt().init();

    let client = Client::connect(
        "127.0.0.1:9200",
        Username::from_string("utest")?,
        Password::from_string("ptest")?,
        Some(Arc::new(PrintHandler)),
    )
    .await?;
    info!("logged in to session {:?}", client.session_id());

    for msg in ["hello", "from", "the echo client"] {
        client.send_unsequenced(Payload::from_string(msg)?).await?;
        tokio::time::sleep(Duration::from_millis(200)).await;
    }

    tokio::time::sleep(Duration::from_secs(1)).await;
    client.logout().await?;
    Ok(())
}
