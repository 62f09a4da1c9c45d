//! Local chat example: three engines talking over loopback.
//!
//! This example shows how to:
//! - Create identities and exchange public keys
//! - Listen for inbound messages with a callback
//! - Send a message and a reply
//! - Broadcast to every known peer
//!
//! Run with `RUST_LOG=debug cargo run --example local_chat` for the full trace.

use anyhow::Result;
use enclave::{crypto::MemoryStorage, Engine, InboundMessage, MessengerConfig};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

fn demo_config() -> MessengerConfig {
    let mut config = MessengerConfig::default();
    // Smaller keys keep start-up quick; use the 4096-bit default for real identities.
    config.crypto.key_bits = 2048;
    config.crypto.kdf_iterations = 10_000;
    config
}

async fn start(name: &str) -> Result<(Engine, u16, mpsc::UnboundedReceiver<InboundMessage>)> {
    let engine = Engine::create(demo_config(), Arc::new(MemoryStorage::new()), "demo-password").await?;

    let (tx, rx) = mpsc::unbounded_channel();
    let label = name.to_string();
    engine
        .register_inbound_callback(move |message| {
            println!("   📨 {} <- {}: {}", label, message.sender_name, message.text());
            let _ = tx.send(message);
        })
        .await;

    let port = engine.listen_on("127.0.0.1:0").await?.port();
    println!("   {} listening on 127.0.0.1:{} ({})", name, port, engine.my_fingerprint().short());
    Ok((engine, port, rx))
}

async fn introduce(engine: &Engine, name: &str, other: &Engine, port: u16) -> Result<()> {
    let pem = other.public_key_pem()?;
    engine.add_peer(name, "127.0.0.1", port, pem.as_bytes()).await?;
    Ok(())
}

async fn next(inbox: &mut mpsc::UnboundedReceiver<InboundMessage>) -> Result<InboundMessage> {
    tokio::time::timeout(Duration::from_secs(10), inbox.recv())
        .await?
        .ok_or_else(|| anyhow::anyhow!("inbox closed"))
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn")).init();

    println!("🔐 Enclave - Local Chat Example");
    println!("===============================");

    println!("\n👤 Creating identities...");
    let (alice, alice_port, mut alice_inbox) = start("alice").await?;
    let (bob, bob_port, mut bob_inbox) = start("bob").await?;
    let (carol, carol_port, mut carol_inbox) = start("carol").await?;

    println!("\n🔑 Exchanging public keys...");
    introduce(&alice, "bob", &bob, bob_port).await?;
    introduce(&alice, "carol", &carol, carol_port).await?;
    introduce(&bob, "alice", &alice, alice_port).await?;
    introduce(&carol, "alice", &alice, alice_port).await?;

    println!("\n✉️  Alice -> Bob");
    let receipt = alice.send(&bob.my_fingerprint().short(), b"Hi Bob, it's Alice").await?;
    println!("   sent {} to {}", receipt.message_id, receipt.recipient_name);
    let hello = next(&mut bob_inbox).await?;

    println!("\n↩️  Bob -> Alice");
    bob.send(&hello.sender.to_hex(), b"Hi Alice, got it").await?;
    next(&mut alice_inbox).await?;

    println!("\n📣 Alice broadcasts");
    let results = alice.broadcast(b"Lunch at noon?").await?;
    for (fingerprint, result) in &results {
        match result {
            Ok(()) => println!("   ✓ {}", fingerprint.short()),
            Err(e) => println!("   ✗ {}: {}", fingerprint.short(), e),
        }
    }
    next(&mut bob_inbox).await?;
    next(&mut carol_inbox).await?;

    println!("\n📊 Stats");
    for (name, engine) in [("alice", &alice), ("bob", &bob), ("carol", &carol)] {
        let stats = engine.stats().await;
        println!(
            "   {:<6} delivered {}  rejected {}  peers {}",
            name, stats.delivered, stats.rejected, stats.cached_peers
        );
    }

    println!("\n🛑 Shutting down...");
    for engine in [&alice, &bob, &carol] {
        engine.shutdown().await;
    }
    println!("✅ Done");
    Ok(())
}
