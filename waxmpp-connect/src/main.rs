//! Login + echo demo.
//!
//! # What this does
//!
//! 1. TLS connect to the messaging endpoint
//! 2. Challenge/response login (one round trip when a challenge file exists)
//! 3. Announce presence, then print every event the server pushes
//! 4. Echo incoming text messages back to their sender
//!
//! # Run
//! ```
//! WAXMPP_MSISDN=491234567890 WAXMPP_PASSWORD=base64pw cargo run -p waxmpp-connect
//! ```

use std::sync::Arc;

use waxmpp_client::{Client, Config, Event, FileKeyStore, MessageKind};

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let msisdn = std::env::var("WAXMPP_MSISDN")?;
    let password = std::env::var("WAXMPP_PASSWORD")?;

    let config = Config {
        msisdn,
        password,
        username: Some("waxmpp".into()),
        key_store: Arc::new(FileKeyStore::open("waxmpp.keys")?),
        ..Config::default()
    };

    println!("Connecting to {}:{} …", config.host, config.port);
    let (client, mut events) = Client::connect(config).await?;
    println!("✓ TLS connected, logging in …");

    while let Some(event) = events.next().await {
        match event {
            Event::LoggedIn => println!("✓ Logged in"),
            Event::LoginFailed { reason } => {
                println!("✗ Login failed: {reason}");
                break;
            }
            Event::Message(msg) => {
                println!("[{}] {:?}", msg.from, msg.kind);
                if let MessageKind::Text { body } = &msg.kind {
                    client.send_message(&msg.from, &format!("echo: {body}"))?;
                }
            }
            Event::MessageDelivered { from, id } => println!("  ✓ delivered to {from} ({id})"),
            Event::Typing { from, state, .. } => println!("  {from} is {state:?}"),
            Event::Presence {
                from, available, ..
            } => println!("  {from} {}", if available { "online" } else { "offline" }),
            Event::Disconnected { reason } => {
                println!("✗ Disconnected: {reason}");
                break;
            }
            other => println!("  (event) {other:?}"),
        }
    }
    Ok(())
}
