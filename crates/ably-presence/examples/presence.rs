//! Enter a channel's presence set and print presence events.
//!
//! ```sh
//! ABLY_API_KEY=keyName:keySecret cargo run -p ably-presence --example presence \
//!     -- <CHANNEL> <CLIENT_ID> [HOST]
//! ```
//!
//! Ctrl-C leaves the presence set and closes the connection.

use ably_presence::{ClientOptions, ConnectionState, PresenceQuery, Realtime};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt::init();

    let key = std::env::var("ABLY_API_KEY").map_err(|_| "ABLY_API_KEY is not set")?;
    let args: Vec<String> = std::env::args().skip(1).collect();
    let usage = "usage: presence <CHANNEL> <CLIENT_ID> [HOST]";
    let channel = args.first().ok_or(usage)?;
    let client_id = args.get(1).ok_or(usage)?;

    let mut options = ClientOptions::new(key);
    options.client_id = Some(client_id.clone());
    options.host = args.get(2).cloned();
    let client = Realtime::new(options);

    let mut states = client.on_connection_state(None).await?;
    tokio::spawn(async move {
        while let Some(change) = states.next().await {
            eprintln!("[connection] {} -> {}", change.previous, change.current);
            if let Some(reason) = change.reason {
                eprintln!("             {reason}");
            }
        }
    });

    let presence = client.channel(channel).presence();
    let mut events = presence.subscribe(None).await?;
    presence.enter(serde_json::json!({"status": "online"})).await?;
    eprintln!("entered '{channel}' as '{client_id}'");

    for member in presence.get(PresenceQuery::default()).await? {
        println!("[member] {} ({}) {}", member.client_id, member.connection_id, member.data);
    }

    loop {
        tokio::select! {
            event = events.next() => {
                let Some(event) = event else { break };
                println!("[{:?}] {} {}", event.action, event.client_id, event.data);
            }
            _ = tokio::signal::ctrl_c() => break,
        }
    }

    if let Err(e) = presence.leave(serde_json::Value::Null).await {
        eprintln!("leave failed: {e}");
    }
    client.close();
    while client.connection_state().await? != ConnectionState::Closed {
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
    }
    Ok(())
}
