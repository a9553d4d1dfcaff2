//! Ably Realtime presence client.
//!
//! Implements the connection and channel state machines of the Ably realtime
//! protocol together with channel presence: entering and leaving on behalf
//! of client ids, the server-driven presence SYNC, member queries and
//! presence subscriptions. WebSocket with MessagePack encoding is the default
//! transport; any [`Transport`] can be plugged in.
//!
//! # Features
//! - Connection resume with exponential backoff and jitter
//! - Channel attach/detach with automatic re-attach
//! - Presence operations queued while disconnected and flushed on attach
//! - Automatic re-entry of this connection's members after a lost attachment
//!
//! # Example
//! ```no_run
//! # async fn example() -> Result<(), ably_presence::Error> {
//! use ably_presence::{ClientOptions, PresenceQuery, Realtime};
//!
//! let mut options = ClientOptions::new("appId.keyId:secret");
//! options.client_id = Some("john".to_string());
//! let client = Realtime::new(options);
//!
//! let presence = client.channel("room").presence();
//! let mut events = presence.subscribe(None).await?;
//! presence.enter(serde_json::json!({"status": "online"})).await?;
//!
//! for member in presence.get(PresenceQuery::default()).await? {
//!     println!("{} is here", member.client_id);
//! }
//! while let Some(event) = events.next().await {
//!     println!("{:?} {}", event.action, event.client_id);
//! }
//! # Ok(())
//! # }
//! ```

pub mod backoff;
mod channel;
mod client;
mod config;
mod connection;
mod emitter;
mod presence;
mod presence_map;
pub mod protocol;
mod queue;
mod transport;
mod types;

pub use channel::RealtimeChannel;
pub use client::Realtime;
pub use config::{ClientOptions, TimingConfig};
pub use emitter::{Listener, ListenerId};
pub use presence::RealtimePresence;
pub use protocol::ErrorInfo;
pub use queue::Completion;
pub use transport::{ConnectParams, Transport, TransportEvent, TransportSink, WebSocketTransport};
pub use types::{
    ChannelState, ChannelStateChange, ConnectionState, ConnectionStateChange, Error, MemberKey,
    PresenceAction, PresenceMessage, PresenceQuery,
};
