//! Presence on a channel: enter/update/leave, member queries, subscriptions,
//! and the inbound PRESENCE and SYNC handling that keeps the member map
//! current.

use std::sync::Arc;

use tokio::sync::oneshot;

use crate::Error;
use crate::channel::{ChannelCommand, PendingGet, RealtimeChannel};
use crate::client::ClientCore;
use crate::connection::connection_state_error;
use crate::emitter::{Listener, ListenerId};
use crate::protocol::{
    ProtocolMessage, build_presence_msg, error_code, is_sync_complete, presence_from_wire,
};
use crate::queue::{Completion, Responder, completion};
use crate::types::{ChannelState, ConnectionState, PresenceAction, PresenceMessage, PresenceQuery};

pub(crate) enum PresenceCommand {
    Publish {
        action: PresenceAction,
        client_id: Option<String>,
        data: serde_json::Value,
        responder: Responder,
    },
    Get {
        query: PresenceQuery,
        reply: oneshot::Sender<Result<Vec<PresenceMessage>, Error>>,
    },
    Subscribe {
        action: Option<PresenceAction>,
        reply: oneshot::Sender<Result<Listener<PresenceMessage>, Error>>,
    },
    Unsubscribe(ListenerId),
    UnsubscribeAction(PresenceAction, ListenerId),
    UnsubscribeAll,
    SyncComplete(oneshot::Sender<bool>),
    ListenerCount(Option<PresenceAction>, oneshot::Sender<usize>),
}

fn invalid_channel_state(operation: &str, state: ChannelState) -> Error {
    Error::ably(
        error_code::INVALID_CHANNEL_STATE,
        Some(400),
        format!("unable to {operation}: invalid channel state ({state})"),
    )
}

impl ClientCore {
    pub(crate) fn handle_presence_command(&mut self, name: &str, command: PresenceCommand) {
        match command {
            PresenceCommand::Publish {
                action,
                client_id,
                data,
                responder,
            } => self.publish_presence(name, action, client_id, data, responder),
            PresenceCommand::Get { query, reply } => self.get_presence(name, query, reply),
            PresenceCommand::Subscribe { action, reply } => {
                let _ = reply.send(self.subscribe_presence(name, action));
            }
            PresenceCommand::Unsubscribe(id) => {
                self.ensure_channel(name).presence_events.off(id);
            }
            PresenceCommand::UnsubscribeAction(action, id) => {
                self.ensure_channel(name)
                    .presence_events
                    .off_filtered(Some(action), id);
            }
            PresenceCommand::UnsubscribeAll => {
                self.ensure_channel(name).presence_events.off_all();
            }
            PresenceCommand::SyncComplete(reply) => {
                let _ = reply.send(self.ensure_channel(name).presence.sync_complete());
            }
            PresenceCommand::ListenerCount(filter, reply) => {
                let _ = reply.send(self.ensure_channel(name).presence_events.count(filter));
            }
        }
    }

    /// Enter, update or leave. Sent straight away when the channel is
    /// attached on a live connection, queued otherwise.
    pub(crate) fn publish_presence(
        &mut self,
        name: &str,
        action: PresenceAction,
        client_id: Option<String>,
        data: serde_json::Value,
        responder: Responder,
    ) {
        let Some(client_id) = client_id.or_else(|| self.options.client_id.clone()) else {
            responder.resolve(Err(Error::ably(
                error_code::MISSING_CLIENT_ID,
                Some(400),
                "unable to publish presence without a clientId",
            )));
            return;
        };

        let channel_state = self.ensure_channel(name).state;
        if matches!(channel_state, ChannelState::Failed | ChannelState::Suspended) {
            responder.resolve(Err(invalid_channel_state("publish presence", channel_state)));
            return;
        }

        let conn_state = self.connection.state;
        let queueable = match conn_state {
            ConnectionState::Connected => true,
            ConnectionState::Connecting | ConnectionState::Disconnected => {
                self.options.queue_messages
            }
            ConnectionState::Initialized
            | ConnectionState::Suspended
            | ConnectionState::Closing
            | ConnectionState::Closed
            | ConnectionState::Failed => false,
        };
        if !queueable {
            let err = self
                .connection
                .error_reason
                .clone()
                .unwrap_or_else(|| Arc::new(connection_state_error(conn_state)));
            responder.fail(&err);
            return;
        }

        let msg = build_presence_msg(name, action, &client_id, data);
        if channel_state == ChannelState::Attached && conn_state == ConnectionState::Connected {
            self.send_with_ack(msg, responder);
            return;
        }

        tracing::debug!(channel = %name, state = %channel_state, "Queueing presence message");
        self.ensure_channel(name).queue.enqueue(msg, responder);
        if matches!(
            channel_state,
            ChannelState::Initialized | ChannelState::Detached | ChannelState::Detaching
        ) {
            // Connection state was checked above; the attach cannot be refused.
            let _ = self.attach_channel(name, None);
        }
    }

    pub(crate) fn get_presence(
        &mut self,
        name: &str,
        query: PresenceQuery,
        reply: oneshot::Sender<Result<Vec<PresenceMessage>, Error>>,
    ) {
        let channel = self.ensure_channel(name);
        match channel.state {
            ChannelState::Failed => {
                let _ = reply.send(Err(invalid_channel_state("get presence", channel.state)));
            }
            ChannelState::Suspended if query.wait_for_sync => {
                let _ = reply.send(Err(Error::ably(
                    error_code::PRESENCE_SYNC_SUSPENDED,
                    Some(400),
                    "presence state is out of sync due to the channel being suspended",
                )));
            }
            ChannelState::Suspended => {
                let _ = reply.send(Ok(channel.presence.members(&query)));
            }
            ChannelState::Attached if channel.presence.sync_complete() || !query.wait_for_sync => {
                let _ = reply.send(Ok(channel.presence.members(&query)));
            }
            ChannelState::Attached | ChannelState::Attaching => {
                channel.pending_gets.push(PendingGet { query, reply });
            }
            ChannelState::Initialized | ChannelState::Detached | ChannelState::Detaching => {
                channel.pending_gets.push(PendingGet { query, reply });
                if let Err(err) = self.attach_channel(name, None)
                    && let Some(channel) = self.channels.get_mut(name)
                {
                    for get in channel.pending_gets.drain(..) {
                        let _ = get.reply.send(Err(Error::Ably(Arc::clone(&err))));
                    }
                }
            }
        }
    }

    pub(crate) fn subscribe_presence(
        &mut self,
        name: &str,
        action: Option<PresenceAction>,
    ) -> Result<Listener<PresenceMessage>, Error> {
        let state = self.ensure_channel(name).state;
        match state {
            ChannelState::Failed => return Err(invalid_channel_state("subscribe", state)),
            ChannelState::Initialized | ChannelState::Detached => {
                self.attach_channel(name, None)?;
            }
            _ => {}
        }
        Ok(self.ensure_channel(name).presence_events.on(action))
    }

    // -----------------------------------------------------------------------
    // Inbound
    // -----------------------------------------------------------------------

    pub(crate) fn on_presence(&mut self, mut msg: ProtocolMessage) {
        let Some(name) = msg.channel.clone() else {
            tracing::warn!("PRESENCE without channel");
            return;
        };
        let own_connection = self.connection.id.clone();
        let Some(channel) = self.channels.get_mut(&name) else {
            tracing::debug!(channel = %name, "PRESENCE for unknown channel");
            return;
        };
        let entries = msg.presence.take().unwrap_or_default();
        for (index, wire) in entries.into_iter().enumerate() {
            let Some(member) = presence_from_wire(&msg, index, wire) else {
                continue;
            };
            if own_connection.as_deref() == Some(member.connection_id.as_str())
                && !(member.action == PresenceAction::Leave && member.is_synthesized())
            {
                channel.presence.track_local(&member);
            }
            if let Some(event) = channel.presence.put(member) {
                channel.emit_presence(&event);
            }
        }
    }

    /// One page of a presence SYNC. The last page (empty cursor) ends the
    /// session, prunes members nobody reconfirmed and answers waiting gets.
    pub(crate) fn on_sync(&mut self, mut msg: ProtocolMessage) {
        let Some(name) = msg.channel.clone() else {
            tracing::warn!("SYNC without channel");
            return;
        };
        let Some(channel) = self.channels.get_mut(&name) else {
            tracing::debug!(channel = %name, "SYNC for unknown channel");
            return;
        };
        if channel.state != ChannelState::Attached {
            tracing::debug!(channel = %name, state = %channel.state, "Ignoring SYNC");
            return;
        }

        channel.presence.start_sync();
        let entries = msg.presence.take().unwrap_or_default();
        tracing::debug!(
            channel = %name,
            serial = ?msg.channel_serial,
            members = entries.len(),
            "Presence sync",
        );
        for (index, wire) in entries.into_iter().enumerate() {
            if let Some(member) = presence_from_wire(&msg, index, wire)
                && let Some(event) = channel.presence.put(member)
            {
                channel.emit_presence(&event);
            }
        }
        channel.presence.set_sync_serial(msg.channel_serial.clone());

        if is_sync_complete(msg.channel_serial.as_deref()) {
            for leave in channel.presence.end_sync(msg.timestamp) {
                channel.emit_presence(&leave);
            }
            tracing::info!(channel = %name, members = channel.presence.len(), "Presence sync complete");
            channel.resolve_pending_gets();
        }
    }
}

// ---------------------------------------------------------------------------
// Public handle
// ---------------------------------------------------------------------------

/// Presence operations on one channel.
///
/// `enter`, `update` and `leave` return immediately with a [`Completion`];
/// the operation is already queued or sent when they return.
#[derive(Debug, Clone)]
pub struct RealtimePresence {
    channel: RealtimeChannel,
}

impl RealtimePresence {
    pub(crate) fn new(channel: RealtimeChannel) -> Self {
        Self { channel }
    }

    fn publish(
        &self,
        action: PresenceAction,
        client_id: Option<&str>,
        data: serde_json::Value,
    ) -> Completion {
        let (responder, done) = completion();
        self.channel
            .send(ChannelCommand::Presence(PresenceCommand::Publish {
                action,
                client_id: client_id.map(str::to_string),
                data,
                responder,
            }));
        done
    }

    /// Enter as the client's configured client id.
    pub fn enter(&self, data: impl Into<serde_json::Value>) -> Completion {
        self.publish(PresenceAction::Enter, None, data.into())
    }

    pub fn update(&self, data: impl Into<serde_json::Value>) -> Completion {
        self.publish(PresenceAction::Update, None, data.into())
    }

    pub fn leave(&self, data: impl Into<serde_json::Value>) -> Completion {
        self.publish(PresenceAction::Leave, None, data.into())
    }

    /// Enter on behalf of `client_id`.
    pub fn enter_client(&self, client_id: &str, data: impl Into<serde_json::Value>) -> Completion {
        self.publish(PresenceAction::Enter, Some(client_id), data.into())
    }

    pub fn update_client(
        &self,
        client_id: &str,
        data: impl Into<serde_json::Value>,
    ) -> Completion {
        self.publish(PresenceAction::Update, Some(client_id), data.into())
    }

    pub fn leave_client(&self, client_id: &str, data: impl Into<serde_json::Value>) -> Completion {
        self.publish(PresenceAction::Leave, Some(client_id), data.into())
    }

    /// Current members. With `wait_for_sync` (the default) this resolves
    /// once the channel is attached and its presence SYNC is complete.
    pub async fn get(&self, query: PresenceQuery) -> Result<Vec<PresenceMessage>, Error> {
        self.channel
            .request(|reply| ChannelCommand::Presence(PresenceCommand::Get { query, reply }))
            .await?
    }

    /// Receive presence events, all of them or only `action`. Attaches the
    /// channel if needed.
    pub async fn subscribe(
        &self,
        action: Option<PresenceAction>,
    ) -> Result<Listener<PresenceMessage>, Error> {
        self.channel
            .request(|reply| ChannelCommand::Presence(PresenceCommand::Subscribe { action, reply }))
            .await?
    }

    /// Remove a subscription whatever action it was registered for.
    pub fn unsubscribe(&self, id: ListenerId) {
        self.channel
            .send(ChannelCommand::Presence(PresenceCommand::Unsubscribe(id)));
    }

    /// Remove a subscription only if it was registered for `action`.
    pub fn unsubscribe_action(&self, action: PresenceAction, id: ListenerId) {
        self.channel
            .send(ChannelCommand::Presence(PresenceCommand::UnsubscribeAction(
                action, id,
            )));
    }

    pub fn unsubscribe_all(&self) {
        self.channel
            .send(ChannelCommand::Presence(PresenceCommand::UnsubscribeAll));
    }

    pub async fn sync_complete(&self) -> Result<bool, Error> {
        self.channel
            .request(|reply| ChannelCommand::Presence(PresenceCommand::SyncComplete(reply)))
            .await
    }

    /// Subscriptions registered with exactly `action` (`None`: for every action).
    pub async fn listener_count(&self, action: Option<PresenceAction>) -> Result<usize, Error> {
        self.channel
            .request(|reply| ChannelCommand::Presence(PresenceCommand::ListenerCount(action, reply)))
            .await
    }
}
