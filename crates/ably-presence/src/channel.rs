//! Channel state machine and the channel handle.

use std::sync::Arc;

use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;

use crate::Error;
use crate::client::{ClientCore, Command};
use crate::connection::{connection_state_error, is_retriable};
use crate::emitter::{EventEmitter, Listener, ListenerId};
use crate::presence::{PresenceCommand, RealtimePresence};
use crate::presence_map::PresenceMap;
use crate::protocol::{
    ErrorInfo, ProtocolMessage, build_attach_msg, build_detach_msg, build_presence_msg,
    build_sync_msg, error_code, flags,
};
use crate::queue::{Completion, MessageQueue, Responder, completion};
use crate::types::{
    ChannelState, ChannelStateChange, ConnectionState, PresenceAction, PresenceMessage,
    PresenceQuery,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ChannelTimer {
    AttachTimeout,
    DetachTimeout,
    Reattach,
}

pub(crate) struct PendingGet {
    pub query: PresenceQuery,
    pub reply: oneshot::Sender<Result<Vec<PresenceMessage>, Error>>,
}

pub(crate) struct Channel {
    pub name: String,
    pub state: ChannelState,
    pub error_reason: Option<Arc<ErrorInfo>>,
    /// Serial from the last ATTACHED, sent back on re-attach.
    pub channel_serial: Option<String>,
    pub queue: MessageQueue,
    pub presence: PresenceMap,
    pub presence_events: EventEmitter<PresenceAction, PresenceMessage>,
    pub state_events: EventEmitter<ChannelState, ChannelStateChange>,
    pub attach_waiters: Vec<Responder>,
    pub detach_waiters: Vec<Responder>,
    pub pending_gets: Vec<PendingGet>,
    pub timer: Option<(Instant, ChannelTimer)>,
    pub last_reattach_at: Option<Instant>,
}

/// Edges of the channel state machine. `Attached → Attached` is an
/// ATTACHED update.
pub(crate) fn can_transition(from: ChannelState, to: ChannelState) -> bool {
    use ChannelState::*;
    match (from, to) {
        (_, Failed) => from != Failed,
        (_, Attaching) => from != Attaching,
        (Attaching | Attached | Suspended | Detaching, Attached) => true,
        (Attaching | Attached, Detaching) => true,
        (Attaching | Attached | Detaching | Suspended, Detached) => true,
        (Attaching | Attached | Detaching, Suspended) => true,
        _ => false,
    }
}

impl Channel {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            state: ChannelState::Initialized,
            error_reason: None,
            channel_serial: None,
            queue: MessageQueue::default(),
            presence: PresenceMap::new(),
            presence_events: EventEmitter::new(),
            state_events: EventEmitter::new(),
            attach_waiters: Vec::new(),
            detach_waiters: Vec::new(),
            pending_gets: Vec::new(),
            timer: None,
            last_reattach_at: None,
        }
    }

    pub fn set_state(
        &mut self,
        to: ChannelState,
        reason: Option<Arc<ErrorInfo>>,
        resumed: bool,
    ) -> bool {
        let from = self.state;
        if !can_transition(from, to) {
            tracing::warn!(channel = %self.name, %from, %to, "Ignoring invalid channel state transition");
            return false;
        }
        if from != to {
            tracing::info!(channel = %self.name, %from, %to, "Channel state changed");
        }
        self.state = to;
        if let Some(ref reason) = reason {
            self.error_reason = Some(Arc::clone(reason));
        }
        let change = ChannelStateChange {
            previous: from,
            current: to,
            reason,
            resumed,
        };
        self.state_events.emit(to, &change);
        true
    }

    /// Fail everything waiting on this channel with the same error.
    pub fn fail_waiters(&mut self, error: &Arc<ErrorInfo>) {
        self.queue.fail_all(error);
        for waiter in self.attach_waiters.drain(..) {
            waiter.fail(error);
        }
        for waiter in self.detach_waiters.drain(..) {
            waiter.fail(error);
        }
        for get in self.pending_gets.drain(..) {
            let _ = get.reply.send(Err(Error::Ably(Arc::clone(error))));
        }
    }

    pub fn resolve_pending_gets(&mut self) {
        for get in self.pending_gets.drain(..) {
            let _ = get.reply.send(Ok(self.presence.members(&get.query)));
        }
    }

    /// Answer the gets that do not wait for the sync to finish.
    pub fn resolve_unsynced_gets(&mut self) {
        let (ready, waiting): (Vec<_>, Vec<_>) = self
            .pending_gets
            .drain(..)
            .partition(|get| !get.query.wait_for_sync);
        self.pending_gets = waiting;
        for get in ready {
            let _ = get.reply.send(Ok(self.presence.members(&get.query)));
        }
    }

    pub fn emit_presence(&mut self, event: &PresenceMessage) {
        self.presence_events.emit(event.action, event);
    }

    /// DETACHED: the member map is gone and nothing queued will be sent.
    fn enter_detached(&mut self, reason: Option<Arc<ErrorInfo>>, error: &Arc<ErrorInfo>) {
        self.timer = None;
        self.set_state(ChannelState::Detached, reason, false);
        self.presence.reset();
        for waiter in self.detach_waiters.drain(..) {
            waiter.succeed();
        }
        self.fail_waiters(error);
    }
}

fn detached_error() -> Arc<ErrorInfo> {
    Arc::new(ErrorInfo::new(
        error_code::CHANNEL_OPERATION_FAILED,
        Some(400),
        "channel detached",
    ))
}

// ---------------------------------------------------------------------------
// Commands
// ---------------------------------------------------------------------------

pub(crate) enum ChannelCommand {
    Attach(Responder),
    Detach(Responder),
    State(oneshot::Sender<ChannelState>),
    ErrorReason(oneshot::Sender<Option<Arc<ErrorInfo>>>),
    QueuedMessageCount(oneshot::Sender<usize>),
    OnState(
        Option<ChannelState>,
        oneshot::Sender<Listener<ChannelStateChange>>,
    ),
    OffState(ListenerId),
    Release,
    Presence(PresenceCommand),
}

impl ClientCore {
    pub(crate) fn ensure_channel(&mut self, name: &str) -> &mut Channel {
        self.channels
            .entry(name.to_string())
            .or_insert_with(|| Channel::new(name))
    }

    pub(crate) fn handle_channel_command(&mut self, name: &str, command: ChannelCommand) {
        match command {
            ChannelCommand::Attach(responder) => {
                let _ = self.attach_channel(name, Some(responder));
            }
            ChannelCommand::Detach(responder) => self.detach_channel(name, responder),
            ChannelCommand::State(reply) => {
                let _ = reply.send(self.ensure_channel(name).state);
            }
            ChannelCommand::ErrorReason(reply) => {
                let _ = reply.send(self.ensure_channel(name).error_reason.clone());
            }
            ChannelCommand::QueuedMessageCount(reply) => {
                let _ = reply.send(self.ensure_channel(name).queue.len());
            }
            ChannelCommand::OnState(filter, reply) => {
                let _ = reply.send(self.ensure_channel(name).state_events.on(filter));
            }
            ChannelCommand::OffState(id) => {
                self.ensure_channel(name).state_events.off(id);
            }
            ChannelCommand::Release => self.release_channel(name),
            ChannelCommand::Presence(command) => self.handle_presence_command(name, command),
        }
    }

    // -----------------------------------------------------------------------
    // Attach / detach
    // -----------------------------------------------------------------------

    /// Start attaching `name`, or join an attach already in flight. Refused
    /// while the connection cannot carry an ATTACH; the refusal is also
    /// delivered to `responder`.
    pub(crate) fn attach_channel(
        &mut self,
        name: &str,
        responder: Option<Responder>,
    ) -> Result<(), Arc<ErrorInfo>> {
        let conn_state = self.connection.state;
        let refusal = match conn_state {
            ConnectionState::Closing
            | ConnectionState::Closed
            | ConnectionState::Failed
            | ConnectionState::Suspended => Some(
                self.connection
                    .error_reason
                    .clone()
                    .unwrap_or_else(|| Arc::new(connection_state_error(conn_state))),
            ),
            _ => None,
        };

        let channel = self.ensure_channel(name);
        match channel.state {
            ChannelState::Attached => {
                if let Some(responder) = responder {
                    responder.succeed();
                }
                return Ok(());
            }
            ChannelState::Attaching => {
                channel.attach_waiters.extend(responder);
                return Ok(());
            }
            _ => {}
        }
        if let Some(err) = refusal {
            if let Some(responder) = responder {
                responder.fail(&err);
            }
            return Err(err);
        }

        channel.attach_waiters.extend(responder);
        if !channel.detach_waiters.is_empty() {
            let superseded = Arc::new(ErrorInfo::new(
                error_code::CHANNEL_OPERATION_FAILED,
                Some(400),
                "detach superseded by attach",
            ));
            for waiter in channel.detach_waiters.drain(..) {
                waiter.fail(&superseded);
            }
        }
        channel.set_state(ChannelState::Attaching, None, false);

        match conn_state {
            ConnectionState::Connected => self.send_attach(name),
            ConnectionState::Initialized => self.connect(),
            // ATTACH goes out once CONNECTED arrives.
            _ => {}
        }
        Ok(())
    }

    fn send_attach(&mut self, name: &str) {
        let timeout = self.options.timing.realtime_request_timeout;
        let Some(channel) = self.channels.get_mut(name) else {
            return;
        };
        let msg = build_attach_msg(name, None, channel.channel_serial.as_deref());
        channel.timer = Some((Instant::now() + timeout, ChannelTimer::AttachTimeout));
        self.transmit(&msg);
    }

    fn send_detach(&mut self, name: &str) {
        let timeout = self.options.timing.realtime_request_timeout;
        let Some(channel) = self.channels.get_mut(name) else {
            return;
        };
        channel.timer = Some((Instant::now() + timeout, ChannelTimer::DetachTimeout));
        self.transmit(&build_detach_msg(name));
    }

    pub(crate) fn detach_channel(&mut self, name: &str, responder: Responder) {
        let connected = self.connection.is_connected();
        let channel = self.ensure_channel(name);
        match channel.state {
            ChannelState::Initialized | ChannelState::Detached => responder.succeed(),
            ChannelState::Failed => responder.fail(&Arc::new(ErrorInfo::new(
                error_code::INVALID_CHANNEL_STATE,
                Some(400),
                "unable to detach: invalid channel state (failed)",
            ))),
            ChannelState::Detaching => channel.detach_waiters.push(responder),
            ChannelState::Attached | ChannelState::Attaching if connected => {
                let interrupted = Arc::new(ErrorInfo::new(
                    error_code::CHANNEL_OPERATION_FAILED,
                    Some(400),
                    "channel detached before attach completed",
                ));
                for waiter in channel.attach_waiters.drain(..) {
                    waiter.fail(&interrupted);
                }
                channel.detach_waiters.push(responder);
                channel.set_state(ChannelState::Detaching, None, false);
                self.send_detach(name);
            }
            ChannelState::Attached | ChannelState::Attaching | ChannelState::Suspended => {
                // No live link to carry a DETACH.
                channel.detach_waiters.push(responder);
                channel.enter_detached(None, &detached_error());
            }
        }
    }

    /// Drop a channel handle's state entirely.
    pub(crate) fn release_channel(&mut self, name: &str) {
        let Some(mut channel) = self.channels.remove(name) else {
            return;
        };
        tracing::info!(channel = %name, "Releasing channel");
        let error = Arc::new(ErrorInfo::new(
            error_code::CHANNEL_OPERATION_FAILED,
            Some(400),
            "channel released",
        ));
        channel.fail_waiters(&error);
        channel.presence_events.off_all();
        channel.state_events.off_all();
        self.pending_acks.fail_channel(name, &error);
        if self.connection.is_connected()
            && matches!(channel.state, ChannelState::Attached | ChannelState::Attaching)
        {
            self.transmit(&build_detach_msg(name));
        }
    }

    // -----------------------------------------------------------------------
    // Inbound
    // -----------------------------------------------------------------------

    pub(crate) fn on_attached(&mut self, msg: ProtocolMessage) {
        let Some(name) = msg.channel.clone() else {
            tracing::warn!("ATTACHED without channel");
            return;
        };
        let Some(channel) = self.channels.get_mut(&name) else {
            tracing::debug!(channel = %name, "ATTACHED for unknown channel");
            return;
        };
        if !matches!(
            channel.state,
            ChannelState::Attaching | ChannelState::Attached | ChannelState::Suspended
        ) {
            tracing::debug!(channel = %name, state = %channel.state, "Ignoring ATTACHED");
            return;
        }

        if let Some(serial) = msg.channel_serial.clone() {
            channel.channel_serial = Some(serial);
        }
        channel.timer = None;
        channel.last_reattach_at = None;
        let resumed = msg.has_flag(flags::RESUMED);
        let has_backlog = msg.has_flag(flags::HAS_BACKLOG);
        let has_presence = msg.has_flag(flags::HAS_PRESENCE);
        tracing::info!(
            channel = %name,
            resumed,
            has_backlog,
            has_presence,
            "Channel attached",
        );

        channel.set_state(ChannelState::Attached, msg.error.map(Arc::new), resumed);
        for waiter in channel.attach_waiters.drain(..) {
            waiter.succeed();
        }

        channel.presence.start_sync();
        if !has_presence {
            // Nobody is present: anyone we knew about has left.
            for leave in channel.presence.end_sync(msg.timestamp) {
                channel.emit_presence(&leave);
            }
            channel.resolve_pending_gets();
        } else {
            channel.resolve_unsynced_gets();
        }

        let reentries = if resumed {
            Vec::new()
        } else {
            channel.presence.local_members()
        };

        if !self.connection.is_connected() {
            return;
        }
        for member in reentries {
            tracing::debug!(channel = %name, client_id = %member.client_id, "Re-entering presence");
            let msg = build_presence_msg(&name, PresenceAction::Enter, &member.client_id, member.data);
            self.send_with_ack(msg, Responder::reentry(&name, &member.client_id));
        }
        self.flush_queue(&name);
    }

    pub(crate) fn on_detached(&mut self, msg: ProtocolMessage) {
        let Some(name) = msg.channel.clone() else {
            tracing::warn!("DETACHED without channel");
            return;
        };
        let retry_window = self.options.timing.channel_retry_timeout;
        let connected = self.connection.is_connected();
        let Some(channel) = self.channels.get_mut(&name) else {
            tracing::debug!(channel = %name, "DETACHED for unknown channel");
            return;
        };
        let error = msg.error.map(Arc::new);

        match channel.state {
            ChannelState::Detaching => {
                let reason = error.clone();
                channel.enter_detached(reason, &error.unwrap_or_else(detached_error));
            }
            ChannelState::Attached | ChannelState::Attaching => {
                if let Some(ref err) = error
                    && !is_retriable(err)
                {
                    channel.channel_serial = None;
                    self.fail_channel(&name, Arc::clone(err));
                    return;
                }
                if channel
                    .last_reattach_at
                    .is_some_and(|t| t.elapsed() < retry_window)
                {
                    tracing::warn!(channel = %name, "Channel detached again within retry window, suspending");
                    let reason = error.unwrap_or_else(detached_error);
                    self.suspend_channel(&name, reason, true);
                    return;
                }
                tracing::warn!(channel = %name, "Channel detached, re-attaching");
                channel.last_reattach_at = Some(Instant::now());
                channel.set_state(ChannelState::Attaching, error, false);
                if connected {
                    self.send_attach(&name);
                }
            }
            state => tracing::debug!(channel = %name, %state, "Ignoring DETACHED"),
        }
    }

    // -----------------------------------------------------------------------
    // Failure and suspension
    // -----------------------------------------------------------------------

    /// Channel-level fatal error: everything waiting on the channel receives
    /// the same `error`.
    pub(crate) fn fail_channel(&mut self, name: &str, error: Arc<ErrorInfo>) {
        let Some(channel) = self.channels.get_mut(name) else {
            tracing::warn!(channel = %name, "Error for unknown channel: {error}");
            return;
        };
        if channel.state == ChannelState::Failed {
            return;
        }
        tracing::error!(channel = %name, "Channel failed: {error}");
        channel.timer = None;
        channel.channel_serial = None;
        channel.set_state(ChannelState::Failed, Some(Arc::clone(&error)), false);
        channel.presence.reset();
        channel.fail_waiters(&error);
        self.pending_acks.fail_channel(name, &error);
    }

    /// Suspend a channel, optionally retrying the attach after
    /// `channel_retry_timeout`. The member map is kept.
    pub(crate) fn suspend_channel(&mut self, name: &str, reason: Arc<ErrorInfo>, reattach: bool) {
        let retry_in = self.options.timing.channel_retry_timeout;
        let Some(channel) = self.channels.get_mut(name) else {
            return;
        };
        if !channel.set_state(ChannelState::Suspended, Some(Arc::clone(&reason)), false) {
            return;
        }
        channel.fail_waiters(&reason);
        channel.timer = reattach.then(|| (Instant::now() + retry_in, ChannelTimer::Reattach));
    }

    /// Connection closed: active channels detach, queued work fails with `error`.
    pub(crate) fn detach_on_close(&mut self, name: &str, error: &Arc<ErrorInfo>) {
        let Some(channel) = self.channels.get_mut(name) else {
            return;
        };
        match channel.state {
            ChannelState::Attached
            | ChannelState::Attaching
            | ChannelState::Detaching
            | ChannelState::Suspended => channel.enter_detached(None, error),
            _ => channel.fail_waiters(error),
        }
    }

    /// A new or resumed link is up.
    pub(crate) fn on_connection_established(&mut self, name: &str, resumed: bool) {
        let Some(channel) = self.channels.get_mut(name) else {
            return;
        };
        match channel.state {
            ChannelState::Attached if resumed => {
                if channel.presence.sync_in_progress()
                    && let Some(serial) = channel.presence.last_sync_serial()
                {
                    let sync = build_sync_msg(name, serial);
                    tracing::info!(channel = %name, serial = %serial, "Resuming interrupted presence sync");
                    self.transmit(&sync);
                }
                self.flush_queue(name);
            }
            ChannelState::Attaching => self.send_attach(name),
            // The DETACH sent on the previous link may have been lost.
            ChannelState::Detaching => self.send_detach(name),
            ChannelState::Attached | ChannelState::Suspended => {
                channel.set_state(ChannelState::Attaching, None, false);
                self.send_attach(name);
            }
            _ => {}
        }
    }

    /// Send everything queued on an attached channel, in submission order.
    pub(crate) fn flush_queue(&mut self, name: &str) {
        if !self.connection.is_connected() {
            return;
        }
        let Some(channel) = self.channels.get_mut(name) else {
            return;
        };
        if channel.state != ChannelState::Attached || channel.queue.is_empty() {
            return;
        }
        let entries: Vec<_> = channel.queue.drain().collect();
        tracing::debug!(channel = %name, count = entries.len(), "Flushing queued messages");
        for entry in entries {
            self.send_with_ack(entry.message, entry.responder);
        }
    }

    pub(crate) fn on_channel_timer(&mut self, name: &str) {
        let Some(channel) = self.channels.get_mut(name) else {
            return;
        };
        let Some((_, timer)) = channel.timer.take() else {
            return;
        };
        match timer {
            ChannelTimer::DetachTimeout if !self.connection.is_connected() => {
                // Stays Detaching; DETACH goes out again on the next link.
                tracing::debug!(channel = %name, "Detach timeout without a link");
            }
            ChannelTimer::AttachTimeout => {
                tracing::warn!(channel = %name, "Attach timeout");
                let reason = Arc::new(ErrorInfo::new(
                    error_code::ATTACH_TIMEOUT,
                    None,
                    "timed out waiting for ATTACHED",
                ));
                self.suspend_channel(name, reason, true);
            }
            ChannelTimer::DetachTimeout => {
                tracing::warn!(channel = %name, "Detach timeout");
                let reason = Arc::new(ErrorInfo::new(
                    error_code::TIMEOUT,
                    None,
                    "timed out waiting for DETACHED",
                ));
                channel.set_state(ChannelState::Attached, Some(Arc::clone(&reason)), false);
                for waiter in channel.detach_waiters.drain(..) {
                    waiter.fail(&reason);
                }
            }
            ChannelTimer::Reattach => {
                if channel.state == ChannelState::Suspended && self.connection.is_connected() {
                    tracing::info!(channel = %name, "Retrying attach");
                    let _ = self.attach_channel(name, None);
                }
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Public handle
// ---------------------------------------------------------------------------

/// Handle to one channel of a [`Realtime`](crate::Realtime) client.
#[derive(Debug, Clone)]
pub struct RealtimeChannel {
    name: String,
    tx: mpsc::UnboundedSender<Command>,
}

impl RealtimeChannel {
    pub(crate) fn new(name: String, tx: mpsc::UnboundedSender<Command>) -> Self {
        Self { name, tx }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub(crate) fn send(&self, command: ChannelCommand) {
        let _ = self.tx.send(Command::Channel {
            name: self.name.clone(),
            command,
        });
    }

    pub(crate) async fn request<T>(
        &self,
        make: impl FnOnce(oneshot::Sender<T>) -> ChannelCommand,
    ) -> Result<T, Error> {
        let (reply, rx) = oneshot::channel();
        self.send(make(reply));
        rx.await.map_err(|_| Error::ClientClosed)
    }

    pub fn attach(&self) -> Completion {
        let (responder, done) = completion();
        self.send(ChannelCommand::Attach(responder));
        done
    }

    pub fn detach(&self) -> Completion {
        let (responder, done) = completion();
        self.send(ChannelCommand::Detach(responder));
        done
    }

    pub async fn state(&self) -> Result<ChannelState, Error> {
        self.request(ChannelCommand::State).await
    }

    pub async fn error_reason(&self) -> Result<Option<Arc<ErrorInfo>>, Error> {
        self.request(ChannelCommand::ErrorReason).await
    }

    /// Presence operations waiting for the channel to attach.
    pub async fn queued_message_count(&self) -> Result<usize, Error> {
        self.request(ChannelCommand::QueuedMessageCount).await
    }

    pub async fn on_state_change(
        &self,
        state: Option<ChannelState>,
    ) -> Result<Listener<ChannelStateChange>, Error> {
        self.request(|reply| ChannelCommand::OnState(state, reply))
            .await
    }

    pub fn off_state_change(&self, id: ListenerId) {
        self.send(ChannelCommand::OffState(id));
    }

    pub fn presence(&self) -> RealtimePresence {
        RealtimePresence::new(self.clone())
    }
}

#[cfg(test)]
mod tests {
    use futures_util::FutureExt;

    use super::*;
    use crate::client::tests::{connect, deliver, new_core, options};
    use crate::protocol::action;
    use crate::transport::TransportEvent;

    fn attached(name: &str, flags: i32) -> ProtocolMessage {
        ProtocolMessage {
            action: action::ATTACHED,
            channel: Some(name.to_string()),
            channel_serial: Some("serial-1".to_string()),
            flags: Some(flags),
            ..Default::default()
        }
    }

    fn detached(name: &str, error: Option<ErrorInfo>) -> ProtocolMessage {
        ProtocolMessage {
            action: action::DETACHED,
            channel: Some(name.to_string()),
            error,
            ..Default::default()
        }
    }

    #[test]
    fn channel_transition_table() {
        use ChannelState::*;
        assert!(can_transition(Initialized, Attaching));
        assert!(!can_transition(Initialized, Attached));
        assert!(can_transition(Attached, Attached));
        assert!(can_transition(Suspended, Attaching));
        assert!(!can_transition(Detached, Suspended));
        assert!(!can_transition(Failed, Failed));
        assert!(can_transition(Failed, Attaching));
    }

    #[tokio::test]
    async fn attach_sends_attach_and_resolves_on_attached() {
        let (mut core, transport) = new_core(options());
        connect(&mut core, "conn-1");
        let (responder, done) = completion();
        let _ = core.attach_channel("room", Some(responder));
        assert_eq!(core.channels["room"].state, ChannelState::Attaching);
        assert_eq!(transport.sent_actions(), vec![action::ATTACH]);

        deliver(&mut core, attached("room", 0));
        assert_eq!(core.channels["room"].state, ChannelState::Attached);
        assert_eq!(core.channels["room"].channel_serial.as_deref(), Some("serial-1"));
        assert!(done.await.is_ok());
    }

    #[test]
    fn attach_on_initialized_connection_connects_first() {
        let (mut core, transport) = new_core(options());
        let _ = core.attach_channel("room", None);
        assert_eq!(core.connection.state, ConnectionState::Connecting);
        assert!(transport.sent().is_empty());

        deliver(&mut core, crate::client::tests::connected_msg("conn-1"));
        assert_eq!(transport.sent_actions(), vec![action::ATTACH]);
    }

    #[test]
    fn attach_refused_when_connection_failed() {
        let (mut core, _transport) = new_core(options());
        connect(&mut core, "conn-1");
        core.fail_connection(Arc::new(ErrorInfo::new(80000, None, "boom")));
        let err = core.attach_channel("room", None).unwrap_err();
        assert_eq!(err.code, 80000);
    }

    #[tokio::test]
    async fn attach_timeout_suspends_then_retries() {
        let (mut core, transport) = new_core(options());
        connect(&mut core, "conn-1");
        let (responder, done) = completion();
        let _ = core.attach_channel("room", Some(responder));

        let (deadline, timer) = core.channels["room"].timer.unwrap();
        assert_eq!(timer, ChannelTimer::AttachTimeout);
        core.on_timer(deadline);
        assert_eq!(core.channels["room"].state, ChannelState::Suspended);
        assert_eq!(done.await.unwrap_err().code(), Some(error_code::ATTACH_TIMEOUT));

        let (deadline, timer) = core.channels["room"].timer.unwrap();
        assert_eq!(timer, ChannelTimer::Reattach);
        transport.clear_sent();
        core.on_timer(deadline);
        assert_eq!(core.channels["room"].state, ChannelState::Attaching);
        assert_eq!(transport.sent_actions(), vec![action::ATTACH]);
    }

    #[test]
    fn server_detach_reattaches_with_serial() {
        let (mut core, transport) = new_core(options());
        connect(&mut core, "conn-1");
        let _ = core.attach_channel("room", None);
        deliver(&mut core, attached("room", 0));
        transport.clear_sent();

        deliver(&mut core, detached("room", Some(ErrorInfo::new(90198, None, "detach"))));
        assert_eq!(core.channels["room"].state, ChannelState::Attaching);
        let sent = transport.sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].channel_serial.as_deref(), Some("serial-1"));
        assert!(sent[0].has_flag(flags::ATTACH_RESUME));

        // Detached again before re-attaching: give up for now.
        deliver(&mut core, detached("room", None));
        assert_eq!(core.channels["room"].state, ChannelState::Suspended);
    }

    #[test]
    fn non_retriable_detach_fails_channel() {
        let (mut core, _transport) = new_core(options());
        connect(&mut core, "conn-1");
        let _ = core.attach_channel("room", None);
        deliver(&mut core, attached("room", 0));
        deliver(
            &mut core,
            detached("room", Some(ErrorInfo::new(40160, Some(401), "not permitted"))),
        );
        let channel = &core.channels["room"];
        assert_eq!(channel.state, ChannelState::Failed);
        assert_eq!(channel.error_reason.as_ref().map(|e| e.code), Some(40160));
        assert!(channel.channel_serial.is_none());
    }

    #[tokio::test]
    async fn detach_round_trip() {
        let (mut core, transport) = new_core(options());
        connect(&mut core, "conn-1");
        let _ = core.attach_channel("room", None);
        deliver(&mut core, attached("room", 0));

        let (responder, done) = completion();
        core.detach_channel("room", responder);
        assert_eq!(core.channels["room"].state, ChannelState::Detaching);
        assert_eq!(transport.sent_actions().last(), Some(&action::DETACH));

        deliver(&mut core, detached("room", None));
        assert_eq!(core.channels["room"].state, ChannelState::Detached);
        assert!(done.await.is_ok());
    }

    #[tokio::test]
    async fn detach_without_link_is_immediate() {
        let (mut core, transport) = new_core(options());
        connect(&mut core, "conn-1");
        let _ = core.attach_channel("room", None);
        deliver(&mut core, attached("room", 0));
        let generation = core.connection.generation;
        core.handle_transport_event(generation, TransportEvent::Closed(None));
        transport.clear_sent();

        let (responder, done) = completion();
        core.detach_channel("room", responder);
        assert_eq!(core.channels["room"].state, ChannelState::Detached);
        assert!(transport.sent().is_empty());
        assert!(done.await.is_ok());
    }

    #[tokio::test]
    async fn detach_is_resent_after_link_loss() {
        let (mut core, transport) = new_core(options());
        connect(&mut core, "conn-1");
        let _ = core.attach_channel("room", None);
        deliver(&mut core, attached("room", 0));
        let (responder, mut done) = completion();
        core.detach_channel("room", responder);
        let generation = core.connection.generation;
        core.handle_transport_event(generation, TransportEvent::Closed(None));
        assert_eq!(core.connection.state, ConnectionState::Disconnected);

        // The detach timeout comes due before the reconnect.
        let (detach_deadline, timer) = core.channels["room"].timer.unwrap();
        assert_eq!(timer, ChannelTimer::DetachTimeout);
        core.on_timer(detach_deadline);
        assert_eq!(core.channels["room"].state, ChannelState::Detaching);
        assert!((&mut done).now_or_never().is_none());

        let deadline = core.next_deadline().unwrap();
        core.on_timer(deadline);
        transport.clear_sent();
        deliver(&mut core, crate::client::tests::connected_msg("conn-1"));
        assert_eq!(transport.sent_actions(), vec![action::DETACH]);
        assert_eq!(core.channels["room"].state, ChannelState::Detaching);

        deliver(&mut core, detached("room", None));
        assert_eq!(core.channels["room"].state, ChannelState::Detached);
        assert!(done.await.is_ok());
    }

    #[test]
    fn channel_error_fails_channel() {
        let (mut core, _transport) = new_core(options());
        connect(&mut core, "conn-1");
        let _ = core.attach_channel("room", None);
        let mut changes = core.channels.get_mut("room").unwrap().state_events.on(Some(ChannelState::Failed));
        deliver(
            &mut core,
            ProtocolMessage {
                action: action::ERROR,
                channel: Some("room".to_string()),
                error: Some(ErrorInfo::new(90000, Some(400), "channel error")),
                ..Default::default()
            },
        );
        assert_eq!(core.channels["room"].state, ChannelState::Failed);
        let change = changes.try_next().unwrap();
        assert_eq!(change.previous, ChannelState::Attaching);
        assert!(Arc::ptr_eq(
            change.reason.as_ref().unwrap(),
            core.channels["room"].error_reason.as_ref().unwrap()
        ));
        // The connection is unaffected.
        assert_eq!(core.connection.state, ConnectionState::Connected);
    }

    #[test]
    fn non_resumed_reconnect_reattaches_channels() {
        let (mut core, transport) = new_core(options());
        connect(&mut core, "conn-1");
        let _ = core.attach_channel("room", None);
        deliver(&mut core, attached("room", 0));
        let generation = core.connection.generation;
        core.handle_transport_event(generation, TransportEvent::Closed(None));
        let deadline = core.next_deadline().unwrap();
        core.on_timer(deadline);
        transport.clear_sent();

        deliver(&mut core, crate::client::tests::connected_msg("conn-2"));
        assert_eq!(core.channels["room"].state, ChannelState::Attaching);
        assert_eq!(transport.sent_actions(), vec![action::ATTACH]);
    }

    #[test]
    fn resumed_reconnect_keeps_channels_attached() {
        let (mut core, transport) = new_core(options());
        connect(&mut core, "conn-1");
        let _ = core.attach_channel("room", None);
        deliver(&mut core, attached("room", 0));
        let generation = core.connection.generation;
        core.handle_transport_event(generation, TransportEvent::Closed(None));
        let deadline = core.next_deadline().unwrap();
        core.on_timer(deadline);
        transport.clear_sent();

        deliver(&mut core, crate::client::tests::connected_msg("conn-1"));
        assert_eq!(core.channels["room"].state, ChannelState::Attached);
        assert!(transport.sent().is_empty());
    }

    #[test]
    fn close_detaches_attached_channels() {
        let (mut core, _transport) = new_core(options());
        connect(&mut core, "conn-1");
        let _ = core.attach_channel("room", None);
        deliver(&mut core, attached("room", 0));
        core.close();
        deliver(
            &mut core,
            ProtocolMessage {
                action: action::CLOSED,
                ..Default::default()
            },
        );
        assert_eq!(core.channels["room"].state, ChannelState::Detached);
    }

    #[test]
    fn release_ends_listeners_and_sends_detach() {
        let (mut core, transport) = new_core(options());
        connect(&mut core, "conn-1");
        let _ = core.attach_channel("room", None);
        deliver(&mut core, attached("room", 0));
        let mut listener = core.ensure_channel("room").presence_events.on(None);
        let (responder, mut done) = completion();
        core.ensure_channel("room").detach_waiters.push(responder);

        core.release_channel("room");
        assert!(!core.channels.contains_key("room"));
        assert_eq!(transport.sent_actions().last(), Some(&action::DETACH));
        assert!(listener.try_next().is_none());
        assert!(matches!((&mut done).now_or_never(), Some(Err(_))));
    }
}
