//! The client executor and its public handle.
//!
//! All state lives in [`ClientCore`], owned by one tokio task. Handles send
//! [`Command`]s over an unbounded channel, so operations from any thread are
//! applied in submission order. Transport events and timers are processed on
//! the same task.

use std::collections::HashMap;
use std::sync::Arc;

use rand::SeedableRng;
use rand::rngs::StdRng;
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;

use crate::Error;
use crate::channel::{Channel, ChannelCommand, RealtimeChannel};
use crate::config::ClientOptions;
use crate::connection::Connection;
use crate::emitter::{EventEmitter, Listener, ListenerId};
use crate::protocol::{ErrorInfo, ProtocolMessage, action, error_code};
use crate::queue::{PendingAcks, Responder};
use crate::transport::{Transport, TransportEvent, WebSocketTransport};
use crate::types::{ConnectionState, ConnectionStateChange};

pub(crate) enum Command {
    Connect,
    Close,
    ConnectionState(oneshot::Sender<ConnectionState>),
    ConnectionId(oneshot::Sender<Option<String>>),
    ConnectionErrorReason(oneshot::Sender<Option<Arc<ErrorInfo>>>),
    OnConnectionState(
        Option<ConnectionState>,
        oneshot::Sender<Listener<ConnectionStateChange>>,
    ),
    OffConnectionState(ListenerId),
    Channel {
        name: String,
        command: ChannelCommand,
    },
}

pub(crate) struct ClientCore {
    pub options: ClientOptions,
    pub connection: Connection,
    pub channels: HashMap<String, Channel>,
    pub pending_acks: PendingAcks,
    pub connection_events: EventEmitter<ConnectionState, ConnectionStateChange>,
    pub transport: Box<dyn Transport>,
    pub events_tx: mpsc::UnboundedSender<(u64, TransportEvent)>,
    pub rng: StdRng,
}

impl ClientCore {
    pub fn new(
        options: ClientOptions,
        transport: Box<dyn Transport>,
        events_tx: mpsc::UnboundedSender<(u64, TransportEvent)>,
    ) -> Self {
        let rng = match options.rng_seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        let connection = Connection::new(
            options.timing.default_connection_state_ttl,
            options.timing.default_max_idle_interval,
        );
        Self {
            options,
            connection,
            channels: HashMap::new(),
            pending_acks: PendingAcks::default(),
            connection_events: EventEmitter::new(),
            transport,
            events_tx,
            rng,
        }
    }

    // -----------------------------------------------------------------------
    // Outbound
    // -----------------------------------------------------------------------

    pub(crate) fn transmit(&mut self, msg: &ProtocolMessage) {
        if let Err(e) = self.transport.send(msg) {
            // The link reports its own loss; the message is re-sent or failed then.
            tracing::warn!(action = msg.action, "Failed to send message: {e}");
        }
    }

    /// Send a message that expects an ACK, assigning the next msg serial.
    pub(crate) fn send_with_ack(&mut self, mut msg: ProtocolMessage, responder: Responder) {
        let serial = self.connection.next_msg_serial();
        msg.msg_serial = Some(serial);
        self.transmit(&msg);
        self.pending_acks.push(serial, msg, responder);
    }

    // -----------------------------------------------------------------------
    // Commands
    // -----------------------------------------------------------------------

    pub(crate) fn handle_command(&mut self, command: Command) {
        match command {
            Command::Connect => self.connect(),
            Command::Close => self.close(),
            Command::ConnectionState(reply) => {
                let _ = reply.send(self.connection.state);
            }
            Command::ConnectionId(reply) => {
                let _ = reply.send(self.connection.id.clone());
            }
            Command::ConnectionErrorReason(reply) => {
                let _ = reply.send(self.connection.error_reason.clone());
            }
            Command::OnConnectionState(filter, reply) => {
                let _ = reply.send(self.connection_events.on(filter));
            }
            Command::OffConnectionState(id) => {
                self.connection_events.off(id);
            }
            Command::Channel { name, command } => self.handle_channel_command(&name, command),
        }
    }

    // -----------------------------------------------------------------------
    // Transport events
    // -----------------------------------------------------------------------

    pub(crate) fn handle_transport_event(&mut self, generation: u64, event: TransportEvent) {
        if generation != self.connection.generation {
            tracing::trace!(generation, "Dropping event from a previous link");
            return;
        }
        match event {
            TransportEvent::Message(msg) => self.handle_message(msg),
            TransportEvent::Closed(error) => self.on_transport_closed(error),
        }
    }

    fn handle_message(&mut self, msg: ProtocolMessage) {
        self.reset_idle_timer();
        match msg.action {
            action::HEARTBEAT => {
                tracing::trace!("Heartbeat received");
            }
            action::CONNECTED => self.on_connected(msg),
            action::DISCONNECTED => self.on_disconnected_msg(msg.error),
            action::CLOSED => {
                tracing::info!("Connection closed by server");
                self.finish_close();
            }
            action::ERROR => {
                let err = Arc::new(msg.error.unwrap_or_else(|| {
                    ErrorInfo::new(error_code::FAILED, None, "no error details from server")
                }));
                match msg.channel {
                    Some(name) => self.fail_channel(&name, err),
                    None => self.fail_connection(err),
                }
            }
            action::ACK => {
                let serial = msg.msg_serial.unwrap_or(0);
                self.pending_acks.ack(serial, msg.count.unwrap_or(1));
            }
            action::NACK => {
                let serial = msg.msg_serial.unwrap_or(0);
                let err = Arc::new(msg.error.unwrap_or_else(|| {
                    ErrorInfo::new(error_code::CHANNEL_OPERATION_FAILED, None, "message rejected")
                }));
                tracing::warn!(serial, "NACK: {err}");
                self.pending_acks.nack(serial, msg.count.unwrap_or(1), &err);
            }
            action::ATTACHED => self.on_attached(msg),
            action::DETACHED => self.on_detached(msg),
            action::SYNC => self.on_sync(msg),
            action::PRESENCE => self.on_presence(msg),
            action::MESSAGE => {
                tracing::trace!(channel = ?msg.channel, "Ignoring channel message");
            }
            _ => {
                tracing::debug!(action = msg.action, "Ignoring unknown action");
            }
        }
    }

    // -----------------------------------------------------------------------
    // Timers
    // -----------------------------------------------------------------------

    pub(crate) fn next_deadline(&self) -> Option<Instant> {
        let connection = self.connection.timer.map(|(at, _)| at);
        let channels = self
            .channels
            .values()
            .filter_map(|c| c.timer.map(|(at, _)| at))
            .min();
        match (connection, channels) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        }
    }

    /// Fire every timer due at `now`.
    pub(crate) fn on_timer(&mut self, now: Instant) {
        if let Some((at, timer)) = self.connection.timer
            && at <= now
        {
            self.on_connection_timer(timer);
        }
        let mut due: Vec<String> = self
            .channels
            .iter()
            .filter(|(_, c)| c.timer.is_some_and(|(at, _)| at <= now))
            .map(|(name, _)| name.clone())
            .collect();
        due.sort();
        for name in due {
            self.on_channel_timer(&name);
        }
    }

    /// Fail everything left when the last handle is dropped.
    fn shutdown(&mut self) {
        tracing::info!("All client handles dropped, shutting down");
        if self.connection.is_connected() {
            self.transmit(&crate::protocol::build_close_msg());
        }
        self.transport.close();
        let error = Arc::new(ErrorInfo::new(error_code::CLOSED, None, "client dropped"));
        self.pending_acks.fail_all(&error);
        for channel in self.channels.values_mut() {
            channel.fail_waiters(&error);
        }
    }
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(at) => tokio::time::sleep_until(at).await,
        None => std::future::pending().await,
    }
}

pub(crate) async fn run_client(
    mut core: ClientCore,
    mut commands: mpsc::UnboundedReceiver<Command>,
    mut events: mpsc::UnboundedReceiver<(u64, TransportEvent)>,
) {
    if core.options.auto_connect {
        core.connect();
    }
    loop {
        let deadline = core.next_deadline();
        tokio::select! {
            command = commands.recv() => {
                match command {
                    Some(command) => core.handle_command(command),
                    None => {
                        core.shutdown();
                        return;
                    }
                }
            }

            Some((generation, event)) = events.recv() => {
                core.handle_transport_event(generation, event);
            }

            _ = sleep_until(deadline) => {
                core.on_timer(Instant::now());
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Public handle
// ---------------------------------------------------------------------------

/// A realtime client. Cheap to clone; the connection closes when every
/// clone, channel and presence handle has been dropped.
#[derive(Debug, Clone)]
pub struct Realtime {
    tx: mpsc::UnboundedSender<Command>,
}

impl Realtime {
    /// Create a client using the WebSocket transport. Must be called within a
    /// tokio runtime. Connects immediately unless `auto_connect` is false.
    pub fn new(options: ClientOptions) -> Self {
        Self::with_transport(options, WebSocketTransport::new())
    }

    /// Create a client over a custom transport.
    pub fn with_transport<T: Transport>(options: ClientOptions, transport: T) -> Self {
        let (tx, commands) = mpsc::unbounded_channel();
        let (events_tx, events) = mpsc::unbounded_channel();
        let core = ClientCore::new(options, Box::new(transport), events_tx);
        tokio::spawn(run_client(core, commands, events));
        Self { tx }
    }

    fn send(&self, command: Command) {
        // A closed executor resolves every reply with ClientClosed.
        let _ = self.tx.send(command);
    }

    async fn request<T>(&self, make: impl FnOnce(oneshot::Sender<T>) -> Command) -> Result<T, Error> {
        let (reply, rx) = oneshot::channel();
        self.send(make(reply));
        rx.await.map_err(|_| Error::ClientClosed)
    }

    pub fn connect(&self) {
        self.send(Command::Connect);
    }

    pub fn close(&self) {
        self.send(Command::Close);
    }

    pub async fn connection_state(&self) -> Result<ConnectionState, Error> {
        self.request(Command::ConnectionState).await
    }

    pub async fn connection_id(&self) -> Result<Option<String>, Error> {
        self.request(Command::ConnectionId).await
    }

    pub async fn connection_error_reason(&self) -> Result<Option<Arc<ErrorInfo>>, Error> {
        self.request(Command::ConnectionErrorReason).await
    }

    /// Listen for connection state changes, optionally for one state only.
    pub async fn on_connection_state(
        &self,
        state: Option<ConnectionState>,
    ) -> Result<Listener<ConnectionStateChange>, Error> {
        self.request(|reply| Command::OnConnectionState(state, reply))
            .await
    }

    pub fn off_connection_state(&self, id: ListenerId) {
        self.send(Command::OffConnectionState(id));
    }

    /// Handle to the named channel. The channel is created on first use.
    pub fn channel(&self, name: &str) -> RealtimeChannel {
        RealtimeChannel::new(name.to_string(), self.tx.clone())
    }

    /// Drop the named channel: queued operations fail, listeners end.
    pub fn release_channel(&self, name: &str) {
        self.send(Command::Channel {
            name: name.to_string(),
            command: ChannelCommand::Release,
        });
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use futures_util::FutureExt;

    use super::*;
    use crate::connection::ConnectionTimer;
    use crate::protocol::{ConnectionDetails, build_attach_msg};
    use crate::transport::testing::RecordingTransport;
    use crate::types::ChannelState;

    pub(crate) fn new_core(options: ClientOptions) -> (ClientCore, RecordingTransport) {
        let transport = RecordingTransport::default();
        // Events are injected with handle_transport_event instead.
        let (events_tx, _) = mpsc::unbounded_channel();
        let core = ClientCore::new(options, Box::new(transport.clone()), events_tx);
        (core, transport)
    }

    pub(crate) fn options() -> ClientOptions {
        ClientOptions {
            client_id: Some("me".to_string()),
            rng_seed: Some(1),
            ..ClientOptions::new("app.key:secret")
        }
    }

    pub(crate) fn deliver(core: &mut ClientCore, msg: ProtocolMessage) {
        let generation = core.connection.generation;
        core.handle_transport_event(generation, TransportEvent::Message(msg));
    }

    pub(crate) fn connected_msg(connection_id: &str) -> ProtocolMessage {
        ProtocolMessage {
            action: action::CONNECTED,
            connection_id: Some(connection_id.to_string()),
            connection_details: Some(ConnectionDetails {
                connection_key: Some(format!("{connection_id}!key")),
                connection_state_ttl: Some(120_000),
                max_idle_interval: Some(15_000),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    pub(crate) fn connect(core: &mut ClientCore, connection_id: &str) {
        core.connect();
        deliver(core, connected_msg(connection_id));
    }

    #[test]
    fn connect_opens_transport_and_becomes_connected() {
        let (mut core, transport) = new_core(options());
        let mut changes = core.connection_events.on(None);
        connect(&mut core, "conn-1");

        assert_eq!(core.connection.state, ConnectionState::Connected);
        assert_eq!(core.connection.id.as_deref(), Some("conn-1"));
        assert_eq!(transport.opened().len(), 1);
        assert!(transport.opened()[0].resume.is_none());

        let first = changes.try_next().unwrap();
        assert_eq!(first.current, ConnectionState::Connecting);
        let second = changes.try_next().unwrap();
        assert_eq!(second.previous, ConnectionState::Connecting);
        assert_eq!(second.current, ConnectionState::Connected);
    }

    #[test]
    fn stale_generation_events_are_dropped() {
        let (mut core, _transport) = new_core(options());
        core.connect();
        let stale = core.connection.generation - 1;
        core.handle_transport_event(stale, TransportEvent::Message(connected_msg("conn-1")));
        assert_eq!(core.connection.state, ConnectionState::Connecting);
    }

    #[test]
    fn transport_loss_schedules_retry_with_backoff() {
        let (mut core, transport) = new_core(options());
        connect(&mut core, "conn-1");
        let mut changes = core.connection_events.on(Some(ConnectionState::Disconnected));
        let generation = core.connection.generation;
        core.handle_transport_event(generation, TransportEvent::Closed(None));

        assert_eq!(core.connection.state, ConnectionState::Disconnected);
        let change = changes.try_next().unwrap();
        let retry_in = change.retry_in.unwrap();
        let initial = core.options.timing.disconnected_retry_timeout;
        assert!(retry_in <= initial && retry_in >= initial.mul_f64(0.8));
        assert_eq!(change.reason.unwrap().code, error_code::DISCONNECTED);

        // The retry reopens the link and asks to resume the session.
        let deadline = core.next_deadline().unwrap();
        core.on_timer(deadline);
        assert_eq!(core.connection.state, ConnectionState::Connecting);
        let opened = transport.opened();
        assert_eq!(opened.len(), 2);
        assert_eq!(opened[1].resume.as_deref(), Some("conn-1!key"));
    }

    #[test]
    fn retries_exhausted_escalate_to_suspended() {
        let mut opts = options();
        opts.timing.max_disconnected_attempts = 2;
        let (mut core, _transport) = new_core(opts);
        connect(&mut core, "conn-1");
        for _ in 0..2 {
            let generation = core.connection.generation;
            core.handle_transport_event(generation, TransportEvent::Closed(None));
            assert_eq!(core.connection.state, ConnectionState::Disconnected);
            let deadline = core.next_deadline().unwrap();
            core.on_timer(deadline);
        }
        let generation = core.connection.generation;
        core.handle_transport_event(generation, TransportEvent::Closed(None));
        assert_eq!(core.connection.state, ConnectionState::Suspended);
        assert_eq!(
            core.connection.error_reason.as_ref().map(|e| e.code),
            Some(error_code::SUSPENDED)
        );
    }

    #[test]
    fn non_retriable_disconnected_fails_connection() {
        let (mut core, _transport) = new_core(options());
        connect(&mut core, "conn-1");
        deliver(
            &mut core,
            ProtocolMessage {
                action: action::DISCONNECTED,
                error: Some(ErrorInfo::new(40142, Some(401), "Token expired")),
                ..Default::default()
            },
        );
        assert_eq!(core.connection.state, ConnectionState::Failed);
        assert_eq!(core.connection.error_reason.as_ref().map(|e| e.code), Some(40142));
    }

    #[test]
    fn connect_timeout_disconnects() {
        let (mut core, _transport) = new_core(options());
        core.connect();
        let deadline = core.next_deadline().unwrap();
        core.on_timer(deadline);
        assert_eq!(core.connection.state, ConnectionState::Disconnected);
        assert_eq!(
            core.connection.error_reason.as_ref().map(|e| e.code),
            Some(error_code::TIMEOUT)
        );
    }

    #[test]
    fn idle_link_is_treated_as_lost() {
        let (mut core, _transport) = new_core(options());
        connect(&mut core, "conn-1");
        let (deadline, timer) = core.connection.timer.unwrap();
        assert_eq!(timer, ConnectionTimer::Idle);
        core.on_timer(deadline);
        assert_eq!(core.connection.state, ConnectionState::Disconnected);
    }

    #[test]
    fn close_sends_close_and_waits_for_closed() {
        let (mut core, transport) = new_core(options());
        connect(&mut core, "conn-1");
        let closes = transport.closes();
        core.close();
        assert_eq!(core.connection.state, ConnectionState::Closing);
        assert_eq!(transport.sent_actions().last(), Some(&action::CLOSE));
        assert_eq!(transport.closes(), closes);

        deliver(
            &mut core,
            ProtocolMessage {
                action: action::CLOSED,
                ..Default::default()
            },
        );
        assert_eq!(core.connection.state, ConnectionState::Closed);
        assert!(core.connection.id.is_none());
        assert_eq!(transport.closes(), closes + 1);
    }

    #[test]
    fn close_without_link_is_immediate() {
        let (mut core, transport) = new_core(options());
        core.close();
        assert_eq!(core.connection.state, ConnectionState::Closed);
        assert!(transport.sent().is_empty());
    }

    #[tokio::test]
    async fn ack_and_nack_resolve_pending_operations() {
        let (mut core, _transport) = new_core(options());
        connect(&mut core, "conn-1");
        let (r0, c0) = crate::queue::completion();
        let (r1, c1) = crate::queue::completion();
        core.send_with_ack(build_attach_msg("a", None, None), r0);
        core.send_with_ack(build_attach_msg("b", None, None), r1);

        deliver(
            &mut core,
            ProtocolMessage {
                action: action::ACK,
                msg_serial: Some(0),
                count: Some(1),
                ..Default::default()
            },
        );
        deliver(
            &mut core,
            ProtocolMessage {
                action: action::NACK,
                msg_serial: Some(1),
                count: Some(1),
                error: Some(ErrorInfo::new(40160, Some(401), "not permitted")),
                ..Default::default()
            },
        );
        assert!(c0.await.is_ok());
        assert_eq!(c1.await.unwrap_err().code(), Some(40160));
    }

    #[test]
    fn resumed_connection_resends_pending_with_same_serials() {
        let (mut core, transport) = new_core(options());
        connect(&mut core, "conn-1");
        let (responder, mut completion) = crate::queue::completion();
        core.send_with_ack(build_attach_msg("a", None, None), responder);
        let generation = core.connection.generation;
        core.handle_transport_event(generation, TransportEvent::Closed(None));
        let deadline = core.next_deadline().unwrap();
        core.on_timer(deadline);
        transport.clear_sent();

        deliver(&mut core, connected_msg("conn-1"));
        let sent = transport.sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].msg_serial, Some(0));
        assert!((&mut completion).now_or_never().is_none());
        assert_eq!(core.pending_acks.len(), 1);
    }

    #[test]
    fn connection_state_filtered_listener() {
        let (mut core, _transport) = new_core(options());
        let mut only_connected = core.connection_events.on(Some(ConnectionState::Connected));
        connect(&mut core, "conn-1");
        assert_eq!(
            only_connected.try_next().map(|c| c.current),
            Some(ConnectionState::Connected)
        );
        assert!(only_connected.try_next().is_none());
        assert!(core.channels.values().all(|c| c.state == ChannelState::Initialized));
    }
}
