//! Connection state machine: connect, resume, retry, suspend, close, fail.

use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;

use crate::backoff;
use crate::client::ClientCore;
use crate::protocol::{ErrorInfo, ProtocolMessage, build_close_msg, error_code};
use crate::transport::{ConnectParams, TransportSink};
use crate::types::{ChannelState, ConnectionState, ConnectionStateChange};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ConnectionTimer {
    ConnectTimeout,
    Idle,
    Retry,
    CloseTimeout,
}

pub(crate) struct Connection {
    pub state: ConnectionState,
    pub id: Option<String>,
    pub key: Option<String>,
    pub error_reason: Option<Arc<ErrorInfo>>,
    pub connection_state_ttl: Duration,
    pub max_idle_interval: Duration,
    pub disconnected_at: Option<Instant>,
    pub retry_attempts: u32,
    pub msg_serial: i64,
    /// Bumped for every link; events from older links are dropped.
    pub generation: u64,
    pub timer: Option<(Instant, ConnectionTimer)>,
}

impl Connection {
    pub fn new(connection_state_ttl: Duration, max_idle_interval: Duration) -> Self {
        Self {
            state: ConnectionState::Initialized,
            id: None,
            key: None,
            error_reason: None,
            connection_state_ttl,
            max_idle_interval,
            disconnected_at: None,
            retry_attempts: 0,
            msg_serial: 0,
            generation: 0,
            timer: None,
        }
    }

    pub fn update_from_connected(&mut self, msg: &ProtocolMessage) {
        self.id = msg.connection_id.clone();
        if let Some(ref key) = msg.connection_key {
            self.key = Some(key.clone());
        }

        if let Some(ref details) = msg.connection_details {
            if let Some(ref key) = details.connection_key {
                self.key = Some(key.clone());
            }
            if let Some(ttl) = details.connection_state_ttl {
                self.connection_state_ttl = Duration::from_millis(ttl.max(0) as u64);
            }
            if let Some(idle) = details.max_idle_interval {
                self.max_idle_interval = Duration::from_millis(idle.max(0) as u64);
            }
        }
    }

    /// A previous session may be resumed while its state TTL has not elapsed.
    pub fn can_resume(&self, now: Instant) -> bool {
        self.key.is_some()
            && self
                .disconnected_at
                .is_none_or(|at| now.duration_since(at) < self.connection_state_ttl)
    }

    pub fn next_msg_serial(&mut self) -> i64 {
        let serial = self.msg_serial;
        self.msg_serial += 1;
        serial
    }

    pub fn is_connected(&self) -> bool {
        self.state == ConnectionState::Connected
    }
}

/// Edges of the connection state machine. `Connected → Connected` is a
/// CONNECTED update on a live link.
pub(crate) fn can_transition(from: ConnectionState, to: ConnectionState) -> bool {
    use ConnectionState::*;
    match (from, to) {
        (_, Failed) => from != Failed,
        (Initialized, Connecting | Closed) => true,
        (Connecting, Connected | Disconnected | Suspended | Closed) => true,
        (Connected, Connected | Disconnected | Suspended | Closing) => true,
        (Disconnected, Connecting | Suspended | Closed) => true,
        (Suspended | Failed, Connecting | Closed) => true,
        (Closing, Closed) => true,
        (Closed, Connecting) => true,
        _ => false,
    }
}

/// Mirrors ably-js `isRetriable()` from `connectionerrors.ts`.
///
/// An error is retriable when it has no status code, is a server error (5xx),
/// or carries a well-known connection error code even at 4xx.
pub(crate) fn is_retriable(err: &ErrorInfo) -> bool {
    const CONNECTION_ERROR_CODES: &[i32] = &[
        80003, // DISCONNECTED
        80002, // SUSPENDED
        80000, // FAILED
        80017, // CLOSING / CLOSED
        50002, // UNKNOWN_CONNECTION_ERR
        50001, // UNKNOWN_CHANNEL_ERR
    ];
    match err.status_code {
        None => true,
        Some(sc) if sc >= 500 => true,
        Some(_) => CONNECTION_ERROR_CODES.contains(&err.code),
    }
}

/// Error for a presence or channel operation refused because of the
/// connection state.
pub(crate) fn connection_state_error(state: ConnectionState) -> ErrorInfo {
    let (code, status) = match state {
        ConnectionState::Initialized => (error_code::BAD_REQUEST, 400),
        ConnectionState::Connecting | ConnectionState::Disconnected => {
            (error_code::DISCONNECTED, 400)
        }
        ConnectionState::Suspended => (error_code::SUSPENDED, 400),
        ConnectionState::Closing | ConnectionState::Closed => (error_code::CLOSED, 400),
        ConnectionState::Failed | ConnectionState::Connected => (error_code::FAILED, 400),
    };
    ErrorInfo::new(code, Some(status), format!("connection is {state}"))
}

impl ClientCore {
    fn set_connection_state(
        &mut self,
        to: ConnectionState,
        reason: Option<Arc<ErrorInfo>>,
        retry_in: Option<Duration>,
    ) -> bool {
        let from = self.connection.state;
        if !can_transition(from, to) {
            tracing::warn!(%from, %to, "Ignoring invalid connection state transition");
            return false;
        }
        if from != to {
            tracing::info!(%from, %to, reason = ?reason.as_deref().map(|r| r.to_string()), "Connection state changed");
        }
        self.connection.state = to;
        if reason.is_some() || matches!(to, ConnectionState::Connected | ConnectionState::Closed) {
            self.connection.error_reason.clone_from(&reason);
        }
        let change = ConnectionStateChange {
            previous: from,
            current: to,
            reason,
            retry_in,
        };
        self.connection_events.emit(to, &change);
        true
    }

    /// Replace the current link (if any) with a new one, so stale events are dropped.
    fn drop_link(&mut self) {
        self.transport.close();
        self.connection.generation += 1;
    }

    pub(crate) fn connect(&mut self) {
        match self.connection.state {
            ConnectionState::Connecting | ConnectionState::Connected | ConnectionState::Closing => {
                tracing::debug!(state = %self.connection.state, "connect() ignored");
            }
            _ => self.start_connecting(),
        }
    }

    fn start_connecting(&mut self) {
        if !self.set_connection_state(ConnectionState::Connecting, None, None) {
            return;
        }
        let now = Instant::now();
        let resume = if self.connection.can_resume(now) {
            self.connection.key.clone()
        } else {
            None
        };
        self.drop_link();
        let params = ConnectParams {
            host: self.options.realtime_host().to_string(),
            tls: self.options.tls,
            key: self.options.key.clone(),
            token: self.options.token.clone(),
            client_id: self.options.client_id.clone(),
            echo: self.options.echo_messages,
            resume,
            extra: self.options.transport_params.clone(),
        };
        let sink = TransportSink::new(self.connection.generation, self.events_tx.clone());
        self.transport.open(params, sink);
        self.connection.timer = Some((
            now + self.options.timing.connect_timeout,
            ConnectionTimer::ConnectTimeout,
        ));
    }

    pub(crate) fn reset_idle_timer(&mut self) {
        if self.connection.is_connected() {
            let timeout = self.connection.max_idle_interval + self.options.timing.heartbeat_margin;
            self.connection.timer = Some((Instant::now() + timeout, ConnectionTimer::Idle));
        }
    }

    pub(crate) fn on_connected(&mut self, msg: ProtocolMessage) {
        if !matches!(
            self.connection.state,
            ConnectionState::Connecting | ConnectionState::Connected
        ) {
            tracing::debug!(state = %self.connection.state, "Ignoring CONNECTED");
            return;
        }
        let previous_id = self.connection.id.clone();
        self.connection.update_from_connected(&msg);
        let resumed = msg.error.is_none()
            && previous_id.is_some()
            && previous_id == self.connection.id;
        let was_connected = self.connection.is_connected();

        self.connection.retry_attempts = 0;
        self.connection.disconnected_at = None;
        let reason = msg.error.map(Arc::new);
        self.set_connection_state(ConnectionState::Connected, reason, None);
        self.reset_idle_timer();

        if was_connected {
            // Update on a live link: nothing to re-establish.
            return;
        }
        tracing::info!(
            connection_id = ?self.connection.id,
            resumed,
            "Connected",
        );

        if !resumed {
            self.connection.msg_serial = 0;
        }
        self.resend_pending(resumed);

        let names: Vec<String> = self.channels.keys().cloned().collect();
        for name in names {
            self.on_connection_established(&name, resumed);
        }
    }

    /// Re-send unacknowledged messages, in order, on the new link.
    fn resend_pending(&mut self, resumed: bool) {
        for pending in self.pending_acks.take_all() {
            let mut message = pending.message;
            let serial = if resumed {
                pending.msg_serial
            } else {
                self.connection.next_msg_serial()
            };
            message.msg_serial = Some(serial);
            self.transmit(&message);
            self.pending_acks.push(serial, message, pending.responder);
        }
    }

    pub(crate) fn on_disconnected_msg(&mut self, error: Option<ErrorInfo>) {
        if let Some(ref err) = error
            && !is_retriable(err)
        {
            self.fail_connection(Arc::new(err.clone()));
            return;
        }
        let reason = error.unwrap_or_else(|| {
            ErrorInfo::new(error_code::DISCONNECTED, None, "disconnected by server")
        });
        self.handle_disconnect(Arc::new(reason));
    }

    pub(crate) fn on_transport_closed(&mut self, error: Option<ErrorInfo>) {
        match self.connection.state {
            ConnectionState::Connecting | ConnectionState::Connected => {
                let reason = error.unwrap_or_else(|| {
                    ErrorInfo::new(error_code::DISCONNECTED, None, "connection lost")
                });
                self.handle_disconnect(Arc::new(reason));
            }
            ConnectionState::Closing => self.finish_close(),
            state => tracing::debug!(%state, "Ignoring transport close"),
        }
    }

    /// Link lost: schedule a retry, or escalate to SUSPENDED once retries are
    /// exhausted or the state TTL has elapsed.
    pub(crate) fn handle_disconnect(&mut self, reason: Arc<ErrorInfo>) {
        self.drop_link();
        let now = Instant::now();
        let disconnected_at = *self.connection.disconnected_at.get_or_insert(now);
        self.connection.retry_attempts += 1;
        let attempts = self.connection.retry_attempts;

        let timing = &self.options.timing;
        if attempts > timing.max_disconnected_attempts
            || now.duration_since(disconnected_at) >= self.connection.connection_state_ttl
        {
            tracing::warn!(attempts, "Giving up on resume, suspending connection");
            self.enter_suspended();
            return;
        }

        let delay = backoff::retry_delay(timing.disconnected_retry_timeout, attempts, &mut self.rng);
        if !self.set_connection_state(
            ConnectionState::Disconnected,
            Some(Arc::clone(&reason)),
            Some(delay),
        ) {
            return;
        }
        tracing::warn!(attempts, ?delay, "Disconnected: {reason}");
        self.connection.timer = Some((now + delay, ConnectionTimer::Retry));

        if !self.options.queue_messages {
            for channel in self.channels.values_mut() {
                channel.queue.fail_all(&reason);
            }
        }
    }

    fn enter_suspended(&mut self) {
        let reason = Arc::new(ErrorInfo::new(
            error_code::SUSPENDED,
            None,
            "connection to server unavailable",
        ));
        let retry_in = self.options.timing.suspended_retry_timeout;
        if !self.set_connection_state(
            ConnectionState::Suspended,
            Some(Arc::clone(&reason)),
            Some(retry_in),
        ) {
            return;
        }
        self.connection.timer = Some((Instant::now() + retry_in, ConnectionTimer::Retry));
        self.pending_acks.fail_all(&reason);

        let names: Vec<String> = self.channels.keys().cloned().collect();
        for name in names {
            let state = self.channels.get(&name).map(|c| c.state);
            match state {
                Some(ChannelState::Attached | ChannelState::Attaching) => {
                    self.suspend_channel(&name, Arc::clone(&reason), false);
                }
                Some(_) => {
                    if let Some(channel) = self.channels.get_mut(&name) {
                        channel.queue.fail_all(&reason);
                    }
                }
                None => {}
            }
        }
    }

    /// Fatal connection error: every queued and pending operation, and every
    /// active channel, fails with the same `error`.
    pub(crate) fn fail_connection(&mut self, error: Arc<ErrorInfo>) {
        self.drop_link();
        if !self.set_connection_state(ConnectionState::Failed, Some(Arc::clone(&error)), None) {
            return;
        }
        tracing::error!("Connection failed: {error}");
        self.connection.timer = None;
        self.connection.id = None;
        self.connection.key = None;
        self.connection.disconnected_at = None;
        self.pending_acks.fail_all(&error);

        let names: Vec<String> = self.channels.keys().cloned().collect();
        for name in names {
            let state = self.channels.get(&name).map(|c| c.state);
            match state {
                Some(
                    ChannelState::Attaching
                    | ChannelState::Attached
                    | ChannelState::Detaching
                    | ChannelState::Suspended,
                ) => self.fail_channel(&name, Arc::clone(&error)),
                Some(_) => {
                    if let Some(channel) = self.channels.get_mut(&name) {
                        channel.queue.fail_all(&error);
                    }
                }
                None => {}
            }
        }
    }

    pub(crate) fn close(&mut self) {
        match self.connection.state {
            ConnectionState::Closing | ConnectionState::Closed => {}
            ConnectionState::Connected => {
                self.set_connection_state(ConnectionState::Closing, None, None);
                self.transmit(&build_close_msg());
                self.connection.timer = Some((
                    Instant::now() + self.options.timing.realtime_request_timeout,
                    ConnectionTimer::CloseTimeout,
                ));
            }
            _ => self.finish_close(),
        }
    }

    pub(crate) fn finish_close(&mut self) {
        self.drop_link();
        if !self.set_connection_state(ConnectionState::Closed, None, None) {
            return;
        }
        self.connection.timer = None;
        self.connection.id = None;
        self.connection.key = None;
        self.connection.disconnected_at = None;
        self.connection.retry_attempts = 0;

        let error = Arc::new(ErrorInfo::new(error_code::CLOSED, None, "connection closed"));
        self.pending_acks.fail_all(&error);
        let names: Vec<String> = self.channels.keys().cloned().collect();
        for name in names {
            self.detach_on_close(&name, &error);
        }
    }

    pub(crate) fn on_connection_timer(&mut self, timer: ConnectionTimer) {
        self.connection.timer = None;
        match timer {
            ConnectionTimer::ConnectTimeout => {
                tracing::warn!("Connect timeout");
                self.handle_disconnect(Arc::new(ErrorInfo::new(
                    error_code::TIMEOUT,
                    None,
                    "timed out waiting for CONNECTED",
                )));
            }
            ConnectionTimer::Idle => {
                tracing::warn!("Heartbeat timeout");
                self.handle_disconnect(Arc::new(ErrorInfo::new(
                    error_code::DISCONNECTED,
                    None,
                    "no activity from server within max idle interval",
                )));
            }
            ConnectionTimer::Retry => {
                tracing::info!(attempt = self.connection.retry_attempts, "Reconnecting");
                self.start_connecting();
            }
            ConnectionTimer::CloseTimeout => {
                tracing::warn!("No CLOSED from server, closing anyway");
                self.finish_close();
            }
        }
    }
}
