//! Outbound message queues and operation completion.

use std::collections::VecDeque;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use tokio::sync::oneshot;

use crate::Error;
use crate::protocol::{ErrorInfo, ProtocolMessage};

/// Resolves once a presence or channel operation succeeds or fails.
///
/// Every operation resolves exactly once. If the client shuts down first it
/// resolves with [`Error::ClientClosed`].
#[derive(Debug)]
#[must_use = "the operation result is only observable by awaiting the completion"]
pub struct Completion {
    rx: oneshot::Receiver<Result<(), Error>>,
}

impl Future for Completion {
    type Output = Result<(), Error>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.rx)
            .poll(cx)
            .map(|r| r.unwrap_or_else(|_| Err(Error::ClientClosed)))
    }
}

/// Sending half of a [`Completion`].
#[derive(Debug)]
pub(crate) enum Responder {
    Caller(oneshot::Sender<Result<(), Error>>),
    /// Automatic re-entry of a local member; nobody awaits it, failures are logged.
    Reentry { channel: String, client_id: String },
}

impl Responder {
    pub fn reentry(channel: &str, client_id: &str) -> Self {
        Responder::Reentry {
            channel: channel.to_string(),
            client_id: client_id.to_string(),
        }
    }

    pub fn resolve(self, result: Result<(), Error>) {
        match self {
            Responder::Caller(tx) => {
                // The caller may have dropped the completion.
                let _ = tx.send(result);
            }
            Responder::Reentry { channel, client_id } => {
                if let Err(e) = result {
                    tracing::warn!(channel = %channel, client_id = %client_id, "Presence re-entry failed: {e}");
                }
            }
        }
    }

    pub fn succeed(self) {
        self.resolve(Ok(()));
    }

    pub fn fail(self, error: &Arc<ErrorInfo>) {
        self.resolve(Err(Error::Ably(Arc::clone(error))));
    }
}

pub(crate) fn completion() -> (Responder, Completion) {
    let (tx, rx) = oneshot::channel();
    (Responder::Caller(tx), Completion { rx })
}

// ---------------------------------------------------------------------------
// Per-channel queue
// ---------------------------------------------------------------------------

#[derive(Debug)]
pub(crate) struct QueuedMessage {
    pub message: ProtocolMessage,
    pub responder: Responder,
}

/// FIFO of messages waiting for their channel to attach or the connection to
/// come back.
#[derive(Debug, Default)]
pub(crate) struct MessageQueue {
    entries: VecDeque<QueuedMessage>,
}

impl MessageQueue {
    pub fn enqueue(&mut self, message: ProtocolMessage, responder: Responder) {
        self.entries.push_back(QueuedMessage { message, responder });
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Remove every entry in submission order.
    pub fn drain(&mut self) -> impl Iterator<Item = QueuedMessage> + '_ {
        self.entries.drain(..)
    }

    /// Resolve every entry with `error` and empty the queue.
    pub fn fail_all(&mut self, error: &Arc<ErrorInfo>) {
        for entry in self.entries.drain(..) {
            entry.responder.fail(error);
        }
    }
}

// ---------------------------------------------------------------------------
// Connection-wide ACK tracking
// ---------------------------------------------------------------------------

#[derive(Debug)]
pub(crate) struct PendingMessage {
    pub msg_serial: i64,
    pub message: ProtocolMessage,
    pub responder: Responder,
}

/// Messages transmitted but not yet acknowledged, ordered by `msg_serial`.
#[derive(Debug, Default)]
pub(crate) struct PendingAcks {
    entries: VecDeque<PendingMessage>,
}

impl PendingAcks {
    pub fn push(&mut self, msg_serial: i64, message: ProtocolMessage, responder: Responder) {
        self.entries.push_back(PendingMessage {
            msg_serial,
            message,
            responder,
        });
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Resolve serials `[msg_serial, msg_serial + count)` successfully.
    pub fn ack(&mut self, msg_serial: i64, count: i64) {
        for entry in self.take_range(msg_serial, count) {
            entry.responder.succeed();
        }
    }

    /// Resolve serials `[msg_serial, msg_serial + count)` with `error`.
    pub fn nack(&mut self, msg_serial: i64, count: i64, error: &Arc<ErrorInfo>) {
        for entry in self.take_range(msg_serial, count) {
            entry.responder.fail(error);
        }
    }

    pub fn fail_all(&mut self, error: &Arc<ErrorInfo>) {
        for entry in self.entries.drain(..) {
            entry.responder.fail(error);
        }
    }

    /// Fail the entries published on `channel` only.
    pub fn fail_channel(&mut self, channel: &str, error: &Arc<ErrorInfo>) {
        let (failed, kept): (VecDeque<_>, VecDeque<_>) = self
            .entries
            .drain(..)
            .partition(|e| e.message.channel.as_deref() == Some(channel));
        self.entries = kept;
        for entry in failed {
            entry.responder.fail(error);
        }
    }

    /// Remove everything, for re-sending on a new transport.
    pub fn take_all(&mut self) -> Vec<PendingMessage> {
        self.entries.drain(..).collect()
    }

    fn take_range(&mut self, msg_serial: i64, count: i64) -> Vec<PendingMessage> {
        let end = msg_serial.saturating_add(count.max(1));
        let (taken, kept): (Vec<_>, Vec<_>) = self
            .entries
            .drain(..)
            .partition(|e| e.msg_serial >= msg_serial && e.msg_serial < end);
        self.entries = kept.into();
        taken
    }
}
