//! Live log subscribers and best-effort fan-out.
//!
//! A [`SubscriberSet`] holds the subscribers of one service in registration
//! order. [`SubscriberSet::publish`] hands every line to each of them in turn;
//! a subscriber that refuses the line (closed channel, full queue, panic) is
//! logged and skipped, never removed and never reported to the publisher.
//! Pruning dead subscribers is left to whoever registered them.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use thiserror::Error;
use tokio::sync::mpsc;
use tracing::warn;

/// Why a line could not be handed to a subscriber.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DeliveryError {
    #[error("subscriber disconnected")]
    Closed,
    #[error("subscriber queue full")]
    Full,
    #[error("{0}")]
    Other(String),
}

/// Anything that can receive pushed log lines.
///
/// `deliver` is called while the supervisor lock is held, so it must not
/// block and must not call back into the supervisor.
pub trait LogSink: Send + Sync {
    fn deliver(&self, line: &str) -> Result<(), DeliveryError>;
}

impl LogSink for mpsc::UnboundedSender<String> {
    fn deliver(&self, line: &str) -> Result<(), DeliveryError> {
        self.send(line.to_owned()).map_err(|_| DeliveryError::Closed)
    }
}

impl LogSink for mpsc::Sender<String> {
    fn deliver(&self, line: &str) -> Result<(), DeliveryError> {
        self.try_send(line.to_owned()).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => DeliveryError::Full,
            mpsc::error::TrySendError::Closed(_) => DeliveryError::Closed,
        })
    }
}

/// Handle returned on subscribe, used to unsubscribe later.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriberId(pub(crate) u64);

impl std::fmt::Display for SubscriberId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{}", self.0)
    }
}

#[derive(Default)]
pub struct SubscriberSet {
    subs: Vec<(SubscriberId, Arc<dyn LogSink>)>,
}

impl SubscriberSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, id: SubscriberId, sink: Arc<dyn LogSink>) {
        self.subs.push((id, sink));
    }

    pub fn remove(&mut self, id: SubscriberId) -> bool {
        let before = self.subs.len();
        self.subs.retain(|(sid, _)| *sid != id);
        self.subs.len() != before
    }

    /// Push `line` to every subscriber in registration order.
    ///
    /// Returns how many subscribers accepted the line.
    pub fn publish(&self, service: &str, line: &str) -> usize {
        let mut delivered = 0;
        for (id, sink) in &self.subs {
            match catch_unwind(AssertUnwindSafe(|| sink.deliver(line))) {
                Ok(Ok(())) => delivered += 1,
                Ok(Err(e)) => {
                    warn!(service = %service, subscriber = %id, error = %e, "log delivery failed");
                }
                Err(_) => {
                    warn!(service = %service, subscriber = %id, "log subscriber panicked");
                }
            }
        }
        delivered
    }

    pub fn len(&self) -> usize {
        self.subs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.subs.is_empty()
    }
}
