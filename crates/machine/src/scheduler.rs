//! Deferred delivery collaborator.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use thiserror::Error;
use tracing::debug;

use sagaflow_core::TokenId;

use crate::bus::OutboundMessage;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SchedulerError {
    #[error("scheduler unavailable: {0}")]
    Unavailable(String),
}

/// Schedules messages for later delivery and cancels them by token.
///
/// If the message already carries a `scheduling_token`, implementations must
/// schedule it under that token; otherwise they assign a fresh one. The
/// delivered message carries its token so stale deliveries can be detected.
///
/// Cancelling an unknown or already-delivered token is not an error.
pub trait MessageScheduler: Send + Sync {
    fn schedule_at(&self, at: DateTime<Utc>, message: OutboundMessage) -> Result<TokenId, SchedulerError>;

    fn cancel(&self, token: TokenId) -> Result<(), SchedulerError>;
}

impl<S> MessageScheduler for Arc<S>
where
    S: MessageScheduler + ?Sized,
{
    fn schedule_at(&self, at: DateTime<Utc>, message: OutboundMessage) -> Result<TokenId, SchedulerError> {
        (**self).schedule_at(at, message)
    }

    fn cancel(&self, token: TokenId) -> Result<(), SchedulerError> {
        (**self).cancel(token)
    }
}

/// A message waiting for its delivery time.
#[derive(Debug, Clone, PartialEq)]
pub struct ScheduledMessage {
    pub token: TokenId,
    pub deliver_at: DateTime<Utc>,
    pub message: OutboundMessage,
}

/// In-memory scheduler for tests/dev.
///
/// Nothing is delivered on its own; callers drain due messages with
/// [`InMemoryScheduler::take_due`] and feed them back into the pipeline.
#[derive(Debug, Default)]
pub struct InMemoryScheduler {
    pending: Mutex<BTreeMap<TokenId, ScheduledMessage>>,
}

impl InMemoryScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of every message still scheduled, ordered by delivery time.
    pub fn pending(&self) -> Vec<ScheduledMessage> {
        let mut out: Vec<_> = match self.pending.lock() {
            Ok(pending) => pending.values().cloned().collect(),
            Err(_) => Vec::new(),
        };
        out.sort_by_key(|m| m.deliver_at);
        out
    }

    pub fn contains(&self, token: TokenId) -> bool {
        self.pending
            .lock()
            .map(|pending| pending.contains_key(&token))
            .unwrap_or(false)
    }

    pub fn len(&self) -> usize {
        self.pending.lock().map(|pending| pending.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Remove and return every message due at or before `now`.
    pub fn take_due(&self, now: DateTime<Utc>) -> Vec<ScheduledMessage> {
        let Ok(mut pending) = self.pending.lock() else {
            return Vec::new();
        };
        let due: Vec<TokenId> = pending
            .values()
            .filter(|m| m.deliver_at <= now)
            .map(|m| m.token)
            .collect();
        let mut out: Vec<_> = due.iter().filter_map(|t| pending.remove(t)).collect();
        out.sort_by_key(|m| m.deliver_at);
        out
    }
}

impl MessageScheduler for InMemoryScheduler {
    fn schedule_at(&self, at: DateTime<Utc>, mut message: OutboundMessage) -> Result<TokenId, SchedulerError> {
        let token = message.scheduling_token.unwrap_or_else(TokenId::new);
        message.scheduling_token = Some(token);

        let mut pending = self
            .pending
            .lock()
            .map_err(|_| SchedulerError::Unavailable("scheduler lock poisoned".into()))?;
        debug!(token = %token, deliver_at = %at, message_type = %message.message_type, "message scheduled");
        pending.insert(
            token,
            ScheduledMessage {
                token,
                deliver_at: at,
                message,
            },
        );
        Ok(token)
    }

    fn cancel(&self, token: TokenId) -> Result<(), SchedulerError> {
        let mut pending = self
            .pending
            .lock()
            .map_err(|_| SchedulerError::Unavailable("scheduler lock poisoned".into()))?;
        if pending.remove(&token).is_some() {
            debug!(token = %token, "scheduled message cancelled");
        }
        Ok(())
    }
}
