//! Saga instance: the persisted record of one workflow execution.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::error::{CoreError, CoreResult};
use crate::id::{CorrelationId, RequestId, TokenId};
use crate::state::State;

/// Bounds every user-defined saga payload must satisfy.
///
/// `Default` supplies the payload of a freshly initiated instance; activities
/// in the `Initial` state fill it in from the first message.
pub trait SagaData: Clone + core::fmt::Debug + Default + Send + Sync + 'static {}

impl<T> SagaData for T where T: Clone + core::fmt::Debug + Default + Send + Sync + 'static {}

/// Optimistic concurrency expectation for a stored instance.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ExpectedVersion {
    /// Skip version checking.
    Any,
    /// Require the stored instance to be at an exact version.
    Exact(u64),
}

impl ExpectedVersion {
    pub fn matches(self, actual: u64) -> bool {
        match self {
            ExpectedVersion::Any => true,
            ExpectedVersion::Exact(v) => v == actual,
        }
    }

    pub fn check(self, actual: u64) -> CoreResult<()> {
        if self.matches(actual) {
            Ok(())
        } else {
            Err(CoreError::conflict(format!(
                "optimistic concurrency check failed (expected: {self:?}, actual: {actual})"
            )))
        }
    }
}

/// One saga instance.
///
/// The runtime owns `correlation_id`, `current_state`, `version` and the
/// request/schedule slots; user code only reaches `data`. The version starts
/// at zero and every successful write through a repository raises it by one.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SagaInstance<D> {
    correlation_id: CorrelationId,
    current_state: State,
    version: u64,
    #[serde(default)]
    requests: BTreeMap<String, RequestId>,
    #[serde(default)]
    schedules: BTreeMap<String, TokenId>,
    data: D,
}

impl<D> SagaInstance<D> {
    /// A fresh, never-persisted instance positioned at `Initial`.
    pub fn new(correlation_id: CorrelationId, data: D) -> Self {
        Self {
            correlation_id,
            current_state: State::INITIAL,
            version: 0,
            requests: BTreeMap::new(),
            schedules: BTreeMap::new(),
            data,
        }
    }

    pub fn correlation_id(&self) -> CorrelationId {
        self.correlation_id
    }

    pub fn current_state(&self) -> &State {
        &self.current_state
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn data(&self) -> &D {
        &self.data
    }

    pub fn data_mut(&mut self) -> &mut D {
        &mut self.data
    }

    pub fn into_data(self) -> D {
        self.data
    }

    /// Move the instance to `state`. Only the engine's transition activity calls this.
    pub fn set_current_state(&mut self, state: State) {
        self.current_state = state;
    }

    /// Raise the version by one and return the new value.
    ///
    /// Repositories call this after a successful write, never before.
    pub fn increment_version(&mut self) -> u64 {
        self.version += 1;
        self.version
    }

    /// Pending request identifier stored in the named request slot.
    pub fn request_id(&self, request: &str) -> Option<RequestId> {
        self.requests.get(request).copied()
    }

    pub fn set_request_id(&mut self, request: &str, request_id: Option<RequestId>) {
        match request_id {
            Some(id) => {
                self.requests.insert(request.to_string(), id);
            }
            None => {
                self.requests.remove(request);
            }
        }
    }

    /// Token of the outstanding scheduled message in the named schedule slot.
    pub fn schedule_token(&self, schedule: &str) -> Option<TokenId> {
        self.schedules.get(schedule).copied()
    }

    pub fn set_schedule_token(&mut self, schedule: &str, token: Option<TokenId>) {
        match token {
            Some(token) => {
                self.schedules.insert(schedule.to_string(), token);
            }
            None => {
                self.schedules.remove(schedule);
            }
        }
    }

    pub fn pending_requests(&self) -> impl Iterator<Item = (&str, RequestId)> {
        self.requests.iter().map(|(name, id)| (name.as_str(), *id))
    }

    pub fn pending_schedules(&self) -> impl Iterator<Item = (&str, TokenId)> {
        self.schedules.iter().map(|(name, token)| (name.as_str(), *token))
    }
}
