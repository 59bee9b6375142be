//! Futures for in-flight requests

use crate::connection::ConnectionInner;
use crate::value::Value;
use crate::{Result, RpcError};
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::debug;

/// Lifecycle of an [`AsyncResult`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AsyncState {
    /// No response yet
    Pending,
    /// The request returned a value
    Ready,
    /// The request failed
    Error,
    /// The wait deadline passed first; terminal
    Expired,
}

type Callback = Box<dyn FnOnce(&Result<Value>) + Send>;

enum Slot {
    Pending(Vec<Callback>),
    Ready(Value),
    Error(RpcError),
    Expired(Duration),
}

impl Slot {
    fn outcome(&self) -> Option<Result<Value>> {
        match self {
            Slot::Pending(_) => None,
            Slot::Ready(value) => Some(Ok(value.clone())),
            Slot::Error(err) => Some(Err(err.clone())),
            Slot::Expired(duration) => Some(Err(RpcError::Timeout { duration: *duration })),
        }
    }
}

struct Shared {
    conn: Weak<ConnectionInner>,
    slot: Mutex<Slot>,
    notify: Notify,
}

/// The eventual result of a request sent with `async_request`.
///
/// Resolution happens on whichever task is reading the connection at the
/// time, which may be the task calling [`AsyncResult::wait`]. Clones share
/// the same slot.
#[derive(Clone)]
pub struct AsyncResult {
    shared: Arc<Shared>,
}

impl AsyncResult {
    pub(crate) fn new(conn: Weak<ConnectionInner>) -> Self {
        Self {
            shared: Arc::new(Shared {
                conn,
                slot: Mutex::new(Slot::Pending(Vec::new())),
                notify: Notify::new(),
            }),
        }
    }

    fn slot(&self) -> MutexGuard<'_, Slot> {
        self.shared.slot.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Current state
    pub fn state(&self) -> AsyncState {
        match &*self.slot() {
            Slot::Pending(_) => AsyncState::Pending,
            Slot::Ready(_) => AsyncState::Ready,
            Slot::Error(_) => AsyncState::Error,
            Slot::Expired(_) => AsyncState::Expired,
        }
    }

    /// Whether the result left the pending state
    pub fn is_ready(&self) -> bool {
        self.state() != AsyncState::Pending
    }

    /// Whether a value arrived
    pub fn ready(&self) -> bool {
        self.state() == AsyncState::Ready
    }

    /// Whether the request failed
    pub fn error(&self) -> bool {
        self.state() == AsyncState::Error
    }

    /// Whether the wait deadline passed before a response
    pub fn expired(&self) -> bool {
        self.state() == AsyncState::Expired
    }

    /// The outcome if the result is no longer pending; never waits
    pub fn value(&self) -> Option<Result<Value>> {
        self.slot().outcome()
    }

    /// Run `callback` once the result leaves the pending state.
    ///
    /// Runs immediately on the calling task if that already happened.
    /// Callbacks run on the task that resolves the result and must not
    /// block it.
    pub fn add_callback<F>(&self, callback: F)
    where
        F: FnOnce(&Result<Value>) + Send + 'static,
    {
        let outcome = {
            let mut slot = self.slot();
            match &mut *slot {
                Slot::Pending(callbacks) => {
                    callbacks.push(Box::new(callback));
                    return;
                }
                other => other.outcome(),
            }
        };
        if let Some(outcome) = outcome {
            callback(&outcome);
        }
    }

    /// Deliver the response. A result that expired discards it.
    pub(crate) fn resolve(&self, outcome: Result<Value>) {
        let callbacks = {
            let mut slot = self.slot();
            if !matches!(*slot, Slot::Pending(_)) {
                None
            } else {
                let next = match &outcome {
                    Ok(value) => Slot::Ready(value.clone()),
                    Err(err) => Slot::Error(err.clone()),
                };
                match std::mem::replace(&mut *slot, next) {
                    Slot::Pending(callbacks) => Some(callbacks),
                    _ => None,
                }
            }
        };

        match callbacks {
            Some(callbacks) => {
                self.shared.notify.notify_waiters();
                for callback in callbacks {
                    callback(&outcome);
                }
            }
            None => debug!("discarding late response for a settled async result"),
        }
    }

    /// Move to the terminal expired state unless the result already settled
    fn expire(&self, duration: Duration) -> Result<Value> {
        let callbacks = {
            let mut slot = self.slot();
            if let Some(outcome) = slot.outcome() {
                return outcome;
            }
            match std::mem::replace(&mut *slot, Slot::Expired(duration)) {
                Slot::Pending(callbacks) => callbacks,
                _ => Vec::new(),
            }
        };

        let outcome = Err(RpcError::Timeout { duration });
        self.shared.notify.notify_waiters();
        for callback in callbacks {
            callback(&outcome);
        }
        outcome
    }

    /// Wait for the outcome, at most `timeout` if given.
    ///
    /// Reads and dispatches frames from the connection while waiting, so a
    /// background serving task is not required. On timeout the result
    /// expires and a `Timeout` error is returned; a response arriving later
    /// is discarded.
    ///
    /// The deadline is checked between frames only. A peer request read
    /// while waiting is served to completion first, so a slow local handler
    /// can delay the timeout past it.
    pub async fn wait(&self, timeout: Option<Duration>) -> Result<Value> {
        let deadline = timeout.map(|t| Instant::now() + t);

        loop {
            let notified = self.shared.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(outcome) = self.value() {
                return outcome;
            }

            let conn = match self.shared.conn.upgrade() {
                Some(conn) => conn,
                None => return Err(RpcError::ConnectionClosed),
            };

            let expiry = async {
                match deadline {
                    Some(deadline) => tokio::time::sleep_until(deadline).await,
                    None => std::future::pending::<()>().await,
                }
            };

            tokio::select! {
                biased;
                _ = &mut notified => {}
                _ = expiry => {
                    return self.expire(timeout.unwrap_or_default());
                }
                frame = conn.read_frame() => {
                    let handled = match frame {
                        Ok(frame) => conn.dispatch_frame(frame).await,
                        Err(err) => Err(err),
                    };
                    if let Err(err) = handled {
                        if let Some(outcome) = self.value() {
                            return outcome;
                        }
                        return Err(err);
                    }
                }
            }
        }
    }
}

impl fmt::Debug for AsyncResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AsyncResult").field("state", &self.state()).finish()
    }
}
