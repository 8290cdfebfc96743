//! Acknowledgement aggregation for multi-recipient emits.
//!
//! An [`AckCollector`] is created per ack-bearing broadcast. Every server
//! taking part (this one included) reports how many responses it expects,
//! each response is pushed as it arrives, and the collector resolves its
//! callback exactly once: `Completed` when every server has reported and
//! every expected response is in, `TimedOut` with the partial results when
//! the optional deadline fires first.

use serde_json::Value;
use std::fmt;
use std::future::Future;
use std::mem;
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::task::AbortHandle;
use tracing::debug;

use crate::errors::AckError;
use crate::observability::metrics;

/// One recipient's answer, or the reason it never came.
#[derive(Debug, Clone, PartialEq)]
pub struct AckResponse {
    /// Socket id for local recipients, server id for remote contributions.
    pub source: String,
    pub result: Result<Vec<Value>, AckError>,
}

/// Terminal result of an ack request.
#[derive(Debug, Clone, PartialEq)]
pub enum AckOutcome {
    Completed(Vec<AckResponse>),
    /// The deadline fired first; carries whatever arrived before it.
    TimedOut(Vec<AckResponse>),
}

impl AckOutcome {
    pub fn is_timed_out(&self) -> bool {
        matches!(self, AckOutcome::TimedOut(_))
    }

    pub fn responses(&self) -> &[AckResponse] {
        match self {
            AckOutcome::Completed(r) | AckOutcome::TimedOut(r) => r,
        }
    }

    /// Responses on completion, [`AckError::Timeout`] otherwise.
    pub fn into_result(self) -> Result<Vec<AckResponse>, AckError> {
        match self {
            AckOutcome::Completed(r) => Ok(r),
            AckOutcome::TimedOut(_) => Err(AckError::Timeout),
        }
    }
}

type AckCallback = Box<dyn FnOnce(AckOutcome) + Send>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Open,
    Collecting,
    Completed,
    TimedOut,
}

struct Inner {
    phase: Phase,
    expected_servers: Option<usize>,
    reported_servers: usize,
    expected_responses: usize,
    expect_single: bool,
    received: Vec<AckResponse>,
    callback: Option<AckCallback>,
    timer: Option<AbortHandle>,
}

impl Inner {
    fn is_terminal(&self) -> bool {
        matches!(self.phase, Phase::Completed | Phase::TimedOut)
    }

    fn is_satisfied(&self) -> bool {
        if self.expect_single && !self.received.is_empty() {
            return true;
        }
        self.expected_servers
            .is_some_and(|servers| self.reported_servers >= servers)
            && self.received.len() >= self.expected_responses
    }

    /// Move to a terminal phase, returning what must be delivered outside the lock.
    fn finish(&mut self, phase: Phase) -> Option<(AckCallback, AckOutcome)> {
        if self.is_terminal() {
            return None;
        }
        self.phase = phase;
        if let Some(timer) = self.timer.take() {
            timer.abort();
        }
        let received = mem::take(&mut self.received);
        let outcome = match phase {
            Phase::TimedOut => AckOutcome::TimedOut(received),
            _ => AckOutcome::Completed(received),
        };
        self.callback.take().map(|cb| (cb, outcome))
    }
}

impl Drop for Inner {
    fn drop(&mut self) {
        // Every handle is gone without a verdict: nothing can complete it anymore.
        if let Some((callback, outcome)) = self.finish(Phase::TimedOut) {
            callback(outcome);
        }
    }
}

/// Shared handle to one pending ack request.
#[derive(Clone)]
pub struct AckCollector {
    inner: Arc<Mutex<Inner>>,
}

impl fmt::Debug for AckCollector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.lock();
        f.debug_struct("AckCollector")
            .field("phase", &inner.phase)
            .field("expected_servers", &inner.expected_servers)
            .field("reported_servers", &inner.reported_servers)
            .field("expected_responses", &inner.expected_responses)
            .field("received", &inner.received.len())
            .finish()
    }
}

impl AckCollector {
    /// Create a collector that invokes `callback` once it resolves.
    pub fn new(expect_single: bool, callback: impl FnOnce(AckOutcome) + Send + 'static) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner {
                phase: Phase::Open,
                expected_servers: None,
                reported_servers: 0,
                expected_responses: 0,
                expect_single,
                received: Vec::new(),
                callback: Some(Box::new(callback)),
                timer: None,
            })),
        }
    }

    /// Create a collector paired with a future resolving to its outcome.
    pub fn channel(expect_single: bool) -> (Self, AckHandle) {
        let (tx, rx) = oneshot::channel();
        let collector = Self::new(expect_single, move |outcome| {
            let _ = tx.send(outcome);
        });
        (collector, AckHandle { rx })
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Run `f` under the lock, then resolve if the request became complete.
    fn update(&self, f: impl FnOnce(&mut Inner)) {
        let pending = {
            let mut inner = self.lock();
            if inner.is_terminal() {
                return;
            }
            f(&mut inner);
            if inner.phase == Phase::Open {
                inner.phase = Phase::Collecting;
            }
            if inner.is_satisfied() {
                inner.finish(Phase::Completed)
            } else {
                None
            }
        };
        if let Some((callback, outcome)) = pending {
            metrics::record_ack_outcome("completed");
            callback(outcome);
        }
    }

    /// Number of servers (this one included) that will call [`Self::report_expected`].
    pub fn set_expected_servers(&self, servers: usize) {
        self.update(|inner| inner.expected_servers = Some(servers));
    }

    /// Called once per participating server with the number of responses it will produce.
    ///
    /// Unreachable servers report zero so the request never waits on them.
    pub fn report_expected(&self, responses: usize) {
        self.update(|inner| {
            inner.reported_servers += 1;
            inner.expected_responses += responses;
        });
    }

    /// Count every server that has not reported yet as expecting zero responses.
    ///
    /// Used when the cluster bridge fails: servers it could not reach will
    /// never report.
    pub fn fail_remaining_servers(&self) {
        self.update(|inner| {
            if let Some(servers) = inner.expected_servers {
                inner.reported_servers = inner.reported_servers.max(servers);
            }
        });
    }

    /// Record one response. Ignored once the request has resolved.
    pub fn push(&self, source: impl Into<String>, result: Result<Vec<Value>, AckError>) {
        let source = source.into();
        let accepted = {
            let inner = self.lock();
            !inner.is_terminal()
        };
        if !accepted {
            debug!(target: "roomcast.ack", source = %source, "Discarding late acknowledgement");
            return;
        }
        self.update(|inner| inner.received.push(AckResponse { source, result }));
    }

    /// Resolve now with whatever has arrived.
    pub fn time_out(&self) {
        let pending = self.lock().finish(Phase::TimedOut);
        if let Some((callback, outcome)) = pending {
            debug!(
                target: "roomcast.ack",
                received = outcome.responses().len(),
                "Acknowledgement request timed out"
            );
            metrics::record_ack_outcome("timed_out");
            callback(outcome);
        }
    }

    /// Arm the deadline. The timer is aborted if the request completes first.
    ///
    /// Must be called from within a tokio runtime.
    pub fn arm_timeout(&self, timeout: Duration) {
        let collector = self.clone();
        let task = tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            collector.time_out();
        });

        let mut inner = self.lock();
        if inner.is_terminal() {
            task.abort();
        } else {
            inner.timer = Some(task.abort_handle());
        }
    }

    pub fn is_resolved(&self) -> bool {
        self.lock().is_terminal()
    }
}

/// Future resolving to the outcome of an [`AckCollector`] built with [`AckCollector::channel`].
#[derive(Debug)]
pub struct AckHandle {
    rx: oneshot::Receiver<AckOutcome>,
}

impl Future for AckHandle {
    type Output = AckOutcome;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.rx)
            .poll(cx)
            .map(|result| result.unwrap_or(AckOutcome::TimedOut(Vec::new())))
    }
}
