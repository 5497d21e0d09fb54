//! Inter-request pacing and empirical delay calibration.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, info, instrument, warn};

use crate::auth::AuthSessionManager;
use crate::client::{dispatch, Failure, HttpReply, Outcome, OutcomeHandler, RequestEngine};
use crate::config::ThrottleConfig;
use crate::error::{SyncError, SyncResult};
use crate::request::RequestFactory;
use crate::secret::Secret;
use crate::state::StateStore;

/// Current pacing state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ThrottleState {
    /// Minimum spacing between dispatches.
    pub delay_ms: u64,
    /// 503 replies seen since the last accepted request.
    pub consecutive_rejections: u32,
    /// Samples per calibration run.
    pub max_iterations: u32,
}

#[derive(Debug)]
struct Inner {
    state: ThrottleState,
    last_dispatch: Option<Instant>,
}

/// Result of a single calibration request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SampleOutcome {
    Accepted,
    RateLimited,
    Failed(String),
}

/// A cheap read issued repeatedly while calibrating.
#[async_trait]
pub trait Sampler: Send + Sync {
    /// Send one sample request. `delay_ms` is the candidate delay of the current run.
    async fn sample(&self, delay_ms: u64) -> SampleOutcome;
}

/// Summary of a finished calibration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CalibrationReport {
    /// Adopted and persisted operating delay.
    pub delay_ms: u64,
    /// Sample runs, including the final clean one.
    pub runs: u32,
    pub samples_sent: u32,
    pub rejections: u32,
}

/// Counts of one sample run.
#[derive(Debug, Default)]
struct RunCounts {
    accepted: u32,
    rejected: u32,
}

/// Enforces the inter-request delay shared by every request of the process.
#[derive(Debug)]
pub struct ThrottleController {
    config: ThrottleConfig,
    inner: Mutex<Inner>,
}

impl ThrottleController {
    /// Controller starting at the configured initial delay.
    pub fn new(config: ThrottleConfig) -> Self {
        let delay_ms = config.initial_delay_ms;
        Self::with_delay(config, delay_ms)
    }

    pub fn with_delay(config: ThrottleConfig, delay_ms: u64) -> Self {
        let max_iterations = config.sample_count;
        Self {
            config,
            inner: Mutex::new(Inner {
                state: ThrottleState {
                    delay_ms,
                    consecutive_rejections: 0,
                    max_iterations,
                },
                last_dispatch: None,
            }),
        }
    }

    /// Controller using the persisted operating delay, if one was calibrated.
    pub fn from_store(config: ThrottleConfig, store: &dyn StateStore) -> SyncResult<Self> {
        let delay_ms = store
            .load_throttle_delay()?
            .unwrap_or(config.initial_delay_ms);
        debug!(delay_ms, "Loaded operating throttle delay");
        Ok(Self::with_delay(config, delay_ms))
    }

    pub fn config(&self) -> &ThrottleConfig {
        &self.config
    }

    pub async fn state(&self) -> ThrottleState {
        self.inner.lock().await.state
    }

    pub async fn delay_ms(&self) -> u64 {
        self.inner.lock().await.state.delay_ms
    }

    pub async fn set_delay(&self, delay_ms: u64) {
        self.inner.lock().await.state.delay_ms = delay_ms;
    }

    /// Wait until `last_dispatch + delay`, then mark a dispatch.
    ///
    /// The lock is held while sleeping so concurrent callers are spaced too.
    pub async fn pace(&self) {
        let mut inner = self.inner.lock().await;
        let delay = Duration::from_millis(inner.state.delay_ms);
        if let Some(last) = inner.last_dispatch {
            let ready_at = last + delay;
            if ready_at > Instant::now() {
                tokio::time::sleep_until(ready_at).await;
            }
        }
        inner.last_dispatch = Some(Instant::now());
    }

    /// Track rejections for an outcome of a paced request.
    pub async fn observe(&self, outcome: &Outcome) {
        let mut inner = self.inner.lock().await;
        match outcome {
            Outcome::RateLimited(_) => {
                inner.state.consecutive_rejections += 1;
            }
            Outcome::Offline(_) => {}
            _ => inner.state.consecutive_rejections = 0,
        }
    }

    /// Search for the smallest delay with a rejection-free sample run.
    ///
    /// Every run sends `sample_count` paced samples at the candidate delay. A run
    /// with rejections raises the candidate by `step_ms` and restarts; any other
    /// failure aborts and restores the previous delay. A clean run persists the
    /// candidate through `store`.
    #[instrument(skip(self, sampler, store))]
    pub async fn calibrate(
        &self,
        sampler: &dyn Sampler,
        starting_delay_ms: u64,
        store: &dyn StateStore,
    ) -> SyncResult<CalibrationReport> {
        let previous = self.delay_ms().await;
        match self.search(sampler, starting_delay_ms, store).await {
            Ok(report) => Ok(report),
            Err(err) => {
                self.set_delay(previous).await;
                warn!(error = %err, restored_delay_ms = previous, "Calibration aborted");
                Err(err)
            }
        }
    }

    async fn search(
        &self,
        sampler: &dyn Sampler,
        starting_delay_ms: u64,
        store: &dyn StateStore,
    ) -> SyncResult<CalibrationReport> {
        let mut candidate = starting_delay_ms;
        let mut report = CalibrationReport {
            delay_ms: candidate,
            runs: 0,
            samples_sent: 0,
            rejections: 0,
        };

        loop {
            if let Some(max) = self.config.max_delay_ms {
                if candidate > max {
                    return Err(SyncError::CalibrationFailed {
                        delay_ms: candidate,
                        message: format!("no clean run at or below {max} ms"),
                    });
                }
            }

            self.set_delay(candidate).await;
            let counts = self.sample_run(sampler, candidate).await?;
            report.runs += 1;
            report.samples_sent += counts.accepted + counts.rejected;
            report.rejections += counts.rejected;

            if counts.rejected == 0 {
                break;
            }

            info!(
                delay_ms = candidate,
                rejections = counts.rejected,
                next_delay_ms = candidate + self.config.step_ms,
                "Sample run rate limited, raising delay"
            );
            candidate += self.config.step_ms;
        }

        store.save_throttle_delay(candidate)?;
        report.delay_ms = candidate;
        info!(
            delay_ms = candidate,
            runs = report.runs,
            samples = report.samples_sent,
            "Calibration complete"
        );
        Ok(report)
    }

    async fn sample_run(&self, sampler: &dyn Sampler, delay_ms: u64) -> SyncResult<RunCounts> {
        let mut counts = RunCounts::default();
        for _ in 0..self.config.sample_count {
            self.pace().await;
            match sampler.sample(delay_ms).await {
                SampleOutcome::Accepted => {
                    counts.accepted += 1;
                    self.inner.lock().await.state.consecutive_rejections = 0;
                }
                SampleOutcome::RateLimited => {
                    counts.rejected += 1;
                    self.inner.lock().await.state.consecutive_rejections += 1;
                }
                SampleOutcome::Failed(message) => {
                    return Err(SyncError::CalibrationFailed { delay_ms, message });
                }
            }
        }
        debug!(delay_ms, accepted = counts.accepted, rejected = counts.rejected, "Sample run finished");
        Ok(counts)
    }
}

/// Samples the contacts feed with `max-results=1`.
pub struct HttpSampler {
    engine: Arc<RequestEngine>,
    auth: Arc<AuthSessionManager>,
    factory: RequestFactory,
    account: String,
}

impl HttpSampler {
    pub fn new(
        engine: Arc<RequestEngine>,
        auth: Arc<AuthSessionManager>,
        factory: RequestFactory,
        account: impl Into<String>,
    ) -> Self {
        Self {
            engine,
            auth,
            factory,
            account: account.into(),
        }
    }
}

struct SampleHandler;

impl OutcomeHandler for SampleHandler {
    type Output = SampleOutcome;

    fn on_success(&mut self, _reply: HttpReply) -> Self::Output {
        SampleOutcome::Accepted
    }

    fn on_created(&mut self, _reply: HttpReply) -> Self::Output {
        SampleOutcome::Accepted
    }

    fn on_rate_limited(&mut self, _reply: HttpReply) -> Self::Output {
        SampleOutcome::RateLimited
    }

    fn on_error(&mut self, failure: Failure) -> Self::Output {
        match failure {
            Failure::Offline(message) => SampleOutcome::Failed(message),
            Failure::Status(reply) => SampleOutcome::Failed(format!("HTTP {}", reply.status)),
        }
    }
}

#[async_trait]
impl Sampler for HttpSampler {
    async fn sample(&self, _delay_ms: u64) -> SampleOutcome {
        let token: Secret = match self.auth.get_token(&self.account).await {
            Ok(token) => token,
            Err(e) => return SampleOutcome::Failed(e.to_string()),
        };
        let descriptor = match self.factory.list_all(&self.account, &token, 1, 1) {
            Ok(descriptor) => descriptor,
            Err(e) => return SampleOutcome::Failed(e.to_string()),
        };
        // The controller already paced this request.
        let outcome = self.engine.send_unpaced(&descriptor).await;
        dispatch(outcome, &mut SampleHandler)
    }
}
