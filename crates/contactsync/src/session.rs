//! Process-wide activity guard and per-pass context.

use std::fmt;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

use chrono::Utc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::{SyncError, SyncResult};
use crate::model::Timestamp;

const IDLE: u8 = 0;

/// Long-running activity that needs exclusive use of the remote service.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActivityKind {
    Sync,
    Calibration,
}

impl ActivityKind {
    fn as_u8(self) -> u8 {
        match self {
            ActivityKind::Sync => 1,
            ActivityKind::Calibration => 2,
        }
    }

    fn from_u8(value: u8) -> Option<Self> {
        match value {
            1 => Some(ActivityKind::Sync),
            2 => Some(ActivityKind::Calibration),
            _ => None,
        }
    }
}

impl fmt::Display for ActivityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ActivityKind::Sync => write!(f, "synchronization"),
            ActivityKind::Calibration => write!(f, "throttle calibration"),
        }
    }
}

/// Single flag shared by every entry point that talks to the remote service.
///
/// Cloning shares the flag.
#[derive(Debug, Clone, Default)]
pub struct SyncCoordinator {
    active: Arc<AtomicU8>,
}

impl SyncCoordinator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Claim the flag, or fail with [`SyncError::Busy`] naming the activity holding it.
    pub fn try_begin(&self, kind: ActivityKind) -> SyncResult<ActivityGuard> {
        match self
            .active
            .compare_exchange(IDLE, kind.as_u8(), Ordering::AcqRel, Ordering::Acquire)
        {
            Ok(_) => {
                debug!(activity = %kind, "Activity started");
                Ok(ActivityGuard {
                    active: Arc::clone(&self.active),
                    kind,
                })
            }
            Err(current) => {
                let active = ActivityKind::from_u8(current).unwrap_or(ActivityKind::Sync);
                warn!(requested = %kind, active = %active, "Rejected: another activity is in progress");
                Err(SyncError::Busy { active })
            }
        }
    }

    /// Current activity, if any.
    pub fn current(&self) -> Option<ActivityKind> {
        ActivityKind::from_u8(self.active.load(Ordering::Acquire))
    }

    /// Whether a sync pass holds the flag.
    pub fn is_synchronizing(&self) -> bool {
        self.current() == Some(ActivityKind::Sync)
    }
}

/// Releases the activity flag on drop.
#[derive(Debug)]
pub struct ActivityGuard {
    active: Arc<AtomicU8>,
    kind: ActivityKind,
}

impl ActivityGuard {
    pub fn kind(&self) -> ActivityKind {
        self.kind
    }
}

impl Drop for ActivityGuard {
    fn drop(&mut self) {
        self.active.store(IDLE, Ordering::Release);
        debug!(activity = %self.kind, "Activity finished");
    }
}

/// State created at pass start and torn down when the pass ends or is canceled.
#[derive(Debug, Clone)]
pub struct SyncContext {
    started_at: Timestamp,
    cancel: CancellationToken,
}

impl SyncContext {
    pub fn new(cancel: CancellationToken) -> Self {
        Self::starting_at(Utc::now().timestamp(), cancel)
    }

    /// Context with a fixed start time.
    pub fn starting_at(started_at: Timestamp, cancel: CancellationToken) -> Self {
        Self { started_at, cancel }
    }

    /// Pass start time; becomes the scope's next `last_sync_timestamp`.
    pub fn started_at(&self) -> Timestamp {
        self.started_at
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Fail with [`SyncError::Cancelled`] once cancellation was requested.
    pub fn check_cancelled(&self) -> SyncResult<()> {
        if self.cancel.is_cancelled() {
            Err(SyncError::Cancelled)
        } else {
            Ok(())
        }
    }

    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }
}
