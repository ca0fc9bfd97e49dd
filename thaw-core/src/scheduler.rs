/*!
Debounced flush scheduling.

```text
  Idle ──change──▶ Pending ──interval elapsed──▶ Flushing ──done──▶ Idle
                    │   ▲
                    └───┘ change: cancel timer, re-arm for a full interval
```

Every qualifying change cancels the outstanding timer and arms a new one, so a
burst of writes produces exactly one flush once the tree has been quiet for the
whole interval. The timer runs on the tokio clock; tests pause it and let it
advance instead of waiting in real time.

A timer that has already fired is detached from the scheduler before it calls the
flush target, so a change arriving mid-flush arms a fresh timer and never cancels
the upload in progress.
*/

use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use tokio::task::JoinHandle;
use tracing::debug;

/// Work performed when the debounce timer fires
#[async_trait]
pub trait FlushTarget: Send + Sync {
    /// Run one flush. Outcomes are the target's business; the scheduler returns
    /// to idle either way and does not re-arm.
    async fn flush_due(&self);
}

/// Observable phase of the scheduler
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedulerState {
    Idle,
    Pending,
    Flushing,
}

struct PendingTimer {
    generation: u64,
    handle: JoinHandle<()>,
}

#[derive(Default)]
struct TimerSlot {
    pending: Option<PendingTimer>,
    generation: u64,
    flushing: usize,
}

/// Sliding-window debouncer with a single outstanding timer
#[derive(Clone)]
pub struct FlushScheduler {
    interval: Duration,
    target: Arc<dyn FlushTarget>,
    slot: Arc<Mutex<TimerSlot>>,
}

impl FlushScheduler {
    pub fn new(interval: Duration, target: Arc<dyn FlushTarget>) -> Self {
        Self {
            interval,
            target,
            slot: Arc::new(Mutex::new(TimerSlot::default())),
        }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    fn lock(slot: &Mutex<TimerSlot>) -> MutexGuard<'_, TimerSlot> {
        slot.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Restart the debounce window
    ///
    /// Must be called from within a tokio runtime.
    pub fn on_qualifying_change(&self) {
        let mut slot = Self::lock(&self.slot);
        if let Some(previous) = slot.pending.take() {
            previous.handle.abort();
        }

        slot.generation += 1;
        let generation = slot.generation;
        let shared = Arc::clone(&self.slot);
        let target = Arc::clone(&self.target);
        let interval = self.interval;

        let handle = tokio::spawn(async move {
            tokio::time::sleep(interval).await;

            {
                let mut slot = Self::lock(&shared);
                // A reset between wake-up and this lock wins; the newer timer owns the flush.
                match &slot.pending {
                    Some(timer) if timer.generation == generation => {}
                    _ => return,
                }
                slot.pending = None;
                slot.flushing += 1;
            }

            let _guard = FlushingGuard(shared);
            debug!(generation, "Debounce window closed, flushing");
            target.flush_due().await;
        });

        slot.pending = Some(PendingTimer { generation, handle });
    }

    /// Disarm the pending timer, if any
    ///
    /// Returns true when a flush was pending. A flush already running is left alone.
    pub fn cancel(&self) -> bool {
        let mut slot = Self::lock(&self.slot);
        match slot.pending.take() {
            Some(timer) => {
                timer.handle.abort();
                true
            }
            None => false,
        }
    }

    pub fn state(&self) -> SchedulerState {
        let slot = Self::lock(&self.slot);
        if slot.pending.is_some() {
            SchedulerState::Pending
        } else if slot.flushing > 0 {
            SchedulerState::Flushing
        } else {
            SchedulerState::Idle
        }
    }
}

struct FlushingGuard(Arc<Mutex<TimerSlot>>);

impl Drop for FlushingGuard {
    fn drop(&mut self) {
        let mut slot = FlushScheduler::lock(&self.0);
        slot.flushing = slot.flushing.saturating_sub(1);
    }
}
