//! Cooperative periodic scheduler.
//!
//! Every receive poll and housekeeping task runs on one thread, in turn.
//! Tasks must return promptly: they share the thread with everything else.

use std::time::{Duration, Instant};

use tokio::sync::broadcast;
use tracing::{debug, trace};

/// A periodic task over some shared context `C`.
pub type Task<C> = Box<dyn FnMut(&mut C) + Send>;

// ---------------------------------------------------------------------------
// ScheduledTask
// ---------------------------------------------------------------------------

pub struct ScheduledTask<C> {
    pub name: String,
    pub period: Duration,
    pub enabled: bool,
    pub next_due: Instant,
    pub run_count: u64,
    task: Task<C>,
}

impl<C> std::fmt::Debug for ScheduledTask<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScheduledTask")
            .field("name", &self.name)
            .field("period", &self.period)
            .field("enabled", &self.enabled)
            .field("run_count", &self.run_count)
            .finish_non_exhaustive()
    }
}

// ---------------------------------------------------------------------------
// Scheduler
// ---------------------------------------------------------------------------

/// Fixed-period task scheduler.
///
/// Call [`tick`](Self::tick) yourself, or hand the scheduler to
/// [`run`](Self::run) to sleep between deadlines until shutdown.
pub struct Scheduler<C> {
    tasks: Vec<ScheduledTask<C>>,
}

impl<C> Default for Scheduler<C> {
    fn default() -> Self {
        Self { tasks: Vec::new() }
    }
}

impl<C> Scheduler<C> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a task that first runs one `period` from now.
    pub fn enqueue_task(
        &mut self,
        name: impl Into<String>,
        period: Duration,
        task: impl FnMut(&mut C) + Send + 'static,
    ) {
        let name = name.into();
        // A zero period would spin.
        let period = period.max(Duration::from_millis(1));
        debug!("Scheduling {name} every {period:?}");
        self.tasks.push(ScheduledTask {
            name,
            period,
            enabled: true,
            next_due: Instant::now() + period,
            run_count: 0,
            task: Box::new(task),
        });
    }

    pub fn set_enabled(&mut self, name: &str, enabled: bool) -> bool {
        match self.tasks.iter_mut().find(|t| t.name == name) {
            Some(task) => {
                task.enabled = enabled;
                true
            }
            None => false,
        }
    }

    pub fn tasks(&self) -> &[ScheduledTask<C>] {
        &self.tasks
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    /// Earliest deadline among enabled tasks.
    pub fn next_deadline(&self) -> Option<Instant> {
        self.tasks
            .iter()
            .filter(|t| t.enabled)
            .map(|t| t.next_due)
            .min()
    }

    /// Run every enabled task due at `now`, in registration order. Returns
    /// the names of the tasks that ran.
    ///
    /// Missed periods are not replayed: a late task runs once and is
    /// rescheduled one period after `now`.
    pub fn tick(&mut self, ctx: &mut C, now: Instant) -> Vec<String> {
        let mut ran = Vec::new();
        for task in &mut self.tasks {
            if !task.enabled || task.next_due > now {
                continue;
            }
            (task.task)(ctx);
            task.run_count += 1;
            task.next_due = now + task.period;
            ran.push(task.name.clone());
        }
        if !ran.is_empty() {
            trace!("Ran {} scheduled task(s)", ran.len());
        }
        ran
    }

    /// Drive the scheduler until `shutdown` fires.
    pub async fn run(&mut self, ctx: &mut C, mut shutdown: broadcast::Receiver<()>) {
        loop {
            let Some(deadline) = self.next_deadline() else {
                let _ = shutdown.recv().await;
                break;
            };
            tokio::select! {
                _ = tokio::time::sleep_until(tokio::time::Instant::from_std(deadline)) => {
                    self.tick(ctx, Instant::now());
                }
                _ = shutdown.recv() => {
                    break;
                }
            }
        }
        debug!("Scheduler shutting down");
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
