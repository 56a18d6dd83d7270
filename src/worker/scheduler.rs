//! Background task scheduler
//!
//! Owns every long-running task the process spawns, so shutdown can
//! cancel them as a group instead of leaking detached loops.

use std::future::Future;
use std::time::Duration;

use tokio::task::JoinHandle;

/// Named, cancellable background tasks
#[derive(Default)]
pub struct Scheduler {
    tasks: Vec<(String, JoinHandle<()>)>,
}

impl Scheduler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Spawn a long-running future under a name
    pub fn spawn<F>(&mut self, name: &str, future: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        tracing::info!(task = name, "Starting background task");
        self.tasks.push((name.to_string(), tokio::spawn(future)));
    }

    /// Spawn a periodic task that runs `tick` every `period`.
    ///
    /// A tick that overruns the period delays the next one rather than
    /// bunching ticks together.
    pub fn spawn_periodic<F, Fut>(&mut self, name: &str, period: Duration, mut tick: F)
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send,
    {
        let task_name = name.to_string();
        self.spawn(name, async move {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                interval.tick().await;
                tracing::trace!(task = %task_name, "Tick");
                tick().await;
            }
        });
    }

    /// Cancel every task
    pub fn shutdown(&mut self) {
        for (name, handle) in self.tasks.drain(..) {
            tracing::info!(task = %name, "Stopping background task");
            handle.abort();
        }
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        self.shutdown();
    }
}
