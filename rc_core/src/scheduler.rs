use std::sync::Arc;

use tokio::sync::{Notify, Semaphore};

use crate::{config::HEARTBEAT_INTERVAL, ProxyKernel};

/// A [`Scheduler`] drives the periodic work of a [`ProxyKernel`]:
/// server heartbeats and family rebalancing.
///
/// Configuration reloads are picked up on the fly.
pub struct Scheduler(Arc<Ticker>);

struct Ticker {
    /// Held while the loop runs.
    running: Semaphore,
    stop_notify: Notify,
    kernel: Arc<ProxyKernel>,
}

#[derive(Debug, Clone, Copy)]
enum Task {
    Heartbeat,
    Rebalance,
}

impl Scheduler {
    pub fn new(kernel: Arc<ProxyKernel>) -> Self {
        Self(Arc::new(Ticker {
            running: Semaphore::new(1),
            stop_notify: Notify::new(),
            kernel,
        }))
    }

    pub fn is_running(&self) -> bool {
        self.0.running.available_permits() == 0
    }

    /// Starts ticking. Does nothing if already running.
    pub fn start(&self) {
        if self.is_running() {
            return;
        }
        let ticker = self.0.clone();
        tokio::spawn(async move {
            let Ok(_permit) = ticker.running.acquire().await else {
                return;
            };
            ticker.run().await;
            log::debug!("Scheduler stopped");
        });
    }

    /// Stops ticking.
    ///
    /// ## Arguments
    ///
    /// * `wait` - Whether to wait for the loop to exit
    pub async fn stop(&self, wait: bool) {
        if !self.is_running() {
            return;
        }
        self.0.stop_notify.notify_one();
        if wait {
            let _ = self.0.running.acquire().await;
        }
    }
}

impl Ticker {
    async fn run(&self) {
        let mut heartbeat = tokio::time::interval(HEARTBEAT_INTERVAL);
        // servers shouldn't lose timeout on startup
        heartbeat.tick().await;
        loop {
            let rebalance_rate = self.kernel.config_provider().read().await.rebalance_rate();
            let mut rebalance = tokio::time::interval(rebalance_rate);
            loop {
                let task = tokio::select! {
                    _ = self.stop_notify.notified() => return,
                    _ = self.kernel.config_provider().wait_reload() => break,
                    _ = heartbeat.tick() => Task::Heartbeat,
                    _ = rebalance.tick() => Task::Rebalance,
                };
                self.spawn(task);
            }
            log::debug!("Scheduler picked up a configuration reload");
        }
    }

    fn spawn(&self, task: Task) {
        log::trace!("Scheduler tick: {:?}", task);
        let kernel = self.kernel.clone();
        tokio::spawn(async move {
            match task {
                Task::Heartbeat => kernel.heartbeat().await,
                Task::Rebalance => kernel.rebalance().await,
            }
        });
    }
}
