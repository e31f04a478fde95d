//! Background crowd tick
//!
//! The scheduler advances the crowd by a fixed simulated step on a fixed wall
//! clock period, independently of request traffic. Ticks that fall behind are
//! delayed rather than bunched up, so the crowd never runs several steps back
//! to back.

use std::sync::Arc;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};

use crate::config::TickConfig;
use crate::service::NavService;

/// Handle of a running tick loop
#[derive(Debug)]
pub struct TickScheduler {
    shutdown: watch::Sender<bool>,
    task: JoinHandle<u64>,
}

impl TickScheduler {
    /// Spawns the tick loop on the current tokio runtime
    pub fn start(service: Arc<NavService>, config: &TickConfig) -> Self {
        let (shutdown, mut shutdown_rx) = watch::channel(false);
        let period = config.interval();
        let step = config.step_seconds;

        let task = tokio::spawn(async move {
            let mut ticker = interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            log::info!("Crowd tick started: every {:?}, {}s per step", period, step);

            let mut ticks: u64 = 0;
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        match service.tick(step) {
                            Ok(()) => ticks += 1,
                            Err(e) => log::error!("Crowd tick failed: {}", e),
                        }
                    }
                    changed = shutdown_rx.changed() => {
                        if changed.is_err() || *shutdown_rx.borrow() {
                            break;
                        }
                    }
                }
            }

            log::info!("Crowd tick stopped after {} ticks", ticks);
            ticks
        });

        Self { shutdown, task }
    }

    /// Stops the loop and returns the number of ticks that completed
    pub async fn shutdown(self) -> u64 {
        let _ = self.shutdown.send(true);
        match self.task.await {
            Ok(ticks) => ticks,
            Err(e) => {
                log::error!("Crowd tick task ended abnormally: {}", e);
                0
            }
        }
    }

    pub fn is_running(&self) -> bool {
        !self.task.is_finished()
    }
}
