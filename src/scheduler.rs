use crate::attack_controller::{AttackController, RoundStatus};
use crate::error::{Result, SimError};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

/// Paces attack rounds on the tokio runtime.
///
/// Rounds block on the bus, so each one runs on the blocking pool while
/// the timer task waits for it.
pub struct RoundScheduler;

impl RoundScheduler {
    /// First round after `start_delay`, then one every `interval`
    pub fn spawn(controller: AttackController, start_delay: Duration, interval: Duration) -> SchedulerHandle {
        let (cancel_tx, cancel_rx) = watch::channel(false);

        let task = tokio::spawn(drive(controller, start_delay, interval, cancel_rx));

        SchedulerHandle { cancel_tx, task }
    }
}

async fn drive(
    mut controller: AttackController,
    start_delay: Duration,
    interval: Duration,
    mut cancel_rx: watch::Receiver<bool>,
) -> Result<AttackController> {
    tokio::select! {
        biased;
        _ = cancel_rx.changed() => {
            controller.cancel();
            return Ok(controller);
        }
        _ = tokio::time::sleep(start_delay) => {}
    }

    let mut ticker = tokio::time::interval(interval.max(Duration::from_millis(1)));
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            biased;
            _ = cancel_rx.changed() => {
                controller.cancel();
                break;
            }
            _ = ticker.tick() => {
                let (returned, status) = tokio::task::spawn_blocking(move || {
                    let mut controller = controller;
                    let status = controller.step();
                    (controller, status)
                })
                .await
                .map_err(|e| SimError::Scheduler(e.to_string()))?;

                controller = returned;
                if let RoundStatus::Stopped(_) = status? {
                    break;
                }
            }
        }
    }

    Ok(controller)
}

/// Handle to a running `RoundScheduler`. Dropping it cancels the schedule.
pub struct SchedulerHandle {
    cancel_tx: watch::Sender<bool>,
    task: JoinHandle<Result<AttackController>>,
}

impl SchedulerHandle {
    /// Ask the scheduler to stop after the round currently in progress
    pub fn cancel(&self) {
        let _ = self.cancel_tx.send(true);
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Wait for the schedule to end and take the controller back
    pub async fn join(self) -> Result<AttackController> {
        self.task
            .await
            .map_err(|e| SimError::Scheduler(e.to_string()))?
    }
}
