use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::AbortHandle;
use crate::bridge::BridgeEvent;

/// Delivers events back to the bridge loop after a delay.
pub trait Scheduler {
    fn after(&mut self, delay: Duration, event: BridgeEvent) -> TimerHandle;
}

/// A pending delayed event.
///
/// Dropping the handle leaves the timer running; `cancel` stops it.
#[derive(Debug, Default)]
pub struct TimerHandle {
    abort: Option<AbortHandle>,
}

impl TimerHandle {
    pub fn detached() -> Self {
        Self { abort: None }
    }

    pub fn cancel(self) {
        if let Some(abort) = self.abort {
            abort.abort();
        }
    }
}

/// Runs each timer as a sleeping task that feeds the bridge channel
#[derive(Clone)]
pub struct TokioScheduler {
    tx: mpsc::UnboundedSender<BridgeEvent>,
}

impl TokioScheduler {
    pub fn new(tx: mpsc::UnboundedSender<BridgeEvent>) -> Self {
        Self { tx }
    }
}

impl Scheduler for TokioScheduler {
    fn after(&mut self, delay: Duration, event: BridgeEvent) -> TimerHandle {
        let tx = self.tx.clone();
        let task = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            // bridge gone means we are shutting down
            let _ = tx.send(event);
        });
        TimerHandle {
            abort: Some(task.abort_handle()),
        }
    }
}

/// Records timers instead of running them
#[cfg(test)]
#[derive(Debug, Default)]
pub struct RecordingScheduler {
    pub scheduled: Vec<(Duration, BridgeEvent)>,
}

#[cfg(test)]
impl RecordingScheduler {
    pub fn take(&mut self) -> Vec<(Duration, BridgeEvent)> {
        std::mem::take(&mut self.scheduled)
    }
}

#[cfg(test)]
impl Scheduler for RecordingScheduler {
    fn after(&mut self, delay: Duration, event: BridgeEvent) -> TimerHandle {
        self.scheduled.push((delay, event));
        TimerHandle::detached()
    }
}
