//! Polling loop and tick timing.
//!
//! The loop runs one tick at a time: gather, send, dispatch, then sleep for
//! the delay computed by [`DelayModel`]. A sleep in slow mode is cut short
//! when new work is queued. After a failed batch the loop either backs off
//! per [`RetryConfig`](crate::RetryConfig) or parks until the host calls
//! `Engine::retry`.

use crate::config::EngineConfig;
use crate::engine::Engine;
use crate::error::EngineError;
use crate::transport::Transport;
use std::fmt;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Scheduling mode of the polling loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Mode {
    /// Transactions or subscriptions are pending.
    Fast,
    /// Nothing is pending; only liveness pings are sent.
    #[default]
    Slow,
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Mode::Fast => write!(f, "fast"),
            Mode::Slow => write!(f, "slow"),
        }
    }
}

/// Exponential moving average of round-trip times, with per-mode floors.
#[derive(Debug, Clone)]
pub struct DelayModel {
    alpha: f64,
    clamp: bool,
    min_delay: Duration,
    slow_min_delay: Duration,
    average: Duration,
    current: Duration,
}

impl DelayModel {
    /// Creates a model from the engine configuration.
    pub fn new(config: &EngineConfig) -> Self {
        Self {
            alpha: config.ema_alpha,
            clamp: config.clamp,
            min_delay: config.min_delay,
            slow_min_delay: config.slow_min_delay,
            average: config.min_delay,
            current: config.min_delay,
        }
    }

    /// Folds one round trip into the average and returns the next delay.
    pub fn observe(&mut self, elapsed: Duration, mode: Mode) -> Duration {
        let average = self.alpha * elapsed.as_secs_f64()
            + (1.0 - self.alpha) * self.average.as_secs_f64();
        self.average = Duration::from_secs_f64(average.max(0.0));

        let mut delay = self.average;
        if self.clamp {
            delay = delay.max(self.min_delay);
        }
        if mode == Mode::Slow {
            delay = delay.max(self.slow_min_delay);
        }
        self.current = delay;
        delay
    }

    /// Delay returned by the last observation.
    pub fn current(&self) -> Duration {
        self.current
    }

    /// Unclamped moving average.
    pub fn average(&self) -> Duration {
        self.average
    }
}

/// Handle to a running polling loop.
#[derive(Debug)]
pub struct SchedulerHandle {
    stop: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl SchedulerHandle {
    /// Stops the loop after the tick in flight, if any, and waits for it.
    pub async fn shutdown(self) {
        let _ = self.stop.send(true);
        if let Err(err) = self.task.await {
            warn!(error = %err, "polling loop ended abnormally");
        }
    }

    /// Returns true once the loop has exited.
    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }
}

pub(crate) fn spawn<T: Transport + 'static>(engine: Engine<T>) -> SchedulerHandle {
    let (stop, stop_rx) = watch::channel(false);
    let task = tokio::spawn(run(engine, stop_rx));
    SchedulerHandle { stop, task }
}

async fn run<T: Transport + 'static>(engine: Engine<T>, mut stop: watch::Receiver<bool>) {
    info!("polling loop started");
    let retry = engine.config().retry.clone();
    let mut failures: u32 = 0;

    loop {
        if *stop.borrow() {
            break;
        }

        let ticking = engine.clone();
        let outcome = match tokio::task::spawn_blocking(move || ticking.tick()).await {
            Ok(outcome) => outcome,
            Err(err) => {
                warn!(error = %err, "tick task failed");
                break;
            }
        };

        let delay = match outcome {
            Ok(report) => {
                failures = 0;
                debug!(
                    mode = %report.mode,
                    operations = report.operations,
                    delay_ms = report.next_delay.as_millis() as u64,
                    "tick complete"
                );
                report.next_delay
            }
            Err(EngineError::Busy) => engine.config().min_delay,
            Err(err) => {
                failures += 1;
                match &retry {
                    Some(retry) if retry.permits(failures) => {
                        let delay = retry.delay_after(failures);
                        debug!(
                            attempt = failures,
                            delay_ms = delay.as_millis() as u64,
                            error = %err,
                            "retrying batch"
                        );
                        delay
                    }
                    _ => {
                        warn!(error = %err, "batch failed, waiting for retry");
                        tokio::select! {
                            _ = engine.retry_signal().notified() => {}
                            _ = stop.changed() => break,
                        }
                        failures = 0;
                        continue;
                    }
                }
            }
        };

        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            _ = engine.wake_signal().notified() => {
                debug!("woken by new work");
            }
            _ = stop.changed() => break,
        }
    }
    info!("polling loop stopped");
}
