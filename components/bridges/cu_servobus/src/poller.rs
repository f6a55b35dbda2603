//! Background loop publishing joint angles while the bus is idle.
//!
//! The poller shares the [`Engine`] lock with every other caller, so a
//! poll never lands in the middle of another transaction. It stays quiet
//! while the bus is disconnected or a calibration is in progress, and only
//! reports angles when some joint moved by more than the threshold.

use crate::engine::Engine;
use crate::error::ServoBusError;
use crate::transport::BusTransport;
use crate::ServoId;
use log::{debug, warn};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(250);

/// Smallest change in degrees worth reporting.
pub const DEFAULT_CHANGE_THRESHOLD: f64 = 0.5;

#[derive(Debug)]
pub enum PollEvent {
    Angles(BTreeMap<ServoId, f64>),
    Failed(ServoBusError),
}

#[derive(Debug, Clone, Copy)]
pub struct PollSettings {
    pub interval: Duration,
    pub threshold: f64,
}

impl Default for PollSettings {
    fn default() -> Self {
        Self {
            interval: DEFAULT_POLL_INTERVAL,
            threshold: DEFAULT_CHANGE_THRESHOLD,
        }
    }
}

/// True when any joint moved by more than `threshold` or the joint set changed.
pub fn angles_changed(
    previous: Option<&BTreeMap<ServoId, f64>>,
    current: &BTreeMap<ServoId, f64>,
    threshold: f64,
) -> bool {
    let Some(previous) = previous else {
        return true;
    };
    previous.len() != current.len()
        || current.iter().any(|(id, angle)| {
            previous
                .get(id)
                .is_none_or(|prev| (angle - prev).abs() > threshold)
        })
}

/// Running poll thread. Stops when dropped.
pub struct PositionPoller {
    stop: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
}

impl PositionPoller {
    pub fn spawn<T, F>(engine: Engine<T>, settings: PollSettings, mut on_event: F) -> Self
    where
        T: BusTransport + 'static,
        F: FnMut(PollEvent) + Send + 'static,
    {
        let stop = Arc::new(AtomicBool::new(false));
        let stop2 = stop.clone();
        let thread = std::thread::spawn(move || {
            let mut last: Option<BTreeMap<ServoId, f64>> = None;
            while !stop2.load(Ordering::Relaxed) {
                match engine.poll_angles() {
                    Ok(Some(angles)) => {
                        if angles_changed(last.as_ref(), &angles, settings.threshold) {
                            on_event(PollEvent::Angles(angles.clone()));
                            last = Some(angles);
                        }
                    }
                    // Paused; report everything again once it resumes.
                    Ok(None) => last = None,
                    Err(e) => {
                        warn!("position poll failed: {e}");
                        on_event(PollEvent::Failed(e));
                    }
                }
                std::thread::sleep(settings.interval);
            }
            debug!("position poller stopped");
        });
        Self {
            stop,
            thread: Some(thread),
        }
    }

    pub fn is_running(&self) -> bool {
        self.thread.as_ref().is_some_and(|t| !t.is_finished())
    }

    /// Signal the thread and wait for it to exit.
    pub fn stop(&mut self) {
        self.stop.store(true, Ordering::Relaxed);
        if let Some(thread) = self.thread.take()
            && thread.join().is_err()
        {
            warn!("position poller panicked");
        }
    }
}

impl Drop for PositionPoller {
    fn drop(&mut self) {
        self.stop();
    }
}
