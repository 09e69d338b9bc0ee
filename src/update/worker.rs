use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError, TryRecvError};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use tracing::{debug, error, warn};

use super::download::CancelToken;
use super::error::UpdateError;
use super::pipeline::{ConsentPrompt, Hooks, Notifier, Observer, Outcome, Stage, Trigger, UpdatePipeline};

const WORKER_DIED: &str = "update worker terminated unexpectedly";

/// Marks a run as in flight; cleared on drop, including during unwinding
struct InFlight(Arc<AtomicBool>);

impl InFlight {
    fn acquire(flag: &Arc<AtomicBool>) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .ok()
            .map(|_| Self(Arc::clone(flag)))
    }
}

impl Drop for InFlight {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

/// Runs the pipeline off the caller's thread, one run at a time.
pub struct UpdateService {
    pipeline: Arc<UpdatePipeline>,
    consent: Arc<dyn ConsentPrompt>,
    notifier: Arc<dyn Notifier>,
    in_flight: Arc<AtomicBool>,
}

impl UpdateService {
    pub fn new(
        pipeline: UpdatePipeline,
        consent: impl ConsentPrompt + 'static,
        notifier: impl Notifier + 'static,
    ) -> Self {
        Self {
            pipeline: Arc::new(pipeline),
            consent: Arc::new(consent),
            notifier: Arc::new(notifier),
            in_flight: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn is_running(&self) -> bool {
        self.in_flight.load(Ordering::SeqCst)
    }

    /// Start a run on a background thread.
    ///
    /// Returns [`UpdateError::Busy`] if another run has not finished yet.
    pub fn start(&self, trigger: Trigger, mut observer: Box<dyn Observer>) -> Result<UpdateTask, UpdateError> {
        let guard = InFlight::acquire(&self.in_flight).ok_or(UpdateError::Busy)?;

        let (tx, rx) = mpsc::channel();
        let cancel = CancelToken::new();
        let worker_cancel = cancel.clone();
        let pipeline = Arc::clone(&self.pipeline);
        let consent = Arc::clone(&self.consent);
        let notifier = Arc::clone(&self.notifier);

        let handle = thread::Builder::new()
            .name("ocr-update".to_string())
            .spawn(move || {
                let result = panic::catch_unwind(AssertUnwindSafe(|| {
                    let mut hooks = Hooks {
                        consent: consent.as_ref(),
                        notifier: notifier.as_ref(),
                        observer: observer.as_mut(),
                        cancel: &worker_cancel,
                    };
                    pipeline.run(trigger, &mut hooks)
                }));

                let outcome = result.unwrap_or_else(|_| {
                    error!("update worker panicked");
                    let outcome = worker_died();
                    if let Outcome::Failed { stage, reason } = &outcome {
                        notifier.notify(false, &format!("Update failed during {}: {}", stage, reason));
                    }
                    outcome
                });

                // Release before reporting so a caller reacting to the
                // outcome can start the next run immediately.
                drop(guard);
                let _ = tx.send(outcome);
            })
            .map_err(UpdateError::Spawn)?;

        debug!(?trigger, "update worker started");
        Ok(UpdateTask {
            outcome: rx,
            cancel,
            handle: Some(handle),
        })
    }

    /// Trigger a periodic run every `interval` until the handle is stopped.
    /// Ticks that find a run already in flight are skipped.
    pub fn spawn_periodic(self: &Arc<Self>, interval: Duration) -> Result<PeriodicHandle, UpdateError> {
        let (stop_tx, stop_rx) = mpsc::channel::<()>();
        let service = Arc::clone(self);

        let handle = thread::Builder::new()
            .name("ocr-update-timer".to_string())
            .spawn(move || loop {
                match service.start(Trigger::Periodic, Box::new(())) {
                    Ok(task) => {
                        let outcome = task.wait();
                        debug!(?outcome, "periodic update check finished");
                    }
                    Err(UpdateError::Busy) => debug!("update already running; skipping tick"),
                    Err(e) => warn!("periodic update check not started: {}", e),
                }

                match stop_rx.recv_timeout(interval) {
                    Err(RecvTimeoutError::Timeout) => continue,
                    _ => break,
                }
            })
            .map_err(UpdateError::Spawn)?;

        Ok(PeriodicHandle {
            stop: Some(stop_tx),
            handle: Some(handle),
        })
    }
}

fn worker_died() -> Outcome {
    Outcome::Failed {
        stage: Stage::Worker,
        reason: WORKER_DIED.to_string(),
    }
}

/// Handle to one background run
pub struct UpdateTask {
    outcome: mpsc::Receiver<Outcome>,
    cancel: CancelToken,
    handle: Option<JoinHandle<()>>,
}

impl UpdateTask {
    /// Ask the run to stop. Only honored while downloading.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    /// Non-blocking poll. Yields the outcome at most once.
    pub fn try_outcome(&self) -> Option<Outcome> {
        match self.outcome.try_recv() {
            Ok(outcome) => Some(outcome),
            Err(TryRecvError::Empty) => None,
            Err(TryRecvError::Disconnected) => Some(worker_died()),
        }
    }

    /// Block until the run finishes
    pub fn wait(mut self) -> Outcome {
        let outcome = self.outcome.recv().unwrap_or_else(|_| worker_died());
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
        outcome
    }
}

/// Stops the periodic timer when dropped or stopped
pub struct PeriodicHandle {
    stop: Option<mpsc::Sender<()>>,
    handle: Option<JoinHandle<()>>,
}

impl PeriodicHandle {
    /// Stop the timer and wait for any run it started to finish
    pub fn stop(mut self) {
        self.shutdown();
    }

    /// Block for as long as the timer runs, which is until the process exits
    pub fn wait(mut self) {
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }

    fn shutdown(&mut self) {
        self.stop.take();
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for PeriodicHandle {
    fn drop(&mut self) {
        self.shutdown();
    }
}
