//! Runs training off the interactive path.
//!
//! A [`TrainingSession`] owns at most one background training task. Starting a new task
//! cancels the previous one and discards whatever it would have produced, so only the most
//! recent request can ever be observed.

use crate::data::TrainingData;
use crate::model::FittedScoringModel;
use crate::optimizer::{BeamSearchOptimizer, CancelFlag, RiskScoreOptimizer};
use crate::trainer::{ScoringSheetTrainer, TrainingError};
use crossbeam_channel::{Receiver, RecvTimeoutError, TryRecvError, bounded};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

/// How a training task ended.
#[derive(Debug)]
pub enum TrainingOutcome {
    Completed(FittedScoringModel),
    Failed(TrainingError),
    /// The task was cancelled before it produced a model. Not an error.
    Cancelled,
}

impl TrainingOutcome {
    fn from_result(result: Result<FittedScoringModel, TrainingError>, cancelled: bool) -> Self {
        match result {
            _ if cancelled => TrainingOutcome::Cancelled,
            Ok(model) => TrainingOutcome::Completed(model),
            Err(TrainingError::Cancelled) => TrainingOutcome::Cancelled,
            Err(e) => TrainingOutcome::Failed(e),
        }
    }
}

struct InFlight {
    generation: u64,
    cancel: CancelFlag,
    receiver: Receiver<Result<FittedScoringModel, TrainingError>>,
}

impl InFlight {
    fn outcome(&self, result: Result<FittedScoringModel, TrainingError>) -> TrainingOutcome {
        TrainingOutcome::from_result(result, self.cancel.is_cancelled())
    }
}

/// Owner of the single in-flight training task.
pub struct TrainingSession<O = BeamSearchOptimizer> {
    trainer: Arc<ScoringSheetTrainer<O>>,
    generation: u64,
    in_flight: Option<InFlight>,
}

impl<O: RiskScoreOptimizer + 'static> TrainingSession<O> {
    pub fn new(trainer: ScoringSheetTrainer<O>) -> Self {
        Self {
            trainer: Arc::new(trainer),
            generation: 0,
            in_flight: None,
        }
    }

    /// Generation of the most recently started task; `0` before the first.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn is_running(&self) -> bool {
        self.in_flight.is_some()
    }

    /// Starts training on `data`, cancelling any task still running. Returns the new
    /// task's generation.
    pub fn start(&mut self, data: impl Into<Arc<TrainingData>>) -> u64 {
        if let Some(previous) = self.in_flight.take() {
            log::debug!("Cancelling training task {} in favour of a new one", previous.generation);
            previous.cancel.cancel();
        }

        self.generation += 1;
        let generation = self.generation;
        let cancel = CancelFlag::new();
        let (sender, receiver) = bounded(1);

        let trainer = Arc::clone(&self.trainer);
        let data = data.into();
        let worker_cancel = cancel.clone();
        thread::spawn(move || {
            let result = trainer.fit(&data, &worker_cancel);
            // The receiver is gone when the task was superseded.
            if sender.send(result).is_err() {
                log::debug!("Discarding result of stale training task {generation}");
            }
        });

        log::info!("Started training task {generation}");
        self.in_flight = Some(InFlight {
            generation,
            cancel,
            receiver,
        });
        generation
    }

    /// Requests cancellation of the running task. Its outcome is still collected, as
    /// [`TrainingOutcome::Cancelled`].
    pub fn cancel(&self) {
        if let Some(task) = &self.in_flight {
            log::info!("Cancelling training task {}", task.generation);
            task.cancel.cancel();
        }
    }

    /// Returns the outcome of the current task if it has finished.
    pub fn try_finish(&mut self) -> Option<(u64, TrainingOutcome)> {
        let task = self.in_flight.as_ref()?;
        let outcome = match task.receiver.try_recv() {
            Ok(result) => task.outcome(result),
            Err(TryRecvError::Empty) => return None,
            Err(TryRecvError::Disconnected) => TrainingOutcome::Failed(TrainingError::WorkerLost),
        };
        self.finish(outcome)
    }

    /// Waits up to `timeout` for the current task.
    pub fn wait_timeout(&mut self, timeout: Duration) -> Option<(u64, TrainingOutcome)> {
        let task = self.in_flight.as_ref()?;
        let outcome = match task.receiver.recv_timeout(timeout) {
            Ok(result) => task.outcome(result),
            Err(RecvTimeoutError::Timeout) => return None,
            Err(RecvTimeoutError::Disconnected) => {
                TrainingOutcome::Failed(TrainingError::WorkerLost)
            }
        };
        self.finish(outcome)
    }

    /// Blocks until the current task ends. `None` when no task is running.
    pub fn wait(&mut self) -> Option<(u64, TrainingOutcome)> {
        let task = self.in_flight.as_ref()?;
        let outcome = match task.receiver.recv() {
            Ok(result) => task.outcome(result),
            Err(_) => TrainingOutcome::Failed(TrainingError::WorkerLost),
        };
        self.finish(outcome)
    }

    fn finish(&mut self, outcome: TrainingOutcome) -> Option<(u64, TrainingOutcome)> {
        let task = self.in_flight.take()?;
        match &outcome {
            TrainingOutcome::Completed(_) => {
                log::info!("Training task {} completed", task.generation)
            }
            TrainingOutcome::Failed(e) => {
                log::warn!("Training task {} failed: {}", task.generation, e)
            }
            TrainingOutcome::Cancelled => {
                log::info!("Training task {} was cancelled", task.generation)
            }
        }
        Some((task.generation, outcome))
    }
}

impl<O> Drop for TrainingSession<O> {
    fn drop(&mut self) {
        if let Some(task) = self.in_flight.take() {
            task.cancel.cancel();
        }
    }
}
