//! Job handling: the handler contract models submit work through, the
//! finished-job descriptor, and a default in-process worker pool.
//!
//! Two queues exist, mirroring how the driving step uses them: *worker* jobs
//! are the capacity-bounded units a sub-model submits, and *client* jobs are
//! long-lived coordination loops (one per ensemble sample) that must not eat
//! worker slots, since they themselves submit worker jobs and would deadlock
//! a full pool.

pub mod coordinator;

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use futures::future::BoxFuture;
use rustc_hash::FxHashSet;

use crate::ensemble::ResultBundle;
use crate::error::{EnsembleError, Result};
use crate::value::Value;

/// One unit of work: resolves to a payload or an opaque failure.
pub type WorkUnit = BoxFuture<'static, anyhow::Result<JobPayload>>;

/// Result of a single sub-model evaluation.
#[derive(Clone, Debug, Default)]
pub struct Evaluation {
    pub inputs: BTreeMap<String, Value>,
    pub outputs: BTreeMap<String, Value>,
    pub metadata: BTreeMap<String, serde_json::Value>,
}

/// What a finished work unit carries.
#[derive(Clone, Debug)]
pub enum JobPayload {
    /// A leaf model's evaluation.
    Evaluation(Evaluation),
    /// An ensemble sample's bundle of per-sub-model traces.
    Bundle(ResultBundle),
}

impl JobPayload {
    pub fn as_evaluation(&self) -> Option<&Evaluation> {
        match self {
            JobPayload::Evaluation(evaluation) => Some(evaluation),
            JobPayload::Bundle(_) => None,
        }
    }

    pub fn as_bundle(&self) -> Option<&ResultBundle> {
        match self {
            JobPayload::Bundle(bundle) => Some(bundle),
            JobPayload::Evaluation(_) => None,
        }
    }
}

/// Caller-supplied tags stored next to a job for diagnostics and collection.
#[derive(Clone, Debug, Default)]
pub struct JobMetadata {
    pub model: String,
    pub prefix: String,
    pub sampler_tag: String,
}

/// A completed job, parked in the handler until taken.
#[derive(Clone, Debug)]
pub struct FinishedJob {
    pub identifier: String,
    pub unique_handler: String,
    pub metadata: JobMetadata,
    pub result: Result<JobPayload, EnsembleError>,
}

impl FinishedJob {
    /// The evaluation payload, or the failure that replaced it.
    pub fn evaluation(&self) -> Result<&JobPayload, &EnsembleError> {
        self.result.as_ref()
    }

    pub fn failed(&self) -> bool {
        self.result.is_err()
    }
}

/// Contract the runtime requires from a job handler. All coordination is
/// keyed by the compound identifier (`model|prefix`) and scoped by the unique
/// handler (`ensemble|prefix`, or [`crate::model::ANY_HANDLER`]).
pub trait JobHandler: Send + Sync {
    /// Submit one worker job. Identifiers must be unique among live jobs;
    /// submitting an identity that is still running or parked is an error.
    /// Callers gate on [`JobHandler::free_slots`] before submitting.
    fn submit(
        &self,
        work: WorkUnit,
        identifier: &str,
        unique_handler: &str,
        metadata: JobMetadata,
    ) -> Result<()>;

    /// Submit a client job: coordination work that does not occupy a worker
    /// slot.
    fn submit_client(
        &self,
        work: WorkUnit,
        identifier: &str,
        unique_handler: &str,
        metadata: JobMetadata,
    ) -> Result<()>;

    /// How many worker slots are currently free.
    fn free_slots(&self) -> usize;

    /// Whether the job with this identifier has finished (and not yet been
    /// taken).
    fn is_finished(&self, identifier: &str) -> bool;

    /// Remove and return a finished job, provided the caller's scope matches
    /// the one the job was submitted under.
    fn take_finished(&self, identifier: &str, unique_handler: &str) -> Option<FinishedJob>;
}

/// Default in-process handler: a capacity-bounded tokio worker pool plus an
/// unbounded client queue. Must be used from within a tokio runtime.
pub struct LocalJobHandler {
    capacity: usize,
    state: Arc<Mutex<HandlerState>>,
}

#[derive(Default)]
struct HandlerState {
    running_workers: usize,
    running_clients: usize,
    /// Identifiers of live jobs: submitted and not yet taken. A job identity
    /// may be resubmitted once its previous incarnation has been collected
    /// (each fixed-point iteration reuses `model|prefix`).
    live_identifiers: FxHashSet<String>,
    /// Every identifier ever accepted, for diagnostics.
    history: FxHashSet<String>,
    finished: BTreeMap<String, FinishedJob>,
}

impl LocalJobHandler {
    pub fn new(capacity: usize) -> Arc<Self> {
        Arc::new(Self {
            capacity: capacity.max(1),
            state: Arc::new(Mutex::new(HandlerState::default())),
        })
    }

    fn spawn(
        &self,
        work: WorkUnit,
        identifier: &str,
        unique_handler: &str,
        metadata: JobMetadata,
        client: bool,
    ) -> Result<()> {
        {
            let mut state = self.state.lock().unwrap();
            if !state.live_identifiers.insert(identifier.to_owned()) {
                return Err(EnsembleError::DuplicateJobIdentifier(identifier.to_owned()));
            }
            state.history.insert(identifier.to_owned());
            if client {
                state.running_clients += 1;
            } else {
                state.running_workers += 1;
            }
        }
        let state = Arc::clone(&self.state);
        let identifier = identifier.to_owned();
        let unique_handler = unique_handler.to_owned();
        tokio::spawn(async move {
            let result = work.await.map_err(|err| into_job_error(&identifier, err));
            let mut state = state.lock().unwrap();
            if client {
                state.running_clients -= 1;
            } else {
                state.running_workers -= 1;
            }
            state.finished.insert(
                identifier.clone(),
                FinishedJob {
                    identifier,
                    unique_handler,
                    metadata,
                    result,
                },
            );
        });
        Ok(())
    }

    /// Worker jobs currently executing.
    pub fn in_flight(&self) -> usize {
        self.state.lock().unwrap().running_workers
    }

    /// Client jobs currently executing.
    pub fn clients_in_flight(&self) -> usize {
        self.state.lock().unwrap().running_clients
    }

    /// Every identifier this handler has ever accepted.
    pub fn identifiers_used(&self) -> Vec<String> {
        let state = self.state.lock().unwrap();
        let mut identifiers: Vec<String> = state.history.iter().cloned().collect();
        identifiers.sort_unstable();
        identifiers
    }

    /// Identifiers of finished-but-untaken jobs under the given scope.
    pub fn finished_identifiers(&self, unique_handler: &str) -> Vec<String> {
        self.state
            .lock()
            .unwrap()
            .finished
            .values()
            .filter(|job| job.unique_handler == unique_handler)
            .map(|job| job.identifier.clone())
            .collect()
    }
}

fn into_job_error(identifier: &str, err: anyhow::Error) -> EnsembleError {
    match err.downcast::<EnsembleError>() {
        Ok(typed) => typed,
        Err(opaque) => EnsembleError::WorkUnitFailed {
            identifier: identifier.to_owned(),
            message: format!("{opaque:#}"),
        },
    }
}

impl JobHandler for LocalJobHandler {
    fn submit(
        &self,
        work: WorkUnit,
        identifier: &str,
        unique_handler: &str,
        metadata: JobMetadata,
    ) -> Result<()> {
        self.spawn(work, identifier, unique_handler, metadata, false)
    }

    fn submit_client(
        &self,
        work: WorkUnit,
        identifier: &str,
        unique_handler: &str,
        metadata: JobMetadata,
    ) -> Result<()> {
        self.spawn(work, identifier, unique_handler, metadata, true)
    }

    fn free_slots(&self) -> usize {
        self.capacity
            .saturating_sub(self.state.lock().unwrap().running_workers)
    }

    fn is_finished(&self, identifier: &str) -> bool {
        self.state.lock().unwrap().finished.contains_key(identifier)
    }

    fn take_finished(&self, identifier: &str, unique_handler: &str) -> Option<FinishedJob> {
        let mut state = self.state.lock().unwrap();
        let matches = state
            .finished
            .get(identifier)
            .is_some_and(|job| job.unique_handler == unique_handler);
        if matches {
            let job = state.finished.remove(identifier);
            state.live_identifiers.remove(identifier);
            job
        } else {
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use futures::FutureExt;

    use super::*;

    fn trivial_work(value: f64) -> WorkUnit {
        async move {
            let mut evaluation = Evaluation::default();
            evaluation.outputs.insert("out".to_owned(), Value::Scalar(value));
            Ok(JobPayload::Evaluation(evaluation))
        }
        .boxed()
    }

    #[tokio::test]
    async fn submit_take_round_trip() {
        let handler = LocalJobHandler::new(2);
        handler
            .submit(trivial_work(7.0), "m|1", "ens|1", JobMetadata::default())
            .unwrap();
        while !handler.is_finished("m|1") {
            tokio::time::sleep(std::time::Duration::from_millis(1)).await;
        }
        // Wrong scope cannot take the job.
        assert!(handler.take_finished("m|1", "other|1").is_none());
        let job = handler.take_finished("m|1", "ens|1").unwrap();
        let payload = job.evaluation().unwrap();
        assert_eq!(
            Some(&Value::Scalar(7.0)),
            payload.as_evaluation().unwrap().outputs.get("out")
        );
        // Taken jobs are gone.
        assert!(!handler.is_finished("m|1"));
    }

    #[tokio::test]
    async fn identifier_reuse_is_rejected() {
        let handler = LocalJobHandler::new(1);
        handler
            .submit(trivial_work(1.0), "m|1", "ens|1", JobMetadata::default())
            .unwrap();
        let err = handler
            .submit(trivial_work(2.0), "m|1", "ens|1", JobMetadata::default())
            .unwrap_err();
        assert_eq!(EnsembleError::DuplicateJobIdentifier("m|1".to_owned()), err);
    }

    #[tokio::test]
    async fn failures_are_parked_not_panicked() {
        let handler = LocalJobHandler::new(1);
        let work: WorkUnit = async { anyhow::bail!("solver blew up") }.boxed();
        handler
            .submit(work, "m|2", "ens|2", JobMetadata::default())
            .unwrap();
        while !handler.is_finished("m|2") {
            tokio::time::sleep(std::time::Duration::from_millis(1)).await;
        }
        let job = handler.take_finished("m|2", "ens|2").unwrap();
        assert!(matches!(
            job.result,
            Err(EnsembleError::WorkUnitFailed { .. })
        ));
    }
}
