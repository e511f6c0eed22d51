//! Fine-grained submit/poll coordination against the shared job handler.
//!
//! One coordinator exists per ensemble; all of its jobs carry compound
//! identities `model|prefix` scoped by `ensemble|prefix`, which is what keeps
//! concurrently flying samples from contaminating each other.

use std::sync::Arc;
use std::time::Duration;

use crate::error::{EnsembleError, Result};
use crate::jobs::{FinishedJob, JobHandler};
use crate::model::{InputPacket, Model, IDENTIFIER_SEPARATOR};

/// Poll granularity while waiting on slots or completion.
const POLL_INTERVAL: Duration = Duration::from_millis(1);

pub struct JobCoordinator {
    handler: Arc<dyn JobHandler>,
    ensemble: String,
}

impl JobCoordinator {
    pub fn new(handler: Arc<dyn JobHandler>, ensemble: impl Into<String>) -> Self {
        Self {
            handler,
            ensemble: ensemble.into(),
        }
    }

    pub fn handler(&self) -> &Arc<dyn JobHandler> {
        &self.handler
    }

    pub fn job_identifier(model: &str, prefix: &str) -> String {
        format!("{model}{IDENTIFIER_SEPARATOR}{prefix}")
    }

    pub fn unique_handler(&self, prefix: &str) -> String {
        format!("{}{IDENTIFIER_SEPARATOR}{prefix}", self.ensemble)
    }

    /// Wait for a free worker slot, then let the model submit its work unit.
    pub async fn submit_one(&self, model: &Arc<dyn Model>, packet: InputPacket) -> Result<()> {
        while self.handler.free_slots() == 0 {
            tokio::time::sleep(POLL_INTERVAL).await;
        }
        model.run(packet, &self.handler).await
    }

    /// Poll until the job `model|prefix` finishes, then take it. A failed
    /// evaluation drains every sibling job in the same sample scope before
    /// surfacing the failure.
    pub async fn await_one(
        &self,
        model_name: &str,
        sample_prefix: &str,
        siblings: &[String],
    ) -> Result<FinishedJob> {
        let identifier = Self::job_identifier(model_name, sample_prefix);
        let scope = self.unique_handler(sample_prefix);
        while !self.handler.is_finished(&identifier) {
            tokio::time::sleep(POLL_INTERVAL).await;
        }
        let finished = self
            .handler
            .take_finished(&identifier, &scope)
            .ok_or_else(|| EnsembleError::MissingFinishedJob {
                identifier: identifier.clone(),
                unique_handler: scope.clone(),
            })?;
        if finished.failed() {
            self.drain(sample_prefix, siblings, model_name);
            return Err(EnsembleError::SubModelFailure {
                model: model_name.to_owned(),
                prefix: sample_prefix.to_owned(),
            });
        }
        Ok(finished)
    }

    /// Discard whatever sibling results are parked under this sample's scope.
    fn drain(&self, sample_prefix: &str, siblings: &[String], except: &str) {
        let scope = self.unique_handler(sample_prefix);
        for sibling in siblings {
            if sibling == except {
                continue;
            }
            let identifier = Self::job_identifier(sibling, sample_prefix);
            let _ = self.handler.take_finished(&identifier, &scope);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn compound_identity() {
        let handler: Arc<dyn JobHandler> = crate::jobs::LocalJobHandler::new(1);
        let coordinator = JobCoordinator::new(handler, "plant");
        assert_eq!("relap|7", JobCoordinator::job_identifier("relap", "7"));
        assert_eq!("plant|7", coordinator.unique_handler("7"));
    }
}
