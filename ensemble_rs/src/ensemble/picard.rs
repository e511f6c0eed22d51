//! Per-sample execution: one forward sweep for linear systems, Picard
//! fixed-point iteration for systems with feedback.
//!
//! The driver runs inside a client job on the handler, one instance per
//! sample. Everything it touches is sample-local: fresh trace stores, its own
//! iteration state, its own packets. Parallelism lives across samples, never
//! across the sub-models of one sample, because feedback coupling serializes
//! them.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use itertools::Itertools;
use tracing::{debug, info, warn};

use crate::config::EnsembleSettings;
use crate::data::PointSet;
use crate::ensemble::graph::ExecutionOrder;
use crate::error::{EnsembleError, Result};
use crate::jobs::coordinator::JobCoordinator;
use crate::jobs::JobHandler;
use crate::model::{InputPacket, Model};
use crate::value::Value;

/// Seed for feedback inputs that are neither sampled nor yet produced on the
/// first iteration; the single point where arbitrary seeding occurs.
pub const COLD_START_SEED: f64 = 1.0;

/// Lifecycle of one sample through the driver.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SamplePhase {
    Idle,
    Building,
    Iterating(u32),
    Converged,
    Exhausted,
    Failed,
}

/// How a sample's execution ended (failures surface as errors instead).
#[derive(Clone, Debug, PartialEq)]
pub enum SampleOutcome {
    /// Linear system, one sweep, no residual tracking.
    SingleSweep,
    Converged { iterations: u32, norm: f64 },
    Exhausted { iterations: u32, norm: f64 },
}

impl SampleOutcome {
    pub fn converged(&self) -> Option<bool> {
        match self {
            SampleOutcome::SingleSweep => None,
            SampleOutcome::Converged { .. } => Some(true),
            SampleOutcome::Exhausted { .. } => Some(false),
        }
    }

    pub fn iterations(&self) -> u32 {
        match self {
            SampleOutcome::SingleSweep => 1,
            SampleOutcome::Converged { iterations, .. }
            | SampleOutcome::Exhausted { iterations, .. } => *iterations,
        }
    }

    pub fn norm(&self) -> Option<f64> {
        match self {
            SampleOutcome::SingleSweep => None,
            SampleOutcome::Converged { norm, .. } | SampleOutcome::Exhausted { norm, .. } => {
                Some(*norm)
            }
        }
    }
}

/// Everything `collect_output` needs from one executed sample.
#[derive(Clone, Debug)]
pub struct ResultBundle {
    pub prefix: String,
    pub outcome: SampleOutcome,
    /// Per-sub-model traces accumulated over the sample's iterations.
    pub traces: BTreeMap<String, PointSet>,
}

/// Immutable per-step plan shared by every sample's driver.
pub(crate) struct SamplePlan {
    pub ensemble: String,
    pub settings: EnsembleSettings,
    pub order: ExecutionOrder,
    pub entries: BTreeMap<String, PlanEntry>,
}

pub(crate) struct PlanEntry {
    pub model: Arc<dyn Model>,
    pub inputs: BTreeSet<String>,
    pub outputs: BTreeSet<String>,
    /// Producing sub-model per internally fed input variable.
    pub upstream: BTreeMap<String, String>,
    pub trace_template: PointSet,
}

/// Current/previous iterates per sub-model output, for residual tracking.
struct IterationState {
    iterates: BTreeMap<String, ModelIterates>,
}

struct ModelIterates {
    current: BTreeMap<String, f64>,
    previous: BTreeMap<String, f64>,
}

impl IterationState {
    fn new(entries: &BTreeMap<String, PlanEntry>) -> Self {
        let iterates = entries
            .iter()
            .map(|(name, entry)| {
                let zeros: BTreeMap<String, f64> =
                    entry.outputs.iter().map(|out| (out.clone(), 0.0)).collect();
                (
                    name.clone(),
                    ModelIterates {
                        current: zeros.clone(),
                        previous: zeros,
                    },
                )
            })
            .collect();
        Self { iterates }
    }

    /// Record the newly observed outputs: previous takes the old current.
    fn shift(&mut self, model: &str, observed: &BTreeMap<String, Value>) {
        let Some(iterates) = self.iterates.get_mut(model) else {
            return;
        };
        iterates.previous = iterates.current.clone();
        for (key, value) in observed {
            if let Some(scalar) = value.coupling_scalar() {
                iterates.current.insert(key.clone(), scalar);
            }
        }
    }

    /// Euclidean norm of the concatenated iterate-difference vector.
    fn total_norm(&self) -> f64 {
        self.iterates
            .values()
            .flat_map(|iterates| {
                iterates
                    .current
                    .iter()
                    .map(|(key, current)| {
                        let previous = iterates.previous.get(key).copied().unwrap_or(0.0);
                        current - previous
                    })
                    .collect_vec()
            })
            .map(|difference| difference * difference)
            .sum::<f64>()
            .sqrt()
    }
}

/// Execute one sample to completion. `packet` is the bundle built by
/// `create_new_input`: one nested packet per sub-model, tagged with the
/// sample prefix.
pub(crate) async fn execute_sample(
    plan: Arc<SamplePlan>,
    packet: InputPacket,
    handler: Arc<dyn JobHandler>,
) -> Result<ResultBundle> {
    let sample_prefix = packet.prefix.clone();
    let coordinator = JobCoordinator::new(handler, plan.ensemble.clone());
    let cyclic = plan.order.cyclic;
    let sibling_names: Vec<String> = plan.order.order.clone();

    let mut phase = SamplePhase::Building;
    debug!(ensemble = %plan.ensemble, prefix = %sample_prefix, ?phase, "preparing sample");
    let mut packets = packet.nested;
    let mut traces: BTreeMap<String, PointSet> = plan
        .entries
        .iter()
        .map(|(name, entry)| (name.clone(), entry.trace_template.fresh()))
        .collect();
    let mut state = cyclic.then(|| IterationState::new(&plan.entries));
    let max_iterations = if cyclic { plan.settings.max_iterations } else { 1 };

    let mut outcome = None;
    let mut last_norm = 0.0;
    for iteration in 1..=max_iterations {
        phase = SamplePhase::Iterating(iteration);
        debug!(ensemble = %plan.ensemble, prefix = %sample_prefix, ?phase, "sweep");
        for model_name in &plan.order.order {
            let entry = plan
                .entries
                .get(model_name)
                .ok_or_else(|| EnsembleError::Configuration(format!(
                    "execution order names unknown sub-model `{model_name}`"
                )))?;
            let base = packets
                .get(model_name)
                .ok_or_else(|| EnsembleError::Configuration(format!(
                    "no input packet for sub-model `{model_name}`"
                )))?;

            // Latest value of every input fed from inside the ensemble.
            let mut dependent: BTreeMap<String, Value> = entry
                .upstream
                .iter()
                .filter_map(|(variable, producer)| {
                    traces
                        .get(producer)
                        .and_then(|trace| trace.latest(variable))
                        .map(|value| (variable.clone(), value.clone()))
                })
                .collect();
            if iteration == 1 && cyclic {
                for variable in &entry.inputs {
                    if !dependent.contains_key(variable)
                        && !base.sampled_vars.contains_key(variable)
                    {
                        dependent.insert(variable.clone(), Value::Scalar(COLD_START_SEED));
                    }
                }
            }

            let updated = entry
                .model
                .update_input_from_outside(base, &dependent)
                .stamped(
                    JobCoordinator::job_identifier(model_name, &sample_prefix),
                    coordinator.unique_handler(&sample_prefix),
                );
            packets.insert(model_name.clone(), updated.clone());

            coordinator.submit_one(&entry.model, updated).await?;
            let finished = match coordinator
                .await_one(model_name, &sample_prefix, &sibling_names)
                .await
            {
                Ok(finished) => finished,
                Err(err) => {
                    phase = SamplePhase::Failed;
                    debug!(ensemble = %plan.ensemble, prefix = %sample_prefix, ?phase, "sample failed");
                    return Err(err);
                }
            };

            let trace = traces.get_mut(model_name).expect("trace per entry");
            entry.model.collect_output(&finished, trace)?;
            if let Some(state) = state.as_mut() {
                state.shift(model_name, &trace.latest_outputs());
            }
        }

        if let Some(state) = state.as_ref() {
            last_norm = state.total_norm();
            info!(
                ensemble = %plan.ensemble,
                prefix = %sample_prefix,
                iteration,
                norm = last_norm,
                "fixed-point residual"
            );
            if last_norm <= plan.settings.tolerance {
                phase = SamplePhase::Converged;
                outcome = Some(SampleOutcome::Converged {
                    iterations: iteration,
                    norm: last_norm,
                });
                break;
            }
        }
    }

    let outcome = match outcome {
        Some(outcome) => outcome,
        None if cyclic => {
            phase = SamplePhase::Exhausted;
            warn!(
                ensemble = %plan.ensemble,
                prefix = %sample_prefix,
                iterations = max_iterations,
                norm = last_norm,
                "fixed-point iteration exhausted without convergence"
            );
            if plan.settings.fatal_on_non_convergence {
                return Err(EnsembleError::PicardNonConvergence {
                    prefix: sample_prefix,
                    norm: last_norm,
                    iterations: max_iterations,
                });
            }
            SampleOutcome::Exhausted {
                iterations: max_iterations,
                norm: last_norm,
            }
        }
        None => {
            phase = SamplePhase::Converged;
            SampleOutcome::SingleSweep
        }
    };
    debug!(ensemble = %plan.ensemble, prefix = %sample_prefix, ?phase, "sample done");

    Ok(ResultBundle {
        prefix: sample_prefix,
        outcome,
        traces,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn residual_norm_concatenates_all_outputs() {
        let entries = BTreeMap::from([
            (
                "a".to_owned(),
                PlanEntry {
                    model: Arc::new(crate::model::dummy::DummyModel::new(
                        "a",
                        Vec::<String>::new(),
                        vec!["y"],
                    )) as Arc<dyn Model>,
                    inputs: BTreeSet::new(),
                    outputs: BTreeSet::from(["y".to_owned()]),
                    upstream: BTreeMap::new(),
                    trace_template: PointSet::new("aData", Vec::<String>::new(), vec!["y"]),
                },
            ),
            (
                "b".to_owned(),
                PlanEntry {
                    model: Arc::new(crate::model::dummy::DummyModel::new(
                        "b",
                        Vec::<String>::new(),
                        vec!["z"],
                    )) as Arc<dyn Model>,
                    inputs: BTreeSet::new(),
                    outputs: BTreeSet::from(["z".to_owned()]),
                    upstream: BTreeMap::new(),
                    trace_template: PointSet::new("bData", Vec::<String>::new(), vec!["z"]),
                },
            ),
        ]);
        let mut state = IterationState::new(&entries);
        state.shift("a", &BTreeMap::from([("y".to_owned(), Value::Scalar(3.0))]));
        state.shift("b", &BTreeMap::from([("z".to_owned(), Value::Scalar(4.0))]));
        // Both previous iterates are zero: norm = sqrt(3^2 + 4^2).
        assert!((state.total_norm() - 5.0).abs() < 1e-12);

        state.shift("a", &BTreeMap::from([("y".to_owned(), Value::Scalar(3.0))]));
        state.shift("b", &BTreeMap::from([("z".to_owned(), Value::Scalar(4.0))]));
        assert_eq!(0.0, state.total_norm());
    }
}
