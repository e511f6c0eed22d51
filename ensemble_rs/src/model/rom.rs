//! Reduced-order model: learns from collected realizations, then predicts.
//!
//! The learning algorithm lives behind the [`Surrogate`] seam; the adapter
//! only enforces the train-before-evaluate lifecycle and moves values in and
//! out of the job handler. A nearest-neighbor backend is included as the
//! reference implementation.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use futures::FutureExt;

use crate::data::{DataSink, ParameterRole, PointSet};
use crate::error::{EnsembleError, Result};
use crate::jobs::{Evaluation, FinishedJob, JobHandler, JobMetadata, JobPayload};
use crate::model::{
    collect_evaluation, store_baseline, Backend, InitContext, InputPacket, Model, ModelBlueprint,
    ModelVariant, RunInfo, SampleDescription, StepInput,
};
use crate::value::Value;

/// A trainable predictor over scalar input/output spaces.
pub trait Surrogate: Send + Sync {
    fn train(&self, training_set: &PointSet) -> anyhow::Result<()>;
    fn evaluate(&self, request: &BTreeMap<String, f64>) -> anyhow::Result<BTreeMap<String, f64>>;
    fn reset(&self);
}

pub struct SurrogateModel {
    name: String,
    inputs: BTreeSet<String>,
    outputs: BTreeSet<String>,
    backend: Arc<dyn Surrogate>,
    trained: AtomicBool,
}

impl SurrogateModel {
    pub fn new(
        name: impl Into<String>,
        inputs: impl IntoIterator<Item = impl Into<String>>,
        outputs: impl IntoIterator<Item = impl Into<String>>,
        backend: Arc<dyn Surrogate>,
    ) -> Self {
        Self {
            name: name.into(),
            inputs: inputs.into_iter().map(Into::into).collect(),
            outputs: outputs.into_iter().map(Into::into).collect(),
            backend,
            trained: AtomicBool::new(false),
        }
    }

    /// Learn from a set of realizations. Must happen before initialize.
    pub fn train(&self, training_set: &PointSet) -> Result<()> {
        self.backend
            .train(training_set)
            .map_err(|err| EnsembleError::Lifecycle {
                model: self.name.clone(),
                message: format!("training failed: {err:#}"),
            })?;
        self.trained.store(true, Ordering::Release);
        Ok(())
    }

    /// Forget the trained state.
    pub fn reset(&self) {
        self.backend.reset();
        self.trained.store(false, Ordering::Release);
    }

    pub fn is_trained(&self) -> bool {
        self.trained.load(Ordering::Acquire)
    }
}

pub(crate) fn construct(blueprint: ModelBlueprint) -> Result<Arc<dyn Model>> {
    let ModelBlueprint {
        name,
        inputs,
        outputs,
        backend,
        ..
    } = blueprint;
    let Backend::Surrogate(backend) = backend else {
        return Err(EnsembleError::Configuration(format!(
            "ROM `{name}` needs a surrogate backend"
        )));
    };
    Ok(Arc::new(SurrogateModel::new(name, inputs, outputs, backend)))
}

#[async_trait]
impl Model for SurrogateModel {
    fn name(&self) -> &str {
        &self.name
    }

    fn variant(&self) -> ModelVariant {
        ModelVariant::Rom
    }

    fn declared_inputs(&self) -> BTreeSet<String> {
        self.inputs.clone()
    }

    fn declared_outputs(&self) -> BTreeSet<String> {
        self.outputs.clone()
    }

    async fn initialize(
        &self,
        _run_info: &RunInfo,
        _inputs: &[StepInput],
        _init: &InitContext,
    ) -> Result<()> {
        if !self.is_trained() {
            return Err(EnsembleError::Lifecycle {
                model: self.name.clone(),
                message: "surrogate must be trained before the step starts".to_owned(),
            });
        }
        Ok(())
    }

    fn create_new_input(
        &self,
        my_input: &[StepInput],
        sampler_tag: &str,
        sample: &SampleDescription,
    ) -> Result<InputPacket> {
        let mut packet = InputPacket::new(&self.name, sample);
        packet.sampler_tag = sampler_tag.to_owned();
        for (key, value) in store_baseline(my_input, &self.inputs) {
            packet.variables.entry(key).or_insert(value);
        }
        Ok(packet)
    }

    async fn run(&self, packet: InputPacket, handler: &Arc<dyn JobHandler>) -> Result<()> {
        let identifier = packet.prefix.clone();
        let unique_handler = packet.unique_handler.clone();
        let metadata = JobMetadata {
            model: self.name.clone(),
            prefix: packet.prefix.clone(),
            sampler_tag: packet.sampler_tag.clone(),
        };
        let backend = Arc::clone(&self.backend);
        let name = self.name.clone();
        let inputs = self.inputs.clone();
        let outputs = self.outputs.clone();
        let work = async move {
            let mut request = BTreeMap::new();
            for key in &inputs {
                let value = packet.variables.get(key).ok_or_else(|| EnsembleError::Lifecycle {
                    model: name.clone(),
                    message: format!("evaluation request is missing input `{key}`"),
                })?;
                request.insert(key.clone(), value.expect_scalar(key)?);
            }
            let prediction = backend.evaluate(&request)?;
            let mut evaluation = Evaluation {
                inputs: packet.variables.clone(),
                ..Evaluation::default()
            };
            for key in &outputs {
                let value = prediction.get(key).ok_or_else(|| EnsembleError::Lifecycle {
                    model: name.clone(),
                    message: format!("surrogate produced no value for output `{key}`"),
                })?;
                evaluation.outputs.insert(key.clone(), Value::Scalar(*value));
            }
            Ok(JobPayload::Evaluation(evaluation))
        }
        .boxed();
        handler.submit(work, &identifier, &unique_handler, metadata)
    }

    fn collect_output(&self, finished: &FinishedJob, sink: &mut dyn DataSink) -> Result<()> {
        collect_evaluation(&self.name, finished, sink)
    }
}

/// Reference backend: predicts with the outputs of the nearest training
/// point in Euclidean input space.
#[derive(Default)]
pub struct NearestNeighborSurrogate {
    rows: Mutex<Vec<(BTreeMap<String, f64>, BTreeMap<String, f64>)>>,
}

impl Surrogate for NearestNeighborSurrogate {
    fn train(&self, training_set: &PointSet) -> anyhow::Result<()> {
        let input_keys = training_set.para_keys(ParameterRole::Input);
        let output_keys = training_set.para_keys(ParameterRole::Output);
        let realizations = input_keys
            .first()
            .and_then(|key| training_set.input_column(key))
            .map_or(0, <[Value]>::len);
        if realizations == 0 {
            anyhow::bail!("training set is empty");
        }
        let mut rows = Vec::with_capacity(realizations);
        for row in 0..realizations {
            let mut inputs = BTreeMap::new();
            for key in &input_keys {
                let column = training_set
                    .input_column(key)
                    .ok_or_else(|| anyhow::anyhow!("missing input column `{key}`"))?;
                inputs.insert(key.clone(), column[row].expect_scalar(key)?);
            }
            let mut outputs = BTreeMap::new();
            for key in &output_keys {
                let column = training_set
                    .output_column(key)
                    .ok_or_else(|| anyhow::anyhow!("missing output column `{key}`"))?;
                outputs.insert(key.clone(), column[row].expect_scalar(key)?);
            }
            rows.push((inputs, outputs));
        }
        *self.rows.lock().unwrap() = rows;
        Ok(())
    }

    fn evaluate(&self, request: &BTreeMap<String, f64>) -> anyhow::Result<BTreeMap<String, f64>> {
        let rows = self.rows.lock().unwrap();
        let nearest = rows
            .iter()
            .min_by(|(a, _), (b, _)| {
                let da = distance(request, a);
                let db = distance(request, b);
                da.total_cmp(&db)
            })
            .ok_or_else(|| anyhow::anyhow!("surrogate has not been trained"))?;
        Ok(nearest.1.clone())
    }

    fn reset(&self) {
        self.rows.lock().unwrap().clear();
    }
}

fn distance(request: &BTreeMap<String, f64>, row: &BTreeMap<String, f64>) -> f64 {
    request
        .iter()
        .map(|(key, value)| {
            let other = row.get(key).copied().unwrap_or(0.0);
            (value - other) * (value - other)
        })
        .sum::<f64>()
        .sqrt()
}
