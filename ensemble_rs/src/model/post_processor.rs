//! Post-processing action: applies a registered analysis to values that were
//! already collected, rather than sampling anything new.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use async_trait::async_trait;
use futures::FutureExt;

use crate::data::DataSink;
use crate::error::{EnsembleError, Result};
use crate::jobs::{Evaluation, FinishedJob, JobHandler, JobMetadata, JobPayload};
use crate::model::{
    collect_evaluation, store_baseline, Backend, InitContext, InputPacket, Model, ModelBlueprint,
    ModelVariant, RunInfo, SampleDescription, StepInput,
};
use crate::value::Value;

/// A registered analysis over collected input values.
pub trait Analysis: Send + Sync {
    fn process(&self, inputs: &BTreeMap<String, Value>) -> anyhow::Result<BTreeMap<String, Value>>;
}

impl<F> Analysis for F
where
    F: Fn(&BTreeMap<String, Value>) -> anyhow::Result<BTreeMap<String, Value>> + Send + Sync,
{
    fn process(&self, inputs: &BTreeMap<String, Value>) -> anyhow::Result<BTreeMap<String, Value>> {
        self(inputs)
    }
}

pub struct PostProcessorModel {
    name: String,
    inputs: BTreeSet<String>,
    outputs: BTreeSet<String>,
    analysis: Arc<dyn Analysis>,
}

impl PostProcessorModel {
    pub fn new(
        name: impl Into<String>,
        inputs: impl IntoIterator<Item = impl Into<String>>,
        outputs: impl IntoIterator<Item = impl Into<String>>,
        analysis: Arc<dyn Analysis>,
    ) -> Self {
        Self {
            name: name.into(),
            inputs: inputs.into_iter().map(Into::into).collect(),
            outputs: outputs.into_iter().map(Into::into).collect(),
            analysis,
        }
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
    let Backend::Analysis(analysis) = backend else {
        return Err(EnsembleError::Configuration(format!(
            "post-processor `{name}` needs an analysis backend"
        )));
    };
    Ok(Arc::new(PostProcessorModel::new(name, inputs, outputs, analysis)))
}

#[async_trait]
impl Model for PostProcessorModel {
    fn name(&self) -> &str {
        &self.name
    }

    fn variant(&self) -> ModelVariant {
        ModelVariant::PostProcessor
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
        let analysis = Arc::clone(&self.analysis);
        let name = self.name.clone();
        let outputs = self.outputs.clone();
        let work = async move {
            let produced = analysis.process(&packet.variables)?;
            let mut evaluation = Evaluation {
                inputs: packet.variables.clone(),
                ..Evaluation::default()
            };
            for key in &outputs {
                let value = produced.get(key).ok_or_else(|| EnsembleError::Lifecycle {
                    model: name.clone(),
                    message: format!("analysis produced no value for output `{key}`"),
                })?;
                evaluation.outputs.insert(key.clone(), value.clone());
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

/// Reference analysis: mean and standard deviation of every array input,
/// published as `<name>_mean` and `<name>_sigma`.
pub struct BasicStatistics;

impl Analysis for BasicStatistics {
    fn process(&self, inputs: &BTreeMap<String, Value>) -> anyhow::Result<BTreeMap<String, Value>> {
        let mut results = BTreeMap::new();
        for (name, value) in inputs {
            let Value::Array(points) = value else {
                continue;
            };
            if points.is_empty() {
                anyhow::bail!("variable `{name}` has no points to summarize");
            }
            let n = points.len() as f64;
            let mean = points.iter().sum::<f64>() / n;
            let variance = points.iter().map(|p| (p - mean) * (p - mean)).sum::<f64>() / n;
            results.insert(format!("{name}_mean"), Value::Scalar(mean));
            results.insert(format!("{name}_sigma"), Value::Scalar(variance.sqrt()));
        }
        Ok(results)
    }
}
