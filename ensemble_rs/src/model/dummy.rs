//! Pass-through model: reports the sampler's effect. Inputs echo straight
//! into the output record; declared outputs with no like-named input receive
//! the sampling counter.

use std::collections::BTreeSet;
use std::sync::Arc;

use async_trait::async_trait;
use futures::FutureExt;

use crate::data::DataSink;
use crate::error::Result;
use crate::jobs::{Evaluation, FinishedJob, JobHandler, JobMetadata, JobPayload};
use crate::model::{
    collect_evaluation, store_baseline, InitContext, InputPacket, Model, ModelBlueprint,
    ModelVariant, RunInfo, SampleDescription, StepInput,
};
use crate::value::Value;

pub struct DummyModel {
    name: String,
    inputs: BTreeSet<String>,
    outputs: BTreeSet<String>,
}

impl DummyModel {
    pub fn new(
        name: impl Into<String>,
        inputs: impl IntoIterator<Item = impl Into<String>>,
        outputs: impl IntoIterator<Item = impl Into<String>>,
    ) -> Self {
        Self {
            name: name.into(),
            inputs: inputs.into_iter().map(Into::into).collect(),
            outputs: outputs.into_iter().map(Into::into).collect(),
        }
    }
}

pub(crate) fn construct(blueprint: ModelBlueprint) -> Result<Arc<dyn Model>> {
    let ModelBlueprint {
        name, inputs, outputs, ..
    } = blueprint;
    Ok(Arc::new(DummyModel::new(name, inputs, outputs)))
}

#[async_trait]
impl Model for DummyModel {
    fn name(&self) -> &str {
        &self.name
    }

    fn variant(&self) -> ModelVariant {
        ModelVariant::Dummy
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
        let outputs = self.outputs.clone();
        let work = async move {
            let counter = packet.sample_counter();
            let mut evaluation = Evaluation {
                inputs: packet.variables.clone(),
                ..Evaluation::default()
            };
            for key in &outputs {
                let value = packet
                    .variables
                    .get(key)
                    .cloned()
                    .unwrap_or(Value::Scalar(counter));
                evaluation.outputs.insert(key.clone(), value);
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
