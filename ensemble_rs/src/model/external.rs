//! User-supplied code blocks.
//!
//! User code never sees runtime internals: each invocation receives a
//! [`ScratchNamespace`] populated from the declared variables, runs, and the
//! declared outputs are projected back out. Variable kinds are pinned on
//! first sight and enforced on every later call, so a code block cannot
//! silently change a scalar into an array halfway through a step.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use futures::FutureExt;

use crate::data::DataSink;
use crate::error::{EnsembleError, Result};
use crate::jobs::{Evaluation, FinishedJob, JobHandler, JobMetadata, JobPayload};
use crate::model::{
    collect_evaluation, store_baseline, Backend, InitContext, InputPacket, Model, ModelBlueprint,
    ModelVariant, RunInfo, SampleDescription, StepInput,
};
use crate::value::{Value, ValueKind};

/// Mapping from variable name to variant value, handed into and returned
/// from each user-code invocation.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ScratchNamespace {
    values: BTreeMap<String, Value>,
}

impl ScratchNamespace {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, name: &str) -> Option<&Value> {
        self.values.get(name)
    }

    pub fn scalar(&self, name: &str) -> Result<f64> {
        self.values
            .get(name)
            .ok_or_else(|| EnsembleError::TypeMismatch {
                variable: name.to_owned(),
                expected: "scalar".to_owned(),
                got: "absent".to_owned(),
            })?
            .expect_scalar(name)
    }

    pub fn set(&mut self, name: impl Into<String>, value: impl Into<Value>) {
        self.values.insert(name.into(), value.into());
    }

    pub fn remove(&mut self, name: &str) -> Option<Value> {
        self.values.remove(name)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Value)> {
        self.values.iter()
    }

    /// Keep only the listed names.
    fn project(&mut self, names: &BTreeSet<String>) {
        self.values.retain(|name, _| names.contains(name));
    }
}

/// A user-supplied compute block. Implemented for plain closures so tests
/// and small couplings need no named type.
pub trait UserCode: Send + Sync {
    /// One-time hook at step start; state stored here is visible to every
    /// later `run` through the namespace snapshot.
    fn initialize(&self, _namespace: &mut ScratchNamespace, _run_info: &RunInfo) -> anyhow::Result<()> {
        Ok(())
    }

    fn run(&self, namespace: &mut ScratchNamespace) -> anyhow::Result<()>;
}

impl<F> UserCode for F
where
    F: Fn(&mut ScratchNamespace) -> anyhow::Result<()> + Send + Sync,
{
    fn run(&self, namespace: &mut ScratchNamespace) -> anyhow::Result<()> {
        self(namespace)
    }
}

pub struct ExternalModel {
    name: String,
    inputs: BTreeSet<String>,
    outputs: BTreeSet<String>,
    code: Arc<dyn UserCode>,
    init_namespace: Mutex<ScratchNamespace>,
    /// Variable kind pinned at first observation, per variable.
    kinds: Arc<Mutex<BTreeMap<String, ValueKind>>>,
}

impl ExternalModel {
    pub fn new(
        name: impl Into<String>,
        inputs: impl IntoIterator<Item = impl Into<String>>,
        outputs: impl IntoIterator<Item = impl Into<String>>,
        code: Arc<dyn UserCode>,
    ) -> Self {
        Self {
            name: name.into(),
            inputs: inputs.into_iter().map(Into::into).collect(),
            outputs: outputs.into_iter().map(Into::into).collect(),
            code,
            init_namespace: Mutex::new(ScratchNamespace::new()),
            kinds: Arc::new(Mutex::new(BTreeMap::new())),
        }
    }

    /// Convenience for closure-backed models.
    pub fn from_fn(
        name: impl Into<String>,
        inputs: impl IntoIterator<Item = impl Into<String>>,
        outputs: impl IntoIterator<Item = impl Into<String>>,
        code: impl Fn(&mut ScratchNamespace) -> anyhow::Result<()> + Send + Sync + 'static,
    ) -> Self {
        Self::new(name, inputs, outputs, Arc::new(code))
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
    let Backend::UserCode(code) = backend else {
        return Err(EnsembleError::Configuration(format!(
            "external model `{name}` needs a user code backend"
        )));
    };
    Ok(Arc::new(ExternalModel::new(name, inputs, outputs, code)))
}

fn check_kinds(
    kinds: &Mutex<BTreeMap<String, ValueKind>>,
    namespace: &ScratchNamespace,
) -> Result<()> {
    let mut kinds = kinds.lock().unwrap();
    for (name, value) in namespace.iter() {
        let kind = value.kind();
        match kinds.get(name) {
            None => {
                kinds.insert(name.clone(), kind);
            }
            Some(expected) if *expected == kind => {}
            Some(expected) => {
                return Err(EnsembleError::TypeMismatch {
                    variable: name.clone(),
                    expected: expected.to_string(),
                    got: kind.to_string(),
                });
            }
        }
    }
    Ok(())
}

#[async_trait]
impl Model for ExternalModel {
    fn name(&self) -> &str {
        &self.name
    }

    fn variant(&self) -> ModelVariant {
        ModelVariant::ExternalModel
    }

    fn declared_inputs(&self) -> BTreeSet<String> {
        self.inputs.clone()
    }

    fn declared_outputs(&self) -> BTreeSet<String> {
        self.outputs.clone()
    }

    async fn initialize(
        &self,
        run_info: &RunInfo,
        _inputs: &[StepInput],
        _init: &InitContext,
    ) -> Result<()> {
        self.kinds.lock().unwrap().clear();
        let mut namespace = ScratchNamespace::new();
        self.code
            .initialize(&mut namespace, run_info)
            .map_err(|err| EnsembleError::Lifecycle {
                model: self.name.clone(),
                message: format!("user code initialize failed: {err:#}"),
            })?;
        *self.init_namespace.lock().unwrap() = namespace;
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
        let code = Arc::clone(&self.code);
        let kinds = Arc::clone(&self.kinds);
        let name = self.name.clone();
        let inputs = self.inputs.clone();
        let outputs = self.outputs.clone();
        let seed = self.init_namespace.lock().unwrap().clone();
        let work = async move {
            let mut namespace = seed;
            for key in &inputs {
                let value = packet.variables.get(key).ok_or_else(|| EnsembleError::Lifecycle {
                    model: name.clone(),
                    message: format!("input variable `{key}` missing from packet"),
                })?;
                namespace.set(key.clone(), value.clone());
            }
            code.run(&mut namespace)?;
            let keep: BTreeSet<String> = inputs.union(&outputs).cloned().collect();
            namespace.project(&keep);
            check_kinds(&kinds, &namespace)?;
            let mut evaluation = Evaluation {
                inputs: packet.variables.clone(),
                ..Evaluation::default()
            };
            for key in &outputs {
                let value = namespace.get(key).ok_or_else(|| EnsembleError::Lifecycle {
                    model: name.clone(),
                    message: format!("user code produced no value for output `{key}`"),
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
