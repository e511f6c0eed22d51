//! The uniform model contract.
//!
//! Every compute element, from a pass-through to a full ensemble, exposes the
//! same four-phase lifecycle (`initialize` → `create_new_input` → `run` →
//! `collect_output`) so samplers and optimizers can drive them
//! interchangeably. Concrete variants differ only in what `run` dispatches to
//! the job handler.

use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;
use std::sync::{Arc, OnceLock};

use async_trait::async_trait;

use crate::data::{DataSink, GroupAttributes, SharedStore};
use crate::error::{EnsembleError, Result};
use crate::jobs::{FinishedJob, JobHandler};
use crate::value::Value;

pub mod code;
pub mod dummy;
pub mod external;
pub mod post_processor;
pub mod rom;

/// Coordination scope for jobs not owned by any enclosing sample.
pub const ANY_HANDLER: &str = "any";

/// Separator inside compound job identifiers (`model|prefix`) and unique
/// handlers (`ensemble|prefix`).
pub const IDENTIFIER_SEPARATOR: char = '|';

/// Step-level run information handed to every model at initialize.
#[derive(Clone, Debug)]
pub struct RunInfo {
    /// Root directory for models that materialize files.
    pub working_dir: PathBuf,
}

impl Default for RunInfo {
    fn default() -> Self {
        Self {
            working_dir: std::env::temp_dir(),
        }
    }
}

/// Per-step initialize context.
#[derive(Clone, Debug, Default)]
pub struct InitContext {
    /// Variable names the driving sampler will provide with every sample.
    pub sampled_variables: BTreeSet<String>,
}

/// Objects passed with an input role in the step; routed to models by name.
#[derive(Clone)]
pub enum StepInput {
    /// A data store whose latest realization seeds the model's input space.
    Store(SharedStore),
    /// An on-disk input file, for models that drive external executables.
    File { name: String, path: PathBuf },
}

impl StepInput {
    pub fn name(&self) -> String {
        match self {
            StepInput::Store(store) => store.lock().unwrap().name().to_owned(),
            StepInput::File { name, .. } => name.clone(),
        }
    }
}

/// What the sampler supplies for one evaluation.
#[derive(Clone, Debug, Default)]
pub struct SampleDescription {
    /// Globally unique tag for this evaluation.
    pub prefix: String,
    pub sampler_tag: String,
    pub sampled_vars: BTreeMap<String, Value>,
    pub sampled_vars_pb: BTreeMap<String, f64>,
    /// Free-form extras threaded through to job metadata.
    pub extra: BTreeMap<String, serde_json::Value>,
}

/// Opaque per-invocation input descriptor.
///
/// Packets are value types: every update produces a new packet, which is what
/// isolates concurrent samples from one another.
#[derive(Clone, Debug, PartialEq)]
pub struct InputPacket {
    pub model: String,
    /// Job identity; starts as the sample prefix and is stamped to
    /// `model|prefix` when the packet is dispatched inside an ensemble.
    pub prefix: String,
    pub unique_handler: String,
    pub sampler_tag: String,
    pub sampled_vars: BTreeMap<String, Value>,
    pub sampled_vars_pb: BTreeMap<String, f64>,
    /// Fully resolved input variables for this invocation.
    pub variables: BTreeMap<String, Value>,
    /// Per-sub-model packets when this packet drives a composite model.
    pub nested: BTreeMap<String, InputPacket>,
}

impl InputPacket {
    pub fn new(model: impl Into<String>, sample: &SampleDescription) -> Self {
        let variables = sample.sampled_vars.clone();
        Self {
            model: model.into(),
            prefix: sample.prefix.clone(),
            unique_handler: ANY_HANDLER.to_owned(),
            sampler_tag: sample.sampler_tag.clone(),
            sampled_vars: sample.sampled_vars.clone(),
            sampled_vars_pb: sample.sampled_vars_pb.clone(),
            variables,
            nested: BTreeMap::new(),
        }
    }

    /// New packet with upstream-produced values folded in. Overridden
    /// variables also join the sampled set so downstream subsetting sees
    /// them; their probability weight becomes 1.0 (the weight belongs to the
    /// producing model's sample, not this one).
    pub fn with_overrides(&self, overrides: &BTreeMap<String, Value>) -> Self {
        let mut next = self.clone();
        for (key, value) in overrides {
            next.variables.insert(key.clone(), value.clone());
            next.sampled_vars.insert(key.clone(), value.clone());
            next.sampled_vars_pb.insert(key.clone(), 1.0);
        }
        next
    }

    /// New packet with job identity stamped on.
    pub fn stamped(&self, prefix: impl Into<String>, unique_handler: impl Into<String>) -> Self {
        let mut next = self.clone();
        next.prefix = prefix.into();
        next.unique_handler = unique_handler.into();
        next
    }

    /// The sample counter encoded in the prefix tail, used by models whose
    /// output is the sampling counter itself.
    pub fn sample_counter(&self) -> f64 {
        self.prefix
            .rsplit(IDENTIFIER_SEPARATOR)
            .next()
            .and_then(|tail| tail.parse::<f64>().ok())
            .unwrap_or(0.0)
    }
}

/// Uniform contract every model variant implements.
///
/// Methods take `&self`; variants keep their mutable pieces behind interior
/// mutability so instances can be shared across concurrently running samples.
#[async_trait]
pub trait Model: Send + Sync {
    fn name(&self) -> &str;

    #[doc(hidden)]
    fn debug_fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Model({})", self.name())
    }

    fn variant(&self) -> ModelVariant;

    /// Static input declarations consumed by dependency resolution.
    fn declared_inputs(&self) -> BTreeSet<String>;

    /// Static output declarations consumed by dependency resolution.
    fn declared_outputs(&self) -> BTreeSet<String>;

    /// External modules/executables this model depends on; composite models
    /// merge these lists at initialize.
    fn dependent_modules(&self) -> Vec<String> {
        Vec::new()
    }

    /// One-time per step, before any `create_new_input`.
    async fn initialize(
        &self,
        run_info: &RunInfo,
        inputs: &[StepInput],
        init: &InitContext,
    ) -> Result<()>;

    /// Build the per-invocation input descriptor. Pure with respect to the
    /// caller-supplied inputs: repeated calls with equal arguments produce
    /// equivalent packets.
    fn create_new_input(
        &self,
        my_input: &[StepInput],
        sampler_tag: &str,
        sample: &SampleDescription,
    ) -> Result<InputPacket>;

    /// Fold values produced upstream in the same sample into the packet.
    /// Returns a new packet; the original is untouched.
    fn update_input_from_outside(
        &self,
        packet: &InputPacket,
        overrides: &BTreeMap<String, Value>,
    ) -> InputPacket {
        packet.with_overrides(overrides)
    }

    /// Submit one unit of work identified by the packet's prefix and return;
    /// completion is observed through the handler.
    async fn run(&self, packet: InputPacket, handler: &Arc<dyn JobHandler>) -> Result<()>;

    /// Drain one completed job's evaluation into the sink.
    fn collect_output(&self, finished: &FinishedJob, sink: &mut dyn DataSink) -> Result<()>;
}

impl std::fmt::Debug for dyn Model {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.debug_fmt(f)
    }
}

/// Drain a leaf evaluation into a sink; shared by the concrete variants.
pub(crate) fn collect_evaluation(
    model: &str,
    finished: &FinishedJob,
    sink: &mut dyn DataSink,
) -> Result<()> {
    let payload = finished.evaluation().map_err(Clone::clone)?;
    let evaluation = payload
        .as_evaluation()
        .ok_or_else(|| EnsembleError::Lifecycle {
            model: model.to_owned(),
            message: format!(
                "job `{}` did not carry a single-model evaluation",
                finished.identifier
            ),
        })?;
    if sink.kind().is_grouped() {
        sink.add_group(&GroupAttributes {
            group: format!("{}{}", model, finished.identifier),
        });
    }
    for (key, value) in &evaluation.inputs {
        sink.update_input_value(key, value.clone());
    }
    for (key, value) in &evaluation.outputs {
        sink.update_output_value(key, value.clone());
    }
    for (key, value) in &evaluation.metadata {
        sink.update_metadata(key, value.clone());
    }
    Ok(())
}

/// Variant tags, the keys of the startup factory table.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum ModelVariant {
    Dummy,
    Rom,
    ExternalModel,
    Code,
    PostProcessor,
    EnsembleModel,
}

impl std::fmt::Display for ModelVariant {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ModelVariant::Dummy => "Dummy",
            ModelVariant::Rom => "ROM",
            ModelVariant::ExternalModel => "ExternalModel",
            ModelVariant::Code => "Code",
            ModelVariant::PostProcessor => "PostProcessor",
            ModelVariant::EnsembleModel => "EnsembleModel",
        };
        f.write_str(name)
    }
}

/// Backend handle a factory constructor may need.
#[derive(Clone)]
pub enum Backend {
    None,
    Surrogate(Arc<dyn rom::Surrogate>),
    UserCode(Arc<dyn external::UserCode>),
    Executable(code::ExecutableSpec),
    Analysis(Arc<dyn post_processor::Analysis>),
}

/// Everything needed to instantiate a leaf model.
#[derive(Clone)]
pub struct ModelBlueprint {
    pub variant: ModelVariant,
    pub name: String,
    pub inputs: Vec<String>,
    pub outputs: Vec<String>,
    pub backend: Backend,
}

type Constructor = fn(ModelBlueprint) -> Result<Arc<dyn Model>>;

static FACTORY: OnceLock<BTreeMap<ModelVariant, Constructor>> = OnceLock::new();

fn factory() -> &'static BTreeMap<ModelVariant, Constructor> {
    FACTORY.get_or_init(|| {
        BTreeMap::from([
            (ModelVariant::Dummy, dummy::construct as Constructor),
            (ModelVariant::Rom, rom::construct as Constructor),
            (ModelVariant::ExternalModel, external::construct as Constructor),
            (ModelVariant::Code, code::construct as Constructor),
            (ModelVariant::PostProcessor, post_processor::construct as Constructor),
        ])
    })
}

/// Variants the factory can instantiate.
pub fn known_variants() -> Vec<ModelVariant> {
    factory().keys().copied().collect()
}

/// Instantiate a leaf model from its blueprint. Ensembles are composed via
/// [`crate::ensemble::EnsembleModel::new`], not through the factory.
pub fn instantiate(blueprint: ModelBlueprint) -> Result<Arc<dyn Model>> {
    let constructor = factory().get(&blueprint.variant).ok_or_else(|| {
        EnsembleError::Configuration(format!(
            "model variant `{}` cannot be built from a blueprint",
            blueprint.variant
        ))
    })?;
    constructor(blueprint)
}

/// Latest realization of the first store among the step inputs, restricted
/// to the given keys. The common seed for internal models' input space.
pub(crate) fn store_baseline(
    inputs: &[StepInput],
    keys: &BTreeSet<String>,
) -> BTreeMap<String, Value> {
    for input in inputs {
        if let StepInput::Store(store) = input {
            let store = store.lock().unwrap();
            let mut baseline = store.latest_inputs();
            baseline.retain(|key, _| keys.contains(key));
            return baseline;
        }
    }
    BTreeMap::new()
}
