//! The ensemble model: a communication pipe among sub-models in terms of
//! their input/output relations.
//!
//! Sub-models are held by name in a registry built at construction; the
//! dependency graph and execution plan are computed once at `initialize` and
//! read-only afterwards. Each sample then runs as an independent client job
//! against the shared handler.

pub mod graph;
pub mod graph_algorithms;
pub mod picard;

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex, OnceLock};

use async_trait::async_trait;
use futures::FutureExt;
use tracing::info;

pub use graph::{DataFlowNode, DependencyGraph, ExecutionOrder, VariableSource};
pub use picard::{ResultBundle, SampleOutcome, SamplePhase, COLD_START_SEED};

use crate::config::{EnsembleConfig, EnsembleSettings};
use crate::data::{DataSink, GroupAttributes, ParameterRole, SharedStore, SinkKind};
use crate::error::{EnsembleError, Result};
use crate::jobs::{FinishedJob, JobHandler, JobMetadata};
use crate::model::{
    InitContext, InputPacket, Model, ModelVariant, RunInfo, SampleDescription, StepInput,
    ANY_HANDLER,
};
use crate::value::Value;
use picard::{PlanEntry, SamplePlan};

/// One registered sub-model.
struct SubModelEntry {
    model: Arc<dyn Model>,
    /// Step inputs routed to this sub-model, by name.
    input_names: Vec<String>,
    /// Records every realization this sub-model sees during the step; also
    /// declares its input/output variables.
    target_evaluation: SharedStore,
    inputs: BTreeSet<String>,
    outputs: BTreeSet<String>,
}

/// State computed once at initialize.
struct Initialized {
    graph: DependencyGraph,
    plan: Arc<SamplePlan>,
}

pub struct EnsembleModel {
    name: String,
    settings: EnsembleSettings,
    /// Registry, keyed by sub-model name; insertion order kept separately
    /// since it drives ordering tie-breaks.
    entries: BTreeMap<String, SubModelEntry>,
    declaration_order: Vec<String>,
    initialized: OnceLock<Initialized>,
    dependent_modules: Mutex<Vec<String>>,
}

impl EnsembleModel {
    /// Assemble the ensemble from its configuration, the sub-model instances,
    /// and their target-evaluation stores, matched by name.
    pub fn new(
        config: EnsembleConfig,
        models: impl IntoIterator<Item = Arc<dyn Model>>,
        stores: impl IntoIterator<Item = SharedStore>,
    ) -> Result<Self> {
        config.validate()?;
        let mut models: BTreeMap<String, Arc<dyn Model>> = models
            .into_iter()
            .map(|model| (model.name().to_owned(), model))
            .collect();
        let mut stores: BTreeMap<String, SharedStore> = stores
            .into_iter()
            .map(|store| {
                let name = store.lock().unwrap().name().to_owned();
                (name, store)
            })
            .collect();

        let mut entries = BTreeMap::new();
        let mut declaration_order = Vec::with_capacity(config.sub_models.len());
        for sub in &config.sub_models {
            let model = models.remove(&sub.name).ok_or_else(|| {
                EnsembleError::Configuration(format!(
                    "no model instance supplied for sub-model `{}`",
                    sub.name
                ))
            })?;
            let target_evaluation = stores.remove(&sub.target_evaluation).ok_or_else(|| {
                EnsembleError::Configuration(format!(
                    "no target evaluation `{}` supplied for sub-model `{}`",
                    sub.target_evaluation, sub.name
                ))
            })?;
            let (inputs, outputs) = {
                let store = target_evaluation.lock().unwrap();
                (
                    store.para_keys(ParameterRole::Input).into_iter().collect(),
                    store.para_keys(ParameterRole::Output).into_iter().collect(),
                )
            };
            declaration_order.push(sub.name.clone());
            entries.insert(
                sub.name.clone(),
                SubModelEntry {
                    model,
                    input_names: sub.input_names.clone(),
                    target_evaluation,
                    inputs,
                    outputs,
                },
            );
        }

        Ok(Self {
            name: config.name,
            settings: config.settings,
            entries,
            declaration_order,
            initialized: OnceLock::new(),
            dependent_modules: Mutex::new(Vec::new()),
        })
    }

    fn initialized(&self) -> Result<&Initialized> {
        self.initialized.get().ok_or_else(|| EnsembleError::Lifecycle {
            model: self.name.clone(),
            message: "used before initialize".to_owned(),
        })
    }

    /// The dependency graph, available after initialize.
    pub fn dependency_graph(&self) -> Result<&DependencyGraph> {
        Ok(&self.initialized()?.graph)
    }

    /// The execution order, available after initialize.
    pub fn execution_order(&self) -> Result<&ExecutionOrder> {
        Ok(self.initialized()?.graph.order())
    }

    fn route_inputs(&self, entry: &SubModelEntry, inputs: &[StepInput]) -> Vec<StepInput> {
        inputs
            .iter()
            .filter(|input| entry.input_names.iter().any(|name| *name == input.name()))
            .cloned()
            .collect()
    }

    /// Per-sub-model slice of the sampled variables: the intersection of the
    /// sub-model's declared inputs with what the sampler provided.
    fn select_input_subset(
        entry: &SubModelEntry,
        sample: &SampleDescription,
    ) -> SampleDescription {
        let sampled_vars: BTreeMap<String, Value> = sample
            .sampled_vars
            .iter()
            .filter(|(key, _)| entry.inputs.contains(*key))
            .map(|(key, value)| (key.clone(), value.clone()))
            .collect();
        let sampled_vars_pb = sample
            .sampled_vars_pb
            .iter()
            .filter(|(key, _)| sampled_vars.contains_key(*key))
            .map(|(key, pb)| (key.clone(), *pb))
            .collect();
        SampleDescription {
            prefix: sample.prefix.clone(),
            sampler_tag: sample.sampler_tag.clone(),
            sampled_vars,
            sampled_vars_pb,
            extra: sample.extra.clone(),
        }
    }

    fn write_bundle(&self, bundle: &ResultBundle, sink: &mut dyn DataSink) -> Result<()> {
        // Flush each sample trace into the per-sub-model target evaluation,
        // rejecting sinks that alias one of them.
        for name in &self.declaration_order {
            let entry = &self.entries[name];
            let mut store = entry.target_evaluation.lock().unwrap();
            if sink.name() == store.name() {
                return Err(EnsembleError::SinkOverlap {
                    sink: sink.name().to_owned(),
                    model: name.clone(),
                });
            }
            if let Some(trace) = bundle.traces.get(name) {
                store.absorb(trace)?;
            }
        }

        if sink.kind().is_grouped() {
            sink.add_group(&GroupAttributes {
                group: format!("{}{}", self.name, bundle.prefix),
            });
        }
        let sink_inputs = sink.para_keys(ParameterRole::Input);
        let sink_outputs = sink.para_keys(ParameterRole::Output);
        let keep_all = sink.kind().is_grouped();
        for name in &self.declaration_order {
            let Some(trace) = bundle.traces.get(name) else {
                continue;
            };
            match sink.kind() {
                SinkKind::PointSet | SinkKind::TabularGrouped | SinkKind::HierarchicalGrouped => {
                    for (key, value) in trace.latest_inputs() {
                        if keep_all || sink_inputs.contains(&key) {
                            sink.update_input_value(&key, value);
                        }
                    }
                    for (key, value) in trace.latest_outputs() {
                        if keep_all || sink_outputs.contains(&key) {
                            sink.update_output_value(&key, value);
                        }
                    }
                }
                SinkKind::HistorySet => {
                    for key in trace.input_keys() {
                        if let Some(column) = trace.input_column(key) {
                            for value in column {
                                sink.update_input_value(key, value.clone());
                            }
                        }
                    }
                    for key in trace.output_keys() {
                        if let Some(column) = trace.output_column(key) {
                            for value in column {
                                sink.update_output_value(key, value.clone());
                            }
                        }
                    }
                }
            }
        }

        sink.update_metadata("prefix", serde_json::Value::String(bundle.prefix.clone()));
        sink.update_metadata(
            "iterations",
            serde_json::Value::from(bundle.outcome.iterations()),
        );
        if let Some(converged) = bundle.outcome.converged() {
            sink.update_metadata("converged", serde_json::Value::Bool(converged));
        }
        if let Some(norm) = bundle.outcome.norm() {
            sink.update_metadata("residualNorm", serde_json::Value::from(norm));
        }
        Ok(())
    }
}

#[async_trait]
impl Model for EnsembleModel {
    fn name(&self) -> &str {
        &self.name
    }

    fn variant(&self) -> ModelVariant {
        ModelVariant::EnsembleModel
    }

    /// Inputs the ensemble needs from the outside: everything its sub-models
    /// consume that no sub-model produces.
    fn declared_inputs(&self) -> BTreeSet<String> {
        let produced: BTreeSet<&String> = self
            .entries
            .values()
            .flat_map(|entry| entry.outputs.iter())
            .collect();
        self.entries
            .values()
            .flat_map(|entry| entry.inputs.iter())
            .filter(|input| !produced.contains(*input))
            .cloned()
            .collect()
    }

    fn declared_outputs(&self) -> BTreeSet<String> {
        self.entries
            .values()
            .flat_map(|entry| entry.outputs.iter().cloned())
            .collect()
    }

    fn dependent_modules(&self) -> Vec<String> {
        self.dependent_modules.lock().unwrap().clone()
    }

    async fn initialize(
        &self,
        run_info: &RunInfo,
        inputs: &[StepInput],
        init: &InitContext,
    ) -> Result<()> {
        let mut modules = Vec::new();
        for name in &self.declaration_order {
            let entry = &self.entries[name];
            let routed = self.route_inputs(entry, inputs);
            entry.model.initialize(run_info, &routed, init).await?;
            for module in entry.model.dependent_modules() {
                if !modules.contains(&module) {
                    modules.push(module);
                }
            }
        }
        *self.dependent_modules.lock().unwrap() = modules;

        let declarations: Vec<graph::Declaration> = self
            .declaration_order
            .iter()
            .map(|name| {
                let entry = &self.entries[name];
                (name.clone(), entry.inputs.clone(), entry.outputs.clone())
            })
            .collect();
        let graph = DependencyGraph::build(&declarations, &init.sampled_variables)?;

        if graph.order().cyclic {
            info!(
                ensemble = %self.name,
                "multi-model connections determined a non-linear system; fixed-point iteration activated"
            );
        } else {
            info!(
                ensemble = %self.name,
                "multi-model connections determined a linear system; fixed-point iteration not needed"
            );
        }

        let entries = self
            .entries
            .iter()
            .map(|(name, entry)| {
                let node = graph.node(name).expect("graph covers every sub-model");
                (
                    name.clone(),
                    PlanEntry {
                        model: Arc::clone(&entry.model),
                        inputs: entry.inputs.clone(),
                        outputs: entry.outputs.clone(),
                        upstream: node.upstream.clone(),
                        trace_template: entry.target_evaluation.lock().unwrap().fresh(),
                    },
                )
            })
            .collect();
        let plan = Arc::new(SamplePlan {
            ensemble: self.name.clone(),
            settings: self.settings.clone(),
            order: graph.order().clone(),
            entries,
        });

        let _ = self.initialized.set(Initialized { graph, plan });
        Ok(())
    }

    fn create_new_input(
        &self,
        my_input: &[StepInput],
        sampler_tag: &str,
        sample: &SampleDescription,
    ) -> Result<InputPacket> {
        let _ = self.initialized()?;
        for name in &self.declaration_order {
            let entry = &self.entries[name];
            for sampled in sample.sampled_vars.keys() {
                if entry.outputs.contains(sampled) {
                    return Err(EnsembleError::SampledOutputCollision {
                        prefix: sample.prefix.clone(),
                        variable: sampled.clone(),
                        model: name.clone(),
                    });
                }
            }
        }

        let mut packet = InputPacket::new(&self.name, sample);
        packet.sampler_tag = sampler_tag.to_owned();
        for name in &self.declaration_order {
            let entry = &self.entries[name];
            let subset = Self::select_input_subset(entry, sample);
            let routed = self.route_inputs(entry, my_input);
            let sub_packet = entry.model.create_new_input(&routed, sampler_tag, &subset)?;
            packet.nested.insert(name.clone(), sub_packet);
        }
        Ok(packet)
    }

    /// Submit this sample's whole inner loop as one client job, identified by
    /// the sample prefix.
    async fn run(&self, packet: InputPacket, handler: &Arc<dyn JobHandler>) -> Result<()> {
        let plan = Arc::clone(&self.initialized()?.plan);
        let identifier = packet.prefix.clone();
        let metadata = JobMetadata {
            model: self.name.clone(),
            prefix: packet.prefix.clone(),
            sampler_tag: packet.sampler_tag.clone(),
        };
        let inner_handler = Arc::clone(handler);
        let work = async move {
            picard::execute_sample(plan, packet, inner_handler)
                .await
                .map(crate::jobs::JobPayload::Bundle)
                .map_err(anyhow::Error::from)
        }
        .boxed();
        handler.submit_client(work, &identifier, ANY_HANDLER, metadata)
    }

    fn collect_output(&self, finished: &FinishedJob, sink: &mut dyn DataSink) -> Result<()> {
        let payload = finished.evaluation().map_err(Clone::clone)?;
        let bundle = payload.as_bundle().ok_or_else(|| EnsembleError::Lifecycle {
            model: self.name.clone(),
            message: format!("job `{}` did not carry a sample bundle", finished.identifier),
        })?;
        self.write_bundle(bundle, sink)
    }
}
