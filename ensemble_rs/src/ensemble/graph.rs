//! Inter-model dataflow: who produces what, who consumes it, and in which
//! order one forward sweep must visit the sub-models.

use std::collections::{BTreeMap, BTreeSet};

use itertools::Itertools;
use slotmap::{SecondaryMap, SlotMap};

use crate::ensemble::graph_algorithms::scc_kosaraju;
use crate::error::{EnsembleError, Result};

slotmap::new_key_type! {
    /// Key of one sub-model node in the dataflow graph.
    pub struct ModelKey;
}

/// Where an input variable's value comes from.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum VariableSource {
    Sampled,
    Produced(String),
}

/// One sub-model's place in the dataflow.
#[derive(Clone, Debug)]
pub struct DataFlowNode {
    pub name: String,
    pub inputs: BTreeSet<String>,
    pub outputs: BTreeSet<String>,
    /// Producing sub-model for each input fed from inside the ensemble.
    pub upstream: BTreeMap<String, String>,
    /// Consuming sub-models for each output variable.
    pub downstream: BTreeMap<String, Vec<String>>,
}

/// Linearization of the dataflow for one forward sweep.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ExecutionOrder {
    pub order: Vec<String>,
    pub cyclic: bool,
}

#[derive(Debug)]
pub struct DependencyGraph {
    nodes: SlotMap<ModelKey, DataFlowNode>,
    by_name: BTreeMap<String, ModelKey>,
    insertion: Vec<ModelKey>,
    order: ExecutionOrder,
    sources: BTreeMap<String, VariableSource>,
}

/// Declared interface of one sub-model: `(name, inputs, outputs)`.
pub type Declaration = (String, BTreeSet<String>, BTreeSet<String>);

impl DependencyGraph {
    /// Build the graph from the sub-model declarations and the sampled
    /// variable set, in declaration order.
    pub fn build(declarations: &[Declaration], sampled: &BTreeSet<String>) -> Result<Self> {
        let mut nodes: SlotMap<ModelKey, DataFlowNode> = SlotMap::with_key();
        let mut by_name = BTreeMap::new();
        let mut insertion = Vec::with_capacity(declarations.len());
        for (name, inputs, outputs) in declarations {
            let key = nodes.insert(DataFlowNode {
                name: name.clone(),
                inputs: inputs.clone(),
                outputs: outputs.clone(),
                upstream: BTreeMap::new(),
                downstream: BTreeMap::new(),
            });
            if by_name.insert(name.clone(), key).is_some() {
                return Err(EnsembleError::Configuration(format!(
                    "duplicate sub-model name `{name}`"
                )));
            }
            insertion.push(key);
        }

        // First-declared producer wins when several cover the same variable.
        let mut producer_of: BTreeMap<String, ModelKey> = BTreeMap::new();
        for &key in &insertion {
            for output in nodes[key].outputs.clone() {
                producer_of.entry(output).or_insert(key);
            }
        }

        // Producer/consumer wiring and variable sources, with validation.
        let mut sources = BTreeMap::new();
        for &key in &insertion {
            let node = nodes[key].clone();
            for input in &node.inputs {
                if sampled.contains(input) {
                    sources.insert(input.clone(), VariableSource::Sampled);
                    continue;
                }
                let Some(&producer) = producer_of.get(input) else {
                    return Err(EnsembleError::UnresolvableInput {
                        model: node.name.clone(),
                        variable: input.clone(),
                    });
                };
                let producer_name = nodes[producer].name.clone();
                sources.insert(input.clone(), VariableSource::Produced(producer_name.clone()));
                nodes[key].upstream.insert(input.clone(), producer_name);
                nodes[producer]
                    .downstream
                    .entry(input.clone())
                    .or_default()
                    .push(node.name.clone());
            }
        }

        let order = linearize(&nodes, &insertion, &producer_of, sampled);
        Ok(Self {
            nodes,
            by_name,
            insertion,
            order,
            sources,
        })
    }

    pub fn order(&self) -> &ExecutionOrder {
        &self.order
    }

    pub fn node(&self, name: &str) -> Option<&DataFlowNode> {
        self.by_name.get(name).map(|&key| &self.nodes[key])
    }

    pub fn source(&self, variable: &str) -> Option<&VariableSource> {
        self.sources.get(variable)
    }

    /// Sub-model names in declaration order.
    pub fn names(&self) -> Vec<String> {
        self.insertion
            .iter()
            .map(|&key| self.nodes[key].name.clone())
            .collect()
    }
}

/// The reorder pass plus the independent cycle check.
fn linearize(
    nodes: &SlotMap<ModelKey, DataFlowNode>,
    insertion: &[ModelKey],
    producer_of: &BTreeMap<String, ModelKey>,
    sampled: &BTreeSet<String>,
) -> ExecutionOrder {
    let mut order: Vec<ModelKey> = insertion.to_vec();
    let n = order.len();

    // Push each consumer after its producers, until stable. The pass count is
    // capped at N*N; exceeding it means reordering cannot settle, i.e. a
    // feedback loop.
    let mut exceeded = false;
    let mut passes = 0usize;
    loop {
        let mut changed = false;
        let mut idx = 0;
        while idx < order.len() {
            let consumer = order[idx];
            for input in &nodes[consumer].inputs {
                if sampled.contains(input) {
                    continue;
                }
                let Some(&producer) = producer_of.get(input) else {
                    continue;
                };
                if producer == consumer {
                    continue;
                }
                let consumer_idx = order.iter().position(|&k| k == consumer).expect("in order");
                let producer_idx = order.iter().position(|&k| k == producer).expect("in order");
                if producer_idx >= consumer_idx {
                    order.remove(consumer_idx);
                    let target = producer_idx.min(order.len());
                    order.insert(target, consumer);
                    changed = true;
                }
            }
            idx += 1;
        }
        passes += 1;
        if !changed {
            break;
        }
        if passes > n * n {
            exceeded = true;
            break;
        }
    }

    // Authoritative cycle detection on producer -> consumer edges.
    let mut preds: SecondaryMap<ModelKey, Vec<ModelKey>> = SecondaryMap::new();
    let mut succs: SecondaryMap<ModelKey, Vec<ModelKey>> = SecondaryMap::new();
    let mut self_loop = false;
    for &consumer in insertion {
        for input in &nodes[consumer].inputs {
            if sampled.contains(input) {
                continue;
            }
            let Some(&producer) = producer_of.get(input) else {
                continue;
            };
            if producer == consumer {
                self_loop = true;
                continue;
            }
            preds.entry(consumer).unwrap().or_default().push(producer);
            succs.entry(producer).unwrap().or_default().push(consumer);
        }
    }
    let scc = scc_kosaraju(
        insertion.iter().copied(),
        |v| preds.get(v).into_iter().flatten().copied().collect::<Vec<_>>(),
        |u| succs.get(u).into_iter().flatten().copied().collect::<Vec<_>>(),
    );
    let component_sizes = scc.values().copied().counts();
    let cyclic = self_loop || exceeded || component_sizes.values().any(|&size| size > 1);

    ExecutionOrder {
        order: order.iter().map(|&key| nodes[key].name.clone()).collect(),
        cyclic,
    }
}
