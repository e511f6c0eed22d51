//! In-memory data stores and the sink contract.
//!
//! A [`PointSet`] plays two roles: the private per-sub-model trace store
//! (target evaluation) that records every `(inputs, outputs, metadata)` tuple
//! seen in the current step, and the simplest kind of step output sink.
//! Grouped sinks additionally partition records by sample prefix.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::value::Value;

/// Which parameter axis a key belongs to.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ParameterRole {
    Input,
    Output,
}

/// The sink kinds the runtime can write to.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SinkKind {
    PointSet,
    HistorySet,
    TabularGrouped,
    HierarchicalGrouped,
}

impl SinkKind {
    pub fn is_grouped(&self) -> bool {
        matches!(self, SinkKind::TabularGrouped | SinkKind::HierarchicalGrouped)
    }
}

/// Attributes attached to a group in a grouped sink; the group name is the
/// sample prefix scoped by the producing model.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct GroupAttributes {
    pub group: String,
}

/// Uniform write surface for step outputs. Identity (for overlap checks) is
/// the store name, which must be unique within a step.
pub trait DataSink: Send {
    fn name(&self) -> &str;
    fn kind(&self) -> SinkKind;
    fn para_keys(&self, role: ParameterRole) -> Vec<String>;
    fn update_input_value(&mut self, key: &str, value: Value);
    fn update_output_value(&mut self, key: &str, value: Value);
    fn update_metadata(&mut self, key: &str, value: serde_json::Value);
    /// Open a new group; subsequent updates land in it. Non-grouped sinks
    /// ignore the call.
    fn add_group(&mut self, attrs: &GroupAttributes);
}

/// Shared handle to a store used concurrently (trace stores live behind one
/// of these so finished samples can flush into them from any task).
pub type SharedStore = Arc<Mutex<PointSet>>;

pub fn shared(store: PointSet) -> SharedStore {
    Arc::new(Mutex::new(store))
}

/// An ordered, column-oriented record of realizations. Every input and output
/// key owns a column; rows are appended one realization at a time.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PointSet {
    name: String,
    input_keys: Vec<String>,
    output_keys: Vec<String>,
    inputs: BTreeMap<String, Vec<Value>>,
    outputs: BTreeMap<String, Vec<Value>>,
    metadata: BTreeMap<String, serde_json::Value>,
}

impl PointSet {
    pub fn new(
        name: impl Into<String>,
        input_keys: impl IntoIterator<Item = impl Into<String>>,
        output_keys: impl IntoIterator<Item = impl Into<String>>,
    ) -> Self {
        let input_keys: Vec<String> = input_keys.into_iter().map(Into::into).collect();
        let output_keys: Vec<String> = output_keys.into_iter().map(Into::into).collect();
        let inputs = input_keys.iter().map(|k| (k.clone(), Vec::new())).collect();
        let outputs = output_keys.iter().map(|k| (k.clone(), Vec::new())).collect();
        Self {
            name: name.into(),
            input_keys,
            output_keys,
            inputs,
            outputs,
            metadata: BTreeMap::new(),
        }
    }

    /// An empty store with the same name and declared keys.
    pub fn fresh(&self) -> Self {
        Self::new(
            self.name.clone(),
            self.input_keys.iter().cloned(),
            self.output_keys.iter().cloned(),
        )
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn input_keys(&self) -> &[String] {
        &self.input_keys
    }

    pub fn output_keys(&self) -> &[String] {
        &self.output_keys
    }

    pub fn is_empty(&self) -> bool {
        self.inputs.values().all(Vec::is_empty) && self.outputs.values().all(Vec::is_empty)
    }

    pub fn reset(&mut self) {
        for column in self.inputs.values_mut().chain(self.outputs.values_mut()) {
            column.clear();
        }
        self.metadata.clear();
    }

    /// Latest value of a variable, searched on both axes.
    pub fn latest(&self, key: &str) -> Option<&Value> {
        self.outputs
            .get(key)
            .and_then(|column| column.last())
            .or_else(|| self.inputs.get(key).and_then(|column| column.last()))
    }

    /// Latest value of every output variable.
    pub fn latest_outputs(&self) -> BTreeMap<String, Value> {
        self.outputs
            .iter()
            .filter_map(|(key, column)| column.last().map(|v| (key.clone(), v.clone())))
            .collect()
    }

    /// Latest value of every input variable.
    pub fn latest_inputs(&self) -> BTreeMap<String, Value> {
        self.inputs
            .iter()
            .filter_map(|(key, column)| column.last().map(|v| (key.clone(), v.clone())))
            .collect()
    }

    pub fn input_column(&self, key: &str) -> Option<&[Value]> {
        self.inputs.get(key).map(Vec::as_slice)
    }

    pub fn output_column(&self, key: &str) -> Option<&[Value]> {
        self.outputs.get(key).map(Vec::as_slice)
    }

    pub fn metadata(&self) -> &BTreeMap<String, serde_json::Value> {
        &self.metadata
    }

    /// Append the other store's columns onto this one. Keys absent here are
    /// ignored; the declared key sets are authoritative.
    pub fn absorb(&mut self, other: &PointSet) -> Result<()> {
        for (key, column) in &other.inputs {
            if let Some(target) = self.inputs.get_mut(key) {
                target.extend(column.iter().cloned());
            }
        }
        for (key, column) in &other.outputs {
            if let Some(target) = self.outputs.get_mut(key) {
                target.extend(column.iter().cloned());
            }
        }
        for (key, value) in &other.metadata {
            self.metadata.insert(key.clone(), value.clone());
        }
        Ok(())
    }
}

impl DataSink for PointSet {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> SinkKind {
        SinkKind::PointSet
    }

    fn para_keys(&self, role: ParameterRole) -> Vec<String> {
        match role {
            ParameterRole::Input => self.input_keys.clone(),
            ParameterRole::Output => self.output_keys.clone(),
        }
    }

    fn update_input_value(&mut self, key: &str, value: Value) {
        self.inputs.entry(key.to_owned()).or_default().push(value);
        if !self.input_keys.iter().any(|k| k == key) {
            self.input_keys.push(key.to_owned());
        }
    }

    fn update_output_value(&mut self, key: &str, value: Value) {
        self.outputs.entry(key.to_owned()).or_default().push(value);
        if !self.output_keys.iter().any(|k| k == key) {
            self.output_keys.push(key.to_owned());
        }
    }

    fn update_metadata(&mut self, key: &str, value: serde_json::Value) {
        self.metadata.insert(key.to_owned(), value);
    }

    fn add_group(&mut self, _attrs: &GroupAttributes) {}
}

/// A grouped sink: one [`PointSet`]-shaped record block per sample prefix.
#[derive(Clone, Debug)]
pub struct GroupedStore {
    name: String,
    kind: SinkKind,
    groups: Vec<(GroupAttributes, PointSet)>,
}

impl GroupedStore {
    pub fn tabular(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind: SinkKind::TabularGrouped,
            groups: Vec::new(),
        }
    }

    pub fn hierarchical(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind: SinkKind::HierarchicalGrouped,
            groups: Vec::new(),
        }
    }

    pub fn groups(&self) -> &[(GroupAttributes, PointSet)] {
        &self.groups
    }

    pub fn group(&self, name: &str) -> Option<&PointSet> {
        self.groups
            .iter()
            .find(|(attrs, _)| attrs.group == name)
            .map(|(_, set)| set)
    }

    fn current(&mut self) -> &mut PointSet {
        if self.groups.is_empty() {
            let block = PointSet::new(
                format!("{}::ungrouped", self.name),
                Vec::<String>::new(),
                Vec::<String>::new(),
            );
            self.groups.push((GroupAttributes::default(), block));
        }
        &mut self.groups.last_mut().expect("just ensured non-empty").1
    }
}

impl DataSink for GroupedStore {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> SinkKind {
        self.kind
    }

    fn para_keys(&self, role: ParameterRole) -> Vec<String> {
        let mut keys: Vec<String> = Vec::new();
        for (_, block) in &self.groups {
            for key in block.para_keys(role) {
                if !keys.contains(&key) {
                    keys.push(key);
                }
            }
        }
        keys
    }

    fn update_input_value(&mut self, key: &str, value: Value) {
        self.current().update_input_value(key, value);
    }

    fn update_output_value(&mut self, key: &str, value: Value) {
        self.current().update_output_value(key, value);
    }

    fn update_metadata(&mut self, key: &str, value: serde_json::Value) {
        self.current().update_metadata(key, value);
    }

    fn add_group(&mut self, attrs: &GroupAttributes) {
        let block = PointSet::new(
            format!("{}::{}", self.name, attrs.group),
            Vec::<String>::new(),
            Vec::<String>::new(),
        );
        self.groups.push((attrs.clone(), block));
    }
}

/// A history sink keeps the full column per variable instead of only the
/// latest realization; structurally it is a [`PointSet`] with a different
/// advertised kind, which changes how the ensemble writes into it.
#[derive(Clone, Debug)]
pub struct HistorySet(pub PointSet);

impl HistorySet {
    pub fn new(
        name: impl Into<String>,
        input_keys: impl IntoIterator<Item = impl Into<String>>,
        output_keys: impl IntoIterator<Item = impl Into<String>>,
    ) -> Self {
        Self(PointSet::new(name, input_keys, output_keys))
    }
}

impl DataSink for HistorySet {
    fn name(&self) -> &str {
        self.0.name()
    }

    fn kind(&self) -> SinkKind {
        SinkKind::HistorySet
    }

    fn para_keys(&self, role: ParameterRole) -> Vec<String> {
        self.0.para_keys(role)
    }

    fn update_input_value(&mut self, key: &str, value: Value) {
        self.0.update_input_value(key, value);
    }

    fn update_output_value(&mut self, key: &str, value: Value) {
        self.0.update_output_value(key, value);
    }

    fn update_metadata(&mut self, key: &str, value: serde_json::Value) {
        self.0.update_metadata(key, value);
    }

    fn add_group(&mut self, _attrs: &GroupAttributes) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reset_clears_columns_but_keeps_keys() {
        let mut set = PointSet::new("trace", ["x"], ["y"]);
        set.update_input_value("x", Value::Scalar(1.0));
        set.update_output_value("y", Value::Scalar(2.0));
        assert!(!set.is_empty());

        set.reset();
        assert!(set.is_empty());
        assert_eq!(vec!["x".to_owned()], set.para_keys(ParameterRole::Input));
        assert_eq!(vec!["y".to_owned()], set.para_keys(ParameterRole::Output));
    }

    #[test]
    fn latest_prefers_output_axis() {
        let mut set = PointSet::new("trace", ["v"], ["v"]);
        set.update_input_value("v", Value::Scalar(1.0));
        set.update_output_value("v", Value::Scalar(9.0));
        assert_eq!(Some(&Value::Scalar(9.0)), set.latest("v"));
    }

    #[test]
    fn grouped_store_partitions_by_group() {
        let mut store = GroupedStore::tabular("results");
        store.add_group(&GroupAttributes { group: "1".into() });
        store.update_output_value("y", Value::Scalar(10.0));
        store.add_group(&GroupAttributes { group: "2".into() });
        store.update_output_value("y", Value::Scalar(20.0));

        assert_eq!(
            Some(&[Value::Scalar(10.0)][..]),
            store.group("1").and_then(|g| g.output_column("y"))
        );
        assert_eq!(
            Some(&[Value::Scalar(20.0)][..]),
            store.group("2").and_then(|g| g.output_column("y"))
        );
    }
}
