//! Workflow (spec §4.F): the DAG container that owns nodes, wires
//! field-to-field edges between them, and materializes each node's
//! upstream-supplied inputs before that node's own state is derived.
//!
//! Grounded in the teacher's `pipeline.rs` (`Arc<Mutex<PipelineInner>>`
//! graph-of-nodes-and-edges shape), generalized from anonymous `NodeId`s to
//! names and from a linear fused chain to an arbitrary DAG walked with
//! Kahn's algorithm (pydra's `graph_sorted` uses `networkx`, unavailable
//! here). A downstream node never reads another node's `results_dict`
//! lazily per element; once an upstream node is complete, its full output is
//! copied onto the downstream node's own input record as an ordinary
//! sequence field, in upstream's lexicographic index order. This keeps
//! `Node` self-contained (spec §9's "no cyclic node↔state references") and
//! lets the downstream node's own `State` machinery do the rest unchanged.

use crate::cache::CacheConfig;
use crate::error::EngineError;
use crate::node::{Node, OutputMap};
use crate::record::{Record, Scalar, Value};
use crate::splitter::{Rpn, RpnOp};
use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};

/// Suffix marking a synthetic field [`Workflow::materialize_upstream_inputs`]
/// adds purely to give an inherited inner axis something of the right
/// cardinality to index by; never shown to a [`crate::node::Runnable`] (see
/// the filter in [`Workflow::get_input_el`]).
const AXIS_MARKER: &str = "__axis";

struct Edge {
    from_node: String,
    from_field: String,
    to_node: String,
    to_field: String,
}

/// A named DAG of [`Node`]s (spec §3 "Workflow").
pub struct Workflow {
    pub name: String,
    nodes: HashMap<String, Node>,
    order: Vec<String>,
    edges: Vec<Edge>,
    /// Workflow-level inputs, bound via [`Workflow::connect_wf_input`].
    pub inputs: Record,
    /// `(from_node, from_field, exposed_name)`, spec §4.F `wf_output_names`.
    wf_output_names: Vec<(String, String, String)>,
}

/// One upstream edge's contribution to a downstream node's input record,
/// once materialized: the field an inherited splitter should use as its
/// axis leaf, and — only in the inner-splitter case — the separate jagged
/// field that leaf was synthesized to anchor.
struct MaterializedField {
    axis_field: String,
    inner_field: Option<String>,
}

impl Workflow {
    pub fn new(name: impl Into<String>) -> Self {
        Workflow {
            name: name.into(),
            nodes: HashMap::new(),
            order: Vec::new(),
            edges: Vec::new(),
            inputs: Record::new(),
            wf_output_names: Vec::new(),
        }
    }

    /// Register a node under its own name. Names must be unique within the
    /// workflow (spec §4.F `add`).
    pub fn add(&mut self, node: Node) -> Result<(), EngineError> {
        if self.nodes.contains_key(&node.name) {
            return Err(EngineError::DuplicateOutputName {
                workflow: self.name.clone(),
                name: node.name.clone(),
            });
        }
        self.order.push(node.name.clone());
        self.nodes.insert(node.name.clone(), node);
        Ok(())
    }

    pub fn node(&self, name: &str) -> Option<&Node> {
        self.nodes.get(name)
    }

    pub fn node_mut(&mut self, name: &str) -> Option<&mut Node> {
        self.nodes.get_mut(name)
    }

    pub fn node_names(&self) -> &[String] {
        &self.order
    }

    /// Wire `from_node.from_field` into `to_node.to_field` (spec §4.F
    /// `connect`). Recorded both as an edge (for topological ordering and
    /// upstream-materialization) and as a dependency on the downstream node.
    pub fn connect(
        &mut self,
        from_node: &str,
        from_field: &str,
        to_node: &str,
        to_field: &str,
    ) -> Result<(), EngineError> {
        if !self.nodes.contains_key(from_node) {
            return Err(EngineError::MissingDependency {
                from_node: from_node.to_string(),
                from_field: from_field.to_string(),
                to_node: to_node.to_string(),
            });
        }
        let to = self
            .nodes
            .get_mut(to_node)
            .ok_or_else(|| EngineError::MissingDependency {
                from_node: from_node.to_string(),
                from_field: from_field.to_string(),
                to_node: to_node.to_string(),
            })?;
        to.needed_outputs
            .push((from_node.to_string(), from_field.to_string(), to_field.to_string()));
        self.edges.push(Edge {
            from_node: from_node.to_string(),
            from_field: from_field.to_string(),
            to_node: to_node.to_string(),
            to_field: to_field.to_string(),
        });
        Ok(())
    }

    /// Bind a workflow-level input directly onto a node's own input record
    /// (spec §4.F `connect_wf_input`).
    pub fn connect_wf_input(&mut self, field: &str, to_node: &str, to_field: &str) -> Result<(), EngineError> {
        let value = self
            .inputs
            .get(field)
            .ok_or_else(|| EngineError::UnresolvedEdge {
                workflow: self.name.clone(),
                field: field.to_string(),
            })?
            .clone();
        let node = self
            .nodes
            .get_mut(to_node)
            .ok_or_else(|| EngineError::UnresolvedEdge {
                workflow: self.name.clone(),
                field: field.to_string(),
            })?;
        let namespaced = format!("{to_node}.{to_field}");
        node.inputs.set(namespaced, value);
        Ok(())
    }

    /// Expose `from_node.from_field` as a named workflow output (spec §4.F
    /// `wf_output_names`). Names must be unique within the workflow.
    pub fn expose_output(&mut self, from_node: &str, from_field: &str, name: &str) -> Result<(), EngineError> {
        if self.wf_output_names.iter().any(|(_, _, n)| n == name) {
            return Err(EngineError::DuplicateOutputName {
                workflow: self.name.clone(),
                name: name.to_string(),
            });
        }
        self.wf_output_names
            .push((from_node.to_string(), from_field.to_string(), name.to_string()));
        Ok(())
    }

    pub fn split_node(&mut self, node: &str, expr: &str, inputs: Option<Record>) -> Result<(), EngineError> {
        self.nodes
            .get_mut(node)
            .ok_or_else(|| EngineError::UnknownVariable {
                node: node.to_string(),
                variable: expr.to_string(),
            })?
            .split(expr, inputs)
    }

    pub fn combine_node(&mut self, node: &str, combiner: Vec<String>) -> Result<(), EngineError> {
        self.nodes
            .get_mut(node)
            .ok_or_else(|| EngineError::UnknownVariable {
                node: node.to_string(),
                variable: combiner.join(","),
            })?
            .combine(combiner)
    }

    /// Kahn's-algorithm topological order over the node DAG (pydra's
    /// `graph_sorted`, ported without a `networkx` equivalent). Ties break
    /// by registration order for determinism.
    pub fn graph_sorted(&self) -> Result<Vec<String>, EngineError> {
        let mut indegree: HashMap<&str, usize> = self.order.iter().map(|n| (n.as_str(), 0)).collect();
        let mut adjacency: HashMap<&str, Vec<&str>> = HashMap::new();
        for edge in &self.edges {
            *indegree.get_mut(edge.to_node.as_str()).unwrap() += 1;
            adjacency.entry(edge.from_node.as_str()).or_default().push(edge.to_node.as_str());
        }

        let mut queue: VecDeque<&str> = self
            .order
            .iter()
            .map(String::as_str)
            .filter(|n| indegree[n] == 0)
            .collect();
        let mut sorted = Vec::with_capacity(self.order.len());
        let mut visited: HashSet<&str> = HashSet::new();
        while let Some(n) = queue.pop_front() {
            if !visited.insert(n) {
                continue;
            }
            sorted.push(n.to_string());
            if let Some(successors) = adjacency.get(n) {
                for &succ in successors {
                    let entry = indegree.get_mut(succ).unwrap();
                    *entry -= 1;
                    if *entry == 0 {
                        queue.push_back(succ);
                    }
                }
            }
        }

        if sorted.len() != self.order.len() {
            let stuck = self
                .order
                .iter()
                .find(|n| !visited.contains(n.as_str()))
                .cloned()
                .unwrap_or_default();
            return Err(EngineError::MissingDependency {
                from_node: stuck.clone(),
                from_field: String::new(),
                to_node: format!("workflow {} has a cycle reachable from {stuck}", self.name),
            });
        }
        Ok(sorted)
    }

    /// Copy every completed upstream node's output onto `node_name`'s own
    /// input record, as a plain sequence field in upstream's lexicographic
    /// index order (spec §4.F preparation step preceding `prepare_state_input`).
    ///
    /// Returns one [`MaterializedField`] per connected edge, in edge order.
    /// Ordinarily that's the materialized field itself — its own top-level
    /// length already matches the upstream axis, so it can anchor an
    /// inherited splitter directly. When the per-upstream-element values
    /// turn out to be sequences of differing length (spec §4.B point 4,
    /// §GLOSSARY "inner splitter" — a variable number of items per parent
    /// element can't be folded into a fixed-size global axis), a synthetic
    /// same-cardinality sibling field is materialized alongside it instead,
    /// and the ragged field itself is reported as `inner_field` for
    /// [`Node::prepare_state_input`].
    fn materialize_upstream_inputs(&mut self, node_name: &str) -> Result<Vec<MaterializedField>, EngineError> {
        let needed = self.nodes[node_name].needed_outputs.clone();
        let mut materialized = Vec::new();
        for (from_node, from_field, to_field) in needed {
            let upstream = self.nodes.get(&from_node).ok_or_else(|| EngineError::MissingDependency {
                from_node: from_node.clone(),
                from_field: from_field.clone(),
                to_node: node_name.to_string(),
            })?;
            if !upstream.is_complete() {
                return Err(EngineError::MissingDependency {
                    from_node: from_node.clone(),
                    from_field: from_field.clone(),
                    to_node: node_name.to_string(),
                });
            }
            let to_field_name = format!("{node_name}.{to_field}");
            let mut fields = upstream.get_output();
            let value = match fields.remove(&from_field) {
                Some(OutputMap::Plain(by_dir)) => {
                    let ordered = ordered_values(upstream, &by_dir)?;
                    if is_ragged(&ordered) {
                        let axis_field = format!("{node_name}.{to_field}{AXIS_MARKER}");
                        // Positional index, not a constant: two outer elements whose
                        // jagged payloads happen to coincide must still land in distinct
                        // cache directories, since they are genuinely different elements.
                        let axis_value = Value::Sequence(
                            (0..ordered.len() as i64).map(|i| Value::Scalar(Scalar::Int(i))).collect(),
                        );
                        let node = self.nodes.get_mut(node_name).unwrap();
                        node.inputs.set(axis_field.clone(), axis_value);
                        materialized.push(MaterializedField {
                            axis_field,
                            inner_field: Some(to_field_name.clone()),
                        });
                    } else {
                        materialized.push(MaterializedField {
                            axis_field: to_field_name.clone(),
                            inner_field: None,
                        });
                    }
                    Value::Sequence(ordered)
                }
                Some(OutputMap::Combined(by_reduced)) => {
                    let sorted: BTreeMap<String, Vec<Value>> = by_reduced.into_iter().collect();
                    materialized.push(MaterializedField {
                        axis_field: to_field_name.clone(),
                        inner_field: None,
                    });
                    Value::Sequence(sorted.into_values().map(Value::Sequence).collect())
                }
                None => {
                    return Err(EngineError::MissingDependency {
                        from_node: from_node.clone(),
                        from_field: from_field.clone(),
                        to_node: node_name.to_string(),
                    })
                }
            };
            let node = self.nodes.get_mut(node_name).unwrap();
            node.inputs.set(to_field_name, value);
        }
        Ok(materialized)
    }

    /// Splitter inheritance (spec §4.F preparation step 3): a node with no
    /// explicit splitter of its own adopts one over the field(s) its
    /// upstream edges just materialized, one axis per edge (outer product
    /// across edges when there's more than one). There is no general
    /// translation of an upstream splitter's own leaves onto a downstream
    /// field — a `connect` edge names one upstream output field, not one of
    /// the upstream splitter's input variables — so this always builds a
    /// fresh single-leaf-per-edge splitter rather than attempting to replay
    /// the upstream's own expression. A node with its own explicit splitter
    /// is left untouched.
    fn ensure_inherited_splitter(&mut self, node_name: &str, materialized: &[MaterializedField]) {
        if materialized.is_empty() {
            return;
        }
        let node = self.nodes.get_mut(node_name).unwrap();
        if node.splitter_rpn().is_some() {
            return;
        }
        let mut rpn: Rpn = Vec::new();
        for field in materialized {
            if !rpn.is_empty() {
                rpn.push(RpnOp::Outer);
            }
            rpn.push(RpnOp::Var(field.axis_field.clone()));
        }
        node.adopt_splitter(rpn);
    }

    /// `configured -> planned` for one node: materialize upstream inputs,
    /// inherit a splitter from upstream when this node declared none of its
    /// own, then evaluate state against the now-complete input record (spec
    /// §4.F/§4.E preparation).
    pub fn prepare_node(&mut self, node_name: &str) -> Result<(), EngineError> {
        let materialized = self.materialize_upstream_inputs(node_name)?;
        self.ensure_inherited_splitter(node_name, &materialized);
        let inner_fields: Vec<String> = materialized.into_iter().filter_map(|m| m.inner_field).collect();
        self.nodes
            .get_mut(node_name)
            .ok_or_else(|| EngineError::UnknownVariable {
                node: node_name.to_string(),
                variable: "<workflow lookup>".to_string(),
            })?
            .prepare_state_input(inner_fields)
    }

    /// Prepare every node in dependency order (spec §4.F `preparing`).
    /// Requires nodes to be run to completion in the same order, since each
    /// node's preparation depends on its predecessors already being
    /// complete — the natural driving loop is `graph_sorted` order, prepare
    /// then run-to-completion one node at a time.
    pub fn graph_sorted_for_driving(&self) -> Result<Vec<String>, EngineError> {
        self.graph_sorted()
    }

    /// Gather one element's locally-bound inputs by indexing into the
    /// node's own (by now fully-materialized) input record (spec §4.E
    /// `get_input_el`, simplified: cross-node resolution already happened in
    /// [`Workflow::prepare_node`]).
    pub fn get_input_el(&self, node_name: &str, ind: &[usize]) -> Result<Record, EngineError> {
        let node = self.nodes.get(node_name).ok_or_else(|| EngineError::UnknownVariable {
            node: node_name.to_string(),
            variable: "<workflow lookup>".to_string(),
        })?;
        let state = node.state().cloned().unwrap_or_else(crate::state::State::unsplit);
        let direct = state.state_values(ind, &node.inputs)?;
        let mut local = Record::new();
        for (name, value) in direct.iter() {
            // `state_values` adds synthetic "field.inner" bookkeeping entries
            // purely for directory naming (spec §4.B); they were never among
            // the node's own bound inputs and are not part of the Runnable
            // contract, so they don't belong in the gathered local record.
            if node.inputs.get(name).is_none() || name.ends_with(AXIS_MARKER) {
                continue;
            }
            local.set(strip_namespace(name, &node.name), value.clone());
        }
        Ok(local)
    }

    /// Run (or reuse) one element of `node_name` at multi-index `ind`: gather
    /// its inputs, derive its directory name, and execute (spec §4.E
    /// `run_element`).
    pub fn run_element(&mut self, node_name: &str, ind: &[usize], cache: &CacheConfig, rerun: bool) -> Result<(), EngineError> {
        let local_inputs = self.get_input_el(node_name, ind)?;
        let node = self.nodes.get_mut(node_name).ok_or_else(|| EngineError::UnknownVariable {
            node: node_name.to_string(),
            variable: "<workflow lookup>".to_string(),
        })?;
        let state = node.state().cloned().unwrap_or_else(crate::state::State::unsplit);
        let state_dict = state.state_values(ind, &node.inputs)?;
        let (dir_name, surviving) = state.directory_name_state_surv(ind, &state_dict, node.write_state);
        node.run_single(dir_name, surviving, local_inputs, cache, rerun)
    }

    pub fn is_ready(&self, node_name: &str) -> bool {
        match self.nodes.get(node_name) {
            None => false,
            Some(node) => node.ready2run(&|upstream| self.nodes.get(upstream).is_some_and(Node::is_complete)),
        }
    }

    /// Collect the workflow's exposed outputs (spec §4.F `get_output`):
    /// `{exposed_name -> node.get_output()[field]}`.
    pub fn get_output(&self) -> Result<HashMap<String, OutputMap>, EngineError> {
        let mut out = HashMap::new();
        for (from_node, from_field, name) in &self.wf_output_names {
            let node = self.nodes.get(from_node).ok_or_else(|| EngineError::UnresolvedEdge {
                workflow: self.name.clone(),
                field: name.clone(),
            })?;
            let mut fields = node.get_output();
            let value = fields.remove(from_field).ok_or_else(|| EngineError::UnresolvedEdge {
                workflow: self.name.clone(),
                field: name.clone(),
            })?;
            out.insert(name.clone(), value);
        }
        Ok(out)
    }
}

/// Replay a non-combined output map in the upstream node's own
/// lexicographic index order, rather than `HashMap` order.
fn ordered_values(upstream: &Node, by_dir: &HashMap<String, Value>) -> Result<Vec<Value>, EngineError> {
    let state = upstream.state().cloned().unwrap_or_else(crate::state::State::unsplit);
    let mut ordered = Vec::with_capacity(by_dir.len());
    for ind in state.all_elements() {
        let state_dict = state.state_values(&ind, &upstream.inputs)?;
        let (dir_name, _) = state.directory_name_state_surv(&ind, &state_dict, upstream.write_state);
        if let Some(value) = by_dir.get(&dir_name) {
            ordered.push(value.clone());
        }
    }
    Ok(ordered)
}

/// True iff `values` are all sequences whose lengths are not all equal — the
/// signature of an upstream node whose per-element output is itself a
/// variable-length list (spec's inner splitter), as opposed to a uniform
/// `sequence-of-sequence` field that fits an ordinary fixed-size axis.
fn is_ragged(values: &[Value]) -> bool {
    let mut lens = values.iter().map(|v| match v {
        Value::Sequence(items) => Some(items.len()),
        _ => None,
    });
    let Some(Some(first_len)) = lens.next() else {
        return false;
    };
    lens.any(|l| l != Some(first_len))
}

fn strip_namespace(name: &str, node_name: &str) -> String {
    let prefix = format!("{node_name}.");
    name.strip_prefix(&prefix).unwrap_or(name).to_string()
}
