//! Node (spec §4.E): one task instance with its splitter/combiner, input
//! record, state, per-element results dictionary, and output assembly.
//!
//! Per spec §9's "cyclic node↔state references" design note, a [`Node`]
//! owns its [`State`] outright and holds no reference back to its parent
//! [`crate::workflow::Workflow`] or to upstream nodes; the cross-node parts
//! of `get_input_el` (spec §4.E) live on `Workflow`, which is the only type
//! allowed to see more than one node at a time.

use crate::cache::{self, CacheConfig};
use crate::error::EngineError;
use crate::record::{self, ElementResult, NoFingerprint, Record, Spec, Value};
use crate::splitter::{self, Rpn};
use crate::state::{State, StateDict};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

/// The uniform interface the engine invokes to run one element (spec §6
/// "Runnable contract"). Concrete task bodies — scripted subprocess tasks,
/// pure-function tasks — are out of scope; only this seam is specified.
pub trait Runnable: Send + Sync {
    fn class_name(&self) -> &str;
    fn input_spec(&self) -> &Spec;
    fn output_spec(&self) -> &Spec;
    /// Execute and produce a result for the given bound inputs.
    /// `rerun = true` means ignore cache hits for this element.
    fn call(&self, inputs: &Record, rerun: bool) -> Result<ElementResult, EngineError>;
}

/// Either one value per directory name (no combiner), or a list of values
/// per reduced directory name (spec §4.E `get_output`/`_combined_output`).
#[derive(Debug, Clone)]
pub enum OutputMap {
    Plain(HashMap<String, Value>),
    Combined(HashMap<String, Vec<Value>>),
}

/// One task instance (spec §3 "Node").
pub struct Node {
    pub name: String,
    pub runnable: Arc<dyn Runnable>,
    pub inputs: Record,
    pub workingdir: PathBuf,
    pub write_state: bool,
    /// `(upstream_node, upstream_field, local_field)`.
    pub needed_outputs: Vec<(String, String, String)>,
    splitter: Option<Rpn>,
    combiner: Vec<String>,
    state: Option<State>,
    /// `directory_name -> result`, spec's `results_dict`.
    results_dict: HashMap<String, ElementResult>,
    /// `directory_name -> the state dict it was run under`, kept alongside
    /// `results_dict` so `get_output` can recompute combiner groupings
    /// without re-deriving state from upstream nodes.
    state_dicts: HashMap<String, StateDict>,
    /// Execution order of directory names — `get_output` must replay
    /// results in lexicographic multi-index order (spec §5), not hash order.
    element_order: Vec<String>,
    is_complete: bool,
    input_sets: HashMap<String, Record>,
}

impl Node {
    pub fn new(name: impl Into<String>, runnable: Arc<dyn Runnable>) -> Self {
        let name = name.into();
        Node {
            name: name.clone(),
            runnable,
            inputs: Record::new(),
            workingdir: PathBuf::from(name),
            write_state: true,
            needed_outputs: Vec::new(),
            splitter: None,
            combiner: Vec::new(),
            state: None,
            results_dict: HashMap::new(),
            state_dicts: HashMap::new(),
            element_order: Vec::new(),
            is_complete: false,
            input_sets: HashMap::new(),
        }
    }

    /// Save a named bundle of inputs for later recall by name (ported from
    /// `NodeBase.save_set`, kept because it is cheap and purely additive —
    /// see SPEC_FULL.md's named input sets).
    pub fn save_input_set(&mut self, name: impl Into<String>, inputs: Record, force: bool) -> Result<(), EngineError> {
        let name = name.into();
        if self.input_sets.contains_key(&name) && !force {
            return Err(EngineError::InputSetAlreadySaved {
                node: self.name.clone(),
                name,
            });
        }
        self.input_sets.insert(name, inputs);
        Ok(())
    }

    pub fn use_input_set(&mut self, name: &str) -> Result<(), EngineError> {
        let inputs = self
            .input_sets
            .get(name)
            .cloned()
            .ok_or_else(|| EngineError::UnknownVariable {
                node: self.name.clone(),
                variable: name.to_string(),
            })?;
        self.inputs = inputs;
        Ok(())
    }

    /// Set the splitter, namespacing bare leaves to this node's name.
    /// Idempotent only if the new expression is equal to the old one (spec
    /// §4.E `split`).
    pub fn split(&mut self, expr: &str, inputs: Option<Record>) -> Result<(), EngineError> {
        let rpn = splitter::prepend_namespace(&splitter::parse(expr)?, &self.name);
        if let Some(existing) = &self.splitter {
            if existing != &rpn {
                return Err(EngineError::MalformedSplitter {
                    expr: expr.to_string(),
                    reason: format!("splitter is already set on node {}", self.name),
                });
            }
        }
        self.splitter = Some(rpn);
        if let Some(inputs) = inputs {
            for (name, value) in inputs.iter() {
                self.inputs.set(name.clone(), value.clone());
            }
        }
        Ok(())
    }

    /// Set the combiner. Requires a prior splitter (spec §4.E `combine`).
    pub fn combine(&mut self, combiner: Vec<String>) -> Result<(), EngineError> {
        if self.splitter.is_none() {
            return Err(EngineError::MalformedSplitter {
                expr: combiner.join(","),
                reason: format!("splitter has to be set before setting combiner on node {}", self.name),
            });
        }
        let namespaced: Vec<String> = combiner
            .into_iter()
            .map(|v| if v.contains('.') { v } else { format!("{}.{}", self.name, v) })
            .collect();
        if !self.combiner.is_empty() && self.combiner != namespaced {
            return Err(EngineError::MalformedSplitter {
                expr: namespaced.join(","),
                reason: format!("combiner is already set on node {}", self.name),
            });
        }
        self.combiner = namespaced;
        Ok(())
    }

    pub fn splitter_rpn(&self) -> Option<&Rpn> {
        self.splitter.as_ref()
    }

    /// Adopt an already-namespaced splitter inherited from an upstream node
    /// (spec §4.F splitter inheritance), bypassing the idempotency check in
    /// [`Node::split`] since this never comes from a second explicit call.
    pub fn adopt_splitter(&mut self, rpn: Rpn) {
        self.splitter = Some(rpn);
    }

    pub fn combiner(&self) -> &[String] {
        &self.combiner
    }

    pub fn state(&self) -> Option<&State> {
        self.state.as_ref()
    }

    /// `configured -> planned`: evaluate state from bound inputs (spec
    /// §4.E state machine). `inner_splitter` names the subset of inputs
    /// whose length varies per parent element.
    pub fn prepare_state_input(&mut self, inner_splitter: Vec<String>) -> Result<(), EngineError> {
        self.is_complete = false;
        match &self.splitter {
            None => {
                self.state = None;
            }
            Some(rpn) => {
                let state = State::prepare(&self.name, rpn.clone(), self.combiner.clone(), inner_splitter, &self.inputs)?;
                self.state = Some(state);
            }
        }
        Ok(())
    }

    /// True iff every upstream node this node depends on is complete, per
    /// the predicate the caller (normally `Workflow`) supplies — `Node`
    /// itself never holds references to other nodes.
    pub fn ready2run(&self, is_upstream_complete: &dyn Fn(&str) -> bool) -> bool {
        self.needed_outputs
            .iter()
            .all(|(from_node, _, _)| is_upstream_complete(from_node))
    }

    pub fn is_complete(&self) -> bool {
        self.is_complete
    }

    /// `running -> complete`: true once every element has a recorded,
    /// error-free result (spec §4.E `_check_all_results`).
    pub fn check_all_results(&mut self) -> bool {
        if self.is_complete {
            return true;
        }
        let total = self.state.as_ref().map(State::total_elements).unwrap_or(1);
        if self.element_order.len() < total {
            return false;
        }
        let ok = self
            .element_order
            .iter()
            .all(|dir| self.results_dict.get(dir).is_some_and(|r| r.error.is_none()));
        if ok {
            self.is_complete = true;
        }
        ok
    }

    /// Execute (or load from cache) one element, given its fully-gathered
    /// inputs. Touches only the filesystem (cache reads/writes, the
    /// advisory lock) and the runnable itself — never `self` — so it may be
    /// called concurrently across elements of the same node from multiple
    /// threads (spec §5's per-element concurrency model; see
    /// [`crate::runner`]).
    pub fn execute_element(&self, dir_name: &str, local_inputs: &Record, cache: &CacheConfig, rerun: bool) -> Result<ElementResult, EngineError> {
        let hash = record::input_hash(self.runnable.class_name(), local_inputs, &NoFingerprint)?;
        let checksum = record::checksum(self.runnable.class_name(), &hash);
        let dir = self.workingdir.join(dir_name);

        if !rerun {
            if let Some(cached) = cache::load(&checksum, &cache.roots)? {
                tracing::debug!(node = %self.name, dir_name, "reusing cached result");
                return Ok(cached);
            }
        }

        let Some(_lock) = cache::try_acquire_lock(&dir)? else {
            tracing::debug!(node = %self.name, dir_name, "another executor holds the write lock; skipping this round");
            return Ok(ElementResult {
                output: Record::new(),
                runtime: Default::default(),
                error: None,
            });
        };

        cache::save_task_snapshot(&dir, local_inputs)?;
        tracing::debug!(node = %self.name, dir_name, "running element");
        match self.runnable.call(local_inputs, rerun) {
            Ok(result) => {
                cache::save_result(&dir, &result)?;
                Ok(result)
            }
            Err(e) => {
                let message = e.to_string();
                cache::record_error(&dir, &message)?;
                Err(EngineError::RunnableFailure {
                    node: self.name.clone(),
                    dir_name: dir_name.to_string(),
                    message,
                })
            }
        }
    }

    /// Execute one element and record its outcome (spec §4.E `run_element`);
    /// the sequential convenience wrapper around [`Node::execute_element`] +
    /// [`Node::record_result`]. `Workflow::run_element` is the usual caller;
    /// [`crate::runner`] calls the two halves separately to parallelize
    /// execution across elements.
    pub fn run_single(
        &mut self,
        dir_name: String,
        state_dict: StateDict,
        local_inputs: Record,
        cache: &CacheConfig,
        rerun: bool,
    ) -> Result<(), EngineError> {
        match self.execute_element(&dir_name, &local_inputs, cache, rerun) {
            Ok(result) => {
                self.record_result(dir_name, state_dict, result);
                Ok(())
            }
            Err(e) => {
                self.record_result(
                    dir_name,
                    state_dict,
                    ElementResult {
                        output: Record::new(),
                        runtime: Default::default(),
                        error: Some(e.to_string()),
                    },
                );
                Err(e)
            }
        }
    }

    /// Record an already-executed element's outcome (the mutating half of
    /// [`Node::run_single`], exposed so [`crate::runner`] can apply results
    /// gathered in parallel back onto the node sequentially).
    pub fn record_element(&mut self, dir_name: String, state_dict: StateDict, result: ElementResult) {
        self.record_result(dir_name, state_dict, result);
    }

    fn record_result(&mut self, dir_name: String, state_dict: StateDict, result: ElementResult) {
        if !self.results_dict.contains_key(&dir_name) {
            self.element_order.push(dir_name.clone());
        }
        self.state_dicts.insert(dir_name.clone(), state_dict);
        self.results_dict.insert(dir_name, result);
    }

    pub fn result_for(&self, dir_name: &str) -> Option<&ElementResult> {
        self.results_dict.get(dir_name)
    }

    /// Assemble `_output[field] = {dir_name -> value}`, or, with a combiner,
    /// `{reduced_dir_name -> [values]}` in ascending lexicographic-index
    /// order (spec §4.E `get_output`, `_combined_output`).
    pub fn get_output(&self) -> HashMap<String, OutputMap> {
        let mut output = HashMap::new();
        let remove: std::collections::HashSet<String> = self.combiner.iter().cloned().collect();
        for field_spec in self.runnable.output_spec() {
            let field = field_spec.exposed_name().to_string();
            if self.combiner.is_empty() {
                let mut plain = HashMap::new();
                for dir_name in &self.element_order {
                    if let Some(value) = self.results_dict[dir_name].output.get(&field) {
                        plain.insert(dir_name.clone(), value.clone());
                    }
                }
                output.insert(field, OutputMap::Plain(plain));
            } else {
                let mut combined: HashMap<String, Vec<Value>> = HashMap::new();
                for dir_name in &self.element_order {
                    let Some(value) = self.results_dict[dir_name].output.get(&field) else {
                        continue;
                    };
                    let state_dict = self.state_dicts.get(dir_name).cloned().unwrap_or_default();
                    let reduced = reduced_dir_name(&state_dict, &remove);
                    combined.entry(reduced).or_default().push(value.clone());
                }
                output.insert(field, OutputMap::Combined(combined));
            }
        }
        output
    }
}

/// Directory name over a state dict with the combined variables removed
/// (ports `_combined_output`'s `dir_nm_comb`, which — unlike
/// `directory_name_state_surv` — starts from the *full* state dict, not
/// just the splitter-surviving subset).
fn reduced_dir_name(state_dict: &StateDict, remove: &std::collections::HashSet<String>) -> String {
    state_dict
        .iter()
        .filter(|(k, _)| !remove.contains(*k))
        .map(|(k, v)| format!("{k}:{}", v.dir_repr()))
        .collect::<Vec<_>>()
        .join("_")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::{FieldType, Scalar};

    struct AddTwo {
        input_spec: Spec,
        output_spec: Spec,
    }

    impl AddTwo {
        fn new() -> Self {
            AddTwo {
                input_spec: vec![record::FieldSpec::new("x", FieldType::Scalar)],
                output_spec: vec![record::FieldSpec::new("out", FieldType::Scalar)],
            }
        }
    }

    impl Runnable for AddTwo {
        fn class_name(&self) -> &str {
            "AddTwo"
        }
        fn input_spec(&self) -> &Spec {
            &self.input_spec
        }
        fn output_spec(&self) -> &Spec {
            &self.output_spec
        }
        fn call(&self, inputs: &Record, _rerun: bool) -> Result<ElementResult, EngineError> {
            let Some(Value::Scalar(Scalar::Int(x))) = inputs.get("x") else {
                panic!("expected x");
            };
            let mut output = Record::new();
            output.set("out", Value::Scalar(Scalar::Int(x + 2)));
            Ok(ElementResult {
                output,
                runtime: Default::default(),
                error: None,
            })
        }
    }

    #[test]
    fn split_is_idempotent_for_equal_expressions() {
        let mut node = Node::new("n", Arc::new(AddTwo::new()));
        node.split("x", None).unwrap();
        node.split("x", None).unwrap();
        assert!(node.split("y", None).is_err());
    }

    #[test]
    fn combine_requires_prior_splitter() {
        let mut node = Node::new("n", Arc::new(AddTwo::new()));
        assert!(node.combine(vec!["x".into()]).is_err());
        node.split("x", None).unwrap();
        assert!(node.combine(vec!["x".into()]).is_ok());
    }

    #[test]
    fn run_single_caches_and_reports_completion() {
        let tmp = tempfile::tempdir().unwrap();
        let cache = CacheConfig::single(tmp.path().join("cache"));
        let mut node = Node::new("addtwo", Arc::new(AddTwo::new()));
        node.workingdir = tmp.path().join("addtwo");
        node.split("x", None).unwrap();
        node.inputs.set(
            "addtwo.x",
            Value::Sequence(vec![
                Value::Scalar(Scalar::Int(1)),
                Value::Scalar(Scalar::Int(2)),
                Value::Scalar(Scalar::Int(3)),
            ]),
        );
        node.prepare_state_input(vec![]).unwrap();

        let state = node.state().unwrap().clone();
        for ind in state.all_elements() {
            let state_dict = state.state_values(&ind, &node.inputs).unwrap();
            let (dir_name, _) = state.directory_name_state_surv(&ind, &state_dict, node.write_state);
            let mut local = Record::new();
            local.set("x", state_dict.get("addtwo.x").unwrap().clone());
            node.run_single(dir_name, state_dict, local, &cache, false).unwrap();
        }

        assert!(node.check_all_results());
        let output = node.get_output();
        let OutputMap::Plain(map) = &output["out"] else {
            panic!("expected plain output map");
        };
        assert_eq!(map.len(), 3);
        assert_eq!(map.get("addtwo.x:1"), Some(&Value::Scalar(Scalar::Int(3))));
    }

    #[test]
    fn save_input_set_rejects_a_second_save_without_force() {
        let mut node = Node::new("n", Arc::new(AddTwo::new()));
        let mut inputs = Record::new();
        inputs.set("x", Value::Scalar(Scalar::Int(1)));
        node.save_input_set("a", inputs.clone(), false).unwrap();

        let err = node.save_input_set("a", inputs.clone(), false).unwrap_err();
        assert!(matches!(err, EngineError::InputSetAlreadySaved { .. }));

        assert!(node.save_input_set("a", inputs, true).is_ok());
    }

    #[test]
    fn use_input_set_recalls_a_saved_bundle() {
        let mut node = Node::new("n", Arc::new(AddTwo::new()));
        let mut inputs = Record::new();
        inputs.set("x", Value::Scalar(Scalar::Int(7)));
        node.save_input_set("a", inputs, false).unwrap();

        node.use_input_set("a").unwrap();
        assert_eq!(node.inputs.get("x"), Some(&Value::Scalar(Scalar::Int(7))));
    }

    #[test]
    fn use_input_set_reports_an_unknown_name() {
        let mut node = Node::new("n", Arc::new(AddTwo::new()));
        let err = node.use_input_set("missing").unwrap_err();
        assert!(matches!(err, EngineError::UnknownVariable { .. }));
    }
}
