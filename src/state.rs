//! State (spec §4.B): the Cartesian axes a node ranges over, resolving a
//! linear index to concrete per-input values, and surviving-state directory
//! naming.
//!
//! Grounded in `pydra`'s `node.py` (`state_values`-equivalent indexing,
//! `_directory_name_state_surv`, `_state_dict_all_comb`), re-expressed with
//! the explicit axis layout produced by [`crate::splitter::rpn_to_axes`].
//!
//! Inner splitters (spec §4.B point 4, §9 "model this as a sum type") are
//! represented as one extra, jagged trailing axis: [`InnerAxis`] records, per
//! outer multi-index, how many inner elements that parent element produced.
//! `all_elements` appends the inner coordinate after the regular ones rather
//! than folding it into `shape`, since its extent is not a single constant.

use crate::error::EngineError;
use crate::record::{Record, Value};
use crate::splitter::{self, Rpn, RpnOp};
use std::collections::{BTreeMap, HashMap, HashSet};

/// `variable -> value` at one concrete element, always iterated in sorted
/// key order — this makes [`State::dir_name`] a pure function of its
/// contents regardless of how the map was built (spec §3 invariant 6).
pub type StateDict = BTreeMap<String, Value>;

/// A jagged trailing axis introduced by one or more inner-splitter fields
/// (spec §4.B / §9's sum type `inner-axis(parent-index -> size)`). Every
/// inner field on a node is assumed to vary in lockstep against the same
/// parent element (they were all produced by the same upstream node), so one
/// `InnerAxis` serves all of them.
#[derive(Debug, Clone, Default)]
pub struct InnerAxis {
    /// The fields whose values are themselves per-parent-element sequences.
    pub fields: Vec<String>,
    /// outer multi-index -> number of inner elements at that outer element.
    pub lengths: HashMap<Vec<usize>, usize>,
}

/// The state of one node once its splitter/combiner are bound to concrete
/// input lengths.
#[derive(Debug, Clone)]
pub struct State {
    /// The node's splitter, namespaced, in RPN form.
    pub rpn: Rpn,
    /// `rpn` with combined variables' leaves removed.
    pub rpn_combined: Rpn,
    pub axis_for_input: std::collections::HashMap<String, Vec<usize>>,
    pub shape: Vec<usize>,
    /// Variables whose length depends on a parent element rather than a
    /// fixed global axis (spec §4.B's inner-splitter case).
    pub inner_splitter: Vec<String>,
    /// Variables eliminated by the combiner.
    pub comb_inp_to_remove: Vec<String>,
    /// Present iff `inner_splitter` is non-empty; the jagged trailing axis.
    pub inner_axis: Option<InnerAxis>,
}

fn vars_in_rpn(rpn: &Rpn) -> HashSet<String> {
    rpn.iter()
        .filter_map(|op| match op {
            RpnOp::Var(name) => Some(name.clone()),
            _ => None,
        })
        .collect()
}

impl State {
    /// Build state for a node's splitter/combiner against its bound inputs
    /// (spec §4.B steps 1-4: derive `axis_for_input`, derive `shape`,
    /// materialise `all_elements` lazily, register inner splitters).
    ///
    /// `inner_splitter` names fields whose bound value is a sequence of
    /// per-parent-element sequences with differing lengths — these never
    /// appear as leaves of `rpn` (they contribute no fixed-size global axis)
    /// and must already have been excluded from it by the caller.
    pub fn prepare(
        node_name: &str,
        rpn: Rpn,
        combiner: Vec<String>,
        inner_splitter: Vec<String>,
        inputs: &Record,
    ) -> Result<State, EngineError> {
        let input_lengths = inputs.lengths();
        let layout = splitter::rpn_to_axes(&rpn, node_name, &input_lengths)?;
        let rpn_combined = if combiner.is_empty() {
            rpn.clone()
        } else {
            splitter::apply_combiner(&rpn, &combiner)
        };

        let inner_axis = if inner_splitter.is_empty() {
            None
        } else {
            Some(build_inner_axis(node_name, &inner_splitter, &layout.shape, inputs)?)
        };

        Ok(State {
            rpn,
            rpn_combined,
            axis_for_input: layout.axis_for_input,
            shape: layout.shape,
            inner_splitter,
            comb_inp_to_remove: combiner,
            inner_axis,
        })
    }

    /// An empty state: no splitter was set. A single implicit element at
    /// index `[]`.
    pub fn unsplit() -> State {
        State {
            rpn: Vec::new(),
            rpn_combined: Vec::new(),
            axis_for_input: std::collections::HashMap::new(),
            shape: Vec::new(),
            inner_splitter: Vec::new(),
            comb_inp_to_remove: Vec::new(),
            inner_axis: None,
        }
    }

    pub fn has_splitter(&self) -> bool {
        !self.rpn.is_empty()
    }

    /// Variables named anywhere in the splitter RPN.
    pub fn splitter_vars(&self) -> HashSet<String> {
        vars_in_rpn(&self.rpn)
    }

    /// Variables named in `rpn_combined` (splitter vars minus combined ones).
    pub fn combined_splitter_vars(&self) -> HashSet<String> {
        vars_in_rpn(&self.rpn_combined)
    }

    /// Splitter variables, plus inner splitters, the set used to keep
    /// directory names free of unrelated context (spec GLOSSARY: "surviving
    /// state").
    pub fn surviving_vars(&self) -> HashSet<String> {
        let mut vars = self.splitter_vars();
        vars.extend(self.inner_splitter.iter().cloned());
        vars
    }

    /// The ordered iterator of multi-indices, lexicographic over axes
    /// ascending (spec §3: `all_elements`). Axis 0 varies slowest. When an
    /// inner axis is present, its coordinate is appended after the regular
    /// ones and varies fastest of all.
    pub fn all_elements(&self) -> AllElements<'_> {
        AllElements {
            shape: &self.shape,
            inner: self.inner_axis.as_ref(),
            outer: if self.shape.iter().any(|&s| s == 0) {
                None
            } else {
                Some(vec![0; self.shape.len()])
            },
            inner_cursor: 0,
            started: false,
        }
    }

    pub fn total_elements(&self) -> usize {
        match &self.inner_axis {
            None => self.shape.iter().product(),
            Some(inner) => outer_product(&self.shape)
                .map(|outer| *inner.lengths.get(&outer).unwrap_or(&0))
                .sum(),
        }
    }

    /// Split a multi-index into its regular (outer) coordinates and, when an
    /// inner axis is present, the trailing inner coordinate.
    fn split_index<'a>(&self, ind: &'a [usize]) -> (&'a [usize], Option<usize>) {
        if self.inner_axis.is_some() {
            let (outer, inner) = ind.split_at(self.shape.len());
            (outer, inner.first().copied())
        } else {
            (ind, None)
        }
    }

    /// Resolve one multi-index to concrete values for every field in
    /// `inputs` (spec §4.B `state_values`): split fields are indexed along
    /// their axes, inner-splitter fields are indexed along their outer
    /// coordinate and then the inner coordinate, unsplit fields pass through
    /// unchanged.
    pub fn state_values(&self, ind: &[usize], inputs: &Record) -> Result<StateDict, EngineError> {
        let (outer, inner_idx) = self.split_index(ind);
        let inner_fields: HashSet<&str> = self.inner_splitter.iter().map(String::as_str).collect();
        let mut dict = StateDict::new();
        for (name, value) in inputs.iter() {
            if inner_fields.contains(name.as_str()) {
                let inner_idx = inner_idx.ok_or_else(|| EngineError::MalformedSplitter {
                    expr: name.clone(),
                    reason: "inner-splitter field resolved without an inner axis".into(),
                })?;
                let per_parent = value.index_axes(outer).ok_or_else(|| EngineError::MalformedSplitter {
                    expr: name.clone(),
                    reason: "index out of range resolving inner-splitter parent element".into(),
                })?;
                let resolved = per_parent.index_axes(&[inner_idx]).ok_or_else(|| EngineError::MalformedSplitter {
                    expr: name.clone(),
                    reason: "inner index out of range".into(),
                })?;
                dict.insert(name.clone(), resolved.clone());
            } else if let Some(axes) = self.axis_for_input.get(name) {
                let sub_idx: Vec<usize> = axes.iter().map(|&a| outer[a]).collect();
                let resolved = value.index_axes(&sub_idx).ok_or_else(|| EngineError::MalformedSplitter {
                    expr: name.clone(),
                    reason: "index out of range while resolving state element".into(),
                })?;
                dict.insert(name.clone(), resolved.clone());
            } else {
                dict.insert(name.clone(), value.clone());
            }
        }
        if let Some(inner_idx) = inner_idx {
            for field in &self.inner_splitter {
                dict.entry(format!("{field}.inner"))
                    .or_insert_with(|| Value::Scalar(crate::record::Scalar::Int(inner_idx as i64)));
            }
        }
        Ok(dict)
    }

    /// As `state_values`, but split fields are rendered as index tuples
    /// (`"0x1"` style) instead of values — used when `write_state` is
    /// false (spec §4.B).
    pub fn state_ind(&self, ind: &[usize]) -> StateDict {
        let (outer, inner_idx) = self.split_index(ind);
        let mut dict = StateDict::new();
        for (name, axes) in &self.axis_for_input {
            let repr = axes
                .iter()
                .map(|&a| outer[a].to_string())
                .collect::<Vec<_>>()
                .join("x");
            dict.insert(name.clone(), Value::Scalar(crate::record::Scalar::Str(repr)));
        }
        if let Some(inner_idx) = inner_idx {
            for field in &self.inner_splitter {
                dict.insert(
                    format!("{field}.inner"),
                    Value::Scalar(crate::record::Scalar::Str(inner_idx.to_string())),
                );
            }
        }
        dict
    }

    /// Concatenate `key:value` pairs in sorted key order (spec §4.B
    /// `dir_name`; invariant 6: pure function of contents, not insertion
    /// order — guaranteed here since `StateDict` is a `BTreeMap`).
    pub fn dir_name(state_dict: &StateDict) -> String {
        state_dict
            .iter()
            .map(|(k, v)| format!("{k}:{}", v.dir_repr()))
            .collect::<Vec<_>>()
            .join("_")
    }

    /// Filter `state_dict` down to the surviving (splitter ∪ inner-splitter)
    /// variables and compute its directory name in one step (ports
    /// `_directory_name_state_surv`). When `write_state` is false, the index
    /// tuples from [`State::state_ind`] are used in place of the resolved
    /// values, per spec §4.B's `write_state` toggle.
    pub fn directory_name_state_surv(&self, ind: &[usize], state_dict: &StateDict, write_state: bool) -> (String, StateDict) {
        let surviving = self.surviving_vars();
        let source = if write_state { state_dict.clone() } else { self.state_ind(ind) };
        let filtered: StateDict = source
            .into_iter()
            .filter(|(k, _)| surviving.contains(k) || self.inner_splitter.iter().any(|f| k == &format!("{f}.inner")))
            .collect();
        (Self::dir_name(&filtered), filtered)
    }
}

fn outer_product(shape: &[usize]) -> impl Iterator<Item = Vec<usize>> + '_ {
    AllElements {
        shape,
        inner: None,
        outer: if shape.iter().any(|&s| s == 0) {
            None
        } else {
            Some(vec![0; shape.len()])
        },
        inner_cursor: 0,
        started: false,
    }
}

/// Compute, for each outer multi-index, the length of an inner-splitter
/// field's per-parent-element sequence (spec §4.B: "register that edge as an
/// inner splitter... contributes a secondary index scoped to the current
/// outer element"). All fields in `inner_splitter` are assumed to share the
/// same per-parent lengths (they originate from the same upstream element).
fn build_inner_axis(
    node_name: &str,
    inner_splitter: &[String],
    shape: &[usize],
    inputs: &Record,
) -> Result<InnerAxis, EngineError> {
    let first = inner_splitter.first().expect("inner_splitter non-empty");
    let value = inputs.get(first).ok_or_else(|| EngineError::UnknownVariable {
        node: node_name.to_string(),
        variable: first.clone(),
    })?;
    let mut lengths = HashMap::new();
    for outer in outer_product(shape) {
        let per_parent = value.index_axes(&outer).ok_or_else(|| EngineError::MalformedSplitter {
            expr: first.clone(),
            reason: "index out of range while deriving inner-axis length".into(),
        })?;
        lengths.insert(outer, per_parent.outer_len());
    }
    Ok(InnerAxis {
        fields: inner_splitter.to_vec(),
        lengths,
    })
}

/// Lazy, lexicographic (axes ascending, axis 0 slowest) Cartesian product
/// iterator over `0..shape[0] x 0..shape[1] x ...`, with an optional jagged
/// inner coordinate appended after the regular axes, varying fastest.
pub struct AllElements<'a> {
    shape: &'a [usize],
    inner: Option<&'a InnerAxis>,
    outer: Option<Vec<usize>>,
    inner_cursor: usize,
    started: bool,
}

impl AllElements<'_> {
    fn advance_outer(&mut self) {
        let Some(current) = self.outer.take() else { return };
        let mut next = current;
        let mut i = next.len();
        loop {
            if i == 0 {
                self.outer = None;
                return;
            }
            i -= 1;
            next[i] += 1;
            if next[i] < self.shape[i] {
                self.outer = Some(next);
                return;
            }
            next[i] = 0;
        }
    }
}

impl Iterator for AllElements<'_> {
    type Item = Vec<usize>;

    fn next(&mut self) -> Option<Vec<usize>> {
        match self.inner {
            None => {
                let current = self.outer.take()?;
                self.advance_outer();
                Some(current)
            }
            Some(inner) => loop {
                let outer = self.outer.clone()?;
                let len = *inner.lengths.get(&outer).unwrap_or(&0);
                if !self.started {
                    self.started = true;
                    self.inner_cursor = 0;
                }
                if self.inner_cursor >= len {
                    self.advance_outer();
                    self.inner_cursor = 0;
                    continue;
                }
                let mut ind = outer;
                ind.push(self.inner_cursor);
                self.inner_cursor += 1;
                return Some(ind);
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::Scalar;
    use crate::splitter::parse;

    fn record(pairs: &[(&str, Value)]) -> Record {
        pairs.iter().map(|(k, v)| (k.to_string(), v.clone())).collect()
    }

    fn seq(vals: &[i64]) -> Value {
        Value::Sequence(vals.iter().map(|v| Value::Scalar(Scalar::Int(*v))).collect())
    }

    #[test]
    fn all_elements_count_matches_shape_product() {
        let rpn = parse("x × y").unwrap();
        let rpn = splitter::prepend_namespace(&rpn, "n");
        let inputs = record(&[("n.x", seq(&[0, 0])), ("n.y", seq(&[0, 0, 0]))]);
        let state = State::prepare("n", rpn, vec![], vec![], &inputs).unwrap();
        assert_eq!(state.total_elements(), 6);
        let all: Vec<_> = state.all_elements().collect();
        assert_eq!(all.len(), 6);
        let unique: HashSet<_> = all.iter().cloned().collect();
        assert_eq!(unique.len(), 6, "no duplicate multi-indices");
    }

    #[test]
    fn scalar_product_two_node_elements() {
        let rpn = splitter::prepend_namespace(&parse("x.y").unwrap(), "n");
        let inputs = record(&[("n.x", seq(&[1, 2, 3])), ("n.y", seq(&[10, 20, 30]))]);
        let state = State::prepare("n", rpn, vec![], vec![], &inputs).unwrap();
        let mut dirs = Vec::new();
        for ind in state.all_elements() {
            let dict = state.state_values(&ind, &inputs).unwrap();
            let (dir, _) = state.directory_name_state_surv(&ind, &dict, true);
            dirs.push(dir);
        }
        assert_eq!(dirs, vec!["n.x:1_n.y:10", "n.x:2_n.y:20", "n.x:3_n.y:30"]);
    }

    #[test]
    fn dir_name_is_independent_of_insertion_order() {
        let mut a = StateDict::new();
        a.insert("y".to_string(), Value::Scalar(Scalar::Int(2)));
        a.insert("x".to_string(), Value::Scalar(Scalar::Int(1)));
        let mut b = StateDict::new();
        b.insert("x".to_string(), Value::Scalar(Scalar::Int(1)));
        b.insert("y".to_string(), Value::Scalar(Scalar::Int(2)));
        assert_eq!(State::dir_name(&a), State::dir_name(&b));
    }

    #[test]
    fn combiner_removes_axis_from_combined_rpn() {
        let rpn = splitter::prepend_namespace(&parse("x × y").unwrap(), "n");
        let inputs = record(&[("n.x", seq(&[0, 0])), ("n.y", seq(&[0, 0, 0]))]);
        let state = State::prepare("n", rpn, vec!["n.y".to_string()], vec![], &inputs).unwrap();
        assert_eq!(state.combined_splitter_vars(), HashSet::from(["n.x".to_string()]));
    }

    #[test]
    fn inner_splitter_contributes_a_jagged_trailing_axis() {
        // Node A's splitter is "a" (axis of size 2); its output per element
        // is a variable-length list ([0..a]). Node B inherits the "a" axis
        // and additionally ranges over the inner elements of that output.
        let rpn = splitter::prepend_namespace(&parse("a").unwrap(), "b");
        let inner_output = Value::Sequence(vec![seq(&[0]), seq(&[0, 0])]); // lengths 1, 2
        let inputs = record(&[("b.a", seq(&[10, 20])), ("b.x", inner_output)]);
        let state = State::prepare("b", rpn, vec![], vec!["b.x".to_string()], &inputs).unwrap();

        assert_eq!(state.total_elements(), 3);
        let all: Vec<_> = state.all_elements().collect();
        assert_eq!(all, vec![vec![0, 0], vec![1, 0], vec![1, 1]]);

        let mut dirs = Vec::new();
        for ind in &all {
            let dict = state.state_values(ind, &inputs).unwrap();
            let (dir, _) = state.directory_name_state_surv(ind, &dict, true);
            dirs.push(dir);
        }
        assert_eq!(
            dirs,
            vec!["b.a:10_b.x.inner:0", "b.a:20_b.x.inner:0", "b.a:20_b.x.inner:1"]
        );
    }

    #[test]
    fn write_state_false_uses_index_tuples_instead_of_values() {
        let rpn = splitter::prepend_namespace(&parse("x.y").unwrap(), "n");
        let inputs = record(&[("n.x", seq(&[1, 2, 3])), ("n.y", seq(&[10, 20, 30]))]);
        let state = State::prepare("n", rpn, vec![], vec![], &inputs).unwrap();
        let mut dirs = Vec::new();
        for ind in state.all_elements() {
            let dict = state.state_values(&ind, &inputs).unwrap();
            let (dir, _) = state.directory_name_state_surv(&ind, &dict, false);
            dirs.push(dir);
        }
        // Index tuples, not the underlying values, drive the directory name.
        assert_eq!(dirs, vec!["n.x:0_n.y:0", "n.x:1_n.y:1", "n.x:2_n.y:2"]);
    }
}
