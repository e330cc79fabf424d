//! Test tooling shared by this crate's own `#[cfg(test)]` modules and by
//! `tests/*.rs`: a minimal [`Runnable`] for wiring up nodes without a real
//! task body, and a couple of assertions over [`OutputMap`] that read
//! better than matching on the enum inline.
//!
//! Grounded in the teacher's `testing.rs` (a dedicated test-support module
//! shipped as part of the library, not just `#[cfg(test)]` code) —
//! generalized from pipeline-graph debugging helpers to the engine's own
//! `Node`/`Workflow` types.

use crate::error::EngineError;
use crate::node::Runnable;
use crate::record::{ElementResult, FieldSpec, FieldType, Record, Scalar, Spec, Value};
use std::collections::HashMap;

/// A `Runnable` that copies one scalar field through under a new name,
/// optionally adding a constant. Exists purely so node/workflow tests don't
/// each need their own task body.
pub struct Identity {
    input_spec: Spec,
    output_spec: Spec,
    input_name: String,
    output_name: String,
    add: i64,
}

impl Identity {
    pub fn new(input_name: impl Into<String>, output_name: impl Into<String>) -> Self {
        let input_name = input_name.into();
        let output_name = output_name.into();
        Identity {
            input_spec: vec![FieldSpec::new(input_name.clone(), FieldType::Scalar)],
            output_spec: vec![FieldSpec::new(output_name.clone(), FieldType::Scalar)],
            input_name,
            output_name,
            add: 0,
        }
    }

    #[must_use]
    pub fn plus(mut self, add: i64) -> Self {
        self.add = add;
        self
    }
}

impl Runnable for Identity {
    fn class_name(&self) -> &str {
        "Identity"
    }
    fn input_spec(&self) -> &Spec {
        &self.input_spec
    }
    fn output_spec(&self) -> &Spec {
        &self.output_spec
    }
    fn call(&self, inputs: &Record, _rerun: bool) -> Result<ElementResult, EngineError> {
        let value = inputs.get(&self.input_name).cloned().ok_or_else(|| EngineError::UnknownVariable {
            node: "Identity".into(),
            variable: self.input_name.clone(),
        })?;
        let value = match value {
            Value::Scalar(Scalar::Int(x)) => Value::Scalar(Scalar::Int(x + self.add)),
            other => other,
        };
        let mut output = Record::new();
        output.set(self.output_name.clone(), value);
        Ok(ElementResult {
            output,
            runtime: Default::default(),
            error: None,
        })
    }
}

/// Assert that every entry of a plain (uncombined) output map holds the
/// scalar int `expected`, regardless of directory name.
pub fn assert_all_ints_equal(values: &HashMap<String, Value>, expected: i64) {
    for (dir, value) in values {
        assert_eq!(value, &Value::Scalar(Scalar::Int(expected)), "unexpected value at {dir}");
    }
}

/// Collect a plain output map's scalar ints, sorted, ignoring directory
/// names — convenient when a test only cares about the multiset of results.
pub fn sorted_ints(values: &HashMap<String, Value>) -> Vec<i64> {
    let mut out: Vec<i64> = values
        .values()
        .filter_map(|v| match v {
            Value::Scalar(Scalar::Int(n)) => Some(*n),
            _ => None,
        })
        .collect();
    out.sort_unstable();
    out
}
