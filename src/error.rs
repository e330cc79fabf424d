//! Typed error taxonomy for the split/combine engine (spec §7).
//!
//! Mirrors the style of the teacher's `validation.rs`: plain structs/enums
//! with hand-written `Display`/`Error` impls rather than a derive macro, so
//! each variant can carry the offending node or variable name.

use std::fmt;
use std::path::PathBuf;

/// Planning and execution errors, one variant per row of spec §7.
#[derive(Debug, Clone)]
pub enum EngineError {
    /// The splitter/combiner expression could not be parsed.
    MalformedSplitter { expr: String, reason: String },
    /// A scalar-product subtree's operands disagreed in length.
    ScalarProductLengthMismatch {
        node: String,
        left_len: usize,
        right_len: usize,
    },
    /// A splitter referenced a field that isn't bound on the node.
    UnknownVariable { node: String, variable: String },
    /// `connect_wf_input` named a workflow input that was never supplied.
    UnresolvedEdge { workflow: String, field: String },
    /// Two entries in `wf_output_names` exposed the same name.
    DuplicateOutputName { workflow: String, name: String },
    /// The runnable raised or exited non-zero; persisted alongside the
    /// element as `_error` and recorded here for the caller that observed it.
    RunnableFailure {
        node: String,
        dir_name: String,
        message: String,
    },
    /// An upstream element has no `_result` at the point a downstream
    /// element tried to read it.
    MissingDependency {
        from_node: String,
        from_field: String,
        to_node: String,
    },
    /// `_result` exists but could not be decoded.
    CacheCorruption { path: PathBuf, reason: String },
    /// `save_input_set` was called twice for the same name without `force`.
    InputSetAlreadySaved { node: String, name: String },
}

impl fmt::Display for EngineError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EngineError::MalformedSplitter { expr, reason } => {
                write!(f, "malformed splitter {expr:?}: {reason}")
            }
            EngineError::ScalarProductLengthMismatch {
                node,
                left_len,
                right_len,
            } => write!(
                f,
                "node {node}: scalar-product operands have different lengths ({left_len} != {right_len})"
            ),
            EngineError::UnknownVariable { node, variable } => {
                write!(f, "node {node}: splitter refers to unbound field {variable:?}")
            }
            EngineError::UnresolvedEdge { workflow, field } => write!(
                f,
                "workflow {workflow}: connect_wf_input target {field:?} absent from workflow inputs"
            ),
            EngineError::DuplicateOutputName { workflow, name } => write!(
                f,
                "workflow {workflow}: output name {name:?} used by more than one entry in wf_output_names"
            ),
            EngineError::RunnableFailure {
                node,
                dir_name,
                message,
            } => write!(f, "node {node} element {dir_name}: {message}"),
            EngineError::MissingDependency {
                from_node,
                from_field,
                to_node,
            } => write!(
                f,
                "node {to_node}: missing dependency {from_node}.{from_field}"
            ),
            EngineError::CacheCorruption { path, reason } => {
                write!(f, "cache entry at {} is corrupt: {reason}", path.display())
            }
            EngineError::InputSetAlreadySaved { node, name } => write!(
                f,
                "node {node}: input set {name:?} already saved; pass force=true to override"
            ),
        }
    }
}

impl std::error::Error for EngineError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_includes_node_and_field() {
        let err = EngineError::UnknownVariable {
            node: "addtwo".into(),
            variable: "ghost".into(),
        };
        let rendered = err.to_string();
        assert!(rendered.contains("addtwo"));
        assert!(rendered.contains("ghost"));
    }
}
