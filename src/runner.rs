//! Executor contract (spec §4.G / §6 "Scheduler contract"): the narrow
//! interface used to step through a workflow's nodes in topological order,
//! run each node's elements, and test completeness.
//!
//! Grounded in the teacher's `runner.rs` (`ExecMode`, rayon-based
//! `exec_par`), re-purposed to drive [`crate::workflow::Workflow::graph_sorted`]
//! × [`crate::state::State::all_elements`] instead of a linear fused op
//! chain. Per spec §5, independent `(node, element)` pairs may execute
//! concurrently; there is no shared mutable state between them except the
//! cache. [`Node::execute_element`](crate::node::Node::execute_element) is
//! the `&self` half callable from any thread; recording the outcome back
//! onto the node is sequential, matching spec §5's "the cache mediates all
//! cross-element visibility" (everything else about a node is owned by one
//! thread at a time).

use crate::cache::CacheConfig;
use crate::error::EngineError;
use crate::node::Node;
use crate::record::{ElementResult, Record};
use crate::state::{State, StateDict};
use crate::workflow::Workflow;
use rayon::prelude::*;

/// How element executions within one node are scheduled (spec §5
/// "Scheduling model": single-threaded at the graph level, parallel at the
/// element level).
#[derive(Clone, Copy, Debug)]
pub enum ExecMode {
    /// Elements run one at a time, in lexicographic multi-index order.
    Sequential,
    /// Independent elements run concurrently on a rayon thread pool.
    /// `threads = None` uses rayon's global pool as-is.
    Parallel { threads: Option<usize> },
}

impl Default for ExecMode {
    fn default() -> Self {
        ExecMode::Parallel { threads: None }
    }
}

/// Drives a [`Workflow`] to completion (spec §6 "Scheduler contract").
#[derive(Debug, Clone, Default)]
pub struct Runner {
    pub mode: ExecMode,
}

struct ElementWork {
    dir_name: String,
    state_dict: StateDict,
    local_inputs: Record,
}

impl Runner {
    pub fn new(mode: ExecMode) -> Self {
        Runner { mode }
    }

    /// Prepare and run every node of `wf` in topological order (spec §4.F
    /// `preparing` + §5 "no child element starts before every relevant
    /// parent element is complete"). A node whose elements all succeed
    /// becomes complete; a node with any failed element does not, and the
    /// workflow still proceeds to attempt independent downstream work is
    /// *not* attempted for nodes that depend on the failed one, since
    /// `prepare_node` surfaces `MissingDependency` for them.
    pub fn run(&self, wf: &mut Workflow, cache: &CacheConfig) -> Result<(), EngineError> {
        for name in wf.graph_sorted()? {
            tracing::debug!(node = %name, "preparing node");
            wf.prepare_node(&name)?;
            self.run_node(wf, &name, cache)?;
            let complete = wf.node_mut(&name).unwrap().check_all_results();
            if complete {
                tracing::debug!(node = %name, "node complete");
            } else {
                tracing::error!(node = %name, "node finished with at least one failed element");
            }
        }
        Ok(())
    }

    /// Run every element of one already-prepared node (spec §6 "per-node
    /// `state.all_elements`, per-element `run_element`").
    fn run_node(&self, wf: &mut Workflow, name: &str, cache: &CacheConfig) -> Result<(), EngineError> {
        let indices = element_indices(wf.node(name).unwrap());
        let mut work = Vec::with_capacity(indices.len());
        for ind in &indices {
            let local_inputs = wf.get_input_el(name, ind)?;
            let node = wf.node(name).unwrap();
            let state = node.state().cloned().unwrap_or_else(State::unsplit);
            let state_dict = state.state_values(ind, &node.inputs)?;
            let (dir_name, surviving) = state.directory_name_state_surv(ind, &state_dict, node.write_state);
            work.push(ElementWork {
                dir_name,
                state_dict: surviving,
                local_inputs,
            });
        }

        match self.mode {
            ExecMode::Sequential => {
                for w in work {
                    let node = wf.node_mut(name).unwrap();
                    // Errors are captured into the node's own results_dict by
                    // `run_single`; a runnable failure doesn't abort sibling
                    // elements (spec §7 runnable-failure recovery).
                    let _ = node.run_single(w.dir_name, w.state_dict, w.local_inputs, cache, false);
                }
            }
            ExecMode::Parallel { threads } => {
                if let Some(t) = threads {
                    let _ = rayon::ThreadPoolBuilder::new().num_threads(t).build_global();
                }
                let node_ref: &Node = wf.node(name).unwrap();
                let results: Vec<(String, StateDict, Result<ElementResult, EngineError>)> = work
                    .into_par_iter()
                    .map(|w| {
                        let outcome = node_ref.execute_element(&w.dir_name, &w.local_inputs, cache, false);
                        (w.dir_name, w.state_dict, outcome)
                    })
                    .collect();
                let node = wf.node_mut(name).unwrap();
                for (dir_name, state_dict, outcome) in results {
                    let result = outcome.unwrap_or_else(|e| ElementResult {
                        output: Record::new(),
                        runtime: Default::default(),
                        error: Some(e.to_string()),
                    });
                    node.record_element(dir_name, state_dict, result);
                }
            }
        }
        Ok(())
    }
}

fn element_indices(node: &Node) -> Vec<Vec<usize>> {
    match node.state() {
        Some(state) => state.all_elements().collect(),
        None => vec![Vec::new()],
    }
}
