//! # axisflow
//!
//! A **dataflow task engine** library: a splitter/combiner state machine
//! that turns one task definition into a Cartesian grid of independent
//! elements, runs them through a content-addressed cache, and wires them
//! together into DAGs of nodes.
//!
//! ## Core Concepts
//!
//! ### Splitters and combiners
//!
//! A node's *splitter* is an expression over its input fields written in
//! a small algebra with two operators: scalar product (`.`, zip — operand
//! axes must have equal length and merge into one) and outer product (`×`,
//! Cartesian product — operand axes concatenate). See [`splitter`] for the
//! parser, canonical axis assignment, and combiner-pruning of that
//! expression.
//!
//! ### State
//!
//! [`state::State`] resolves a node's splitter against its bound input
//! lengths into a `shape` and lazily iterates every multi-index in
//! lexicographic order, including the jagged trailing axis contributed by
//! an *inner splitter* — an edge whose per-parent-element value is itself
//! a variable-length sequence.
//!
//! ### Records, specs, and hashing
//!
//! [`record`] defines the closed field-value type (`scalar`, `file`,
//! `sequence`), typed field specs, and the deterministic recursive hash
//! used to key the cache.
//!
//! ### Cache
//!
//! [`cache`] is the content-addressed store: `checksum = "{class}_{hash}"`,
//! consulted across an ordered list of roots, with an advisory write lock
//! enforcing at most one executor per checksum at a time.
//!
//! ### Nodes and workflows
//!
//! [`node::Node`] owns one task's splitter, state, and per-element results.
//! [`workflow::Workflow`] wires nodes into a DAG, materializes upstream
//! outputs onto downstream inputs, and inherits splitters across
//! unconfigured edges.
//!
//! ### Running a workflow
//!
//! [`runner::Runner`] drives a [`workflow::Workflow`] to completion: nodes
//! in topological order, elements within a node either sequentially or in
//! parallel over a rayon thread pool. [`config::RunnerConfig`] bundles the
//! cache roots and execution mode an embedder hands it.
//!
//! ```no_run
//! use axisflow::cache::CacheConfig;
//! use axisflow::config::RunnerConfig;
//! use axisflow::node::Node;
//! use axisflow::runner::Runner;
//! use axisflow::workflow::Workflow;
//!
//! # fn example(mut wf: Workflow) -> anyhow::Result<()> {
//! let cfg = RunnerConfig::new(CacheConfig::single("./cache"));
//! let runner = Runner::new(cfg.mode);
//! runner.run(&mut wf, &cfg.cache)?;
//! let output = wf.get_output()?;
//! # let _ = output;
//! # Ok(())
//! # }
//! ```

pub mod cache;
pub mod config;
pub mod error;
pub mod metrics;
pub mod node;
pub mod record;
pub mod runner;
pub mod splitter;
pub mod state;
pub mod testing;
pub mod workflow;

pub use cache::CacheConfig;
pub use config::RunnerConfig;
pub use error::EngineError;
pub use node::{Node, Runnable};
pub use record::{ElementResult, FieldSpec, FieldType, Record, Scalar, Value};
pub use runner::{ExecMode, Runner};
pub use state::State;
pub use workflow::Workflow;
