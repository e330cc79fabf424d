//! End-to-end scenarios from spec §8, driven through the public
//! `Runner`/`RunnerConfig` API rather than by hand-stepping nodes, so these
//! exercise the full `Runner::run` -> `Workflow::prepare_node` ->
//! `Node::run_single` path together.

use axisflow::config::RunnerConfig;
use axisflow::node::OutputMap;
use axisflow::runner::ExecMode;
use axisflow::testing::{sorted_ints, Identity};
use axisflow::{CacheConfig, Node, Runner, Scalar, Value, Workflow};
use std::sync::Arc;

fn cache_in(tmp: &tempfile::TempDir) -> RunnerConfig {
    RunnerConfig::new(CacheConfig::single(tmp.path().join("cache"))).with_mode(ExecMode::Sequential)
}

#[test]
fn scalar_product_zips_two_equal_length_inputs() {
    let tmp = tempfile::tempdir().unwrap();
    let cfg = cache_in(&tmp);
    let mut wf = Workflow::new("wf");
    let mut n = Node::new("n", Arc::new(Identity::new("x", "out")));
    n.workingdir = tmp.path().join("n");
    n.split("x . y", None).unwrap();
    n.inputs.set(
        "n.x",
        Value::Sequence(vec![Value::Scalar(Scalar::Int(1)), Value::Scalar(Scalar::Int(2))]),
    );
    n.inputs.set(
        "n.y",
        Value::Sequence(vec![Value::Scalar(Scalar::Int(10)), Value::Scalar(Scalar::Int(20))]),
    );
    wf.add(n).unwrap();
    wf.expose_output("n", "out", "final").unwrap();

    Runner::new(cfg.mode).run(&mut wf, &cfg.cache).unwrap();
    assert_eq!(wf.node("n").unwrap().state().unwrap().total_elements(), 2);
}

#[test]
fn outer_product_is_the_full_cartesian_product() {
    let tmp = tempfile::tempdir().unwrap();
    let cfg = cache_in(&tmp);
    let mut wf = Workflow::new("wf");
    let mut n = Node::new("n", Arc::new(Identity::new("x", "out")));
    n.workingdir = tmp.path().join("n");
    n.split("x × y", None).unwrap();
    n.inputs.set(
        "n.x",
        Value::Sequence(vec![Value::Scalar(Scalar::Int(1)), Value::Scalar(Scalar::Int(2))]),
    );
    n.inputs.set(
        "n.y",
        Value::Sequence(vec![
            Value::Scalar(Scalar::Int(10)),
            Value::Scalar(Scalar::Int(20)),
            Value::Scalar(Scalar::Int(30)),
        ]),
    );
    wf.add(n).unwrap();
    wf.expose_output("n", "out", "final").unwrap();

    Runner::new(cfg.mode).run(&mut wf, &cfg.cache).unwrap();
    assert_eq!(wf.node("n").unwrap().state().unwrap().total_elements(), 6);
}

#[test]
fn combining_one_axis_regroups_output_by_the_other() {
    let tmp = tempfile::tempdir().unwrap();
    let cfg = cache_in(&tmp);
    let mut wf = Workflow::new("wf");
    let mut n = Node::new("n", Arc::new(Identity::new("x", "out")));
    n.workingdir = tmp.path().join("n");
    n.split("a × x", None).unwrap();
    n.combine(vec!["x".into()]).unwrap();
    n.inputs.set(
        "n.a",
        Value::Sequence(vec![Value::Scalar(Scalar::Int(0)), Value::Scalar(Scalar::Int(1))]),
    );
    n.inputs.set(
        "n.x",
        Value::Sequence(vec![
            Value::Scalar(Scalar::Int(1)),
            Value::Scalar(Scalar::Int(2)),
        ]),
    );
    wf.add(n).unwrap();
    wf.expose_output("n", "out", "final").unwrap();

    Runner::new(cfg.mode).run(&mut wf, &cfg.cache).unwrap();
    let output = wf.get_output().unwrap();
    let OutputMap::Combined(groups) = &output["final"] else {
        panic!("expected a combined output");
    };
    assert_eq!(groups.len(), 2, "one group per value of a, x folded away");
}

#[test]
fn two_node_pipeline_runs_end_to_end_through_the_runner() {
    let tmp = tempfile::tempdir().unwrap();
    let cfg = cache_in(&tmp);
    let mut wf = Workflow::new("wf");

    let mut a = Node::new("a", Arc::new(Identity::new("x", "out").plus(1)));
    a.workingdir = tmp.path().join("a");
    a.split("x", None).unwrap();
    a.inputs.set(
        "a.x",
        Value::Sequence(vec![Value::Scalar(Scalar::Int(1)), Value::Scalar(Scalar::Int(2))]),
    );

    let mut b = Node::new("b", Arc::new(Identity::new("x", "out").plus(100)));
    b.workingdir = tmp.path().join("b");

    wf.add(a).unwrap();
    wf.add(b).unwrap();
    wf.connect("a", "out", "b", "x").unwrap();
    wf.expose_output("b", "out", "final").unwrap();

    Runner::new(cfg.mode).run(&mut wf, &cfg.cache).unwrap();
    assert!(wf.node("a").unwrap().is_complete());
    assert!(wf.node("b").unwrap().is_complete());

    let output = wf.get_output().unwrap();
    let OutputMap::Plain(values) = &output["final"] else {
        panic!("expected plain output");
    };
    assert_eq!(sorted_ints(values), vec![102, 103]);
}

#[test]
fn inner_splitter_inherits_axis_and_adds_a_jagged_coordinate() {
    let tmp = tempfile::tempdir().unwrap();
    let cfg = cache_in(&tmp);
    let mut wf = Workflow::new("wf");

    struct Range {
        input_spec: axisflow::record::Spec,
        output_spec: axisflow::record::Spec,
    }
    impl axisflow::node::Runnable for Range {
        fn class_name(&self) -> &str {
            "Range"
        }
        fn input_spec(&self) -> &axisflow::record::Spec {
            &self.input_spec
        }
        fn output_spec(&self) -> &axisflow::record::Spec {
            &self.output_spec
        }
        fn call(&self, inputs: &axisflow::Record, _rerun: bool) -> Result<axisflow::ElementResult, axisflow::EngineError> {
            let Some(Value::Scalar(Scalar::Int(a))) = inputs.get("a") else {
                panic!("expected a");
            };
            let mut output = axisflow::Record::new();
            output.set("out", Value::Sequence((0..*a).map(|i| Value::Scalar(Scalar::Int(i))).collect()));
            Ok(axisflow::ElementResult {
                output,
                runtime: Default::default(),
                error: None,
            })
        }
    }

    let mut a = Node::new(
        "a",
        Arc::new(Range {
            input_spec: vec![axisflow::record::FieldSpec::new("a", axisflow::record::FieldType::Scalar)],
            output_spec: vec![axisflow::record::FieldSpec::new("out", axisflow::record::FieldType::SequenceScalar)],
        }),
    );
    a.workingdir = tmp.path().join("a");
    a.split("a", None).unwrap();
    a.inputs.set(
        "a.a",
        Value::Sequence(vec![Value::Scalar(Scalar::Int(1)), Value::Scalar(Scalar::Int(2))]),
    );

    let mut b = Node::new("b", Arc::new(Identity::new("x", "out")));
    b.workingdir = tmp.path().join("b");
    // b declares no splitter of its own: it must inherit a's axis plus the
    // inner axis contributed by a's ragged "out" field.

    wf.add(a).unwrap();
    wf.add(b).unwrap();
    wf.connect("a", "out", "b", "x").unwrap();
    wf.expose_output("b", "out", "final").unwrap();

    Runner::new(cfg.mode).run(&mut wf, &cfg.cache).unwrap();

    assert_eq!(wf.node("b").unwrap().state().unwrap().total_elements(), 3);
    let output = wf.get_output().unwrap();
    let OutputMap::Plain(values) = &output["final"] else {
        panic!("expected plain output");
    };
    // a=1 -> [0]; a=2 -> [0, 1]
    assert_eq!(sorted_ints(values), vec![0, 0, 1]);
}

struct CountingIdentity {
    input_spec: axisflow::record::Spec,
    output_spec: axisflow::record::Spec,
    calls: Arc<std::sync::atomic::AtomicUsize>,
}

impl axisflow::node::Runnable for CountingIdentity {
    fn class_name(&self) -> &str {
        "CountingIdentity"
    }
    fn input_spec(&self) -> &axisflow::record::Spec {
        &self.input_spec
    }
    fn output_spec(&self) -> &axisflow::record::Spec {
        &self.output_spec
    }
    fn call(&self, inputs: &axisflow::Record, _rerun: bool) -> Result<axisflow::ElementResult, axisflow::EngineError> {
        self.calls.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        let value = inputs.get("x").cloned().unwrap();
        let mut output = axisflow::Record::new();
        output.set("out", value);
        Ok(axisflow::ElementResult {
            output,
            runtime: Default::default(),
            error: None,
        })
    }
}

#[test]
fn a_second_run_is_served_entirely_from_cache() {
    let tmp = tempfile::tempdir().unwrap();
    let cfg = cache_in(&tmp);
    let calls = Arc::new(std::sync::atomic::AtomicUsize::new(0));

    let build = |calls: Arc<std::sync::atomic::AtomicUsize>| {
        let mut wf = Workflow::new("wf");
        let mut n = Node::new(
            "n",
            Arc::new(CountingIdentity {
                input_spec: vec![axisflow::record::FieldSpec::new("x", axisflow::record::FieldType::Scalar)],
                output_spec: vec![axisflow::record::FieldSpec::new("out", axisflow::record::FieldType::Scalar)],
                calls,
            }),
        );
        n.workingdir = tmp.path().join("n");
        n.split("x", None).unwrap();
        n.inputs.set("n.x", Value::Sequence(vec![Value::Scalar(Scalar::Int(1))]));
        wf.add(n).unwrap();
        wf.expose_output("n", "out", "final").unwrap();
        wf
    };

    let mut wf1 = build(calls.clone());
    Runner::new(cfg.mode).run(&mut wf1, &cfg.cache).unwrap();
    assert!(wf1.node("n").unwrap().is_complete());
    assert_eq!(calls.load(std::sync::atomic::Ordering::SeqCst), 1);

    let mut wf2 = build(calls.clone());
    Runner::new(cfg.mode).run(&mut wf2, &cfg.cache).unwrap();
    assert!(wf2.node("n").unwrap().is_complete());
    assert_eq!(
        calls.load(std::sync::atomic::Ordering::SeqCst),
        1,
        "second run must be served entirely from cache"
    );
}
