//! Integration coverage for the splitter algebra (spec §4.A): parsing,
//! precedence, round-trip rendering, and canonical axis assignment through
//! the public `axisflow::splitter` API.

use axisflow::splitter::{parse, render, rpn_to_axes};
use std::collections::HashMap;

#[test]
fn outer_product_binds_looser_than_scalar_product() {
    // "x . y × z" parses as "(x . y) × z", not "x . (y × z)".
    let rpn = parse("x . y × z").unwrap();
    let lengths: HashMap<String, usize> = [("x".into(), 2), ("y".into(), 2), ("z".into(), 3)].into();
    let layout = rpn_to_axes(&rpn, "n", &lengths).unwrap();
    assert_eq!(layout.shape, vec![2, 3]);
    assert_eq!(layout.axis_for_input["x"], vec![0]);
    assert_eq!(layout.axis_for_input["y"], vec![0]);
    assert_eq!(layout.axis_for_input["z"], vec![1]);
}

#[test]
fn scalar_product_of_two_outer_products_zips_by_position() {
    // (x × y) . (a × b): x's axis merges with a's, y's with b's, since
    // scalar product zips the two operand axis *lists* position-wise.
    let rpn = parse("(x × y) . (a × b)").unwrap();
    let lengths: HashMap<String, usize> = [
        ("x".into(), 2),
        ("y".into(), 3),
        ("a".into(), 2),
        ("b".into(), 3),
    ]
    .into();
    let layout = rpn_to_axes(&rpn, "n", &lengths).unwrap();
    assert_eq!(layout.shape, vec![2, 3]);
    assert_eq!(layout.axis_for_input["x"], layout.axis_for_input["a"]);
    assert_eq!(layout.axis_for_input["y"], layout.axis_for_input["b"]);
}

#[test]
fn render_round_trips_through_parse() {
    for expr in ["x", "x . y", "x × y", "(x . y) × z", "x × (y . z)"] {
        let rpn = parse(expr).unwrap();
        let rendered = render(&rpn);
        let reparsed = parse(&rendered).unwrap();
        assert_eq!(rpn, reparsed, "round-trip changed meaning for {expr:?}");
    }
}

#[test]
fn scalar_product_requires_equal_length_operands() {
    let rpn = parse("x . y").unwrap();
    let lengths: HashMap<String, usize> = [("x".into(), 2), ("y".into(), 3)].into();
    assert!(rpn_to_axes(&rpn, "n", &lengths).is_err());
}

#[test]
fn unbound_variable_is_reported() {
    let rpn = parse("x . y").unwrap();
    let lengths: HashMap<String, usize> = [("x".into(), 2)].into();
    assert!(rpn_to_axes(&rpn, "n", &lengths).is_err());
}
