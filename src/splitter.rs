//! Splitter algebra (spec §4.A): parsing splitter/combiner expressions into
//! reverse-polish form and assigning canonical axis numbers.
//!
//! Grounded in `pydra`'s `aux.splitter2rpn`/`change_splitter` (referenced
//! from `node.py` but not present in the retrieved `original_source` slice)
//! and spec §4.A's precedence/axis-assignment rules. Leaves parsed from text
//! are always bare identifiers (`[A-Za-z_][A-Za-z0-9_]*`); a leaf containing
//! a `.` only ever arises programmatically via [`prepend_namespace`], never
//! from re-parsing text — this avoids the parser having to disambiguate the
//! scalar operator `.` from a qualified-name separator.

use crate::error::EngineError;
use std::collections::HashMap;

/// One token of a splitter expression's reverse-polish form.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum RpnOp {
    /// A leaf: an (optionally namespaced) field name.
    Var(String),
    /// Binary scalar product (`.`) — zips two equal-length axis sets.
    Scalar,
    /// Binary outer product (`×`) — concatenates two axis sets.
    Outer,
}

/// Reverse-polish form of a splitter or combiner expression.
pub type Rpn = Vec<RpnOp>;

/// Per-input axis assignment and per-axis extent, the output of
/// [`rpn_to_axes`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AxisLayout {
    pub axis_for_input: HashMap<String, Vec<usize>>,
    pub shape: Vec<usize>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Tok<'a> {
    Ident(&'a str),
    Dot,
    Times,
    LParen,
    RParen,
    Comma,
}

fn tokenize(expr: &str) -> Result<Vec<Tok<'_>>, EngineError> {
    let mut toks = Vec::new();
    let bytes = expr.as_bytes();
    let mut i = 0usize;
    while i < expr.len() {
        let c = expr[i..].chars().next().unwrap();
        if c.is_whitespace() {
            i += c.len_utf8();
            continue;
        }
        match c {
            '.' => {
                toks.push(Tok::Dot);
                i += 1;
            }
            '×' => {
                toks.push(Tok::Times);
                i += c.len_utf8();
            }
            '(' => {
                toks.push(Tok::LParen);
                i += 1;
            }
            ')' => {
                toks.push(Tok::RParen);
                i += 1;
            }
            ',' => {
                toks.push(Tok::Comma);
                i += 1;
            }
            _ if c.is_alphabetic() || c == '_' => {
                let start = i;
                while i < expr.len() {
                    let c2 = expr[i..].chars().next().unwrap();
                    if c2.is_alphanumeric() || c2 == '_' {
                        i += c2.len_utf8();
                    } else {
                        break;
                    }
                }
                toks.push(Tok::Ident(std::str::from_utf8(&bytes[start..i]).unwrap()));
            }
            other => {
                return Err(EngineError::MalformedSplitter {
                    expr: expr.to_string(),
                    reason: format!("unexpected character {other:?}"),
                });
            }
        }
    }
    Ok(toks)
}

struct Parser<'a> {
    toks: Vec<Tok<'a>>,
    pos: usize,
    expr: &'a str,
}

impl<'a> Parser<'a> {
    fn peek(&self) -> Option<Tok<'a>> {
        self.toks.get(self.pos).copied()
    }

    fn bump(&mut self) -> Option<Tok<'a>> {
        let t = self.peek();
        self.pos += 1;
        t
    }

    fn fail(&self, reason: impl Into<String>) -> EngineError {
        EngineError::MalformedSplitter {
            expr: self.expr.to_string(),
            reason: reason.into(),
        }
    }

    /// `expr := term ('×' term)*`
    fn parse_expr(&mut self) -> Result<Rpn, EngineError> {
        let mut rpn = self.parse_term()?;
        while matches!(self.peek(), Some(Tok::Times)) {
            self.bump();
            let rhs = self.parse_term()?;
            rpn.extend(rhs);
            rpn.push(RpnOp::Outer);
        }
        Ok(rpn)
    }

    /// `term := factor ('.' factor)*`
    fn parse_term(&mut self) -> Result<Rpn, EngineError> {
        let mut rpn = self.parse_factor()?;
        while matches!(self.peek(), Some(Tok::Dot)) {
            self.bump();
            let rhs = self.parse_factor()?;
            rpn.extend(rhs);
            rpn.push(RpnOp::Scalar);
        }
        Ok(rpn)
    }

    /// `factor := IDENT | '(' list ')'`
    fn parse_factor(&mut self) -> Result<Rpn, EngineError> {
        match self.bump() {
            Some(Tok::Ident(name)) => Ok(vec![RpnOp::Var(name.to_string())]),
            Some(Tok::LParen) => {
                let rpn = self.parse_list()?;
                match self.bump() {
                    Some(Tok::RParen) => Ok(rpn),
                    _ => Err(self.fail("expected closing ')'")),
                }
            }
            _ => Err(self.fail("expected a variable name or '('")),
        }
    }

    /// `list := expr (',' expr)*` — commas join like `.` (spec §4.A: `(a, b)` is the scalar pair).
    fn parse_list(&mut self) -> Result<Rpn, EngineError> {
        let mut rpn = self.parse_expr()?;
        while matches!(self.peek(), Some(Tok::Comma)) {
            self.bump();
            let rhs = self.parse_expr()?;
            rpn.extend(rhs);
            rpn.push(RpnOp::Scalar);
        }
        Ok(rpn)
    }
}

/// Parse a splitter/combiner expression into reverse-polish form.
pub fn parse(expr: &str) -> Result<Rpn, EngineError> {
    let toks = tokenize(expr)?;
    let mut parser = Parser {
        toks,
        pos: 0,
        expr,
    };
    let rpn = parser.parse_expr()?;
    if parser.pos != parser.toks.len() {
        return Err(parser.fail("trailing tokens after a complete expression"));
    }
    Ok(rpn)
}

/// Render an RPN back to its canonical infix text form. Used by the
/// round-trip property `parse(render(rpn)) == rpn` (spec §8.5); every binary
/// node is parenthesized so the result always re-parses unambiguously.
pub fn render(rpn: &Rpn) -> String {
    let mut stack: Vec<String> = Vec::new();
    for op in rpn {
        match op {
            RpnOp::Var(name) => stack.push(name.clone()),
            RpnOp::Scalar => {
                let rhs = stack.pop().expect("well-formed rpn");
                let lhs = stack.pop().expect("well-formed rpn");
                stack.push(format!("({lhs}.{rhs})"));
            }
            RpnOp::Outer => {
                let rhs = stack.pop().expect("well-formed rpn");
                let lhs = stack.pop().expect("well-formed rpn");
                stack.push(format!("({lhs}×{rhs})"));
            }
        }
    }
    stack.pop().unwrap_or_default()
}

/// Rewrite every unqualified leaf `name` to `node_name.name`. A leaf that
/// already contains a `.` (already namespaced) is left untouched, matching
/// `change_splitter`'s idempotence in the original.
pub fn prepend_namespace(rpn: &Rpn, node_name: &str) -> Rpn {
    rpn.iter()
        .map(|op| match op {
            RpnOp::Var(name) if !name.contains('.') => RpnOp::Var(format!("{node_name}.{name}")),
            other => other.clone(),
        })
        .collect()
}

enum Tree {
    Leaf(String),
    Bin(RpnOp, Box<Tree>, Box<Tree>),
}

fn rpn_to_tree(rpn: &Rpn) -> Tree {
    let mut stack: Vec<Tree> = Vec::new();
    for op in rpn {
        match op {
            RpnOp::Var(name) => stack.push(Tree::Leaf(name.clone())),
            RpnOp::Scalar | RpnOp::Outer => {
                let rhs = stack.pop().expect("well-formed rpn");
                let lhs = stack.pop().expect("well-formed rpn");
                stack.push(Tree::Bin(op.clone(), Box::new(lhs), Box::new(rhs)));
            }
        }
    }
    stack.pop().unwrap_or(Tree::Leaf(String::new()))
}

fn tree_to_rpn(tree: &Tree, out: &mut Rpn) {
    match tree {
        Tree::Leaf(name) => {
            if !name.is_empty() {
                out.push(RpnOp::Var(name.clone()));
            }
        }
        Tree::Bin(op, lhs, rhs) => {
            tree_to_rpn(lhs, out);
            tree_to_rpn(rhs, out);
            out.push(op.clone());
        }
    }
}

fn prune(tree: &Tree, remove: &std::collections::HashSet<String>) -> Option<Tree> {
    match tree {
        Tree::Leaf(name) => {
            if remove.contains(name) {
                None
            } else {
                Some(Tree::Leaf(name.clone()))
            }
        }
        Tree::Bin(op, lhs, rhs) => {
            let l = prune(lhs, remove);
            let r = prune(rhs, remove);
            match (l, r) {
                (Some(l), Some(r)) => Some(Tree::Bin(op.clone(), Box::new(l), Box::new(r))),
                (Some(l), None) => Some(l),
                (None, Some(r)) => Some(r),
                (None, None) => None,
            }
        }
    }
}

/// Remove the combined variables' leaves from the splitter, collapsing
/// operators whose operand disappeared entirely (spec §4.B: "apply_combiner
/// removes the combined variables' axes from shape").
pub fn apply_combiner(rpn: &Rpn, combiner: &[String]) -> Rpn {
    let remove: std::collections::HashSet<String> = combiner.iter().cloned().collect();
    let tree = rpn_to_tree(rpn);
    let pruned = prune(&tree, &remove);
    let mut out = Vec::new();
    if let Some(t) = pruned {
        tree_to_rpn(&t, &mut out);
    }
    out
}

struct Dsu {
    parent: Vec<usize>,
}

impl Dsu {
    fn new() -> Self {
        Dsu { parent: Vec::new() }
    }

    fn make(&mut self) -> usize {
        let id = self.parent.len();
        self.parent.push(id);
        id
    }

    fn find(&mut self, x: usize) -> usize {
        if self.parent[x] != x {
            let root = self.find(self.parent[x]);
            self.parent[x] = root;
        }
        self.parent[x]
    }

    fn union(&mut self, a: usize, b: usize) {
        let ra = self.find(a);
        let rb = self.find(b);
        if ra != rb {
            self.parent[rb] = ra;
        }
    }
}

/// Evaluate an RPN against bound input lengths, producing the canonical
/// axis assignment (spec §4.A's "axis assignment rule"). Leftmost leaf gets
/// axis 0, matching occurrence order in the original infix expression (which
/// the left-right-op construction of our RPN preserves for leaves).
pub fn rpn_to_axes(
    rpn: &Rpn,
    node_name: &str,
    inputs: &HashMap<String, usize>,
) -> Result<AxisLayout, EngineError> {
    let mut dsu = Dsu::new();
    let mut raw_shape: Vec<usize> = Vec::new();
    // Per-var lists of raw (pre-canonicalization) axis ids, in introduction order.
    let mut raw_axis_for_input: Vec<(String, Vec<usize>)> = Vec::new();
    let mut stack: Vec<Vec<usize>> = Vec::new();

    for op in rpn {
        match op {
            RpnOp::Var(name) => {
                let len = *inputs.get(name).ok_or_else(|| EngineError::UnknownVariable {
                    node: node_name.to_string(),
                    variable: name.clone(),
                })?;
                let id = dsu.make();
                raw_shape.push(len);
                raw_axis_for_input.push((name.clone(), vec![id]));
                stack.push(vec![id]);
            }
            RpnOp::Scalar => {
                let right = stack.pop().expect("well-formed rpn");
                let left = stack.pop().expect("well-formed rpn");
                if left.len() != right.len() {
                    return Err(EngineError::MalformedSplitter {
                        expr: render(rpn),
                        reason: "scalar product operands have different arity".into(),
                    });
                }
                for (&l, &r) in left.iter().zip(right.iter()) {
                    let (rl, rr) = (dsu.find(l), dsu.find(r));
                    if raw_shape[rl] != raw_shape[rr] {
                        return Err(EngineError::ScalarProductLengthMismatch {
                            node: node_name.to_string(),
                            left_len: raw_shape[rl],
                            right_len: raw_shape[rr],
                        });
                    }
                    dsu.union(l, r);
                }
                stack.push(left);
            }
            RpnOp::Outer => {
                let mut right = stack.pop().expect("well-formed rpn");
                let mut left = stack.pop().expect("well-formed rpn");
                left.append(&mut right);
                stack.push(left);
            }
        }
    }

    // Canonicalize: renumber representative raw ids in first-occurrence order.
    let mut canonical: HashMap<usize, usize> = HashMap::new();
    let mut shape: Vec<usize> = Vec::new();
    let mut axis_for_input: HashMap<String, Vec<usize>> = HashMap::new();
    for (name, raw_ids) in &raw_axis_for_input {
        let mut axes = Vec::with_capacity(raw_ids.len());
        for &raw in raw_ids {
            let rep = dsu.find(raw);
            let canon = *canonical.entry(rep).or_insert_with(|| {
                let next = shape.len();
                shape.push(raw_shape[rep]);
                next
            });
            axes.push(canon);
        }
        axis_for_input.entry(name.clone()).or_default().extend(axes);
    }

    Ok(AxisLayout {
        axis_for_input,
        shape,
    })
}
