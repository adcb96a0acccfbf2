//! The control-flow step set a CompositeMethod's graph is built from.
//!
//! This stands in for the bytecode instruction set of the engine this crate
//! is modeled on: there, a compiler lowers BPMN into an addressable
//! instruction stream the VM steps through one tick at a time. Here, steps
//! are authored directly (a declarative textual-format loader is out of
//! scope here) but the shape is the same — an ordered, index-addressed
//! sequence a scope's program counter walks.

use crate::addressing::NodeRef;
use crate::value::Value;
use std::collections::BTreeMap;

/// The per-scope bindings: parameters plus named intermediate reads.
pub type Frame = BTreeMap<String, Value>;

/// An expression evaluated against the current frame. Deliberately tiny —
/// this isn't a general expression language, just enough to thread parameter
/// and `store_as` bindings through write targets and wait predicates.
#[derive(Clone, Debug, PartialEq)]
pub enum Expr {
    Literal(Value),
    Binding(String),
}

impl Expr {
    pub fn literal(v: Value) -> Self {
        Expr::Literal(v)
    }

    pub fn binding(name: impl Into<String>) -> Self {
        Expr::Binding(name.into())
    }

    /// Resolve against a frame. An unbound name is a programming error in the
    /// authored graph, not an ordinary runtime condition — callers surface it
    /// as `MALFORMED_MODEL`.
    pub fn eval<'a>(&'a self, frame: &'a Frame) -> Option<&'a Value> {
        match self {
            Expr::Literal(v) => Some(v),
            Expr::Binding(name) => frame.get(name),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CompareOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

impl CompareOp {
    /// Numeric comparison is total; non-numeric values only support Eq/Ne.
    pub fn evaluate(self, lhs: &Value, rhs: &Value) -> bool {
        if let (Some(a), Some(b)) = (lhs.as_numeric(), rhs.as_numeric()) {
            return match self {
                CompareOp::Eq => a == b,
                CompareOp::Ne => a != b,
                CompareOp::Lt => a < b,
                CompareOp::Le => a <= b,
                CompareOp::Gt => a > b,
                CompareOp::Ge => a >= b,
            };
        }
        match self {
            CompareOp::Eq => lhs == rhs,
            CompareOp::Ne => lhs != rhs,
            _ => false,
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum Step {
    Write {
        target: NodeRef,
        value: Expr,
    },
    Read {
        source: NodeRef,
        store_as: String,
    },
    Wait {
        source: NodeRef,
        op: CompareOp,
        rhs: Expr,
    },
    CallAsync {
        method: NodeRef,
        args: Vec<Expr>,
        store_returns_as: Option<String>,
    },
    Branch {
        predicate: Expr,
        if_true: usize,
        if_false: usize,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn compare_numeric() {
        assert!(CompareOp::Lt.evaluate(&Value::Numeric(1.0), &Value::Numeric(2.0)));
        assert!(!CompareOp::Gt.evaluate(&Value::Numeric(1.0), &Value::Numeric(2.0)));
    }

    #[test]
    fn compare_non_numeric_only_supports_eq_ne() {
        let a = Value::String("x".into());
        let b = Value::String("y".into());
        assert!(!CompareOp::Eq.evaluate(&a, &b));
        assert!(CompareOp::Ne.evaluate(&a, &b));
        assert!(!CompareOp::Lt.evaluate(&a, &b));
    }

    #[test]
    fn expr_binding_lookup() {
        let mut frame = Frame::new();
        frame.insert("out".to_string(), Value::Boolean(true));
        let e = Expr::binding("out");
        assert_eq!(e.eval(&frame), Some(&Value::Boolean(true)));
        assert_eq!(Expr::binding("missing").eval(&frame), None);
    }
}
