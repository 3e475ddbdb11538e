// ABOUTME: Binding expressions used by argument slots and variable defaults
// ABOUTME: Synchronous evaluation over a symbol lookup, with activity expressions deferred to the engine

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

use super::{ActivityBuilder, DefinitionRef, Value};

#[derive(Error, Debug, Clone, PartialEq)]
pub enum EvaluationError {
    #[error("Unknown symbol: {0}")]
    UnknownSymbol(String),

    #[error("Operator {op} cannot be applied to {left} and {right}")]
    InvalidOperands {
        op: BinaryOp,
        left: String,
        right: String,
    },

    #[error("Division by zero")]
    DivisionByZero,

    #[error("Activity expression cannot be evaluated synchronously")]
    RequiresActivity,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BinaryOp {
    Add,
    Sub,
    Mul,
    Div,
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    And,
    Or,
}

impl fmt::Display for BinaryOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let symbol = match self {
            BinaryOp::Add => "+",
            BinaryOp::Sub => "-",
            BinaryOp::Mul => "*",
            BinaryOp::Div => "/",
            BinaryOp::Eq => "==",
            BinaryOp::Ne => "!=",
            BinaryOp::Lt => "<",
            BinaryOp::Le => "<=",
            BinaryOp::Gt => ">",
            BinaryOp::Ge => ">=",
            BinaryOp::And => "&&",
            BinaryOp::Or => "||",
        };
        write!(f, "{}", symbol)
    }
}

/// A binding expression. `A` is the activity payload: an unfrozen
/// `ActivityBuilder` while a definition is being assembled, a frozen
/// `DefinitionRef` afterwards.
#[derive(Debug, Clone)]
pub enum Expression<A = DefinitionRef> {
    Literal(Value),
    Reference(String),
    Binary {
        op: BinaryOp,
        left: Box<Expression<A>>,
        right: Box<Expression<A>>,
    },
    Activity(A),
}

/// Read access to named locations, used for synchronous evaluation.
pub trait SymbolLookup {
    fn lookup(&self, name: &str) -> Option<Value>;
}

impl SymbolLookup for indexmap::IndexMap<String, Value> {
    fn lookup(&self, name: &str) -> Option<Value> {
        self.get(name).cloned()
    }
}

impl<A> Expression<A> {
    pub fn literal(value: impl Into<Value>) -> Self {
        Expression::Literal(value.into())
    }

    pub fn reference(name: impl Into<String>) -> Self {
        Expression::Reference(name.into())
    }

    pub fn binary(op: BinaryOp, left: Expression<A>, right: Expression<A>) -> Self {
        Expression::Binary {
            op,
            left: Box::new(left),
            right: Box::new(right),
        }
    }

    /// True when evaluation needs no child activity.
    pub fn is_synchronous(&self) -> bool {
        match self {
            Expression::Literal(_) | Expression::Reference(_) => true,
            Expression::Binary { left, right, .. } => {
                left.is_synchronous() && right.is_synchronous()
            }
            Expression::Activity(_) => false,
        }
    }

    /// True when an activity appears below the top level.
    pub fn has_nested_activity(&self) -> bool {
        match self {
            Expression::Binary { left, right, .. } => {
                !left.is_synchronous() || !right.is_synchronous()
            }
            _ => false,
        }
    }

    /// Name of the referenced symbol when the expression is a bare reference.
    pub fn as_reference(&self) -> Option<&str> {
        match self {
            Expression::Reference(name) => Some(name),
            _ => None,
        }
    }

    /// Every symbol name the expression reads.
    pub fn references(&self) -> Vec<&str> {
        match self {
            Expression::Reference(name) => vec![name.as_str()],
            Expression::Binary { left, right, .. } => {
                let mut names = left.references();
                names.extend(right.references());
                names
            }
            Expression::Literal(_) | Expression::Activity(_) => Vec::new(),
        }
    }

    pub fn evaluate(&self, symbols: &dyn SymbolLookup) -> Result<Value, EvaluationError> {
        match self {
            Expression::Literal(value) => Ok(value.clone()),
            Expression::Reference(name) => symbols
                .lookup(name)
                .ok_or_else(|| EvaluationError::UnknownSymbol(name.clone())),
            Expression::Binary { op, left, right } => {
                let left = left.evaluate(symbols)?;
                let right = right.evaluate(symbols)?;
                apply(*op, &left, &right)
            }
            Expression::Activity(_) => Err(EvaluationError::RequiresActivity),
        }
    }

    /// Convert the activity payload, keeping the expression shape.
    pub fn try_map<B, E>(
        self,
        f: &mut impl FnMut(A) -> std::result::Result<B, E>,
    ) -> std::result::Result<Expression<B>, E> {
        Ok(match self {
            Expression::Literal(value) => Expression::Literal(value),
            Expression::Reference(name) => Expression::Reference(name),
            Expression::Binary { op, left, right } => Expression::Binary {
                op,
                left: Box::new(left.try_map(f)?),
                right: Box::new(right.try_map(f)?),
            },
            Expression::Activity(activity) => Expression::Activity(f(activity)?),
        })
    }
}

impl Expression<ActivityBuilder> {
    pub fn activity(builder: ActivityBuilder) -> Self {
        Expression::Activity(builder)
    }
}

fn apply(op: BinaryOp, left: &Value, right: &Value) -> Result<Value, EvaluationError> {
    let invalid = || EvaluationError::InvalidOperands {
        op,
        left: left.to_string(),
        right: right.to_string(),
    };

    match op {
        BinaryOp::Eq => return Ok(Value::Bool(left == right)),
        BinaryOp::Ne => return Ok(Value::Bool(left != right)),
        BinaryOp::And | BinaryOp::Or => {
            let (Some(l), Some(r)) = (left.as_bool(), right.as_bool()) else {
                return Err(invalid());
            };
            let result = if op == BinaryOp::And { l && r } else { l || r };
            return Ok(Value::Bool(result));
        }
        _ => {}
    }

    if op == BinaryOp::Add {
        if let (Value::String(l), Value::String(r)) = (left, right) {
            return Ok(Value::String(format!("{}{}", l, r)));
        }
        if let (Value::Array(l), Value::Array(r)) = (left, right) {
            let mut joined = l.clone();
            joined.extend(r.iter().cloned());
            return Ok(Value::Array(joined));
        }
    }

    // Integer arithmetic stays integral; anything else goes through f64.
    if let (Some(l), Some(r)) = (left.as_i64(), right.as_i64()) {
        return match op {
            BinaryOp::Add => l.checked_add(r).map(Value::from).ok_or_else(invalid),
            BinaryOp::Sub => l.checked_sub(r).map(Value::from).ok_or_else(invalid),
            BinaryOp::Mul => l.checked_mul(r).map(Value::from).ok_or_else(invalid),
            BinaryOp::Div if r == 0 => Err(EvaluationError::DivisionByZero),
            BinaryOp::Div => Ok(Value::from(l / r)),
            BinaryOp::Lt => Ok(Value::Bool(l < r)),
            BinaryOp::Le => Ok(Value::Bool(l <= r)),
            BinaryOp::Gt => Ok(Value::Bool(l > r)),
            BinaryOp::Ge => Ok(Value::Bool(l >= r)),
            _ => Err(invalid()),
        };
    }

    if let (Some(l), Some(r)) = (left.as_f64(), right.as_f64()) {
        let number = |n: f64| {
            serde_json::Number::from_f64(n)
                .map(Value::Number)
                .ok_or_else(invalid)
        };
        return match op {
            BinaryOp::Add => number(l + r),
            BinaryOp::Sub => number(l - r),
            BinaryOp::Mul => number(l * r),
            BinaryOp::Div if r == 0.0 => Err(EvaluationError::DivisionByZero),
            BinaryOp::Div => number(l / r),
            BinaryOp::Lt => Ok(Value::Bool(l < r)),
            BinaryOp::Le => Ok(Value::Bool(l <= r)),
            BinaryOp::Gt => Ok(Value::Bool(l > r)),
            BinaryOp::Ge => Ok(Value::Bool(l >= r)),
            _ => Err(invalid()),
        };
    }

    if let (Value::String(l), Value::String(r)) = (left, right) {
        return match op {
            BinaryOp::Lt => Ok(Value::Bool(l < r)),
            BinaryOp::Le => Ok(Value::Bool(l <= r)),
            BinaryOp::Gt => Ok(Value::Bool(l > r)),
            BinaryOp::Ge => Ok(Value::Bool(l >= r)),
            _ => Err(invalid()),
        };
    }

    Err(invalid())
}

#[cfg(test)]
mod tests {
    use super::*;
    use indexmap::IndexMap;
    use serde_json::json;

    type Expr = Expression<DefinitionRef>;

    fn symbols() -> IndexMap<String, Value> {
        let mut map = IndexMap::new();
        map.insert("a".to_string(), json!(1));
        map.insert("name".to_string(), json!("trail"));
        map
    }

    #[test]
    fn test_reference_plus_literal() {
        let expr = Expr::binary(BinaryOp::Add, Expr::reference("a"), Expr::literal(1));
        assert_eq!(expr.evaluate(&symbols()).unwrap(), json!(2));
    }

    #[test]
    fn test_string_concatenation() {
        let expr = Expr::binary(BinaryOp::Add, Expr::reference("name"), Expr::literal("head"));
        assert_eq!(expr.evaluate(&symbols()).unwrap(), json!("trailhead"));
    }

    #[test]
    fn test_unknown_symbol() {
        let expr = Expr::reference("missing");
        assert_eq!(
            expr.evaluate(&symbols()).unwrap_err(),
            EvaluationError::UnknownSymbol("missing".to_string())
        );
    }

    #[test]
    fn test_division_by_zero() {
        let expr = Expr::binary(BinaryOp::Div, Expr::literal(4), Expr::literal(0));
        assert_eq!(
            expr.evaluate(&symbols()).unwrap_err(),
            EvaluationError::DivisionByZero
        );
    }

    #[test]
    fn test_mixed_numeric_comparison() {
        let expr = Expr::binary(BinaryOp::Lt, Expr::literal(1), Expr::literal(1.5));
        assert_eq!(expr.evaluate(&symbols()).unwrap(), json!(true));
    }

    #[test]
    fn test_boolean_operands_required() {
        let expr = Expr::binary(BinaryOp::And, Expr::literal(true), Expr::literal(1));
        assert!(matches!(
            expr.evaluate(&symbols()),
            Err(EvaluationError::InvalidOperands { .. })
        ));
    }
}
