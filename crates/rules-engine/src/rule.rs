use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use warden_core::{Event, EventType, FieldKind, FieldValue};

use crate::dsl::{self, Condition, DslError, Operator, Value};

/// A detection rule as loaded from policy.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Rule {
    pub id: String,
    pub event_type: EventType,
    pub expression: String,
    pub metadata: Metadata,
}

impl Rule {
    pub fn new(id: impl Into<String>, event_type: EventType, expression: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            event_type,
            expression: expression.into(),
            metadata: Metadata::default(),
        }
    }

    pub fn with_metadata(mut self, metadata: Metadata) -> Self {
        self.metadata = metadata;
        self
    }

    /// Human readable definition, sent to subscribers along with each match.
    pub fn definition(&self) -> String {
        match &self.metadata.description {
            Some(description) => format!(
                "{description} ({}: {})",
                self.event_type, self.expression
            ),
            None => format!("{}: {}", self.event_type, self.expression),
        }
    }
}

#[derive(Debug, Default, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Metadata {
    pub category: Option<String>,
    pub description: Option<String>,
    pub severity: Option<String>,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CompileError {
    #[error(transparent)]
    Dsl(#[from] DslError),
    #[error("field '{field}' not available on {event_type} events")]
    UnknownField {
        field: String,
        event_type: EventType,
    },
    #[error("unknown constant '{0}'")]
    UnknownConstant(String),
    #[error("field '{field}' expects {expected} values")]
    TypeMismatch {
        field: String,
        expected: &'static str,
    },
    #[error("operator {op:?} not supported on field '{field}'")]
    InvalidOperator { field: String, op: Operator },
}

/// Error raised while evaluating a single event.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EvalError {
    #[error("field '{field}' missing from {event_type} event")]
    MissingField {
        field: String,
        event_type: EventType,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Literal {
    Str(String),
    Int(i64),
}

/// Condition tree checked against the event model, with constants resolved.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Compiled {
    Base {
        field: String,
        op: Operator,
        value: Literal,
    },
    And(Box<Compiled>, Box<Compiled>),
    Or(Box<Compiled>, Box<Compiled>),
    Not(Box<Compiled>),
}

/// Parse and type check `expression` for events of type `event_type`.
pub(crate) fn compile(
    event_type: EventType,
    expression: &str,
    constants: &HashMap<String, i64>,
) -> Result<Compiled, CompileError> {
    let condition = dsl::parse(expression)?;
    compile_condition(event_type, condition, constants)
}

fn compile_condition(
    event_type: EventType,
    condition: Condition,
    constants: &HashMap<String, i64>,
) -> Result<Compiled, CompileError> {
    let compiled = match condition {
        Condition::Base { field, op, value } => {
            let kind = event_type
                .field_kind(&field)
                .ok_or_else(|| CompileError::UnknownField {
                    field: field.clone(),
                    event_type,
                })?;

            let value = match value {
                Value::Str(s) => Literal::Str(s),
                Value::Int(i) => Literal::Int(i),
                Value::Constant(name) => match constants.get(&name) {
                    Some(i) => Literal::Int(*i),
                    None => return Err(CompileError::UnknownConstant(name)),
                },
            };

            match (kind, &value) {
                (FieldKind::Int, Literal::Str(_)) => {
                    return Err(CompileError::TypeMismatch {
                        field,
                        expected: "integer",
                    });
                }
                (FieldKind::Str, Literal::Int(_)) => {
                    return Err(CompileError::TypeMismatch {
                        field,
                        expected: "string",
                    });
                }
                (FieldKind::Int, _) if op.is_string_operator() => {
                    return Err(CompileError::InvalidOperator { field, op });
                }
                (FieldKind::Str, _) if op.is_ordering_operator() => {
                    return Err(CompileError::InvalidOperator { field, op });
                }
                _ => {}
            }

            Compiled::Base { field, op, value }
        }
        Condition::And { l, r } => Compiled::And(
            Box::new(compile_condition(event_type, *l, constants)?),
            Box::new(compile_condition(event_type, *r, constants)?),
        ),
        Condition::Or { l, r } => Compiled::Or(
            Box::new(compile_condition(event_type, *l, constants)?),
            Box::new(compile_condition(event_type, *r, constants)?),
        ),
        Condition::Not(inner) => {
            Compiled::Not(Box::new(compile_condition(event_type, *inner, constants)?))
        }
    };
    Ok(compiled)
}

impl Compiled {
    pub(crate) fn eval(&self, event: &Event) -> Result<bool, EvalError> {
        match self {
            Compiled::Base { field, op, value } => {
                let lhs = event.field(field).ok_or_else(|| EvalError::MissingField {
                    field: field.clone(),
                    event_type: event.event_type(),
                })?;
                Ok(test(*op, &lhs, value))
            }
            Compiled::And(l, r) => Ok(l.eval(event)? && r.eval(event)?),
            Compiled::Or(l, r) => Ok(l.eval(event)? || r.eval(event)?),
            Compiled::Not(inner) => Ok(!inner.eval(event)?),
        }
    }

    /// Top level terms joined by `AND`.
    pub(crate) fn conjuncts(&self) -> Vec<&Compiled> {
        match self {
            Compiled::And(l, r) => {
                let mut terms = l.conjuncts();
                terms.extend(r.conjuncts());
                terms
            }
            other => vec![other],
        }
    }

    /// True if this is a comparison on `field` which `value` can't satisfy.
    pub(crate) fn rejects(&self, field: &str, value: &FieldValue) -> bool {
        match self {
            Compiled::Base {
                field: f,
                op,
                value: literal,
            } => f == field && !test(*op, value, literal),
            _ => false,
        }
    }
}

fn test(op: Operator, lhs: &FieldValue, rhs: &Literal) -> bool {
    match (lhs, rhs) {
        (FieldValue::Str(a), Literal::Str(b)) => match op {
            Operator::Equals => a == b,
            Operator::NotEquals => a != b,
            Operator::StartsWith => a.starts_with(b.as_str()),
            Operator::EndsWith => a.ends_with(b.as_str()),
            Operator::Contains => a.contains(b.as_str()),
            _ => false,
        },
        (FieldValue::Int(a), Literal::Int(b)) => match op {
            Operator::Equals => a == b,
            Operator::NotEquals => a != b,
            Operator::Greater => a > b,
            Operator::GreaterEqual => a >= b,
            Operator::Less => a < b,
            Operator::LessEqual => a <= b,
            _ => false,
        },
        _ => false,
    }
}
