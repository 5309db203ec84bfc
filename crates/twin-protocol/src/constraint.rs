//! Value constraints attached to subscriptions.
//!
//! A constraint definition is a JSON array of conditions:
//! `[{"operator": ">", "operand": 20}, {"operator": "<=", "operand": 30}]`.
//! A value complies when every condition holds.

use std::cmp::Ordering;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{GatewayError, GatewayResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Operator {
    #[serde(rename = "==")]
    Equal,
    #[serde(rename = "!=")]
    NotEqual,
    #[serde(rename = "<")]
    Less,
    #[serde(rename = "<=")]
    LessOrEqual,
    #[serde(rename = ">")]
    Greater,
    #[serde(rename = ">=")]
    GreaterOrEqual,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Condition {
    pub operator: Operator,
    pub operand: Value,
    #[serde(default)]
    pub complement: bool,
}

impl Condition {
    pub fn new(operator: Operator, operand: impl Into<Value>) -> Self {
        Self {
            operator,
            operand: operand.into(),
            complement: false,
        }
    }

    pub fn complies(&self, value: &Value) -> bool {
        let holds = match self.operator {
            Operator::Equal => compare(value, &self.operand) == Some(Ordering::Equal),
            Operator::NotEqual => compare(value, &self.operand) != Some(Ordering::Equal),
            Operator::Less => compare(value, &self.operand) == Some(Ordering::Less),
            Operator::LessOrEqual => matches!(
                compare(value, &self.operand),
                Some(Ordering::Less | Ordering::Equal)
            ),
            Operator::Greater => compare(value, &self.operand) == Some(Ordering::Greater),
            Operator::GreaterOrEqual => matches!(
                compare(value, &self.operand),
                Some(Ordering::Greater | Ordering::Equal)
            ),
        };
        holds != self.complement
    }
}

fn compare(left: &Value, right: &Value) -> Option<Ordering> {
    match (left, right) {
        (Value::Number(a), Value::Number(b)) => a.as_f64()?.partial_cmp(&b.as_f64()?),
        (Value::String(a), Value::String(b)) => Some(a.cmp(b)),
        (Value::Bool(a), Value::Bool(b)) => Some(a.cmp(b)),
        (a, b) if a == b => Some(Ordering::Equal),
        _ => None,
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Constraint {
    pub conditions: Vec<Condition>,
}

impl Constraint {
    pub fn new(conditions: Vec<Condition>) -> Self {
        Self { conditions }
    }

    /// Parse a constraint definition. A single condition object is accepted
    /// as shorthand for a one-element array.
    pub fn parse(definition: &Value) -> GatewayResult<Self> {
        let conditions = match definition {
            Value::Array(_) => serde_json::from_value::<Vec<Condition>>(definition.clone()),
            Value::Object(_) => {
                serde_json::from_value::<Condition>(definition.clone()).map(|c| vec![c])
            }
            other => {
                return Err(GatewayError::InvalidConstraint(format!(
                    "expected an array of conditions, got {other}"
                )));
            }
        }
        .map_err(|error| GatewayError::InvalidConstraint(error.to_string()))?;
        Ok(Self { conditions })
    }

    pub fn complies(&self, value: &Value) -> bool {
        self.conditions.iter().all(|condition| condition.complies(value))
    }
}
