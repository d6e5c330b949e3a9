use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::GatewayError;

/// Comparison operator of a threshold condition.
///
/// Operators are validated when a condition is deserialized or parsed, so an
/// unknown operator is rejected before any evaluation loop sees it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Operator {
    #[serde(rename = "<")]
    Lt,
    #[serde(rename = ">")]
    Gt,
    #[serde(rename = "<=")]
    Le,
    #[serde(rename = ">=")]
    Ge,
    #[serde(rename = "==")]
    Eq,
    #[serde(rename = "!=")]
    Ne,
}

impl Operator {
    pub fn compare(self, value: f64, threshold: f64) -> bool {
        match self {
            Operator::Lt => value < threshold,
            Operator::Gt => value > threshold,
            Operator::Le => value <= threshold,
            Operator::Ge => value >= threshold,
            Operator::Eq => value == threshold,
            Operator::Ne => value != threshold,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Operator::Lt => "<",
            Operator::Gt => ">",
            Operator::Le => "<=",
            Operator::Ge => ">=",
            Operator::Eq => "==",
            Operator::Ne => "!=",
        }
    }
}

impl FromStr for Operator {
    type Err = GatewayError;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        match raw {
            "<" => Ok(Operator::Lt),
            ">" => Ok(Operator::Gt),
            "<=" => Ok(Operator::Le),
            ">=" => Ok(Operator::Ge),
            "==" => Ok(Operator::Eq),
            "!=" => Ok(Operator::Ne),
            other => Err(GatewayError::ConfigInvalid(format!(
                "unknown condition operator {other:?}"
            ))),
        }
    }
}

impl fmt::Display for Operator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A threshold condition over a named metric.
///
/// The evaluator itself is stateless: `is_true` only compares the current
/// value against the threshold. `trigger_time` and `status` are bookkeeping
/// slots mutated by whichever loop owns the condition (the monitor loop or a
/// switchover cycle).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Condition {
    pub metric: String,
    pub operator: Operator,
    pub threshold: f64,
    #[serde(with = "humantime_serde")]
    pub active_for: Duration,
    #[serde(skip)]
    pub trigger_time: Option<DateTime<Utc>>,
    #[serde(skip)]
    pub status: bool,
}

impl Condition {
    pub fn new(metric: &str, operator: Operator, threshold: f64, active_for: Duration) -> Self {
        Self {
            metric: metric.to_string(),
            operator,
            threshold,
            active_for,
            trigger_time: None,
            status: false,
        }
    }

    /// Evaluate the condition against a flattened metric map.
    ///
    /// A metric that is absent from the map evaluates to false, not an error.
    pub fn is_true(&self, rates: &HashMap<String, f64>) -> bool {
        match rates.get(&self.metric) {
            Some(value) => self.operator.compare(*value, self.threshold),
            None => false,
        }
    }

    pub fn active_for(&self) -> Duration {
        self.active_for
    }

    /// Clear the trigger bookkeeping.
    pub fn reset(&mut self) {
        self.trigger_time = None;
        self.status = false;
    }
}
