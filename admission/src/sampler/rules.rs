//! Attribute-matching sampling rules.
//!
//! A rule applies a fixed probability to every record whose attributes meet
//! all of its conditions. Rules are evaluated highest priority first and the
//! first match wins; records matching no rule fall through to the adaptive
//! category probability. A rule may also cap how many records it admits per
//! minute.

use crate::counters::PendingCounter;
use crate::error::ConfigError;
use crate::record::Attributes;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};

const STAGE: &str = "adaptive_sampler";
const RATE_LIMIT_WINDOW: Duration = Duration::from_secs(60);

/// One sampling rule.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SamplingRule {
    /// Rule name, used in logs and as a metric label
    pub name: String,

    /// Evaluation order; higher runs first (default: 0)
    #[serde(default)]
    pub priority: i32,

    /// Probability of admitting a matching record, in [0, 1]
    pub sample_rate: f64,

    /// Most records this rule admits per minute; unlimited when unset
    #[serde(default)]
    pub max_per_minute: Option<u32>,

    /// Conditions that must all hold; an empty list matches every record
    #[serde(default)]
    pub conditions: Vec<SamplingCondition>,
}

/// Comparison of one attribute against a value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SamplingCondition {
    /// Attribute to read
    pub attribute: String,

    /// Comparison to apply
    pub operator: ConditionOp,

    /// Right-hand side. For `exists` it is the expected presence and defaults to `true`.
    #[serde(default)]
    pub value: Option<ConditionValue>,
}

/// Comparison operators.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConditionOp {
    /// Equal. Compared as a number or boolean when the value is one.
    Eq,
    /// Not equal.
    Ne,
    /// Numerically greater.
    Gt,
    /// Numerically greater or equal.
    Gte,
    /// Numerically less.
    Lt,
    /// Numerically less or equal.
    Lte,
    /// Substring match.
    Contains,
    /// Attribute presence.
    Exists,
}

/// Literal on the right-hand side of a condition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ConditionValue {
    /// Boolean literal.
    Bool(bool),
    /// Numeric literal.
    Number(f64),
    /// String literal.
    Text(String),
}

impl ConditionValue {
    fn as_number(&self) -> Option<f64> {
        match self {
            Self::Number(n) => Some(*n),
            Self::Text(s) => s.trim().parse().ok(),
            Self::Bool(_) => None,
        }
    }

    fn as_text(&self) -> String {
        match self {
            Self::Bool(b) => b.to_string(),
            Self::Number(n) => n.to_string(),
            Self::Text(s) => s.clone(),
        }
    }
}

impl SamplingRule {
    /// Creates a rule without conditions.
    #[must_use]
    pub fn new(name: impl Into<String>, priority: i32, sample_rate: f64) -> Self {
        Self {
            name: name.into(),
            priority,
            sample_rate,
            max_per_minute: None,
            conditions: Vec::new(),
        }
    }

    /// Adds a condition.
    #[must_use]
    pub fn when(mut self, attribute: impl Into<String>, operator: ConditionOp, value: ConditionValue) -> Self {
        self.conditions.push(SamplingCondition {
            attribute: attribute.into(),
            operator,
            value: Some(value),
        });
        self
    }

    /// Caps admissions per minute.
    #[must_use]
    pub const fn with_max_per_minute(mut self, limit: u32) -> Self {
        self.max_per_minute = Some(limit);
        self
    }

    /// Checks name, rate and conditions.
    ///
    /// # Errors
    ///
    /// Returns the first invalid field.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.name.trim().is_empty() {
            return Err(ConfigError::out_of_range(STAGE, "rules.name", "must not be empty"));
        }
        if !(0.0..=1.0).contains(&self.sample_rate) {
            return Err(ConfigError::out_of_range(
                STAGE,
                "rules.sample_rate",
                format!("rule `{}`: {} is not in [0, 1]", self.name, self.sample_rate),
            ));
        }
        if self.max_per_minute == Some(0) {
            return Err(ConfigError::out_of_range(
                STAGE,
                "rules.max_per_minute",
                format!("rule `{}`: must be positive when set", self.name),
            ));
        }
        for condition in &self.conditions {
            condition.validate(&self.name)?;
        }
        Ok(())
    }

    /// Returns `true` if every condition holds for `attributes`.
    #[must_use]
    pub fn matches(&self, attributes: &Attributes) -> bool {
        self.conditions.iter().all(|c| c.matches(attributes))
    }
}

impl SamplingCondition {
    fn validate(&self, rule: &str) -> Result<(), ConfigError> {
        if self.attribute.trim().is_empty() {
            return Err(ConfigError::out_of_range(
                STAGE,
                "rules.conditions.attribute",
                format!("rule `{rule}`: must not be empty"),
            ));
        }
        match (self.operator, &self.value) {
            (ConditionOp::Exists, None | Some(ConditionValue::Bool(_))) => Ok(()),
            (ConditionOp::Exists, Some(_)) => Err(ConfigError::out_of_range(
                STAGE,
                "rules.conditions.value",
                format!("rule `{rule}`: `exists` takes a boolean"),
            )),
            (_, None) => Err(ConfigError::out_of_range(
                STAGE,
                "rules.conditions.value",
                format!("rule `{rule}`: `{:?}` needs a value", self.operator),
            )),
            (ConditionOp::Gt | ConditionOp::Gte | ConditionOp::Lt | ConditionOp::Lte, Some(v))
                if v.as_number().is_none() =>
            {
                Err(ConfigError::out_of_range(
                    STAGE,
                    "rules.conditions.value",
                    format!("rule `{rule}`: `{:?}` needs a number", self.operator),
                ))
            }
            _ => Ok(()),
        }
    }

    /// Evaluates the condition. A missing attribute only satisfies
    /// `exists: false`.
    #[must_use]
    pub fn matches(&self, attributes: &Attributes) -> bool {
        let Some(actual) = attributes.get_str(&self.attribute) else {
            return self.operator == ConditionOp::Exists && self.value == Some(ConditionValue::Bool(false));
        };
        let Some(expected) = &self.value else {
            return self.operator == ConditionOp::Exists;
        };
        match self.operator {
            ConditionOp::Exists => *expected == ConditionValue::Bool(true),
            ConditionOp::Eq => values_equal(actual, expected),
            ConditionOp::Ne => !values_equal(actual, expected),
            ConditionOp::Gt => compare(attributes, &self.attribute, expected, |a, b| a > b),
            ConditionOp::Gte => compare(attributes, &self.attribute, expected, |a, b| a >= b),
            ConditionOp::Lt => compare(attributes, &self.attribute, expected, |a, b| a < b),
            ConditionOp::Lte => compare(attributes, &self.attribute, expected, |a, b| a <= b),
            ConditionOp::Contains => actual.contains(expected.as_text().as_str()),
        }
    }
}

fn values_equal(actual: &str, expected: &ConditionValue) -> bool {
    match expected {
        ConditionValue::Bool(b) => {
            let raw = actual.trim();
            (raw.eq_ignore_ascii_case("true") && *b) || (raw.eq_ignore_ascii_case("false") && !*b)
        }
        #[allow(clippy::float_cmp)]
        ConditionValue::Number(n) => actual.trim().parse::<f64>().is_ok_and(|a| a == *n),
        ConditionValue::Text(s) => actual == s,
    }
}

fn compare(attributes: &Attributes, key: &str, expected: &ConditionValue, op: impl Fn(f64, f64) -> bool) -> bool {
    match (attributes.get_f64(key), expected.as_number()) {
        (Some(a), Some(b)) => op(a, b),
        _ => false,
    }
}

/// Decision totals of one rule.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RuleStats {
    /// Rule name.
    pub name: String,
    /// Matching records admitted.
    pub sampled_in: u64,
    /// Matching records dropped by probability.
    pub sampled_out: u64,
    /// Matching records dropped by the per-minute cap.
    pub rate_limited: u64,
}

/// Outcome of evaluating the rule set against one record.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum RuleVerdict<'a> {
    /// No rule matched.
    NoMatch,
    /// A rule matched; admit with this probability.
    Sample {
        /// Name of the matching rule.
        rule: &'a str,
        /// Probability to apply.
        rate: f64,
    },
    /// A rule matched but its per-minute cap is exhausted.
    RateLimited {
        /// Name of the matching rule.
        rule: &'a str,
    },
}

#[derive(Debug)]
struct MinuteWindow {
    started: Instant,
    admitted: u32,
}

#[derive(Debug)]
struct CompiledRule {
    rule: SamplingRule,
    window: Mutex<MinuteWindow>,
    admitted: PendingCounter,
    dropped: PendingCounter,
    limited: PendingCounter,
}

/// Priority-ordered rules with their per-minute windows.
#[derive(Debug)]
pub struct RuleSet {
    rules: Vec<CompiledRule>,
}

impl RuleSet {
    /// Orders `rules` by descending priority. Equal priorities keep their
    /// configured order.
    #[must_use]
    pub fn new(mut rules: Vec<SamplingRule>, now: Instant) -> Self {
        rules.sort_by(|a, b| b.priority.cmp(&a.priority));
        let rules = rules
            .into_iter()
            .map(|rule| CompiledRule {
                rule,
                window: Mutex::new(MinuteWindow { started: now, admitted: 0 }),
                admitted: PendingCounter::new(),
                dropped: PendingCounter::new(),
                limited: PendingCounter::new(),
            })
            .collect();
        Self { rules }
    }

    /// Returns `true` if no rules are configured.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    /// Finds the first matching rule and charges its per-minute cap.
    ///
    /// The cap is charged before the probability is applied, so a capped
    /// rule admits at most `max_per_minute * sample_rate` records on average.
    pub fn evaluate(&self, attributes: &Attributes, now: Instant) -> RuleVerdict<'_> {
        let Some(compiled) = self.rules.iter().find(|c| c.rule.matches(attributes)) else {
            return RuleVerdict::NoMatch;
        };
        let rule = &compiled.rule;
        if let Some(limit) = rule.max_per_minute {
            let mut window = compiled.window.lock();
            if now.saturating_duration_since(window.started) >= RATE_LIMIT_WINDOW {
                window.started = now;
                window.admitted = 0;
            }
            if window.admitted >= limit {
                compiled.limited.incr();
                return RuleVerdict::RateLimited { rule: &rule.name };
            }
            window.admitted += 1;
        }
        RuleVerdict::Sample {
            rule: &rule.name,
            rate: rule.sample_rate,
        }
    }

    /// Records the probability outcome of a [`RuleVerdict::Sample`].
    pub fn record_decision(&self, rule: &str, kept: bool) {
        if let Some(compiled) = self.rules.iter().find(|c| c.rule.name == rule) {
            if kept {
                compiled.admitted.incr();
            } else {
                compiled.dropped.incr();
            }
        }
    }

    /// Per-rule totals in evaluation order.
    #[must_use]
    pub fn stats(&self) -> Vec<RuleStats> {
        self.rules
            .iter()
            .map(|c| RuleStats {
                name: c.rule.name.clone(),
                sampled_in: c.admitted.get(),
                sampled_out: c.dropped.get(),
                rate_limited: c.limited.get(),
            })
            .collect()
    }

    /// Forwards per-rule deltas to the metrics recorder.
    pub fn flush_telemetry(&self) {
        for c in &self.rules {
            let name = &c.rule.name;
            crate::flush_counter!(c.admitted, "dbintel_sampler_rule_records_total", "rule" => name.clone(), "decision" => "sampled_in");
            crate::flush_counter!(c.dropped, "dbintel_sampler_rule_records_total", "rule" => name.clone(), "decision" => "sampled_out");
            crate::flush_counter!(c.limited, "dbintel_sampler_rule_records_total", "rule" => name.clone(), "decision" => "rate_limited");
        }
    }
}
