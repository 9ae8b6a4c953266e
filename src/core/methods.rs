//! Resampling and filling method registry.
//!
//! Policies are configured by name (`{"method": "mean", "parameters": {}}`)
//! and validated into closed enums once, when the sequencer is built. The
//! per-window hot path only ever dispatches on those enums.

use crate::core::schema::FeatureKind;
use crate::error::{PolicyStage, Result, SequencerError};
use crate::event::Value;
use serde::{Deserialize, Serialize};
use statrs::statistics::{Data, Median, Statistics};
use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::fmt;

/// A policy entry as written in configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MethodSpec {
    pub method: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub parameters: BTreeMap<String, serde_json::Value>,
}

impl MethodSpec {
    pub fn new(method: impl Into<String>) -> Self {
        Self {
            method: method.into(),
            parameters: BTreeMap::new(),
        }
    }

    pub fn with_param(mut self, name: impl Into<String>, value: serde_json::Value) -> Self {
        self.parameters.insert(name.into(), value);
        self
    }

    fn param(&self, name: &str) -> Option<&serde_json::Value> {
        self.parameters.get(name)
    }

    fn invalid(&self, name: &str, reason: impl Into<String>) -> SequencerError {
        SequencerError::InvalidParameter {
            method: self.method.clone(),
            name: name.to_string(),
            reason: reason.into(),
        }
    }

    fn f64_param(&self, name: &str, default: Option<f64>) -> Result<f64> {
        match self.param(name) {
            Some(v) => v.as_f64().ok_or_else(|| self.invalid(name, "expected a number")),
            None => default.ok_or_else(|| self.invalid(name, "parameter is required")),
        }
    }

    fn i64_param(&self, name: &str, default: i64) -> Result<i64> {
        match self.param(name) {
            Some(v) => v
                .as_i64()
                .ok_or_else(|| self.invalid(name, "expected an integer")),
            None => Ok(default),
        }
    }
}

/// Registry entry describing one method.
#[derive(Debug, Clone, Copy)]
pub struct MethodInfo {
    pub name: &'static str,
    pub aliases: &'static [&'static str],
    pub numeric_only: bool,
    pub parameters: &'static [&'static str],
    pub description: &'static str,
}

impl MethodInfo {
    fn matches(&self, name: &str) -> bool {
        self.name == name || self.aliases.contains(&name)
    }
}

const RESAMPLING_METHODS: &[MethodInfo] = &[
    MethodInfo {
        name: "mean",
        aliases: &["average"],
        numeric_only: true,
        parameters: &[],
        description: "Arithmetic mean of the observed values",
    },
    MethodInfo {
        name: "median",
        aliases: &[],
        numeric_only: true,
        parameters: &[],
        description: "Median of the observed values",
    },
    MethodInfo {
        name: "mode",
        aliases: &["most_frequent"],
        numeric_only: false,
        parameters: &[],
        description: "Most frequent observed value, smallest on ties",
    },
    MethodInfo {
        name: "min",
        aliases: &[],
        numeric_only: false,
        parameters: &[],
        description: "Smallest observed value",
    },
    MethodInfo {
        name: "max",
        aliases: &[],
        numeric_only: false,
        parameters: &[],
        description: "Largest observed value",
    },
    MethodInfo {
        name: "first",
        aliases: &[],
        numeric_only: false,
        parameters: &[],
        description: "Earliest observed value",
    },
    MethodInfo {
        name: "last",
        aliases: &[],
        numeric_only: false,
        parameters: &[],
        description: "Latest observed value",
    },
    MethodInfo {
        name: "sum",
        aliases: &[],
        numeric_only: true,
        parameters: &[],
        description: "Sum of the observed values, 0 for empty bins",
    },
    MethodInfo {
        name: "count",
        aliases: &[],
        numeric_only: false,
        parameters: &[],
        description: "Number of observed values",
    },
    MethodInfo {
        name: "threshold",
        aliases: &["thresholding"],
        numeric_only: true,
        parameters: &["cond", "c_value", "threshold", "set_value", "unset_value"],
        description: "set_value if more than `threshold` values satisfy `value <cond> c_value`",
    },
];

const FILLING_METHODS: &[MethodInfo] = &[
    MethodInfo {
        name: "forward",
        aliases: &["forward_fill", "forward-fill", "ffill"],
        numeric_only: false,
        parameters: &[],
        description: "Propagate the last observed value forward",
    },
    MethodInfo {
        name: "backward",
        aliases: &["backwards", "backward_fill", "backward-fill", "bfill"],
        numeric_only: false,
        parameters: &[],
        description: "Propagate the next observed value backward",
    },
    MethodInfo {
        name: "min",
        aliases: &[],
        numeric_only: false,
        parameters: &[],
        description: "Smallest observed value of the column",
    },
    MethodInfo {
        name: "max",
        aliases: &[],
        numeric_only: false,
        parameters: &[],
        description: "Largest observed value of the column",
    },
    MethodInfo {
        name: "mean",
        aliases: &[],
        numeric_only: true,
        parameters: &[],
        description: "Mean of the observed values of the column",
    },
    MethodInfo {
        name: "custom",
        aliases: &["constant"],
        numeric_only: false,
        parameters: &["custom_value"],
        description: "A fixed value",
    },
    MethodInfo {
        name: "none",
        aliases: &[],
        numeric_only: false,
        parameters: &[],
        description: "Leave missing points missing",
    },
];

/// The closed table of resampling and filling methods.
pub struct MethodRegistry;

impl MethodRegistry {
    pub fn methods(stage: PolicyStage) -> &'static [MethodInfo] {
        match stage {
            PolicyStage::Resampling => RESAMPLING_METHODS,
            PolicyStage::Filling => FILLING_METHODS,
        }
    }

    /// Look a method up by name or alias.
    pub fn lookup(stage: PolicyStage, name: &str) -> Result<&'static MethodInfo> {
        let normalized = name.trim().to_ascii_lowercase();
        Self::methods(stage)
            .iter()
            .find(|info| info.matches(&normalized))
            .ok_or_else(|| SequencerError::UnknownMethod {
                stage,
                name: name.to_string(),
            })
    }

    /// Validate a spec into a resampling method.
    pub fn resampler(spec: &MethodSpec) -> Result<ResampleMethod> {
        let info = Self::lookup(PolicyStage::Resampling, &spec.method)?;
        Ok(match info.name {
            "mean" => ResampleMethod::Mean,
            "median" => ResampleMethod::Median,
            "mode" => ResampleMethod::Mode,
            "min" => ResampleMethod::Min,
            "max" => ResampleMethod::Max,
            "first" => ResampleMethod::First,
            "last" => ResampleMethod::Last,
            "sum" => ResampleMethod::Sum,
            "count" => ResampleMethod::Count,
            _ => ResampleMethod::Threshold(ThresholdParams::from_spec(spec)?),
        })
    }

    /// Validate a spec into a filling method.
    pub fn filler(spec: &MethodSpec) -> Result<FillMethod> {
        let info = Self::lookup(PolicyStage::Filling, &spec.method)?;
        Ok(match info.name {
            "forward" => FillMethod::Forward,
            "backward" => FillMethod::Backward,
            "min" => FillMethod::Min,
            "max" => FillMethod::Max,
            "mean" => FillMethod::Mean,
            "none" => FillMethod::None,
            _ => {
                let raw = spec
                    .param("custom_value")
                    .ok_or_else(|| spec.invalid("custom_value", "parameter is required"))?;
                let value: Value = serde_json::from_value(raw.clone())
                    .map_err(|e| spec.invalid("custom_value", e.to_string()))?;
                FillMethod::Custom(value)
            }
        })
    }
}

/// Output type a resampled column is coerced to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutputType {
    Integer,
    Float,
    /// Keep whatever the aggregation produced.
    Preserve,
}

impl fmt::Display for OutputType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OutputType::Integer => write!(f, "integer"),
            OutputType::Float => write!(f, "float"),
            OutputType::Preserve => write!(f, "preserve"),
        }
    }
}

impl OutputType {
    /// Cast a value to this output type. Missing values stay missing.
    pub fn coerce(self, value: Value, feature: &str) -> Result<Value> {
        let fail = |value: &Value| SequencerError::Coercion {
            feature: feature.to_string(),
            value: value.to_string(),
            target: self.to_string(),
        };

        if value.is_missing() {
            return Ok(Value::Missing);
        }

        match self {
            OutputType::Preserve => Ok(value),
            OutputType::Float => match &value {
                Value::Int(i) => Ok(Value::Float(*i as f64)),
                Value::Float(_) => Ok(value),
                Value::Bool(b) => Ok(Value::Float(if *b { 1.0 } else { 0.0 })),
                Value::Text(s) => s
                    .trim()
                    .parse::<f64>()
                    .map(Value::Float)
                    .map_err(|_| fail(&value)),
                Value::Missing => Ok(Value::Missing),
            },
            OutputType::Integer => match &value {
                Value::Int(_) => Ok(value),
                Value::Bool(b) => Ok(Value::Int(i64::from(*b))),
                Value::Float(f) if f.is_finite() && f.fract() == 0.0 => Ok(Value::Int(*f as i64)),
                Value::Text(s) => s
                    .trim()
                    .parse::<i64>()
                    .map(Value::Int)
                    .map_err(|_| fail(&value)),
                _ => Err(fail(&value)),
            },
        }
    }
}

/// Comparison used by the threshold method.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Condition {
    Greater,
    GreaterEqual,
    Less,
    LessEqual,
    Equal,
}

impl Condition {
    fn parse(raw: &str) -> Option<Self> {
        match raw {
            "greater" | "gt" | ">" => Some(Condition::Greater),
            "greater_equal" | "ge" | ">=" => Some(Condition::GreaterEqual),
            "less" | "lt" | "<" => Some(Condition::Less),
            "less_equal" | "le" | "<=" => Some(Condition::LessEqual),
            "equal" | "eq" | "==" => Some(Condition::Equal),
            _ => None,
        }
    }

    fn holds(self, value: f64, reference: f64) -> bool {
        match self {
            Condition::Greater => value > reference,
            Condition::GreaterEqual => value >= reference,
            Condition::Less => value < reference,
            Condition::LessEqual => value <= reference,
            Condition::Equal => value == reference,
        }
    }
}

/// Parameters of the threshold resampling method.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ThresholdParams {
    pub cond: Condition,
    pub c_value: f64,
    pub threshold: usize,
    pub set_value: i64,
    pub unset_value: i64,
}

impl ThresholdParams {
    fn from_spec(spec: &MethodSpec) -> Result<Self> {
        let raw_cond = spec
            .param("cond")
            .ok_or_else(|| spec.invalid("cond", "parameter is required"))?;
        let cond = raw_cond
            .as_str()
            .and_then(Condition::parse)
            .ok_or_else(|| spec.invalid("cond", "expected one of greater, greater_equal, less, less_equal, equal"))?;
        let c_value = spec.f64_param("c_value", None)?;
        let threshold = spec.i64_param("threshold", 0)?;
        let threshold = usize::try_from(threshold)
            .map_err(|_| spec.invalid("threshold", "must not be negative"))?;

        Ok(Self {
            cond,
            c_value,
            threshold,
            set_value: spec.i64_param("set_value", 1)?,
            unset_value: spec.i64_param("unset_value", 0)?,
        })
    }
}

/// A validated resampling (aggregation) method.
#[derive(Debug, Clone, PartialEq)]
pub enum ResampleMethod {
    Mean,
    Median,
    Mode,
    Min,
    Max,
    First,
    Last,
    Sum,
    Count,
    Threshold(ThresholdParams),
}

impl ResampleMethod {
    pub fn name(&self) -> &'static str {
        match self {
            ResampleMethod::Mean => "mean",
            ResampleMethod::Median => "median",
            ResampleMethod::Mode => "mode",
            ResampleMethod::Min => "min",
            ResampleMethod::Max => "max",
            ResampleMethod::First => "first",
            ResampleMethod::Last => "last",
            ResampleMethod::Sum => "sum",
            ResampleMethod::Count => "count",
            ResampleMethod::Threshold(_) => "threshold",
        }
    }

    fn numeric_only(&self) -> bool {
        matches!(
            self,
            ResampleMethod::Mean
                | ResampleMethod::Median
                | ResampleMethod::Sum
                | ResampleMethod::Threshold(_)
        )
    }

    /// Categorical features reject numeric-only methods.
    pub fn applies_to(&self, kind: Option<FeatureKind>) -> bool {
        !(self.numeric_only() && kind == Some(FeatureKind::Categorical))
    }

    /// Output type implied by this method and the feature's original kind.
    pub fn output_type(&self, kind: Option<FeatureKind>) -> OutputType {
        match self {
            ResampleMethod::Count | ResampleMethod::Threshold(_) => OutputType::Integer,
            ResampleMethod::Mean | ResampleMethod::Median => OutputType::Float,
            ResampleMethod::Sum => match kind {
                Some(FeatureKind::Integer) => OutputType::Integer,
                _ => OutputType::Float,
            },
            _ => match kind {
                Some(FeatureKind::Integer) => OutputType::Integer,
                Some(FeatureKind::Float) => OutputType::Float,
                _ => OutputType::Preserve,
            },
        }
    }

    /// Aggregate the values that fell into one grid bin, in time order.
    ///
    /// Missing values are skipped.
    pub fn aggregate(&self, values: &[Value], feature: &str) -> Result<Value> {
        let observed: Vec<&Value> = values.iter().filter(|v| !v.is_missing()).collect();

        match self {
            ResampleMethod::Count => Ok(Value::Int(observed.len() as i64)),
            ResampleMethod::First => Ok(observed.first().map_or(Value::Missing, |v| (*v).clone())),
            ResampleMethod::Last => Ok(observed.last().map_or(Value::Missing, |v| (*v).clone())),
            ResampleMethod::Min => Ok(extreme(&observed, Ordering::Less)),
            ResampleMethod::Max => Ok(extreme(&observed, Ordering::Greater)),
            ResampleMethod::Mode => Ok(mode(&observed)),
            ResampleMethod::Sum => sum(&observed, feature),
            ResampleMethod::Mean => {
                let nums = numeric(&observed, feature)?;
                if nums.is_empty() {
                    return Ok(Value::Missing);
                }
                Ok(Value::Float(nums.iter().mean()))
            }
            ResampleMethod::Median => {
                let nums = numeric(&observed, feature)?;
                if nums.is_empty() {
                    return Ok(Value::Missing);
                }
                Ok(Value::Float(Data::new(nums).median()))
            }
            ResampleMethod::Threshold(params) => {
                let nums = numeric(&observed, feature)?;
                if nums.is_empty() {
                    return Ok(Value::Missing);
                }
                let hits = nums
                    .iter()
                    .filter(|&&v| params.cond.holds(v, params.c_value))
                    .count();
                Ok(Value::Int(if hits > params.threshold {
                    params.set_value
                } else {
                    params.unset_value
                }))
            }
        }
    }
}

/// A validated filling method.
#[derive(Debug, Clone, PartialEq)]
pub enum FillMethod {
    Forward,
    Backward,
    Min,
    Max,
    Mean,
    Custom(Value),
    None,
}

impl FillMethod {
    pub fn name(&self) -> &'static str {
        match self {
            FillMethod::Forward => "forward",
            FillMethod::Backward => "backward",
            FillMethod::Min => "min",
            FillMethod::Max => "max",
            FillMethod::Mean => "mean",
            FillMethod::Custom(_) => "custom",
            FillMethod::None => "none",
        }
    }

    pub fn applies_to(&self, kind: Option<FeatureKind>) -> bool {
        !(matches!(self, FillMethod::Mean) && kind == Some(FeatureKind::Categorical))
    }

    /// Fill the missing points of one column in place.
    ///
    /// Observed points are never modified.
    pub fn fill(&self, column: &mut [Value], feature: &str) -> Result<()> {
        let constant = match self {
            FillMethod::None => return Ok(()),
            FillMethod::Forward => {
                let mut last: Option<Value> = None;
                for cell in column.iter_mut() {
                    if cell.is_missing() {
                        if let Some(ref v) = last {
                            *cell = v.clone();
                        }
                    } else {
                        last = Some(cell.clone());
                    }
                }
                return Ok(());
            }
            FillMethod::Backward => {
                let mut next: Option<Value> = None;
                for cell in column.iter_mut().rev() {
                    if cell.is_missing() {
                        if let Some(ref v) = next {
                            *cell = v.clone();
                        }
                    } else {
                        next = Some(cell.clone());
                    }
                }
                return Ok(());
            }
            FillMethod::Min | FillMethod::Max | FillMethod::Mean => {
                let observed: Vec<&Value> = column.iter().filter(|v| !v.is_missing()).collect();
                match self {
                    FillMethod::Min => extreme(&observed, Ordering::Less),
                    FillMethod::Max => extreme(&observed, Ordering::Greater),
                    _ => {
                        let nums = numeric(&observed, feature)?;
                        if nums.is_empty() {
                            Value::Missing
                        } else {
                            Value::Float(nums.iter().mean())
                        }
                    }
                }
            }
            FillMethod::Custom(v) => v.clone(),
        };

        if constant.is_missing() {
            return Ok(());
        }
        for cell in column.iter_mut().filter(|v| v.is_missing()) {
            *cell = constant.clone();
        }
        Ok(())
    }
}

fn numeric(observed: &[&Value], feature: &str) -> Result<Vec<f64>> {
    observed
        .iter()
        .map(|v| {
            v.as_f64().ok_or_else(|| SequencerError::Coercion {
                feature: feature.to_string(),
                value: v.to_string(),
                target: OutputType::Float.to_string(),
            })
        })
        .collect()
}

fn extreme(observed: &[&Value], wanted: Ordering) -> Value {
    observed
        .iter()
        .copied()
        .reduce(|best, v| if v.total_cmp(best) == wanted { v } else { best })
        .cloned()
        .unwrap_or(Value::Missing)
}

fn mode(observed: &[&Value]) -> Value {
    let mut sorted: Vec<&Value> = observed.to_vec();
    sorted.sort_by(|a, b| a.total_cmp(b));

    let mut best: Option<(&Value, usize)> = None;
    let mut i = 0;
    while i < sorted.len() {
        let mut j = i + 1;
        while j < sorted.len() && sorted[j].total_cmp(sorted[i]) == Ordering::Equal {
            j += 1;
        }
        let run = j - i;
        // Strictly greater keeps the smallest value on ties.
        if best.map_or(true, |(_, n)| run > n) {
            best = Some((sorted[i], run));
        }
        i = j;
    }

    best.map_or(Value::Missing, |(v, _)| v.clone())
}

fn sum(observed: &[&Value], feature: &str) -> Result<Value> {
    if observed.iter().all(|v| matches!(v, Value::Int(_))) {
        let mut total: i64 = 0;
        for v in observed {
            if let Value::Int(i) = v {
                match total.checked_add(*i) {
                    Some(t) => total = t,
                    None => {
                        let nums = numeric(observed, feature)?;
                        return Ok(Value::Float(nums.iter().sum()));
                    }
                }
            }
        }
        return Ok(Value::Int(total));
    }
    let nums = numeric(observed, feature)?;
    Ok(Value::Float(nums.iter().sum()))
}
