//! A single tunable parameter definition and its current value.

use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use tracing::error;

use otto_core::{Error, ParamValue, Result};

/// Value kind of a tunable parameter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TunableKind {
    Int,
    Float,
    Categorical,
}

impl TunableKind {
    pub fn as_str(self) -> &'static str {
        match self {
            TunableKind::Int => "int",
            TunableKind::Float => "float",
            TunableKind::Categorical => "categorical",
        }
    }
}

impl fmt::Display for TunableKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Sampling distribution descriptor for numeric tunables.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DistributionKind {
    Uniform,
    Normal,
    Beta,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Distribution {
    #[serde(rename = "type")]
    pub kind: DistributionKind,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub params: BTreeMap<String, f64>,
}

/// Declarative form of a tunable, as found in the JSON configs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TunableDef {
    #[serde(rename = "type")]
    pub kind: TunableKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub default: ParamValue,
    /// Labels of a categorical tunable.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub values: Option<Vec<String>>,
    /// Closed `[lo, hi]` range of a numeric tunable.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub range: Option<(f64, f64)>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub quantization: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub log: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub distribution: Option<Distribution>,
    /// Out-of-range values that remain legal assignments.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub special: Option<Vec<f64>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub values_weights: Option<Vec<f64>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub special_weights: Option<Vec<f64>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub range_weight: Option<f64>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub meta: BTreeMap<String, serde_json::Value>,
}

/// Cardinality of a tunable's value domain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Cardinality {
    Finite(u64),
    Unbounded,
}

/// A tunable parameter definition and its current value.
#[derive(Debug, Clone)]
pub struct Tunable {
    name: String,
    def: TunableDef,
    current: ParamValue,
}

impl Tunable {
    /// Create a tunable from its declarative form, validate the definition,
    /// and assign the default value.
    pub fn new(name: &str, def: TunableDef) -> Result<Self> {
        if name.is_empty() || name.contains('!') {
            return Err(Error::config(format!("invalid tunable name: {name:?}")));
        }
        let mut tunable = Tunable {
            name: name.to_string(),
            def,
            current: ParamValue::Null,
        };
        tunable.sanity_check()?;
        let default = tunable.def.default.clone();
        tunable.assign(default).map_err(|err| {
            Error::config(format!("invalid default for tunable {name}: {err}"))
        })?;
        Ok(tunable)
    }

    fn sanity_check(&self) -> Result<()> {
        match self.def.kind {
            TunableKind::Categorical => self.sanity_check_categorical(),
            TunableKind::Int | TunableKind::Float => self.sanity_check_numerical(),
        }
    }

    fn sanity_check_categorical(&self) -> Result<()> {
        let fail = |reason: &str| {
            Err(Error::config(format!(
                "categorical tunable {}: {reason}",
                self.name
            )))
        };
        let values = match &self.def.values {
            Some(values) if !values.is_empty() => values,
            _ => return fail("must specify values"),
        };
        let mut seen = std::collections::BTreeSet::new();
        if !values.iter().all(|v| seen.insert(v)) {
            return fail("values must be unique");
        }
        if self.def.range.is_some() {
            return fail("range must not be specified");
        }
        if self.def.special.is_some() {
            return fail("special values are not allowed");
        }
        if self.def.range_weight.is_some() {
            return fail("range_weight is not allowed");
        }
        if self.def.log.is_some() {
            return fail("log scale is not allowed");
        }
        if self.def.quantization.is_some() {
            return fail("quantization is not allowed");
        }
        if self.def.distribution.is_some() {
            return fail("distribution is not allowed");
        }
        if self.def.special_weights.is_some() {
            return fail("special_weights is not allowed");
        }
        if let Some(weights) = &self.def.values_weights {
            if weights.len() != values.len() {
                return fail("must specify weights for all values");
            }
            if weights.iter().any(|w| *w < 0.0) {
                return fail("all weights must be non-negative");
            }
        }
        Ok(())
    }

    fn sanity_check_numerical(&self) -> Result<()> {
        let fail = |reason: &str| {
            Err(Error::config(format!(
                "numeric tunable {}: {reason}",
                self.name
            )))
        };
        if self.def.values.is_some() || self.def.values_weights.is_some() {
            return fail("categorical attributes are not allowed");
        }
        let (lo, hi) = match self.def.range {
            Some(range) => range,
            None => return fail("must specify a range"),
        };
        if !(lo < hi) {
            return fail("range must satisfy lo < hi");
        }
        if let Some(q) = self.def.quantization {
            match self.def.kind {
                TunableKind::Int => {
                    if q.fract() != 0.0 {
                        return fail("quantization of an int tunable must be an int");
                    }
                    if q <= 1.0 {
                        return fail("quantization step must be > 1");
                    }
                }
                TunableKind::Float => {
                    if q <= 0.0 {
                        return fail("quantization step must be > 0");
                    }
                }
                TunableKind::Categorical => unreachable!(),
            }
        }
        let special_len = self.def.special.as_ref().map_or(0, Vec::len);
        match (&self.def.special_weights, self.def.range_weight) {
            (Some(weights), Some(range_weight)) => {
                if weights.len() != special_len {
                    return fail("must specify weights for all special values");
                }
                if weights.iter().chain([&range_weight]).any(|w| *w < 0.0) {
                    return fail("all weights must be non-negative");
                }
            }
            (None, None) => {}
            _ => return fail("must specify both special_weights and range_weight or neither"),
        }
        Ok(())
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> TunableKind {
        self.def.kind
    }

    pub fn description(&self) -> Option<&str> {
        self.def.description.as_deref()
    }

    pub fn default(&self) -> &ParamValue {
        &self.def.default
    }

    /// The current value; always satisfies the kind-specific predicate.
    pub fn value(&self) -> &ParamValue {
        &self.current
    }

    pub fn is_default(&self) -> bool {
        self.current == self.def.default
    }

    pub fn is_categorical(&self) -> bool {
        self.def.kind == TunableKind::Categorical
    }

    pub fn is_numerical(&self) -> bool {
        matches!(self.def.kind, TunableKind::Int | TunableKind::Float)
    }

    pub fn range(&self) -> Option<(f64, f64)> {
        self.def.range
    }

    /// `hi - lo`; does not account for quantization.
    pub fn span(&self) -> Option<f64> {
        self.def.range.map(|(lo, hi)| hi - lo)
    }

    pub fn quantization(&self) -> Option<f64> {
        self.def.quantization
    }

    pub fn is_log(&self) -> bool {
        self.def.log.unwrap_or(false)
    }

    pub fn distribution(&self) -> Option<&Distribution> {
        self.def.distribution.as_ref()
    }

    pub fn special(&self) -> &[f64] {
        self.def.special.as_deref().unwrap_or(&[])
    }

    /// Weights of categorical labels.
    pub fn values_weights(&self) -> Option<&[f64]> {
        self.def.values_weights.as_deref()
    }

    /// Weights of the special values, paired with [`Tunable::range_weight`].
    pub fn special_weights(&self) -> Option<&[f64]> {
        self.def.special_weights.as_deref()
    }

    pub fn range_weight(&self) -> Option<f64> {
        self.def.range_weight
    }

    pub fn meta(&self) -> &BTreeMap<String, serde_json::Value> {
        &self.def.meta
    }

    /// Labels of a categorical tunable.
    pub fn categories(&self) -> Option<&[String]> {
        self.def.values.as_deref()
    }

    pub fn def(&self) -> &TunableDef {
        &self.def
    }

    /// Coerce a raw value to the native kind without validating the domain.
    fn coerce(&self, value: &ParamValue) -> Result<ParamValue> {
        let invalid = || {
            error!(
                tunable = %self.name, kind = %self.def.kind, %value,
                "impossible conversion"
            );
            Err(Error::InvalidValue {
                name: self.name.clone(),
                value: value.to_string(),
            })
        };
        match self.def.kind {
            TunableKind::Int => match value {
                ParamValue::Int(i) => Ok(ParamValue::Int(*i)),
                ParamValue::Float(f) => {
                    if f.fract() == 0.0 && *f >= i64::MIN as f64 && *f <= i64::MAX as f64 {
                        Ok(ParamValue::Int(*f as i64))
                    } else {
                        error!(tunable = %self.name, value = f, "loss of precision");
                        Err(Error::PrecisionLoss {
                            name: self.name.clone(),
                            value: *f,
                        })
                    }
                }
                ParamValue::Text(s) => match s.parse::<i64>() {
                    Ok(i) => Ok(ParamValue::Int(i)),
                    Err(_) => invalid(),
                },
                _ => invalid(),
            },
            TunableKind::Float => match value {
                ParamValue::Int(i) => Ok(ParamValue::Float(*i as f64)),
                ParamValue::Float(f) => Ok(ParamValue::Float(*f)),
                ParamValue::Text(s) => match s.parse::<f64>() {
                    Ok(f) => Ok(ParamValue::Float(f)),
                    Err(_) => invalid(),
                },
                _ => invalid(),
            },
            TunableKind::Categorical => match value {
                ParamValue::Text(s) => Ok(ParamValue::Text(s.clone())),
                ParamValue::Int(i) => Ok(ParamValue::Text(i.to_string())),
                ParamValue::Float(f) => Ok(ParamValue::Text(f.to_string())),
                ParamValue::Bool(b) => Ok(ParamValue::Text(b.to_string())),
                ParamValue::Null => invalid(),
            },
        }
    }

    /// Check whether the coerced value is inside the domain.
    fn in_domain(&self, value: &ParamValue) -> bool {
        match self.def.kind {
            TunableKind::Categorical => match (value.as_str(), &self.def.values) {
                (Some(label), Some(values)) => values.iter().any(|v| v == label),
                _ => false,
            },
            TunableKind::Int | TunableKind::Float => match value.as_f64() {
                Some(num) => {
                    (self.in_range(num) && self.on_grid(num)) || self.special().contains(&num)
                }
                None => false,
            },
        }
    }

    /// Quantized tunables only admit values on the quantization grid.
    fn on_grid(&self, value: f64) -> bool {
        let (q, (lo, hi)) = match (self.def.quantization, self.def.range) {
            (Some(q), Some(range)) => (q, range),
            _ => return true,
        };
        match self.def.kind {
            TunableKind::Int => ((value - lo) as i64) % (q as i64) == 0,
            TunableKind::Float => {
                let steps = (value - lo) / q;
                let tolerance = (hi - lo) * 1e-9;
                (steps - steps.round()).abs() * q <= tolerance
            }
            TunableKind::Categorical => true,
        }
    }

    /// Check if the value is within the numeric range; does NOT consider
    /// special values.
    pub fn in_range(&self, value: f64) -> bool {
        self.is_numerical()
            && self
                .def
                .range
                .is_some_and(|(lo, hi)| lo <= value && value <= hi)
    }

    /// Check if the value could be assigned, without side effects.
    pub fn is_valid(&self, value: &ParamValue) -> bool {
        self.coerce(value).map_or(false, |v| self.in_domain(&v))
    }

    /// Check if the current value is one of the special values.
    pub fn is_special(&self) -> bool {
        self.current
            .as_f64()
            .is_some_and(|v| self.special().contains(&v))
    }

    /// Coerce and validate; on success the value becomes current.
    pub fn assign(&mut self, value: impl Into<ParamValue>) -> Result<&ParamValue> {
        let raw = value.into();
        let coerced = self.coerce(&raw)?;
        if !self.in_domain(&coerced) {
            error!(tunable = %self.name, kind = %self.def.kind, value = %raw, "invalid assignment");
            return Err(Error::InvalidValue {
                name: self.name.clone(),
                value: raw.to_string(),
            });
        }
        self.current = coerced;
        Ok(&self.current)
    }

    /// Assign the value; return true if it differs from the previous one.
    pub fn update(&mut self, value: impl Into<ParamValue>) -> Result<bool> {
        let prev = self.current.clone();
        self.assign(value)?;
        Ok(prev != self.current)
    }

    /// Finite, restartable sequence of quantized values.
    ///
    /// Unquantized float tunables have unbounded cardinality and return
    /// `None`; int tunables fall back to the unit step.
    pub fn quantized_values(&self) -> Option<QuantizedValues> {
        let (lo, hi) = self.def.range?;
        match self.def.kind {
            TunableKind::Int => {
                let step = self.def.quantization.unwrap_or(1.0) as i64;
                Some(QuantizedValues::Int {
                    next: lo as i64,
                    hi: hi as i64,
                    step,
                })
            }
            TunableKind::Float => {
                let count = match self.cardinality() {
                    Cardinality::Finite(count) => count,
                    Cardinality::Unbounded => return None,
                };
                Some(QuantizedValues::Float {
                    index: 0,
                    count,
                    lo,
                    hi,
                })
            }
            TunableKind::Categorical => None,
        }
    }

    /// Number of points in the value domain, or the unbounded sentinel.
    pub fn cardinality(&self) -> Cardinality {
        match self.def.kind {
            TunableKind::Categorical => Cardinality::Finite(
                self.def.values.as_ref().map_or(0, |v| v.len() as u64),
            ),
            TunableKind::Float if self.def.quantization.is_none() => Cardinality::Unbounded,
            TunableKind::Int | TunableKind::Float => {
                let span = self.span().unwrap_or(0.0);
                let q = self.def.quantization.unwrap_or(1.0);
                Cardinality::Finite((span / q) as u64 + 1)
            }
        }
    }
}

impl PartialEq for Tunable {
    /// Tunables compare equal when name, kind and current value match.
    fn eq(&self, other: &Self) -> bool {
        self.name == other.name
            && self.def.kind == other.def.kind
            && self.current == other.current
    }
}

impl Eq for Tunable {}

impl PartialOrd for Tunable {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Tunable {
    /// Total order over (name, kind, current value); used to build the
    /// canonical tunable list when hashing a group.
    fn cmp(&self, other: &Self) -> Ordering {
        self.name
            .cmp(&other.name)
            .then_with(|| self.def.kind.cmp(&other.def.kind))
            .then_with(|| match self.def.kind {
                TunableKind::Int | TunableKind::Float => {
                    let lhs = self.current.as_f64().unwrap_or(f64::NAN);
                    let rhs = other.current.as_f64().unwrap_or(f64::NAN);
                    lhs.total_cmp(&rhs)
                }
                TunableKind::Categorical => self
                    .current
                    .to_string()
                    .cmp(&other.current.to_string()),
            })
    }
}

impl fmt::Display for Tunable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}[{}]={}", self.name, self.def.kind, self.current)
    }
}

/// Restartable iterator over the quantized points of a numeric tunable.
///
/// Owns its bounds; holds no borrow into the parent tunable.
#[derive(Debug, Clone)]
pub enum QuantizedValues {
    Int { next: i64, hi: i64, step: i64 },
    Float { index: u64, count: u64, lo: f64, hi: f64 },
}

impl Iterator for QuantizedValues {
    type Item = ParamValue;

    fn next(&mut self) -> Option<ParamValue> {
        match self {
            QuantizedValues::Int { next, hi, step } => {
                if *next > *hi {
                    return None;
                }
                let value = *next;
                *next += *step;
                Some(ParamValue::Int(value))
            }
            QuantizedValues::Float { index, count, lo, hi } => {
                if *index >= *count {
                    return None;
                }
                let value = if *count == 1 {
                    *lo
                } else {
                    *lo + (*hi - *lo) * (*index as f64) / ((*count - 1) as f64)
                };
                *index += 1;
                Some(ParamValue::Float(value))
            }
        }
    }
}
