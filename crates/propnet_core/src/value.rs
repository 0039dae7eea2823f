use crate::error::{ModelError, Result};
use crate::units::Units;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// A magnitude paired with its units and an optional standard uncertainty
/// in the same units.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Quantity {
    pub magnitude: f64,
    pub units: Units,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uncertainty: Option<f64>,
}

impl Quantity {
    pub fn new(magnitude: f64, units: Units) -> Self {
        Self {
            magnitude,
            units,
            uncertainty: None,
        }
    }

    /// Parses `units` and pairs it with `magnitude`.
    pub fn parse(magnitude: f64, units: &str) -> Result<Self> {
        Ok(Self::new(magnitude, Units::parse(units)?.units))
    }

    pub fn with_uncertainty(mut self, uncertainty: f64) -> Self {
        self.uncertainty = Some(uncertainty.abs());
        self
    }

    /// Magnitude expressed in `target` units.
    pub fn magnitude_in(&self, target: &Units) -> Result<f64> {
        Ok(self.magnitude * self.units.factor_to(target)?)
    }

    /// The same quantity expressed in `target` units.
    pub fn to(&self, target: &Units) -> Result<Quantity> {
        let factor = self.units.factor_to(target)?;
        Ok(Quantity {
            magnitude: self.magnitude * factor,
            units: target.clone(),
            uncertainty: self.uncertainty.map(|u| u * factor),
        })
    }

    /// Aggregates measurements of one property into their mean, in the units
    /// of the first quantity.
    ///
    /// When every quantity carries a positive uncertainty the mean is
    /// weighted by inverse variance; otherwise all weights are equal. The
    /// result's uncertainty is the weighted standard deviation about the mean.
    pub fn from_weighted_mean(quantities: &[Quantity]) -> Result<Quantity> {
        let first = quantities.first().ok_or(ModelError::EmptyAggregate)?;
        let units = &first.units;

        let mut magnitudes = Vec::with_capacity(quantities.len());
        let mut uncertainties = Vec::with_capacity(quantities.len());
        for quantity in quantities {
            let converted = quantity.to(units)?;
            magnitudes.push(converted.magnitude);
            uncertainties.push(converted.uncertainty);
        }

        let weights: Vec<f64> = if uncertainties.iter().all(|u| u.is_some_and(|u| u > 0.0)) {
            uncertainties
                .iter()
                .map(|u| u.map_or(1.0, |u| 1.0 / (u * u)))
                .collect()
        } else {
            vec![1.0; magnitudes.len()]
        };
        let total: f64 = weights.iter().sum();
        let mean = magnitudes.iter().zip(&weights).map(|(x, w)| x * w).sum::<f64>() / total;
        let variance = magnitudes
            .iter()
            .zip(&weights)
            .map(|(x, w)| w * (x - mean).powi(2))
            .sum::<f64>()
            / total;

        Ok(Quantity::new(mean, units.clone()).with_uncertainty(variance.sqrt()))
    }

    /// Human-readable form rounded to `sig_figs` significant figures, e.g.
    /// `100 GPa` or `1.5 ± 0.29`.
    pub fn pretty_string(&self, sig_figs: usize) -> String {
        let mut text = round_significant(self.magnitude, sig_figs).to_string();
        if let Some(uncertainty) = self.uncertainty {
            text.push_str(&format!(" ± {}", round_significant(uncertainty, sig_figs)));
        }
        if !self.units.is_dimensionless() {
            text.push_str(&format!(" {}", self.units));
        }
        text
    }
}

fn round_significant(value: f64, sig_figs: usize) -> f64 {
    if value == 0.0 || !value.is_finite() {
        return value;
    }
    let digits = sig_figs.max(1) as i32 - 1 - value.abs().log10().floor() as i32;
    if digits >= 0 {
        let factor = 10f64.powi(digits);
        (value * factor).round() / factor
    } else {
        let factor = 10f64.powi(-digits);
        (value / factor).round() * factor
    }
}

impl fmt::Display for Quantity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.uncertainty {
            Some(uncertainty) => write!(f, "{} ± {} {}", self.magnitude, uncertainty, self.units),
            None => write!(f, "{} {}", self.magnitude, self.units),
        }
    }
}

/// A plain number or a quantity with units.
///
/// Deserializes from `2.5` or `{"magnitude": 2.5, "units": "eV"}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Value {
    Number(f64),
    Quantity(Quantity),
}

impl Value {
    pub fn magnitude(&self) -> f64 {
        match self {
            Value::Number(n) => *n,
            Value::Quantity(q) => q.magnitude,
        }
    }

    pub fn units(&self) -> Option<&Units> {
        match self {
            Value::Number(_) => None,
            Value::Quantity(q) => Some(&q.units),
        }
    }

    pub fn is_quantity(&self) -> bool {
        matches!(self, Value::Quantity(_))
    }

    /// Magnitude in `target` units. Plain numbers are taken to already be in
    /// `target` units.
    pub fn magnitude_in(&self, target: &Units) -> Result<f64> {
        match self {
            Value::Number(n) => Ok(*n),
            Value::Quantity(q) => q.magnitude_in(target),
        }
    }
}

impl From<f64> for Value {
    fn from(value: f64) -> Self {
        Value::Number(value)
    }
}

impl From<Quantity> for Value {
    fn from(value: Quantity) -> Self {
        Value::Quantity(value)
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Number(n) => write!(f, "{n}"),
            Value::Quantity(q) => write!(f, "{q}"),
        }
    }
}

/// Known values keyed by internal variable name.
pub type EvaluationInput = BTreeMap<String, Value>;

/// Solved values keyed by internal variable name.
pub type EvaluationOutput = BTreeMap<String, Value>;
