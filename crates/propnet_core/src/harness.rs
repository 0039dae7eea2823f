//! Runs test fixtures against models and reports per-case results.
//!
//! `run` never fails: evaluation errors and panics inside a model become
//! [`CaseOutcome::Errored`], so one bad case or model cannot abort a batch.

use crate::error::Result;
use crate::model::Evaluate;
use crate::units::Units;
use crate::value::{EvaluationInput, EvaluationOutput, Value};
use serde::{Deserialize, Serialize};
use std::panic::{catch_unwind, AssertUnwindSafe};
use tracing::{debug, info};

/// Relative plus absolute tolerance: `|a - e| <= absolute + relative * |e|`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Tolerance {
    pub relative: f64,
    pub absolute: f64,
}

impl Default for Tolerance {
    fn default() -> Self {
        Self {
            relative: 1e-6,
            absolute: 1e-9,
        }
    }
}

impl Tolerance {
    pub fn close(&self, actual: f64, expected: f64) -> bool {
        if actual == expected {
            return true;
        }
        (actual - expected).abs() <= self.absolute + self.relative * expected.abs()
    }

    /// Compares two values. A quantity is converted into the units of the
    /// expected quantity first; incompatible dimensions never match.
    pub fn matches(&self, actual: &Value, expected: &Value) -> bool {
        match (actual, expected) {
            (Value::Quantity(a), Value::Quantity(e)) => a
                .magnitude_in(&e.units)
                .is_ok_and(|magnitude| self.close(magnitude, e.magnitude)),
            _ => self.close(actual.magnitude(), expected.magnitude()),
        }
    }

    /// Like [`matches`](Self::matches), but a plain number compared with a
    /// quantity is read in `units`, the units of the mapped symbol.
    pub fn matches_in(&self, actual: &Value, expected: &Value, units: &Units) -> bool {
        if actual.is_quantity() == expected.is_quantity() {
            return self.matches(actual, expected);
        }
        match (actual.magnitude_in(units), expected.magnitude_in(units)) {
            (Ok(actual), Ok(expected)) => self.close(actual, expected),
            _ => false,
        }
    }
}

/// One fixture: inputs and the outputs they should produce.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TestCase {
    pub inputs: EvaluationInput,
    pub outputs: EvaluationOutput,
}

/// Reads a JSON list of `{ "inputs": {...}, "outputs": {...} }` objects.
pub fn load_test_cases(json: &str) -> Result<Vec<TestCase>> {
    Ok(serde_json::from_str(json)?)
}

#[derive(Debug, Clone, PartialEq)]
pub enum CaseOutcome {
    Passed,
    Mismatch {
        expected: EvaluationOutput,
        actual: EvaluationOutput,
        /// Expected keys that are missing or out of tolerance.
        diverging: Vec<String>,
    },
    Errored {
        message: String,
    },
}

impl CaseOutcome {
    pub fn passed(&self) -> bool {
        matches!(self, CaseOutcome::Passed)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    /// No test cases: neither passing nor failing.
    Untested,
    Passed,
    Failed,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TestReport {
    pub model: String,
    pub status: Status,
    pub cases: Vec<CaseOutcome>,
}

impl TestReport {
    pub fn passed_count(&self) -> usize {
        self.cases.iter().filter(|case| case.passed()).count()
    }

    pub fn failures(&self) -> impl Iterator<Item = (usize, &CaseOutcome)> {
        self.cases.iter().enumerate().filter(|(_, case)| !case.passed())
    }
}

#[derive(Debug, Clone, Default)]
pub struct TestHarness {
    pub tolerance: Tolerance,
}

impl TestHarness {
    pub fn new(tolerance: Tolerance) -> Self {
        Self { tolerance }
    }

    /// Evaluates every case against `model`. Never fails.
    pub fn run<M: Evaluate + ?Sized>(&self, model: &M, cases: &[TestCase]) -> TestReport {
        let outcomes: Vec<CaseOutcome> = cases
            .iter()
            .enumerate()
            .map(|(index, case)| {
                let outcome = self.run_case(model, case);
                debug!(model = model.name(), case = index, ?outcome, "test case");
                outcome
            })
            .collect();

        let status = if outcomes.is_empty() {
            Status::Untested
        } else if outcomes.iter().all(CaseOutcome::passed) {
            Status::Passed
        } else {
            Status::Failed
        };
        let report = TestReport {
            model: model.name().to_string(),
            status,
            cases: outcomes,
        };
        info!(
            model = %report.model,
            status = ?report.status,
            passed = report.passed_count(),
            total = report.cases.len(),
            "model tested"
        );
        report
    }

    /// Runs many models, each against its own cases.
    pub fn run_batch<'a, M, I>(&self, batch: I) -> Vec<TestReport>
    where
        M: Evaluate + ?Sized + 'a,
        I: IntoIterator<Item = (&'a M, &'a [TestCase])>,
    {
        batch
            .into_iter()
            .map(|(model, cases)| self.run(model, cases))
            .collect()
    }

    fn run_case<M: Evaluate + ?Sized>(&self, model: &M, case: &TestCase) -> CaseOutcome {
        let result = catch_unwind(AssertUnwindSafe(|| model.evaluate(&case.inputs)));
        let actual = match result {
            Ok(Ok(actual)) => actual,
            Ok(Err(err)) => {
                return CaseOutcome::Errored {
                    message: err.to_string(),
                }
            }
            Err(panic) => {
                let message = panic
                    .downcast_ref::<&str>()
                    .map(|s| s.to_string())
                    .or_else(|| panic.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "unknown panic".to_string());
                return CaseOutcome::Errored {
                    message: format!("evaluation panicked: {message}"),
                };
            }
        };

        let diverging: Vec<String> = case
            .outputs
            .iter()
            .filter(|(name, expected)| {
                let units = model
                    .symbol_map()
                    .get(*name)
                    .map_or_else(Units::dimensionless, |symbol| symbol.units_or_dimensionless());
                actual
                    .get(*name)
                    .map_or(true, |value| !self.tolerance.matches_in(value, expected, &units))
            })
            .map(|(name, _)| name.clone())
            .collect();

        if diverging.is_empty() {
            CaseOutcome::Passed
        } else {
            CaseOutcome::Mismatch {
                expected: case.outputs.clone(),
                actual,
                diverging,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::test_support::registry;
    use crate::model::{load_custom_model, load_model, Model, ModelDefinition};
    use crate::value::Quantity;

    fn double_band_gap() -> Model {
        let def = ModelDefinition::from_yaml(
            "name: double_band_gap\nequations: [E_d - E_g*2]\nsymbol_property_map: {E_g: band_gap, E_d: band_gap_doubled}\nconnections:\n  - {inputs: [E_g], outputs: [E_d]}\n",
        )
        .unwrap();
        load_model(&def, &registry()).unwrap()
    }

    fn cases(json: &str) -> Vec<TestCase> {
        load_test_cases(json).unwrap()
    }

    #[test]
    fn tolerance_is_relative_plus_absolute() {
        let tolerance = Tolerance::default();
        assert!(tolerance.close(1.0 + 5e-7, 1.0));
        assert!(!tolerance.close(1.0 + 5e-6, 1.0));
        assert!(tolerance.close(5e-10, 0.0));
        assert!(!tolerance.close(5e-9, 0.0));
    }

    #[test]
    fn quantities_compare_after_conversion() {
        let tolerance = Tolerance::default();
        let actual = Value::from(Quantity::parse(1.0, "eV").unwrap());
        let expected = Value::from(Quantity::parse(1000.0, "meV").unwrap());
        assert!(tolerance.matches(&actual, &expected));
        let pressure = Value::from(Quantity::parse(1000.0, "Pa").unwrap());
        assert!(!tolerance.matches(&pressure, &expected));
    }

    #[test]
    fn mixed_numbers_and_quantities_compare_in_symbol_units() {
        let tolerance = Tolerance::default();
        let ev = Units::parse("eV").unwrap().units;
        let expected = Value::from(Quantity::parse(4000.0, "meV").unwrap());
        assert!(tolerance.matches_in(&Value::Number(4.0), &expected, &ev));
        assert!(!tolerance.matches_in(&Value::Number(4000.0), &expected, &ev));
        assert!(tolerance.matches_in(&expected, &Value::Number(4.0), &ev));
        let pressure = Value::from(Quantity::parse(4.0, "GPa").unwrap());
        assert!(!tolerance.matches_in(&Value::Number(4.0), &pressure, &ev));

        let report = TestHarness::default().run(
            &double_band_gap(),
            &cases(
                r#"[{"inputs": {"E_g": 2}, "outputs": {"E_d": {"magnitude": 4000, "units": "meV"}}}]"#,
            ),
        );
        assert_eq!(report.status, Status::Passed);
    }

    #[test]
    fn passing_fixtures() {
        let report = TestHarness::default().run(
            &double_band_gap(),
            &cases(
                r#"[
                    {"inputs": {"E_g": 2}, "outputs": {"E_d": 4}},
                    {"inputs": {"E_g": 5}, "outputs": {"E_d": 10}},
                    {"inputs": {"E_g": {"magnitude": 1500, "units": "meV"}},
                     "outputs": {"E_d": {"magnitude": 3, "units": "eV"}}}
                ]"#,
            ),
        );
        assert_eq!(report.status, Status::Passed);
        assert_eq!(report.passed_count(), 3);
    }

    #[test]
    fn empty_fixture_list_is_untested() {
        let report = TestHarness::default().run(&double_band_gap(), &[]);
        assert_eq!(report.status, Status::Untested);
        assert!(report.cases.is_empty());
    }

    #[test]
    fn mismatch_names_diverging_keys() {
        let report = TestHarness::default().run(
            &double_band_gap(),
            &cases(r#"[{"inputs": {"E_g": 2}, "outputs": {"E_d": 5}}]"#),
        );
        assert_eq!(report.status, Status::Failed);
        match &report.cases[0] {
            CaseOutcome::Mismatch {
                diverging, actual, ..
            } => {
                assert_eq!(diverging, &["E_d"]);
                assert_eq!(actual["E_d"].magnitude(), 4.0);
            }
            other => panic!("expected mismatch, got {other:?}"),
        }
    }

    #[test]
    fn errors_are_reported_per_case() {
        let report = TestHarness::default().run(
            &double_band_gap(),
            &cases(
                r#"[
                    {"inputs": {}, "outputs": {"E_d": 4}},
                    {"inputs": {"E_g": 2}, "outputs": {"E_d": 4}}
                ]"#,
            ),
        );
        assert_eq!(report.status, Status::Failed);
        assert!(matches!(report.cases[0], CaseOutcome::Errored { .. }));
        assert!(report.cases[1].passed());
        assert_eq!(report.failures().count(), 1);
    }

    #[test]
    fn panicking_model_does_not_abort_batch() {
        let def = ModelDefinition::from_yaml(
            "name: faulty\nsymbol_property_map: {K: bulk_modulus}\n",
        )
        .unwrap();
        let faulty = load_custom_model(&def, &registry(), |_| panic!("boom")).unwrap();
        let good = double_band_gap();
        let faulty_cases = cases(r#"[{"inputs": {"K": 1}, "outputs": {"K": 1}}]"#);
        let good_cases = cases(r#"[{"inputs": {"E_g": 2}, "outputs": {"E_d": 4}}]"#);

        let reports = TestHarness::default().run_batch([
            (&faulty, faulty_cases.as_slice()),
            (&good, good_cases.as_slice()),
        ]);
        assert_eq!(reports.len(), 2);
        match &reports[0].cases[0] {
            CaseOutcome::Errored { message } => assert!(message.contains("boom")),
            other => panic!("expected error, got {other:?}"),
        }
        assert_eq!(reports[1].status, Status::Passed);
    }

    #[test]
    fn runs_are_idempotent() {
        let model = double_band_gap();
        let fixtures = cases(r#"[{"inputs": {"E_g": 3}, "outputs": {"E_d": 6}}]"#);
        let harness = TestHarness::new(Tolerance {
            relative: 1e-9,
            absolute: 0.0,
        });
        assert_eq!(harness.run(&model, &fixtures), harness.run(&model, &fixtures));
    }
}
