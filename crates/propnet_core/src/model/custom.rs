use super::{Evaluate, ModelMetadata};
use crate::error::{ModelError, Result};
use crate::value::{EvaluationInput, EvaluationOutput, Value};
use std::fmt;
use std::sync::Arc;
use tracing::debug;

/// Caller-supplied evaluation logic. Must be pure and deterministic.
pub type Routine = Arc<dyn Fn(&EvaluationInput) -> Result<EvaluationOutput> + Send + Sync>;

/// A model evaluated by a routine chosen at construction.
///
/// The routine receives inputs already converted to the units of their
/// symbols. Its output may only use declared variable names; quantities it
/// returns are converted back into symbol units.
#[derive(Clone)]
pub struct CustomModel {
    metadata: ModelMetadata,
    routine: Routine,
}

impl CustomModel {
    pub fn new<F>(metadata: ModelMetadata, routine: F) -> Self
    where
        F: Fn(&EvaluationInput) -> Result<EvaluationOutput> + Send + Sync + 'static,
    {
        Self {
            metadata,
            routine: Arc::new(routine),
        }
    }
}

impl fmt::Debug for CustomModel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CustomModel")
            .field("metadata", &self.metadata)
            .finish_non_exhaustive()
    }
}

impl Evaluate for CustomModel {
    fn metadata(&self) -> &ModelMetadata {
        &self.metadata
    }

    fn evaluate(&self, inputs: &EvaluationInput) -> Result<EvaluationOutput> {
        let prepared = self.metadata.prepare_inputs(inputs)?;
        self.metadata.check_constraints(&prepared.values)?;

        let normalized: EvaluationInput = prepared
            .values
            .iter()
            .map(|(name, magnitude)| {
                let value = self.metadata.output_value(name, *magnitude, prepared.with_units);
                (name.clone(), value)
            })
            .collect();
        let raw = (self.routine)(&normalized)?;

        let unexpected: Vec<String> = raw
            .keys()
            .filter(|key| !self.metadata.symbol_map.contains_key(*key))
            .cloned()
            .collect();
        if !unexpected.is_empty() {
            return Err(ModelError::UnexpectedOutput { keys: unexpected });
        }

        let mut outputs = EvaluationOutput::new();
        for (name, value) in raw {
            let units = self.metadata.symbol_map[&name].units_or_dimensionless();
            let magnitude = match &value {
                Value::Number(n) => *n,
                Value::Quantity(q) => {
                    if !q.units.is_compatible_with(&units) {
                        return Err(ModelError::DimensionMismatch {
                            context: format!("output '{name}' of model '{}'", self.metadata.name),
                            expected: units.dimensions,
                            found: q.units.dimensions,
                        });
                    }
                    q.magnitude_in(&units)?
                }
            };
            self.metadata.check_output(&name, magnitude)?;
            let with_units = prepared.with_units || value.is_quantity();
            let value = self.metadata.output_value(&name, magnitude, with_units);
            outputs.insert(name, value);
        }
        debug!(model = %self.metadata.name, outputs = outputs.len(), "custom evaluation");
        Ok(outputs)
    }
}

#[cfg(test)]
mod tests {
    use super::super::test_support::registry;
    use super::super::{load_custom_model, Model, ModelDefinition};
    use super::*;
    use crate::value::Quantity;
    use approx::assert_relative_eq;

    fn pugh_model() -> Model {
        let def = ModelDefinition::from_yaml(
            "name: pugh_custom\nsymbol_property_map: {K: bulk_modulus, G: shear_modulus, pugh: pugh_ratio}\nconnections:\n  - {inputs: [K, G], outputs: [pugh]}\nconstraints: [G > 0]\n",
        )
        .unwrap();
        load_custom_model(&def, &registry(), |inputs| {
            let k = inputs["K"].magnitude();
            let g = inputs["G"].magnitude();
            Ok([("pugh".to_string(), Value::Number(k / g))].into())
        })
        .unwrap()
    }

    #[test]
    fn evaluates_routine_with_numbers() {
        let inputs: EvaluationInput = [
            ("K".to_string(), Value::Number(150.0)),
            ("G".to_string(), Value::Number(60.0)),
        ]
        .into();
        let out = pugh_model().evaluate(&inputs).unwrap();
        assert_eq!(out["pugh"], Value::Number(2.5));
    }

    #[test]
    fn routine_sees_inputs_in_symbol_units() {
        let inputs: EvaluationInput = [
            ("K".to_string(), Quantity::parse(150e9, "Pa").unwrap().into()),
            ("G".to_string(), Quantity::parse(60.0, "GPa").unwrap().into()),
        ]
        .into();
        let out = pugh_model().evaluate(&inputs).unwrap();
        let pugh = &out["pugh"];
        assert!(pugh.is_quantity());
        assert_relative_eq!(pugh.magnitude(), 2.5, max_relative = 1e-12);
    }

    #[test]
    fn undeclared_output_key_is_rejected() {
        let def = ModelDefinition::from_yaml(
            "name: leaky\nsymbol_property_map: {K: bulk_modulus}\n",
        )
        .unwrap();
        let model = load_custom_model(&def, &registry(), |_| {
            Ok([("secret".to_string(), Value::Number(1.0))].into())
        })
        .unwrap();
        let inputs: EvaluationInput = [("K".to_string(), Value::Number(1.0))].into();
        match model.evaluate(&inputs) {
            Err(ModelError::UnexpectedOutput { keys }) => assert_eq!(keys, ["secret"]),
            other => panic!("expected UnexpectedOutput, got {other:?}"),
        }
    }

    #[test]
    fn constraints_run_before_routine() {
        let inputs: EvaluationInput = [
            ("K".to_string(), Value::Number(150.0)),
            ("G".to_string(), Value::Number(-1.0)),
        ]
        .into();
        assert!(matches!(
            pugh_model().evaluate(&inputs),
            Err(ModelError::ConstraintViolated { .. })
        ));
    }

    #[test]
    fn routine_output_is_checked_against_symbol_constraints() {
        let def = ModelDefinition::from_yaml(
            "name: negative_modulus\nsymbol_property_map: {K: bulk_modulus, G: shear_modulus}\nconnections:\n  - {inputs: [G], outputs: [K]}\n",
        )
        .unwrap();
        let model = load_custom_model(&def, &registry(), |inputs| {
            Ok([("K".to_string(), Value::Number(-inputs["G"].magnitude()))].into())
        })
        .unwrap();
        let inputs: EvaluationInput = [("G".to_string(), Value::Number(60.0))].into();
        assert!(matches!(
            model.evaluate(&inputs),
            Err(ModelError::SymbolConstraint { .. })
        ));
    }

    #[test]
    fn incompatible_input_units_are_rejected() {
        let inputs: EvaluationInput = [
            ("K".to_string(), Quantity::parse(1.0, "eV").unwrap().into()),
            ("G".to_string(), Value::Number(1.0)),
        ]
        .into();
        assert!(matches!(
            pugh_model().evaluate(&inputs),
            Err(ModelError::DimensionMismatch { .. })
        ));
    }
}
