//! Models: named relationships between symbols.
//!
//! A [`Model`] is fixed at construction as either an [`EquationModel`]
//! (solved numerically from equation strings) or a [`CustomModel`]
//! (a caller-supplied routine). Both share [`ModelMetadata`] and implement
//! [`Evaluate`].

pub mod custom;
pub mod definition;
pub mod dimensions;
pub mod equation;

pub use custom::{CustomModel, Routine};
pub use definition::{Connection, ModelDefinition};
pub use equation::EquationModel;

use crate::equation_engine::{parse_constraint, Constraint};
use crate::error::{ModelError, Result};
use crate::registry::SymbolRegistry;
use crate::symbol::{is_identifier, Symbol};
use crate::value::{EvaluationInput, EvaluationOutput, Quantity, Value};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;

/// A citation attached to a model.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "lowercase")]
pub enum Reference {
    /// Raw BibTeX entry, kept verbatim including the leading `@`.
    Bibtex(String),
    Url(String),
    Doi(String),
}

impl Reference {
    pub fn parse(text: &str) -> Result<Self> {
        let text = text.trim();
        if text.starts_with('@') {
            return Ok(Reference::Bibtex(text.to_string()));
        }
        if let Some(url) = text.strip_prefix("url:") {
            return Ok(Reference::Url(url.trim().to_string()));
        }
        if let Some(doi) = text.strip_prefix("doi:") {
            return Ok(Reference::Doi(doi.trim().to_string()));
        }
        Err(ModelError::InvalidReference {
            reference: text.to_string(),
        })
    }
}

impl fmt::Display for Reference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Reference::Bibtex(entry) => write!(f, "{entry}"),
            Reference::Url(url) => write!(f, "url:{url}"),
            Reference::Doi(doi) => write!(f, "doi:{doi}"),
        }
    }
}

/// Everything a model declares apart from how it evaluates.
#[derive(Debug, Clone)]
pub struct ModelMetadata {
    pub name: String,
    pub title: Option<String>,
    pub categories: BTreeSet<String>,
    pub description: String,
    pub references: Vec<Reference>,
    /// Internal variable name -> resolved canonical symbol.
    pub symbol_map: BTreeMap<String, Symbol>,
    pub connections: Vec<Connection>,
    pub constraints: Vec<Constraint>,
    pub solve_for_all_symbols: bool,
    pub scrub_units: bool,
}

/// Inputs converted to the units of their mapped symbols.
#[derive(Debug, Clone, Default)]
pub struct PreparedInputs {
    pub values: BTreeMap<String, f64>,
    /// True when any input carried units.
    pub with_units: bool,
}

impl PreparedInputs {
    pub fn supplied(&self) -> BTreeSet<String> {
        self.values.keys().cloned().collect()
    }
}

impl ModelMetadata {
    /// Validates a definition and resolves its symbols through `registry`.
    /// Equations are handled by the model variants.
    pub fn from_definition(definition: &ModelDefinition, registry: &SymbolRegistry) -> Result<Self> {
        let invalid = |reason: String| ModelError::InvalidModel {
            name: definition.name.clone(),
            reason,
        };

        if !is_identifier(&definition.name) {
            return Err(invalid("name must be a valid identifier".to_string()));
        }
        if definition.symbol_property_map.is_empty() {
            return Err(invalid("symbol_property_map is empty".to_string()));
        }

        let mut symbol_map = BTreeMap::new();
        for (variable, symbol_name) in &definition.symbol_property_map {
            if !is_identifier(variable) {
                return Err(invalid(format!("'{variable}' is not a valid variable name")));
            }
            symbol_map.insert(variable.clone(), registry.resolve(symbol_name)?.clone());
        }

        let declared = |name: &String| -> Result<()> {
            if symbol_map.contains_key(name) {
                Ok(())
            } else {
                Err(ModelError::UnknownVariable { name: name.clone() })
            }
        };

        for connection in &definition.connections {
            if connection.outputs.is_empty() {
                return Err(invalid("connection declares no outputs".to_string()));
            }
            connection.variables().try_for_each(declared)?;
        }

        let constraints = definition
            .constraints
            .iter()
            .map(|text| parse_constraint(text))
            .collect::<Result<Vec<_>>>()?;
        for constraint in &constraints {
            constraint.variables().iter().try_for_each(declared)?;
        }

        let references = definition
            .references
            .iter()
            .map(|text| Reference::parse(text))
            .collect::<Result<Vec<_>>>()?;

        Ok(Self {
            name: definition.name.clone(),
            title: definition.title.clone(),
            categories: definition.categories.iter().cloned().collect(),
            description: definition.description.clone(),
            references,
            symbol_map,
            connections: definition.connections.clone(),
            constraints,
            solve_for_all_symbols: definition.solve_for_all_symbols,
            scrub_units: definition.scrub_units,
        })
    }

    /// Back to a definition document; equations are left to the caller.
    pub fn to_definition(&self) -> ModelDefinition {
        ModelDefinition {
            name: self.name.clone(),
            title: self.title.clone(),
            categories: self.categories.iter().cloned().collect(),
            description: self.description.clone(),
            equations: Vec::new(),
            references: self.references.iter().map(ToString::to_string).collect(),
            symbol_property_map: self
                .symbol_map
                .iter()
                .map(|(variable, symbol)| (variable.clone(), symbol.name.clone()))
                .collect(),
            connections: self.connections.clone(),
            constraints: self.constraints.iter().map(|c| c.source.clone()).collect(),
            solve_for_all_symbols: self.solve_for_all_symbols,
            scrub_units: self.scrub_units,
        }
    }

    /// Checks input keys and converts quantities into symbol units.
    pub fn prepare_inputs(&self, inputs: &EvaluationInput) -> Result<PreparedInputs> {
        let mut prepared = PreparedInputs::default();
        for (name, value) in inputs {
            let symbol = self
                .symbol_map
                .get(name)
                .ok_or_else(|| ModelError::UnknownVariable { name: name.clone() })?;
            let units = symbol.units_or_dimensionless();
            let magnitude = match value {
                Value::Number(n) => *n,
                Value::Quantity(q) => {
                    prepared.with_units = true;
                    if !q.units.is_compatible_with(&units) {
                        return Err(ModelError::DimensionMismatch {
                            context: format!("input '{name}' of model '{}'", self.name),
                            expected: units.dimensions,
                            found: q.units.dimensions,
                        });
                    }
                    q.magnitude_in(&units)?
                }
            };
            symbol.check_constraint(magnitude)?;
            prepared.values.insert(name.clone(), magnitude);
        }
        Ok(prepared)
    }

    /// Checks every constraint whose variables are all known.
    pub fn check_constraints(&self, values: &BTreeMap<String, f64>) -> Result<()> {
        let lookup: HashMap<String, f64> =
            values.iter().map(|(k, v)| (k.clone(), *v)).collect();
        for constraint in &self.constraints {
            if constraint.check(&lookup) == Some(false) {
                return Err(ModelError::ConstraintViolated {
                    constraint: constraint.source.clone(),
                });
            }
        }
        Ok(())
    }

    /// Checks a computed magnitude against its symbol's constraint.
    pub fn check_output(&self, name: &str, magnitude: f64) -> Result<()> {
        match self.symbol_map.get(name) {
            Some(symbol) => symbol.check_constraint(magnitude),
            None => Ok(()),
        }
    }

    /// Wraps a magnitude in symbol units as a plain number or a quantity.
    pub fn output_value(&self, name: &str, magnitude: f64, with_units: bool) -> Value {
        match self.symbol_map.get(name) {
            Some(symbol) if with_units => {
                Value::Quantity(Quantity::new(magnitude, symbol.units_or_dimensionless()))
            }
            _ => Value::Number(magnitude),
        }
    }
}

/// Shared interface of both model variants.
pub trait Evaluate {
    fn metadata(&self) -> &ModelMetadata;

    /// Produces outputs for `inputs`. Pure: no state changes between calls.
    fn evaluate(&self, inputs: &EvaluationInput) -> Result<EvaluationOutput>;

    fn name(&self) -> &str {
        &self.metadata().name
    }

    fn symbol_map(&self) -> &BTreeMap<String, Symbol> {
        &self.metadata().symbol_map
    }

    fn connections(&self) -> &[Connection] {
        &self.metadata().connections
    }
}

/// A model, fixed at construction as equation-based or custom.
#[derive(Debug, Clone)]
pub enum Model {
    Equation(EquationModel),
    Custom(CustomModel),
}

impl Model {
    fn inner(&self) -> &dyn Evaluate {
        match self {
            Model::Equation(model) => model,
            Model::Custom(model) => model,
        }
    }

    /// Definition document for this model. Custom models round-trip
    /// without their routine.
    pub fn to_definition(&self) -> ModelDefinition {
        match self {
            Model::Equation(model) => model.to_definition(),
            Model::Custom(model) => model.metadata().to_definition(),
        }
    }

    pub fn to_yaml(&self) -> Result<String> {
        self.to_definition().to_yaml()
    }
}

impl Evaluate for Model {
    fn metadata(&self) -> &ModelMetadata {
        self.inner().metadata()
    }

    fn evaluate(&self, inputs: &EvaluationInput) -> Result<EvaluationOutput> {
        self.inner().evaluate(inputs)
    }
}

impl From<EquationModel> for Model {
    fn from(model: EquationModel) -> Self {
        Model::Equation(model)
    }
}

impl From<CustomModel> for Model {
    fn from(model: CustomModel) -> Self {
        Model::Custom(model)
    }
}

/// Builds an equation model. Definitions without equations need a routine
/// and go through [`load_custom_model`].
pub fn load_model(definition: &ModelDefinition, registry: &SymbolRegistry) -> Result<Model> {
    if definition.equations.is_empty() {
        return Err(ModelError::InvalidModel {
            name: definition.name.clone(),
            reason: "no equations; custom models need an evaluation routine".to_string(),
        });
    }
    let metadata = ModelMetadata::from_definition(definition, registry)?;
    Ok(EquationModel::new(metadata, &definition.equations)?.into())
}

/// Builds a custom model evaluated by `routine`.
pub fn load_custom_model<F>(
    definition: &ModelDefinition,
    registry: &SymbolRegistry,
    routine: F,
) -> Result<Model>
where
    F: Fn(&EvaluationInput) -> Result<EvaluationOutput> + Send + Sync + 'static,
{
    if !definition.equations.is_empty() {
        return Err(ModelError::InvalidModel {
            name: definition.name.clone(),
            reason: "defines both equations and an evaluation routine".to_string(),
        });
    }
    let metadata = ModelMetadata::from_definition(definition, registry)?;
    Ok(CustomModel::new(metadata, routine).into())
}
