use crate::equation_engine::{parse_constraint, Constraint};
use crate::error::{ModelError, Result};
use crate::units::{UnitWarning, Units};
use std::collections::HashMap;
use serde::{Deserialize, Serialize};
use tracing::warn;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Category {
    /// A measurable material property (band gap, bulk modulus).
    Property,
    /// An environmental condition (temperature, pressure).
    Condition,
    /// A non-numeric object such as a structure; carries no units.
    Object,
}

/// Scalar, or a tensor with the given dimensions.
///
/// Serialized as `1` for scalars and as a list of dimensions otherwise; a
/// bare integer `n > 1` reads as a vector of length `n`.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(into = "ShapeRepr", try_from = "ShapeRepr")]
pub enum Shape {
    #[default]
    Scalar,
    Tensor(Vec<usize>),
}

#[derive(Serialize, Deserialize)]
#[serde(untagged)]
enum ShapeRepr {
    Size(usize),
    Dims(Vec<usize>),
}

impl From<Shape> for ShapeRepr {
    fn from(shape: Shape) -> Self {
        match shape {
            Shape::Scalar => ShapeRepr::Size(1),
            Shape::Tensor(dims) => ShapeRepr::Dims(dims),
        }
    }
}

impl TryFrom<ShapeRepr> for Shape {
    type Error = String;

    fn try_from(repr: ShapeRepr) -> std::result::Result<Self, String> {
        match repr {
            ShapeRepr::Size(0) => Err("shape must be positive".to_string()),
            ShapeRepr::Size(1) => Ok(Shape::Scalar),
            ShapeRepr::Size(n) => Ok(Shape::Tensor(vec![n])),
            ShapeRepr::Dims(dims) if dims.is_empty() || dims.contains(&0) => {
                Err(format!("invalid tensor dimensions {dims:?}"))
            }
            ShapeRepr::Dims(dims) => Ok(Shape::Tensor(dims)),
        }
    }
}

/// Units as written in a symbol definition file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum UnitsDefinition {
    /// Free text such as `"GPa"`; parsed, with warnings.
    Text(String),
    /// Explicit dimensions and scale.
    Structured(Units),
}

/// Raw symbol definition document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SymbolDefinition {
    pub name: String,
    pub category: Category,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub units: Option<UnitsDefinition>,
    #[serde(default)]
    pub shape: Shape,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub object_type: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub display_names: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub display_symbols: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub comment: Option<String>,
    /// Inequality over the symbol's own name, e.g. `bulk_modulus >= 0`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub constraint: Option<String>,
}

/// A canonical named quantity. Built once, then shared read-only through a
/// [`SymbolRegistry`](crate::registry::SymbolRegistry).
#[derive(Debug, Clone, PartialEq)]
pub struct Symbol {
    pub name: String,
    pub category: Category,
    /// `None` exactly when the category is [`Category::Object`].
    pub units: Option<Units>,
    pub shape: Shape,
    pub object_type: Option<String>,
    pub display_names: Vec<String>,
    pub display_symbols: Vec<String>,
    pub comment: Option<String>,
    /// Checked against values in the symbol's units.
    pub constraint: Option<Constraint>,
}

pub fn is_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(first) if first.is_alphabetic() || first == '_' => {
            chars.all(|c| c.is_alphanumeric() || c == '_')
        }
        _ => false,
    }
}

impl Symbol {
    /// Validates a definition and resolves its units.
    /// Unit warnings are returned to the caller, not raised.
    pub fn build(definition: SymbolDefinition) -> Result<(Symbol, Vec<UnitWarning>)> {
        let SymbolDefinition {
            name,
            category,
            units,
            shape,
            object_type,
            display_names,
            display_symbols,
            comment,
            constraint,
        } = definition;

        let invalid = |reason: &str| ModelError::InvalidSymbol {
            name: name.clone(),
            reason: reason.to_string(),
        };

        if !is_identifier(&name) {
            return Err(invalid("name must be a valid identifier"));
        }
        if let Shape::Tensor(dims) = &shape {
            if dims.is_empty() || dims.contains(&0) {
                return Err(invalid("tensor dimensions must be positive"));
            }
        }

        let mut warnings = Vec::new();
        let units = match (category, units) {
            (Category::Object, Some(_)) => {
                return Err(invalid("object symbols cannot carry units"));
            }
            (Category::Object, None) => None,
            (_, None) => Some(Units::dimensionless()),
            (_, Some(UnitsDefinition::Structured(units))) => Some(units),
            (_, Some(UnitsDefinition::Text(text))) => {
                let parsed = Units::parse(&text)?;
                warnings.extend(parsed.warnings);
                Some(parsed.units)
            }
        };
        if object_type.is_some() && category != Category::Object {
            return Err(invalid("object_type is only valid for object symbols"));
        }

        let constraint = match constraint {
            Some(_) if category == Category::Object => {
                return Err(invalid("object symbols cannot carry constraints"));
            }
            Some(text) => {
                let parsed = parse_constraint(&text)?;
                if parsed.variables().iter().any(|variable| *variable != name) {
                    return Err(invalid("constraint may only reference the symbol itself"));
                }
                Some(parsed)
            }
            None => None,
        };

        let symbol = Symbol {
            name,
            category,
            units,
            shape,
            object_type,
            display_names,
            display_symbols,
            comment,
            constraint,
        };
        Ok((symbol, warnings))
    }

    /// Units for numeric work; objects count as dimensionless.
    pub fn units_or_dimensionless(&self) -> Units {
        self.units.clone().unwrap_or_else(Units::dimensionless)
    }

    /// Checks `magnitude`, given in the symbol's units, against the symbol's
    /// constraint.
    pub fn check_constraint(&self, magnitude: f64) -> Result<()> {
        let Some(constraint) = &self.constraint else {
            return Ok(());
        };
        let values = HashMap::from([(self.name.clone(), magnitude)]);
        if constraint.check(&values) == Some(false) {
            return Err(ModelError::SymbolConstraint {
                symbol: self.name.clone(),
                constraint: constraint.source.clone(),
                value: magnitude,
            });
        }
        Ok(())
    }

    /// Definition with structured units, the form that round-trips.
    pub fn to_definition(&self) -> SymbolDefinition {
        SymbolDefinition {
            name: self.name.clone(),
            category: self.category,
            units: self.units.clone().map(UnitsDefinition::Structured),
            shape: self.shape.clone(),
            object_type: self.object_type.clone(),
            display_names: self.display_names.clone(),
            display_symbols: self.display_symbols.clone(),
            comment: self.comment.clone(),
            constraint: self.constraint.as_ref().map(|c| c.source.clone()),
        }
    }

    pub fn to_yaml(&self) -> Result<String> {
        Ok(serde_yaml::to_string(&self.to_definition())?)
    }

    pub fn from_yaml(text: &str) -> Result<Symbol> {
        let definition: SymbolDefinition = serde_yaml::from_str(text)?;
        load_symbol(definition)
    }
}

/// Builds a symbol, logging any unit warnings.
pub fn load_symbol(definition: SymbolDefinition) -> Result<Symbol> {
    let (symbol, warnings) = Symbol::build(definition)?;
    for warning in &warnings {
        warn!(symbol = %symbol.name, "{warning}");
    }
    Ok(symbol)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::units::Dimensions;
    use proptest::prelude::*;

    fn definition(yaml: &str) -> SymbolDefinition {
        serde_yaml::from_str(yaml).expect("definition should deserialize")
    }

    #[test]
    fn builds_property_with_text_units() {
        let (symbol, warnings) = Symbol::build(definition(
            "name: bulk_modulus\ncategory: property\nunits: GPa\ndisplay_names: [Bulk modulus]\ndisplay_symbols: [K]\n",
        ))
        .unwrap();
        assert_eq!(symbol.category, Category::Property);
        assert_eq!(symbol.units.as_ref().unwrap().scale, 1e9);
        assert_eq!(symbol.shape, Shape::Scalar);
        assert!(matches!(
            warnings.as_slice(),
            [UnitWarning::InferredFromText { .. }]
        ));
    }

    #[test]
    fn structured_units_do_not_warn() {
        let (symbol, warnings) = Symbol::build(definition(
            "name: temperature\ncategory: condition\nunits:\n  dimensions: {temperature: 1}\n  scale: 1.0\n",
        ))
        .unwrap();
        assert!(warnings.is_empty());
        assert_eq!(symbol.units.unwrap().dimensions.temperature, 1);
    }

    #[test]
    fn missing_units_default_to_dimensionless() {
        let symbol = load_symbol(definition("name: poisson_ratio\ncategory: property\n")).unwrap();
        assert!(symbol.units.unwrap().is_dimensionless());
    }

    #[test]
    fn ambiguous_units_warn_but_build() {
        let (symbol, warnings) =
            Symbol::build(definition("name: lifetime\ncategory: property\nunits: ms\n")).unwrap();
        assert_eq!(symbol.units.unwrap().dimensions, Dimensions {
            time: 1,
            ..Dimensions::DIMENSIONLESS
        });
        assert!(warnings
            .iter()
            .any(|w| matches!(w, UnitWarning::Ambiguous { token, .. } if token == "ms")));
    }

    #[test]
    fn rejects_invalid_definitions() {
        let cases = [
            "name: 2theta\ncategory: property\n",
            "name: structure\ncategory: object\nunits: m\n",
            "name: foo\ncategory: property\nunits: furlongs\n",
            "name: foo\ncategory: property\nobject_type: Structure\n",
        ];
        for yaml in cases {
            assert!(Symbol::build(definition(yaml)).is_err(), "{yaml}");
        }
        assert!(serde_yaml::from_str::<SymbolDefinition>(
            "name: foo\ncategory: property\nshape: [3, 0]\n"
        )
        .is_err());
    }

    #[test]
    fn constraint_bounds_values() {
        let symbol = load_symbol(definition(
            "name: bulk_modulus\ncategory: property\nunits: GPa\nconstraint: bulk_modulus >= 0\n",
        ))
        .unwrap();
        assert!(symbol.check_constraint(100.0).is_ok());
        assert!(symbol.check_constraint(0.0).is_ok());
        match symbol.check_constraint(-500.0) {
            Err(ModelError::SymbolConstraint {
                symbol, value, ..
            }) => {
                assert_eq!(symbol, "bulk_modulus");
                assert_eq!(value, -500.0);
            }
            other => panic!("expected SymbolConstraint, got {other:?}"),
        }

        let restored = Symbol::from_yaml(&symbol.to_yaml().unwrap()).unwrap();
        assert_eq!(restored, symbol);
    }

    #[test]
    fn constraint_must_reference_only_the_symbol() {
        let cases = [
            "name: A\ncategory: property\nconstraint: B > 0\n",
            "name: structure\ncategory: object\nobject_type: Structure\nconstraint: structure > 0\n",
        ];
        for yaml in cases {
            assert!(
                matches!(Symbol::build(definition(yaml)), Err(ModelError::InvalidSymbol { .. })),
                "{yaml}"
            );
        }
        assert!(matches!(
            Symbol::build(definition("name: A\ncategory: property\nconstraint: A +\n")),
            Err(ModelError::Parse { .. })
        ));
    }

    #[test]
    fn overflowing_unit_exponents_are_invalid_units() {
        let result = Symbol::build(definition(
            "name: absurd\ncategory: property\nunits: m^100 m^100\n",
        ));
        assert!(matches!(result, Err(ModelError::InvalidUnits { .. })));
    }

    #[test]
    fn shape_forms() {
        let def = definition("name: stiffness\ncategory: property\nunits: GPa\nshape: [6, 6]\n");
        assert_eq!(def.shape, Shape::Tensor(vec![6, 6]));
        let def = definition("name: lattice\ncategory: property\nunits: Å\nshape: 3\n");
        assert_eq!(def.shape, Shape::Tensor(vec![3]));
        let def = definition("name: gap\ncategory: property\nshape: 1\n");
        assert_eq!(def.shape, Shape::Scalar);
    }

    #[test]
    fn object_symbols_have_no_units() {
        let symbol = load_symbol(definition(
            "name: structure\ncategory: object\nobject_type: Structure\n",
        ))
        .unwrap();
        assert!(symbol.units.is_none());
        assert!(symbol.units_or_dimensionless().is_dimensionless());
    }

    fn arb_symbol() -> impl Strategy<Value = Symbol> {
        let units = prop::sample::select(vec!["eV", "GPa", "g/cm^3", "W/(m*K)", "1/K", "ms", ""]);
        let text = "[A-Z][a-z]{2,8} [a-z]{1,8}";
        let shape = prop_oneof![
            Just(Shape::Scalar),
            prop::collection::vec(1usize..10, 1..3).prop_map(Shape::Tensor),
        ];
        (
            "[a-z_][a-z0-9_]{0,12}",
            prop::sample::select(vec![Category::Property, Category::Condition, Category::Object]),
            units,
            shape,
            prop::collection::vec(text, 0..3),
            prop::collection::vec("[A-Za-z]{1,3}", 0..3),
            prop::option::of(text),
        )
            .prop_map(
                |(name, category, units, shape, display_names, display_symbols, comment)| {
                    let is_object = category == Category::Object;
                    let definition = SymbolDefinition {
                        name,
                        category,
                        units: (!is_object).then(|| UnitsDefinition::Text(units.to_string())),
                        shape,
                        object_type: is_object.then(|| "Structure".to_string()),
                        display_names,
                        display_symbols,
                        comment,
                        constraint: None,
                    };
                    Symbol::build(definition).expect("generated symbol is valid").0
                },
            )
    }

    proptest! {
        #[test]
        fn yaml_round_trip(symbol in arb_symbol()) {
            let yaml = symbol.to_yaml().unwrap();
            let restored = Symbol::from_yaml(&yaml).unwrap();
            prop_assert_eq!(restored, symbol);
        }
    }
}
