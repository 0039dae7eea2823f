use crate::error::Result;
use serde::{Deserialize, Deserializer, Serialize};
use std::collections::{BTreeMap, BTreeSet};

/// Declared input/output split for one way of invoking a model.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Connection {
    pub inputs: BTreeSet<String>,
    pub outputs: BTreeSet<String>,
}

impl Connection {
    pub fn new<I, O>(inputs: I, outputs: O) -> Self
    where
        I: IntoIterator,
        I::Item: Into<String>,
        O: IntoIterator,
        O::Item: Into<String>,
    {
        Self {
            inputs: inputs.into_iter().map(Into::into).collect(),
            outputs: outputs.into_iter().map(Into::into).collect(),
        }
    }

    /// Declared inputs absent from `supplied`.
    pub fn missing_inputs(&self, supplied: &BTreeSet<String>) -> BTreeSet<String> {
        self.inputs.difference(supplied).cloned().collect()
    }

    pub fn applies_to(&self, supplied: &BTreeSet<String>) -> bool {
        self.inputs.is_subset(supplied)
    }

    pub fn variables(&self) -> impl Iterator<Item = &String> {
        self.inputs.iter().chain(&self.outputs)
    }
}

/// Model definition document, as read from a YAML file.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ModelDefinition {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(
        default,
        alias = "category",
        deserialize_with = "one_or_many",
        skip_serializing_if = "Vec::is_empty"
    )]
    pub categories: Vec<String>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub description: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub equations: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub references: Vec<String>,
    /// Internal variable name -> canonical symbol name.
    pub symbol_property_map: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub connections: Vec<Connection>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub constraints: Vec<String>,
    #[serde(default)]
    pub solve_for_all_symbols: bool,
    #[serde(default)]
    pub scrub_units: bool,
}

impl ModelDefinition {
    pub fn from_yaml(text: &str) -> Result<Self> {
        Ok(serde_yaml::from_str(text)?)
    }

    pub fn to_yaml(&self) -> Result<String> {
        Ok(serde_yaml::to_string(self)?)
    }
}

fn one_or_many<'de, D>(deserializer: D) -> std::result::Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum OneOrMany {
        One(String),
        Many(Vec<String>),
    }

    Ok(match OneOrMany::deserialize(deserializer)? {
        OneOrMany::One(single) => vec![single],
        OneOrMany::Many(many) => many,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    const DOUBLE_BAND_GAP: &str = r#"
name: double_band_gap
title: Doubled band gap
category: electronic
description: Toy model doubling a band gap.
equations:
  - E_d - E_g*2
references:
  - "doi:10.1103/PhysRevB.1.1"
symbol_property_map:
  E_g: band_gap
  E_d: band_gap_doubled
connections:
  - inputs: [E_g]
    outputs: [E_d]
constraints:
  - E_g >= 0
"#;

    #[test]
    fn reads_single_category_and_defaults() {
        let def = ModelDefinition::from_yaml(DOUBLE_BAND_GAP).unwrap();
        assert_eq!(def.categories, ["electronic"]);
        assert_eq!(def.equations, ["E_d - E_g*2"]);
        assert_eq!(def.connections, [Connection::new(["E_g"], ["E_d"])]);
        assert!(!def.solve_for_all_symbols);
        assert!(!def.scrub_units);
    }

    #[test]
    fn yaml_round_trip() {
        let def = ModelDefinition::from_yaml(DOUBLE_BAND_GAP).unwrap();
        let again = ModelDefinition::from_yaml(&def.to_yaml().unwrap()).unwrap();
        assert_eq!(again, def);
    }

    #[test]
    fn connection_applicability() {
        let connection = Connection::new(["K", "G"], ["pugh"]);
        let supplied: BTreeSet<String> = ["K".to_string()].into();
        assert!(!connection.applies_to(&supplied));
        assert_eq!(connection.missing_inputs(&supplied), ["G".to_string()].into());
    }
}
