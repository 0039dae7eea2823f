use crate::error::{ModelError, Result};
use crate::symbol::{load_symbol, Symbol, SymbolDefinition};
use std::collections::BTreeMap;

/// Canonical symbols keyed by name.
///
/// Constructed explicitly and passed by reference into model loading; it is
/// read-only once loading is done.
#[derive(Debug, Clone, Default)]
pub struct SymbolRegistry {
    symbols: BTreeMap<String, Symbol>,
}

impl SymbolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds a registry from definitions, failing on the first invalid or
    /// duplicate symbol.
    pub fn from_definitions(
        definitions: impl IntoIterator<Item = SymbolDefinition>,
    ) -> Result<Self> {
        let mut registry = Self::new();
        for definition in definitions {
            registry.insert(load_symbol(definition)?)?;
        }
        Ok(registry)
    }

    pub fn insert(&mut self, symbol: Symbol) -> Result<()> {
        if self.symbols.contains_key(&symbol.name) {
            return Err(ModelError::InvalidSymbol {
                name: symbol.name,
                reason: "already registered".to_string(),
            });
        }
        self.symbols.insert(symbol.name.clone(), symbol);
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<&Symbol> {
        self.symbols.get(name)
    }

    /// Like [`get`](Self::get), but a missing name is an error.
    pub fn resolve(&self, name: &str) -> Result<&Symbol> {
        self.get(name).ok_or_else(|| ModelError::UnknownSymbol {
            name: name.to_string(),
        })
    }

    pub fn len(&self) -> usize {
        self.symbols.len()
    }

    pub fn is_empty(&self) -> bool {
        self.symbols.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Symbol> {
        self.symbols.values()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::symbol::Category;

    fn property(name: &str, units: &str) -> SymbolDefinition {
        serde_yaml::from_str(&format!("name: {name}\ncategory: property\nunits: {units}\n"))
            .unwrap()
    }

    #[test]
    fn resolves_registered_symbols() {
        let registry =
            SymbolRegistry::from_definitions([property("band_gap", "eV"), property("bulk_modulus", "GPa")])
                .unwrap();
        assert_eq!(registry.len(), 2);
        assert_eq!(registry.resolve("band_gap").unwrap().category, Category::Property);
        let names: Vec<_> = registry.iter().map(|s| s.name.as_str()).collect();
        assert_eq!(names, ["band_gap", "bulk_modulus"]);
    }

    #[test]
    fn unknown_symbol_is_an_error() {
        let registry = SymbolRegistry::new();
        assert!(registry.is_empty());
        assert!(matches!(
            registry.resolve("density"),
            Err(ModelError::UnknownSymbol { name }) if name == "density"
        ));
    }

    #[test]
    fn rejects_duplicates() {
        let result =
            SymbolRegistry::from_definitions([property("band_gap", "eV"), property("band_gap", "J")]);
        assert!(matches!(result, Err(ModelError::InvalidSymbol { .. })));
    }
}
