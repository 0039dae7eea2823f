//! Directory loader for symbol and model definition files.
//!
//! Symbols are read from `*.yaml` files in one directory, models from
//! `*.yaml` files in another. A model's fixtures live next to its definition
//! as `<stem>.json`. Definitions without equations are held back until a
//! routine is attached with [`Catalog::attach_routine`].

use crate::error::Result as ModelResult;
use crate::harness::{load_test_cases, TestCase, TestHarness, TestReport};
use crate::model::{load_custom_model, load_model, Evaluate, Model, ModelDefinition};
use crate::registry::SymbolRegistry;
use crate::symbol::SymbolDefinition;
use crate::value::{EvaluationInput, EvaluationOutput};
use anyhow::{anyhow, bail, Context, Result};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

#[derive(Debug, Clone)]
pub struct CatalogEntry {
    pub model: Model,
    pub cases: Vec<TestCase>,
}

#[derive(Debug, Default)]
pub struct Catalog {
    pub registry: SymbolRegistry,
    pub models: BTreeMap<String, CatalogEntry>,
    /// Custom-logic definitions waiting for a routine, with their fixtures.
    pending: BTreeMap<String, (ModelDefinition, Vec<TestCase>)>,
}

impl Catalog {
    pub fn load_dir(symbols_dir: impl AsRef<Path>, models_dir: impl AsRef<Path>) -> Result<Self> {
        let mut catalog = Catalog::default();

        for path in yaml_files(symbols_dir.as_ref())? {
            let text = read(&path)?;
            let definition: SymbolDefinition = serde_yaml::from_str(&text)
                .with_context(|| format!("Failed to parse symbol file {}", path.display()))?;
            let symbol = crate::symbol::load_symbol(definition)
                .with_context(|| format!("Invalid symbol in {}", path.display()))?;
            catalog
                .registry
                .insert(symbol)
                .with_context(|| format!("Failed to register symbol from {}", path.display()))?;
        }

        for path in yaml_files(models_dir.as_ref())? {
            let text = read(&path)?;
            let definition = ModelDefinition::from_yaml(&text)
                .with_context(|| format!("Failed to parse model file {}", path.display()))?;
            let cases = read_cases(&path.with_extension("json"))?;
            if catalog.models.contains_key(&definition.name)
                || catalog.pending.contains_key(&definition.name)
            {
                bail!("Duplicate model '{}' in {}", definition.name, path.display());
            }

            if definition.equations.is_empty() {
                warn!(
                    model = %definition.name,
                    "no equations; waiting for an evaluation routine"
                );
                catalog
                    .pending
                    .insert(definition.name.clone(), (definition, cases));
                continue;
            }
            let model = load_model(&definition, &catalog.registry)
                .with_context(|| format!("Invalid model in {}", path.display()))?;
            catalog
                .models
                .insert(definition.name.clone(), CatalogEntry { model, cases });
        }

        info!(
            symbols = catalog.registry.len(),
            models = catalog.models.len(),
            pending = catalog.pending.len(),
            "catalog loaded"
        );
        Ok(catalog)
    }

    pub fn get(&self, name: &str) -> Option<&CatalogEntry> {
        self.models.get(name)
    }

    /// Names of custom-logic models that still need a routine.
    pub fn pending(&self) -> impl Iterator<Item = &str> {
        self.pending.keys().map(String::as_str)
    }

    /// Completes a custom-logic model loaded from disk.
    pub fn attach_routine<F>(&mut self, name: &str, routine: F) -> Result<()>
    where
        F: Fn(&EvaluationInput) -> ModelResult<EvaluationOutput> + Send + Sync + 'static,
    {
        let (definition, cases) = self
            .pending
            .remove(name)
            .ok_or_else(|| anyhow!("No custom model named '{name}' is waiting for a routine"))?;
        let model = load_custom_model(&definition, &self.registry, routine)
            .with_context(|| format!("Invalid custom model '{name}'"))?;
        self.models
            .insert(name.to_string(), CatalogEntry { model, cases });
        Ok(())
    }

    /// Runs every loaded model against its fixtures.
    pub fn run_tests(&self, harness: &TestHarness) -> Vec<TestReport> {
        harness.run_batch(
            self.models
                .values()
                .map(|entry| (&entry.model, entry.cases.as_slice())),
        )
    }

    pub fn models(&self) -> impl Iterator<Item = &Model> {
        self.models.values().map(|entry| &entry.model)
    }

    pub fn model_names(&self) -> impl Iterator<Item = &str> {
        self.models().map(|model| model.name())
    }
}

fn read(path: &Path) -> Result<String> {
    fs::read_to_string(path).with_context(|| format!("Failed to read {}", path.display()))
}

fn read_cases(path: &Path) -> Result<Vec<TestCase>> {
    if !path.exists() {
        return Ok(Vec::new());
    }
    let text = read(path)?;
    load_test_cases(&text).with_context(|| format!("Failed to parse test data {}", path.display()))
}

fn yaml_files(dir: &Path) -> Result<Vec<PathBuf>> {
    let entries = fs::read_dir(dir)
        .with_context(|| format!("Failed to list directory {}", dir.display()))?;
    let mut files = Vec::new();
    for entry in entries {
        let path = entry?.path();
        let is_yaml = path
            .extension()
            .and_then(|ext| ext.to_str())
            .is_some_and(|ext| ext == "yaml" || ext == "yml");
        if path.is_file() && is_yaml {
            files.push(path);
        }
    }
    files.sort();
    Ok(files)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::harness::Status;
    use crate::value::Value;
    use std::fs;

    fn write(dir: &Path, name: &str, contents: &str) {
        fs::write(dir.join(name), contents).unwrap();
    }

    fn fixture_dirs() -> (tempfile::TempDir, PathBuf, PathBuf) {
        let root = tempfile::tempdir().unwrap();
        let symbols = root.path().join("symbols");
        let models = root.path().join("models");
        fs::create_dir_all(&symbols).unwrap();
        fs::create_dir_all(&models).unwrap();
        write(&symbols, "bulk_modulus.yaml", "name: bulk_modulus\ncategory: property\nunits: GPa\n");
        write(&symbols, "shear_modulus.yaml", "name: shear_modulus\ncategory: property\nunits: GPa\n");
        write(&symbols, "pugh_ratio.yaml", "name: pugh_ratio\ncategory: property\n");
        write(&symbols, "README.md", "not a symbol");
        (root, symbols, models)
    }

    #[test]
    fn loads_models_with_fixtures() {
        let (_root, symbols, models) = fixture_dirs();
        write(
            &models,
            "pugh.yaml",
            "name: pugh\nequations: [p - K/G]\nsymbol_property_map: {p: pugh_ratio, K: bulk_modulus, G: shear_modulus}\nconnections:\n  - {inputs: [K, G], outputs: [p]}\n",
        );
        write(
            &models,
            "pugh.json",
            r#"[{"inputs": {"K": 150, "G": 60}, "outputs": {"p": 2.5}}]"#,
        );

        let catalog = Catalog::load_dir(&symbols, &models).unwrap();
        assert_eq!(catalog.registry.len(), 3);
        assert_eq!(catalog.model_names().collect::<Vec<_>>(), ["pugh"]);
        assert_eq!(catalog.get("pugh").unwrap().cases.len(), 1);

        let reports = catalog.run_tests(&TestHarness::default());
        assert_eq!(reports[0].status, Status::Passed);
    }

    #[test]
    fn custom_models_wait_for_a_routine() {
        let (_root, symbols, models) = fixture_dirs();
        write(
            &models,
            "pugh_custom.yaml",
            "name: pugh_custom\nsymbol_property_map: {p: pugh_ratio, K: bulk_modulus, G: shear_modulus}\n",
        );
        let mut catalog = Catalog::load_dir(&symbols, &models).unwrap();
        assert!(catalog.get("pugh_custom").is_none());
        assert_eq!(catalog.pending().collect::<Vec<_>>(), ["pugh_custom"]);

        catalog
            .attach_routine("pugh_custom", |inputs| {
                let ratio = inputs["K"].magnitude() / inputs["G"].magnitude();
                Ok([("p".to_string(), Value::Number(ratio))].into())
            })
            .unwrap();
        let reports = catalog.run_tests(&TestHarness::default());
        assert_eq!(reports[0].status, Status::Untested);
        assert!(catalog.attach_routine("pugh_custom", |_| Ok(EvaluationOutput::new())).is_err());
    }

    #[test]
    fn reports_file_context_on_errors() {
        let (_root, symbols, models) = fixture_dirs();
        write(
            &models,
            "broken.yaml",
            "name: broken\nequations: [p - missing]\nsymbol_property_map: {p: pugh_ratio}\n",
        );
        let err = Catalog::load_dir(&symbols, &models).unwrap_err();
        assert!(format!("{err:#}").contains("broken.yaml"));
    }
}
