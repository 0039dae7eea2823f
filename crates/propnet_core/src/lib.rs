//! `propnet_core` declares and evaluates models: named relationships between
//! physical quantities (symbols), given either as equations or as custom
//! evaluation logic, and checks them against test fixtures.
//!
//! Key components:
//! - **Units / Symbols / Registry**: unit parsing with ambiguity warnings,
//!   canonical symbols, and an explicitly constructed read-only registry.
//! - **Equation Engine**: parser, bytecode compiler and stack VM generic over
//!   `Scalar`, so the same code evaluates `f64` residuals and `Dual` Jacobians.
//! - **Solvers**: multi-start damped Newton with a deterministic root policy.
//! - **Model**: `Model = Equation | Custom`, sharing the `Evaluate` trait.
//! - **Harness / Catalog**: fixture runs with per-case diagnostics, and a
//!   directory loader for definition files.
pub mod autodiff;
pub mod catalog;
pub mod equation_engine;
pub mod error;
pub mod harness;
pub mod model;
pub mod registry;
pub mod solvers;
pub mod symbol;
pub mod traits;
pub mod units;
pub mod value;

pub use error::{ModelError, Result};
pub use harness::{load_test_cases, TestCase, TestHarness, TestReport, Tolerance};
pub use model::{load_custom_model, load_model, Evaluate, Model, ModelDefinition};
pub use registry::SymbolRegistry;
pub use symbol::{load_symbol, Symbol, SymbolDefinition};
pub use units::{UnitWarning, Units};
pub use value::{EvaluationInput, EvaluationOutput, Quantity, Value};
