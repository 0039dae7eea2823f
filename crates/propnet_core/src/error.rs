use crate::units::Dimensions;
use thiserror::Error;

pub type Result<T, E = ModelError> = std::result::Result<T, E>;

/// Everything that can go wrong while loading or evaluating a model.
///
/// All variants are recoverable per model / per test case; the test harness
/// turns them into failed cases rather than aborting a batch.
#[derive(Debug, Error)]
pub enum ModelError {
    #[error("invalid units '{units}': {reason}")]
    InvalidUnits { units: String, reason: String },

    #[error(
        "underdetermined system: cannot resolve [{}] (missing inputs: [{}])",
        .unresolved.join(", "),
        .missing.join(", ")
    )]
    Underdetermined {
        unresolved: Vec<String>,
        missing: Vec<String>,
    },

    #[error("inconsistent system: [{}] has residual {residual:e}", .equations.join("; "))]
    InconsistentSystem { equations: Vec<String>, residual: f64 },

    #[error("dimension mismatch in {context}: expected {expected}, found {found}")]
    DimensionMismatch {
        context: String,
        expected: Dimensions,
        found: Dimensions,
    },

    #[error("custom evaluation returned undeclared keys [{}]", .keys.join(", "))]
    UnexpectedOutput { keys: Vec<String> },

    #[error(
        "solver did not converge for [{}] after {iterations} iterations ({elapsed_ms} ms)",
        .unknowns.join(", ")
    )]
    SolverTimeout {
        unknowns: Vec<String>,
        iterations: usize,
        elapsed_ms: u128,
    },

    #[error("{count} distinct real solutions for [{}]", .unknowns.join(", "))]
    AmbiguousSolution { unknowns: Vec<String>, count: usize },

    #[error("failed to parse '{input}': {message}")]
    Parse { input: String, message: String },

    #[error("unknown variable '{name}'")]
    UnknownVariable { name: String },

    #[error("symbol '{name}' is not registered")]
    UnknownSymbol { name: String },

    #[error("invalid symbol '{name}': {reason}")]
    InvalidSymbol { name: String, reason: String },

    #[error("invalid model '{name}': {reason}")]
    InvalidModel { name: String, reason: String },

    #[error("invalid reference '{reference}': expected '@', 'url:' or 'doi:' prefix")]
    InvalidReference { reference: String },

    #[error("constraint not satisfied: {constraint}")]
    ConstraintViolated { constraint: String },

    #[error("value {value} violates constraint '{constraint}' of symbol '{symbol}'")]
    SymbolConstraint {
        symbol: String,
        constraint: String,
        value: f64,
    },

    #[error("cannot aggregate an empty list of quantities")]
    EmptyAggregate,

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}
