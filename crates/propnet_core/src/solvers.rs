use crate::autodiff::{jacobian, Dual};
use crate::error::{ModelError, Result};
use crate::traits::ResidualSystem;
use nalgebra::{DMatrix, DVector};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::time::{Duration, Instant};
use tracing::{debug, trace};

/// How to pick one root when a system has several real solutions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RootPolicy {
    /// First root (in ascending order) with every component `>= 0`, falling
    /// back to the first root.
    #[default]
    PreferNonNegative,
    /// First root in ascending order.
    Smallest,
    /// More than one distinct root is an `AmbiguousSolution` error.
    RejectAmbiguous,
}

/// Seeds for multi-start Newton, tried in order.
pub const DEFAULT_SEEDS: [f64; 14] = [
    1.0, -1.0, 0.5, -0.5, 2.0, -2.0, 10.0, -10.0, 0.1, -0.1, 100.0, -100.0, 1e3, -1e3,
];

/// Relative offset between successive components of a starting point.
const SEED_SPREAD: f64 = 0.37;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SolverSettings {
    /// Newton iterations per starting point.
    pub max_steps: usize,
    pub damping: f64,
    /// Step-size tolerance, relative to `1 + ‖x‖`.
    pub tolerance: f64,
    /// Residual tolerance, relative to the sum of the absolute values of
    /// each equation's additive terms.
    pub residual_tolerance: f64,
    /// Relative tolerance for equations whose variables are all known.
    pub consistency_tolerance: f64,
    pub seeds: Vec<f64>,
    /// Wall-clock budget shared by every solve in one evaluation.
    pub time_budget_ms: u64,
    pub root_policy: RootPolicy,
}

impl Default for SolverSettings {
    fn default() -> Self {
        Self {
            max_steps: 100,
            damping: 1.0,
            tolerance: 1e-12,
            residual_tolerance: 1e-10,
            consistency_tolerance: 1e-6,
            seeds: DEFAULT_SEEDS.to_vec(),
            time_budget_ms: 1000,
            root_policy: RootPolicy::default(),
        }
    }
}

impl SolverSettings {
    pub fn validate(&self) -> Result<()> {
        let reason = if self.max_steps == 0 {
            "max_steps must be greater than zero"
        } else if !(self.damping > 0.0 && self.damping <= 1.0) {
            "damping must be in (0, 1]"
        } else if self.tolerance <= 0.0 || self.residual_tolerance <= 0.0 {
            "tolerances must be positive"
        } else if self.seeds.is_empty() {
            "at least one seed is required"
        } else {
            return Ok(());
        };
        Err(ModelError::InvalidModel {
            name: "solver settings".to_string(),
            reason: reason.to_string(),
        })
    }
}

/// Wall-clock deadline for one evaluation.
#[derive(Debug, Clone, Copy)]
pub struct Budget {
    start: Instant,
    limit: Duration,
}

impl Budget {
    pub fn new(limit_ms: u64) -> Self {
        Self {
            start: Instant::now(),
            limit: Duration::from_millis(limit_ms),
        }
    }

    pub fn exhausted(&self) -> bool {
        self.start.elapsed() > self.limit
    }

    pub fn elapsed_ms(&self) -> u128 {
        self.start.elapsed().as_millis()
    }
}

/// How a single Newton run from one starting point ended.
#[derive(Debug, Clone, PartialEq)]
pub enum NewtonOutcome {
    Converged(Vec<f64>),
    /// Steps shrank to nothing with a residual left over (a least-squares
    /// minimum that is not a root).
    Stalled { residual_norm: f64 },
    /// The Jacobian could not be solved against.
    Singular { residual_norm: f64 },
    /// The iterate left the domain (NaN or infinity).
    Diverged,
    Exhausted,
    TimedOut,
}

/// Damped Newton iteration with exact Jacobians.
/// Square systems take LU steps; overdetermined ones take least-squares
/// (Gauss-Newton) steps through the SVD.
pub struct Newton {
    residual: Vec<f64>,
    magnitude: Vec<f64>,
    pub iterations: usize,
}

impl Newton {
    pub fn new(rows: usize) -> Self {
        Self {
            residual: vec![0.0; rows],
            magnitude: vec![0.0; rows],
            iterations: 0,
        }
    }

    pub fn run<S, D>(
        &mut self,
        system: &S,
        dual: &D,
        initial_guess: &[f64],
        settings: &SolverSettings,
        budget: &Budget,
    ) -> NewtonOutcome
    where
        S: ResidualSystem<f64>,
        D: ResidualSystem<Dual>,
    {
        let cols = system.unknowns();
        let rows = system.residuals();
        let mut state = initial_guess.to_vec();

        system.magnitudes(&state, &mut self.magnitude);
        let initial_magnitude = norm(&self.magnitude);

        for _ in 0..settings.max_steps {
            if budget.exhausted() {
                return NewtonOutcome::TimedOut;
            }
            system.apply(&state, &mut self.residual);
            system.magnitudes(&state, &mut self.magnitude);
            if !self.residual.iter().all(|r| r.is_finite()) {
                return NewtonOutcome::Diverged;
            }
            if self.within_tolerance(settings.residual_tolerance) {
                return NewtonOutcome::Converged(state);
            }

            let jac = jacobian(dual, &state);
            let residual_norm = norm(&self.residual);
            let Some(delta) = solve_step(rows, cols, &jac, &self.residual) else {
                return NewtonOutcome::Singular { residual_norm };
            };

            self.iterations += 1;
            for (x, d) in state.iter_mut().zip(&delta) {
                *x -= settings.damping * d;
            }

            let step = settings.damping * norm(&delta);
            if step <= settings.tolerance * (1.0 + norm(&state)) {
                system.apply(&state, &mut self.residual);
                system.magnitudes(&state, &mut self.magnitude);
                let residual_norm = norm(&self.residual);
                // A root with a singular Jacobian (double root) converges
                // slowly; accept it once steps vanish and the residual is
                // small against the scale of the problem.
                let scale = norm(&self.magnitude).max(initial_magnitude);
                if residual_norm <= settings.residual_tolerance.sqrt() * scale {
                    return NewtonOutcome::Converged(state);
                }
                return NewtonOutcome::Stalled { residual_norm };
            }
        }

        system.apply(&state, &mut self.residual);
        system.magnitudes(&state, &mut self.magnitude);
        if self.residual.iter().all(|r| r.is_finite())
            && self.within_tolerance(settings.residual_tolerance)
        {
            return NewtonOutcome::Converged(state);
        }
        NewtonOutcome::Exhausted
    }

    fn within_tolerance(&self, tolerance: f64) -> bool {
        self.residual
            .iter()
            .zip(&self.magnitude)
            .all(|(r, m)| r.abs() <= tolerance * m.abs())
    }
}

fn norm(values: &[f64]) -> f64 {
    values.iter().map(|v| v * v).sum::<f64>().sqrt()
}

fn solve_step(rows: usize, cols: usize, jac: &[f64], residual: &[f64]) -> Option<Vec<f64>> {
    let j_matrix = DMatrix::from_row_slice(rows, cols, jac);
    let rhs = DVector::from_column_slice(residual);
    let delta = if rows == cols {
        j_matrix.lu().solve(&rhs)?
    } else {
        let svd = j_matrix.svd(true, true);
        let largest = svd.singular_values.max();
        if largest == 0.0 || !largest.is_finite() {
            return None;
        }
        let eps = largest * f64::EPSILON * rows.max(cols) as f64;
        svd.solve(&rhs, eps).ok()?
    };
    delta
        .iter()
        .all(|d| d.is_finite())
        .then(|| delta.iter().copied().collect())
}

/// Everything learned from a multi-start root search.
#[derive(Debug, Clone, Default)]
pub struct RootSearch {
    /// Distinct converged roots, ascending.
    pub roots: Vec<Vec<f64>>,
    /// Smallest residual norm among stalled starts.
    pub stalled: Option<f64>,
    /// Smallest residual norm among starts stopped by a singular Jacobian.
    pub singular: Option<f64>,
    pub exhausted: usize,
    pub timed_out: bool,
    pub iterations: usize,
}

/// Runs Newton from every seed (and from the seeds rescaled by `scale_hint`
/// when it lies outside `[0.1, 10]`), collecting distinct roots.
pub fn find_roots<S, D>(
    system: &S,
    dual: &D,
    scale_hint: f64,
    settings: &SolverSettings,
    budget: &Budget,
) -> RootSearch
where
    S: ResidualSystem<f64>,
    D: ResidualSystem<Dual>,
{
    let dim = system.unknowns();
    let mut seeds = settings.seeds.clone();
    let hint = scale_hint.abs();
    if hint.is_finite() && hint > 0.0 && !(0.1..=10.0).contains(&hint) {
        seeds.extend(settings.seeds.iter().map(|s| s * hint));
    }

    let mut search = RootSearch::default();
    let mut newton = Newton::new(system.residuals());
    for seed in seeds {
        // Components are spread off the diagonal: systems symmetric in
        // their unknowns have a singular Jacobian on it.
        let start: Vec<f64> = (0..dim)
            .map(|i| seed * (1.0 + SEED_SPREAD * i as f64))
            .collect();
        match newton.run(system, dual, &start, settings, budget) {
            NewtonOutcome::Converged(root) => insert_root(&mut search.roots, root),
            NewtonOutcome::Stalled { residual_norm } => {
                search.stalled = Some(search.stalled.map_or(residual_norm, |r| r.min(residual_norm)));
            }
            NewtonOutcome::Singular { residual_norm } => {
                search.singular =
                    Some(search.singular.map_or(residual_norm, |r| r.min(residual_norm)));
            }
            NewtonOutcome::Diverged | NewtonOutcome::Exhausted => search.exhausted += 1,
            NewtonOutcome::TimedOut => {
                search.timed_out = true;
                break;
            }
        }
    }
    search.iterations = newton.iterations;
    search.roots.sort_by(|a, b| compare_roots(a, b));
    trace!(roots = ?search.roots, "root search finished");
    search
}

fn same_root(a: &[f64], b: &[f64]) -> bool {
    a.iter()
        .zip(b)
        .all(|(x, y)| (x - y).abs() <= 1e-7 * (1.0 + x.abs()))
}

fn insert_root(roots: &mut Vec<Vec<f64>>, root: Vec<f64>) {
    if !roots.iter().any(|known| same_root(known, &root)) {
        roots.push(root);
    }
}

fn compare_roots(a: &[f64], b: &[f64]) -> Ordering {
    a.iter()
        .zip(b)
        .map(|(x, y)| x.total_cmp(y))
        .find(|ordering| ordering.is_ne())
        .unwrap_or(Ordering::Equal)
}

/// Applies the root policy to sorted, distinct roots.
pub fn select_root(roots: &[Vec<f64>], policy: RootPolicy, unknowns: &[String]) -> Result<Vec<f64>> {
    let chosen = match policy {
        RootPolicy::PreferNonNegative => roots
            .iter()
            .find(|root| root.iter().all(|v| *v >= 0.0))
            .or_else(|| roots.first()),
        RootPolicy::Smallest => roots.first(),
        RootPolicy::RejectAmbiguous if roots.len() > 1 => {
            return Err(ModelError::AmbiguousSolution {
                unknowns: unknowns.to_vec(),
                count: roots.len(),
            });
        }
        RootPolicy::RejectAmbiguous => roots.first(),
    };
    chosen.cloned().ok_or_else(|| ModelError::Underdetermined {
        unresolved: unknowns.to_vec(),
        missing: Vec::new(),
    })
}

/// Solves a residual system for one root, mapping failed searches onto the
/// error taxonomy.
pub fn solve<S, D>(
    system: &S,
    dual: &D,
    unknowns: &[String],
    equations: &[String],
    scale_hint: f64,
    settings: &SolverSettings,
    budget: &Budget,
) -> Result<Vec<f64>>
where
    S: ResidualSystem<f64>,
    D: ResidualSystem<Dual>,
{
    let search = find_roots(system, dual, scale_hint, settings, budget);
    debug!(
        unknowns = ?unknowns,
        roots = search.roots.len(),
        iterations = search.iterations,
        "multi-start newton"
    );
    if !search.roots.is_empty() {
        return select_root(&search.roots, settings.root_policy, unknowns);
    }

    let timeout = || ModelError::SolverTimeout {
        unknowns: unknowns.to_vec(),
        iterations: search.iterations,
        elapsed_ms: budget.elapsed_ms(),
    };
    let inconsistent = |residual: f64| ModelError::InconsistentSystem {
        equations: equations.to_vec(),
        residual,
    };

    if search.timed_out {
        Err(timeout())
    } else if let Some(residual) = search.stalled {
        Err(inconsistent(residual))
    } else if search.exhausted > 0 {
        Err(timeout())
    } else {
        Err(inconsistent(search.singular.unwrap_or(f64::NAN)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::equation_engine::{parse, EquationSystem};
    use approx::assert_relative_eq;

    fn names(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    fn system(equations: &[&str], unknowns: &[&str]) -> (EquationSystem<f64>, EquationSystem<Dual>) {
        let exprs: Vec<_> = equations.iter().map(|e| parse(e).unwrap()).collect();
        let refs: Vec<_> = exprs.iter().collect();
        let system = EquationSystem::compile(&refs, &names(unknowns), &[], Vec::new()).unwrap();
        let dual = system.convert::<Dual>();
        (system, dual)
    }

    fn solve_with(equations: &[&str], unknowns: &[&str], policy: RootPolicy) -> Result<Vec<f64>> {
        let (system, dual) = system(equations, unknowns);
        let settings = SolverSettings {
            root_policy: policy,
            ..SolverSettings::default()
        };
        solve(
            &system,
            &dual,
            &names(unknowns),
            &names(equations),
            1.0,
            &settings,
            &Budget::new(settings.time_budget_ms),
        )
    }

    #[test]
    fn newton_converges_on_linear_equation() {
        let (system, dual) = system(&["3*x - 6"], &["x"]);
        let settings = SolverSettings::default();
        let mut newton = Newton::new(1);
        let outcome = newton.run(&system, &dual, &[10.0], &settings, &Budget::new(1000));
        match outcome {
            NewtonOutcome::Converged(x) => assert_relative_eq!(x[0], 2.0),
            other => panic!("expected convergence, got {other:?}"),
        }
        assert!(newton.iterations <= 2);
    }

    #[test]
    fn quadratic_root_policies() {
        let equations = ["x^2 - 4"];
        let x = solve_with(&equations, &["x"], RootPolicy::PreferNonNegative).unwrap();
        assert_relative_eq!(x[0], 2.0, max_relative = 1e-9);
        let x = solve_with(&equations, &["x"], RootPolicy::Smallest).unwrap();
        assert_relative_eq!(x[0], -2.0, max_relative = 1e-9);
        assert!(matches!(
            solve_with(&equations, &["x"], RootPolicy::RejectAmbiguous),
            Err(ModelError::AmbiguousSolution { count: 2, .. })
        ));
    }

    #[test]
    fn all_negative_roots_fall_back_to_smallest() {
        let x = solve_with(&["(x + 1)*(x + 3)"], &["x"], RootPolicy::PreferNonNegative).unwrap();
        assert_relative_eq!(x[0], -3.0, max_relative = 1e-9);
    }

    #[test]
    fn double_root_converges() {
        let x = solve_with(&["(x - 1)^2"], &["x"], RootPolicy::Smallest).unwrap();
        assert!((x[0] - 1.0).abs() < 1e-4);
    }

    #[test]
    fn no_real_root_times_out() {
        assert!(matches!(
            solve_with(&["x^2 + 1"], &["x"], RootPolicy::default()),
            Err(ModelError::SolverTimeout { .. })
        ));
    }

    #[test]
    fn overdetermined_contradiction_is_inconsistent() {
        assert!(matches!(
            solve_with(&["x - 1", "x - 2"], &["x"], RootPolicy::default()),
            Err(ModelError::InconsistentSystem { .. })
        ));
    }

    #[test]
    fn coupled_block_solves_jointly() {
        let root = solve_with(&["a + b - 3", "a - b - 1"], &["a", "b"], RootPolicy::default()).unwrap();
        assert_relative_eq!(root[0], 2.0, max_relative = 1e-9);
        assert_relative_eq!(root[1], 1.0, max_relative = 1e-9);
    }

    #[test]
    fn symmetric_block_finds_both_orderings() {
        let equations = ["x*y - 2", "x + y - 3"];
        let (system, dual) = system(&equations, &["x", "y"]);
        let settings = SolverSettings::default();
        let search = find_roots(&system, &dual, 1.0, &settings, &Budget::new(1000));
        assert_eq!(search.roots.len(), 2);
        assert_relative_eq!(search.roots[0][0], 1.0, max_relative = 1e-9);
        assert_relative_eq!(search.roots[1][0], 2.0, max_relative = 1e-9);

        let root = solve_with(&equations, &["x", "y"], RootPolicy::default()).unwrap();
        assert_relative_eq!(root[0], 1.0, max_relative = 1e-9);
        assert_relative_eq!(root[1], 2.0, max_relative = 1e-9);
    }

    #[test]
    fn tiny_scale_equations_converge() {
        // Equation in SI joules for a value given in eV.
        let (system, dual) = system(&["y*1.602176634e-19 - 3.2e-19"], &["y"]);
        let settings = SolverSettings::default();
        let root = solve(
            &system,
            &dual,
            &names(&["y"]),
            &[],
            1.0,
            &settings,
            &Budget::new(1000),
        )
        .unwrap();
        assert_relative_eq!(root[0], 3.2e-19 / 1.602176634e-19, max_relative = 1e-9);
    }

    #[test]
    fn scale_hint_reaches_large_roots() {
        let (system, dual) = system(&["x^2 - 2.5e9"], &["x"]);
        let settings = SolverSettings {
            max_steps: 20,
            ..SolverSettings::default()
        };
        let root = solve(&system, &dual, &names(&["x"]), &[], 5e4, &settings, &Budget::new(1000))
            .unwrap();
        assert_relative_eq!(root[0], 5e4, max_relative = 1e-9);
    }

    #[test]
    fn zero_budget_times_out() {
        let (system, dual) = system(&["x - 1"], &["x"]);
        let settings = SolverSettings::default();
        let budget = Budget::new(0);
        std::thread::sleep(Duration::from_millis(2));
        assert!(matches!(
            solve(&system, &dual, &names(&["x"]), &[], 1.0, &settings, &budget),
            Err(ModelError::SolverTimeout { .. })
        ));
    }

    #[test]
    fn settings_validation() {
        assert!(SolverSettings::default().validate().is_ok());
        let bad = SolverSettings {
            seeds: Vec::new(),
            ..SolverSettings::default()
        };
        assert!(bad.validate().is_err());
    }

    #[test]
    fn settings_deserialize_with_defaults() {
        let settings: SolverSettings =
            serde_json::from_str(r#"{"root_policy": "reject_ambiguous", "max_steps": 10}"#).unwrap();
        assert_eq!(settings.root_policy, RootPolicy::RejectAmbiguous);
        assert_eq!(settings.max_steps, 10);
        assert_eq!(settings.seeds, DEFAULT_SEEDS.to_vec());
    }
}
