use super::{dimensions, Evaluate, ModelDefinition, ModelMetadata};
use crate::autodiff::Dual;
use crate::equation_engine::{parse, BinaryOp, EquationSystem, Expr};
use crate::error::{ModelError, Result};
use crate::solvers::{self, Budget, SolverSettings};
use crate::traits::ResidualSystem;
use crate::value::{EvaluationInput, EvaluationOutput};
use std::collections::{BTreeMap, BTreeSet};
use tracing::{debug, instrument, trace};

/// A model solved numerically from equations, each implicitly `= 0`.
///
/// Unknowns are solved in the units of their symbols: every variable is
/// rewritten as `v * scale` (the SI scale of its symbol's units), so the
/// equations themselves are read in coherent SI units. With `scrub_units`
/// the scales are dropped and magnitudes are substituted as given.
#[derive(Debug, Clone)]
pub struct EquationModel {
    metadata: ModelMetadata,
    sources: Vec<String>,
    equations: Vec<Expr>,
    residuals: Vec<Expr>,
    variables: Vec<BTreeSet<String>>,
    settings: SolverSettings,
}

/// Which variables an evaluation reports.
enum Requested {
    /// Every solvable unknown.
    All,
    Only(BTreeSet<String>),
}

impl EquationModel {
    pub fn new(metadata: ModelMetadata, sources: &[String]) -> Result<Self> {
        if sources.is_empty() {
            return Err(ModelError::InvalidModel {
                name: metadata.name.clone(),
                reason: "equation set is empty".to_string(),
            });
        }
        let equations = sources
            .iter()
            .map(|source| parse(source))
            .collect::<Result<Vec<_>>>()?;

        let variables: Vec<BTreeSet<String>> = equations.iter().map(Expr::variables).collect();
        for name in variables.iter().flatten() {
            if !metadata.symbol_map.contains_key(name) {
                return Err(ModelError::UnknownVariable { name: name.clone() });
            }
        }

        let residuals = equations
            .iter()
            .map(|expr| {
                if metadata.scrub_units {
                    return expr.clone();
                }
                expr.map_variables(&|name: &str| {
                    let scale = metadata
                        .symbol_map
                        .get(name)
                        .map_or(1.0, |symbol| symbol.units_or_dimensionless().scale);
                    let variable = Expr::Variable(name.to_string());
                    if scale == 1.0 {
                        variable
                    } else {
                        Expr::Binary(
                            Box::new(variable),
                            BinaryOp::Mul,
                            Box::new(Expr::Number(scale)),
                        )
                    }
                })
            })
            .collect();

        Ok(Self {
            metadata,
            sources: sources.to_vec(),
            equations,
            residuals,
            variables,
            settings: SolverSettings::default(),
        })
    }

    pub fn with_settings(mut self, settings: SolverSettings) -> Result<Self> {
        settings.validate()?;
        self.settings = settings;
        Ok(self)
    }

    pub fn settings(&self) -> &SolverSettings {
        &self.settings
    }

    pub fn equations(&self) -> &[String] {
        &self.sources
    }

    pub fn to_definition(&self) -> ModelDefinition {
        ModelDefinition {
            equations: self.sources.clone(),
            ..self.metadata.to_definition()
        }
    }

    /// Every variable that appears in some equation.
    fn equation_variables(&self) -> BTreeSet<String> {
        self.variables.iter().flatten().cloned().collect()
    }

    fn check_dimensions(&self) -> Result<()> {
        let dimensions_of = |name: &str| {
            self.metadata
                .symbol_map
                .get(name)
                .map(|symbol| symbol.units_or_dimensionless().dimensions)
                .unwrap_or_default()
        };
        for (expr, source) in self.equations.iter().zip(&self.sources) {
            dimensions::infer(expr, source, &dimensions_of)?;
        }
        Ok(())
    }

    fn requested_outputs(&self, supplied: &BTreeSet<String>) -> Result<Requested> {
        let connections = &self.metadata.connections;
        if self.metadata.solve_for_all_symbols || connections.is_empty() {
            return Ok(Requested::All);
        }

        let applicable: Vec<_> = connections
            .iter()
            .filter(|connection| connection.applies_to(supplied))
            .collect();
        if applicable.is_empty() {
            // Report the connection that is closest to being usable.
            let closest = connections
                .iter()
                .min_by_key(|connection| connection.missing_inputs(supplied).len());
            let (unresolved, missing): (Vec<String>, Vec<String>) = closest
                .map(|connection| {
                    (
                        connection.outputs.difference(supplied).cloned().collect(),
                        connection.missing_inputs(supplied).into_iter().collect(),
                    )
                })
                .unwrap_or_default();
            return Err(ModelError::Underdetermined {
                unresolved,
                missing,
            });
        }

        let outputs = applicable
            .iter()
            .flat_map(|connection| connection.outputs.iter())
            .filter(|name| !supplied.contains(*name))
            .cloned()
            .collect();
        Ok(Requested::Only(outputs))
    }

    /// Largest known magnitude referenced by `equations`, used to rescale
    /// Newton starting points.
    fn scale_hint(&self, equations: &[usize], known: &BTreeMap<String, f64>) -> f64 {
        equations
            .iter()
            .flat_map(|&i| self.variables[i].iter())
            .filter_map(|name| known.get(name))
            .map(|value| value.abs())
            .filter(|value| value.is_finite() && *value > 0.0)
            .fold(None, |acc: Option<f64>, value| Some(acc.map_or(value, |a| a.max(value))))
            .unwrap_or(1.0)
    }

    fn compile(
        &self,
        equations: &[usize],
        unknowns: &[String],
        known: &BTreeMap<String, f64>,
    ) -> Result<EquationSystem<f64>> {
        let exprs: Vec<&Expr> = equations.iter().map(|&i| &self.residuals[i]).collect();
        let (names, values): (Vec<String>, Vec<f64>) =
            known.iter().map(|(name, value)| (name.clone(), *value)).unzip();
        EquationSystem::compile(&exprs, unknowns, &names, values)
    }

    fn check_consistency(&self, index: usize, known: &BTreeMap<String, f64>) -> Result<()> {
        let system = self.compile(&[index], &[], known)?;
        let mut residual = [0.0];
        let mut magnitude = [0.0];
        system.apply(&[], &mut residual);
        system.magnitudes(&[], &mut magnitude);
        let tolerance = self.settings.consistency_tolerance * magnitude[0];
        if residual[0].is_nan() || residual[0].abs() > tolerance {
            return Err(ModelError::InconsistentSystem {
                equations: vec![self.sources[index].clone()],
                residual: residual[0],
            });
        }
        Ok(())
    }

    fn solve_block(
        &self,
        equations: &[usize],
        unknowns: &[String],
        known: &BTreeMap<String, f64>,
        budget: &Budget,
    ) -> Result<Vec<f64>> {
        let system = self.compile(equations, unknowns, known)?;
        let dual = system.convert::<Dual>();
        let sources: Vec<String> = equations.iter().map(|&i| self.sources[i].clone()).collect();
        solvers::solve(
            &system,
            &dual,
            unknowns,
            &sources,
            self.scale_hint(equations, known),
            &self.settings,
            budget,
        )
    }

    /// Resolves as many unknowns as the equations allow.
    ///
    /// Repeats until nothing changes: equations with no unknowns are checked
    /// for consistency, equations with one unknown are solved on their own,
    /// and when neither applies, coupled blocks with at least as many
    /// equations as unknowns are solved jointly.
    fn solve(&self, mut known: BTreeMap<String, f64>) -> Result<BTreeMap<String, f64>> {
        let budget = Budget::new(self.settings.time_budget_ms);
        let mut pending: Vec<usize> = (0..self.equations.len()).collect();

        while !pending.is_empty() {
            let mut progress = false;
            let mut index = 0;
            while index < pending.len() {
                let eq = pending[index];
                let unknowns: Vec<String> = self.variables[eq]
                    .iter()
                    .filter(|name| !known.contains_key(*name))
                    .cloned()
                    .collect();
                match unknowns.len() {
                    0 => self.check_consistency(eq, &known)?,
                    1 => {
                        let root = self.solve_block(&[eq], &unknowns, &known, &budget)?;
                        trace!(variable = %unknowns[0], value = root[0], "solved");
                        known.insert(unknowns[0].clone(), root[0]);
                    }
                    _ => {
                        index += 1;
                        continue;
                    }
                }
                pending.remove(index);
                progress = true;
            }

            if !progress && !pending.is_empty() {
                for (equations, unknowns) in self.blocks(&pending, &known) {
                    if equations.len() < unknowns.len() {
                        continue;
                    }
                    let root = self.solve_block(&equations, &unknowns, &known, &budget)?;
                    known.extend(unknowns.into_iter().zip(root));
                    pending.retain(|eq| !equations.contains(eq));
                    progress = true;
                }
            }
            if !progress {
                break;
            }
        }
        Ok(known)
    }

    /// Groups pending equations into blocks connected through shared
    /// unknowns.
    fn blocks(
        &self,
        pending: &[usize],
        known: &BTreeMap<String, f64>,
    ) -> Vec<(Vec<usize>, Vec<String>)> {
        let mut blocks: Vec<(Vec<usize>, BTreeSet<String>)> = Vec::new();
        for &eq in pending {
            let unknowns: BTreeSet<String> = self.variables[eq]
                .iter()
                .filter(|name| !known.contains_key(*name))
                .cloned()
                .collect();
            let mut merged = (vec![eq], unknowns);
            let mut i = 0;
            while i < blocks.len() {
                if blocks[i].1.is_disjoint(&merged.1) {
                    i += 1;
                } else {
                    let (equations, unknowns) = blocks.swap_remove(i);
                    merged.0.extend(equations);
                    merged.1.extend(unknowns);
                }
            }
            blocks.push(merged);
        }
        blocks
            .into_iter()
            .map(|(mut equations, unknowns)| {
                equations.sort_unstable();
                (equations, unknowns.into_iter().collect())
            })
            .collect()
    }
}

impl Evaluate for EquationModel {
    fn metadata(&self) -> &ModelMetadata {
        &self.metadata
    }

    #[instrument(level = "debug", skip_all, fields(model = %self.metadata.name))]
    fn evaluate(&self, inputs: &EvaluationInput) -> Result<EvaluationOutput> {
        let prepared = self.metadata.prepare_inputs(inputs)?;
        self.metadata.check_constraints(&prepared.values)?;
        if prepared.with_units && !self.metadata.scrub_units {
            self.check_dimensions()?;
        }

        let supplied = prepared.supplied();
        let requested = self.requested_outputs(&supplied)?;
        let known = self.solve(prepared.values.clone())?;

        let unknowns: BTreeSet<String> = self
            .equation_variables()
            .difference(&supplied)
            .cloned()
            .collect();
        let unresolved: Vec<String> = unknowns
            .iter()
            .filter(|name| !known.contains_key(*name))
            .cloned()
            .collect();

        let names: Vec<String> = match requested {
            Requested::All => {
                if !unknowns.is_empty() && unresolved.len() == unknowns.len() {
                    // Variables every equation needs are the ones to supply.
                    let mut common = self.variables.iter();
                    let first = common.next().cloned().unwrap_or_default();
                    let missing = common
                        .fold(first, |acc, vars| acc.intersection(vars).cloned().collect())
                        .difference(&supplied)
                        .cloned()
                        .collect();
                    return Err(ModelError::Underdetermined {
                        unresolved,
                        missing,
                    });
                }
                unknowns.into_iter().filter(|name| known.contains_key(name)).collect()
            }
            Requested::Only(outputs) => {
                let blocked: Vec<String> = outputs
                    .iter()
                    .filter(|name| !known.contains_key(*name))
                    .cloned()
                    .collect();
                if !blocked.is_empty() {
                    let missing = unresolved
                        .iter()
                        .filter(|name| !outputs.contains(*name))
                        .cloned()
                        .collect();
                    return Err(ModelError::Underdetermined {
                        unresolved: blocked,
                        missing,
                    });
                }
                outputs.into_iter().collect()
            }
        };

        let mut outputs = EvaluationOutput::new();
        for name in names {
            let magnitude = known[&name];
            self.metadata.check_output(&name, magnitude)?;
            let value = self.metadata.output_value(&name, magnitude, prepared.with_units);
            outputs.insert(name, value);
        }
        debug!(outputs = ?outputs.keys().collect::<Vec<_>>(), "evaluated");
        Ok(outputs)
    }
}
