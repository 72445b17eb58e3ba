use std::collections::BTreeMap;

use tracing::{debug, warn};

use crate::distance::DistanceFunction;
use crate::errors::{NoSolutionError, OptimizationFailedError};
use crate::pivot::{isolate, Isolation};
use crate::powell::{Minimizer, Minimum};
use crate::shunting::{parse_formula, ParsedFormula};

/// The nearest feasible point found for an initial point.
#[derive(Clone, Debug, PartialEq)]
pub struct Solution
{
    /// Every variable of the formula, pivot included.
    pub point: BTreeMap<String, f64>,
    pub pivot: String,
    /// Weighted relative distance from the initial point.
    pub distance: f64,
    pub iterations: usize,
    pub evaluations: usize,
}

/// A formula with its pivot already isolated, ready to be solved for any
/// number of initial points.
#[derive(Clone, Debug, PartialEq)]
pub struct Problem
{
    formula: String,
    parsed: ParsedFormula,
    objective: f64,
    isolation: Isolation,
}

impl Problem
{
    /// Builds a problem pivoting on the lexicographically first variable,
    /// with bare expressions equated to zero.
    ///
    /// # Example
    /// ```
    /// use nearfeas::problem::Problem;
    ///
    /// let problem = Problem::new("x + y = 4").expect("failed to build problem!");
    ///
    /// assert_eq!(problem.pivot(), "x");
    /// assert_eq!(problem.variables(), vec!["x", "y"]);
    /// ```
    pub fn new(formula: &str) -> anyhow::Result<Problem>
    {
        Problem::with_pivot(formula, None, 0.0)
    }

    /// Builds a problem pivoting on `pivot`, or on the first variable if `None`.
    /// `objective` is the value a bare expression is equated to; it is ignored
    /// for `lhs = rhs` formulas.
    ///
    /// # Example
    /// ```
    /// use nearfeas::problem::Problem;
    ///
    /// let problem = Problem::with_pivot("p * f - c", Some("f"), 10.0).unwrap();
    ///
    /// assert_eq!(problem.pivot(), "f");
    /// assert_eq!(problem.free_variables(), &["c", "p"]);
    /// assert!(Problem::with_pivot("p * f - c", Some("z"), 0.0).is_err());
    /// ```
    pub fn with_pivot(formula: &str, pivot: Option<&str>, objective: f64) -> anyhow::Result<Problem>
    {
        let parsed = parse_formula(formula)?;
        let pivot = choose_pivot(&parsed, pivot)?;

        let isolation = isolate(&parsed, &pivot, objective)?;
        debug!(formula, pivot = %pivot, closed_form = %isolation.expr(), "built problem");

        Ok(Problem
        {
            formula: formula.to_owned(),
            parsed,
            objective,
            isolation,
        })
    }

    /// All variables in lexicographic order.
    pub fn variables(&self) -> Vec<String>
    {
        self.parsed.variables()
    }

    pub fn pivot(&self) -> &str
    {
        &self.isolation.pivot
    }

    /// The variables searched over, in lexicographic order.
    pub fn free_variables(&self) -> &[String]
    {
        &self.isolation.args
    }

    pub fn isolation(&self) -> &Isolation
    {
        &self.isolation
    }

    /// Evaluates `lhs - rhs` (or `expr - objective`) at a full point. Zero
    /// means the point lies on the surface.
    pub fn residual(&self, point: &BTreeMap<String, f64>) -> anyhow::Result<f64>
    {
        self.parsed.constraint.residual(self.objective).eval(point)
    }

    pub fn distance_function(
        &self,
        initial: &BTreeMap<String, f64>,
        weights: &BTreeMap<String, f64>,
    ) -> anyhow::Result<DistanceFunction<'_>>
    {
        DistanceFunction::compile(&self.isolation, initial, weights)
    }

    /// Finds the point of the surface nearest to `initial`, starting the search
    /// at `initial` itself. One local search is run, so the result is a nearby
    /// feasible point rather than a guaranteed global optimum.
    ///
    /// # Example
    /// ```
    /// use std::collections::BTreeMap;
    /// use nearfeas::problem::Problem;
    /// use nearfeas::powell::Powell;
    ///
    /// let problem = Problem::new("a + b - 10 = 0").unwrap();
    /// let initial = BTreeMap::from([("a".to_owned(), 3.0), ("b".to_owned(), 3.0)]);
    ///
    /// let soln = problem.solve(&initial, &BTreeMap::new(), &Powell::default())
    ///     .expect("failed to find a solution...");
    ///
    /// assert!((soln.point["a"] + soln.point["b"] - 10.0).abs() < 1e-9);
    /// assert!((soln.point["b"] - 5.0).abs() < 1e-2);
    /// ```
    pub fn solve(
        &self,
        initial: &BTreeMap<String, f64>,
        weights: &BTreeMap<String, f64>,
        minimizer: &dyn Minimizer,
    ) -> anyhow::Result<Solution>
    {
        let distance = self.distance_function(initial, weights)?;
        let objective = |x: &[f64]| distance.eval(x);

        // Nothing to search over: the pivot is fully determined.
        let minimum = if distance.dimension() == 0
        {
            Minimum
            {
                x: Vec::new(),
                value: distance.eval(&[]).map_err(optimization_failure)?,
                converged: true,
                iterations: 0,
                evaluations: 1,
            }
        }
        else
        {
            minimizer
                .minimize(&objective, &distance.start())
                .map_err(optimization_failure)?
        };
        debug!(iterations = minimum.iterations, evaluations = minimum.evaluations, distance = minimum.value, "minimizer finished");

        if !minimum.converged
        {
            warn!(formula = %self.formula, iterations = minimum.iterations, "minimizer did not converge");
            return Err(OptimizationFailedError::NotConverged
            {
                iterations: minimum.iterations,
                evaluations: minimum.evaluations,
            }
            .into());
        }

        // The pivot is recomputed so the returned point is on the surface.
        let pivot_value = distance.pivot_value(&minimum.x).map_err(optimization_failure)?;

        let mut point: BTreeMap<String, f64> = self
            .isolation
            .args
            .iter()
            .cloned()
            .zip(minimum.x.iter().copied())
            .collect();
        point.insert(self.isolation.pivot.clone(), pivot_value);

        Ok(Solution
        {
            point,
            pivot: self.isolation.pivot.clone(),
            distance: minimum.value,
            iterations: minimum.iterations,
            evaluations: minimum.evaluations,
        })
    }
}

/// Resolves which variable of `parsed` to isolate: `pivot` when it is one of
/// the formula's variables, the lexicographically first variable when `None`.
pub fn choose_pivot(parsed: &ParsedFormula, pivot: Option<&str>) -> anyhow::Result<String>
{
    let variables = parsed.variables();
    match pivot
    {
        Some(name) if variables.iter().any(|v| v == name) => Ok(name.to_owned()),
        Some(_) => Err(NoSolutionError::PivotNotInFormula.into()),
        None => Ok(variables
            .into_iter()
            .next()
            .ok_or(NoSolutionError::PivotNotInFormula)?),
    }
}

/// Folds whatever stopped the search into a single optimization failure.
fn optimization_failure(err: anyhow::Error) -> anyhow::Error
{
    if err.downcast_ref::<OptimizationFailedError>().is_some()
    {
        return err;
    }
    OptimizationFailedError::EvaluationFailed(err.to_string()).into()
}

#[cfg(test)]
use crate::powell::Powell;

#[cfg(test)]
fn point(pairs: &[(&str, f64)]) -> BTreeMap<String, f64>
{
    pairs.iter().map(|(k, v)| (k.to_string(), *v)).collect()
}

#[test]
fn test_default_pivot_is_first_variable()
{
    let problem = Problem::new("z * y = x").unwrap();
    assert_eq!(problem.pivot(), "x");
    assert_eq!(problem.free_variables(), &["y", "z"]);
}

#[test]
fn test_solution_lies_on_surface()
{
    let problem = Problem::with_pivot("x * y = 12", Some("y"), 0.0).unwrap();
    let initial = point(&[("x", 2.0), ("y", 3.0)]);
    let soln = problem.solve(&initial, &BTreeMap::new(), &Powell::default()).unwrap();

    assert_eq!(soln.point.keys().collect::<Vec<_>>(), vec!["x", "y"]);
    assert!(problem.residual(&soln.point).unwrap().abs() < 1e-9);
    assert!(soln.distance > 0.0);
}

#[test]
fn test_heavy_weight_keeps_variable_in_place()
{
    let problem = Problem::with_pivot("a + b = 10", Some("a"), 0.0).unwrap();
    let initial = point(&[("a", 3.0), ("b", 3.0)]);
    let weights = point(&[("b", 100.0)]);
    let soln = problem.solve(&initial, &weights, &Powell::default()).unwrap();

    assert!((soln.point["b"] - 3.0).abs() < 0.05, "{:?}", soln.point);
    assert!((soln.point["a"] - 7.0).abs() < 0.05, "{:?}", soln.point);
}

#[test]
fn test_evaluation_failure_is_an_optimization_failure()
{
    struct Exploding;
    impl Minimizer for Exploding
    {
        fn minimize(&self, f: &crate::powell::Objective, _start: &[f64]) -> anyhow::Result<crate::powell::Minimum>
        {
            f(&[-1.0])?;
            unreachable!("objective must fail")
        }
    }

    let problem = Problem::with_pivot("sqrt(a) = b", Some("b"), 0.0).unwrap();
    let initial = point(&[("a", 4.0), ("b", 2.0)]);
    let err = problem.solve(&initial, &BTreeMap::new(), &Exploding).unwrap_err();

    match err.downcast_ref::<OptimizationFailedError>()
    {
        Some(OptimizationFailedError::EvaluationFailed(_)) => {},
        other => panic!("unexpected error: {other:?}"),
    }
}

#[test]
fn test_single_variable_skips_the_minimizer()
{
    struct Unused;
    impl Minimizer for Unused
    {
        fn minimize(&self, _f: &crate::powell::Objective, _start: &[f64]) -> anyhow::Result<Minimum>
        {
            panic!("nothing to minimize")
        }
    }

    let problem = Problem::new("2 * x = 6").unwrap();
    let soln = problem.solve(&point(&[("x", 4.0)]), &BTreeMap::new(), &Unused).unwrap();

    assert_eq!(soln.point, point(&[("x", 3.0)]));
    assert!((soln.distance - 0.25).abs() < 1e-12);
}

#[test]
fn test_non_convergence_is_an_optimization_failure()
{
    let problem = Problem::new("x * y * z = 1").unwrap();
    let initial = point(&[("x", 3.0), ("y", 5.0), ("z", 7.0)]);
    let stingy = Powell { max_evals: Some(1), ..Powell::default() };
    let err = problem.solve(&initial, &BTreeMap::new(), &stingy).unwrap_err();

    assert!(matches!(
        err.downcast_ref::<OptimizationFailedError>(),
        Some(OptimizationFailedError::NotConverged { .. })
    ));
}
