use std::collections::BTreeMap;

use crate::errors::{InputError, EvaluationError};
use crate::pivot::Isolation;
use crate::variable::Variable;

/// Weight given to variables the caller did not weigh.
pub const DEFAULT_WEIGHT: f64 = 1.0;

/// Distance from a candidate point on the surface to the initial point.
///
/// Candidates only carry the non-pivot coordinates; the pivot coordinate is
/// always recomputed from its closed form, so every candidate is feasible.
/// Each coordinate contributes its weighted relative deviation and the total is
/// the Euclidean norm of those contributions.
#[derive(Clone, Debug)]
pub struct DistanceFunction<'a>
{
    isolation: &'a Isolation,
    free: Vec<Variable>,
    pivot: Variable,
}

impl<'a> DistanceFunction<'a>
{
    /// Builds the distance function for `isolation`.
    ///
    /// `initial` must hold a value for every variable, pivot included. Missing
    /// weights default to [`DEFAULT_WEIGHT`]. A zero initial value anywhere
    /// fails with a `DegenerateNormalizationError`.
    ///
    /// # Example
    /// ```
    /// use std::collections::BTreeMap;
    /// use nearfeas::shunting::parse_formula;
    /// use nearfeas::pivot::isolate;
    /// use nearfeas::distance::DistanceFunction;
    ///
    /// let iso = isolate(&parse_formula("a + b = 10").unwrap(), "a", 0.0).unwrap();
    /// let initial = BTreeMap::from([("a".to_owned(), 3.0), ("b".to_owned(), 3.0)]);
    ///
    /// let distance = DistanceFunction::compile(&iso, &initial, &BTreeMap::new()).unwrap();
    ///
    /// // b = 7 forces a = 3: only b moved, by 4/3 of its initial value.
    /// assert!((distance.eval(&[7.0]).unwrap() - 4.0 / 3.0).abs() < 1e-12);
    /// ```
    pub fn compile(
        isolation: &'a Isolation,
        initial: &BTreeMap<String, f64>,
        weights: &BTreeMap<String, f64>,
    ) -> anyhow::Result<DistanceFunction<'a>>
    {
        let variable = |name: &str| -> anyhow::Result<Variable> {
            let value = initial
                .get(name)
                .copied()
                .ok_or_else(|| InputError::MissingValue(name.to_owned()))?;
            let weight = weights.get(name).copied().unwrap_or(DEFAULT_WEIGHT);
            Variable::new(name, value, weight)
        };

        let pivot = variable(isolation.pivot.as_str())?;
        let free = isolation
            .args
            .iter()
            .map(|name| variable(name.as_str()))
            .collect::<anyhow::Result<Vec<Variable>>>()?;

        Ok(DistanceFunction { isolation, free, pivot })
    }

    /// Number of search dimensions.
    pub fn dimension(&self) -> usize
    {
        self.free.len()
    }

    /// The initial point restricted to the non-pivot variables, which is
    /// where the search starts.
    pub fn start(&self) -> Vec<f64>
    {
        self.free.iter().map(Variable::initial).collect()
    }

    /// Pivot value implied by the non-pivot values `x`.
    pub fn pivot_value(&self, x: &[f64]) -> anyhow::Result<f64>
    {
        self.isolation.eval(x)
    }

    pub fn eval(&self, x: &[f64]) -> anyhow::Result<f64>
    {
        if x.len() != self.free.len()
        {
            return Err(InputError::WrongDimension { expected: self.free.len(), found: x.len() }.into());
        }

        let pivot = self.pivot.relative_deviation(self.pivot_value(x)?);
        let sum: f64 = self
            .free
            .iter()
            .zip(x)
            .map(|(var, value)| var.relative_deviation(*value).powi(2))
            .sum::<f64>()
            + pivot * pivot;

        let distance = sum.sqrt();
        if !distance.is_finite()
        {
            return Err(EvaluationError::NonFiniteValue.into());
        }
        Ok(distance)
    }
}

#[cfg(test)]
fn fixture(formula: &str, pivot: &str) -> Isolation
{
    crate::pivot::isolate(&crate::shunting::parse_formula(formula).unwrap(), pivot, 0.0).unwrap()
}

#[cfg(test)]
fn point(pairs: &[(&str, f64)]) -> BTreeMap<String, f64>
{
    pairs.iter().map(|(k, v)| (k.to_string(), *v)).collect()
}

#[test]
fn test_distance_is_zero_at_feasible_initial_point()
{
    let iso = fixture("a + b - 10 = 0", "a");
    let distance = DistanceFunction::compile(&iso, &point(&[("a", 4.0), ("b", 6.0)]), &BTreeMap::new()).unwrap();

    assert_eq!(distance.start(), vec![6.0]);
    assert_eq!(distance.eval(&distance.start()).unwrap(), 0.0);
}

#[test]
fn test_weights_scale_each_dimension()
{
    let iso = fixture("a + b - 10 = 0", "a");
    let initial = point(&[("a", 2.0), ("b", 4.0)]);
    let weights = point(&[("a", 3.0), ("b", 0.5)]);
    let distance = DistanceFunction::compile(&iso, &initial, &weights).unwrap();

    // b = 5 => a = 5
    let expected = ((3.0_f64 * (2.0 - 5.0) / 2.0).powi(2) + (0.5_f64 * (4.0 - 5.0) / 4.0).powi(2)).sqrt();
    assert!((distance.eval(&[5.0]).unwrap() - expected).abs() < 1e-12);
}

#[test]
fn test_zero_initial_value_fails_fast()
{
    let iso = fixture("a + b - 10 = 0", "a");

    let err = DistanceFunction::compile(&iso, &point(&[("a", 0.0), ("b", 3.0)]), &BTreeMap::new()).unwrap_err();
    assert!(err.downcast_ref::<crate::errors::DegenerateNormalizationError>().is_some());

    let err = DistanceFunction::compile(&iso, &point(&[("a", 3.0), ("b", 0.0)]), &BTreeMap::new()).unwrap_err();
    assert!(err.downcast_ref::<crate::errors::DegenerateNormalizationError>().is_some());
}

#[test]
fn test_undefined_pivot_is_an_error()
{
    let iso = fixture("sqrt(a) = b", "b");
    let distance = DistanceFunction::compile(&iso, &point(&[("a", 4.0), ("b", 2.0)]), &BTreeMap::new()).unwrap();

    assert!(distance.eval(&[-1.0]).is_err());
    assert!(distance.eval(&[1.0, 2.0]).is_err());
}
