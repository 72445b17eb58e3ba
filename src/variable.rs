use crate::errors::{DegenerateNormalizationError, InputError};

/// One coordinate of the initial point: where the variable starts and how
/// costly it is to move it away from there.
#[derive(Clone, Debug, PartialEq)]
pub struct Variable
{
    pub name: String,
    initial: f64,
    weight: f64,
}

impl Variable
{
    /// Builds a variable, rejecting values the relative metric cannot use.
    ///
    /// # Example
    /// ```
    /// use nearfeas::variable::Variable;
    ///
    /// let var = Variable::new("p", 16, 2).unwrap();
    /// assert_eq!(var.relative_deviation(12.0), 0.5);
    ///
    /// assert!(Variable::new("p", 0.0, 1.0).is_err());
    /// assert!(Variable::new("p", 16.0, -1.0).is_err());
    /// ```
    pub fn new<T>(name: &str, initial: T, weight: T) -> anyhow::Result<Variable>
    where T: Into<f64>
    {
        let initial = initial.into();
        let weight = weight.into();

        if !initial.is_finite()
        {
            return Err(InputError::NonFiniteInitial(name.to_owned()).into());
        }
        if initial == 0.0
        {
            return Err(DegenerateNormalizationError { variable: name.to_owned() }.into());
        }
        if !weight.is_finite() || weight <= 0.0
        {
            return Err(InputError::InvalidWeight(name.to_owned()).into());
        }

        Ok(Variable
        {
            name: name.to_owned(),
            initial,
            weight,
        })
    }

    pub fn initial(&self) -> f64
    {
        self.initial
    }

    /// `weight * (initial - value) / initial`
    pub fn relative_deviation(&self, value: f64) -> f64
    {
        self.weight * (self.initial - value) / self.initial
    }
}

#[test]
fn test_deviation_is_relative_to_initial_value()
{
    let headcount = Variable::new("p", 16.0, 1.0).unwrap();
    let revenue = Variable::new("b", 39000.0, 1.0).unwrap();

    // 10% moves weigh the same whatever the magnitude.
    assert!((headcount.relative_deviation(14.4) - revenue.relative_deviation(35100.0)).abs() < 1e-12);
    assert_eq!(headcount.relative_deviation(16.0), 0.0);
}

#[test]
fn test_zero_initial_value_is_degenerate()
{
    let err = Variable::new("s", 0.0, 1.0).unwrap_err();
    assert_eq!(
        err.downcast_ref::<DegenerateNormalizationError>(),
        Some(&DegenerateNormalizationError { variable: "s".to_owned() })
    );
}

#[test]
fn test_invalid_inputs()
{
    let err = Variable::new("s", f64::NAN, 1.0).unwrap_err();
    assert_eq!(err.downcast_ref::<InputError>(), Some(&InputError::NonFiniteInitial("s".to_owned())));

    let err = Variable::new("s", 1.0, 0.0).unwrap_err();
    assert_eq!(err.downcast_ref::<InputError>(), Some(&InputError::InvalidWeight("s".to_owned())));
}
