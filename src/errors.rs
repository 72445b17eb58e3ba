use std::error::Error;
use std::fmt;
use std::fmt::Display;

/// More concise syntax for implementing `Error` and `Display` for both structs and enums
macro_rules! impl_err {
    ($s:ty, $e:expr) => {
        impl Error for $s {}
        impl Display for $s {
            fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
                write!(f, $e)
            }
        }
    };
    ($s:ty, $($p:path, $e:expr),*) => {
        impl Error for $s {}
        impl Display for $s {
            fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
                match self {
                    $($p => write!(f, $e),)*
                }
            }
        }
    };
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ParseError {
    EmptyFormula,
    MultipleEquals,
    UnknownToken,
    UnbalancedParenthesis,
    UnexpectedOperator,
    UnexpectedOperand,
    MisplacedFunction,
    UnknownFunction,
    ExpectedArg,
    LeftoverToken,
    NoVariables,
    TooDeep,
}
impl_err! {
    ParseError,
    ParseError::EmptyFormula, "found an empty formula or an empty side of an equation",
    ParseError::MultipleEquals, "found more than one '=' in the formula",
    ParseError::UnknownToken, "found a character sequence that is not a number, identifier or operator",
    ParseError::UnbalancedParenthesis, "found an unbalanced parenthesis",
    ParseError::UnexpectedOperator, "found an operator where an operand was expected",
    ParseError::UnexpectedOperand, "found an operand where an operator was expected",
    ParseError::MisplacedFunction, "found a function name that is not followed by a parenthesised argument",
    ParseError::UnknownFunction, "found a call to a function that is not allowed in formulas",
    ParseError::ExpectedArg, "expected to find an operand, but none was present on the stack",
    ParseError::LeftoverToken, "found more operands than the operators could consume",
    ParseError::NoVariables, "found no variables in the formula",
    ParseError::TooDeep, "found a formula nested too deeply to evaluate"
}

/// A reserved name was used as a variable.
#[derive(Debug, Clone, PartialEq)]
pub struct ForbiddenVariableError
{
    pub name: String,
}
impl Error for ForbiddenVariableError {}
impl Display for ForbiddenVariableError
{
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result
    {
        write!(f, "'{}' is a reserved name and cannot be used as a variable", self.name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum NoSolutionError {
    PivotNotInFormula,
    PivotCancelsOut,
    NotIsolatable,
}
impl_err! {
    NoSolutionError,
    NoSolutionError::PivotNotInFormula, "the pivot is not one of the formula's variables",
    NoSolutionError::PivotCancelsOut, "the pivot does not affect the constraint",
    NoSolutionError::NotIsolatable, "the pivot cannot be isolated in closed form"
}

/// Relative distances are undefined around a zero initial value.
#[derive(Debug, Clone, PartialEq)]
pub struct DegenerateNormalizationError
{
    pub variable: String,
}
impl Error for DegenerateNormalizationError {}
impl Display for DegenerateNormalizationError
{
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result
    {
        write!(f, "initial value of '{}' is zero and cannot normalize its distance", self.variable)
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum EvaluationError {
    DivisionByZero,
    NonFiniteValue,
    ExpectedArg,
    LeftoverToken,
    WrongArgCount,
}
impl_err! {
    EvaluationError,
    EvaluationError::DivisionByZero, "tried to divide by zero during evaluation",
    EvaluationError::NonFiniteValue, "evaluation produced a value that is not a finite real number",
    EvaluationError::ExpectedArg, "expected to find an operand, but none was present on the stack",
    EvaluationError::LeftoverToken, "found more than one value left on the stack after evaluation",
    EvaluationError::WrongArgCount, "number of values given did not match the number of variables"
}

#[derive(Debug, Clone, PartialEq)]
pub enum OptimizationFailedError {
    NotConverged { iterations: usize, evaluations: usize },
    EvaluationFailed(String),
    Unbounded,
    TimedOut { millis: u64 },
    WorkerLost,
}
impl Error for OptimizationFailedError {}
impl Display for OptimizationFailedError
{
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result
    {
        match self
        {
            OptimizationFailedError::NotConverged { iterations, evaluations } => write!(
                f,
                "minimizer stopped without converging after {iterations} iterations and {evaluations} evaluations"
            ),
            OptimizationFailedError::EvaluationFailed(cause) => write!(f, "distance evaluation failed: {cause}"),
            OptimizationFailedError::Unbounded => write!(f, "could not bracket a minimum along a search direction"),
            OptimizationFailedError::TimedOut { millis } => write!(f, "solve did not finish within {millis} ms"),
            OptimizationFailedError::WorkerLost => write!(f, "solver worker stopped before reporting a result"),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum InputError {
    MissingFormula,
    MissingValue(String),
    NotANumber(String),
    InvalidWeight(String),
    NonFiniteInitial(String),
    WrongDimension { expected: usize, found: usize },
}
impl Error for InputError {}
impl Display for InputError
{
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result
    {
        match self
        {
            InputError::MissingFormula => write!(f, "no formula was given"),
            InputError::MissingValue(var) => write!(f, "no initial value was given for '{var}'"),
            InputError::NotANumber(key) => write!(f, "value of '{key}' cannot be converted to a float"),
            InputError::InvalidWeight(var) => write!(f, "weight of '{var}' must be a finite positive number"),
            InputError::NonFiniteInitial(var) => write!(f, "initial value of '{var}' must be finite"),
            InputError::WrongDimension { expected, found } => write!(f, "expected {expected} values but found {found}"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum StoreError {
    Poisoned,
}
impl_err! {
    StoreError,
    StoreError::Poisoned, "document store lock was poisoned by a panicking writer"
}
