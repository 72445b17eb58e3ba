use std::fmt;

use crate::errors::ForbiddenVariableError;

/// Lexical tokens produced while scanning a formula.
#[derive(Clone, Debug, PartialEq)]
pub enum Token {
    LeftParenthesis,
    RightParenthesis,
    Exp,
    Mul,
    Div,
    Plus,
    Minus,
    Num(f64),
    Ident(String),
}

/// The only functions a formula may call. Every one of them takes a single
/// argument and has a closed-form inverse, which the pivot solver relies on.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Function {
    Sqrt,
    Exp,
    Ln,
}

impl Function
{
    pub fn from_name(name: &str) -> Option<Function>
    {
        match name
        {
            "sqrt" => Some(Function::Sqrt),
            "exp" => Some(Function::Exp),
            "ln" => Some(Function::Ln),
            _ => None,
        }
    }

    pub fn name(self) -> &'static str
    {
        match self
        {
            Function::Sqrt => "sqrt",
            Function::Exp => "exp",
            Function::Ln => "ln",
        }
    }

    pub fn apply(self, x: f64) -> f64
    {
        match self
        {
            Function::Sqrt => x.sqrt(),
            Function::Exp => x.exp(),
            Function::Ln => x.ln(),
        }
    }
}

impl fmt::Display for Function
{
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result
    {
        write!(f, "{}", self.name())
    }
}

/// Request keys that share the namespace of variable names.
pub const FORMULA_KEY: &str = "formula";
pub const PIVOT_KEY: &str = "pivot";
pub const OBJECTIVE_KEY: &str = "objective";
pub const COEF_PREFIX: &str = "coef_";

/// Checks that `name` may be used as a variable.
///
/// # Example
/// ```
/// use nearfeas::context::check_variable_name;
///
/// assert!(check_variable_name("revenue").is_ok());
/// assert!(check_variable_name("sqrt").is_err());
/// assert!(check_variable_name("coef_x").is_err());
/// ```
pub fn check_variable_name(name: &str) -> Result<(), ForbiddenVariableError>
{
    let reserved = Function::from_name(name).is_some()
        || name == FORMULA_KEY
        || name == PIVOT_KEY
        || name == OBJECTIVE_KEY
        || name.starts_with(COEF_PREFIX);

    if reserved
    {
        return Err(ForbiddenVariableError { name: name.to_owned() });
    }
    Ok(())
}

#[test]
fn test_function_lookup()
{
    assert_eq!(Function::from_name("sqrt"), Some(Function::Sqrt));
    assert_eq!(Function::from_name("sin"), None);
    assert_eq!(Function::Ln.apply(1.0), 0.0);
    assert_eq!(Function::Sqrt.to_string(), "sqrt");
}

#[test]
fn test_reserved_names()
{
    for name in ["formula", "pivot", "objective", "exp", "ln", "coef_a"]
    {
        let err = check_variable_name(name).unwrap_err();
        assert_eq!(err.name, name);
    }
    assert!(check_variable_name("coefficient").is_ok());
}
