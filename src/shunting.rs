use std::collections::BTreeSet;

use crate::context::{check_variable_name, Function, Token};
use crate::errors::ParseError;
use crate::expr::Expr;

use lazy_static::lazy_static;
use regex::Regex;
use tracing::debug;

lazy_static!
{
    static ref NUMBER: Regex = Regex::new(r"^(?:[0-9]+\.?[0-9]*|\.[0-9]+)(?:[eE][+-]?[0-9]+)?").unwrap();
    static ref IDENT: Regex = Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*").unwrap();
}

/// Splits a formula into tokens. `**` is read as `^`.
pub fn tokenize(text: &str) -> anyhow::Result<Vec<Token>>
{
    let mut tokens = Vec::new();
    let mut pos = 0;

    while pos < text.len()
    {
        let rest = &text[pos..];
        let c = match rest.chars().next()
        {
            Some(c) => c,
            None => break,
        };

        if c.is_whitespace()
        {
            pos += c.len_utf8();
            continue;
        }

        let (token, len) = match c
        {
            '(' => (Token::LeftParenthesis, 1),
            ')' => (Token::RightParenthesis, 1),
            '+' => (Token::Plus, 1),
            '-' => (Token::Minus, 1),
            '/' => (Token::Div, 1),
            '^' => (Token::Exp, 1),
            '*' if rest.starts_with("**") => (Token::Exp, 2),
            '*' => (Token::Mul, 1),
            _ => {
                if let Some(m) = NUMBER.find(rest)
                {
                    let num = m.as_str().parse::<f64>().map_err(|_| ParseError::UnknownToken)?;
                    (Token::Num(num), m.end())
                }
                else if let Some(m) = IDENT.find(rest)
                {
                    (Token::Ident(m.as_str().to_owned()), m.end())
                }
                else
                {
                    return Err(ParseError::UnknownToken.into());
                }
            },
        };

        tokens.push(token);
        pos += len;
    }

    Ok(tokens)
}

#[derive(Clone, Copy, Debug, PartialEq)]
enum Operator {
    Add,
    Sub,
    Mul,
    Div,
    Pow,
    Neg,
}

impl Operator
{
    fn precedence(self) -> i32
    {
        match self
        {
            Operator::Pow => 4,
            Operator::Neg => 3,
            Operator::Mul | Operator::Div => 2,
            Operator::Add | Operator::Sub => 1,
        }
    }

    fn from_token(token: &Token) -> Option<Operator>
    {
        match token
        {
            Token::Plus => Some(Operator::Add),
            Token::Minus => Some(Operator::Sub),
            Token::Mul => Some(Operator::Mul),
            Token::Div => Some(Operator::Div),
            Token::Exp => Some(Operator::Pow),
            _ => None,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq)]
enum Pending {
    LeftParenthesis,
    Op(Operator),
    Func(Function),
}

#[derive(Clone, Debug, PartialEq)]
enum Rpn {
    Num(f64),
    Var(String),
    Op(Operator),
    Func(Function),
}

/// Whether `o2`, sitting on the operator stack, must be output before `o1` is pushed.
fn prec_check(o1: Operator, o2: Operator) -> bool
{
    let check1 = o2.precedence() > o1.precedence();
    let check2 = o2.precedence() == o1.precedence() && o1 != Operator::Pow;
    check1 || check2
}

/// See shunting yard implementation details at:
/// https://en.wikipedia.org/wiki/Shunting_yard_algorithm
///
/// Unlike the textbook version, this one tracks whether an operand or an
/// operator is expected next, so juxtaposed operands and dangling operators
/// are rejected instead of producing a malformed queue.
fn rpnify(tokens: &[Token]) -> anyhow::Result<Vec<Rpn>>
{
    let mut stack: Vec<Pending> = Vec::new();
    let mut queue: Vec<Rpn> = Vec::new();
    let mut expect_operand = true; // also marks the next '-' or '+' as unary

    let mut iter = tokens.iter().peekable();
    while let Some(token) = iter.next()
    {
        match token
        {
            Token::Num(num) => {
                if !expect_operand
                {
                    return Err(ParseError::UnexpectedOperand.into());
                }
                queue.push(Rpn::Num(*num));
                expect_operand = false;
            },

            Token::Ident(name) => {
                if !expect_operand
                {
                    return Err(ParseError::UnexpectedOperand.into());
                }
                let is_call = iter.peek() == Some(&&Token::LeftParenthesis);
                match (Function::from_name(name), is_call)
                {
                    (Some(func), true) => {
                        stack.push(Pending::Func(func));
                    },
                    (None, true) => return Err(ParseError::UnknownFunction.into()),
                    (_, false) => {
                        check_variable_name(name)?;
                        queue.push(Rpn::Var(name.clone()));
                        expect_operand = false;
                    },
                }
            },

            Token::LeftParenthesis => {
                if !expect_operand
                {
                    return Err(ParseError::UnexpectedOperand.into());
                }
                stack.push(Pending::LeftParenthesis);
            },

            Token::RightParenthesis => {
                if expect_operand
                {
                    return Err(ParseError::ExpectedArg.into());
                }
                loop
                {
                    match stack.pop()
                    {
                        Some(Pending::LeftParenthesis) => break,
                        Some(Pending::Op(op)) => queue.push(Rpn::Op(op)),
                        Some(Pending::Func(_)) | None => return Err(ParseError::UnbalancedParenthesis.into()),
                    }
                }
                if let Some(Pending::Func(func)) = stack.last().copied()
                {
                    stack.pop();
                    queue.push(Rpn::Func(func));
                }
                expect_operand = false;
            },

            Token::Plus | Token::Minus if expect_operand => {
                // unary plus is a no-op
                if *token == Token::Minus
                {
                    stack.push(Pending::Op(Operator::Neg));
                }
            },

            other => {
                if expect_operand
                {
                    return Err(ParseError::UnexpectedOperator.into());
                }
                let o1 = Operator::from_token(other).ok_or(ParseError::UnknownToken)?;
                while let Some(&Pending::Op(o2)) = stack.last()
                {
                    if prec_check(o1, o2)
                    {
                        stack.pop();
                        queue.push(Rpn::Op(o2));
                    }
                    else
                    {
                        break;
                    }
                }
                stack.push(Pending::Op(o1));
                expect_operand = true;
            },
        }
    }

    if expect_operand
    {
        return Err(ParseError::ExpectedArg.into());
    }

    while let Some(pending) = stack.pop()
    {
        match pending
        {
            Pending::Op(op) => queue.push(Rpn::Op(op)),
            Pending::LeftParenthesis => return Err(ParseError::UnbalancedParenthesis.into()),
            Pending::Func(_) => return Err(ParseError::MisplacedFunction.into()),
        }
    }

    Ok(queue)
}

/// Deepest expression tree a formula may produce. Trees are walked
/// recursively, so anything deeper is rejected while it is being built.
pub const MAX_DEPTH: usize = 200;

/// Rebuilds an expression tree from reverse polish notation, keeping the
/// structure exactly as written. Fails with `ParseError::TooDeep` past
/// [`MAX_DEPTH`].
fn treeify(rpn: Vec<Rpn>) -> anyhow::Result<Expr>
{
    // each entry carries the depth of its subtree
    let mut stack: Vec<(Expr, usize)> = Vec::new();

    for item in rpn
    {
        let (node, depth) = match item
        {
            Rpn::Num(num) => (Expr::Num(num), 1),
            Rpn::Var(name) => (Expr::Var(name), 1),
            Rpn::Func(func) => {
                let (arg, depth) = stack.pop().ok_or(ParseError::ExpectedArg)?;
                (Expr::Call(func, Box::new(arg)), depth + 1)
            },
            Rpn::Op(Operator::Neg) => {
                let (arg, depth) = stack.pop().ok_or(ParseError::ExpectedArg)?;
                (Expr::Neg(Box::new(arg)), depth + 1)
            },
            Rpn::Op(op) => {
                let ((b, db), (a, da)) = match (stack.pop(), stack.pop())
                {
                    (Some(b), Some(a)) => (b, a),
                    _ => return Err(ParseError::ExpectedArg.into()),
                };
                let (a, b) = (Box::new(a), Box::new(b));
                let node = match op
                {
                    Operator::Add => Expr::Add(a, b),
                    Operator::Sub => Expr::Sub(a, b),
                    Operator::Mul => Expr::Mul(a, b),
                    Operator::Div => Expr::Div(a, b),
                    _ => Expr::Pow(a, b),
                };
                (node, da.max(db) + 1)
            },
        };

        if depth > MAX_DEPTH
        {
            return Err(ParseError::TooDeep.into());
        }
        stack.push((node, depth));
    }

    match stack.len()
    {
        1 => stack.pop().map(|(expr, _)| expr).ok_or_else(|| ParseError::ExpectedArg.into()),
        0 => Err(ParseError::EmptyFormula.into()),
        _ => Err(ParseError::LeftoverToken.into()),
    }
}

/// Parses a single arithmetic expression (no `=`) into a tree.
///
/// # Example
/// ```
/// use nearfeas::shunting::parse_expression;
///
/// let expr = parse_expression("2 * (x + 1) ** 2").unwrap();
///
/// assert_eq!(expr.to_string(), "2*(x + 1)^2");
/// assert!(parse_expression("2 +* x").is_err());
/// ```
pub fn parse_expression(text: &str) -> anyhow::Result<Expr>
{
    if text.trim().is_empty()
    {
        return Err(ParseError::EmptyFormula.into());
    }
    treeify(rpnify(&tokenize(text)?)?)
}

/// The relation a formula imposes on its variables.
#[derive(Clone, Debug, PartialEq)]
pub enum Constraint {
    /// `lhs = rhs`
    Equation { lhs: Expr, rhs: Expr },
    /// A bare expression, equated to a caller-supplied objective.
    Expression(Expr),
}

impl Constraint
{
    /// Returns the expression that vanishes exactly on the feasibility surface:
    /// `lhs - rhs` or `expr - objective`.
    pub fn residual(&self, objective: f64) -> Expr
    {
        match self
        {
            Constraint::Equation { lhs, rhs } => Expr::Sub(Box::new(lhs.clone()), Box::new(rhs.clone())),
            Constraint::Expression(expr) => Expr::Sub(Box::new(expr.clone()), Box::new(Expr::Num(objective))),
        }
    }
}

/// A parsed formula with its variables split by side.
#[derive(Clone, Debug, PartialEq)]
pub struct ParsedFormula
{
    pub constraint: Constraint,
    /// Variables of the left side, or of the whole bare expression.
    pub left_variables: BTreeSet<String>,
    /// Variables of the right side; empty for a bare expression.
    pub right_variables: BTreeSet<String>,
}

impl ParsedFormula
{
    /// All variables of the formula in lexicographic order.
    pub fn variables(&self) -> Vec<String>
    {
        self.left_variables
            .union(&self.right_variables)
            .cloned()
            .collect()
    }
}

/// Parses a formula, either `lhs = rhs` or a bare expression.
///
/// # Example
/// ```
/// use nearfeas::shunting::parse_formula;
///
/// let parsed = parse_formula("p * f = c + sqrt(b)").unwrap();
///
/// assert_eq!(parsed.variables(), vec!["b", "c", "f", "p"]);
/// assert!(parsed.right_variables.contains("b"));
/// assert!(!parsed.right_variables.contains("sqrt"));
/// ```
pub fn parse_formula(text: &str) -> anyhow::Result<ParsedFormula>
{
    let sides: Vec<&str> = text.split('=').collect();
    let parsed = match sides.len()
    {
        1 => {
            let expr = parse_expression(sides[0])?;
            ParsedFormula
            {
                left_variables: expr.variables(),
                right_variables: BTreeSet::new(),
                constraint: Constraint::Expression(expr),
            }
        },
        2 => {
            let lhs = parse_expression(sides[0])?;
            let rhs = parse_expression(sides[1])?;
            ParsedFormula
            {
                left_variables: lhs.variables(),
                right_variables: rhs.variables(),
                constraint: Constraint::Equation { lhs, rhs },
            }
        },
        _ => return Err(ParseError::MultipleEquals.into()),
    };

    if parsed.left_variables.is_empty() && parsed.right_variables.is_empty()
    {
        return Err(ParseError::NoVariables.into());
    }

    debug!(formula = text, variables = ?parsed.variables(), "parsed formula");
    Ok(parsed)
}

#[test]
fn test_tokenize()
{
    let tokens = tokenize("3.5e-1*x_1 ** 2").unwrap();
    assert_eq!(
        tokens,
        vec![Token::Num(0.35), Token::Mul, Token::Ident("x_1".to_owned()), Token::Exp, Token::Num(2.0)]
    );
    assert!(tokenize("a.b").is_err());
    assert!(tokenize("a; b").is_err());
}

#[test]
fn test_rpnify()
{
    let rpn = rpnify(&tokenize("3+4").unwrap()).unwrap();
    assert_eq!(rpn, vec![Rpn::Num(3.0), Rpn::Num(4.0), Rpn::Op(Operator::Add)])
}

#[test]
fn test_unary_minus_binds_looser_than_power()
{
    let expr = parse_expression("-x^2").unwrap();
    assert_eq!(expr, Expr::Neg(Box::new(Expr::Pow(Box::new(Expr::var("x")), Box::new(Expr::Num(2.0))))));

    let expr = parse_expression("2^-x").unwrap();
    assert_eq!(expr, Expr::Pow(Box::new(Expr::Num(2.0)), Box::new(Expr::Neg(Box::new(Expr::var("x"))))));
}

#[test]
fn test_power_is_right_associative()
{
    let expr = parse_expression("a^b^c").unwrap();
    assert_eq!(expr.to_string(), "a^b^c");
    let expected = Expr::Pow(
        Box::new(Expr::var("a")),
        Box::new(Expr::Pow(Box::new(Expr::var("b")), Box::new(Expr::var("c")))),
    );
    assert_eq!(expr, expected);
}

#[test]
fn test_parse_errors()
{
    let cases = [
        ("a +* b", ParseError::UnexpectedOperator),
        ("a b", ParseError::UnexpectedOperand),
        ("2(a)", ParseError::UnexpectedOperand),
        ("(a + b", ParseError::UnbalancedParenthesis),
        ("a + b)", ParseError::UnbalancedParenthesis),
        ("a +", ParseError::ExpectedArg),
        ("()", ParseError::ExpectedArg),
        ("sin(a)", ParseError::UnknownFunction),
        ("a = b = c", ParseError::MultipleEquals),
        ("a == b", ParseError::MultipleEquals),
        (" = b", ParseError::EmptyFormula),
        ("1 + 2", ParseError::NoVariables),
        ("a.b + 1", ParseError::UnknownToken),
    ];
    for (text, expected) in cases
    {
        let err = parse_formula(text).unwrap_err();
        assert_eq!(err.downcast_ref::<ParseError>(), Some(&expected), "{text}");
    }
}

#[test]
fn test_whitelisted_function_is_not_a_variable()
{
    let parsed = parse_formula("sqrt(x) + exp(y) - ln(z)").unwrap();
    assert_eq!(parsed.variables(), vec!["x", "y", "z"]);

    let err = parse_formula("sqrt + 1").unwrap_err();
    assert!(err.downcast_ref::<crate::errors::ForbiddenVariableError>().is_some());
}

#[test]
fn test_variables_are_sorted_and_unique()
{
    let parsed = parse_formula("218*t*p*f - (p+s)*(b*1.38+12*n) + c").unwrap();
    assert_eq!(parsed.variables(), vec!["b", "c", "f", "n", "p", "s", "t"]);
    assert!(parsed.right_variables.is_empty());
}

#[test]
fn test_deep_formulas_are_rejected()
{
    let shallow = format!("{}x = y", "-".repeat(MAX_DEPTH - 1));
    assert!(parse_formula(&shallow).is_ok());

    let cases = [
        format!("{}x = y", "-".repeat(100_000)),
        format!("x{}", " + x".repeat(100_000)),
        format!("{}x{}", "sqrt(".repeat(MAX_DEPTH), ")".repeat(MAX_DEPTH)),
    ];
    for formula in &cases
    {
        let err = parse_formula(formula).unwrap_err();
        assert_eq!(err.downcast_ref::<ParseError>(), Some(&ParseError::TooDeep));
    }

    // parentheses alone do not nest the tree
    let wrapped = format!("{}x{} = y", "(".repeat(100_000), ")".repeat(100_000));
    assert!(parse_formula(&wrapped).is_ok());
}
