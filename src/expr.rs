use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use crate::context::Function;
use crate::errors::{EvaluationError, InputError};

/// A parsed arithmetic expression.
///
/// Trees built through the associated constructors (`Expr::add`, `Expr::mul`, ...)
/// fold numeric subtrees and drop neutral elements, which keeps the closed forms
/// produced by the pivot solver readable. The parser does not use them, so a
/// parsed tree keeps every variable exactly as written.
#[derive(Clone, Debug, PartialEq)]
pub enum Expr {
    Num(f64),
    Var(String),
    Neg(Box<Expr>),
    Add(Box<Expr>, Box<Expr>),
    Sub(Box<Expr>, Box<Expr>),
    Mul(Box<Expr>, Box<Expr>),
    Div(Box<Expr>, Box<Expr>),
    Pow(Box<Expr>, Box<Expr>),
    Call(Function, Box<Expr>),
}

impl Expr
{
    pub fn var(name: &str) -> Expr
    {
        Expr::Var(name.to_owned())
    }

    pub fn as_num(&self) -> Option<f64>
    {
        match self
        {
            Expr::Num(x) => Some(*x),
            _ => None,
        }
    }

    pub fn is_zero(&self) -> bool
    {
        self.as_num() == Some(0.0)
    }

    fn is_one(&self) -> bool
    {
        self.as_num() == Some(1.0)
    }

    pub fn neg(a: Expr) -> Expr
    {
        match a
        {
            Expr::Num(x) => Expr::Num(-x),
            Expr::Neg(inner) => *inner,
            other => Expr::Neg(Box::new(other)),
        }
    }

    pub fn add(a: Expr, b: Expr) -> Expr
    {
        match (a, b)
        {
            (Expr::Num(x), Expr::Num(y)) => Expr::Num(x + y),
            (a, b) if a.is_zero() => b,
            (a, b) if b.is_zero() => a,
            (a, Expr::Neg(b)) => Expr::Sub(Box::new(a), b),
            (a, b) => Expr::Add(Box::new(a), Box::new(b)),
        }
    }

    pub fn sub(a: Expr, b: Expr) -> Expr
    {
        match (a, b)
        {
            (Expr::Num(x), Expr::Num(y)) => Expr::Num(x - y),
            (a, b) if b.is_zero() => a,
            (a, b) if a.is_zero() => Expr::neg(b),
            (a, Expr::Neg(b)) => Expr::Add(Box::new(a), b),
            (a, b) => Expr::Sub(Box::new(a), Box::new(b)),
        }
    }

    pub fn mul(a: Expr, b: Expr) -> Expr
    {
        match (a, b)
        {
            (Expr::Num(x), Expr::Num(y)) => Expr::Num(x * y),
            (a, _) if a.is_zero() => Expr::Num(0.0),
            (_, b) if b.is_zero() => Expr::Num(0.0),
            (a, b) if a.is_one() => b,
            (a, b) if b.is_one() => a,
            (Expr::Num(x), b) if x == -1.0 => Expr::neg(b),
            (a, Expr::Num(y)) if y == -1.0 => Expr::neg(a),
            (a, b) => Expr::Mul(Box::new(a), Box::new(b)),
        }
    }

    pub fn div(a: Expr, b: Expr) -> Expr
    {
        match (a, b)
        {
            // A literal zero denominator is left for evaluation to reject.
            (Expr::Num(x), Expr::Num(y)) if y != 0.0 => Expr::Num(x / y),
            (a, b) if b.is_one() => a,
            (a, b) if a.is_zero() && !b.is_zero() => Expr::Num(0.0),
            (a, b) => Expr::Div(Box::new(a), Box::new(b)),
        }
    }

    pub fn pow(a: Expr, b: Expr) -> Expr
    {
        match (a, b)
        {
            (Expr::Num(x), Expr::Num(y)) if x.powf(y).is_finite() => Expr::Num(x.powf(y)),
            (_, b) if b.is_zero() => Expr::Num(1.0),
            (a, b) if b.is_one() => a,
            (a, b) => Expr::Pow(Box::new(a), Box::new(b)),
        }
    }

    pub fn call(func: Function, a: Expr) -> Expr
    {
        match a
        {
            Expr::Num(x) if func.apply(x).is_finite() => Expr::Num(func.apply(x)),
            other => Expr::Call(func, Box::new(other)),
        }
    }

    /// Returns the sorted set of variables referenced anywhere in the tree.
    pub fn variables(&self) -> BTreeSet<String>
    {
        let mut found = BTreeSet::new();
        self.collect_variables(&mut found);
        found
    }

    fn collect_variables(&self, found: &mut BTreeSet<String>)
    {
        match self
        {
            Expr::Num(_) => {},
            Expr::Var(name) => {
                found.insert(name.clone());
            },
            Expr::Neg(a) | Expr::Call(_, a) => a.collect_variables(found),
            Expr::Add(a, b) | Expr::Sub(a, b) | Expr::Mul(a, b) | Expr::Div(a, b) | Expr::Pow(a, b) => {
                a.collect_variables(found);
                b.collect_variables(found);
            },
        }
    }

    /// Counts the occurrences of `var` in the tree.
    pub fn occurrences(&self, var: &str) -> usize
    {
        match self
        {
            Expr::Num(_) => 0,
            Expr::Var(name) => usize::from(name == var),
            Expr::Neg(a) | Expr::Call(_, a) => a.occurrences(var),
            Expr::Add(a, b) | Expr::Sub(a, b) | Expr::Mul(a, b) | Expr::Div(a, b) | Expr::Pow(a, b) => {
                a.occurrences(var) + b.occurrences(var)
            },
        }
    }

    pub fn contains(&self, var: &str) -> bool
    {
        self.occurrences(var) > 0
    }

    /// Compiles the tree to a postfix program whose variables are read from
    /// positional arguments ordered like `args`.
    ///
    /// # Example
    /// ```
    /// use nearfeas::shunting::parse_expression;
    ///
    /// let expr = parse_expression("x * y + 1").unwrap();
    /// let program = expr.compile(&["x".to_owned(), "y".to_owned()]).unwrap();
    ///
    /// assert_eq!(program.eval(&[2.0, 3.0]).unwrap(), 7.0);
    /// ```
    pub fn compile(&self, args: &[String]) -> anyhow::Result<Program>
    {
        let mut ops = Vec::new();
        self.emit(args, &mut ops)?;
        Ok(Program { ops, arity: args.len() })
    }

    fn emit(&self, args: &[String], ops: &mut Vec<Op>) -> anyhow::Result<()>
    {
        match self
        {
            Expr::Num(x) => ops.push(Op::Num(*x)),
            Expr::Var(name) => {
                let slot = args
                    .iter()
                    .position(|arg| arg == name)
                    .ok_or_else(|| InputError::MissingValue(name.clone()))?;
                ops.push(Op::Slot(slot));
            },
            Expr::Neg(a) => {
                a.emit(args, ops)?;
                ops.push(Op::Neg);
            },
            Expr::Call(func, a) => {
                a.emit(args, ops)?;
                ops.push(Op::Call(*func));
            },
            Expr::Add(a, b) | Expr::Sub(a, b) | Expr::Mul(a, b) | Expr::Div(a, b) | Expr::Pow(a, b) => {
                a.emit(args, ops)?;
                b.emit(args, ops)?;
                ops.push(match self
                {
                    Expr::Add(..) => Op::Add,
                    Expr::Sub(..) => Op::Sub,
                    Expr::Mul(..) => Op::Mul,
                    Expr::Div(..) => Op::Div,
                    _ => Op::Pow,
                });
            },
        }
        Ok(())
    }

    /// Evaluates the tree with variable values looked up by name.
    pub fn eval(&self, values: &BTreeMap<String, f64>) -> anyhow::Result<f64>
    {
        let args: Vec<String> = self.variables().into_iter().collect();
        let mut inputs = Vec::with_capacity(args.len());
        for arg in &args
        {
            match values.get(arg)
            {
                Some(value) => inputs.push(*value),
                None => return Err(InputError::MissingValue(arg.clone()).into()),
            }
        }
        self.compile(&args)?.eval(&inputs)
    }

    fn precedence(&self) -> u8
    {
        match self
        {
            Expr::Add(..) | Expr::Sub(..) => 1,
            Expr::Mul(..) | Expr::Div(..) => 2,
            Expr::Neg(_) => 3,
            Expr::Num(x) if *x < 0.0 => 3,
            Expr::Pow(..) => 4,
            _ => 5,
        }
    }
}

fn wrap(f: &mut fmt::Formatter, child: &Expr, min: u8) -> fmt::Result
{
    if child.precedence() < min
    {
        write!(f, "({child})")
    }
    else
    {
        write!(f, "{child}")
    }
}

impl fmt::Display for Expr
{
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result
    {
        match self
        {
            Expr::Num(x) => write!(f, "{x}"),
            Expr::Var(name) => write!(f, "{name}"),
            Expr::Call(func, a) => write!(f, "{func}({a})"),
            Expr::Neg(a) => {
                write!(f, "-")?;
                wrap(f, a, 4)
            },
            Expr::Add(a, b) => {
                wrap(f, a, 1)?;
                write!(f, " + ")?;
                wrap(f, b, 1)
            },
            Expr::Sub(a, b) => {
                wrap(f, a, 1)?;
                write!(f, " - ")?;
                wrap(f, b, 2)
            },
            Expr::Mul(a, b) => {
                wrap(f, a, 2)?;
                write!(f, "*")?;
                wrap(f, b, 3)
            },
            Expr::Div(a, b) => {
                wrap(f, a, 2)?;
                write!(f, "/")?;
                wrap(f, b, 4)
            },
            Expr::Pow(a, b) => {
                wrap(f, a, 5)?;
                write!(f, "^")?;
                wrap(f, b, 4)
            },
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq)]
enum Op {
    Num(f64),
    Slot(usize),
    Neg,
    Add,
    Sub,
    Mul,
    Div,
    Pow,
    Call(Function),
}

/// An expression 'compiled' to reverse polish notation over positional
/// arguments. Evaluating it never allocates beyond the operand stack and
/// rejects any intermediate value that is not a finite real number.
#[derive(Clone, Debug, PartialEq)]
pub struct Program
{
    ops: Vec<Op>,
    arity: usize,
}

impl Program
{
    pub fn eval(&self, args: &[f64]) -> anyhow::Result<f64>
    {
        if args.len() != self.arity
        {
            return Err(EvaluationError::WrongArgCount.into());
        }

        let mut stack: Vec<f64> = Vec::with_capacity(self.ops.len());
        for op in &self.ops
        {
            let value = match op
            {
                Op::Num(x) => *x,
                Op::Slot(i) => args[*i],
                Op::Neg | Op::Call(_) => {
                    let a = stack.pop().ok_or(EvaluationError::ExpectedArg)?;
                    match op
                    {
                        Op::Call(func) => func.apply(a),
                        _ => -a,
                    }
                },
                binary => {
                    let (b, a) = match (stack.pop(), stack.pop())
                    {
                        (Some(b), Some(a)) => (b, a),
                        _ => return Err(EvaluationError::ExpectedArg.into()),
                    };
                    match binary
                    {
                        Op::Add => a + b,
                        Op::Sub => a - b,
                        Op::Mul => a * b,
                        Op::Div => {
                            if b == 0.0
                            {
                                return Err(EvaluationError::DivisionByZero.into());
                            }
                            a / b
                        },
                        _ => a.powf(b),
                    }
                },
            };

            if !value.is_finite()
            {
                return Err(EvaluationError::NonFiniteValue.into());
            }
            stack.push(value);
        }

        match stack.len()
        {
            1 => Ok(stack[0]),
            0 => Err(EvaluationError::ExpectedArg.into()),
            _ => Err(EvaluationError::LeftoverToken.into()),
        }
    }
}

#[test]
fn test_constructors_fold_constants()
{
    let x = Expr::var("x");
    assert_eq!(Expr::add(Expr::Num(2.0), Expr::Num(3.0)), Expr::Num(5.0));
    assert_eq!(Expr::mul(Expr::Num(1.0), x.clone()), x);
    assert_eq!(Expr::mul(Expr::Num(0.0), x.clone()), Expr::Num(0.0));
    assert_eq!(Expr::sub(Expr::Num(0.0), x.clone()), Expr::Neg(Box::new(x.clone())));
    assert_eq!(Expr::neg(Expr::neg(x.clone())), x);
    assert_eq!(Expr::div(Expr::Num(1.0), Expr::Num(0.0)), Expr::Div(Box::new(Expr::Num(1.0)), Box::new(Expr::Num(0.0))));
}

#[test]
fn test_display_parenthesises_by_precedence()
{
    let a = Expr::var("a");
    let b = Expr::var("b");
    let c = Expr::var("c");

    let e = Expr::mul(Expr::add(a.clone(), b.clone()), c.clone());
    assert_eq!(e.to_string(), "(a + b)*c");

    let e = Expr::sub(a.clone(), Expr::sub(b.clone(), c.clone()));
    assert_eq!(e.to_string(), "a - (b - c)");

    let e = Expr::pow(Expr::neg(a.clone()), Expr::Num(2.0));
    assert_eq!(e.to_string(), "(-a)^2");
}

#[test]
fn test_program_rejects_non_finite_values()
{
    let args = vec!["x".to_owned()];
    let sqrt = Expr::call(Function::Sqrt, Expr::var("x")).compile(&args).unwrap();
    assert_eq!(sqrt.eval(&[9.0]).unwrap(), 3.0);

    let err = sqrt.eval(&[-1.0]).unwrap_err();
    assert_eq!(err.downcast_ref::<EvaluationError>(), Some(&EvaluationError::NonFiniteValue));

    let inv = Expr::div(Expr::Num(1.0), Expr::var("x")).compile(&args).unwrap();
    let err = inv.eval(&[0.0]).unwrap_err();
    assert_eq!(err.downcast_ref::<EvaluationError>(), Some(&EvaluationError::DivisionByZero));

    let err = inv.eval(&[1.0, 2.0]).unwrap_err();
    assert_eq!(err.downcast_ref::<EvaluationError>(), Some(&EvaluationError::WrongArgCount));
}

#[test]
fn test_compile_requires_every_variable()
{
    let err = Expr::var("y").compile(&["x".to_owned()]).unwrap_err();
    assert_eq!(err.downcast_ref::<InputError>(), Some(&InputError::MissingValue("y".to_owned())));
}
