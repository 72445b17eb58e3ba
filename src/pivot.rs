use tracing::{debug, warn};

use crate::context::Function;
use crate::errors::NoSolutionError;
use crate::expr::{Expr, Program};
use crate::shunting::ParsedFormula;

/// Highest power of the pivot the polynomial strategy handles.
const MAX_DEGREE: usize = 2;

/// The pivot of a formula written as closed-form functions of the other variables.
#[derive(Clone, Debug, PartialEq)]
pub struct Isolation
{
    pub pivot: String,
    /// Non-pivot variables in lexicographic order. This is the argument order of
    /// [`Isolation::eval`].
    pub args: Vec<String>,
    /// Every root found, in the order the solver produced them. Only the first
    /// one is used; the others are kept so callers can see what was discarded.
    pub candidates: Vec<Expr>,
    program: Program,
}

impl Isolation
{
    /// The closed form actually used for the pivot.
    pub fn expr(&self) -> &Expr
    {
        &self.candidates[0]
    }

    /// Computes the pivot from the non-pivot values, ordered like `self.args`.
    pub fn eval(&self, values: &[f64]) -> anyhow::Result<f64>
    {
        self.program.eval(values)
    }
}

/// Isolates `pivot` in a parsed formula, equating bare expressions to `objective`.
///
/// Two strategies are tried in order. If the constraint is a polynomial of
/// degree one or two in the pivot (with coefficients free of the pivot), the
/// roots come from the linear or quadratic formula, the `-` root first. Otherwise,
/// if the pivot occurs exactly once, the operations around it are inverted one by
/// one. Even powers and square roots produce two roots there too, negative first.
///
/// When more than one root exists, the first is taken without checking that it
/// makes sense for the caller (a negative headcount, say).
///
/// # Example
/// ```
/// use nearfeas::shunting::parse_formula;
/// use nearfeas::pivot::isolate;
///
/// let parsed = parse_formula("a + b - 10 = 0").unwrap();
/// let iso = isolate(&parsed, "a", 0.0).unwrap();
///
/// assert_eq!(iso.args, vec!["b"]);
/// assert_eq!(iso.eval(&[3.0]).unwrap(), 7.0);
/// ```
pub fn isolate(parsed: &ParsedFormula, pivot: &str, objective: f64) -> anyhow::Result<Isolation>
{
    let variables = parsed.variables();
    if !variables.iter().any(|v| v == pivot)
    {
        return Err(NoSolutionError::PivotNotInFormula.into());
    }
    let args: Vec<String> = variables.into_iter().filter(|v| v != pivot).collect();

    let residual = parsed.constraint.residual(objective);
    let candidates = solve_for(&residual, pivot)?;

    debug!(pivot, candidates = ?candidates.iter().map(|c| c.to_string()).collect::<Vec<_>>(), "isolated pivot");
    if candidates.len() > 1
    {
        warn!(pivot, roots = candidates.len(), chosen = %candidates[0], "pivot has several roots, using the first");
    }

    let program = candidates[0].compile(&args)?;
    Ok(Isolation
    {
        pivot: pivot.to_owned(),
        args,
        candidates,
        program,
    })
}

/// Solves `residual = 0` for `pivot`, returning at least one root.
pub fn solve_for(residual: &Expr, pivot: &str) -> anyhow::Result<Vec<Expr>>
{
    if !residual.contains(pivot)
    {
        return Err(NoSolutionError::PivotCancelsOut.into());
    }

    let roots = match polynomial(residual, pivot)
    {
        Some(coefs) => polynomial_roots(coefs)?,
        None if residual.occurrences(pivot) == 1 => peel(residual, Expr::Num(0.0), pivot)?,
        None => return Err(NoSolutionError::NotIsolatable.into()),
    };

    if roots.is_empty()
    {
        return Err(NoSolutionError::NotIsolatable.into());
    }
    Ok(roots)
}

/// Coefficients of `expr` as a polynomial in `pivot`, lowest degree first,
/// or `None` if it is not one of degree `MAX_DEGREE` or less.
fn polynomial(expr: &Expr, pivot: &str) -> Option<Vec<Expr>>
{
    if !expr.contains(pivot)
    {
        return Some(vec![expr.clone()]);
    }

    let coefs = match expr
    {
        Expr::Var(_) => vec![Expr::Num(0.0), Expr::Num(1.0)],
        Expr::Neg(a) => polynomial(a, pivot)?.into_iter().map(Expr::neg).collect(),
        Expr::Add(a, b) => zip_with(polynomial(a, pivot)?, polynomial(b, pivot)?, Expr::add),
        Expr::Sub(a, b) => zip_with(polynomial(a, pivot)?, polynomial(b, pivot)?, Expr::sub),
        Expr::Mul(a, b) => poly_mul(&polynomial(a, pivot)?, &polynomial(b, pivot)?)?,
        Expr::Div(a, b) if !b.contains(pivot) => polynomial(a, pivot)?
            .into_iter()
            .map(|c| Expr::div(c, (**b).clone()))
            .collect(),
        Expr::Pow(a, b) => {
            let k = b.as_num()?;
            if k.fract() != 0.0 || k < 0.0 || k > MAX_DEGREE as f64
            {
                return None;
            }
            let base = polynomial(a, pivot)?;
            let mut acc = vec![Expr::Num(1.0)];
            for _ in 0..(k as usize)
            {
                acc = poly_mul(&acc, &base)?;
            }
            acc
        },
        _ => return None,
    };

    Some(trim(coefs))
}

fn zip_with(a: Vec<Expr>, b: Vec<Expr>, op: fn(Expr, Expr) -> Expr) -> Vec<Expr>
{
    let len = a.len().max(b.len());
    let mut a = a.into_iter();
    let mut b = b.into_iter();
    (0..len)
        .map(|_| {
            let x = a.next().unwrap_or(Expr::Num(0.0));
            let y = b.next().unwrap_or(Expr::Num(0.0));
            op(x, y)
        })
        .collect()
}

fn poly_mul(a: &[Expr], b: &[Expr]) -> Option<Vec<Expr>>
{
    let a = trim(a.to_vec());
    let b = trim(b.to_vec());
    if a.is_empty() || b.is_empty()
    {
        return Some(Vec::new());
    }
    if a.len() + b.len() - 2 > MAX_DEGREE
    {
        return None;
    }

    let mut out = vec![Expr::Num(0.0); a.len() + b.len() - 1];
    for (i, x) in a.iter().enumerate()
    {
        for (j, y) in b.iter().enumerate()
        {
            let term = Expr::mul(x.clone(), y.clone());
            out[i + j] = Expr::add(out[i + j].clone(), term);
        }
    }
    Some(out)
}

/// Drops coefficients that are literally zero from the top.
fn trim(mut coefs: Vec<Expr>) -> Vec<Expr>
{
    while coefs.last().map_or(false, Expr::is_zero)
    {
        coefs.pop();
    }
    coefs
}

fn polynomial_roots(coefs: Vec<Expr>) -> anyhow::Result<Vec<Expr>>
{
    let two = || Expr::Num(2.0);
    match coefs.as_slice()
    {
        [] | [_] => Err(NoSolutionError::PivotCancelsOut.into()),
        [c, b] => Ok(vec![Expr::neg(Expr::div(c.clone(), b.clone()))]),
        [c, b, a] => {
            let disc = Expr::sub(
                Expr::pow(b.clone(), two()),
                Expr::mul(Expr::mul(Expr::Num(4.0), a.clone()), c.clone()),
            );
            let root = Expr::call(Function::Sqrt, disc);
            let denom = Expr::mul(two(), a.clone());
            let minus = Expr::div(Expr::sub(Expr::neg(b.clone()), root.clone()), denom.clone());
            let plus = Expr::div(Expr::add(Expr::neg(b.clone()), root), denom);
            Ok(vec![minus, plus])
        },
        _ => Err(NoSolutionError::NotIsolatable.into()),
    }
}

/// Solves `lhs = rhs` for a pivot occurring exactly once in `lhs`, undoing the
/// outermost operation at each step.
fn peel(lhs: &Expr, rhs: Expr, pivot: &str) -> anyhow::Result<Vec<Expr>>
{
    match lhs
    {
        Expr::Var(name) if name == pivot => Ok(vec![rhs]),
        Expr::Neg(a) => peel(a, Expr::neg(rhs), pivot),
        Expr::Add(a, b) if a.contains(pivot) => peel(a, Expr::sub(rhs, (**b).clone()), pivot),
        Expr::Add(a, b) => peel(b, Expr::sub(rhs, (**a).clone()), pivot),
        Expr::Sub(a, b) if a.contains(pivot) => peel(a, Expr::add(rhs, (**b).clone()), pivot),
        Expr::Sub(a, b) => peel(b, Expr::sub((**a).clone(), rhs), pivot),
        Expr::Mul(a, b) if a.contains(pivot) => peel(a, Expr::div(rhs, (**b).clone()), pivot),
        Expr::Mul(a, b) => peel(b, Expr::div(rhs, (**a).clone()), pivot),
        Expr::Div(a, b) if a.contains(pivot) => peel(a, Expr::mul(rhs, (**b).clone()), pivot),
        Expr::Div(a, b) => peel(b, Expr::div((**a).clone(), rhs), pivot),
        Expr::Pow(a, b) if a.contains(pivot) => {
            let mut roots = Vec::new();
            for branch in nth_roots(rhs, b)
            {
                roots.extend(peel(a, branch, pivot)?);
            }
            Ok(roots)
        },
        Expr::Pow(a, b) => {
            let exponent = Expr::div(Expr::call(Function::Ln, rhs), Expr::call(Function::Ln, (**a).clone()));
            peel(b, exponent, pivot)
        },
        Expr::Call(func, a) => {
            let inverse = match func
            {
                Function::Sqrt => Expr::pow(rhs, Expr::Num(2.0)),
                Function::Exp => Expr::call(Function::Ln, rhs),
                Function::Ln => Expr::call(Function::Exp, rhs),
            };
            peel(a, inverse, pivot)
        },
        _ => Err(NoSolutionError::NotIsolatable.into()),
    }
}

/// Real solutions `u` of `u^exponent = rhs`, negative branch first for even powers.
fn nth_roots(rhs: Expr, exponent: &Expr) -> Vec<Expr>
{
    let principal = match exponent.as_num()
    {
        Some(k) if k == 2.0 => Expr::call(Function::Sqrt, rhs),
        _ => Expr::pow(rhs, Expr::div(Expr::Num(1.0), exponent.clone())),
    };

    match exponent.as_num()
    {
        Some(k) if k != 0.0 && k.fract() == 0.0 && (k as i64) % 2 == 0 => {
            vec![Expr::neg(principal.clone()), principal]
        },
        _ => vec![principal],
    }
}

#[cfg(test)]
fn isolate_str(formula: &str, pivot: &str) -> anyhow::Result<Isolation>
{
    isolate(&crate::shunting::parse_formula(formula)?, pivot, 0.0)
}

#[test]
fn test_linear_pivot()
{
    let iso = isolate_str("218*t*p*f - (p+s)*(b*1.38+12*n) + c", "f").unwrap();
    assert_eq!(iso.candidates.len(), 1);
    assert_eq!(iso.args, vec!["b", "c", "n", "p", "s", "t"]);

    let (b, c, n, p, s, t) = (39000.0, 120000.0, 290.0, 16.0, 7.0, 600.0);
    let expected = ((p + s) * (b * 1.38 + 12.0 * n) - c) / (218.0 * t * p);
    let f = iso.eval(&[b, c, n, p, s, t]).unwrap();
    assert!((f - expected).abs() < 1e-12);
}

#[test]
fn test_pivot_on_both_sides()
{
    let iso = isolate_str("2*x + y = x / 2 + 3", "x").unwrap();
    // 1.5 x = 3 - y
    assert!((iso.eval(&[1.5]).unwrap() - 1.0).abs() < 1e-12);
}

#[test]
fn test_quadratic_takes_negative_root_first()
{
    let iso = isolate_str("x^2 = c", "x").unwrap();
    assert_eq!(iso.candidates.len(), 2);
    assert_eq!(iso.eval(&[9.0]).unwrap(), -3.0);

    let positive = iso.candidates[1].compile(&iso.args).unwrap();
    assert_eq!(positive.eval(&[9.0]).unwrap(), 3.0);
}

#[test]
fn test_full_quadratic()
{
    // x^2 - 3x + 2 = (x - 1)(x - 2)
    let iso = isolate_str("(x - 1)*(x - k)", "x").unwrap();
    let roots: Vec<f64> = iso
        .candidates
        .iter()
        .map(|c| c.compile(&iso.args).unwrap().eval(&[2.0]).unwrap())
        .collect();
    assert_eq!(roots.len(), 2);
    assert!((roots[0] - 1.0).abs() < 1e-12);
    assert!((roots[1] - 2.0).abs() < 1e-12);
}

#[test]
fn test_peeling_inverts_functions()
{
    let iso = isolate_str("sqrt(x) = y + 1", "x").unwrap();
    assert_eq!(iso.eval(&[2.0]).unwrap(), 9.0);

    let iso = isolate_str("exp(2*x) = y", "x").unwrap();
    assert!((iso.eval(&[1.0]).unwrap()).abs() < 1e-12);

    let iso = isolate_str("a / x = 4", "x").unwrap();
    assert_eq!(iso.eval(&[2.0]).unwrap(), 0.5);

    let iso = isolate_str("2 ^ x = y", "x").unwrap();
    assert!((iso.eval(&[8.0]).unwrap() - 3.0).abs() < 1e-12);

    let iso = isolate_str("x ^ 3 = y", "x").unwrap();
    assert_eq!(iso.candidates.len(), 1);
    assert!((iso.eval(&[8.0]).unwrap() - 2.0).abs() < 1e-12);
}

#[test]
fn test_unsolvable_pivots()
{
    let err = isolate_str("x - x + y", "x").unwrap_err();
    assert_eq!(err.downcast_ref::<NoSolutionError>(), Some(&NoSolutionError::PivotCancelsOut));

    let err = isolate_str("x + sqrt(x) = y", "x").unwrap_err();
    assert_eq!(err.downcast_ref::<NoSolutionError>(), Some(&NoSolutionError::NotIsolatable));

    let err = isolate_str("x + y", "z").unwrap_err();
    assert_eq!(err.downcast_ref::<NoSolutionError>(), Some(&NoSolutionError::PivotNotInFormula));
}

#[test]
fn test_isolation_is_deterministic()
{
    let first = isolate_str("p*f = c + s*b", "f").unwrap();
    let second = isolate_str("p*f = c + s*b", "f").unwrap();
    assert_eq!(first, second);
}
