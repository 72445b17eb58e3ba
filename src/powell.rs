use std::cell::Cell;
use std::mem::swap;

use tracing::debug;

use crate::errors::{EvaluationError, OptimizationFailedError};

/// Objective functions handed to a [`Minimizer`].
pub type Objective<'f> = dyn Fn(&[f64]) -> anyhow::Result<f64> + 'f;

/// What a minimizer reports after a run.
#[derive(Clone, Debug, PartialEq)]
pub struct Minimum
{
    pub x: Vec<f64>,
    pub value: f64,
    /// `false` when the run stopped on an iteration or evaluation limit.
    pub converged: bool,
    pub iterations: usize,
    pub evaluations: usize,
}

/// A local minimizer that only needs function values.
///
/// Any error raised by the objective aborts the run and is returned as is.
pub trait Minimizer
{
    fn minimize(&self, f: &Objective, start: &[f64]) -> anyhow::Result<Minimum>;
}

/// Powell's conjugate direction method with Brent line searches.
///
/// The defaults match the usual reference settings: `xtol` and `ftol` of 1e-4,
/// and at most `1000 * n` iterations and evaluations for `n` dimensions.
#[derive(Clone, Debug, PartialEq)]
pub struct Powell
{
    /// Relative tolerance of each line search, scaled by 100 internally.
    pub xtol: f64,
    /// Relative decrease of the objective under which a sweep counts as converged.
    pub ftol: f64,
    pub max_iter: Option<usize>,
    pub max_evals: Option<usize>,
}

impl Default for Powell
{
    fn default() -> Self
    {
        Powell
        {
            xtol: 1e-4,
            ftol: 1e-4,
            max_iter: None,
            max_evals: None,
        }
    }
}

/// Counts objective evaluations and rejects non-finite values.
struct Counted<'a, 'f>
{
    f: &'a Objective<'f>,
    evaluations: Cell<usize>,
}

impl<'a, 'f> Counted<'a, 'f>
{
    fn call(&self, x: &[f64]) -> anyhow::Result<f64>
    {
        self.evaluations.set(self.evaluations.get() + 1);
        let value = (self.f)(x)?;
        if !value.is_finite()
        {
            return Err(EvaluationError::NonFiniteValue.into());
        }
        Ok(value)
    }
}

fn along(x: &[f64], direction: &[f64], alpha: f64) -> Vec<f64>
{
    x.iter().zip(direction).map(|(xi, di)| xi + alpha * di).collect()
}

/// Minimizes `f` along `direction` from `x`. Returns the new value, the new
/// point and the step actually taken.
fn line_search(f: &Counted, x: &[f64], direction: &[f64], tol: f64) -> anyhow::Result<(f64, Vec<f64>, Vec<f64>)>
{
    let (alpha, value) = brent(&|alpha| f.call(&along(x, direction, alpha)), tol)?;
    let step: Vec<f64> = direction.iter().map(|d| alpha * d).collect();
    let next = along(x, &step, 1.0);
    Ok((value, next, step))
}

impl Minimizer for Powell
{
    /// # Example
    /// ```
    /// use nearfeas::powell::{Minimizer, Powell};
    ///
    /// let bowl = |x: &[f64]| -> anyhow::Result<f64> {
    ///     Ok((x[0] - 1.0).powi(2) + 10.0 * (x[1] + 2.0).powi(2))
    /// };
    /// let min = Powell::default().minimize(&bowl, &[0.0, 0.0]).unwrap();
    ///
    /// assert!(min.converged);
    /// assert!((min.x[0] - 1.0).abs() < 1e-3);
    /// assert!((min.x[1] + 2.0).abs() < 1e-3);
    /// ```
    fn minimize(&self, f: &Objective, start: &[f64]) -> anyhow::Result<Minimum>
    {
        let n = start.len();
        let f = Counted { f, evaluations: Cell::new(0) };
        let max_iter = self.max_iter.unwrap_or(1000 * n.max(1));
        let max_evals = self.max_evals.unwrap_or(1000 * n.max(1));

        let mut x = start.to_vec();
        let mut fval = f.call(&x)?;
        if n == 0
        {
            return Ok(Minimum { x, value: fval, converged: true, iterations: 0, evaluations: 1 });
        }

        let mut directions: Vec<Vec<f64>> = (0..n)
            .map(|i| (0..n).map(|j| if i == j { 1.0 } else { 0.0 }).collect())
            .collect();
        let mut x1 = x.clone();
        let mut iterations = 0;

        let converged = loop
        {
            let fx = fval;
            let mut biggest = 0;
            let mut delta = 0.0;

            for (i, direction) in directions.iter().enumerate()
            {
                let before = fval;
                let (value, next, _) = line_search(&f, &x, direction, self.xtol * 100.0)?;
                fval = value;
                x = next;
                if before - fval > delta
                {
                    delta = before - fval;
                    biggest = i;
                }
            }
            iterations += 1;

            let bound = self.ftol * (fx.abs() + fval.abs()) + 1e-20;
            if 2.0 * (fx - fval) <= bound
            {
                break true;
            }
            if f.evaluations.get() >= max_evals || iterations >= max_iter
            {
                break false;
            }

            // Try the overall displacement of this sweep as a new direction.
            let displacement: Vec<f64> = x.iter().zip(&x1).map(|(a, b)| a - b).collect();
            x1 = x.clone();
            let extrapolated = along(&x, &displacement, 1.0);
            let fx2 = f.call(&extrapolated)?;

            if fx > fx2
            {
                let mut t = 2.0 * (fx + fx2 - 2.0 * fval);
                let temp = fx - fval - delta;
                t *= temp * temp;
                let temp = fx - fx2;
                t -= delta * temp * temp;
                if t < 0.0
                {
                    let (value, next, step) = line_search(&f, &x, &displacement, self.xtol * 100.0)?;
                    fval = value;
                    x = next;
                    if step.iter().any(|s| *s != 0.0)
                    {
                        directions[biggest] = directions[n - 1].clone();
                        directions[n - 1] = step;
                    }
                }
            }
        };

        let evaluations = f.evaluations.get();
        debug!(iterations, evaluations, value = fval, converged, "powell finished");
        Ok(Minimum { x, value: fval, converged, iterations, evaluations })
    }
}

const GOLD: f64 = 1.618034;
const VERY_SMALL: f64 = 1e-21;
const GROW_LIMIT: f64 = 110.0;
const BRACKET_MAX_ITER: usize = 1000;

const CG: f64 = 0.3819660;
const MIN_TOL: f64 = 1.0e-11;
const BRENT_MAX_ITER: usize = 500;

/// Three abscissae with `f(xb)` below both ends.
struct Bracket
{
    xa: f64,
    xb: f64,
    xc: f64,
    fb: f64,
}

/// Walks downhill from `[0, 1]` with golden-ratio steps and parabolic
/// extrapolation until a minimum is enclosed.
fn bracket(f: &dyn Fn(f64) -> anyhow::Result<f64>) -> anyhow::Result<Bracket>
{
    let (mut xa, mut xb) = (0.0, 1.0);
    let (mut fa, mut fb) = (f(xa)?, f(xb)?);
    if fa < fb
    {
        swap(&mut xa, &mut xb);
        swap(&mut fa, &mut fb);
    }
    let mut xc = xb + GOLD * (xb - xa);
    let mut fc = f(xc)?;

    let mut iter = 0;
    while fc < fb
    {
        let tmp1 = (xb - xa) * (fb - fc);
        let tmp2 = (xb - xc) * (fb - fa);
        let val = tmp2 - tmp1;
        let denom = if val.abs() < VERY_SMALL { 2.0 * VERY_SMALL } else { 2.0 * val };
        let mut w = xb - ((xb - xc) * tmp2 - (xb - xa) * tmp1) / denom;
        let wlim = xb + GROW_LIMIT * (xc - xb);

        if iter > BRACKET_MAX_ITER
        {
            return Err(OptimizationFailedError::Unbounded.into());
        }
        iter += 1;

        let mut fw;
        if (w - xc) * (xb - w) > 0.0
        {
            fw = f(w)?;
            if fw < fc
            {
                return Ok(Bracket { xa: xb, xb: w, xc, fb: fw });
            }
            else if fw > fb
            {
                return Ok(Bracket { xa, xb, xc: w, fb });
            }
            w = xc + GOLD * (xc - xb);
            fw = f(w)?;
        }
        else if (w - wlim) * (wlim - xc) >= 0.0
        {
            w = wlim;
            fw = f(w)?;
        }
        else if (w - wlim) * (xc - w) > 0.0
        {
            fw = f(w)?;
            if fw < fc
            {
                xb = xc;
                xc = w;
                w = xc + GOLD * (xc - xb);
                fb = fc;
                fc = fw;
                fw = f(w)?;
            }
        }
        else
        {
            w = xc + GOLD * (xc - xb);
            fw = f(w)?;
        }

        xa = xb;
        xb = xc;
        xc = w;
        fa = fb;
        fb = fc;
        fc = fw;
    }

    Ok(Bracket { xa, xb, xc, fb })
}

/// Brent's method: parabolic interpolation guarded by golden-section steps.
/// Returns the abscissa of the minimum and the value there.
fn brent(f: &dyn Fn(f64) -> anyhow::Result<f64>, tol: f64) -> anyhow::Result<(f64, f64)>
{
    let Bracket { xa, xb, xc, fb } = bracket(f)?;

    let (mut x, mut w, mut v) = (xb, xb, xb);
    let (mut fx, mut fw, mut fv) = (fb, fb, fb);
    let (mut a, mut b) = if xa < xc { (xa, xc) } else { (xc, xa) };
    let mut deltax: f64 = 0.0;
    let mut rat: f64 = 0.0;

    for _ in 0..BRENT_MAX_ITER
    {
        let tol1 = tol * x.abs() + MIN_TOL;
        let tol2 = 2.0 * tol1;
        let xmid = 0.5 * (a + b);
        if (x - xmid).abs() < tol2 - 0.5 * (b - a)
        {
            break;
        }

        if deltax.abs() <= tol1
        {
            deltax = if x >= xmid { a - x } else { b - x };
            rat = CG * deltax;
        }
        else
        {
            let tmp1 = (x - w) * (fx - fv);
            let mut tmp2 = (x - v) * (fx - fw);
            let mut p = (x - v) * tmp2 - (x - w) * tmp1;
            tmp2 = 2.0 * (tmp2 - tmp1);
            if tmp2 > 0.0
            {
                p = -p;
            }
            tmp2 = tmp2.abs();
            let dx_temp = deltax;
            deltax = rat;

            if p > tmp2 * (a - x) && p < tmp2 * (b - x) && p.abs() < (0.5 * tmp2 * dx_temp).abs()
            {
                // parabolic step
                rat = p / tmp2;
                let u = x + rat;
                if (u - a) < tol2 || (b - u) < tol2
                {
                    rat = if xmid - x >= 0.0 { tol1 } else { -tol1 };
                }
            }
            else
            {
                // golden section step
                deltax = if x >= xmid { a - x } else { b - x };
                rat = CG * deltax;
            }
        }

        let u = if rat.abs() < tol1
        {
            if rat >= 0.0 { x + tol1 } else { x - tol1 }
        }
        else
        {
            x + rat
        };
        let fu = f(u)?;

        if fu > fx
        {
            if u < x { a = u; } else { b = u; }
            if fu <= fw || w == x
            {
                v = w;
                w = u;
                fv = fw;
                fw = fu;
            }
            else if fu <= fv || v == x || v == w
            {
                v = u;
                fv = fu;
            }
        }
        else
        {
            if u >= x { a = x; } else { b = x; }
            v = w;
            w = x;
            x = u;
            fv = fw;
            fw = fx;
            fx = fu;
        }
    }

    Ok((x, fx))
}

#[test]
fn test_brent_finds_parabola_minimum()
{
    let (x, fx) = brent(&|x| Ok((x - 3.0).powi(2) + 1.0), 1e-8).unwrap();
    assert!((x - 3.0).abs() < 1e-6);
    assert!((fx - 1.0).abs() < 1e-10);
}

#[test]
fn test_bracket_encloses_minimum()
{
    let f = |x: f64| -> anyhow::Result<f64> { Ok((x + 5.0).powi(2)) };
    let Bracket { xa, xb, xc, fb } = bracket(&f).unwrap();
    let (lo, hi) = if xa < xc { (xa, xc) } else { (xc, xa) };
    assert!(lo < -5.0 && -5.0 < hi);
    assert!(fb <= f(xa).unwrap() && fb <= f(xc).unwrap());
    assert!(lo <= xb && xb <= hi);
}

#[test]
fn test_powell_on_rosenbrock()
{
    let rosenbrock = |x: &[f64]| -> anyhow::Result<f64> {
        Ok((1.0 - x[0]).powi(2) + 100.0 * (x[1] - x[0] * x[0]).powi(2))
    };
    let powell = Powell { xtol: 1e-8, ftol: 1e-12, max_iter: Some(10_000), max_evals: Some(100_000) };
    let min = powell.minimize(&rosenbrock, &[-1.2, 1.0]).unwrap();

    assert!(min.converged);
    assert!((min.x[0] - 1.0).abs() < 1e-2, "{:?}", min.x);
    assert!((min.x[1] - 1.0).abs() < 1e-2, "{:?}", min.x);
    assert!(min.evaluations > min.iterations);
}

#[test]
fn test_powell_reports_iteration_limit()
{
    let rosenbrock = |x: &[f64]| -> anyhow::Result<f64> {
        Ok((1.0 - x[0]).powi(2) + 100.0 * (x[1] - x[0] * x[0]).powi(2))
    };
    let powell = Powell { max_iter: Some(1), ..Powell::default() };
    let min = powell.minimize(&rosenbrock, &[-1.2, 1.0]).unwrap();

    assert!(!min.converged);
    assert_eq!(min.iterations, 1);
}

#[test]
fn test_powell_propagates_objective_errors()
{
    let fails_far_away = |x: &[f64]| -> anyhow::Result<f64> {
        if x[0] > 2.0
        {
            return Err(EvaluationError::NonFiniteValue.into());
        }
        Ok((x[0] - 10.0).powi(2))
    };
    let err = Powell::default().minimize(&fails_far_away, &[0.0]).unwrap_err();
    assert_eq!(err.downcast_ref::<EvaluationError>(), Some(&EvaluationError::NonFiniteValue));
}

#[test]
fn test_powell_without_dimensions()
{
    let constant = |_: &[f64]| -> anyhow::Result<f64> { Ok(4.0) };
    let min = Powell::default().minimize(&constant, &[]).unwrap();
    assert!(min.converged);
    assert!(min.x.is_empty());
    assert_eq!(min.value, 4.0);
}
