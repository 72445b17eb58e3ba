/// Contains the token type, the whitelisted functions and the reserved names shared by the parser and the request surface.
pub mod context;
/// Contains error types for different errors that this crate may throw.
pub mod errors;
/// Contains the expression tree and its compiled, slot-indexed form.
pub mod expr;
/// Contains a shunting yard parser turning formula strings into expression trees.
pub mod shunting;
/// Contains the symbolic solver that isolates the pivot variable in closed form.
pub mod pivot;
/// Contains the `Variable` type for one coordinate of an initial point.
pub mod variable;
/// Contains the normalized, weighted distance to an initial point.
pub mod distance;
/// Contains derivative-free minimizers, Powell's method among them.
pub mod powell;
/// Contains `Problem`, which ties parsing, isolation and minimization together.
pub mod problem;
/// Contains the persisted document, its content-hash identifier and a store interface.
pub mod store;
/// Contains the request/response surface that runs solves on worker threads.
pub mod service;

use std::collections::BTreeMap;

use powell::Powell;
use problem::{Problem, Solution};

/// Finds the point on the surface described by `formula` nearest to `initial`,
/// with every weight at 1 and default minimizer settings.
///
/// The pivot defaults to the lexicographically first variable. Bare expressions
/// are equated to zero.
///
/// # Example
/// ```
/// use std::collections::BTreeMap;
/// use nearfeas::nearest_point_from_str;
///
/// let initial = BTreeMap::from([("a".to_owned(), 3.0), ("b".to_owned(), 3.0)]);
/// let soln = nearest_point_from_str("a + b - 10 = 0", Some("a"), &initial)
///     .expect("failed to find a solution");
///
/// assert_eq!(soln.pivot, "a");
/// assert!((soln.point["a"] - 5.0).abs() < 0.01);
/// assert!((soln.point["b"] - 5.0).abs() < 0.01);
/// ```
pub fn nearest_point_from_str(formula: &str, pivot: Option<&str>, initial: &BTreeMap<String, f64>) -> anyhow::Result<Solution>
{
    let problem = Problem::with_pivot(formula, pivot, 0.0)?;
    problem.solve(initial, &BTreeMap::new(), &Powell::default())
}
