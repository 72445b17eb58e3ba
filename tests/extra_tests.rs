use std::collections::BTreeMap;
use std::sync::Arc;

use approx::{assert_abs_diff_eq, assert_relative_eq};

use nearfeas::errors::{DegenerateNormalizationError, ForbiddenVariableError, NoSolutionError, ParseError};
use nearfeas::nearest_point_from_str;
use nearfeas::powell::Powell;
use nearfeas::problem::Problem;
use nearfeas::service::{Service, SolverOptions, Status};
use nearfeas::shunting::parse_formula;
use nearfeas::store::{assemble, MemoryStore};

const PROFIT: &str = "218*t*p*f - (p+s)*(b*1.38+12*n) + c";

fn point(pairs: &[(&str, f64)]) -> BTreeMap<String, f64>
{
    pairs.iter().map(|(k, v)| (k.to_string(), *v)).collect()
}

fn baseline(f: f64) -> BTreeMap<String, f64>
{
    point(&[("p", 16.0), ("s", 7.0), ("b", 39000.0), ("n", 290.0), ("c", 120000.0), ("t", 600.0), ("f", f)])
}

/// `f` solved directly from the profit formula with everything else at its baseline.
fn baseline_f() -> f64
{
    let (p, s, b, n, c, t) = (16.0, 7.0, 39000.0, 290.0, 120000.0, 600.0);
    ((p + s) * (b * 1.38 + 12.0 * n) - c) / (218.0 * t * p)
}

#[test]
fn symmetric_weights_pull_to_symmetric_point()
{
    let soln = nearest_point_from_str("a + b - 10 = 0", Some("a"), &point(&[("a", 3.0), ("b", 3.0)])).unwrap();

    assert_abs_diff_eq!(soln.point["a"] + soln.point["b"], 10.0, epsilon = 1e-9);
    assert_abs_diff_eq!(soln.point["a"], 5.0, epsilon = 1e-2);
    assert_abs_diff_eq!(soln.point["b"], 5.0, epsilon = 1e-2);
}

#[test]
fn feasible_baseline_does_not_move()
{
    let f = baseline_f();
    let soln = nearest_point_from_str(PROFIT, Some("f"), &baseline(f)).unwrap();

    assert_relative_eq!(soln.point["f"], f, max_relative = 1e-6);
    assert_relative_eq!(soln.point["c"], 120000.0, max_relative = 1e-6);
    assert_abs_diff_eq!(soln.distance, 0.0, epsilon = 1e-6);
}

#[test]
fn grouped_costs_isolate_with_added_constant()
{
    let problem = Problem::with_pivot("218*t*p*f - ((p+s)*(b*1.38+12*n) + c)", Some("f"), 0.0).unwrap();
    let (p, s, b, n, c, t) = (16.0, 7.0, 39000.0, 290.0, 120000.0, 600.0);

    let values = [b, c, n, p, s, t];
    let expected = ((p + s) * (b * 1.38 + 12.0 * n) + c) / (218.0 * t * p);
    assert_relative_eq!(problem.isolation().eval(&values).unwrap(), expected, max_relative = 1e-12);
}

#[test]
fn solved_point_is_feasible()
{
    let problem = Problem::with_pivot(PROFIT, Some("f"), 0.0).unwrap();
    let initial = baseline(0.5);
    let soln = problem.solve(&initial, &BTreeMap::new(), &Powell::default()).unwrap();

    // Terms are in the millions, so a unit residual is well within rounding.
    assert_abs_diff_eq!(problem.residual(&soln.point).unwrap(), 0.0, epsilon = 1e-6);
    let distance = problem.distance_function(&initial, &BTreeMap::new()).unwrap();
    assert!(soln.distance > 0.0);
    assert!(soln.distance <= distance.eval(&distance.start()).unwrap());
}

#[test]
fn solution_covers_every_variable()
{
    let parsed = parse_formula(PROFIT).unwrap();
    let soln = nearest_point_from_str(PROFIT, Some("f"), &baseline(0.5)).unwrap();

    assert_eq!(soln.point.keys().cloned().collect::<Vec<_>>(), parsed.variables());
    assert_eq!(parsed.variables(), vec!["b", "c", "f", "n", "p", "s", "t"]);
}

#[test]
fn identical_requests_are_deterministic()
{
    let problem = Problem::with_pivot(PROFIT, Some("f"), 0.0).unwrap();
    let initial = baseline(0.5);
    let weights = point(&[("p", 2.0), ("t", 5.0)]);

    let first = problem.solve(&initial, &weights, &Powell::default()).unwrap();
    let second = Problem::with_pivot(PROFIT, Some("f"), 0.0)
        .unwrap()
        .solve(&initial, &weights, &Powell::default())
        .unwrap();
    assert_relative_eq!(first.distance, second.distance, max_relative = 1e-12);

    let (_, first_id) = assemble(PROFIT, Some(0.0), &initial, &weights, &first, 42).unwrap();
    let (_, second_id) = assemble(PROFIT, Some(0.0), &initial, &weights, &second, 42).unwrap();
    assert_eq!(first_id, second_id);
}

#[test]
fn malformed_formula_is_a_parse_error()
{
    let err = parse_formula("a +* b").unwrap_err();
    assert!(err.downcast_ref::<ParseError>().is_some());

    let err = nearest_point_from_str("a +* b", None, &BTreeMap::new()).unwrap_err();
    assert!(err.downcast_ref::<ParseError>().is_some());
}

#[test]
fn reserved_names_are_forbidden()
{
    for formula in ["pivot * x = 2", "coef_a + b", "x + objective"]
    {
        let err = parse_formula(formula).unwrap_err();
        assert!(err.downcast_ref::<ForbiddenVariableError>().is_some(), "{formula}");
    }
}

#[test]
fn zero_initial_value_is_rejected()
{
    let mut initial = baseline(0.5);
    initial.insert("s".to_owned(), 0.0);
    let err = nearest_point_from_str(PROFIT, Some("f"), &initial).unwrap_err();

    assert_eq!(
        err.downcast_ref::<DegenerateNormalizationError>(),
        Some(&DegenerateNormalizationError { variable: "s".to_owned() })
    );
}

#[test]
fn pivot_must_be_isolatable()
{
    let err = Problem::with_pivot("x^3 + x = y", Some("x"), 0.0).unwrap_err();
    assert!(err.downcast_ref::<NoSolutionError>().is_some());
}

#[test]
fn service_round_trip()
{
    let service = Service::new(Arc::new(MemoryStore::new()), SolverOptions::default());
    let mut query: Vec<(String, String)> = baseline(0.5)
        .into_iter()
        .map(|(k, v)| (k, v.to_string()))
        .collect();
    query.push(("formula".to_owned(), PROFIT.to_owned()));
    query.push(("pivot".to_owned(), "f".to_owned()));
    query.push(("coef_c".to_owned(), "3".to_owned()));

    let resp = service.handle_query(query.iter().map(|(k, v)| (k.as_str(), v.as_str())));
    assert_eq!(resp.status, Status::Success);
    assert_eq!(resp.pivot.as_deref(), Some("f"));

    let id = resp.id.expect("solved requests are stored");
    assert_eq!(id.len(), 7);

    let doc = service.fetch(&id).unwrap();
    assert_eq!(doc.formula, PROFIT);
    assert_eq!(doc.weights["c"], 3.0);
    assert_eq!(doc.weights["b"], 1.0);
    for (var, value) in &doc.closest_point
    {
        assert_eq!(resp.point[var], Some(*value));
    }

    // Solving the same request again overwrites the same document.
    let again = service.handle_query(query.iter().map(|(k, v)| (k.as_str(), v.as_str())));
    assert_eq!(again.id.as_deref(), Some(id.as_str()));
}

#[test]
fn service_query_mode()
{
    let service = Service::new(Arc::new(MemoryStore::new()), SolverOptions::default());
    let resp = service.handle_query([("formula", PROFIT), ("pivot", "f"), ("p", "16")]);

    assert_eq!(resp.status, Status::Success);
    assert_eq!(resp.id, None);
    assert_eq!(resp.point.len(), 7);
    assert!(resp.point.values().all(Option::is_none));

    let json = serde_json::to_value(&resp).unwrap();
    assert_eq!(json["status"], "success");
    assert!(json["point"]["b"].is_null());
}

#[test]
fn bare_expression_meets_its_objective()
{
    let problem = Problem::with_pivot("a + b", Some("a"), 10.0).unwrap();
    let initial = point(&[("a", 3.0), ("b", 3.0)]);
    let soln = problem.solve(&initial, &BTreeMap::new(), &Powell::default()).unwrap();

    assert_abs_diff_eq!(soln.point["a"] + soln.point["b"], 10.0, epsilon = 1e-9);
    assert_abs_diff_eq!(soln.point["b"], 5.0, epsilon = 1e-2);
    assert_abs_diff_eq!(problem.residual(&soln.point).unwrap(), 0.0, epsilon = 1e-9);
}

#[test]
fn equation_ignores_objective()
{
    let initial = point(&[("a", 3.0), ("b", 3.0)]);
    let plain = Problem::with_pivot("a + b = 10", Some("a"), 0.0).unwrap();
    let shifted = Problem::with_pivot("a + b = 10", Some("a"), 25.0).unwrap();

    assert_eq!(plain.isolation(), shifted.isolation());
    let soln = shifted.solve(&initial, &BTreeMap::new(), &Powell::default()).unwrap();
    assert_abs_diff_eq!(soln.point["a"] + soln.point["b"], 10.0, epsilon = 1e-9);
}

#[test]
fn service_objective_constant()
{
    let service = Service::new(Arc::new(MemoryStore::new()), SolverOptions::default());

    let resp = service.handle_query([("formula", "a + b"), ("pivot", "a"), ("objective", "10"), ("a", "3"), ("b", "3")]);
    assert_eq!(resp.status, Status::Success);
    let (a, b) = (resp.point["a"].unwrap(), resp.point["b"].unwrap());
    assert_abs_diff_eq!(a + b, 10.0, epsilon = 1e-9);

    let doc = service.fetch(resp.id.as_deref().unwrap()).unwrap();
    assert_eq!(doc.objective, Some(10.0));
    assert_eq!(doc.pivot, "a");

    let resp = service.handle_query([("formula", "a + b = 10"), ("objective", "25"), ("a", "3"), ("b", "3")]);
    let (a, b) = (resp.point["a"].unwrap(), resp.point["b"].unwrap());
    assert_abs_diff_eq!(a + b, 10.0, epsilon = 1e-9);
    assert_eq!(service.fetch(resp.id.as_deref().unwrap()).unwrap().objective, None);
}
