use std::collections::BTreeMap;
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::context::{COEF_PREFIX, FORMULA_KEY, OBJECTIVE_KEY, PIVOT_KEY};
use crate::distance::DEFAULT_WEIGHT;
use crate::errors::*;
use crate::powell::{Minimizer, Powell};
use crate::problem::{choose_pivot, Problem, Solution};
use crate::shunting::{parse_formula, Constraint};
use crate::store::{assemble, Document, DocumentStore};

/// Tuning for the minimizer and the per-request time limit.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SolverOptions
{
    pub xtol: f64,
    pub ftol: f64,
    pub max_iter: Option<usize>,
    pub max_evals: Option<usize>,
    pub timeout_ms: u64,
}

impl Default for SolverOptions
{
    fn default() -> Self
    {
        SolverOptions
        {
            xtol: 1e-4,
            ftol: 1e-4,
            max_iter: None,
            max_evals: None,
            timeout_ms: 10_000,
        }
    }
}

impl SolverOptions
{
    pub fn minimizer(&self) -> Powell
    {
        Powell
        {
            xtol: self.xtol,
            ftol: self.ftol,
            max_iter: self.max_iter,
            max_evals: self.max_evals,
        }
    }

    pub fn timeout(&self) -> Duration
    {
        Duration::from_millis(self.timeout_ms)
    }
}

/// A solve request as it arrives from the routing layer, values still unparsed.
#[derive(Clone, Debug, PartialEq)]
pub struct SolveRequest
{
    pub formula: String,
    pub pivot: Option<String>,
    pub objective: f64,
    /// Every other key, including variable values and `coef_` weights.
    pub values: BTreeMap<String, String>,
}

impl SolveRequest
{
    /// Reads a request from query string pairs. Later duplicates win, and an
    /// empty `pivot` or `objective` counts as absent.
    ///
    /// `objective` is the constant a bare expression is equated to when it reads
    /// as a finite number. Otherwise, if no `pivot` was given, it names the pivot.
    ///
    /// # Example
    /// ```
    /// use nearfeas::service::SolveRequest;
    ///
    /// let req = SolveRequest::from_query([("formula", "a + b = 10"), ("a", "3"), ("coef_b", "2")]).unwrap();
    ///
    /// assert_eq!(req.formula, "a + b = 10");
    /// assert_eq!(req.pivot, None);
    /// assert_eq!(req.values["coef_b"], "2");
    /// assert!(SolveRequest::from_query([("a", "3")]).is_err());
    ///
    /// let req = SolveRequest::from_query([("formula", "a + b"), ("objective", "b")]).unwrap();
    /// assert_eq!(req.pivot.as_deref(), Some("b"));
    /// assert_eq!(req.objective, 0.0);
    /// ```
    pub fn from_query<'a, I>(pairs: I) -> anyhow::Result<SolveRequest>
    where I: IntoIterator<Item = (&'a str, &'a str)>
    {
        let mut formula = None;
        let mut pivot = None;
        let mut objective = None;
        let mut values = BTreeMap::new();

        for (key, value) in pairs
        {
            let trimmed = Some(value.trim().to_owned()).filter(|v| !v.is_empty());
            match key
            {
                FORMULA_KEY => formula = Some(value.to_owned()),
                PIVOT_KEY => pivot = trimmed,
                OBJECTIVE_KEY => objective = trimmed,
                _ => { values.insert(key.to_owned(), value.to_owned()); },
            }
        }

        let objective = match objective
        {
            None => 0.0,
            Some(raw) => match raw.parse::<f64>()
            {
                Ok(constant) if constant.is_finite() => constant,
                _ if pivot.is_none() =>
                {
                    pivot = Some(raw);
                    0.0
                },
                _ => return Err(InputError::NotANumber(OBJECTIVE_KEY.to_owned()).into()),
            },
        };

        Ok(SolveRequest
        {
            formula: formula.ok_or(InputError::MissingFormula)?,
            pivot,
            objective,
            values,
        })
    }
}

fn parse_number(key: &str, value: &str) -> anyhow::Result<f64>
{
    value
        .trim()
        .parse::<f64>()
        .map_err(|_| InputError::NotANumber(key.to_owned()).into())
}

/// Outcome category reported to the caller in place of raw error text.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Status
{
    #[serde(rename = "success")]
    Success,
    #[serde(rename = "storage failed")]
    StorageFailed,
    #[serde(rename = "invalid formula")]
    InvalidFormula,
    #[serde(rename = "forbidden variable name")]
    ForbiddenVariableName,
    #[serde(rename = "pivot cannot be isolated")]
    PivotNotIsolatable,
    #[serde(rename = "invalid input value")]
    InvalidInputValue,
    #[serde(rename = "zero initial value")]
    ZeroInitialValue,
    #[serde(rename = "optimization failed")]
    OptimizationFailed,
}

impl Status
{
    pub fn as_str(&self) -> &'static str
    {
        match self
        {
            Status::Success => "success",
            Status::StorageFailed => "storage failed",
            Status::InvalidFormula => "invalid formula",
            Status::ForbiddenVariableName => "forbidden variable name",
            Status::PivotNotIsolatable => "pivot cannot be isolated",
            Status::InvalidInputValue => "invalid input value",
            Status::ZeroInitialValue => "zero initial value",
            Status::OptimizationFailed => "optimization failed",
        }
    }
}

/// Maps an error raised anywhere in a solve to its status category.
pub fn classify(err: &anyhow::Error) -> Status
{
    if err.downcast_ref::<ParseError>().is_some()
    {
        Status::InvalidFormula
    }
    else if err.downcast_ref::<ForbiddenVariableError>().is_some()
    {
        Status::ForbiddenVariableName
    }
    else if err.downcast_ref::<NoSolutionError>().is_some()
    {
        Status::PivotNotIsolatable
    }
    else if err.downcast_ref::<DegenerateNormalizationError>().is_some()
    {
        Status::ZeroInitialValue
    }
    else if err.downcast_ref::<InputError>().is_some()
    {
        Status::InvalidInputValue
    }
    else if err.downcast_ref::<StoreError>().is_some()
    {
        Status::StorageFailed
    }
    else
    {
        Status::OptimizationFailed
    }
}

/// What the rendering layer receives. `point` maps every variable to its solved
/// value, or to `None` in query mode and on failure.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Response
{
    pub status: Status,
    pub id: Option<String>,
    pub pivot: Option<String>,
    pub point: BTreeMap<String, Option<f64>>,
}

impl Response
{
    fn failure(status: Status) -> Response
    {
        Response { status, id: None, pivot: None, point: BTreeMap::new() }
    }
}

/// Runs solve requests against a document store.
///
/// Each solve runs on its own worker thread and is abandoned, not interrupted,
/// once the configured timeout elapses.
pub struct Service
{
    store: Arc<dyn DocumentStore>,
    options: SolverOptions,
    minimizer: Arc<dyn Minimizer + Send + Sync>,
}

impl Service
{
    /// A service minimizing with Powell's method, tuned by `options`.
    pub fn new(store: Arc<dyn DocumentStore>, options: SolverOptions) -> Service
    {
        let minimizer = Arc::new(options.minimizer());
        Service::with_minimizer(store, options, minimizer)
    }

    /// A service minimizing with `minimizer`. Only the timeout of `options`
    /// applies then.
    pub fn with_minimizer(
        store: Arc<dyn DocumentStore>,
        options: SolverOptions,
        minimizer: Arc<dyn Minimizer + Send + Sync>,
    ) -> Service
    {
        Service { store, options, minimizer }
    }

    /// Handles raw query pairs, including a missing formula.
    pub fn handle_query<'a, I>(&self, pairs: I) -> Response
    where I: IntoIterator<Item = (&'a str, &'a str)>
    {
        match SolveRequest::from_query(pairs)
        {
            Ok(req) => self.handle(&req),
            Err(err) => Response::failure(classify(&err)),
        }
    }

    /// Solves `req` and stores the result.
    ///
    /// If any variable of the formula lacks a value, nothing is solved and the
    /// response only lists the variables.
    ///
    /// # Example
    /// ```
    /// use std::sync::Arc;
    /// use nearfeas::service::{Service, SolverOptions, Status};
    /// use nearfeas::store::MemoryStore;
    ///
    /// let service = Service::new(Arc::new(MemoryStore::new()), SolverOptions::default());
    ///
    /// let query = service.handle_query([("formula", "a + b = 10")]);
    /// assert_eq!(query.point.keys().collect::<Vec<_>>(), vec!["a", "b"]);
    /// assert_eq!(query.pivot.as_deref(), Some("a"));
    /// assert_eq!(query.id, None);
    ///
    /// let solved = service.handle_query([("formula", "a + b = 10"), ("a", "3"), ("b", "3")]);
    /// assert_eq!(solved.status, Status::Success);
    /// assert!(service.fetch(solved.id.as_deref().unwrap()).is_some());
    /// ```
    pub fn handle(&self, req: &SolveRequest) -> Response
    {
        match self.try_handle(req)
        {
            Ok(resp) => resp,
            Err(err) =>
            {
                debug!(formula = %req.formula, error = %err, "request rejected");
                Response::failure(classify(&err))
            },
        }
    }

    fn try_handle(&self, req: &SolveRequest) -> anyhow::Result<Response>
    {
        let parsed = parse_formula(&req.formula)?;
        let variables = parsed.variables();
        let pivot = choose_pivot(&parsed, req.pivot.as_deref())?;

        if variables.iter().any(|v| !req.values.contains_key(v))
        {
            return Ok(Response
            {
                status: Status::Success,
                id: None,
                pivot: Some(pivot),
                point: variables.into_iter().map(|v| (v, None)).collect(),
            });
        }

        let mut initial = BTreeMap::new();
        let mut weights = BTreeMap::new();
        for var in &variables
        {
            initial.insert(var.clone(), parse_number(var, &req.values[var])?);

            let key = format!("{COEF_PREFIX}{var}");
            let weight = match req.values.get(&key)
            {
                Some(value) => parse_number(&key, value)?,
                None => DEFAULT_WEIGHT,
            };
            weights.insert(var.clone(), weight);
        }

        let solution = self.solve_on_worker(req, pivot, initial.clone(), weights.clone())?;
        let point = solution.point.iter().map(|(k, v)| (k.clone(), Some(*v))).collect();

        let objective = match parsed.constraint
        {
            Constraint::Expression(_) => Some(req.objective),
            Constraint::Equation { .. } => None,
        };
        let (status, id) = match self.store_solution(&req.formula, objective, &initial, &weights, &solution)
        {
            Ok(id) => (Status::Success, Some(id)),
            Err(err) =>
            {
                warn!(formula = %req.formula, error = %err, "could not store solved document");
                (Status::StorageFailed, None)
            },
        };

        Ok(Response { status, id, pivot: Some(solution.pivot), point })
    }

    fn solve_on_worker(
        &self,
        req: &SolveRequest,
        pivot: String,
        initial: BTreeMap<String, f64>,
        weights: BTreeMap<String, f64>,
    ) -> anyhow::Result<Solution>
    {
        let formula = req.formula.clone();
        let objective = req.objective;
        let minimizer = Arc::clone(&self.minimizer);
        let (tx, rx) = mpsc::channel();

        thread::Builder::new()
            .name("nearfeas-solve".to_owned())
            .spawn(move || {
                let result = Problem::with_pivot(&formula, Some(pivot.as_str()), objective)
                    .and_then(|problem| problem.solve(&initial, &weights, minimizer.as_ref()));
                // The receiver is gone if the request already timed out.
                let _ = tx.send(result);
            })?;

        match rx.recv_timeout(self.options.timeout())
        {
            Ok(result) => result,
            Err(RecvTimeoutError::Timeout) =>
            {
                warn!(formula = %req.formula, millis = self.options.timeout_ms, "solve timed out");
                Err(OptimizationFailedError::TimedOut { millis: self.options.timeout_ms }.into())
            },
            Err(RecvTimeoutError::Disconnected) => Err(OptimizationFailedError::WorkerLost.into()),
        }
    }

    fn store_solution(
        &self,
        formula: &str,
        objective: Option<f64>,
        initial: &BTreeMap<String, f64>,
        weights: &BTreeMap<String, f64>,
        solution: &Solution,
    ) -> anyhow::Result<String>
    {
        let count = self.store.estimated_count()?;
        let (document, id) = assemble(formula, objective, initial, weights, solution, count)?;
        self.store.upsert(&id, &document)?;
        debug!(id = %id, "stored solved document");
        Ok(id)
    }

    /// A previously stored document, or `None` if it is absent or the store failed.
    pub fn fetch(&self, id: &str) -> Option<Document>
    {
        match self.store.get(id)
        {
            Ok(doc) => doc,
            Err(err) =>
            {
                warn!(id, error = %err, "could not read stored document");
                None
            },
        }
    }
}

#[cfg(test)]
use crate::store::MemoryStore;

#[cfg(test)]
struct BrokenStore;

#[cfg(test)]
impl DocumentStore for BrokenStore
{
    fn get(&self, _id: &str) -> anyhow::Result<Option<Document>>
    {
        Err(StoreError::Poisoned.into())
    }

    fn upsert(&self, _id: &str, _document: &Document) -> anyhow::Result<()>
    {
        Err(StoreError::Poisoned.into())
    }

    fn estimated_count(&self) -> anyhow::Result<usize>
    {
        Ok(0)
    }
}

#[cfg(test)]
fn memory_service() -> Service
{
    Service::new(Arc::new(MemoryStore::new()), SolverOptions::default())
}

#[test]
fn test_options_deserialize_with_defaults()
{
    let options: SolverOptions = serde_json::from_str(r#"{"timeout_ms": 250, "max_iter": 50}"#).unwrap();

    assert_eq!(options.timeout(), Duration::from_millis(250));
    assert_eq!(options.max_iter, Some(50));
    assert_eq!(options.xtol, 1e-4);
    assert_eq!(options.minimizer().max_evals, None);
}

#[test]
fn test_status_strings()
{
    assert_eq!(serde_json::to_string(&Status::StorageFailed).unwrap(), "\"storage failed\"");
    assert_eq!(serde_json::to_string(&Status::PivotNotIsolatable).unwrap(), "\"pivot cannot be isolated\"");
    for status in [Status::Success, Status::InvalidFormula, Status::ZeroInitialValue, Status::OptimizationFailed]
    {
        assert_eq!(serde_json::to_string(&status).unwrap(), format!("\"{}\"", status.as_str()));
    }
}

#[test]
fn test_classify()
{
    let cases: Vec<(anyhow::Error, Status)> = vec![
        (ParseError::UnbalancedParenthesis.into(), Status::InvalidFormula),
        (ForbiddenVariableError { name: "sqrt".to_owned() }.into(), Status::ForbiddenVariableName),
        (NoSolutionError::NotIsolatable.into(), Status::PivotNotIsolatable),
        (DegenerateNormalizationError { variable: "a".to_owned() }.into(), Status::ZeroInitialValue),
        (InputError::NotANumber("a".to_owned()).into(), Status::InvalidInputValue),
        (OptimizationFailedError::TimedOut { millis: 1 }.into(), Status::OptimizationFailed),
    ];

    for (err, status) in cases
    {
        assert_eq!(classify(&err), status, "{err}");
    }
}

#[test]
fn test_query_mode_lists_variables()
{
    let service = memory_service();
    let resp = service.handle_query([("formula", "p * f - c"), ("pivot", "f"), ("p", "16")]);

    assert_eq!(resp.status, Status::Success);
    assert_eq!(resp.id, None);
    assert_eq!(resp.pivot.as_deref(), Some("f"));
    assert!(resp.point.values().all(Option::is_none));
    assert_eq!(resp.point.keys().collect::<Vec<_>>(), vec!["c", "f", "p"]);

    let defaulted = service.handle_query([("formula", "p * f - c")]);
    assert_eq!(defaulted.status, Status::Success);
    assert_eq!(defaulted.pivot.as_deref(), Some("c"));

    let unknown = service.handle_query([("formula", "p * f - c"), ("pivot", "zzz")]);
    assert_eq!(unknown.status, Status::PivotNotIsolatable);
    assert_eq!(unknown.pivot, None);
    assert!(unknown.point.is_empty());
}

#[test]
fn test_rejected_requests()
{
    let service = memory_service();

    assert_eq!(service.handle_query([("a", "1")]).status, Status::InvalidInputValue);
    assert_eq!(service.handle_query([("formula", "a + (b")]).status, Status::InvalidFormula);
    assert_eq!(service.handle_query([("formula", "coef_a + b")]).status, Status::ForbiddenVariableName);
    assert_eq!(
        service.handle_query([("formula", "a + b = 10"), ("a", "x"), ("b", "1")]).status,
        Status::InvalidInputValue
    );
    assert_eq!(
        service.handle_query([("formula", "a + b = 10"), ("a", "0"), ("b", "1")]).status,
        Status::ZeroInitialValue
    );
    assert_eq!(
        service.handle_query([("formula", "a + b = 10"), ("pivot", "c"), ("a", "1"), ("b", "1")]).status,
        Status::PivotNotIsolatable
    );
}

#[test]
fn test_weights_are_stored_per_variable()
{
    let service = memory_service();
    let resp = service.handle_query([("formula", "a + b = 10"), ("a", "3"), ("b", "3"), ("coef_b", "4")]);
    let doc = service.fetch(resp.id.as_deref().unwrap()).unwrap();

    assert_eq!(doc.weights, BTreeMap::from([("a".to_owned(), 1.0), ("b".to_owned(), 4.0)]));
    assert_eq!(doc.initial_point["a"], 3.0);
    assert_eq!(doc.closest_point.len(), 2);
}

#[test]
fn test_storage_failure_keeps_solution()
{
    let service = Service::new(Arc::new(BrokenStore), SolverOptions::default());
    let resp = service.handle_query([("formula", "a + b = 10"), ("a", "3"), ("b", "3")]);

    assert_eq!(resp.status, Status::StorageFailed);
    assert_eq!(resp.id, None);
    let a = resp.point["a"].unwrap();
    let b = resp.point["b"].unwrap();
    assert!((a + b - 10.0).abs() < 1e-9);
    assert_eq!(service.fetch("anything"), None);
}

/// Blocks until released, so every solve outlives any timeout.
#[cfg(test)]
struct Stalled(std::sync::Mutex<mpsc::Receiver<()>>);

#[cfg(test)]
impl Minimizer for Stalled
{
    fn minimize(&self, _f: &crate::powell::Objective, _start: &[f64]) -> anyhow::Result<crate::powell::Minimum>
    {
        if let Ok(release) = self.0.lock()
        {
            let _ = release.recv();
        }
        Err(OptimizationFailedError::WorkerLost.into())
    }
}

#[test]
fn test_timeout_is_an_optimization_failure()
{
    let (release, stalled) = mpsc::channel();
    let store = Arc::new(MemoryStore::new());
    let options = SolverOptions { timeout_ms: 20, ..SolverOptions::default() };
    let service = Service::with_minimizer(store.clone(), options, Arc::new(Stalled(std::sync::Mutex::new(stalled))));

    let resp = service.handle_query([("formula", "a + b = 10"), ("a", "3"), ("b", "3")]);
    release.send(()).unwrap();

    assert_eq!(resp.status, Status::OptimizationFailed);
    assert!(resp.point.is_empty());
    assert_eq!(store.estimated_count().unwrap(), 0);
}

#[test]
fn test_deeply_nested_formula_is_rejected()
{
    let service = memory_service();
    let formula = format!("{}x = y", "-".repeat(100_000));

    assert_eq!(service.handle_query([("formula", formula.as_str())]).status, Status::InvalidFormula);
    assert_eq!(
        service.handle_query([("formula", formula.as_str()), ("x", "1"), ("y", "2")]).status,
        Status::InvalidFormula
    );
}

#[test]
fn test_objective_names_the_pivot()
{
    let service = memory_service();
    let resp = service.handle_query([("formula", "a + b = 10"), ("objective", "b"), ("a", "3"), ("b", "3")]);

    assert_eq!(resp.status, Status::Success);
    assert_eq!(resp.pivot.as_deref(), Some("b"));
    let doc = service.fetch(resp.id.as_deref().unwrap()).unwrap();
    assert_eq!(doc.pivot, "b");
    assert_eq!(doc.objective, None);

    // an explicit pivot leaves no room for a named objective
    let err = SolveRequest::from_query([("formula", "a + b"), ("pivot", "a"), ("objective", "b")]).unwrap_err();
    assert_eq!(err.downcast_ref::<InputError>(), Some(&InputError::NotANumber("objective".to_owned())));

    let req = SolveRequest::from_query([("formula", "a + b"), ("pivot", "a"), ("objective", "10")]).unwrap();
    assert_eq!((req.pivot.as_deref(), req.objective), (Some("a"), 10.0));
}
