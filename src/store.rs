use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;

use serde::{Deserialize, Serialize};
use sha1::{Digest, Sha1};

use crate::errors::StoreError;
use crate::problem::Solution;

/// Shortest identifier handed out, for an empty store.
const MIN_ID_LEN: usize = 6;
/// Length of a hex-encoded SHA-1 digest.
const MAX_ID_LEN: usize = 40;

/// A solved request as it is persisted.
///
/// `pivot` and `objective` record which parameterisation of the surface
/// produced `closest_point`; they are kept for readers but not hashed.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Document
{
    pub formula: String,
    pub pivot: String,
    /// The constant a bare expression was equated to; `None` for `lhs = rhs`.
    pub objective: Option<f64>,
    pub initial_point: BTreeMap<String, f64>,
    pub weights: BTreeMap<String, f64>,
    pub closest_point: BTreeMap<String, f64>,
}

/// A key-value store for solved documents.
///
/// Implementations are shared between request workers, so they must be
/// `Send + Sync`. An upsert under an existing id replaces the document.
pub trait DocumentStore: Send + Sync
{
    fn get(&self, id: &str) -> anyhow::Result<Option<Document>>;

    fn upsert(&self, id: &str, document: &Document) -> anyhow::Result<()>;

    /// A cheap estimate of how many documents are stored.
    fn estimated_count(&self) -> anyhow::Result<usize>;
}

/// An in-process `DocumentStore`.
#[derive(Debug, Default)]
pub struct MemoryStore
{
    documents: Mutex<HashMap<String, Document>>,
}

impl MemoryStore
{
    pub fn new() -> MemoryStore
    {
        MemoryStore::default()
    }
}

impl DocumentStore for MemoryStore
{
    fn get(&self, id: &str) -> anyhow::Result<Option<Document>>
    {
        let documents = self.documents.lock().map_err(|_| StoreError::Poisoned)?;
        Ok(documents.get(id).cloned())
    }

    fn upsert(&self, id: &str, document: &Document) -> anyhow::Result<()>
    {
        let mut documents = self.documents.lock().map_err(|_| StoreError::Poisoned)?;
        documents.insert(id.to_owned(), document.clone());
        Ok(())
    }

    fn estimated_count(&self) -> anyhow::Result<usize>
    {
        let documents = self.documents.lock().map_err(|_| StoreError::Poisoned)?;
        Ok(documents.len())
    }
}

/// Number of hex digits kept from the digest: six, plus the number of decimal
/// digits of `floor(sqrt(record_count))`. Identifiers stay short while the
/// store is small and lengthen as collisions become likelier.
///
/// # Example
/// ```
/// use nearfeas::store::id_length;
///
/// assert_eq!(id_length(0), 7);
/// assert_eq!(id_length(99), 7);
/// assert_eq!(id_length(100), 8);
/// assert_eq!(id_length(1_000_000), 10);
/// ```
pub fn id_length(record_count: usize) -> usize
{
    let root = (record_count as f64).sqrt().floor() as u64;
    (MIN_ID_LEN + root.to_string().len()).min(MAX_ID_LEN)
}

/// Full hex SHA-1 of the formula followed by the sorted-key JSON of each map.
pub fn content_hash(document: &Document) -> anyhow::Result<String>
{
    let mut hasher = Sha1::new();
    hasher.update(document.formula.as_bytes());
    hasher.update(serde_json::to_string(&document.initial_point)?.as_bytes());
    hasher.update(serde_json::to_string(&document.weights)?.as_bytes());
    hasher.update(serde_json::to_string(&document.closest_point)?.as_bytes());
    Ok(format!("{:x}", hasher.finalize()))
}

/// Packages a solution as a document and derives its identifier.
///
/// # Example
/// ```
/// use std::collections::BTreeMap;
/// use nearfeas::problem::Problem;
/// use nearfeas::powell::Powell;
/// use nearfeas::store::assemble;
///
/// let problem = Problem::new("a + b = 10").unwrap();
/// let initial = BTreeMap::from([("a".to_owned(), 3.0), ("b".to_owned(), 3.0)]);
/// let weights = BTreeMap::from([("a".to_owned(), 1.0), ("b".to_owned(), 1.0)]);
/// let soln = problem.solve(&initial, &weights, &Powell::default()).unwrap();
///
/// let (doc, id) = assemble("a + b = 10", None, &initial, &weights, &soln, 0).unwrap();
/// let (_, again) = assemble("a + b = 10", None, &initial, &weights, &soln, 0).unwrap();
///
/// assert_eq!(doc.closest_point, soln.point);
/// assert_eq!(doc.pivot, "a");
/// assert_eq!(id.len(), 7);
/// assert_eq!(id, again);
/// ```
pub fn assemble(
    formula: &str,
    objective: Option<f64>,
    initial_point: &BTreeMap<String, f64>,
    weights: &BTreeMap<String, f64>,
    solution: &Solution,
    record_count: usize,
) -> anyhow::Result<(Document, String)>
{
    let document = Document
    {
        formula: formula.to_owned(),
        pivot: solution.pivot.clone(),
        objective,
        initial_point: initial_point.clone(),
        weights: weights.clone(),
        closest_point: solution.point.clone(),
    };
    let mut id = content_hash(&document)?;
    id.truncate(id_length(record_count));
    Ok((document, id))
}

#[cfg(test)]
fn sample() -> Document
{
    Document
    {
        formula: "x = y".to_owned(),
        pivot: "x".to_owned(),
        objective: None,
        initial_point: BTreeMap::from([("x".to_owned(), 1.0), ("y".to_owned(), 2.0)]),
        weights: BTreeMap::from([("x".to_owned(), 1.0), ("y".to_owned(), 1.0)]),
        closest_point: BTreeMap::from([("x".to_owned(), 1.5), ("y".to_owned(), 1.5)]),
    }
}

#[test]
fn test_hash_depends_on_every_field()
{
    let base = content_hash(&sample()).unwrap();
    assert_eq!(base.len(), MAX_ID_LEN);
    assert!(base.chars().all(|c| c.is_ascii_hexdigit()));

    let mut changed = sample();
    changed.formula = "y = x".to_owned();
    assert_ne!(content_hash(&changed).unwrap(), base);

    let mut changed = sample();
    changed.weights.insert("x".to_owned(), 2.0);
    assert_ne!(content_hash(&changed).unwrap(), base);

    let mut changed = sample();
    changed.closest_point.insert("y".to_owned(), 1.25);
    assert_ne!(content_hash(&changed).unwrap(), base);
}

#[test]
fn test_id_is_a_prefix_of_the_hash()
{
    let doc = sample();
    let solution = Solution
    {
        point: doc.closest_point.clone(),
        pivot: doc.pivot.clone(),
        distance: 0.5,
        iterations: 1,
        evaluations: 10,
    };
    let (assembled, id) = assemble(&doc.formula, None, &doc.initial_point, &doc.weights, &solution, 10_000).unwrap();

    assert_eq!(assembled, doc);
    assert_eq!(id.len(), 9);
    assert!(content_hash(&doc).unwrap().starts_with(&id));
}

#[test]
fn test_document_keeps_parameterisation()
{
    let mut doc = sample();
    doc.objective = Some(10.0);

    let json = serde_json::to_string(&doc).unwrap();
    let loaded: Document = serde_json::from_str(&json).unwrap();
    assert_eq!(loaded.pivot, "x");
    assert_eq!(loaded.objective, Some(10.0));
    assert_eq!(loaded, doc);
}

#[test]
fn test_memory_store_upserts()
{
    let store = MemoryStore::new();
    assert_eq!(store.get("abc").unwrap(), None);

    store.upsert("abc", &sample()).unwrap();
    let mut replaced = sample();
    replaced.formula = "x = 2*y".to_owned();
    store.upsert("abc", &replaced).unwrap();

    assert_eq!(store.estimated_count().unwrap(), 1);
    assert_eq!(store.get("abc").unwrap(), Some(replaced));
}
