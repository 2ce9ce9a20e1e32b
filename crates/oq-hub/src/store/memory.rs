//! # In-Memory Store
//!
//! Holds device records as JSON documents and evaluates translated filters
//! against them. Loaded from a JSON array file at startup.

use std::cmp::Ordering;
use std::path::Path;
use std::time::Instant;

use axum::body::Bytes;
use oq_core::{CompareOp, FieldPredicate, Filter, MembershipMode, SortDirection, SortSpec};
use serde_json::Value;

use super::{StorageExecutor, StoreError, HIDDEN_FIELDS};

/// Read-only after load.
pub struct MemoryStore {
    records: Vec<Value>,
}

impl MemoryStore {
    pub fn new(records: Vec<Value>) -> Self {
        Self { records }
    }

    /// Load records from a file holding a JSON array of objects.
    pub fn from_file(path: &Path) -> Result<Self, StoreError> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| StoreError::Backend(format!("reading {}: {}", path.display(), e)))?;
        let records: Vec<Value> = serde_json::from_str(&content)
            .map_err(|e| StoreError::Backend(format!("decoding {}: {}", path.display(), e)))?;
        Ok(Self::new(records))
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    fn select(&self, filter: &Filter, sort: &SortSpec) -> Vec<Value> {
        let mut matched: Vec<&Value> = self
            .records
            .iter()
            .filter(|r| matches(r, filter))
            .collect();
        matched.sort_by(|a, b| {
            let ord = compare_fields(a.get(&sort.field), b.get(&sort.field));
            match sort.direction {
                SortDirection::Ascending => ord,
                SortDirection::Descending => ord.reverse(),
            }
        });
        matched.into_iter().map(project).collect()
    }
}

#[async_trait::async_trait]
impl StorageExecutor for MemoryStore {
    async fn execute(&self, filter: &Filter, sort: &SortSpec) -> Result<Bytes, StoreError> {
        let start = Instant::now();
        let results = self.select(filter, sort);
        tracing::debug!(
            "store query took [{:?}] and returned [{}] records",
            start.elapsed(),
            results.len()
        );
        if results.is_empty() {
            return Err(StoreError::NotFound);
        }
        serde_json::to_vec(&results)
            .map(Bytes::from)
            .map_err(|e| StoreError::Backend(e.to_string()))
    }

    async fn last_entry_time(&self, filter: &Filter) -> Result<Bytes, StoreError> {
        let newest = self.select(filter, &SortSpec::descending("time"));
        let time = newest
            .first()
            .and_then(|r| r.get("time"))
            .ok_or(StoreError::NotFound)?;
        serde_json::to_vec(time)
            .map(Bytes::from)
            .map_err(|e| StoreError::Backend(e.to_string()))
    }

    async fn ping(&self) -> Result<(), StoreError> {
        Ok(())
    }
}

fn matches(record: &Value, filter: &Filter) -> bool {
    if record.get("_groupId").and_then(Value::as_str) != Some(filter.group_id.as_str()) {
        return false;
    }
    if record.get("_active").and_then(Value::as_bool) != Some(true) {
        return false;
    }
    match record.get("_schemaVersion").and_then(Value::as_i64) {
        Some(v) if v >= filter.gate.schema_version_min && v <= filter.gate.schema_version_max => {}
        _ => return false,
    }
    if !filter.types.is_empty() {
        let Some(kind) = record.get("type").and_then(Value::as_str) else {
            return false;
        };
        if !filter.types.iter().any(|t| t == kind) {
            return false;
        }
    }
    for (field, expected) in &filter.equals {
        if !record.get(field).is_some_and(|v| values_equal(v, expected)) {
            return false;
        }
    }
    match &filter.predicate {
        Some(FieldPredicate::Membership {
            field,
            mode,
            values,
        }) => {
            let present = record
                .get(field)
                .is_some_and(|v| values.iter().any(|candidate| values_equal(v, candidate)));
            match mode {
                MembershipMode::In => present,
                // Records missing the field are outside the list.
                MembershipMode::NotIn => !present,
            }
        }
        Some(FieldPredicate::Range { field, bounds }) => match record.get(field) {
            Some(v) => bounds.iter().all(|(op, bound)| compare(v, *op, bound)),
            None => false,
        },
        None => true,
    }
}

fn project(record: &Value) -> Value {
    let mut record = record.clone();
    if let Value::Object(fields) = &mut record {
        for hidden in HIDDEN_FIELDS {
            fields.remove(hidden);
        }
    }
    record
}

fn compare(value: &Value, op: CompareOp, bound: &str) -> bool {
    let ord = match (value_to_f64(value), bound.parse::<f64>()) {
        (Some(a), Ok(b)) => a.partial_cmp(&b),
        _ => Some(value_to_string(value).as_str().cmp(bound)),
    };
    match (ord, op) {
        (Some(o), CompareOp::Lt) => o == Ordering::Less,
        (Some(o), CompareOp::Lte) => o != Ordering::Greater,
        (Some(o), CompareOp::Gt) => o == Ordering::Greater,
        (Some(o), CompareOp::Gte) => o != Ordering::Less,
        (None, _) => false,
    }
}

fn compare_fields(a: Option<&Value>, b: Option<&Value>) -> Ordering {
    match (a, b) {
        (None, None) => Ordering::Equal,
        (None, Some(_)) => Ordering::Less,
        (Some(_), None) => Ordering::Greater,
        (Some(a), Some(b)) => match (value_to_f64(a), value_to_f64(b)) {
            (Some(x), Some(y)) => x.partial_cmp(&y).unwrap_or(Ordering::Equal),
            _ => value_to_string(a).cmp(&value_to_string(b)),
        },
    }
}

fn values_equal(a: &Value, b: &str) -> bool {
    if let (Some(an), Ok(bn)) = (value_to_f64(a), b.parse::<f64>()) {
        return (an - bn).abs() < f64::EPSILON;
    }
    value_to_string(a) == b
}

fn value_to_f64(v: &Value) -> Option<f64> {
    match v {
        Value::Number(n) => n.as_f64(),
        _ => None,
    }
}

fn value_to_string(v: &Value) -> String {
    match v {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}
