//! # Query Translator
//!
//! Turns a parsed [`Query`] and the storage key its subject resolved to into a
//! store [`Filter`] and [`SortSpec`]. Pure: no I/O, no clock.

use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

use super::{CompareOp, Condition, MembershipMode, Query};

/// Gating every store read must respect: only active records whose schema
/// version falls inside `[schema_version_min, schema_version_max]`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct StoreGate {
    pub schema_version_min: i64,
    pub schema_version_max: i64,
}

impl Default for StoreGate {
    fn default() -> Self {
        Self {
            schema_version_min: 0,
            schema_version_max: 99,
        }
    }
}

/// The one field predicate a query may add on top of the base match.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum FieldPredicate {
    Membership {
        field: String,
        mode: MembershipMode,
        values: Vec<String>,
    },
    /// One or two bounds, all on `field`.
    Range {
        field: String,
        bounds: Vec<(CompareOp, String)>,
    },
}

impl FieldPredicate {
    pub fn field(&self) -> &str {
        match self {
            Self::Membership { field, .. } | Self::Range { field, .. } => field,
        }
    }
}

/// A store filter. Records match when every part matches.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct Filter {
    /// Storage partition the subject resolved to.
    pub group_id: String,
    pub gate: StoreGate,
    /// Empty means any type.
    pub types: Vec<String>,
    /// Exact-match constraints, e.g. a device id.
    pub equals: Vec<(String, String)>,
    pub predicate: Option<FieldPredicate>,
}

impl Filter {
    /// The base match: partition, active flag, schema window.
    pub fn base(group_id: impl Into<String>, gate: StoreGate) -> Self {
        Self {
            group_id: group_id.into(),
            gate,
            types: Vec::new(),
            equals: Vec::new(),
            predicate: None,
        }
    }

    pub fn with_equal(mut self, field: impl Into<String>, value: impl Into<String>) -> Self {
        self.equals.push((field.into(), value.into()));
        self
    }

    /// Renders the filter as a Mongo-style document.
    pub fn to_document(&self) -> Value {
        let mut doc = Map::new();
        doc.insert("_groupId".into(), json!(self.group_id));
        doc.insert("_active".into(), json!(true));
        doc.insert(
            "_schemaVersion".into(),
            json!({
                "$gte": self.gate.schema_version_min,
                "$lte": self.gate.schema_version_max,
            }),
        );
        if !self.types.is_empty() {
            doc.insert("type".into(), json!({ "$in": self.types }));
        }
        for (field, value) in &self.equals {
            doc.insert(field.clone(), json!(value));
        }
        match &self.predicate {
            Some(FieldPredicate::Membership {
                field,
                mode,
                values,
            }) => {
                doc.insert(field.clone(), json!({ mode.store_operator(): values }));
            }
            Some(FieldPredicate::Range { field, bounds }) => {
                let ops: Map<String, Value> = bounds
                    .iter()
                    .map(|(op, value)| (op.store_operator().to_string(), json!(value)))
                    .collect();
                doc.insert(field.clone(), Value::Object(ops));
            }
            None => {}
        }
        Value::Object(doc)
    }
}

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SortDirection {
    Ascending,
    Descending,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct SortSpec {
    pub field: String,
    pub direction: SortDirection,
}

impl SortSpec {
    pub fn ascending(field: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            direction: SortDirection::Ascending,
        }
    }

    pub fn descending(field: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            direction: SortDirection::Descending,
        }
    }
}

impl std::fmt::Display for SortSpec {
    /// `time` ascending, `-time` descending.
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.direction {
            SortDirection::Ascending => write!(f, "{}", self.field),
            SortDirection::Descending => write!(f, "-{}", self.field),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Translation {
    pub filter: Filter,
    pub sort: SortSpec,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TranslateError {
    #[error("query has no sort clause")]
    MissingSort,
    #[error("range conditions bound different fields: {0} and {1}")]
    MixedRangeFields(String, String),
    #[error("at most two range conditions are allowed, got {0}")]
    TooManyRanges(usize),
}

/// Translate a parsed query against the partition `resolved_key`.
pub fn translate(
    query: &Query,
    resolved_key: &str,
    gate: StoreGate,
) -> Result<Translation, TranslateError> {
    let sort_field = query.sort_field().ok_or(TranslateError::MissingSort)?;

    let mut filter = Filter::base(resolved_key, gate);
    filter.types = query.types.clone();

    filter.predicate = match &query.condition {
        Some(Condition::Membership(m)) => Some(FieldPredicate::Membership {
            field: m.field.clone(),
            mode: m.mode,
            values: m.values.clone(),
        }),
        Some(Condition::Range(groups)) => match groups.as_slice() {
            [] => None,
            [only] => Some(FieldPredicate::Range {
                field: only.field.clone(),
                bounds: vec![(only.op, only.value.clone())],
            }),
            [first, second] if first.field == second.field => Some(FieldPredicate::Range {
                field: first.field.clone(),
                bounds: vec![
                    (first.op, first.value.clone()),
                    (second.op, second.value.clone()),
                ],
            }),
            [first, second] => {
                return Err(TranslateError::MixedRangeFields(
                    first.field.clone(),
                    second.field.clone(),
                ))
            }
            more => return Err(TranslateError::TooManyRanges(more.len())),
        },
        None => None,
    };

    let sort = if query.reverse {
        SortSpec::descending(sort_field)
    } else {
        SortSpec::ascending(sort_field)
    };

    Ok(Translation { filter, sort })
}
