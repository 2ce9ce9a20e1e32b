//! # oq-core: Octopus Query
//!
//! The query language accepted by the data endpoint, and the machinery that
//! turns it into something a document store can run.
//!
//! Syntax:
//! ```text
//! METAQUERY WHERE userid IS 12d7bc90 QUERY TYPE IN cbg, smbg WHERE time > 2015-01-01T00:00:00Z SORT BY time AS Timestamp REVERSED
//! ```
//!
//! [`parser`] turns raw text into a [`Query`]. [`translate`] turns a [`Query`]
//! plus a resolved storage key into a store [`Filter`] and [`SortSpec`].

pub mod parser;
pub mod translate;

pub use parser::{parse, ParseError};
pub use translate::{
    translate, FieldPredicate, Filter, SortDirection, SortSpec, StoreGate, TranslateError,
    Translation,
};

use serde::{Deserialize, Serialize};

/// Which kind of identifier a subject clause carries.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SubjectKey {
    /// `METAQUERY WHERE userid IS <id>`
    UserId,
    /// `METAQUERY WHERE emails CONTAINS <email>`
    Emails,
}

impl SubjectKey {
    pub fn keyword(self) -> &'static str {
        match self {
            Self::UserId => "userid",
            Self::Emails => "emails",
        }
    }

    pub fn from_keyword(word: &str) -> Option<Self> {
        if word.eq_ignore_ascii_case("userid") {
            Some(Self::UserId)
        } else if word.eq_ignore_ascii_case("emails") {
            Some(Self::Emails)
        } else {
            None
        }
    }
}

/// Whose data a query targets. `value` is the caller-supplied identifier,
/// never the internal storage key.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Subject {
    pub key: SubjectKey,
    pub value: String,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum CompareOp {
    Lt,
    Lte,
    Gt,
    Gte,
}

impl CompareOp {
    pub fn from_symbol(symbol: &str) -> Option<Self> {
        match symbol {
            "<" => Some(Self::Lt),
            "<=" => Some(Self::Lte),
            ">" => Some(Self::Gt),
            ">=" => Some(Self::Gte),
            _ => None,
        }
    }

    pub fn symbol(self) -> &'static str {
        match self {
            Self::Lt => "<",
            Self::Lte => "<=",
            Self::Gt => ">",
            Self::Gte => ">=",
        }
    }

    /// Operator name in a Mongo-style filter document.
    pub fn store_operator(self) -> &'static str {
        match self {
            Self::Lt => "$lt",
            Self::Lte => "$lte",
            Self::Gt => "$gt",
            Self::Gte => "$gte",
        }
    }
}

/// One `field op value` group of a range clause.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RangeCondition {
    pub field: String,
    pub op: CompareOp,
    pub value: String,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum MembershipMode {
    In,
    NotIn,
}

impl MembershipMode {
    pub fn keyword(self) -> &'static str {
        match self {
            Self::In => "IN",
            Self::NotIn => "NOT IN",
        }
    }

    pub fn store_operator(self) -> &'static str {
        match self {
            Self::In => "$in",
            Self::NotIn => "$nin",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Membership {
    pub field: String,
    pub mode: MembershipMode,
    pub values: Vec<String>,
}

/// The optional `WHERE` clause that follows the type list. A query carries
/// either range groups or a membership list, never both.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Condition {
    /// One or two groups, all on the same field.
    Range(Vec<RangeCondition>),
    Membership(Membership),
}

/// `SORT BY <field> AS <alias>`. The alias is only kept so a parsed query
/// can be written back out unchanged.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SortClause {
    pub field: String,
    pub alias: String,
}

/// A parsed query.
///
/// Built once per request by [`parse`], then read-only. The storage key the
/// subject resolves to lives outside the model and is handed to
/// [`translate`] separately.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct Query {
    /// `None` when the subject clause was missing or malformed.
    pub subject: Option<Subject>,
    /// Type names in the order given, duplicates kept.
    pub types: Vec<String>,
    pub condition: Option<Condition>,
    /// `None` when the sort clause was missing or malformed.
    pub sort: Option<SortClause>,
    pub reverse: bool,
}

impl Query {
    /// Parse `raw`, failing with every problem found if there is any.
    pub fn parse(raw: &str) -> Result<Query, Vec<ParseError>> {
        let (query, errors) = parse(raw);
        if errors.is_empty() {
            Ok(query)
        } else {
            Err(errors)
        }
    }

    pub fn subject_value(&self) -> Option<&str> {
        self.subject.as_ref().map(|s| s.value.as_str())
    }

    pub fn range_conditions(&self) -> &[RangeCondition] {
        match &self.condition {
            Some(Condition::Range(groups)) => groups,
            _ => &[],
        }
    }

    pub fn membership(&self) -> Option<&Membership> {
        match &self.condition {
            Some(Condition::Membership(m)) => Some(m),
            _ => None,
        }
    }

    pub fn sort_field(&self) -> Option<&str> {
        self.sort.as_ref().map(|s| s.field.as_str())
    }
}

impl std::fmt::Display for Query {
    /// Writes the query back out in its canonical textual form.
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if let Some(subject) = &self.subject {
            let verb = match subject.key {
                SubjectKey::UserId => "IS",
                SubjectKey::Emails => "CONTAINS",
            };
            write!(
                f,
                "METAQUERY WHERE {} {} {} ",
                subject.key.keyword(),
                verb,
                subject.value
            )?;
        }
        write!(f, "QUERY TYPE IN {}", self.types.join(", "))?;
        match &self.condition {
            Some(Condition::Range(groups)) => {
                let groups: Vec<String> = groups
                    .iter()
                    .map(|g| format!("{} {} {}", g.field, g.op.symbol(), g.value))
                    .collect();
                write!(f, " WHERE {}", groups.join(" AND "))?;
            }
            Some(Condition::Membership(m)) => {
                write!(
                    f,
                    " WHERE {} {} {}",
                    m.field,
                    m.mode.keyword(),
                    m.values.join(", ")
                )?;
            }
            None => {}
        }
        if let Some(sort) = &self.sort {
            write!(f, " SORT BY {} AS {}", sort.field, sort.alias)?;
        }
        if self.reverse {
            write!(f, " REVERSED")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_reparses_to_same_query() {
        let raw = "METAQUERY WHERE emails CONTAINS foo@bar.com QUERY TYPE IN cbg, cbg, smbg \
                   WHERE uploadId NOT IN a, b SORT BY time AS Timestamp REVERSED";
        let q = Query::parse(raw).unwrap();
        let again = Query::parse(&q.to_string()).unwrap();
        assert_eq!(q, again);
        assert_eq!(again.types, vec!["cbg", "cbg", "smbg"]);
    }

    #[test]
    fn test_accessors_are_exclusive() {
        let q = Query::parse(
            "METAQUERY WHERE userid IS u1 QUERY TYPE IN cbg WHERE time >= 5 SORT BY time AS t",
        )
        .unwrap();
        assert_eq!(q.range_conditions().len(), 1);
        assert!(q.membership().is_none());
        assert_eq!(q.subject_value(), Some("u1"));
        assert_eq!(q.sort_field(), Some("time"));
    }
}
