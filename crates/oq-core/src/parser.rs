//! # Query Parser
//!
//! Parses the query language into a [`Query`].
//!
//! ```text
//! query     := subject types [condition] sort [REVERSED]
//! subject   := METAQUERY WHERE (userid | emails) (IS | CONTAINS) value QUERY
//! types     := TYPE IN name {, name}
//! condition := WHERE field op value [AND field op value]
//!            | WHERE field (IN | NOT IN) value {[,] value}
//! sort      := SORT BY field AS alias
//! op        := < | <= | > | >=
//! ```
//!
//! Keywords match case-insensitively as whole whitespace-delimited words.
//! Each clause is located and validated on its own, so one bad clause never
//! hides another: every problem is reported in a single pass.

use std::sync::OnceLock;

use regex::Regex;
use serde::Serialize;

use super::{
    CompareOp, Condition, Membership, MembershipMode, Query, RangeCondition, SortClause, Subject,
    SubjectKey,
};

/// Everything that can be wrong with a query's text.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, thiserror::Error)]
#[serde(rename_all = "snake_case")]
pub enum ParseError {
    #[error("Missing required METAQUERY e.g. METAQUERY WHERE userid IS 12d7bc90 or METAQUERY WHERE emails CONTAINS foo@bar.org")]
    SubjectMissing,
    #[error("Unrecognized METAQUERY subject, expected userid or emails e.g. METAQUERY WHERE userid IS 12d7bc90")]
    SubjectKeyUnrecognized,
    #[error("Missing required TYPE IN e.g. TYPE IN cbg, smbg")]
    TypesMissing,
    #[error("TYPE IN needs at least one type e.g. TYPE IN cbg, smbg")]
    TypesEmpty,
    #[error("Unrecognized WHERE condition e.g. WHERE time > 2015-01-01T00:00:00Z AND time < 2015-01-02T00:00:00Z or WHERE uploadId NOT IN a, b")]
    ConditionMalformed,
    #[error("Both range conditions must bound the same field e.g. WHERE time > t1 AND time < t2")]
    RangeFieldMismatch,
    #[error("Missing required SORT BY e.g. SORT BY time AS Timestamp")]
    SortMissing,
    #[error("SORT BY needs an alias e.g. SORT BY time AS Timestamp")]
    SortAliasMissing,
}

impl ParseError {
    /// Stable machine-readable code.
    pub fn code(self) -> &'static str {
        match self {
            Self::SubjectMissing => "subject_missing",
            Self::SubjectKeyUnrecognized => "subject_key_unrecognized",
            Self::TypesMissing => "types_missing",
            Self::TypesEmpty => "types_empty",
            Self::ConditionMalformed => "condition_malformed",
            Self::RangeFieldMismatch => "range_field_mismatch",
            Self::SortMissing => "sort_missing",
            Self::SortAliasMissing => "sort_alias_missing",
        }
    }
}

/// Parse a raw query string.
///
/// Never fails outright: the returned [`Query`] holds whatever clauses could
/// be extracted, and the error list holds one entry per broken clause in
/// clause order (subject, types, condition, sort).
pub fn parse(input: &str) -> (Query, Vec<ParseError>) {
    let scan = Scan::new(input);
    let mut query = Query::default();
    let mut errors = Vec::new();

    match scan.subject() {
        Ok(subject) => query.subject = Some(subject),
        Err(e) => errors.push(e),
    }

    match scan.types() {
        Ok(types) => query.types = types,
        Err(e) => errors.push(e),
    }

    match scan.condition() {
        Ok(condition) => query.condition = condition,
        Err(e) => errors.push(e),
    }

    match scan.sort() {
        Ok(sort) => query.sort = Some(sort),
        Err(e) => errors.push(e),
    }

    query.reverse = scan.reversed();

    (query, errors)
}

/// A whitespace-delimited word and its byte span in the input.
#[derive(Debug, Clone, Copy)]
struct Token<'a> {
    text: &'a str,
    start: usize,
    end: usize,
}

impl Token<'_> {
    fn is(&self, keyword: &str) -> bool {
        self.text.eq_ignore_ascii_case(keyword)
    }
}

struct Scan<'a> {
    input: &'a str,
    tokens: Vec<Token<'a>>,
}

impl<'a> Scan<'a> {
    fn new(input: &'a str) -> Self {
        let mut tokens = Vec::new();
        let mut start = None;
        for (i, c) in input.char_indices() {
            match (c.is_whitespace(), start) {
                (true, Some(s)) => {
                    tokens.push(Token {
                        text: &input[s..i],
                        start: s,
                        end: i,
                    });
                    start = None;
                }
                (false, None) => start = Some(i),
                _ => {}
            }
        }
        if let Some(s) = start {
            tokens.push(Token {
                text: &input[s..],
                start: s,
                end: input.len(),
            });
        }
        Self { input, tokens }
    }

    fn is(&self, idx: usize, keyword: &str) -> bool {
        self.tokens.get(idx).is_some_and(|t| t.is(keyword))
    }

    /// Index of the first `keyword` token at or after `from`.
    fn find(&self, from: usize, keyword: &str) -> Option<usize> {
        (from..self.tokens.len()).find(|&i| self.tokens[i].is(keyword))
    }

    /// Index of the first `first second` token pair at or after `from`.
    fn find_pair(&self, from: usize, first: &str, second: &str) -> Option<usize> {
        (from..self.tokens.len()).find(|&i| self.tokens[i].is(first) && self.is(i + 1, second))
    }

    /// Index of the first token at or after `from` that opens another clause.
    fn clause_end(&self, from: usize, stops: &[&str]) -> usize {
        (from..self.tokens.len())
            .find(|&i| stops.iter().any(|kw| self.tokens[i].is(kw)))
            .unwrap_or(self.tokens.len())
    }

    /// Original text covering tokens `from..to`, inner whitespace preserved.
    fn text(&self, from: usize, to: usize) -> &'a str {
        if from >= to || from >= self.tokens.len() {
            return "";
        }
        &self.input[self.tokens[from].start..self.tokens[to - 1].end]
    }

    fn subject(&self) -> Result<Subject, ParseError> {
        let marker = self.find(0, "METAQUERY").ok_or(ParseError::SubjectMissing)?;
        if !self.is(marker + 1, "WHERE") {
            return Err(ParseError::SubjectMissing);
        }
        let end = self
            .find(marker + 2, "QUERY")
            .ok_or(ParseError::SubjectMissing)?;

        let key_idx = marker + 2;
        if key_idx >= end {
            return Err(ParseError::SubjectMissing);
        }
        let key = SubjectKey::from_keyword(self.tokens[key_idx].text)
            .ok_or(ParseError::SubjectKeyUnrecognized)?;

        if !(self.is(key_idx + 1, "IS") || self.is(key_idx + 1, "CONTAINS")) || key_idx + 1 >= end
        {
            return Err(ParseError::SubjectMissing);
        }

        let value = self.text(key_idx + 2, end);
        if value.is_empty() {
            return Err(ParseError::SubjectMissing);
        }

        Ok(Subject {
            key,
            value: value.to_string(),
        })
    }

    /// Index of `TYPE` in the `QUERY TYPE IN` that opens the type clause.
    fn type_intro(&self) -> Option<usize> {
        (1..self.tokens.len()).find(|&i| {
            self.tokens[i - 1].is("QUERY") && self.tokens[i].is("TYPE") && self.is(i + 1, "IN")
        })
    }

    fn types_end(&self, intro: usize) -> usize {
        self.clause_end(intro + 2, &["WHERE", "SORT", "REVERSED"])
    }

    fn types(&self) -> Result<Vec<String>, ParseError> {
        let intro = self.type_intro().ok_or(ParseError::TypesMissing)?;
        let start = intro + 2;
        let end = self.types_end(intro);

        let types: Vec<String> = self
            .text(start, end)
            .split(',')
            .map(str::trim)
            .filter(|t| !t.is_empty())
            .map(str::to_string)
            .collect();

        if types.is_empty() {
            return Err(ParseError::TypesEmpty);
        }
        Ok(types)
    }

    /// The first `WHERE` after the type clause, or after the subject's
    /// `QUERY` when the type clause is missing.
    fn condition_start(&self) -> Option<usize> {
        let from = match self.type_intro() {
            Some(intro) => self.types_end(intro),
            None => self.find(0, "QUERY").map_or(0, |q| q + 1),
        };
        (from..self.tokens.len())
            .find(|&i| self.tokens[i].is("WHERE") && (i == 0 || !self.tokens[i - 1].is("METAQUERY")))
    }

    fn condition(&self) -> Result<Option<Condition>, ParseError> {
        let Some(intro) = self.condition_start() else {
            return Ok(None);
        };
        let start = intro + 1;
        let end = self.clause_end(start, &["SORT", "REVERSED"]);

        // `field IN ...` or `field NOT IN ...` wins over any range reading.
        let membership = if self.is(start + 1, "IN") && start + 1 < end {
            Some((MembershipMode::In, start + 2))
        } else if self.is(start + 1, "NOT") && self.is(start + 2, "IN") && start + 2 < end {
            Some((MembershipMode::NotIn, start + 3))
        } else {
            None
        };

        if let Some((mode, values_from)) = membership {
            let values: Vec<String> = list_separator()
                .split(self.text(values_from, end))
                .filter(|v| !v.is_empty())
                .map(str::to_string)
                .collect();
            if values.is_empty() {
                return Err(ParseError::ConditionMalformed);
            }
            return Ok(Some(Condition::Membership(Membership {
                field: self.tokens[start].text.to_string(),
                mode,
                values,
            })));
        }

        let region = &self.tokens[start.min(end)..end];
        let groups: Vec<&[Token<'a>]> = region.split(|t| t.is("AND")).collect();
        if region.is_empty() || groups.len() > 2 {
            return Err(ParseError::ConditionMalformed);
        }

        let mut conditions = Vec::with_capacity(groups.len());
        for group in groups {
            let [field, op, value] = group else {
                return Err(ParseError::ConditionMalformed);
            };
            let op = CompareOp::from_symbol(op.text).ok_or(ParseError::ConditionMalformed)?;
            conditions.push(RangeCondition {
                field: field.text.to_string(),
                op,
                value: value.text.to_string(),
            });
        }

        if let [first, second] = conditions.as_slice() {
            if first.field != second.field {
                return Err(ParseError::RangeFieldMismatch);
            }
        }

        Ok(Some(Condition::Range(conditions)))
    }

    /// Index of the sort field, the token after `SORT BY`.
    fn sort_field_index(&self) -> Option<usize> {
        let field_idx = self.find_pair(0, "SORT", "BY")? + 2;
        match self.tokens.get(field_idx) {
            Some(t) if !t.is("AS") && !t.is("REVERSED") => Some(field_idx),
            _ => None,
        }
    }

    /// Index of the first alias token, the token after `SORT BY field AS`.
    fn alias_index(&self) -> Option<usize> {
        let field_idx = self.sort_field_index()?;
        let alias_idx = field_idx + 2;
        (self.is(field_idx + 1, "AS") && alias_idx < self.tokens.len()).then_some(alias_idx)
    }

    fn sort(&self) -> Result<SortClause, ParseError> {
        let field_idx = self.sort_field_index().ok_or(ParseError::SortMissing)?;
        let field = self.tokens[field_idx].text;

        // The first token after `AS` is always alias text, even `Reversed`.
        let alias_from = self.alias_index().ok_or(ParseError::SortAliasMissing)?;
        let end = self.clause_end(alias_from + 1, &["REVERSED"]);
        let alias = self.text(alias_from, end);

        Ok(SortClause {
            field: field.to_string(),
            alias: alias.to_string(),
        })
    }

    fn reversed(&self) -> bool {
        let alias = self.alias_index();
        self.tokens
            .iter()
            .enumerate()
            .any(|(i, t)| t.is("REVERSED") && Some(i) != alias)
    }
}

fn list_separator() -> &'static Regex {
    static SEPARATOR: OnceLock<Regex> = OnceLock::new();
    SEPARATOR.get_or_init(|| Regex::new(r"[\s,]+").expect("static pattern"))
}
