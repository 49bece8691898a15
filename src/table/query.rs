//! Table query construction
//!
//! A query is an ordered list of where clauses, each a template with `?`
//! placeholders plus its parameters. Clauses are encoded into a single OData
//! filter string joined with `and`.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use thiserror::Error;

use crate::table::entity::{classify, format_datetime, EntityProperty, EntityValue, PARTITION_KEY, ROW_KEY};

/// Errors raised while assembling a filter.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum QueryError {
    #[error("where clause '{template}' expects {expected} parameter(s), got {actual}")]
    ParameterCount {
        template: String,
        expected: usize,
        actual: usize,
    },

    #[error("unknown placeholder type '?{0}?'")]
    UnknownPlaceholder(String),

    #[error("parameter {value} cannot be encoded as {kind}")]
    InvalidParameter { value: String, kind: String },

    #[error("where clause must start with a template string")]
    MissingTemplate,
}

/// One condition template plus its positional parameters.
#[derive(Debug, Clone, PartialEq)]
pub struct WhereClause {
    pub template: String,
    pub params: Vec<EntityValue>,
}

impl WhereClause {
    pub fn new(template: impl Into<String>, params: Vec<EntityValue>) -> Self {
        Self {
            template: template.into(),
            params,
        }
    }

    /// Builds a clause from the `[template, param, ...]` list form used in task options.
    pub fn from_list(items: Vec<EntityValue>) -> Result<Self, QueryError> {
        let mut items = items.into_iter();
        match items.next() {
            Some(EntityValue::String(template)) => Ok(Self::new(template, items.collect())),
            _ => Err(QueryError::MissingTemplate),
        }
    }

    /// Substitutes every placeholder with the encoded parameter.
    pub fn encode(&self) -> Result<String, QueryError> {
        let mut out = String::with_capacity(self.template.len());
        let mut params = self.params.iter();
        let mut used = 0;
        let mut rest = self.template.as_str();

        while let Some(pos) = rest.find('?') {
            out.push_str(&rest[..pos]);
            rest = &rest[pos + 1..];

            let kind = match typed_placeholder(rest) {
                Some(kind) => {
                    rest = &rest[kind.len() + 1..];
                    Some(kind)
                }
                None => None,
            };

            let param = params.next().ok_or_else(|| self.count_error())?;
            used += 1;
            out.push_str(&encode_literal(param, kind)?);
        }
        out.push_str(rest);

        if used != self.params.len() {
            return Err(self.count_error());
        }
        Ok(out)
    }

    fn count_error(&self) -> QueryError {
        QueryError::ParameterCount {
            template: self.template.clone(),
            expected: self.template.matches('?').count() - typed_placeholder_count(&self.template),
            actual: self.params.len(),
        }
    }
}

const PLACEHOLDER_KINDS: [&str; 8] = ["string", "int32", "int64", "double", "bool", "date", "guid", "binary"];

/// Recognizes `kind?` right after an opening `?`.
fn typed_placeholder(rest: &str) -> Option<&str> {
    let end = rest.find('?')?;
    let kind = &rest[..end];
    if !kind.is_empty() && kind.chars().all(|c| c.is_ascii_alphanumeric()) {
        Some(kind)
    } else {
        None
    }
}

fn typed_placeholder_count(template: &str) -> usize {
    let mut count = 0;
    let mut rest = template;
    while let Some(pos) = rest.find('?') {
        rest = &rest[pos + 1..];
        if let Some(kind) = typed_placeholder(rest) {
            rest = &rest[kind.len() + 1..];
            count += 1;
        }
    }
    count
}

fn encode_literal(value: &EntityValue, kind: Option<&str>) -> Result<String, QueryError> {
    let property = match kind {
        None => classify("parameter", value).map_err(|_| invalid(value, "binary"))?,
        Some(kind) => coerce(value, kind)?,
    };
    Ok(match property {
        EntityProperty::String(s) => quote(&s),
        EntityProperty::Int32(i) => i.to_string(),
        EntityProperty::Int64(i) => format!("{}L", i),
        EntityProperty::Double(f) => {
            let text = f.to_string();
            if text.contains('.') || text.contains('e') { text } else { format!("{}.0", text) }
        }
        EntityProperty::Boolean(b) => b.to_string(),
        EntityProperty::DateTime(dt) => format!("datetime'{}'", format_datetime(&dt)),
        EntityProperty::Guid(g) => format!("guid'{}'", g),
        EntityProperty::Binary(bytes) => format!("X'{}'", hex::encode(bytes)),
    })
}

fn coerce(value: &EntityValue, kind: &str) -> Result<EntityProperty, QueryError> {
    let bad = || invalid(value, kind);
    Ok(match (kind, value) {
        ("string", EntityValue::String(s)) => EntityProperty::String(s.clone()),
        ("string", other) => EntityProperty::String(other.to_json().to_string()),
        ("int32", EntityValue::Integer(i)) => EntityProperty::Int32(i32::try_from(*i).map_err(|_| bad())?),
        ("int64", EntityValue::Integer(i)) => EntityProperty::Int64(*i),
        ("int64", EntityValue::String(s)) => EntityProperty::Int64(s.parse().map_err(|_| bad())?),
        ("double", EntityValue::Integer(i)) => EntityProperty::Double(*i as f64),
        ("double", EntityValue::Float(f)) => EntityProperty::Double(*f),
        ("bool", EntityValue::Bool(b)) => EntityProperty::Boolean(*b),
        ("date", EntityValue::DateTime(dt)) => EntityProperty::DateTime(*dt),
        ("date", EntityValue::String(s)) => {
            EntityProperty::DateTime(crate::table::entity::parse_datetime(s).ok_or_else(bad)?)
        }
        ("guid", EntityValue::String(s)) => EntityProperty::Guid(s.clone()),
        ("binary", EntityValue::String(s)) => EntityProperty::Binary(BASE64.decode(s).map_err(|_| bad())?),
        ("binary", EntityValue::Array(_)) => classify("parameter", value).map_err(|_| bad())?,
        (k, _) if !PLACEHOLDER_KINDS.contains(&k) => return Err(QueryError::UnknownPlaceholder(k.to_string())),
        _ => return Err(bad()),
    })
}

fn invalid(value: &EntityValue, kind: &str) -> QueryError {
    QueryError::InvalidParameter {
        value: value.to_json().to_string(),
        kind: kind.to_string(),
    }
}

fn quote(s: &str) -> String {
    format!("'{}'", s.replace('\'', "''"))
}

/// Smallest string strictly greater than every string starting with `prefix`.
///
/// The last character is incremented by one code point; a trailing `'9'`
/// jumps to `'A'`. Returns None for an empty prefix.
pub fn next_prefix(prefix: &str) -> Option<String> {
    let mut chars: Vec<char> = prefix.chars().collect();
    let last = chars.pop()?;
    let code = if last == '9' { 64 } else { last as u32 };

    let next = (code + 1..=char::MAX as u32).find_map(char::from_u32)?;
    chars.push(next);
    Some(chars.into_iter().collect())
}

/// Clause selecting every value of `field` that starts with `prefix`.
pub fn prefix_clause(field: &str, prefix: &str) -> Option<WhereClause> {
    if prefix.is_empty() {
        return None;
    }
    let clause = match next_prefix(prefix) {
        Some(upper) => WhereClause::new(
            format!("{field} ge ? and {field} lt ?"),
            vec![EntityValue::from(prefix), EntityValue::String(upper)],
        ),
        None => WhereClause::new(format!("{field} ge ?"), vec![EntityValue::from(prefix)]),
    };
    Some(clause)
}

/// A table query: filter clauses, result limit and projection.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TableQuery {
    clauses: Vec<WhereClause>,
    top: Option<usize>,
    select: Vec<String>,
}

impl TableQuery {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn where_clause(mut self, clause: WhereClause) -> Self {
        self.clauses.push(clause);
        self
    }

    pub fn and(self, clause: WhereClause) -> Self {
        self.where_clause(clause)
    }

    pub fn top(mut self, top: usize) -> Self {
        self.top = Some(top);
        self
    }

    pub fn select<I, S>(mut self, fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.select.extend(fields.into_iter().map(Into::into));
        self
    }

    pub fn clauses(&self) -> &[WhereClause] {
        &self.clauses
    }

    pub fn top_count(&self) -> Option<usize> {
        self.top
    }

    pub fn selected(&self) -> &[String] {
        &self.select
    }

    /// The combined OData filter, or None when there is no clause.
    pub fn filter_string(&self) -> Result<Option<String>, QueryError> {
        match self.clauses.as_slice() {
            [] => Ok(None),
            [single] => single.encode().map(Some),
            many => {
                let encoded = many
                    .iter()
                    .map(|c| c.encode().map(|s| format!("({})", s)))
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(Some(encoded.join(" and ")))
            }
        }
    }
}

/// Inputs of a query task.
#[derive(Debug, Clone, Default)]
pub struct QuerySpec {
    pub pk_prefix: Option<String>,
    pub rk_prefix: Option<String>,
    pub where_clauses: Vec<WhereClause>,
    pub select: Vec<String>,
    /// Values <= 0 mean unlimited.
    pub top: i64,
}

/// Combines explicit clauses and prefix shorthands into one query.
///
/// Prefix clauses are appended after the explicit clauses.
pub fn build_query(spec: &QuerySpec) -> TableQuery {
    let mut clauses = spec.where_clauses.clone();
    if let Some(clause) = spec.pk_prefix.as_deref().and_then(|p| prefix_clause(PARTITION_KEY, p)) {
        clauses.push(clause);
    }
    if let Some(clause) = spec.rk_prefix.as_deref().and_then(|p| prefix_clause(ROW_KEY, p)) {
        clauses.push(clause);
    }

    let mut query = clauses.into_iter().fold(TableQuery::new(), TableQuery::and);
    if spec.top > 0 {
        query = query.top(spec.top as usize);
    }
    if !spec.select.is_empty() {
        query = query.select(spec.select.iter().cloned());
    }
    query
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_next_prefix() {
        assert_eq!(next_prefix("abc").as_deref(), Some("abd"));
        assert_eq!(next_prefix("a9").as_deref(), Some("aA"));
        assert_eq!(next_prefix("multiple").as_deref(), Some("multiplf"));
        assert_eq!(next_prefix("az").as_deref(), Some("a{"));
        assert_eq!(next_prefix(""), None);
    }

    #[test]
    fn test_next_prefix_skips_surrogates() {
        assert_eq!(next_prefix("\u{D7FF}").as_deref(), Some("\u{E000}"));
        assert_eq!(next_prefix("a\u{10FFFF}"), None);
    }

    #[test]
    fn test_prefix_clause_without_upper_bound() {
        let clause = prefix_clause("RowKey", "a\u{10FFFF}").unwrap();
        assert_eq!(clause.template, "RowKey ge ?");
        assert!(prefix_clause("RowKey", "").is_none());
    }

    #[test]
    fn test_encode_inferred_literals() {
        let clause = WhereClause::new(
            "Name eq ? and Age gt ? and Score lt ? and Big eq ? and Active eq ?",
            vec!["O'Neil".into(), 30i64.into(), 2.5f64.into(), 5000000000i64.into(), true.into()],
        );
        assert_eq!(
            clause.encode().unwrap(),
            "Name eq 'O''Neil' and Age gt 30 and Score lt 2.5 and Big eq 5000000000L and Active eq true"
        );
    }

    #[test]
    fn test_encode_typed_placeholders() {
        let clause = WhereClause::new(
            "Id eq ?guid? and Count eq ?int64? and Ratio eq ?double? and Code eq ?string?",
            vec![
                "0f8fad5b-d9cb-469f-a165-70867728950e".into(),
                12i64.into(),
                3i64.into(),
                7i64.into(),
            ],
        );
        assert_eq!(
            clause.encode().unwrap(),
            "Id eq guid'0f8fad5b-d9cb-469f-a165-70867728950e' and Count eq 12L and Ratio eq 3.0 and Code eq '7'"
        );
    }

    #[test]
    fn test_encode_errors() {
        let missing = WhereClause::new("A eq ? and B eq ?", vec!["x".into()]);
        assert!(matches!(missing.encode(), Err(QueryError::ParameterCount { expected: 2, actual: 1, .. })));

        let extra = WhereClause::new("A eq ?", vec!["x".into(), "y".into()]);
        assert!(matches!(extra.encode(), Err(QueryError::ParameterCount { .. })));

        let unknown = WhereClause::new("A eq ?decimal?", vec![1i64.into()]);
        assert_eq!(unknown.encode(), Err(QueryError::UnknownPlaceholder("decimal".into())));

        assert_eq!(WhereClause::from_list(vec![1i64.into()]), Err(QueryError::MissingTemplate));
    }

    #[test]
    fn test_build_query_appends_prefix_clauses() {
        let spec = QuerySpec {
            pk_prefix: Some("multiple".into()),
            rk_prefix: Some("a9".into()),
            where_clauses: vec![WhereClause::new("Age ge ?", vec![18i64.into()])],
            select: vec!["Age".into()],
            top: 10,
        };
        let query = build_query(&spec);

        assert_eq!(
            query.filter_string().unwrap().unwrap(),
            "(Age ge 18) and (PartitionKey ge 'multiple' and PartitionKey lt 'multiplf') \
             and (RowKey ge 'a9' and RowKey lt 'aA')"
        );
        assert_eq!(query.top_count(), Some(10));
        assert_eq!(query.selected(), &["Age".to_string()]);
    }

    #[test]
    fn test_unlimited_query() {
        let query = build_query(&QuerySpec { top: -1, ..Default::default() });
        assert_eq!(query.top_count(), None);
        assert_eq!(query.filter_string().unwrap(), None);
    }
}
