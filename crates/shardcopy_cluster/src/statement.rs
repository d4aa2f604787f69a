//! COPY request model and the statements sent to shard replicas.

use shardcopy_common::error::{CopyError, CopyResult};
use shardcopy_common::types::{QualifiedName, ShardId};

/// Direction of a COPY request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CopyDirection {
    /// `COPY table FROM ...`: ingest through the coordinator.
    #[default]
    From,
    /// `COPY table TO ...`: served by a rewritten distributed SELECT.
    To,
}

/// One `WITH (...)` option, forwarded to every shard statement.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CopyOption {
    pub name: String,
    pub value: Option<String>,
}

impl CopyOption {
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: Some(value.into()),
        }
    }

    /// Option without an argument, e.g. `header`.
    pub fn flag(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: None,
        }
    }
}

/// A bulk COPY request as issued by the caller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CopyRequest {
    pub table: QualifiedName,
    /// Copied columns; empty means every table column in table order.
    pub columns: Vec<String>,
    pub options: Vec<CopyOption>,
    pub direction: CopyDirection,
}

impl CopyRequest {
    pub fn new(table: QualifiedName) -> Self {
        Self {
            table,
            columns: Vec::new(),
            options: Vec::new(),
            direction: CopyDirection::From,
        }
    }

    pub fn with_columns<I, S>(mut self, columns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.columns = columns.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_option(mut self, option: CopyOption) -> Self {
        self.options.push(option);
        self
    }

    pub fn with_direction(mut self, direction: CopyDirection) -> Self {
        self.direction = direction;
        self
    }

    /// Value of the last option named `name` (case-insensitive). A bare flag
    /// reads as `Some("")`.
    pub fn option(&self, name: &str) -> Option<&str> {
        self.options
            .iter()
            .rev()
            .find(|o| o.name.eq_ignore_ascii_case(name))
            .map(|o| o.value.as_deref().unwrap_or(""))
    }

    pub fn is_binary(&self) -> bool {
        self.options.iter().any(|o| {
            (o.name.eq_ignore_ascii_case("format")
                && o.value
                    .as_deref()
                    .is_some_and(|v| v.eq_ignore_ascii_case("binary")))
                || (o.name.eq_ignore_ascii_case("binary") && o.value.is_none())
        })
    }

    pub fn is_csv(&self) -> bool {
        self.option("format")
            .is_some_and(|v| v.eq_ignore_ascii_case("csv"))
    }
}

/// Quote an identifier unless it is a plain lower-case name.
pub fn quote_ident(ident: &str) -> String {
    let mut chars = ident.chars();
    let plain = match chars.next() {
        Some(c) if c.is_ascii_lowercase() || c == '_' => {
            chars.all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_')
        }
        _ => false,
    };
    if plain {
        ident.to_string()
    } else {
        format!("\"{}\"", ident.replace('"', "\"\""))
    }
}

/// Quote a string literal, doubling embedded single quotes.
pub fn quote_literal(value: &str) -> String {
    format!("'{}'", value.replace('\'', "''"))
}

fn quote_qualified(schema: Option<&str>, name: &str) -> String {
    match schema {
        Some(schema) => format!("{}.{}", quote_ident(schema), quote_ident(name)),
        None => quote_ident(name),
    }
}

/// Options consumed by the coordinator's own input parsing. Forwarding them
/// would make every shard skip its first streamed row.
const LOCAL_OPTIONS: &[&str] = &["header"];

fn render_options<'a>(options: impl IntoIterator<Item = &'a CopyOption>) -> CopyResult<String> {
    let mut rendered = Vec::new();
    for option in options {
        if option.name.is_empty()
            || !option
                .name
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '_')
        {
            return Err(CopyError::InvalidRequest(format!(
                "invalid COPY option name '{}'",
                option.name
            )));
        }
        let name = option.name.to_ascii_lowercase();
        match &option.value {
            Some(value) => rendered.push(format!("{} {}", name, quote_literal(value))),
            None => rendered.push(name),
        }
    }
    if rendered.is_empty() {
        return Ok(String::new());
    }
    Ok(format!(" WITH ({})", rendered.join(", ")))
}

/// Renders the per-shard `COPY ... FROM STDIN` statement.
///
/// The column list and options are rendered once per operation; only the
/// physical relation name changes from shard to shard.
#[derive(Debug, Clone)]
pub struct CopyStatementBuilder {
    schema: Option<String>,
    table: String,
    column_list: String,
    with_clause: String,
}

impl CopyStatementBuilder {
    pub fn new(request: &CopyRequest) -> CopyResult<Self> {
        let column_list = if request.columns.is_empty() {
            String::new()
        } else {
            let cols: Vec<String> = request.columns.iter().map(|c| quote_ident(c)).collect();
            format!(" ({})", cols.join(", "))
        };
        Ok(Self {
            schema: request.table.schema.clone(),
            table: request.table.name.clone(),
            column_list,
            with_clause: render_options(request.options.iter().filter(|o| {
                !LOCAL_OPTIONS
                    .iter()
                    .any(|local| o.name.eq_ignore_ascii_case(local))
            }))?,
        })
    }

    /// Name of the shard's physical relation: `<table>_<shardId>`.
    pub fn shard_relation(&self, shard_id: ShardId) -> String {
        quote_qualified(
            self.schema.as_deref(),
            &format!("{}_{}", self.table, shard_id),
        )
    }

    pub fn build(&self, shard_id: ShardId) -> String {
        format!(
            "COPY {}{} FROM STDIN{}",
            self.shard_relation(shard_id),
            self.column_list,
            self.with_clause
        )
    }
}

/// Rewrite a `COPY table TO` request into a copy of `SELECT * FROM table`,
/// which the distributed query path can execute across all shards.
pub fn export_statement(request: &CopyRequest) -> CopyResult<String> {
    if request.direction != CopyDirection::To {
        return Err(CopyError::InvalidRequest(
            "only COPY ... TO requests can be rewritten for export".into(),
        ));
    }
    let relation = quote_qualified(request.table.schema.as_deref(), &request.table.name);
    let projection = if request.columns.is_empty() {
        "*".to_string()
    } else {
        request
            .columns
            .iter()
            .map(|c| quote_ident(c))
            .collect::<Vec<_>>()
            .join(", ")
    };
    Ok(format!(
        "COPY (SELECT {} FROM {}) TO STDOUT{}",
        projection,
        relation,
        render_options(&request.options)?
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request() -> CopyRequest {
        CopyRequest::new(QualifiedName::parse("public.events"))
            .with_columns(["id", "payload"])
            .with_option(CopyOption::new("FORMAT", "csv"))
            .with_option(CopyOption::new("delimiter", "'"))
            .with_option(CopyOption::flag("header"))
    }

    #[test]
    fn test_shard_statement() {
        let builder = CopyStatementBuilder::new(&request()).unwrap();
        assert_eq!(
            builder.build(ShardId(42)),
            "COPY public.events_42 (id, payload) FROM STDIN WITH (format 'csv', delimiter '''', header)"
        );
    }

    #[test]
    fn test_statement_without_columns_or_options() {
        let req = CopyRequest::new(QualifiedName::parse("events"));
        let builder = CopyStatementBuilder::new(&req).unwrap();
        assert_eq!(builder.build(ShardId(7)), "COPY events_7 FROM STDIN");
    }

    #[test]
    fn test_quote_ident() {
        assert_eq!(quote_ident("orders"), "orders");
        assert_eq!(quote_ident("_x1"), "_x1");
        assert_eq!(quote_ident("Orders"), "\"Orders\"");
        assert_eq!(quote_ident("my table"), "\"my table\"");
        assert_eq!(quote_ident("a\"b"), "\"a\"\"b\"");
        assert_eq!(quote_ident("1abc"), "\"1abc\"");
    }

    #[test]
    fn test_mixed_case_relation_quoted_as_whole() {
        let req = CopyRequest::new(QualifiedName::new(Some("App"), "Events"));
        let builder = CopyStatementBuilder::new(&req).unwrap();
        assert_eq!(builder.shard_relation(ShardId(3)), "\"App\".\"Events_3\"");
    }

    #[test]
    fn test_option_name_injection_rejected() {
        let req = CopyRequest::new(QualifiedName::parse("events"))
            .with_option(CopyOption::new("format) ; drop table x; --", "csv"));
        assert!(matches!(
            CopyStatementBuilder::new(&req),
            Err(CopyError::InvalidRequest(_))
        ));
    }

    #[test]
    fn test_binary_detection() {
        let req = CopyRequest::new(QualifiedName::parse("t"))
            .with_option(CopyOption::new("format", "BINARY"));
        assert!(req.is_binary());
        let req = CopyRequest::new(QualifiedName::parse("t")).with_option(CopyOption::flag("binary"));
        assert!(req.is_binary());
        assert!(!request().is_binary());
        assert!(request().is_csv());
        assert_eq!(request().option("HEADER"), Some(""));
    }

    #[test]
    fn test_export_rewrite() {
        let req = request().with_direction(CopyDirection::To);
        assert_eq!(
            export_statement(&req).unwrap(),
            "COPY (SELECT id, payload FROM public.events) TO STDOUT WITH (format 'csv', delimiter '''', header)"
        );
        let req = CopyRequest::new(QualifiedName::parse("events")).with_direction(CopyDirection::To);
        assert_eq!(
            export_statement(&req).unwrap(),
            "COPY (SELECT * FROM events) TO STDOUT"
        );
        assert!(export_statement(&request()).is_err());
    }
}
