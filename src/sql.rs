use std::fmt;
use std::str::FromStr;

use chrono::{NaiveDate, NaiveTime};
use rust_decimal::Decimal;
use sqlparser::ast::{
    self, AssignmentTarget, Expr, FromTable, ObjectNamePart, SetExpr, Statement, TableFactor,
    TableObject, Value, ValueWithSpan,
};
use sqlparser::dialect::PostgreSqlDialect;
use sqlparser::parser::Parser;
use ulid::Ulid;

/// Tables and virtual tables reachable over the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Table {
    Properties,
    Rooms,
    AddOns,
    PricingRules,
    RoomFeeds,
    Bookings,
    PaymentEvents,
    Availability,
    Quote,
    RoomCalendar,
    CalendarSync,
}

impl Table {
    pub fn name(&self) -> &'static str {
        match self {
            Table::Properties => "properties",
            Table::Rooms => "rooms",
            Table::AddOns => "add_ons",
            Table::PricingRules => "pricing_rules",
            Table::RoomFeeds => "room_feeds",
            Table::Bookings => "bookings",
            Table::PaymentEvents => "payment_events",
            Table::Availability => "availability",
            Table::Quote => "quote",
            Table::RoomCalendar => "room_calendar",
            Table::CalendarSync => "calendar_sync",
        }
    }
}

impl FromStr for Table {
    type Err = SqlError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "properties" => Table::Properties,
            "rooms" => Table::Rooms,
            "add_ons" | "addons" => Table::AddOns,
            "pricing_rules" => Table::PricingRules,
            "room_feeds" => Table::RoomFeeds,
            "bookings" => Table::Bookings,
            "payment_events" => Table::PaymentEvents,
            "availability" => Table::Availability,
            "quote" => Table::Quote,
            "room_calendar" => Table::RoomCalendar,
            "calendar_sync" => Table::CalendarSync,
            other => return Err(SqlError::UnknownTable(other.to_string())),
        })
    }
}

/// A SQL literal, kept close to how it was written.
#[derive(Debug, Clone, PartialEq)]
pub enum Literal {
    Null,
    Bool(bool),
    /// Numbers keep their source text so decimals stay exact.
    Number(String),
    Text(String),
    Array(Vec<Literal>),
}

impl Literal {
    pub fn text(s: impl fmt::Display) -> Self {
        Literal::Text(s.to_string())
    }

    /// `NULL` for `None`.
    pub fn opt(s: Option<impl fmt::Display>) -> Self {
        s.map_or(Literal::Null, Literal::text)
    }

    fn as_text(&self) -> Option<String> {
        match self {
            Literal::Null | Literal::Array(_) => None,
            Literal::Bool(b) => Some(b.to_string()),
            Literal::Number(s) | Literal::Text(s) => Some(s.clone()),
        }
    }
}

/// Column/value pairs from an INSERT row, an UPDATE SET list or a WHERE clause.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Row {
    values: Vec<(String, Literal)>,
}

impl Row {
    pub fn new() -> Self {
        Self::default()
    }

    /// Later values for the same column replace earlier ones.
    pub fn set(&mut self, column: impl Into<String>, value: Literal) {
        let column = column.into();
        match self.values.iter_mut().find(|(c, _)| *c == column) {
            Some(slot) => slot.1 = value,
            None => self.values.push((column, value)),
        }
    }

    pub fn with(mut self, column: &str, value: Literal) -> Self {
        self.set(column, value);
        self
    }

    /// Copy every column of `other` over this row.
    pub fn overlay(&mut self, other: &Row) {
        for (column, value) in &other.values {
            self.set(column.clone(), value.clone());
        }
    }

    pub fn get(&self, column: &str) -> Option<&Literal> {
        self.values.iter().find(|(c, _)| c == column).map(|(_, v)| v)
    }

    pub fn has(&self, column: &str) -> bool {
        self.get(column).is_some()
    }

    pub fn columns(&self) -> impl Iterator<Item = &str> {
        self.values.iter().map(|(c, _)| c.as_str())
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Text of a column; `None` when absent or NULL.
    pub fn text(&self, column: &str) -> Result<Option<String>, SqlError> {
        match self.get(column) {
            None | Some(Literal::Null) => Ok(None),
            Some(lit) => lit
                .as_text()
                .map(Some)
                .ok_or_else(|| SqlError::bad_value(column, "expected a scalar")),
        }
    }

    pub fn require_text(&self, column: &'static str) -> Result<String, SqlError> {
        self.text(column)?.ok_or(SqlError::MissingColumn(column))
    }

    fn parsed<T, E: fmt::Display>(
        &self,
        column: &str,
        parse: impl FnOnce(&str) -> Result<T, E>,
    ) -> Result<Option<T>, SqlError> {
        match self.text(column)? {
            None => Ok(None),
            Some(s) => parse(s.trim())
                .map(Some)
                .map_err(|e| SqlError::bad_value(column, e)),
        }
    }

    pub fn ulid(&self, column: &str) -> Result<Option<Ulid>, SqlError> {
        self.parsed(column, Ulid::from_string)
    }

    pub fn require_ulid(&self, column: &'static str) -> Result<Ulid, SqlError> {
        self.ulid(column)?.ok_or(SqlError::MissingColumn(column))
    }

    pub fn bool(&self, column: &str) -> Result<Option<bool>, SqlError> {
        if let Some(Literal::Bool(b)) = self.get(column) {
            return Ok(Some(*b));
        }
        self.parsed(column, |s| match s.to_lowercase().as_str() {
            "true" | "t" | "1" | "yes" => Ok(true),
            "false" | "f" | "0" | "no" => Ok(false),
            _ => Err("expected a boolean"),
        })
    }

    pub fn u32(&self, column: &str) -> Result<Option<u32>, SqlError> {
        self.parsed(column, u32::from_str)
    }

    pub fn decimal(&self, column: &str) -> Result<Option<Decimal>, SqlError> {
        self.parsed(column, Decimal::from_str)
    }

    /// `YYYY-MM-DD`.
    pub fn date(&self, column: &str) -> Result<Option<NaiveDate>, SqlError> {
        self.parsed(column, |s| NaiveDate::parse_from_str(s, "%Y-%m-%d"))
    }

    pub fn require_date(&self, column: &'static str) -> Result<NaiveDate, SqlError> {
        self.date(column)?.ok_or(SqlError::MissingColumn(column))
    }

    /// `HH:MM` or `HH:MM:SS`.
    pub fn time(&self, column: &str) -> Result<Option<NaiveTime>, SqlError> {
        self.parsed(column, |s| {
            NaiveTime::parse_from_str(s, "%H:%M:%S")
                .or_else(|_| NaiveTime::parse_from_str(s, "%H:%M"))
        })
    }

    /// A list column: `ARRAY['a','b']`, `'{a,b}'`, `'["a","b"]'` or `'a,b'`.
    /// Absent or NULL reads as empty.
    pub fn list(&self, column: &str) -> Result<Vec<String>, SqlError> {
        match self.get(column) {
            None | Some(Literal::Null) => Ok(Vec::new()),
            Some(Literal::Array(items)) => items
                .iter()
                .filter(|l| **l != Literal::Null)
                .map(|l| {
                    l.as_text()
                        .ok_or_else(|| SqlError::bad_value(column, "nested arrays are not supported"))
                })
                .collect(),
            Some(lit) => {
                let text = lit.as_text().unwrap_or_default();
                split_list(&text).map_err(|e| SqlError::bad_value(column, e))
            }
        }
    }

    pub fn ulid_list(&self, column: &str) -> Result<Vec<Ulid>, SqlError> {
        self.list(column)?
            .iter()
            .map(|s| Ulid::from_string(s.trim()).map_err(|e| SqlError::bad_value(column, e)))
            .collect()
    }
}

fn split_list(text: &str) -> Result<Vec<String>, serde_json::Error> {
    let trimmed = text.trim();
    if trimmed.starts_with('[') {
        return serde_json::from_str(trimmed);
    }
    let inner = trimmed
        .strip_prefix('{')
        .and_then(|s| s.strip_suffix('}'))
        .unwrap_or(trimmed);
    Ok(inner
        .split(',')
        .map(|s| s.trim().trim_matches('"').to_string())
        .filter(|s| !s.is_empty())
        .collect())
}

/// Parsed command from SQL input.
#[derive(Debug, PartialEq)]
pub enum Command {
    Insert { table: Table, row: Row },
    Update { table: Table, id: Ulid, assignments: Row },
    Delete { table: Table, id: Ulid },
    /// Equality filters joined by AND.
    Select { table: Table, filters: Row },
}

impl Command {
    pub fn table(&self) -> Table {
        match self {
            Command::Insert { table, .. }
            | Command::Update { table, .. }
            | Command::Delete { table, .. }
            | Command::Select { table, .. } => *table,
        }
    }
}

pub fn parse_sql(sql: &str) -> Result<Command, SqlError> {
    let dialect = PostgreSqlDialect {};
    let stmts = Parser::parse_sql(&dialect, sql).map_err(|e| SqlError::Parse(e.to_string()))?;
    let stmt = match stmts.as_slice() {
        [] => return Err(SqlError::Empty),
        [stmt] => stmt,
        _ => return Err(SqlError::Unsupported("multiple statements".into())),
    };

    match stmt {
        Statement::Insert(insert) => parse_insert(insert),
        Statement::Update {
            table,
            assignments,
            selection,
            ..
        } => parse_update(table, assignments, selection),
        Statement::Delete(delete) => parse_delete(delete),
        Statement::Query(query) => parse_select(query),
        other => Err(SqlError::Unsupported(format!("{other}"))),
    }
}

/// Split a simple-query batch into its statements, each rendered back to SQL.
pub fn split_statements(sql: &str) -> Result<Vec<String>, SqlError> {
    let dialect = PostgreSqlDialect {};
    let stmts = Parser::parse_sql(&dialect, sql).map_err(|e| SqlError::Parse(e.to_string()))?;
    if stmts.is_empty() {
        return Err(SqlError::Empty);
    }
    Ok(stmts.iter().map(|s| s.to_string()).collect())
}

/// Table a SELECT reads from, without looking at its filters. Used to describe
/// prepared statements whose parameters are not bound yet.
pub fn select_table(sql: &str) -> Option<Table> {
    let dialect = PostgreSqlDialect {};
    let stmts = Parser::parse_sql(&dialect, sql).ok()?;
    let Some(Statement::Query(query)) = stmts.first() else {
        return None;
    };
    let SetExpr::Select(select) = query.body.as_ref() else {
        return None;
    };
    let from = select.from.first()?;
    table_factor_name(&from.relation).ok()?.parse().ok()
}

fn parse_insert(insert: &ast::Insert) -> Result<Command, SqlError> {
    let table: Table = insert_table_name(insert)?.parse()?;
    if insert.columns.is_empty() {
        return Err(SqlError::Parse("INSERT needs an explicit column list".into()));
    }
    let values = extract_insert_values(insert)?;
    if values.len() != insert.columns.len() {
        return Err(SqlError::WrongArity(
            table.name(),
            insert.columns.len(),
            values.len(),
        ));
    }

    let mut row = Row::new();
    for (column, expr) in insert.columns.iter().zip(&values) {
        row.set(column.value.to_lowercase(), literal(expr)?);
    }
    Ok(Command::Insert { table, row })
}

fn parse_update(
    table: &ast::TableWithJoins,
    assignments: &[ast::Assignment],
    selection: &Option<Expr>,
) -> Result<Command, SqlError> {
    let table: Table = table_factor_name(&table.relation)?.parse()?;
    let id = extract_where_id(selection)?;

    let mut row = Row::new();
    for assignment in assignments {
        let column = match &assignment.target {
            AssignmentTarget::ColumnName(name) => {
                object_name_last(name).ok_or_else(|| SqlError::Parse("empty column name".into()))?
            }
            AssignmentTarget::Tuple(_) => {
                return Err(SqlError::Unsupported("tuple assignment".into()));
            }
        };
        if column == "id" {
            return Err(SqlError::Unsupported("changing an id".into()));
        }
        row.set(column, literal(&assignment.value)?);
    }
    if row.is_empty() {
        return Err(SqlError::Parse("UPDATE without assignments".into()));
    }
    Ok(Command::Update {
        table,
        id,
        assignments: row,
    })
}

fn parse_delete(delete: &ast::Delete) -> Result<Command, SqlError> {
    let table: Table = delete_table_name(delete)?.parse()?;
    let id = extract_where_id(&delete.selection)?;
    Ok(Command::Delete { table, id })
}

fn parse_select(query: &ast::Query) -> Result<Command, SqlError> {
    let select = match query.body.as_ref() {
        SetExpr::Select(s) => s,
        _ => return Err(SqlError::Unsupported("non-SELECT query".into())),
    };

    if select.from.is_empty() {
        return Err(SqlError::Parse("SELECT without FROM".into()));
    }
    if select.from.len() > 1 || !select.from[0].joins.is_empty() {
        return Err(SqlError::Unsupported("joins".into()));
    }
    let table: Table = table_factor_name(&select.from[0].relation)?.parse()?;

    let mut filters = Row::new();
    if let Some(selection) = &select.selection {
        extract_filters(selection, &mut filters)?;
    }
    Ok(Command::Select { table, filters })
}

fn extract_filters(expr: &Expr, filters: &mut Row) -> Result<(), SqlError> {
    match expr {
        Expr::Nested(inner) => extract_filters(inner, filters),
        Expr::BinaryOp {
            left,
            op: ast::BinaryOperator::And,
            right,
        } => {
            extract_filters(left, filters)?;
            extract_filters(right, filters)
        }
        Expr::BinaryOp {
            left,
            op: ast::BinaryOperator::Eq,
            right,
        } => {
            let column = expr_column_name(left)
                .ok_or_else(|| SqlError::Unsupported(format!("filter on {left}")))?;
            filters.set(column, literal(right)?);
            Ok(())
        }
        Expr::IsTrue(inner) => {
            let column = expr_column_name(inner)
                .ok_or_else(|| SqlError::Unsupported(format!("filter on {inner}")))?;
            filters.set(column, Literal::Bool(true));
            Ok(())
        }
        Expr::Identifier(_) | Expr::CompoundIdentifier(_) => {
            // bare boolean column: `WHERE is_whole_property`
            if let Some(column) = expr_column_name(expr) {
                filters.set(column, Literal::Bool(true));
            }
            Ok(())
        }
        other => Err(SqlError::Unsupported(format!("WHERE {other}"))),
    }
}

// ── Helpers ───────────────────────────────────────────────────

fn object_name_last(name: &ast::ObjectName) -> Option<String> {
    name.0.last().and_then(|part| match part {
        ObjectNamePart::Identifier(ident) => Some(ident.value.to_lowercase()),
        _ => None,
    })
}

fn insert_table_name(insert: &ast::Insert) -> Result<String, SqlError> {
    match &insert.table {
        TableObject::TableName(name) => {
            object_name_last(name).ok_or_else(|| SqlError::Parse("empty table name".into()))
        }
        _ => Err(SqlError::Parse("unsupported table object in INSERT".into())),
    }
}

fn delete_table_name(delete: &ast::Delete) -> Result<String, SqlError> {
    let tables_with_joins = match &delete.from {
        FromTable::WithFromKeyword(t) | FromTable::WithoutKeyword(t) => t,
    };
    if let Some(first) = tables_with_joins.first() {
        table_factor_name(&first.relation)
    } else {
        Err(SqlError::Parse("DELETE without table".into()))
    }
}

fn table_factor_name(tf: &TableFactor) -> Result<String, SqlError> {
    match tf {
        TableFactor::Table { name, .. } => {
            object_name_last(name).ok_or_else(|| SqlError::Parse("empty table name".into()))
        }
        _ => Err(SqlError::Parse("complex table expression".into())),
    }
}

fn extract_insert_values(insert: &ast::Insert) -> Result<Vec<Expr>, SqlError> {
    let body = insert
        .source
        .as_ref()
        .ok_or(SqlError::Parse("no VALUES".into()))?;
    match body.body.as_ref() {
        SetExpr::Values(values) => match values.rows.as_slice() {
            [] => Err(SqlError::Parse("empty VALUES".into())),
            [row] => Ok(row.clone()),
            _ => Err(SqlError::Unsupported("multi-row INSERT".into())),
        },
        _ => Err(SqlError::Parse("expected VALUES".into())),
    }
}

fn extract_where_id(selection: &Option<Expr>) -> Result<Ulid, SqlError> {
    let sel = selection.as_ref().ok_or(SqlError::MissingFilter("id"))?;
    let mut filters = Row::new();
    extract_filters(sel, &mut filters)?;
    if filters.columns().any(|c| c != "id") {
        return Err(SqlError::Unsupported("only WHERE id = ... is supported here".into()));
    }
    filters.ulid("id")?.ok_or(SqlError::MissingFilter("id"))
}

fn expr_column_name(expr: &Expr) -> Option<String> {
    match expr {
        Expr::Identifier(ident) => Some(ident.value.to_lowercase()),
        Expr::CompoundIdentifier(parts) => parts.last().map(|i| i.value.to_lowercase()),
        _ => None,
    }
}

fn extract_value(expr: &Expr) -> Option<&Value> {
    match expr {
        Expr::Value(ValueWithSpan { value, .. }) => Some(value),
        _ => None,
    }
}

fn literal(expr: &Expr) -> Result<Literal, SqlError> {
    if let Some(value) = extract_value(expr) {
        return match value {
            Value::Null => Ok(Literal::Null),
            Value::Boolean(b) => Ok(Literal::Bool(*b)),
            Value::Number(n, _) => Ok(Literal::Number(n.to_string())),
            Value::SingleQuotedString(s)
            | Value::DoubleQuotedString(s)
            | Value::EscapedStringLiteral(s)
            | Value::DollarQuotedString(ast::DollarQuotedString { value: s, .. }) => {
                Ok(Literal::Text(s.clone()))
            }
            other => Err(SqlError::Parse(format!("unsupported literal {other}"))),
        };
    }
    match expr {
        Expr::UnaryOp {
            op: ast::UnaryOperator::Minus,
            expr,
        } => match literal(expr)? {
            Literal::Number(n) => Ok(Literal::Number(format!("-{n}"))),
            _ => Err(SqlError::Parse(format!("cannot negate {expr}"))),
        },
        Expr::UnaryOp {
            op: ast::UnaryOperator::Plus,
            expr,
        } => literal(expr),
        // '2025-06-06'::date and friends
        Expr::Cast { expr, .. } | Expr::Nested(expr) => literal(expr),
        Expr::Array(array) => array
            .elem
            .iter()
            .map(literal)
            .collect::<Result<Vec<_>, _>>()
            .map(Literal::Array),
        _ => Err(SqlError::Parse(format!("expected a literal, got {expr}"))),
    }
}

// ── Errors ────────────────────────────────────────────────────

#[derive(Debug)]
pub enum SqlError {
    Parse(String),
    Empty,
    Unsupported(String),
    UnknownTable(String),
    WrongArity(&'static str, usize, usize),
    MissingFilter(&'static str),
    MissingColumn(&'static str),
    BadValue { column: String, reason: String },
}

impl SqlError {
    pub fn bad_value(column: &str, reason: impl fmt::Display) -> Self {
        SqlError::BadValue {
            column: column.to_string(),
            reason: reason.to_string(),
        }
    }
}

impl fmt::Display for SqlError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SqlError::Parse(s) => write!(f, "parse error: {s}"),
            SqlError::Empty => write!(f, "empty query"),
            SqlError::Unsupported(s) => write!(f, "unsupported: {s}"),
            SqlError::UnknownTable(t) => write!(f, "unknown table: {t}"),
            SqlError::WrongArity(t, expected, got) => {
                write!(f, "{t}: expected {expected} values, got {got}")
            }
            SqlError::MissingFilter(col) => write!(f, "missing filter: {col}"),
            SqlError::MissingColumn(col) => write!(f, "missing column: {col}"),
            SqlError::BadValue { column, reason } => write!(f, "bad value for {column}: {reason}"),
        }
    }
}

impl std::error::Error for SqlError {}
