use chrono::{DateTime, NaiveDate, Utc};
use sqlparser::ast::{
    self, AssignmentTarget, Expr, FromTable, ObjectNamePart, SetExpr, Statement, TableFactor,
    TableObject, Value, ValueWithSpan,
};
use sqlparser::dialect::PostgreSqlDialect;
use sqlparser::parser::Parser;
use ulid::Ulid;

use crate::limits::MAX_SQL_LEN;
use crate::model::*;

/// Parsed command from SQL input.
#[derive(Debug, PartialEq)]
pub enum Command {
    InsertUser {
        id: Ulid,
        email: String,
        first_name: String,
        last_name: String,
        role: Option<String>,
    },
    /// Profile edit; absent fields keep their current value.
    UpdateUser {
        id: Ulid,
        email: Option<String>,
        first_name: Option<String>,
        last_name: Option<String>,
        role: Option<String>,
    },
    SetUserStatus {
        id: Ulid,
        status: UserStatus,
    },
    DeleteUser {
        id: Ulid,
        force: bool,
    },
    SelectUsers {
        filter: UserFilter,
    },
    SelectProfile,
    InsertEquipment {
        id: Ulid,
        name: String,
        kind: String,
        reference: String,
        description: Option<String>,
    },
    SetEquipmentStatus {
        id: Ulid,
        status: EquipmentStatus,
    },
    DeleteEquipment {
        id: Ulid,
    },
    SelectEquipment {
        filter: EquipmentFilter,
    },
    /// Dates stay optional here; a missing one is a policy rejection, not a syntax error.
    InsertLoan {
        id: Ulid,
        equipment_id: Ulid,
        borrow_date: Option<Ms>,
        return_date: Option<Ms>,
        user_id: Option<Ulid>,
    },
    DeleteLoan {
        id: Ulid,
    },
    SelectLoans {
        filter: LoanFilter,
    },
}

#[derive(Debug, PartialEq)]
pub enum UserFilter {
    All,
    Id(Ulid),
    Email(String),
}

#[derive(Debug, PartialEq)]
pub enum EquipmentFilter {
    All,
    Id(Ulid),
    Status(EquipmentStatus),
}

#[derive(Debug, PartialEq)]
pub enum LoanFilter {
    All,
    Equipment(Ulid),
    User(Ulid),
}

pub fn parse_sql(sql: &str) -> Result<Command, SqlError> {
    if sql.len() > MAX_SQL_LEN {
        return Err(SqlError::TooLong);
    }
    let dialect = PostgreSqlDialect {};
    let stmts = Parser::parse_sql(&dialect, sql).map_err(|e| SqlError::Parse(e.to_string()))?;
    let Some(stmt) = stmts.first() else {
        return Err(SqlError::Empty);
    };

    match stmt {
        Statement::Insert(insert) => parse_insert(insert),
        Statement::Update {
            table,
            assignments,
            selection,
            ..
        } => parse_update(table, assignments, selection.as_ref()),
        Statement::Delete(delete) => parse_delete(delete),
        Statement::Query(query) => parse_select(query),
        other => Err(SqlError::Unsupported(format!("{other}"))),
    }
}

// ── INSERT ────────────────────────────────────────────────────

const USER_COLUMNS: &[&str] = &["id", "email", "first_name", "last_name", "role"];
const EQUIPMENT_COLUMNS: &[&str] = &["id", "name", "type", "ref", "description"];
const LOAN_COLUMNS: &[&str] = &["id", "equipment_id", "borrow_date", "return_date", "user_id"];

/// One VALUES row keyed by column name.
struct Row {
    table: &'static str,
    cells: Vec<(String, Expr)>,
}

impl Row {
    fn get(&self, column: &'static str) -> Option<&Expr> {
        self.cells.iter().find(|(c, _)| c == column).map(|(_, e)| e)
    }

    fn required(&self, column: &'static str) -> Result<&Expr, SqlError> {
        self.get(column).ok_or(SqlError::MissingColumn(self.table, column))
    }
}

fn insert_row(insert: &ast::Insert, table: &'static str, known: &[&str]) -> Result<Row, SqlError> {
    let values = extract_single_row(insert)?;
    let columns: Vec<String> = if insert.columns.is_empty() {
        known.iter().take(values.len()).map(|c| c.to_string()).collect()
    } else {
        insert.columns.iter().map(|c| c.value.to_lowercase()).collect()
    };
    if columns.len() != values.len() {
        return Err(SqlError::WrongArity(table, columns.len(), values.len()));
    }
    if let Some(unknown) = columns.iter().find(|c| !known.contains(&c.as_str())) {
        return Err(SqlError::UnknownColumn(unknown.clone()));
    }
    Ok(Row {
        table,
        cells: columns.into_iter().zip(values.iter().cloned()).collect(),
    })
}

fn parse_insert(insert: &ast::Insert) -> Result<Command, SqlError> {
    let table = insert_table_name(insert)?;
    match table.as_str() {
        "users" => {
            let row = insert_row(insert, "users", USER_COLUMNS)?;
            Ok(Command::InsertUser {
                id: parse_ulid_expr(row.required("id")?)?,
                email: parse_string_expr(row.required("email")?)?,
                first_name: parse_string_expr(row.required("first_name")?)?,
                last_name: parse_string_expr(row.required("last_name")?)?,
                role: row.get("role").map(parse_string_or_null).transpose()?.flatten(),
            })
        }
        "equipment" => {
            let row = insert_row(insert, "equipment", EQUIPMENT_COLUMNS)?;
            Ok(Command::InsertEquipment {
                id: parse_ulid_expr(row.required("id")?)?,
                name: parse_string_expr(row.required("name")?)?,
                kind: parse_string_expr(row.required("type")?)?,
                reference: parse_string_expr(row.required("ref")?)?,
                description: row
                    .get("description")
                    .map(parse_string_or_null)
                    .transpose()?
                    .flatten(),
            })
        }
        "loans" => {
            let row = insert_row(insert, "loans", LOAN_COLUMNS)?;
            Ok(Command::InsertLoan {
                id: parse_ulid_expr(row.required("id")?)?,
                equipment_id: parse_ulid_expr(row.required("equipment_id")?)?,
                borrow_date: row.get("borrow_date").map(parse_date_expr).transpose()?.flatten(),
                return_date: row.get("return_date").map(parse_date_expr).transpose()?.flatten(),
                user_id: row.get("user_id").map(parse_ulid_or_null).transpose()?.flatten(),
            })
        }
        _ => Err(SqlError::UnknownTable(table)),
    }
}

// ── UPDATE ────────────────────────────────────────────────────

fn parse_update(
    table: &ast::TableWithJoins,
    assignments: &[ast::Assignment],
    selection: Option<&Expr>,
) -> Result<Command, SqlError> {
    let table = table_factor_name(&table.relation)?;
    let id = extract_where_id(selection)?;

    let mut set: Vec<(String, &Expr)> = Vec::with_capacity(assignments.len());
    for a in assignments {
        let column = match &a.target {
            AssignmentTarget::ColumnName(name) => object_name_last(name),
            AssignmentTarget::Tuple(_) => None,
        }
        .ok_or_else(|| SqlError::Unsupported("tuple assignment".into()))?;
        set.push((column, &a.value));
    }
    let value_of = |column: &str| set.iter().find(|(c, _)| c == column).map(|(_, e)| *e);

    match table.as_str() {
        "users" => {
            if let Some(status) = value_of("status") {
                if set.len() != 1 {
                    return Err(SqlError::Unsupported("status must be updated on its own".into()));
                }
                let raw = parse_string_expr(status)?;
                let status = UserStatus::parse(&raw).ok_or(SqlError::BadValue("status", raw))?;
                return Ok(Command::SetUserStatus { id, status });
            }
            if let Some((unknown, _)) = set
                .iter()
                .find(|(c, _)| !matches!(c.as_str(), "email" | "first_name" | "last_name" | "role"))
            {
                return Err(SqlError::UnknownColumn(unknown.clone()));
            }
            let text = |column: &str| value_of(column).map(parse_string_expr).transpose();
            Ok(Command::UpdateUser {
                id,
                email: text("email")?,
                first_name: text("first_name")?,
                last_name: text("last_name")?,
                role: text("role")?,
            })
        }
        "equipment" => {
            let [(column, value)] = set.as_slice() else {
                return Err(SqlError::Unsupported("equipment updates set only status".into()));
            };
            if column != "status" {
                return Err(SqlError::UnknownColumn(column.clone()));
            }
            let raw = parse_string_expr(value)?;
            let status = EquipmentStatus::parse(&raw).ok_or(SqlError::BadValue("status", raw))?;
            Ok(Command::SetEquipmentStatus { id, status })
        }
        _ => Err(SqlError::UnknownTable(table)),
    }
}

// ── DELETE ────────────────────────────────────────────────────

fn parse_delete(delete: &ast::Delete) -> Result<Command, SqlError> {
    let table = delete_table_name(delete)?;
    let mut filters = Vec::new();
    if let Some(selection) = &delete.selection {
        collect_eq_filters(selection, &mut filters)?;
    }
    let id = filter_value(&filters, "id")
        .ok_or(SqlError::MissingFilter("id"))
        .and_then(parse_ulid_expr)?;

    match table.as_str() {
        "users" => {
            let force = filter_value(&filters, "force")
                .map(parse_bool)
                .transpose()?
                .unwrap_or(false);
            Ok(Command::DeleteUser { id, force })
        }
        "equipment" => Ok(Command::DeleteEquipment { id }),
        "loans" => Ok(Command::DeleteLoan { id }),
        _ => Err(SqlError::UnknownTable(table)),
    }
}

// ── SELECT ────────────────────────────────────────────────────

fn parse_select(query: &ast::Query) -> Result<Command, SqlError> {
    let select = match query.body.as_ref() {
        SetExpr::Select(s) => s,
        _ => return Err(SqlError::Unsupported("non-SELECT query".into())),
    };
    let from = select
        .from
        .first()
        .ok_or_else(|| SqlError::Parse("SELECT without FROM".into()))?;
    let table = table_factor_name(&from.relation)?;

    let mut filters = Vec::new();
    if let Some(selection) = &select.selection {
        collect_eq_filters(selection, &mut filters)?;
    }
    if filters.len() > 1 {
        return Err(SqlError::Unsupported("at most one filter per query".into()));
    }
    let filter = filters.first().map(|(c, e)| (c.as_str(), *e));

    match table.as_str() {
        "users" => Ok(Command::SelectUsers {
            filter: match filter {
                None => UserFilter::All,
                Some(("id", e)) => UserFilter::Id(parse_ulid_expr(e)?),
                Some(("email", e)) => UserFilter::Email(parse_string_expr(e)?),
                Some((c, _)) => return Err(SqlError::UnknownColumn(c.to_string())),
            },
        }),
        "profile" => match filter {
            None => Ok(Command::SelectProfile),
            Some((c, _)) => Err(SqlError::UnknownColumn(c.to_string())),
        },
        "equipment" => Ok(Command::SelectEquipment {
            filter: match filter {
                None => EquipmentFilter::All,
                Some(("id", e)) => EquipmentFilter::Id(parse_ulid_expr(e)?),
                Some(("status", e)) => {
                    let raw = parse_string_expr(e)?;
                    let status =
                        EquipmentStatus::parse(&raw).ok_or(SqlError::BadValue("status", raw))?;
                    EquipmentFilter::Status(status)
                }
                Some((c, _)) => return Err(SqlError::UnknownColumn(c.to_string())),
            },
        }),
        "loans" => Ok(Command::SelectLoans {
            filter: match filter {
                None => LoanFilter::All,
                Some(("equipment_id", e)) => LoanFilter::Equipment(parse_ulid_expr(e)?),
                Some(("user_id", e)) => LoanFilter::User(parse_ulid_expr(e)?),
                Some((c, _)) => return Err(SqlError::UnknownColumn(c.to_string())),
            },
        }),
        _ => Err(SqlError::UnknownTable(table)),
    }
}

/// Table a SELECT reads from, used to describe result columns of a prepared
/// statement before its parameters are bound.
pub fn select_table(sql: &str) -> Option<String> {
    let stmts = Parser::parse_sql(&PostgreSqlDialect {}, sql).ok()?;
    let Some(Statement::Query(query)) = stmts.first() else {
        return None;
    };
    let SetExpr::Select(select) = query.body.as_ref() else {
        return None;
    };
    table_factor_name(&select.from.first()?.relation).ok()
}

/// Flatten `a = x AND b = y ...` into `(column, value)` pairs.
fn collect_eq_filters<'a>(expr: &'a Expr, out: &mut Vec<(String, &'a Expr)>) -> Result<(), SqlError> {
    match expr {
        Expr::Nested(inner) => collect_eq_filters(inner, out),
        Expr::BinaryOp {
            left,
            op: ast::BinaryOperator::And,
            right,
        } => {
            collect_eq_filters(left, out)?;
            collect_eq_filters(right, out)
        }
        Expr::BinaryOp {
            left,
            op: ast::BinaryOperator::Eq,
            right,
        } => {
            let column = expr_column_name(left)
                .ok_or_else(|| SqlError::Unsupported(format!("filter on {left}")))?;
            out.push((column, right.as_ref()));
            Ok(())
        }
        other => Err(SqlError::Unsupported(format!("filter {other}"))),
    }
}

fn filter_value<'a>(filters: &[(String, &'a Expr)], column: &str) -> Option<&'a Expr> {
    filters.iter().find(|(c, _)| c == column).map(|(_, e)| *e)
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
    let first = tables_with_joins
        .first()
        .ok_or_else(|| SqlError::Parse("DELETE without table".into()))?;
    table_factor_name(&first.relation)
}

fn table_factor_name(tf: &TableFactor) -> Result<String, SqlError> {
    match tf {
        TableFactor::Table { name, .. } => {
            object_name_last(name).ok_or_else(|| SqlError::Parse("empty table name".into()))
        }
        _ => Err(SqlError::Parse("complex table expression".into())),
    }
}

fn extract_single_row(insert: &ast::Insert) -> Result<&[Expr], SqlError> {
    let body = insert
        .source
        .as_ref()
        .ok_or_else(|| SqlError::Parse("no VALUES".into()))?;
    match body.body.as_ref() {
        SetExpr::Values(values) => match values.rows.as_slice() {
            [row] => Ok(row.as_slice()),
            [] => Err(SqlError::Parse("empty VALUES".into())),
            _ => Err(SqlError::Unsupported("one row per INSERT".into())),
        },
        _ => Err(SqlError::Parse("expected VALUES".into())),
    }
}

fn extract_where_id(selection: Option<&Expr>) -> Result<Ulid, SqlError> {
    let mut filters = Vec::new();
    if let Some(sel) = selection {
        collect_eq_filters(sel, &mut filters)?;
    }
    match filters.as_slice() {
        [(column, value)] if column == "id" => parse_ulid_expr(value),
        _ => Err(SqlError::MissingFilter("id")),
    }
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

fn parse_ulid_expr(expr: &Expr) -> Result<Ulid, SqlError> {
    match extract_value(expr) {
        Some(Value::SingleQuotedString(s) | Value::Number(s, _)) => {
            Ulid::from_string(s).map_err(|e| SqlError::Parse(format!("bad ULID: {e}")))
        }
        Some(value) => Err(SqlError::Parse(format!("expected ULID string, got {value}"))),
        None => Err(SqlError::Parse(format!("expected value, got {expr}"))),
    }
}

fn parse_ulid_or_null(expr: &Expr) -> Result<Option<Ulid>, SqlError> {
    match extract_value(expr) {
        Some(Value::Null) => Ok(None),
        _ => parse_ulid_expr(expr).map(Some),
    }
}

fn parse_string_expr(expr: &Expr) -> Result<String, SqlError> {
    match extract_value(expr) {
        Some(Value::SingleQuotedString(s)) => Ok(s.clone()),
        Some(value) => Err(SqlError::Parse(format!("expected string, got {value}"))),
        None => Err(SqlError::Parse(format!("expected value, got {expr}"))),
    }
}

fn parse_string_or_null(expr: &Expr) -> Result<Option<String>, SqlError> {
    match extract_value(expr) {
        Some(Value::Null) => Ok(None),
        _ => parse_string_expr(expr).map(Some),
    }
}

fn parse_i64_expr(expr: &Expr) -> Result<i64, SqlError> {
    if let Expr::UnaryOp {
        op: ast::UnaryOperator::Minus,
        expr,
    } = expr
    {
        return parse_i64_expr(expr)?
            .checked_neg()
            .ok_or_else(|| SqlError::Parse(format!("integer out of range: -{expr}")));
    }
    match extract_value(expr) {
        Some(Value::Number(s, _) | Value::SingleQuotedString(s)) => s
            .parse()
            .map_err(|e| SqlError::Parse(format!("bad integer {s}: {e}"))),
        Some(value) => Err(SqlError::Parse(format!("expected number, got {value}"))),
        None => Err(SqlError::Parse(format!("expected value, got {expr}"))),
    }
}

/// Epoch milliseconds must name a calendar date chrono can represent.
fn date_in_range(ms: Ms, raw: &str) -> Result<Ms, SqlError> {
    match DateTime::<Utc>::from_timestamp_millis(ms) {
        Some(_) => Ok(ms),
        None => Err(SqlError::BadValue("date", raw.to_string())),
    }
}

/// Parse a loan date: epoch milliseconds, `'YYYY-MM-DD'` (UTC midnight),
/// an RFC 3339 timestamp, or NULL.
pub fn parse_date(s: &str) -> Result<Ms, SqlError> {
    let s = s.trim();
    if let Ok(ms) = s.parse::<Ms>() {
        return date_in_range(ms, s);
    }
    if let Ok(date) = NaiveDate::parse_from_str(s, "%Y-%m-%d") {
        let midnight = date
            .and_hms_opt(0, 0, 0)
            .ok_or_else(|| SqlError::BadValue("date", s.to_string()))?;
        return Ok(midnight.and_utc().timestamp_millis());
    }
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.timestamp_millis())
        .map_err(|_| SqlError::BadValue("date", s.to_string()))
}

fn parse_date_expr(expr: &Expr) -> Result<Option<Ms>, SqlError> {
    match extract_value(expr) {
        Some(Value::Null) => Ok(None),
        Some(Value::SingleQuotedString(s)) => parse_date(s).map(Some),
        _ => {
            let ms = parse_i64_expr(expr)?;
            date_in_range(ms, &ms.to_string()).map(Some)
        }
    }
}

fn parse_bool(expr: &Expr) -> Result<bool, SqlError> {
    match extract_value(expr) {
        Some(Value::Boolean(b)) => Ok(*b),
        Some(Value::SingleQuotedString(s)) => match s.to_lowercase().as_str() {
            "true" | "t" | "1" => Ok(true),
            "false" | "f" | "0" => Ok(false),
            _ => Err(SqlError::BadValue("bool", s.clone())),
        },
        Some(Value::Number(n, _)) => Ok(n != "0"),
        Some(value) => Err(SqlError::Parse(format!("expected bool, got {value}"))),
        None => Err(SqlError::Parse(format!("expected value, got {expr}"))),
    }
}

// ── Errors ────────────────────────────────────────────────────

#[derive(Debug, PartialEq)]
pub enum SqlError {
    Parse(String),
    Empty,
    TooLong,
    Unsupported(String),
    UnknownTable(String),
    UnknownColumn(String),
    WrongArity(&'static str, usize, usize),
    MissingColumn(&'static str, &'static str),
    MissingFilter(&'static str),
    BadValue(&'static str, String),
}

impl std::fmt::Display for SqlError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SqlError::Parse(s) => write!(f, "parse error: {s}"),
            SqlError::Empty => write!(f, "empty query"),
            SqlError::TooLong => write!(f, "query too long"),
            SqlError::Unsupported(s) => write!(f, "unsupported: {s}"),
            SqlError::UnknownTable(t) => write!(f, "unknown table: {t}"),
            SqlError::UnknownColumn(c) => write!(f, "unknown column: {c}"),
            SqlError::WrongArity(t, expected, got) => {
                write!(f, "{t}: {expected} columns but {got} values")
            }
            SqlError::MissingColumn(t, c) => write!(f, "{t}: missing column {c}"),
            SqlError::MissingFilter(col) => write!(f, "missing filter: {col}"),
            SqlError::BadValue(what, v) => write!(f, "bad {what}: {v}"),
        }
    }
}

impl std::error::Error for SqlError {}
