use chrono::NaiveDate;
use sqlparser::ast::{
    self, AssignmentTarget, Expr, FromTable, ObjectNamePart, SetExpr, Statement, TableFactor,
    TableObject, Value, ValueWithSpan,
};
use sqlparser::dialect::PostgreSqlDialect;
use sqlparser::parser::Parser;
use ulid::Ulid;

use crate::model::ReservationStatus;

/// Parsed command from SQL input.
///
/// Money columns (`daily_rate`, `total_price`) are integer cents. In
/// `UpdateCar`, `None` means the column was not assigned and `Some(None)`
/// means it was set to NULL.
#[derive(Debug, PartialEq)]
pub enum Command {
    InsertCar {
        id: Ulid,
        name: Option<String>,
        daily_rate: Option<u64>,
    },
    UpdateCar {
        id: Ulid,
        name: Option<Option<String>>,
        daily_rate: Option<Option<u64>>,
    },
    DeleteCar {
        id: Ulid,
    },
    InsertReservation {
        id: Ulid,
        car_id: Ulid,
        start: NaiveDate,
        end: NaiveDate,
        total_price: Option<u64>,
    },
    SetReservationStatus {
        id: Ulid,
        status: ReservationStatus,
    },
    DeleteReservation {
        id: Ulid,
    },
    SelectCars,
    SelectReservations {
        car_id: Ulid,
        start: Option<NaiveDate>,
        end: Option<NaiveDate>,
    },
    SelectAvailability {
        car_id: Ulid,
        start: NaiveDate,
        end: NaiveDate,
    },
    SelectBlockedDays {
        car_id: Ulid,
        start: NaiveDate,
        end: NaiveDate,
    },
}

pub fn parse_sql(sql: &str) -> Result<Command, SqlError> {
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
        } => parse_update(&table.relation, assignments, selection),
        Statement::Delete(delete) => parse_delete(delete),
        Statement::Query(query) => parse_select(query),
        other => Err(SqlError::Unsupported(format!("{other}"))),
    }
}

const CAR_COLUMNS: &[&str] = &["id", "name", "daily_rate"];
const RESERVATION_COLUMNS: &[&str] = &["id", "car_id", "start", "end", "total_price"];

/// The FROM table of a SELECT, if `sql` is one. `$n` placeholders may still
/// be unbound.
pub fn select_table(sql: &str) -> Option<String> {
    let dialect = PostgreSqlDialect {};
    let stmts = Parser::parse_sql(&dialect, sql).ok()?;
    let Statement::Query(query) = stmts.first()? else {
        return None;
    };
    let SetExpr::Select(select) = query.body.as_ref() else {
        return None;
    };
    table_factor_name(&select.from.first()?.relation).ok()
}

fn parse_insert(insert: &ast::Insert) -> Result<Command, SqlError> {
    let table = insert_table_name(insert)?;
    let values = extract_insert_values(insert)?;

    match table.as_str() {
        "cars" => {
            let row = bind_columns("cars", CAR_COLUMNS, &insert.columns, values)?;
            Ok(Command::InsertCar {
                id: parse_ulid(required(&row, CAR_COLUMNS, 0)?)?,
                name: row[1].map(parse_string_or_null).transpose()?.flatten(),
                daily_rate: row[2].map(parse_u64_or_null).transpose()?.flatten(),
            })
        }
        "reservations" => {
            let row = bind_columns("reservations", RESERVATION_COLUMNS, &insert.columns, values)?;
            Ok(Command::InsertReservation {
                id: parse_ulid(required(&row, RESERVATION_COLUMNS, 0)?)?,
                car_id: parse_ulid(required(&row, RESERVATION_COLUMNS, 1)?)?,
                start: parse_date(required(&row, RESERVATION_COLUMNS, 2)?)?,
                end: parse_date(required(&row, RESERVATION_COLUMNS, 3)?)?,
                total_price: row[4].map(parse_u64_or_null).transpose()?.flatten(),
            })
        }
        _ => Err(SqlError::UnknownTable(table)),
    }
}

/// Line VALUES up with the table's columns. Without a column list the
/// values follow the table's column order.
fn bind_columns<'a>(
    table: &'static str,
    known: &[&str],
    columns: &[ast::Ident],
    values: &'a [Expr],
) -> Result<Vec<Option<&'a Expr>>, SqlError> {
    let mut row = vec![None; known.len()];
    if columns.is_empty() {
        if values.len() > known.len() {
            return Err(SqlError::WrongArity(table, known.len(), values.len()));
        }
        for (slot, value) in row.iter_mut().zip(values) {
            *slot = Some(value);
        }
        return Ok(row);
    }
    if columns.len() != values.len() {
        return Err(SqlError::WrongArity(table, columns.len(), values.len()));
    }
    for (column, value) in columns.iter().zip(values) {
        let name = column.value.to_lowercase();
        let pos = known
            .iter()
            .position(|k| *k == name)
            .ok_or_else(|| SqlError::UnknownColumn(name.clone()))?;
        if row[pos].replace(value).is_some() {
            return Err(SqlError::Parse(format!("column {name} given more than once")));
        }
    }
    Ok(row)
}

fn required<'a>(row: &[Option<&'a Expr>], known: &[&'static str], pos: usize) -> Result<&'a Expr, SqlError> {
    row[pos].ok_or(SqlError::MissingColumn(known[pos]))
}

fn parse_update(
    relation: &TableFactor,
    assignments: &[ast::Assignment],
    selection: &Option<Expr>,
) -> Result<Command, SqlError> {
    let table = table_factor_name(relation)?;
    let id = extract_where_id(selection)?;

    match table.as_str() {
        "cars" => {
            let (mut name, mut daily_rate) = (None, None);
            for a in assignments {
                match assignment_column(a)?.as_str() {
                    "name" => name = Some(parse_string_or_null(&a.value)?),
                    "daily_rate" => daily_rate = Some(parse_u64_or_null(&a.value)?),
                    other => return Err(SqlError::UnknownColumn(other.to_string())),
                }
            }
            Ok(Command::UpdateCar {
                id,
                name,
                daily_rate,
            })
        }
        "reservations" => {
            let mut status = None;
            for a in assignments {
                match assignment_column(a)?.as_str() {
                    "status" => status = Some(parse_status(&a.value)?),
                    other => return Err(SqlError::UnknownColumn(other.to_string())),
                }
            }
            Ok(Command::SetReservationStatus {
                id,
                status: status.ok_or(SqlError::MissingAssignment("status"))?,
            })
        }
        _ => Err(SqlError::UnknownTable(table)),
    }
}

fn parse_delete(delete: &ast::Delete) -> Result<Command, SqlError> {
    let table = delete_table_name(delete)?;
    let id = extract_where_id(&delete.selection)?;

    match table.as_str() {
        "cars" => Ok(Command::DeleteCar { id }),
        "reservations" => Ok(Command::DeleteReservation { id }),
        _ => Err(SqlError::UnknownTable(table)),
    }
}

/// Column filters recognized in SELECT ... WHERE.
#[derive(Default)]
struct Filters {
    car_id: Option<Ulid>,
    start: Option<NaiveDate>,
    end: Option<NaiveDate>,
}

fn parse_select(query: &ast::Query) -> Result<Command, SqlError> {
    let select = match query.body.as_ref() {
        SetExpr::Select(s) => s,
        _ => return Err(SqlError::Unsupported("non-SELECT query".into())),
    };

    let Some(from) = select.from.first() else {
        return Err(SqlError::Parse("SELECT without FROM".into()));
    };
    let table = table_factor_name(&from.relation)?;

    let mut filters = Filters::default();
    if let Some(selection) = &select.selection {
        extract_filters(selection, &mut filters)?;
    }

    match table.as_str() {
        "cars" => Ok(Command::SelectCars),
        "reservations" => Ok(Command::SelectReservations {
            car_id: filters.car_id.ok_or(SqlError::MissingFilter("car_id"))?,
            start: filters.start,
            end: filters.end,
        }),
        "availability" => Ok(Command::SelectAvailability {
            car_id: filters.car_id.ok_or(SqlError::MissingFilter("car_id"))?,
            start: filters.start.ok_or(SqlError::MissingFilter("start"))?,
            end: filters.end.ok_or(SqlError::MissingFilter("end"))?,
        }),
        "blocked_days" => Ok(Command::SelectBlockedDays {
            car_id: filters.car_id.ok_or(SqlError::MissingFilter("car_id"))?,
            start: filters.start.ok_or(SqlError::MissingFilter("start"))?,
            end: filters.end.ok_or(SqlError::MissingFilter("end"))?,
        }),
        _ => Err(SqlError::UnknownTable(table)),
    }
}

/// Only `car_id = ..`, `start >= ..` and `"end" <= ..` joined by AND are
/// understood. Anything else is rejected rather than dropped, so a query
/// never returns rows its predicate would have excluded.
fn extract_filters(expr: &Expr, filters: &mut Filters) -> Result<(), SqlError> {
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
        Expr::BinaryOp { left, op, right } => {
            match (expr_column_name(left).as_deref(), op) {
                (Some("car_id"), ast::BinaryOperator::Eq) => filters.car_id = Some(parse_ulid(right)?),
                (Some("start"), ast::BinaryOperator::GtEq) => filters.start = Some(parse_date(right)?),
                (Some("end"), ast::BinaryOperator::LtEq) => filters.end = Some(parse_date(right)?),
                _ => return Err(SqlError::Unsupported(format!("filter {expr}"))),
            }
            Ok(())
        }
        other => Err(SqlError::Unsupported(format!("filter {other}"))),
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
    match tables_with_joins.first() {
        Some(first) => table_factor_name(&first.relation),
        None => Err(SqlError::Parse("DELETE without table".into())),
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

fn assignment_column(assignment: &ast::Assignment) -> Result<String, SqlError> {
    match &assignment.target {
        AssignmentTarget::ColumnName(name) => {
            object_name_last(name).ok_or_else(|| SqlError::Parse("empty column name".into()))
        }
        AssignmentTarget::Tuple(_) => Err(SqlError::Unsupported("tuple assignment".into())),
    }
}

/// First VALUES row. Multi-row inserts are rejected.
fn extract_insert_values(insert: &ast::Insert) -> Result<&[Expr], SqlError> {
    let body = insert
        .source
        .as_ref()
        .ok_or(SqlError::Parse("no VALUES".into()))?;
    match body.body.as_ref() {
        SetExpr::Values(values) => match values.rows.as_slice() {
            [] => Err(SqlError::Parse("empty VALUES".into())),
            [row] => Ok(row),
            _ => Err(SqlError::Unsupported("multi-row INSERT".into())),
        },
        _ => Err(SqlError::Parse("expected VALUES".into())),
    }
}

fn extract_where_id(selection: &Option<Expr>) -> Result<Ulid, SqlError> {
    let sel = selection.as_ref().ok_or(SqlError::MissingFilter("id"))?;
    match sel {
        Expr::BinaryOp {
            left,
            op: ast::BinaryOperator::Eq,
            right,
        } if expr_column_name(left).as_deref() == Some("id") => parse_ulid(right),
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

fn parse_ulid(expr: &Expr) -> Result<Ulid, SqlError> {
    match extract_value(expr) {
        Some(Value::SingleQuotedString(s)) => {
            Ulid::from_string(s).map_err(|e| SqlError::Parse(format!("bad ULID: {e}")))
        }
        Some(value) => Err(SqlError::Parse(format!("expected string, got {value:?}"))),
        None => Err(SqlError::Parse(format!("expected value, got {expr:?}"))),
    }
}

/// `'YYYY-MM-DD'` literal.
fn parse_date(expr: &Expr) -> Result<NaiveDate, SqlError> {
    match extract_value(expr) {
        Some(Value::SingleQuotedString(s)) => NaiveDate::parse_from_str(s.trim(), "%Y-%m-%d")
            .map_err(|e| SqlError::Parse(format!("bad date {s:?}: {e}"))),
        Some(value) => Err(SqlError::Parse(format!("expected 'YYYY-MM-DD', got {value:?}"))),
        None => Err(SqlError::Parse(format!("expected value, got {expr:?}"))),
    }
}

fn parse_string_or_null(expr: &Expr) -> Result<Option<String>, SqlError> {
    match extract_value(expr) {
        Some(Value::Null) => Ok(None),
        Some(Value::SingleQuotedString(s)) => Ok(Some(s.clone())),
        Some(value) => Err(SqlError::Parse(format!("expected string or NULL, got {value:?}"))),
        None => Err(SqlError::Parse(format!("expected value, got {expr:?}"))),
    }
}

fn parse_u64_or_null(expr: &Expr) -> Result<Option<u64>, SqlError> {
    match extract_value(expr) {
        Some(Value::Null) => Ok(None),
        Some(Value::Number(s, _) | Value::SingleQuotedString(s)) => s
            .trim()
            .parse()
            .map(Some)
            .map_err(|e| SqlError::Parse(format!("bad amount {s:?}: {e}"))),
        Some(value) => Err(SqlError::Parse(format!("expected number, got {value:?}"))),
        None => Err(SqlError::Parse(format!("expected value, got {expr:?}"))),
    }
}

fn parse_status(expr: &Expr) -> Result<ReservationStatus, SqlError> {
    match extract_value(expr) {
        Some(Value::SingleQuotedString(s)) => {
            ReservationStatus::from_label(s).ok_or_else(|| SqlError::Parse(format!("bad status: {s}")))
        }
        Some(value) => Err(SqlError::Parse(format!("expected status string, got {value:?}"))),
        None => Err(SqlError::Parse(format!("expected value, got {expr:?}"))),
    }
}

// ── Errors ────────────────────────────────────────────────────

#[derive(Debug, thiserror::Error)]
pub enum SqlError {
    #[error("parse error: {0}")]
    Parse(String),
    #[error("empty query")]
    Empty,
    #[error("unsupported: {0}")]
    Unsupported(String),
    #[error("unknown table: {0}")]
    UnknownTable(String),
    #[error("unknown column: {0}")]
    UnknownColumn(String),
    #[error("{0}: expected {1} values, got {2}")]
    WrongArity(&'static str, usize, usize),
    #[error("missing filter: {0}")]
    MissingFilter(&'static str),
    #[error("missing assignment: {0}")]
    MissingAssignment(&'static str),
    #[error("missing column: {0}")]
    MissingColumn(&'static str),
}
