use std::collections::HashMap;

use chrono::{NaiveDate, NaiveTime};
use sqlparser::ast::{
    self, AssignmentTarget, Expr, FromTable, ObjectNamePart, SetExpr, Statement, TableFactor,
    TableObject, Value, ValueWithSpan,
};
use sqlparser::dialect::PostgreSqlDialect;
use sqlparser::parser::Parser;
use ulid::Ulid;

use crate::model::*;

/// Parsed command from SQL input.
#[derive(Debug, PartialEq)]
pub enum Command {
    InsertDoctor {
        id: Ulid,
        name: String,
        specialization: String,
    },
    InsertPatient {
        id: Ulid,
        first_name: String,
        second_name: String,
        phone: Option<String>,
    },
    InsertSchedule {
        id: Ulid,
        doctor_id: Ulid,
        date: NaiveDate,
        start: NaiveTime,
        end: NaiveTime,
        capacity: u32,
        price: Price,
    },
    UpdateSchedule {
        id: Ulid,
        patch: SchedulePatch,
    },
    DeleteSchedule {
        id: Ulid,
    },
    /// A booking. Ids stay optional so the engine can tell a missing
    /// patient (unauthenticated) from a missing schedule (bad input).
    InsertAppointment {
        id: Ulid,
        schedule_id: Option<Ulid>,
        doctor_id: Option<Ulid>,
        patient_id: Option<Ulid>,
    },
    UpdateAppointment {
        id: Ulid,
        status: Option<AppointmentStatus>,
        payment_status: Option<String>,
    },
    DeleteAppointment {
        id: Ulid,
    },
    SelectDoctors,
    SelectSchedules {
        id: Option<Ulid>,
        filter: ScheduleFilter,
    },
    SelectAppointments {
        id: Option<Ulid>,
        schedule_id: Option<Ulid>,
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
        Statement::Update { table, assignments, selection, .. } => {
            parse_update(table, assignments, selection)
        }
        Statement::Delete(delete) => parse_delete(delete),
        Statement::Query(query) => parse_select(query),
        other => Err(SqlError::Unsupported(format!("{other}"))),
    }
}

// ── INSERT ────────────────────────────────────────────────────

/// Default column order when an INSERT omits its column list.
fn table_columns(table: &str) -> Option<&'static [&'static str]> {
    match table {
        "doctors" => Some(&["id", "name", "specialization"]),
        "patients" => Some(&["id", "first_name", "second_name", "phone"]),
        "schedules" => Some(&[
            "id",
            "doctor_id",
            "schedule_date",
            "start_time",
            "end_time",
            "max_patients",
            "price",
        ]),
        "appointments" => Some(&["id", "schedule_id", "doctor_id", "patient_id"]),
        _ => None,
    }
}

/// One VALUES row keyed by column name.
struct Row {
    table: &'static str,
    values: HashMap<String, Expr>,
}

impl Row {
    fn get(&self, column: &str) -> Option<&Expr> {
        self.values.get(column)
    }

    fn required(&self, column: &'static str) -> Result<&Expr, SqlError> {
        self.get(column).ok_or(SqlError::MissingColumn(self.table, column))
    }

    fn ulid(&self, column: &'static str) -> Result<Ulid, SqlError> {
        parse_ulid_expr(self.required(column)?)
    }

    fn optional_ulid(&self, column: &str) -> Result<Option<Ulid>, SqlError> {
        self.get(column).map_or(Ok(None), parse_ulid_or_null)
    }

    fn string(&self, column: &'static str) -> Result<String, SqlError> {
        parse_string_expr(self.required(column)?)
    }

    fn optional_string(&self, column: &str) -> Result<Option<String>, SqlError> {
        self.get(column).map_or(Ok(None), parse_string_or_null)
    }
}

fn parse_insert(insert: &ast::Insert) -> Result<Command, SqlError> {
    let table = insert_table_name(insert)?;
    let (table, defaults) = match table_columns(&table) {
        Some(cols) => (static_table_name(&table), cols),
        None => return Err(SqlError::UnknownTable(table)),
    };
    let row = insert_row(insert, table, defaults)?;

    match table {
        "doctors" => Ok(Command::InsertDoctor {
            id: row.ulid("id")?,
            name: row.string("name")?,
            specialization: row.string("specialization")?,
        }),
        "patients" => Ok(Command::InsertPatient {
            id: row.ulid("id")?,
            first_name: row.string("first_name")?,
            second_name: row.optional_string("second_name")?.unwrap_or_default(),
            phone: row.optional_string("phone")?,
        }),
        "schedules" => Ok(Command::InsertSchedule {
            id: row.ulid("id")?,
            doctor_id: row.ulid("doctor_id")?,
            date: parse_date_expr(row.required("schedule_date")?)?,
            start: parse_time_expr(row.required("start_time")?)?,
            end: parse_time_expr(row.required("end_time")?)?,
            capacity: parse_u32(row.required("max_patients")?)?,
            price: parse_i64_expr(row.required("price")?)?,
        }),
        "appointments" => Ok(Command::InsertAppointment {
            id: row.ulid("id")?,
            schedule_id: row.optional_ulid("schedule_id")?,
            doctor_id: row.optional_ulid("doctor_id")?,
            patient_id: row.optional_ulid("patient_id")?,
        }),
        _ => Err(SqlError::UnknownTable(table.to_string())),
    }
}

fn static_table_name(table: &str) -> &'static str {
    match table {
        "doctors" => "doctors",
        "patients" => "patients",
        "schedules" => "schedules",
        "appointments" => "appointments",
        _ => "unknown",
    }
}

fn insert_row(
    insert: &ast::Insert,
    table: &'static str,
    defaults: &[&str],
) -> Result<Row, SqlError> {
    let rows = extract_insert_rows(insert)?;
    if rows.len() > 1 {
        return Err(SqlError::Unsupported("multi-row INSERT".into()));
    }
    let values = &rows[0];

    let columns: Vec<String> = if insert.columns.is_empty() {
        defaults.iter().map(|c| c.to_string()).collect()
    } else {
        insert.columns.iter().map(|c| c.value.to_lowercase()).collect()
    };
    if values.len() != columns.len() {
        return Err(SqlError::WrongArity(table, columns.len(), values.len()));
    }

    Ok(Row {
        table,
        values: columns.into_iter().zip(values.iter().cloned()).collect(),
    })
}

// ── UPDATE ────────────────────────────────────────────────────

fn parse_update(
    table: &ast::TableWithJoins,
    assignments: &[ast::Assignment],
    selection: &Option<Expr>,
) -> Result<Command, SqlError> {
    let table = table_factor_name(&table.relation)?;
    let id = extract_where_id(selection)?;

    let mut set: Vec<(String, &Expr)> = Vec::with_capacity(assignments.len());
    for assignment in assignments {
        let column = match &assignment.target {
            AssignmentTarget::ColumnName(name) => {
                object_name_last(name).ok_or_else(|| SqlError::Parse("empty column name".into()))?
            }
            AssignmentTarget::Tuple(_) => {
                return Err(SqlError::Unsupported("tuple assignment".into()));
            }
        };
        set.push((column, &assignment.value));
    }

    match table.as_str() {
        "schedules" => {
            let mut patch = SchedulePatch::default();
            for (column, value) in set {
                match column.as_str() {
                    "schedule_date" => patch.date = Some(parse_date_expr(value)?),
                    "start_time" => patch.start = Some(parse_time_expr(value)?),
                    "end_time" => patch.end = Some(parse_time_expr(value)?),
                    "max_patients" => patch.capacity = Some(parse_u32(value)?),
                    "price" => patch.price = Some(parse_i64_expr(value)?),
                    "status" => {
                        let raw = parse_string_expr(value)?;
                        let status = raw
                            .parse()
                            .map_err(|e: UnknownStatus| SqlError::InvalidValue(e.to_string()))?;
                        patch.status = Some(status);
                    }
                    _ => return Err(SqlError::ReadOnlyColumn("schedules", column)),
                }
            }
            Ok(Command::UpdateSchedule { id, patch })
        }
        "appointments" => {
            let (mut status, mut payment_status) = (None, None);
            for (column, value) in set {
                match column.as_str() {
                    "status" => {
                        let raw = parse_string_expr(value)?;
                        let parsed = raw
                            .parse()
                            .map_err(|e: UnknownStatus| SqlError::InvalidValue(e.to_string()))?;
                        status = Some(parsed);
                    }
                    "payment_status" => payment_status = Some(parse_string_expr(value)?),
                    _ => return Err(SqlError::ReadOnlyColumn("appointments", column)),
                }
            }
            if status.is_none() && payment_status.is_none() {
                return Err(SqlError::Parse("no columns to update".into()));
            }
            Ok(Command::UpdateAppointment { id, status, payment_status })
        }
        _ => Err(SqlError::UnknownTable(table)),
    }
}

// ── DELETE ────────────────────────────────────────────────────

fn parse_delete(delete: &ast::Delete) -> Result<Command, SqlError> {
    let table = delete_table_name(delete)?;
    let id = extract_where_id(&delete.selection)?;

    match table.as_str() {
        "schedules" => Ok(Command::DeleteSchedule { id }),
        "appointments" => Ok(Command::DeleteAppointment { id }),
        _ => Err(SqlError::UnknownTable(table)),
    }
}

// ── SELECT ────────────────────────────────────────────────────

fn parse_select(query: &ast::Query) -> Result<Command, SqlError> {
    let select = match query.body.as_ref() {
        SetExpr::Select(s) => s,
        _ => return Err(SqlError::Unsupported("non-SELECT query".into())),
    };

    let Some(from) = select.from.first() else {
        return Err(SqlError::Parse("SELECT without FROM".into()));
    };
    let table = table_factor_name(&from.relation)?;

    let mut filters = Vec::new();
    if let Some(selection) = &select.selection {
        collect_eq_filters(selection, &mut filters)?;
    }

    match table.as_str() {
        "doctors" => Ok(Command::SelectDoctors),
        "schedules" => {
            let mut id = None;
            let mut filter = ScheduleFilter::default();
            for (column, value) in filters {
                match column.as_str() {
                    "id" => id = Some(parse_ulid_expr(value)?),
                    "schedule_date" | "date" => filter.date = Some(parse_date_expr(value)?),
                    "specialization" => filter.specialization = Some(parse_string_expr(value)?),
                    "doctor_id" => filter.doctor_id = Some(parse_ulid_expr(value)?),
                    _ => return Err(SqlError::UnsupportedFilter(column)),
                }
            }
            Ok(Command::SelectSchedules { id, filter })
        }
        "appointments" => {
            let (mut id, mut schedule_id) = (None, None);
            for (column, value) in filters {
                match column.as_str() {
                    "id" => id = Some(parse_ulid_expr(value)?),
                    "schedule_id" => schedule_id = Some(parse_ulid_expr(value)?),
                    _ => return Err(SqlError::UnsupportedFilter(column)),
                }
            }
            if id.is_none() && schedule_id.is_none() {
                return Err(SqlError::MissingFilter("schedule_id"));
            }
            Ok(Command::SelectAppointments { id, schedule_id })
        }
        _ => Err(SqlError::UnknownTable(table)),
    }
}

/// Flatten `a = x AND b = y ...` into `(column, value)` pairs.
fn collect_eq_filters<'a>(expr: &'a Expr, out: &mut Vec<(String, &'a Expr)>) -> Result<(), SqlError> {
    match expr {
        Expr::Nested(inner) => collect_eq_filters(inner, out),
        Expr::BinaryOp { left, op: ast::BinaryOperator::And, right } => {
            collect_eq_filters(left, out)?;
            collect_eq_filters(right, out)
        }
        Expr::BinaryOp { left, op: ast::BinaryOperator::Eq, right } => {
            let column = expr_column_name(left)
                .ok_or_else(|| SqlError::Unsupported(format!("filter on {left}")))?;
            out.push((column, right.as_ref()));
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

fn extract_insert_rows(insert: &ast::Insert) -> Result<&[Vec<Expr>], SqlError> {
    let body = insert
        .source
        .as_ref()
        .ok_or(SqlError::Parse("no VALUES".into()))?;
    match body.body.as_ref() {
        SetExpr::Values(values) if !values.rows.is_empty() => Ok(&values.rows),
        SetExpr::Values(_) => Err(SqlError::Parse("empty VALUES".into())),
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
        } if expr_column_name(left).as_deref() == Some("id") => parse_ulid_expr(right),
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

fn is_null(expr: &Expr) -> bool {
    matches!(extract_value(expr), Some(Value::Null))
}

fn parse_string_expr(expr: &Expr) -> Result<String, SqlError> {
    match extract_value(expr) {
        Some(Value::SingleQuotedString(s)) => Ok(s.clone()),
        Some(value) => Err(SqlError::Parse(format!("expected string, got {value}"))),
        None => Err(SqlError::Parse(format!("expected value, got {expr}"))),
    }
}

fn parse_string_or_null(expr: &Expr) -> Result<Option<String>, SqlError> {
    if is_null(expr) {
        return Ok(None);
    }
    parse_string_expr(expr).map(Some)
}

fn parse_ulid_expr(expr: &Expr) -> Result<Ulid, SqlError> {
    let s = parse_string_expr(expr)?;
    Ulid::from_string(&s).map_err(|e| SqlError::InvalidValue(format!("bad ULID {s:?}: {e}")))
}

fn parse_ulid_or_null(expr: &Expr) -> Result<Option<Ulid>, SqlError> {
    if is_null(expr) {
        return Ok(None);
    }
    parse_ulid_expr(expr).map(Some)
}

fn parse_i64_expr(expr: &Expr) -> Result<i64, SqlError> {
    if let Some(value) = extract_value(expr) {
        match value {
            Value::Number(s, _) | Value::SingleQuotedString(s) => s
                .trim()
                .parse()
                .map_err(|e| SqlError::InvalidValue(format!("bad integer {s:?}: {e}"))),
            _ => Err(SqlError::Parse(format!("expected number, got {value}"))),
        }
    } else if let Expr::UnaryOp {
        op: ast::UnaryOperator::Minus,
        expr,
    } = expr
    {
        let v = parse_i64_expr(expr)?;
        v.checked_neg()
            .ok_or_else(|| SqlError::InvalidValue(format!("-({v}) out of range")))
    } else {
        Err(SqlError::Parse(format!("expected value, got {expr}")))
    }
}

fn parse_u32(expr: &Expr) -> Result<u32, SqlError> {
    let v = parse_i64_expr(expr)?;
    u32::try_from(v).map_err(|_| SqlError::InvalidValue(format!("{v} out of range")))
}

fn parse_date_expr(expr: &Expr) -> Result<NaiveDate, SqlError> {
    let s = parse_string_expr(expr)?;
    NaiveDate::parse_from_str(s.trim(), "%Y-%m-%d")
        .map_err(|e| SqlError::InvalidValue(format!("bad date {s:?}: {e}")))
}

fn parse_time_expr(expr: &Expr) -> Result<NaiveTime, SqlError> {
    let s = parse_string_expr(expr)?;
    let trimmed = s.trim();
    NaiveTime::parse_from_str(trimmed, "%H:%M:%S")
        .or_else(|_| NaiveTime::parse_from_str(trimmed, "%H:%M"))
        .map_err(|e| SqlError::InvalidValue(format!("bad time {s:?}: {e}")))
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
    #[error("{0}: expected {1} values, got {2}")]
    WrongArity(&'static str, usize, usize),
    #[error("{0}: missing column {1}")]
    MissingColumn(&'static str, &'static str),
    #[error("{0}: column {1} cannot be updated")]
    ReadOnlyColumn(&'static str, String),
    #[error("missing filter: {0}")]
    MissingFilter(&'static str),
    #[error("unsupported filter: {0}")]
    UnsupportedFilter(String),
    #[error("invalid value: {0}")]
    InvalidValue(String),
}

impl SqlError {
    /// SQLSTATE reported to Postgres clients.
    pub fn sqlstate(&self) -> &'static str {
        match self {
            SqlError::InvalidValue(_) => "22023",
            SqlError::UnknownTable(_) => "42P01",
            _ => "42601",
        }
    }
}
