use sqlparser::ast::{
    self, AssignmentTarget, Expr, FromTable, ObjectNamePart, SetExpr, Statement, TableFactor,
    TableObject, Value, ValueWithSpan,
};
use sqlparser::dialect::PostgreSqlDialect;
use sqlparser::parser::Parser;

use crate::limits::MAX_SQL_LEN;
use crate::model::*;

/// Parsed command from SQL input.
#[derive(Debug, PartialEq)]
pub enum Command {
    InsertBooking {
        draft: BookingDraft,
    },
    SelectAvailability,
    /// JSON columns are decoded by the engine's decode boundary, not here.
    UpdateAvailability {
        fully_booked_dates: Option<serde_json::Value>,
        booked_slots: Option<serde_json::Value>,
        max_capacity_per_slot: Option<u32>,
    },
    SelectBookings {
        filter: BookingFilter,
    },
    UpdateBooking {
        id: BookingId,
        patch: BookingPatch,
    },
    CancelBooking {
        id: BookingId,
    },
    SelectSlotDrift,
}

#[derive(Debug, Clone, PartialEq)]
pub enum BookingFilter {
    All,
    Id(BookingId),
    Slot(SlotKey),
}

pub fn parse_sql(sql: &str) -> Result<Command, SqlError> {
    if sql.len() > MAX_SQL_LEN {
        return Err(SqlError::TooLong(sql.len()));
    }
    let dialect = PostgreSqlDialect {};
    let stmts = Parser::parse_sql(&dialect, sql).map_err(|e| SqlError::Parse(e.to_string()))?;
    let Some(stmt) = stmts.first() else {
        return Err(SqlError::Empty);
    };
    if stmts.len() > 1 {
        return Err(SqlError::Unsupported("one statement per query".into()));
    }

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

// ── INSERT ────────────────────────────────────────────────────

fn parse_insert(insert: &ast::Insert) -> Result<Command, SqlError> {
    let table = insert_table_name(insert)?;
    if table != "bookings" {
        return Err(SqlError::UnknownTable(table));
    }
    let rows = extract_insert_rows(insert)?;
    if rows.len() != 1 {
        return Err(SqlError::Unsupported("one booking per INSERT".into()));
    }
    let values = &rows[0];
    let columns: Vec<String> = insert.columns.iter().map(|c| c.value.to_lowercase()).collect();
    if columns.is_empty() {
        return Err(SqlError::Parse("INSERT INTO bookings needs an explicit column list".into()));
    }
    if columns.len() != values.len() {
        return Err(SqlError::WrongArity("bookings", columns.len(), values.len()));
    }

    let mut draft = BookingDraft::default();
    let mut seen = Vec::with_capacity(columns.len());
    for (col, expr) in columns.iter().zip(values) {
        if seen.contains(&col.as_str()) {
            return Err(SqlError::Parse(format!("column {col} given twice")));
        }
        seen.push(col.as_str());
        match col.as_str() {
            "fullname" => draft.fullname = parse_string(expr)?,
            "whatsapp" => draft.whatsapp = parse_string(expr)?,
            "service" => draft.service = parse_string(expr)?,
            "address" => draft.address = parse_string(expr)?,
            "lat" => draft.lat = parse_f64(expr)?,
            "lng" => draft.lng = parse_f64(expr)?,
            "schedule_date" => draft.schedule_date = parse_string(expr)?,
            "schedule_time" => draft.schedule_time = parse_string(expr)?,
            "status" => draft.status = parse_string_or_null(expr)?,
            "arrival_time" => draft.arrival_time = parse_i64_or_null(expr)?,
            "start_time" => draft.start_time = parse_i64_or_null(expr)?,
            "end_time" => draft.end_time = parse_i64_or_null(expr)?,
            "work_duration_minutes" => draft.work_duration_minutes = parse_u32_or_null(expr)?,
            "technician_note" => draft.technician_note = parse_string_or_null(expr)?,
            "additional_cost" => draft.additional_cost = parse_i64_or_null(expr)?,
            other => return Err(SqlError::UnknownColumn(other.to_string())),
        }
    }
    for required in [
        "fullname",
        "whatsapp",
        "service",
        "address",
        "lat",
        "lng",
        "schedule_date",
        "schedule_time",
    ] {
        if !seen.contains(&required) {
            return Err(SqlError::MissingColumn(required));
        }
    }
    Ok(Command::InsertBooking { draft })
}

// ── UPDATE ────────────────────────────────────────────────────

fn parse_update(
    relation: &TableFactor,
    assignments: &[ast::Assignment],
    selection: &Option<Expr>,
) -> Result<Command, SqlError> {
    let table = table_factor_name(relation)?;
    let mut pairs = Vec::with_capacity(assignments.len());
    for assignment in assignments {
        let col = match &assignment.target {
            AssignmentTarget::ColumnName(name) => object_name_last(name)
                .ok_or_else(|| SqlError::Parse("empty column name".into()))?,
            AssignmentTarget::Tuple(_) => {
                return Err(SqlError::Unsupported("tuple assignment".into()));
            }
        };
        pairs.push((col, &assignment.value));
    }

    match table.as_str() {
        "availability" => {
            if selection.is_some() {
                return Err(SqlError::Unsupported("availability is a single row, drop the WHERE".into()));
            }
            let (mut fully_booked_dates, mut booked_slots, mut max_capacity_per_slot) = (None, None, None);
            for (col, expr) in pairs {
                match col.as_str() {
                    "fully_booked_dates" => fully_booked_dates = Some(parse_json(expr)?),
                    "booked_slots" => booked_slots = Some(parse_json(expr)?),
                    "max_capacity_per_slot" => max_capacity_per_slot = Some(parse_u32(expr)?),
                    other => return Err(SqlError::UnknownColumn(other.to_string())),
                }
            }
            Ok(Command::UpdateAvailability {
                fully_booked_dates,
                booked_slots,
                max_capacity_per_slot,
            })
        }
        "bookings" => {
            let id = extract_where_id(selection)?;
            let mut patch = BookingPatch::default();
            for (col, expr) in pairs {
                match col.as_str() {
                    "status" => patch.status = Some(parse_string(expr)?),
                    "arrival_time" => patch.arrival_time = Some(parse_i64(expr)?),
                    "start_time" => patch.start_time = Some(parse_i64(expr)?),
                    "end_time" => patch.end_time = Some(parse_i64(expr)?),
                    "work_duration_minutes" => patch.work_duration_minutes = Some(parse_u32(expr)?),
                    "technician_note" => patch.technician_note = Some(parse_string(expr)?),
                    "additional_cost" => patch.additional_cost = Some(parse_i64(expr)?),
                    ro @ ("schedule_date" | "schedule_time" | "slot_key" | "id" | "created_at"
                    | "updated_at") => return Err(SqlError::ReadOnlyColumn(ro.to_string())),
                    other => return Err(SqlError::UnknownColumn(other.to_string())),
                }
            }
            Ok(Command::UpdateBooking { id, patch })
        }
        _ => Err(SqlError::UnknownTable(table)),
    }
}

// ── DELETE ────────────────────────────────────────────────────

fn parse_delete(delete: &ast::Delete) -> Result<Command, SqlError> {
    let table = delete_table_name(delete)?;
    match table.as_str() {
        "bookings" => Ok(Command::CancelBooking {
            id: extract_where_id(&delete.selection)?,
        }),
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

    match table.as_str() {
        "availability" => Ok(Command::SelectAvailability),
        "slot_drift" => Ok(Command::SelectSlotDrift),
        "bookings" => {
            let filter = match &select.selection {
                None => BookingFilter::All,
                Some(Expr::BinaryOp {
                    left,
                    op: ast::BinaryOperator::Eq,
                    right,
                }) => match expr_column_name(left).as_deref() {
                    Some("id") => BookingFilter::Id(parse_id(right)?),
                    Some("slot_key") => {
                        let text = parse_string(right)?;
                        let key = SlotKey::parse(&text).map_err(|e| SqlError::InvalidValue(e.0))?;
                        BookingFilter::Slot(key)
                    }
                    _ => return Err(SqlError::Unsupported("filter on bookings: use id or slot_key".into())),
                },
                Some(_) => {
                    return Err(SqlError::Unsupported("filter on bookings: use id or slot_key".into()));
                }
            };
            Ok(Command::SelectBookings { filter })
        }
        _ => Err(SqlError::UnknownTable(table)),
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

fn extract_insert_rows(insert: &ast::Insert) -> Result<&[Vec<Expr>], SqlError> {
    let body = insert
        .source
        .as_ref()
        .ok_or(SqlError::Parse("no VALUES".into()))?;
    match body.body.as_ref() {
        SetExpr::Values(values) => {
            if values.rows.is_empty() {
                return Err(SqlError::Parse("empty VALUES".into()));
            }
            Ok(values.rows.as_slice())
        }
        _ => Err(SqlError::Parse("expected VALUES".into())),
    }
}

fn extract_where_id(selection: &Option<Expr>) -> Result<BookingId, SqlError> {
    let sel = selection.as_ref().ok_or(SqlError::MissingFilter("id"))?;
    match sel {
        Expr::BinaryOp {
            left,
            op: ast::BinaryOperator::Eq,
            right,
        } if expr_column_name(left).as_deref() == Some("id") => parse_id(right),
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

fn parse_string(expr: &Expr) -> Result<String, SqlError> {
    match extract_value(expr) {
        Some(Value::SingleQuotedString(s)) => Ok(s.clone()),
        Some(value) => Err(SqlError::InvalidValue(format!("expected string, got {value}"))),
        None => Err(SqlError::Parse(format!("expected value, got {expr}"))),
    }
}

fn parse_string_or_null(expr: &Expr) -> Result<Option<String>, SqlError> {
    if is_null(expr) {
        return Ok(None);
    }
    parse_string(expr).map(Some)
}

/// Numbers arrive either bare or quoted; a leading minus is a unary op.
fn numeric_text(expr: &Expr) -> Result<String, SqlError> {
    if let Expr::UnaryOp {
        op: ast::UnaryOperator::Minus,
        expr,
    } = expr
    {
        return Ok(format!("-{}", numeric_text(expr)?));
    }
    match extract_value(expr) {
        Some(Value::Number(s, _)) | Some(Value::SingleQuotedString(s)) => Ok(s.clone()),
        Some(value) => Err(SqlError::InvalidValue(format!("expected number, got {value}"))),
        None => Err(SqlError::Parse(format!("expected value, got {expr}"))),
    }
}

fn parse_i64(expr: &Expr) -> Result<i64, SqlError> {
    let text = numeric_text(expr)?;
    text.trim()
        .parse()
        .map_err(|e| SqlError::InvalidValue(format!("bad integer {text:?}: {e}")))
}

fn parse_i64_or_null(expr: &Expr) -> Result<Option<i64>, SqlError> {
    if is_null(expr) {
        return Ok(None);
    }
    parse_i64(expr).map(Some)
}

fn parse_u32(expr: &Expr) -> Result<u32, SqlError> {
    let v = parse_i64(expr)?;
    u32::try_from(v).map_err(|_| SqlError::InvalidValue(format!("{v} out of u32 range")))
}

fn parse_u32_or_null(expr: &Expr) -> Result<Option<u32>, SqlError> {
    if is_null(expr) {
        return Ok(None);
    }
    parse_u32(expr).map(Some)
}

fn parse_id(expr: &Expr) -> Result<BookingId, SqlError> {
    let v = parse_i64(expr)?;
    BookingId::try_from(v).map_err(|_| SqlError::InvalidValue(format!("bad booking id {v}")))
}

fn parse_f64(expr: &Expr) -> Result<f64, SqlError> {
    let text = numeric_text(expr)?;
    text.trim()
        .parse()
        .map_err(|e| SqlError::InvalidValue(format!("bad number {text:?}: {e}")))
}

fn parse_json(expr: &Expr) -> Result<serde_json::Value, SqlError> {
    if is_null(expr) {
        return Ok(serde_json::Value::Null);
    }
    let text = parse_string(expr)?;
    serde_json::from_str(&text).map_err(|e| SqlError::InvalidValue(format!("bad JSON: {e}")))
}

// ── Errors ────────────────────────────────────────────────────

#[derive(Debug)]
pub enum SqlError {
    Parse(String),
    Empty,
    TooLong(usize),
    Unsupported(String),
    UnknownTable(String),
    UnknownColumn(String),
    ReadOnlyColumn(String),
    MissingColumn(&'static str),
    WrongArity(&'static str, usize, usize),
    MissingFilter(&'static str),
    /// Syntactically fine, but the literal does not fit the column.
    InvalidValue(String),
}

impl std::fmt::Display for SqlError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SqlError::Parse(s) => write!(f, "parse error: {s}"),
            SqlError::Empty => write!(f, "empty query"),
            SqlError::TooLong(n) => write!(f, "query too long: {n} bytes"),
            SqlError::Unsupported(s) => write!(f, "unsupported: {s}"),
            SqlError::UnknownTable(t) => write!(f, "unknown table: {t}"),
            SqlError::UnknownColumn(c) => write!(f, "unknown column: {c}"),
            SqlError::ReadOnlyColumn(c) => write!(f, "column {c} cannot be updated"),
            SqlError::MissingColumn(c) => write!(f, "missing column: {c}"),
            SqlError::WrongArity(t, expected, got) => {
                write!(f, "{t}: expected {expected} values, got {got}")
            }
            SqlError::MissingFilter(col) => write!(f, "missing filter: {col}"),
            SqlError::InvalidValue(s) => write!(f, "invalid value: {s}"),
        }
    }
}

impl std::error::Error for SqlError {}
