use rust_decimal::Decimal;
use sqlparser::ast::{
    self, Expr, FromTable, ObjectNamePart, SetExpr, Statement, TableFactor, TableObject, Value,
    ValueWithSpan,
};
use sqlparser::dialect::PostgreSqlDialect;
use sqlparser::parser::Parser;
use ulid::Ulid;

use crate::model::*;

/// Parsed command from SQL input. The tables are virtual — `vehicles` and
/// `reservations` are the real state, the rest are query shapes.
#[derive(Debug, PartialEq)]
pub enum Command {
    InsertVehicle {
        id: Ulid,
        name: Option<String>,
        rate_per_day: Decimal,
        available: bool,
    },
    /// `None` = keep current value; `name: Some(None)` = clear the name.
    UpdateVehicle {
        id: Ulid,
        name: Option<Option<String>>,
        rate_per_day: Option<Decimal>,
        available: Option<bool>,
    },
    DeleteVehicle {
        id: Ulid,
    },
    SelectVehicles,
    InsertReservation {
        id: Ulid,
        vehicle_id: Ulid,
        holder: String,
        start: Ms,
        end: Ms,
        returning: bool,
    },
    UpdateReservationStatus {
        id: Ulid,
        status: ReservationStatus,
    },
    SelectReservationsByVehicle {
        vehicle_id: Ulid,
    },
    SelectReservationById {
        id: Ulid,
    },
    SelectAvailability {
        vehicle_id: Ulid,
        start: Ms,
        end: Ms,
    },
    SelectFreeSlots {
        vehicle_id: Ulid,
        start: Ms,
        end: Ms,
        min_duration: Option<Ms>,
    },
    SelectQuote {
        vehicle_id: Ulid,
        start: Ms,
        end: Ms,
    },
    InsertPayment {
        reservation_id: Ulid,
    },
    SelectPaymentByReservation {
        reservation_id: Ulid,
    },
}

pub fn parse_sql(sql: &str) -> Result<Command, SqlError> {
    let dialect = PostgreSqlDialect {};
    let stmts = Parser::parse_sql(&dialect, sql).map_err(|e| SqlError::Parse(e.to_string()))?;
    if stmts.is_empty() {
        return Err(SqlError::Empty);
    }

    match &stmts[0] {
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

// ── INSERT ────────────────────────────────────────────────────

fn parse_insert(insert: &ast::Insert) -> Result<Command, SqlError> {
    let table = insert_table_name(insert)?;
    let fields = extract_insert_fields(insert)?;
    let returning = insert.returning.is_some();

    match table.as_str() {
        "vehicles" => {
            let id = parse_ulid(require_field(&fields, "vehicles", "id")?)?;
            let name = match find_field(&fields, "name") {
                Some(expr) => parse_string_or_null(expr)?,
                None => None,
            };
            let rate_per_day =
                parse_decimal(require_field(&fields, "vehicles", "rate_per_day")?)?;
            let available = match find_field(&fields, "available") {
                Some(expr) => parse_bool(expr)?,
                None => true,
            };
            Ok(Command::InsertVehicle {
                id,
                name,
                rate_per_day,
                available,
            })
        }
        "reservations" => Ok(Command::InsertReservation {
            id: parse_ulid(require_field(&fields, "reservations", "id")?)?,
            vehicle_id: parse_ulid(require_field(&fields, "reservations", "vehicle_id")?)?,
            holder: parse_string(require_field(&fields, "reservations", "holder")?)?,
            start: parse_i64(require_field(&fields, "reservations", "start")?)?,
            end: parse_i64(require_field(&fields, "reservations", "end")?)?,
            returning,
        }),
        "payments" => Ok(Command::InsertPayment {
            reservation_id: parse_ulid(require_field(&fields, "payments", "reservation_id")?)?,
        }),
        _ => Err(SqlError::UnknownTable(table)),
    }
}

// ── UPDATE ────────────────────────────────────────────────────

fn parse_update(
    table: &ast::TableWithJoins,
    assignments: &[ast::Assignment],
    selection: &Option<Expr>,
) -> Result<Command, SqlError> {
    let table = table_factor_name(&table.relation)?;
    let id = extract_where_id(selection)?;

    match table.as_str() {
        "vehicles" => {
            let mut name: Option<Option<String>> = None;
            let mut rate_per_day: Option<Decimal> = None;
            let mut available: Option<bool> = None;
            for a in assignments {
                match assignment_column(a)?.as_str() {
                    "name" => name = Some(parse_string_or_null(&a.value)?),
                    "rate_per_day" => rate_per_day = Some(parse_decimal(&a.value)?),
                    "available" => available = Some(parse_bool(&a.value)?),
                    col => return Err(SqlError::UnknownColumn("vehicles", col.to_string())),
                }
            }
            Ok(Command::UpdateVehicle {
                id,
                name,
                rate_per_day,
                available,
            })
        }
        "reservations" => {
            let mut status = None;
            for a in assignments {
                match assignment_column(a)?.as_str() {
                    "status" => {
                        let s = parse_string(&a.value)?;
                        status = Some(ReservationStatus::parse(&s).ok_or_else(|| {
                            SqlError::Parse(format!("unknown status: {s}"))
                        })?);
                    }
                    col => return Err(SqlError::UnknownColumn("reservations", col.to_string())),
                }
            }
            let status = status.ok_or(SqlError::MissingFilter("status"))?;
            if status == ReservationStatus::Pending {
                return Err(SqlError::Parse(
                    "reservations cannot be reset to pending".into(),
                ));
            }
            Ok(Command::UpdateReservationStatus { id, status })
        }
        _ => Err(SqlError::UnknownTable(table)),
    }
}

fn assignment_column(a: &ast::Assignment) -> Result<String, SqlError> {
    match &a.target {
        ast::AssignmentTarget::ColumnName(name) => {
            object_name_last(name).ok_or_else(|| SqlError::Parse("empty column name".into()))
        }
        _ => Err(SqlError::Parse("unsupported assignment target".into())),
    }
}

// ── DELETE ────────────────────────────────────────────────────

fn parse_delete(delete: &ast::Delete) -> Result<Command, SqlError> {
    let table = delete_table_name(delete)?;
    let id = extract_where_id(&delete.selection)?;

    match table.as_str() {
        "vehicles" => Ok(Command::DeleteVehicle { id }),
        _ => Err(SqlError::UnknownTable(table)),
    }
}

// ── SELECT ────────────────────────────────────────────────────

fn parse_select(query: &ast::Query) -> Result<Command, SqlError> {
    let select = match query.body.as_ref() {
        SetExpr::Select(s) => s,
        _ => return Err(SqlError::Unsupported("non-SELECT query".into())),
    };

    if select.from.is_empty() {
        return Err(SqlError::Parse("SELECT without FROM".into()));
    }
    let table = table_factor_name(&select.from[0].relation)?;

    match table.as_str() {
        "vehicles" => Ok(Command::SelectVehicles),
        "reservations" => {
            let mut vehicle_id = None;
            let mut id = None;
            if let Some(selection) = &select.selection {
                extract_eq_filters(selection, &mut |col, expr| match col {
                    "vehicle_id" => {
                        vehicle_id = Some(parse_ulid(expr)?);
                        Ok(())
                    }
                    "id" => {
                        id = Some(parse_ulid(expr)?);
                        Ok(())
                    }
                    _ => Ok(()),
                })?;
            }
            if let Some(id) = id {
                Ok(Command::SelectReservationById { id })
            } else if let Some(vehicle_id) = vehicle_id {
                Ok(Command::SelectReservationsByVehicle { vehicle_id })
            } else {
                Err(SqlError::MissingFilter("vehicle_id or id"))
            }
        }
        "availability" | "free_slots" | "quotes" => {
            let (mut vehicle_id, mut start, mut end, mut min_duration) = (None, None, None, None);
            if let Some(selection) = &select.selection {
                extract_window_filters(
                    selection,
                    &mut vehicle_id,
                    &mut start,
                    &mut end,
                    &mut min_duration,
                )?;
            }
            let vehicle_id = vehicle_id.ok_or(SqlError::MissingFilter("vehicle_id"))?;
            let start = start.ok_or(SqlError::MissingFilter("start"))?;
            let end = end.ok_or(SqlError::MissingFilter("end"))?;
            match table.as_str() {
                "availability" => Ok(Command::SelectAvailability {
                    vehicle_id,
                    start,
                    end,
                }),
                "free_slots" => Ok(Command::SelectFreeSlots {
                    vehicle_id,
                    start,
                    end,
                    min_duration,
                }),
                _ => Ok(Command::SelectQuote {
                    vehicle_id,
                    start,
                    end,
                }),
            }
        }
        "payments" => {
            let mut reservation_id = None;
            if let Some(selection) = &select.selection {
                extract_eq_filters(selection, &mut |col, expr| {
                    if col == "reservation_id" {
                        reservation_id = Some(parse_ulid(expr)?);
                    }
                    Ok(())
                })?;
            }
            Ok(Command::SelectPaymentByReservation {
                reservation_id: reservation_id.ok_or(SqlError::MissingFilter("reservation_id"))?,
            })
        }
        _ => Err(SqlError::UnknownTable(table)),
    }
}

/// Walk an AND-tree of `col = value` predicates.
fn extract_eq_filters(
    expr: &Expr,
    f: &mut impl FnMut(&str, &Expr) -> Result<(), SqlError>,
) -> Result<(), SqlError> {
    if let Expr::BinaryOp { left, op, right } = expr {
        match op {
            ast::BinaryOperator::And => {
                extract_eq_filters(left, f)?;
                extract_eq_filters(right, f)?;
            }
            ast::BinaryOperator::Eq => {
                if let Some(col) = expr_column_name(left) {
                    f(&col, right)?;
                }
            }
            _ => {}
        }
    }
    Ok(())
}

/// `vehicle_id = X AND start >= S AND "end" <= E [AND min_duration = D]`
fn extract_window_filters(
    expr: &Expr,
    vehicle_id: &mut Option<Ulid>,
    start: &mut Option<Ms>,
    end: &mut Option<Ms>,
    min_duration: &mut Option<Ms>,
) -> Result<(), SqlError> {
    match expr {
        Expr::BinaryOp { left, op, right } => match op {
            ast::BinaryOperator::And => {
                extract_window_filters(left, vehicle_id, start, end, min_duration)?;
                extract_window_filters(right, vehicle_id, start, end, min_duration)?;
            }
            ast::BinaryOperator::Eq => {
                let col = expr_column_name(left);
                if col.as_deref() == Some("vehicle_id") {
                    *vehicle_id = Some(parse_ulid(right)?);
                } else if col.as_deref() == Some("min_duration") {
                    *min_duration = Some(parse_i64(right)?);
                }
            }
            ast::BinaryOperator::GtEq => {
                if expr_column_name(left).as_deref() == Some("start") {
                    *start = Some(parse_i64(right)?);
                }
            }
            ast::BinaryOperator::LtEq => {
                if expr_column_name(left).as_deref() == Some("end") {
                    *end = Some(parse_i64(right)?);
                }
            }
            _ => {}
        },
        _ => {}
    }
    Ok(())
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

/// Insert columns zipped with the first VALUES row. A column list is
/// required — positional guessing over virtual tables invites silent
/// misbindings.
fn extract_insert_fields(insert: &ast::Insert) -> Result<Vec<(String, Expr)>, SqlError> {
    if insert.columns.is_empty() {
        return Err(SqlError::Parse("INSERT requires a column list".into()));
    }
    let body = insert
        .source
        .as_ref()
        .ok_or(SqlError::Parse("no VALUES".into()))?;
    let row = match body.body.as_ref() {
        SetExpr::Values(values) => {
            if values.rows.len() != 1 {
                return Err(SqlError::Parse("expected exactly one VALUES row".into()));
            }
            &values.rows[0]
        }
        _ => return Err(SqlError::Parse("expected VALUES".into())),
    };
    if row.len() != insert.columns.len() {
        return Err(SqlError::WrongArity(
            "INSERT",
            insert.columns.len(),
            row.len(),
        ));
    }
    Ok(insert
        .columns
        .iter()
        .zip(row.iter())
        .map(|(c, v)| (c.value.to_lowercase(), v.clone()))
        .collect())
}

fn find_field<'a>(fields: &'a [(String, Expr)], name: &str) -> Option<&'a Expr> {
    fields.iter().find(|(c, _)| c == name).map(|(_, v)| v)
}

fn require_field<'a>(
    fields: &'a [(String, Expr)],
    table: &'static str,
    name: &'static str,
) -> Result<&'a Expr, SqlError> {
    find_field(fields, name).ok_or(SqlError::MissingColumn(table, name))
}

fn extract_where_id(selection: &Option<Expr>) -> Result<Ulid, SqlError> {
    let sel = selection.as_ref().ok_or(SqlError::MissingFilter("id"))?;
    match sel {
        Expr::BinaryOp {
            left,
            op: ast::BinaryOperator::Eq,
            right,
        } => {
            if expr_column_name(left).as_deref() == Some("id") {
                parse_ulid(right)
            } else {
                Err(SqlError::MissingFilter("id"))
            }
        }
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
    if let Some(value) = extract_value(expr) {
        match value {
            Value::SingleQuotedString(s) | Value::Number(s, _) => {
                Ulid::from_string(s).map_err(|e| SqlError::Parse(format!("bad ULID: {e}")))
            }
            _ => Err(SqlError::Parse(format!("expected string, got {value:?}"))),
        }
    } else {
        Err(SqlError::Parse(format!("expected value, got {expr:?}")))
    }
}

fn parse_i64(expr: &Expr) -> Result<i64, SqlError> {
    if let Some(value) = extract_value(expr) {
        match value {
            Value::Number(s, _) => s
                .parse()
                .map_err(|e| SqlError::Parse(format!("bad i64: {e}"))),
            Value::SingleQuotedString(s) => s
                .parse()
                .map_err(|e| SqlError::Parse(format!("bad i64: {e}"))),
            _ => Err(SqlError::Parse(format!("expected number, got {value:?}"))),
        }
    } else if let Expr::UnaryOp {
        op: ast::UnaryOperator::Minus,
        expr,
    } = expr
    {
        Ok(-parse_i64(expr)?)
    } else {
        Err(SqlError::Parse(format!("expected value, got {expr:?}")))
    }
}

fn parse_decimal(expr: &Expr) -> Result<Decimal, SqlError> {
    if let Some(value) = extract_value(expr) {
        match value {
            Value::Number(s, _) | Value::SingleQuotedString(s) => s
                .parse()
                .map_err(|e| SqlError::Parse(format!("bad decimal: {e}"))),
            _ => Err(SqlError::Parse(format!("expected number, got {value:?}"))),
        }
    } else if let Expr::UnaryOp {
        op: ast::UnaryOperator::Minus,
        expr,
    } = expr
    {
        Ok(-parse_decimal(expr)?)
    } else {
        Err(SqlError::Parse(format!("expected value, got {expr:?}")))
    }
}

fn parse_string(expr: &Expr) -> Result<String, SqlError> {
    if let Some(value) = extract_value(expr) {
        match value {
            Value::SingleQuotedString(s) => Ok(s.clone()),
            _ => Err(SqlError::Parse(format!("expected string, got {value:?}"))),
        }
    } else {
        Err(SqlError::Parse(format!("expected value, got {expr:?}")))
    }
}

fn parse_string_or_null(expr: &Expr) -> Result<Option<String>, SqlError> {
    if let Some(Value::Null) = extract_value(expr) {
        return Ok(None);
    }
    parse_string(expr).map(Some)
}

fn parse_bool(expr: &Expr) -> Result<bool, SqlError> {
    if let Some(value) = extract_value(expr) {
        match value {
            Value::Boolean(b) => Ok(*b),
            Value::SingleQuotedString(s) => match s.to_lowercase().as_str() {
                "true" | "t" | "1" => Ok(true),
                "false" | "f" | "0" => Ok(false),
                _ => Err(SqlError::Parse(format!("bad bool: {s}"))),
            },
            Value::Number(n, _) => Ok(n != "0"),
            _ => Err(SqlError::Parse(format!("expected bool, got {value:?}"))),
        }
    } else {
        Err(SqlError::Parse(format!("expected value, got {expr:?}")))
    }
}

// ── Errors ────────────────────────────────────────────────────

#[derive(Debug)]
pub enum SqlError {
    Parse(String),
    Empty,
    Unsupported(String),
    UnknownTable(String),
    UnknownColumn(&'static str, String),
    MissingColumn(&'static str, &'static str),
    WrongArity(&'static str, usize, usize),
    MissingFilter(&'static str),
}

impl std::fmt::Display for SqlError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SqlError::Parse(s) => write!(f, "parse error: {s}"),
            SqlError::Empty => write!(f, "empty query"),
            SqlError::Unsupported(s) => write!(f, "unsupported: {s}"),
            SqlError::UnknownTable(t) => write!(f, "unknown table: {t}"),
            SqlError::UnknownColumn(t, c) => write!(f, "{t}: unknown column {c}"),
            SqlError::MissingColumn(t, c) => write!(f, "{t}: missing column {c}"),
            SqlError::WrongArity(t, expected, got) => {
                write!(f, "{t}: expected {expected} values, got {got}")
            }
            SqlError::MissingFilter(col) => write!(f, "missing filter: {col}"),
        }
    }
}

impl std::error::Error for SqlError {}
