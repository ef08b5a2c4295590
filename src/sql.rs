use chrono::NaiveDate;
use sqlparser::ast::{
    self, AssignmentTarget, Expr, FromTable, ObjectNamePart, SetExpr, Statement, TableFactor, TableObject, Value,
    ValueWithSpan,
};
use sqlparser::dialect::PostgreSqlDialect;
use sqlparser::parser::Parser;
use ulid::Ulid;

use crate::engine::{AppointmentEdit, BookingRequest, SlotQuery};
use crate::model::*;

/// Parsed command from SQL input.
#[derive(Debug, PartialEq)]
pub enum Command {
    InsertService {
        name: String,
        price: Money,
        duration_minutes: u32,
    },
    InsertClient {
        id: Ulid,
        name: String,
        rating: Option<u8>,
    },
    InsertAppointment(BookingRequest),
    UpdateStatus {
        id: Ulid,
        status: AppointmentStatus,
    },
    UpdateAppointment(AppointmentEdit),
    DeleteAppointment {
        id: Ulid,
    },
    SelectSlots(SlotQuery),
    SelectAppointmentsOn {
        date: NaiveDate,
        professional_id: Option<Ulid>,
    },
    SelectClientAppointments {
        client_id: Ulid,
    },
    SelectLoyalty {
        client_id: Ulid,
    },
    SelectTransactions {
        appointment_id: Option<Ulid>,
    },
    SelectServices,
}

/// Parse a single statement. Anything after the first is ignored.
pub fn parse_sql(sql: &str) -> Result<Command, SqlError> {
    let stmts = parse_statements(sql)?;
    let Some(first) = stmts.first() else {
        return Err(SqlError::Empty);
    };
    parse_statement(first)
}

/// Parse every `;`-separated statement, as sent by a simple-protocol batch.
pub fn parse_batch(sql: &str) -> Result<Vec<Command>, SqlError> {
    let stmts = parse_statements(sql)?;
    if stmts.is_empty() {
        return Err(SqlError::Empty);
    }
    stmts.iter().map(parse_statement).collect()
}

fn parse_statements(sql: &str) -> Result<Vec<Statement>, SqlError> {
    let dialect = PostgreSqlDialect {};
    Parser::parse_sql(&dialect, sql).map_err(|e| SqlError::Parse(e.to_string()))
}

fn parse_statement(stmt: &Statement) -> Result<Command, SqlError> {
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

/// Column → value for a single-row INSERT. Without a column list, values are
/// matched to `default_columns` by position.
struct Row<'a> {
    table: &'static str,
    cells: Vec<(String, &'a Expr)>,
}

impl<'a> Row<'a> {
    fn get(&self, column: &str) -> Option<&'a Expr> {
        self.cells.iter().find(|(c, _)| c == column).map(|(_, e)| *e)
    }

    fn require(&self, column: &'static str) -> Result<&'a Expr, SqlError> {
        self.get(column).ok_or(SqlError::MissingColumn(self.table, column))
    }
}

fn insert_row<'a>(
    insert: &'a ast::Insert,
    table: &'static str,
    default_columns: &[&str],
) -> Result<Row<'a>, SqlError> {
    let values = extract_insert_values(insert)?;
    let columns: Vec<String> = if insert.columns.is_empty() {
        default_columns.iter().map(|c| c.to_string()).collect()
    } else {
        insert.columns.iter().map(|c| c.value.to_lowercase()).collect()
    };
    // Positional inserts may omit trailing optional columns.
    let arity_ok = if insert.columns.is_empty() {
        values.len() <= columns.len()
    } else {
        values.len() == columns.len()
    };
    if !arity_ok {
        return Err(SqlError::WrongArity(table, columns.len(), values.len()));
    }
    for column in &columns {
        if !default_columns.contains(&column.as_str()) {
            return Err(SqlError::UnknownColumn(table, column.clone()));
        }
    }
    Ok(Row {
        table,
        cells: columns.into_iter().zip(values.iter()).collect(),
    })
}

const SERVICE_COLUMNS: &[&str] = &["name", "price", "duration"];
const CLIENT_COLUMNS: &[&str] = &["id", "name", "rating"];
const APPOINTMENT_COLUMNS: &[&str] = &[
    "id",
    "client_id",
    "start",
    "duration",
    "service",
    "price",
    "notes",
    "professional_id",
];

fn parse_insert(insert: &ast::Insert) -> Result<Command, SqlError> {
    let table = insert_table_name(insert)?;

    match table.as_str() {
        "services" => {
            let row = insert_row(insert, "services", SERVICE_COLUMNS)?;
            Ok(Command::InsertService {
                name: parse_text(row.require("name")?)?,
                price: parse_money(row.require("price")?)?,
                duration_minutes: parse_u32(row.require("duration")?)?,
            })
        }
        "clients" => {
            let row = insert_row(insert, "clients", CLIENT_COLUMNS)?;
            let rating = match row.get("rating") {
                Some(e) => parse_u32_or_null(e)?
                    .map(|r| u8::try_from(r).map_err(|_| SqlError::Parse(format!("rating {r} out of range"))))
                    .transpose()?,
                None => None,
            };
            Ok(Command::InsertClient {
                id: parse_ulid(row.require("id")?)?,
                name: parse_text(row.require("name")?)?,
                rating,
            })
        }
        "appointments" => {
            let row = insert_row(insert, "appointments", APPOINTMENT_COLUMNS)?;
            let id = match row.get("id") {
                Some(e) => parse_ulid(e)?,
                None => Ulid::new(),
            };
            let mut req = BookingRequest::new(
                parse_ulid(row.require("client_id")?)?,
                parse_text(row.require("service")?)?,
                parse_instant_expr(row.require("start")?)?,
            );
            req.id = id;
            if let Some(e) = row.get("duration") {
                req.duration_minutes = parse_u32_or_null(e)?;
            }
            if let Some(e) = row.get("price") {
                req.price = parse_money_or_null(e)?;
            }
            if let Some(e) = row.get("notes") {
                req.notes = parse_text_or_null(e)?.unwrap_or_default();
            }
            if let Some(e) = row.get("professional_id") {
                req.professional_id = parse_ulid_or_null(e)?;
            }
            Ok(Command::InsertAppointment(req))
        }
        _ => Err(SqlError::UnknownTable(table)),
    }
}

// ── UPDATE / DELETE ───────────────────────────────────────────

fn parse_update(
    relation: &TableFactor,
    assignments: &[ast::Assignment],
    selection: &Option<Expr>,
) -> Result<Command, SqlError> {
    let table = table_factor_name(relation)?;
    if table != "appointments" {
        return Err(SqlError::UnknownTable(table));
    }
    let id = extract_where_id(selection)?;
    if assignments.is_empty() {
        return Err(SqlError::Parse("UPDATE without SET".into()));
    }

    let mut status = None;
    let mut edit = AppointmentEdit::new(id);
    for assignment in assignments {
        let column = match &assignment.target {
            AssignmentTarget::ColumnName(name) => object_name_last(name),
            AssignmentTarget::Tuple(_) => None,
        }
        .ok_or_else(|| SqlError::Unsupported("tuple assignment".into()))?;
        let value = &assignment.value;
        match column.as_str() {
            "status" => status = Some(parse_status(value)?),
            "start" => edit.start = Some(parse_instant_expr(value)?),
            "duration" => edit.duration_minutes = Some(parse_u32(value)?),
            "price" => edit.price = Some(parse_money(value)?),
            "notes" => edit.notes = Some(parse_text_or_null(value)?.unwrap_or_default()),
            "service" => edit.service = Some(parse_text(value)?),
            "professional_id" => edit.professional_id = Some(parse_ulid_or_null(value)?),
            _ => return Err(SqlError::UnknownColumn("appointments", column)),
        }
    }

    match status {
        Some(status) if assignments.len() == 1 => Ok(Command::UpdateStatus { id, status }),
        Some(_) => Err(SqlError::Unsupported(
            "status must be changed on its own, without other columns".into(),
        )),
        None => Ok(Command::UpdateAppointment(edit)),
    }
}

fn parse_delete(delete: &ast::Delete) -> Result<Command, SqlError> {
    let table = delete_table_name(delete)?;
    let id = extract_where_id(&delete.selection)?;

    match table.as_str() {
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

    if select.from.is_empty() {
        return Err(SqlError::Parse("SELECT without FROM".into()));
    }
    let table = table_factor_name(&select.from[0].relation)?;

    let mut filters = Vec::new();
    if let Some(selection) = &select.selection {
        collect_eq_filters(selection, &mut filters)?;
    }
    let filter = |column: &str| filters.iter().find(|(c, _)| c == column).map(|(_, e)| *e);

    match table.as_str() {
        "slots" => {
            let date = filter("date").ok_or(SqlError::MissingFilter("date"))?;
            Ok(Command::SelectSlots(SlotQuery {
                date: parse_date(date)?,
                service: filter("service").map(parse_text).transpose()?,
                duration_minutes: filter("duration").map(parse_u32).transpose()?,
                professional_id: filter("professional_id").map(parse_ulid).transpose()?,
            }))
        }
        "appointments" => {
            if let Some(client) = filter("client_id") {
                return Ok(Command::SelectClientAppointments {
                    client_id: parse_ulid(client)?,
                });
            }
            let date = filter("date").ok_or(SqlError::MissingFilter("date or client_id"))?;
            Ok(Command::SelectAppointmentsOn {
                date: parse_date(date)?,
                professional_id: filter("professional_id").map(parse_ulid).transpose()?,
            })
        }
        "loyalty" => {
            let client = filter("client_id").ok_or(SqlError::MissingFilter("client_id"))?;
            Ok(Command::SelectLoyalty {
                client_id: parse_ulid(client)?,
            })
        }
        "transactions" => Ok(Command::SelectTransactions {
            appointment_id: filter("appointment_id").map(parse_ulid).transpose()?,
        }),
        "services" => Ok(Command::SelectServices),
        _ => Err(SqlError::UnknownTable(table)),
    }
}

/// Flatten `a = x AND b = y AND ...` into `(column, value)` pairs.
fn collect_eq_filters<'a>(expr: &'a Expr, out: &mut Vec<(String, &'a Expr)>) -> Result<(), SqlError> {
    match expr {
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
            out.push((column, &**right));
            Ok(())
        }
        Expr::Nested(inner) => collect_eq_filters(inner, out),
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

fn extract_insert_values(insert: &ast::Insert) -> Result<&Vec<Expr>, SqlError> {
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

/// A literal as text, or `None` for NULL. Negative numbers keep their sign.
fn literal(expr: &Expr) -> Result<Option<String>, SqlError> {
    match expr {
        Expr::Value(ValueWithSpan { value, .. }) => match value {
            Value::Null => Ok(None),
            Value::SingleQuotedString(s) | Value::Number(s, _) => Ok(Some(s.clone())),
            Value::Boolean(b) => Ok(Some(b.to_string())),
            other => Err(SqlError::Parse(format!("unsupported literal {other}"))),
        },
        Expr::UnaryOp {
            op: ast::UnaryOperator::Minus,
            expr,
        } => Ok(literal(expr)?.map(|s| format!("-{s}"))),
        Expr::Nested(inner) => literal(inner),
        other => Err(SqlError::Parse(format!("expected a literal, got {other}"))),
    }
}

fn non_null(expr: &Expr) -> Result<String, SqlError> {
    literal(expr)?.ok_or_else(|| SqlError::Parse("unexpected NULL".into()))
}

fn parse_text(expr: &Expr) -> Result<String, SqlError> {
    non_null(expr)
}

fn parse_text_or_null(expr: &Expr) -> Result<Option<String>, SqlError> {
    literal(expr)
}

fn parse_ulid(expr: &Expr) -> Result<Ulid, SqlError> {
    let s = non_null(expr)?;
    Ulid::from_string(&s).map_err(|e| SqlError::Parse(format!("bad ULID {s:?}: {e}")))
}

fn parse_ulid_or_null(expr: &Expr) -> Result<Option<Ulid>, SqlError> {
    match literal(expr)? {
        None => Ok(None),
        Some(_) => parse_ulid(expr).map(Some),
    }
}

fn parse_u32(expr: &Expr) -> Result<u32, SqlError> {
    let s = non_null(expr)?;
    s.trim()
        .parse()
        .map_err(|_| SqlError::Parse(format!("expected a non-negative integer, got {s:?}")))
}

fn parse_u32_or_null(expr: &Expr) -> Result<Option<u32>, SqlError> {
    match literal(expr)? {
        None => Ok(None),
        Some(_) => parse_u32(expr).map(Some),
    }
}

fn parse_money(expr: &Expr) -> Result<Money, SqlError> {
    let s = non_null(expr)?;
    s.parse().map_err(|e: ParseMoneyError| SqlError::Parse(e.to_string()))
}

fn parse_money_or_null(expr: &Expr) -> Result<Option<Money>, SqlError> {
    match literal(expr)? {
        None => Ok(None),
        Some(_) => parse_money(expr).map(Some),
    }
}

fn parse_instant_expr(expr: &Expr) -> Result<Ms, SqlError> {
    let s = non_null(expr)?;
    parse_instant(&s).ok_or_else(|| {
        SqlError::Parse(format!("bad instant {s:?}: expected RFC 3339 with offset or Unix ms"))
    })
}

fn parse_date(expr: &Expr) -> Result<NaiveDate, SqlError> {
    let s = non_null(expr)?;
    NaiveDate::parse_from_str(s.trim(), "%Y-%m-%d")
        .map_err(|_| SqlError::Parse(format!("bad date {s:?}: expected YYYY-MM-DD")))
}

fn parse_status(expr: &Expr) -> Result<AppointmentStatus, SqlError> {
    let s = non_null(expr)?;
    s.parse().map_err(|e: ParseStatusError| SqlError::Parse(e.to_string()))
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
    #[error("{0}: unknown column {1}")]
    UnknownColumn(&'static str, String),
    #[error("{0}: expected {1} values, got {2}")]
    WrongArity(&'static str, usize, usize),
    #[error("{0}: missing column {1}")]
    MissingColumn(&'static str, &'static str),
    #[error("missing filter: {0}")]
    MissingFilter(&'static str),
}
