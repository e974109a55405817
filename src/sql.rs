//! The SQL dialect spoken over the wire. Each verb is a table: inserting into
//! `holds` places a hold, deleting from it cancels one, and so on.

use chrono::{NaiveDate, NaiveTime};
use sqlparser::ast::{
    self, BinaryOperator, Expr, FromTable, ObjectNamePart, SetExpr, Statement, TableFactor,
    TableObject, UnaryOperator, Value, ValueWithSpan,
};
use sqlparser::dialect::PostgreSqlDialect;
use sqlparser::parser::Parser;
use thiserror::Error;
use ulid::Ulid;

use crate::model::*;

/// A booking row as written by the client, before holder validation.
#[derive(Debug, Clone, PartialEq)]
pub struct NewBooking {
    pub id: BookingId,
    pub court_id: CourtId,
    pub date: NaiveDate,
    pub range: TimeRange,
    pub user_id: Option<UserId>,
    pub guest_name: Option<String>,
    pub guest_phone: Option<String>,
    pub price: Option<Price>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    InsertCourt {
        id: CourtId,
        venue_id: VenueId,
        name: String,
    },
    DeleteCourt {
        id: CourtId,
    },
    InsertSchedule(PricingSchedule),
    DeleteSchedule {
        id: Ulid,
    },
    InsertHold(NewBooking),
    InsertWalkIn(NewBooking),
    ConfirmBooking {
        id: BookingId,
        user_id: UserId,
    },
    CancelHold {
        id: BookingId,
        user_id: UserId,
    },
    ListTransfer {
        id: BookingId,
        user_id: UserId,
        price: Option<Price>,
    },
    PurchaseTransfer {
        id: BookingId,
        user_id: UserId,
    },
    SelectCourts {
        venue_id: Option<VenueId>,
    },
    SelectSchedules {
        court_id: CourtId,
    },
    SelectAvailability {
        court_id: CourtId,
        date: NaiveDate,
    },
    SelectPendingHolds {
        venue_id: VenueId,
        date: NaiveDate,
    },
    SelectBooking {
        id: BookingId,
    },
    SelectUserBookings {
        user_id: UserId,
        status: Option<BookingStatus>,
    },
    SelectTransferListings,
    Listen {
        channel: String,
    },
    Unlisten {
        channel: String,
    },
    UnlistenAll,
}

#[derive(Debug, Error)]
pub enum SqlError {
    #[error("parse error: {0}")]
    Parse(String),
    #[error("empty query")]
    Empty,
    #[error("unsupported: {0}")]
    Unsupported(String),
    #[error("unknown table: {0}")]
    UnknownTable(String),
    #[error("{0}: expected at least {1} values, got {2}")]
    WrongArity(&'static str, usize, usize),
    #[error("missing filter: {0}")]
    MissingFilter(&'static str),
    #[error("{0}: unknown column {1}")]
    UnknownColumn(&'static str, String),
    #[error("missing value for column {0}")]
    MissingValue(&'static str),
    #[error("invalid value for {0}: {1}")]
    InvalidValue(&'static str, String),
}

/// Channel argument of a `LISTEN`/`UNLISTEN`, if `sql` is one.
fn channel_arg<'a>(sql: &'a str, verb: &str) -> Option<&'a str> {
    let head = sql.get(..verb.len())?;
    if !head.eq_ignore_ascii_case(verb) {
        return None;
    }
    let rest = &sql[verb.len()..];
    if !rest.starts_with(char::is_whitespace) {
        return None;
    }
    Some(rest.trim().trim_end_matches(';').trim().trim_matches('"'))
}

pub fn parse_sql(sql: &str) -> Result<Command, SqlError> {
    let trimmed = sql.trim();
    if let Some(channel) = channel_arg(trimmed, "UNLISTEN") {
        return Ok(if channel == "*" {
            Command::UnlistenAll
        } else {
            Command::Unlisten {
                channel: channel.to_string(),
            }
        });
    }
    if let Some(channel) = channel_arg(trimmed, "LISTEN") {
        return Ok(Command::Listen {
            channel: channel.to_string(),
        });
    }

    let stmts = Parser::parse_sql(&PostgreSqlDialect {}, trimmed)
        .map_err(|e| SqlError::Parse(e.to_string()))?;
    let Some(stmt) = stmts.first() else {
        return Err(SqlError::Empty);
    };

    match stmt {
        Statement::Insert(insert) => parse_insert(insert),
        Statement::Delete(delete) => parse_delete(delete),
        Statement::Query(query) => parse_select(query),
        other => Err(SqlError::Unsupported(format!("{other}"))),
    }
}

// ── INSERT ────────────────────────────────────────────────────

const COURT_COLUMNS: &[&str] = &["id", "venue_id", "name"];
const SCHEDULE_COLUMNS: &[&str] = &[
    "id",
    "court_id",
    "day_of_week",
    "start_time",
    "end_time",
    "price",
    "effective_from",
    "effective_to",
    "active",
];
const BOOKING_COLUMNS: &[&str] = &[
    "id",
    "court_id",
    "date",
    "start_time",
    "end_time",
    "user_id",
    "guest_name",
    "guest_phone",
    "total_price",
];
const CONFIRM_COLUMNS: &[&str] = &["hold_id", "user_id"];
const TRANSFER_COLUMNS: &[&str] = &["booking_id", "user_id", "price"];
const PURCHASE_COLUMNS: &[&str] = &["booking_id", "user_id"];

/// One VALUES row laid out in the table's column order.
///
/// Without a column list the values are taken by position and the first
/// `required` must be present. With one, each value lands in its named slot
/// and unnamed columns read as NULL.
struct Row<'a> {
    values: Vec<Option<&'a Expr>>,
}

impl<'a> Row<'a> {
    fn new(
        table: &'static str,
        layout: &[&str],
        columns: &[String],
        values: &'a [Expr],
        required: usize,
    ) -> Result<Self, SqlError> {
        if columns.is_empty() {
            if values.len() < required {
                return Err(SqlError::WrongArity(table, required, values.len()));
            }
            return Ok(Self {
                values: values.iter().map(Some).collect(),
            });
        }
        if columns.len() != values.len() {
            return Err(SqlError::WrongArity(table, columns.len(), values.len()));
        }
        let mut slots = vec![None; layout.len()];
        for (column, value) in columns.iter().zip(values) {
            let i = layout
                .iter()
                .position(|c| c == column)
                .ok_or_else(|| SqlError::UnknownColumn(table, column.clone()))?;
            slots[i] = Some(value);
        }
        Ok(Self { values: slots })
    }

    /// Column `i`, or `None` when absent or NULL.
    fn opt(&self, i: usize) -> Option<&'a Expr> {
        self.values.get(i).copied().flatten().filter(|e| !is_null(e))
    }

    fn req(&self, i: usize, column: &'static str) -> Result<&'a Expr, SqlError> {
        self.opt(i).ok_or(SqlError::MissingValue(column))
    }
}

fn parse_insert(insert: &ast::Insert) -> Result<Command, SqlError> {
    let table = insert_table_name(insert)?;
    let values = first_values_row(insert)?;
    let columns: Vec<String> = insert.columns.iter().map(|c| c.value.to_lowercase()).collect();
    let row = |name: &'static str, layout: &[&str], required: usize| Row::new(name, layout, &columns, values, required);

    match table.as_str() {
        "courts" => {
            let row = row("courts", COURT_COLUMNS, 3)?;
            Ok(Command::InsertCourt {
                id: ulid(row.req(0, "id")?, "id")?,
                venue_id: ulid(row.req(1, "venue_id")?, "venue_id")?,
                name: text(row.req(2, "name")?, "name")?,
            })
        }
        "schedules" => {
            let row = row("schedules", SCHEDULE_COLUMNS, 7)?;
            let day = int(row.req(2, "day_of_week")?, "day_of_week")?;
            let day_of_week =
                u8::try_from(day).map_err(|_| SqlError::InvalidValue("day_of_week", day.to_string()))?;
            Ok(Command::InsertSchedule(PricingSchedule {
                id: ulid(row.req(0, "id")?, "id")?,
                court_id: ulid(row.req(1, "court_id")?, "court_id")?,
                day_of_week,
                range: time_range(row.req(3, "start_time")?, row.req(4, "end_time")?)?,
                price: int(row.req(5, "price")?, "price")?,
                effective_from: date(row.req(6, "effective_from")?, "effective_from")?,
                effective_to: row.opt(7).map(|e| date(e, "effective_to")).transpose()?,
                active: row.opt(8).map(|e| boolean(e, "active")).transpose()?.unwrap_or(true),
            }))
        }
        "holds" => Ok(Command::InsertHold(new_booking(row("holds", BOOKING_COLUMNS, 5)?)?)),
        "walk_ins" => Ok(Command::InsertWalkIn(new_booking(row("walk_ins", BOOKING_COLUMNS, 5)?)?)),
        "bookings" => {
            let row = row("bookings", CONFIRM_COLUMNS, 2)?;
            Ok(Command::ConfirmBooking {
                id: ulid(row.req(0, "hold_id")?, "hold_id")?,
                user_id: ulid(row.req(1, "user_id")?, "user_id")?,
            })
        }
        "transfers" => {
            let row = row("transfers", TRANSFER_COLUMNS, 2)?;
            Ok(Command::ListTransfer {
                id: ulid(row.req(0, "booking_id")?, "booking_id")?,
                user_id: ulid(row.req(1, "user_id")?, "user_id")?,
                price: row.opt(2).map(|e| int(e, "price")).transpose()?,
            })
        }
        "purchases" => {
            let row = row("purchases", PURCHASE_COLUMNS, 2)?;
            Ok(Command::PurchaseTransfer {
                id: ulid(row.req(0, "booking_id")?, "booking_id")?,
                user_id: ulid(row.req(1, "user_id")?, "user_id")?,
            })
        }
        _ => Err(SqlError::UnknownTable(table)),
    }
}

/// `(id, court_id, date, start_time, end_time, user_id, guest_name, guest_phone, total_price)`
fn new_booking(row: Row<'_>) -> Result<NewBooking, SqlError> {
    Ok(NewBooking {
        id: ulid(row.req(0, "id")?, "id")?,
        court_id: ulid(row.req(1, "court_id")?, "court_id")?,
        date: date(row.req(2, "date")?, "date")?,
        range: time_range(row.req(3, "start_time")?, row.req(4, "end_time")?)?,
        user_id: row.opt(5).map(|e| ulid(e, "user_id")).transpose()?,
        guest_name: row.opt(6).map(|e| text(e, "guest_name")).transpose()?,
        guest_phone: row.opt(7).map(|e| text(e, "guest_phone")).transpose()?,
        price: row.opt(8).map(|e| int(e, "total_price")).transpose()?,
    })
}

// ── DELETE ────────────────────────────────────────────────────

fn parse_delete(delete: &ast::Delete) -> Result<Command, SqlError> {
    let table = delete_table_name(delete)?;
    let filters = Filters::from_selection(delete.selection.as_ref())?;

    match table.as_str() {
        "courts" => Ok(Command::DeleteCourt {
            id: filters.ulid("id")?,
        }),
        "schedules" => Ok(Command::DeleteSchedule {
            id: filters.ulid("id")?,
        }),
        "holds" => Ok(Command::CancelHold {
            id: filters.ulid("id")?,
            user_id: filters.ulid("user_id")?,
        }),
        _ => Err(SqlError::UnknownTable(table)),
    }
}

// ── SELECT ────────────────────────────────────────────────────

fn parse_select(query: &ast::Query) -> Result<Command, SqlError> {
    let SetExpr::Select(select) = query.body.as_ref() else {
        return Err(SqlError::Unsupported("non-SELECT query".into()));
    };
    let Some(from) = select.from.first() else {
        return Err(SqlError::Parse("SELECT without FROM".into()));
    };
    let table = table_factor_name(&from.relation)?;
    let filters = Filters::from_selection(select.selection.as_ref())?;

    match table.as_str() {
        "courts" => Ok(Command::SelectCourts {
            venue_id: filters.opt_ulid("venue_id")?,
        }),
        "schedules" => Ok(Command::SelectSchedules {
            court_id: filters.ulid("court_id")?,
        }),
        "availability" => Ok(Command::SelectAvailability {
            court_id: filters.ulid("court_id")?,
            date: filters.date("date")?,
        }),
        "pending_holds" => Ok(Command::SelectPendingHolds {
            venue_id: filters.ulid("venue_id")?,
            date: filters.date("date")?,
        }),
        "bookings" => {
            if filters.get("id").is_some() {
                return Ok(Command::SelectBooking {
                    id: filters.ulid("id")?,
                });
            }
            let status = filters
                .get("status")
                .map(|e| {
                    let s = text(e, "status")?;
                    BookingStatus::parse(&s).ok_or(SqlError::InvalidValue("status", s))
                })
                .transpose()?;
            Ok(Command::SelectUserBookings {
                user_id: filters.ulid("user_id")?,
                status,
            })
        }
        "transfer_listings" => Ok(Command::SelectTransferListings),
        _ => Err(SqlError::UnknownTable(table)),
    }
}

/// `column = value` pairs from a WHERE clause made of ANDed equalities.
struct Filters<'a> {
    pairs: Vec<(String, &'a Expr)>,
}

impl<'a> Filters<'a> {
    fn from_selection(selection: Option<&'a Expr>) -> Result<Self, SqlError> {
        let mut pairs = Vec::new();
        if let Some(expr) = selection {
            collect_equalities(expr, &mut pairs)?;
        }
        Ok(Self { pairs })
    }

    fn get(&self, column: &str) -> Option<&'a Expr> {
        self.pairs
            .iter()
            .find(|(c, _)| c == column)
            .map(|(_, e)| *e)
    }

    fn ulid(&self, column: &'static str) -> Result<Ulid, SqlError> {
        ulid(self.get(column).ok_or(SqlError::MissingFilter(column))?, column)
    }

    fn opt_ulid(&self, column: &'static str) -> Result<Option<Ulid>, SqlError> {
        self.get(column).map(|e| ulid(e, column)).transpose()
    }

    fn date(&self, column: &'static str) -> Result<NaiveDate, SqlError> {
        date(self.get(column).ok_or(SqlError::MissingFilter(column))?, column)
    }
}

fn collect_equalities<'a>(expr: &'a Expr, out: &mut Vec<(String, &'a Expr)>) -> Result<(), SqlError> {
    match expr {
        Expr::Nested(inner) => collect_equalities(inner, out),
        Expr::BinaryOp {
            left,
            op: BinaryOperator::And,
            right,
        } => {
            collect_equalities(left, out)?;
            collect_equalities(right, out)
        }
        Expr::BinaryOp {
            left,
            op: BinaryOperator::Eq,
            right,
        } => {
            let column = column_name(left)
                .ok_or_else(|| SqlError::Unsupported(format!("filter on {left}")))?;
            out.push((column, right));
            Ok(())
        }
        other => Err(SqlError::Unsupported(format!("filter {other}"))),
    }
}

// ── AST helpers ───────────────────────────────────────────────

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
    let (FromTable::WithFromKeyword(tables) | FromTable::WithoutKeyword(tables)) = &delete.from;
    let first = tables
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

fn first_values_row(insert: &ast::Insert) -> Result<&[Expr], SqlError> {
    let source = insert
        .source
        .as_ref()
        .ok_or_else(|| SqlError::Parse("no VALUES".into()))?;
    let SetExpr::Values(values) = source.body.as_ref() else {
        return Err(SqlError::Parse("expected VALUES".into()));
    };
    match values.rows.as_slice() {
        [row] => Ok(row.as_slice()),
        [] => Err(SqlError::Parse("empty VALUES".into())),
        _ => Err(SqlError::Unsupported("multi-row INSERT".into())),
    }
}

fn column_name(expr: &Expr) -> Option<String> {
    match expr {
        Expr::Identifier(ident) => Some(ident.value.to_lowercase()),
        Expr::CompoundIdentifier(parts) => parts.last().map(|i| i.value.to_lowercase()),
        _ => None,
    }
}

fn literal(expr: &Expr) -> Option<&Value> {
    match expr {
        Expr::Value(ValueWithSpan { value, .. }) => Some(value),
        _ => None,
    }
}

fn is_null(expr: &Expr) -> bool {
    matches!(literal(expr), Some(Value::Null))
}

// ── Value conversions ─────────────────────────────────────────

fn text(expr: &Expr, column: &'static str) -> Result<String, SqlError> {
    match literal(expr) {
        Some(Value::SingleQuotedString(s)) | Some(Value::Number(s, _)) => Ok(s.clone()),
        _ => Err(SqlError::InvalidValue(column, expr.to_string())),
    }
}

fn ulid(expr: &Expr, column: &'static str) -> Result<Ulid, SqlError> {
    let s = text(expr, column)?;
    Ulid::from_string(&s.to_ascii_uppercase()).map_err(|e| SqlError::InvalidValue(column, format!("{s}: {e}")))
}

fn int(expr: &Expr, column: &'static str) -> Result<i64, SqlError> {
    if let Expr::UnaryOp {
        op: UnaryOperator::Minus,
        expr,
    } = expr
    {
        return Ok(-int(expr, column)?);
    }
    let s = text(expr, column)?;
    s.trim()
        .parse()
        .map_err(|_| SqlError::InvalidValue(column, s))
}

fn boolean(expr: &Expr, column: &'static str) -> Result<bool, SqlError> {
    if let Some(Value::Boolean(b)) = literal(expr) {
        return Ok(*b);
    }
    let s = text(expr, column)?;
    match s.to_ascii_lowercase().as_str() {
        "true" | "t" | "1" => Ok(true),
        "false" | "f" | "0" => Ok(false),
        _ => Err(SqlError::InvalidValue(column, s)),
    }
}

fn date(expr: &Expr, column: &'static str) -> Result<NaiveDate, SqlError> {
    let s = text(expr, column)?;
    NaiveDate::parse_from_str(s.trim(), "%Y-%m-%d").map_err(|_| SqlError::InvalidValue(column, s))
}

fn time(expr: &Expr, column: &'static str) -> Result<NaiveTime, SqlError> {
    let s = text(expr, column)?;
    let trimmed = s.trim();
    NaiveTime::parse_from_str(trimmed, "%H:%M:%S")
        .or_else(|_| NaiveTime::parse_from_str(trimmed, "%H:%M"))
        .map_err(|_| SqlError::InvalidValue(column, s))
}

fn time_range(start: &Expr, end: &Expr) -> Result<TimeRange, SqlError> {
    let start = time(start, "start_time")?;
    let end = time(end, "end_time")?;
    TimeRange::new(start, end)
        .ok_or_else(|| SqlError::InvalidValue("end_time", "must be after start_time".into()))
}
