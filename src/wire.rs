use std::collections::HashMap;
use std::fmt::Debug;
use std::io;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use futures::{Sink, SinkExt, stream};
use pgwire::api::auth::cleartext::CleartextPasswordAuthStartupHandler;
use pgwire::api::auth::{DefaultServerParameterProvider, StartupHandler};
use pgwire::api::copy::CopyHandler;
use pgwire::api::portal::{Format, Portal};
use pgwire::api::query::{ExtendedQueryHandler, SimpleQueryHandler};
use pgwire::api::results::{
    DataRowEncoder, DescribePortalResponse, DescribeStatementResponse, FieldFormat, FieldInfo,
    QueryResponse, Response, Tag,
};
use pgwire::api::stmt::{QueryParser, StoredStatement};
use pgwire::api::store::PortalStore;
use pgwire::api::{ClientInfo, ClientPortalStore, NoopHandler, PgWireServerHandlers, Type};
use pgwire::error::{ErrorInfo, PgWireError, PgWireResult};
use pgwire::messages::PgWireBackendMessage;
use pgwire::messages::data::DataRow;
use pgwire::messages::response::NotificationResponse;
use pgwire::tokio::TlsAcceptor;
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio::sync::broadcast::{self, error::TryRecvError};

use crate::auth::CourtsideAuthSource;
use crate::engine::{Engine, EngineError};
use crate::model::*;
use crate::notify::{BookingNotice, channel_name, parse_channel};
use crate::observability::{QUERIES_TOTAL, QUERY_DURATION_SECONDS, command_label};
use crate::sql::{self, Command, NewBooking, SqlError};

/// One handler per client connection. LISTEN subscriptions live here and are
/// dropped with the session.
pub struct CourtsideHandler {
    engine: Arc<Engine>,
    subscriptions: Mutex<HashMap<VenueId, broadcast::Receiver<BookingNotice>>>,
    query_parser: Arc<CourtsideQueryParser>,
}

impl CourtsideHandler {
    pub fn new(engine: Arc<Engine>) -> Self {
        Self {
            engine,
            subscriptions: Mutex::new(HashMap::new()),
            query_parser: Arc::new(CourtsideQueryParser),
        }
    }

    /// Parse, execute, and record metrics for one statement.
    async fn run(&self, query: &str) -> PgWireResult<Response> {
        let cmd = sql::parse_sql(query).map_err(sql_err)?;
        let label = command_label(&cmd);
        let started = Instant::now();
        let result = self.execute_command(cmd).await;
        let status = if result.is_ok() { "ok" } else { "error" };
        metrics::counter!(QUERIES_TOTAL, "command" => label, "status" => status).increment(1);
        metrics::histogram!(QUERY_DURATION_SECONDS, "command" => label)
            .record(started.elapsed().as_secs_f64());
        result
    }

    async fn execute_command(&self, cmd: Command) -> PgWireResult<Response> {
        let engine = &self.engine;
        match cmd {
            Command::InsertCourt { id, venue_id, name } => {
                engine
                    .create_court(id, venue_id, name)
                    .await
                    .map_err(engine_err)?;
                Ok(Response::Execution(Tag::new("INSERT").with_rows(1)))
            }
            Command::DeleteCourt { id } => {
                engine.delete_court(id).await.map_err(engine_err)?;
                Ok(Response::Execution(Tag::new("DELETE").with_rows(1)))
            }
            Command::InsertSchedule(schedule) => {
                engine.add_schedule(schedule).await.map_err(engine_err)?;
                Ok(Response::Execution(Tag::new("INSERT").with_rows(1)))
            }
            Command::DeleteSchedule { id } => {
                engine.remove_schedule(id).await.map_err(engine_err)?;
                Ok(Response::Execution(Tag::new("DELETE").with_rows(1)))
            }
            Command::InsertHold(new) => {
                let req = booking_request(new)?;
                let receipt = engine.initiate_booking(req).await.map_err(engine_err)?;
                let schema = Arc::new(hold_receipt_schema());
                let mut encoder = DataRowEncoder::new(schema.clone());
                encoder.encode_field(&receipt.booking_id.to_string())?;
                encoder.encode_field(&receipt.payment_code)?;
                encoder.encode_field(&receipt.expires_at)?;
                encoder.encode_field(&receipt.total_price)?;
                Ok(query_response(schema, vec![Ok(encoder.take_row())]))
            }
            Command::InsertWalkIn(new) => {
                let req = booking_request(new)?;
                engine.create_walk_in(req).await.map_err(engine_err)?;
                Ok(Response::Execution(Tag::new("INSERT").with_rows(1)))
            }
            Command::ConfirmBooking { id, user_id } => {
                engine.confirm_booking(id, user_id).await.map_err(engine_err)?;
                Ok(Response::Execution(Tag::new("INSERT").with_rows(1)))
            }
            Command::CancelHold { id, user_id } => {
                engine.cancel_booking(id, user_id).await.map_err(engine_err)?;
                Ok(Response::Execution(Tag::new("DELETE").with_rows(1)))
            }
            Command::ListTransfer { id, user_id, price } => {
                engine
                    .mark_for_transfer(id, user_id, price)
                    .await
                    .map_err(engine_err)?;
                Ok(Response::Execution(Tag::new("INSERT").with_rows(1)))
            }
            Command::PurchaseTransfer { id, user_id } => {
                engine
                    .purchase_transfer(id, user_id)
                    .await
                    .map_err(engine_err)?;
                Ok(Response::Execution(Tag::new("INSERT").with_rows(1)))
            }
            Command::SelectCourts { venue_id } => {
                let schema = Arc::new(courts_schema());
                let rows = engine
                    .list_courts()
                    .await
                    .into_iter()
                    .filter(|c| venue_id.is_none_or(|v| c.venue_id == v))
                    .map(|c| {
                        let mut encoder = DataRowEncoder::new(schema.clone());
                        encoder.encode_field(&c.id.to_string())?;
                        encoder.encode_field(&c.venue_id.to_string())?;
                        encoder.encode_field(&c.name)?;
                        encoder.encode_field(&c.active)?;
                        Ok(encoder.take_row())
                    })
                    .collect();
                Ok(query_response(schema, rows))
            }
            Command::SelectSchedules { court_id } => {
                let schedules = engine.schedules(court_id).await.map_err(engine_err)?;
                let schema = Arc::new(schedules_schema());
                let rows = schedules
                    .iter()
                    .map(|s| {
                        let mut encoder = DataRowEncoder::new(schema.clone());
                        encoder.encode_field(&s.id.to_string())?;
                        encoder.encode_field(&s.court_id.to_string())?;
                        encoder.encode_field(&(s.day_of_week as i32))?;
                        encoder.encode_field(&fmt_time(s.range.start))?;
                        encoder.encode_field(&fmt_time(s.range.end))?;
                        encoder.encode_field(&s.price)?;
                        encoder.encode_field(&s.effective_from.to_string())?;
                        encoder.encode_field(&s.effective_to.map(|d| d.to_string()))?;
                        encoder.encode_field(&s.active)?;
                        Ok(encoder.take_row())
                    })
                    .collect();
                Ok(query_response(schema, rows))
            }
            Command::SelectAvailability { court_id, date } => {
                let slots = engine
                    .get_availability(court_id, date)
                    .await
                    .map_err(engine_err)?;
                let schema = Arc::new(availability_schema());
                let court = court_id.to_string();
                let day = date.to_string();
                let rows = slots
                    .into_iter()
                    .map(|slot| {
                        let mut encoder = DataRowEncoder::new(schema.clone());
                        encoder.encode_field(&court)?;
                        encoder.encode_field(&day)?;
                        encoder.encode_field(&fmt_time(slot.range.start))?;
                        encoder.encode_field(&fmt_time(slot.range.end))?;
                        encoder.encode_field(&slot.price)?;
                        encoder.encode_field(&slot.status.as_str().to_string())?;
                        let booking = slot.booking.as_ref();
                        encoder.encode_field(&booking.map(|b| b.id.to_string()))?;
                        encoder.encode_field(&booking.map(|b| b.status.as_str().to_string()))?;
                        encoder.encode_field(&booking.map(|b| b.holder.clone()))?;
                        encoder.encode_field(&booking.and_then(|b| b.pending_expires_at))?;
                        Ok(encoder.take_row())
                    })
                    .collect();
                Ok(query_response(schema, rows))
            }
            Command::SelectPendingHolds { venue_id, date } => {
                let holds = engine.get_pending_holds(venue_id, date).await;
                let schema = Arc::new(pending_holds_schema());
                let rows = holds
                    .into_iter()
                    .map(|h| {
                        let mut encoder = DataRowEncoder::new(schema.clone());
                        encoder.encode_field(&h.booking_id.to_string())?;
                        encoder.encode_field(&h.court_id.to_string())?;
                        encoder.encode_field(&h.user_id.map(|u| u.to_string()))?;
                        encoder.encode_field(&fmt_time(h.range.start))?;
                        encoder.encode_field(&fmt_time(h.range.end))?;
                        encoder.encode_field(&h.expires_at)?;
                        Ok(encoder.take_row())
                    })
                    .collect();
                Ok(query_response(schema, rows))
            }
            Command::SelectBooking { id } => {
                let booking = engine.get_booking(id).await.map_err(engine_err)?;
                Ok(bookings_response(std::slice::from_ref(&booking)))
            }
            Command::SelectUserBookings { user_id, status } => {
                let statuses = status.map(|s| [s]);
                let bookings = engine
                    .user_bookings(user_id, statuses.as_ref().map(|s| s.as_slice()))
                    .await;
                Ok(bookings_response(&bookings))
            }
            Command::SelectTransferListings => {
                let bookings = engine.transfer_listings().await;
                Ok(bookings_response(&bookings))
            }
            Command::Listen { channel } => {
                let venue_id = parse_channel(&channel).ok_or_else(|| {
                    PgWireError::UserError(Box::new(ErrorInfo::new(
                        "ERROR".into(),
                        "42000".into(),
                        format!("invalid channel: {channel} (expected venue_{{id}})"),
                    )))
                })?;
                let mut subs = self.subscriptions.lock().await;
                subs.entry(venue_id)
                    .or_insert_with(|| engine.notify.subscribe(venue_id));
                Ok(Response::Execution(Tag::new("LISTEN")))
            }
            Command::Unlisten { channel } => {
                // Unknown channels are a no-op, as in PostgreSQL.
                if let Some(venue_id) = parse_channel(&channel) {
                    let removed = self.subscriptions.lock().await.remove(&venue_id);
                    if let Some(rx) = removed {
                        drop(rx);
                        engine.notify.remove_if_idle(&venue_id);
                    }
                }
                Ok(Response::Execution(Tag::new("UNLISTEN")))
            }
            Command::UnlistenAll => {
                self.unlisten_all().await;
                Ok(Response::Execution(Tag::new("UNLISTEN")))
            }
        }
    }

    /// Drop every subscription held by this session.
    pub async fn unlisten_all(&self) {
        let venues: Vec<VenueId> = {
            let mut subs = self.subscriptions.lock().await;
            subs.drain().map(|(venue_id, _)| venue_id).collect()
        };
        for venue_id in venues {
            self.engine.notify.remove_if_idle(&venue_id);
        }
    }

    /// Take everything queued on this session's subscriptions.
    async fn pending_notices(&self) -> Vec<BookingNotice> {
        let mut subs = self.subscriptions.lock().await;
        let mut out = Vec::new();
        for (venue_id, rx) in subs.iter_mut() {
            loop {
                match rx.try_recv() {
                    Ok(notice) => out.push(notice),
                    Err(TryRecvError::Lagged(missed)) => {
                        tracing::warn!("listener on venue {venue_id} lagged, {missed} notices lost");
                    }
                    Err(TryRecvError::Empty) | Err(TryRecvError::Closed) => break,
                }
            }
        }
        out
    }

    /// Push queued notices to the client ahead of the next result.
    async fn deliver_notices<C>(&self, client: &mut C) -> PgWireResult<()>
    where
        C: Sink<PgWireBackendMessage> + Unpin + Send,
        PgWireError: From<C::Error>,
    {
        for notice in self.pending_notices().await {
            let message = NotificationResponse::new(
                0,
                channel_name(&notice.venue_id),
                notice.to_json(),
            );
            client
                .send(PgWireBackendMessage::NotificationResponse(message))
                .await?;
        }
        Ok(())
    }
}

fn booking_request(new: NewBooking) -> PgWireResult<BookingRequest> {
    let holder =
        Holder::from_parts(new.user_id, new.guest_name, new.guest_phone).map_err(engine_err)?;
    Ok(BookingRequest {
        id: new.id,
        court_id: new.court_id,
        date: new.date,
        range: new.range,
        holder,
        price_override: new.price,
    })
}

fn fmt_time(t: chrono::NaiveTime) -> String {
    t.format("%H:%M").to_string()
}

fn query_response(schema: Arc<Vec<FieldInfo>>, rows: Vec<PgWireResult<DataRow>>) -> Response {
    Response::Query(QueryResponse::new(schema, stream::iter(rows)))
}

fn bookings_response(bookings: &[Booking]) -> Response {
    let schema = Arc::new(bookings_schema());
    let rows = bookings
        .iter()
        .map(|b| {
            let mut encoder = DataRowEncoder::new(schema.clone());
            encoder.encode_field(&b.id.to_string())?;
            encoder.encode_field(&b.court_id.to_string())?;
            encoder.encode_field(&b.venue_id.to_string())?;
            encoder.encode_field(&b.date.to_string())?;
            encoder.encode_field(&fmt_time(b.range.start))?;
            encoder.encode_field(&fmt_time(b.range.end))?;
            let (user_id, guest_name, guest_phone) = match &b.holder {
                Holder::RegisteredUser(id) => (Some(id.to_string()), None, None),
                Holder::Guest { name, phone } => (None, Some(name.clone()), phone.clone()),
            };
            encoder.encode_field(&user_id)?;
            encoder.encode_field(&guest_name)?;
            encoder.encode_field(&guest_phone)?;
            encoder.encode_field(&b.status.as_str().to_string())?;
            encoder.encode_field(&b.is_paid)?;
            encoder.encode_field(&b.payment_code)?;
            encoder.encode_field(&b.pending_expires_at)?;
            encoder.encode_field(&b.total_price)?;
            encoder.encode_field(&b.is_for_transfer)?;
            encoder.encode_field(&b.transfer_status.map(|s| s.as_str().to_string()))?;
            encoder.encode_field(&b.transfer_price)?;
            encoder.encode_field(&b.created_at)?;
            Ok(encoder.take_row())
        })
        .collect();
    query_response(schema, rows)
}

// ── Result schemas ───────────────────────────────────────────────

fn field(name: &str, ty: Type) -> FieldInfo {
    FieldInfo::new(name.into(), None, None, ty, FieldFormat::Text)
}

fn courts_schema() -> Vec<FieldInfo> {
    vec![
        field("id", Type::VARCHAR),
        field("venue_id", Type::VARCHAR),
        field("name", Type::VARCHAR),
        field("active", Type::BOOL),
    ]
}

fn schedules_schema() -> Vec<FieldInfo> {
    vec![
        field("id", Type::VARCHAR),
        field("court_id", Type::VARCHAR),
        field("day_of_week", Type::INT4),
        field("start_time", Type::VARCHAR),
        field("end_time", Type::VARCHAR),
        field("price", Type::INT8),
        field("effective_from", Type::VARCHAR),
        field("effective_to", Type::VARCHAR),
        field("active", Type::BOOL),
    ]
}

fn availability_schema() -> Vec<FieldInfo> {
    vec![
        field("court_id", Type::VARCHAR),
        field("date", Type::VARCHAR),
        field("start_time", Type::VARCHAR),
        field("end_time", Type::VARCHAR),
        field("price", Type::INT8),
        field("status", Type::VARCHAR),
        field("booking_id", Type::VARCHAR),
        field("booking_status", Type::VARCHAR),
        field("holder", Type::VARCHAR),
        field("pending_expires_at", Type::INT8),
    ]
}

/// Row returned for `INSERT INTO holds`.
fn hold_receipt_schema() -> Vec<FieldInfo> {
    vec![
        field("booking_id", Type::VARCHAR),
        field("payment_code", Type::VARCHAR),
        field("expires_at", Type::INT8),
        field("total_price", Type::INT8),
    ]
}

fn pending_holds_schema() -> Vec<FieldInfo> {
    vec![
        field("booking_id", Type::VARCHAR),
        field("court_id", Type::VARCHAR),
        field("user_id", Type::VARCHAR),
        field("start_time", Type::VARCHAR),
        field("end_time", Type::VARCHAR),
        field("expires_at", Type::INT8),
    ]
}

fn bookings_schema() -> Vec<FieldInfo> {
    vec![
        field("id", Type::VARCHAR),
        field("court_id", Type::VARCHAR),
        field("venue_id", Type::VARCHAR),
        field("date", Type::VARCHAR),
        field("start_time", Type::VARCHAR),
        field("end_time", Type::VARCHAR),
        field("user_id", Type::VARCHAR),
        field("guest_name", Type::VARCHAR),
        field("guest_phone", Type::VARCHAR),
        field("status", Type::VARCHAR),
        field("is_paid", Type::BOOL),
        field("payment_code", Type::VARCHAR),
        field("pending_expires_at", Type::INT8),
        field("total_price", Type::INT8),
        field("is_for_transfer", Type::BOOL),
        field("transfer_status", Type::VARCHAR),
        field("transfer_price", Type::INT8),
        field("created_at", Type::INT8),
    ]
}

/// Row layout a statement will produce, judged from its text. Used to
/// describe prepared statements before any parameters are bound.
fn result_schema(sql: &str) -> Vec<FieldInfo> {
    let upper = sql.to_uppercase();
    let mut words = upper.split_whitespace();
    if let (Some("INSERT"), Some("INTO"), Some(table)) = (words.next(), words.next(), words.next()) {
        return if table.trim_start_matches('"').starts_with("HOLDS") {
            hold_receipt_schema()
        } else {
            vec![]
        };
    }
    if !upper.trim_start().starts_with("SELECT") {
        return vec![];
    }
    if upper.contains("PENDING_HOLDS") {
        pending_holds_schema()
    } else if upper.contains("AVAILABILITY") {
        availability_schema()
    } else if upper.contains("TRANSFER_LISTINGS") || upper.contains("BOOKINGS") {
        bookings_schema()
    } else if upper.contains("SCHEDULES") {
        schedules_schema()
    } else if upper.contains("COURTS") {
        courts_schema()
    } else {
        vec![]
    }
}

#[async_trait]
impl SimpleQueryHandler for CourtsideHandler {
    async fn do_query<C>(&self, client: &mut C, query: &str) -> PgWireResult<Vec<Response>>
    where
        C: ClientInfo + ClientPortalStore + Sink<PgWireBackendMessage> + Unpin + Send + Sync,
        C::Error: Debug,
        PgWireError: From<C::Error>,
    {
        self.deliver_notices(client).await?;
        Ok(vec![self.run(query).await?])
    }
}

// ── Extended Query Protocol ──────────────────────────────────────

#[derive(Debug)]
pub struct CourtsideQueryParser;

#[async_trait]
impl QueryParser for CourtsideQueryParser {
    type Statement = String;

    async fn parse_sql<C>(
        &self,
        _client: &C,
        sql: &str,
        _types: &[Option<Type>],
    ) -> PgWireResult<String>
    where
        C: ClientInfo + Unpin + Send + Sync,
    {
        Ok(sql.to_string())
    }

    fn get_parameter_types(&self, stmt: &String) -> PgWireResult<Vec<Type>> {
        Ok(vec![Type::VARCHAR; count_params(stmt)])
    }

    fn get_result_schema(
        &self,
        stmt: &String,
        _column_format: Option<&Format>,
    ) -> PgWireResult<Vec<FieldInfo>> {
        Ok(result_schema(stmt))
    }
}

#[async_trait]
impl ExtendedQueryHandler for CourtsideHandler {
    type Statement = String;
    type QueryParser = CourtsideQueryParser;

    fn query_parser(&self) -> Arc<Self::QueryParser> {
        self.query_parser.clone()
    }

    async fn do_query<C>(
        &self,
        client: &mut C,
        portal: &Portal<Self::Statement>,
        _max_rows: usize,
    ) -> PgWireResult<Response>
    where
        C: ClientInfo + ClientPortalStore + Sink<PgWireBackendMessage> + Unpin + Send + Sync,
        C::PortalStore: PortalStore<Statement = Self::Statement>,
        C::Error: Debug,
        PgWireError: From<C::Error>,
    {
        self.deliver_notices(client).await?;
        let sql = substitute_params(portal);
        self.run(&sql).await
    }

    async fn do_describe_statement<C>(
        &self,
        _client: &mut C,
        target: &StoredStatement<Self::Statement>,
    ) -> PgWireResult<DescribeStatementResponse>
    where
        C: ClientInfo + ClientPortalStore + Sink<PgWireBackendMessage> + Unpin + Send + Sync,
        C::PortalStore: PortalStore<Statement = Self::Statement>,
        C::Error: Debug,
        PgWireError: From<C::Error>,
    {
        let param_types = vec![Type::VARCHAR; count_params(&target.statement)];
        Ok(DescribeStatementResponse::new(
            param_types,
            result_schema(&target.statement),
        ))
    }

    async fn do_describe_portal<C>(
        &self,
        _client: &mut C,
        target: &Portal<Self::Statement>,
    ) -> PgWireResult<DescribePortalResponse>
    where
        C: ClientInfo + ClientPortalStore + Sink<PgWireBackendMessage> + Unpin + Send + Sync,
        C::PortalStore: PortalStore<Statement = Self::Statement>,
        C::Error: Debug,
        PgWireError: From<C::Error>,
    {
        Ok(DescribePortalResponse::new(result_schema(
            &target.statement.statement,
        )))
    }
}

/// Highest `$N` placeholder in the statement.
fn count_params(sql: &str) -> usize {
    let bytes = sql.as_bytes();
    let mut max = 0usize;
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] != b'$' {
            i += 1;
            continue;
        }
        i += 1;
        let start = i;
        while i < bytes.len() && bytes[i].is_ascii_digit() {
            i += 1;
        }
        if let Ok(n) = sql[start..i].parse::<usize>() {
            max = max.max(n);
        }
    }
    max
}

/// Inline bound parameters as quoted text literals. Highest index first so
/// `$1` never clobbers the prefix of `$10`.
fn substitute_params(portal: &Portal<String>) -> String {
    let mut sql = portal.statement.statement.clone();
    for (i, param) in portal.parameters.iter().enumerate().rev() {
        let value = match param {
            Some(bytes) => format!("'{}'", String::from_utf8_lossy(bytes).replace('\'', "''")),
            None => "NULL".to_string(),
        };
        sql = sql.replace(&format!("${}", i + 1), &value);
    }
    sql
}

// ── Factory ──────────────────────────────────────────────────────

pub struct CourtsideFactory {
    handler: Arc<CourtsideHandler>,
    auth_handler: Arc<
        CleartextPasswordAuthStartupHandler<CourtsideAuthSource, DefaultServerParameterProvider>,
    >,
    noop: Arc<NoopHandler>,
}

impl CourtsideFactory {
    pub fn new(engine: Arc<Engine>, password: String) -> Self {
        let auth_source = CourtsideAuthSource::new(password);
        Self {
            handler: Arc::new(CourtsideHandler::new(engine)),
            auth_handler: Arc::new(CleartextPasswordAuthStartupHandler::new(
                auth_source,
                DefaultServerParameterProvider::default(),
            )),
            noop: Arc::new(NoopHandler),
        }
    }
}

impl PgWireServerHandlers for CourtsideFactory {
    fn simple_query_handler(&self) -> Arc<impl SimpleQueryHandler> {
        self.handler.clone()
    }

    fn extended_query_handler(&self) -> Arc<impl ExtendedQueryHandler> {
        self.handler.clone()
    }

    fn startup_handler(&self) -> Arc<impl StartupHandler> {
        self.auth_handler.clone()
    }

    fn copy_handler(&self) -> Arc<impl CopyHandler> {
        self.noop.clone()
    }
}

/// Serve one client until it disconnects.
pub async fn process_connection(
    socket: TcpStream,
    engine: Arc<Engine>,
    password: String,
    tls: Option<TlsAcceptor>,
) -> io::Result<()> {
    let factory = CourtsideFactory::new(engine, password);
    let handler = factory.handler.clone();
    let result = pgwire::tokio::process_socket(socket, tls, factory).await;
    handler.unlisten_all().await;
    result
}

// ── Error mapping ────────────────────────────────────────────────

/// SQLSTATE for an engine error.
fn sqlstate(e: &EngineError) -> &'static str {
    match e {
        EngineError::SlotConflict { .. } => "23P01",
        EngineError::NotFound(_) => "P0002",
        EngineError::AlreadyExists(_) => "23505",
        EngineError::InvalidHolder(_)
        | EngineError::InvalidSlot(_)
        | EngineError::NoPricing { .. }
        | EngineError::LimitExceeded(_)
        | EngineError::ScheduleOverlap(_) => "22023",
        EngineError::HoldExpired { .. } => "55000",
        _ => "P0001",
    }
}

fn engine_err(e: EngineError) -> PgWireError {
    if !e.is_recoverable() {
        tracing::error!("engine failure: {e}");
    }
    PgWireError::UserError(Box::new(ErrorInfo::new(
        "ERROR".into(),
        sqlstate(&e).into(),
        e.to_string(),
    )))
}

fn sql_err(e: SqlError) -> PgWireError {
    PgWireError::UserError(Box::new(ErrorInfo::new(
        "ERROR".into(),
        "42601".into(),
        e.to_string(),
    )))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;
    use ulid::Ulid;

    #[test]
    fn params_counted_by_highest_index() {
        assert_eq!(count_params("SELECT * FROM bookings WHERE id = $1"), 1);
        assert_eq!(count_params("INSERT INTO holds VALUES ($1, $2, $10, $3)"), 10);
        assert_eq!(count_params("SELECT * FROM transfer_listings"), 0);
        assert_eq!(count_params("price $ 5"), 0);
    }

    #[test]
    fn sqlstate_per_error_kind() {
        let id = Ulid::new();
        let date = NaiveDate::from_ymd_opt(2026, 3, 1).unwrap();
        let range = TimeRange::new(
            chrono::NaiveTime::from_hms_opt(18, 0, 0).unwrap(),
            chrono::NaiveTime::from_hms_opt(19, 0, 0).unwrap(),
        )
        .unwrap();
        let conflict = EngineError::SlotConflict {
            court_id: id,
            date,
            range,
            conflicting: id,
        };
        assert_eq!(sqlstate(&conflict), "23P01");
        assert_eq!(sqlstate(&EngineError::NotFound(id)), "P0002");
        assert_eq!(sqlstate(&EngineError::InvalidSlot("x")), "22023");
        assert_eq!(
            sqlstate(&EngineError::NoPricing { court_id: id, date, range }),
            "22023"
        );
        assert_eq!(
            sqlstate(&EngineError::HoldExpired { id, expired_at: 0 }),
            "55000"
        );
        assert_eq!(sqlstate(&EngineError::HasBookings(id)), "P0001");
        assert_eq!(sqlstate(&EngineError::AlreadyExists(id)), "23505");
    }

    #[test]
    fn schema_follows_selected_table() {
        let names = |sql: &str| -> Vec<String> {
            result_schema(sql).iter().map(|f| f.name().to_string()).collect()
        };
        assert_eq!(names("SELECT * FROM pending_holds WHERE venue_id = $1")[0], "booking_id");
        assert_eq!(names("select * from availability where court_id = $1")[5], "status");
        assert_eq!(names("SELECT * FROM bookings WHERE id = $1").len(), 18);
        assert_eq!(names("SELECT * FROM courts").len(), 4);
        assert!(names("INSERT INTO bookings (hold_id, user_id) VALUES ($1, $2)").is_empty());
        assert_eq!(
            names("insert into holds (id, court_id, date, start_time, end_time, user_id) values ($1, $2, $3, $4, $5, $6)"),
            ["booking_id", "payment_code", "expires_at", "total_price"]
        );
    }

    #[test]
    fn guest_request_from_row() {
        let new = NewBooking {
            id: Ulid::new(),
            court_id: Ulid::new(),
            date: NaiveDate::from_ymd_opt(2026, 3, 1).unwrap(),
            range: TimeRange::new(
                chrono::NaiveTime::from_hms_opt(18, 0, 0).unwrap(),
                chrono::NaiveTime::from_hms_opt(19, 0, 0).unwrap(),
            )
            .unwrap(),
            user_id: None,
            guest_name: Some("Lan".into()),
            guest_phone: None,
            price: Some(80_000),
        };
        let req = booking_request(new.clone()).unwrap();
        assert_eq!(req.holder, Holder::Guest { name: "Lan".into(), phone: None });
        assert_eq!(req.price_override, Some(80_000));

        let nobody = NewBooking { guest_name: None, ..new };
        assert!(booking_request(nobody).is_err());
    }
}
