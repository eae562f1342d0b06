use std::fmt::Debug;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use futures::Sink;
use futures::stream;
use pgwire::api::auth::cleartext::CleartextPasswordAuthStartupHandler;
use pgwire::api::auth::{DefaultServerParameterProvider, StartupHandler};
use pgwire::api::copy::CopyHandler;
use pgwire::api::portal::{Format, Portal};
use pgwire::api::query::{ExtendedQueryHandler, SimpleQueryHandler};
use pgwire::api::results::{
    DataRowEncoder, DescribePortalResponse, DescribeStatementResponse, FieldFormat, FieldInfo,
    QueryResponse, Response,
};
use pgwire::api::stmt::{QueryParser, StoredStatement};
use pgwire::api::store::PortalStore;
use pgwire::api::{ClientInfo, ClientPortalStore, NoopHandler, PgWireServerHandlers, Type};
use pgwire::error::{ErrorInfo, PgWireError, PgWireResult};
use pgwire::messages::PgWireBackendMessage;
use pgwire::tokio::TlsAcceptor;
use tokio::net::TcpStream;

use crate::auth::SlotbookAuthSource;
use crate::engine::{Engine, EngineError, decode_blocked_dates, decode_booked_slots};
use crate::model::*;
use crate::observability;
use crate::sql::{self, BookingFilter, Command, SqlError};

/// What an engine call produced, before it is encoded as rows.
enum Output {
    Receipt(BookingReceipt),
    Availability(AvailabilitySettings),
    Bookings(Vec<BookingRecord>),
    Drift(Vec<SlotDrift>),
}

async fn run_command(engine: &Engine, cmd: Command) -> Result<Output, EngineError> {
    match cmd {
        Command::InsertBooking { draft } => engine.reserve_and_book(draft).await.map(Output::Receipt),
        Command::SelectAvailability => engine.load().await.map(Output::Availability),
        Command::UpdateAvailability {
            fully_booked_dates,
            booked_slots,
            max_capacity_per_slot,
        } => {
            let update = AvailabilityUpdate {
                fully_booked_dates: fully_booked_dates.as_ref().map(decode_blocked_dates).transpose()?,
                booked_slots: booked_slots.as_ref().map(decode_booked_slots).transpose()?,
                max_capacity_per_slot,
            };
            engine.save(update).await.map(Output::Availability)
        }
        Command::SelectBookings { filter } => {
            let rows = match filter {
                BookingFilter::All => engine.bookings().await,
                BookingFilter::Id(id) => engine.booking(id).await.into_iter().collect(),
                BookingFilter::Slot(slot_key) => engine.bookings_for_slot(&slot_key).await,
            };
            Ok(Output::Bookings(rows))
        }
        Command::UpdateBooking { id, patch } => engine
            .patch_booking(id, patch)
            .await
            .map(|b| Output::Bookings(vec![b])),
        Command::CancelBooking { id } => engine
            .cancel_booking(id)
            .await
            .map(|b| Output::Bookings(vec![b])),
        Command::SelectSlotDrift => Ok(Output::Drift(engine.slot_drift().await)),
    }
}

pub struct SlotbookHandler {
    engine: Arc<Engine>,
    request_timeout: Duration,
    query_parser: Arc<SlotbookQueryParser>,
}

impl SlotbookHandler {
    pub fn new(engine: Arc<Engine>, request_timeout: Duration) -> Self {
        Self {
            engine,
            request_timeout,
            query_parser: Arc::new(SlotbookQueryParser),
        }
    }

    /// Run one command on its own task. A request that outlives the timeout is
    /// reported to the client as outcome-unknown but keeps running, so its
    /// transaction still commits or rolls back as a whole.
    async fn execute_command(&self, cmd: Command) -> PgWireResult<Response> {
        let label = observability::command_label(&cmd);
        let started = Instant::now();
        let engine = self.engine.clone();
        let task = tokio::spawn(async move { run_command(&engine, cmd).await });

        let result = match tokio::time::timeout(self.request_timeout, task).await {
            Ok(Ok(result)) => result.map_err(engine_err),
            Ok(Err(join_err)) => {
                tracing::error!("{label} task failed: {join_err}");
                Err(user_error("XX000", format!("internal error: {join_err}")))
            }
            Err(_) => {
                tracing::warn!(
                    "{label} exceeded {}ms, still running in background",
                    self.request_timeout.as_millis()
                );
                Err(user_error(
                    "57014",
                    format!(
                        "outcome unknown: request exceeded {}ms",
                        self.request_timeout.as_millis()
                    ),
                ))
            }
        };

        let status = if result.is_ok() { "ok" } else { "error" };
        metrics::counter!(observability::QUERIES_TOTAL, "command" => label, "status" => status)
            .increment(1);
        metrics::histogram!(observability::QUERY_DURATION_SECONDS, "command" => label)
            .record(started.elapsed().as_secs_f64());

        result.and_then(encode_output)
    }
}

// ── Row encoding ─────────────────────────────────────────────────

fn text_field(name: &str) -> FieldInfo {
    FieldInfo::new(name.into(), None, None, Type::VARCHAR, FieldFormat::Text)
}

fn int_field(name: &str) -> FieldInfo {
    FieldInfo::new(name.into(), None, None, Type::INT8, FieldFormat::Text)
}

fn float_field(name: &str) -> FieldInfo {
    FieldInfo::new(name.into(), None, None, Type::FLOAT8, FieldFormat::Text)
}

fn receipt_schema() -> Vec<FieldInfo> {
    vec![
        int_field("booking_id"),
        text_field("slot_key"),
        int_field("capacity"),
        int_field("used"),
        int_field("remaining"),
    ]
}

fn availability_schema() -> Vec<FieldInfo> {
    vec![
        text_field("fully_booked_dates"),
        text_field("booked_slots"),
        int_field("max_capacity_per_slot"),
        int_field("updated_at"),
    ]
}

fn booking_schema() -> Vec<FieldInfo> {
    vec![
        int_field("id"),
        text_field("fullname"),
        text_field("whatsapp"),
        text_field("service"),
        text_field("address"),
        float_field("lat"),
        float_field("lng"),
        text_field("schedule_date"),
        text_field("schedule_time"),
        text_field("slot_key"),
        text_field("status"),
        int_field("arrival_time"),
        int_field("start_time"),
        int_field("end_time"),
        int_field("work_duration_minutes"),
        text_field("technician_note"),
        int_field("additional_cost"),
        int_field("created_at"),
        int_field("updated_at"),
    ]
}

fn drift_schema() -> Vec<FieldInfo> {
    vec![text_field("slot_key"), int_field("counter"), int_field("ledger")]
}

fn encode_output(output: Output) -> PgWireResult<Response> {
    match output {
        Output::Receipt(receipt) => {
            let schema = Arc::new(receipt_schema());
            let mut encoder = DataRowEncoder::new(schema.clone());
            encoder.encode_field(&(receipt.booking_id as i64))?;
            encoder.encode_field(&receipt.slot_key.to_string())?;
            encoder.encode_field(&i64::from(receipt.capacity))?;
            encoder.encode_field(&i64::from(receipt.used))?;
            encoder.encode_field(&i64::from(receipt.remaining))?;
            let rows = vec![Ok(encoder.take_row())];
            Ok(Response::Query(QueryResponse::new(schema, stream::iter(rows))))
        }
        Output::Availability(settings) => {
            let schema = Arc::new(availability_schema());
            let dates = serde_json::to_string(&settings.fully_booked_dates).map_err(internal)?;
            let slots = serde_json::to_string(&settings.booked_slots).map_err(internal)?;
            let mut encoder = DataRowEncoder::new(schema.clone());
            encoder.encode_field(&dates)?;
            encoder.encode_field(&slots)?;
            encoder.encode_field(&i64::from(settings.max_capacity_per_slot))?;
            encoder.encode_field(&settings.updated_at)?;
            let rows = vec![Ok(encoder.take_row())];
            Ok(Response::Query(QueryResponse::new(schema, stream::iter(rows))))
        }
        Output::Bookings(bookings) => {
            let schema = Arc::new(booking_schema());
            let rows: Vec<PgWireResult<_>> = bookings
                .into_iter()
                .map(|b| {
                    let mut encoder = DataRowEncoder::new(schema.clone());
                    encoder.encode_field(&(b.id as i64))?;
                    encoder.encode_field(&b.fullname)?;
                    encoder.encode_field(&b.whatsapp)?;
                    encoder.encode_field(&b.service)?;
                    encoder.encode_field(&b.address)?;
                    encoder.encode_field(&b.lat)?;
                    encoder.encode_field(&b.lng)?;
                    encoder.encode_field(&b.schedule_date)?;
                    encoder.encode_field(&b.schedule_time)?;
                    encoder.encode_field(&b.slot_key.to_string())?;
                    encoder.encode_field(&b.status)?;
                    encoder.encode_field(&b.arrival_time)?;
                    encoder.encode_field(&b.start_time)?;
                    encoder.encode_field(&b.end_time)?;
                    encoder.encode_field(&b.work_duration_minutes.map(i64::from))?;
                    encoder.encode_field(&b.technician_note)?;
                    encoder.encode_field(&b.additional_cost)?;
                    encoder.encode_field(&b.created_at)?;
                    encoder.encode_field(&b.updated_at)?;
                    Ok(encoder.take_row())
                })
                .collect();
            Ok(Response::Query(QueryResponse::new(schema, stream::iter(rows))))
        }
        Output::Drift(drift) => {
            let schema = Arc::new(drift_schema());
            let rows: Vec<PgWireResult<_>> = drift
                .into_iter()
                .map(|d| {
                    let mut encoder = DataRowEncoder::new(schema.clone());
                    encoder.encode_field(&d.slot_key.to_string())?;
                    encoder.encode_field(&i64::from(d.counter))?;
                    encoder.encode_field(&i64::from(d.ledger))?;
                    Ok(encoder.take_row())
                })
                .collect();
            Ok(Response::Query(QueryResponse::new(schema, stream::iter(rows))))
        }
    }
}

/// Result columns for a statement, by table and verb. Statements may still
/// hold `$n` placeholders here, so this does not go through the parser.
fn schema_for(sql: &str) -> Vec<FieldInfo> {
    let upper = sql.trim_start().to_uppercase();
    if upper.starts_with("INSERT") {
        receipt_schema()
    } else if upper.contains("SLOT_DRIFT") {
        drift_schema()
    } else if upper.contains("BOOKINGS") {
        booking_schema()
    } else if upper.contains("AVAILABILITY") {
        availability_schema()
    } else {
        vec![]
    }
}

#[async_trait]
impl SimpleQueryHandler for SlotbookHandler {
    async fn do_query<C>(
        &self,
        _client: &mut C,
        query: &str,
    ) -> PgWireResult<Vec<Response>>
    where
        C: ClientInfo + ClientPortalStore + Sink<PgWireBackendMessage> + Unpin + Send + Sync,
        C::Error: Debug,
        PgWireError: From<C::Error>,
    {
        let cmd = sql::parse_sql(query).map_err(sql_err)?;
        Ok(vec![self.execute_command(cmd).await?])
    }
}

// ── Extended Query Protocol ──────────────────────────────────────

#[derive(Debug)]
pub struct SlotbookQueryParser;

#[async_trait]
impl QueryParser for SlotbookQueryParser {
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
        Ok(schema_for(stmt))
    }
}

#[async_trait]
impl ExtendedQueryHandler for SlotbookHandler {
    type Statement = String;
    type QueryParser = SlotbookQueryParser;

    fn query_parser(&self) -> Arc<Self::QueryParser> {
        self.query_parser.clone()
    }

    async fn do_query<C>(
        &self,
        _client: &mut C,
        portal: &Portal<Self::Statement>,
        _max_rows: usize,
    ) -> PgWireResult<Response>
    where
        C: ClientInfo + ClientPortalStore + Sink<PgWireBackendMessage> + Unpin + Send + Sync,
        C::PortalStore: PortalStore<Statement = Self::Statement>,
        C::Error: Debug,
        PgWireError: From<C::Error>,
    {
        let sql = substitute_params(portal);
        let cmd = sql::parse_sql(&sql).map_err(sql_err)?;
        self.execute_command(cmd).await
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
            schema_for(&target.statement),
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
        Ok(DescribePortalResponse::new(schema_for(
            &target.statement.statement,
        )))
    }
}

/// Count the highest $N parameter placeholder outside string literals.
fn count_params(sql: &str) -> usize {
    let mut max = 0;
    scan_placeholders(sql, |piece| {
        if let Piece::Param(n) = piece {
            max = max.max(n);
        }
    });
    max
}

/// Substitute $1, $2, ... placeholders with bound parameter values (text format).
fn substitute_params(portal: &Portal<String>) -> String {
    bind_params(&portal.statement.statement, &portal.parameters[..])
}

/// Single pass over the statement text. Bound values are emitted as quoted
/// literals and never scanned again, so a value containing `$1` stays text.
fn bind_params<B: AsRef<[u8]>>(sql: &str, params: &[Option<B>]) -> String {
    let mut out = String::with_capacity(sql.len());
    scan_placeholders(sql, |piece| match piece {
        Piece::Text(text) => out.push_str(text),
        Piece::Param(n) => match n.checked_sub(1).and_then(|i| params.get(i)) {
            Some(Some(bytes)) => {
                let text = String::from_utf8_lossy(bytes.as_ref());
                out.push('\'');
                out.push_str(&text.replace('\'', "''"));
                out.push('\'');
            }
            Some(None) => out.push_str("NULL"),
            // Unbound placeholder: leave it for the parser to reject.
            None => {
                out.push('$');
                out.push_str(&n.to_string());
            }
        },
    });
    out
}

enum Piece<'a> {
    Text(&'a str),
    Param(usize),
}

/// Split `sql` into literal text and `$N` placeholders. Anything inside a
/// single-quoted literal is text.
fn scan_placeholders<'a>(sql: &'a str, mut emit: impl FnMut(Piece<'a>)) {
    let bytes = sql.as_bytes();
    let mut in_quote = false;
    let mut text_start = 0;
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'\'' => {
                in_quote = !in_quote;
                i += 1;
            }
            b'$' if !in_quote => {
                let digits = i + 1;
                let mut end = digits;
                while end < bytes.len() && bytes[end].is_ascii_digit() {
                    end += 1;
                }
                match sql[digits..end].parse::<usize>() {
                    Ok(n) if end > digits => {
                        emit(Piece::Text(&sql[text_start..i]));
                        emit(Piece::Param(n));
                        text_start = end;
                        i = end;
                    }
                    _ => i += 1,
                }
            }
            _ => i += 1,
        }
    }
    emit(Piece::Text(&sql[text_start..]));
}

// ── Factory ──────────────────────────────────────────────────────

pub struct SlotbookFactory {
    handler: Arc<SlotbookHandler>,
    auth_handler:
        Arc<CleartextPasswordAuthStartupHandler<SlotbookAuthSource, DefaultServerParameterProvider>>,
    noop: Arc<NoopHandler>,
}

impl SlotbookFactory {
    pub fn new(engine: Arc<Engine>, password: String, request_timeout: Duration) -> Self {
        let auth_source = SlotbookAuthSource::new(password);
        let param_provider = DefaultServerParameterProvider::default();
        Self {
            handler: Arc::new(SlotbookHandler::new(engine, request_timeout)),
            auth_handler: Arc::new(CleartextPasswordAuthStartupHandler::new(
                auth_source,
                param_provider,
            )),
            noop: Arc::new(NoopHandler),
        }
    }
}

impl PgWireServerHandlers for SlotbookFactory {
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

/// Serve one client connection until it closes.
pub async fn process_connection(
    socket: TcpStream,
    engine: Arc<Engine>,
    password: String,
    tls: Option<TlsAcceptor>,
    request_timeout: Duration,
) -> std::io::Result<()> {
    let factory = Arc::new(SlotbookFactory::new(engine, password, request_timeout));
    pgwire::tokio::process_socket(socket, tls, factory).await
}

// ── Errors ───────────────────────────────────────────────────────

fn user_error(code: &str, message: String) -> PgWireError {
    PgWireError::UserError(Box::new(ErrorInfo::new(
        "ERROR".into(),
        code.into(),
        message,
    )))
}

fn internal(e: impl std::fmt::Display) -> PgWireError {
    user_error("XX000", e.to_string())
}

/// SQLSTATE for an engine error. Business outcomes share 23514 and are told
/// apart by the reason code at the start of the message.
pub fn sqlstate(e: &EngineError) -> &'static str {
    match e {
        EngineError::SlotUnavailable { .. } => "23514",
        EngineError::InvalidFormat(_) => "22023",
        EngineError::NotFound(_) => "P0002",
        EngineError::AlreadyCancelled(_) | EngineError::IllegalTransition(_) => "55000",
        EngineError::Transient(_) => "08006",
        EngineError::WalError(_) => "XX000",
        EngineError::InvariantViolation(_) => "XX001",
        EngineError::LimitExceeded(_) => "54000",
    }
}

fn engine_err(e: EngineError) -> PgWireError {
    match &e {
        EngineError::WalError(_) | EngineError::Transient(_) => tracing::error!("{e}"),
        EngineError::InvariantViolation(_) => {}
        _ => tracing::debug!(kind = e.kind(), "{e}"),
    }
    user_error(sqlstate(&e), e.to_string())
}

fn sql_err(e: SqlError) -> PgWireError {
    let code = match e {
        SqlError::InvalidValue(_) => "22023",
        SqlError::TooLong(_) => "54000",
        _ => "42601",
    };
    user_error(code, e.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn count_params_finds_highest_placeholder() {
        assert_eq!(count_params("SELECT * FROM bookings"), 0);
        assert_eq!(count_params("SELECT * FROM bookings WHERE id = $1"), 1);
        assert_eq!(
            count_params("UPDATE bookings SET status = $2, technician_note = $10 WHERE id = $1"),
            10
        );
    }

    #[test]
    fn placeholders_inside_literals_are_not_counted() {
        assert_eq!(count_params("SELECT * FROM bookings WHERE address = '$3'"), 0);
        assert_eq!(count_params("UPDATE bookings SET technician_note = 'it''s $2' WHERE id = $1"), 1);
    }

    #[test]
    fn bound_values_are_not_rescanned() {
        let sql = "UPDATE bookings SET technician_note = $2 WHERE id = $1";
        assert_eq!(
            bind_params(sql, &[Some("1"), Some("customer paid $10 cash")]),
            "UPDATE bookings SET technician_note = 'customer paid $10 cash' WHERE id = '1'"
        );
        // A value that tries to close the literal stays inside it.
        assert_eq!(
            bind_params(sql, &[Some("$2"), Some("x' OR '1'='1")]),
            "UPDATE bookings SET technician_note = 'x'' OR ''1''=''1' WHERE id = '$2'"
        );
    }

    #[test]
    fn bind_handles_null_and_wide_indexes() {
        let mut params: Vec<Option<&str>> = vec![None; 10];
        params[0] = Some("a");
        params[9] = Some("j");
        assert_eq!(bind_params("SELECT $1, $10, $2", &params), "SELECT 'a', 'j', NULL");
        assert_eq!(bind_params("SELECT $11, $", &params), "SELECT $11, $");
    }

    #[test]
    fn schema_follows_table_and_verb() {
        let names = |sql: &str| -> Vec<String> {
            schema_for(sql).iter().map(|f| f.name().to_string()).collect()
        };
        assert_eq!(names("INSERT INTO bookings (fullname) VALUES ($1)")[0], "booking_id");
        assert_eq!(names("select * from availability")[2], "max_capacity_per_slot");
        assert_eq!(names("UPDATE bookings SET status = $1 WHERE id = $2")[0], "id");
        assert_eq!(names("SELECT * FROM slot_drift").len(), 3);
        assert!(names("SHOW server_version").is_empty());
    }

    #[test]
    fn business_outcomes_share_sqlstate_with_distinct_codes() {
        let key = SlotKey::parse("2025-06-01-10:00").unwrap();
        let snapshot = SlotSnapshot {
            capacity: 2,
            used: 2,
            remaining: 0,
        };
        let full = EngineError::SlotUnavailable {
            slot_key: key.clone(),
            reason: UnavailableReason::Full,
            snapshot,
        };
        let blocked = EngineError::SlotUnavailable {
            slot_key: key,
            reason: UnavailableReason::DateBlocked,
            snapshot,
        };
        assert_eq!(sqlstate(&full), "23514");
        assert_eq!(sqlstate(&blocked), "23514");
        assert!(full.to_string().starts_with("SLOT_FULL"));
        assert!(blocked.to_string().starts_with("DATE_NOT_AVAILABLE"));
    }

    #[test]
    fn outcome_unknown_errors_are_not_retryable_codes() {
        assert_eq!(sqlstate(&EngineError::Transient("busy".into())), "08006");
        assert_eq!(sqlstate(&EngineError::WalError("disk".into())), "XX000");
        assert_eq!(sqlstate(&EngineError::NotFound(9)), "P0002");
        assert_eq!(sqlstate(&EngineError::AlreadyCancelled(9)), "55000");
    }
}
