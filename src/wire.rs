use std::fmt::Debug;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use futures::stream;
use futures::Sink;
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
use pgwire::tokio::TlsAcceptor;
use tokio::net::TcpStream;

use crate::auth::RentdAuthSource;
use crate::model::*;
use crate::observability;
use crate::payment::PaymentError;
use crate::sql::{self, Command};
use crate::tenant::{Agency, AgencyManager};

pub struct RentdHandler {
    agencies: Arc<AgencyManager>,
    query_parser: Arc<RentdQueryParser>,
}

impl RentdHandler {
    pub fn new(agencies: Arc<AgencyManager>) -> Self {
        Self {
            agencies,
            query_parser: Arc::new(RentdQueryParser),
        }
    }

    fn resolve_agency<C: ClientInfo>(&self, client: &C) -> PgWireResult<Arc<Agency>> {
        let db = client
            .metadata()
            .get("database")
            .cloned()
            .unwrap_or_else(|| "default".to_string());
        self.agencies.get_or_create(&db).map_err(|e| {
            PgWireError::UserError(Box::new(ErrorInfo::new(
                "ERROR".into(),
                "08006".into(),
                format!("agency error: {e}"),
            )))
        })
    }

    async fn execute_instrumented(
        &self,
        agency: &Agency,
        cmd: Command,
    ) -> PgWireResult<Vec<Response>> {
        let label = observability::command_label(&cmd);
        let start = Instant::now();
        let result = self.execute_command(agency, cmd).await;
        metrics::histogram!(observability::QUERY_DURATION_SECONDS, "command" => label)
            .record(start.elapsed().as_secs_f64());
        let status = if result.is_ok() { "ok" } else { "error" };
        metrics::counter!(observability::QUERIES_TOTAL, "command" => label, "status" => status)
            .increment(1);
        result
    }

    async fn execute_command(&self, agency: &Agency, cmd: Command) -> PgWireResult<Vec<Response>> {
        let engine = &agency.engine;
        match cmd {
            Command::InsertVehicle {
                id,
                name,
                rate_per_day,
                available,
            } => {
                engine
                    .add_vehicle(id, name, rate_per_day, available)
                    .await
                    .map_err(engine_err)?;
                Ok(vec![Response::Execution(Tag::new("INSERT").with_rows(1))])
            }
            Command::UpdateVehicle {
                id,
                name,
                rate_per_day,
                available,
            } => {
                engine
                    .update_vehicle(id, name, rate_per_day, available)
                    .await
                    .map_err(engine_err)?;
                Ok(vec![Response::Execution(Tag::new("UPDATE").with_rows(1))])
            }
            Command::DeleteVehicle { id } => {
                engine.remove_vehicle(id).await.map_err(engine_err)?;
                Ok(vec![Response::Execution(Tag::new("DELETE").with_rows(1))])
            }
            Command::SelectVehicles => {
                let vehicles = engine.list_vehicles().await;
                let schema = Arc::new(vehicles_schema());
                let rows: Vec<PgWireResult<_>> = vehicles
                    .into_iter()
                    .map(|v| {
                        let mut encoder = DataRowEncoder::new(schema.clone());
                        encoder.encode_field(&v.id.to_string())?;
                        encoder.encode_field(&v.name)?;
                        encoder.encode_field(&v.rate_per_day.to_string())?;
                        encoder.encode_field(&bool_text(v.available))?;
                        Ok(encoder.take_row())
                    })
                    .collect();
                Ok(vec![Response::Query(QueryResponse::new(
                    schema,
                    stream::iter(rows),
                ))])
            }
            Command::InsertReservation {
                id,
                vehicle_id,
                holder,
                start,
                end,
                returning,
            } => {
                let info = engine
                    .create_reservation(id, vehicle_id, holder, Span::new(start, end))
                    .await
                    .map_err(engine_err)?;
                if returning {
                    Ok(vec![reservation_rows(vec![info])])
                } else {
                    Ok(vec![Response::Execution(Tag::new("INSERT").with_rows(1))])
                }
            }
            Command::UpdateReservationStatus { id, status } => {
                match status {
                    ReservationStatus::Confirmed => engine.confirm_reservation(id).await,
                    ReservationStatus::Cancelled => engine.cancel_reservation(id).await,
                    ReservationStatus::Completed => engine.complete_reservation(id).await,
                    // sql.rs refuses 'pending' before we get here
                    ReservationStatus::Pending => {
                        return Err(engine_err(crate::engine::EngineError::InvalidTransition {
                            from: ReservationStatus::Pending,
                            to: ReservationStatus::Pending,
                        }));
                    }
                }
                .map_err(engine_err)?;
                Ok(vec![Response::Execution(Tag::new("UPDATE").with_rows(1))])
            }
            Command::SelectReservationsByVehicle { vehicle_id } => {
                let infos = engine
                    .active_reservations(vehicle_id)
                    .await
                    .map_err(engine_err)?;
                Ok(vec![reservation_rows(infos)])
            }
            Command::SelectReservationById { id } => {
                let info = engine.get_reservation(&id).await.map_err(engine_err)?;
                Ok(vec![reservation_rows(vec![info])])
            }
            Command::SelectAvailability {
                vehicle_id,
                start,
                end,
            } => {
                let available = engine
                    .is_available(vehicle_id, Span::new(start, end))
                    .await
                    .map_err(engine_err)?;
                let schema = Arc::new(availability_schema());
                let mut encoder = DataRowEncoder::new(schema.clone());
                encoder.encode_field(&vehicle_id.to_string())?;
                encoder.encode_field(&bool_text(available))?;
                let rows = vec![Ok(encoder.take_row())];
                Ok(vec![Response::Query(QueryResponse::new(
                    schema,
                    stream::iter(rows),
                ))])
            }
            Command::SelectFreeSlots {
                vehicle_id,
                start,
                end,
                min_duration,
            } => {
                let slots = engine
                    .free_slots(vehicle_id, start, end, min_duration)
                    .await
                    .map_err(engine_err)?;
                let schema = Arc::new(free_slots_schema());
                let vid_str = vehicle_id.to_string();
                let rows: Vec<PgWireResult<_>> = slots
                    .into_iter()
                    .map(|slot| {
                        let mut encoder = DataRowEncoder::new(schema.clone());
                        encoder.encode_field(&vid_str)?;
                        encoder.encode_field(&slot.start)?;
                        encoder.encode_field(&slot.end)?;
                        Ok(encoder.take_row())
                    })
                    .collect();
                Ok(vec![Response::Query(QueryResponse::new(
                    schema,
                    stream::iter(rows),
                ))])
            }
            Command::SelectQuote {
                vehicle_id,
                start,
                end,
            } => {
                let (days, total) = engine
                    .quote_for(vehicle_id, Span::new(start, end))
                    .await
                    .map_err(engine_err)?;
                let schema = Arc::new(quotes_schema());
                let mut encoder = DataRowEncoder::new(schema.clone());
                encoder.encode_field(&vehicle_id.to_string())?;
                encoder.encode_field(&days)?;
                encoder.encode_field(&total.to_string())?;
                let rows = vec![Ok(encoder.take_row())];
                Ok(vec![Response::Query(QueryResponse::new(
                    schema,
                    stream::iter(rows),
                ))])
            }
            Command::InsertPayment { reservation_id } => {
                let record = agency
                    .payments
                    .start_checkout(reservation_id)
                    .await
                    .map_err(payment_err)?;
                Ok(vec![payment_rows(vec![record])])
            }
            Command::SelectPaymentByReservation { reservation_id } => {
                let records = agency
                    .payments
                    .record_for(&reservation_id)
                    .into_iter()
                    .collect();
                Ok(vec![payment_rows(records)])
            }
        }
    }
}

fn bool_text(b: bool) -> &'static str {
    if b { "t" } else { "f" }
}

// ── Row schemas ──────────────────────────────────────────────────

fn text_field(name: &str, ty: Type) -> FieldInfo {
    FieldInfo::new(name.into(), None, None, ty, FieldFormat::Text)
}

fn vehicles_schema() -> Vec<FieldInfo> {
    vec![
        text_field("id", Type::VARCHAR),
        text_field("name", Type::VARCHAR),
        text_field("rate_per_day", Type::NUMERIC),
        text_field("available", Type::BOOL),
    ]
}

fn reservations_schema() -> Vec<FieldInfo> {
    vec![
        text_field("id", Type::VARCHAR),
        text_field("vehicle_id", Type::VARCHAR),
        text_field("holder", Type::VARCHAR),
        text_field("start", Type::INT8),
        text_field("end", Type::INT8),
        text_field("total_price", Type::NUMERIC),
        text_field("status", Type::VARCHAR),
        text_field("created_at", Type::INT8),
    ]
}

fn availability_schema() -> Vec<FieldInfo> {
    vec![
        text_field("vehicle_id", Type::VARCHAR),
        text_field("available", Type::BOOL),
    ]
}

fn free_slots_schema() -> Vec<FieldInfo> {
    vec![
        text_field("vehicle_id", Type::VARCHAR),
        text_field("start", Type::INT8),
        text_field("end", Type::INT8),
    ]
}

fn quotes_schema() -> Vec<FieldInfo> {
    vec![
        text_field("vehicle_id", Type::VARCHAR),
        text_field("days", Type::INT8),
        text_field("total_price", Type::NUMERIC),
    ]
}

fn payments_schema() -> Vec<FieldInfo> {
    vec![
        text_field("intent_ref", Type::VARCHAR),
        text_field("reservation_id", Type::VARCHAR),
        text_field("amount", Type::NUMERIC),
        text_field("currency", Type::VARCHAR),
        text_field("status", Type::VARCHAR),
        text_field("receipt_url", Type::VARCHAR),
    ]
}

fn reservation_rows(infos: Vec<ReservationInfo>) -> Response {
    let schema = Arc::new(reservations_schema());
    let rows: Vec<PgWireResult<_>> = infos
        .into_iter()
        .map(|r| {
            let mut encoder = DataRowEncoder::new(schema.clone());
            encoder.encode_field(&r.id.to_string())?;
            encoder.encode_field(&r.vehicle_id.to_string())?;
            encoder.encode_field(&r.holder)?;
            encoder.encode_field(&r.start)?;
            encoder.encode_field(&r.end)?;
            encoder.encode_field(&r.total_price.to_string())?;
            encoder.encode_field(&r.status.as_str())?;
            encoder.encode_field(&r.created_at)?;
            Ok(encoder.take_row())
        })
        .collect();
    Response::Query(QueryResponse::new(schema, stream::iter(rows)))
}

fn payment_rows(records: Vec<crate::payment::PaymentRecord>) -> Response {
    let schema = Arc::new(payments_schema());
    let rows: Vec<PgWireResult<_>> = records
        .into_iter()
        .map(|p| {
            let mut encoder = DataRowEncoder::new(schema.clone());
            encoder.encode_field(&p.intent_ref)?;
            encoder.encode_field(&p.reservation_id.to_string())?;
            encoder.encode_field(&p.amount.to_string())?;
            encoder.encode_field(&p.currency)?;
            encoder.encode_field(&p.status.as_str())?;
            encoder.encode_field(&p.receipt_url)?;
            Ok(encoder.take_row())
        })
        .collect();
    Response::Query(QueryResponse::new(schema, stream::iter(rows)))
}

#[async_trait]
impl SimpleQueryHandler for RentdHandler {
    async fn do_query<C>(&self, client: &mut C, query: &str) -> PgWireResult<Vec<Response>>
    where
        C: ClientInfo + ClientPortalStore + Sink<PgWireBackendMessage> + Unpin + Send + Sync,
        C::Error: Debug,
        PgWireError: From<C::Error>,
    {
        let agency = self.resolve_agency(client)?;
        let cmd = sql::parse_sql(query).map_err(sql_err)?;
        self.execute_instrumented(&agency, cmd).await
    }
}

// ── Extended Query Protocol ──────────────────────────────────────

#[derive(Debug)]
pub struct RentdQueryParser;

#[async_trait]
impl QueryParser for RentdQueryParser {
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
        Ok(schema_for_statement(stmt))
    }
}

/// Best-effort Describe support: pick the row schema from the table keyword.
fn schema_for_statement(stmt: &str) -> Vec<FieldInfo> {
    let upper = stmt.to_uppercase();
    if upper.contains("FREE_SLOTS") {
        free_slots_schema()
    } else if upper.contains("AVAILABILITY") {
        availability_schema()
    } else if upper.contains("QUOTES") {
        quotes_schema()
    } else if upper.contains("PAYMENTS") && upper.starts_with("SELECT") {
        payments_schema()
    } else if upper.contains("RESERVATIONS")
        && (upper.starts_with("SELECT") || upper.contains("RETURNING"))
    {
        reservations_schema()
    } else if upper.contains("VEHICLES") && upper.starts_with("SELECT") {
        vehicles_schema()
    } else {
        vec![]
    }
}

#[async_trait]
impl ExtendedQueryHandler for RentdHandler {
    type Statement = String;
    type QueryParser = RentdQueryParser;

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
        let agency = self.resolve_agency(client)?;
        let sql = substitute_params(portal);
        let cmd = sql::parse_sql(&sql).map_err(sql_err)?;
        let mut responses = self.execute_instrumented(&agency, cmd).await?;
        Ok(responses.remove(0))
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
            schema_for_statement(&target.statement),
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
        Ok(DescribePortalResponse::new(schema_for_statement(
            &target.statement.statement,
        )))
    }
}

/// Count the highest $N parameter placeholder in the SQL string.
fn count_params(sql: &str) -> usize {
    let mut max = 0usize;
    let bytes = sql.as_bytes();
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'$' {
            i += 1;
            let start = i;
            while i < bytes.len() && bytes[i].is_ascii_digit() {
                i += 1;
            }
            if i > start {
                if let Ok(n) = sql[start..i].parse::<usize>() {
                    if n > max {
                        max = n;
                    }
                }
            }
        } else {
            i += 1;
        }
    }
    max
}

/// Substitute $1, $2, ... placeholders with bound parameter values (text format).
fn substitute_params(portal: &Portal<String>) -> String {
    let sql = portal.statement.statement.to_string();
    let params = &portal.parameters;
    let mut result = sql;

    for (i, param) in params.iter().enumerate().rev() {
        let placeholder = format!("${}", i + 1);
        let value = match param {
            Some(bytes) => {
                let text = String::from_utf8_lossy(bytes);
                format!("'{}'", text.replace('\'', "''"))
            }
            None => "NULL".to_string(),
        };
        result = result.replace(&placeholder, &value);
    }

    result
}

// ── Factory ──────────────────────────────────────────────────────

pub struct RentdFactory {
    handler: Arc<RentdHandler>,
    auth_handler:
        Arc<CleartextPasswordAuthStartupHandler<RentdAuthSource, DefaultServerParameterProvider>>,
    noop: Arc<NoopHandler>,
}

impl RentdFactory {
    pub fn new(agencies: Arc<AgencyManager>, password: String) -> Self {
        let auth_source = RentdAuthSource::new(password);
        let param_provider = DefaultServerParameterProvider::default();
        Self {
            handler: Arc::new(RentdHandler::new(agencies)),
            auth_handler: Arc::new(CleartextPasswordAuthStartupHandler::new(
                auth_source,
                param_provider,
            )),
            noop: Arc::new(NoopHandler),
        }
    }
}

impl PgWireServerHandlers for RentdFactory {
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

/// Handle one client connection until it closes.
pub async fn process_connection(
    socket: TcpStream,
    agencies: Arc<AgencyManager>,
    password: String,
    tls: Option<TlsAcceptor>,
) -> Result<(), std::io::Error> {
    let factory = RentdFactory::new(agencies, password);
    pgwire::tokio::process_socket(socket, tls, factory).await
}

// ── Error mapping ────────────────────────────────────────────────
//
// Each taxonomy entry gets its own SQLSTATE so clients can branch without
// parsing messages. Standard codes where one fits (23P01 exclusion violation
// for calendar conflicts, 23505 duplicate id, 54000 limits, 58030 I/O);
// the RV class is ours.
//
//   RV001  invalid interval          RV006  reservation not found
//   RV002  vehicle not found         RV007  checkout on cancelled
//   RV003  vehicle not bookable      RV008  already paid
//   RV005  illegal status transition RV009  unknown intent ref
//                                    RV010  processor failure

fn engine_code(e: &crate::engine::EngineError) -> &'static str {
    use crate::engine::EngineError::*;
    match e {
        InvalidInterval(_) => "RV001",
        VehicleNotFound(_) => "RV002",
        InvalidVehicleState(_) => "RV003",
        Conflict(_) => "23P01",
        InvalidTransition { .. } => "RV005",
        ReservationNotFound(_) => "RV006",
        AlreadyExists(_) => "23505",
        LimitExceeded(_) => "54000",
        WalError(_) => "58030",
    }
}

fn engine_err(e: crate::engine::EngineError) -> PgWireError {
    PgWireError::UserError(Box::new(ErrorInfo::new(
        "ERROR".into(),
        engine_code(&e).into(),
        e.to_string(),
    )))
}

fn payment_err(e: PaymentError) -> PgWireError {
    let code = match &e {
        PaymentError::ReservationNotFound(_) => "RV006",
        PaymentError::CheckoutOnCancelled(_) => "RV007",
        PaymentError::AlreadyPaid(_) => "RV008",
        PaymentError::UnknownIntent(_) => "RV009",
        PaymentError::Processor(_) => "RV010",
        PaymentError::Engine(inner) => engine_code(inner),
    };
    PgWireError::UserError(Box::new(ErrorInfo::new(
        "ERROR".into(),
        code.into(),
        e.to_string(),
    )))
}

fn sql_err(e: crate::sql::SqlError) -> PgWireError {
    PgWireError::UserError(Box::new(ErrorInfo::new(
        "ERROR".into(),
        "42601".into(),
        e.to_string(),
    )))
}
