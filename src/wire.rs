use std::fmt::Debug;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use chrono::FixedOffset;
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
use tracing::{debug, warn};

use crate::auth::AgendaAuthSource;
use crate::engine::{Engine, EngineError, LoyaltySummary};
use crate::model::*;
use crate::observability;
use crate::sql::{self, Command, SqlError};
use crate::tenant::TenantManager;

pub struct AgendaHandler {
    tenant_manager: Arc<TenantManager>,
    query_parser: Arc<AgendaQueryParser>,
}

impl AgendaHandler {
    pub fn new(tenant_manager: Arc<TenantManager>) -> Self {
        Self {
            tenant_manager,
            query_parser: Arc::new(AgendaQueryParser),
        }
    }

    fn resolve_engine<C: ClientInfo>(&self, client: &C) -> PgWireResult<Arc<Engine>> {
        let db = client
            .metadata()
            .get("database")
            .cloned()
            .unwrap_or_else(|| "default".to_string());
        self.tenant_manager
            .get_or_create(&db)
            .map_err(|e| user_error("08006", format!("business {db:?} unavailable: {e}")))
    }

    /// Run and time one parsed statement.
    async fn run(&self, engine: &Engine, cmd: Command) -> PgWireResult<Response> {
        let label = observability::command_label(&cmd);
        let started = Instant::now();
        let result = self.execute_command(engine, cmd).await;
        metrics::histogram!(observability::QUERY_DURATION_SECONDS, "command" => label)
            .record(started.elapsed().as_secs_f64());
        let status = if result.is_ok() { "ok" } else { "error" };
        metrics::counter!(observability::QUERIES_TOTAL, "command" => label, "status" => status).increment(1);
        result.map_err(engine_err)
    }

    async fn execute_command(&self, engine: &Engine, cmd: Command) -> Result<Response, EngineError> {
        let offset = engine.schedule().hours.offset();
        match cmd {
            Command::InsertService {
                name,
                price,
                duration_minutes,
            } => {
                engine
                    .register_service(Service {
                        name,
                        price,
                        duration_minutes,
                    })
                    .await?;
                Ok(Response::Execution(Tag::new("INSERT").with_rows(1)))
            }
            Command::InsertClient { id, name, rating } => {
                engine.register_client(id, name, rating).await?;
                Ok(Response::Execution(Tag::new("INSERT").with_rows(1)))
            }
            Command::InsertAppointment(req) => {
                engine.book_appointment(req).await?;
                Ok(Response::Execution(Tag::new("INSERT").with_rows(1)))
            }
            Command::UpdateStatus { id, status } => {
                engine.change_status(id, status).await?.into_result()?;
                Ok(Response::Execution(Tag::new("UPDATE").with_rows(1)))
            }
            Command::UpdateAppointment(edit) => {
                engine.update_appointment(edit).await?;
                Ok(Response::Execution(Tag::new("UPDATE").with_rows(1)))
            }
            Command::DeleteAppointment { id } => {
                engine.delete_appointment(id).await?;
                Ok(Response::Execution(Tag::new("DELETE").with_rows(1)))
            }
            Command::SelectSlots(query) => {
                let slots = engine.available_slots(query).await?;
                rows(slots_schema(), slots.iter(), |enc, s| encode_slot(enc, s, offset))
            }
            Command::SelectAppointmentsOn {
                date,
                professional_id,
            } => {
                let found = engine.appointments_on(date, professional_id).await?;
                rows(appointments_schema(), found.iter(), |enc, a| {
                    encode_appointment(enc, a, offset)
                })
            }
            Command::SelectClientAppointments { client_id } => {
                let found = engine.appointments_for_client(client_id).await?;
                rows(appointments_schema(), found.iter(), |enc, a| {
                    encode_appointment(enc, a, offset)
                })
            }
            Command::SelectLoyalty { client_id } => {
                let summary = engine.loyalty_for_client(client_id).await?;
                let client_id = client_id.to_string();
                rows(loyalty_schema(), std::iter::once(&summary), |enc, s| {
                    encode_loyalty(enc, &client_id, s)
                })
            }
            Command::SelectTransactions { appointment_id } => {
                let found = engine.transactions(appointment_id).await?;
                rows(transactions_schema(), found.iter(), |enc, t| {
                    encode_transaction(enc, t, offset)
                })
            }
            Command::SelectServices => {
                let found = engine.services().await?;
                rows(services_schema(), found.iter(), encode_service)
            }
        }
    }
}

// ── Result sets ──────────────────────────────────────────────────

fn rows<'a, T: 'a>(
    schema: Vec<FieldInfo>,
    items: impl Iterator<Item = &'a T>,
    encode: impl Fn(&mut DataRowEncoder, &T) -> PgWireResult<()>,
) -> Result<Response, EngineError> {
    let schema = Arc::new(schema);
    let encoded: Vec<PgWireResult<_>> = items
        .map(|item| {
            let mut encoder = DataRowEncoder::new(schema.clone());
            encode(&mut encoder, item)?;
            Ok(encoder.take_row())
        })
        .collect();
    Ok(Response::Query(QueryResponse::new(schema, stream::iter(encoded))))
}

fn field(name: &str, ty: Type) -> FieldInfo {
    FieldInfo::new(name.into(), None, None, ty, FieldFormat::Text)
}

fn slots_schema() -> Vec<FieldInfo> {
    vec![
        field("time", Type::VARCHAR),
        field("start", Type::VARCHAR),
        field("end", Type::VARCHAR),
        field("available", Type::BOOL),
        field("reason", Type::VARCHAR),
    ]
}

fn appointments_schema() -> Vec<FieldInfo> {
    vec![
        field("id", Type::VARCHAR),
        field("client_id", Type::VARCHAR),
        field("start", Type::VARCHAR),
        field("end", Type::VARCHAR),
        field("duration", Type::INT4),
        field("service", Type::VARCHAR),
        field("price", Type::VARCHAR),
        field("notes", Type::VARCHAR),
        field("status", Type::VARCHAR),
        field("professional_id", Type::VARCHAR),
    ]
}

fn loyalty_schema() -> Vec<FieldInfo> {
    vec![
        field("client_id", Type::VARCHAR),
        field("points", Type::INT8),
        field("tier", Type::VARCHAR),
        field("progress", Type::INT4),
        field("next_threshold", Type::INT8),
    ]
}

fn transactions_schema() -> Vec<FieldInfo> {
    vec![
        field("id", Type::VARCHAR),
        field("appointment_id", Type::VARCHAR),
        field("client_id", Type::VARCHAR),
        field("amount", Type::VARCHAR),
        field("date", Type::VARCHAR),
        field("description", Type::VARCHAR),
    ]
}

fn services_schema() -> Vec<FieldInfo> {
    vec![
        field("name", Type::VARCHAR),
        field("price", Type::VARCHAR),
        field("duration", Type::INT4),
    ]
}

fn encode_slot(enc: &mut DataRowEncoder, slot: &Slot, offset: FixedOffset) -> PgWireResult<()> {
    enc.encode_field(&slot.time.format("%H:%M").to_string())?;
    enc.encode_field(&format_instant(slot.start, offset))?;
    enc.encode_field(&format_instant(slot.end, offset))?;
    enc.encode_field(&slot.available)?;
    enc.encode_field(&slot.reason)
}

fn encode_appointment(
    enc: &mut DataRowEncoder,
    a: &Appointment,
    offset: FixedOffset,
) -> PgWireResult<()> {
    let span = a.span();
    enc.encode_field(&a.id.to_string())?;
    enc.encode_field(&a.client_id.to_string())?;
    enc.encode_field(&format_instant(span.start, offset))?;
    enc.encode_field(&format_instant(span.end, offset))?;
    enc.encode_field(&(a.duration_minutes as i32))?;
    enc.encode_field(&a.service)?;
    enc.encode_field(&a.price.to_string())?;
    enc.encode_field(&a.notes)?;
    enc.encode_field(&a.status.as_str())?;
    enc.encode_field(&a.professional_id.map(|p| p.to_string()))
}

fn encode_loyalty(enc: &mut DataRowEncoder, client_id: &String, s: &LoyaltySummary) -> PgWireResult<()> {
    enc.encode_field(client_id)?;
    enc.encode_field(&(s.points as i64))?;
    enc.encode_field(&s.tier.as_str())?;
    enc.encode_field(&(s.progress as i32))?;
    enc.encode_field(&s.next_threshold.map(|t| t as i64))
}

fn encode_transaction(
    enc: &mut DataRowEncoder,
    t: &FinancialTransaction,
    offset: FixedOffset,
) -> PgWireResult<()> {
    enc.encode_field(&t.id.to_string())?;
    enc.encode_field(&t.appointment_id.to_string())?;
    enc.encode_field(&t.client_id.to_string())?;
    enc.encode_field(&t.amount.to_string())?;
    enc.encode_field(&format_instant(t.date, offset))?;
    enc.encode_field(&t.description)
}

fn encode_service(enc: &mut DataRowEncoder, s: &Service) -> PgWireResult<()> {
    enc.encode_field(&s.name)?;
    enc.encode_field(&s.price.to_string())?;
    enc.encode_field(&(s.duration_minutes as i32))
}

/// Result columns for a statement, judged from its `FROM` table.
fn schema_for_sql(sql: &str) -> Vec<FieldInfo> {
    let mut words = sql.split_whitespace();
    if !words
        .next()
        .is_some_and(|w| w.eq_ignore_ascii_case("select"))
    {
        return vec![];
    }
    let table = words
        .skip_while(|w| !w.eq_ignore_ascii_case("from"))
        .nth(1)
        .map(|t| t.trim_end_matches(';').to_lowercase());
    match table.as_deref() {
        Some("slots") => slots_schema(),
        Some("appointments") => appointments_schema(),
        Some("loyalty") => loyalty_schema(),
        Some("transactions") => transactions_schema(),
        Some("services") => services_schema(),
        _ => vec![],
    }
}

#[async_trait]
impl SimpleQueryHandler for AgendaHandler {
    async fn do_query<C>(
        &self,
        client: &mut C,
        query: &str,
    ) -> PgWireResult<Vec<Response>>
    where
        C: ClientInfo + ClientPortalStore + Sink<PgWireBackendMessage> + Unpin + Send + Sync,
        C::Error: Debug,
        PgWireError: From<C::Error>,
    {
        let engine = self.resolve_engine(client)?;
        let mut responses = Vec::new();
        for cmd in sql::parse_batch(query).map_err(sql_err)? {
            responses.push(self.run(&engine, cmd).await?);
        }
        Ok(responses)
    }
}

// ── Extended Query Protocol ──────────────────────────────────────

#[derive(Debug)]
pub struct AgendaQueryParser;

#[async_trait]
impl QueryParser for AgendaQueryParser {
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
        Ok(schema_for_sql(stmt))
    }
}

#[async_trait]
impl ExtendedQueryHandler for AgendaHandler {
    type Statement = String;
    type QueryParser = AgendaQueryParser;

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
        let engine = self.resolve_engine(client)?;
        let sql = substitute_params(portal);
        let cmd = sql::parse_sql(&sql).map_err(sql_err)?;
        self.run(&engine, cmd).await
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
            schema_for_sql(&target.statement),
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
        Ok(DescribePortalResponse::new(schema_for_sql(
            &target.statement.statement,
        )))
    }
}

/// Highest `$N` placeholder in the SQL string.
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

/// Substitute `$1`, `$2`, ... with bound text-format parameters as quoted
/// literals. Highest index first so `$1` never clobbers `$10`.
fn substitute_params(portal: &Portal<String>) -> String {
    let mut result = portal.statement.statement.to_string();
    for (i, param) in portal.parameters.iter().enumerate().rev() {
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

pub struct AgendaFactory {
    handler: Arc<AgendaHandler>,
    auth_handler:
        Arc<CleartextPasswordAuthStartupHandler<AgendaAuthSource, DefaultServerParameterProvider>>,
    noop: Arc<NoopHandler>,
}

impl AgendaFactory {
    pub fn new(tenant_manager: Arc<TenantManager>, user: String, password: String) -> Self {
        Self {
            handler: Arc::new(AgendaHandler::new(tenant_manager)),
            auth_handler: Arc::new(CleartextPasswordAuthStartupHandler::new(
                AgendaAuthSource::new(user, password),
                DefaultServerParameterProvider::default(),
            )),
            noop: Arc::new(NoopHandler),
        }
    }
}

impl PgWireServerHandlers for AgendaFactory {
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
    tenant_manager: Arc<TenantManager>,
    user: String,
    password: String,
    tls: Option<TlsAcceptor>,
) -> std::io::Result<()> {
    let factory = AgendaFactory::new(tenant_manager, user, password);
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

/// SQLSTATE for an engine error.
pub fn sqlstate(e: &EngineError) -> &'static str {
    match e {
        EngineError::InvalidRequest(_) => "22023",
        EngineError::SchedulingConflict { .. } => "23P01",
        EngineError::NotFound { .. } => "P0002",
        EngineError::InvalidTransition { .. } => "55000",
        EngineError::LimitExceeded(_) => "54000",
        EngineError::Persistence(_) => "58030",
        EngineError::SideEffectFailure { .. } => "01000",
    }
}

fn engine_err(e: EngineError) -> PgWireError {
    match &e {
        EngineError::SchedulingConflict { .. } => debug!("rejected: {e}"),
        EngineError::Persistence(_) | EngineError::SideEffectFailure { .. } => warn!("{e}"),
        _ => {}
    }
    user_error(sqlstate(&e), e.to_string())
}

fn sql_err(e: SqlError) -> PgWireError {
    let code = match e {
        SqlError::UnknownTable(_) => "42P01",
        SqlError::UnknownColumn(..) | SqlError::MissingColumn(..) => "42703",
        SqlError::Unsupported(_) => "0A000",
        _ => "42601",
    };
    user_error(code, e.to_string())
}
