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

use crate::auth::CarbookAuthSource;
use crate::config::Config;
use crate::engine::{Engine, EngineError};
use crate::model::*;
use crate::observability::{command_label, QUERIES_TOTAL, QUERY_DURATION_SECONDS};
use crate::sql::{self, Command, SqlError};

pub struct CarbookHandler {
    engine: Arc<Engine>,
    config: Arc<Config>,
    query_parser: Arc<CarbookQueryParser>,
}

impl CarbookHandler {
    pub fn new(engine: Arc<Engine>, config: Arc<Config>) -> Self {
        Self {
            engine,
            config,
            query_parser: Arc::new(CarbookQueryParser),
        }
    }

    /// The session's login name, elevated to admin when configured.
    fn resolve_actor<C: ClientInfo>(&self, client: &C) -> PgWireResult<Actor> {
        let user = client
            .metadata()
            .get("user")
            .filter(|u| !u.is_empty())
            .cloned()
            .ok_or_else(|| user_error("28000", "startup message carried no user".into()))?;
        if self.config.is_admin(&user) {
            Ok(Actor::admin(user))
        } else {
            Ok(Actor::user(user))
        }
    }

    async fn run(&self, actor: &Actor, query: &str) -> PgWireResult<Vec<Response>> {
        let cmd = sql::parse_sql(query).map_err(sql_err)?;
        let label = command_label(&cmd);
        let started = Instant::now();
        let result = self.execute_command(actor, cmd).await;
        let status = if result.is_ok() { "ok" } else { "error" };
        metrics::counter!(QUERIES_TOTAL, "command" => label, "status" => status).increment(1);
        metrics::histogram!(QUERY_DURATION_SECONDS, "command" => label)
            .record(started.elapsed().as_secs_f64());
        result
    }

    async fn execute_command(&self, actor: &Actor, cmd: Command) -> PgWireResult<Vec<Response>> {
        let engine = &self.engine;
        match cmd {
            Command::InsertCar {
                id,
                name,
                daily_rate,
            } => {
                engine
                    .list_car(id, actor.user.clone(), name, daily_rate)
                    .await
                    .map_err(engine_err)?;
                Ok(vec![Response::Execution(Tag::new("INSERT").with_rows(1))])
            }
            Command::UpdateCar {
                id,
                name,
                daily_rate,
            } => {
                engine
                    .update_car(id, actor, name, daily_rate)
                    .await
                    .map_err(engine_err)?;
                Ok(vec![Response::Execution(Tag::new("UPDATE").with_rows(1))])
            }
            Command::DeleteCar { id } => {
                engine.delist_car(id, actor).await.map_err(engine_err)?;
                Ok(vec![Response::Execution(Tag::new("DELETE").with_rows(1))])
            }
            Command::InsertReservation {
                id,
                car_id,
                start,
                end,
                total_price,
            } => {
                let span = DateSpan { start, end };
                engine
                    .request_reservation(id, car_id, actor, span, total_price)
                    .await
                    .map_err(engine_err)?;
                Ok(vec![Response::Execution(Tag::new("INSERT").with_rows(1))])
            }
            Command::SetReservationStatus { id, status } => {
                let result = match status {
                    ReservationStatus::Confirmed => engine.confirm_reservation(id, actor).await,
                    ReservationStatus::Cancelled => engine.cancel_reservation(id, actor).await,
                    ReservationStatus::Pending => {
                        let current = engine.reservation(id).await.map_err(engine_err)?;
                        Err(EngineError::InvalidTransition {
                            from: current.status,
                            to: ReservationStatus::Pending,
                        })
                    }
                };
                result.map_err(engine_err)?;
                Ok(vec![Response::Execution(Tag::new("UPDATE").with_rows(1))])
            }
            Command::DeleteReservation { id } => {
                engine.cancel_reservation(id, actor).await.map_err(engine_err)?;
                Ok(vec![Response::Execution(Tag::new("DELETE").with_rows(1))])
            }
            Command::SelectCars => {
                let cars = engine.list_cars().await;
                let schema = Arc::new(cars_schema());
                let rows: Vec<PgWireResult<_>> = cars
                    .into_iter()
                    .map(|car| {
                        let mut encoder = DataRowEncoder::new(schema.clone());
                        encoder.encode_field(&car.id.to_string())?;
                        encoder.encode_field(&car.owner_id)?;
                        encoder.encode_field(&car.name)?;
                        encoder.encode_field(&cents(car.daily_rate_cents))?;
                        encoder.encode_field(&(car.active_reservations as i64))?;
                        Ok(encoder.take_row())
                    })
                    .collect();
                Ok(vec![Response::Query(QueryResponse::new(schema, stream::iter(rows)))])
            }
            Command::SelectReservations { car_id, start, end } => {
                let reservations = engine
                    .list_reservations(car_id, start, end)
                    .await
                    .map_err(engine_err)?;
                let schema = Arc::new(reservations_schema());
                let rows: Vec<PgWireResult<_>> = reservations
                    .into_iter()
                    .map(|r| {
                        let mut encoder = DataRowEncoder::new(schema.clone());
                        encoder.encode_field(&r.id.to_string())?;
                        encoder.encode_field(&r.car_id.to_string())?;
                        encoder.encode_field(&r.renter_id)?;
                        encoder.encode_field(&r.span.start.to_string())?;
                        encoder.encode_field(&r.span.end.to_string())?;
                        encoder.encode_field(&r.status.as_str())?;
                        encoder.encode_field(&cents(r.total_price_cents))?;
                        Ok(encoder.take_row())
                    })
                    .collect();
                Ok(vec![Response::Query(QueryResponse::new(schema, stream::iter(rows)))])
            }
            Command::SelectAvailability { car_id, start, end } => {
                let free = engine
                    .free_spans(car_id, DateSpan { start, end })
                    .await
                    .map_err(engine_err)?;
                let schema = Arc::new(availability_schema());
                let car_str = car_id.to_string();
                let rows: Vec<PgWireResult<_>> = free
                    .into_iter()
                    .map(|span| {
                        let mut encoder = DataRowEncoder::new(schema.clone());
                        encoder.encode_field(&car_str)?;
                        encoder.encode_field(&span.start.to_string())?;
                        encoder.encode_field(&span.end.to_string())?;
                        Ok(encoder.take_row())
                    })
                    .collect();
                Ok(vec![Response::Query(QueryResponse::new(schema, stream::iter(rows)))])
            }
            Command::SelectBlockedDays { car_id, start, end } => {
                let days = engine
                    .blocked_days(car_id, DateSpan { start, end })
                    .await
                    .map_err(engine_err)?;
                let schema = Arc::new(blocked_days_schema());
                let car_str = car_id.to_string();
                let rows: Vec<PgWireResult<_>> = days
                    .into_iter()
                    .map(|day| {
                        let mut encoder = DataRowEncoder::new(schema.clone());
                        encoder.encode_field(&car_str)?;
                        encoder.encode_field(&day.to_string())?;
                        Ok(encoder.take_row())
                    })
                    .collect();
                Ok(vec![Response::Query(QueryResponse::new(schema, stream::iter(rows)))])
            }
        }
    }
}

/// Money leaves the engine as u64 cents; INT8 is signed.
fn cents(value: Option<u64>) -> Option<i64> {
    value.map(|v| i64::try_from(v).unwrap_or(i64::MAX))
}

fn text_field(name: &str) -> FieldInfo {
    FieldInfo::new(name.into(), None, None, Type::VARCHAR, FieldFormat::Text)
}

fn int_field(name: &str) -> FieldInfo {
    FieldInfo::new(name.into(), None, None, Type::INT8, FieldFormat::Text)
}

fn cars_schema() -> Vec<FieldInfo> {
    vec![
        text_field("id"),
        text_field("owner_id"),
        text_field("name"),
        int_field("daily_rate"),
        int_field("active_reservations"),
    ]
}

fn reservations_schema() -> Vec<FieldInfo> {
    vec![
        text_field("id"),
        text_field("car_id"),
        text_field("renter_id"),
        text_field("start"),
        text_field("end"),
        text_field("status"),
        int_field("total_price"),
    ]
}

fn availability_schema() -> Vec<FieldInfo> {
    vec![text_field("car_id"), text_field("start"), text_field("end")]
}

fn blocked_days_schema() -> Vec<FieldInfo> {
    vec![text_field("car_id"), text_field("day")]
}

/// Row schema for a statement that has not been executed yet. Parameters may
/// still be unbound, so this goes by the FROM table alone.
fn result_schema(sql: &str) -> Vec<FieldInfo> {
    match sql::select_table(sql).as_deref() {
        Some("cars") => cars_schema(),
        Some("reservations") => reservations_schema(),
        Some("availability") => availability_schema(),
        Some("blocked_days") => blocked_days_schema(),
        _ => vec![],
    }
}

#[async_trait]
impl SimpleQueryHandler for CarbookHandler {
    async fn do_query<C>(&self, client: &mut C, query: &str) -> PgWireResult<Vec<Response>>
    where
        C: ClientInfo + ClientPortalStore + Sink<PgWireBackendMessage> + Unpin + Send + Sync,
        C::Error: Debug,
        PgWireError: From<C::Error>,
    {
        let actor = self.resolve_actor(client)?;
        self.run(&actor, query).await
    }
}

// ── Extended Query Protocol ──────────────────────────────────────

#[derive(Debug)]
pub struct CarbookQueryParser;

#[async_trait]
impl QueryParser for CarbookQueryParser {
    type Statement = String;

    async fn parse_sql<C>(&self, _client: &C, sql: &str, _types: &[Option<Type>]) -> PgWireResult<String>
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
impl ExtendedQueryHandler for CarbookHandler {
    type Statement = String;
    type QueryParser = CarbookQueryParser;

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
        let actor = self.resolve_actor(client)?;
        let sql = substitute_params(&portal.statement.statement, &portal.parameters);
        self.run(&actor, &sql)
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| user_error("XX000", "statement produced no response".into()))
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

/// Replace `$1`, `$2`, ... with quoted text-format parameter values.
/// Highest index first, so `$1` never clobbers the prefix of `$10`.
fn substitute_params(sql: &str, params: &[Option<bytes::Bytes>]) -> String {
    let mut result = sql.to_string();
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

pub struct CarbookFactory {
    handler: Arc<CarbookHandler>,
    auth_handler:
        Arc<CleartextPasswordAuthStartupHandler<CarbookAuthSource, DefaultServerParameterProvider>>,
    noop: Arc<NoopHandler>,
}

impl CarbookFactory {
    pub fn new(engine: Arc<Engine>, config: Arc<Config>) -> Self {
        let auth_source = CarbookAuthSource::new(config.password.clone());
        let param_provider = DefaultServerParameterProvider::default();
        Self {
            handler: Arc::new(CarbookHandler::new(engine, config)),
            auth_handler: Arc::new(CleartextPasswordAuthStartupHandler::new(
                auth_source,
                param_provider,
            )),
            noop: Arc::new(NoopHandler),
        }
    }
}

impl PgWireServerHandlers for CarbookFactory {
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
    config: Arc<Config>,
    tls: Option<TlsAcceptor>,
) -> std::io::Result<()> {
    let factory = Arc::new(CarbookFactory::new(engine, config));
    pgwire::tokio::process_socket(socket, tls, factory).await
}

fn user_error(code: &str, message: String) -> PgWireError {
    PgWireError::UserError(Box::new(ErrorInfo::new("ERROR".into(), code.into(), message)))
}

fn engine_err(e: EngineError) -> PgWireError {
    user_error(e.sqlstate(), e.to_string())
}

fn sql_err(e: SqlError) -> PgWireError {
    user_error("42601", e.to_string())
}
