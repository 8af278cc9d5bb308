use std::fmt::Debug;
use std::io;
use std::ops::Range;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use chrono::Utc;
use futures::Sink;
use futures::stream;
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
use ulid::Ulid;

use crate::auth::{Credentials, InnkeepAuthSource, Role};
use crate::engine::{Engine, EngineError, WriteOrigin};
use crate::ical;
use crate::model::*;
use crate::observability;
use crate::payment::{self, PaymentEvent, PaymentOutcome};
use crate::schema::{self, ColumnType, ResultSet};
use crate::sql::{self, Command, Row, SqlError, Table};
use crate::sync::Synchronizer;

/// Everything a connection needs, shared by all of them.
pub struct ServerState {
    pub engine: Arc<Engine>,
    pub sync: Arc<Synchronizer>,
    pub credentials: Credentials,
}

pub struct InnkeepHandler {
    state: Arc<ServerState>,
    query_parser: Arc<InnkeepQueryParser>,
}

fn user_error(code: &str, message: impl Into<String>) -> PgWireError {
    PgWireError::UserError(Box::new(ErrorInfo::new(
        "ERROR".into(),
        code.into(),
        message.into(),
    )))
}

fn json_err(e: serde_json::Error) -> PgWireError {
    tracing::error!(error = %e, "result encoding failed");
    user_error("XX000", "internal error")
}

/// Which role may run a command. Anything not opened up to `app` is admin-only.
fn required_role(cmd: &Command) -> Role {
    match cmd {
        Command::Select { table, .. } => match table {
            Table::Availability
            | Table::Quote
            | Table::RoomCalendar
            | Table::Properties
            | Table::Rooms
            | Table::AddOns => Role::App,
            _ => Role::Admin,
        },
        Command::Insert { table, .. } => match table {
            Table::Bookings | Table::PaymentEvents => Role::App,
            _ => Role::Admin,
        },
        Command::Update { .. } | Command::Delete { .. } => Role::Admin,
    }
}

fn inserted(rows: usize) -> Response {
    Response::Execution(Tag::new("INSERT").with_rows(rows))
}

fn updated() -> Response {
    Response::Execution(Tag::new("UPDATE").with_rows(1))
}

fn deleted() -> Response {
    Response::Execution(Tag::new("DELETE").with_rows(1))
}

fn not_writable(table: Table, verb: &str) -> PgWireError {
    user_error("42809", format!("cannot {verb} {}", table.name()))
}

impl InnkeepHandler {
    pub fn new(state: Arc<ServerState>) -> Self {
        Self {
            state,
            query_parser: Arc::new(InnkeepQueryParser),
        }
    }

    fn engine(&self) -> &Engine {
        &self.state.engine
    }

    fn role<C: ClientInfo>(&self, client: &C) -> PgWireResult<Role> {
        client
            .metadata()
            .get("user")
            .and_then(|user| Role::from_user(user))
            .ok_or_else(|| user_error("28000", "unknown user"))
    }

    /// Parse, authorize, run, and count one statement.
    async fn run_sql(&self, role: Role, query: &str) -> PgWireResult<Response> {
        let cmd = sql::parse_sql(query).map_err(sql_err)?;
        let label = observability::command_label(&cmd);
        if required_role(&cmd) == Role::Admin && role != Role::Admin {
            metrics::counter!(observability::QUERIES_TOTAL, "command" => label, "status" => "denied")
                .increment(1);
            return Err(user_error(
                "42501",
                format!("permission denied for {}", cmd.table().name()),
            ));
        }
        let started = Instant::now();
        let result = self.execute_command(role, cmd).await;
        let status = if result.is_ok() { "ok" } else { "error" };
        metrics::histogram!(observability::QUERY_DURATION_SECONDS, "command" => label.clone())
            .record(started.elapsed().as_secs_f64());
        metrics::counter!(observability::QUERIES_TOTAL, "command" => label, "status" => status)
            .increment(1);
        result
    }

    async fn execute_command(&self, role: Role, cmd: Command) -> PgWireResult<Response> {
        match cmd {
            Command::Insert { table, row } => self.insert(role, table, row).await,
            Command::Update {
                table,
                id,
                assignments,
            } => self.update(table, id, assignments).await,
            Command::Delete { table, id } => {
                let engine = self.engine();
                match table {
                    Table::PricingRules => engine.remove_rule(id).await.map_err(engine_err)?,
                    Table::RoomFeeds => engine.remove_feed(id).await.map_err(engine_err)?,
                    other => return Err(not_writable(other, "delete from")),
                }
                Ok(deleted())
            }
            Command::Select { table, filters } => {
                let rs = self.select(table, filters).await?;
                Ok(encode_result(rs))
            }
        }
    }

    async fn insert(&self, role: Role, table: Table, row: Row) -> PgWireResult<Response> {
        let engine = self.engine();
        match table {
            Table::Properties => {
                let property = schema::property_from_row(&row).map_err(sql_err)?;
                engine.create_property(property).await.map_err(engine_err)?;
            }
            Table::Rooms => {
                let room = schema::room_from_row(&row).map_err(sql_err)?;
                engine.create_room(room).await.map_err(engine_err)?;
            }
            Table::AddOns => {
                let add_on = schema::add_on_from_row(&row).map_err(sql_err)?;
                engine.create_add_on(add_on).await.map_err(engine_err)?;
            }
            Table::PricingRules => {
                let rule = schema::rule_from_row(&row).map_err(sql_err)?;
                engine.add_rule(rule).await.map_err(engine_err)?;
            }
            Table::RoomFeeds => {
                let feed = schema::feed_from_row(&row).map_err(sql_err)?;
                engine
                    .add_feed(feed.id, feed.room_id, &feed.url)
                    .await
                    .map_err(engine_err)?;
            }
            Table::Bookings => {
                let (request, source) = schema::booking_request_from_row(&row).map_err(sql_err)?;
                // Only the admin tool records bookings taken on other channels.
                let source = match role {
                    Role::Admin => source.unwrap_or(BookingSource::Direct),
                    Role::App => BookingSource::Direct,
                };
                engine
                    .create_booking(request, WriteOrigin::Direct { source })
                    .await
                    .map_err(engine_err)?;
            }
            Table::PaymentEvents => {
                let event = PaymentEvent::new(
                    row.require_text("session_id").map_err(sql_err)?,
                    row.bool("paid").map_err(sql_err)?.unwrap_or(false),
                    row.text("metadata").map_err(sql_err)?.as_deref(),
                );
                let outcome = payment::handle_payment_event(engine, &event)
                    .await
                    .map_err(engine_err)?;
                let rows = usize::from(matches!(outcome, PaymentOutcome::Recorded(_)));
                return Ok(inserted(rows));
            }
            other => return Err(not_writable(other, "insert into")),
        }
        Ok(inserted(1))
    }

    async fn update(&self, table: Table, id: Ulid, assignments: Row) -> PgWireResult<Response> {
        let engine = self.engine();
        match table {
            Table::Properties => {
                let current = engine.property(&id).await.map_err(engine_err)?;
                let row = schema::merged(schema::property_to_row(&current), &assignments);
                let property = schema::property_from_row(&row).map_err(sql_err)?;
                engine.update_property(property).await.map_err(engine_err)?;
            }
            Table::Rooms => {
                let current = engine.room(&id).await.map_err(engine_err)?;
                let row = schema::merged(schema::room_to_row(&current), &assignments);
                let room = schema::room_from_row(&row).map_err(sql_err)?;
                engine.update_room(room).await.map_err(engine_err)?;
            }
            Table::AddOns => {
                let current = engine.add_on(&id).await.map_err(engine_err)?;
                let row = schema::merged(schema::add_on_to_row(&current), &assignments);
                let add_on = schema::add_on_from_row(&row).map_err(sql_err)?;
                engine.update_add_on(add_on).await.map_err(engine_err)?;
            }
            Table::PricingRules => {
                let current = engine.rule(&id).map_err(engine_err)?;
                let row = schema::merged(schema::rule_to_row(&current), &assignments);
                let rule = schema::rule_from_row(&row).map_err(sql_err)?;
                engine.update_rule(rule).await.map_err(engine_err)?;
            }
            Table::Bookings => {
                let patch = schema::booking_patch(&assignments).map_err(sql_err)?;
                if let Some(status) = patch.status {
                    engine
                        .update_booking_status(id, status)
                        .await
                        .map_err(engine_err)?;
                }
                if let Some(payment_status) = patch.payment_status {
                    engine
                        .update_payment_status(id, payment_status)
                        .await
                        .map_err(engine_err)?;
                }
            }
            other => return Err(not_writable(other, "update")),
        }
        Ok(updated())
    }

    async fn select(&self, table: Table, filters: Row) -> PgWireResult<ResultSet> {
        let engine = self.engine();
        match table {
            Table::Availability => {
                let property_id = filters.require_ulid("property_id").map_err(sql_err)?;
                let occupancy = schema::occupancy_from_row(&filters).map_err(sql_err)?;
                let availability = engine
                    .check_availability(
                        property_id,
                        filters.require_date("check_in").map_err(sql_err)?,
                        filters.require_date("check_out").map_err(sql_err)?,
                        &occupancy,
                    )
                    .await
                    .map_err(engine_err)?;
                schema::availability_result(&availability).map_err(json_err)
            }
            Table::Quote => {
                let property_id = filters.require_ulid("property_id").map_err(sql_err)?;
                let occupancy = schema::occupancy_from_row(&filters).map_err(sql_err)?;
                let add_ons = filters.ulid_list("add_ons").map_err(sql_err)?;
                let quote = engine
                    .quote(
                        property_id,
                        filters.require_date("check_in").map_err(sql_err)?,
                        filters.require_date("check_out").map_err(sql_err)?,
                        &occupancy,
                        &add_ons,
                    )
                    .await
                    .map_err(engine_err)?;
                schema::quote_result(&quote).map_err(json_err)
            }
            Table::Bookings => {
                let bookings = if let Some(id) = filters.ulid("id").map_err(sql_err)? {
                    match engine.booking(&id).await {
                        Ok(b) => vec![b],
                        Err(EngineError::NotFound(_)) => Vec::new(),
                        Err(e) => return Err(engine_err(e)),
                    }
                } else if let Some(key) = filters.text("stripe_session_id").map_err(sql_err)? {
                    engine
                        .booking_by_correlation_key(&key)
                        .await
                        .map_err(engine_err)?
                        .into_iter()
                        .collect()
                } else if let Some(pid) = filters.ulid("property_id").map_err(sql_err)? {
                    engine.bookings(&pid).await.map_err(engine_err)?
                } else {
                    return Err(sql_err(SqlError::MissingFilter(
                        "id, stripe_session_id or property_id",
                    )));
                };
                Ok(schema::bookings_result(&bookings))
            }
            Table::RoomCalendar => {
                let room_id = filters.require_ulid("room_id").map_err(sql_err)?;
                let calendar = engine.room_calendar(&room_id).await.map_err(engine_err)?;
                Ok(schema::calendar_result(
                    room_id,
                    ical::export_room_calendar(&calendar),
                ))
            }
            Table::CalendarSync => {
                let report = self
                    .state
                    .sync
                    .run(engine, Utc::now().date_naive())
                    .await
                    .map_err(engine_err)?;
                schema::sync_result(&report).map_err(json_err)
            }
            Table::Properties => {
                let properties = match filters.ulid("id").map_err(sql_err)? {
                    Some(id) => vec![engine.property(&id).await.map_err(engine_err)?],
                    None => engine.properties().await,
                };
                Ok(schema::properties_result(&properties))
            }
            Table::Rooms => {
                let mut rooms = Vec::new();
                for pid in self.property_scope(&filters).await? {
                    rooms.extend(engine.rooms(&pid).await.map_err(engine_err)?);
                }
                Ok(schema::rooms_result(&rooms))
            }
            Table::AddOns => {
                let mut add_ons = Vec::new();
                for pid in self.property_scope(&filters).await? {
                    add_ons.extend(engine.add_ons(&pid).await.map_err(engine_err)?);
                }
                Ok(schema::add_ons_result(&add_ons))
            }
            Table::PricingRules => {
                let pid = filters.ulid("property_id").map_err(sql_err)?;
                Ok(schema::rules_result(&engine.rules(pid.as_ref())))
            }
            Table::RoomFeeds => {
                let room = filters.ulid("room_id").map_err(sql_err)?;
                let feeds: Vec<FeedSubscription> = engine
                    .feed_subscriptions()
                    .await
                    .into_iter()
                    .filter(|f| room.is_none_or(|r| f.room_id == r))
                    .collect();
                Ok(schema::feeds_result(&feeds))
            }
            Table::PaymentEvents => Err(user_error("42809", "payment_events is write-only")),
        }
    }

    /// The property named by a `property_id` filter, or all of them.
    async fn property_scope(&self, filters: &Row) -> PgWireResult<Vec<Ulid>> {
        Ok(match filters.ulid("property_id").map_err(sql_err)? {
            Some(pid) => vec![pid],
            None => self
                .engine()
                .properties()
                .await
                .into_iter()
                .map(|p| p.id)
                .collect(),
        })
    }
}

fn field_type(column: ColumnType) -> Type {
    match column {
        ColumnType::Text => Type::VARCHAR,
        ColumnType::Int => Type::INT8,
        ColumnType::Bool => Type::BOOL,
        ColumnType::Numeric => Type::NUMERIC,
        ColumnType::Date => Type::DATE,
        ColumnType::Json => Type::JSON,
    }
}

fn field_infos(columns: &[(&'static str, ColumnType)]) -> Vec<FieldInfo> {
    columns
        .iter()
        .map(|(name, column)| {
            FieldInfo::new((*name).into(), None, None, field_type(*column), FieldFormat::Text)
        })
        .collect()
}

fn encode_result(rs: ResultSet) -> Response {
    let schema = Arc::new(field_infos(&rs.columns));
    let rows: Vec<PgWireResult<_>> = rs
        .rows
        .into_iter()
        .map(|cells| {
            let mut encoder = DataRowEncoder::new(schema.clone());
            for cell in &cells {
                encoder.encode_field(cell)?;
            }
            Ok(encoder.take_row())
        })
        .collect();
    Response::Query(QueryResponse::new(schema, stream::iter(rows)))
}

fn describe(sql: &str) -> Vec<FieldInfo> {
    sql::select_table(sql)
        .map(|table| field_infos(schema::columns_for(table)))
        .unwrap_or_default()
}

#[async_trait]
impl SimpleQueryHandler for InnkeepHandler {
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
        let role = self.role(client)?;
        let statements = sql::split_statements(query).map_err(sql_err)?;
        let mut responses = Vec::with_capacity(statements.len());
        for statement in &statements {
            responses.push(self.run_sql(role, statement).await?);
        }
        Ok(responses)
    }
}

// ── Extended Query Protocol ──────────────────────────────────────

#[derive(Debug)]
pub struct InnkeepQueryParser;

#[async_trait]
impl QueryParser for InnkeepQueryParser {
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
        Ok(describe(stmt))
    }
}

#[async_trait]
impl ExtendedQueryHandler for InnkeepHandler {
    type Statement = String;
    type QueryParser = InnkeepQueryParser;

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
        let role = self.role(client)?;
        let sql = substitute_params(portal);
        self.run_sql(role, &sql).await
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
            describe(&target.statement),
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
        Ok(DescribePortalResponse::new(describe(
            &target.statement.statement,
        )))
    }
}

/// `$N` placeholders outside quoted text, as (byte range, N), left to right.
fn placeholders(sql: &str) -> Vec<(Range<usize>, usize)> {
    let bytes = sql.as_bytes();
    let mut found = Vec::new();
    let mut quote: Option<u8> = None;
    let mut i = 0;
    while i < bytes.len() {
        match (bytes[i], quote) {
            (b'\'' | b'"', None) => quote = Some(bytes[i]),
            (c, Some(q)) if c == q => quote = None,
            (b'$', None) => {
                let digits = bytes[i + 1..].iter().take_while(|b| b.is_ascii_digit()).count();
                if let Ok(n) = sql[i + 1..i + 1 + digits].parse::<usize>() {
                    found.push((i..i + 1 + digits, n));
                    i += digits;
                }
            }
            _ => {}
        }
        i += 1;
    }
    found
}

/// Highest `$N` placeholder in the SQL string.
fn count_params(sql: &str) -> usize {
    placeholders(sql).iter().map(|(_, n)| *n).max().unwrap_or(0)
}

/// Render bound values (text format) into the statement in one pass, so a
/// value is never scanned for placeholders itself.
fn bind_params<B: AsRef<[u8]>>(sql: &str, params: &[Option<B>]) -> String {
    let mut out = String::with_capacity(sql.len());
    let mut last = 0;
    for (range, n) in placeholders(sql) {
        out.push_str(&sql[last..range.start]);
        match n.checked_sub(1).and_then(|i| params.get(i)) {
            Some(Some(value)) => {
                out.push('\'');
                out.push_str(&String::from_utf8_lossy(value.as_ref()).replace('\'', "''"));
                out.push('\'');
            }
            Some(None) => out.push_str("NULL"),
            None => out.push_str(&sql[range.clone()]),
        }
        last = range.end;
    }
    out.push_str(&sql[last..]);
    out
}

fn substitute_params(portal: &Portal<String>) -> String {
    bind_params(&portal.statement.statement, &portal.parameters)
}

// ── Factory ──────────────────────────────────────────────────────

pub struct InnkeepFactory {
    handler: Arc<InnkeepHandler>,
    auth_handler:
        Arc<CleartextPasswordAuthStartupHandler<InnkeepAuthSource, DefaultServerParameterProvider>>,
    noop: Arc<NoopHandler>,
}

impl InnkeepFactory {
    pub fn new(state: Arc<ServerState>) -> Self {
        let auth_source = InnkeepAuthSource::new(state.credentials.clone());
        Self {
            handler: Arc::new(InnkeepHandler::new(state)),
            auth_handler: Arc::new(CleartextPasswordAuthStartupHandler::new(
                auth_source,
                DefaultServerParameterProvider::default(),
            )),
            noop: Arc::new(NoopHandler),
        }
    }
}

impl PgWireServerHandlers for InnkeepFactory {
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

/// Serve one client connection to completion.
pub async fn process_connection(
    socket: TcpStream,
    state: Arc<ServerState>,
    tls: Option<TlsAcceptor>,
) -> io::Result<()> {
    pgwire::tokio::process_socket(socket, tls, InnkeepFactory::new(state)).await
}

// ── Errors ───────────────────────────────────────────────────────

fn engine_err(e: EngineError) -> PgWireError {
    let code = match &e {
        EngineError::Validation(_) => "22023",
        EngineError::Conflict { .. } => "23P01",
        EngineError::NotFound(_) => "P0002",
        EngineError::AlreadyExists(_) => "23505",
        EngineError::InvalidStatusTransition { .. } | EngineError::InvalidPaymentTransition { .. } => {
            "55000"
        }
        EngineError::InFlight(_) => "53400",
        EngineError::LimitExceeded(_) => "54000",
        // detail is already logged where the journal failed
        EngineError::Journal(_) => return user_error("58000", "temporarily unavailable, please try again"),
    };
    user_error(code, e.to_string())
}

fn sql_err(e: SqlError) -> PgWireError {
    let code = match &e {
        SqlError::UnknownTable(_) => "42P01",
        SqlError::MissingFilter(_) | SqlError::MissingColumn(_) | SqlError::BadValue { .. } => "22023",
        SqlError::Parse(_) | SqlError::Empty | SqlError::Unsupported(_) | SqlError::WrongArity(..) => {
            "42601"
        }
    };
    user_error(code, e.to_string())
}
