use std::fmt::Debug;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use chrono::SecondsFormat;
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
use ulid::Ulid;

use crate::auth::VisitdAuthSource;
use crate::engine::{Engine, EngineError, NewApartment, NewListing};
use crate::model::*;
use crate::observability::{command_label, QUERIES_TOTAL, QUERY_DURATION_SECONDS};
use crate::sql::{self, Command, SelectKind, SqlError};

pub struct VisitdHandler {
    engine: Arc<Engine>,
    query_parser: Arc<VisitdQueryParser>,
}

impl VisitdHandler {
    pub fn new(engine: Arc<Engine>) -> Self {
        Self {
            engine,
            query_parser: Arc::new(VisitdQueryParser),
        }
    }

    /// Parse, run and record RED metrics for one statement.
    async fn run(&self, user: Ulid, sql: &str) -> PgWireResult<Response> {
        let cmd = sql::parse_sql(sql).map_err(sql_err)?;
        let label = command_label(&cmd);
        let started = Instant::now();
        let result = self.execute_command(user, cmd).await;
        let status = if result.is_ok() { "ok" } else { "error" };
        metrics::counter!(QUERIES_TOTAL, "command" => label, "status" => status).increment(1);
        metrics::histogram!(QUERY_DURATION_SECONDS, "command" => label)
            .record(started.elapsed().as_secs_f64());
        result
    }

    async fn execute_command(&self, user: Ulid, cmd: Command) -> PgWireResult<Response> {
        let engine = &self.engine;
        match cmd {
            Command::InsertVisit {
                id,
                listing_id,
                visit_at,
            } => {
                engine
                    .request_visit(id, listing_id, user, visit_at)
                    .await
                    .map_err(engine_err)?;
                Ok(inserted(1))
            }
            Command::UpdateVisitStatus { id, status } => {
                engine
                    .update_visit_status(id, &status, user)
                    .await
                    .map_err(engine_err)?;
                Ok(updated(1))
            }
            Command::RejectPendingVisits { listing_id } => {
                let rejected = engine
                    .reject_pending_for_listing(listing_id, user)
                    .await
                    .map_err(engine_err)?;
                Ok(updated(rejected.len()))
            }
            Command::SelectVisit { id } => {
                let view = engine.get_booking_view(id).await.map_err(engine_err)?;
                Ok(visit_rows(&[view]))
            }
            Command::SelectVisitsByRequester { requester_id } => {
                Ok(visit_rows(&engine.list_bookings_for_requester(requester_id).await))
            }
            Command::SelectVisitsByController { controller_id } => {
                Ok(visit_rows(&engine.list_bookings_for_controller(controller_id).await))
            }
            Command::SelectApprovedVisitsOnDate { listing_id, date } => {
                let visits = engine
                    .approved_visits_on_date(listing_id, date)
                    .await
                    .map_err(engine_err)?;
                let listing = listing_id.to_string();
                Ok(rows(approved_visit_schema(), &visits, |enc, t| {
                    enc.encode_field(&listing)?;
                    enc.encode_field(&t.to_rfc3339())
                }))
            }
            Command::InsertLocation {
                latitude,
                longitude,
                area_name,
            } => {
                engine
                    .find_or_create_location(latitude, longitude, area_name)
                    .await
                    .map_err(engine_err)?;
                Ok(inserted(1))
            }
            Command::InsertApartment {
                id,
                title,
                total_rent,
                max_occupancy,
                site,
            } => {
                engine
                    .create_apartment(NewApartment {
                        id,
                        owner_id: user,
                        title,
                        total_rent,
                        max_occupancy,
                        site,
                    })
                    .await
                    .map_err(engine_err)?;
                Ok(inserted(1))
            }
            Command::UpdateApartment {
                id,
                total_rent,
                max_occupancy,
            } => {
                let apartment = engine.get_apartment(id).map_err(engine_err)?;
                if apartment.owner_id != user {
                    return Err(engine_err(EngineError::Forbidden(id)));
                }
                engine
                    .update_apartment(id, total_rent, max_occupancy)
                    .await
                    .map_err(engine_err)?;
                Ok(updated(1))
            }
            Command::InsertListing {
                id,
                apartment_id,
                kind,
                host_id,
                price_per_person,
            } => {
                // Whole apartments are listed by their owner; room shares by
                // the hosting occupant, who defaults to the caller.
                let apartment = engine.get_apartment(apartment_id).map_err(engine_err)?;
                let host_id = match kind {
                    ListingKind::Apartment if apartment.owner_id != user => {
                        return Err(engine_err(EngineError::Forbidden(apartment_id)));
                    }
                    ListingKind::Apartment => host_id,
                    ListingKind::RoomShare => match host_id {
                        Some(host) if host != user => {
                            return Err(engine_err(EngineError::Forbidden(apartment_id)));
                        }
                        _ => Some(user),
                    },
                };
                engine
                    .create_listing(NewListing {
                        id,
                        apartment_id,
                        kind,
                        host_id,
                        price_per_person,
                    })
                    .await
                    .map_err(engine_err)?;
                Ok(inserted(1))
            }
            Command::UpdateListing {
                id,
                price_per_person,
                status,
                verification,
            } => {
                let controller = engine
                    .listing_controlling_party(id)
                    .await
                    .map_err(engine_err)?;
                if controller != user {
                    return Err(engine_err(EngineError::Forbidden(id)));
                }
                engine
                    .update_listing(id, price_per_person, status, verification)
                    .await
                    .map_err(engine_err)?;
                Ok(updated(1))
            }
            Command::SelectListings { id } => {
                let listings = match id {
                    Some(id) => vec![engine.get_listing(id).await.map_err(engine_err)?],
                    None => engine.list_listings().await,
                };
                Ok(rows(listing_schema(), &listings, |enc, l| {
                    enc.encode_field(&l.id.to_string())?;
                    enc.encode_field(&l.apartment_id.to_string())?;
                    enc.encode_field(&l.kind.as_str())?;
                    enc.encode_field(&l.price_per_person)?;
                    enc.encode_field(&l.status.as_str())?;
                    enc.encode_field(&l.verification.as_str())?;
                    enc.encode_field(&l.controller_id.to_string())?;
                    enc.encode_field(&l.created_at.to_rfc3339_opts(SecondsFormat::Millis, true))
                }))
            }
            Command::SelectApartments { id, location_id } => {
                let apartments = match (id, location_id) {
                    (Some(id), _) => vec![engine.get_apartment(id).map_err(engine_err)?],
                    (None, Some(loc)) => engine.apartments_in_location(loc),
                    (None, None) => Vec::new(),
                };
                Ok(rows(apartment_schema(), &apartments, |enc, a| {
                    enc.encode_field(&a.id.to_string())?;
                    enc.encode_field(&a.owner_id.to_string())?;
                    enc.encode_field(&a.title)?;
                    enc.encode_field(&a.location_id.map(|l| l.to_string()))?;
                    enc.encode_field(&a.total_rent)?;
                    enc.encode_field(&a.max_occupancy.map(i64::from))
                }))
            }
            Command::SelectLocations => {
                Ok(rows(location_schema(), &engine.list_locations(), |enc, l| {
                    enc.encode_field(&l.id.to_string())?;
                    enc.encode_field(&l.area_name)?;
                    enc.encode_field(&l.latitude)?;
                    enc.encode_field(&l.longitude)
                }))
            }
            Command::SelectMetrics { apartment_id } => {
                let metrics = match apartment_id {
                    Some(id) => engine.get_metrics(id).into_iter().collect(),
                    None => engine.list_metrics(),
                };
                Ok(rows(metrics_schema(), &metrics, |enc, m| {
                    enc.encode_field(&m.apartment_id.to_string())?;
                    enc.encode_field(&i32::from(m.fair_rent_score))?;
                    enc.encode_field(&(m.view_count as i64))?;
                    enc.encode_field(&(m.wishlist_count as i64))?;
                    enc.encode_field(&m.last_calculated.to_rfc3339_opts(SecondsFormat::Millis, true))
                }))
            }
        }
    }
}

fn inserted(n: usize) -> Response {
    Response::Execution(Tag::new("INSERT").with_rows(n))
}

fn updated(n: usize) -> Response {
    Response::Execution(Tag::new("UPDATE").with_rows(n))
}

fn rows<T>(
    schema: Vec<FieldInfo>,
    items: &[T],
    encode: impl Fn(&mut DataRowEncoder, &T) -> PgWireResult<()>,
) -> Response {
    let schema = Arc::new(schema);
    let rows: Vec<PgWireResult<_>> = items
        .iter()
        .map(|item| {
            let mut encoder = DataRowEncoder::new(schema.clone());
            encode(&mut encoder, item)?;
            Ok(encoder.take_row())
        })
        .collect();
    Response::Query(QueryResponse::new(schema, stream::iter(rows)))
}

fn visit_rows(views: &[BookingView]) -> Response {
    rows(visit_schema(), views, |enc, v| {
        let b = &v.booking;
        enc.encode_field(&b.id.to_string())?;
        enc.encode_field(&b.listing_id.to_string())?;
        enc.encode_field(&b.requester_id.to_string())?;
        enc.encode_field(&b.visit_at.map(|t| t.to_rfc3339()))?;
        enc.encode_field(&b.status.as_str())?;
        enc.encode_field(&b.created_at.to_rfc3339_opts(SecondsFormat::Millis, true))?;
        enc.encode_field(&v.listing_kind.as_str())?;
        enc.encode_field(&v.price_per_person)?;
        enc.encode_field(&v.area_name)
    })
}

// ── Schemas ──────────────────────────────────────────────────────

fn field(name: &str, ty: Type) -> FieldInfo {
    FieldInfo::new(name.into(), None, None, ty, FieldFormat::Text)
}

fn visit_schema() -> Vec<FieldInfo> {
    vec![
        field("id", Type::VARCHAR),
        field("listing_id", Type::VARCHAR),
        field("requester_id", Type::VARCHAR),
        field("visit_at", Type::VARCHAR),
        field("status", Type::VARCHAR),
        field("created_at", Type::VARCHAR),
        field("listing_kind", Type::VARCHAR),
        field("price_per_person", Type::INT8),
        field("area_name", Type::VARCHAR),
    ]
}

fn approved_visit_schema() -> Vec<FieldInfo> {
    vec![field("listing_id", Type::VARCHAR), field("visit_at", Type::VARCHAR)]
}

fn listing_schema() -> Vec<FieldInfo> {
    vec![
        field("id", Type::VARCHAR),
        field("apartment_id", Type::VARCHAR),
        field("kind", Type::VARCHAR),
        field("price_per_person", Type::INT8),
        field("status", Type::VARCHAR),
        field("verification", Type::VARCHAR),
        field("controller_id", Type::VARCHAR),
        field("created_at", Type::VARCHAR),
    ]
}

fn apartment_schema() -> Vec<FieldInfo> {
    vec![
        field("id", Type::VARCHAR),
        field("owner_id", Type::VARCHAR),
        field("title", Type::VARCHAR),
        field("location_id", Type::VARCHAR),
        field("total_rent", Type::INT8),
        field("max_occupancy", Type::INT8),
    ]
}

fn location_schema() -> Vec<FieldInfo> {
    vec![
        field("id", Type::VARCHAR),
        field("area_name", Type::VARCHAR),
        field("latitude", Type::FLOAT8),
        field("longitude", Type::FLOAT8),
    ]
}

fn metrics_schema() -> Vec<FieldInfo> {
    vec![
        field("apartment_id", Type::VARCHAR),
        field("fair_rent_score", Type::INT4),
        field("view_count", Type::INT8),
        field("wishlist_count", Type::INT8),
        field("last_calculated", Type::VARCHAR),
    ]
}

/// Result columns for a statement. Only SELECTs return rows; the shape
/// follows the same classification `parse_sql` uses.
fn result_schema(sql: &str) -> Vec<FieldInfo> {
    match sql::select_kind(sql) {
        Some(SelectKind::Visit | SelectKind::VisitsByRequester | SelectKind::VisitsByController) => {
            visit_schema()
        }
        Some(SelectKind::ApprovedVisitsOnDate) => approved_visit_schema(),
        Some(SelectKind::Listings) => listing_schema(),
        Some(SelectKind::Apartments) => apartment_schema(),
        Some(SelectKind::Locations) => location_schema(),
        Some(SelectKind::Metrics) => metrics_schema(),
        None => vec![],
    }
}

/// The login user name is the acting user.
fn acting_user<C: ClientInfo>(client: &C) -> PgWireResult<Ulid> {
    let user = client.metadata().get("user").cloned().unwrap_or_default();
    Ulid::from_string(&user).map_err(|_| {
        PgWireError::UserError(Box::new(ErrorInfo::new(
            "ERROR".into(),
            "28000".into(),
            format!("user name must be a user id (ULID), got {user:?}"),
        )))
    })
}

#[async_trait]
impl SimpleQueryHandler for VisitdHandler {
    async fn do_query<C>(&self, client: &mut C, query: &str) -> PgWireResult<Vec<Response>>
    where
        C: ClientInfo + ClientPortalStore + Sink<PgWireBackendMessage> + Unpin + Send + Sync,
        C::Error: Debug,
        PgWireError: From<C::Error>,
    {
        let user = acting_user(client)?;
        Ok(vec![self.run(user, query).await?])
    }
}

// ── Extended Query Protocol ──────────────────────────────────────

#[derive(Debug)]
pub struct VisitdQueryParser;

#[async_trait]
impl QueryParser for VisitdQueryParser {
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

    fn get_result_schema(&self, stmt: &String, _column_format: Option<&Format>) -> PgWireResult<Vec<FieldInfo>> {
        Ok(result_schema(stmt))
    }
}

#[async_trait]
impl ExtendedQueryHandler for VisitdHandler {
    type Statement = String;
    type QueryParser = VisitdQueryParser;

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
        let user = acting_user(client)?;
        let sql = substitute_params(portal);
        self.run(user, &sql).await
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
        Ok(DescribeStatementResponse::new(param_types, result_schema(&target.statement)))
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
        Ok(DescribePortalResponse::new(result_schema(&target.statement.statement)))
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

/// Inline bound parameters as quoted text in one left-to-right pass.
/// Inserted values are never rescanned, so a value containing `$1` stays
/// literal text.
fn substitute_params(portal: &Portal<String>) -> String {
    inline_params(&portal.statement.statement, &portal.parameters)
}

fn inline_params<B: AsRef<[u8]>>(sql: &str, params: &[Option<B>]) -> String {
    let mut out = String::with_capacity(sql.len());
    let mut rest = sql;
    while let Some(pos) = rest.find('$') {
        out.push_str(&rest[..pos]);
        let after = &rest[pos + 1..];
        let digits = after.bytes().take_while(|b| b.is_ascii_digit()).count();
        let slot = after[..digits]
            .parse::<usize>()
            .ok()
            .and_then(|n| n.checked_sub(1))
            .and_then(|i| params.get(i));
        match slot {
            Some(Some(bytes)) => {
                let text = String::from_utf8_lossy(bytes.as_ref());
                out.push('\'');
                out.push_str(&text.replace('\'', "''"));
                out.push('\'');
            }
            Some(None) => out.push_str("NULL"),
            None => out.push_str(&rest[pos..pos + 1 + digits]),
        }
        rest = &after[digits..];
    }
    out.push_str(rest);
    out
}

// ── Factory ──────────────────────────────────────────────────────

pub struct VisitdFactory {
    handler: Arc<VisitdHandler>,
    auth_handler:
        Arc<CleartextPasswordAuthStartupHandler<VisitdAuthSource, DefaultServerParameterProvider>>,
    noop: Arc<NoopHandler>,
}

impl VisitdFactory {
    pub fn new(engine: Arc<Engine>, password: String) -> Self {
        Self {
            handler: Arc::new(VisitdHandler::new(engine)),
            auth_handler: Arc::new(CleartextPasswordAuthStartupHandler::new(
                VisitdAuthSource::new(password),
                DefaultServerParameterProvider::default(),
            )),
            noop: Arc::new(NoopHandler),
        }
    }
}

impl PgWireServerHandlers for VisitdFactory {
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
) -> std::io::Result<()> {
    let factory = Arc::new(VisitdFactory::new(engine, password));
    pgwire::tokio::process_socket(socket, tls, factory).await
}

// ── Errors ───────────────────────────────────────────────────────

fn sqlstate(e: &EngineError) -> &'static str {
    match e {
        EngineError::NotFound(_) => "P0002",
        EngineError::Unavailable(_) => "55000",
        EngineError::Forbidden(_) => "42501",
        EngineError::InvalidStatus(_) => "22023",
        EngineError::Conflict { .. } => "23P01",
        EngineError::AlreadyExists(_)
        | EngineError::InvalidInput(_)
        | EngineError::LimitExceeded(_)
        | EngineError::WalError(_) => "P0001",
    }
}

fn engine_err(e: EngineError) -> PgWireError {
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
