use std::fmt::Debug;
use std::sync::Arc;
use std::time::Instant;

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

use crate::auth::SharedPasswordAuthSource;
use crate::engine::{Engine, EngineError};
use crate::model::*;
use crate::observability;
use crate::session::{self, Session};
use crate::sql::{self, Command, EquipmentFilter, LoanFilter, SqlError, UserFilter};
use crate::tenant::TenantManager;
use crate::validate;

pub struct EquiploanHandler {
    tenant_manager: Arc<TenantManager>,
    service_user: String,
    query_parser: Arc<EquiploanQueryParser>,
}

/// Tenant and login name of a connection, copied out of the client metadata.
struct Identity {
    database: String,
    user: String,
}

fn identity<C: ClientInfo>(client: &C) -> Identity {
    let meta = client.metadata();
    let user = meta.get("user").cloned().unwrap_or_default();
    let database = meta.get("database").cloned().unwrap_or_else(|| user.clone());
    Identity { database, user }
}

impl EquiploanHandler {
    pub fn new(tenant_manager: Arc<TenantManager>, service_user: String) -> Self {
        Self {
            tenant_manager,
            service_user,
            query_parser: Arc::new(EquiploanQueryParser),
        }
    }

    fn resolve_engine(&self, who: &Identity) -> PgWireResult<Arc<Engine>> {
        self.tenant_manager
            .get_or_create(&who.database)
            .map_err(|e| user_error("08006", format!("tenant error: {e}")))
    }

    async fn resolve_session(&self, engine: &Engine, who: &Identity) -> PgWireResult<Session> {
        if who.user == self.service_user {
            return Ok(Session::Service);
        }
        engine.sign_in(&who.user).await.map(Session::Member).map_err(|e| {
            metrics::counter!(observability::AUTH_FAILURES_TOTAL).increment(1);
            warn!("session refused for {} on {}: {e}", who.user, who.database);
            user_error("28000", e.to_string())
        })
    }

    /// Parse, authorize and execute one statement, recording RED metrics.
    async fn run(&self, who: Identity, sql: &str) -> PgWireResult<Response> {
        let engine = self.resolve_engine(&who)?;
        let cmd = sql::parse_sql(sql).map_err(sql_err)?;
        let label = observability::command_label(&cmd);
        let session = self.resolve_session(&engine, &who).await?;

        let started = Instant::now();
        let result = match session::authorize(&session, &cmd) {
            Ok(()) => self.execute(&engine, &session, cmd).await,
            Err(e) => Err(e),
        };
        metrics::histogram!(observability::QUERY_DURATION_SECONDS, "command" => label)
            .record(started.elapsed().as_secs_f64());
        let status = if result.is_ok() { "ok" } else { "error" };
        metrics::counter!(observability::QUERIES_TOTAL, "command" => label, "status" => status)
            .increment(1);
        if let Err(e) = &result {
            debug!("{label} by {} failed: {e}", who.user);
        }
        result.map_err(engine_err)
    }

    async fn execute(
        &self,
        engine: &Engine,
        session: &Session,
        cmd: Command,
    ) -> Result<Response, EngineError> {
        match cmd {
            Command::InsertUser {
                id,
                email,
                first_name,
                last_name,
                role,
            } => {
                let role = match role {
                    Some(r) => validate::role(&r)?,
                    None => Role::User,
                };
                engine
                    .register_user(id, email, first_name, last_name, role)
                    .await?;
                Ok(Response::Execution(Tag::new("INSERT").with_rows(1)))
            }
            Command::UpdateUser {
                id,
                email,
                first_name,
                last_name,
                role,
            } => {
                let role = role.map(|r| validate::role(&r)).transpose()?;
                engine
                    .update_user(id, email, first_name, last_name, role)
                    .await?;
                Ok(Response::Execution(Tag::new("UPDATE").with_rows(1)))
            }
            Command::SetUserStatus { id, status } => {
                engine.set_user_status(id, status).await?;
                Ok(Response::Execution(Tag::new("UPDATE").with_rows(1)))
            }
            Command::DeleteUser { id, force } => {
                engine.delete_user(id, force).await?;
                Ok(Response::Execution(Tag::new("DELETE").with_rows(1)))
            }
            Command::SelectUsers { filter } => {
                let users = match filter {
                    UserFilter::All => engine.list_users().await,
                    UserFilter::Id(id) => engine.get_user(id).await.into_iter().collect(),
                    UserFilter::Email(email) => {
                        engine.find_user_by_email(&email).await.into_iter().collect()
                    }
                };
                user_rows(&users)
            }
            Command::SelectProfile => {
                let me: Vec<UserInfo> = match session.member() {
                    Some(me) => engine.get_user(me.id).await.into_iter().collect(),
                    None => Vec::new(),
                };
                user_rows(&me)
            }
            Command::InsertEquipment {
                id,
                name,
                kind,
                reference,
                description,
            } => {
                engine
                    .add_equipment(id, name, kind, reference, description)
                    .await?;
                Ok(Response::Execution(Tag::new("INSERT").with_rows(1)))
            }
            Command::SetEquipmentStatus { id, status } => {
                engine.set_equipment_status(id, status).await?;
                Ok(Response::Execution(Tag::new("UPDATE").with_rows(1)))
            }
            Command::DeleteEquipment { id } => {
                engine.delete_equipment(id).await?;
                Ok(Response::Execution(Tag::new("DELETE").with_rows(1)))
            }
            Command::SelectEquipment { filter } => {
                let items = match filter {
                    EquipmentFilter::All => engine.list_equipment().await,
                    EquipmentFilter::Id(id) => engine.get_equipment(id).await.into_iter().collect(),
                    EquipmentFilter::Status(EquipmentStatus::Available) => {
                        engine.list_available_equipment().await
                    }
                    EquipmentFilter::Status(status) => {
                        let mut all = engine.list_equipment().await;
                        all.retain(|e| e.status == status);
                        all
                    }
                };
                equipment_rows(&items)
            }
            Command::InsertLoan {
                id,
                equipment_id,
                borrow_date,
                return_date,
                user_id,
            } => {
                let borrower = user_id
                    .or_else(|| session.member().map(|u| u.id))
                    .ok_or(EngineError::PermissionDenied(
                        "borrow without a member identity (set user_id)",
                    ))?;
                engine
                    .borrow(id, equipment_id, borrower, borrow_date, return_date)
                    .await?;
                Ok(Response::Execution(Tag::new("INSERT").with_rows(1)))
            }
            Command::DeleteLoan { id } => {
                let loan = engine.get_loan(id).await.ok_or(EngineError::NotFound(id))?;
                if !session.is_admin() && !session.is_self(loan.user_id) {
                    return Err(EngineError::PermissionDenied("cancel another user's loan"));
                }
                engine.cancel_loan(id).await?;
                Ok(Response::Execution(Tag::new("DELETE").with_rows(1)))
            }
            Command::SelectLoans { filter } => {
                let loans = match filter {
                    LoanFilter::All => engine.list_loans().await,
                    LoanFilter::Equipment(id) => engine.loans_for_equipment(id).await,
                    LoanFilter::User(id) => engine.loans_for_user(id).await,
                };
                loan_rows(&loans)
            }
        }
    }
}

// ── Result sets ──────────────────────────────────────────────────

fn text_field(name: &str) -> FieldInfo {
    FieldInfo::new(name.into(), None, None, Type::VARCHAR, FieldFormat::Text)
}

fn int8_field(name: &str) -> FieldInfo {
    FieldInfo::new(name.into(), None, None, Type::INT8, FieldFormat::Text)
}

fn users_schema() -> Vec<FieldInfo> {
    vec![
        text_field("id"),
        text_field("email"),
        text_field("first_name"),
        text_field("last_name"),
        text_field("role"),
        text_field("status"),
        int8_field("created_at"),
    ]
}

fn equipment_schema() -> Vec<FieldInfo> {
    vec![
        text_field("id"),
        text_field("name"),
        text_field("type"),
        text_field("ref"),
        text_field("description"),
        text_field("status"),
        text_field("image"),
    ]
}

fn loans_schema() -> Vec<FieldInfo> {
    vec![
        text_field("id"),
        text_field("equipment_id"),
        text_field("user_id"),
        int8_field("borrow_date"),
        int8_field("return_date"),
    ]
}

/// Result columns of a SELECT, so prepared statements can be described.
fn schema_for(sql: &str) -> Vec<FieldInfo> {
    match sql::select_table(sql).as_deref() {
        Some("users" | "profile") => users_schema(),
        Some("equipment") => equipment_schema(),
        Some("loans") => loans_schema(),
        _ => Vec::new(),
    }
}

fn rows_response<T>(
    schema: Vec<FieldInfo>,
    items: &[T],
    encode: impl Fn(&mut DataRowEncoder, &T) -> PgWireResult<()>,
) -> Result<Response, EngineError> {
    let schema = Arc::new(schema);
    let rows: Vec<PgWireResult<_>> = items
        .iter()
        .map(|item| {
            let mut encoder = DataRowEncoder::new(schema.clone());
            encode(&mut encoder, item)?;
            Ok(encoder.take_row())
        })
        .collect();
    Ok(Response::Query(QueryResponse::new(schema, stream::iter(rows))))
}

fn user_rows(users: &[UserInfo]) -> Result<Response, EngineError> {
    rows_response(users_schema(), users, |enc, u| {
        enc.encode_field(&u.id.to_string())?;
        enc.encode_field(&u.email)?;
        enc.encode_field(&u.first_name)?;
        enc.encode_field(&u.last_name)?;
        enc.encode_field(&u.role.as_str().to_string())?;
        enc.encode_field(&u.status.as_str().to_string())?;
        enc.encode_field(&u.created_at)
    })
}

fn equipment_rows(items: &[EquipmentInfo]) -> Result<Response, EngineError> {
    rows_response(equipment_schema(), items, |enc, e| {
        enc.encode_field(&e.id.to_string())?;
        enc.encode_field(&e.name)?;
        enc.encode_field(&e.kind)?;
        enc.encode_field(&e.reference)?;
        enc.encode_field(&e.description)?;
        enc.encode_field(&e.status.as_str().to_string())?;
        enc.encode_field(&e.image)
    })
}

fn loan_rows(loans: &[LoanInfo]) -> Result<Response, EngineError> {
    rows_response(loans_schema(), loans, |enc, l| {
        enc.encode_field(&l.id.to_string())?;
        enc.encode_field(&l.equipment_id.to_string())?;
        enc.encode_field(&l.user_id.to_string())?;
        enc.encode_field(&l.borrow_date)?;
        enc.encode_field(&l.return_date)
    })
}

#[async_trait]
impl SimpleQueryHandler for EquiploanHandler {
    async fn do_query<C>(&self, client: &mut C, query: &str) -> PgWireResult<Vec<Response>>
    where
        C: ClientInfo + ClientPortalStore + Sink<PgWireBackendMessage> + Unpin + Send + Sync,
        C::Error: Debug,
        PgWireError: From<C::Error>,
    {
        let who = identity(client);
        Ok(vec![self.run(who, query).await?])
    }
}

// ── Extended Query Protocol ──────────────────────────────────────

#[derive(Debug)]
pub struct EquiploanQueryParser;

#[async_trait]
impl QueryParser for EquiploanQueryParser {
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
impl ExtendedQueryHandler for EquiploanHandler {
    type Statement = String;
    type QueryParser = EquiploanQueryParser;

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
        let who = identity(client);
        let sql = substitute_params(&portal.statement.statement, &portal.parameters);
        self.run(who, &sql).await
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
        Ok(DescribeStatementResponse::new(param_types, schema_for(&target.statement)))
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
        Ok(DescribePortalResponse::new(schema_for(&target.statement.statement)))
    }
}

/// Highest `$N` placeholder number in the statement.
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

/// Replace `$1, $2, ...` with the bound values as quoted text literals.
/// Highest numbers go first so `$1` never clobbers the prefix of `$10`.
fn substitute_params<B: AsRef<[u8]>>(sql: &str, params: &[Option<B>]) -> String {
    let mut result = sql.to_string();
    for (i, param) in params.iter().enumerate().rev() {
        let value = match param {
            Some(bytes) => {
                let text = String::from_utf8_lossy(bytes.as_ref());
                format!("'{}'", text.replace('\'', "''"))
            }
            None => "NULL".to_string(),
        };
        result = result.replace(&format!("${}", i + 1), &value);
    }
    result
}

// ── Factory ──────────────────────────────────────────────────────

pub struct EquiploanFactory {
    handler: Arc<EquiploanHandler>,
    auth_handler: Arc<
        CleartextPasswordAuthStartupHandler<SharedPasswordAuthSource, DefaultServerParameterProvider>,
    >,
    noop: Arc<NoopHandler>,
}

impl EquiploanFactory {
    pub fn new(tenant_manager: Arc<TenantManager>, password: String, service_user: String) -> Self {
        Self {
            handler: Arc::new(EquiploanHandler::new(tenant_manager, service_user)),
            auth_handler: Arc::new(CleartextPasswordAuthStartupHandler::new(
                SharedPasswordAuthSource::new(password),
                DefaultServerParameterProvider::default(),
            )),
            noop: Arc::new(NoopHandler),
        }
    }
}

impl PgWireServerHandlers for EquiploanFactory {
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
    tenants: Arc<TenantManager>,
    password: String,
    service_user: String,
    tls: Option<TlsAcceptor>,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let factory = Arc::new(EquiploanFactory::new(tenants, password, service_user));
    pgwire::tokio::process_socket(socket, tls, factory).await?;
    Ok(())
}

// ── Errors ───────────────────────────────────────────────────────

fn user_error(code: &str, message: String) -> PgWireError {
    PgWireError::UserError(Box::new(ErrorInfo::new("ERROR".into(), code.into(), message)))
}

/// SQLSTATE for an engine failure.
fn sqlstate(e: &EngineError) -> &'static str {
    match e {
        EngineError::NotFound(_) => "P0002",
        EngineError::PermissionDenied(_) => "42501",
        EngineError::WalError(_) => "58030",
        _ => "P0001",
    }
}

fn engine_err(e: EngineError) -> PgWireError {
    user_error(sqlstate(&e), e.to_string())
}

fn sql_err(e: SqlError) -> PgWireError {
    user_error("42601", e.to_string())
}
