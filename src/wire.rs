use std::fmt::Debug;
use std::io;
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
    DataRowEncoder, DescribePortalResponse, DescribeStatementResponse, FieldInfo, QueryResponse,
    Response, Tag,
};
use pgwire::api::stmt::{QueryParser, StoredStatement};
use pgwire::api::store::PortalStore;
use pgwire::api::{ClientInfo, ClientPortalStore, NoopHandler, PgWireServerHandlers, Type};
use pgwire::error::{ErrorInfo, PgWireError, PgWireResult};
use pgwire::messages::PgWireBackendMessage;
use pgwire::tokio::TlsAcceptor;
use tokio::net::TcpStream;

use crate::auth::MedSlotAuthSource;
use crate::engine::{Engine, EngineError};
use crate::observability::{QUERIES_TOTAL, QUERY_DURATION_SECONDS, command_label};
use crate::sql::{self, Command, SqlError};
use crate::tenant::TenantManager;

pub struct MedSlotHandler {
    tenant_manager: Arc<TenantManager>,
    query_parser: Arc<MedSlotQueryParser>,
}

impl MedSlotHandler {
    pub fn new(tenant_manager: Arc<TenantManager>) -> Self {
        Self {
            tenant_manager,
            query_parser: Arc::new(MedSlotQueryParser),
        }
    }

    /// The database name a client connects to selects the clinic.
    fn resolve_engine<C: ClientInfo>(&self, client: &C) -> PgWireResult<Arc<Engine>> {
        let db = client
            .metadata()
            .get("database")
            .cloned()
            .unwrap_or_else(|| "default".to_string());
        self.tenant_manager.get_or_create(&db).map_err(|e| {
            PgWireError::UserError(Box::new(ErrorInfo::new(
                "ERROR".into(),
                "08006".into(),
                format!("tenant error: {e}"),
            )))
        })
    }

    /// Run one command, recording its latency and outcome.
    async fn run(&self, engine: &Engine, sql: &str, format: &Format) -> PgWireResult<Response> {
        let cmd = sql::parse_sql(sql).map_err(|e| {
            metrics::counter!(QUERIES_TOTAL, "command" => "parse", "status" => "error").increment(1);
            sql_err(e)
        })?;
        let label = command_label(&cmd);
        let started = Instant::now();
        let result = self.execute_command(engine, cmd, format).await;
        metrics::histogram!(QUERY_DURATION_SECONDS, "command" => label)
            .record(started.elapsed().as_secs_f64());
        let status = if result.is_ok() { "ok" } else { "error" };
        metrics::counter!(QUERIES_TOTAL, "command" => label, "status" => status).increment(1);
        result
    }

    async fn execute_command(
        &self,
        engine: &Engine,
        cmd: Command,
        format: &Format,
    ) -> PgWireResult<Response> {
        match cmd {
            Command::InsertDoctor { id, name, specialization } => {
                engine
                    .register_doctor(id, name, specialization)
                    .await
                    .map_err(engine_err)?;
                Ok(Response::Execution(Tag::new("INSERT").with_rows(1)))
            }
            Command::InsertPatient { id, first_name, second_name, phone } => {
                engine
                    .register_patient(id, first_name, second_name, phone)
                    .await
                    .map_err(engine_err)?;
                Ok(Response::Execution(Tag::new("INSERT").with_rows(1)))
            }
            Command::InsertSchedule {
                id,
                doctor_id,
                date,
                start,
                end,
                capacity,
                price,
            } => {
                engine
                    .create_schedule(id, doctor_id, date, start, end, capacity, price)
                    .await
                    .map_err(engine_err)?;
                Ok(Response::Execution(Tag::new("INSERT").with_rows(1)))
            }
            Command::UpdateSchedule { id, patch } => {
                engine.update_schedule(id, patch).await.map_err(engine_err)?;
                Ok(Response::Execution(Tag::new("UPDATE").with_rows(1)))
            }
            Command::DeleteSchedule { id } => {
                engine.delete_schedule(id).await.map_err(engine_err)?;
                Ok(Response::Execution(Tag::new("DELETE").with_rows(1)))
            }
            Command::InsertAppointment {
                id,
                schedule_id,
                doctor_id,
                patient_id,
            } => {
                engine
                    .book(id, schedule_id, doctor_id, patient_id)
                    .await
                    .map_err(engine_err)?;
                Ok(Response::Execution(Tag::new("INSERT").with_rows(1)))
            }
            Command::UpdateAppointment { id, status, payment_status } => {
                engine
                    .update_appointment(id, status, payment_status)
                    .await
                    .map_err(engine_err)?;
                Ok(Response::Execution(Tag::new("UPDATE").with_rows(1)))
            }
            Command::DeleteAppointment { id } => {
                engine.delete_appointment(id).await.map_err(engine_err)?;
                Ok(Response::Execution(Tag::new("DELETE").with_rows(1)))
            }
            Command::SelectDoctors => {
                let schema = Arc::new(ResultKind::Doctors.schema(format));
                let rows: Vec<PgWireResult<_>> = engine
                    .list_doctors()
                    .into_iter()
                    .map(|doctor| {
                        let mut encoder = DataRowEncoder::new(schema.clone());
                        encoder.encode_field(&doctor.id.to_string())?;
                        encoder.encode_field(&doctor.name)?;
                        encoder.encode_field(&doctor.specialization)?;
                        Ok(encoder.take_row())
                    })
                    .collect();
                Ok(Response::Query(QueryResponse::new(schema, stream::iter(rows))))
            }
            Command::SelectSchedules { id, filter } => {
                let schedules = match id {
                    Some(id) => match engine.get_schedule(id).await {
                        Ok(info) => vec![info],
                        Err(EngineError::NotFound { .. }) => vec![],
                        Err(e) => return Err(engine_err(e)),
                    },
                    None => engine.list_schedules(&filter).await,
                };
                let schema = Arc::new(ResultKind::Schedules.schema(format));
                let rows: Vec<PgWireResult<_>> = schedules
                    .iter()
                    .map(|s| {
                        let mut encoder = DataRowEncoder::new(schema.clone());
                        encoder.encode_field(&s.id.to_string())?;
                        encoder.encode_field(&s.doctor_id.to_string())?;
                        encoder.encode_field(&s.doctor_name)?;
                        encoder.encode_field(&s.specialization)?;
                        encoder.encode_field(&s.date.format("%Y-%m-%d").to_string())?;
                        encoder.encode_field(&s.start.format("%H:%M:%S").to_string())?;
                        encoder.encode_field(&s.end.format("%H:%M:%S").to_string())?;
                        encoder.encode_field(&i64::from(s.capacity))?;
                        encoder.encode_field(&i64::from(s.occupancy))?;
                        encoder.encode_field(&s.price)?;
                        encoder.encode_field(&s.status.as_str())?;
                        Ok(encoder.take_row())
                    })
                    .collect();
                Ok(Response::Query(QueryResponse::new(schema, stream::iter(rows))))
            }
            Command::SelectAppointments { id, schedule_id } => {
                let appointments = match id {
                    Some(id) => match engine.get_appointment(id).await {
                        Ok(info) if schedule_id.is_none_or(|s| s == info.schedule_id) => vec![info],
                        Ok(_) | Err(EngineError::NotFound { .. }) => vec![],
                        Err(e) => return Err(engine_err(e)),
                    },
                    None => match schedule_id {
                        Some(schedule_id) => engine.list_appointments(schedule_id).await,
                        None => vec![],
                    },
                };
                let schema = Arc::new(ResultKind::Appointments.schema(format));
                let rows: Vec<PgWireResult<_>> = appointments
                    .iter()
                    .map(|a| {
                        let mut encoder = DataRowEncoder::new(schema.clone());
                        encoder.encode_field(&a.id.to_string())?;
                        encoder.encode_field(&a.schedule_id.to_string())?;
                        encoder.encode_field(&a.doctor_id.to_string())?;
                        encoder.encode_field(&a.patient_id.to_string())?;
                        encoder.encode_field(&a.first_name)?;
                        encoder.encode_field(&a.second_name)?;
                        encoder.encode_field(&a.phone)?;
                        encoder.encode_field(&a.status.as_str())?;
                        encoder.encode_field(&a.payment_status)?;
                        encoder.encode_field(&a.created_at)?;
                        Ok(encoder.take_row())
                    })
                    .collect();
                Ok(Response::Query(QueryResponse::new(schema, stream::iter(rows))))
            }
        }
    }
}

// ── Result schemas ───────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ResultKind {
    Doctors,
    Schedules,
    Appointments,
}

impl ResultKind {
    /// Guess the result shape of a statement without binding its parameters.
    fn of(sql: &str) -> Option<Self> {
        let upper = sql.to_uppercase();
        let mut words = upper.split_whitespace();
        if words.next() != Some("SELECT") {
            return None;
        }
        let table = words.skip_while(|w| *w != "FROM").nth(1)?;
        match table.trim_end_matches(';') {
            "DOCTORS" => Some(ResultKind::Doctors),
            "SCHEDULES" => Some(ResultKind::Schedules),
            "APPOINTMENTS" => Some(ResultKind::Appointments),
            _ => None,
        }
    }

    fn columns(self) -> &'static [(&'static str, Type)] {
        match self {
            ResultKind::Doctors => &[
                ("id", Type::VARCHAR),
                ("name", Type::VARCHAR),
                ("specialization", Type::VARCHAR),
            ],
            ResultKind::Schedules => &[
                ("id", Type::VARCHAR),
                ("doctor_id", Type::VARCHAR),
                ("doctor_name", Type::VARCHAR),
                ("specialization", Type::VARCHAR),
                ("schedule_date", Type::VARCHAR),
                ("start_time", Type::VARCHAR),
                ("end_time", Type::VARCHAR),
                ("max_patients", Type::INT8),
                ("booked_count", Type::INT8),
                ("price", Type::INT8),
                ("status", Type::VARCHAR),
            ],
            ResultKind::Appointments => &[
                ("id", Type::VARCHAR),
                ("schedule_id", Type::VARCHAR),
                ("doctor_id", Type::VARCHAR),
                ("patient_id", Type::VARCHAR),
                ("first_name", Type::VARCHAR),
                ("second_name", Type::VARCHAR),
                ("phone", Type::VARCHAR),
                ("status", Type::VARCHAR),
                ("payment_status", Type::VARCHAR),
                ("created_at", Type::INT8),
            ],
        }
    }

    fn schema(self, format: &Format) -> Vec<FieldInfo> {
        self.columns()
            .iter()
            .enumerate()
            .map(|(i, (name, ty))| {
                FieldInfo::new((*name).into(), None, None, ty.clone(), format.format_for(i))
            })
            .collect()
    }
}

fn statement_schema(sql: &str, format: &Format) -> Vec<FieldInfo> {
    ResultKind::of(sql).map_or_else(Vec::new, |kind| kind.schema(format))
}

#[async_trait]
impl SimpleQueryHandler for MedSlotHandler {
    async fn do_query<C>(&self, client: &mut C, query: &str) -> PgWireResult<Vec<Response>>
    where
        C: ClientInfo + ClientPortalStore + Sink<PgWireBackendMessage> + Unpin + Send + Sync,
        C::Error: Debug,
        PgWireError: From<C::Error>,
    {
        let engine = self.resolve_engine(client)?;
        let response = self.run(&engine, query, &Format::UnifiedText).await?;
        Ok(vec![response])
    }
}

// ── Extended Query Protocol ──────────────────────────────────────

#[derive(Debug)]
pub struct MedSlotQueryParser;

#[async_trait]
impl QueryParser for MedSlotQueryParser {
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
        column_format: Option<&Format>,
    ) -> PgWireResult<Vec<FieldInfo>> {
        Ok(statement_schema(stmt, column_format.unwrap_or(&Format::UnifiedText)))
    }
}

#[async_trait]
impl ExtendedQueryHandler for MedSlotHandler {
    type Statement = String;
    type QueryParser = MedSlotQueryParser;

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
        self.run(&engine, &sql, &portal.result_column_format).await
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
        let fields = statement_schema(&target.statement, &Format::UnifiedBinary);
        Ok(DescribeStatementResponse::new(param_types, fields))
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
        Ok(DescribePortalResponse::new(statement_schema(
            &target.statement.statement,
            &target.result_column_format,
        )))
    }
}

/// Count the highest $N parameter placeholder in the SQL string.
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

fn substitute_params(portal: &Portal<String>) -> String {
    bind_params(&portal.statement.statement, &portal.parameters)
}

/// Replace `$N` placeholders with bound values as quoted literals, in a single
/// left-to-right pass. Placeholders inside string literals and inside the
/// inserted values are never expanded; a `$N` with no bound value stays as is.
fn bind_params<B: AsRef<[u8]>>(sql: &str, params: &[Option<B>]) -> String {
    let bytes = sql.as_bytes();
    let mut out = String::with_capacity(sql.len());
    let mut copied = 0;
    let mut in_literal = false;
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            // A doubled quote toggles twice, so escapes need no special case.
            b'\'' => {
                in_literal = !in_literal;
                i += 1;
            }
            b'$' if !in_literal => {
                let start = i + 1;
                let mut end = start;
                while end < bytes.len() && bytes[end].is_ascii_digit() {
                    end += 1;
                }
                let bound = sql[start..end]
                    .parse::<usize>()
                    .ok()
                    .and_then(|n| n.checked_sub(1))
                    .and_then(|n| params.get(n));
                if let Some(value) = bound {
                    out.push_str(&sql[copied..i]);
                    match value {
                        Some(value) => {
                            out.push('\'');
                            out.push_str(&String::from_utf8_lossy(value.as_ref()).replace('\'', "''"));
                            out.push('\'');
                        }
                        None => out.push_str("NULL"),
                    }
                    copied = end;
                }
                i = end;
            }
            _ => i += 1,
        }
    }
    out.push_str(&sql[copied..]);
    out
}

// ── Factory ──────────────────────────────────────────────────────

pub struct MedSlotFactory {
    handler: Arc<MedSlotHandler>,
    auth_handler:
        Arc<CleartextPasswordAuthStartupHandler<MedSlotAuthSource, DefaultServerParameterProvider>>,
    noop: Arc<NoopHandler>,
}

impl MedSlotFactory {
    pub fn new(tenant_manager: Arc<TenantManager>, password: String) -> Self {
        Self {
            handler: Arc::new(MedSlotHandler::new(tenant_manager)),
            auth_handler: Arc::new(CleartextPasswordAuthStartupHandler::new(
                MedSlotAuthSource::new(password),
                DefaultServerParameterProvider::default(),
            )),
            noop: Arc::new(NoopHandler),
        }
    }
}

impl PgWireServerHandlers for MedSlotFactory {
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
    password: String,
    tls: Option<TlsAcceptor>,
) -> io::Result<()> {
    let factory = Arc::new(MedSlotFactory::new(tenant_manager, password));
    pgwire::tokio::process_socket(socket, tls, factory)
        .await
        .map_err(io::Error::other)
}

fn engine_err(e: EngineError) -> PgWireError {
    PgWireError::UserError(Box::new(ErrorInfo::new(
        "ERROR".into(),
        e.sqlstate().into(),
        e.to_string(),
    )))
}

fn sql_err(e: SqlError) -> PgWireError {
    PgWireError::UserError(Box::new(ErrorInfo::new(
        "ERROR".into(),
        e.sqlstate().into(),
        e.to_string(),
    )))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn count_params_finds_highest_index() {
        assert_eq!(count_params("SELECT * FROM doctors"), 0);
        assert_eq!(count_params("DELETE FROM schedules WHERE id = $1"), 1);
        assert_eq!(
            count_params("INSERT INTO appointments VALUES ($1, $2, $3, $10)"),
            10
        );
        assert_eq!(count_params("SELECT '$' FROM doctors"), 0);
    }

    #[test]
    fn bound_values_are_not_expanded_again() {
        let params = [Some(b"01ARZ3NDEKTSV4RRFFQ69G5FAV".to_vec()), Some(b"PAID via $1".to_vec())];
        assert_eq!(
            bind_params("UPDATE appointments SET payment_status = $2 WHERE id = $1", &params),
            "UPDATE appointments SET payment_status = 'PAID via $1' WHERE id = '01ARZ3NDEKTSV4RRFFQ69G5FAV'"
        );
    }

    #[test]
    fn bind_params_quotes_and_skips_literals() {
        let params = [Some(b"O'Brien".to_vec()), None];
        assert_eq!(
            bind_params("SELECT '$1', 'it''s $2', $1, $2, $3", &params),
            "SELECT '$1', 'it''s $2', 'O''Brien', NULL, $3"
        );

        let many: Vec<Option<Vec<u8>>> = (1..=10).map(|n| Some(n.to_string().into_bytes())).collect();
        assert_eq!(bind_params("VALUES ($10, $1)", &many), "VALUES ('10', '1')");
    }

    #[test]
    fn result_kind_from_statement() {
        assert_eq!(ResultKind::of("SELECT * FROM schedules WHERE id = $1"), Some(ResultKind::Schedules));
        assert_eq!(ResultKind::of("select * from appointments;"), Some(ResultKind::Appointments));
        assert_eq!(ResultKind::of("  SELECT id, name FROM doctors"), Some(ResultKind::Doctors));
        assert_eq!(ResultKind::of("DELETE FROM schedules WHERE id = $1"), None);
        assert_eq!(ResultKind::of("SELECT * FROM billing"), None);
    }

    #[test]
    fn schedule_schema_has_counters() {
        let schema = ResultKind::Schedules.schema(&Format::UnifiedText);
        let names: Vec<&str> = schema.iter().map(|f| f.name()).collect();
        assert!(names.contains(&"max_patients"));
        assert!(names.contains(&"booked_count"));
        assert_eq!(schema.len(), ResultKind::Schedules.columns().len());
    }
}
