use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, PoisonError};

use anyhow::{Context, Result};
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use clap::Parser;
use coin_ledger_api::{
    AdjustRequest, AdjustmentResult, LeaderboardView, LedgerSession, RosterView, StoreConfig,
    API_CONTRACT_VERSION,
};
use coin_ledger_core::{LedgerError, MemberView};
use coin_ledger_store_sheets::{
    SheetsConfig, DEFAULT_API_BASE, DEFAULT_KEY_FILE, DEFAULT_SECRET_NAME,
};
use serde::Serialize;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

const SERVICE_CONTRACT_VERSION: &str = "service.v1";
const OPENAPI_YAML: &str = include_str!("../../../openapi/openapi.yaml");
const DEFAULT_LOG_FILTER: &str = "coin_ledger_api=info,coin_ledger_service=info";

#[derive(Clone)]
struct ServiceState {
    session: Arc<Mutex<LedgerSession>>,
}

#[derive(Debug, Clone, Serialize)]
struct ServiceEnvelope<T>
where
    T: Serialize,
{
    service_contract_version: &'static str,
    api_contract_version: &'static str,
    data: T,
}

#[derive(Debug, Clone, Serialize)]
struct ServiceError {
    #[serde(skip)]
    status: StatusCode,
    service_contract_version: &'static str,
    error: String,
    kind: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    diverged: Option<bool>,
}

#[derive(Debug, Clone, Serialize)]
struct HealthResponse {
    status: &'static str,
}

#[derive(Debug, Parser)]
#[command(name = "coin-ledger-service")]
#[command(about = "Local HTTP service for the club coin ledger")]
struct Args {
    #[arg(long, default_value = "./coin_ledger.sqlite3")]
    db: PathBuf,
    /// Use a spreadsheet as the ledger store instead of `SQLite`.
    #[arg(long)]
    sheet_id: Option<String>,
    /// Worksheet title or A1 range starting at `A1`; defaults to the first
    /// worksheet.
    #[arg(long)]
    range: Option<String>,
    #[arg(long, default_value = DEFAULT_SECRET_NAME)]
    secret_name: String,
    #[arg(long, default_value = DEFAULT_KEY_FILE)]
    key_file: PathBuf,
    #[arg(long, default_value = DEFAULT_API_BASE, hide = true)]
    sheets_api_base: String,
    #[arg(long, default_value = "127.0.0.1:4020")]
    bind: SocketAddr,
}

impl Args {
    fn store_config(&self) -> StoreConfig {
        match &self.sheet_id {
            Some(spreadsheet_id) => StoreConfig::Sheets {
                sheets: SheetsConfig {
                    api_base: self.sheets_api_base.clone(),
                    spreadsheet_id: spreadsheet_id.clone(),
                    range: self.range.clone(),
                },
                secret_name: self.secret_name.clone(),
                key_file: self.key_file.clone(),
            },
            None => StoreConfig::Sqlite { db_path: self.db.clone() },
        }
    }
}

impl IntoResponse for ServiceError {
    fn into_response(self) -> Response {
        (self.status, Json(self)).into_response()
    }
}

impl From<LedgerError> for ServiceError {
    fn from(err: LedgerError) -> Self {
        let status = match &err {
            LedgerError::MemberNotFound(_) => StatusCode::NOT_FOUND,
            LedgerError::NotEligible { .. } => StatusCode::CONFLICT,
            LedgerError::Validation(_) => StatusCode::BAD_REQUEST,
            LedgerError::StoreWrite { .. } => StatusCode::BAD_GATEWAY,
            LedgerError::Schema(_) | LedgerError::Connection(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };
        let diverged = matches!(err, LedgerError::StoreWrite { .. }).then_some(true);
        ServiceError {
            status,
            service_contract_version: SERVICE_CONTRACT_VERSION,
            error: err.to_string(),
            kind: err.kind(),
            diverged,
        }
    }
}

impl ServiceState {
    fn new(session: LedgerSession) -> Self {
        Self { session: Arc::new(Mutex::new(session)) }
    }

    fn internal(message: impl Into<String>) -> ServiceError {
        ServiceError {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            service_contract_version: SERVICE_CONTRACT_VERSION,
            error: message.into(),
            kind: "internal",
            diverged: None,
        }
    }

    /// Run `operation` against the session on the blocking pool; store calls
    /// may do network or disk I/O.
    async fn with_session<T, F>(&self, operation: F) -> Result<T, ServiceError>
    where
        T: Send + 'static,
        F: FnOnce(&mut LedgerSession) -> Result<T, LedgerError> + Send + 'static,
    {
        let session = Arc::clone(&self.session);
        let outcome = tokio::task::spawn_blocking(move || {
            let mut guard = session.lock().unwrap_or_else(PoisonError::into_inner);
            operation(&mut *guard)
        })
        .await
        .map_err(|err| Self::internal(format!("ledger task failed: {err}")))?;
        outcome.map_err(ServiceError::from)
    }
}

fn envelope<T>(data: T) -> ServiceEnvelope<T>
where
    T: Serialize,
{
    ServiceEnvelope {
        service_contract_version: SERVICE_CONTRACT_VERSION,
        api_contract_version: API_CONTRACT_VERSION,
        data,
    }
}

fn app(state: ServiceState) -> Router {
    Router::new()
        .route("/v1/health", get(health))
        .route("/v1/openapi", get(openapi))
        .route("/v1/members", get(member_list))
        .route("/v1/members/:name", get(member_show))
        .route("/v1/members/:name/redeem", post(member_redeem))
        .route("/v1/leaderboard", get(leaderboard))
        .route("/v1/admin/adjustments", post(admin_adjust))
        .with_state(state)
}

fn init_tracing() {
    let filter = std::env::var("RUST_LOG").unwrap_or_else(|_| DEFAULT_LOG_FILTER.to_string());
    tracing_subscriber::registry()
        .with(EnvFilter::new(filter))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let args = Args::parse();
    let config = args.store_config();
    let session = config
        .open_session()
        .with_context(|| format!("failed to open ledger store {}", config.describe()))?;

    let listener = tokio::net::TcpListener::bind(args.bind)
        .await
        .with_context(|| format!("failed to bind {}", args.bind))?;
    tracing::info!(bind = %args.bind, store = %config.describe(), "coin ledger service listening");
    axum::serve(listener, app(ServiceState::new(session))).await?;
    Ok(())
}

async fn health() -> Json<ServiceEnvelope<HealthResponse>> {
    Json(envelope(HealthResponse { status: "ok" }))
}

async fn openapi() -> impl IntoResponse {
    (StatusCode::OK, [("content-type", "application/yaml; charset=utf-8")], OPENAPI_YAML)
}

async fn member_list(
    State(state): State<ServiceState>,
) -> Result<Json<ServiceEnvelope<RosterView>>, ServiceError> {
    let view = state.with_session(|session| Ok(session.roster())).await?;
    Ok(Json(envelope(view)))
}

async fn member_show(
    State(state): State<ServiceState>,
    Path(name): Path<String>,
) -> Result<Json<ServiceEnvelope<MemberView>>, ServiceError> {
    let view = state.with_session(move |session| session.member(&name)).await?;
    Ok(Json(envelope(view)))
}

async fn member_redeem(
    State(state): State<ServiceState>,
    Path(name): Path<String>,
) -> Result<Json<ServiceEnvelope<AdjustmentResult>>, ServiceError> {
    let result = state.with_session(move |session| session.redeem(&name)).await?;
    Ok(Json(envelope(result)))
}

async fn leaderboard(
    State(state): State<ServiceState>,
) -> Result<Json<ServiceEnvelope<LeaderboardView>>, ServiceError> {
    let view = state.with_session(|session| Ok(session.leaderboard())).await?;
    Ok(Json(envelope(view)))
}

async fn admin_adjust(
    State(state): State<ServiceState>,
    Json(request): Json<AdjustRequest>,
) -> Result<Json<ServiceEnvelope<AdjustmentResult>>, ServiceError> {
    let result = state.with_session(move |session| session.adjust(request)).await?;
    Ok(Json(envelope(result)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::{to_bytes, Body};
    use coin_ledger_core::memory::MemoryStore;
    use coin_ledger_core::{LedgerStore, LedgerTable, LEDGER_HEADER};
    use coin_ledger_store_sqlite::SqliteLedgerStore;
    use http::Request;
    use tower::ServiceExt;

    /// Memory store with `anyhow` errors so it fits the service's session type.
    struct ScriptedStore(MemoryStore);

    impl LedgerStore for ScriptedStore {
        type Error = anyhow::Error;

        fn read_all(&self) -> Result<LedgerTable> {
            Ok(self.0.read_all()?)
        }

        fn write_all(&mut self, table: &LedgerTable) -> Result<()> {
            Ok(self.0.write_all(table)?)
        }
    }

    fn fixture_table() -> LedgerTable {
        let rows = [
            ["Kim", "25", "member", "maintained"],
            ["Lee", "15", "core-group", "maintained"],
            ["Park", "18", "member", "warning(at-risk)"],
            ["Choi", "42", "member", "maintained"],
        ];
        LedgerTable {
            header: LEDGER_HEADER.map(String::from).to_vec(),
            rows: rows.iter().map(|row| row.map(String::from).to_vec()).collect(),
        }
    }

    fn unique_temp_db_path() -> PathBuf {
        std::env::temp_dir().join(format!("coin-ledger-service-{}.sqlite3", ulid::Ulid::new()))
    }

    fn seeded_sqlite_state(db_path: &std::path::Path) -> ServiceState {
        let mut store = SqliteLedgerStore::open(db_path)
            .unwrap_or_else(|err| panic!("failed to open fixture database: {err:#}"));
        store
            .write_table(&fixture_table())
            .unwrap_or_else(|err| panic!("failed to seed fixture database: {err:#}"));
        let session = StoreConfig::Sqlite { db_path: db_path.to_path_buf() }
            .open_session()
            .unwrap_or_else(|err| panic!("failed to open session: {err}"));
        ServiceState::new(session)
    }

    fn memory_state(store: &MemoryStore) -> ServiceState {
        let dyn_store: coin_ledger_api::DynStore = Box::new(ScriptedStore(store.clone()));
        let session = LedgerSession::open(dyn_store)
            .unwrap_or_else(|err| panic!("failed to open session: {err}"));
        ServiceState::new(session)
    }

    async fn send(
        router: &Router,
        method: &str,
        uri: &str,
        body: Option<serde_json::Value>,
    ) -> Response {
        let builder = Request::builder().uri(uri).method(method);
        let request = match body {
            Some(payload) => builder
                .header("content-type", "application/json")
                .body(Body::from(payload.to_string())),
            None => builder.body(Body::empty()),
        }
        .unwrap_or_else(|err| panic!("failed to build request: {err}"));

        match router.clone().oneshot(request).await {
            Ok(response) => response,
            Err(err) => panic!("router request failed: {err}"),
        }
    }

    async fn response_json(response: Response) -> serde_json::Value {
        let bytes = match to_bytes(response.into_body(), 1024 * 1024).await {
            Ok(bytes) => bytes,
            Err(err) => panic!("failed to read response body: {err}"),
        };
        let body = match String::from_utf8(bytes.to_vec()) {
            Ok(body) => body,
            Err(err) => panic!("response body is not UTF-8: {err}"),
        };
        match serde_json::from_str(&body) {
            Ok(value) => value,
            Err(err) => panic!("response body is not JSON: {err}; body={body}"),
        }
    }

    #[tokio::test]
    async fn health_endpoint_reports_ok() {
        let router = app(memory_state(&MemoryStore::new(fixture_table())));

        let response = send(&router, "GET", "/v1/health", None).await;
        assert_eq!(response.status(), StatusCode::OK);

        let value = response_json(response).await;
        assert_eq!(value["service_contract_version"], SERVICE_CONTRACT_VERSION);
        assert_eq!(value["api_contract_version"], API_CONTRACT_VERSION);
        assert_eq!(value["data"]["status"], "ok");
    }

    #[tokio::test]
    async fn openapi_endpoint_lists_every_route() {
        let router = app(memory_state(&MemoryStore::new(fixture_table())));

        let response = send(&router, "GET", "/v1/openapi", None).await;
        assert_eq!(response.status(), StatusCode::OK);

        let bytes = match to_bytes(response.into_body(), 1024 * 1024).await {
            Ok(bytes) => bytes,
            Err(err) => panic!("failed to read response body: {err}"),
        };
        let body = String::from_utf8_lossy(&bytes);
        assert!(body.contains("openapi: 3.1.0"));
        assert!(body.contains("version: service.v1"));
        for route in ["/v1/members/{name}/redeem", "/v1/leaderboard", "/v1/admin/adjustments"] {
            assert!(body.contains(route), "missing {route}");
        }
    }

    #[tokio::test]
    async fn member_views_and_not_found() {
        let db_path = unique_temp_db_path();
        let router = app(seeded_sqlite_state(&db_path));

        let roster = response_json(send(&router, "GET", "/v1/members", None).await).await;
        assert_eq!(roster["data"]["members"], serde_json::json!(["Kim", "Lee", "Park", "Choi"]));

        let response = send(&router, "GET", "/v1/members/Lee", None).await;
        assert_eq!(response.status(), StatusCode::OK);
        let lee = response_json(response).await;
        assert_eq!(lee["data"]["coin"], 15);
        assert_eq!(lee["data"]["membership_status"], "maintained");
        assert_eq!(lee["data"]["can_redeem"], false);

        let response = send(&router, "GET", "/v1/members/Nobody", None).await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        let missing = response_json(response).await;
        assert_eq!(missing["kind"], "member_not_found");

        let _ = std::fs::remove_file(&db_path);
    }

    #[tokio::test]
    async fn redemption_flow_persists_and_rejects_short_balances() {
        let db_path = unique_temp_db_path();
        let router = app(seeded_sqlite_state(&db_path));

        let response = send(&router, "POST", "/v1/members/Kim/redeem", None).await;
        assert_eq!(response.status(), StatusCode::CONFLICT);
        assert_eq!(response_json(response).await["kind"], "not_eligible");

        let response = send(&router, "POST", "/v1/members/Choi/redeem", None).await;
        assert_eq!(response.status(), StatusCode::OK);
        let redeemed = response_json(response).await;
        assert_eq!(redeemed["data"]["coin_after"], 12);
        assert_eq!(redeemed["data"]["status_after"], "warning(at-risk)");

        let stored = match SqliteLedgerStore::open(&db_path).and_then(|store| store.read_table()) {
            Ok(table) => table,
            Err(err) => panic!("failed to read back database: {err:#}"),
        };
        assert_eq!(stored.rows[3], vec!["Choi", "12", "member", "warning(at-risk)"]);

        let _ = std::fs::remove_file(&db_path);
    }

    #[tokio::test]
    async fn admin_adjustment_updates_leaderboard() {
        let store = MemoryStore::new(fixture_table());
        let router = app(memory_state(&store));

        let payload = serde_json::json!({"name": "Park", "delta": 10, "reason": "meeting attendance"});
        let response = send(&router, "POST", "/v1/admin/adjustments", Some(payload)).await;
        assert_eq!(response.status(), StatusCode::OK);
        let adjusted = response_json(response).await;
        assert_eq!(adjusted["data"]["coin_after"], 28);
        assert_eq!(adjusted["data"]["status_after"], "maintained");
        let confirmation = adjusted["data"]["confirmation"].as_str().unwrap_or_default();
        assert!(confirmation.contains("Park") && confirmation.contains("+10"));

        let board = response_json(send(&router, "GET", "/v1/leaderboard", None).await).await;
        let names = board["data"]["entries"]
            .as_array()
            .map(|entries| entries.iter().map(|entry| entry["name"].clone()).collect::<Vec<_>>())
            .unwrap_or_default();
        assert_eq!(names, vec!["Choi", "Park", "Kim", "Lee"]);
        assert_eq!(board["data"]["snapshot_digest"], adjusted["data"]["snapshot_digest"]);
        assert_eq!(store.write_count(), 1);
    }

    #[tokio::test]
    async fn adjustment_input_errors_map_to_client_statuses() {
        let store = MemoryStore::new(fixture_table());
        let router = app(memory_state(&store));

        let payload = serde_json::json!({"name": " ", "delta": 5, "reason": "attendance"});
        let response = send(&router, "POST", "/v1/admin/adjustments", Some(payload)).await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        assert_eq!(response_json(response).await["kind"], "member_not_found");

        let payload = serde_json::json!({"name": "Choi", "delta": i64::MAX, "reason": "bonus"});
        let response = send(&router, "POST", "/v1/admin/adjustments", Some(payload)).await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(response_json(response).await["kind"], "validation");
        assert_eq!(store.write_count(), 0);

        let payload = serde_json::json!({"name": "Kim", "delta": 5, "reason": ""});
        let response = send(&router, "POST", "/v1/admin/adjustments", Some(payload)).await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response_json(response).await["data"]["coin_after"], 30);
        assert_eq!(store.write_count(), 1);
    }

    #[tokio::test]
    async fn failed_store_write_reports_divergence() {
        let store = MemoryStore::new(fixture_table());
        let router = app(memory_state(&store));
        store.fail_writes_with("sheet is read-only");

        let payload = serde_json::json!({"name": "Kim", "delta": -30, "reason": "correction"});
        let response = send(&router, "POST", "/v1/admin/adjustments", Some(payload)).await;
        assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
        let failure = response_json(response).await;
        assert_eq!(failure["kind"], "store_write");
        assert_eq!(failure["diverged"], true);

        let kim = response_json(send(&router, "GET", "/v1/members/Kim", None).await).await;
        assert_eq!(kim["data"]["coin"], -5);
        assert_eq!(kim["data"]["membership_status"], "warning(at-risk)");
        assert_eq!(store.table().rows[0][1], "25");
    }
}
