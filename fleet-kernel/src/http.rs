/**
 * API REST FLEET - Surface d'administration du kernel
 *
 * RÔLE :
 * Expose les opérations de la flotte Telegraf : sweep à la demande, statut
 * temps réel, lecture/écriture de config, test de config, pilotage du
 * service, historique des changements de statut et rapports.
 *
 * FONCTIONNEMENT :
 * - Serveur Axum avec middleware auth API key (header x-api-key)
 * - Routes : /sweep, /status, /hosts, /logs, /reports, /health, /system
 * - Erreurs typées -> code HTTP via ErrorKind, corps JSON {error, message}
 * - Les effets notables (sweep, config, service, check) sont publiés en
 *   FleetEvent via le notifier
 *
 * SÉCURITÉ :
 * - x-api-key obligatoire sur toutes routes sauf /health
 * - Clé absente de la config -> tout est refusé
 */

use axum::extract::{Path, Query, Request, State};
use axum::http::StatusCode;
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;
use tracing::{info, warn};

use crate::clock::Clock;
use crate::config_ops::{ConfigOps, ConfigTest, ConfigUpdate, ServiceActionOutcome};
use crate::error::{ErrorKind, FleetError, StoreError};
use crate::health::{HealthTracker, KernelHealth};
use crate::models::{AuthMethod, Host, HostStatusEvent, HostSummary};
use crate::notify::{publish_sweep, EventNotifier, FleetEvent};
use crate::reports::{self, DailyReport, LogStatistics, RealtimeStatus};
use crate::retention::purge_expired_events;
use crate::store::HostRecordStore;
use crate::sweep::{HostCheck, SweepCoordinator, SweepReport};

const DEFAULT_CLEANUP_DAYS: u32 = 30;

#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn HostRecordStore>,
    pub sweeper: Arc<SweepCoordinator>,
    pub config_ops: Arc<ConfigOps>,
    pub health_tracker: HealthTracker,
    pub notifier: Arc<dyn EventNotifier>,
    pub clock: Arc<dyn Clock>,
    pub api_key: Option<String>,
}

/// Error body shared by every route.
pub struct ApiError(FleetError);

impl From<FleetError> for ApiError {
    fn from(err: FleetError) -> Self {
        ApiError(err)
    }
}

impl From<StoreError> for ApiError {
    fn from(err: StoreError) -> Self {
        ApiError(err.into())
    }
}

pub fn status_for(kind: ErrorKind) -> StatusCode {
    match kind {
        ErrorKind::NotFound => StatusCode::NOT_FOUND,
        ErrorKind::Validation => StatusCode::BAD_REQUEST,
        ErrorKind::Auth => StatusCode::UNAUTHORIZED,
        ErrorKind::Connect | ErrorKind::Command => StatusCode::BAD_GATEWAY,
        ErrorKind::Write | ErrorKind::Store => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let kind = self.0.kind();
        let status = status_for(kind);
        if status.is_server_error() {
            warn!("[http] {}", self.0);
        }
        (status, Json(json!({ "error": kind, "message": self.0.to_string() }))).into_response()
    }
}

type ApiResult<T> = Result<Json<T>, ApiError>;

async fn require_api_key(State(app): State<AppState>, req: Request, next: Next) -> Result<Response, StatusCode> {
    let path = req.uri().path();

    // Health check toujours accessible
    if path == "/health" {
        return Ok(next.run(req).await);
    }

    let Some(expected) = app.api_key.as_deref().filter(|k| !k.is_empty()) else {
        warn!("[http] SECURITY: FLEET_API_KEY not set - API access denied");
        return Err(StatusCode::UNAUTHORIZED);
    };

    let ok = req
        .headers()
        .get("x-api-key")
        .and_then(|v| v.to_str().ok())
        .map(|v| v == expected)
        .unwrap_or(false);

    if !ok {
        warn!("[http] rejected request to {} without a valid API key", path);
        return Err(StatusCode::UNAUTHORIZED);
    }
    Ok(next.run(req).await)
}

pub fn build_router(app_state: AppState) -> Router {
    Router::new()
        .route("/health", get(|| async { "ok" }))
        .route("/system/health", get(get_system_health))
        .route("/sweep", post(run_sweep))
        .route("/status", get(get_realtime_status))
        .route("/hosts", get(get_hosts))
        .route("/hosts/{name}", get(get_host))
        .route("/hosts/{name}/check", post(check_host))
        .route("/hosts/{name}/config", get(get_config).put(put_config))
        .route("/hosts/{name}/config/test", post(test_config))
        .route("/hosts/{name}/service/{action}", post(manage_service))
        .route("/hosts/{name}/logs", get(get_host_logs))
        .route("/logs/recent", get(get_recent_changes))
        .route("/logs/stats", get(get_log_statistics))
        .route("/logs/cleanup", post(cleanup_logs))
        .route("/reports/daily", get(get_daily_report))
        .layer(middleware::from_fn_with_state(app_state.clone(), require_api_key))
        .with_state(app_state)
}

/// Host detail without credential handles.
#[derive(Debug, Serialize)]
struct HostView {
    #[serde(flatten)]
    summary: HostSummary,
    ssh_user: String,
    auth_method: AuthMethod,
    config_path: String,
    auto_update_config: bool,
}

impl From<Host> for HostView {
    fn from(host: Host) -> Self {
        Self {
            summary: host.summary(),
            auth_method: host.credential.method,
            ssh_user: host.ssh_user,
            config_path: host.config_path,
            auto_update_config: host.auto_update_config,
        }
    }
}

#[derive(Debug, Deserialize)]
struct LimitParams {
    limit: Option<usize>,
}

#[derive(Debug, Deserialize)]
struct DaysParams {
    days: Option<u32>,
}

#[derive(Debug, Deserialize)]
struct ConfigBody {
    config: String,
}

#[derive(Debug, Serialize)]
struct ConfigView {
    host: String,
    config: String,
}

#[derive(Debug, Serialize)]
struct ConfigTestView {
    #[serde(flatten)]
    test: ConfigTest,
    output: String,
}

// POST /sweep (passe complète à la demande)
async fn run_sweep(State(app): State<AppState>) -> Json<SweepReport> {
    let report = app.sweeper.sweep().await;
    app.health_tracker.record_sweep(&report);
    publish_sweep(app.notifier.as_ref(), &report).await;
    Json(report)
}

// GET /status (vue temps réel)
async fn get_realtime_status(State(app): State<AppState>) -> ApiResult<RealtimeStatus> {
    Ok(Json(reports::realtime_status(app.store.as_ref(), app.clock.as_ref()).await?))
}

// GET /hosts (liste)
async fn get_hosts(State(app): State<AppState>) -> ApiResult<Vec<HostSummary>> {
    Ok(Json(app.store.list_hosts().await?))
}

// GET /hosts/{name} (détail)
async fn get_host(State(app): State<AppState>, Path(name): Path<String>) -> Result<Json<HostView>, ApiError> {
    let host = app.store.get_host(&name).await?;
    Ok(Json(HostView::from(host)))
}

// POST /hosts/{name}/check (vérification immédiate)
async fn check_host(State(app): State<AppState>, Path(name): Path<String>) -> ApiResult<HostCheck> {
    let check = app.sweeper.check_host(&name).await?;
    notify_check(app.notifier.as_ref(), app.clock.as_ref(), &check).await;
    Ok(Json(check))
}

// GET /hosts/{name}/config
async fn get_config(State(app): State<AppState>, Path(name): Path<String>) -> ApiResult<ConfigView> {
    let config = app.config_ops.get_config(&name).await?;
    Ok(Json(ConfigView { host: name, config }))
}

// PUT /hosts/{name}/config (remplacement avec backup)
async fn put_config(
    State(app): State<AppState>,
    Path(name): Path<String>,
    Json(body): Json<ConfigBody>,
) -> ApiResult<ConfigUpdate> {
    let update = app.config_ops.update_config(&name, &body.config).await?;
    app.notifier
        .notify(FleetEvent::ConfigUpdated {
            host: update.host.clone(),
            path: update.path.clone(),
            backup_path: update.backup_path.clone(),
        })
        .await;

    // vérification de statut après édition, hors du chemin de la requête
    let sweeper = app.sweeper.clone();
    let notifier = app.notifier.clone();
    let clock = app.clock.clone();
    tokio::spawn(async move {
        match sweeper.check_host(&name).await {
            Ok(check) => notify_check(notifier.as_ref(), clock.as_ref(), &check).await,
            Err(e) => warn!("[http] post-edit check of {} failed: {}", name, e),
        }
    });

    Ok(Json(update))
}

// POST /hosts/{name}/config/test
async fn test_config(State(app): State<AppState>, Path(name): Path<String>) -> ApiResult<ConfigTestView> {
    let test = app.config_ops.test_config(&name).await?;
    let output = test.combined();
    Ok(Json(ConfigTestView { test, output }))
}

// POST /hosts/{name}/service/{action}
async fn manage_service(
    State(app): State<AppState>,
    Path((name, action)): Path<(String, String)>,
) -> ApiResult<ServiceActionOutcome> {
    let outcome = app.config_ops.manage_service(&name, &action).await?;
    app.notifier
        .notify(FleetEvent::ServiceAction {
            host: outcome.host.clone(),
            action: outcome.action.to_string(),
            message: outcome.message.clone(),
        })
        .await;
    Ok(Json(outcome))
}

// GET /hosts/{name}/logs?limit=N
async fn get_host_logs(
    State(app): State<AppState>,
    Path(name): Path<String>,
    Query(params): Query<LimitParams>,
) -> ApiResult<Vec<HostStatusEvent>> {
    Ok(Json(reports::host_logs(app.store.as_ref(), &name, params.limit).await?))
}

// GET /logs/recent?days=N
async fn get_recent_changes(
    State(app): State<AppState>,
    Query(params): Query<DaysParams>,
) -> ApiResult<Vec<HostStatusEvent>> {
    let days = params.days.map(i64::from);
    Ok(Json(
        reports::recent_status_changes(app.store.as_ref(), app.clock.as_ref(), days).await?,
    ))
}

// GET /logs/stats
async fn get_log_statistics(State(app): State<AppState>) -> ApiResult<LogStatistics> {
    Ok(Json(reports::log_statistics(app.store.as_ref(), app.clock.as_ref()).await?))
}

// POST /logs/cleanup?days=N
async fn cleanup_logs(
    State(app): State<AppState>,
    Query(params): Query<DaysParams>,
) -> ApiResult<serde_json::Value> {
    let days = params.days.unwrap_or(DEFAULT_CLEANUP_DAYS);
    let removed = purge_expired_events(
        app.store.as_ref(),
        app.clock.as_ref(),
        time::Duration::days(i64::from(days)),
    )
    .await?;
    info!("[http] cleanup removed {} events older than {} days", removed, days);
    Ok(Json(json!({
        "removed": removed,
        "message": format!("Cleaned up {removed} log entries older than {days} days"),
    })))
}

// GET /reports/daily
async fn get_daily_report(State(app): State<AppState>) -> ApiResult<DailyReport> {
    Ok(Json(reports::daily_report(app.store.as_ref(), app.clock.as_ref()).await?))
}

// GET /system/health (état du kernel)
async fn get_system_health(State(app): State<AppState>) -> ApiResult<KernelHealth> {
    let hosts = app.store.list_hosts().await?;
    Ok(Json(app.health_tracker.get_health(hosts.len())))
}

async fn notify_check(notifier: &dyn EventNotifier, clock: &dyn Clock, check: &HostCheck) {
    if check.logged {
        notifier
            .notify(FleetEvent::StatusChanged {
                host: check.host.clone(),
                old_status: check.previous_status,
                new_status: check.status,
                at: clock.now(),
            })
            .await;
    }
    notifier
        .notify(FleetEvent::CheckRequested {
            host: check.host.clone(),
            status: check.status,
        })
        .await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::SystemClock;
    use crate::config_ops::ConfigOpsSettings;
    use crate::error::RemoteError;
    use crate::models::{Credential, HostStatus, SecretRef, DEFAULT_CONFIG_PATH};
    use crate::notify::NoopNotifier;
    use crate::probe::{ProbeOutcome, ProbeTarget, Prober};
    use crate::remote::{RemoteExecutor, RemoteSession, SshTarget};
    use crate::store::JsonStore;
    use crate::sweep::SweepSettings;
    use async_trait::async_trait;
    use axum::body::Body;
    use axum::http::Request as HttpRequest;
    use std::net::Ipv4Addr;
    use std::time::Duration;
    use tower::ServiceExt;

    const KEY: &str = "test-key";

    struct AlwaysUp;

    #[async_trait]
    impl Prober for AlwaysUp {
        async fn probe(&self, _target: &ProbeTarget) -> anyhow::Result<ProbeOutcome> {
            Ok(ProbeOutcome {
                reachable: true,
                latency_ms: 0.8,
            })
        }
    }

    struct Unreachable;

    #[async_trait]
    impl RemoteExecutor for Unreachable {
        async fn connect(&self, _target: &SshTarget, _timeout: Duration) -> Result<Box<dyn RemoteSession>, RemoteError> {
            Err(RemoteError::Connect("no route to host".into()))
        }
    }

    async fn app() -> Router {
        let store: Arc<dyn HostRecordStore> = Arc::new(JsonStore::in_memory());
        store
            .upsert_host(Host {
                name: "web-01".into(),
                hostname: "web-01.lan".into(),
                address: Ipv4Addr::new(10, 0, 0, 5),
                ssh_port: 22,
                ssh_user: "ops".into(),
                credential: Credential {
                    method: AuthMethod::Password,
                    password: Some(SecretRef("hunter2".into())),
                    private_key: None,
                },
                config_path: DEFAULT_CONFIG_PATH.into(),
                status: HostStatus::Unknown,
                last_status_check: None,
                auto_update_config: false,
            })
            .await
            .unwrap();

        let clock: Arc<dyn Clock> = Arc::new(SystemClock);
        let sweeper = SweepCoordinator::new(store.clone(), Arc::new(AlwaysUp), clock.clone(), SweepSettings::default());
        let config_ops = ConfigOps::new(
            store.clone(),
            Arc::new(Unreachable),
            clock.clone(),
            ConfigOpsSettings::default(),
        );

        build_router(AppState {
            store,
            sweeper: Arc::new(sweeper),
            config_ops: Arc::new(config_ops),
            health_tracker: HealthTracker::new(),
            notifier: Arc::new(NoopNotifier),
            clock,
            api_key: Some(KEY.into()),
        })
    }

    fn request(method: &str, uri: &str) -> HttpRequest<Body> {
        HttpRequest::builder()
            .method(method)
            .uri(uri)
            .header("x-api-key", KEY)
            .body(Body::empty())
            .unwrap()
    }

    async fn body_json(response: Response) -> serde_json::Value {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn test_health_is_open_and_the_rest_is_not() {
        let app = app().await;
        let open = HttpRequest::builder().uri("/health").body(Body::empty()).unwrap();
        assert_eq!(app.clone().oneshot(open).await.unwrap().status(), StatusCode::OK);

        let anonymous = HttpRequest::builder().uri("/hosts").body(Body::empty()).unwrap();
        assert_eq!(app.clone().oneshot(anonymous).await.unwrap().status(), StatusCode::UNAUTHORIZED);

        let wrong = HttpRequest::builder()
            .uri("/hosts")
            .header("x-api-key", "nope")
            .body(Body::empty())
            .unwrap();
        assert_eq!(app.oneshot(wrong).await.unwrap().status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn test_host_detail_hides_credentials() {
        let app = app().await;
        let response = app.clone().oneshot(request("GET", "/hosts/web-01")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert_eq!(body["name"], "web-01");
        assert_eq!(body["auth_method"], "password");
        assert!(!body.to_string().contains("hunter2"));

        let missing = app.oneshot(request("GET", "/hosts/ghost")).await.unwrap();
        assert_eq!(missing.status(), StatusCode::NOT_FOUND);
        assert_eq!(body_json(missing).await["error"], "not_found");
    }

    #[tokio::test]
    async fn test_sweep_then_status() {
        let app = app().await;
        let response = app.clone().oneshot(request("POST", "/sweep")).await.unwrap();
        let report = body_json(response).await;
        assert_eq!(report["checked"], 1);
        assert_eq!(report["outcome"]["status"], "committed");

        let status = body_json(app.clone().oneshot(request("GET", "/status")).await.unwrap()).await;
        assert_eq!(status["status_counts"]["Active"], 1);

        let health = body_json(app.oneshot(request("GET", "/system/health")).await.unwrap()).await;
        assert_eq!(health["sweeps_run"], 1);
        assert_eq!(health["hosts_tracked"], 1);
    }

    #[tokio::test]
    async fn test_error_mapping() {
        let app = app().await;
        let bad_action = app
            .clone()
            .oneshot(request("POST", "/hosts/web-01/service/drop-table"))
            .await
            .unwrap();
        assert_eq!(bad_action.status(), StatusCode::BAD_REQUEST);

        let unreachable = app.oneshot(request("GET", "/hosts/web-01/config")).await.unwrap();
        assert_eq!(unreachable.status(), StatusCode::BAD_GATEWAY);
        assert_eq!(body_json(unreachable).await["error"], "connect");
    }

    #[tokio::test]
    async fn test_cleanup_defaults_to_thirty_days() {
        let app = app().await;
        let body = body_json(app.oneshot(request("POST", "/logs/cleanup")).await.unwrap()).await;
        assert_eq!(body["removed"], 0);
        assert_eq!(body["message"], "Cleaned up 0 log entries older than 30 days");
    }

    #[tokio::test]
    async fn test_out_of_range_days_are_rejected() {
        let app = app().await;
        for uri in ["/logs/cleanup?days=10000000", "/logs/recent?days=4294967295"] {
            let method = if uri.starts_with("/logs/cleanup") { "POST" } else { "GET" };
            let response = app.clone().oneshot(request(method, uri)).await.unwrap();
            assert_eq!(response.status(), StatusCode::BAD_REQUEST, "{uri}");
            assert_eq!(body_json(response).await["error"], "validation");
        }

        let sane = app.oneshot(request("GET", "/logs/recent?days=3650")).await.unwrap();
        assert_eq!(sane.status(), StatusCode::OK);
    }

    #[test]
    fn test_status_codes() {
        assert_eq!(status_for(ErrorKind::Write), StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(status_for(ErrorKind::Command), StatusCode::BAD_GATEWAY);
        assert_eq!(status_for(ErrorKind::Auth), StatusCode::UNAUTHORIZED);
    }
}
