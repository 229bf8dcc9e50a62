use std::sync::Arc;

use axum::routing::{get, post};
use axum::Router;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::info;

use rozet_store::artifacts::ArtifactRepo;
use rozet_store::Database;
use rozet_telemetry::TelemetryBridgeHandle;

use crate::agents::AgentRegistry;
use crate::config::ServerConfig;
use crate::dispatcher::Dispatcher;
use crate::engine::ExecutionEngine;
use crate::hub::EventHub;
use crate::routes;
use crate::sessions::SessionManager;
use crate::tracker::OperationTracker;
use crate::ws;

/// Shared application state passed to Axum handlers.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<ServerConfig>,
    pub hub: Arc<EventHub>,
    pub tracker: Arc<OperationTracker>,
    pub sessions: Arc<SessionManager>,
    pub agents: Arc<AgentRegistry>,
    pub dispatcher: Arc<Dispatcher>,
    pub artifacts: Arc<ArtifactRepo>,
}

impl AppState {
    pub fn new(
        config: ServerConfig,
        db: Database,
        engine: Arc<dyn ExecutionEngine>,
        bridge: Option<TelemetryBridgeHandle>,
    ) -> Self {
        let hub = EventHub::start(config.max_send_queue, bridge);
        let tracker = Arc::new(OperationTracker::new(db.clone(), Arc::clone(&hub)));
        let sessions = Arc::new(SessionManager::new(
            db.clone(),
            Arc::clone(&tracker),
            Arc::clone(&hub),
            Arc::clone(&engine),
            config.workspace_root.clone(),
        ));
        let agents = Arc::new(AgentRegistry::new(
            db.clone(),
            Arc::clone(&tracker),
            Arc::clone(&hub),
            Arc::clone(&engine),
        ));
        let dispatcher = Arc::new(Dispatcher::new(
            db.clone(),
            Arc::clone(&tracker),
            Arc::clone(&hub),
            engine,
        ));

        Self {
            config: Arc::new(config),
            hub,
            tracker,
            sessions,
            agents,
            dispatcher,
            artifacts: Arc::new(ArtifactRepo::new(db)),
        }
    }
}

/// Build the Axum router. Everything under `/api` and the control socket is
/// bearer-guarded; `/health` is open for probes.
pub fn build_router(state: AppState) -> Router {
    let api = Router::new()
        .route("/sessions", post(routes::create_session).get(routes::list_sessions))
        .route(
            "/sessions/{session_id}",
            get(routes::get_session).delete(routes::terminate_session),
        )
        .route(
            "/sessions/{session_id}/agents",
            post(routes::create_agent).get(routes::list_agents),
        )
        .route(
            "/sessions/{session_id}/agents/{agent_id}",
            get(routes::get_agent).delete(routes::delete_agent),
        )
        .route(
            "/sessions/{session_id}/agents/{agent_id}/commands",
            post(routes::dispatch_command),
        )
        .route(
            "/sessions/{session_id}/commands/{command_id}",
            get(routes::get_command),
        )
        .route(
            "/sessions/{session_id}/tasks",
            post(routes::create_task).get(routes::list_tasks),
        )
        .route("/sessions/{session_id}/tasks/{task_id}", get(routes::get_task))
        .route(
            "/sessions/{session_id}/tasks/{task_id}/cancel",
            post(routes::cancel_task),
        )
        .route(
            "/sessions/{session_id}/operations",
            get(routes::list_operations),
        )
        .route(
            "/sessions/{session_id}/operations/{operation_id}",
            get(routes::get_operation),
        )
        .route(
            "/sessions/{session_id}/operations/{operation_id}/wait",
            get(routes::wait_operation),
        )
        .route("/sessions/{session_id}/artifacts", get(routes::list_artifacts))
        .route(
            "/sessions/{session_id}/artifacts/{artifact_id}",
            get(routes::get_artifact).delete(routes::delete_artifact),
        );

    let guarded = Router::new()
        .nest("/api", api)
        .route("/ws/control", get(ws::ws_handler))
        .layer(axum::middleware::from_fn_with_state(
            state.clone(),
            routes::auth_middleware,
        ));

    Router::new()
        .route("/health", get(routes::health))
        .merge(guarded)
        .with_state(state)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
}

/// Handle returned by `start()`. Keeps the serve task alive.
pub struct ServerHandle {
    pub port: u16,
    _server: tokio::task::JoinHandle<()>,
}

/// Bind and serve. Port 0 picks a free port.
pub async fn start(state: AppState) -> Result<ServerHandle, std::io::Error> {
    let addr = format!("0.0.0.0:{}", state.config.port);
    let router = build_router(state);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    let local_addr = listener.local_addr()?;

    info!(port = local_addr.port(), "control room server started");

    let server = tokio::spawn(async move {
        axum::serve(listener, router).await.ok();
    });

    Ok(ServerHandle {
        port: local_addr.port(),
        _server: server,
    })
}
