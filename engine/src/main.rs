use axum::{
    http::Method,
    routing::get,
    Router,
};
use std::sync::Arc;
use std::time::Duration;
use tower::ServiceBuilder;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

mod automation;
mod config;
mod database;
mod error;
mod events;
mod flows;
mod handlers;
mod integrations;
mod services;
mod steps;

pub use error::{ApiError, ApiResult, AppError};

use automation::{AutopilotStore, ExecutionStore, RuleRunner, RuleStore, TriggerMatcher};
use events::EventBus;
use flows::{spawn_wait_resumer, FlowEngine, FlowStore};
use integrations::{ExecutionMonitor, OrchestratorClient, WorkflowSyncService};
use services::{
    AnalyticsService, ConversationService, EmailService, SegmentService, TicketService,
};
use steps::{CollaboratorSet, StepRegistry};

pub struct AppState {
    pub rules: RuleStore,
    pub executions: ExecutionStore,
    pub flows: FlowStore,
    pub engine: Arc<FlowEngine>,
    pub runner: Arc<RuleRunner>,
    pub bus: EventBus,
    pub sync: Option<Arc<WorkflowSyncService>>,
    pub monitor: Option<Arc<ExecutionMonitor>>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv::dotenv().ok();

    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = config::Config::from_env()?;
    let pool = database::create_pool(&config.database_url).await?;
    database::migrate(&pool).await?;

    let bus = EventBus::default();
    let http = reqwest::Client::new();

    let email = if config.smtp.is_configured() {
        match EmailService::new(&config.smtp).await {
            Ok(service) => Some(service),
            Err(e) => {
                tracing::warn!("Email transport unavailable: {}", e);
                None
            }
        }
    } else {
        None
    };

    let rules = RuleStore::new(pool.clone());
    let executions = ExecutionStore::new(pool.clone());
    let flow_store = FlowStore::new(pool.clone());
    let tickets = TicketService::new(pool.clone());
    let conversations = ConversationService::new(pool.clone());
    let segments = SegmentService::new(pool.clone());
    let analytics = AnalyticsService::new(pool.clone(), bus.clone());
    let autopilot = AutopilotStore::new(pool.clone());

    // The registry is built once and shared by every concurrent run. AI,
    // churn and journey collaborators are injected by deployments that have
    // them; without them the steps take their documented fallback paths.
    let registry = Arc::new(StepRegistry::standard(CollaboratorSet {
        tickets: tickets.clone(),
        conversations: conversations.clone(),
        segments,
        analytics,
        email: email.clone(),
        http: http.clone(),
        ai: None,
        churn: None,
        journey: None,
    }));

    let engine = Arc::new(FlowEngine::new(
        flow_store.clone(),
        registry,
        bus.clone(),
        config.engine.max_hops,
    ));

    let runner = Arc::new(RuleRunner::new(
        rules.clone(),
        executions.clone(),
        tickets,
        conversations,
        email,
        http,
        autopilot,
        bus.clone(),
        config.engine.autopilot_window_secs,
    ));

    let matcher = Arc::new(TriggerMatcher::new(
        rules.clone(),
        executions.clone(),
        flow_store.clone(),
        runner.clone(),
        engine.clone(),
    ));
    let _matcher_task = TriggerMatcher::spawn(matcher, bus.clone());

    let _wait_resumer = spawn_wait_resumer(
        engine.clone(),
        Duration::from_secs(config.engine.wait_poll_interval_secs),
    );

    let (sync, monitor) = match &config.orchestrator {
        Some(orchestrator_config) => {
            let client = OrchestratorClient::new(orchestrator_config);
            let sync = Arc::new(WorkflowSyncService::new(
                client.clone(),
                flow_store.clone(),
                rules.clone(),
            ));
            let monitor = Arc::new(ExecutionMonitor::new(
                client,
                executions.clone(),
                Duration::from_secs(orchestrator_config.poll_interval_secs),
                Duration::from_secs(orchestrator_config.execution_timeout_secs),
            ));
            (Some(sync), Some(monitor))
        }
        None => {
            tracing::info!("External orchestrator not configured, sync disabled");
            (None, None)
        }
    };

    let state = Arc::new(AppState {
        rules,
        executions,
        flows: flow_store,
        engine,
        runner,
        bus,
        sync,
        monitor,
    });

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::POST, Method::PUT, Method::DELETE])
        .allow_headers(Any);

    let app = Router::new()
        .route("/", get(|| async { "Beacon Automation Engine v0.1.0" }))
        .route("/health", get(handlers::health_check))
        .nest("/api/v1/rules", handlers::rules::rule_routes())
        .nest("/api/v1/executions", handlers::rules::execution_routes())
        .nest("/api/v1/flows", handlers::flows::flow_routes())
        .nest("/api/v1/runs", handlers::flows::run_routes())
        .nest("/api/v1/events", handlers::events::event_routes())
        .nest("/api/v1/orchestrator", handlers::events::orchestrator_routes())
        .layer(ServiceBuilder::new().layer(TraceLayer::new_for_http()).layer(cors))
        .with_state(state);

    let listener = tokio::net::TcpListener::bind(&config.server_addr).await?;
    tracing::info!("Beacon automation engine listening on {}", config.server_addr);
    axum::serve(listener, app).await?;

    Ok(())
}
