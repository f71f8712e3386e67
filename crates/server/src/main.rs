mod chat;
mod config;
mod events;
#[cfg(feature = "metrics")]
mod metrics;
mod realtime;
mod session;
mod users;
mod vendors;

const REQUEST_ID_HEADER: &str = "x-request-id";
const CONTENT_SECURITY_POLICY: &str =
    "default-src 'none'; frame-ancestors 'none'; base-uri 'none'; form-action 'self'";
const REFERRER_POLICY: &str = "no-referrer";
const X_CONTENT_TYPE_OPTIONS: &str = "nosniff";
const X_FRAME_OPTIONS: &str = "DENY";

#[cfg(feature = "metrics")]
use anyhow::Context;
use anyhow::{anyhow, Result};
use axum::{
    body::HttpBody,
    extract::{MatchedPath, State},
    http::{header::HeaderName, HeaderValue},
    routing::{get, post},
    Json, Router,
};
#[cfg(feature = "metrics")]
use axum::{
    http::{header::CONTENT_TYPE, StatusCode},
    response::IntoResponse,
};
use clap::{Args, Parser, Subcommand};
use serde::Serialize;
use std::{
    net::SocketAddr,
    sync::Arc,
    time::{Duration, Instant},
};
#[cfg(test)]
use tokio::sync::Notify;
use tokio::{net::TcpListener, signal};
use tower::ServiceBuilder;
use tower_http::{
    cors::{Any, CorsLayer},
    propagate_header::PropagateHeaderLayer,
    request_id::{MakeRequestUuid, RequestId, SetRequestIdLayer},
    set_header::SetResponseHeaderLayer,
    trace::TraceLayer,
};
use tracing::{error, info, Event, Subscriber};
use tracing_subscriber::fmt::{
    format::Format as FmtFormat, format::Writer as FmtWriter, writer::MakeWriter, FmtContext,
    FormatEvent, FormatFields,
};
use tracing_subscriber::layer::{Context as LayerContext, SubscriberExt};
use tracing_subscriber::registry::LookupSpan;
use tracing_subscriber::{EnvFilter, Layer};

#[cfg(test)]
use once_cell::sync::Lazy;
#[cfg(test)]
use std::sync::Mutex;

use planora_core::UserRole;
use planora_storage::{connect, StoragePool, VendorDraft};
use session::{
    AccountStore, InMemoryAccountStore, NewAccount, PostgresAccountStore,
    PostgresSessionRepository, RegisterError, SessionContext, SessionSigner,
};

use crate::chat::{ChatService, ChatStore, InMemoryChatStore, PostgresChatStore};
use crate::config::{CliOverrides, LogFormat, ServerConfig};
use crate::events::{EventStore, InMemoryEventStore, PostgresEventStore};
#[cfg(feature = "metrics")]
use crate::metrics::MetricsContext;
use crate::realtime::{ChatGateway, ConnectionRegistry, PushDispatcher};
use crate::vendors::{InMemoryVendorStore, PostgresVendorStore, VendorStore};
use planora_storage::CreateVendorError;

#[derive(Clone)]
struct StorageState {
    status: StorageStatus,
    pool: Option<StoragePool>,
}

#[derive(Clone)]
enum StorageStatus {
    Unconfigured,
    Connected,
    Error(String),
}

impl StorageState {
    fn unconfigured() -> Self {
        Self {
            status: StorageStatus::Unconfigured,
            pool: None,
        }
    }

    #[cfg(test)]
    fn connected() -> Self {
        Self {
            status: StorageStatus::Connected,
            pool: None,
        }
    }

    fn connected_with_pool(pool: StoragePool) -> Self {
        Self {
            status: StorageStatus::Connected,
            pool: Some(pool),
        }
    }

    fn error(message: String) -> Self {
        Self {
            status: StorageStatus::Error(message),
            pool: None,
        }
    }

    fn component(&self) -> ComponentStatus {
        match &self.status {
            StorageStatus::Unconfigured => ComponentStatus {
                name: "database",
                status: "pending",
                details: Some("database_url not configured".to_string()),
            },
            StorageStatus::Connected => ComponentStatus {
                name: "database",
                status: "configured",
                details: Some("connection established".to_string()),
            },
            StorageStatus::Error(message) => ComponentStatus {
                name: "database",
                status: "error",
                details: Some(message.clone()),
            },
        }
    }

    fn readiness_status(&self) -> &'static str {
        match self.status {
            StorageStatus::Connected => "ready",
            StorageStatus::Unconfigured | StorageStatus::Error(_) => "degraded",
        }
    }

    fn pool(&self) -> Option<StoragePool> {
        self.pool.clone()
    }
}

#[derive(Parser, Debug, Default)]
#[command(
    name = "planora-server",
    version,
    about = "Planora event-planning backend"
)]
struct Cli {
    #[command(flatten)]
    config: ConfigArgs,
    #[command(subcommand)]
    command: Option<CliCommand>,
}

#[derive(Args, Debug, Default, Clone)]
struct ConfigArgs {
    #[arg(long)]
    bind_addr: Option<String>,
    #[arg(long)]
    host: Option<String>,
    #[arg(long)]
    port: Option<u16>,
    #[arg(long)]
    log_format: Option<LogFormat>,
    #[arg(long)]
    metrics_enabled: Option<bool>,
    #[arg(long)]
    metrics_bind_addr: Option<String>,
    #[arg(long)]
    database_url: Option<String>,
    #[arg(long)]
    session_signing_key: Option<String>,
    #[arg(long)]
    chat_max_connections: Option<usize>,
    #[arg(long)]
    chat_send_timeout_secs: Option<u64>,
}

impl ConfigArgs {
    fn into_overrides(self) -> CliOverrides {
        CliOverrides {
            bind_addr: self.bind_addr,
            host: self.host,
            port: self.port,
            log_format: self.log_format,
            metrics_enabled: self.metrics_enabled,
            metrics_bind_addr: self.metrics_bind_addr,
            database_url: self.database_url,
            session_signing_key: self.session_signing_key,
            chat_max_connections: self.chat_max_connections,
            chat_send_timeout_secs: self.chat_send_timeout_secs,
        }
    }
}

#[derive(Subcommand, Debug)]
enum CliCommand {
    /// Seed demo accounts and vendor listings into the configured database.
    SeedDemo,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let overrides = cli.config.clone().into_overrides();
    let mut config = ServerConfig::load()?;
    config.apply_overrides(&overrides)?;

    if let Some(command) = cli.command {
        return run_command(&config, command).await;
    }

    let config = Arc::new(config);
    run(config).await
}

async fn run_command(config: &ServerConfig, command: CliCommand) -> Result<()> {
    match command {
        CliCommand::SeedDemo => seed_demo(config).await,
    }
}

/// Demo fixtures: one organizer, three guests, two vendors with listings.
/// Safe to run repeatedly; existing rows are skipped.
async fn seed_demo(config: &ServerConfig) -> Result<()> {
    let database_url = config
        .database_url
        .as_deref()
        .ok_or_else(|| anyhow!("database_url must be configured to seed demo data"))?;

    let pool = connect(database_url).await?;
    let accounts = PostgresAccountStore::new(pool.clone());
    let vendors = PostgresVendorStore::new(pool);

    const DEMO_PASSWORD: &str = "qqq";
    let demo_accounts = [
        ("eventuser1", UserRole::EventUser),
        ("guest1", UserRole::Guest),
        ("guest2", UserRole::Guest),
        ("guest3", UserRole::Guest),
        ("vendor1", UserRole::Vendor),
        ("vendor2", UserRole::Vendor),
    ];

    let mut vendor_owners = std::collections::HashMap::new();
    for (username, role) in demo_accounts {
        let account = NewAccount {
            username: username.to_string(),
            email: format!("{username}@example.com"),
            password: DEMO_PASSWORD.to_string(),
            role,
        };
        match accounts.create_account(&account).await {
            Ok(profile) => {
                println!("Seeded account '{}' with id {}", username, profile.id);
                vendor_owners.insert(username, profile.id);
            }
            Err(RegisterError::UsernameTaken) => {
                println!("Account '{username}' already exists; skipping");
            }
            Err(RegisterError::Other(err)) => return Err(err),
        }
    }

    let listings = [
        ("vendor1", "Grand Ballroom", "Downtown", 5000.0, "Venue"),
        ("vendor2", "Elite Catering", "Midtown", 1500.0, "Food & Beverage"),
    ];
    for (username, name, location, pricing, services) in listings {
        let Some(owner) = vendor_owners.get(username).copied() else {
            println!("Account '{username}' not seeded this run; skipping its listing");
            continue;
        };
        let draft = VendorDraft {
            owner,
            name: name.to_string(),
            location: location.to_string(),
            availability: true,
            pricing,
            services: services.to_string(),
            reviews: Vec::new(),
        };
        match vendors.create(&draft).await {
            Ok(profile) => println!("Seeded vendor listing '{}' with id {}", name, profile.id),
            Err(CreateVendorError::ListingExists) => {
                println!("Vendor listing for '{username}' already exists; skipping");
            }
            Err(CreateVendorError::Other(err)) => return Err(err.into()),
        }
    }

    Ok(())
}

async fn run(config: Arc<ServerConfig>) -> Result<()> {
    init_tracing(&config);

    let env_override_keys = ServerConfig::environment_override_keys();
    if env_override_keys.is_empty() {
        info!("no PLANORA_SERVER environment overrides detected");
    } else {
        info!(keys = ?env_override_keys, "detected PLANORA_SERVER environment overrides");
    }

    info!(
        bind_addr = ?config.bind_addr,
        host = %config.host,
        port = config.port,
        log_format = ?config.log_format,
        metrics_enabled = config.metrics.enabled,
        metrics_bind_addr = ?config.metrics.bind_addr,
        database_url_configured = config.database_url.is_some(),
        session_signing_key_configured = config.session.signing_key.is_some(),
        chat_max_connections = config.chat.max_connections,
        chat_send_timeout_secs = config.chat.send_timeout_secs,
        "resolved server configuration"
    );

    let storage = match config.database_url.as_deref() {
        Some(url) => match connect(url).await {
            Ok(pool) => {
                info!("database connection established");
                StorageState::connected_with_pool(pool)
            }
            Err(err) => {
                error!(?err, "failed to establish database connection");
                StorageState::error(err.to_string())
            }
        },
        None => StorageState::unconfigured(),
    };

    let session_signer = SessionSigner::from_config(&config.session)?;
    if config.session.signing_key.is_some() {
        info!(
            verifying_key = %session_signer.verifying_key_base64(),
            "session signing key loaded from configuration"
        );
    } else {
        info!(
            verifying_key = %session_signer.verifying_key_base64(),
            "no session signing key supplied; generated ephemeral key"
        );
    }

    let (accounts, repository): (
        Arc<dyn session::AccountStore>,
        Arc<dyn session::SessionRepository>,
    ) = match storage.pool() {
        Some(pool) => (
            Arc::new(PostgresAccountStore::new(pool.clone())),
            Arc::new(PostgresSessionRepository::new(pool)),
        ),
        None => {
            info!("no database configured; accounts and sessions held in memory");
            let store = Arc::new(InMemoryAccountStore::new());
            let accounts: Arc<dyn session::AccountStore> = store.clone();
            let repo: Arc<dyn session::SessionRepository> = store;
            (accounts, repo)
        }
    };
    let session_context = Arc::new(SessionContext::new(session_signer, accounts, repository));

    #[cfg(feature = "metrics")]
    let metrics_ctx = if config.metrics.enabled {
        Some(MetricsContext::init()?)
    } else {
        None
    };

    let (chat_store, event_store, vendor_store): (
        Arc<dyn ChatStore>,
        Arc<dyn EventStore>,
        Arc<dyn VendorStore>,
    ) = match storage.pool() {
        Some(pool) => (
            Arc::new(PostgresChatStore::new(pool.clone())),
            Arc::new(PostgresEventStore::new(pool.clone())),
            Arc::new(PostgresVendorStore::new(pool)),
        ),
        None => (
            Arc::new(InMemoryChatStore::new()),
            Arc::new(InMemoryEventStore::new()),
            Arc::new(InMemoryVendorStore::new()),
        ),
    };

    let registry = ConnectionRegistry::new();
    #[cfg(feature = "metrics")]
    let dispatcher = PushDispatcher::new(registry.clone()).with_metrics(metrics_ctx.clone());
    #[cfg(not(feature = "metrics"))]
    let dispatcher = PushDispatcher::new(registry.clone());
    #[cfg(feature = "metrics")]
    let gateway = Arc::new(ChatGateway::new(registry, &config.chat).with_metrics(metrics_ctx.clone()));
    #[cfg(not(feature = "metrics"))]
    let gateway = Arc::new(ChatGateway::new(registry, &config.chat));
    let chat_service = ChatService::new(chat_store, dispatcher);

    #[cfg_attr(not(feature = "metrics"), allow(unused_mut))]
    let mut state = AppState::new(
        config.clone(),
        storage,
        gateway,
        chat_service,
        event_store,
        vendor_store,
    )
    .with_session(session_context);
    #[cfg(feature = "metrics")]
    {
        state = state.with_metrics(metrics_ctx);
    }

    #[cfg(feature = "metrics")]
    let metrics_state = state.clone();

    let app = build_app(state);

    #[cfg(feature = "metrics")]
    {
        if config.metrics.enabled {
            if let Some(bind_addr) = &config.metrics.bind_addr {
                let metrics_addr: SocketAddr = bind_addr
                    .parse()
                    .context("failed to parse metrics bind addr")?;
                let state = metrics_state;
                tokio::spawn(async move {
                    if let Err(err) = serve_metrics(metrics_addr, state).await {
                        error!(?err, "metrics server terminated unexpectedly");
                    }
                });
            }
        }
    }

    let addr: SocketAddr = config.listener_addr()?;
    let listener = TcpListener::bind(addr).await?;
    info!("listening on {addr}");

    axum::serve(listener, app.into_make_service())
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    Ok(())
}

#[derive(Clone)]
struct AppState {
    started_at: Instant,
    #[cfg_attr(not(feature = "metrics"), allow(dead_code))]
    config: Arc<ServerConfig>,
    storage: StorageState,
    gateway: Arc<ChatGateway>,
    chat: ChatService,
    events: Arc<dyn EventStore>,
    vendors: Arc<dyn VendorStore>,
    session: Option<Arc<SessionContext>>,
    #[cfg(feature = "metrics")]
    metrics: Option<Arc<MetricsContext>>,
}

impl AppState {
    fn new(
        config: Arc<ServerConfig>,
        storage: StorageState,
        gateway: Arc<ChatGateway>,
        chat: ChatService,
        events: Arc<dyn EventStore>,
        vendors: Arc<dyn VendorStore>,
    ) -> Self {
        Self {
            started_at: Instant::now(),
            config,
            storage,
            gateway,
            chat,
            events,
            vendors,
            session: None,
            #[cfg(feature = "metrics")]
            metrics: None,
        }
    }

    fn with_session(mut self, session: Arc<SessionContext>) -> Self {
        self.session = Some(session);
        self
    }

    #[cfg(feature = "metrics")]
    fn with_metrics(mut self, metrics: Option<Arc<MetricsContext>>) -> Self {
        self.metrics = metrics;
        self
    }

    #[cfg(test)]
    fn with_start_time(mut self, started_at: Instant) -> Self {
        self.started_at = started_at;
        self
    }

    fn uptime_seconds(&self) -> u64 {
        self.started_at.elapsed().as_secs()
    }

    fn session(&self) -> Arc<SessionContext> {
        self.session
            .as_ref()
            .cloned()
            .expect("session context not configured")
    }

    fn gateway(&self) -> Arc<ChatGateway> {
        self.gateway.clone()
    }

    fn chat(&self) -> &ChatService {
        &self.chat
    }

    fn events(&self) -> Arc<dyn EventStore> {
        self.events.clone()
    }

    fn vendors(&self) -> Arc<dyn VendorStore> {
        self.vendors.clone()
    }

    #[cfg(feature = "metrics")]
    fn metrics_enabled(&self) -> bool {
        self.config.metrics.enabled
    }

    #[cfg(feature = "metrics")]
    fn metrics(&self) -> Option<Arc<MetricsContext>> {
        self.metrics.clone()
    }

    #[cfg(feature = "metrics")]
    fn record_http_request(&self, route: &str, status: u16) {
        if let Some(metrics) = &self.metrics {
            let status_str = status.to_string();
            metrics
                .http_requests_total
                .with_label_values(&[route, status_str.as_str()])
                .inc();
        }
    }

    fn database_component(&self) -> ComponentStatus {
        self.storage.component()
    }
}

async fn health(matched_path: MatchedPath, State(state): State<AppState>) -> &'static str {
    #[cfg(feature = "metrics")]
    state.record_http_request(matched_path.as_str(), axum::http::StatusCode::OK.as_u16());
    #[cfg(not(feature = "metrics"))]
    {
        let _ = state;
        let _ = matched_path;
    }
    "ok"
}

async fn readiness(
    matched_path: MatchedPath,
    State(state): State<AppState>,
) -> Json<ReadinessResponse> {
    let components = vec![state.database_component()];
    let status = state.storage.readiness_status();

    #[cfg(feature = "metrics")]
    state.record_http_request(matched_path.as_str(), axum::http::StatusCode::OK.as_u16());
    #[cfg(not(feature = "metrics"))]
    let _ = matched_path;

    Json(ReadinessResponse {
        status,
        uptime_seconds: state.uptime_seconds(),
        components,
    })
}

#[derive(Serialize)]
struct VersionResponse {
    version: &'static str,
}

async fn version(
    matched_path: MatchedPath,
    State(state): State<AppState>,
) -> Json<VersionResponse> {
    #[cfg(feature = "metrics")]
    state.record_http_request(matched_path.as_str(), axum::http::StatusCode::OK.as_u16());
    #[cfg(not(feature = "metrics"))]
    {
        let _ = state;
        let _ = matched_path;
    }

    Json(VersionResponse {
        version: env!("CARGO_PKG_VERSION"),
    })
}

fn build_app(state: AppState) -> Router {
    #[cfg(feature = "metrics")]
    let expose_metrics_here = state.metrics_enabled() && state.config.metrics.bind_addr.is_none();

    let api_v1 = Router::new()
        .route("/users/register", post(users::register))
        .route("/users/me", get(users::me))
        .route("/sessions/login", post(session::login))
        .route("/chat/messages", post(chat::send_message))
        .route("/chat/messages/{user_id}", get(chat::message_history))
        .route("/chat/ws", get(realtime::chat_socket))
        .route(
            "/events",
            get(events::list_events).post(events::create_event),
        )
        .route("/events/invitations", get(events::list_invitations))
        .route(
            "/events/{event_id}",
            get(events::fetch_event)
                .put(events::update_event)
                .delete(events::delete_event),
        )
        .route("/events/{event_id}/rsvp", post(events::rsvp))
        .route("/vendors", post(vendors::create_vendor))
        .route(
            "/vendors/me",
            get(vendors::my_vendor)
                .put(vendors::update_vendor)
                .delete(vendors::delete_vendor),
        )
        .route("/vendors/search", get(vendors::search_vendors));

    #[cfg_attr(not(feature = "metrics"), allow(unused_mut))]
    let mut router = Router::new()
        .route("/health", get(health))
        .route("/ready", get(readiness))
        .route("/version", get(version));

    #[cfg(feature = "metrics")]
    {
        if expose_metrics_here {
            router = router.route("/metrics", get(metrics_handler));
        }
    }

    let router = router.nest("/api/v1", api_v1);

    let request_id_header = HeaderName::from_static(REQUEST_ID_HEADER);

    let trace_layer = TraceLayer::new_for_http()
        .make_span_with(HttpSpanMaker)
        .on_response(HttpOnResponse::new());

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let instrumentation_layers = ServiceBuilder::new()
        .layer(SetResponseHeaderLayer::if_not_present(
            HeaderName::from_static("content-security-policy"),
            HeaderValue::from_static(CONTENT_SECURITY_POLICY),
        ))
        .layer(SetResponseHeaderLayer::if_not_present(
            HeaderName::from_static("referrer-policy"),
            HeaderValue::from_static(REFERRER_POLICY),
        ))
        .layer(SetResponseHeaderLayer::if_not_present(
            HeaderName::from_static("x-content-type-options"),
            HeaderValue::from_static(X_CONTENT_TYPE_OPTIONS),
        ))
        .layer(SetResponseHeaderLayer::if_not_present(
            HeaderName::from_static("x-frame-options"),
            HeaderValue::from_static(X_FRAME_OPTIONS),
        ))
        .layer(PropagateHeaderLayer::new(request_id_header.clone()))
        .layer(trace_layer)
        .layer(SetRequestIdLayer::new(request_id_header, MakeRequestUuid))
        // Innermost so the wrapped service still produces a plain axum
        // body, which `Cors` needs for its preflight short-circuit.
        .layer(cors)
        .into_inner();

    let router = router.layer(instrumentation_layers);

    router.with_state(state)
}

#[derive(Clone, Default)]
struct HttpSpanMaker;

impl<B> tower_http::trace::MakeSpan<B> for HttpSpanMaker
where
    B: HttpBody + Send + 'static,
    B::Data: Send,
{
    fn make_span(&mut self, request: &axum::http::Request<B>) -> tracing::Span {
        let method = request.method().clone();
        let uri_path = request.uri().path().to_string();
        let route = request
            .extensions()
            .get::<MatchedPath>()
            .map(|matched| matched.as_str().to_string())
            .unwrap_or_else(|| uri_path.clone());
        let request_id = request
            .extensions()
            .get::<RequestId>()
            .and_then(|rid| rid.header_value().to_str().ok())
            .map(|value| value.to_owned())
            .unwrap_or_else(|| "unknown".to_string());

        tracing::info_span!(
            "http.request",
            method = %method,
            route = %route,
            request_id = %request_id,
            status_code = tracing::field::Empty,
            latency_ms = tracing::field::Empty
        )
    }
}

#[derive(Clone, Default)]
struct HttpOnResponse;

impl HttpOnResponse {
    fn new() -> Self {
        Self
    }
}

impl<B> tower_http::trace::OnResponse<B> for HttpOnResponse
where
    B: HttpBody + Send + 'static,
    B::Data: Send,
{
    fn on_response(
        self,
        response: &axum::http::Response<B>,
        latency: Duration,
        span: &tracing::Span,
    ) {
        let latency_ms = latency.as_secs_f64() * 1000.0;
        let status = response.status().as_u16();
        let request_id = response
            .headers()
            .get(REQUEST_ID_HEADER)
            .and_then(|value| value.to_str().ok())
            .unwrap_or("unknown");

        span.record("status_code", tracing::field::display(status));
        span.record("latency_ms", tracing::field::display(latency_ms));

        tracing::debug!(
            parent: span,
            request_id = %request_id,
            status = status,
            latency_ms,
            "request completed"
        );
    }
}

fn init_tracing(config: &ServerConfig) {
    // Respect RUST_LOG if set, otherwise default to info for our crates.
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,planora_server=info,planora=info"));

    let json = matches!(config.log_format(), LogFormat::Json);
    let subscriber = build_subscriber(json, env_filter);

    if let Err(err) = tracing::subscriber::set_global_default(subscriber) {
        eprintln!("failed to install tracing subscriber: {err}");
    }
}

async fn shutdown_signal() {
    #[cfg(test)]
    {
        let notify_opt = TEST_SHUTDOWN_NOTIFY.lock().unwrap().clone();
        if let Some(notify) = notify_opt {
            tokio::select! {
                res = signal::ctrl_c() => {
                    if let Err(e) = res {
                        error!(?e, "failed to install Ctrl+C handler");
                    }
                }
                _ = notify.notified() => {}
            }
            info!("shutdown signal received");
            *TEST_SHUTDOWN_NOTIFY.lock().unwrap() = None;
            return;
        }
    }

    if let Err(e) = signal::ctrl_c().await {
        error!(?e, "failed to install Ctrl+C handler");
    }
    info!("shutdown signal received");
}

#[cfg(test)]
fn build_subscriber_with_writer<W>(
    json: bool,
    env_filter: EnvFilter,
    writer: W,
) -> Box<dyn tracing::Subscriber + Send + Sync>
where
    W: for<'a> MakeWriter<'a> + Send + Sync + Clone + 'static,
{
    build_subscriber_inner(json, env_filter, writer)
}

fn build_subscriber(
    json: bool,
    env_filter: EnvFilter,
) -> Box<dyn tracing::Subscriber + Send + Sync> {
    build_subscriber_inner(json, env_filter, std::io::stderr)
}

#[derive(Default)]
struct RequestIdStorageLayer;

#[derive(Clone)]
struct RequestIdExtension(String);

impl RequestIdExtension {
    fn as_str(&self) -> &str {
        &self.0
    }
}

#[derive(Default)]
struct RequestIdVisitor {
    request_id: Option<String>,
}

impl tracing::field::Visit for RequestIdVisitor {
    fn record_str(&mut self, field: &tracing::field::Field, value: &str) {
        if field.name() == "request_id" {
            self.request_id = Some(value.to_string());
        }
    }

    fn record_debug(&mut self, field: &tracing::field::Field, value: &dyn std::fmt::Debug) {
        if field.name() == "request_id" && self.request_id.is_none() {
            self.request_id = Some(format!("{value:?}"));
        }
    }
}

impl<S> Layer<S> for RequestIdStorageLayer
where
    S: Subscriber + for<'span> LookupSpan<'span>,
{
    fn on_new_span(
        &self,
        attrs: &tracing::span::Attributes<'_>,
        id: &tracing::Id,
        ctx: LayerContext<'_, S>,
    ) {
        if let Some(span) = ctx.span(id) {
            let mut visitor = RequestIdVisitor::default();
            attrs.record(&mut visitor);
            if let Some(mut request_id) = visitor.request_id {
                if request_id.starts_with('"') && request_id.ends_with('"') && request_id.len() >= 2
                {
                    request_id = request_id.trim_matches('"').to_string();
                }
                span.extensions_mut().insert(RequestIdExtension(request_id));
            }
        }
    }
}

struct RequestIdEventFormat<E> {
    inner: E,
}

impl<E> RequestIdEventFormat<E> {
    fn new(inner: E) -> Self {
        Self { inner }
    }
}

impl<S, N, E> FormatEvent<S, N> for RequestIdEventFormat<E>
where
    S: Subscriber + for<'span> LookupSpan<'span>,
    N: for<'writer> FormatFields<'writer> + 'static,
    E: FormatEvent<S, N>,
{
    fn format_event(
        &self,
        ctx: &FmtContext<'_, S, N>,
        mut writer: FmtWriter<'_>,
        event: &Event<'_>,
    ) -> std::fmt::Result {
        if let Some(span) = ctx.lookup_current() {
            if let Some(request_id) = span.extensions().get::<RequestIdExtension>() {
                write!(writer, "[request_id={}] ", request_id.as_str())?;
            }
        }

        self.inner.format_event(ctx, writer, event)
    }
}

fn build_subscriber_inner<W>(
    json: bool,
    env_filter: EnvFilter,
    make_writer: W,
) -> Box<dyn tracing::Subscriber + Send + Sync>
where
    W: for<'a> MakeWriter<'a> + Send + Sync + Clone + 'static,
{
    if json {
        let format = FmtFormat::default()
            .with_target(true)
            .with_level(true)
            .json();

        Box::new(
            tracing_subscriber::registry()
                .with(env_filter)
                .with(RequestIdStorageLayer)
                .with(
                    tracing_subscriber::fmt::layer()
                        .json()
                        .event_format(RequestIdEventFormat::new(format))
                        .with_writer(make_writer),
                ),
        )
    } else {
        let format = FmtFormat::default().with_target(true).with_level(true);

        Box::new(
            tracing_subscriber::registry()
                .with(env_filter)
                .with(RequestIdStorageLayer)
                .with(
                    tracing_subscriber::fmt::layer()
                        .event_format(RequestIdEventFormat::new(format))
                        .with_writer(make_writer),
                ),
        )
    }
}

#[cfg(test)]
static TEST_SHUTDOWN_NOTIFY: Lazy<Mutex<Option<Arc<Notify>>>> = Lazy::new(|| Mutex::new(None));

#[cfg(test)]
fn install_shutdown_trigger() -> Arc<Notify> {
    let notify = Arc::new(Notify::new());
    *TEST_SHUTDOWN_NOTIFY.lock().unwrap() = Some(notify.clone());
    notify
}

#[derive(Serialize)]
struct ReadinessResponse {
    status: &'static str,
    uptime_seconds: u64,
    components: Vec<ComponentStatus>,
}

#[derive(Serialize)]
struct ComponentStatus {
    name: &'static str,
    status: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    details: Option<String>,
}

#[cfg(feature = "metrics")]
async fn metrics_handler(State(state): State<AppState>) -> impl IntoResponse {
    if !state.metrics_enabled() {
        return StatusCode::NOT_FOUND.into_response();
    }

    let Some(metrics) = state.metrics() else {
        return StatusCode::NOT_FOUND.into_response();
    };

    match metrics.encode() {
        Ok(body) => (
            StatusCode::OK,
            [(CONTENT_TYPE, "text/plain; version=0.0.4")],
            body,
        )
            .into_response(),
        Err(err) => {
            tracing::error!(?err, "failed to encode metrics");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

#[cfg(feature = "metrics")]
fn build_metrics_router(state: AppState) -> Router {
    Router::new()
        .route("/metrics", get(metrics_handler))
        .with_state(state)
}

#[cfg(feature = "metrics")]
async fn serve_metrics(bind_addr: SocketAddr, state: AppState) -> Result<()> {
    let router = build_metrics_router(state);
    let listener = TcpListener::bind(bind_addr).await?;
    let addr = listener.local_addr()?;
    info!("metrics listening on {addr}");
    axum::serve(listener, router.into_make_service()).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::tests::SessionTestHarness;
    use axum::body::{to_bytes, Body};
    use axum::http::{Request, StatusCode};
    use base64::engine::general_purpose::URL_SAFE_NO_PAD;
    use base64::Engine;
    use futures::StreamExt;
    use planora_core::push::{PUSH_CHAT_EVENT, STATUS_EVENT};
    use serde_json::Value;
    use std::io::ErrorKind;
    use std::io::Write;
    use std::str;
    use std::sync::{Arc, Mutex};
    use tokio::time::timeout;
    use tokio_tungstenite::{connect_async, tungstenite::Message as WsMessage};
    use tower::ServiceExt; // for `oneshot`
    use tracing::info;
    use uuid::Uuid;

    fn test_config() -> Arc<ServerConfig> {
        Arc::new(ServerConfig::default())
    }

    fn storage_unconfigured() -> StorageState {
        StorageState::unconfigured()
    }

    /// Fully in-memory application state plus the account harness behind it.
    fn in_memory_state(config: Arc<ServerConfig>) -> (AppState, SessionTestHarness) {
        let (state, harness, _chat) = in_memory_state_with_chat(config);
        (state, harness)
    }

    /// Same, but also hands back the chat service so tests can send
    /// messages without going through the HTTP surface.
    fn in_memory_state_with_chat(
        config: Arc<ServerConfig>,
    ) -> (AppState, SessionTestHarness, ChatService) {
        let harness = SessionTestHarness::new();
        let registry = ConnectionRegistry::new();
        let dispatcher = PushDispatcher::new(registry.clone());
        let gateway = Arc::new(ChatGateway::new(registry, &config.chat));
        let chat = ChatService::new(Arc::new(InMemoryChatStore::new()), dispatcher);
        let state = AppState::new(
            config,
            storage_unconfigured(),
            gateway,
            chat.clone(),
            Arc::new(InMemoryEventStore::new()),
            Arc::new(InMemoryVendorStore::new()),
        )
        .with_session(harness.context.clone());
        (state, harness, chat)
    }

    async fn logged_in_user(
        harness: &SessionTestHarness,
        username: &str,
        role: UserRole,
    ) -> (String, Uuid) {
        let profile = harness
            .register_account(username, "secret-pass", role)
            .await;
        let response = harness
            .context
            .login(session::LoginAttempt {
                username: username.to_string(),
                password: "secret-pass".to_string(),
            })
            .await
            .expect("login runs")
            .expect("credentials accepted");
        (response.token, profile.id)
    }

    async fn bind_test_listener() -> Option<TcpListener> {
        match TcpListener::bind("127.0.0.1:0").await {
            Ok(listener) => Some(listener),
            Err(err) if err.kind() == ErrorKind::PermissionDenied => {
                eprintln!("skipping websocket test due to permission error: {err}");
                None
            }
            Err(err) => panic!("failed to bind test listener: {err}"),
        }
    }

    #[derive(Clone, Default)]
    struct CaptureWriter {
        buffer: Arc<Mutex<Vec<u8>>>,
    }

    impl CaptureWriter {
        fn contents(&self) -> String {
            let data = self.buffer.lock().expect("lock");
            String::from_utf8_lossy(&data).to_string()
        }
    }

    struct CaptureHandle {
        buffer: Arc<Mutex<Vec<u8>>>,
    }

    impl<'a> MakeWriter<'a> for CaptureWriter {
        type Writer = CaptureHandle;

        fn make_writer(&'a self) -> Self::Writer {
            CaptureHandle {
                buffer: self.buffer.clone(),
            }
        }
    }

    impl Write for CaptureHandle {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            let mut guard = self.buffer.lock().expect("lock");
            guard.extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    async fn json_body(response: axum::response::Response) -> Value {
        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&body).unwrap()
    }

    #[tokio::test]
    async fn health_route_returns_ok_with_security_headers() {
        let (state, _harness) = in_memory_state(test_config());
        let app = build_app(state);
        let response = app
            .oneshot(
                Request::builder()
                    .uri("/health")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        {
            let headers = response.headers();
            assert_eq!(
                headers
                    .get("content-security-policy")
                    .and_then(|value| value.to_str().ok()),
                Some(CONTENT_SECURITY_POLICY)
            );
            assert_eq!(
                headers
                    .get("referrer-policy")
                    .and_then(|value| value.to_str().ok()),
                Some(REFERRER_POLICY)
            );
            assert_eq!(
                headers
                    .get("x-content-type-options")
                    .and_then(|value| value.to_str().ok()),
                Some(X_CONTENT_TYPE_OPTIONS)
            );
            assert_eq!(
                headers
                    .get("x-frame-options")
                    .and_then(|value| value.to_str().ok()),
                Some(X_FRAME_OPTIONS)
            );
        }
        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        assert_eq!(str::from_utf8(&body).unwrap(), "ok");
    }

    #[tokio::test]
    async fn request_id_header_propagates() {
        let (state, _harness) = in_memory_state(test_config());
        let app = build_app(state);

        let response = app
            .oneshot(
                Request::builder()
                    .uri("/health")
                    .header("x-request-id", "test-observability")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(
            response
                .headers()
                .get("x-request-id")
                .and_then(|value| value.to_str().ok()),
            Some("test-observability")
        );
    }

    #[tokio::test]
    async fn version_route_reports_package_version() {
        let (state, _harness) = in_memory_state(test_config());
        let app = build_app(state);
        let response = app
            .oneshot(
                Request::builder()
                    .uri("/version")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let payload = json_body(response).await;
        assert_eq!(
            payload["version"].as_str().unwrap(),
            env!("CARGO_PKG_VERSION")
        );
    }

    #[tokio::test]
    async fn readiness_reports_degraded_without_database() {
        let (state, _harness) = in_memory_state(test_config());
        let app = build_app(state);
        let response = app
            .oneshot(Request::builder().uri("/ready").body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let payload = json_body(response).await;
        assert_eq!(payload["status"], "degraded");
        assert!(payload["uptime_seconds"].as_u64().unwrap() <= 1);
        let component = &payload["components"].as_array().unwrap()[0];
        assert_eq!(component["name"], "database");
        assert_eq!(component["status"], "pending");
        assert_eq!(component["details"], "database_url not configured");
    }

    #[tokio::test]
    async fn readiness_reports_ready_when_database_connected() {
        let (state, _harness) = in_memory_state(test_config());
        let state = AppState {
            storage: StorageState::connected(),
            ..state
        };
        let app = build_app(state);
        let response = app
            .oneshot(Request::builder().uri("/ready").body(Body::empty()).unwrap())
            .await
            .unwrap();

        let payload = json_body(response).await;
        assert_eq!(payload["status"], "ready");
        let component = &payload["components"].as_array().unwrap()[0];
        assert_eq!(component["status"], "configured");
    }

    #[tokio::test]
    async fn readiness_reports_elapsed_uptime() {
        let (state, _harness) = in_memory_state(test_config());
        let state = state.with_start_time(Instant::now() - Duration::from_secs(2));
        let app = build_app(state);

        let response = app
            .oneshot(Request::builder().uri("/ready").body(Body::empty()).unwrap())
            .await
            .unwrap();

        let payload = json_body(response).await;
        assert!(payload["uptime_seconds"].as_u64().unwrap() >= 2);
    }

    #[tokio::test]
    async fn login_route_rejects_blank_inputs() {
        let (state, _harness) = in_memory_state(test_config());
        let app = build_app(state);

        let response = app
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/api/v1/sessions/login")
                    .header("content-type", "application/json")
                    .body(Body::from(r#"{"username":"","password":" "}"#))
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let payload = json_body(response).await;
        assert_eq!(payload["error"], "validation_error");
        assert_eq!(payload["details"].as_array().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn login_route_returns_token_on_success() {
        let (state, harness) = in_memory_state(test_config());
        let profile = harness
            .register_account("organizer", "secret-pass", UserRole::EventUser)
            .await;
        let app = build_app(state);

        let response = app
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/api/v1/sessions/login")
                    .header("content-type", "application/json")
                    .body(Body::from(
                        r#"{"username":"organizer","password":"secret-pass"}"#,
                    ))
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let payload = json_body(response).await;
        let token = payload["token"].as_str().unwrap();
        assert!(!token.is_empty());
        assert_eq!(payload["user"]["username"], "organizer");
        assert_eq!(payload["user"]["role"], "eventuser");
        assert_eq!(harness.store.session_count().await, 1);

        // Claims payload decodes to the logged-in user.
        let (claims_b64, _) = token.split_once('.').unwrap();
        let decoded = URL_SAFE_NO_PAD.decode(claims_b64).unwrap();
        let claims: Value = serde_json::from_slice(&decoded).unwrap();
        assert_eq!(claims["user_id"].as_str().unwrap(), profile.id.to_string());
    }

    #[tokio::test]
    async fn login_route_rejects_wrong_password() {
        let (state, harness) = in_memory_state(test_config());
        harness
            .register_account("organizer", "secret-pass", UserRole::EventUser)
            .await;
        let app = build_app(state);

        let response = app
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/api/v1/sessions/login")
                    .header("content-type", "application/json")
                    .body(Body::from(r#"{"username":"organizer","password":"nope"}"#))
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        let payload = json_body(response).await;
        assert_eq!(payload["error"], "invalid_credentials");
    }

    #[tokio::test]
    async fn register_then_me_round_trips() {
        let (state, _harness) = in_memory_state(test_config());
        let app = build_app(state);

        let response = app
            .clone()
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/api/v1/users/register")
                    .header("content-type", "application/json")
                    .body(Body::from(
                        r#"{"username":"organizer","email":"organizer@example.org","password":"secret-pass","role":"eventuser"}"#,
                    ))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::CREATED);
        let payload = json_body(response).await;
        assert_eq!(payload["user"]["username"], "organizer");

        let login = app
            .clone()
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/api/v1/sessions/login")
                    .header("content-type", "application/json")
                    .body(Body::from(
                        r#"{"username":"organizer","password":"secret-pass"}"#,
                    ))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(login.status(), StatusCode::OK);
        let login_payload = json_body(login).await;
        let token = login_payload["token"].as_str().unwrap().to_string();

        let me = app
            .oneshot(
                Request::builder()
                    .uri("/api/v1/users/me")
                    .header("authorization", format!("Bearer {token}"))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(me.status(), StatusCode::OK);
        let me_payload = json_body(me).await;
        assert_eq!(me_payload["username"], "organizer");
        assert_eq!(me_payload["email"], "organizer@example.org");
    }

    #[tokio::test]
    async fn register_rejects_duplicate_username() {
        let (state, harness) = in_memory_state(test_config());
        harness
            .register_account("organizer", "secret-pass", UserRole::EventUser)
            .await;
        let app = build_app(state);

        let response = app
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/api/v1/users/register")
                    .header("content-type", "application/json")
                    .body(Body::from(
                        r#"{"username":"organizer","email":"other@example.org","password":"secret-pass","role":"guest"}"#,
                    ))
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::CONFLICT);
        let payload = json_body(response).await;
        assert_eq!(payload["error"], "username_taken");
    }

    #[tokio::test]
    async fn me_requires_bearer_token() {
        let (state, _harness) = in_memory_state(test_config());
        let app = build_app(state);

        let response = app
            .oneshot(
                Request::builder()
                    .uri("/api/v1/users/me")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn preflight_requests_get_cors_headers() {
        let (state, _harness) = in_memory_state(test_config());
        let app = build_app(state);

        let response = app
            .oneshot(
                Request::builder()
                    .method("OPTIONS")
                    .uri("/api/v1/sessions/login")
                    .header("origin", "https://planora.example")
                    .header("access-control-request-method", "POST")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let allow_origin = response
            .headers()
            .get("access-control-allow-origin")
            .and_then(|value| value.to_str().ok());
        assert_eq!(allow_origin, Some("*"));
    }

    #[tokio::test]
    async fn chat_send_persists_and_reports_offline_recipient() {
        let (state, harness) = in_memory_state(test_config());
        let (token, sender_id) = logged_in_user(&harness, "alice", UserRole::EventUser).await;
        let recipient_id = harness
            .register_account("bob", "secret-pass", UserRole::Guest)
            .await
            .id;
        let event_id = Uuid::new_v4();
        let app = build_app(state);

        let response = app
            .clone()
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/api/v1/chat/messages")
                    .header("content-type", "application/json")
                    .header("authorization", format!("Bearer {token}"))
                    .body(Body::from(format!(
                        r#"{{"sender":"{sender_id}","recipient":"{recipient_id}","event_id":"{event_id}","text":"see you there"}}"#
                    )))
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::CREATED);
        let payload = json_body(response).await;
        assert_eq!(payload["delivered"], false);
        assert_eq!(payload["message"]["text"], "see you there");

        // History for the recipient carries username snapshots for both sides.
        let history = app
            .oneshot(
                Request::builder()
                    .uri(format!("/api/v1/chat/messages/{recipient_id}"))
                    .header("authorization", format!("Bearer {token}"))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(history.status(), StatusCode::OK);
        let history_payload = json_body(history).await;
        let messages = history_payload["messages"].as_array().unwrap();
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0]["sender_details"]["username"], "alice");
        assert_eq!(messages[0]["recipient_details"]["username"], "bob");
        assert_eq!(messages[0]["text"], "see you there");
    }

    #[tokio::test]
    async fn chat_send_rejects_spoofed_sender() {
        let (state, harness) = in_memory_state(test_config());
        let (token, _sender_id) = logged_in_user(&harness, "alice", UserRole::EventUser).await;
        let app = build_app(state);

        let response = app
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/api/v1/chat/messages")
                    .header("content-type", "application/json")
                    .header("authorization", format!("Bearer {token}"))
                    .body(Body::from(format!(
                        r#"{{"sender":"{}","recipient":"{}","event_id":"{}","text":"hi"}}"#,
                        Uuid::new_v4(),
                        Uuid::new_v4(),
                        Uuid::new_v4()
                    )))
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::FORBIDDEN);
        let payload = json_body(response).await;
        assert_eq!(payload["error"], "sender_mismatch");
    }

    #[tokio::test]
    async fn event_lifecycle_over_http() {
        let (state, harness) = in_memory_state(test_config());
        let (token, organizer_id) = logged_in_user(&harness, "organizer", UserRole::EventUser).await;
        let app = build_app(state);
        let auth = format!("Bearer {token}");

        let created = app
            .clone()
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/api/v1/events")
                    .header("content-type", "application/json")
                    .header("authorization", auth.as_str())
                    .body(Body::from(
                        r#"{"name":"Garden Party","starts_at":"2026-09-12T18:00:00Z","location":"Riverside","budget":2500.0,"event_type":"Social","guests":[{"email":"guest@example.org","status":"Pending"}]}"#,
                    ))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(created.status(), StatusCode::CREATED);
        let created_payload = json_body(created).await;
        assert_eq!(created_payload["event"]["organizer"], organizer_id.to_string());
        let event_id = created_payload["event"]["id"].as_str().unwrap().to_string();

        let listed = app
            .clone()
            .oneshot(
                Request::builder()
                    .uri("/api/v1/events")
                    .header("authorization", auth.as_str())
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        let listed_payload = json_body(listed).await;
        assert_eq!(listed_payload["events"].as_array().unwrap().len(), 1);

        let deleted = app
            .oneshot(
                Request::builder()
                    .method("DELETE")
                    .uri(format!("/api/v1/events/{event_id}"))
                    .header("authorization", auth.as_str())
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(deleted.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn event_update_rejects_non_organizer() {
        let (state, harness) = in_memory_state(test_config());
        let (owner_token, _) = logged_in_user(&harness, "organizer", UserRole::EventUser).await;
        let (other_token, _) = logged_in_user(&harness, "intruder", UserRole::EventUser).await;
        let app = build_app(state);

        let created = app
            .clone()
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/api/v1/events")
                    .header("content-type", "application/json")
                    .header("authorization", format!("Bearer {owner_token}"))
                    .body(Body::from(
                        r#"{"name":"Launch","starts_at":"2026-10-01T09:00:00Z","location":"HQ","budget":100.0,"event_type":"Corporate"}"#,
                    ))
                    .unwrap(),
            )
            .await
            .unwrap();
        let created_payload = json_body(created).await;
        let event_id = created_payload["event"]["id"].as_str().unwrap().to_string();

        let response = app
            .oneshot(
                Request::builder()
                    .method("PUT")
                    .uri(format!("/api/v1/events/{event_id}"))
                    .header("content-type", "application/json")
                    .header("authorization", format!("Bearer {other_token}"))
                    .body(Body::from(
                        r#"{"name":"Hijacked","starts_at":"2026-10-01T09:00:00Z","location":"HQ","budget":100.0,"event_type":"Corporate"}"#,
                    ))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::FORBIDDEN);
    }

    #[tokio::test]
    async fn invitation_feed_and_rsvp_flow() {
        let (state, harness) = in_memory_state(test_config());
        let (organizer_token, _) = logged_in_user(&harness, "organizer", UserRole::EventUser).await;
        let (guest_token, _) = logged_in_user(&harness, "guest1", UserRole::Guest).await;
        let app = build_app(state);

        // guest1's harness email follows the register_account convention.
        let created = app
            .clone()
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/api/v1/events")
                    .header("content-type", "application/json")
                    .header("authorization", format!("Bearer {organizer_token}"))
                    .body(Body::from(
                        r#"{"name":"Gala","starts_at":"2026-11-20T19:00:00Z","location":"Hall","budget":9000.0,"event_type":"Corporate","guests":[{"email":"guest1@example.org","status":"Pending"}]}"#,
                    ))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(created.status(), StatusCode::CREATED);
        let created_payload = json_body(created).await;
        let event_id = created_payload["event"]["id"].as_str().unwrap().to_string();

        let invitations = app
            .clone()
            .oneshot(
                Request::builder()
                    .uri("/api/v1/events/invitations")
                    .header("authorization", format!("Bearer {guest_token}"))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(invitations.status(), StatusCode::OK);
        let invitations_payload = json_body(invitations).await;
        assert_eq!(invitations_payload["events"].as_array().unwrap().len(), 1);

        let rsvp = app
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri(format!("/api/v1/events/{event_id}/rsvp"))
                    .header("content-type", "application/json")
                    .header("authorization", format!("Bearer {guest_token}"))
                    .body(Body::from(r#"{"status":"Accepted"}"#))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(rsvp.status(), StatusCode::OK);
        let rsvp_payload = json_body(rsvp).await;
        assert_eq!(rsvp_payload["event"]["guests"][0]["status"], "Accepted");
    }

    #[tokio::test]
    async fn vendor_listing_requires_vendor_role() {
        let (state, harness) = in_memory_state(test_config());
        let (guest_token, _) = logged_in_user(&harness, "guest1", UserRole::Guest).await;
        let app = build_app(state);

        let response = app
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/api/v1/vendors")
                    .header("content-type", "application/json")
                    .header("authorization", format!("Bearer {guest_token}"))
                    .body(Body::from(
                        r#"{"name":"Grand Ballroom","location":"Downtown","availability":true,"pricing":5000.0,"services":"Venue"}"#,
                    ))
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::FORBIDDEN);
        let payload = json_body(response).await;
        assert_eq!(payload["error"], "vendor_role_required");
    }

    #[tokio::test]
    async fn vendor_create_and_search_flow() {
        let (state, harness) = in_memory_state(test_config());
        let (vendor_token, _) = logged_in_user(&harness, "vendor1", UserRole::Vendor).await;
        let (organizer_token, _) = logged_in_user(&harness, "organizer", UserRole::EventUser).await;
        let app = build_app(state);

        let created = app
            .clone()
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/api/v1/vendors")
                    .header("content-type", "application/json")
                    .header("authorization", format!("Bearer {vendor_token}"))
                    .body(Body::from(
                        r#"{"name":"Grand Ballroom","location":"Downtown","availability":true,"pricing":5000.0,"services":"Venue"}"#,
                    ))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(created.status(), StatusCode::CREATED);

        let search = app
            .oneshot(
                Request::builder()
                    .uri("/api/v1/vendors/search?location=down&availability=true&max_pricing=6000")
                    .header("authorization", format!("Bearer {organizer_token}"))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(search.status(), StatusCode::OK);
        let payload = json_body(search).await;
        let vendors = payload["vendors"].as_array().unwrap();
        assert_eq!(vendors.len(), 1);
        assert_eq!(vendors[0]["name"], "Grand Ballroom");
    }

    #[tokio::test]
    async fn chat_socket_rejects_missing_token() {
        let (state, _harness) = in_memory_state(test_config());
        let app = build_app(state);

        let Some(listener) = bind_test_listener().await else {
            return;
        };
        let addr = listener.local_addr().unwrap();
        let server = tokio::spawn(async move {
            axum::serve(listener, app.into_make_service())
                .await
                .expect("unauthorized websocket test server error");
        });

        let url = format!("ws://{addr}/api/v1/chat/ws");
        match connect_async(url).await {
            Ok(_) => panic!("handshake unexpectedly succeeded without a token"),
            Err(tokio_tungstenite::tungstenite::Error::Http(response)) => {
                assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
            }
            Err(err) => panic!("unexpected websocket error: {err:?}"),
        }

        server.abort();
    }

    #[tokio::test]
    async fn chat_socket_rejects_garbage_token() {
        let (state, _harness) = in_memory_state(test_config());
        let app = build_app(state);

        let Some(listener) = bind_test_listener().await else {
            return;
        };
        let addr = listener.local_addr().unwrap();
        let server = tokio::spawn(async move {
            axum::serve(listener, app.into_make_service())
                .await
                .expect("invalid token websocket test server error");
        });

        let url = format!("ws://{addr}/api/v1/chat/ws?token=not-a-token");
        match connect_async(url).await {
            Ok(_) => panic!("handshake unexpectedly succeeded with a bad token"),
            Err(tokio_tungstenite::tungstenite::Error::Http(response)) => {
                assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
            }
            Err(err) => panic!("unexpected websocket error: {err:?}"),
        }

        server.abort();
    }

    #[tokio::test]
    async fn chat_socket_rejects_when_capacity_reached() {
        let mut config = ServerConfig::default();
        config.chat.max_connections = 1;
        let (state, harness) = in_memory_state(Arc::new(config));
        let (token, _) = logged_in_user(&harness, "alice", UserRole::EventUser).await;
        let app = build_app(state);

        let Some(listener) = bind_test_listener().await else {
            return;
        };
        let addr = listener.local_addr().unwrap();
        let server = tokio::spawn(async move {
            axum::serve(listener, app.into_make_service())
                .await
                .expect("capacity websocket test server error");
        });

        let url = format!("ws://{addr}/api/v1/chat/ws?token={token}");
        let (first_socket, _) = connect_async(url.clone()).await.expect("first connection");

        match connect_async(url).await {
            Ok(_) => panic!("second websocket connection should be rejected"),
            Err(tokio_tungstenite::tungstenite::Error::Http(response)) => {
                assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
            }
            Err(err) => panic!("unexpected websocket error: {err:?}"),
        }

        drop(first_socket);
        server.abort();
    }

    #[tokio::test]
    async fn chat_socket_receives_pushed_messages() {
        let (state, harness, chat) = in_memory_state_with_chat(test_config());
        let (_, sender_id) = logged_in_user(&harness, "alice", UserRole::EventUser).await;
        let (recipient_token, recipient_id) =
            logged_in_user(&harness, "bob", UserRole::Guest).await;
        let event_id = Uuid::new_v4();
        let app = build_app(state);

        let Some(listener) = bind_test_listener().await else {
            return;
        };
        let addr = listener.local_addr().unwrap();
        let server = tokio::spawn(async move {
            axum::serve(listener, app.into_make_service())
                .await
                .expect("push websocket test server error");
        });

        // Sent while the recipient is offline: stored, not pushed.
        let (_, outcome) = chat
            .send(sender_id, recipient_id, event_id, "offline note")
            .await
            .expect("send succeeds");
        assert!(!outcome.delivered());

        let url = format!("ws://{addr}/api/v1/chat/ws?token={recipient_token}");
        let (mut socket, _) = connect_async(url).await.expect("recipient connects");

        // First frame is the connection acknowledgement.
        let ack = timeout(Duration::from_secs(2), socket.next())
            .await
            .expect("ack expected")
            .expect("stream item")
            .expect("ack frame");
        let ack_payload: Value = match &ack {
            WsMessage::Text(text) => serde_json::from_str(text).unwrap(),
            other => panic!("unexpected websocket message {other:?}"),
        };
        assert_eq!(ack_payload["event"], STATUS_EVENT);
        assert_eq!(ack_payload["data"]["message"], "Connected!");

        // A message sent now is pushed live.
        let (_, outcome) = chat
            .send(sender_id, recipient_id, event_id, "live note")
            .await
            .expect("send succeeds");
        assert!(outcome.delivered());

        let pushed = timeout(Duration::from_secs(2), socket.next())
            .await
            .expect("push expected")
            .expect("stream item")
            .expect("push frame");
        let push_payload: Value = match &pushed {
            WsMessage::Text(text) => serde_json::from_str(text).unwrap(),
            other => panic!("unexpected websocket message {other:?}"),
        };
        assert_eq!(push_payload["event"], PUSH_CHAT_EVENT);
        assert_eq!(push_payload["data"]["text"], "live note");
        assert_eq!(
            push_payload["data"]["recipient"].as_str().unwrap(),
            recipient_id.to_string()
        );

        // The stored history covers both messages regardless of delivery.
        let history = chat.history_for(recipient_id).await.expect("history loads");
        assert_eq!(history.len(), 2);

        server.abort();
    }

    #[tokio::test]
    async fn server_shuts_down_on_trigger() {
        let (state, _harness) = in_memory_state(test_config());
        let app = build_app(state);

        let Some(listener) = bind_test_listener().await else {
            return;
        };
        let notify = install_shutdown_trigger();
        let server = tokio::spawn(async move {
            axum::serve(listener, app.into_make_service())
                .with_graceful_shutdown(shutdown_signal())
                .await
                .expect("shutdown test server error");
        });

        notify.notify_one();
        timeout(Duration::from_secs(5), server)
            .await
            .expect("server should stop after the trigger")
            .expect("server task completes");
    }

    #[test]
    fn build_subscriber_emits_expected_formats() {
        let json_writer = CaptureWriter::default();
        let json_subscriber =
            build_subscriber_with_writer(true, EnvFilter::new("info"), json_writer.clone());
        tracing::subscriber::with_default(json_subscriber, || {
            info!(message = "json-output");
        });
        let json_output = json_writer.contents();
        assert!(json_output.contains("\"message\":\"json-output\""));

        let compact_writer = CaptureWriter::default();
        let compact_subscriber =
            build_subscriber_with_writer(false, EnvFilter::new("info"), compact_writer.clone());
        tracing::subscriber::with_default(compact_subscriber, || {
            info!("compact-output");
        });
        let compact_output = compact_writer.contents();
        assert!(compact_output.contains("compact-output"));
    }

    #[cfg(feature = "metrics")]
    mod metrics_tests {
        use super::*;

        fn metrics_enabled_config() -> Arc<ServerConfig> {
            let mut config = ServerConfig::default();
            config.metrics.enabled = true;
            Arc::new(config)
        }

        #[tokio::test]
        async fn metrics_route_exposes_http_counters() {
            let metrics_ctx = MetricsContext::init().expect("metrics init");
            let (state, _harness) = in_memory_state(metrics_enabled_config());
            let state = state.with_metrics(Some(metrics_ctx));
            let app = build_app(state);

            let health = app
                .clone()
                .oneshot(
                    Request::builder()
                        .uri("/health")
                        .body(Body::empty())
                        .unwrap(),
                )
                .await
                .unwrap();
            assert_eq!(health.status(), StatusCode::OK);

            let response = app
                .oneshot(
                    Request::builder()
                        .uri("/metrics")
                        .body(Body::empty())
                        .unwrap(),
                )
                .await
                .unwrap();
            assert_eq!(response.status(), StatusCode::OK);
            let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
            let text = str::from_utf8(&body).unwrap();
            assert!(text.contains("planora_http_requests_total"));
        }

        #[tokio::test]
        async fn metrics_route_absent_when_disabled() {
            let (state, _harness) = in_memory_state(test_config());
            let app = build_app(state);

            let response = app
                .oneshot(
                    Request::builder()
                        .uri("/metrics")
                        .body(Body::empty())
                        .unwrap(),
                )
                .await
                .unwrap();
            assert_eq!(response.status(), StatusCode::NOT_FOUND);
        }
    }
}
