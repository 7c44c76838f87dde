use crate::challenge::ChallengeBroker;
use crate::connections::ConnectionTracker;
use crate::errors::IntoErrorResponse;
use crate::events::EventBus;
use crate::gateway::Gateway;
use crate::handlers;
use crate::history::HistoryStore;
use crate::middleware::with_request_logging;
use crate::presence::PresenceRegistry;
use crate::redis_store::{self, RedisStore};
use crate::session::SessionManager;
use crate::settings::{AppSettings, SettingsError};
use crate::store::{KeyValueStore, MemoryStore, SessionStore};
use serde::Serialize;
use std::convert::Infallible;
use std::net::{SocketAddr, ToSocketAddrs};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use warp::filters::body::BodyDeserializeError;
use warp::filters::BoxedFilter;
use warp::http::StatusCode;
use warp::reply::{Reply, Response};
use warp::{Filter, Rejection};

const MAX_BODY_BYTES: u64 = 16 * 1024;

#[derive(Debug, Clone)]
pub struct ServerConfig {
    host: String,
    port: u16,
}

impl ServerConfig {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    pub fn for_tests() -> Self {
        Self::new("127.0.0.1", 0)
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }
}

/// Counts from one pass of the background sweeps.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct MaintenanceReport {
    pub stale_connections: usize,
    pub stale_presence: usize,
    pub expired_challenges: usize,
    pub purged_keys: usize,
}

#[derive(Debug, Clone)]
pub struct AppContext {
    config: ServerConfig,
    settings: Arc<AppSettings>,
    store: Arc<dyn KeyValueStore>,
    event_bus: EventBus,
    sessions: Arc<SessionManager>,
    presence: Arc<PresenceRegistry>,
    challenges: Arc<ChallengeBroker>,
    gateway: Arc<Gateway>,
    history: Arc<HistoryStore>,
    /// Source of shared events to relay into `event_bus`, when there is one.
    relay_from: Option<redis::Client>,
}

impl AppContext {
    /// Single-process context over an in-memory store and bus.
    pub fn new(config: ServerConfig, settings: AppSettings) -> Result<Self, ServerError> {
        Self::with_store(config, settings, Arc::new(MemoryStore::new()))
    }

    /// Context over a Redis server shared with other instances. Events
    /// published here reach streams attached to any instance once the
    /// server is started.
    pub fn connect_redis(
        config: ServerConfig,
        settings: AppSettings,
        url: &str,
    ) -> Result<Self, ServerError> {
        let redis = Arc::new(RedisStore::open(url).map_err(|e| {
            ServerError::ConfigError(format!("invalid redis url: {e}"))
        })?);
        let client = redis.client().clone();
        let bus = EventBus::with_transport(redis.clone());
        let mut context = Self::with_backend(config, settings, redis, bus)?;
        context.relay_from = Some(client);
        Ok(context)
    }

    pub fn with_store(
        config: ServerConfig,
        settings: AppSettings,
        store: Arc<dyn KeyValueStore>,
    ) -> Result<Self, ServerError> {
        Self::with_backend(config, settings, store, EventBus::new())
    }

    /// Wires every component around one shared store and one bus.
    pub fn with_backend(
        config: ServerConfig,
        settings: AppSettings,
        store: Arc<dyn KeyValueStore>,
        event_bus: EventBus,
    ) -> Result<Self, ServerError> {
        settings.validate()?;

        let history = Arc::new(HistoryStore::new());
        let tracker = ConnectionTracker::new(
            Arc::clone(&store),
            event_bus.clone(),
            settings.connection_staleness(),
            settings.active_session_ttl(),
        );
        let sessions = SessionManager::new(
            SessionStore::new(Arc::clone(&store)),
            event_bus.clone(),
            tracker,
            history.clone(),
            settings.clone(),
        );
        let presence = PresenceRegistry::new(
            Arc::clone(&store),
            event_bus.clone(),
            settings.presence_staleness(),
        );
        let challenges = ChallengeBroker::new(
            Arc::clone(&store),
            event_bus.clone(),
            presence.clone(),
            sessions.clone(),
            settings.challenge_ttl(),
        );
        let gateway = Gateway::new(
            sessions.clone(),
            presence.clone(),
            challenges.clone(),
            event_bus.clone(),
            settings.stream_refresh(),
        );

        Ok(Self {
            config,
            settings: Arc::new(settings),
            store,
            event_bus,
            sessions: Arc::new(sessions),
            presence: Arc::new(presence),
            challenges: Arc::new(challenges),
            gateway: Arc::new(gateway),
            history,
            relay_from: None,
        })
    }

    pub fn new_for_tests() -> Self {
        Self::new(ServerConfig::for_tests(), AppSettings::default()).expect("test context")
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    pub fn settings(&self) -> Arc<AppSettings> {
        Arc::clone(&self.settings)
    }

    pub fn store(&self) -> Arc<dyn KeyValueStore> {
        Arc::clone(&self.store)
    }

    pub fn event_bus(&self) -> EventBus {
        self.event_bus.clone()
    }

    pub fn sessions(&self) -> Arc<SessionManager> {
        Arc::clone(&self.sessions)
    }

    pub fn presence(&self) -> Arc<PresenceRegistry> {
        Arc::clone(&self.presence)
    }

    pub fn challenges(&self) -> Arc<ChallengeBroker> {
        Arc::clone(&self.challenges)
    }

    pub fn gateway(&self) -> Arc<Gateway> {
        Arc::clone(&self.gateway)
    }

    pub fn history(&self) -> Arc<HistoryStore> {
        Arc::clone(&self.history)
    }

    /// One pass of every sweep. A failing sweep is logged and skipped.
    pub fn run_maintenance(&self) -> MaintenanceReport {
        let mut report = MaintenanceReport::default();

        match self.sessions.tracker().sweep() {
            Ok(n) => report.stale_connections = n,
            Err(e) => tracing::warn!(error = %e, "connection sweep failed"),
        }
        match self.presence.sweep() {
            Ok(n) => report.stale_presence = n,
            Err(e) => tracing::warn!(error = %e, "presence sweep failed"),
        }
        match self.challenges.expire_stale() {
            Ok(n) => report.expired_challenges = n,
            Err(e) => tracing::warn!(error = %e, "challenge sweep failed"),
        }
        match self.store.purge_expired() {
            Ok(n) => report.purged_keys = n,
            Err(e) => tracing::warn!(error = %e, "store purge failed"),
        }

        if report != MaintenanceReport::default() {
            tracing::debug!(
                stale_connections = report.stale_connections,
                stale_presence = report.stale_presence,
                expired_challenges = report.expired_challenges,
                purged_keys = report.purged_keys,
                "maintenance pass"
            );
        }
        report
    }
}

#[derive(Debug, Error)]
pub enum ServerError {
    #[error("Failed to bind to address: {0}")]
    BindError(#[from] std::io::Error),
    #[error("Configuration error: {0}")]
    ConfigError(String),
    #[error(transparent)]
    Settings(#[from] SettingsError),
}

#[derive(Debug, Clone)]
pub struct WebServer {
    context: AppContext,
}

impl WebServer {
    pub fn new(config: ServerConfig, settings: AppSettings) -> Result<Self, ServerError> {
        let context = AppContext::new(config, settings)?;
        Ok(Self { context })
    }

    pub fn from_context(context: AppContext) -> Self {
        Self { context }
    }

    pub fn context(&self) -> &AppContext {
        &self.context
    }

    pub async fn start(self) -> Result<ServerHandle, ServerError> {
        let WebServer { context } = self;
        let bind_addr = Self::bind_addr(context.config())?;

        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let routes = Self::routes(&context);
        let shutdown_signal = async move {
            let _ = shutdown_rx.await;
        };

        let (addr, server_future) = warp::serve(routes)
            .try_bind_with_graceful_shutdown(bind_addr, shutdown_signal)
            .map_err(Self::map_warp_error)?;

        tracing::info!(address = %addr, "web server listening");

        let task = tokio::spawn(async move {
            server_future.await;
            Ok(())
        });
        let mut background = vec![Self::spawn_maintenance(context.clone())];
        if let Some(client) = context.relay_from.clone() {
            background.push(redis_store::spawn_relay(client, context.event_bus()));
        }

        Ok(ServerHandle::new(addr, shutdown_tx, task, background, context))
    }

    fn spawn_maintenance(context: AppContext) -> JoinHandle<()> {
        let period = context.settings.sweep_interval();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                interval.tick().await;
                context.run_maintenance();
            }
        })
    }

    fn bind_addr(config: &ServerConfig) -> Result<SocketAddr, ServerError> {
        let host = config.host();

        if let Ok(addr) = host.parse::<SocketAddr>() {
            return Ok(addr);
        }

        if let Ok(ip) = host.parse::<std::net::IpAddr>() {
            return Ok(SocketAddr::new(ip, config.port()));
        }

        let candidate = format!("{}:{}", host, config.port());
        let mut addrs = candidate.to_socket_addrs().map_err(|err| {
            ServerError::ConfigError(format!("failed to resolve address `{candidate}`: {err}"))
        })?;

        addrs.next().ok_or_else(|| {
            ServerError::ConfigError(format!("failed to resolve address `{candidate}`"))
        })
    }

    fn map_warp_error(err: warp::Error) -> ServerError {
        use std::error::Error as StdError;

        if let Some(source) = err.source() {
            if let Some(io_err) = source.downcast_ref::<std::io::Error>() {
                let recreated = std::io::Error::new(io_err.kind(), io_err.to_string());
                return ServerError::BindError(recreated);
            }
        }

        ServerError::ConfigError(err.to_string())
    }

    /// Every route, with request logging and rejections rendered as JSON
    /// error bodies.
    pub fn routes(context: &AppContext) -> BoxedFilter<(Response,)> {
        let api = Self::health_route()
            .or(Self::settings_route(context))
            .unify()
            .or(Self::session_routes(context))
            .unify()
            .or(Self::lobby_routes(context))
            .unify()
            .or(Self::stream_routes(context))
            .unify()
            .or(Self::history_routes(context))
            .unify();

        with_request_logging(api)
            .recover(handle_rejection)
            .unify()
            .boxed()
    }

    fn health_route() -> BoxedFilter<(Response,)> {
        warp::path("health")
            .and(warp::get())
            .and(warp::path::end())
            .map(|| handlers::health().into_response())
            .boxed()
    }

    fn settings_route(context: &AppContext) -> BoxedFilter<(Response,)> {
        warp::path!("api" / "settings")
            .and(warp::get())
            .and(Self::with_settings(context.settings()))
            .and_then(|settings: Arc<AppSettings>| async move {
                let response = handlers::get_settings(settings).await;
                Ok::<_, Infallible>(response)
            })
            .boxed()
    }

    fn session_routes(context: &AppContext) -> BoxedFilter<(Response,)> {
        let sessions = context.sessions();

        let info = warp::path!("api" / "sessions" / String)
            .and(warp::get())
            .and(warp::query::<handlers::ViewerQuery>())
            .and(Self::with_session_manager(sessions.clone()))
            .and_then(
                |session_id: String,
                 query: handlers::ViewerQuery,
                 sessions: Arc<SessionManager>| async move {
                    let response = handlers::get_session(sessions, session_id, query).await;
                    Ok::<_, Infallible>(response)
                },
            );

        let moves = warp::path!("api" / "sessions" / String / "moves")
            .and(warp::post())
            .and(Self::json_body::<handlers::MoveRequest>())
            .and(Self::with_session_manager(sessions.clone()))
            .and_then(
                |session_id: String,
                 request: handlers::MoveRequest,
                 sessions: Arc<SessionManager>| async move {
                    let response = handlers::submit_move(sessions, session_id, request).await;
                    Ok::<_, Infallible>(response)
                },
            );

        let forfeit = warp::path!("api" / "sessions" / String / "forfeit")
            .and(warp::post())
            .and(Self::json_body::<handlers::ParticipantRequest>())
            .and(Self::with_session_manager(sessions.clone()))
            .and_then(
                |session_id: String,
                 request: handlers::ParticipantRequest,
                 sessions: Arc<SessionManager>| async move {
                    let response = handlers::forfeit(sessions, session_id, request).await;
                    Ok::<_, Infallible>(response)
                },
            );

        let claim_win = warp::path!("api" / "sessions" / String / "claim-win")
            .and(warp::post())
            .and(Self::json_body::<handlers::ParticipantRequest>())
            .and(Self::with_session_manager(sessions.clone()))
            .and_then(
                |session_id: String,
                 request: handlers::ParticipantRequest,
                 sessions: Arc<SessionManager>| async move {
                    let response = handlers::claim_win(sessions, session_id, request).await;
                    Ok::<_, Infallible>(response)
                },
            );

        let heartbeat = warp::path!("api" / "sessions" / String / "heartbeat")
            .and(warp::post())
            .and(Self::json_body::<handlers::ParticipantRequest>())
            .and(Self::with_session_manager(sessions.clone()))
            .and_then(
                |session_id: String,
                 request: handlers::ParticipantRequest,
                 sessions: Arc<SessionManager>| async move {
                    let response = handlers::heartbeat(sessions, session_id, request).await;
                    Ok::<_, Infallible>(response)
                },
            );

        let leave = warp::path!("api" / "sessions" / String / "leave")
            .and(warp::post())
            .and(Self::json_body::<handlers::ParticipantRequest>())
            .and(Self::with_session_manager(sessions.clone()))
            .and_then(
                |session_id: String,
                 request: handlers::ParticipantRequest,
                 sessions: Arc<SessionManager>| async move {
                    let response = handlers::leave(sessions, session_id, request).await;
                    Ok::<_, Infallible>(response)
                },
            );

        let abandon = warp::path!("api" / "sessions" / String)
            .and(warp::delete())
            .and(warp::query::<handlers::AbandonQuery>())
            .and(Self::with_session_manager(sessions))
            .and_then(
                |session_id: String,
                 query: handlers::AbandonQuery,
                 sessions: Arc<SessionManager>| async move {
                    let response = handlers::abandon_session(sessions, session_id, query).await;
                    Ok::<_, Infallible>(response)
                },
            );

        info.or(moves)
            .unify()
            .or(forfeit)
            .unify()
            .or(claim_win)
            .unify()
            .or(heartbeat)
            .unify()
            .or(leave)
            .unify()
            .or(abandon)
            .unify()
            .boxed()
    }

    fn lobby_routes(context: &AppContext) -> BoxedFilter<(Response,)> {
        let presence = context.presence();
        let challenges = context.challenges();

        let heartbeat = warp::path!("api" / "lobby" / "presence")
            .and(warp::post())
            .and(Self::json_body::<handlers::PresenceRequest>())
            .and(Self::with_presence(presence.clone()))
            .and_then(
                |request: handlers::PresenceRequest, presence: Arc<PresenceRegistry>| async move {
                    let response = handlers::presence_heartbeat(presence, request).await;
                    Ok::<_, Infallible>(response)
                },
            );

        let online = warp::path!("api" / "lobby" / "presence")
            .and(warp::get())
            .and(Self::with_presence(presence.clone()))
            .and_then(|presence: Arc<PresenceRegistry>| async move {
                let response = handlers::list_online(presence).await;
                Ok::<_, Infallible>(response)
            });

        let depart = warp::path!("api" / "lobby" / "presence" / String)
            .and(warp::delete())
            .and(Self::with_presence(presence))
            .and_then(|user_id: String, presence: Arc<PresenceRegistry>| async move {
                let response = handlers::depart(presence, user_id).await;
                Ok::<_, Infallible>(response)
            });

        let create = warp::path!("api" / "lobby" / "challenges")
            .and(warp::post())
            .and(Self::json_body::<handlers::CreateChallengeRequest>())
            .and(Self::with_challenge_broker(challenges.clone()))
            .and_then(
                |request: handlers::CreateChallengeRequest,
                 challenges: Arc<ChallengeBroker>| async move {
                    let response = handlers::create_challenge(challenges, request).await;
                    Ok::<_, Infallible>(response)
                },
            );

        let pending = warp::path!("api" / "lobby" / "challenges")
            .and(warp::get())
            .and(warp::query::<handlers::PendingQuery>())
            .and(Self::with_challenge_broker(challenges.clone()))
            .and_then(
                |query: handlers::PendingQuery, challenges: Arc<ChallengeBroker>| async move {
                    let response = handlers::pending_challenges(challenges, query).await;
                    Ok::<_, Infallible>(response)
                },
            );

        let respond = warp::path!("api" / "lobby" / "challenges" / String / "respond")
            .and(warp::post())
            .and(Self::json_body::<handlers::RespondRequest>())
            .and(Self::with_challenge_broker(challenges))
            .and_then(
                |challenge_id: String,
                 request: handlers::RespondRequest,
                 challenges: Arc<ChallengeBroker>| async move {
                    let response =
                        handlers::respond_to_challenge(challenges, challenge_id, request).await;
                    Ok::<_, Infallible>(response)
                },
            );

        heartbeat
            .or(online)
            .unify()
            .or(depart)
            .unify()
            .or(create)
            .unify()
            .or(pending)
            .unify()
            .or(respond)
            .unify()
            .boxed()
    }

    fn stream_routes(context: &AppContext) -> BoxedFilter<(Response,)> {
        let gateway = context.gateway();

        let session = warp::path!("api" / "sessions" / String / "events")
            .and(warp::get())
            .and(warp::query::<handlers::ViewerQuery>())
            .and(Self::with_gateway(gateway.clone()))
            .and_then(
                |session_id: String,
                 query: handlers::ViewerQuery,
                 gateway: Arc<Gateway>| async move {
                    let response = handlers::session_events(gateway, session_id, query).await;
                    Ok::<_, Infallible>(response)
                },
            );

        let lobby = warp::path!("api" / "lobby" / "events")
            .and(warp::get())
            .and(warp::query::<handlers::LobbyQuery>())
            .and(Self::with_gateway(gateway))
            .and_then(
                |query: handlers::LobbyQuery, gateway: Arc<Gateway>| async move {
                    let response = handlers::lobby_events(gateway, query).await;
                    Ok::<_, Infallible>(response)
                },
            );

        session.or(lobby).unify().boxed()
    }

    fn history_routes(context: &AppContext) -> BoxedFilter<(Response,)> {
        let history = context.history();

        let recent = warp::path!("api" / "history")
            .and(warp::get())
            .and(warp::query::<handlers::HistoryQuery>())
            .and(Self::with_history_store(history.clone()))
            .and_then(
                |query: handlers::HistoryQuery, history: Arc<HistoryStore>| async move {
                    let response = handlers::get_recent_sessions(history, query).await;
                    Ok::<_, Infallible>(response)
                },
            );

        let stats = warp::path!("api" / "history" / "stats")
            .and(warp::get())
            .and(warp::query::<handlers::StatsQuery>())
            .and(Self::with_history_store(history))
            .and_then(
                |query: handlers::StatsQuery, history: Arc<HistoryStore>| async move {
                    let response = handlers::get_history_stats(history, query).await;
                    Ok::<_, Infallible>(response)
                },
            );

        recent.or(stats).unify().boxed()
    }

    fn json_body<T>() -> impl Filter<Extract = (T,), Error = Rejection> + Clone
    where
        T: serde::de::DeserializeOwned + Send,
    {
        warp::body::content_length_limit(MAX_BODY_BYTES).and(warp::body::json())
    }

    fn with_settings(
        settings: Arc<AppSettings>,
    ) -> impl Filter<Extract = (Arc<AppSettings>,), Error = Infallible> + Clone {
        warp::any().map(move || Arc::clone(&settings))
    }

    fn with_session_manager(
        sessions: Arc<SessionManager>,
    ) -> impl Filter<Extract = (Arc<SessionManager>,), Error = Infallible> + Clone {
        warp::any().map(move || Arc::clone(&sessions))
    }

    fn with_presence(
        presence: Arc<PresenceRegistry>,
    ) -> impl Filter<Extract = (Arc<PresenceRegistry>,), Error = Infallible> + Clone {
        warp::any().map(move || Arc::clone(&presence))
    }

    fn with_challenge_broker(
        challenges: Arc<ChallengeBroker>,
    ) -> impl Filter<Extract = (Arc<ChallengeBroker>,), Error = Infallible> + Clone {
        warp::any().map(move || Arc::clone(&challenges))
    }

    fn with_gateway(
        gateway: Arc<Gateway>,
    ) -> impl Filter<Extract = (Arc<Gateway>,), Error = Infallible> + Clone {
        warp::any().map(move || Arc::clone(&gateway))
    }

    fn with_history_store(
        history: Arc<HistoryStore>,
    ) -> impl Filter<Extract = (Arc<HistoryStore>,), Error = Infallible> + Clone {
        warp::any().map(move || Arc::clone(&history))
    }
}

/// A request warp refused before any handler ran.
#[derive(Debug)]
struct RejectedRequest {
    status: StatusCode,
    code: &'static str,
    message: String,
}

impl IntoErrorResponse for RejectedRequest {
    fn status_code(&self) -> StatusCode {
        self.status
    }

    fn error_code(&self) -> &'static str {
        self.code
    }

    fn error_message(&self) -> String {
        self.message.clone()
    }
}

async fn handle_rejection(err: Rejection) -> Result<Response, Infallible> {
    let rejected = if err.is_not_found() {
        RejectedRequest {
            status: StatusCode::NOT_FOUND,
            code: "not_found",
            message: "no such route".to_string(),
        }
    } else if let Some(e) = err.find::<BodyDeserializeError>() {
        RejectedRequest {
            status: StatusCode::BAD_REQUEST,
            code: "invalid_body",
            message: e.to_string(),
        }
    } else if let Some(e) = err.find::<warp::reject::InvalidQuery>() {
        RejectedRequest {
            status: StatusCode::BAD_REQUEST,
            code: "invalid_query",
            message: e.to_string(),
        }
    } else if err.find::<warp::reject::PayloadTooLarge>().is_some() {
        RejectedRequest {
            status: StatusCode::PAYLOAD_TOO_LARGE,
            code: "payload_too_large",
            message: format!("request body exceeds {MAX_BODY_BYTES} bytes"),
        }
    } else if err.find::<warp::reject::UnsupportedMediaType>().is_some() {
        RejectedRequest {
            status: StatusCode::UNSUPPORTED_MEDIA_TYPE,
            code: "unsupported_media_type",
            message: "expected a JSON body".to_string(),
        }
    } else if err.find::<warp::reject::MethodNotAllowed>().is_some() {
        RejectedRequest {
            status: StatusCode::METHOD_NOT_ALLOWED,
            code: "method_not_allowed",
            message: "method not allowed".to_string(),
        }
    } else {
        RejectedRequest {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            code: "internal_error",
            message: format!("unhandled rejection: {err:?}"),
        }
    };
    Ok(rejected.into_http_response())
}

#[derive(Debug)]
pub struct ServerHandle {
    addr: SocketAddr,
    shutdown: Option<oneshot::Sender<()>>,
    task: Option<JoinHandle<Result<(), ServerError>>>,
    /// Maintenance sweep and, with a shared backend, the event relay.
    background: Vec<JoinHandle<()>>,
    context: AppContext,
}

impl ServerHandle {
    fn new(
        addr: SocketAddr,
        shutdown: oneshot::Sender<()>,
        task: JoinHandle<Result<(), ServerError>>,
        background: Vec<JoinHandle<()>>,
        context: AppContext,
    ) -> Self {
        Self {
            addr,
            shutdown: Some(shutdown),
            task: Some(task),
            background,
            context,
        }
    }

    fn stop_background(&mut self) {
        for task in self.background.drain(..) {
            task.abort();
        }
    }

    pub fn address(&self) -> SocketAddr {
        self.addr
    }

    pub fn context(&self) -> &AppContext {
        &self.context
    }

    pub async fn shutdown(mut self) -> Result<(), ServerError> {
        self.stop_background();
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }

        if let Some(task) = self.task.take() {
            match task.await {
                Ok(result) => result?,
                Err(err) => {
                    return Err(ServerError::ConfigError(format!(
                        "server task join error: {err}"
                    )))
                }
            }
        }

        tracing::info!(address = %self.addr, "web server stopped");
        Ok(())
    }
}

impl Drop for ServerHandle {
    fn drop(&mut self) {
        self.stop_background();
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }

        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}
