//! # tavern-web: real-time session layer
//!
//! Hosts [`tavern_engine`] games for players on separate devices. Sessions
//! live in a shared ephemeral store and are mutated by compare-and-set, so any
//! number of server instances can serve the same session. Changes fan out on
//! per-session channels and reach clients as server-sent events; the lobby
//! adds presence and a challenge handshake that starts sessions.
//!
//! ## Modules
//!
//! - [`store`] - Key-value store seam, in-memory backend, optimistic updates
//! - [`redis_store`] - Redis store and event transport shared across instances
//! - [`session`] - Move, forfeit, claim-win and abandon against the store
//! - [`connections`] - Per-participant heartbeats and the staleness rule
//! - [`events`] - Channel fanout and the event payloads
//! - [`gateway`] - Snapshot-first session and lobby streams
//! - [`presence`] / [`challenge`] - Lobby presence and the challenge broker
//! - [`history`] - Finalized-session records
//! - [`server`] / [`handlers`] - HTTP and SSE surface

pub mod challenge;
pub mod connections;
pub mod errors;
pub mod events;
pub mod gateway;
pub mod handlers;
pub mod history;
pub mod logging;
pub mod middleware;
pub mod presence;
pub mod redis_store;
pub mod server;
pub mod session;
pub mod settings;
pub mod store;

pub use challenge::{Challenge, ChallengeBroker, ChallengeError, ChallengeStatus};
pub use connections::ConnectionTracker;
pub use errors::{ErrorResponse, ErrorSeverity, IntoErrorResponse};
pub use events::{Event, EventBus, EventSubscription, EventTransport};
pub use gateway::{Gateway, LobbyStream, SessionStream};
pub use history::{HistoryError, HistorySink, HistoryStatistics, HistoryStore, SessionRecord};
pub use logging::{init_logging, init_test_logging, LogEntry, LogFormat, TestLogSubscriber};
pub use middleware::{log_response, with_request_logging};
pub use presence::{Presence, PresenceError, PresenceRegistry, PresenceStatus};
pub use redis_store::RedisStore;
pub use server::{
    AppContext, MaintenanceReport, ServerConfig, ServerError, ServerHandle, WebServer,
};
pub use session::{MoveOutcome, SessionError, SessionManager, SessionView};
pub use settings::{AppSettings, SettingsError};
pub use store::{KeyValueStore, MemoryStore, SessionStore, StoreError};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn context_shares_one_bus() {
        let ctx = AppContext::new_for_tests();
        let _sub = ctx.event_bus().subscribe(store::keys::session_updates("s"));
        assert_eq!(ctx.event_bus().subscriber_count(), 1);
        assert!(ctx.history().is_empty().unwrap());
    }
}
