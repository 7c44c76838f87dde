//! Two server instances over one store and one event transport behave as a
//! single server: state written through either is seen by both, and streams
//! attached to one hear what the other publishes.

use std::sync::{Arc, RwLock};
use std::time::Duration;
use tavern_engine::game::{GameKind, GameOptions, Move};
use tavern_engine::MoveError;
use tavern_web::events::{Event, EventBus, EventTransport};
use tavern_web::server::{AppContext, ServerConfig};
use tavern_web::session::SessionError;
use tavern_web::settings::AppSettings;
use tavern_web::store::{KeyValueStore, MemoryStore, StoreError};
use tokio_stream::StreamExt;

/// Stands in for a broker: every publish is delivered to each joined bus.
#[derive(Debug, Default)]
struct Broker {
    buses: RwLock<Vec<EventBus>>,
}

impl EventTransport for Broker {
    fn publish(&self, channel: &str, payload: String) -> Result<usize, StoreError> {
        let event: Event = serde_json::from_str(&payload)
            .map_err(|e| StoreError::Unavailable(e.to_string()))?;
        let buses = self.buses.read().expect("broker lock");
        for bus in buses.iter() {
            bus.deliver(channel, event.clone());
        }
        Ok(buses.len())
    }
}

fn instances() -> (AppContext, AppContext) {
    let store: Arc<dyn KeyValueStore> = Arc::new(MemoryStore::new());
    let broker = Arc::new(Broker::default());
    let mut contexts = Vec::new();
    for _ in 0..2 {
        let bus = EventBus::with_transport(broker.clone());
        broker.buses.write().expect("broker lock").push(bus.clone());
        contexts.push(
            AppContext::with_backend(
                ServerConfig::for_tests(),
                AppSettings::default(),
                Arc::clone(&store),
                bus,
            )
            .expect("context"),
        );
    }
    let second = contexts.pop().expect("second");
    let first = contexts.pop().expect("first");
    (first, second)
}

fn start(context: &AppContext) {
    context
        .sessions()
        .create_session(
            Some("shared".to_string()),
            GameKind::TicTacToe,
            GameOptions::default(),
            vec![
                ("ann".to_string(), "Ann".to_string()),
                ("ben".to_string(), "Ben".to_string()),
            ],
        )
        .expect("create session");
}

#[tokio::test]
async fn a_move_on_one_instance_reaches_a_stream_on_the_other() {
    let (east, west) = instances();
    start(&east);

    let mut ben = west
        .gateway()
        .attach_session("shared", Some("ben"))
        .expect("attach on west");
    assert!(matches!(ben.next().await, Some(Event::Connected { .. })));

    east.sessions()
        .submit_move("shared", "ann", &Move::Mark { position: 4 })
        .expect("move on east");

    let update = tokio::time::timeout(Duration::from_secs(1), async {
        while let Some(event) = ben.next().await {
            if let Event::StateUpdate { session } = event {
                return Some(session);
            }
        }
        None
    })
    .await
    .expect("update in time")
    .expect("stream open");
    assert_eq!(update.move_count, 1);
    assert_eq!(update.current_turn.as_deref(), Some("ben"));
}

#[tokio::test]
async fn liveness_recorded_on_one_instance_guards_claims_on_the_other() {
    let (east, west) = instances();
    start(&east);

    let _ben = east
        .gateway()
        .attach_session("shared", Some("ben"))
        .expect("attach on east");
    assert!(west.sessions().tracker().is_live("shared", "ben").unwrap());
    assert!(matches!(
        west.sessions().claim_win("shared", "ann"),
        Err(SessionError::Move(MoveError::NotEligible(_)))
    ));

    west.sessions()
        .submit_move("shared", "ann", &Move::Mark { position: 0 })
        .expect("move on west");
    assert!(matches!(
        east.sessions().submit_move("shared", "ann", &Move::Mark { position: 1 }),
        Err(SessionError::Move(MoveError::NotYourTurn { .. }))
    ));
}
