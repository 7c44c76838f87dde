//! Long-lived push streams for sessions and the lobby.
//!
//! Every stream starts with a snapshot event built after subscribing, so a
//! client that reconnects never needs a replay: the snapshot plus whatever
//! follows is the whole picture.

use crate::challenge::{ChallengeBroker, ChallengeError};
use crate::connections::ConnectionTracker;
use crate::events::{Event, EventBus, EventSubscription};
use crate::presence::PresenceRegistry;
use crate::session::{self, SessionError, SessionManager, SessionView};
use crate::store::keys;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;
use tavern_engine::session::{ParticipantId, SessionId};
use tokio::time::{Interval, MissedTickBehavior};
use tokio_stream::Stream;

#[derive(Debug, Clone)]
pub struct Gateway {
    sessions: SessionManager,
    presence: PresenceRegistry,
    challenges: ChallengeBroker,
    bus: EventBus,
    stream_refresh: Duration,
}

impl Gateway {
    pub fn new(
        sessions: SessionManager,
        presence: PresenceRegistry,
        challenges: ChallengeBroker,
        bus: EventBus,
        stream_refresh: Duration,
    ) -> Self {
        Self {
            sessions,
            presence,
            challenges,
            bus,
            stream_refresh,
        }
    }

    /// Opens a session stream for a participant, or for a spectator when the
    /// session is public. Participants are heartbeated for as long as the
    /// stream is polled and detached when it is dropped.
    pub fn attach_session(
        &self,
        session_id: &str,
        participant: Option<&str>,
    ) -> Result<SessionStream, SessionError> {
        session::authorize_viewer(&self.sessions.load(session_id)?, participant)?;

        let events = self.bus.subscribe(keys::session_updates(session_id));
        let snapshot = self.sessions.load(session_id)?;
        let participant = participant
            .filter(|p| snapshot.is_participant(p))
            .map(str::to_string);

        let guard = match &participant {
            Some(participant_id) => {
                self.sessions.tracker().heartbeat(session_id, participant_id)?;
                Some(DetachGuard {
                    tracker: self.sessions.tracker().clone(),
                    session_id: session_id.to_string(),
                    participant_id: participant_id.clone(),
                })
            }
            None => None,
        };
        let refresh = guard.as_ref().map(|_| {
            let period = self.stream_refresh;
            let start = tokio::time::Instant::now() + period;
            let mut interval = tokio::time::interval_at(start, period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            interval
        });

        tracing::info!(
            session_id = %session_id,
            participant_id = participant.as_deref().unwrap_or("spectator"),
            "session stream attached"
        );
        Ok(SessionStream {
            first: Some(Event::Connected {
                session: SessionView::from(&snapshot),
                participant_id: participant,
            }),
            events,
            refresh,
            guard,
        })
    }

    /// Opens the personal lobby stream: a heartbeat, then a snapshot of who
    /// is online and which challenges are open, then personal and presence
    /// events interleaved. Dropping it does not end presence; that lapses on
    /// its own without heartbeats.
    pub fn attach_lobby(
        &self,
        user_id: &str,
        display_name: Option<&str>,
    ) -> Result<LobbyStream, ChallengeError> {
        let presence = self.presence.heartbeat(user_id, display_name, None, None)?;
        let user_id = presence.user_id;

        let personal = self.bus.subscribe(keys::lobby(&user_id));
        let roster = self.bus.subscribe(keys::LOBBY_PRESENCE);
        let online = self.presence.list_online()?;
        let challenges = self.challenges.pending_for(&user_id)?;

        tracing::info!(user_id = %user_id, online = online.len(), "lobby stream attached");
        Ok(LobbyStream {
            first: Some(Event::LobbyConnected {
                user_id,
                online,
                challenges,
            }),
            personal,
            roster,
            prefer_personal: true,
        })
    }
}

struct DetachGuard {
    tracker: ConnectionTracker,
    session_id: SessionId,
    participant_id: ParticipantId,
}

impl DetachGuard {
    fn refresh(&self) {
        if let Err(e) = self.tracker.heartbeat(&self.session_id, &self.participant_id) {
            tracing::warn!(session_id = %self.session_id, error = %e, "stream heartbeat failed");
        }
    }
}

impl Drop for DetachGuard {
    fn drop(&mut self) {
        tracing::info!(
            session_id = %self.session_id,
            participant_id = %self.participant_id,
            "session stream closed"
        );
        if let Err(e) = self.tracker.detach(&self.session_id, &self.participant_id) {
            tracing::warn!(session_id = %self.session_id, error = %e, "detach failed");
        }
    }
}

/// `connected` snapshot followed by everything published on the session
/// channel.
pub struct SessionStream {
    first: Option<Event>,
    events: EventSubscription,
    refresh: Option<Interval>,
    guard: Option<DetachGuard>,
}

impl Stream for SessionStream {
    type Item = Event;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Event>> {
        let this = self.get_mut();
        if let Some(event) = this.first.take() {
            return Poll::Ready(Some(event));
        }
        if let (Some(interval), Some(guard)) = (this.refresh.as_mut(), this.guard.as_ref()) {
            while interval.poll_tick(cx).is_ready() {
                guard.refresh();
            }
        }
        Pin::new(&mut this.events).poll_next(cx)
    }
}

/// `lobby_connected` snapshot followed by personal and presence events.
pub struct LobbyStream {
    first: Option<Event>,
    personal: EventSubscription,
    roster: EventSubscription,
    prefer_personal: bool,
}

impl Stream for LobbyStream {
    type Item = Event;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Event>> {
        let this = self.get_mut();
        if let Some(event) = this.first.take() {
            return Poll::Ready(Some(event));
        }

        let mut closed = 0;
        for personal in [this.prefer_personal, !this.prefer_personal] {
            let source = if personal {
                &mut this.personal
            } else {
                &mut this.roster
            };
            match Pin::new(source).poll_next(cx) {
                Poll::Ready(Some(event)) => {
                    this.prefer_personal = !personal;
                    return Poll::Ready(Some(event));
                }
                Poll::Ready(None) => closed += 1,
                Poll::Pending => {}
            }
        }
        if closed == 2 {
            Poll::Ready(None)
        } else {
            Poll::Pending
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::history::HistoryStore;
    use crate::settings::AppSettings;
    use crate::store::{KeyValueStore, MemoryStore, SessionStore};
    use std::sync::Arc;
    use tavern_engine::game::{GameKind, GameOptions, Move};
    use tokio_stream::StreamExt;

    struct Fixture {
        gateway: Gateway,
        sessions: SessionManager,
        challenges: ChallengeBroker,
    }

    fn fixture() -> Fixture {
        let kv: Arc<dyn KeyValueStore> = Arc::new(MemoryStore::new());
        let bus = EventBus::new();
        let settings = AppSettings::default();
        let tracker = ConnectionTracker::new(
            Arc::clone(&kv),
            bus.clone(),
            settings.connection_staleness(),
            settings.active_session_ttl(),
        );
        let sessions = SessionManager::new(
            SessionStore::new(Arc::clone(&kv)),
            bus.clone(),
            tracker,
            Arc::new(HistoryStore::new()),
            settings.clone(),
        );
        let presence =
            PresenceRegistry::new(Arc::clone(&kv), bus.clone(), settings.presence_staleness());
        let challenges = ChallengeBroker::new(
            kv,
            bus.clone(),
            presence.clone(),
            sessions.clone(),
            settings.challenge_ttl(),
        );
        let gateway = Gateway::new(
            sessions.clone(),
            presence,
            challenges.clone(),
            bus,
            settings.stream_refresh(),
        );
        Fixture {
            gateway,
            sessions,
            challenges,
        }
    }

    fn start(f: &Fixture) {
        f.sessions
            .create_session(
                Some("s".into()),
                GameKind::TicTacToe,
                GameOptions::default(),
                vec![("ann".into(), "Ann".into()), ("ben".into(), "Ben".into())],
            )
            .expect("session");
    }

    #[tokio::test]
    async fn snapshot_comes_first_and_attachment_heartbeats() {
        let f = fixture();
        start(&f);

        let mut stream = f.gateway.attach_session("s", Some("ann")).expect("attach");
        let first = stream.next().await.expect("snapshot");
        assert!(matches!(
            &first,
            Event::Connected { participant_id: Some(p), session } if p == "ann" && session.id == "s"
        ));
        assert!(f.sessions.tracker().is_live("s", "ann").unwrap());
        assert!(matches!(
            stream.next().await,
            Some(Event::ParticipantConnected { .. })
        ));
    }

    #[tokio::test]
    async fn dropping_the_stream_detaches() {
        let f = fixture();
        start(&f);
        let mut watcher = f.gateway.attach_session("s", Some("ben")).unwrap();
        let stream = f.gateway.attach_session("s", Some("ann")).unwrap();
        drop(stream);

        assert!(!f.sessions.tracker().is_live("s", "ann").unwrap());
        let saw_disconnect = tokio::time::timeout(Duration::from_secs(1), async {
            while let Some(event) = watcher.next().await {
                if matches!(
                    &event,
                    Event::ParticipantDisconnected { participant_id, .. } if participant_id == "ann"
                ) {
                    return true;
                }
            }
            false
        })
        .await
        .unwrap_or(false);
        assert!(saw_disconnect);
    }

    #[tokio::test]
    async fn private_sessions_refuse_strangers() {
        let f = fixture();
        start(&f);
        assert!(matches!(
            f.gateway.attach_session("s", Some("zed")),
            Err(SessionError::AccessDenied { .. })
        ));
        assert!(matches!(
            f.gateway.attach_session("missing", Some("ann")),
            Err(SessionError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn reattach_snapshot_matches_last_update() {
        let f = fixture();
        start(&f);
        let mut stream = f.gateway.attach_session("s", Some("ann")).unwrap();
        stream.next().await;

        f.sessions
            .submit_move("s", "ann", &Move::Mark { position: 4 })
            .unwrap();
        let last_update = loop {
            match stream.next().await {
                Some(Event::StateUpdate { session }) => break session,
                Some(_) => continue,
                None => panic!("stream ended"),
            }
        };
        drop(stream);

        let mut again = f.gateway.attach_session("s", Some("ann")).unwrap();
        match again.next().await {
            Some(Event::Connected { session, .. }) => assert_eq!(session, last_update),
            other => panic!("expected snapshot, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn lobby_stream_delivers_snapshot_then_challenges() {
        let f = fixture();
        let mut ben = f.gateway.attach_lobby("ben", Some("Ben")).expect("lobby");
        match ben.next().await {
            Some(Event::LobbyConnected { user_id, online, challenges }) => {
                assert_eq!(user_id, "ben");
                assert_eq!(online.len(), 1);
                assert!(challenges.is_empty());
            }
            other => panic!("expected lobby snapshot, got {other:?}"),
        }

        f.challenges
            .create("ann", vec!["ben".into()], GameKind::TicTacToe, GameOptions::default())
            .unwrap();
        let received = loop {
            match ben.next().await {
                Some(Event::ChallengeReceived { challenge }) => break challenge,
                Some(_) => continue,
                None => panic!("stream ended"),
            }
        };
        assert_eq!(received.initiator, "ann");
    }
}
