use crate::challenge::Challenge;
use crate::presence::Presence;
use crate::session::SessionView;
use crate::store::StoreError;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use std::task::{Context, Poll};
use tavern_engine::game::GameKind;
use tavern_engine::session::{EndReason, Outcome, ParticipantId, SessionId};
use tokio::sync::mpsc;
use tokio_stream::Stream;

// Bounded per subscriber; a subscriber that falls this far behind is dropped.
const EVENT_CHANNEL_BUFFER: usize = 1000;

pub type EventSender = mpsc::Sender<Event>;
pub type EventReceiver = mpsc::Receiver<Event>;

/// Receiving end of one channel subscription. Unsubscribes on drop.
pub struct EventSubscription {
    bus: EventBus,
    channel: String,
    subscriber_id: usize,
    receiver: EventReceiver,
}

impl EventSubscription {
    pub fn channel(&self) -> &str {
        &self.channel
    }

    pub fn try_next(&mut self) -> Option<Event> {
        self.receiver.try_recv().ok()
    }

    pub async fn recv(&mut self) -> Option<Event> {
        self.receiver.recv().await
    }
}

impl Stream for EventSubscription {
    type Item = Event;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Event>> {
        self.get_mut().receiver.poll_recv(cx)
    }
}

impl Drop for EventSubscription {
    fn drop(&mut self) {
        self.bus.unsubscribe(&self.channel, self.subscriber_id);
    }
}

impl std::fmt::Debug for EventSubscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventSubscription")
            .field("channel", &self.channel)
            .field("subscriber_id", &self.subscriber_id)
            .finish()
    }
}

/// Carries published events between server processes.
///
/// A transport only sends; whatever receives on the other side hands each
/// message to [`EventBus::deliver`] of its own process, this one included.
pub trait EventTransport: Send + Sync + std::fmt::Debug {
    /// Returns how many processes are listening on `channel`.
    fn publish(&self, channel: &str, payload: String) -> Result<usize, StoreError>;
}

/// Publish/subscribe fanout keyed by channel name.
///
/// Delivery is at most once per subscriber per publish and FIFO within a
/// channel. There is no replay: late subscribers only see later events.
/// Without a transport the bus only reaches subscribers in this process.
#[derive(Debug, Clone, Default)]
pub struct EventBus {
    inner: Arc<EventBusInner>,
}

#[derive(Debug, Default)]
struct EventBusInner {
    subscribers: RwLock<HashMap<String, Vec<(usize, EventSender)>>>,
    next_id: AtomicUsize,
    transport: Option<Arc<dyn EventTransport>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// A bus whose publishes travel through `transport` and come back in via
    /// [`Self::deliver`].
    pub fn with_transport(transport: Arc<dyn EventTransport>) -> Self {
        Self {
            inner: Arc::new(EventBusInner {
                transport: Some(transport),
                ..EventBusInner::default()
            }),
        }
    }

    pub fn is_shared(&self) -> bool {
        self.inner.transport.is_some()
    }

    pub fn subscribe(&self, channel: impl Into<String>) -> EventSubscription {
        let channel = channel.into();
        let (subscriber_id, receiver) = self.subscribe_raw(&channel);
        EventSubscription {
            bus: self.clone(),
            channel,
            subscriber_id,
            receiver,
        }
    }

    fn subscribe_raw(&self, channel: &str) -> (usize, EventReceiver) {
        let (tx, rx) = mpsc::channel(EVENT_CHANNEL_BUFFER);
        let id = self.inner.next_id.fetch_add(1, Ordering::AcqRel);
        self.inner
            .subscribers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(channel.to_string())
            .or_default()
            .push((id, tx));

        tracing::debug!(channel = %channel, subscriber_id = id, "subscribed");
        (id, rx)
    }

    /// Publishes `event` on `channel`. Locally this returns how many
    /// subscribers received it; through a transport, how many processes did.
    /// A transport failure falls back to local delivery.
    pub fn publish(&self, channel: &str, event: Event) -> usize {
        tracing::debug!(channel = %channel, event_type = event.kind(), "publishing event");

        let Some(transport) = &self.inner.transport else {
            return self.deliver(channel, event);
        };
        let sent = serde_json::to_string(&event)
            .map_err(|e| StoreError::Unavailable(format!("cannot encode event: {e}")))
            .and_then(|payload| transport.publish(channel, payload));
        match sent {
            Ok(listeners) => listeners,
            Err(e) => {
                tracing::warn!(
                    channel = %channel,
                    error = %e,
                    "shared publish failed, delivering locally"
                );
                self.deliver(channel, event)
            }
        }
    }

    /// Hands `event` to every subscriber of `channel` in this process and
    /// returns how many received it.
    pub fn deliver(&self, channel: &str, event: Event) -> usize {
        let subscribers = self
            .inner
            .subscribers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(channel)
            .cloned();

        let Some(list) = subscribers else {
            tracing::trace!(channel = %channel, "no subscribers");
            return 0;
        };

        let mut delivered = 0;
        let mut failed = Vec::new();
        for (id, sender) in list {
            match sender.try_send(event.clone()) {
                Ok(()) => delivered += 1,
                Err(e) => {
                    tracing::warn!(
                        channel = %channel,
                        subscriber_id = id,
                        error = %e,
                        "dropping subscriber that cannot keep up"
                    );
                    failed.push(id);
                }
            }
        }
        if !failed.is_empty() {
            self.remove_subscribers(channel, &failed);
        }
        delivered
    }

    pub fn unsubscribe(&self, channel: &str, subscriber_id: usize) {
        self.remove_subscribers(channel, &[subscriber_id]);
    }

    pub fn subscriber_count(&self) -> usize {
        self.inner
            .subscribers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .map(Vec::len)
            .sum()
    }

    pub fn channel_subscribers(&self, channel: &str) -> usize {
        self.inner
            .subscribers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(channel)
            .map_or(0, Vec::len)
    }

    fn remove_subscribers(&self, channel: &str, ids: &[usize]) {
        let mut guard = self
            .inner
            .subscribers
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        if let Some(list) = guard.get_mut(channel) {
            list.retain(|(id, _)| !ids.contains(id));
            if list.is_empty() {
                guard.remove(channel);
            }
        }
    }
}

/// Everything pushed to session and lobby streams.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Event {
    /// First event on every session stream.
    Connected {
        session: SessionView,
        participant_id: Option<ParticipantId>,
    },
    StateUpdate {
        session: SessionView,
    },
    ParticipantConnected {
        session_id: SessionId,
        participant_id: ParticipantId,
    },
    ParticipantDisconnected {
        session_id: SessionId,
        participant_id: ParticipantId,
    },
    SessionEnded {
        session_id: SessionId,
        result: Option<Outcome>,
        reason: Option<EndReason>,
    },
    Error {
        message: String,
    },
    /// First event on every lobby stream.
    LobbyConnected {
        user_id: String,
        online: Vec<Presence>,
        challenges: Vec<Challenge>,
    },
    PresenceUpdated {
        presence: Presence,
    },
    PresenceRemoved {
        user_id: String,
    },
    ChallengeReceived {
        challenge: Challenge,
    },
    ChallengeUpdated {
        challenge: Challenge,
    },
    SessionStarted {
        session_id: SessionId,
        game: GameKind,
        challenge_id: String,
    },
}

impl Event {
    /// Wire name, also used as the SSE `event:` field.
    pub fn kind(&self) -> &'static str {
        match self {
            Event::Connected { .. } => "connected",
            Event::StateUpdate { .. } => "state_update",
            Event::ParticipantConnected { .. } => "participant_connected",
            Event::ParticipantDisconnected { .. } => "participant_disconnected",
            Event::SessionEnded { .. } => "session_ended",
            Event::Error { .. } => "error",
            Event::LobbyConnected { .. } => "lobby_connected",
            Event::PresenceUpdated { .. } => "presence_updated",
            Event::PresenceRemoved { .. } => "presence_removed",
            Event::ChallengeReceived { .. } => "challenge_received",
            Event::ChallengeUpdated { .. } => "challenge_updated",
            Event::SessionStarted { .. } => "session_started",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_stream::StreamExt;

    fn error(message: &str) -> Event {
        Event::Error {
            message: message.into(),
        }
    }

    #[test]
    fn subscription_drop_unsubscribes() {
        let bus = EventBus::new();
        {
            let _sub = bus.subscribe("session:s:updates");
            assert_eq!(bus.subscriber_count(), 1);
        }
        assert_eq!(bus.subscriber_count(), 0);
    }

    #[test]
    fn publish_reaches_every_subscriber_of_the_channel_only() {
        let bus = EventBus::new();
        let mut sub1 = bus.subscribe("a");
        let mut sub2 = bus.subscribe("a");
        let mut other = bus.subscribe("b");

        assert_eq!(bus.publish("a", error("ping")), 2);

        assert_eq!(sub1.try_next(), Some(error("ping")));
        assert_eq!(sub2.try_next(), Some(error("ping")));
        assert_eq!(other.try_next(), None);
    }

    #[test]
    fn late_subscriber_misses_earlier_events() {
        let bus = EventBus::new();
        assert_eq!(bus.publish("a", error("early")), 0);
        let mut sub = bus.subscribe("a");
        assert_eq!(sub.try_next(), None);
    }

    #[test]
    fn closed_receiver_is_pruned() {
        let bus = EventBus::new();
        let (id, rx) = bus.subscribe_raw("a");
        drop(rx);
        bus.publish("a", error("gone"));
        assert_eq!(bus.subscriber_count(), 0);
        bus.unsubscribe("a", id);
    }

    #[tokio::test]
    async fn subscription_streams_in_publish_order() {
        let bus = EventBus::new();
        let mut sub = bus.subscribe("a");
        for n in 0..3 {
            bus.publish("a", error(&n.to_string()));
        }
        let received: Vec<Event> = (&mut sub).take(3).collect().await;
        assert_eq!(received, vec![error("0"), error("1"), error("2")]);
    }

    /// Relays every publish to all joined buses, as a shared broker would.
    #[derive(Debug, Default)]
    struct Loopback {
        buses: RwLock<Vec<EventBus>>,
    }

    impl EventTransport for Loopback {
        fn publish(&self, channel: &str, payload: String) -> Result<usize, StoreError> {
            let event: Event = serde_json::from_str(&payload).expect("decode");
            let buses = self.buses.read().expect("lock");
            for bus in buses.iter() {
                bus.deliver(channel, event.clone());
            }
            Ok(buses.len())
        }
    }

    #[test]
    fn transport_carries_events_between_buses() {
        let transport = Arc::new(Loopback::default());
        let here = EventBus::with_transport(transport.clone());
        let there = EventBus::with_transport(transport.clone());
        transport.buses.write().unwrap().extend([here.clone(), there.clone()]);
        let mut local = here.subscribe("a");
        let mut remote = there.subscribe("a");

        assert!(here.is_shared());
        assert_eq!(here.publish("a", error("hello")), 2);
        assert_eq!(local.try_next(), Some(error("hello")));
        assert_eq!(remote.try_next(), Some(error("hello")));
    }

    #[derive(Debug)]
    struct Down;

    impl EventTransport for Down {
        fn publish(&self, _channel: &str, _payload: String) -> Result<usize, StoreError> {
            Err(StoreError::Unavailable("broker down".into()))
        }
    }

    #[test]
    fn failed_transport_still_reaches_local_subscribers() {
        let bus = EventBus::with_transport(Arc::new(Down));
        let mut sub = bus.subscribe("a");
        assert_eq!(bus.publish("a", error("local")), 1);
        assert_eq!(sub.try_next(), Some(error("local")));
    }

    #[test]
    fn events_serialize_with_type_tag() {
        let json = serde_json::to_value(Event::PresenceRemoved {
            user_id: "u1".into(),
        })
        .expect("serialize");
        assert_eq!(json["type"], "presence_removed");
        assert_eq!(json["user_id"], "u1");
        assert_eq!(
            Event::PresenceRemoved { user_id: "u1".into() }.kind(),
            "presence_removed"
        );
    }
}
