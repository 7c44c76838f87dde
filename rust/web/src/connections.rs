//! Per-session liveness records.
//!
//! Each session has a hash at `session:{id}:connections` mapping participant id
//! to a [`ConnectionRecord`]. Liveness is always recomputed from the recorded
//! timestamps; transport close events are only hints. A detach marks the
//! record but keeps its last heartbeat, so a dropped stream never makes its
//! participant look silent for longer than they really were.

use crate::events::{Event, EventBus};
use crate::store::{keys, KeyValueStore, StoreError};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;
use tavern_engine::session::{ParticipantId, Session};

/// One hash field of `session:{id}:connections`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionRecord {
    pub last_seen: DateTime<Utc>,
    /// Set when the participant's stream closed or they left. Cleared by the
    /// next heartbeat.
    #[serde(default)]
    pub detached: bool,
}

#[derive(Debug, Clone)]
pub struct ConnectionTracker {
    kv: Arc<dyn KeyValueStore>,
    bus: EventBus,
    staleness: chrono::Duration,
    record_ttl: Duration,
}

impl ConnectionTracker {
    pub fn new(
        kv: Arc<dyn KeyValueStore>,
        bus: EventBus,
        staleness: Duration,
        record_ttl: Duration,
    ) -> Self {
        Self {
            kv,
            bus,
            staleness: chrono::Duration::milliseconds(staleness.as_millis() as i64),
            record_ttl,
        }
    }

    pub fn staleness(&self) -> chrono::Duration {
        self.staleness
    }

    fn is_fresh(&self, seen: DateTime<Utc>, now: DateTime<Utc>) -> bool {
        now.signed_duration_since(seen) <= self.staleness
    }

    /// Records a heartbeat now. Returns `true` when the participant went from
    /// absent to live.
    pub fn heartbeat(&self, session_id: &str, participant_id: &str) -> Result<bool, StoreError> {
        self.heartbeat_at(session_id, participant_id, Utc::now())
    }

    /// Records a heartbeat observed at `at`.
    pub fn heartbeat_at(
        &self,
        session_id: &str,
        participant_id: &str,
        at: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let now = Utc::now();
        let was_live = self
            .record(session_id, participant_id)?
            .is_some_and(|record| self.is_live_record(&record, now));

        self.write(
            session_id,
            participant_id,
            ConnectionRecord {
                last_seen: at,
                detached: false,
            },
        )?;

        let became_live = !was_live && self.is_fresh(at, now);
        if became_live {
            tracing::info!(
                session_id = %session_id,
                participant_id = %participant_id,
                "participant connected"
            );
            self.bus.publish(
                &keys::session_updates(session_id),
                Event::ParticipantConnected {
                    session_id: session_id.to_string(),
                    participant_id: participant_id.to_string(),
                },
            );
        }
        Ok(became_live)
    }

    /// Marks the participant detached, keeping their last heartbeat for the
    /// staleness rule. Returns whether an attached record existed.
    pub fn detach(&self, session_id: &str, participant_id: &str) -> Result<bool, StoreError> {
        let Some(record) = self.record(session_id, participant_id)? else {
            return Ok(false);
        };
        if record.detached {
            return Ok(false);
        }
        self.write(
            session_id,
            participant_id,
            ConnectionRecord {
                detached: true,
                ..record
            },
        )?;
        tracing::info!(
            session_id = %session_id,
            participant_id = %participant_id,
            "participant detached"
        );
        self.publish_disconnected(session_id, participant_id);
        Ok(true)
    }

    pub fn record(
        &self,
        session_id: &str,
        participant_id: &str,
    ) -> Result<Option<ConnectionRecord>, StoreError> {
        let records = self.kv.hash_get_all(&keys::connections(session_id))?;
        Ok(records.get(participant_id).and_then(|raw| parse(raw)))
    }

    /// Time of the last heartbeat, whether or not the participant is still
    /// attached.
    pub fn last_seen(
        &self,
        session_id: &str,
        participant_id: &str,
    ) -> Result<Option<DateTime<Utc>>, StoreError> {
        Ok(self
            .record(session_id, participant_id)?
            .map(|record| record.last_seen))
    }

    /// Attached and heard from within the staleness window.
    pub fn is_live(&self, session_id: &str, participant_id: &str) -> Result<bool, StoreError> {
        let now = Utc::now();
        Ok(self
            .record(session_id, participant_id)?
            .is_some_and(|record| self.is_live_record(&record, now)))
    }

    pub fn list_live(&self, session_id: &str) -> Result<BTreeSet<ParticipantId>, StoreError> {
        let now = Utc::now();
        let records = self.kv.hash_get_all(&keys::connections(session_id))?;
        Ok(records
            .into_iter()
            .filter(|(_, raw)| parse(raw).is_some_and(|record| self.is_live_record(&record, now)))
            .map(|(participant, _)| participant)
            .collect())
    }

    /// Participants of `session` other than `claimant` whose silence exceeds
    /// the staleness window. Silence runs from the last heartbeat even after
    /// a detach; someone who never sent one is measured from the session's
    /// creation.
    pub fn absent_participants(
        &self,
        session: &Session,
        claimant: &str,
    ) -> Result<Vec<ParticipantId>, StoreError> {
        let now = Utc::now();
        let records = self.kv.hash_get_all(&keys::connections(&session.id))?;
        Ok(session
            .participants
            .iter()
            .filter(|p| p.id != claimant)
            .filter(|p| {
                let seen = records
                    .get(&p.id)
                    .and_then(|raw| parse(raw))
                    .map_or(session.created_at, |record| record.last_seen);
                !self.is_fresh(seen, now)
            })
            .map(|p| p.id.clone())
            .collect())
    }

    /// Drops stale records across all sessions and announces each departure.
    pub fn sweep(&self) -> Result<usize, StoreError> {
        let now = Utc::now();
        let mut removed = 0;
        for key in self.kv.scan_prefix("session:")? {
            let Some(session_id) = keys::session_of_connections(&key) else {
                continue;
            };
            for (participant_id, raw) in self.kv.hash_get_all(&key)? {
                let record = parse(&raw);
                if record.is_some_and(|r| self.is_fresh(r.last_seen, now)) {
                    continue;
                }
                if !self.kv.hash_delete(&key, &participant_id)? {
                    continue;
                }
                removed += 1;
                // Detached records were announced when they detached.
                if record.is_some_and(|r| r.detached) {
                    continue;
                }
                tracing::info!(
                    session_id = %session_id,
                    participant_id = %participant_id,
                    "participant heartbeat went stale"
                );
                self.publish_disconnected(session_id, &participant_id);
            }
        }
        Ok(removed)
    }

    fn is_live_record(&self, record: &ConnectionRecord, now: DateTime<Utc>) -> bool {
        !record.detached && self.is_fresh(record.last_seen, now)
    }

    fn write(
        &self,
        session_id: &str,
        participant_id: &str,
        record: ConnectionRecord,
    ) -> Result<(), StoreError> {
        let key = keys::connections(session_id);
        let encoded = crate::store::encode(&key, &record)?;
        self.kv.hash_set(&key, participant_id, encoded, self.record_ttl)
    }

    fn publish_disconnected(&self, session_id: &str, participant_id: &str) {
        self.bus.publish(
            &keys::session_updates(session_id),
            Event::ParticipantDisconnected {
                session_id: session_id.to_string(),
                participant_id: participant_id.to_string(),
            },
        );
    }
}

fn parse(raw: &str) -> Option<ConnectionRecord> {
    match serde_json::from_str(raw) {
        Ok(record) => Some(record),
        Err(e) => {
            tracing::warn!(value = %raw, error = %e, "ignoring malformed heartbeat record");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;

    fn tracker() -> (ConnectionTracker, EventBus) {
        let bus = EventBus::new();
        let tracker = ConnectionTracker::new(
            Arc::new(MemoryStore::new()),
            bus.clone(),
            Duration::from_secs(15),
            Duration::from_secs(3600),
        );
        (tracker, bus)
    }

    #[test]
    fn liveness_follows_the_staleness_window() {
        let (tracker, _bus) = tracker();
        let now = Utc::now();
        tracker
            .heartbeat_at("s", "fresh", now - chrono::Duration::seconds(10))
            .unwrap();
        tracker
            .heartbeat_at("s", "stale", now - chrono::Duration::seconds(16))
            .unwrap();

        assert!(tracker.is_live("s", "fresh").unwrap());
        assert!(!tracker.is_live("s", "stale").unwrap());
        assert!(!tracker.is_live("s", "never").unwrap());
        assert_eq!(
            tracker.list_live("s").unwrap(),
            BTreeSet::from(["fresh".to_string()])
        );
    }

    #[test]
    fn connect_and_detach_are_announced_once() {
        let (tracker, bus) = tracker();
        let mut sub = bus.subscribe(keys::session_updates("s"));

        assert!(tracker.heartbeat("s", "ann").unwrap());
        assert!(!tracker.heartbeat("s", "ann").unwrap());
        assert!(matches!(
            sub.try_next(),
            Some(Event::ParticipantConnected { participant_id, .. }) if participant_id == "ann"
        ));
        assert_eq!(sub.try_next(), None);

        assert!(tracker.detach("s", "ann").unwrap());
        assert!(!tracker.detach("s", "ann").unwrap());
        assert!(matches!(
            sub.try_next(),
            Some(Event::ParticipantDisconnected { .. })
        ));
        assert_eq!(sub.try_next(), None);

        assert!(tracker.heartbeat("s", "ann").unwrap(), "reattach counts as a new connection");
    }

    #[test]
    fn detach_keeps_the_last_heartbeat() {
        let (tracker, _bus) = tracker();
        let seen = Utc::now() - chrono::Duration::seconds(3);
        tracker.heartbeat_at("s", "ben", seen).unwrap();
        tracker.detach("s", "ben").unwrap();

        assert!(!tracker.is_live("s", "ben").unwrap());
        assert_eq!(
            tracker.record("s", "ben").unwrap(),
            Some(ConnectionRecord {
                last_seen: seen,
                detached: true
            })
        );
    }

    #[test]
    fn sweep_removes_only_stale_records() {
        let (tracker, bus) = tracker();
        let now = Utc::now();
        tracker.heartbeat_at("s", "ann", now).unwrap();
        tracker
            .heartbeat_at("s", "ben", now - chrono::Duration::seconds(30))
            .unwrap();
        let mut sub = bus.subscribe(keys::session_updates("s"));

        assert_eq!(tracker.sweep().unwrap(), 1);
        assert!(tracker.last_seen("s", "ben").unwrap().is_none());
        assert!(tracker.is_live("s", "ann").unwrap());
        assert!(matches!(
            sub.try_next(),
            Some(Event::ParticipantDisconnected { participant_id, .. }) if participant_id == "ben"
        ));
    }

    #[test]
    fn sweep_drops_stale_detached_records_silently() {
        let (tracker, bus) = tracker();
        tracker
            .heartbeat_at("s", "cat", Utc::now() - chrono::Duration::seconds(40))
            .unwrap();
        tracker.detach("s", "cat").unwrap();
        let mut sub = bus.subscribe(keys::session_updates("s"));

        assert_eq!(tracker.sweep().unwrap(), 1);
        assert!(tracker.record("s", "cat").unwrap().is_none());
        assert_eq!(sub.try_next(), None);
    }
}
