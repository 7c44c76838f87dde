//! Lobby presence at `presence:{userId}`, mirrored on the `lobby:presence`
//! channel. Same staleness policy as session connections, at lobby scope.

use crate::events::{Event, EventBus};
use crate::store::{self, keys, KeyValueStore, StoreError};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PresenceStatus {
    Online,
    InSession,
    Away,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Presence {
    pub user_id: String,
    pub display_name: String,
    pub status: PresenceStatus,
    pub current_app: Option<String>,
    pub last_seen: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct PresenceRegistry {
    kv: Arc<dyn KeyValueStore>,
    bus: EventBus,
    staleness: chrono::Duration,
    record_ttl: Duration,
}

impl PresenceRegistry {
    pub fn new(kv: Arc<dyn KeyValueStore>, bus: EventBus, staleness: Duration) -> Self {
        Self {
            kv,
            bus,
            staleness: chrono::Duration::milliseconds(staleness.as_millis() as i64),
            record_ttl: staleness * 2,
        }
    }

    fn is_fresh(&self, presence: &Presence, now: DateTime<Utc>) -> bool {
        now.signed_duration_since(presence.last_seen) <= self.staleness
    }

    /// Upserts the user's presence. `status` and `current_app` keep their
    /// previous values when omitted. Subscribers hear about it only when
    /// something visible changed.
    pub fn heartbeat(
        &self,
        user_id: &str,
        display_name: Option<&str>,
        status: Option<PresenceStatus>,
        current_app: Option<String>,
    ) -> Result<Presence, PresenceError> {
        let user_id = user_id.trim();
        if user_id.is_empty() {
            return Err(PresenceError::InvalidUser("user id is empty".to_string()));
        }

        let display_name = display_name
            .map(str::trim)
            .filter(|name| !name.is_empty());
        let next = |previous: Option<&Presence>| Presence {
            user_id: user_id.to_string(),
            display_name: display_name
                .map(str::to_string)
                .or_else(|| previous.map(|p| p.display_name.clone()))
                .unwrap_or_else(|| user_id.to_string()),
            status: status
                .or_else(|| previous.map(|p| p.status))
                .unwrap_or(PresenceStatus::Online),
            current_app: current_app
                .clone()
                .or_else(|| previous.and_then(|p| p.current_app.clone())),
            last_seen: Utc::now(),
        };

        let (previous, presence) = self.upsert(user_id, next)?;

        let now = Utc::now();
        let changed = match &previous {
            None => true,
            Some(p) => {
                !self.is_fresh(p, now)
                    || p.status != presence.status
                    || p.display_name != presence.display_name
                    || p.current_app != presence.current_app
            }
        };
        if changed {
            tracing::debug!(user_id = %user_id, status = ?presence.status, "presence updated");
            self.bus.publish(
                keys::LOBBY_PRESENCE,
                Event::PresenceUpdated {
                    presence: presence.clone(),
                },
            );
        }
        Ok(presence)
    }

    /// Writes `next(current)` through compare-and-set, or creates the record
    /// when there is none, so a concurrent [`Self::set_status`] is never
    /// overwritten with a stale status.
    fn upsert<F>(
        &self,
        user_id: &str,
        next: F,
    ) -> Result<(Option<Presence>, Presence), PresenceError>
    where
        F: Fn(Option<&Presence>) -> Presence,
    {
        let key = keys::presence(user_id);
        for _ in 0..store::MAX_COMMIT_ATTEMPTS {
            let updated = store::update_record::<Presence, (), PresenceError, _>(
                self.kv.as_ref(),
                &key,
                |current| Ok((next(Some(current)), self.record_ttl, ())),
            )?;
            if let Some(updated) = updated {
                return Ok((Some(updated.previous), updated.current));
            }

            let created = next(None);
            if self
                .kv
                .set_if_absent(&key, store::encode(&key, &created)?, self.record_ttl)?
            {
                return Ok((None, created));
            }
        }
        Err(StoreError::Conflict(key).into())
    }

    /// Changes the status of a present user without counting as a heartbeat.
    pub fn set_status(
        &self,
        user_id: &str,
        status: PresenceStatus,
    ) -> Result<Option<Presence>, PresenceError> {
        let updated = store::update_record::<Presence, (), PresenceError, _>(
            self.kv.as_ref(),
            &keys::presence(user_id),
            |current| {
                let mut next = current.clone();
                next.status = status;
                Ok((next, self.record_ttl, ()))
            },
        )?;
        let Some(updated) = updated else {
            return Ok(None);
        };
        if updated.previous.status != status {
            self.bus.publish(
                keys::LOBBY_PRESENCE,
                Event::PresenceUpdated {
                    presence: updated.current.clone(),
                },
            );
        }
        Ok(Some(updated.current))
    }

    /// Explicit "going away". Returns whether the user was present.
    pub fn depart(&self, user_id: &str) -> Result<bool, PresenceError> {
        let removed = self.kv.delete(&keys::presence(user_id))?;
        if removed {
            tracing::info!(user_id = %user_id, "user left the lobby");
            self.publish_removed(user_id);
        }
        Ok(removed)
    }

    pub fn get(&self, user_id: &str) -> Result<Option<Presence>, PresenceError> {
        Ok(store::get_json(self.kv.as_ref(), &keys::presence(user_id))?)
    }

    /// Users whose last heartbeat is inside the staleness window, by name.
    pub fn list_online(&self) -> Result<Vec<Presence>, PresenceError> {
        let now = Utc::now();
        let mut online = Vec::new();
        for key in self.kv.scan_prefix(keys::PRESENCE_PREFIX)? {
            if let Some(presence) = store::get_json::<Presence>(self.kv.as_ref(), &key)? {
                if self.is_fresh(&presence, now) {
                    online.push(presence);
                }
            }
        }
        online.sort_by(|a, b| {
            a.display_name
                .cmp(&b.display_name)
                .then_with(|| a.user_id.cmp(&b.user_id))
        });
        Ok(online)
    }

    pub fn sweep(&self) -> Result<usize, PresenceError> {
        let now = Utc::now();
        let mut removed = 0;
        for key in self.kv.scan_prefix(keys::PRESENCE_PREFIX)? {
            let Some(presence) = store::get_json::<Presence>(self.kv.as_ref(), &key)? else {
                continue;
            };
            if self.is_fresh(&presence, now) {
                continue;
            }
            if self.kv.delete(&key)? {
                tracing::info!(user_id = %presence.user_id, "lobby presence went stale");
                self.publish_removed(&presence.user_id);
                removed += 1;
            }
        }
        Ok(removed)
    }

    fn publish_removed(&self, user_id: &str) {
        self.bus.publish(
            keys::LOBBY_PRESENCE,
            Event::PresenceRemoved {
                user_id: user_id.to_string(),
            },
        );
    }

    #[cfg(test)]
    fn backdate(&self, user_id: &str, seconds: i64) {
        let mut presence = self.get(user_id).unwrap().unwrap();
        presence.last_seen = presence.last_seen - chrono::Duration::seconds(seconds);
        store::put_json(self.kv.as_ref(), &keys::presence(user_id), &presence, self.record_ttl)
            .unwrap();
    }
}

#[derive(Debug, Error)]
pub enum PresenceError {
    #[error("Invalid user: {0}")]
    InvalidUser(String),
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl crate::errors::IntoErrorResponse for PresenceError {
    fn status_code(&self) -> warp::http::StatusCode {
        use warp::http::StatusCode;
        match self {
            PresenceError::InvalidUser(_) => StatusCode::BAD_REQUEST,
            PresenceError::Store(_) => StatusCode::SERVICE_UNAVAILABLE,
        }
    }

    fn error_code(&self) -> &'static str {
        match self {
            PresenceError::InvalidUser(_) => "invalid_user",
            PresenceError::Store(_) => "store_unavailable",
        }
    }

    fn error_message(&self) -> String {
        self.to_string()
    }
}
