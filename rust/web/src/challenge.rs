//! Invitation handshakes that end in a new session.
//!
//! A challenge names an initiator and one or more targets. It stays `pending`
//! until every target accepts (a session is created) or any target rejects.
//! Unanswered challenges expire.

use crate::errors::IntoErrorResponse;
use crate::events::{Event, EventBus};
use crate::presence::{PresenceError, PresenceRegistry, PresenceStatus};
use crate::session::{SessionError, SessionManager};
use crate::store::{self, keys, KeyValueStore, StoreError};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tavern_engine::game::{GameKind, GameOptions};
use tavern_engine::session::SessionId;
use tavern_engine::MoveError;
use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChallengeStatus {
    Pending,
    Accepted,
    Rejected,
    Expired,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TargetResponse {
    Pending,
    Accepted,
    Rejected,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Challenge {
    pub id: String,
    pub initiator: String,
    pub targets: Vec<String>,
    pub game: GameKind,
    pub options: GameOptions,
    pub status: ChallengeStatus,
    pub responses: BTreeMap<String, TargetResponse>,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    /// Set once every target accepted.
    pub session_id: Option<SessionId>,
}

impl Challenge {
    /// Initiator first, then targets in invitation order; this is turn order.
    pub fn participants(&self) -> impl Iterator<Item = &String> {
        std::iter::once(&self.initiator).chain(self.targets.iter())
    }

    pub fn involves(&self, user_id: &str) -> bool {
        self.participants().any(|p| p == user_id)
    }

    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }

    fn all_accepted(&self) -> bool {
        self.responses
            .values()
            .all(|r| *r == TargetResponse::Accepted)
    }
}

#[derive(Debug, Clone)]
pub struct ChallengeBroker {
    kv: Arc<dyn KeyValueStore>,
    bus: EventBus,
    presence: PresenceRegistry,
    sessions: SessionManager,
    ttl: Duration,
}

impl ChallengeBroker {
    pub fn new(
        kv: Arc<dyn KeyValueStore>,
        bus: EventBus,
        presence: PresenceRegistry,
        sessions: SessionManager,
        ttl: Duration,
    ) -> Self {
        Self {
            kv,
            bus,
            presence,
            sessions,
            ttl,
        }
    }

    /// Pending records outlive their expiry so the sweep can still announce it.
    fn pending_record_ttl(&self) -> Duration {
        self.ttl * 2
    }

    pub fn create(
        &self,
        initiator: &str,
        targets: Vec<String>,
        game: GameKind,
        options: GameOptions,
    ) -> Result<Challenge, ChallengeError> {
        let initiator = initiator.trim();
        if initiator.is_empty() {
            return Err(ChallengeError::InvalidRequest("initiator is required".into()));
        }
        let targets: Vec<String> = targets.into_iter().map(|t| t.trim().to_string()).collect();
        if targets.is_empty() {
            return Err(ChallengeError::InvalidRequest("at least one target is required".into()));
        }
        let mut seen = HashSet::from([initiator]);
        for target in &targets {
            if target.is_empty() {
                return Err(ChallengeError::InvalidRequest("target id is empty".into()));
            }
            if !seen.insert(target.as_str()) {
                return Err(ChallengeError::InvalidRequest(format!(
                    "`{target}` is listed more than once"
                )));
            }
        }

        let players = targets.len() + 1;
        let range = game.rules().player_range();
        if !range.contains(&players) {
            return Err(MoveError::InvalidSetup(format!(
                "{game} needs {} to {} participants, got {players}",
                range.start(),
                range.end()
            ))
            .into());
        }
        options.validate(game)?;

        let now = Utc::now();
        let challenge = Challenge {
            id: Uuid::new_v4().to_string(),
            initiator: initiator.to_string(),
            responses: targets
                .iter()
                .map(|t| (t.clone(), TargetResponse::Pending))
                .collect(),
            targets,
            game,
            options,
            status: ChallengeStatus::Pending,
            created_at: now,
            expires_at: now + chrono::Duration::seconds(self.ttl.as_secs() as i64),
            session_id: None,
        };

        let key = keys::challenge(&challenge.id);
        if !self
            .kv
            .set_if_absent(&key, store::encode(&key, &challenge)?, self.pending_record_ttl())?
        {
            return Err(StoreError::Conflict(key).into());
        }

        tracing::info!(
            challenge_id = %challenge.id,
            initiator = %challenge.initiator,
            targets = challenge.targets.len(),
            game = %challenge.game,
            "challenge created"
        );
        for target in &challenge.targets {
            self.bus.publish(
                &keys::lobby(target),
                Event::ChallengeReceived {
                    challenge: challenge.clone(),
                },
            );
        }
        self.bus.publish(
            &keys::lobby(&challenge.initiator),
            Event::ChallengeUpdated {
                challenge: challenge.clone(),
            },
        );
        Ok(challenge)
    }

    pub fn get(&self, challenge_id: &str) -> Result<Challenge, ChallengeError> {
        store::get_json(self.kv.as_ref(), &keys::challenge(challenge_id))?
            .ok_or_else(|| ChallengeError::NotFound(challenge_id.to_string()))
    }

    /// Records one target's answer. The acceptance that completes the set
    /// commits the challenge as `accepted` first and only then creates the
    /// session, under an id fixed in that same commit. If the session cannot
    /// be created the challenge is reopened with that answer still pending.
    pub fn respond(
        &self,
        challenge_id: &str,
        user_id: &str,
        accept: bool,
    ) -> Result<Challenge, ChallengeError> {
        let updated = store::update_record::<Challenge, (), ChallengeError, _>(
            self.kv.as_ref(),
            &keys::challenge(challenge_id),
            |current| {
                let response = current.responses.get(user_id).copied().ok_or_else(|| {
                    ChallengeError::NotATarget {
                        challenge_id: challenge_id.to_string(),
                        user_id: user_id.to_string(),
                    }
                })?;
                if current.status != ChallengeStatus::Pending {
                    return Err(ChallengeError::NotPending {
                        challenge_id: challenge_id.to_string(),
                        status: current.status,
                    });
                }
                if current.is_expired_at(Utc::now()) {
                    return Err(ChallengeError::Expired(challenge_id.to_string()));
                }
                if response != TargetResponse::Pending {
                    return Err(ChallengeError::AlreadyResponded {
                        challenge_id: challenge_id.to_string(),
                        user_id: user_id.to_string(),
                    });
                }

                let mut next = current.clone();
                if accept {
                    next.responses
                        .insert(user_id.to_string(), TargetResponse::Accepted);
                    if next.all_accepted() {
                        next.status = ChallengeStatus::Accepted;
                        next.session_id = Some(Uuid::new_v4().to_string());
                    }
                } else {
                    next.responses
                        .insert(user_id.to_string(), TargetResponse::Rejected);
                    next.status = ChallengeStatus::Rejected;
                }
                let ttl = if next.status == ChallengeStatus::Pending {
                    self.pending_record_ttl()
                } else {
                    self.ttl
                };
                Ok((next, ttl, ()))
            },
        )?
        .ok_or_else(|| ChallengeError::NotFound(challenge_id.to_string()))?;

        let challenge = updated.current;
        tracing::info!(
            challenge_id = %challenge_id,
            user_id = %user_id,
            accept,
            status = ?challenge.status,
            "challenge response recorded"
        );
        if challenge.status != ChallengeStatus::Accepted {
            self.announce(&challenge);
            return Ok(challenge);
        }

        if let Err(e) = self.start_session(&challenge) {
            tracing::warn!(challenge_id = %challenge_id, error = %e, "could not start session");
            self.reopen(&challenge, user_id);
            return Err(e);
        }
        Ok(challenge)
    }

    /// Undoes a final acceptance whose session never came to exist.
    fn reopen(&self, accepted: &Challenge, user_id: &str) {
        let result = store::update_record::<Challenge, (), ChallengeError, _>(
            self.kv.as_ref(),
            &keys::challenge(&accepted.id),
            |current| {
                if current.status != ChallengeStatus::Accepted
                    || current.session_id != accepted.session_id
                {
                    return Err(ChallengeError::NotPending {
                        challenge_id: current.id.clone(),
                        status: current.status,
                    });
                }
                let mut next = current.clone();
                next.status = ChallengeStatus::Pending;
                next.session_id = None;
                next.responses
                    .insert(user_id.to_string(), TargetResponse::Pending);
                Ok((next, self.pending_record_ttl(), ()))
            },
        );
        match result {
            Ok(Some(updated)) => {
                tracing::info!(challenge_id = %accepted.id, "challenge reopened");
                self.announce(&updated.current);
            }
            Ok(None) => {}
            Err(e) => {
                tracing::error!(
                    challenge_id = %accepted.id,
                    error = %e,
                    "failed to reopen challenge"
                )
            }
        }
    }

    fn start_session(&self, challenge: &Challenge) -> Result<(), ChallengeError> {
        let Some(session_id) = challenge.session_id.clone() else {
            return Ok(());
        };
        let participants = challenge
            .participants()
            .map(|user| {
                let name = self
                    .presence
                    .get(user)
                    .ok()
                    .flatten()
                    .map(|p| p.display_name)
                    .unwrap_or_else(|| user.clone());
                (user.clone(), name)
            })
            .collect();

        match self.sessions.create_session(
            Some(session_id.clone()),
            challenge.game,
            challenge.options.clone(),
            participants,
        ) {
            Ok(_) | Err(SessionError::AlreadyExists(_)) => {}
            Err(e) => return Err(e.into()),
        }

        self.announce(challenge);
        for user in challenge.participants() {
            if let Err(e) = self.presence.set_status(user, PresenceStatus::InSession) {
                tracing::warn!(user_id = %user, error = %e, "failed to mark user in session");
            }
            self.bus.publish(
                &keys::lobby(user),
                Event::SessionStarted {
                    session_id: session_id.clone(),
                    game: challenge.game,
                    challenge_id: challenge.id.clone(),
                },
            );
        }
        Ok(())
    }

    fn announce(&self, challenge: &Challenge) {
        for user in challenge.participants() {
            self.bus.publish(
                &keys::lobby(user),
                Event::ChallengeUpdated {
                    challenge: challenge.clone(),
                },
            );
        }
    }

    /// Live pending challenges the user sent or received, oldest first.
    pub fn pending_for(&self, user_id: &str) -> Result<Vec<Challenge>, ChallengeError> {
        let now = Utc::now();
        let mut pending: Vec<Challenge> = self
            .all()?
            .into_iter()
            .filter(|c| {
                c.status == ChallengeStatus::Pending && !c.is_expired_at(now) && c.involves(user_id)
            })
            .collect();
        pending.sort_by_key(|c| c.created_at);
        Ok(pending)
    }

    /// Marks overdue pending challenges `expired` and tells everyone involved.
    pub fn expire_stale(&self) -> Result<usize, ChallengeError> {
        let now = Utc::now();
        let mut expired = 0;
        for challenge in self.all()? {
            if challenge.status != ChallengeStatus::Pending || !challenge.is_expired_at(now) {
                continue;
            }
            let result = store::update_record::<Challenge, (), ChallengeError, _>(
                self.kv.as_ref(),
                &keys::challenge(&challenge.id),
                |current| {
                    if current.status != ChallengeStatus::Pending {
                        return Err(ChallengeError::NotPending {
                            challenge_id: current.id.clone(),
                            status: current.status,
                        });
                    }
                    let mut next = current.clone();
                    next.status = ChallengeStatus::Expired;
                    Ok((next, self.ttl, ()))
                },
            );
            match result {
                Ok(Some(updated)) => {
                    tracing::info!(challenge_id = %challenge.id, "challenge expired");
                    self.announce(&updated.current);
                    expired += 1;
                }
                Ok(None) | Err(ChallengeError::NotPending { .. }) => {}
                Err(e) => return Err(e),
            }
        }
        Ok(expired)
    }

    fn all(&self) -> Result<Vec<Challenge>, ChallengeError> {
        let mut challenges = Vec::new();
        for key in self.kv.scan_prefix(keys::CHALLENGE_PREFIX)? {
            if let Some(challenge) = store::get_json::<Challenge>(self.kv.as_ref(), &key)? {
                challenges.push(challenge);
            }
        }
        Ok(challenges)
    }
}

#[derive(Debug, Error)]
pub enum ChallengeError {
    #[error("Challenge not found: {0}")]
    NotFound(String),
    #[error("Invalid challenge: {0}")]
    InvalidRequest(String),
    #[error("`{user_id}` is not a target of challenge {challenge_id}")]
    NotATarget { challenge_id: String, user_id: String },
    #[error("Challenge {challenge_id} is already {status:?}")]
    NotPending {
        challenge_id: String,
        status: ChallengeStatus,
    },
    #[error("`{user_id}` already answered challenge {challenge_id}")]
    AlreadyResponded { challenge_id: String, user_id: String },
    #[error("Challenge expired: {0}")]
    Expired(String),
    #[error(transparent)]
    Setup(#[from] MoveError),
    #[error(transparent)]
    Session(#[from] SessionError),
    #[error(transparent)]
    Presence(#[from] PresenceError),
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl IntoErrorResponse for ChallengeError {
    fn status_code(&self) -> warp::http::StatusCode {
        use warp::http::StatusCode;
        match self {
            ChallengeError::NotFound(_) => StatusCode::NOT_FOUND,
            ChallengeError::InvalidRequest(_) | ChallengeError::Setup(_) => StatusCode::BAD_REQUEST,
            ChallengeError::NotATarget { .. } => StatusCode::FORBIDDEN,
            ChallengeError::NotPending { .. } | ChallengeError::AlreadyResponded { .. } => {
                StatusCode::CONFLICT
            }
            ChallengeError::Expired(_) => StatusCode::GONE,
            ChallengeError::Session(e) => e.status_code(),
            ChallengeError::Presence(e) => e.status_code(),
            ChallengeError::Store(StoreError::Conflict(_)) => StatusCode::CONFLICT,
            ChallengeError::Store(_) => StatusCode::SERVICE_UNAVAILABLE,
        }
    }

    fn error_code(&self) -> &'static str {
        match self {
            ChallengeError::NotFound(_) => "challenge_not_found",
            ChallengeError::InvalidRequest(_) => "invalid_challenge",
            ChallengeError::Setup(_) => "invalid_setup",
            ChallengeError::NotATarget { .. } => "not_a_target",
            ChallengeError::NotPending { .. } => "challenge_resolved",
            ChallengeError::AlreadyResponded { .. } => "already_responded",
            ChallengeError::Expired(_) => "challenge_expired",
            ChallengeError::Session(e) => e.error_code(),
            ChallengeError::Presence(e) => e.error_code(),
            ChallengeError::Store(StoreError::Conflict(_)) => "challenge_conflict",
            ChallengeError::Store(_) => "store_unavailable",
        }
    }

    fn error_message(&self) -> String {
        self.to_string()
    }

    fn error_details(&self) -> Option<serde_json::Value> {
        match self {
            ChallengeError::NotFound(id) | ChallengeError::Expired(id) => {
                Some(serde_json::json!({ "challenge_id": id }))
            }
            ChallengeError::NotPending { status, .. } => {
                Some(serde_json::json!({ "status": status }))
            }
            ChallengeError::Session(e) => e.error_details(),
            _ => None,
        }
    }
}
