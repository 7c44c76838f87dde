use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

pub const ENV_PREFIX: &str = "TAVERN_";

/// Timing constants shared by every component. All values are seconds.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AppSettings {
    /// Session TTL while waiting or active.
    pub active_session_ttl_secs: u64,
    /// Session TTL once completed or abandoned.
    pub completed_session_ttl_secs: u64,
    /// Silence after which a session participant counts as gone.
    pub connection_staleness_secs: u64,
    /// How often lobby clients are expected to heartbeat.
    pub lobby_heartbeat_secs: u64,
    pub presence_staleness_secs: u64,
    pub challenge_ttl_secs: u64,
    /// Period of the background sweep.
    pub sweep_interval_secs: u64,
    /// How often an attached session stream refreshes its own heartbeat.
    pub stream_refresh_secs: u64,
}

impl Default for AppSettings {
    fn default() -> Self {
        Self {
            active_session_ttl_secs: 3600,
            completed_session_ttl_secs: 300,
            connection_staleness_secs: 15,
            lobby_heartbeat_secs: 20,
            presence_staleness_secs: 45,
            challenge_ttl_secs: 60,
            sweep_interval_secs: 5,
            stream_refresh_secs: 5,
        }
    }
}

impl AppSettings {
    pub fn validate(&self) -> Result<(), SettingsError> {
        let positive = [
            ("active_session_ttl_secs", self.active_session_ttl_secs),
            ("completed_session_ttl_secs", self.completed_session_ttl_secs),
            ("connection_staleness_secs", self.connection_staleness_secs),
            ("lobby_heartbeat_secs", self.lobby_heartbeat_secs),
            ("presence_staleness_secs", self.presence_staleness_secs),
            ("challenge_ttl_secs", self.challenge_ttl_secs),
            ("sweep_interval_secs", self.sweep_interval_secs),
            ("stream_refresh_secs", self.stream_refresh_secs),
        ];
        for (field, value) in positive {
            if value == 0 {
                return Err(SettingsError::InvalidValue(format!(
                    "{field} must be greater than 0"
                )));
            }
        }

        if self.completed_session_ttl_secs > self.active_session_ttl_secs {
            return Err(SettingsError::InvalidValue(
                "completed_session_ttl_secs cannot exceed active_session_ttl_secs".to_string(),
            ));
        }
        if self.stream_refresh_secs >= self.connection_staleness_secs {
            return Err(SettingsError::InvalidValue(
                "stream_refresh_secs must be shorter than connection_staleness_secs".to_string(),
            ));
        }
        if self.presence_staleness_secs <= self.lobby_heartbeat_secs {
            return Err(SettingsError::InvalidValue(
                "presence_staleness_secs must exceed lobby_heartbeat_secs".to_string(),
            ));
        }
        Ok(())
    }

    /// Defaults overridden by `TAVERN_*` environment variables, e.g.
    /// `TAVERN_CHALLENGE_TTL_SECS=90`.
    pub fn from_env() -> Result<Self, SettingsError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self, SettingsError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut settings = Self::default();
        let fields: [(&str, &mut u64); 8] = [
            ("ACTIVE_SESSION_TTL_SECS", &mut settings.active_session_ttl_secs),
            ("COMPLETED_SESSION_TTL_SECS", &mut settings.completed_session_ttl_secs),
            ("CONNECTION_STALENESS_SECS", &mut settings.connection_staleness_secs),
            ("LOBBY_HEARTBEAT_SECS", &mut settings.lobby_heartbeat_secs),
            ("PRESENCE_STALENESS_SECS", &mut settings.presence_staleness_secs),
            ("CHALLENGE_TTL_SECS", &mut settings.challenge_ttl_secs),
            ("SWEEP_INTERVAL_SECS", &mut settings.sweep_interval_secs),
            ("STREAM_REFRESH_SECS", &mut settings.stream_refresh_secs),
        ];
        for (suffix, slot) in fields {
            let name = format!("{ENV_PREFIX}{suffix}");
            if let Some(raw) = lookup(&name) {
                *slot = raw.trim().parse().map_err(|_| {
                    SettingsError::InvalidValue(format!(
                        "{name} must be a whole number of seconds, got `{raw}`"
                    ))
                })?;
            }
        }
        settings.validate()?;
        Ok(settings)
    }

    pub fn active_session_ttl(&self) -> Duration {
        Duration::from_secs(self.active_session_ttl_secs)
    }

    pub fn completed_session_ttl(&self) -> Duration {
        Duration::from_secs(self.completed_session_ttl_secs)
    }

    pub fn connection_staleness(&self) -> Duration {
        Duration::from_secs(self.connection_staleness_secs)
    }

    pub fn presence_staleness(&self) -> Duration {
        Duration::from_secs(self.presence_staleness_secs)
    }

    pub fn challenge_ttl(&self) -> Duration {
        Duration::from_secs(self.challenge_ttl_secs)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }

    pub fn stream_refresh(&self) -> Duration {
        Duration::from_secs(self.stream_refresh_secs)
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SettingsError {
    #[error("Invalid settings value: {0}")]
    InvalidValue(String),
}
