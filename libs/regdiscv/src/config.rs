use figment::Figment;
use figment::providers::Serialized;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Configuration of the registration/discovery substrate
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RegDiscvConfig {
    /// Coordination service endpoints (`host:port`), informational for
    /// in-process backends.
    #[serde(default)]
    pub hosts: Vec<String>,

    /// Session timeout negotiated with the coordination service.
    #[serde(default = "default_session_timeout_ms")]
    pub session_timeout_ms: u64,

    /// Capacity of each `discover` event channel.
    #[serde(default = "default_event_buffer")]
    pub event_buffer: usize,

    /// Capacity of each service-state queue used by leader election.
    #[serde(default = "default_state_buffer")]
    pub state_buffer: usize,

    #[serde(default)]
    pub retry: BackoffConfig,
}

/// Retry delays for background loops.
///
/// Delay for attempt `n` is `initial_ms * multiplier^n`, capped at `max_ms`,
/// then spread by +/- `jitter` (fraction of the delay).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BackoffConfig {
    #[serde(default = "default_initial_ms")]
    pub initial_ms: u64,
    #[serde(default = "default_max_ms")]
    pub max_ms: u64,
    #[serde(default = "default_multiplier")]
    pub multiplier: f64,
    #[serde(default = "default_jitter")]
    pub jitter: f64,
}

fn default_session_timeout_ms() -> u64 {
    10_000
}

fn default_event_buffer() -> usize {
    16
}

fn default_state_buffer() -> usize {
    10
}

fn default_initial_ms() -> u64 {
    5_000
}

fn default_max_ms() -> u64 {
    60_000
}

fn default_multiplier() -> f64 {
    2.0
}

fn default_jitter() -> f64 {
    0.2
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            initial_ms: default_initial_ms(),
            max_ms: default_max_ms(),
            multiplier: default_multiplier(),
            jitter: default_jitter(),
        }
    }
}

impl BackoffConfig {
    /// Constant delay without growth or jitter.
    #[must_use]
    pub fn fixed(delay_ms: u64) -> Self {
        Self {
            initial_ms: delay_ms,
            max_ms: delay_ms,
            multiplier: 1.0,
            jitter: 0.0,
        }
    }

    fn validate(&self) -> Result<()> {
        if self.initial_ms == 0 {
            return Err(Error::Config("retry.initial_ms must be positive".to_owned()));
        }
        if self.max_ms < self.initial_ms {
            return Err(Error::Config(
                "retry.max_ms must not be below retry.initial_ms".to_owned(),
            ));
        }
        if !self.multiplier.is_finite() || self.multiplier < 1.0 {
            return Err(Error::Config("retry.multiplier must be >= 1".to_owned()));
        }
        if !(0.0..1.0).contains(&self.jitter) {
            return Err(Error::Config("retry.jitter must be in [0, 1)".to_owned()));
        }
        Ok(())
    }
}

impl Default for RegDiscvConfig {
    fn default() -> Self {
        Self {
            hosts: Vec::new(),
            session_timeout_ms: default_session_timeout_ms(),
            event_buffer: default_event_buffer(),
            state_buffer: default_state_buffer(),
            retry: BackoffConfig::default(),
        }
    }
}

impl RegDiscvConfig {
    /// Extract the configuration from a figment, layered over the defaults.
    ///
    /// # Errors
    /// Returns `Error::Config` if extraction or validation fails.
    pub fn from_figment(figment: &Figment) -> Result<Self> {
        let cfg: Self = Figment::from(Serialized::defaults(Self::default()))
            .merge(figment.clone())
            .extract()?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Check value ranges.
    ///
    /// # Errors
    /// Returns `Error::Config` describing the first invalid field.
    pub fn validate(&self) -> Result<()> {
        if self.event_buffer == 0 {
            return Err(Error::Config("event_buffer must be positive".to_owned()));
        }
        if self.state_buffer < 2 {
            return Err(Error::Config("state_buffer must be at least 2".to_owned()));
        }
        self.retry.validate()
    }
}
