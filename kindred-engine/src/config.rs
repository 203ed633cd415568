//! kindred-engine configuration
//!
//! Queue size and pass cool-down are product parameters, so they live here
//! rather than as constants. Every field has a default; a config file only
//! needs to name what it overrides.

use crate::error::{Error, Result};
use chrono::Duration;
use kindred_common::config::LoggingConfig;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Top-level engine configuration (TOML)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Data folder holding the database (see `resolve_data_folder`)
    pub data_folder: Option<PathBuf>,
    pub logging: LoggingConfig,
    pub matching: MatchingConfig,
    pub lifecycle: LifecycleConfig,
    pub channel: ChannelConfig,
    /// Buffered events per EventBus subscriber
    pub event_bus_capacity: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            data_folder: None,
            logging: LoggingConfig::default(),
            matching: MatchingConfig::default(),
            lifecycle: LifecycleConfig::default(),
            channel: ChannelConfig::default(),
            event_bus_capacity: 1000,
        }
    }
}

impl EngineConfig {
    /// Reject inconsistent settings before any component is built
    pub fn validate(&self) -> Result<()> {
        self.matching.validate()?;
        self.lifecycle.validate()?;
        self.channel.validate()?;
        if self.event_bus_capacity == 0 {
            return Err(Error::InvalidInput("event_bus_capacity must be positive".into()));
        }
        Ok(())
    }
}

/// Scoring and daily queue parameters
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MatchingConfig {
    /// Daily quota of surfaced candidates per viewer
    pub daily_queue_size: usize,
    /// Days a passed candidate stays hidden
    pub pass_cooldown_days: i64,
    /// Upper bound of the exploration term added to the overlap score
    pub max_exploration: u8,
    /// Mixed into the exploration hash; changing it reshuffles exploration
    pub exploration_salt: String,
    /// Candidates below this authenticity score are never surfaced
    pub min_authenticity: u8,
    /// Page size used when walking the Profile Store
    pub candidate_page_size: usize,
    /// Parallel queue builds (0 = host parallelism)
    pub queue_workers: usize,
}

impl Default for MatchingConfig {
    fn default() -> Self {
        Self {
            daily_queue_size: 12,
            pass_cooldown_days: 30,
            max_exploration: 20,
            exploration_salt: String::new(),
            min_authenticity: 0,
            candidate_page_size: 200,
            queue_workers: 0,
        }
    }
}

impl MatchingConfig {
    fn validate(&self) -> Result<()> {
        if self.daily_queue_size == 0 {
            return Err(Error::InvalidInput("matching.daily_queue_size must be positive".into()));
        }
        if self.pass_cooldown_days < 0 {
            return Err(Error::InvalidInput("matching.pass_cooldown_days must not be negative".into()));
        }
        if self.max_exploration > 100 {
            return Err(Error::InvalidInput("matching.max_exploration must be at most 100".into()));
        }
        if self.min_authenticity > 100 {
            return Err(Error::InvalidInput("matching.min_authenticity must be at most 100".into()));
        }
        if self.candidate_page_size == 0 {
            return Err(Error::InvalidInput("matching.candidate_page_size must be positive".into()));
        }
        Ok(())
    }

    pub fn pass_cooldown(&self) -> Duration {
        Duration::days(self.pass_cooldown_days)
    }

    /// Effective worker count for parallel queue builds
    pub fn worker_count(&self) -> usize {
        if self.queue_workers > 0 {
            self.queue_workers
        } else {
            std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(4)
        }
    }
}

/// Connection level thresholds and dormancy
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LifecycleConfig {
    /// `new` lasts at most this many days...
    pub new_max_age_days: i64,
    /// ...and while interactions stay below this count
    pub new_max_interactions: u64,
    pub established_min_age_days: i64,
    pub established_min_interactions: u64,
    pub close_min_age_days: i64,
    pub close_min_interactions: u64,
    /// Days without interaction before an active connection turns dormant
    pub dormant_after_days: i64,
}

impl Default for LifecycleConfig {
    fn default() -> Self {
        Self {
            new_max_age_days: 7,
            new_max_interactions: 5,
            established_min_age_days: 28,
            established_min_interactions: 10,
            close_min_age_days: 90,
            close_min_interactions: 40,
            dormant_after_days: 30,
        }
    }
}

impl LifecycleConfig {
    fn validate(&self) -> Result<()> {
        if !(0 <= self.new_max_age_days
            && self.new_max_age_days <= self.established_min_age_days
            && self.established_min_age_days <= self.close_min_age_days)
        {
            return Err(Error::InvalidInput(
                "lifecycle age thresholds must satisfy 0 <= new <= established <= close".into(),
            ));
        }
        if !(self.new_max_interactions <= self.established_min_interactions
            && self.established_min_interactions <= self.close_min_interactions)
        {
            return Err(Error::InvalidInput(
                "lifecycle interaction thresholds must satisfy new <= established <= close".into(),
            ));
        }
        if self.dormant_after_days <= 0 {
            return Err(Error::InvalidInput("lifecycle.dormant_after_days must be positive".into()));
        }
        Ok(())
    }
}

/// Conversation delivery parameters
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChannelConfig {
    /// Live events buffered per conversation before a subscriber lags
    pub subscriber_buffer: usize,
    /// Upper bound on one history page
    pub history_page_max: usize,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            subscriber_buffer: 256,
            history_page_max: 200,
        }
    }
}

impl ChannelConfig {
    fn validate(&self) -> Result<()> {
        if self.subscriber_buffer == 0 || self.history_page_max == 0 {
            return Err(Error::InvalidInput(
                "channel.subscriber_buffer and channel.history_page_max must be positive".into(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        EngineConfig::default().validate().unwrap();
    }

    #[test]
    fn test_partial_toml_keeps_other_defaults() {
        let config: EngineConfig = toml::from_str(
            r#"
            [matching]
            daily_queue_size = 20
            pass_cooldown_days = 14
            "#,
        )
        .unwrap();

        assert_eq!(config.matching.daily_queue_size, 20);
        assert_eq!(config.matching.pass_cooldown(), Duration::days(14));
        assert_eq!(config.matching.max_exploration, 20);
        assert_eq!(config.lifecycle, LifecycleConfig::default());
    }

    #[test]
    fn test_zero_queue_size_rejected() {
        let mut config = EngineConfig::default();
        config.matching.daily_queue_size = 0;
        assert!(matches!(config.validate(), Err(Error::InvalidInput(_))));
    }

    #[test]
    fn test_exploration_above_100_rejected() {
        let mut config = EngineConfig::default();
        config.matching.max_exploration = 101;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_age_thresholds_out_of_order_rejected() {
        let mut config = EngineConfig::default();
        config.lifecycle.established_min_age_days = 100;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_explicit_worker_count() {
        let config = MatchingConfig {
            queue_workers: 3,
            ..MatchingConfig::default()
        };
        assert_eq!(config.worker_count(), 3);
        assert!(MatchingConfig::default().worker_count() >= 1);
    }
}
