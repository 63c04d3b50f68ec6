use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::error::{DeputyError, Result};
use crate::policy::{ActionTemplate, Condition};
use crate::trust::TrustLevel;
use crate::types::ActionType;

/// Upper bound for undo windows and pause holds: 30 days.
const MAX_ENGINE_WINDOW_SECS: u64 = 30 * 86_400;
const MAX_PAUSE_RECHECK_MS: u64 = 3_600_000;

/// Top-level configuration for Deputy.
///
/// Loaded from `~/.deputy/config.toml` by default. Every section falls back
/// to its defaults when absent.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DeputyConfig {
    #[serde(default)]
    pub general: GeneralConfig,
    #[serde(default)]
    pub engine: EngineConfig,
    #[serde(default)]
    pub trust: TrustConfig,
    #[serde(default)]
    pub policy: PolicyConfig,
    #[serde(default)]
    pub api: ApiConfig,
}

impl DeputyConfig {
    /// Load configuration from a TOML file.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: DeputyConfig = toml::from_str(&content)?;
        config.validate()?;
        info!("Configuration loaded from {}", path.display());
        Ok(config)
    }

    /// Load configuration from a TOML file, falling back to defaults if the
    /// file does not exist or cannot be parsed.
    pub fn load_or_default(path: &Path) -> Self {
        match Self::load(path) {
            Ok(config) => config,
            Err(e) => {
                warn!(
                    "Failed to load config from {}: {}. Using defaults.",
                    path.display(),
                    e
                );
                Self::default()
            }
        }
    }

    /// Save the current configuration to a TOML file.
    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content =
            toml::to_string_pretty(self).map_err(|e| DeputyError::Config(e.to_string()))?;
        std::fs::write(path, content)?;
        info!("Configuration saved to {}", path.display());
        Ok(())
    }

    /// Reject values that would make the engine misbehave.
    pub fn validate(&self) -> Result<()> {
        if self.engine.executor_parallelism == 0 {
            return Err(DeputyError::Config(
                "engine.executor_parallelism must be at least 1".to_string(),
            ));
        }
        let engine = &self.engine;
        if engine.pause_recheck_ms == 0 || engine.pause_recheck_ms > MAX_PAUSE_RECHECK_MS {
            return Err(DeputyError::Config(format!(
                "engine.pause_recheck_ms must be in 1..={}",
                MAX_PAUSE_RECHECK_MS
            )));
        }
        for (name, secs) in [
            ("max_undo_window_secs", engine.max_undo_window_secs),
            ("default_undo_window_secs", engine.default_undo_window_secs),
            ("max_pause_hold_secs", engine.max_pause_hold_secs),
        ] {
            if secs > MAX_ENGINE_WINDOW_SECS {
                return Err(DeputyError::Config(format!(
                    "engine.{} must be at most {}",
                    name, MAX_ENGINE_WINDOW_SECS
                )));
            }
        }
        if engine.default_undo_window_secs > engine.max_undo_window_secs {
            return Err(DeputyError::Config(
                "engine.default_undo_window_secs exceeds engine.max_undo_window_secs".to_string(),
            ));
        }
        for threshold in &self.trust.thresholds {
            if TrustLevel::from_u8(threshold.level).is_none() || threshold.level == 1 {
                return Err(DeputyError::Config(format!(
                    "trust threshold for level {} is out of range 2..=5",
                    threshold.level
                )));
            }
        }
        for default in &self.policy.defaults {
            if TrustLevel::from_u8(default.unlock_level).is_none() {
                return Err(DeputyError::Config(format!(
                    "default policy '{}' has invalid unlock_level {}",
                    default.name, default.unlock_level
                )));
            }
        }
        Ok(())
    }
}

/// General application settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GeneralConfig {
    /// Directory holding the SQLite database and API token.
    pub data_dir: String,
    /// Log level: trace, debug, info, warn, error.
    pub log_level: String,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            data_dir: "~/.deputy/data".to_string(),
            log_level: "info".to_string(),
        }
    }
}

/// Timing and concurrency for the deadline dispatcher and executor.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Undo window applied when a request does not carry its own.
    pub default_undo_window_secs: u64,
    /// Longest undo window a request may ask for.
    pub max_undo_window_secs: u64,
    /// How long an eligible action may be held by a pause before it expires.
    pub max_pause_hold_secs: u64,
    /// How often held actions are re-checked while paused.
    pub pause_recheck_ms: u64,
    /// Maximum concurrent deliveries.
    pub executor_parallelism: usize,
    /// Deliver one action at a time per account.
    pub serialize_per_account: bool,
    /// Upper bound on a single provider delivery.
    pub delivery_timeout_secs: u64,
    /// Dispatcher wakeup when nothing is scheduled.
    pub idle_wakeup_secs: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            default_undo_window_secs: 30,
            max_undo_window_secs: 86_400,
            max_pause_hold_secs: 3600,
            pause_recheck_ms: 1000,
            executor_parallelism: 4,
            serialize_per_account: true,
            delivery_timeout_secs: 30,
            idle_wakeup_secs: 60,
        }
    }
}

impl EngineConfig {
    pub fn default_undo_window(&self) -> Duration {
        Duration::from_secs(self.default_undo_window_secs)
    }

    pub fn max_undo_window(&self) -> Duration {
        Duration::from_secs(self.max_undo_window_secs)
    }

    pub fn max_pause_hold(&self) -> Duration {
        Duration::from_secs(self.max_pause_hold_secs)
    }

    pub fn pause_recheck(&self) -> Duration {
        Duration::from_millis(self.pause_recheck_ms)
    }

    pub fn delivery_timeout(&self) -> Duration {
        Duration::from_secs(self.delivery_timeout_secs)
    }

    pub fn idle_wakeup(&self) -> Duration {
        Duration::from_secs(self.idle_wakeup_secs)
    }
}

/// Requirements for unlocking one trust level.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrustThreshold {
    /// The level being unlocked (2..=5).
    pub level: u8,
    pub min_days_at_previous_level: u32,
    /// Actions executed since the previous level was entered.
    #[serde(default)]
    pub min_actions_at_previous_level: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TrustConfig {
    pub thresholds: Vec<TrustThreshold>,
}

impl Default for TrustConfig {
    fn default() -> Self {
        Self {
            thresholds: vec![
                TrustThreshold {
                    level: 2,
                    min_days_at_previous_level: 3,
                    min_actions_at_previous_level: 0,
                },
                TrustThreshold {
                    level: 3,
                    min_days_at_previous_level: 7,
                    min_actions_at_previous_level: 10,
                },
                TrustThreshold {
                    level: 4,
                    min_days_at_previous_level: 14,
                    min_actions_at_previous_level: 25,
                },
                TrustThreshold {
                    level: 5,
                    min_days_at_previous_level: 30,
                    min_actions_at_previous_level: 50,
                },
            ],
        }
    }
}

impl TrustConfig {
    /// Threshold for unlocking `level`; levels without an entry have none.
    pub fn threshold_for(&self, level: TrustLevel) -> TrustThreshold {
        self.thresholds
            .iter()
            .find(|t| t.level == level.as_u8())
            .cloned()
            .unwrap_or(TrustThreshold {
                level: level.as_u8(),
                min_days_at_previous_level: 0,
                min_actions_at_previous_level: 0,
            })
    }
}

/// Whether one triggering event may produce more than one action.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PolicyMode {
    /// Only the highest-priority matching policy fires.
    #[default]
    HighestPriority,
    /// Every matching policy fires, except that a lower-priority match
    /// touching an already-claimed target is dropped.
    FanOut,
}

/// A policy seeded into an account when it unlocks `unlock_level`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DefaultPolicy {
    pub unlock_level: u8,
    pub name: String,
    pub conditions: Condition,
    pub action_template: ActionTemplate,
    #[serde(default)]
    pub priority: i32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PolicyConfig {
    pub mode: PolicyMode,
    pub defaults: Vec<DefaultPolicy>,
}

impl Default for PolicyConfig {
    fn default() -> Self {
        Self {
            mode: PolicyMode::HighestPriority,
            defaults: vec![DefaultPolicy {
                unlock_level: 2,
                name: "Archive newsletters".to_string(),
                conditions: Condition::All {
                    conditions: vec![
                        Condition::EventType {
                            event_type: crate::policy::TriggerKind::NewMessage,
                        },
                        Condition::FieldExists {
                            field: "list_unsubscribe".to_string(),
                        },
                    ],
                },
                action_template: ActionTemplate {
                    action_type: ActionType::ArchiveMessage,
                    payload: serde_json::json!({ "message_id": "{message_id}" }),
                },
                priority: 10,
            }],
        }
    }
}

/// HTTP API settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ApiConfig {
    pub bind: String,
    pub port: u16,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            bind: "127.0.0.1".to_string(),
            port: 3040,
        }
    }
}
