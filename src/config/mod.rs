//! Application configuration.
//!
//! Loaded from a YAML file plus environment variables with the `UPLINE`
//! prefix. The compensation plan lives here so percentages and breakpoints
//! can change without touching the engines.

use serde::Deserialize;

/// Default configuration file name.
pub const DEFAULT_CONFIG_FILE: &str = "config.yaml";
/// Environment variable for configuration file path.
pub const CONFIG_ENV_VAR: &str = "UPLINE_CONFIG";
/// Prefix for configuration environment variables.
pub const CONFIG_ENV_PREFIX: &str = "UPLINE";
/// Environment variable for logging configuration.
pub const LOG_ENV_VAR: &str = "UPLINE_LOG";

/// Main application configuration.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    pub storage: StorageConfig,
    pub plan: PlanConfig,
    pub otp: OtpConfig,
    pub placement: PlacementConfig,
    pub fx: FxConfig,
    pub gateway: GatewayConfig,
}

impl Config {
    /// Load configuration from file and environment.
    ///
    /// Sources in order of priority, later overrides earlier:
    /// 1. `config.yaml` in the current directory (if present)
    /// 2. File named by the `path` argument (if provided)
    /// 3. File named by `UPLINE_CONFIG` (if set)
    /// 4. Environment variables with the `UPLINE` prefix
    pub fn load(path: Option<&str>) -> Result<Self, Box<dyn std::error::Error>> {
        use ::config::{Config as ConfigLib, Environment, File, FileFormat};

        let mut builder = ConfigLib::builder()
            .add_source(File::new(DEFAULT_CONFIG_FILE, FileFormat::Yaml).required(false));

        if let Some(config_path) = path {
            builder = builder.add_source(File::new(config_path, FileFormat::Yaml).required(true));
        }

        if let Ok(config_path) = std::env::var(CONFIG_ENV_VAR) {
            builder = builder.add_source(File::new(&config_path, FileFormat::Yaml).required(true));
        }

        let config = builder
            .add_source(
                Environment::with_prefix(CONFIG_ENV_PREFIX)
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        let config: Config = config.try_deserialize()?;
        Ok(config)
    }

    /// Create config for testing.
    pub fn for_test() -> Self {
        Self::default()
    }
}

/// Storage backend configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Backend type: `sqlite` or `memory`.
    pub storage_type: String,
    /// SQLite database path.
    pub path: String,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            storage_type: "memory".to_string(),
            path: "data/upline.db".to_string(),
        }
    }
}

/// One ROI breakpoint: packages at or above the threshold earn the rate,
/// until the next threshold takes over.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct RoiTier {
    /// Minimum package value in minor units.
    pub min_package_minor: i64,
    /// Monthly return in basis points.
    pub monthly_rate_bps: u32,
}

/// Compensation plan: width cap, bonus schedules, ROI breakpoints.
///
/// All configuration data, never code literals.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PlanConfig {
    /// Maximum direct children per member. The root is exempt.
    pub width_cap: u32,
    /// Depth of the cascading bonus.
    pub unilevel_levels: usize,
    /// Bonus on a member's first verified deposit, paid to the original
    /// sponsor. Basis points.
    pub first_deposit_bonus_bps: u32,
    /// Bonus schedule for reinvestment deposits, indexed by prior verified
    /// deposit count (1-based). Strictly decreasing.
    pub reinvestment_bps: Vec<u32>,
    /// Flat rate once the schedule is exhausted.
    pub reinvestment_floor_bps: u32,
    /// Per-level cascade percentages, level 1 first. Zero entries are
    /// skipped without creating ledger rows.
    pub unilevel_bps: Vec<u32>,
    /// ROI step function, ascending by threshold. Packages below the lowest
    /// threshold earn nothing.
    pub roi_tiers: Vec<RoiTier>,
}

impl Default for PlanConfig {
    fn default() -> Self {
        Self {
            width_cap: 6,
            unilevel_levels: 6,
            first_deposit_bonus_bps: 1_000,
            reinvestment_bps: vec![800, 700, 600, 500, 400],
            reinvestment_floor_bps: 300,
            unilevel_bps: vec![500, 400, 300, 200, 100, 50],
            roi_tiers: vec![
                RoiTier { min_package_minor: 5_000, monthly_rate_bps: 500 },
                RoiTier { min_package_minor: 10_000, monthly_rate_bps: 600 },
                RoiTier { min_package_minor: 50_000, monthly_rate_bps: 800 },
                RoiTier { min_package_minor: 100_000, monthly_rate_bps: 1_000 },
                RoiTier { min_package_minor: 250_000, monthly_rate_bps: 1_200 },
                RoiTier { min_package_minor: 500_000, monthly_rate_bps: 1_500 },
                RoiTier { min_package_minor: 1_000_000, monthly_rate_bps: 2_000 },
            ],
        }
    }
}

/// One-time-password and lockout windows.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct OtpConfig {
    /// Code validity in seconds.
    pub ttl_secs: i64,
    /// Maximum OTP requests inside a rolling window.
    pub max_requests_per_window: u32,
    /// Rolling request window in seconds.
    pub request_window_secs: i64,
    /// Failed attempts before lockout.
    pub max_failed_attempts: u32,
    /// Lockout duration in seconds.
    pub lockout_secs: i64,
}

impl Default for OtpConfig {
    fn default() -> Self {
        Self {
            ttl_secs: 600,
            max_requests_per_window: 5,
            request_window_secs: 3_600,
            max_failed_attempts: 5,
            lockout_secs: 3_600,
        }
    }
}

/// Deferred-placement queue settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PlacementConfig {
    /// Hours a queued member may wait for the sponsor to place them.
    pub queue_deadline_hours: i64,
}

impl Default for PlacementConfig {
    fn default() -> Self {
        Self {
            queue_deadline_hours: 48,
        }
    }
}

/// FX-rate collaborator settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct FxConfig {
    /// Rate provider base URL.
    pub base_url: String,
    /// Cache TTL in seconds.
    pub cache_ttl_secs: u64,
    /// Settlement currency code.
    pub settlement_currency: String,
}

impl Default for FxConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:8100".to_string(),
            cache_ttl_secs: 300,
            settlement_currency: "USD".to_string(),
        }
    }
}

/// Payment-gateway settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    /// Shared secret for webhook signatures. Override in deployment.
    pub webhook_secret: String,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            webhook_secret: "dev-webhook-secret".to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_default() {
        let config = Config::default();
        assert_eq!(config.plan.width_cap, 6);
        assert_eq!(config.plan.unilevel_levels, 6);
        assert_eq!(config.otp.max_failed_attempts, 5);
        assert_eq!(config.placement.queue_deadline_hours, 48);
        assert_eq!(config.storage.storage_type, "memory");
    }

    #[test]
    fn test_reinvestment_schedule_strictly_decreasing() {
        let plan = PlanConfig::default();
        for pair in plan.reinvestment_bps.windows(2) {
            assert!(pair[0] > pair[1]);
        }
        assert!(plan.reinvestment_floor_bps < *plan.reinvestment_bps.last().unwrap());
    }

    #[test]
    fn test_roi_tiers_ascending() {
        let plan = PlanConfig::default();
        for pair in plan.roi_tiers.windows(2) {
            assert!(pair[0].min_package_minor < pair[1].min_package_minor);
            assert!(pair[0].monthly_rate_bps < pair[1].monthly_rate_bps);
        }
    }

    #[test]
    fn test_unilevel_schedule_has_six_levels() {
        let plan = PlanConfig::default();
        assert_eq!(plan.unilevel_bps.len(), plan.unilevel_levels);
    }
}
