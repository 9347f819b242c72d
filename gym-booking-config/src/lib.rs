use core::fmt::{Debug, Display};
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};

use figment::providers::{Env, Format, Serialized, Toml};
use figment::Figment;
use serde::{Deserialize, Serialize};

pub const CONFIG_FILE: &str = "gym-booking.toml";
pub const ENV_PREFIX: &str = "GYM_";

/// Opening of next week's classes, relative to the start (sunday) of the week before.
#[derive(Deserialize, Serialize, Clone, Debug, PartialEq, Eq)]
pub struct WeeklyUnlockConfig {
    #[serde(default = "default_unlock_weekday")]
    pub weekday: String,
    #[serde(default = "default_early_unlock_weekday")]
    pub early_weekday: String,
    #[serde(default = "default_unlock_hour")]
    pub hour: u32,
    /// Membership tiers that get the early weekday.
    #[serde(default = "default_early_tiers")]
    pub early_tiers: Vec<String>,
}

fn default_unlock_weekday() -> String {
    "thursday".to_owned()
}

fn default_early_unlock_weekday() -> String {
    "wednesday".to_owned()
}

const fn default_unlock_hour() -> u32 {
    12
}

fn default_early_tiers() -> Vec<String> {
    vec!["unlimited".to_owned()]
}

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq, Eq)]
pub struct PolicyConfig {
    #[serde(default = "default_late_cancellation_hours")]
    pub late_cancellation_hours: u32,
    #[serde(default = "default_switch_cutoff_hours")]
    pub switch_cutoff_hours: u32,
    #[serde(default = "default_block_threshold")]
    pub block_threshold: u32,
    #[serde(default = "default_block_days")]
    pub block_days: u32,
    /// Offset of the gym's wall clock from UTC.
    #[serde(default)]
    pub utc_offset_minutes: i32,
    #[serde(default)]
    pub weekly_unlock: Option<WeeklyUnlockConfig>,
}

const fn default_late_cancellation_hours() -> u32 {
    6
}

const fn default_switch_cutoff_hours() -> u32 {
    1
}

const fn default_block_threshold() -> u32 {
    3
}

const fn default_block_days() -> u32 {
    3
}

impl Default for PolicyConfig {
    fn default() -> Self {
        Self {
            late_cancellation_hours: default_late_cancellation_hours(),
            switch_cutoff_hours: default_switch_cutoff_hours(),
            block_threshold: default_block_threshold(),
            block_days: default_block_days(),
            utc_offset_minutes: 0,
            weekly_unlock: None,
        }
    }
}

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq, Eq)]
pub struct Config {
    pub listen_address: SocketAddr,
    /// Without a database the server keeps everything in memory.
    #[serde(default)]
    pub database_url: Option<String>,
    #[serde(default = "default_notification_flush_seconds")]
    pub notification_flush_seconds: u64,
    #[serde(default)]
    pub policy: PolicyConfig,
}

const fn default_notification_flush_seconds() -> u64 {
    5
}

impl Default for Config {
    fn default() -> Self {
        Self {
            listen_address: SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, 3000)),
            database_url: None,
            notification_flush_seconds: default_notification_flush_seconds(),
            policy: PolicyConfig::default(),
        }
    }
}

#[derive(thiserror::Error)]
pub enum ConfigError {
    #[error("config error: {0}")]
    Figment(#[from] Box<figment::Error>),
}

impl From<figment::Error> for ConfigError {
    fn from(value: figment::Error) -> Self {
        Self::Figment(Box::new(value))
    }
}

impl Debug for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        Display::fmt(self, f)
    }
}

#[must_use]
pub fn figment() -> Figment {
    Figment::from(Serialized::defaults(Config::default()))
        .merge(Toml::file(CONFIG_FILE))
        .merge(Env::prefixed(ENV_PREFIX).split("__"))
}

pub fn get_config() -> Result<Config, ConfigError> {
    Ok(figment().extract()?)
}

#[cfg(test)]
mod tests {
    use figment::Jail;

    use super::*;

    #[test]
    fn defaults_without_any_source() {
        Jail::expect_with(|_jail| {
            let config = get_config().map_err(|err| err.to_string())?;
            assert_eq!(config, Config::default());
            assert_eq!(config.policy.late_cancellation_hours, 6);
            assert_eq!(config.policy.block_threshold, 3);
            assert!(config.policy.weekly_unlock.is_none());
            Ok(())
        });
    }

    #[test]
    fn toml_file_and_env_are_merged() {
        Jail::expect_with(|jail| {
            jail.create_file(
                CONFIG_FILE,
                r#"
                listen_address = "127.0.0.1:8080"
                database_url = "postgres://postgres@localhost/gym"

                [policy]
                block_days = 5

                [policy.weekly_unlock]
                hour = 9
                "#,
            )?;
            jail.set_env("GYM_POLICY__LATE_CANCELLATION_HOURS", "12");

            let config = get_config().map_err(|err| err.to_string())?;
            assert_eq!(config.listen_address.port(), 8080);
            assert_eq!(
                config.database_url.as_deref(),
                Some("postgres://postgres@localhost/gym")
            );
            assert_eq!(config.policy.block_days, 5);
            assert_eq!(config.policy.late_cancellation_hours, 12);
            let unlock = config.policy.weekly_unlock.expect("unlock configured");
            assert_eq!(unlock.hour, 9);
            assert_eq!(unlock.weekday, "thursday");
            assert_eq!(unlock.early_tiers, vec!["unlimited".to_owned()]);
            Ok(())
        });
    }
}
