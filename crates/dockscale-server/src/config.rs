use dockscale_controller::{ControllerConfig, MembershipRule};
use dockscale_engine::DockerEngineConfig;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

pub const DEFAULT_LOG_FILTER: &str = "info,dockscale=debug";

#[derive(Error, Debug, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Invalid value '{value}' for {var}: {reason}")]
    Invalid {
        var: &'static str,
        value: String,
        reason: String,
    },
}

/// Server settings, read from `DOCKSCALE_*` environment variables.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub manifest: PathBuf,
    pub reserved_service: String,
    pub membership: MembershipRule,
    pub max_replicas: u32,
    pub stop_timeout: Duration,
    pub pull_missing_images: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8080,
            manifest: PathBuf::from("docker-compose.yml"),
            reserved_service: "control-plane".to_string(),
            membership: MembershipRule::Image,
            max_replicas: 64,
            stop_timeout: Duration::from_secs(10),
            pull_missing_images: true,
        }
    }
}

impl ServerConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|var| std::env::var(var).ok())
    }

    /// Builds the config from any variable source. Unset or blank variables
    /// keep their default; malformed ones are an error.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let get = |var: &str| lookup(var).filter(|v| !v.trim().is_empty());
        let defaults = Self::default();

        Ok(Self {
            host: get("DOCKSCALE_HOST").unwrap_or(defaults.host),
            port: parse(&get, "DOCKSCALE_PORT")?.unwrap_or(defaults.port),
            manifest: get("DOCKSCALE_MANIFEST")
                .map(PathBuf::from)
                .unwrap_or(defaults.manifest),
            reserved_service: get("DOCKSCALE_RESERVED_SERVICE")
                .unwrap_or(defaults.reserved_service),
            membership: parse(&get, "DOCKSCALE_MEMBERSHIP")?.unwrap_or(defaults.membership),
            max_replicas: parse(&get, "DOCKSCALE_MAX_REPLICAS")?.unwrap_or(defaults.max_replicas),
            stop_timeout: parse::<u64>(&get, "DOCKSCALE_STOP_TIMEOUT_SECS")?
                .map(Duration::from_secs)
                .unwrap_or(defaults.stop_timeout),
            pull_missing_images: parse_bool(&get, "DOCKSCALE_PULL_MISSING")?
                .unwrap_or(defaults.pull_missing_images),
        })
    }

    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn controller_config(&self) -> ControllerConfig {
        ControllerConfig {
            membership: self.membership,
            max_replicas: self.max_replicas,
        }
    }

    pub fn engine_config(&self) -> DockerEngineConfig {
        DockerEngineConfig {
            stop_timeout: self.stop_timeout,
            pull_missing_images: self.pull_missing_images,
        }
    }
}

fn parse<T>(
    get: &impl Fn(&str) -> Option<String>,
    var: &'static str,
) -> Result<Option<T>, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    get(var)
        .map(|value| {
            value.trim().parse::<T>().map_err(|e| ConfigError::Invalid {
                var,
                value: value.clone(),
                reason: e.to_string(),
            })
        })
        .transpose()
}

fn parse_bool(
    get: &impl Fn(&str) -> Option<String>,
    var: &'static str,
) -> Result<Option<bool>, ConfigError> {
    get(var)
        .map(|value| match value.trim().to_ascii_lowercase().as_str() {
            "1" | "true" | "yes" | "on" => Ok(true),
            "0" | "false" | "no" | "off" => Ok(false),
            _ => Err(ConfigError::Invalid {
                var,
                value: value.clone(),
                reason: "expected true or false".to_string(),
            }),
        })
        .transpose()
}
