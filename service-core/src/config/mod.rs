use crate::error::AppError;
use config::{Config as Cfg, File};
use serde::Deserialize;
use std::env;
use std::net::SocketAddr;
use std::str::FromStr;

/// Listener settings shared by every service.
///
/// Read from an optional `configuration` file and `APP__*` environment
/// variables (e.g. `APP__PORT=9000`).
#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    8080
}

impl Config {
    pub fn load() -> Result<Self, AppError> {
        dotenvy::dotenv().ok();

        let config = Cfg::builder()
            .add_source(File::with_name("configuration").required(false))
            .add_source(config::Environment::with_prefix("APP").separator("__"))
            .build()?;

        Ok(config.try_deserialize()?)
    }

    pub fn socket_addr(&self) -> Result<SocketAddr, AppError> {
        format!("{}:{}", self.host, self.port)
            .parse()
            .map_err(|e| AppError::ConfigError(anyhow::anyhow!("Invalid listen address: {}", e)))
    }
}

/// Read an environment variable.
///
/// In production every variable is mandatory; elsewhere `default` is used
/// when the variable is unset.
pub fn get_env(key: &str, default: Option<&str>, is_prod: bool) -> Result<String, AppError> {
    match env::var(key) {
        Ok(val) => Ok(val),
        Err(_) => {
            if is_prod {
                Err(AppError::ConfigError(anyhow::anyhow!(
                    "{} is required in production but not set",
                    key
                )))
            } else if let Some(def) = default {
                Ok(def.to_string())
            } else {
                Err(AppError::ConfigError(anyhow::anyhow!(
                    "{} is required but not set",
                    key
                )))
            }
        }
    }
}

/// Read and parse an environment variable, reporting the key on parse failure.
pub fn parse_env<T>(key: &str, default: Option<&str>, is_prod: bool) -> Result<T, AppError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    let raw = get_env(key, default, is_prod)?;
    raw.trim().parse::<T>().map_err(|e| {
        AppError::ConfigError(anyhow::anyhow!("{} has an invalid value '{}': {}", key, raw, e))
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_variable_uses_default_outside_prod() {
        let value = get_env("SERVICE_CORE_TEST_UNSET_VARIABLE", Some("fallback"), false)
            .expect("default should apply");
        assert_eq!(value, "fallback");
    }

    #[test]
    fn missing_variable_is_an_error_in_prod() {
        let result = get_env("SERVICE_CORE_TEST_UNSET_VARIABLE", Some("fallback"), true);
        assert!(matches!(result, Err(AppError::ConfigError(_))));
    }

    #[test]
    fn parse_env_reports_bad_values() {
        let parsed: Result<u32, _> = parse_env("SERVICE_CORE_TEST_UNSET_VARIABLE", Some("abc"), false);
        let err = parsed.expect_err("non-numeric default must fail");
        assert!(err.to_string().contains("SERVICE_CORE_TEST_UNSET_VARIABLE"));
    }

    #[test]
    fn socket_addr_combines_host_and_port() {
        let config = Config {
            host: "127.0.0.1".to_string(),
            port: 9100,
        };
        let addr = config.socket_addr().expect("valid address");
        assert_eq!(addr.port(), 9100);
    }
}
