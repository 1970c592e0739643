// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Interfaces for parsing configuration files and working with a region
//! service configuration

use camino::Utf8Path;
use camino::Utf8PathBuf;
use dropshot::ConfigLogging;
use region_db_queries::db::DatabaseConfig;
use region_db_queries::db::DnsConfig;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

/// Configuration for a region service
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct Config {
    /// Server-wide logging configuration.
    pub log: ConfigLogging,
    /// Configuration of the rack-facing RPC surface.
    #[serde(default)]
    pub rpc: RpcConfig,
    /// Where the region database is, and how to use it.
    #[serde(default)]
    pub database: DatabaseConfig,
    /// Defaults applied when publishing dynamic DNS records.
    #[serde(default)]
    pub dns: DnsConfig,
}

impl Config {
    /// Load a `Config` from the given TOML file
    ///
    /// This config object can then be used to start a new region service.
    pub fn from_file(path: &Utf8Path) -> Result<Config, LoadError> {
        let file_contents = std::fs::read_to_string(path)
            .map_err(|err| LoadError::Io { path: path.into(), err })?;
        let config_parsed: Config = toml::from_str(&file_contents)
            .map_err(|err| LoadError::Parse { path: path.into(), err })?;
        Ok(config_parsed)
    }
}

#[derive(Clone, Debug, Deserialize, PartialEq, Eq, Serialize)]
#[serde(default)]
pub struct RpcConfig {
    /// How long a caller waits for a rack connection before giving up
    pub client_timeout_secs: u64,
}

impl RpcConfig {
    pub fn client_timeout(&self) -> Duration {
        Duration::from_secs(self.client_timeout_secs)
    }
}

impl Default for RpcConfig {
    fn default() -> Self {
        RpcConfig { client_timeout_secs: 30 }
    }
}

#[derive(Debug, Error)]
pub enum LoadError {
    #[error("error reading \"{path}\": {err}")]
    Io {
        path: Utf8PathBuf,
        #[source]
        err: std::io::Error,
    },
    #[error("error parsing \"{path}\": {err}")]
    Parse {
        path: Utf8PathBuf,
        #[source]
        err: toml::de::Error,
    },
}

#[cfg(test)]
mod test {
    use super::*;
    use assert_matches::assert_matches;
    use dropshot::ConfigLoggingLevel;

    fn write_config(dir: &camino_tempfile::Utf8TempDir, contents: &str) -> Utf8PathBuf {
        let path = dir.path().join("config.toml");
        std::fs::write(&path, contents).unwrap();
        path
    }

    #[test]
    fn test_full_config() {
        let dir = camino_tempfile::tempdir().unwrap();
        let path = write_config(
            &dir,
            r#"
            [log]
            mode = "stderr-terminal"
            level = "info"

            [rpc]
            client_timeout_secs = 5

            [database]
            url = "postgresql://region@db.example/maasdb"
            max_connections = 4
            max_transaction_attempts = 3

            [dns]
            default_domain = "example"
            default_ttl = 60
            "#,
        );

        let config = Config::from_file(&path).unwrap();
        assert_eq!(
            config.log,
            ConfigLogging::StderrTerminal { level: ConfigLoggingLevel::Info }
        );
        assert_eq!(config.rpc.client_timeout(), Duration::from_secs(5));
        assert_eq!(config.database.url, "postgresql://region@db.example/maasdb");
        assert_eq!(config.database.max_connections, 4);
        assert_eq!(config.database.max_transaction_attempts, 3);
        assert_eq!(config.dns.default_domain, "example");
        assert_eq!(config.dns.default_ttl, 60);
    }

    #[test]
    fn test_defaults() {
        let dir = camino_tempfile::tempdir().unwrap();
        let path = write_config(
            &dir,
            r#"
            [log]
            mode = "stderr-terminal"
            level = "warn"
            "#,
        );

        let config = Config::from_file(&path).unwrap();
        assert_eq!(config.rpc, RpcConfig::default());
        assert_eq!(config.rpc.client_timeout(), Duration::from_secs(30));
        assert_eq!(config.database, DatabaseConfig::default());
        assert_eq!(config.dns, DnsConfig::default());
    }

    #[test]
    fn test_load_errors() {
        let dir = camino_tempfile::tempdir().unwrap();

        let missing = dir.path().join("nonexistent.toml");
        let error = Config::from_file(&missing).unwrap_err();
        assert_matches!(error, LoadError::Io { ref path, .. } if *path == missing);

        let path = write_config(&dir, "[rpc]\nclient_timeout_secs = \"soon\"\n");
        let error = Config::from_file(&path).unwrap_err();
        assert_matches!(error, LoadError::Parse { .. });
        assert!(error.to_string().starts_with("error parsing"));
    }
}
