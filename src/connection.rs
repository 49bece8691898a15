//! Connection settings parsed from `serviceOptions`
//!
//! Accepted forms:
//! * a connection string, `Key=Value;Key=Value;...` (one string or a list of
//!   fragments joined with `;`);
//! * a positional list `[account name, account key, host]`.
//!
//! Keys understood here are `UseDevelopmentStorage`, `Backend`, `DataPath`,
//! `AccountName` and `AccountKey`. Other keys (endpoints, protocol) are
//! accepted and ignored.

use std::fmt;
use std::path::PathBuf;

use log::debug;

use crate::config::{StorageBackend, StorageConfig};
use crate::error::TaskError;

/// Where and how to reach the storage services of one task.
#[derive(Clone, PartialEq)]
pub struct ConnectionSettings {
    pub backend: StorageBackend,
    pub data_path: PathBuf,
    pub account_name: Option<String>,
    pub development: bool,
    account_key: Option<String>,
}

impl fmt::Debug for ConnectionSettings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionSettings")
            .field("backend", &self.backend)
            .field("data_path", &self.data_path)
            .field("account_name", &self.account_name)
            .field("development", &self.development)
            .field("account_key", &self.account_key.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

impl ConnectionSettings {
    /// Settings for an empty `serviceOptions`: the configured defaults.
    pub fn from_config(config: &StorageConfig) -> Self {
        Self {
            backend: config.backend,
            data_path: PathBuf::from(&config.data_path),
            account_name: None,
            development: false,
            account_key: None,
        }
    }

    pub fn parse(service_options: &[String], config: &StorageConfig) -> Result<Self, TaskError> {
        let mut settings = Self::from_config(config);
        let mut explicit_backend = None;
        let mut explicit_path = None;

        for (key, value) in pairs(service_options)? {
            match key.to_ascii_lowercase().as_str() {
                "usedevelopmentstorage" => settings.development = value.eq_ignore_ascii_case("true"),
                "backend" => {
                    let backend = value
                        .parse::<StorageBackend>()
                        .map_err(|e| TaskError::invalid("serviceOptions", e))?;
                    explicit_backend = Some(backend);
                }
                "datapath" => explicit_path = Some(PathBuf::from(value)),
                "accountname" => settings.account_name = Some(value),
                "accountkey" => settings.account_key = Some(value),
                _ => debug!("Ignoring connection setting {}", key),
            }
        }

        if settings.development {
            settings.backend = StorageBackend::Local;
            settings.data_path = PathBuf::from(&config.development_path);
        }
        if let Some(backend) = explicit_backend {
            settings.backend = backend;
        }
        if let Some(path) = explicit_path {
            settings.data_path = path;
        }
        if let Some(account) = &settings.account_name {
            settings.data_path = settings.data_path.join(account);
        }
        Ok(settings)
    }

    pub fn has_account_key(&self) -> bool {
        self.account_key.is_some()
    }

    /// Identity of the service set these settings resolve to.
    pub fn cache_key(&self) -> String {
        format!("{:?}|{}", self.backend, self.data_path.display())
    }
}

fn pairs(service_options: &[String]) -> Result<Vec<(String, String)>, TaskError> {
    // Positional form: account name, account key, optional host
    if (2..=3).contains(&service_options.len()) && service_options.iter().all(|s| !s.contains('=')) {
        return Ok(vec![
            ("AccountName".to_string(), service_options[0].clone()),
            ("AccountKey".to_string(), service_options[1].clone()),
        ]);
    }

    service_options
        .join(";")
        .split(';')
        .map(str::trim)
        .filter(|part| !part.is_empty())
        .map(|part| {
            part.split_once('=')
                .map(|(k, v)| (k.trim().to_string(), v.trim().to_string()))
                .ok_or_else(|| TaskError::invalid("serviceOptions", format!("expected Key=Value, got '{}'", part)))
        })
        .collect()
}
