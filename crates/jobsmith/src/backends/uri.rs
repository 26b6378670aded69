//! Connection URI handling
//!
//! Grammar: `scheme://[user[:pass]@]host[:port][/database][?params]`. The
//! scheme picks the backend kind; when no URI is configured one is assembled
//! from the discrete `host`, `port`, `username`, `password`, `database` and
//! `ssl` fields.

use url::Url;

use super::BackendKind;
use crate::config::BackendConfig;
use crate::config::defaults::{
    DEFAULT_DATABASE_NAME, DEFAULT_MYSQL_PORT, DEFAULT_POSTGRES_PORT, DEFAULT_REDIS_PORT,
};
use crate::errors::{QueueError, QueueResult};

/// A validated connection URI and the kind it selects
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionUri {
    pub kind: BackendKind,
    uri: String,
}

impl ConnectionUri {
    pub fn parse(uri: &str) -> QueueResult<Self> {
        let scheme = uri
            .split_once(':')
            .map(|(scheme, _)| scheme)
            .ok_or_else(|| QueueError::configuration(format!("connection URI '{uri}' has no scheme")))?;
        let kind = BackendKind::from_tag(scheme)?;
        if kind != BackendKind::Memory && kind != BackendKind::Sqlite {
            Url::parse(uri).map_err(|e| {
                QueueError::configuration(format!("invalid connection URI for {kind}: {e}"))
            })?;
        }
        Ok(Self {
            kind,
            uri: uri.to_string(),
        })
    }

    /// Resolve the configured URI, or build one from discrete fields
    pub fn from_config(config: &BackendConfig) -> QueueResult<Self> {
        let kind = BackendKind::from_tag(&config.kind)?;

        if let Some(uri) = &config.uri {
            let parsed = Self::parse(uri)?;
            if parsed.kind != kind {
                return Err(QueueError::configuration(format!(
                    "backend type '{}' does not match URI scheme of '{}'",
                    config.kind,
                    parsed.redacted()
                )));
            }
            return Ok(parsed);
        }

        let uri = match kind {
            BackendKind::Memory => "memory://".to_string(),
            BackendKind::Sqlite => {
                let path = config.database.as_deref().ok_or_else(|| {
                    QueueError::configuration("sqlite backend needs `database` (a file path) or `uri`")
                })?;
                format!("sqlite://{path}")
            }
            BackendKind::Postgres => Self::assemble(config, "postgres", DEFAULT_POSTGRES_PORT)?,
            BackendKind::Mysql => Self::assemble(config, "mysql", DEFAULT_MYSQL_PORT)?,
            BackendKind::Redis => {
                let scheme = if config.ssl { "rediss" } else { "redis" };
                Self::assemble(config, scheme, DEFAULT_REDIS_PORT)?
            }
            BackendKind::Document => Self::assemble(config, "mongodb", 27017)?,
        };
        Ok(Self { kind, uri })
    }

    fn assemble(config: &BackendConfig, scheme: &str, default_port: u16) -> QueueResult<String> {
        let host = config.host.as_deref().ok_or_else(|| {
            QueueError::configuration(format!("{scheme} backend needs `host` or `uri`"))
        })?;
        let mut url = Url::parse(&format!("{scheme}://{host}"))
            .map_err(|e| QueueError::configuration(format!("invalid host '{host}': {e}")))?;

        let invalid = |field: &str| QueueError::configuration(format!("cannot set {field} on {scheme} URI"));
        url.set_port(Some(config.port.unwrap_or(default_port)))
            .map_err(|_| invalid("port"))?;
        if let Some(user) = &config.username {
            url.set_username(user).map_err(|_| invalid("username"))?;
        }
        if let Some(password) = &config.password {
            url.set_password(Some(password)).map_err(|_| invalid("password"))?;
        }

        let database = match scheme {
            "redis" | "rediss" => config.database.clone().unwrap_or_else(|| "0".to_string()),
            _ => config
                .database
                .clone()
                .unwrap_or_else(|| DEFAULT_DATABASE_NAME.to_string()),
        };
        url.set_path(&format!("/{database}"));

        if config.ssl {
            match scheme {
                "postgres" => {
                    url.query_pairs_mut().append_pair("sslmode", "require");
                }
                "mysql" => {
                    url.query_pairs_mut().append_pair("ssl-mode", "REQUIRED");
                }
                "mongodb" => {
                    url.query_pairs_mut().append_pair("tls", "true");
                }
                _ => {}
            }
        }
        Ok(url.to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.uri
    }

    /// Target database name for server-based relational kinds
    pub fn database_name(&self) -> Option<String> {
        if !matches!(self.kind, BackendKind::Postgres | BackendKind::Mysql) {
            return None;
        }
        let url = Url::parse(&self.uri).ok()?;
        let name = url.path().trim_start_matches('/');
        (!name.is_empty()).then(|| name.to_string())
    }

    /// Same server and credentials, different database
    pub fn with_database(&self, database: &str) -> QueueResult<String> {
        let mut url = Url::parse(&self.uri)
            .map_err(|e| QueueError::configuration(format!("invalid connection URI: {e}")))?;
        url.set_path(&format!("/{database}"));
        Ok(url.to_string())
    }

    /// URI with the password masked, for logs
    pub fn redacted(&self) -> String {
        match Url::parse(&self.uri) {
            Ok(mut url) if url.password().is_some() => {
                let _ = url.set_password(Some("****"));
                url.to_string()
            }
            _ => self.uri.clone(),
        }
    }
}
