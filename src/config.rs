//! Connection and query options

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{ReqlError, ReqlResult};

pub const DEFAULT_HOST: &str = "localhost";
pub const DEFAULT_PORT: u16 = 28015;
pub const DEFAULT_USER: &str = "admin";
pub const DEFAULT_CONNECT_TIMEOUT_SECS: u64 = 20;

/// TLS settings, only honoured when built with the `tls` feature.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TlsOptions {
    /// Name checked against the server certificate (defaults to the host)
    #[serde(default)]
    pub domain: Option<String>,
    #[serde(default)]
    pub accept_invalid_certs: bool,
}

/// Everything needed to open (and later reopen) one connection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectOptions {
    #[serde(default = "default_host")]
    pub host: String,

    #[serde(default = "default_port")]
    pub port: u16,

    #[serde(default = "default_user")]
    pub user: String,

    #[serde(default)]
    pub password: String,

    /// Legacy single auth key, used as the password when none is set
    #[serde(default)]
    pub auth_key: Option<String>,

    /// Initial database passed to every query
    #[serde(default)]
    pub db: Option<String>,

    /// Connect + handshake deadline in seconds
    #[serde(default = "default_timeout")]
    pub timeout: u64,

    /// Keepalive period in seconds (disabled when unset)
    #[serde(default)]
    pub ping_interval: Option<u64>,

    #[serde(default)]
    pub tls: Option<TlsOptions>,
}

fn default_host() -> String {
    DEFAULT_HOST.to_string()
}

fn default_port() -> u16 {
    DEFAULT_PORT
}

fn default_user() -> String {
    DEFAULT_USER.to_string()
}

fn default_timeout() -> u64 {
    DEFAULT_CONNECT_TIMEOUT_SECS
}

impl Default for ConnectOptions {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            user: default_user(),
            password: String::new(),
            auth_key: None,
            db: None,
            timeout: default_timeout(),
            ping_interval: None,
            tls: None,
        }
    }
}

impl ConnectOptions {
    pub fn new(host: &str, port: u16) -> Self {
        Self {
            host: host.to_string(),
            port,
            ..Default::default()
        }
    }

    pub fn user(mut self, user: &str) -> Self {
        self.user = user.to_string();
        self
    }

    pub fn password(mut self, password: &str) -> Self {
        self.password = password.to_string();
        self
    }

    pub fn auth_key(mut self, key: &str) -> Self {
        self.auth_key = Some(key.to_string());
        self
    }

    pub fn db(mut self, db: &str) -> Self {
        self.db = Some(db.to_string());
        self
    }

    pub fn timeout_secs(mut self, secs: u64) -> Self {
        self.timeout = secs;
        self
    }

    pub fn ping_interval_secs(mut self, secs: u64) -> Self {
        self.ping_interval = Some(secs);
        self
    }

    pub fn tls(mut self, tls: TlsOptions) -> Self {
        self.tls = Some(tls);
        self
    }

    /// `host:port`, with IPv6 literals bracketed.
    pub fn address(&self) -> String {
        if self.host.contains(':') && !self.host.starts_with('[') {
            format!("[{}]:{}", self.host, self.port)
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }

    /// The secret used for SCRAM: the password, or the legacy auth key.
    pub fn effective_password(&self) -> &str {
        if self.password.is_empty() {
            self.auth_key.as_deref().unwrap_or("")
        } else {
            &self.password
        }
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.timeout)
    }

    pub fn ping_period(&self) -> Option<Duration> {
        self.ping_interval
            .filter(|secs| *secs > 0)
            .map(Duration::from_secs)
    }

    /// Load options from `REQL_*` environment variables (and a `.env` file).
    pub fn from_env() -> ReqlResult<Self> {
        let _ = dotenvy::dotenv();
        let mut options = Self::default();

        if let Ok(host) = std::env::var("REQL_HOST") {
            options.host = host;
        }
        if let Ok(port) = std::env::var("REQL_PORT") {
            options.port = parse_env("REQL_PORT", &port)?;
        }
        if let Ok(user) = std::env::var("REQL_USER") {
            options.user = user;
        }
        if let Ok(password) = std::env::var("REQL_PASSWORD") {
            options.password = password;
        }
        if let Ok(db) = std::env::var("REQL_DB") {
            options.db = Some(db);
        }
        if let Ok(timeout) = std::env::var("REQL_TIMEOUT") {
            options.timeout = parse_env("REQL_TIMEOUT", &timeout)?;
        }
        if let Ok(ping) = std::env::var("REQL_PING_INTERVAL") {
            options.ping_interval = Some(parse_env("REQL_PING_INTERVAL", &ping)?);
        }

        Ok(options)
    }
}

fn parse_env<T: std::str::FromStr>(name: &str, value: &str) -> ReqlResult<T> {
    value
        .trim()
        .parse()
        .map_err(|_| ReqlError::driver(format!("Invalid value for {}: {:?}", name, value)))
}

/// Per-query options understood by the response router.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueryOptions {
    /// Resolve sequences as a [`Cursor`](crate::Cursor) instead of an array
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cursor: Option<bool>,

    /// Resolve sequences as a [`RowStream`](crate::RowStream)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stream: Option<bool>,

    /// Fire and forget: resolve immediately, no response expected
    #[serde(default)]
    pub noreply: bool,

    /// Attach the server profile to the response
    #[serde(default)]
    pub profile: bool,
}

impl QueryOptions {
    pub fn cursor() -> Self {
        Self {
            cursor: Some(true),
            ..Default::default()
        }
    }

    pub fn stream() -> Self {
        Self {
            stream: Some(true),
            ..Default::default()
        }
    }

    pub fn noreply() -> Self {
        Self {
            noreply: true,
            ..Default::default()
        }
    }

    pub fn profiled(mut self) -> Self {
        self.profile = true;
        self
    }
}
