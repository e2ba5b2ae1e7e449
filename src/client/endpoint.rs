//! Broker endpoint
//!
//! Identifies the broker and the credentials to present. Immutable once
//! built; the password is kept out of `Debug` and `Display` output.

use std::fmt;
use std::path::{Path, PathBuf};

use lapin::uri::{AMQPAuthority, AMQPQueryString, AMQPScheme, AMQPUri, AMQPUserInfo};

use crate::config::BrokerSettings;

#[derive(Clone, PartialEq, Eq)]
pub struct BrokerEndpoint {
    login: String,
    password: String,
    host: String,
    port: u16,
    virtual_host: String,
    tls_enabled: bool,
    ca_cert_path: Option<PathBuf>,
}

impl BrokerEndpoint {
    pub fn new(
        login: impl Into<String>,
        password: impl Into<String>,
        host: impl Into<String>,
        port: u16,
        virtual_host: impl Into<String>,
    ) -> Self {
        Self {
            login: login.into(),
            password: password.into(),
            host: host.into(),
            port,
            virtual_host: virtual_host.into(),
            tls_enabled: false,
            ca_cert_path: None,
        }
    }

    /// Require TLS, verifying the broker against `ca_cert_path` (or the
    /// platform roots when `None`).
    pub fn with_tls(mut self, ca_cert_path: Option<PathBuf>) -> Self {
        self.tls_enabled = true;
        self.ca_cert_path = ca_cert_path;
        self
    }

    pub fn login(&self) -> &str {
        &self.login
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn virtual_host(&self) -> &str {
        &self.virtual_host
    }

    pub fn tls_enabled(&self) -> bool {
        self.tls_enabled
    }

    pub fn ca_cert_path(&self) -> Option<&Path> {
        self.ca_cert_path.as_deref()
    }

    /// Structured AMQP URI, so credentials and vhost need no escaping.
    pub fn amqp_uri(&self) -> AMQPUri {
        AMQPUri {
            scheme: if self.tls_enabled {
                AMQPScheme::AMQPS
            } else {
                AMQPScheme::AMQP
            },
            authority: AMQPAuthority {
                userinfo: AMQPUserInfo {
                    username: self.login.clone(),
                    password: self.password.clone(),
                },
                host: self.host.clone(),
                port: self.port,
            },
            vhost: self.virtual_host.clone(),
            query: AMQPQueryString::default(),
        }
    }
}

impl From<&BrokerSettings> for BrokerEndpoint {
    fn from(settings: &BrokerSettings) -> Self {
        let endpoint = BrokerEndpoint::new(
            settings.login.clone(),
            settings.password.clone(),
            settings.host.clone(),
            settings.port,
            settings.virtual_host.clone(),
        );
        if settings.ssl {
            endpoint.with_tls(settings.ca_certs.clone())
        } else {
            endpoint
        }
    }
}

impl fmt::Display for BrokerEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let scheme = if self.tls_enabled { "amqps" } else { "amqp" };
        write!(
            f,
            "{scheme}://{}@{}:{}/{}",
            self.login, self.host, self.port, self.virtual_host
        )
    }
}

impl fmt::Debug for BrokerEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BrokerEndpoint")
            .field("login", &self.login)
            .field("password", &"***")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("virtual_host", &self.virtual_host)
            .field("tls_enabled", &self.tls_enabled)
            .field("ca_cert_path", &self.ca_cert_path)
            .finish()
    }
}
