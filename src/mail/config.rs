//! IMAP Connection Configuration

use super::{MailError, MailResult};
use serde::{Deserialize, Serialize};
use zeroize::Zeroize;

pub const ENV_IMAP_HOST: &str = "SWEEP_IMAP_HOST";
pub const ENV_IMAP_PORT: &str = "SWEEP_IMAP_PORT";
pub const ENV_IMAP_USER: &str = "SWEEP_IMAP_USER";
pub const ENV_IMAP_PASS: &str = "SWEEP_IMAP_PASS";
pub const ENV_IMAP_ACCEPT_INVALID_CERTS: &str = "SWEEP_IMAP_ACCEPT_INVALID_CERTS";

/// Implicit TLS port
pub const DEFAULT_IMAP_PORT: u16 = 993;

/// IMAP server configuration
#[derive(Clone, Serialize, Deserialize)]
pub struct ImapConfig {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub password: String,
    #[serde(default)]
    pub accept_invalid_certs: bool,
}

impl Default for ImapConfig {
    fn default() -> Self {
        Self {
            host: String::new(),
            port: DEFAULT_IMAP_PORT,
            username: String::new(),
            password: String::new(),
            accept_invalid_certs: false, // Secure by default
        }
    }
}

// Keep the password out of logs
impl std::fmt::Debug for ImapConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ImapConfig")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("username", &self.username)
            .field("password", &"***")
            .field("accept_invalid_certs", &self.accept_invalid_certs)
            .finish()
    }
}

impl Drop for ImapConfig {
    fn drop(&mut self) {
        self.password.zeroize();
    }
}

impl ImapConfig {
    pub fn builder() -> ImapConfigBuilder {
        ImapConfigBuilder::default()
    }

    /// `host:port` pair used to dial the server
    pub fn address(&self) -> String {
        format!("{}:{}", self.host.trim(), self.port)
    }

    /// Check that everything needed to dial and log in is present.
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();

        if self.host.trim().is_empty() {
            errors.push("IMAP host is required".to_string());
        }
        if self.port == 0 {
            errors.push("IMAP port must be non-zero".to_string());
        }
        if self.username.trim().is_empty() {
            errors.push("IMAP username is required".to_string());
        }
        if self.password.trim().is_empty() {
            errors.push("IMAP password is required".to_string());
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }

    /// Load connection details from `SWEEP_IMAP_*` environment variables.
    pub fn from_env() -> MailResult<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> MailResult<Self> {
        let mut builder = Self::builder();

        if let Some(host) = lookup(ENV_IMAP_HOST) {
            builder = builder.host(host);
        }
        if let Some(raw) = lookup(ENV_IMAP_PORT).filter(|raw| !raw.trim().is_empty()) {
            let port = raw.trim().parse::<u16>().map_err(|e| {
                MailError::Config(format!("invalid {}: {}", ENV_IMAP_PORT, e))
            })?;
            builder = builder.port(port);
        }
        builder = builder.credentials(
            lookup(ENV_IMAP_USER).unwrap_or_default(),
            lookup(ENV_IMAP_PASS).unwrap_or_default(),
        );
        if let Some(raw) = lookup(ENV_IMAP_ACCEPT_INVALID_CERTS) {
            let accept = matches!(raw.trim().to_lowercase().as_str(), "1" | "true" | "yes");
            builder = builder.accept_invalid_certs(accept);
        }

        builder.build()
    }
}

/// Builder that validates required connection fields once
#[derive(Debug, Default)]
pub struct ImapConfigBuilder {
    host: Option<String>,
    port: Option<u16>,
    username: Option<String>,
    password: Option<String>,
    accept_invalid_certs: bool,
}

impl ImapConfigBuilder {
    pub fn host(mut self, host: impl Into<String>) -> Self {
        self.host = Some(host.into());
        self
    }

    pub fn port(mut self, port: u16) -> Self {
        self.port = Some(port);
        self
    }

    pub fn credentials(mut self, username: impl Into<String>, password: impl Into<String>) -> Self {
        self.username = Some(username.into());
        self.password = Some(password.into());
        self
    }

    pub fn accept_invalid_certs(mut self, accept: bool) -> Self {
        self.accept_invalid_certs = accept;
        self
    }

    pub fn build(self) -> MailResult<ImapConfig> {
        let config = ImapConfig {
            host: self.host.map(|h| h.trim().to_string()).unwrap_or_default(),
            port: self.port.unwrap_or(DEFAULT_IMAP_PORT),
            username: self.username.map(|u| u.trim().to_string()).unwrap_or_default(),
            password: self.password.unwrap_or_default(),
            accept_invalid_certs: self.accept_invalid_certs,
        };

        config
            .validate()
            .map_err(|errors| MailError::Config(errors.join(", ")))?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_builder_defaults_port() {
        let config = ImapConfig::builder()
            .host("imap.example.com")
            .credentials("user@example.com", "secret")
            .build()
            .unwrap();

        assert_eq!(config.port, 993);
        assert_eq!(config.address(), "imap.example.com:993");
        assert!(!config.accept_invalid_certs);
    }

    #[test]
    fn test_builder_reports_every_missing_field() {
        let err = ImapConfig::builder().build().unwrap_err();
        let message = err.to_string();

        assert!(matches!(err, MailError::Config(_)));
        assert!(message.contains("host"));
        assert!(message.contains("username"));
        assert!(message.contains("password"));
    }

    #[test]
    fn test_from_lookup_parses_port_and_flags() {
        let env: HashMap<&str, &str> = [
            (ENV_IMAP_HOST, "mail.example.org"),
            (ENV_IMAP_PORT, "1993"),
            (ENV_IMAP_USER, "me"),
            (ENV_IMAP_PASS, "pw"),
            (ENV_IMAP_ACCEPT_INVALID_CERTS, "true"),
        ]
        .into_iter()
        .collect();

        let config = ImapConfig::from_lookup(|key| env.get(key).map(|v| v.to_string())).unwrap();
        assert_eq!(config.port, 1993);
        assert!(config.accept_invalid_certs);
    }

    #[test]
    fn test_from_lookup_rejects_bad_port() {
        let result = ImapConfig::from_lookup(|key| match key {
            ENV_IMAP_PORT => Some("imap".to_string()),
            _ => Some("x".to_string()),
        });
        assert!(matches!(result, Err(MailError::Config(_))));
    }

    #[test]
    fn test_debug_hides_password() {
        let mut config = ImapConfig::default();
        config.password = "hunter2".to_string();
        assert!(!format!("{:?}", config).contains("hunter2"));
    }
}
