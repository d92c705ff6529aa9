//! Session configuration.
//!
//! With the `serde_derive` feature both structs can be loaded from any serde
//! format.

use crate::utils;
use std::path::PathBuf;
use std::time::Duration;

pub const POP3_PORT: u16 = 110;
pub const SMTP_PORT: u16 = 25;

#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(
    feature = "serde_derive",
    derive(serde::Serialize, serde::Deserialize),
    serde(default)
)]
pub struct Pop3Config {
    pub host: String,
    pub port: u16,
    /// Read timeout in milliseconds, 0 for none.
    pub timeout_ms: u64,
    /// Directory attachments of retrieved messages are saved into.
    pub attachment_dir: PathBuf,
}

impl Pop3Config {
    pub fn new(host: &str) -> Pop3Config {
        Pop3Config {
            host: host.to_string(),
            ..Pop3Config::default()
        }
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

impl Default for Pop3Config {
    fn default() -> Pop3Config {
        Pop3Config {
            host: "localhost".to_string(),
            port: POP3_PORT,
            timeout_ms: 10_000,
            attachment_dir: utils::system_temp_dir(),
        }
    }
}

/// SMTP authentication mechanism used after EHLO.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde_derive", derive(serde::Serialize, serde::Deserialize))]
pub enum AuthType {
    None,
    Plain,
    Login,
}

impl Default for AuthType {
    fn default() -> AuthType {
        AuthType::None
    }
}

#[derive(Clone, PartialEq, Eq)]
#[cfg_attr(
    feature = "serde_derive",
    derive(serde::Serialize, serde::Deserialize),
    serde(default)
)]
pub struct SmtpConfig {
    pub host: String,
    pub port: u16,
    /// Read timeout in milliseconds, 0 for none.
    pub timeout_ms: u64,
    /// Name announced in HELO/EHLO. Falls back to the domain of the From
    /// address, then to "localhost".
    pub sender_host: Option<String>,
    /// Value of the X-Mailer header, omitted when `None`.
    pub mailer: Option<String>,
    /// Charset declared for the text body.
    pub charset: String,
    pub auth: AuthType,
    pub username: Option<String>,
    pub password: Option<String>,
}

impl SmtpConfig {
    pub fn new(host: &str) -> SmtpConfig {
        SmtpConfig {
            host: host.to_string(),
            ..SmtpConfig::default()
        }
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    /// Whether the session should EHLO and authenticate.
    pub fn wants_auth(&self) -> bool {
        self.auth != AuthType::None && self.username.is_some() && self.password.is_some()
    }
}

impl Default for SmtpConfig {
    fn default() -> SmtpConfig {
        SmtpConfig {
            host: "localhost".to_string(),
            port: SMTP_PORT,
            timeout_ms: 20_000,
            sender_host: None,
            mailer: Some(format!("mailclient-rs/{}", env!("CARGO_PKG_VERSION"))),
            charset: "us-ascii".to_string(),
            auth: AuthType::None,
            username: None,
            password: None,
        }
    }
}

impl std::fmt::Debug for SmtpConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SmtpConfig")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("timeout_ms", &self.timeout_ms)
            .field("sender_host", &self.sender_host)
            .field("mailer", &self.mailer)
            .field("charset", &self.charset)
            .field("auth", &self.auth)
            .field("username", &self.username)
            .field("password", &self.password.as_ref().map(|_| "********"))
            .finish()
    }
}
