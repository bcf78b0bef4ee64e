//! Configuration types, loaded from the environment.

use std::str::FromStr;
use std::time::Duration;

use crate::error::ConfigError;

/// Complete daemon configuration.
#[derive(Debug, Clone)]
pub struct Config {
    pub listener: ListenerConfig,
    pub forwarder: ForwarderConfig,
}

/// Inbound SMTP listener.
#[derive(Debug, Clone)]
pub struct ListenerConfig {
    /// `host:port` to bind; a bare `:port` binds every interface.
    pub addr: String,
    /// Name announced in the greeting and EHLO reply.
    pub domain: String,
    pub read_timeout: Duration,
    pub write_timeout: Duration,
    pub max_message_bytes: usize,
    pub max_recipients: usize,
}

impl ListenerConfig {
    /// Listener defaults for `domain`.
    pub fn new(domain: impl Into<String>) -> Self {
        Self {
            addr: "0.0.0.0:25".to_string(),
            domain: domain.into(),
            read_timeout: Duration::from_secs(10),
            write_timeout: Duration::from_secs(10),
            max_message_bytes: 1024 * 1024,
            max_recipients: 50,
        }
    }
}

/// How the relay connection is secured.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum RelayTls {
    /// TLS from the first byte (submissions, port 465).
    #[default]
    Implicit,
    /// Plain connect upgraded with a mandatory STARTTLS.
    StartTls,
}

impl FromStr for RelayTls {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "implicit" | "tls" | "smtps" => Ok(Self::Implicit),
            "starttls" => Ok(Self::StartTls),
            other => Err(format!("expected `implicit` or `starttls`, got `{other}`")),
        }
    }
}

#[derive(Debug, Clone)]
pub struct RelayCredentials {
    pub username: String,
    pub password: secrecy::SecretString,
}

/// Outbound relay for messages that could not be analyzed.
#[derive(Debug, Clone)]
pub struct ForwarderConfig {
    pub host: String,
    pub port: u16,
    pub tls: RelayTls,
    pub credentials: Option<RelayCredentials>,
    /// Envelope sender of forwarded messages.
    pub from: String,
    /// Fallback mailboxes.
    pub to: Vec<String>,
    pub timeout: Duration,
}

impl Config {
    /// Build config from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build config from an arbitrary key lookup. Empty values count as unset.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| {
            lookup(key)
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };
        let require = |key: &str, hint: &str| {
            get(key).ok_or_else(|| ConfigError::MissingRequired {
                key: key.to_string(),
                hint: hint.to_string(),
            })
        };

        let mut listener = ListenerConfig::new(require(
            "LISTENER_DOMAIN",
            "Set it to the host name this server answers for, e.g. dmarc.example.com",
        )?);
        if let Some(addr) = get("LISTENER_ADDR") {
            listener.addr = listen_addr(&addr)?;
        }
        if let Some(secs) = parse::<u64>(&get, "LISTENER_READ_TIMEOUT_SECS")? {
            listener.read_timeout = Duration::from_secs(secs);
        }
        if let Some(secs) = parse::<u64>(&get, "LISTENER_WRITE_TIMEOUT_SECS")? {
            listener.write_timeout = Duration::from_secs(secs);
        }
        if let Some(bytes) = parse(&get, "LISTENER_MAX_MESSAGE_BYTES")? {
            listener.max_message_bytes = bytes;
        }
        if let Some(n) = parse(&get, "LISTENER_MAX_RECIPIENTS")? {
            listener.max_recipients = n;
        }

        let (host, port) = host_port(&require(
            "FORWARDER_ADDR",
            "Set it to the relay's host:port, e.g. smtp.example.com:465",
        )?)?;

        let username = get("FORWARDER_USERNAME");
        let password = get("FORWARDER_PASSWORD");
        let credentials = (username.is_some() || password.is_some()).then(|| RelayCredentials {
            username: username.unwrap_or_default(),
            password: secrecy::SecretString::from(password.unwrap_or_default()),
        });

        let to: Vec<String> = require(
            "FORWARDER_TO",
            "Set it to a comma separated list of fallback mailboxes",
        )?
        .split(',')
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect();
        if to.is_empty() {
            return Err(ConfigError::InvalidValue {
                key: "FORWARDER_TO".into(),
                message: "at least one recipient is required".into(),
            });
        }

        let forwarder = ForwarderConfig {
            host,
            port,
            tls: parse(&get, "FORWARDER_TLS")?.unwrap_or_default(),
            credentials,
            from: require("FORWARDER_FROM", "Set it to the envelope sender for forwarded mail")?,
            to,
            timeout: Duration::from_secs(parse(&get, "FORWARDER_TIMEOUT_SECS")?.unwrap_or(5)),
        };

        Ok(Self {
            listener,
            forwarder,
        })
    }
}

fn parse<T>(get: &impl Fn(&str) -> Option<String>, key: &str) -> Result<Option<T>, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    get(key)
        .map(|raw| {
            raw.parse().map_err(|e: T::Err| ConfigError::InvalidValue {
                key: key.to_string(),
                message: e.to_string(),
            })
        })
        .transpose()
}

fn listen_addr(raw: &str) -> Result<String, ConfigError> {
    let (host, port) = raw.rsplit_once(':').ok_or_else(|| ConfigError::InvalidValue {
        key: "LISTENER_ADDR".into(),
        message: format!("expected host:port, got `{raw}`"),
    })?;
    port.parse::<u16>().map_err(|e| ConfigError::InvalidValue {
        key: "LISTENER_ADDR".into(),
        message: format!("invalid port `{port}`: {e}"),
    })?;
    let host = if host.is_empty() { "0.0.0.0" } else { host };
    Ok(format!("{host}:{port}"))
}

fn host_port(raw: &str) -> Result<(String, u16), ConfigError> {
    let invalid = |message: String| ConfigError::InvalidValue {
        key: "FORWARDER_ADDR".into(),
        message,
    };
    let (host, port) = raw
        .rsplit_once(':')
        .ok_or_else(|| invalid(format!("expected host:port, got `{raw}`")))?;
    let host = host.trim_start_matches('[').trim_end_matches(']');
    if host.is_empty() {
        return Err(invalid("missing host".into()));
    }
    let port = port
        .parse()
        .map_err(|e| invalid(format!("invalid port `{port}`: {e}")))?;
    Ok((host.to_string(), port))
}
