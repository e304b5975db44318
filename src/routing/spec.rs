use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{BuckError, Result};
use crate::scheduler::job::DEFAULT_CHANNEL;

pub const DEFAULT_HOST: &str = "127.0.0.1";

fn default_host() -> String {
    DEFAULT_HOST.to_string()
}

fn default_channels() -> Vec<String> {
    vec![DEFAULT_CHANNEL.to_string()]
}

/// Address and channel memberships of one supervisor.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DeskSpec {
    #[serde(default = "default_host")]
    pub host: String,
    pub port: u16,
    #[serde(default = "default_channels")]
    pub channels: Vec<String>,
}

impl DeskSpec {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            channels: default_channels(),
        }
    }

    /// Loopback desk on `port`.
    pub fn local(port: u16) -> Self {
        Self::new(DEFAULT_HOST, port)
    }

    pub fn with_channels<S: Into<String>>(mut self, channels: impl IntoIterator<Item = S>) -> Self {
        self.channels = channels.into_iter().map(Into::into).collect();
        if self.channels.is_empty() {
            self.channels = default_channels();
        }
        self
    }

    /// `host:port`, the key sockets are cached under.
    pub fn endpoint(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Routing target key for this desk in `channel`.
    pub fn target(&self, channel: &str) -> String {
        format!("{}/{}", self.endpoint(), channel)
    }

    /// Parse any accepted form: a port number, `host:port[/ch1,ch2]`, or a
    /// JSON object.
    pub fn from_value(value: &Value) -> Result<Self> {
        match value {
            Value::Number(n) => {
                let port = n
                    .as_u64()
                    .and_then(|p| u16::try_from(p).ok())
                    .ok_or_else(|| BuckError::InvalidDeskSpec(format!("bad port: {}", n)))?;
                Self::local(port).validated()
            }
            Value::String(s) => s.parse(),
            Value::Object(_) => {
                let spec: DeskSpec = serde_json::from_value(value.clone())
                    .map_err(|e| BuckError::InvalidDeskSpec(e.to_string()))?;
                spec.with_channels_or_default().validated()
            }
            other => Err(BuckError::InvalidDeskSpec(other.to_string())),
        }
    }

    fn with_channels_or_default(mut self) -> Self {
        if self.channels.is_empty() {
            self.channels = default_channels();
        }
        self
    }

    fn validated(self) -> Result<Self> {
        if self.port == 0 {
            return Err(BuckError::InvalidDeskSpec(format!(
                "{}: port 0 cannot be routed to",
                self.endpoint()
            )));
        }
        if self.host.is_empty() {
            return Err(BuckError::InvalidDeskSpec("empty host".to_string()));
        }
        if self.channels.iter().any(|c| c.is_empty()) {
            return Err(BuckError::InvalidDeskSpec(format!(
                "{}: empty channel name",
                self.endpoint()
            )));
        }
        Ok(self)
    }
}

impl FromStr for DeskSpec {
    type Err = BuckError;

    fn from_str(s: &str) -> Result<Self> {
        let s = s.trim();
        if s.starts_with('{') {
            let value: Value =
                serde_json::from_str(s).map_err(|e| BuckError::InvalidDeskSpec(e.to_string()))?;
            return Self::from_value(&value);
        }
        if let Ok(port) = s.parse::<u16>() {
            return Self::local(port).validated();
        }

        let (address, channels) = match s.split_once('/') {
            Some((address, channels)) => (address, Some(channels)),
            None => (s, None),
        };
        let (host, port) = address
            .rsplit_once(':')
            .ok_or_else(|| BuckError::InvalidDeskSpec(format!("expected host:port, got {:?}", s)))?;
        let port: u16 = port
            .parse()
            .map_err(|_| BuckError::InvalidDeskSpec(format!("bad port in {:?}", s)))?;
        let host = if host.is_empty() { DEFAULT_HOST } else { host };

        let mut spec = DeskSpec::new(host, port);
        if let Some(channels) = channels {
            spec = spec.with_channels(channels.split(',').map(str::trim));
        }
        spec.validated()
    }
}

impl fmt::Display for DeskSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.endpoint(), self.channels.join(","))
    }
}
