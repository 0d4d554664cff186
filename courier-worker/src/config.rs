use std::str::FromStr;
use std::time;

use envconfig::Envconfig;

#[derive(Envconfig, Clone)]
pub struct Config {
    #[envconfig(from = "BIND_HOST", default = "0.0.0.0")]
    pub host: String,

    #[envconfig(from = "BIND_PORT", default = "3301")]
    pub port: u16,

    #[envconfig(default = "localhost:9092")]
    pub kafka_hosts: String,

    #[envconfig(default = "email_notifications")]
    pub kafka_topic: NonEmptyString,

    #[envconfig(default = "courier-worker")]
    pub kafka_consumer_group: NonEmptyString,

    #[envconfig(default = "false")]
    pub kafka_tls: bool,

    /// Sender address stamped on every outbound email. Required.
    pub from_address: NonEmptyString,

    #[envconfig(default = "smtp")]
    pub backend: BackendKind,

    #[envconfig(default = "3")]
    pub max_attempts: u32,

    #[envconfig(default = "30000")]
    pub attempt_timeout: EnvMsDuration,

    #[envconfig(default = "1000")]
    pub retry_base_interval: EnvMsDuration,

    pub retry_maximum_interval: Option<EnvMsDuration>,

    #[envconfig(nested = true)]
    pub smtp: SmtpConfig,

    #[envconfig(nested = true)]
    pub api: HttpApiConfig,
}

impl Config {
    /// Produce a host:port address for binding a TcpListener.
    pub fn bind(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

#[derive(Envconfig, Clone)]
pub struct SmtpConfig {
    #[envconfig(from = "SMTP_HOST", default = "localhost")]
    pub host: String,

    #[envconfig(from = "SMTP_PORT", default = "587")]
    pub port: u16,

    #[envconfig(from = "SMTP_USERNAME")]
    pub username: Option<String>,

    #[envconfig(from = "SMTP_PASSWORD")]
    pub password: Option<String>,
}

#[derive(Envconfig, Clone)]
pub struct HttpApiConfig {
    #[envconfig(from = "API_ENDPOINT")]
    pub endpoint: Option<String>,

    #[envconfig(from = "API_KEY")]
    pub key: Option<String>,
}

/// Which delivery backend implementation to plug into the dispatcher.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendKind {
    Smtp,
    HttpApi,
    Print,
}

#[derive(Debug, PartialEq, Eq)]
pub struct ParseBackendKindError(pub String);

impl FromStr for BackendKind {
    type Err = ParseBackendKindError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_ref() {
            "smtp" => Ok(BackendKind::Smtp),
            "api" | "http" => Ok(BackendKind::HttpApi),
            "print" => Ok(BackendKind::Print),
            invalid => Err(ParseBackendKindError(invalid.to_owned())),
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct EnvMsDuration(pub time::Duration);

#[derive(Debug, PartialEq, Eq)]
pub struct ParseEnvMsDurationError;

impl FromStr for EnvMsDuration {
    type Err = ParseEnvMsDurationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let ms = s.parse::<u64>().map_err(|_| ParseEnvMsDurationError)?;

        Ok(EnvMsDuration(time::Duration::from_millis(ms)))
    }
}

#[derive(Debug, Clone)]
pub struct NonEmptyString(pub String);

impl NonEmptyString {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

#[derive(Debug, PartialEq, Eq)]
pub struct StringIsEmptyError;

impl FromStr for NonEmptyString {
    type Err = StringIsEmptyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.is_empty() {
            Err(StringIsEmptyError)
        } else {
            Ok(NonEmptyString(s.to_owned()))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_backend_kind() {
        assert_eq!("smtp".parse(), Ok(BackendKind::Smtp));
        assert_eq!("API".parse(), Ok(BackendKind::HttpApi));
        assert_eq!("http".parse(), Ok(BackendKind::HttpApi));
        assert_eq!("print".parse(), Ok(BackendKind::Print));
        assert_eq!(
            "carrier-pigeon".parse::<BackendKind>(),
            Err(ParseBackendKindError("carrier-pigeon".to_owned()))
        );
    }

    #[test]
    fn parse_ms_duration() {
        let parsed: EnvMsDuration = "1500".parse().unwrap();
        assert_eq!(parsed.0, time::Duration::from_millis(1500));
        assert!("nope".parse::<EnvMsDuration>().is_err());
    }
}
