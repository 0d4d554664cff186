use async_trait::async_trait;
use lettre::message::{Mailbox, MultiPart};
use lettre::transport::smtp::authentication::Credentials;
use lettre::{AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor};
use reqwest::header;
use tracing::info;
use uuid::Uuid;

use courier_common::message::NotificationRequest;

use crate::config::{HttpApiConfig, SmtpConfig};
use crate::error::DeliveryError;

/// Identifier assigned to a successful delivery, either by the provider or
/// minted locally when the provider does not return one.
pub type DeliveryId = String;

/// One fully-rendered outbound email, ready for a transport call.
///
/// Both body variants are always present: the transport decides how to use
/// them (SMTP sends a multipart alternative, API providers usually take
/// both fields).
#[derive(Debug, Clone)]
pub struct OutboundEmail {
    pub from: String,
    pub to: String,
    pub subject: String,
    pub html_body: String,
    pub text_body: String,
}

impl OutboundEmail {
    pub fn new(from: &str, request: &NotificationRequest) -> Self {
        Self {
            from: from.to_owned(),
            to: request.recipient().to_owned(),
            subject: request.subject().to_owned(),
            html_body: request.html_body(),
            text_body: request.text_body(),
        }
    }
}

/// The capability the pipeline requires from whatever email-sending
/// component is plugged in. Backends own their connection management; the
/// dispatcher retries the send call only, never connection setup.
#[async_trait]
pub trait MailBackend: Send + Sync {
    /// Send one email, returning the delivery identifier.
    async fn send(&self, email: &OutboundEmail) -> Result<DeliveryId, DeliveryError>;

    /// Reachability probe, called once when the pipeline starts. Backends
    /// without a cheap probe can leave the default.
    async fn verify(&self) -> Result<(), DeliveryError> {
        Ok(())
    }
}

/// SMTP-like backend over a pooled lettre transport.
pub struct SmtpBackend {
    transport: AsyncSmtpTransport<Tokio1Executor>,
}

impl SmtpBackend {
    pub fn new(config: &SmtpConfig) -> Result<Self, DeliveryError> {
        let mut builder = AsyncSmtpTransport::<Tokio1Executor>::starttls_relay(&config.host)
            .map_err(|e| DeliveryError::Backend(e.to_string()))?
            .port(config.port);

        if let (Some(username), Some(password)) = (&config.username, &config.password) {
            builder = builder.credentials(Credentials::new(username.clone(), password.clone()));
        }

        Ok(Self {
            transport: builder.build(),
        })
    }
}

#[async_trait]
impl MailBackend for SmtpBackend {
    async fn send(&self, email: &OutboundEmail) -> Result<DeliveryId, DeliveryError> {
        let from: Mailbox = email
            .from
            .parse()
            .map_err(|e| DeliveryError::Backend(format!("invalid sender address: {}", e)))?;
        let to: Mailbox = email
            .to
            .parse()
            .map_err(|e| DeliveryError::Backend(format!("invalid recipient address: {}", e)))?;

        let message = Message::builder()
            .from(from)
            .to(to)
            .subject(email.subject.clone())
            .multipart(MultiPart::alternative_plain_html(
                email.text_body.clone(),
                email.html_body.clone(),
            ))
            .map_err(|e| DeliveryError::Backend(e.to_string()))?;

        let response = self
            .transport
            .send(message)
            .await
            .map_err(|e| DeliveryError::Backend(e.to_string()))?;

        // Most servers include a queue id in the 250 response; fall back to
        // a local id when they don't.
        let server_message = response.message().collect::<Vec<_>>().join(" ");
        if server_message.is_empty() {
            Ok(Uuid::now_v7().to_string())
        } else {
            Ok(server_message)
        }
    }

    async fn verify(&self) -> Result<(), DeliveryError> {
        let reachable = self
            .transport
            .test_connection()
            .await
            .map_err(|e| DeliveryError::Backend(e.to_string()))?;

        if reachable {
            Ok(())
        } else {
            Err(DeliveryError::Backend(
                "SMTP server did not accept the connection".to_owned(),
            ))
        }
    }
}

/// API-like backend posting JSON to a provider endpoint.
pub struct HttpApiBackend {
    client: reqwest::Client,
    endpoint: String,
}

impl HttpApiBackend {
    pub fn new(config: &HttpApiConfig) -> Result<Self, DeliveryError> {
        let endpoint = config
            .endpoint
            .clone()
            .ok_or_else(|| DeliveryError::Backend("API_ENDPOINT is not set".to_owned()))?;

        let mut headers = header::HeaderMap::new();
        headers.insert(
            header::CONTENT_TYPE,
            header::HeaderValue::from_static("application/json"),
        );
        if let Some(key) = &config.key {
            let value = header::HeaderValue::from_str(&format!("Bearer {}", key))
                .map_err(|e| DeliveryError::Backend(e.to_string()))?;
            headers.insert(header::AUTHORIZATION, value);
        }

        let client = reqwest::Client::builder()
            .default_headers(headers)
            .user_agent("Courier Worker")
            .build()
            .map_err(|e| DeliveryError::Backend(e.to_string()))?;

        Ok(Self { client, endpoint })
    }
}

#[async_trait]
impl MailBackend for HttpApiBackend {
    async fn send(&self, email: &OutboundEmail) -> Result<DeliveryId, DeliveryError> {
        let body = serde_json::json!({
            "from": email.from,
            "to": email.to,
            "subject": email.subject,
            "html": email.html_body,
            "text": email.text_body,
        });

        let response = self
            .client
            .post(&self.endpoint)
            .json(&body)
            .send()
            .await
            .map_err(|e| DeliveryError::Backend(e.to_string()))?
            .error_for_status()
            .map_err(|e| DeliveryError::Backend(e.to_string()))?;

        let body: serde_json::Value = response.json().await.unwrap_or_default();
        let delivery_id = body
            .get("id")
            .and_then(serde_json::Value::as_str)
            .map(str::to_owned)
            .unwrap_or_else(|| Uuid::now_v7().to_string());

        Ok(delivery_id)
    }
}

/// Log-and-succeed backend for development runs and tests.
#[derive(Default)]
pub struct PrintBackend {}

#[async_trait]
impl MailBackend for PrintBackend {
    async fn send(&self, email: &OutboundEmail) -> Result<DeliveryId, DeliveryError> {
        info!(
            to = email.to,
            subject = email.subject,
            "print backend: pretending to deliver email"
        );
        Ok(Uuid::now_v7().to_string())
    }
}
