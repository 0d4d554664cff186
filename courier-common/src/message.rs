use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::Value;
use thiserror::Error;

/// Field names of the inbound notification wire format:
/// `{ "to": "...", "subject": "...", "message": "..." }`.
/// Unknown extra fields are ignored, not rejected.
pub const RECIPIENT_FIELD: &str = "to";
pub const SUBJECT_FIELD: &str = "subject";
pub const BODY_FIELD: &str = "message";

/// A syntactic sanity check for the recipient, not full RFC validation:
/// something before an "@", something after, with a dot in the domain part.
/// No DNS or mailbox verification happens anywhere in the pipeline.
static ADDRESS_SHAPE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[^\s@]+@[^\s@]+\.[^\s@]+$").expect("invalid address regex"));

static HTML_TAG: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"<[^>]+>").expect("invalid html tag regex"));

/// Enumeration of reasons a decoded message can fail validation.
/// The field name is preserved for logging.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    #[error("required field '{0}' is missing")]
    MissingField(&'static str),
    #[error("field '{0}' must be a string")]
    WrongType(&'static str),
    #[error("field '{0}' must not be empty")]
    EmptyField(&'static str),
    #[error("field 'to' does not look like an email address")]
    InvalidAddressFormat,
}

impl ValidationError {
    /// The wire field this error refers to.
    pub fn field(&self) -> &'static str {
        match self {
            ValidationError::MissingField(field)
            | ValidationError::WrongType(field)
            | ValidationError::EmptyField(field) => field,
            ValidationError::InvalidAddressFormat => RECIPIENT_FIELD,
        }
    }
}

/// A validated outbound-email command.
///
/// Invariant: a `NotificationRequest` that exists has already passed
/// validation. It is constructed once per record and never mutated.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NotificationRequest {
    recipient: String,
    subject: String,
    body: String,
}

impl NotificationRequest {
    /// Validate a decoded message body and construct the request.
    ///
    /// Rules apply in order, first failure wins:
    /// 1. `to`, `subject` and `message` are present and are strings,
    /// 2. each is non-empty after trimming surrounding whitespace,
    /// 3. `to` matches the address shape check.
    pub fn from_value(value: &Value) -> Result<Self, ValidationError> {
        let recipient = string_field(value, RECIPIENT_FIELD)?;
        let subject = string_field(value, SUBJECT_FIELD)?;
        let body = string_field(value, BODY_FIELD)?;

        let recipient = non_empty(recipient, RECIPIENT_FIELD)?;
        let subject = non_empty(subject, SUBJECT_FIELD)?;
        let body = non_empty(body, BODY_FIELD)?;

        if !ADDRESS_SHAPE.is_match(recipient) {
            return Err(ValidationError::InvalidAddressFormat);
        }

        Ok(Self {
            recipient: recipient.to_owned(),
            subject: subject.to_owned(),
            body: body.to_owned(),
        })
    }

    pub fn recipient(&self) -> &str {
        &self.recipient
    }

    pub fn subject(&self) -> &str {
        &self.subject
    }

    pub fn body(&self) -> &str {
        &self.body
    }

    /// Whether the body contains an HTML tag pattern.
    pub fn is_html(&self) -> bool {
        HTML_TAG.is_match(&self.body)
    }

    /// The HTML variant of the body: as-is for HTML content, otherwise the
    /// plaintext with newlines converted to `<br>`.
    pub fn html_body(&self) -> String {
        if self.is_html() {
            self.body.clone()
        } else {
            self.body.replace('\n', "<br>")
        }
    }

    /// The plaintext variant of the body: as-is for plaintext content,
    /// otherwise the HTML with tags stripped.
    pub fn text_body(&self) -> String {
        if self.is_html() {
            HTML_TAG.replace_all(&self.body, "").into_owned()
        } else {
            self.body.clone()
        }
    }
}

fn string_field<'a>(value: &'a Value, field: &'static str) -> Result<&'a str, ValidationError> {
    match value.get(field) {
        None => Err(ValidationError::MissingField(field)),
        Some(Value::String(s)) => Ok(s),
        Some(_) => Err(ValidationError::WrongType(field)),
    }
}

fn non_empty<'a>(value: &'a str, field: &'static str) -> Result<&'a str, ValidationError> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        Err(ValidationError::EmptyField(field))
    } else {
        Ok(trimmed)
    }
}
