use serde::{Deserialize, Deserializer, Serialize};

use crate::models::error::{DecodeError, PublishError};

/// Placeholder used when a job field is absent.
pub const MISSING_FIELD: &str = "N/A";

/// A notification job as it travels through the queue.
///
/// Every field is optional on the wire. `type` and `user_email` are what the
/// handler needs to do anything useful, but a job lacking them still decodes;
/// the broker enforces nothing about the body. A field holding anything other
/// than a string decodes as absent.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EmailJob {
    #[serde(
        rename = "type",
        default,
        deserialize_with = "lenient_string",
        skip_serializing_if = "Option::is_none"
    )]
    pub job_type: Option<String>,

    #[serde(
        default,
        deserialize_with = "lenient_string",
        skip_serializing_if = "Option::is_none"
    )]
    pub user_email: Option<String>,

    #[serde(
        default,
        deserialize_with = "lenient_string",
        skip_serializing_if = "Option::is_none"
    )]
    pub user_name: Option<String>,

    #[serde(
        default,
        deserialize_with = "lenient_string",
        skip_serializing_if = "Option::is_none"
    )]
    pub subject: Option<String>,

    #[serde(
        default,
        deserialize_with = "lenient_string",
        skip_serializing_if = "Option::is_none"
    )]
    pub message: Option<String>,

    /// ISO-8601, stamped by the producer at publish time.
    #[serde(
        default,
        deserialize_with = "lenient_string",
        skip_serializing_if = "Option::is_none"
    )]
    pub timestamp: Option<String>,
}

impl EmailJob {
    pub fn new(job_type: impl Into<String>, user_email: impl Into<String>) -> Self {
        Self {
            job_type: Some(job_type.into()),
            user_email: Some(user_email.into()),
            ..Default::default()
        }
    }

    pub fn with_user_name(mut self, user_name: impl Into<String>) -> Self {
        self.user_name = Some(user_name.into());
        self
    }

    pub fn with_subject(mut self, subject: impl Into<String>) -> Self {
        self.subject = Some(subject.into());
        self
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }

    pub fn with_timestamp(mut self, timestamp: impl Into<String>) -> Self {
        self.timestamp = Some(timestamp.into());
        self
    }

    /// Fixed job published by the `/send-test-email` endpoint.
    pub fn test_sample() -> Self {
        Self::new("test_email", "test@example.com")
            .with_user_name("Test User")
            .with_subject("Test email")
            .with_message("This is a test message for the worker")
    }

    /// Decodes a message body. Anything that is not a UTF-8 JSON object with
    /// string (or null) fields is rejected.
    pub fn from_slice(body: &[u8]) -> Result<Self, DecodeError> {
        let value: serde_json::Value = serde_json::from_slice(body)?;

        if !value.is_object() {
            return Err(DecodeError::from(<serde_json::Error as serde::de::Error>::custom(
                "expected a JSON object",
            )));
        }

        Ok(serde_json::from_value(value)?)
    }

    pub fn to_vec(&self) -> Result<Vec<u8>, PublishError> {
        serde_json::to_vec(self).map_err(|e| PublishError::Serialization(e.to_string()))
    }

    pub fn job_type(&self) -> &str {
        field_or_placeholder(&self.job_type)
    }

    pub fn user_email(&self) -> &str {
        field_or_placeholder(&self.user_email)
    }

    pub fn user_name(&self) -> &str {
        field_or_placeholder(&self.user_name)
    }

    pub fn subject(&self) -> &str {
        field_or_placeholder(&self.subject)
    }
}

fn lenient_string<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    match serde_json::Value::deserialize(deserializer)? {
        serde_json::Value::String(value) => Ok(Some(value)),
        _ => Ok(None),
    }
}

fn field_or_placeholder(value: &Option<String>) -> &str {
    value.as_deref().unwrap_or(MISSING_FIELD)
}

/// Body accepted by `POST /notify`. All fields are required here even though
/// the queued job treats them as optional.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NotifyRequest {
    #[serde(rename = "type")]
    pub job_type: String,
    pub user_email: String,
    pub user_name: String,
    pub subject: String,
    pub message: String,
}

impl From<NotifyRequest> for EmailJob {
    fn from(request: NotifyRequest) -> Self {
        Self::new(request.job_type, request.user_email)
            .with_user_name(request.user_name)
            .with_subject(request.subject)
            .with_message(request.message)
    }
}
