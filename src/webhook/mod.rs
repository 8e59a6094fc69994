use crate::config::Config;
use crate::email::ParsedEmail;
use crate::http::{self, HttpClient};
use crate::pipeline::Deliverer;
use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use hyper::StatusCode;
use log::{error, info};
use serde::{Serialize, Serializer};

// --- Public data structures ---

/// JSON document posted to the webhook for every delivered email.
///
/// Missing optional values are left out of the document rather than sent as `null`.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct DeliveryPayload {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub subject: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    pub message: String,
    pub source: &'static str,
    pub reply_to: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message_id: Option<String>,
    #[serde(
        skip_serializing_if = "Option::is_none",
        serialize_with = "serialize_sent_at"
    )]
    pub sent_at: Option<DateTime<Utc>>,
}

pub const PAYLOAD_SOURCE: &str = "email";

impl DeliveryPayload {
    /// Assembles the payload for a rewritten email. `sent_at` is only set when the
    /// message carried a parseable `Date` header.
    pub fn new(email: &ParsedEmail, message: String, reply_to: &str) -> Self {
        Self {
            subject: email.subject.clone(),
            name: email.from.name.clone(),
            email: email.from.address.clone(),
            message,
            source: PAYLOAD_SOURCE,
            reply_to: reply_to.to_string(),
            message_id: email.message_id.clone(),
            sent_at: email.date,
        }
    }
}

fn serialize_sent_at<S>(sent_at: &Option<DateTime<Utc>>, serializer: S) -> Result<S::Ok, S::Error>
where
    S: Serializer,
{
    match sent_at {
        Some(ts) => serializer.serialize_str(&ts.to_rfc3339_opts(SecondsFormat::Millis, true)),
        None => serializer.serialize_none(),
    }
}

#[derive(Debug, thiserror::Error)]
pub enum DeliveryError {
    #[error("webhook request failed: {0:#}")]
    Transport(anyhow::Error),
    #[error("webhook responded with {status}: {body}")]
    Rejected { status: StatusCode, body: String },
}

// --- WebhookClient ---

pub struct WebhookClient {
    client: HttpClient,
    webhook_url: String,
}

impl WebhookClient {
    pub fn new(config: &Config, client: HttpClient) -> Self {
        Self {
            client,
            webhook_url: config.webhook_url.clone(),
        }
    }

    /// Posts the payload once. Any non-2xx status is a rejection.
    pub async fn deliver(&self, payload: &DeliveryPayload) -> Result<(), DeliveryError> {
        info!(
            "Forwarding email from '{}' (Name: {}) with subject: '{}'",
            payload.email.as_deref().unwrap_or("N/A"),
            payload.name.as_deref().unwrap_or("N/A"),
            payload.subject.as_deref().unwrap_or("")
        );

        let json_body = serde_json::to_string(payload)
            .map_err(|e| DeliveryError::Transport(anyhow::Error::new(e)))?;

        let response = match http::post_json(&self.client, &self.webhook_url, None, json_body).await {
            Ok(response) => response,
            Err(e) => {
                error!("Failed to send webhook to {}: {:#}", self.webhook_url, e);
                return Err(DeliveryError::Transport(e));
            }
        };

        if !response.status.is_success() {
            let body = response.text();
            error!(
                "Webhook {} failed: {} {}",
                self.webhook_url, response.status, body
            );
            return Err(DeliveryError::Rejected {
                status: response.status,
                body,
            });
        }

        info!(
            "Email successfully forwarded to webhook {}, status: {}",
            self.webhook_url, response.status
        );
        Ok(())
    }
}

#[async_trait]
impl Deliverer for WebhookClient {
    async fn deliver(&self, payload: &DeliveryPayload) -> Result<(), DeliveryError> {
        WebhookClient::deliver(self, payload).await
    }
}
