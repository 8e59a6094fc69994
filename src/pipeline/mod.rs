//! The per-message pipeline: parse, extract, clean, rewrite, deliver.
//!
//! A run owns everything it touches and ends in exactly one [`PipelineOutcome`].
//! Nothing is retried; the first failing stage decides the rejection reason.

pub mod clean;
pub mod extract;

use crate::config::Config;
use crate::email::{EmailParser, ParsedEmail};
use crate::error::PipelineError;
use crate::http;
use crate::rewrite::{RewriteClient, RewriteError};
use crate::webhook::{DeliveryError, DeliveryPayload, WebhookClient};
use async_trait::async_trait;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, info, warn, Instrument};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Parsing,
    Extracting,
    Cleaning,
    Rewriting,
    Delivering,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Stage::Parsing => "parsing",
            Stage::Extracting => "extracting",
            Stage::Cleaning => "cleaning",
            Stage::Rewriting => "rewriting",
            Stage::Delivering => "delivering",
        };
        f.write_str(name)
    }
}

/// Service that turns a cleaned body into the text that gets delivered.
#[async_trait]
pub trait Rewriter: Send + Sync {
    async fn rewrite(&self, body: &str) -> Result<String, RewriteError>;
}

/// Transport for the final payload.
#[async_trait]
pub trait Deliverer: Send + Sync {
    async fn deliver(&self, payload: &DeliveryPayload) -> Result<(), DeliveryError>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PipelineOutcome {
    Delivered,
    /// The mail transport must refuse the message permanently with this reason.
    Rejected(String),
}

/// A message as handed over by the mail transport.
#[derive(Debug, Clone)]
pub struct InboundEmail {
    pub raw: Vec<u8>,
    /// Envelope recipient, used as the payload's `reply_to`.
    pub envelope_to: String,
}

pub struct MailPipeline {
    rewriter: Arc<dyn Rewriter>,
    deliverer: Arc<dyn Deliverer>,
}

impl MailPipeline {
    pub fn new(rewriter: Arc<dyn Rewriter>, deliverer: Arc<dyn Deliverer>) -> Self {
        Self {
            rewriter,
            deliverer,
        }
    }

    /// Wires the real rewrite and webhook clients over one shared HTTPS client.
    pub fn from_config(config: &Config) -> Self {
        let client = http::build_client();
        Self::new(
            Arc::new(RewriteClient::new(config, client.clone())),
            Arc::new(WebhookClient::new(config, client)),
        )
    }

    /// Runs one message on its own task.
    ///
    /// A panic anywhere in the run surfaces as a rejection instead of tearing down
    /// the caller's SMTP session.
    pub async fn handle(self: Arc<Self>, inbound: InboundEmail) -> PipelineOutcome {
        let span = tracing::info_span!(
            "pipeline",
            run_id = %Uuid::new_v4(),
            envelope_to = %inbound.envelope_to
        );

        let pipeline = Arc::clone(&self);
        let task = tokio::spawn(
            async move { pipeline.process(&inbound).await }.instrument(span.clone()),
        );

        match task.await {
            Ok(outcome) => outcome,
            Err(e) => {
                let _enter = span.enter();
                outcome_of(Err(PipelineError::Unknown(e.to_string())))
            }
        }
    }

    pub async fn process(&self, inbound: &InboundEmail) -> PipelineOutcome {
        outcome_of(self.run(inbound).await)
    }

    /// Runs the stages after parsing for an already structured email.
    pub async fn process_parsed(&self, email: ParsedEmail, reply_to: &str) -> PipelineOutcome {
        outcome_of(self.run_parsed(email, reply_to).await)
    }

    async fn run(&self, inbound: &InboundEmail) -> Result<(), PipelineError> {
        debug!(stage = %Stage::Parsing, bytes = inbound.raw.len(), "Parsing raw message");
        let email = EmailParser::parse(&inbound.raw)?;
        self.run_parsed(email, &inbound.envelope_to).await
    }

    async fn run_parsed(&self, email: ParsedEmail, reply_to: &str) -> Result<(), PipelineError> {
        debug!(stage = %Stage::Extracting, "Extracting body");
        let body = extract::extract_body(email.text.as_deref(), email.html.as_deref())
            .ok_or(PipelineError::NoContent(Stage::Extracting))?;

        debug!(stage = %Stage::Cleaning, bytes = body.len(), "Cleaning body");
        let body = clean::clean(&body);
        if body.trim().is_empty() {
            return Err(PipelineError::NoContent(Stage::Cleaning));
        }

        debug!(stage = %Stage::Rewriting, bytes = body.len(), "Rewriting body");
        let message = self.rewriter.rewrite(&body).await?;
        if message.trim().is_empty() {
            return Err(RewriteError::EmptyCompletion.into());
        }

        debug!(stage = %Stage::Delivering, "Delivering payload");
        let payload = DeliveryPayload::new(&email, message, reply_to);
        self.deliverer.deliver(&payload).await?;
        Ok(())
    }
}

fn outcome_of(result: Result<(), PipelineError>) -> PipelineOutcome {
    match result {
        Ok(()) => {
            info!("Email delivered");
            PipelineOutcome::Delivered
        }
        Err(e) => {
            let reason = e.rejection_reason();
            warn!("Rejecting email ({}): {}", reason, e);
            PipelineOutcome::Rejected(reason.to_string())
        }
    }
}

#[cfg(test)]
mod tests;
