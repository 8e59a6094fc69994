//! Failure kinds of a pipeline run and the rejection reasons they map to.

use crate::email::ParseError;
use crate::pipeline::Stage;
use crate::rewrite::RewriteError;
use crate::webhook::DeliveryError;
use hyper::StatusCode;

pub const REASON_PARSE: &str = "Failed to parse email";
pub const REASON_HANDLE: &str = "Failed to handle email";
pub const REASON_DELIVERY_TRANSPORT: &str = "Failed to send Discord webhook";
pub const REASON_DELIVERY_REJECTED: &str = "Discord webhook failed";

/// Every way a run can end without delivering. All of them are terminal.
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error("failed to parse email: {0}")]
    Parse(#[from] ParseError),

    #[error("no usable content after {0}")]
    NoContent(Stage),

    #[error("rewrite failed: {0}")]
    Rewrite(#[from] RewriteError),

    #[error("webhook transport failed: {0:#}")]
    DeliveryTransport(anyhow::Error),

    #[error("webhook rejected delivery with {status}")]
    DeliveryRejected { status: StatusCode, body: String },

    #[error("unexpected failure: {0}")]
    Unknown(String),
}

impl From<DeliveryError> for PipelineError {
    fn from(e: DeliveryError) -> Self {
        match e {
            DeliveryError::Transport(e) => PipelineError::DeliveryTransport(e),
            DeliveryError::Rejected { status, body } => {
                PipelineError::DeliveryRejected { status, body }
            }
        }
    }
}

impl PipelineError {
    /// The reason handed back to the mail transport.
    ///
    /// Parse failures and missing content share one reason so the sender learns
    /// nothing about which stage refused the message.
    pub fn rejection_reason(&self) -> &'static str {
        match self {
            PipelineError::Parse(_) | PipelineError::NoContent(_) => REASON_PARSE,
            PipelineError::Rewrite(_) | PipelineError::Unknown(_) => REASON_HANDLE,
            PipelineError::DeliveryTransport(_) => REASON_DELIVERY_TRANSPORT,
            PipelineError::DeliveryRejected { .. } => REASON_DELIVERY_REJECTED,
        }
    }
}
