use super::*;
use crate::email::Sender;
use chrono::{TimeZone, Utc};
use hyper::StatusCode;
use std::sync::Mutex;

// --- Fakes ---

enum RewriteBehavior {
    Reply(String),
    Fail,
    Panic,
}

struct FakeRewriter {
    behavior: RewriteBehavior,
    calls: Mutex<Vec<String>>,
}

impl FakeRewriter {
    fn new(behavior: RewriteBehavior) -> Arc<Self> {
        Arc::new(Self {
            behavior,
            calls: Mutex::new(Vec::new()),
        })
    }

    fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl Rewriter for FakeRewriter {
    async fn rewrite(&self, body: &str) -> Result<String, RewriteError> {
        self.calls.lock().unwrap().push(body.to_string());
        match &self.behavior {
            RewriteBehavior::Reply(text) => Ok(text.clone()),
            RewriteBehavior::Fail => Err(RewriteError::Status {
                status: StatusCode::UNAUTHORIZED,
                body: "bad key".to_string(),
            }),
            RewriteBehavior::Panic => panic!("rewriter blew up"),
        }
    }
}

enum DeliverBehavior {
    Status(StatusCode),
    Unreachable,
}

struct FakeDeliverer {
    behavior: DeliverBehavior,
    payloads: Mutex<Vec<DeliveryPayload>>,
}

impl FakeDeliverer {
    fn new(behavior: DeliverBehavior) -> Arc<Self> {
        Arc::new(Self {
            behavior,
            payloads: Mutex::new(Vec::new()),
        })
    }

    fn payloads(&self) -> Vec<DeliveryPayload> {
        self.payloads.lock().unwrap().clone()
    }
}

#[async_trait]
impl Deliverer for FakeDeliverer {
    async fn deliver(&self, payload: &DeliveryPayload) -> Result<(), DeliveryError> {
        self.payloads.lock().unwrap().push(payload.clone());
        match self.behavior {
            DeliverBehavior::Status(status) if status.is_success() => Ok(()),
            DeliverBehavior::Status(status) => Err(DeliveryError::Rejected {
                status,
                body: "server error".to_string(),
            }),
            DeliverBehavior::Unreachable => Err(DeliveryError::Transport(anyhow::anyhow!(
                "connection refused"
            ))),
        }
    }
}

fn pipeline(rewriter: &Arc<FakeRewriter>, deliverer: &Arc<FakeDeliverer>) -> MailPipeline {
    MailPipeline::new(rewriter.clone(), deliverer.clone())
}

fn email_with(text: Option<&str>, html: Option<&str>) -> ParsedEmail {
    ParsedEmail {
        subject: Some("Hello".to_string()),
        from: Sender {
            name: Some("Ann Sender".to_string()),
            address: Some("ann@example.com".to_string()),
        },
        to: "inbox@example.com".to_string(),
        text: text.map(str::to_string),
        html: html.map(str::to_string),
        message_id: Some("<m1@example.com>".to_string()),
        date: None,
    }
}

fn rejected(reason: &str) -> PipelineOutcome {
    PipelineOutcome::Rejected(reason.to_string())
}

// --- Rejection before rewriting ---

#[tokio::test]
async fn test_no_text_and_no_html_is_rejected() {
    let rewriter = FakeRewriter::new(RewriteBehavior::Reply("unused".to_string()));
    let deliverer = FakeDeliverer::new(DeliverBehavior::Status(StatusCode::OK));

    let outcome = pipeline(&rewriter, &deliverer)
        .process_parsed(email_with(None, None), "inbox@example.com")
        .await;

    assert_eq!(outcome, rejected("Failed to parse email"));
    assert!(rewriter.calls().is_empty());
    assert!(deliverer.payloads().is_empty());
}

#[tokio::test]
async fn test_whitespace_after_cleaning_never_reaches_rewriter() {
    let rewriter = FakeRewriter::new(RewriteBehavior::Reply("unused".to_string()));
    let deliverer = FakeDeliverer::new(DeliverBehavior::Status(StatusCode::OK));

    let text = "  [https://tracking.example.com/open]\n\n\n\n https://example.com/u  \n";
    let outcome = pipeline(&rewriter, &deliverer)
        .process_parsed(email_with(Some(text), None), "inbox@example.com")
        .await;

    assert_eq!(outcome, rejected("Failed to parse email"));
    assert!(rewriter.calls().is_empty(), "rewriter must not be called");
    assert!(deliverer.payloads().is_empty());
}

#[tokio::test]
async fn test_empty_raw_body_shares_parse_reason() {
    let rewriter = FakeRewriter::new(RewriteBehavior::Reply("unused".to_string()));
    let deliverer = FakeDeliverer::new(DeliverBehavior::Status(StatusCode::OK));

    let inbound = InboundEmail {
        raw: b"Subject: empty\r\n\r\n".to_vec(),
        envelope_to: "inbox@example.com".to_string(),
    };
    let outcome = pipeline(&rewriter, &deliverer).process(&inbound).await;

    assert_eq!(outcome, rejected("Failed to parse email"));
    assert!(rewriter.calls().is_empty());
}

// --- Rewriting ---

#[tokio::test]
async fn test_rewriter_receives_cleaned_body() {
    let rewriter = FakeRewriter::new(RewriteBehavior::Reply("Rewritten".to_string()));
    let deliverer = FakeDeliverer::new(DeliverBehavior::Status(StatusCode::OK));

    let text = "\n Hi [https://x.example/y]\n\n\n\nBye \n";
    let outcome = pipeline(&rewriter, &deliverer)
        .process_parsed(email_with(Some(text), None), "inbox@example.com")
        .await;

    assert_eq!(outcome, PipelineOutcome::Delivered);
    assert_eq!(rewriter.calls(), vec!["Hi \n\nBye".to_string()]);
}

#[tokio::test]
async fn test_html_body_is_used_when_text_missing() {
    let rewriter = FakeRewriter::new(RewriteBehavior::Reply("Rewritten".to_string()));
    let deliverer = FakeDeliverer::new(DeliverBehavior::Status(StatusCode::OK));

    let html = r#"<p>Big <a href="https://shop.example.com/sale">sale</a> today <img src="x.png" alt="banner"></p>"#;
    let outcome = pipeline(&rewriter, &deliverer)
        .process_parsed(email_with(None, Some(html)), "inbox@example.com")
        .await;

    assert_eq!(outcome, PipelineOutcome::Delivered);
    let calls = rewriter.calls();
    assert_eq!(calls.len(), 1);
    assert!(calls[0].contains("sale"), "Got: {}", calls[0]);
    assert!(!calls[0].contains("shop.example.com"), "Got: {}", calls[0]);
    assert!(!calls[0].contains("banner"), "Got: {}", calls[0]);
}

#[tokio::test]
async fn test_rewrite_failure_is_rejected_without_delivery() {
    let rewriter = FakeRewriter::new(RewriteBehavior::Fail);
    let deliverer = FakeDeliverer::new(DeliverBehavior::Status(StatusCode::OK));

    let outcome = pipeline(&rewriter, &deliverer)
        .process_parsed(email_with(Some("Body"), None), "inbox@example.com")
        .await;

    assert_eq!(outcome, rejected("Failed to handle email"));
    assert!(deliverer.payloads().is_empty());
}

#[tokio::test]
async fn test_blank_rewrite_is_never_delivered() {
    let rewriter = FakeRewriter::new(RewriteBehavior::Reply(" \n\t".to_string()));
    let deliverer = FakeDeliverer::new(DeliverBehavior::Status(StatusCode::OK));

    let outcome = pipeline(&rewriter, &deliverer)
        .process_parsed(email_with(Some("Body"), None), "inbox@example.com")
        .await;

    assert_eq!(outcome, rejected("Failed to handle email"));
    assert!(deliverer.payloads().is_empty());
}

// --- Delivery ---

#[tokio::test]
async fn test_successful_delivery_without_date() {
    let rewriter = FakeRewriter::new(RewriteBehavior::Reply("# Hello\n\nClean text.".to_string()));
    let deliverer = FakeDeliverer::new(DeliverBehavior::Status(StatusCode::OK));

    let outcome = pipeline(&rewriter, &deliverer)
        .process_parsed(email_with(Some("Hola"), None), "envelope@example.com")
        .await;

    assert_eq!(outcome, PipelineOutcome::Delivered);
    let payloads = deliverer.payloads();
    assert_eq!(payloads.len(), 1);
    let payload = &payloads[0];
    assert_eq!(payload.message, "# Hello\n\nClean text.");
    assert_eq!(payload.subject.as_deref(), Some("Hello"));
    assert_eq!(payload.name.as_deref(), Some("Ann Sender"));
    assert_eq!(payload.email.as_deref(), Some("ann@example.com"));
    assert_eq!(payload.source, "email");
    assert_eq!(payload.reply_to, "envelope@example.com");
    assert_eq!(payload.message_id.as_deref(), Some("<m1@example.com>"));
    assert!(payload.sent_at.is_none());
}

#[tokio::test]
async fn test_successful_delivery_with_date() {
    let rewriter = FakeRewriter::new(RewriteBehavior::Reply("Rewritten".to_string()));
    let deliverer = FakeDeliverer::new(DeliverBehavior::Status(StatusCode::NO_CONTENT));

    let date = Utc.with_ymd_and_hms(2024, 2, 29, 23, 59, 1).unwrap();
    let mut email = email_with(Some("Body"), None);
    email.date = Some(date);

    let outcome = pipeline(&rewriter, &deliverer)
        .process_parsed(email, "inbox@example.com")
        .await;

    assert_eq!(outcome, PipelineOutcome::Delivered);
    assert_eq!(deliverer.payloads()[0].sent_at, Some(date));
}

#[tokio::test]
async fn test_webhook_server_error_is_rejected() {
    let rewriter = FakeRewriter::new(RewriteBehavior::Reply("Rewritten".to_string()));
    let deliverer = FakeDeliverer::new(DeliverBehavior::Status(StatusCode::INTERNAL_SERVER_ERROR));

    let outcome = pipeline(&rewriter, &deliverer)
        .process_parsed(email_with(Some("Body"), None), "inbox@example.com")
        .await;

    assert_eq!(outcome, rejected("Discord webhook failed"));
    assert_eq!(deliverer.payloads().len(), 1, "exactly one attempt");
}

#[tokio::test]
async fn test_webhook_unreachable_is_rejected() {
    let rewriter = FakeRewriter::new(RewriteBehavior::Reply("Rewritten".to_string()));
    let deliverer = FakeDeliverer::new(DeliverBehavior::Unreachable);

    let outcome = pipeline(&rewriter, &deliverer)
        .process_parsed(email_with(Some("Body"), None), "inbox@example.com")
        .await;

    assert_eq!(outcome, rejected("Failed to send Discord webhook"));
    assert_eq!(deliverer.payloads().len(), 1, "exactly one attempt");
}

// --- Full runs from raw bytes ---

#[tokio::test]
async fn test_raw_message_end_to_end() {
    let rewriter = FakeRewriter::new(RewriteBehavior::Reply("Rewritten".to_string()));
    let deliverer = FakeDeliverer::new(DeliverBehavior::Status(StatusCode::OK));

    let raw = "From: Bob <bob@example.com>\r\n\
               To: inbox@example.com\r\n\
               Subject: Weekly news\r\n\
               Message-ID: <news-7@example.com>\r\n\
               Date: Tue, 02 Jan 2024 08:00:00 +0000\r\n\
               \r\n\
               Hello reader.\r\n";
    let inbound = InboundEmail {
        raw: raw.as_bytes().to_vec(),
        envelope_to: "inbox@example.com".to_string(),
    };

    let outcome = Arc::new(pipeline(&rewriter, &deliverer)).handle(inbound).await;

    assert_eq!(outcome, PipelineOutcome::Delivered);
    assert_eq!(rewriter.calls(), vec!["Hello reader.".to_string()]);
    let payload = &deliverer.payloads()[0];
    assert_eq!(payload.subject.as_deref(), Some("Weekly news"));
    assert_eq!(payload.name.as_deref(), Some("Bob"));
    assert_eq!(payload.email.as_deref(), Some("bob@example.com"));
    assert_eq!(payload.message_id.as_deref(), Some("<news-7@example.com>"));
    assert_eq!(payload.sent_at.map(|d| d.timestamp()), Some(1_704_182_400));
}

#[tokio::test]
async fn test_panic_inside_run_is_rejected() {
    let rewriter = FakeRewriter::new(RewriteBehavior::Panic);
    let deliverer = FakeDeliverer::new(DeliverBehavior::Status(StatusCode::OK));

    let inbound = InboundEmail {
        raw: b"Subject: x\r\n\r\nBody\r\n".to_vec(),
        envelope_to: "inbox@example.com".to_string(),
    };
    let outcome = Arc::new(pipeline(&rewriter, &deliverer)).handle(inbound).await;

    assert_eq!(outcome, rejected("Failed to handle email"));
    assert!(deliverer.payloads().is_empty());
}

#[test]
fn test_stage_display() {
    assert_eq!(Stage::Parsing.to_string(), "parsing");
    assert_eq!(Stage::Delivering.to_string(), "delivering");
    assert_eq!(
        PipelineError::NoContent(Stage::Cleaning).to_string(),
        "no usable content after cleaning"
    );
}
