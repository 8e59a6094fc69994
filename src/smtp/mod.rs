mod smtp_protocol;

use crate::config::Config;
use crate::pipeline::{InboundEmail, MailPipeline, PipelineOutcome};
use acton_reactive::prelude::*;
use anyhow::{Context, Result};
use log::{error, info, trace, warn};
use smtp_protocol::{SmtpCommandResult, SmtpProtocol};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;

use rcgen::generate_simple_self_signed;
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};
use rustls::ServerConfig as RustlsServerConfig;
use std::sync::Arc;
use tokio_rustls::TlsAcceptor;

const REPLY_ACCEPTED: &str = "250 OK: Message accepted for delivery";
const REPLY_TOO_LARGE: &str = "552 Message exceeds maximum size";

/// Largest DATA section collected per message. Bytes past it are discarded.
pub const MAX_MESSAGE_BYTES: usize = 25 * 1024 * 1024;

// --- SmtpListenerActor ---

#[acton_actor]
pub struct SmtpListenerState;

impl SmtpListenerState {
    /// Starts the listener actor. The accept loop runs until the actor is stopped.
    pub async fn create(
        runtime: &mut ActorRuntime,
        config: &Config,
        pipeline: Arc<MailPipeline>,
    ) -> anyhow::Result<ActorHandle> {
        let actor_config = ActorConfig::new(Ern::with_root("smtp-listener")?, None, None)?
            .with_restart_policy(RestartPolicy::Permanent);

        let mut builder = runtime.new_actor_with_config::<Self>(actor_config);

        let cancel = CancellationToken::new();
        let cancel_for_loop = cancel.clone();
        let cancel_for_stop = cancel.clone();

        let addr = format!("{}:{}", config.smtp_bind_address, config.smtp_port);
        let session = SessionContext {
            target_emails: Arc::new(config.target_emails.clone()),
            pipeline,
            max_message_bytes: MAX_MESSAGE_BYTES,
        };

        builder.after_start(move |_actor| {
            let addr = addr.clone();
            let session = session.clone();
            let cancel = cancel_for_loop.clone();

            tokio::spawn(async move {
                let listener = match TcpListener::bind(&addr).await {
                    Ok(l) => {
                        tracing::info!("SMTP server listening on {}", addr);
                        l
                    }
                    Err(e) => {
                        tracing::error!("Failed to bind SMTP: {}", e);
                        return;
                    }
                };

                loop {
                    tokio::select! {
                        result = listener.accept() => {
                            match result {
                                Ok((stream, remote_addr)) => {
                                    tracing::info!("New connection from: {}", remote_addr);
                                    let session = session.clone();
                                    tokio::spawn(async move {
                                        if let Err(e) = handle_connection(stream, session).await {
                                            tracing::error!("Error handling SMTP connection from {}: {:#}", remote_addr, e);
                                        }
                                    });
                                }
                                Err(e) => tracing::error!("Error accepting connection: {:?}", e),
                            }
                        }
                        _ = cancel.cancelled() => {
                            tracing::info!("SMTP listener shutting down gracefully");
                            break;
                        }
                    }
                }
            });

            Reply::ready()
        });

        builder.before_stop(move |_| {
            cancel_for_stop.cancel();
            Reply::ready()
        });

        Ok(builder.start().await)
    }
}

/// What every connection needs from the listener.
#[derive(Clone)]
struct SessionContext {
    target_emails: Arc<Vec<String>>,
    pipeline: Arc<MailPipeline>,
    max_message_bytes: usize,
}

impl SessionContext {
    fn accepts(&self, recipient: &str) -> bool {
        self.target_emails
            .iter()
            .any(|target| target.eq_ignore_ascii_case(recipient))
    }
}

/// The transaction collected so far in one session.
#[derive(Debug, Default)]
struct Envelope {
    sender: Option<String>,
    recipient: Option<String>,
    data: Vec<u8>,
    oversized: bool,
}

impl Envelope {
    fn clear(&mut self) {
        *self = Envelope::default();
    }

    /// Appends one message line with its CRLF, unless that would pass `limit`.
    fn push_line(&mut self, line: &[u8], limit: usize) {
        if self.oversized {
            return;
        }
        if self.data.len() + line.len() + 2 > limit {
            self.oversized = true;
            self.data = Vec::new();
            return;
        }
        self.data.extend_from_slice(line);
        self.data.extend_from_slice(b"\r\n");
    }
}

enum SessionEnd {
    Closed,
    StartTls,
}

// --- Certificate generation ---

fn generate_self_signed_cert() -> Result<(CertificateDer<'static>, PrivateKeyDer<'static>)> {
    let certified_key = generate_simple_self_signed(vec!["localhost".to_string()])
        .context("Failed to generate self-signed certificate using rcgen")?;

    let cert_der = certified_key.cert.der().to_vec();
    let key_der = certified_key.signing_key.serialize_der();

    Ok((
        CertificateDer::from(cert_der),
        PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(key_der)),
    ))
}

// --- Connection handlers ---

async fn handle_connection(mut stream: TcpStream, session: SessionContext) -> Result<()> {
    match run_session(&mut stream, false, &session).await? {
        SessionEnd::Closed => Ok(()),
        SessionEnd::StartTls => handle_starttls(stream, session).await,
    }
}

async fn handle_starttls(stream: TcpStream, session: SessionContext) -> Result<()> {
    let (cert, key) = generate_self_signed_cert()
        .context("Failed to generate self-signed certificate for STARTTLS")?;

    let tls_config = RustlsServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(vec![cert], key)
        .map_err(|e| anyhow::anyhow!("Failed to create rustls config: {}", e))?;

    let acceptor = TlsAcceptor::from(Arc::new(tls_config));

    let tls_stream = match acceptor.accept(stream).await {
        Ok(tls_stream) => tls_stream,
        Err(e) => {
            error!("STARTTLS handshake failed: {:?}", e);
            return Err(anyhow::Error::new(e).context("STARTTLS handshake failed"));
        }
    };
    info!("STARTTLS handshake successful.");

    // The protocol refuses a second STARTTLS, so a secure session always ends closed.
    run_session(tls_stream, true, &session).await?;
    Ok(())
}

/// Drives one SMTP conversation over `stream` until the client quits, disconnects,
/// or asks to upgrade to TLS.
///
/// After STARTTLS the client starts over with EHLO, so no envelope state survives
/// the upgrade.
async fn run_session<S>(stream: S, tls_active: bool, session: &SessionContext) -> Result<SessionEnd>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let (read_half, write_half) = tokio::io::split(stream);
    let reader = tokio::io::BufReader::new(read_half);
    let writer = tokio::io::BufWriter::new(write_half);
    let mut protocol = SmtpProtocol::new(reader, writer);
    if tls_active {
        protocol = protocol.with_tls_active();
    } else {
        protocol.send_greeting().await?;
    }

    let mut envelope = Envelope::default();

    loop {
        trace!("SMTP({:?}): Waiting for command...", protocol.get_state());
        let Some(line) = protocol.read_line().await? else {
            info!("Connection closed by client (EOF). State: {:?}", protocol.get_state());
            return Ok(SessionEnd::Closed);
        };

        match protocol.process_line(&line).await? {
            SmtpCommandResult::Continue => {}
            SmtpCommandResult::Quit => {
                info!("Client quit.");
                return Ok(SessionEnd::Closed);
            }
            SmtpCommandResult::StartTls => {
                info!("Client initiated STARTTLS. Proceeding with handshake.");
                return Ok(SessionEnd::StartTls);
            }
            SmtpCommandResult::Reset => envelope.clear(),
            SmtpCommandResult::MailFrom(email) => {
                envelope.clear();
                envelope.sender = Some(email);
            }
            SmtpCommandResult::RcptTo(email) => {
                if session.accepts(&email) {
                    if envelope.recipient.is_none() {
                        envelope.recipient = Some(email);
                    }
                    protocol.write_line("250 OK").await?;
                } else {
                    warn!("Rejecting recipient {}", email);
                    protocol.write_line("550 No such user here").await?;
                    protocol.recipient_rejected(envelope.recipient.is_some());
                }
            }
            SmtpCommandResult::DataStart => {
                envelope.data.clear();
                envelope.oversized = false;
            }
            SmtpCommandResult::DataLine(content) => {
                envelope.push_line(&content, session.max_message_bytes);
            }
            SmtpCommandResult::DataEnd => {
                let finished = std::mem::take(&mut envelope);
                let reply = match finished.recipient {
                    Some(envelope_to) if finished.oversized => {
                        warn!(
                            "Refusing message to {} larger than {} bytes",
                            envelope_to, session.max_message_bytes
                        );
                        REPLY_TOO_LARGE.to_string()
                    }
                    Some(envelope_to) => {
                        info!(
                            "Received email from {} to {} ({} bytes)",
                            finished.sender.as_deref().unwrap_or("<unknown>"),
                            envelope_to,
                            finished.data.len()
                        );
                        let inbound = InboundEmail {
                            raw: finished.data,
                            envelope_to,
                        };
                        match session.pipeline.clone().handle(inbound).await {
                            PipelineOutcome::Delivered => REPLY_ACCEPTED.to_string(),
                            PipelineOutcome::Rejected(reason) => format!("550 {}", reason),
                        }
                    }
                    None => {
                        warn!("DataEnd received without an accepted recipient.");
                        "503 Bad sequence of commands".to_string()
                    }
                };
                protocol.write_line(&reply).await?;
            }
        }
    }
}
