//! State machine and command handling for one SMTP conversation.
//!
//! The protocol answers everything it can decide on its own (greetings, sequencing
//! errors, syntax errors). Decisions that need outside knowledge, such as whether a
//! recipient is accepted or what happened to a finished message, are handed back
//! to the caller through [`SmtpCommandResult`] and answered by the caller.

use anyhow::Result;
use log::{debug, warn};
use mailparse::{addrparse, MailAddr};
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt};

const SERVER_NAME: &str = "mailscribe";

/// Longest line read in one piece. Longer lines arrive split at this length.
const MAX_LINE_BYTES: u64 = 64 * 1024;

/// Represents the possible states during an SMTP session.
#[derive(Debug, PartialEq, Clone, Copy)]
pub enum SmtpState {
    /// Connected, waiting for HELO/EHLO.
    Initial,
    /// Client introduced itself. Expecting MAIL FROM (or STARTTLS).
    Greeted,
    /// A sender was given. Expecting RCPT TO.
    MailFrom,
    /// At least one recipient was accepted. Expecting DATA or more RCPT TO.
    RcptTo,
    /// Collecting message lines until the lone `.` terminator.
    Data,
}

/// Manages the state and I/O for a single SMTP client connection.
///
/// Generic over the reader and writer so tests can drive it with in-memory buffers.
pub struct SmtpProtocol<R, W>
where
    R: AsyncBufReadExt + Unpin,
    W: AsyncWriteExt + Unpin,
{
    reader: R,
    writer: W,
    state: SmtpState,
    tls_active: bool,
}

impl<R, W> SmtpProtocol<R, W>
where
    R: AsyncBufReadExt + Unpin,
    W: AsyncWriteExt + Unpin,
{
    pub fn new(reader: R, writer: W) -> Self {
        SmtpProtocol {
            reader,
            writer,
            state: SmtpState::Initial,
            tls_active: false,
        }
    }

    /// Marks the session as running over TLS: STARTTLS is no longer advertised and
    /// a repeated STARTTLS is refused.
    pub fn with_tls_active(mut self) -> Self {
        self.tls_active = true;
        self
    }

    pub async fn send_greeting(&mut self) -> Result<()> {
        self.write_line(&format!("220 {} SMTP Server Ready", SERVER_NAME))
            .await
    }

    /// Processes one line as read from the wire (without CRLF).
    ///
    /// Message lines stay raw bytes; 8-bit content is valid inside DATA. Command
    /// lines are decoded lossily before interpretation.
    pub async fn process_line(&mut self, line: &[u8]) -> Result<SmtpCommandResult> {
        if self.state == SmtpState::Data {
            return Ok(self.process_data_line(line));
        }
        self.process_command(&String::from_utf8_lossy(line)).await
    }

    /// Processes a single command line (without CRLF) and returns what the caller
    /// must act on.
    pub async fn process_command(&mut self, line: &str) -> Result<SmtpCommandResult> {
        debug!("SMTP({:?}): Processing command: {:?}", self.state, line);

        if self.state == SmtpState::Data {
            return Ok(self.process_data_line(line.as_bytes()));
        }

        let upper_line = line.to_uppercase();

        if upper_line.starts_with("QUIT") {
            self.write_line("221 Bye").await?;
            return Ok(SmtpCommandResult::Quit);
        }
        if upper_line.starts_with("NOOP") {
            self.write_line("250 OK").await?;
            return Ok(SmtpCommandResult::Continue);
        }
        if upper_line.starts_with("RSET") {
            if self.state != SmtpState::Initial {
                self.reset_state();
            }
            self.write_line("250 OK").await?;
            return Ok(SmtpCommandResult::Reset);
        }

        match self.state {
            SmtpState::Initial => {
                if upper_line.starts_with("HELO") {
                    self.write_line(&format!("250 {}", SERVER_NAME)).await?;
                    self.state = SmtpState::Greeted;
                } else if upper_line.starts_with("EHLO") {
                    let domain = line.split_whitespace().nth(1).unwrap_or("client");
                    if self.tls_active {
                        self.write_line(&format!("250 {} greets {}", SERVER_NAME, domain))
                            .await?;
                    } else {
                        self.write_line(&format!("250-{} greets {}", SERVER_NAME, domain))
                            .await?;
                        self.write_line("250 STARTTLS").await?;
                    }
                    self.state = SmtpState::Greeted;
                } else {
                    self.write_line("500 Command not recognized or out of sequence")
                        .await?;
                }
                Ok(SmtpCommandResult::Continue)
            }
            SmtpState::Greeted => {
                if upper_line.starts_with("MAIL FROM:") {
                    if let Some(email) = self.extract_email(line) {
                        self.write_line("250 OK").await?;
                        self.state = SmtpState::MailFrom;
                        Ok(SmtpCommandResult::MailFrom(email))
                    } else {
                        self.write_line("501 Syntax error in MAIL FROM parameters")
                            .await?;
                        Ok(SmtpCommandResult::Continue)
                    }
                } else if upper_line.starts_with("STARTTLS") {
                    if self.tls_active {
                        self.write_line("503 STARTTLS already active").await?;
                        Ok(SmtpCommandResult::Continue)
                    } else {
                        self.write_line("220 Go ahead").await?;
                        // The caller performs the handshake and starts a fresh session.
                        Ok(SmtpCommandResult::StartTls)
                    }
                } else {
                    self.write_line(
                        "503 Bad sequence of commands (expected MAIL FROM or STARTTLS)",
                    )
                    .await?;
                    Ok(SmtpCommandResult::Continue)
                }
            }
            SmtpState::MailFrom | SmtpState::RcptTo => {
                if upper_line.starts_with("RCPT TO:") {
                    if let Some(email) = self.extract_email(line) {
                        // The caller answers 250 or 550 and calls `recipient_rejected`
                        // when nothing has been accepted yet.
                        self.state = SmtpState::RcptTo;
                        Ok(SmtpCommandResult::RcptTo(email))
                    } else {
                        self.write_line("501 Syntax error in RCPT TO parameters")
                            .await?;
                        Ok(SmtpCommandResult::Continue)
                    }
                } else if self.state == SmtpState::RcptTo && upper_line.starts_with("DATA") {
                    self.write_line("354 Start mail input; end with <CRLF>.<CRLF>")
                        .await?;
                    self.state = SmtpState::Data;
                    Ok(SmtpCommandResult::DataStart)
                } else {
                    let expected = if self.state == SmtpState::RcptTo {
                        "503 Bad sequence of commands (expected DATA or RCPT TO)"
                    } else {
                        "503 Bad sequence of commands (expected RCPT TO)"
                    };
                    self.write_line(expected).await?;
                    Ok(SmtpCommandResult::Continue)
                }
            }
            SmtpState::Data => Ok(self.process_data_line(line.as_bytes())),
        }
    }

    /// Data lines get no reply. The terminator's reply depends on the pipeline
    /// outcome and is written by the caller.
    fn process_data_line(&mut self, line: &[u8]) -> SmtpCommandResult {
        if line == b"." {
            self.state = SmtpState::Greeted;
            return SmtpCommandResult::DataEnd;
        }
        // RFC 5321 4.5.2 transparency: a leading dot was doubled by the client.
        let content = match line {
            [b'.', rest @ ..] if rest.first() == Some(&b'.') => rest,
            _ => line,
        };
        SmtpCommandResult::DataLine(content.to_vec())
    }

    /// Reverts a RCPT TO that the caller refused when no earlier recipient was
    /// accepted, so DATA stays out of sequence.
    pub fn recipient_rejected(&mut self, any_accepted: bool) {
        if !any_accepted && self.state == SmtpState::RcptTo {
            self.state = SmtpState::MailFrom;
        }
    }

    /// Reads a single line, without its CRLF. Returns `None` once the peer has
    /// closed the connection.
    pub async fn read_line(&mut self) -> Result<Option<Vec<u8>>> {
        let mut buffer = Vec::new();
        let bytes_read = (&mut self.reader)
            .take(MAX_LINE_BYTES)
            .read_until(b'\n', &mut buffer)
            .await?;

        if bytes_read == 0 {
            return Ok(None);
        }
        while matches!(buffer.last(), Some(b'\n' | b'\r')) {
            buffer.pop();
        }
        debug!("SMTP Read: {}", String::from_utf8_lossy(&buffer));
        Ok(Some(buffer))
    }

    /// Writes a single line with CRLF and flushes.
    pub async fn write_line(&mut self, line: &str) -> Result<()> {
        debug!("SMTP Write: {}", line);
        self.writer
            .write_all(format!("{}\r\n", line).as_bytes())
            .await?;
        self.writer.flush().await?;
        Ok(())
    }

    /// Extracts the address from a MAIL FROM or RCPT TO line, with or without angle
    /// brackets or a display name.
    fn extract_email(&self, line: &str) -> Option<String> {
        let addr_part = line.split_once(':').map(|(_cmd, addr)| addr.trim());

        addr_part.and_then(|addr_spec| {
            let spec_to_parse = addr_spec
                .strip_prefix('<')
                .and_then(|s| s.strip_suffix('>'))
                .unwrap_or(addr_spec);

            match addrparse(spec_to_parse) {
                Ok(addrs) => addrs.first().and_then(|mail_addr| match mail_addr {
                    MailAddr::Single(spec) => Some(spec.addr.clone()),
                    MailAddr::Group(_) => {
                        warn!(
                            "Unexpected group address found in MAIL FROM/RCPT TO: {}",
                            spec_to_parse
                        );
                        None
                    }
                }),
                Err(e) => {
                    warn!(
                        "Failed to parse address spec '{}' from line '{}': {}",
                        spec_to_parse, line, e
                    );
                    None
                }
            }
        })
    }

    pub fn get_state(&self) -> SmtpState {
        self.state
    }

    /// Drops the current transaction and returns to `Greeted`.
    pub fn reset_state(&mut self) {
        debug!("Resetting SMTP state to Greeted");
        self.state = SmtpState::Greeted;
    }
}

/// Outcome of processing a single SMTP command line.
#[derive(Debug)]
pub enum SmtpCommandResult {
    /// Nothing for the caller to do; read the next line.
    Continue,
    /// QUIT received; close the connection.
    Quit,
    /// RSET received; the caller drops its envelope.
    Reset,
    /// MAIL FROM accepted, with the sender's address.
    MailFrom(String),
    /// RCPT TO parsed, with the recipient's address. Not yet answered.
    RcptTo(String),
    /// DATA accepted; message lines follow.
    DataStart,
    /// One message line, dot-unstuffed, as raw bytes.
    DataLine(Vec<u8>),
    /// End of message. Not yet answered.
    DataEnd,
    /// STARTTLS accepted; the caller must perform the handshake.
    StartTls,
}
