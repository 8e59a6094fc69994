//! Turns the raw DATA section of an SMTP transaction into a structured [`ParsedEmail`].
//!
//! MIME decoding (transfer encodings, charsets, multipart walking) is delegated to
//! `mailparse`. This module only decides which parts count as the message text and
//! which headers end up in the parsed record.

use chrono::{DateTime, Utc};
use log::debug;
use mailparse::{addrparse_header, DispositionType, MailAddr, MailHeaderMap, ParsedMail};

/// Raised when the raw bytes cannot be decoded into a structured message.
#[derive(Debug, thiserror::Error)]
pub enum ParseError {
    #[error("malformed message: {0}")]
    Malformed(#[from] mailparse::MailParseError),
}

/// Sender identity as found in the `From` header.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Sender {
    pub name: Option<String>,
    pub address: Option<String>,
}

/// Structured view of one inbound message.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ParsedEmail {
    pub subject: Option<String>,
    pub from: Sender,
    /// Value of the `To` header, empty when the header is missing.
    pub to: String,
    /// First inline `text/plain` part.
    pub text: Option<String>,
    /// First inline `text/html` part.
    pub html: Option<String>,
    pub message_id: Option<String>,
    pub date: Option<DateTime<Utc>>,
}

/// A namespace struct for MIME parsing logic.
pub struct EmailParser;

impl EmailParser {
    /// Parses a complete RFC 5322 message.
    ///
    /// Multipart bodies are walked depth-first. The first non-attachment `text/plain`
    /// part becomes `text` and the first non-attachment `text/html` part becomes
    /// `html`; all other parts are ignored. A part whose body cannot be decoded
    /// (bad transfer encoding, unknown charset) fails the whole parse.
    pub fn parse(raw: &[u8]) -> Result<ParsedEmail, ParseError> {
        let mail = mailparse::parse_mail(raw)?;

        let subject = mail.headers.get_first_value("Subject");
        let from = Self::sender(&mail);
        let to = mail.headers.get_first_value("To").unwrap_or_default();
        let message_id = mail
            .headers
            .get_first_value("Message-ID")
            .map(|id| id.trim().to_string())
            .filter(|id| !id.is_empty());
        let date = mail
            .headers
            .get_first_value("Date")
            .and_then(|value| Self::date(&value));

        let mut text = None;
        let mut html = None;
        Self::collect_bodies(&mail, &mut text, &mut html)?;

        debug!(
            "Parsed email (Subject: '{}', text: {}, html: {}, dated: {})",
            subject.as_deref().unwrap_or(""),
            text.is_some(),
            html.is_some(),
            date.is_some()
        );

        Ok(ParsedEmail {
            subject,
            from,
            to,
            text,
            html,
            message_id,
            date,
        })
    }

    fn sender(mail: &ParsedMail<'_>) -> Sender {
        let Some(header) = mail.headers.get_first_header("From") else {
            return Sender::default();
        };

        match addrparse_header(header) {
            Ok(list) => list
                .iter()
                .find_map(|addr| match addr {
                    MailAddr::Single(info) => Some(Sender {
                        name: info.display_name.clone(),
                        address: Some(info.addr.clone()),
                    }),
                    MailAddr::Group(group) => group.addrs.first().map(|info| Sender {
                        name: info.display_name.clone(),
                        address: Some(info.addr.clone()),
                    }),
                })
                .unwrap_or_default(),
            Err(e) => {
                debug!("Unparseable From header '{}': {}", header.get_value(), e);
                Sender::default()
            }
        }
    }

    fn date(value: &str) -> Option<DateTime<Utc>> {
        match mailparse::dateparse(value) {
            Ok(ts) => DateTime::from_timestamp(ts, 0),
            Err(e) => {
                debug!("Ignoring unparseable Date header '{}': {}", value, e);
                None
            }
        }
    }

    fn collect_bodies(
        part: &ParsedMail<'_>,
        text: &mut Option<String>,
        html: &mut Option<String>,
    ) -> Result<(), ParseError> {
        if !part.subparts.is_empty() {
            for sub in &part.subparts {
                Self::collect_bodies(sub, text, html)?;
            }
            return Ok(());
        }

        if matches!(
            part.get_content_disposition().disposition,
            DispositionType::Attachment
        ) {
            return Ok(());
        }

        match part.ctype.mimetype.as_str() {
            "text/plain" if text.is_none() => *text = Some(part.get_body()?),
            "text/html" if html.is_none() => *html = Some(part.get_body()?),
            _ => {}
        }
        Ok(())
    }
}
