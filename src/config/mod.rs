use anyhow::{anyhow, Result};
use std::env;

pub const DEFAULT_REWRITE_URL: &str = "https://openrouter.ai/api/v1/chat/completions";
pub const DEFAULT_REWRITE_MODEL: &str = "anthropic/claude-3.5-haiku";

#[derive(Clone)]
pub struct Config {
    /// The email addresses to accept mail for
    pub target_emails: Vec<String>,

    /// The webhook URL rewritten emails are posted to
    pub webhook_url: String,

    /// Chat-completions endpoint used for rewriting
    pub rewrite_url: String,

    /// Model name sent with every rewrite request
    pub rewrite_model: String,

    /// Bearer credential for the rewrite endpoint
    pub rewrite_api_key: String,

    /// The address to bind the SMTP server to
    pub smtp_bind_address: String,

    /// The port to bind the SMTP server to
    pub smtp_port: u16,
}

// Debug redacts the API key.
impl std::fmt::Debug for Config {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Config")
            .field("target_emails", &self.target_emails)
            .field("webhook_url", &self.webhook_url)
            .field("rewrite_url", &self.rewrite_url)
            .field("rewrite_model", &self.rewrite_model)
            .field("rewrite_api_key", &"<redacted>")
            .field("smtp_bind_address", &self.smtp_bind_address)
            .field("smtp_port", &self.smtp_port)
            .finish()
    }
}

fn required_var(name: &str) -> Result<String> {
    match env::var(name) {
        Ok(val) => Ok(val),
        Err(e) => {
            let err_msg = format!("{} environment variable must be set", name);
            log::error!("{}: {}", err_msg, e);
            Err(anyhow!(e).context(err_msg))
        }
    }
}

fn optional_var(name: &str, default: &str) -> String {
    env::var(name)
        .map(|val| {
            log::info!("Config: Using {} from env: {}", name, val);
            val
        })
        .unwrap_or_else(|_| {
            log::info!("Config: Using default {}: {}", name, default);
            default.to_string()
        })
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self> {
        // Load .env file if present (optional)
        let _ = dotenv::dotenv();

        let raw_targets = required_var("MAILSCRIBE_TARGET_EMAILS")?;
        let target_emails: Vec<String> = raw_targets
            .split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect();
        if target_emails.is_empty() {
            let err_msg = "MAILSCRIBE_TARGET_EMAILS must contain at least one address";
            log::error!("{}", err_msg);
            return Err(anyhow!(err_msg));
        }
        log::info!("Config: Using target_emails: {:?}", target_emails);

        let webhook_url = required_var("MAILSCRIBE_WEBHOOK_URL")?;
        log::info!("Config: Using webhook_url: {}", webhook_url);

        let rewrite_api_key = required_var("MAILSCRIBE_REWRITE_API_KEY")?;
        log::info!("Config: rewrite_api_key is set");

        let rewrite_url = optional_var("MAILSCRIBE_REWRITE_URL", DEFAULT_REWRITE_URL);
        let rewrite_model = optional_var("MAILSCRIBE_REWRITE_MODEL", DEFAULT_REWRITE_MODEL);
        let smtp_bind_address = optional_var("MAILSCRIBE_BIND_ADDRESS", "0.0.0.0");

        let smtp_port_str = env::var("MAILSCRIBE_PORT").unwrap_or_else(|_| "2525".to_string()); // Use a non-privileged port by default
        let smtp_port = match smtp_port_str.parse::<u16>() {
            Ok(port) => port,
            Err(e) => {
                let err_msg = format!(
                    "MAILSCRIBE_PORT ('{}') must be a valid port number",
                    smtp_port_str
                );
                log::error!("{}: {}", err_msg, e);
                return Err(anyhow!(e).context(err_msg));
            }
        };
        log::info!("Config: Using smtp_port: {}", smtp_port);

        Ok(Config {
            target_emails,
            webhook_url,
            rewrite_url,
            rewrite_model,
            rewrite_api_key,
            smtp_bind_address,
            smtp_port,
        })
    }

    #[cfg(test)]
    pub(crate) fn for_tests() -> Self {
        Config {
            target_emails: vec!["test@example.com".to_string()],
            webhook_url: "http://example.com/webhook".to_string(),
            rewrite_url: "http://example.com/v1/chat/completions".to_string(),
            rewrite_model: DEFAULT_REWRITE_MODEL.to_string(),
            rewrite_api_key: "test-key".to_string(),
            smtp_bind_address: "127.0.0.1".to_string(),
            smtp_port: 2525,
        }
    }
}
