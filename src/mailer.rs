use std::io::Write;
use std::path::PathBuf;

use serde_json::json;
use thiserror::Error;

use crate::config::MailerConfig;

#[derive(Debug, Error)]
pub enum MailerError {
    #[error("no mail transport is configured")]
    NotConfigured,
    #[error("mail transport error: {0}")]
    Transport(String),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub struct SendReceipt {
    pub message_id: Option<String>,
}

/// Outbound mail boundary. One delivery attempt per call; retry policy, if
/// any, belongs to the caller.
pub trait Mailer: Send {
    fn send(&self, to: &str, subject: &str, html_body: &str) -> Result<SendReceipt, MailerError>;
}

pub fn from_config(cfg: &MailerConfig) -> Box<dyn Mailer> {
    if let Some(path) = &cfg.outbox_path {
        return Box::new(OutboxMailer { path: path.clone() });
    }
    if let Some(key) = &cfg.api_key {
        return Box::new(SendGridMailer::new(
            cfg.api_url.clone(),
            key.clone(),
            cfg.from_email.clone(),
        ));
    }
    Box::new(UnconfiguredMailer)
}

/// SendGrid v3 mail/send over blocking HTTP.
pub struct SendGridMailer {
    client: reqwest::blocking::Client,
    api_url: String,
    api_key: String,
    from_email: String,
}

impl SendGridMailer {
    pub fn new(api_url: String, api_key: String, from_email: String) -> Self {
        Self {
            client: reqwest::blocking::Client::new(),
            api_url,
            api_key,
            from_email,
        }
    }
}

impl Mailer for SendGridMailer {
    fn send(&self, to: &str, subject: &str, html_body: &str) -> Result<SendReceipt, MailerError> {
        let resp = self
            .client
            .post(&self.api_url)
            .bearer_auth(&self.api_key)
            .json(&json!({
                "personalizations": [{
                    "to": [{ "email": to }],
                    "subject": subject,
                }],
                "from": { "email": self.from_email },
                "content": [{
                    "type": "text/html",
                    "value": html_body,
                }],
            }))
            .send()
            .map_err(|e| MailerError::Transport(e.to_string()))?;

        let status = resp.status();
        if !status.is_success() {
            let detail = resp
                .json::<serde_json::Value>()
                .ok()
                .and_then(|body| {
                    body.pointer("/errors/0/message")
                        .and_then(|m| m.as_str())
                        .map(String::from)
                })
                .unwrap_or_else(|| status.to_string());
            return Err(MailerError::Transport(detail));
        }

        let message_id = resp
            .headers()
            .get("x-message-id")
            .and_then(|v| v.to_str().ok())
            .map(String::from);
        Ok(SendReceipt { message_id })
    }
}

/// Development transport: one JSON line per message appended to a file.
pub struct OutboxMailer {
    pub path: PathBuf,
}

impl Mailer for OutboxMailer {
    fn send(&self, to: &str, subject: &str, html_body: &str) -> Result<SendReceipt, MailerError> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let mut file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        let line = json!({
            "to": to,
            "subject": subject,
            "html": html_body,
        });
        writeln!(file, "{line}")?;
        Ok(SendReceipt { message_id: None })
    }
}

/// Fails every send. Drained records are still consumed, so a missing
/// transport drops notifications instead of wedging the queue.
pub struct UnconfiguredMailer;

impl Mailer for UnconfiguredMailer {
    fn send(&self, _to: &str, _subject: &str, _html_body: &str) -> Result<SendReceipt, MailerError> {
        Err(MailerError::NotConfigured)
    }
}

pub fn change_alert_email(
    class_section: &str,
    change_summary: &str,
    dashboard_url: &str,
) -> (String, String) {
    let subject = format!("Timetable Change Alert - {class_section}");
    let html = format!(
        "<html><body>\
         <h1>Timetable Change Alert</h1>\
         <p>There has been a change to your <strong>{class_section}</strong> timetable.</p>\
         <p><strong>{change_summary}</strong></p>\
         <p><a href=\"{dashboard_url}\">View Updated Timetable</a></p>\
         <p><em>This notification was sent automatically. Please log in to your \
         student dashboard to see the changes.</em></p>\
         </body></html>"
    );
    (subject, html)
}
