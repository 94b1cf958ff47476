use std::path::PathBuf;
use std::time::Duration;

const DEFAULT_SENDGRID_URL: &str = "https://api.sendgrid.com/v3/mail/send";
const DEFAULT_FROM_EMAIL: &str = "noreply@timetabled.local";
const DEFAULT_DASHBOARD_URL: &str = "http://localhost:5173/student-dashboard";
const DEFAULT_SEND_DELAY_MS: u64 = 1000;

/// Built once in `main` from the environment and handed to `AppState`.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub mail: MailerConfig,
    /// When set, a student may hold at most one active registration across
    /// all classes.
    pub single_class_limit: bool,
}

#[derive(Debug, Clone)]
pub struct MailerConfig {
    pub api_url: String,
    pub api_key: Option<String>,
    pub from_email: String,
    /// When set, mail is appended to this file instead of going over HTTP.
    pub outbox_path: Option<PathBuf>,
    /// Pause between sends in a drain pass, to stay under provider rate limits.
    pub send_delay: Duration,
    /// Link target embedded in change-alert mail.
    pub dashboard_url: String,
}

impl Default for MailerConfig {
    fn default() -> Self {
        Self {
            api_url: DEFAULT_SENDGRID_URL.to_string(),
            api_key: None,
            from_email: DEFAULT_FROM_EMAIL.to_string(),
            outbox_path: None,
            send_delay: Duration::from_millis(DEFAULT_SEND_DELAY_MS),
            dashboard_url: DEFAULT_DASHBOARD_URL.to_string(),
        }
    }
}

impl AppConfig {
    pub fn from_env() -> Self {
        let send_delay = std::env::var("TIMETABLED_SEND_DELAY_MS")
            .ok()
            .and_then(|v| v.parse::<u64>().ok())
            .map(Duration::from_millis)
            .unwrap_or(Duration::from_millis(DEFAULT_SEND_DELAY_MS));

        let mail = MailerConfig {
            api_url: std::env::var("TIMETABLED_SENDGRID_API_URL")
                .unwrap_or_else(|_| DEFAULT_SENDGRID_URL.to_string()),
            api_key: std::env::var("TIMETABLED_SENDGRID_API_KEY").ok(),
            from_email: std::env::var("TIMETABLED_FROM_EMAIL")
                .unwrap_or_else(|_| DEFAULT_FROM_EMAIL.to_string()),
            outbox_path: std::env::var("TIMETABLED_OUTBOX_PATH")
                .ok()
                .map(PathBuf::from),
            send_delay,
            dashboard_url: std::env::var("TIMETABLED_DASHBOARD_URL")
                .unwrap_or_else(|_| DEFAULT_DASHBOARD_URL.to_string()),
        };

        Self {
            mail,
            single_class_limit: std::env::var("TIMETABLED_MULTI_CLASS")
                .map(|v| v != "1")
                .unwrap_or(true),
        }
    }
}
