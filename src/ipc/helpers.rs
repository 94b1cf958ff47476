use rusqlite::{Connection, OptionalExtension};

use crate::ipc::error::err;

pub struct HandlerErr {
    pub code: &'static str,
    pub message: String,
    pub details: Option<serde_json::Value>,
}

impl HandlerErr {
    pub fn new(code: &'static str, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            details: None,
        }
    }

    pub fn with_details(
        code: &'static str,
        message: impl Into<String>,
        details: serde_json::Value,
    ) -> Self {
        Self {
            code,
            message: message.into(),
            details: Some(details),
        }
    }

    pub fn query(e: rusqlite::Error) -> Self {
        Self::new("db_query_failed", e.to_string())
    }

    pub fn response(self, id: &str) -> serde_json::Value {
        err(id, self.code, self.message, self.details)
    }
}

pub fn require_str(params: &serde_json::Value, key: &str) -> Result<String, HandlerErr> {
    match params.get(key).and_then(|v| v.as_str()) {
        Some(v) => Ok(v.to_string()),
        None => Err(HandlerErr::new("bad_params", format!("missing {key}"))),
    }
}

pub fn require_i64(params: &serde_json::Value, key: &str) -> Result<i64, HandlerErr> {
    match params.get(key).and_then(|v| v.as_i64()) {
        Some(v) => Ok(v),
        None => Err(HandlerErr::new("bad_params", format!("missing {key}"))),
    }
}

pub fn now_rfc3339() -> String {
    chrono::Utc::now().to_rfc3339()
}

pub struct SessionAccount {
    pub account_id: String,
    pub email: String,
    pub user_type: String,
}

pub fn resolve_session(conn: &Connection, token: &str) -> Result<SessionAccount, HandlerErr> {
    let account = conn
        .query_row(
            "SELECT a.id, a.email, a.user_type
             FROM sessions s
             JOIN accounts a ON a.id = s.account_id
             WHERE s.token = ?",
            [token],
            |r| {
                Ok(SessionAccount {
                    account_id: r.get(0)?,
                    email: r.get(1)?,
                    user_type: r.get(2)?,
                })
            },
        )
        .optional()
        .map_err(HandlerErr::query)?;

    account.ok_or_else(|| HandlerErr::new("invalid_credentials", "no session for token"))
}
