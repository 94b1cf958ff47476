use crate::auth;
use crate::ipc::error::ok;
use crate::ipc::helpers::{now_rfc3339, require_str, resolve_session, HandlerErr};
use crate::ipc::types::{AppState, Request};
use rusqlite::{Connection, OptionalExtension};
use serde_json::json;
use uuid::Uuid;

/// Creates an identity account. Shared with teacher registration, which
/// wraps it in its own precheck-and-cleanup flow.
pub(super) fn create_account(
    conn: &Connection,
    email: &str,
    password: &str,
    user_type: &str,
) -> Result<String, HandlerErr> {
    if password.len() < auth::MIN_PASSWORD_LEN {
        return Err(HandlerErr::new(
            "validation_failed",
            format!(
                "password must be at least {} characters long",
                auth::MIN_PASSWORD_LEN
            ),
        ));
    }

    let existing: Option<String> = conn
        .query_row("SELECT id FROM accounts WHERE email = ?", [email], |r| {
            r.get(0)
        })
        .optional()
        .map_err(HandlerErr::query)?;
    if existing.is_some() {
        return Err(HandlerErr::new("duplicate", "email is already registered"));
    }

    let password_hash = auth::hash_password(password)
        .map_err(|e| HandlerErr::new("internal", e.to_string()))?;
    let account_id = Uuid::new_v4().to_string();
    conn.execute(
        "INSERT INTO accounts(id, email, password_hash, user_type, created_at)
         VALUES(?, ?, ?, ?, ?)",
        (&account_id, email, &password_hash, user_type, now_rfc3339()),
    )
    .map_err(|e| {
        HandlerErr::with_details(
            "db_insert_failed",
            e.to_string(),
            json!({ "table": "accounts" }),
        )
    })?;

    Ok(account_id)
}

pub(super) fn delete_account(conn: &Connection, account_id: &str) -> Result<(), HandlerErr> {
    conn.execute("DELETE FROM accounts WHERE id = ?", [account_id])
        .map_err(|e| HandlerErr::new("db_delete_failed", e.to_string()))?;
    Ok(())
}

/// Email/password sign-in: verifies the hash and mints a session token.
/// Wrong email and wrong password are indistinguishable to the caller.
pub(super) fn sign_in(
    conn: &Connection,
    email: &str,
    password: &str,
) -> Result<serde_json::Value, HandlerErr> {
    let account: Option<(String, String, String)> = conn
        .query_row(
            "SELECT id, password_hash, user_type FROM accounts WHERE email = ?",
            [email],
            |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?)),
        )
        .optional()
        .map_err(HandlerErr::query)?;

    let Some((account_id, password_hash, user_type)) = account else {
        return Err(HandlerErr::new(
            "invalid_credentials",
            "invalid email or password",
        ));
    };

    let verified = auth::verify_password(password, &password_hash)
        .map_err(|e| HandlerErr::new("internal", e.to_string()))?;
    if !verified {
        return Err(HandlerErr::new(
            "invalid_credentials",
            "invalid email or password",
        ));
    }

    let token = Uuid::new_v4().to_string();
    conn.execute(
        "INSERT INTO sessions(token, account_id, created_at) VALUES(?, ?, ?)",
        (&token, &account_id, now_rfc3339()),
    )
    .map_err(|e| HandlerErr::new("db_insert_failed", e.to_string()))?;

    Ok(json!({
        "token": token,
        "accountId": account_id,
        "email": email,
        "userType": user_type,
    }))
}

fn handle_sign_up(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return HandlerErr::new("no_workspace", "select a workspace first").response(&req.id);
    };

    let run = || -> Result<serde_json::Value, HandlerErr> {
        let email = require_str(&req.params, "email")?;
        let password = require_str(&req.params, "password")?;
        let user_type = req
            .params
            .get("userType")
            .and_then(|v| v.as_str())
            .unwrap_or("student")
            .to_string();
        let account_id = create_account(conn, &email, &password, &user_type)?;
        Ok(json!({ "accountId": account_id, "email": email, "userType": user_type }))
    };

    match run() {
        Ok(result) => ok(&req.id, result),
        Err(e) => e.response(&req.id),
    }
}

fn handle_sign_in(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return HandlerErr::new("no_workspace", "select a workspace first").response(&req.id);
    };

    let run = || -> Result<serde_json::Value, HandlerErr> {
        let email = require_str(&req.params, "email")?;
        let password = require_str(&req.params, "password")?;
        sign_in(conn, &email, &password)
    };

    match run() {
        Ok(result) => ok(&req.id, result),
        Err(e) => e.response(&req.id),
    }
}

fn handle_sign_out(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return HandlerErr::new("no_workspace", "select a workspace first").response(&req.id);
    };

    let run = || -> Result<serde_json::Value, HandlerErr> {
        let token = require_str(&req.params, "token")?;
        let removed = conn
            .execute("DELETE FROM sessions WHERE token = ?", [&token])
            .map_err(|e| HandlerErr::new("db_delete_failed", e.to_string()))?;
        Ok(json!({ "signedOut": removed > 0 }))
    };

    match run() {
        Ok(result) => ok(&req.id, result),
        Err(e) => e.response(&req.id),
    }
}

fn handle_session(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return HandlerErr::new("no_workspace", "select a workspace first").response(&req.id);
    };

    let run = || -> Result<serde_json::Value, HandlerErr> {
        let token = require_str(&req.params, "token")?;
        let account = resolve_session(conn, &token)?;

        // Role detection: an owned class wins, then a student record,
        // then whatever the account was created as.
        let teacher: Option<(String, String)> = conn
            .query_row(
                "SELECT id, class_section FROM teachers WHERE account_id = ?",
                [&account.account_id],
                |r| Ok((r.get(0)?, r.get(1)?)),
            )
            .optional()
            .map_err(HandlerErr::query)?;
        if let Some((teacher_id, class_section)) = teacher {
            return Ok(json!({
                "accountId": account.account_id,
                "email": account.email,
                "userType": "teacher",
                "teacherId": teacher_id,
                "classSection": class_section,
            }));
        }

        let student_id: Option<String> = conn
            .query_row(
                "SELECT id FROM students WHERE account_id = ?",
                [&account.account_id],
                |r| r.get(0),
            )
            .optional()
            .map_err(HandlerErr::query)?;
        if let Some(student_id) = student_id {
            return Ok(json!({
                "accountId": account.account_id,
                "email": account.email,
                "userType": "student",
                "studentId": student_id,
            }));
        }

        Ok(json!({
            "accountId": account.account_id,
            "email": account.email,
            "userType": account.user_type,
        }))
    };

    match run() {
        Ok(result) => ok(&req.id, result),
        Err(e) => e.response(&req.id),
    }
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "auth.signUp" => Some(handle_sign_up(state, req)),
        "auth.signIn" => Some(handle_sign_in(state, req)),
        "auth.signOut" => Some(handle_sign_out(state, req)),
        "auth.session" => Some(handle_session(state, req)),
        _ => None,
    }
}
