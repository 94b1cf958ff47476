use crate::ipc::error::ok;
use crate::ipc::helpers::{now_rfc3339, require_str, resolve_session, HandlerErr};
use crate::ipc::types::{AppState, Request};
use rusqlite::{Connection, OptionalExtension, Transaction};
use serde_json::json;
use uuid::Uuid;

struct TeacherRow {
    id: String,
    teacher_name: String,
    email: String,
    class_section: String,
    login_handle: String,
}

fn teacher_by_account(conn: &Connection, account_id: &str) -> Result<TeacherRow, HandlerErr> {
    let row = conn
        .query_row(
            "SELECT id, teacher_name, email, class_section, login_handle
             FROM teachers WHERE account_id = ?",
            [account_id],
            |r| {
                Ok(TeacherRow {
                    id: r.get(0)?,
                    teacher_name: r.get(1)?,
                    email: r.get(2)?,
                    class_section: r.get(3)?,
                    login_handle: r.get(4)?,
                })
            },
        )
        .optional()
        .map_err(HandlerErr::query)?;
    row.ok_or_else(|| HandlerErr::new("not_found", "teacher not found"))
}

fn precheck_free(
    conn: &Connection,
    column: &str,
    value: &str,
    taken_message: &str,
) -> Result<(), HandlerErr> {
    let sql = format!("SELECT id FROM teachers WHERE {column} = ?");
    let existing: Option<String> = conn
        .query_row(&sql, [value], |r| r.get(0))
        .optional()
        .map_err(HandlerErr::query)?;
    if existing.is_some() {
        return Err(HandlerErr::new("duplicate", taken_message));
    }
    Ok(())
}

fn handle_register(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return HandlerErr::new("no_workspace", "select a workspace first").response(&req.id);
    };

    let run = || -> Result<serde_json::Value, HandlerErr> {
        let login_handle = require_str(&req.params, "loginHandle")?.trim().to_string();
        let teacher_name = require_str(&req.params, "teacherName")?.trim().to_string();
        let email = require_str(&req.params, "email")?.trim().to_string();
        let class_section = require_str(&req.params, "classSection")?.trim().to_string();
        let password = require_str(&req.params, "password")?;
        let confirm_password = require_str(&req.params, "confirmPassword")?;
        if login_handle.is_empty() || teacher_name.is_empty() || class_section.is_empty() {
            return Err(HandlerErr::new(
                "bad_params",
                "loginHandle, teacherName and classSection must not be empty",
            ));
        }
        if password != confirm_password {
            return Err(HandlerErr::new("validation_failed", "passwords do not match"));
        }
        if password.len() < crate::auth::MIN_PASSWORD_LEN {
            return Err(HandlerErr::new(
                "validation_failed",
                format!(
                    "password must be at least {} characters long",
                    crate::auth::MIN_PASSWORD_LEN
                ),
            ));
        }

        // Uniqueness is a precheck, not a constraint: two racing
        // registrations can both pass. Acceptable for this usage pattern.
        precheck_free(
            conn,
            "class_section",
            &class_section,
            "this class and section is already registered",
        )?;
        precheck_free(
            conn,
            "login_handle",
            &login_handle,
            "login handle is already taken",
        )?;
        precheck_free(conn, "email", &email, "email is already registered")?;

        let account_id = super::auth::create_account(conn, &email, &password, "teacher")?;

        let teacher_id = Uuid::new_v4().to_string();
        let inserted = conn.execute(
            "INSERT INTO teachers(id, account_id, teacher_name, email, class_section, login_handle, created_at)
             VALUES(?, ?, ?, ?, ?, ?, ?)",
            (
                &teacher_id,
                &account_id,
                &teacher_name,
                &email,
                &class_section,
                &login_handle,
                now_rfc3339(),
            ),
        );
        if let Err(e) = inserted {
            // Don't leave an account that can sign in but owns nothing.
            let _ = super::auth::delete_account(conn, &account_id);
            return Err(HandlerErr::with_details(
                "db_insert_failed",
                e.to_string(),
                json!({ "table": "teachers" }),
            ));
        }

        Ok(json!({
            "teacherId": teacher_id,
            "teacherName": teacher_name,
            "classSection": class_section,
        }))
    };

    match run() {
        Ok(result) => ok(&req.id, result),
        Err(e) => e.response(&req.id),
    }
}

fn handle_login(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return HandlerErr::new("no_workspace", "select a workspace first").response(&req.id);
    };

    let run = || -> Result<serde_json::Value, HandlerErr> {
        let login_handle = require_str(&req.params, "loginHandle")?;
        let password = require_str(&req.params, "password")?;

        // The identity layer only accepts email credentials; the handle is
        // resolved here first.
        let teacher: Option<(String, String, String, String)> = conn
            .query_row(
                "SELECT id, teacher_name, email, class_section
                 FROM teachers WHERE login_handle = ?",
                [&login_handle],
                |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?, r.get(3)?)),
            )
            .optional()
            .map_err(HandlerErr::query)?;
        let Some((teacher_id, teacher_name, email, class_section)) = teacher else {
            return Err(HandlerErr::new(
                "invalid_credentials",
                "invalid login handle or password",
            ));
        };

        let mut result = super::auth::sign_in(conn, &email, &password).map_err(|e| {
            if e.code == "invalid_credentials" {
                HandlerErr::new("invalid_credentials", "invalid login handle or password")
            } else {
                e
            }
        })?;
        result["teacherId"] = json!(teacher_id);
        result["teacherName"] = json!(teacher_name);
        result["classSection"] = json!(class_section);
        Ok(result)
    };

    match run() {
        Ok(result) => ok(&req.id, result),
        Err(e) => e.response(&req.id),
    }
}

fn handle_get(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return HandlerErr::new("no_workspace", "select a workspace first").response(&req.id);
    };

    let run = || -> Result<serde_json::Value, HandlerErr> {
        let token = require_str(&req.params, "token")?;
        let account = resolve_session(conn, &token)?;
        let teacher = teacher_by_account(conn, &account.account_id)?;
        Ok(json!({
            "teacherId": teacher.id,
            "teacherName": teacher.teacher_name,
            "email": teacher.email,
            "classSection": teacher.class_section,
            "loginHandle": teacher.login_handle,
        }))
    };

    match run() {
        Ok(result) => ok(&req.id, result),
        Err(e) => e.response(&req.id),
    }
}

fn cascade_delete(tx: &Transaction, sql: &str, param: &str, table: &str) -> Result<(), HandlerErr> {
    tx.execute(sql, [param]).map_err(|e| {
        HandlerErr::with_details("db_delete_failed", e.to_string(), json!({ "table": table }))
    })?;
    Ok(())
}

fn handle_unregister(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return HandlerErr::new("no_workspace", "select a workspace first").response(&req.id);
    };

    let run = || -> Result<serde_json::Value, HandlerErr> {
        let token = require_str(&req.params, "token")?;
        let account = resolve_session(conn, &token)?;
        let teacher = teacher_by_account(conn, &account.account_id)?;

        // Dependency order: grid cells, then subjects, then the teacher row.
        let tx = conn
            .unchecked_transaction()
            .map_err(|e| HandlerErr::new("db_tx_failed", e.to_string()))?;
        let steps = [
            (
                "DELETE FROM timetable WHERE class_section = ?",
                teacher.class_section.as_str(),
                "timetable",
            ),
            (
                "DELETE FROM subjects WHERE class_section = ?",
                teacher.class_section.as_str(),
                "subjects",
            ),
            ("DELETE FROM teachers WHERE id = ?", teacher.id.as_str(), "teachers"),
        ];
        for (sql, param, table) in steps {
            if let Err(e) = cascade_delete(&tx, sql, param, table) {
                let _ = tx.rollback();
                return Err(e);
            }
        }
        tx.commit()
            .map_err(|e| HandlerErr::new("db_commit_failed", e.to_string()))?;

        conn.execute("DELETE FROM sessions WHERE token = ?", [&token])
            .map_err(|e| HandlerErr::new("db_delete_failed", e.to_string()))?;

        Ok(json!({ "classSection": teacher.class_section }))
    };

    match run() {
        Ok(result) => ok(&req.id, result),
        Err(e) => e.response(&req.id),
    }
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "teachers.register" => Some(handle_register(state, req)),
        "teachers.login" => Some(handle_login(state, req)),
        "teachers.get" => Some(handle_get(state, req)),
        "teachers.unregister" => Some(handle_unregister(state, req)),
        _ => None,
    }
}
