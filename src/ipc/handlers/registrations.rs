use crate::ipc::error::ok;
use crate::ipc::helpers::{now_rfc3339, require_str, resolve_session, HandlerErr};
use crate::ipc::types::{AppState, Request};
use rusqlite::{Connection, OptionalExtension};
use serde_json::json;
use uuid::Uuid;

/// Lazily creates the student row on first dashboard visit.
fn handle_ensure_student(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return HandlerErr::new("no_workspace", "select a workspace first").response(&req.id);
    };

    let run = || -> Result<serde_json::Value, HandlerErr> {
        let token = require_str(&req.params, "token")?;
        let account = resolve_session(conn, &token)?;

        let existing: Option<String> = conn
            .query_row(
                "SELECT id FROM students WHERE account_id = ?",
                [&account.account_id],
                |r| r.get(0),
            )
            .optional()
            .map_err(HandlerErr::query)?;
        if let Some(student_id) = existing {
            return Ok(json!({
                "studentId": student_id,
                "email": account.email,
                "created": false,
            }));
        }

        let student_id = Uuid::new_v4().to_string();
        conn.execute(
            "INSERT INTO students(id, account_id, email, created_at) VALUES(?, ?, ?, ?)",
            (&student_id, &account.account_id, &account.email, now_rfc3339()),
        )
        .map_err(|e| {
            HandlerErr::with_details(
                "db_insert_failed",
                e.to_string(),
                json!({ "table": "students" }),
            )
        })?;

        Ok(json!({
            "studentId": student_id,
            "email": account.email,
            "created": true,
        }))
    };

    match run() {
        Ok(result) => ok(&req.id, result),
        Err(e) => e.response(&req.id),
    }
}

/// Every class is listed regardless of who is registered for it.
fn handle_list_classes(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return HandlerErr::new("no_workspace", "select a workspace first").response(&req.id);
    };

    let run = || -> Result<serde_json::Value, HandlerErr> {
        let mut stmt = conn
            .prepare(
                "SELECT class_section, teacher_name FROM teachers ORDER BY class_section",
            )
            .map_err(HandlerErr::query)?;
        let classes = stmt
            .query_map([], |row| {
                let class_section: String = row.get(0)?;
                let teacher_name: String = row.get(1)?;
                Ok(json!({ "classSection": class_section, "teacherName": teacher_name }))
            })
            .and_then(|it| it.collect::<Result<Vec<_>, _>>())
            .map_err(HandlerErr::query)?;
        Ok(json!({ "classes": classes }))
    };

    match run() {
        Ok(result) => ok(&req.id, result),
        Err(e) => e.response(&req.id),
    }
}

fn student_exists(conn: &Connection, student_id: &str) -> Result<(), HandlerErr> {
    let found: Option<String> = conn
        .query_row("SELECT id FROM students WHERE id = ?", [student_id], |r| {
            r.get(0)
        })
        .optional()
        .map_err(HandlerErr::query)?;
    if found.is_none() {
        return Err(HandlerErr::new("not_found", "student not found"));
    }
    Ok(())
}

fn handle_register(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return HandlerErr::new("no_workspace", "select a workspace first").response(&req.id);
    };
    let single_class_limit = state.config.single_class_limit;

    let run = || -> Result<serde_json::Value, HandlerErr> {
        let student_id = require_str(&req.params, "studentId")?;
        let class_section = require_str(&req.params, "classSection")?;
        student_exists(conn, &student_id)?;

        let class_known: Option<String> = conn
            .query_row(
                "SELECT id FROM teachers WHERE class_section = ?",
                [&class_section],
                |r| r.get(0),
            )
            .optional()
            .map_err(HandlerErr::query)?;
        if class_known.is_none() {
            return Err(HandlerErr::new("not_found", "class not found"));
        }

        // Policy: one registration total under the default cap, otherwise
        // one per class.
        let collision_sql = if single_class_limit {
            "SELECT class_section FROM student_registrations WHERE student_id = ?1"
        } else {
            "SELECT class_section FROM student_registrations
             WHERE student_id = ?1 AND class_section = ?2"
        };
        let existing: Option<String> = if single_class_limit {
            conn.query_row(collision_sql, [&student_id], |r| r.get(0))
        } else {
            conn.query_row(collision_sql, (&student_id, &class_section), |r| r.get(0))
        }
        .optional()
        .map_err(HandlerErr::query)?;
        if let Some(registered_class) = existing {
            return Err(HandlerErr::with_details(
                "already_registered",
                "student already holds a registration",
                json!({ "classSection": registered_class }),
            ));
        }

        let registration_id = Uuid::new_v4().to_string();
        let registered_at = now_rfc3339();
        conn.execute(
            "INSERT INTO student_registrations(id, student_id, class_section, registered_at)
             VALUES(?, ?, ?, ?)",
            (&registration_id, &student_id, &class_section, &registered_at),
        )
        .map_err(|e| {
            HandlerErr::with_details(
                "db_insert_failed",
                e.to_string(),
                json!({ "table": "student_registrations" }),
            )
        })?;

        Ok(json!({
            "registrationId": registration_id,
            "classSection": class_section,
            "registeredAt": registered_at,
        }))
    };

    match run() {
        Ok(result) => ok(&req.id, result),
        Err(e) => e.response(&req.id),
    }
}

fn handle_unregister(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return HandlerErr::new("no_workspace", "select a workspace first").response(&req.id);
    };

    let run = || -> Result<serde_json::Value, HandlerErr> {
        let student_id = require_str(&req.params, "studentId")?;
        let class_section = require_str(&req.params, "classSection")?;
        let removed = conn
            .execute(
                "DELETE FROM student_registrations WHERE student_id = ? AND class_section = ?",
                (&student_id, &class_section),
            )
            .map_err(|e| HandlerErr::new("db_delete_failed", e.to_string()))?;
        Ok(json!({ "removed": removed > 0 }))
    };

    match run() {
        Ok(result) => ok(&req.id, result),
        Err(e) => e.response(&req.id),
    }
}

fn handle_list(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return HandlerErr::new("no_workspace", "select a workspace first").response(&req.id);
    };

    let run = || -> Result<serde_json::Value, HandlerErr> {
        let student_id = require_str(&req.params, "studentId")?;
        student_exists(conn, &student_id)?;

        let mut stmt = conn
            .prepare(
                "SELECT id, class_section, registered_at FROM student_registrations
                 WHERE student_id = ?
                 ORDER BY registered_at",
            )
            .map_err(HandlerErr::query)?;
        let rows: Vec<(String, String, String)> = stmt
            .query_map([&student_id], |row| {
                Ok((row.get(0)?, row.get(1)?, row.get(2)?))
            })
            .and_then(|it| it.collect::<Result<Vec<_>, _>>())
            .map_err(HandlerErr::query)?;

        // Per-row teacher lookup; fine at this scale.
        let mut registrations = Vec::with_capacity(rows.len());
        for (registration_id, class_section, registered_at) in rows {
            let teacher_name: Option<String> = conn
                .query_row(
                    "SELECT teacher_name FROM teachers WHERE class_section = ?",
                    [&class_section],
                    |r| r.get(0),
                )
                .optional()
                .map_err(HandlerErr::query)?;
            registrations.push(json!({
                "registrationId": registration_id,
                "classSection": class_section,
                "teacherName": teacher_name,
                "registeredAt": registered_at,
            }));
        }
        Ok(json!({ "registrations": registrations }))
    };

    match run() {
        Ok(result) => ok(&req.id, result),
        Err(e) => e.response(&req.id),
    }
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "students.ensure" => Some(handle_ensure_student(state, req)),
        "classes.list" => Some(handle_list_classes(state, req)),
        "registrations.register" => Some(handle_register(state, req)),
        "registrations.unregister" => Some(handle_unregister(state, req)),
        "registrations.list" => Some(handle_list(state, req)),
        _ => None,
    }
}
