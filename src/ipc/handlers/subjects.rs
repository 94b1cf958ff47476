use crate::ipc::error::ok;
use crate::ipc::helpers::{require_str, HandlerErr};
use crate::ipc::types::{AppState, Request};
use rusqlite::OptionalExtension;
use serde_json::json;
use uuid::Uuid;

fn handle_list(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return HandlerErr::new("no_workspace", "select a workspace first").response(&req.id);
    };

    let run = || -> Result<serde_json::Value, HandlerErr> {
        let class_section = require_str(&req.params, "classSection")?;
        let mut stmt = conn
            .prepare(
                "SELECT id, subject_name FROM subjects
                 WHERE class_section = ?
                 ORDER BY subject_name",
            )
            .map_err(HandlerErr::query)?;
        let subjects = stmt
            .query_map([&class_section], |row| {
                let id: String = row.get(0)?;
                let name: String = row.get(1)?;
                Ok(json!({ "id": id, "subjectName": name }))
            })
            .and_then(|it| it.collect::<Result<Vec<_>, _>>())
            .map_err(HandlerErr::query)?;
        Ok(json!({ "subjects": subjects }))
    };

    match run() {
        Ok(result) => ok(&req.id, result),
        Err(e) => e.response(&req.id),
    }
}

fn handle_add(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return HandlerErr::new("no_workspace", "select a workspace first").response(&req.id);
    };

    let run = || -> Result<serde_json::Value, HandlerErr> {
        let class_section = require_str(&req.params, "classSection")?;
        let subject_name = require_str(&req.params, "subjectName")?.trim().to_string();
        if subject_name.is_empty() {
            return Err(HandlerErr::new("bad_params", "subjectName must not be empty"));
        }

        let existing: Option<String> = conn
            .query_row(
                "SELECT id FROM subjects WHERE class_section = ? AND subject_name = ?",
                (&class_section, &subject_name),
                |r| r.get(0),
            )
            .optional()
            .map_err(HandlerErr::query)?;
        if existing.is_some() {
            return Err(HandlerErr::new(
                "duplicate",
                "failed to add subject, it might already exist",
            ));
        }

        let subject_id = Uuid::new_v4().to_string();
        conn.execute(
            "INSERT INTO subjects(id, class_section, subject_name) VALUES(?, ?, ?)",
            (&subject_id, &class_section, &subject_name),
        )
        .map_err(|e| {
            HandlerErr::with_details(
                "db_insert_failed",
                e.to_string(),
                json!({ "table": "subjects" }),
            )
        })?;

        Ok(json!({ "subjectId": subject_id, "subjectName": subject_name }))
    };

    match run() {
        Ok(result) => ok(&req.id, result),
        Err(e) => e.response(&req.id),
    }
}

fn handle_delete(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return HandlerErr::new("no_workspace", "select a workspace first").response(&req.id);
    };

    let run = || -> Result<serde_json::Value, HandlerErr> {
        let subject_id = require_str(&req.params, "subjectId")?;
        let exists: Option<String> = conn
            .query_row("SELECT id FROM subjects WHERE id = ?", [&subject_id], |r| {
                r.get(0)
            })
            .optional()
            .map_err(HandlerErr::query)?;
        if exists.is_none() {
            return Err(HandlerErr::new("not_found", "subject not found"));
        }

        // Grid cells referencing the subject go first.
        let tx = conn
            .unchecked_transaction()
            .map_err(|e| HandlerErr::new("db_tx_failed", e.to_string()))?;
        let removed_cells = tx
            .execute("DELETE FROM timetable WHERE subject_id = ?", [&subject_id])
            .map_err(|e| {
                HandlerErr::with_details(
                    "db_delete_failed",
                    e.to_string(),
                    json!({ "table": "timetable" }),
                )
            });
        let removed_cells = match removed_cells {
            Ok(n) => n,
            Err(e) => {
                let _ = tx.rollback();
                return Err(e);
            }
        };
        if let Err(e) = tx.execute("DELETE FROM subjects WHERE id = ?", [&subject_id]) {
            let _ = tx.rollback();
            return Err(HandlerErr::with_details(
                "db_delete_failed",
                e.to_string(),
                json!({ "table": "subjects" }),
            ));
        }
        tx.commit()
            .map_err(|e| HandlerErr::new("db_commit_failed", e.to_string()))?;

        Ok(json!({ "removedCells": removed_cells }))
    };

    match run() {
        Ok(result) => ok(&req.id, result),
        Err(e) => e.response(&req.id),
    }
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "subjects.list" => Some(handle_list(state, req)),
        "subjects.add" => Some(handle_add(state, req)),
        "subjects.delete" => Some(handle_delete(state, req)),
        _ => None,
    }
}
