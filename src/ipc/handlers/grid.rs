use crate::ipc::error::ok;
use crate::ipc::helpers::{now_rfc3339, require_i64, require_str, HandlerErr};
use crate::ipc::types::{AppState, Request};
use rusqlite::{Connection, OptionalExtension};
use serde_json::json;
use std::collections::{HashMap, HashSet};
use uuid::Uuid;

pub const DAY_MIN: i64 = 1; // Monday
pub const DAY_MAX: i64 = 5;
pub const PERIOD_MIN: i64 = 1;
pub const PERIOD_MAX: i64 = 8;

const CHANGE_SUMMARY: &str = "Timetable has been updated";

pub fn check_slot(day: i64, period: i64) -> Result<(), HandlerErr> {
    if !(DAY_MIN..=DAY_MAX).contains(&day) {
        return Err(HandlerErr::with_details(
            "validation_failed",
            format!("day must be {DAY_MIN}..={DAY_MAX}"),
            json!({ "day": day }),
        ));
    }
    if !(PERIOD_MIN..=PERIOD_MAX).contains(&period) {
        return Err(HandlerErr::with_details(
            "validation_failed",
            format!("period must be {PERIOD_MIN}..={PERIOD_MAX}"),
            json!({ "period": period }),
        ));
    }
    Ok(())
}

fn check_subject_in_class(
    conn: &Connection,
    class_section: &str,
    subject_id: &str,
) -> Result<(), HandlerErr> {
    let found: Option<String> = conn
        .query_row(
            "SELECT id FROM subjects WHERE id = ? AND class_section = ?",
            (subject_id, class_section),
            |r| r.get(0),
        )
        .optional()
        .map_err(HandlerErr::query)?;
    if found.is_none() {
        return Err(HandlerErr::with_details(
            "not_found",
            "subject not found for class",
            json!({ "subjectId": subject_id }),
        ));
    }
    Ok(())
}

fn current_cell(
    conn: &Connection,
    class_section: &str,
    day: i64,
    period: i64,
) -> Result<Option<(String, String)>, HandlerErr> {
    conn.query_row(
        "SELECT id, subject_id FROM timetable
         WHERE class_section = ? AND day = ? AND period = ?",
        (class_section, day, period),
        |r| Ok((r.get(0)?, r.get(1)?)),
    )
    .optional()
    .map_err(HandlerErr::query)
}

fn record_change(
    conn: &Connection,
    class_section: &str,
    day: i64,
    period: i64,
    old_subject: Option<&str>,
    new_subject: Option<&str>,
) -> Result<(), HandlerErr> {
    conn.execute(
        "INSERT INTO timetable_changes(class_section, day, period, old_subject_id, new_subject_id, changed_at)
         VALUES(?, ?, ?, ?, ?, ?)",
        (class_section, day, period, old_subject, new_subject, now_rfc3339()),
    )
    .map_err(|e| {
        HandlerErr::with_details(
            "db_insert_failed",
            e.to_string(),
            json!({ "table": "timetable_changes" }),
        )
    })?;
    Ok(())
}

fn enqueue_notification(
    conn: &Connection,
    class_section: &str,
    notification_link: &str,
) -> Result<(), HandlerErr> {
    conn.execute(
        "INSERT INTO email_notifications(class_section, change_summary, notification_link, created_at)
         VALUES(?, ?, ?, ?)",
        (class_section, CHANGE_SUMMARY, notification_link, now_rfc3339()),
    )
    .map_err(|e| {
        HandlerErr::with_details(
            "db_insert_failed",
            e.to_string(),
            json!({ "table": "email_notifications" }),
        )
    })?;
    Ok(())
}

fn handle_get(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return HandlerErr::new("no_workspace", "select a workspace first").response(&req.id);
    };

    let run = || -> Result<serde_json::Value, HandlerErr> {
        let class_section = require_str(&req.params, "classSection")?;
        let mut stmt = conn
            .prepare(
                "SELECT t.day, t.period, t.subject_id, s.subject_name
                 FROM timetable t
                 JOIN subjects s ON s.id = t.subject_id
                 WHERE t.class_section = ?
                 ORDER BY t.day, t.period",
            )
            .map_err(HandlerErr::query)?;
        let rows = stmt
            .query_map([&class_section], |row| {
                let day: i64 = row.get(0)?;
                let period: i64 = row.get(1)?;
                let subject_id: String = row.get(2)?;
                let subject_name: String = row.get(3)?;
                Ok((day, period, subject_id, subject_name))
            })
            .and_then(|it| it.collect::<Result<Vec<_>, _>>())
            .map_err(HandlerErr::query)?;

        // Fold into {day: {period: cell}}; absent keys are empty slots.
        let mut days = serde_json::Map::new();
        for (day, period, subject_id, subject_name) in rows {
            let entry = days
                .entry(day.to_string())
                .or_insert_with(|| json!({}));
            entry[period.to_string().as_str()] = json!({
                "subjectId": subject_id,
                "subjectName": subject_name,
            });
        }
        Ok(json!({ "grid": serde_json::Value::Object(days) }))
    };

    match run() {
        Ok(result) => ok(&req.id, result),
        Err(e) => e.response(&req.id),
    }
}

fn handle_set_cell(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return HandlerErr::new("no_workspace", "select a workspace first").response(&req.id);
    };
    let notification_link = state.config.mail.dashboard_url.clone();

    let run = || -> Result<serde_json::Value, HandlerErr> {
        let class_section = require_str(&req.params, "classSection")?;
        let day = require_i64(&req.params, "day")?;
        let period = require_i64(&req.params, "period")?;
        let subject_id = require_str(&req.params, "subjectId")?;
        check_slot(day, period)?;
        check_subject_in_class(conn, &class_section, &subject_id)?;

        // Check-before-write keeps the slot unique; concurrent writers to
        // the same slot still race last-writer-wins.
        let existing = current_cell(conn, &class_section, day, period)?;
        if let Some((_, ref old_subject)) = existing {
            if *old_subject == subject_id {
                return Ok(json!({ "day": day, "period": period, "changed": false }));
            }
        }

        let tx = conn
            .unchecked_transaction()
            .map_err(|e| HandlerErr::new("db_tx_failed", e.to_string()))?;
        let written = (|| -> Result<(), HandlerErr> {
            match &existing {
                Some((cell_id, old_subject)) => {
                    tx.execute(
                        "UPDATE timetable SET subject_id = ? WHERE id = ?",
                        (&subject_id, cell_id),
                    )
                    .map_err(|e| HandlerErr::new("db_update_failed", e.to_string()))?;
                    record_change(
                        &tx,
                        &class_section,
                        day,
                        period,
                        Some(old_subject.as_str()),
                        Some(subject_id.as_str()),
                    )?;
                }
                None => {
                    let cell_id = Uuid::new_v4().to_string();
                    tx.execute(
                        "INSERT INTO timetable(id, class_section, day, period, subject_id)
                         VALUES(?, ?, ?, ?, ?)",
                        (&cell_id, &class_section, day, period, &subject_id),
                    )
                    .map_err(|e| {
                        HandlerErr::with_details(
                            "db_insert_failed",
                            e.to_string(),
                            json!({ "table": "timetable" }),
                        )
                    })?;
                    record_change(&tx, &class_section, day, period, None, Some(subject_id.as_str()))?;
                }
            }
            enqueue_notification(&tx, &class_section, &notification_link)
        })();
        if let Err(e) = written {
            let _ = tx.rollback();
            return Err(e);
        }
        tx.commit()
            .map_err(|e| HandlerErr::new("db_commit_failed", e.to_string()))?;

        Ok(json!({ "day": day, "period": period, "changed": true }))
    };

    match run() {
        Ok(result) => ok(&req.id, result),
        Err(e) => e.response(&req.id),
    }
}

fn handle_clear_cell(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return HandlerErr::new("no_workspace", "select a workspace first").response(&req.id);
    };
    let notification_link = state.config.mail.dashboard_url.clone();

    let run = || -> Result<serde_json::Value, HandlerErr> {
        let class_section = require_str(&req.params, "classSection")?;
        let day = require_i64(&req.params, "day")?;
        let period = require_i64(&req.params, "period")?;
        check_slot(day, period)?;

        let Some((cell_id, old_subject)) = current_cell(conn, &class_section, day, period)? else {
            return Ok(json!({ "day": day, "period": period, "cleared": false }));
        };

        let tx = conn
            .unchecked_transaction()
            .map_err(|e| HandlerErr::new("db_tx_failed", e.to_string()))?;
        let written = (|| -> Result<(), HandlerErr> {
            tx.execute("DELETE FROM timetable WHERE id = ?", [&cell_id])
                .map_err(|e| HandlerErr::new("db_delete_failed", e.to_string()))?;
            record_change(&tx, &class_section, day, period, Some(old_subject.as_str()), None)?;
            enqueue_notification(&tx, &class_section, &notification_link)
        })();
        if let Err(e) = written {
            let _ = tx.rollback();
            return Err(e);
        }
        tx.commit()
            .map_err(|e| HandlerErr::new("db_commit_failed", e.to_string()))?;

        Ok(json!({ "day": day, "period": period, "cleared": true }))
    };

    match run() {
        Ok(result) => ok(&req.id, result),
        Err(e) => e.response(&req.id),
    }
}

fn handle_bulk_save(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return HandlerErr::new("no_workspace", "select a workspace first").response(&req.id);
    };
    let notification_link = state.config.mail.dashboard_url.clone();

    let run = || -> Result<serde_json::Value, HandlerErr> {
        let class_section = require_str(&req.params, "classSection")?;
        let Some(raw_cells) = req.params.get("cells").and_then(|v| v.as_array()) else {
            return Err(HandlerErr::new("bad_params", "missing cells"));
        };

        let mut cells: Vec<(i64, i64, String)> = Vec::with_capacity(raw_cells.len());
        let mut seen_slots = HashSet::new();
        for cell in raw_cells {
            let day = require_i64(cell, "day")?;
            let period = require_i64(cell, "period")?;
            let subject_id = require_str(cell, "subjectId")?;
            check_slot(day, period)?;
            if !seen_slots.insert((day, period)) {
                return Err(HandlerErr::with_details(
                    "validation_failed",
                    "duplicate slot in payload",
                    json!({ "day": day, "period": period }),
                ));
            }
            cells.push((day, period, subject_id));
        }
        let subject_ids: HashSet<&str> = cells.iter().map(|(_, _, s)| s.as_str()).collect();
        for subject_id in subject_ids {
            check_subject_in_class(conn, &class_section, subject_id)?;
        }

        // Snapshot the old grid so the change log reflects the actual diff.
        let mut old_grid: HashMap<(i64, i64), String> = HashMap::new();
        {
            let mut stmt = conn
                .prepare("SELECT day, period, subject_id FROM timetable WHERE class_section = ?")
                .map_err(HandlerErr::query)?;
            let rows = stmt
                .query_map([&class_section], |row| {
                    Ok((
                        (row.get::<_, i64>(0)?, row.get::<_, i64>(1)?),
                        row.get::<_, String>(2)?,
                    ))
                })
                .and_then(|it| it.collect::<Result<Vec<_>, _>>())
                .map_err(HandlerErr::query)?;
            old_grid.extend(rows);
        }

        // Two-step replace, deliberately not atomic: a failure below leaves
        // the class's grid partially (or fully) empty.
        conn.execute(
            "DELETE FROM timetable WHERE class_section = ?",
            [&class_section],
        )
        .map_err(|e| HandlerErr::new("db_delete_failed", e.to_string()))?;

        for (n, (day, period, subject_id)) in cells.iter().enumerate() {
            let cell_id = Uuid::new_v4().to_string();
            conn.execute(
                "INSERT INTO timetable(id, class_section, day, period, subject_id)
                 VALUES(?, ?, ?, ?, ?)",
                (&cell_id, &class_section, day, period, subject_id),
            )
            .map_err(|e| {
                HandlerErr::with_details(
                    "partial_save_failed",
                    format!("timetable replace failed after deleting old cells: {e}"),
                    json!({ "inserted": n, "total": cells.len() }),
                )
            })?;
        }

        let mut changed = 0usize;
        for (day, period, subject_id) in &cells {
            match old_grid.remove(&(*day, *period)) {
                Some(old_subject) if old_subject == *subject_id => {}
                Some(old_subject) => {
                    record_change(
                        conn,
                        &class_section,
                        *day,
                        *period,
                        Some(old_subject.as_str()),
                        Some(subject_id.as_str()),
                    )?;
                    changed += 1;
                }
                None => {
                    record_change(
                        conn,
                        &class_section,
                        *day,
                        *period,
                        None,
                        Some(subject_id.as_str()),
                    )?;
                    changed += 1;
                }
            }
        }
        // Whatever is left of the snapshot was cleared by this save.
        for ((day, period), old_subject) in &old_grid {
            record_change(
                conn,
                &class_section,
                *day,
                *period,
                Some(old_subject.as_str()),
                None,
            )?;
            changed += 1;
        }
        if changed > 0 {
            enqueue_notification(conn, &class_section, &notification_link)?;
        }

        Ok(json!({ "saved": cells.len(), "changedSlots": changed }))
    };

    match run() {
        Ok(result) => ok(&req.id, result),
        Err(e) => e.response(&req.id),
    }
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "timetable.get" => Some(handle_get(state, req)),
        "timetable.setCell" => Some(handle_set_cell(state, req)),
        "timetable.clearCell" => Some(handle_clear_cell(state, req)),
        "timetable.bulkSave" => Some(handle_bulk_save(state, req)),
        _ => None,
    }
}
