use crate::ipc::error::ok;
use crate::ipc::helpers::{require_str, HandlerErr};
use crate::ipc::types::{AppState, Request};
use crate::mailer::change_alert_email;
use rusqlite::types::Value;
use rusqlite::{params_from_iter, Connection, OptionalExtension};
use serde_json::json;
use std::collections::{HashMap, HashSet};

const DEFAULT_LIST_LIMIT: i64 = 20;

fn day_name(day: i64) -> String {
    match day {
        1 => "Monday".to_string(),
        2 => "Tuesday".to_string(),
        3 => "Wednesday".to_string(),
        4 => "Thursday".to_string(),
        5 => "Friday".to_string(),
        _ => format!("Day {day}"),
    }
}

fn subject_name(
    conn: &Connection,
    cache: &mut HashMap<String, Option<String>>,
    subject_id: &Option<String>,
) -> Result<Option<String>, HandlerErr> {
    let Some(id) = subject_id else {
        return Ok(None);
    };
    if let Some(cached) = cache.get(id) {
        return Ok(cached.clone());
    }
    let name: Option<String> = conn
        .query_row("SELECT subject_name FROM subjects WHERE id = ?", [id], |r| {
            r.get(0)
        })
        .optional()
        .map_err(HandlerErr::query)?;
    cache.insert(id.clone(), name.clone());
    Ok(name)
}

/// Presentation boundary: weekday names exist only in these messages,
/// never in storage.
fn change_message(
    day: i64,
    period: i64,
    old_subject: Option<&str>,
    new_subject: Option<&str>,
) -> String {
    let day = day_name(day);
    match (old_subject, new_subject) {
        (Some(old), Some(new)) => {
            format!("Subject changed from \"{old}\" to \"{new}\" on {day}, Period {period}")
        }
        (Some(old), None) => format!("Subject \"{old}\" removed from {day}, Period {period}"),
        (None, Some(new)) => format!("New subject \"{new}\" added to {day}, Period {period}"),
        (None, None) => format!("Timetable change on {day}, Period {period}"),
    }
}

fn registered_class_sections(
    conn: &Connection,
    student_id: &str,
) -> Result<Vec<String>, HandlerErr> {
    let mut stmt = conn
        .prepare("SELECT class_section FROM student_registrations WHERE student_id = ?")
        .map_err(HandlerErr::query)?;
    stmt.query_map([student_id], |r| r.get(0))
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(HandlerErr::query)
}

fn handle_list(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return HandlerErr::new("no_workspace", "select a workspace first").response(&req.id);
    };

    let run = || -> Result<serde_json::Value, HandlerErr> {
        let student_id = require_str(&req.params, "studentId")?;
        let limit = req
            .params
            .get("limit")
            .and_then(|v| v.as_i64())
            .unwrap_or(DEFAULT_LIST_LIMIT);

        let classes = registered_class_sections(conn, &student_id)?;
        if classes.is_empty() {
            return Ok(json!({ "notifications": [] }));
        }
        let placeholders = vec!["?"; classes.len()].join(", ");
        let mut params: Vec<Value> = classes
            .iter()
            .map(|c| Value::Text(c.clone()))
            .collect();
        params.push(Value::Integer(limit));

        let mut notifications: Vec<(String, serde_json::Value)> = Vec::new();
        let mut name_cache: HashMap<String, Option<String>> = HashMap::new();

        let changes_sql = format!(
            "SELECT id, class_section, day, period, old_subject_id, new_subject_id, changed_at
             FROM timetable_changes
             WHERE class_section IN ({placeholders})
             ORDER BY changed_at DESC
             LIMIT ?"
        );
        let mut stmt = conn.prepare(&changes_sql).map_err(HandlerErr::query)?;
        let changes = stmt
            .query_map(params_from_iter(params.iter()), |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, i64>(2)?,
                    row.get::<_, i64>(3)?,
                    row.get::<_, Option<String>>(4)?,
                    row.get::<_, Option<String>>(5)?,
                    row.get::<_, String>(6)?,
                ))
            })
            .and_then(|it| it.collect::<Result<Vec<_>, _>>())
            .map_err(HandlerErr::query)?;
        for (id, class_section, day, period, old_id, new_id, changed_at) in changes {
            let old_name = subject_name(conn, &mut name_cache, &old_id)?;
            let new_name = subject_name(conn, &mut name_cache, &new_id)?;
            let message = change_message(day, period, old_name.as_deref(), new_name.as_deref());
            notifications.push((
                changed_at.clone(),
                json!({
                    "id": format!("change_{id}"),
                    "type": "timetable_change",
                    "classSection": class_section,
                    "message": message,
                    "timestamp": changed_at,
                    "priority": "high",
                }),
            ));
        }

        let pending_sql = format!(
            "SELECT id, class_section, change_summary, created_at
             FROM email_notifications
             WHERE class_section IN ({placeholders})
             ORDER BY id DESC
             LIMIT ?"
        );
        let mut stmt = conn.prepare(&pending_sql).map_err(HandlerErr::query)?;
        let pending = stmt
            .query_map(params_from_iter(params.iter()), |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, String>(3)?,
                ))
            })
            .and_then(|it| it.collect::<Result<Vec<_>, _>>())
            .map_err(HandlerErr::query)?;
        for (id, class_section, change_summary, created_at) in pending {
            notifications.push((
                created_at.clone(),
                json!({
                    "id": format!("email_{id}"),
                    "type": "email_notification",
                    "classSection": class_section,
                    "message": change_summary,
                    "timestamp": created_at,
                    "priority": "medium",
                }),
            ));
        }

        // Timestamps share a format, so lexical order is time order.
        notifications.sort_by(|a, b| b.0.cmp(&a.0));
        let items: Vec<serde_json::Value> =
            notifications.into_iter().map(|(_, item)| item).collect();
        Ok(json!({ "notifications": items }))
    };

    match run() {
        Ok(result) => ok(&req.id, result),
        Err(e) => e.response(&req.id),
    }
}

fn handle_drain(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return HandlerErr::new("no_workspace", "select a workspace first").response(&req.id);
    };
    let send_delay = state.config.mail.send_delay;
    let mailer = state.mailer.as_ref();

    let run = || -> Result<serde_json::Value, HandlerErr> {
        let mut stmt = conn
            .prepare(
                "SELECT id, class_section, change_summary, notification_link
                 FROM email_notifications
                 ORDER BY id ASC",
            )
            .map_err(HandlerErr::query)?;
        let records = stmt
            .query_map([], |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, String>(3)?,
                ))
            })
            .and_then(|it| it.collect::<Result<Vec<_>, _>>())
            .map_err(HandlerErr::query)?;

        if records.is_empty() {
            return Ok(json!({ "success": true, "processed": 0, "emailsSent": 0 }));
        }

        // One message per recipient per drain, however many records point
        // at their class.
        let mut seen = HashSet::new();
        let mut recipients: Vec<(String, String, String, String)> = Vec::new();
        for (_, class_section, change_summary, notification_link) in &records {
            let mut stmt = conn
                .prepare(
                    "SELECT s.email
                     FROM student_registrations r
                     JOIN students s ON s.id = r.student_id
                     WHERE r.class_section = ?
                     ORDER BY s.email",
                )
                .map_err(HandlerErr::query)?;
            let emails: Vec<String> = stmt
                .query_map([class_section], |r| r.get(0))
                .and_then(|it| it.collect::<Result<Vec<_>, _>>())
                .map_err(HandlerErr::query)?;
            for email in emails {
                if seen.insert(email.clone()) {
                    recipients.push((
                        email,
                        class_section.clone(),
                        change_summary.clone(),
                        notification_link.clone(),
                    ));
                }
            }
        }

        let mut emails_sent = 0usize;
        for (i, (email, class_section, change_summary, notification_link)) in
            recipients.iter().enumerate()
        {
            let (subject, html) =
                change_alert_email(class_section, change_summary, notification_link);
            match mailer.send(email, &subject, &html) {
                Ok(_) => {
                    tracing::info!(recipient = %email, class = %class_section, "sent change notification");
                    emails_sent += 1;
                }
                Err(e) => {
                    // Not retried: the record is still drained below.
                    tracing::warn!(recipient = %email, error = %e, "failed to send change notification");
                }
            }
            if i + 1 < recipients.len() {
                std::thread::sleep(send_delay);
            }
        }

        // Drained regardless of per-recipient outcomes.
        let placeholders = vec!["?"; records.len()].join(", ");
        let delete_sql = format!("DELETE FROM email_notifications WHERE id IN ({placeholders})");
        let ids: Vec<Value> = records.iter().map(|(id, ..)| Value::Integer(*id)).collect();
        conn.execute(&delete_sql, params_from_iter(ids.iter()))
            .map_err(|e| HandlerErr::new("db_delete_failed", e.to_string()))?;

        tracing::info!(
            processed = records.len(),
            emails_sent,
            "drained notification queue"
        );
        Ok(json!({
            "success": true,
            "processed": records.len(),
            "emailsSent": emails_sent,
        }))
    };

    match run() {
        Ok(result) => ok(&req.id, result),
        Err(e) => e.response(&req.id),
    }
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "notifications.list" => Some(handle_list(state, req)),
        "notifications.drain" => Some(handle_drain(state, req)),
        _ => None,
    }
}
