use serde_json::json;
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::process::{Child, ChildStdin, ChildStdout, Command, Stdio};
use std::time::{SystemTime, UNIX_EPOCH};

fn temp_dir(prefix: &str) -> PathBuf {
    let p = std::env::temp_dir().join(format!(
        "{}-{}",
        prefix,
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("clock")
            .as_nanos()
    ));
    std::fs::create_dir_all(&p).expect("create temp dir");
    p
}

// Outbox transport and no inter-send pause, so drains are observable and fast.
fn spawn_sidecar(outbox: &Path) -> (Child, ChildStdin, BufReader<ChildStdout>) {
    let exe = env!("CARGO_BIN_EXE_timetabled");
    let mut child = Command::new(exe)
        .env("TIMETABLED_OUTBOX_PATH", outbox)
        .env("TIMETABLED_SEND_DELAY_MS", "0")
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .spawn()
        .expect("spawn timetabled");
    let stdin = child.stdin.take().expect("child stdin");
    let stdout = child.stdout.take().expect("child stdout");
    (child, stdin, BufReader::new(stdout))
}

fn request(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    id: &str,
    method: &str,
    params: serde_json::Value,
) -> serde_json::Value {
    let payload = json!({
        "id": id,
        "method": method,
        "params": params,
    });
    writeln!(stdin, "{}", payload).expect("write request");
    stdin.flush().expect("flush request");

    let mut line = String::new();
    reader.read_line(&mut line).expect("read response line");
    assert!(!line.trim().is_empty(), "empty response for {}", method);
    let value: serde_json::Value = serde_json::from_str(line.trim()).expect("parse response json");
    assert_eq!(value.get("id").and_then(|v| v.as_str()), Some(id));
    value
}

fn request_ok(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    id: &str,
    method: &str,
    params: serde_json::Value,
) -> serde_json::Value {
    let value = request(stdin, reader, id, method, params);
    assert!(
        value.get("ok").and_then(|v| v.as_bool()).unwrap_or(false),
        "{} failed: {}",
        method,
        value
            .get("error")
            .and_then(|e| e.get("message"))
            .and_then(|v| v.as_str())
            .unwrap_or("unknown error")
    );
    value.get("result").cloned().unwrap_or_else(|| json!({}))
}

fn register_class(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    handle: &str,
    teacher_name: &str,
    class_section: &str,
) {
    let _ = request_ok(
        stdin,
        reader,
        "reg",
        "teachers.register",
        json!({
            "loginHandle": handle,
            "teacherName": teacher_name,
            "email": format!("{handle}@example.com"),
            "classSection": class_section,
            "password": "secret123",
            "confirmPassword": "secret123",
        }),
    );
}

fn add_subject(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    class_section: &str,
    name: &str,
) -> String {
    let res = request_ok(
        stdin,
        reader,
        "addsub",
        "subjects.add",
        json!({ "classSection": class_section, "subjectName": name }),
    );
    res.get("subjectId")
        .and_then(|v| v.as_str())
        .expect("subjectId")
        .to_string()
}

fn ensure_student(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    email: &str,
) -> String {
    let _ = request_ok(
        stdin,
        reader,
        "su",
        "auth.signUp",
        json!({ "email": email, "password": "secret123" }),
    );
    let signin = request_ok(
        stdin,
        reader,
        "si",
        "auth.signIn",
        json!({ "email": email, "password": "secret123" }),
    );
    let token = signin
        .get("token")
        .and_then(|v| v.as_str())
        .expect("token")
        .to_string();
    let ensured = request_ok(stdin, reader, "en", "students.ensure", json!({ "token": token }));
    ensured
        .get("studentId")
        .and_then(|v| v.as_str())
        .expect("studentId")
        .to_string()
}

fn outbox_lines(path: &Path) -> Vec<serde_json::Value> {
    match std::fs::read_to_string(path) {
        Ok(raw) => raw
            .lines()
            .map(|l| serde_json::from_str(l).expect("parse outbox line"))
            .collect(),
        Err(_) => Vec::new(),
    }
}

#[test]
fn drain_groups_records_by_recipient_and_clears_the_queue() {
    let workspace = temp_dir("timetabled-drain-group");
    let outbox = workspace.join("outbox.jsonl");
    let (mut child, mut stdin, mut reader) = spawn_sidecar(&outbox);
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );

    register_class(&mut stdin, &mut reader, "drain", "Drain Teacher", "Grade 8B");
    let math_id = add_subject(&mut stdin, &mut reader, "Grade 8B", "Math");
    let science_id = add_subject(&mut stdin, &mut reader, "Grade 8B", "Science");

    let student_id = ensure_student(&mut stdin, &mut reader, "a@b.com");
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "2",
        "registrations.register",
        json!({ "studentId": student_id, "classSection": "Grade 8B" }),
    );

    // Two grid mutations enqueue two pending records for the same class.
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "3",
        "timetable.setCell",
        json!({ "classSection": "Grade 8B", "day": 1, "period": 1, "subjectId": math_id }),
    );
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "4",
        "timetable.setCell",
        json!({ "classSection": "Grade 8B", "day": 1, "period": 2, "subjectId": science_id }),
    );

    let drained = request_ok(&mut stdin, &mut reader, "5", "notifications.drain", json!({}));
    assert_eq!(drained.get("success").and_then(|v| v.as_bool()), Some(true));
    // Both records drained, but the shared recipient gets one message.
    assert_eq!(drained.get("processed").and_then(|v| v.as_i64()), Some(2));
    assert_eq!(drained.get("emailsSent").and_then(|v| v.as_i64()), Some(1));

    let mail = outbox_lines(&outbox);
    assert_eq!(mail.len(), 1);
    assert_eq!(mail[0].get("to").and_then(|v| v.as_str()), Some("a@b.com"));
    assert_eq!(
        mail[0].get("subject").and_then(|v| v.as_str()),
        Some("Timetable Change Alert - Grade 8B")
    );

    // The queue is empty afterwards.
    let again = request_ok(&mut stdin, &mut reader, "6", "notifications.drain", json!({}));
    assert_eq!(again.get("processed").and_then(|v| v.as_i64()), Some(0));
    assert_eq!(again.get("emailsSent").and_then(|v| v.as_i64()), Some(0));
    assert_eq!(outbox_lines(&outbox).len(), 1);

    drop(stdin);
    let _ = child.wait();
    let _ = std::fs::remove_dir_all(workspace);
}

#[test]
fn drain_reaches_every_registered_student_once() {
    let workspace = temp_dir("timetabled-drain-fanout");
    let outbox = workspace.join("outbox.jsonl");
    let (mut child, mut stdin, mut reader) = spawn_sidecar(&outbox);
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );

    register_class(&mut stdin, &mut reader, "fan", "Fan Teacher", "Grade 4A");
    let art_id = add_subject(&mut stdin, &mut reader, "Grade 4A", "Art");

    for (i, email) in ["one@example.com", "two@example.com"].iter().enumerate() {
        let student_id = ensure_student(&mut stdin, &mut reader, email);
        let _ = request_ok(
            &mut stdin,
            &mut reader,
            &format!("r{i}"),
            "registrations.register",
            json!({ "studentId": student_id, "classSection": "Grade 4A" }),
        );
    }

    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "2",
        "timetable.setCell",
        json!({ "classSection": "Grade 4A", "day": 2, "period": 2, "subjectId": art_id }),
    );

    let drained = request_ok(&mut stdin, &mut reader, "3", "notifications.drain", json!({}));
    assert_eq!(drained.get("processed").and_then(|v| v.as_i64()), Some(1));
    assert_eq!(drained.get("emailsSent").and_then(|v| v.as_i64()), Some(2));

    let mut recipients: Vec<String> = outbox_lines(&outbox)
        .iter()
        .filter_map(|m| m.get("to").and_then(|v| v.as_str()).map(String::from))
        .collect();
    recipients.sort();
    assert_eq!(recipients, vec!["one@example.com", "two@example.com"]);

    drop(stdin);
    let _ = child.wait();
    let _ = std::fs::remove_dir_all(workspace);
}

#[test]
fn noop_mutations_enqueue_nothing() {
    let workspace = temp_dir("timetabled-drain-noop");
    let outbox = workspace.join("outbox.jsonl");
    let (mut child, mut stdin, mut reader) = spawn_sidecar(&outbox);
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );

    register_class(&mut stdin, &mut reader, "noop", "Noop Teacher", "Grade 3B");
    let math_id = add_subject(&mut stdin, &mut reader, "Grade 3B", "Math");

    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "2",
        "timetable.setCell",
        json!({ "classSection": "Grade 3B", "day": 1, "period": 1, "subjectId": math_id }),
    );
    // Identical set, clearing an empty slot, and an identical bulk save all
    // leave the grid as-is.
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "3",
        "timetable.setCell",
        json!({ "classSection": "Grade 3B", "day": 1, "period": 1, "subjectId": math_id }),
    );
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "4",
        "timetable.clearCell",
        json!({ "classSection": "Grade 3B", "day": 5, "period": 5 }),
    );
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "5",
        "timetable.bulkSave",
        json!({
            "classSection": "Grade 3B",
            "cells": [{ "day": 1, "period": 1, "subjectId": math_id }],
        }),
    );

    let drained = request_ok(&mut stdin, &mut reader, "6", "notifications.drain", json!({}));
    // Only the first set produced a pending record.
    assert_eq!(drained.get("processed").and_then(|v| v.as_i64()), Some(1));

    drop(stdin);
    let _ = child.wait();
    let _ = std::fs::remove_dir_all(workspace);
}

#[test]
fn notifications_list_formats_changes_for_registered_classes() {
    let workspace = temp_dir("timetabled-notif-list");
    let outbox = workspace.join("outbox.jsonl");
    let (mut child, mut stdin, mut reader) = spawn_sidecar(&outbox);
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );

    register_class(&mut stdin, &mut reader, "nlist", "List Teacher", "Grade 2C");
    let math_id = add_subject(&mut stdin, &mut reader, "Grade 2C", "Math");
    let science_id = add_subject(&mut stdin, &mut reader, "Grade 2C", "Science");

    let student_id = ensure_student(&mut stdin, &mut reader, "list@example.com");
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "2",
        "registrations.register",
        json!({ "studentId": student_id, "classSection": "Grade 2C" }),
    );

    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "3",
        "timetable.setCell",
        json!({ "classSection": "Grade 2C", "day": 1, "period": 3, "subjectId": math_id }),
    );
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "4",
        "timetable.setCell",
        json!({ "classSection": "Grade 2C", "day": 1, "period": 3, "subjectId": science_id }),
    );

    let listed = request_ok(
        &mut stdin,
        &mut reader,
        "5",
        "notifications.list",
        json!({ "studentId": student_id }),
    );
    let items = listed
        .get("notifications")
        .and_then(|v| v.as_array())
        .expect("notifications");
    let messages: Vec<&str> = items
        .iter()
        .filter(|i| i.get("type").and_then(|v| v.as_str()) == Some("timetable_change"))
        .filter_map(|i| i.get("message").and_then(|v| v.as_str()))
        .collect();
    assert!(messages
        .iter()
        .any(|m| *m == "New subject \"Math\" added to Monday, Period 3"));
    assert!(messages
        .iter()
        .any(|m| *m == "Subject changed from \"Math\" to \"Science\" on Monday, Period 3"));
    // Pending mail shows up alongside the change entries.
    assert!(items
        .iter()
        .any(|i| i.get("type").and_then(|v| v.as_str()) == Some("email_notification")));

    // A student with no registrations sees nothing.
    let other_id = ensure_student(&mut stdin, &mut reader, "other@example.com");
    let empty = request_ok(
        &mut stdin,
        &mut reader,
        "6",
        "notifications.list",
        json!({ "studentId": other_id }),
    );
    assert_eq!(
        empty
            .get("notifications")
            .and_then(|v| v.as_array())
            .map(|a| a.len()),
        Some(0)
    );

    drop(stdin);
    let _ = child.wait();
    let _ = std::fs::remove_dir_all(workspace);
}
