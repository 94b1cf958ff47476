use serde_json::json;
use std::io::{BufRead, BufReader, Write};
use std::path::PathBuf;
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

fn spawn_sidecar() -> (Child, ChildStdin, BufReader<ChildStdout>) {
    let exe = env!("CARGO_BIN_EXE_timetabled");
    let mut child = Command::new(exe)
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
    if value.get("ok").and_then(|v| v.as_bool()) == Some(false) {
        let code = value
            .get("error")
            .and_then(|e| e.get("code"))
            .and_then(|v| v.as_str())
            .unwrap_or("unknown");
        assert_ne!(
            code, "not_implemented",
            "unexpected unknown method for {}",
            method
        );
    }
    value
}

#[test]
fn router_dispatch_smoke_covers_handler_families() {
    let workspace = temp_dir("timetabled-router-smoke");

    let (mut child, mut stdin, mut reader) = spawn_sidecar();

    let _ = request(&mut stdin, &mut reader, "1", "health", json!({}));
    let _ = request(
        &mut stdin,
        &mut reader,
        "2",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );
    let _ = request(
        &mut stdin,
        &mut reader,
        "3",
        "teachers.register",
        json!({
            "loginHandle": "smoke-teacher",
            "teacherName": "Smoke Teacher",
            "email": "smoke@example.com",
            "classSection": "Grade 1A",
            "password": "secret123",
            "confirmPassword": "secret123",
        }),
    );
    let login = request(
        &mut stdin,
        &mut reader,
        "4",
        "teachers.login",
        json!({ "loginHandle": "smoke-teacher", "password": "secret123" }),
    );
    let token = login
        .pointer("/result/token")
        .and_then(|v| v.as_str())
        .expect("session token")
        .to_string();

    let _ = request(&mut stdin, &mut reader, "5", "teachers.get", json!({ "token": token }));
    let _ = request(
        &mut stdin,
        &mut reader,
        "6",
        "subjects.list",
        json!({ "classSection": "Grade 1A" }),
    );
    let _ = request(
        &mut stdin,
        &mut reader,
        "7",
        "subjects.add",
        json!({ "classSection": "Grade 1A", "subjectName": "Math" }),
    );
    let _ = request(
        &mut stdin,
        &mut reader,
        "8",
        "timetable.get",
        json!({ "classSection": "Grade 1A" }),
    );
    let _ = request(&mut stdin, &mut reader, "9", "classes.list", json!({}));
    let _ = request(
        &mut stdin,
        &mut reader,
        "10",
        "auth.signUp",
        json!({ "email": "smoke-student@example.com", "password": "secret123" }),
    );
    let _ = request(
        &mut stdin,
        &mut reader,
        "11",
        "auth.signIn",
        json!({ "email": "smoke-student@example.com", "password": "secret123" }),
    );
    let _ = request(&mut stdin, &mut reader, "12", "auth.session", json!({ "token": token }));
    let _ = request(&mut stdin, &mut reader, "13", "notifications.drain", json!({}));
    let _ = request(&mut stdin, &mut reader, "14", "auth.signOut", json!({ "token": token }));

    // Unknown methods answer not_implemented; sent raw since the helper
    // treats that code as a routing bug.
    let payload = json!({ "id": "15", "method": "nope.nothing", "params": {} });
    writeln!(stdin, "{}", payload).expect("write request");
    stdin.flush().expect("flush request");
    let mut line = String::new();
    reader.read_line(&mut line).expect("read response line");
    let unknown: serde_json::Value = serde_json::from_str(line.trim()).expect("parse response json");
    assert_eq!(
        unknown.pointer("/error/code").and_then(|v| v.as_str()),
        Some("not_implemented")
    );

    drop(stdin);
    let _ = child.wait();
    let _ = std::fs::remove_dir_all(workspace);
}
