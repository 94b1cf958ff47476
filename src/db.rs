use rusqlite::Connection;
use std::path::Path;

pub fn open_db(workspace: &Path) -> anyhow::Result<Connection> {
    std::fs::create_dir_all(workspace)?;
    let db_path = workspace.join("timetable.sqlite3");
    let conn = Connection::open(db_path)?;
    conn.execute("PRAGMA foreign_keys = ON", [])?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS accounts(
            id TEXT PRIMARY KEY,
            email TEXT NOT NULL UNIQUE,
            password_hash TEXT NOT NULL,
            user_type TEXT NOT NULL,
            created_at TEXT NOT NULL
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS sessions(
            token TEXT PRIMARY KEY,
            account_id TEXT NOT NULL,
            created_at TEXT NOT NULL,
            FOREIGN KEY(account_id) REFERENCES accounts(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_sessions_account ON sessions(account_id)",
        [],
    )?;

    // class_section and login_handle are unique by registration-time precheck,
    // not by constraint.
    conn.execute(
        "CREATE TABLE IF NOT EXISTS teachers(
            id TEXT PRIMARY KEY,
            account_id TEXT NOT NULL,
            teacher_name TEXT NOT NULL,
            email TEXT NOT NULL,
            class_section TEXT NOT NULL,
            login_handle TEXT NOT NULL,
            created_at TEXT NOT NULL,
            FOREIGN KEY(account_id) REFERENCES accounts(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_teachers_class ON teachers(class_section)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_teachers_handle ON teachers(login_handle)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS students(
            id TEXT PRIMARY KEY,
            account_id TEXT NOT NULL,
            email TEXT NOT NULL,
            created_at TEXT NOT NULL,
            FOREIGN KEY(account_id) REFERENCES accounts(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_students_account ON students(account_id)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS subjects(
            id TEXT PRIMARY KEY,
            class_section TEXT NOT NULL,
            subject_name TEXT NOT NULL
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_subjects_class ON subjects(class_section)",
        [],
    )?;

    // One row per occupied slot; day is 1..=5 (Monday=1), period is 1..=8.
    // Slot uniqueness is enforced by check-before-write in the grid handlers.
    conn.execute(
        "CREATE TABLE IF NOT EXISTS timetable(
            id TEXT PRIMARY KEY,
            class_section TEXT NOT NULL,
            day INTEGER NOT NULL,
            period INTEGER NOT NULL,
            subject_id TEXT NOT NULL,
            FOREIGN KEY(subject_id) REFERENCES subjects(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_timetable_class ON timetable(class_section)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_timetable_subject ON timetable(subject_id)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS student_registrations(
            id TEXT PRIMARY KEY,
            student_id TEXT NOT NULL,
            class_section TEXT NOT NULL,
            registered_at TEXT NOT NULL,
            FOREIGN KEY(student_id) REFERENCES students(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_registrations_student ON student_registrations(student_id)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_registrations_class ON student_registrations(class_section)",
        [],
    )?;

    // Append-only change log. Integer ids give insertion order.
    conn.execute(
        "CREATE TABLE IF NOT EXISTS timetable_changes(
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            class_section TEXT NOT NULL,
            day INTEGER NOT NULL,
            period INTEGER NOT NULL,
            old_subject_id TEXT,
            new_subject_id TEXT,
            changed_at TEXT NOT NULL
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_changes_class ON timetable_changes(class_section)",
        [],
    )?;

    // Pending outbound mail, drained in ascending id order.
    conn.execute(
        "CREATE TABLE IF NOT EXISTS email_notifications(
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            class_section TEXT NOT NULL,
            change_summary TEXT NOT NULL,
            notification_link TEXT NOT NULL,
            created_at TEXT NOT NULL
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_email_notifications_class ON email_notifications(class_section)",
        [],
    )?;

    Ok(conn)
}
