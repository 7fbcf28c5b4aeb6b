//! Session save/resume files.

use std::fs;
use std::io::Write;
use std::path::Path;

use proto::{SessionError, SessionSnapshot};
use tracing::debug;

/// Writes `snapshot` as pretty JSON; the file is owner-only on Unix.
pub fn save_session(path: &Path, snapshot: &SessionSnapshot) -> Result<(), SessionError> {
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        fs::create_dir_all(parent)?;
    }
    let text = snapshot.to_json_pretty()?;

    let mut options = fs::OpenOptions::new();
    options.create(true).write(true).truncate(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(0o600);
    }
    let mut file = options.open(path)?;
    file.write_all(text.as_bytes())?;
    file.write_all(b"\n")?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(path, fs::Permissions::from_mode(0o600))?;
    }
    debug!(path = %path.display(), messages = snapshot.messages.len(), "Session saved");
    Ok(())
}

/// Reads and validates a session file.
pub fn load_session(path: &Path) -> Result<SessionSnapshot, SessionError> {
    let text = fs::read_to_string(path)?;
    SessionSnapshot::from_json(&text)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proto::Message;

    fn snapshot() -> SessionSnapshot {
        SessionSnapshot {
            model: "deepseek-chat".to_string(),
            summary_model: "deepseek-reasoner".to_string(),
            messages: vec![Message::system("sys"), Message::user("hi"), Message::assistant("hello")],
        }
    }

    #[test]
    fn save_then_load_restores_snapshot() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("sessions").join("session.json");
        save_session(&path, &snapshot()).expect("save");
        let loaded = load_session(&path).expect("load");
        assert_eq!(loaded, snapshot());
    }

    #[cfg(unix)]
    #[test]
    fn saved_file_is_owner_only() {
        use std::os::unix::fs::PermissionsExt;
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("session.json");
        fs::write(&path, "old").expect("seed");
        fs::set_permissions(&path, fs::Permissions::from_mode(0o644)).expect("chmod");
        save_session(&path, &snapshot()).expect("save");
        let mode = fs::metadata(&path).expect("meta").permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
    }

    #[test]
    fn load_rejects_invalid_files() {
        let dir = tempfile::tempdir().expect("tempdir");
        let missing = load_session(&dir.path().join("absent.json")).expect_err("missing");
        assert!(matches!(missing, SessionError::Io(_)));

        let path = dir.path().join("bad.json");
        fs::write(&path, "{not json").expect("write");
        assert!(matches!(load_session(&path), Err(SessionError::Serialization(_))));

        fs::write(&path, r#"{"messages": [{"role": "user", "content": "hi"}]}"#).expect("write");
        assert!(matches!(load_session(&path), Err(SessionError::MissingSystem)));
    }
}
