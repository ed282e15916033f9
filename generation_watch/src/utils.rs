use std::fs::File;
use std::io::{self, Write};
use std::path::Path;

use serde::Serialize;

pub fn save_json<T: Serialize>(data: &T, path: &Path) -> io::Result<()> {
    let mut file = File::create(path)?;
    file.write_all(serde_json::to_string_pretty(data)?.as_bytes())?;
    file.write_all(b"\n")?;
    tracing::info!(path = %path.display(), "Wrote JSON output");
    Ok(())
}

pub fn load_json(path: &Path) -> io::Result<serde_json::Value> {
    let file = File::open(path)?;
    Ok(serde_json::from_reader(io::BufReader::new(file))?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_save_then_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("snapshot.json");
        let value = json!({ "jobId": "j1", "phase": 21 });

        save_json(&value, &path).unwrap();
        assert_eq!(load_json(&path).unwrap(), value);
    }

    #[test]
    fn test_load_rejects_invalid_json() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("broken.json");
        std::fs::write(&path, "{ not json").unwrap();

        let err = load_json(&path).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }
}
