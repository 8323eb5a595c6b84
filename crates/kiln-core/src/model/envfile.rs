//! Dotenv-style secret files.

use std::io;
use std::path::Path;

use crate::error::{KilnError, Result};

/// Read `KEY=VALUE` pairs from `path` in file order.
///
/// Nothing is exported into the process environment.
pub fn read_env_file(path: &Path) -> Result<Vec<(String, String)>> {
    if !path.is_file() {
        return Err(KilnError::MissingFile {
            path: path.to_path_buf(),
        });
    }

    let field = format!("secrets.envFile ({})", path.display());
    let iter = dotenvy::from_path_iter(path).map_err(|e| env_error(&field, path, e))?;

    let mut pairs = Vec::new();
    for item in iter {
        let (key, value) = item.map_err(|e| env_error(&field, path, e))?;
        pairs.push((key, value));
    }

    tracing::debug!(path = %path.display(), entries = pairs.len(), "read env file");
    Ok(pairs)
}

fn env_error(field: &str, path: &Path, err: dotenvy::Error) -> KilnError {
    match err {
        dotenvy::Error::Io(e) if e.kind() == io::ErrorKind::NotFound => KilnError::MissingFile {
            path: path.to_path_buf(),
        },
        dotenvy::Error::Io(e) if e.kind() == io::ErrorKind::InvalidData => {
            KilnError::invalid(field, "file is not valid UTF-8")
        }
        dotenvy::Error::LineParse(line, index) => {
            KilnError::invalid(field, format!("cannot parse '{}' at offset {}", line, index))
        }
        other => KilnError::invalid(field, other.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    #[test]
    fn reads_pairs_in_order() {
        let temp = TempDir::new().expect("create temp dir");
        let path = temp.path().join(".env");
        fs::write(&path, "# comment\nA=1\nB=\"two words\"\n\nC=3\n").expect("write env file");

        let pairs = read_env_file(&path).expect("read should succeed");
        assert_eq!(
            pairs,
            vec![
                ("A".to_string(), "1".to_string()),
                ("B".to_string(), "two words".to_string()),
                ("C".to_string(), "3".to_string()),
            ]
        );
    }

    #[test]
    fn missing_file_is_reported_with_path() {
        let temp = TempDir::new().expect("create temp dir");
        let path = temp.path().join("nope.env");

        let err = read_env_file(&path).unwrap_err();
        assert_eq!(err, KilnError::MissingFile { path });
    }

    #[test]
    fn non_utf8_file_is_invalid_model() {
        let temp = TempDir::new().expect("create temp dir");
        let path = temp.path().join("bin.env");
        fs::write(&path, [b'A', b'=', 0xff, 0xfe, b'\n']).expect("write env file");

        let err = read_env_file(&path).unwrap_err();
        assert_eq!(err.class(), "InvalidModel");
    }
}
