//! Append-only log of entity keys whose scan work is complete.
//!
//! Each line is `<key>\t<offset>`, where `offset` is the scan output's
//! length right after that entity's row was written. The last complete line
//! therefore names the committed length of the output.

use std::collections::HashSet;
use std::fs::{self, File, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};

use tdir_core::{canonicalize, EntityKey};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CheckpointError {
    #[error("reading checkpoint {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("writing checkpoint {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("corrupt checkpoint {path} at line {line}: {reason}")]
    Corrupt {
        path: PathBuf,
        line: usize,
        reason: String,
    },
}

/// The completed-key set as of process start.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Checkpoint {
    pub keys: HashSet<EntityKey>,
    /// Committed length of the scan output.
    pub committed_offset: u64,
}

impl Checkpoint {
    pub fn contains(&self, key: &EntityKey) -> bool {
        self.keys.contains(key)
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }
}

#[derive(Debug)]
pub struct CheckpointLog {
    path: PathBuf,
    file: File,
}

impl CheckpointLog {
    /// Read the existing log (if any) and open it for appending.
    ///
    /// A final line without a terminating newline is a torn write; it is
    /// dropped from the log and its entity is treated as not done.
    pub fn open(path: impl AsRef<Path>) -> Result<(Self, Checkpoint), CheckpointError> {
        let path = path.as_ref().to_path_buf();
        let read_err = |source| CheckpointError::Read {
            path: path.clone(),
            source,
        };

        let text = match fs::read(&path) {
            Ok(bytes) => String::from_utf8(bytes).map_err(|e| CheckpointError::Corrupt {
                path: path.clone(),
                line: 0,
                reason: e.to_string(),
            })?,
            Err(err) if err.kind() == ErrorKind::NotFound => String::new(),
            Err(err) => return Err(read_err(err)),
        };

        let complete_len = text.rfind('\n').map(|idx| idx + 1).unwrap_or(0);
        let mut checkpoint = Checkpoint::default();
        for (idx, line) in text[..complete_len].lines().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            let corrupt = |reason: &str| CheckpointError::Corrupt {
                path: path.clone(),
                line: idx + 1,
                reason: reason.to_string(),
            };
            let (raw_key, raw_offset) = line.split_once('\t').ok_or_else(|| corrupt("missing offset"))?;
            let key = canonicalize(raw_key).ok_or_else(|| corrupt("unparseable key"))?;
            let offset: u64 = raw_offset
                .trim()
                .parse()
                .map_err(|_| corrupt("unparseable offset"))?;
            checkpoint.keys.insert(key);
            checkpoint.committed_offset = offset;
        }

        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(read_err)?;
        }
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(|source| CheckpointError::Write {
                path: path.clone(),
                source,
            })?;
        if complete_len < text.len() {
            tracing::warn!(path = %path.display(), "dropping torn checkpoint line");
            file.set_len(complete_len as u64)
                .map_err(|source| CheckpointError::Write {
                    path: path.clone(),
                    source,
                })?;
        }

        Ok((Self { path, file }, checkpoint))
    }

    /// Durably record `key` as complete with the output committed up to `offset`.
    pub fn append(&mut self, key: &EntityKey, offset: u64) -> Result<(), CheckpointError> {
        let line = format!("{key}\t{offset}\n");
        self.file
            .write_all(line.as_bytes())
            .and_then(|()| self.file.sync_data())
            .map_err(|source| CheckpointError::Write {
                path: self.path.clone(),
                source,
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn key(raw: &str) -> EntityKey {
        canonicalize(raw).unwrap()
    }

    #[test]
    fn missing_log_starts_empty() {
        let dir = tempdir().unwrap();
        let (_log, checkpoint) = CheckpointLog::open(dir.path().join("cp.log")).unwrap();
        assert!(checkpoint.is_empty());
        assert_eq!(checkpoint.committed_offset, 0);
    }

    #[test]
    fn appended_keys_are_visible_after_reopen() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("cp.log");
        let (mut log, _) = CheckpointLog::open(&path).unwrap();
        log.append(&key("https://example.com/ai/a"), 40).unwrap();
        log.append(&key("https://example.com/ai/b"), 90).unwrap();
        drop(log);

        let (_log, checkpoint) = CheckpointLog::open(&path).unwrap();
        assert_eq!(checkpoint.len(), 2);
        assert!(checkpoint.contains(&key("https://example.com/ai/a")));
        assert_eq!(checkpoint.committed_offset, 90);
    }

    #[test]
    fn torn_final_line_is_dropped() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("cp.log");
        fs::write(&path, "https://example.com/ai/a\t40\nhttps://example.com/ai/b\t9").unwrap();

        let (mut log, checkpoint) = CheckpointLog::open(&path).unwrap();
        assert_eq!(checkpoint.len(), 1);
        assert_eq!(checkpoint.committed_offset, 40);

        log.append(&key("https://example.com/ai/b"), 95).unwrap();
        drop(log);
        assert_eq!(
            fs::read_to_string(&path).unwrap(),
            "https://example.com/ai/a\t40\nhttps://example.com/ai/b\t95\n"
        );
    }

    #[test]
    fn garbage_in_a_complete_line_is_fatal() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("cp.log");
        fs::write(&path, "https://example.com/ai/a\tforty\n").unwrap();
        assert!(matches!(
            CheckpointLog::open(&path),
            Err(CheckpointError::Corrupt { line: 1, .. })
        ));
    }
}
