//! `log_tail` source (§4.2, §3a, §8 scenario S6): emits one `log`-kind
//! event per new line appended to a followed file since the last tick,
//! optionally filtered by a regex.
//!
//! The cursor is a sidecar file holding `<last_size>:<last_inode>`,
//! rewound to zero when the inode changes or the file has shrunk.

use std::fs::File;
use std::io::{BufRead, BufReader, Seek, SeekFrom};
use std::os::unix::fs::MetadataExt;
use std::path::PathBuf;

use agent_core::{Event, Kind, SourceError};
use async_trait::async_trait;
use regex::Regex;
use serde::Deserialize;

use crate::persistent_cache::state_file;

#[derive(Debug, Deserialize)]
struct LogTailParams {
    path: String,
    filter: Option<String>,
}

struct Cursor {
    last_size: u64,
    last_inode: u64,
}

impl Cursor {
    fn read(cursor_path: &std::path::Path, logfile: &std::path::Path) -> std::io::Result<Self> {
        if let Ok(text) = std::fs::read_to_string(cursor_path) {
            if let Some((size, inode)) = text.split_once(':') {
                if let (Ok(last_size), Ok(last_inode)) = (size.parse(), inode.parse()) {
                    return Ok(Cursor { last_size, last_inode });
                }
            }
        }
        // No (valid) cursor yet: start from the file's current end so a
        // freshly configured tailer doesn't replay the whole history.
        let meta = std::fs::metadata(logfile)?;
        Ok(Cursor { last_size: meta.size(), last_inode: meta.ino() })
    }

    fn store(&self, cursor_path: &std::path::Path) {
        if let Some(parent) = cursor_path.parent() {
            let _ = std::fs::create_dir_all(parent);
        }
        let _ = std::fs::write(cursor_path, format!("{}:{}", self.last_size, self.last_inode));
    }
}

pub struct LogTailSource {
    logfile: PathBuf,
    cursor_path: PathBuf,
    filter: Option<Regex>,
    service: String,
}

impl LogTailSource {
    pub fn new(service: String, state_dir: &std::path::Path, params: &serde_json::Value) -> Result<Self, String> {
        let params: LogTailParams = serde_json::from_value(params.clone())
            .map_err(|e| format!("log_tail: invalid params: {e}"))?;

        let filter = params
            .filter
            .as_deref()
            .map(Regex::new)
            .transpose()
            .map_err(|e| format!("log_tail: invalid filter regex: {e}"))?;

        let cursor_path = state_file(state_dir, &params.path, "lf");

        Ok(LogTailSource { logfile: PathBuf::from(params.path), cursor_path, filter, service })
    }
}

#[async_trait]
impl agent_core::Source for LogTailSource {
    async fn tick(&self) -> Result<Vec<Event>, SourceError> {
        let logfile = self.logfile.clone();
        let cursor_path = self.cursor_path.clone();
        let filter = self.filter.clone();
        let service = self.service.clone();

        tokio::task::spawn_blocking(move || read_new_lines(&logfile, &cursor_path, filter.as_ref(), &service))
            .await
            .map_err(|e| SourceError::Failed(e.to_string()))?
    }
}

fn read_new_lines(
    logfile: &std::path::Path,
    cursor_path: &std::path::Path,
    filter: Option<&Regex>,
    service: &str,
) -> Result<Vec<Event>, SourceError> {
    let meta = std::fs::metadata(logfile).map_err(|e| SourceError::Failed(e.to_string()))?;
    let mut cursor = Cursor::read(cursor_path, logfile).map_err(|e| SourceError::Failed(e.to_string()))?;

    if meta.ino() == cursor.last_inode && meta.size() == cursor.last_size {
        return Ok(Vec::new());
    }

    if meta.ino() != cursor.last_inode || meta.size() < cursor.last_size {
        cursor.last_size = 0;
    }
    cursor.last_inode = meta.ino();

    let mut file = File::open(logfile).map_err(|e| SourceError::Failed(e.to_string()))?;
    file.seek(SeekFrom::Start(cursor.last_size)).map_err(|e| SourceError::Failed(e.to_string()))?;
    let reader = BufReader::new(file);

    let mut events = Vec::new();
    for line in reader.lines() {
        let line = line.map_err(|e| SourceError::Failed(e.to_string()))?;
        cursor.last_size += line.len() as u64 + 1;

        if filter.as_ref().is_some_and(|re| !re.is_match(&line)) {
            continue;
        }

        let mut event = Event::metric(service.to_string(), "", 0.0).with_description(line).with_ttl(0.0);
        event.metric = None;
        event.kind = Kind::Log;
        events.push(event);
    }

    cursor.store(cursor_path);
    Ok(events)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn follows_new_lines_across_ticks() {
        let dir = tempfile::tempdir().unwrap();
        let logfile = dir.path().join("app.log");
        std::fs::write(&logfile, "").unwrap();
        let cursor_path = dir.path().join("app.log.lf");

        // First tick starts from the (empty) end, not from history.
        let events = read_new_lines(&logfile, &cursor_path, None, "app.log").unwrap();
        assert!(events.is_empty());

        let mut f = std::fs::OpenOptions::new().append(true).open(&logfile).unwrap();
        writeln!(f, "line one").unwrap();
        writeln!(f, "line two").unwrap();

        let events = read_new_lines(&logfile, &cursor_path, None, "app.log").unwrap();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].description, "line one");
    }

    #[test]
    fn rotation_resets_cursor_to_new_inode() {
        let dir = tempfile::tempdir().unwrap();
        let logfile = dir.path().join("app.log");
        std::fs::write(&logfile, "old1\nold2\n").unwrap();
        let cursor_path = dir.path().join("app.log.lf");

        let events = read_new_lines(&logfile, &cursor_path, None, "app.log").unwrap();
        assert_eq!(events.len(), 0, "starts from end, not history");

        std::fs::remove_file(&logfile).unwrap();
        std::fs::write(&logfile, "new1\nnew2\n").unwrap();

        let events = read_new_lines(&logfile, &cursor_path, None, "app.log").unwrap();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].description, "new1");
    }

    #[test]
    fn truncation_rewinds_to_zero() {
        let dir = tempfile::tempdir().unwrap();
        let logfile = dir.path().join("app.log");
        std::fs::write(&logfile, "").unwrap();
        let cursor_path = dir.path().join("app.log.lf");
        read_new_lines(&logfile, &cursor_path, None, "app.log").unwrap();

        let mut f = std::fs::OpenOptions::new().append(true).open(&logfile).unwrap();
        writeln!(f, "aaaaaaaaaa").unwrap();
        read_new_lines(&logfile, &cursor_path, None, "app.log").unwrap();

        // Truncate in place (same inode, smaller size).
        std::fs::write(&logfile, "short\n").unwrap();
        let events = read_new_lines(&logfile, &cursor_path, None, "app.log").unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].description, "short");
    }

    #[test]
    fn filter_drops_non_matching_lines() {
        let dir = tempfile::tempdir().unwrap();
        let logfile = dir.path().join("app.log");
        std::fs::write(&logfile, "").unwrap();
        let cursor_path = dir.path().join("app.log.lf");
        read_new_lines(&logfile, &cursor_path, None, "app.log").unwrap();

        let mut f = std::fs::OpenOptions::new().append(true).open(&logfile).unwrap();
        writeln!(f, "INFO ok").unwrap();
        writeln!(f, "ERROR boom").unwrap();

        let filter = Regex::new("ERROR").unwrap();
        let events = read_new_lines(&logfile, &cursor_path, Some(&filter), "app.log").unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].description, "ERROR boom");
    }
}
