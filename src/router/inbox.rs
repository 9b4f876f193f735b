// Pull inbox: pull-mode messages land here instead of going to a handler.
//
// One JSONL file per target key under <data_dir>/inbox/. Writers (the daemon)
// and readers (the CLI) run in different processes, so every access takes an
// fs2 lock on the file itself.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use fs2::FileExt;
use serde::{Deserialize, Serialize};
use std::fs::{self, File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use crate::bus::Message;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InboxEntry {
    pub received_at: DateTime<Utc>,
    /// Target key the message was filed under.
    pub target: String,
    pub message: Message,
}

#[derive(Debug, Clone)]
pub struct Inbox {
    dir: PathBuf,
}

impl Inbox {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, target: &str) -> PathBuf {
        let stem: String = target
            .trim_matches('/')
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.' { c } else { '_' })
            .collect();
        let stem = if stem.is_empty() { "_".to_string() } else { stem };
        self.dir.join(format!("{}.jsonl", stem))
    }

    /// Append a message for `target`.
    pub fn append(&self, target: &str, message: &Message) -> Result<PathBuf> {
        fs::create_dir_all(&self.dir)
            .with_context(|| format!("Failed to create inbox directory {}", self.dir.display()))?;
        let path = self.path_for(target);
        let entry = InboxEntry {
            received_at: Utc::now(),
            target: target.to_string(),
            message: message.clone(),
        };
        let json = serde_json::to_string(&entry).context("Failed to serialize inbox entry")?;

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .with_context(|| format!("Failed to open inbox {}", path.display()))?;
        FileExt::lock_exclusive(&file)
            .with_context(|| format!("Failed to lock inbox {}", path.display()))?;
        let written = writeln!(file, "{}", json);
        let _ = FileExt::unlock(&file);
        written.context("Failed to write inbox entry")?;
        Ok(path)
    }

    /// Entries for `target`, oldest first. Missing inbox means empty.
    pub fn read(&self, target: &str) -> Result<Vec<InboxEntry>> {
        let path = self.path_for(target);
        if !path.exists() {
            return Ok(Vec::new());
        }
        let mut file = File::open(&path)
            .with_context(|| format!("Failed to open inbox {}", path.display()))?;
        FileExt::lock_shared(&file)
            .with_context(|| format!("Failed to lock inbox {}", path.display()))?;
        let mut contents = String::new();
        let read = file.read_to_string(&mut contents);
        let _ = FileExt::unlock(&file);
        read.with_context(|| format!("Failed to read inbox {}", path.display()))?;
        Ok(parse_entries(&contents, &path))
    }

    /// Read and empty the inbox for `target` atomically with respect to
    /// concurrent appends.
    pub fn drain(&self, target: &str) -> Result<Vec<InboxEntry>> {
        let path = self.path_for(target);
        if !path.exists() {
            return Ok(Vec::new());
        }
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(&path)
            .with_context(|| format!("Failed to open inbox {}", path.display()))?;
        FileExt::lock_exclusive(&file)
            .with_context(|| format!("Failed to lock inbox {}", path.display()))?;

        let result = (|| -> std::io::Result<String> {
            let mut contents = String::new();
            file.read_to_string(&mut contents)?;
            file.set_len(0)?;
            file.seek(SeekFrom::Start(0))?;
            Ok(contents)
        })();
        let _ = FileExt::unlock(&file);

        let contents = result.with_context(|| format!("Failed to drain inbox {}", path.display()))?;
        Ok(parse_entries(&contents, &path))
    }

    /// Target keys with a non-empty inbox.
    pub fn targets(&self) -> Result<Vec<String>> {
        if !self.dir.exists() {
            return Ok(Vec::new());
        }
        let mut targets = Vec::new();
        for entry in fs::read_dir(&self.dir)
            .with_context(|| format!("Failed to list {}", self.dir.display()))?
        {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some("jsonl") {
                continue;
            }
            if fs::metadata(&path).map(|m| m.len() == 0).unwrap_or(true) {
                continue;
            }
            // The first entry carries the unsanitized target.
            let Some(first) = self.first_entry(&path) else {
                continue;
            };
            targets.push(first.target);
        }
        targets.sort();
        Ok(targets)
    }

    fn first_entry(&self, path: &Path) -> Option<InboxEntry> {
        let contents = fs::read_to_string(path).ok()?;
        parse_entries(&contents, path).into_iter().next()
    }
}

fn parse_entries(contents: &str, path: &Path) -> Vec<InboxEntry> {
    contents
        .lines()
        .filter(|line| !line.trim().is_empty())
        .filter_map(|line| match serde_json::from_str(line) {
            Ok(entry) => Some(entry),
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "skipping corrupt inbox line");
                None
            }
        })
        .collect()
}
