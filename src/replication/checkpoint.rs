//! High watermark checkpoint files.
//!
//! One checkpoint file per data directory records the high watermark of every
//! local replica hosted there, so a restarting broker knows which offsets it
//! may expose as committed. Writes go to a temp file first and are published
//! by rename, so a crash mid-write never corrupts the previous checkpoint.
//!
//! # File Format (version 0)
//!
//! ```text
//! 0                      <- schema version
//! 2                      <- entry count
//! orders 0 42            <- "<topic> <partition> <hw>"
//! payments 3 17
//! ```
//!
//! Entries are written in sorted order so rewriting unchanged state produces
//! a byte-identical file.

use std::collections::HashMap;
use std::io;
use std::path::{Path, PathBuf};

use tracing::warn;

use crate::constants::{HIGH_WATERMARK_CHECKPOINT_FILENAME, HIGH_WATERMARK_CHECKPOINT_VERSION};

use super::topic_partition::TopicPartition;

/// Reader/writer for one data directory's checkpoint file.
#[derive(Debug, Clone)]
pub struct CheckpointFile {
    path: PathBuf,
    tmp_path: PathBuf,
}

impl CheckpointFile {
    /// Checkpoint file for the given data directory.
    pub fn new(data_dir: &Path) -> Self {
        let path = data_dir.join(HIGH_WATERMARK_CHECKPOINT_FILENAME);
        let tmp_path = data_dir.join(format!("{HIGH_WATERMARK_CHECKPOINT_FILENAME}.tmp"));
        Self { path, tmp_path }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Write all entries, replacing the previous checkpoint atomically.
    pub async fn write(&self, entries: &HashMap<TopicPartition, i64>) -> io::Result<()> {
        let mut sorted: Vec<_> = entries.iter().collect();
        sorted.sort_by(|(a, _), (b, _)| {
            a.topic()
                .cmp(b.topic())
                .then(a.partition().cmp(&b.partition()))
        });

        let mut content = String::new();
        content.push_str(&format!("{HIGH_WATERMARK_CHECKPOINT_VERSION}\n"));
        content.push_str(&format!("{}\n", sorted.len()));
        for (tp, hw) in sorted {
            content.push_str(&format!("{} {} {}\n", tp.topic(), tp.partition(), hw));
        }

        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&self.tmp_path, content.as_bytes()).await?;
        tokio::fs::rename(&self.tmp_path, &self.path).await?;
        Ok(())
    }

    /// Read all entries. A missing file yields an empty map; a malformed file
    /// is an error, since serving with a half-read checkpoint would expose
    /// uncommitted offsets as committed.
    pub async fn read(&self) -> io::Result<HashMap<TopicPartition, i64>> {
        let content = match tokio::fs::read_to_string(&self.path).await {
            Ok(content) => content,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(HashMap::new()),
            Err(e) => return Err(e),
        };
        parse(&content).map_err(|msg| {
            warn!(path = %self.path.display(), %msg, "malformed high watermark checkpoint");
            io::Error::new(io::ErrorKind::InvalidData, msg)
        })
    }
}

fn parse(content: &str) -> Result<HashMap<TopicPartition, i64>, String> {
    let mut lines = content.lines();
    let version: i32 = lines
        .next()
        .ok_or("missing version line")?
        .trim()
        .parse()
        .map_err(|_| "unparseable version line")?;
    if version != HIGH_WATERMARK_CHECKPOINT_VERSION {
        return Err(format!("unsupported checkpoint version {version}"));
    }
    let expected: usize = lines
        .next()
        .ok_or("missing entry count line")?
        .trim()
        .parse()
        .map_err(|_| "unparseable entry count")?;

    let mut entries = HashMap::with_capacity(expected);
    for line in lines {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let mut fields = line.split(' ');
        let topic = fields.next().ok_or_else(|| format!("bad entry: {line}"))?;
        let partition: i32 = fields
            .next()
            .and_then(|f| f.parse().ok())
            .ok_or_else(|| format!("bad partition in entry: {line}"))?;
        let hw: i64 = fields
            .next()
            .and_then(|f| f.parse().ok())
            .ok_or_else(|| format!("bad high watermark in entry: {line}"))?;
        if fields.next().is_some() {
            return Err(format!("trailing fields in entry: {line}"));
        }
        entries.insert(TopicPartition::new(topic.to_string(), partition), hw);
    }
    if entries.len() != expected {
        return Err(format!(
            "entry count mismatch: header says {expected}, found {}",
            entries.len()
        ));
    }
    Ok(entries)
}
