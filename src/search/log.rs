//! Append-only JSONL round log.

use std::fs::{self, File, OpenOptions};
use std::io::{self, BufWriter, Write};
use std::path::Path;

use crate::schema::RoundRecord;

/// Writes one JSON object per line as candidates are scored. The file is
/// flushed after every record so a crashed run leaves a readable log.
pub struct RoundLog {
    writer: BufWriter<File>,
}

impl RoundLog {
    /// Create (or truncate) a round log at `path`, creating parent
    /// directories as needed.
    pub fn create(path: &Path) -> io::Result<Self> {
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)?;
        Ok(Self {
            writer: BufWriter::new(file),
        })
    }

    pub fn append(&mut self, record: &RoundRecord) -> io::Result<()> {
        serde_json::to_writer(&mut self.writer, record)?;
        self.writer.write_all(b"\n")?;
        self.writer.flush()
    }
}
