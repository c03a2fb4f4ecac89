//! Trade outcome journal.
//!
//! Append-only JSONL at `<data_dir>/trades.jsonl`, one record per
//! terminal outcome. Written after receipt, never in the submission hot
//! path, and readable by external tooling while the process runs. No
//! in-place edits, ever.

use crate::types::TradeOutcome;
use anyhow::{Context, Result};
use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use tracing::debug;

pub struct OutcomeLog {
    path: PathBuf,
}

impl OutcomeLog {
    pub fn new<P: AsRef<Path>>(data_dir: P) -> Result<Self> {
        let data_dir = data_dir.as_ref();
        fs::create_dir_all(data_dir)
            .with_context(|| format!("cannot create data dir {}", data_dir.display()))?;
        Ok(Self {
            path: data_dir.join("trades.jsonl"),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append one terminal outcome as a single JSON line.
    pub fn append(&self, outcome: &TradeOutcome) -> Result<()> {
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .with_context(|| format!("cannot open journal {}", self.path.display()))?;

        let json = serde_json::to_string(outcome).context("cannot serialize trade outcome")?;
        writeln!(file, "{}", json)?;

        debug!("journal: {} {} ({})", outcome.id, outcome.status, outcome.path_label);
        Ok(())
    }

    /// Read every record back, skipping blank lines.
    pub fn read_all(&self) -> Result<Vec<TradeOutcome>> {
        if !self.path.exists() {
            return Ok(Vec::new());
        }
        let file = File::open(&self.path)?;
        let reader = BufReader::new(file);

        let mut outcomes = Vec::new();
        for line in reader.lines() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            let outcome: TradeOutcome = serde_json::from_str(&line)
                .with_context(|| format!("bad journal line: {}", line))?;
            outcomes.push(outcome);
        }
        Ok(outcomes)
    }

    pub fn record_count(&self) -> Result<usize> {
        if !self.path.exists() {
            return Ok(0);
        }
        let reader = BufReader::new(File::open(&self.path)?);
        Ok(reader.lines().count())
    }
}
