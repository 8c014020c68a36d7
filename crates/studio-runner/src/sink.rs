//! Append-only fact rows for completed episodes, one JSONL file per fact
//! kind under `<studio_dir>/facts/`.

use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::fs::{self, File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

const FACTS_EPISODES_FILE: &str = "episodes.jsonl";
const FACTS_ATTEMPTS_FILE: &str = "attempts.jsonl";
const FACTS_VALIDATION_STEPS_FILE: &str = "validation_steps.jsonl";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EpisodeRow {
    pub episode_id: String,
    pub env_id: String,
    pub status: String,
    pub injection_strategy: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub artifact_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub artifact_valid: Option<bool>,
    pub solver_attempts: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub solve_rate: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub r_inject: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub r_solve_avg: Option<f64>,
    pub duration_ms: u64,
    pub created_at: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AttemptRow {
    pub episode_id: String,
    pub attempt_id: String,
    pub attempt_number: u32,
    pub success: bool,
    pub tests_passed: usize,
    pub tests_failed: usize,
    pub total_tool_steps: usize,
    pub total_tokens_used: u64,
    pub duration_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidationStepRow {
    pub episode_id: String,
    pub artifact_id: String,
    pub step: String,
    pub passed: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    pub duration_ms: u64,
}

pub trait EpisodeSink {
    fn append_episode_row(&mut self, row: &EpisodeRow) -> Result<()>;
    fn append_attempt_rows(&mut self, rows: &[AttemptRow]) -> Result<()>;
    fn append_validation_rows(&mut self, rows: &[ValidationStepRow]) -> Result<()>;
    fn flush(&mut self) -> Result<()>;
}

pub struct JsonlEpisodeSink {
    episodes_writer: BufWriter<File>,
    attempts_writer: BufWriter<File>,
    validation_writer: BufWriter<File>,
}

impl JsonlEpisodeSink {
    pub fn new(facts_dir: &Path) -> Result<Self> {
        fs::create_dir_all(facts_dir)?;
        Ok(Self {
            episodes_writer: open_append(facts_dir.join(FACTS_EPISODES_FILE))?,
            attempts_writer: open_append(facts_dir.join(FACTS_ATTEMPTS_FILE))?,
            validation_writer: open_append(facts_dir.join(FACTS_VALIDATION_STEPS_FILE))?,
        })
    }
}

impl EpisodeSink for JsonlEpisodeSink {
    fn append_episode_row(&mut self, row: &EpisodeRow) -> Result<()> {
        append_row(&mut self.episodes_writer, row)
    }

    fn append_attempt_rows(&mut self, rows: &[AttemptRow]) -> Result<()> {
        for row in rows {
            append_row(&mut self.attempts_writer, row)?;
        }
        Ok(())
    }

    fn append_validation_rows(&mut self, rows: &[ValidationStepRow]) -> Result<()> {
        for row in rows {
            append_row(&mut self.validation_writer, row)?;
        }
        Ok(())
    }

    fn flush(&mut self) -> Result<()> {
        self.episodes_writer.flush()?;
        self.attempts_writer.flush()?;
        self.validation_writer.flush()?;
        Ok(())
    }
}

fn open_append(path: PathBuf) -> Result<BufWriter<File>> {
    let file = OpenOptions::new().create(true).append(true).open(path)?;
    Ok(BufWriter::new(file))
}

fn append_row<T: Serialize>(writer: &mut BufWriter<File>, row: &T) -> Result<()> {
    serde_json::to_writer(&mut *writer, row)?;
    writer.write_all(b"\n")?;
    Ok(())
}
