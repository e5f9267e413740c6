//! Speech history and daily reporting.
//!
//! Every finished chunk is appended to a daily JSONL file in
//! ~/.zundamon-voice-history/, one record per line.

use chrono::{Local, NaiveDate};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::io::{BufRead, Write};
use std::path::PathBuf;
use tracing::{debug, error};

use crate::emotion::EmotionLabel;

/// Directory for history JSONL files.
pub fn default_history_dir() -> Option<PathBuf> {
    dirs::home_dir().map(|home| home.join(".zundamon-voice-history"))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Outcome {
    Played,
    Failed,
    Skipped,
}

/// Record of a single spoken chunk.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SpeechRecord {
    pub timestamp: String,
    pub sequence: usize,
    pub text: String,
    pub emotion: EmotionLabel,
    pub intensity: f32,
    pub prefetched: bool,
    pub synthesis_latency_ms: i64,
    pub playback_duration_ms: i64,
    pub outcome: Outcome,
}

impl SpeechRecord {
    pub fn now() -> String {
        Local::now().format("%Y-%m-%dT%H:%M:%S%.3f").to_string()
    }
}

#[derive(Debug, Clone)]
pub struct SpeechHistory {
    dir: PathBuf,
}

impl SpeechHistory {
    pub fn new(dir: PathBuf) -> Self {
        Self { dir }
    }

    pub fn open_default() -> Option<Self> {
        default_history_dir().map(Self::new)
    }

    /// `date` is `today` or `YYYY-MM-DD`; anything else has no file.
    fn history_file(&self, date: &str) -> Option<PathBuf> {
        let date_str = resolve_date(date)?;
        Some(self.dir.join(format!("{date_str}.jsonl")))
    }

    /// Append a record to today's file.
    pub fn save(&self, record: &SpeechRecord) {
        if let Err(e) = fs::create_dir_all(&self.dir) {
            error!("Failed to create history dir: {e}");
            return;
        }
        let Some(path) = self.history_file("today") else {
            return;
        };

        let mut file = match fs::OpenOptions::new().create(true).append(true).open(&path) {
            Ok(f) => f,
            Err(e) => {
                error!("Failed to open history file: {e}");
                return;
            }
        };
        match serde_json::to_string(record) {
            Ok(json) => {
                if let Err(e) = writeln!(file, "{json}") {
                    error!("Failed to write history record: {e}");
                } else {
                    debug!("Saved speech record to {}", path.display());
                }
            }
            Err(e) => error!("Failed to serialize record: {e}"),
        }
    }

    /// Load all records for a given date.
    pub fn load(&self, date: &str) -> Vec<SpeechRecord> {
        let Some(path) = self.history_file(date) else {
            return Vec::new();
        };
        let file = match fs::File::open(&path) {
            Ok(f) => f,
            Err(_) => return Vec::new(),
        };

        std::io::BufReader::new(file)
            .lines()
            .map_while(|line| line.ok())
            .filter(|line| !line.trim().is_empty())
            .filter_map(|line| match serde_json::from_str::<SpeechRecord>(line.trim()) {
                Ok(record) => Some(record),
                Err(e) => {
                    debug!("Skipping malformed history line: {e}");
                    None
                }
            })
            .collect()
    }

    /// Dates with history records, newest first.
    pub fn available_dates(&self) -> Vec<String> {
        let mut dates: Vec<String> = fs::read_dir(&self.dir)
            .into_iter()
            .flatten()
            .filter_map(|entry| {
                let name = entry.ok()?.file_name().to_string_lossy().to_string();
                name.strip_suffix(".jsonl").map(str::to_string)
            })
            .collect();
        dates.sort_by(|a, b| b.cmp(a));
        dates
    }

    /// Markdown report for a given date.
    pub fn report(&self, date: &str) -> String {
        let display_date = resolve_date(date).unwrap_or_else(|| date.to_string());
        let records = self.load(date);
        if records.is_empty() {
            return format!("# Zundamon Voice Report - {display_date}\n\nNo speech recorded.");
        }

        let played: Vec<&SpeechRecord> = records
            .iter()
            .filter(|r| r.outcome == Outcome::Played)
            .collect();
        let failed = records.iter().filter(|r| r.outcome == Outcome::Failed).count();
        let skipped = records.iter().filter(|r| r.outcome == Outcome::Skipped).count();
        let total_chars: usize = played.iter().map(|r| r.text.chars().count()).sum();
        let total_playback: f64 =
            played.iter().map(|r| r.playback_duration_ms as f64).sum::<f64>() / 1000.0;
        let avg_synth = if played.is_empty() {
            0.0
        } else {
            played.iter().map(|r| r.synthesis_latency_ms).sum::<i64>() as f64 / played.len() as f64
        };
        let prefetched = played.iter().filter(|r| r.prefetched).count();

        let mut emotions: BTreeMap<&str, usize> = BTreeMap::new();
        for r in &played {
            *emotions.entry(r.emotion.as_str()).or_default() += 1;
        }

        let mut lines = vec![
            format!("# Zundamon Voice Report - {display_date}"),
            String::new(),
            "## Summary".to_string(),
            format!("- **Chunks spoken**: {}", played.len()),
            format!("- **Failed**: {failed}"),
            format!("- **Skipped**: {skipped}"),
            format!("- **Total characters**: {total_chars}"),
            format!("- **Total playback**: {}", format_duration(total_playback)),
            format!("- **Average synthesis latency**: {avg_synth:.0}ms"),
            format!("- **Prefetch hits**: {prefetched}/{}", played.len()),
            String::new(),
            "## Emotions".to_string(),
        ];
        lines.extend(emotions.iter().map(|(label, n)| format!("- {label}: {n}")));

        lines.extend([
            String::new(),
            "## Speech Log".to_string(),
            String::new(),
            "| Time | Text | Emotion | Synth | Outcome |".to_string(),
            "|------|------|---------|-------|---------|".to_string(),
        ]);

        for r in &records {
            // HH:MM:SS from the ISO timestamp
            let time_str = r.timestamp.get(11..19).unwrap_or(&r.timestamp);
            let outcome = match r.outcome {
                Outcome::Played => "played",
                Outcome::Failed => "failed",
                Outcome::Skipped => "skipped",
            };
            lines.push(format!(
                "| {time_str} | {} | {} | {}ms | {outcome} |",
                truncate(&r.text, 30),
                r.emotion,
                r.synthesis_latency_ms
            ));
        }

        lines.join("\n")
    }
}

fn resolve_date(date: &str) -> Option<String> {
    if date == "today" {
        return Some(Local::now().format("%Y-%m-%d").to_string());
    }
    NaiveDate::parse_from_str(date, "%Y-%m-%d")
        .ok()
        .map(|d| d.format("%Y-%m-%d").to_string())
}

fn format_duration(seconds: f64) -> String {
    if seconds < 60.0 {
        format!("{seconds:.1}s")
    } else {
        let minutes = (seconds / 60.0) as u64;
        let secs = seconds % 60.0;
        if minutes < 60 {
            format!("{minutes}m {secs:.0}s")
        } else {
            format!("{}h {}m", minutes / 60, minutes % 60)
        }
    }
}

fn truncate(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        text.to_string()
    } else {
        let head: String = text.chars().take(max_chars.saturating_sub(3)).collect();
        format!("{head}...")
    }
}
