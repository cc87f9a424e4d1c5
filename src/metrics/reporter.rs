use crate::error::{Result, SlimclawError};
use crate::types::OptimizerMetrics;
use serde::Serialize;
use std::collections::HashMap;
use std::fs;
use std::io::Write;
use std::path::PathBuf;
use tracing::{debug, error};

const TOP_SAVINGS_LIMIT: usize = 5;
/// Requests below this token-savings floor are not worth reporting.
const TOP_SAVINGS_MIN_TOKENS: i64 = 1000;

/// Appends newline-delimited JSON metrics to one file per UTC date.
#[derive(Debug, Clone)]
pub struct MetricsReporter {
    dir: PathBuf,
}

#[derive(Debug, Clone, Serialize)]
pub struct TopSaving {
    pub request_id: String,
    pub date: String,
    pub tokens_saved: i64,
    pub savings_percent: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct SavingsReport {
    pub start_date: String,
    pub end_date: String,
    pub total_requests: usize,
    pub total_tokens_saved: i64,
    pub total_cost_saved: f64,
    pub average_savings_percent: f64,
    pub top_savings: Vec<TopSaving>,
}

impl MetricsReporter {
    pub fn new(base_dir: &str, log_dir: &str) -> Self {
        Self {
            dir: PathBuf::from(base_dir).join(log_dir),
        }
    }

    /// Append a batch, grouped by the date part of each record's timestamp.
    /// Directories are created lazily; writes within a file are append order.
    pub fn write_metrics(&self, batch: &[OptimizerMetrics]) -> Result<()> {
        if batch.is_empty() {
            return Ok(());
        }

        let mut by_date: HashMap<&str, Vec<&OptimizerMetrics>> = HashMap::new();
        for record in batch {
            let date = record
                .timestamp
                .split('T')
                .next()
                .filter(|d| !d.is_empty())
                .unwrap_or("unknown");
            by_date.entry(date).or_default().push(record);
        }

        fs::create_dir_all(&self.dir)
            .map_err(|e| SlimclawError::ReporterWrite(format!("create {:?}: {}", self.dir, e)))?;

        for (date, records) in by_date {
            let path = self.file_for(date);
            let mut file = fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(&path)
                .map_err(|e| SlimclawError::ReporterWrite(format!("open {:?}: {}", path, e)))?;

            for record in records {
                let line = serde_json::to_string(record)?;
                writeln!(file, "{}", line)
                    .map_err(|e| SlimclawError::ReporterWrite(format!("append {:?}: {}", path, e)))?;
            }
        }

        debug!(records = batch.len(), "flushed metrics to disk");
        Ok(())
    }

    /// All records for one date. Missing files yield an empty list; a corrupt
    /// file is logged and also yields an empty list.
    pub fn read_metrics_for_date(&self, date: &str) -> Vec<OptimizerMetrics> {
        let path = self.file_for(date);
        let Ok(content) = fs::read_to_string(&path) else {
            return Vec::new();
        };

        let mut records = Vec::new();
        for line in content.lines().filter(|l| !l.trim().is_empty()) {
            match serde_json::from_str::<OptimizerMetrics>(line) {
                Ok(record) => records.push(record),
                Err(e) => {
                    error!(date, "corrupt metrics line: {}", e);
                    return Vec::new();
                }
            }
        }
        records
    }

    /// Dates with a metrics file on disk, newest first.
    pub fn get_available_dates(&self) -> Vec<String> {
        let Ok(entries) = fs::read_dir(&self.dir) else {
            return Vec::new();
        };

        let mut dates: Vec<String> = entries
            .filter_map(|entry| entry.ok())
            .filter_map(|entry| {
                let name = entry.file_name().to_string_lossy().into_owned();
                name.strip_suffix(".jsonl").map(str::to_string)
            })
            .collect();
        dates.sort_by(|a, b| b.cmp(a));
        dates
    }

    /// Aggregate savings over an inclusive date range. Average savings weighs
    /// every request equally regardless of size.
    pub fn generate_report(&self, start: &str, end: &str) -> SavingsReport {
        let dates: Vec<String> = self
            .get_available_dates()
            .into_iter()
            .filter(|d| d.as_str() >= start && d.as_str() <= end)
            .collect();

        let mut total_requests = 0usize;
        let mut total_tokens_saved = 0i64;
        let mut total_cost_saved = 0.0f64;
        let mut savings_percent_sum = 0.0f64;
        let mut top_savings: Vec<TopSaving> = Vec::new();

        for date in &dates {
            for record in self.read_metrics_for_date(date) {
                total_requests += 1;
                let tokens_saved = record.tokens_saved.unwrap_or(0);
                total_tokens_saved += tokens_saved;
                total_cost_saved += record.estimated_cost_saved.unwrap_or(0.0);

                let percent = if record.original_token_estimate > 0 {
                    (tokens_saved.max(0) as f64 / record.original_token_estimate as f64) * 100.0
                } else {
                    0.0
                };
                savings_percent_sum += percent;

                if tokens_saved > TOP_SAVINGS_MIN_TOKENS {
                    top_savings.push(TopSaving {
                        request_id: record.request_id.clone(),
                        date: date.clone(),
                        tokens_saved,
                        savings_percent: (percent * 100.0).round() / 100.0,
                    });
                }
            }
        }

        top_savings.sort_by(|a, b| b.tokens_saved.cmp(&a.tokens_saved));
        top_savings.truncate(TOP_SAVINGS_LIMIT);

        SavingsReport {
            start_date: start.to_string(),
            end_date: end.to_string(),
            total_requests,
            total_tokens_saved,
            total_cost_saved,
            average_savings_percent: if total_requests > 0 {
                (savings_percent_sum / total_requests as f64 * 100.0).round() / 100.0
            } else {
                0.0
            },
            top_savings,
        }
    }

    fn file_for(&self, date: &str) -> PathBuf {
        self.dir.join(format!("{}.jsonl", date))
    }
}
