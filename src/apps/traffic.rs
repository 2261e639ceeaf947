use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::codec::Codec;
use crate::dlml::Dlml;
use crate::error::Result;
use crate::transport::Rank;

/// One traffic report file to process.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileTask {
    pub path: PathBuf,
}

/// Why a report file was skipped.
#[derive(Debug, Error)]
pub enum ReportError {
    #[error("failed to read report: {0}")]
    Io(#[from] std::io::Error),

    #[error("malformed report: {0}")]
    Json(#[from] serde_json::Error),
}

#[derive(Deserialize)]
struct Report {
    alerts: Vec<Alert>,
}

#[derive(Deserialize)]
struct Alert {
    id: String,
}

/// What one rank found.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct LocalTally {
    pub files_processed: u64,
    pub ids: BTreeSet<String>,
}

/// Group-wide result, computed at the root.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TrafficSummary {
    pub files_processed: u64,
    /// Unique ids after merging with a set-union reduction.
    pub unique_ids: usize,
    /// Unique ids after gathering every rank's set and merging at the root.
    pub gathered_unique_ids: usize,
}

/// Files `dir/<i>.json` for `i` in `1..=count` dealt round-robin: this rank
/// gets `rank + 1`, `rank + 1 + size`, and so on.
pub fn files_for_rank(dir: &Path, rank: Rank, size: usize, count: usize) -> Vec<FileTask> {
    (rank + 1..=count)
        .step_by(size.max(1))
        .map(|i| FileTask {
            path: dir.join(format!("{i}.json")),
        })
        .collect()
}

/// Ids of the `alerts` array of one report file.
pub fn alert_ids(path: &Path) -> std::result::Result<Vec<String>, ReportError> {
    let contents = std::fs::read(path)?;
    let report: Report = serde_json::from_slice(&contents)?;
    Ok(report.alerts.into_iter().map(|alert| alert.id).collect())
}

/// Process files until the group runs out of work. Unreadable files are
/// logged and not counted.
pub async fn collect_alert_ids<C: Codec>(dlml: &mut Dlml<FileTask, C>) -> Result<LocalTally> {
    let mut tally = LocalTally::default();
    while let Some(task) = dlml.get().await? {
        match alert_ids(&task.path) {
            Ok(ids) => {
                tally.ids.extend(ids);
                tally.files_processed += 1;
            }
            Err(e) => {
                tracing::warn!(
                    rank = dlml.rank(),
                    path = %task.path.display(),
                    error = %e,
                    "Skipping report"
                );
            }
        }
    }
    tracing::info!(
        rank = dlml.rank(),
        files = tally.files_processed,
        ids = tally.ids.len(),
        "Local processing finished"
    );
    Ok(tally)
}

/// Count unique alert ids over `dir/1.json ..= dir/<count>.json`.
///
/// Returns the summary on the root and `None` elsewhere.
pub async fn run<C: Codec>(
    dlml: &mut Dlml<FileTask, C>,
    dir: &Path,
    count: usize,
) -> Result<Option<TrafficSummary>> {
    for task in files_for_rank(dir, dlml.rank(), dlml.size(), count) {
        dlml.insert(task);
    }
    let tally = collect_alert_ids(dlml).await?;

    let files_processed = dlml.reduce_add(tally.files_processed).await?;
    let merged = dlml
        .reduce(tally.ids.clone(), |mut acc, other| {
            acc.extend(other);
            acc
        })
        .await?;
    let gathered = dlml.gather(tally.ids).await?;

    Ok(dlml.run_on_one(|| TrafficSummary {
        files_processed,
        unique_ids: merged.len(),
        gathered_unique_ids: gathered.into_iter().flatten().collect::<BTreeSet<_>>().len(),
    }))
}
