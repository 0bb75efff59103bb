use std::fs;

use anyhow::{Context, Result, bail};
use serde::Deserialize;
use tracing::{info, warn};

use crate::cli::StatusArgs;
use crate::commands::judge::{RUN_MANIFEST_FILE, plan_pending};
use crate::config::judge_dataset_dir;
use crate::judge::resume::{list_run_dirs, load_judged_ids};
use crate::store::RowStore;

#[derive(Debug, Deserialize)]
struct RunManifestSummary {
    run_id: Option<String>,
    model: Option<String>,
    status: Option<String>,
    started_at: Option<String>,
    finished_at: Option<String>,
    batch_files: Option<Vec<String>>,
}

pub fn run(args: StatusArgs) -> Result<()> {
    if !args.input.exists() {
        bail!("file not found: {}", args.input.display());
    }

    let dataset_dir = judge_dataset_dir(&args.output_root, args.vendor, &args.input);
    info!(
        vendor = %args.vendor,
        input = %args.input.display(),
        dataset_dir = %dataset_dir.display(),
        "status requested"
    );

    let store = RowStore::load(&args.input)?;
    let resume = load_judged_ids(&dataset_dir)?;
    let plan = plan_pending(&store, args.vendor, &resume.judged);

    info!(
        rows = plan.counts.rows,
        judged_in_batch_files = plan.counts.skipped_from_batch_files,
        judged_in_store = plan.counts.skipped_from_store,
        unjudgeable = plan.counts.unjudgeable,
        duplicate_ids = plan.counts.duplicate_ids,
        pending = plan.counts.pending,
        unreadable_batch_files = resume.unreadable_files,
        "judging progress"
    );

    let Some(latest) = list_run_dirs(&dataset_dir)?.pop() else {
        warn!(path = %dataset_dir.display(), "no judge runs found");
        return Ok(());
    };

    let manifest_path = latest.join(RUN_MANIFEST_FILE);
    if !manifest_path.exists() {
        warn!(path = %manifest_path.display(), "latest run has no manifest");
        return Ok(());
    }

    let raw = fs::read(&manifest_path)
        .with_context(|| format!("failed to read {}", manifest_path.display()))?;
    let manifest: RunManifestSummary = serde_json::from_slice(&raw)
        .with_context(|| format!("failed to parse {}", manifest_path.display()))?;

    info!(
        run_id = %manifest.run_id.unwrap_or_default(),
        model = %manifest.model.unwrap_or_default(),
        status = %manifest.status.unwrap_or_default(),
        started_at = %manifest.started_at.unwrap_or_default(),
        finished_at = %manifest.finished_at.unwrap_or_default(),
        batch_files = manifest.batch_files.map(|files| files.len()).unwrap_or(0),
        "latest run manifest"
    );

    Ok(())
}
