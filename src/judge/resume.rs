use std::collections::{HashMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use tracing::{info, warn};

use crate::model::{QA_ID_COLUMN, parse_rating_cell};
use crate::store::RowStore;

const BATCH_FILE_PREFIX: &str = "batch_";
const BATCH_FILE_EXTENSION: &str = "csv";
const LEGACY_ID_COLUMN: &str = "QA_ID";
const RATING_COLUMN: &str = "Judge_Rating";
const REASON_COLUMN: &str = "Judge_Reason";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredJudgment {
    pub qa_id: String,
    pub rating: Option<i64>,
    pub reason: String,
}

#[derive(Debug, Default)]
pub struct ResumeIndex {
    pub judged: HashSet<String>,
    pub batch_files: usize,
    pub unreadable_files: usize,
    pub run_dirs: usize,
}

pub fn batch_file_name(batch_number: usize) -> String {
    format!("{BATCH_FILE_PREFIX}{batch_number:04}.{BATCH_FILE_EXTENSION}")
}

pub fn is_batch_file(path: &Path) -> bool {
    let Some(name) = path.file_name().and_then(|name| name.to_str()) else {
        return false;
    };
    name.starts_with(BATCH_FILE_PREFIX)
        && path.extension().and_then(|ext| ext.to_str()) == Some(BATCH_FILE_EXTENSION)
}

pub fn list_run_dirs(dataset_dir: &Path) -> Result<Vec<PathBuf>> {
    if !dataset_dir.is_dir() {
        return Ok(Vec::new());
    }

    let mut dirs = Vec::new();
    for entry in fs::read_dir(dataset_dir)
        .with_context(|| format!("failed to list directory: {}", dataset_dir.display()))?
    {
        let path = entry
            .with_context(|| format!("failed to read entry in {}", dataset_dir.display()))?
            .path();
        if path.is_dir() {
            dirs.push(path);
        }
    }
    dirs.sort();
    Ok(dirs)
}

pub fn list_batch_files(dir: &Path) -> Result<Vec<PathBuf>> {
    if !dir.is_dir() {
        return Ok(Vec::new());
    }

    let mut files = Vec::new();
    for entry in
        fs::read_dir(dir).with_context(|| format!("failed to list directory: {}", dir.display()))?
    {
        let path = entry
            .with_context(|| format!("failed to read entry in {}", dir.display()))?
            .path();
        if path.is_file() && is_batch_file(&path) {
            files.push(path);
        }
    }
    files.sort();
    Ok(files)
}

pub fn find_batch_files_recursive(root: &Path) -> Result<Vec<PathBuf>> {
    let mut files = list_batch_files(root)?;
    for dir in list_run_dirs(root)? {
        files.extend(find_batch_files_recursive(&dir)?);
    }
    files.sort();
    Ok(files)
}

pub fn next_batch_number(run_dir: &Path) -> Result<usize> {
    let highest = list_batch_files(run_dir)?
        .iter()
        .filter_map(|path| path.file_stem().and_then(|stem| stem.to_str()))
        .filter_map(|stem| stem.strip_prefix(BATCH_FILE_PREFIX))
        .filter_map(|number| number.parse::<usize>().ok())
        .max();
    Ok(highest.map_or(1, |number| number + 1))
}

pub fn read_batch_judgments(path: &Path) -> Result<Vec<StoredJudgment>> {
    let store = RowStore::load(path)?;
    let id_column = if store.has_column(QA_ID_COLUMN) {
        QA_ID_COLUMN
    } else {
        LEGACY_ID_COLUMN
    };

    Ok((0..store.len())
        .filter_map(|row_idx| {
            let qa_id = store.get(row_idx, id_column).trim();
            if qa_id.is_empty() {
                return None;
            }
            Some(StoredJudgment {
                qa_id: qa_id.to_string(),
                rating: parse_rating_cell(store.get(row_idx, RATING_COLUMN)),
                reason: store.get(row_idx, REASON_COLUMN).to_string(),
            })
        })
        .collect())
}

pub fn load_judged_ids(dataset_dir: &Path) -> Result<ResumeIndex> {
    let mut index = ResumeIndex::default();
    let run_dirs = list_run_dirs(dataset_dir)?;
    index.run_dirs = run_dirs.len();

    for run_dir in &run_dirs {
        for path in list_batch_files(run_dir)? {
            index.batch_files += 1;
            match read_batch_judgments(&path) {
                Ok(rows) => index.judged.extend(
                    rows.into_iter()
                        .filter(|row| row.rating.is_some())
                        .map(|row| row.qa_id),
                ),
                Err(err) => {
                    index.unreadable_files += 1;
                    warn!(path = %path.display(), error = %format!("{err:#}"), "skipping unreadable batch file");
                }
            }
        }
    }

    info!(
        dataset_dir = %dataset_dir.display(),
        run_dirs = index.run_dirs,
        batch_files = index.batch_files,
        judged = index.judged.len(),
        "loaded previous judgments"
    );
    Ok(index)
}

// Later files override earlier ones.
pub fn load_valid_results(root: &Path) -> Result<HashMap<String, (i64, String)>> {
    let mut results = HashMap::new();
    for path in find_batch_files_recursive(root)? {
        let rows = match read_batch_judgments(&path) {
            Ok(rows) => rows,
            Err(err) => {
                warn!(path = %path.display(), error = %format!("{err:#}"), "skipping unreadable batch file");
                continue;
            }
        };
        for row in rows {
            if let Some(rating) = row.rating {
                results.insert(row.qa_id, (rating, row.reason));
            }
        }
    }
    Ok(results)
}
