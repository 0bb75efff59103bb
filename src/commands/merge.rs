use std::path::Path;

use anyhow::{Result, bail};
use tracing::{info, warn};

use crate::cli::MergeArgs;
use crate::config::judge_dataset_dir;
use crate::judge::resume::{find_batch_files_recursive, load_valid_results};
use crate::model::{Vendor, parse_rating_cell};
use crate::store::RowStore;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MergeCounts {
    pub merged: usize,
    pub skipped_valid: usize,
    pub skipped_no_result: usize,
}

pub fn run(args: MergeArgs) -> Result<()> {
    if !args.input.exists() {
        bail!("file not found: {}", args.input.display());
    }

    let counts = merge_into_store(&args.input, &args.output_root, args.vendor)?;
    info!(
        vendor = %args.vendor,
        merged = counts.merged,
        skipped_valid = counts.skipped_valid,
        skipped_no_result = counts.skipped_no_result,
        "merge completed"
    );
    Ok(())
}

pub fn merge_into_store(input: &Path, output_root: &Path, vendor: Vendor) -> Result<MergeCounts> {
    let judge_dir = judge_dataset_dir(output_root, vendor, input);
    if !judge_dir.is_dir() {
        bail!("judge directory not found: {}", judge_dir.display());
    }

    let batch_files = find_batch_files_recursive(&judge_dir)?.len();
    let results = load_valid_results(&judge_dir)?;
    info!(
        path = %judge_dir.display(),
        batch_files,
        valid_results = results.len(),
        "loaded judge results"
    );
    if results.is_empty() {
        bail!("no valid judge results found in {}", judge_dir.display());
    }

    let mut store = RowStore::load(input)?;
    let rating_column = vendor.rating_column();
    let reason_column = vendor.reason_column();
    for column in [&rating_column, &reason_column] {
        if store.ensure_column(column) {
            info!(column = %column, "added column");
        }
    }

    let mut counts = MergeCounts::default();
    for row_idx in 0..store.len() {
        let qa_id = store.qa_id(row_idx);
        let Some((rating, reason)) = results.get(&qa_id) else {
            counts.skipped_no_result += 1;
            continue;
        };

        if parse_rating_cell(store.get(row_idx, &rating_column)).is_some() {
            counts.skipped_valid += 1;
            continue;
        }

        store.set(row_idx, &rating_column, rating.to_string())?;
        store.set(row_idx, &reason_column, reason.as_str())?;
        counts.merged += 1;
    }

    let expected_rows = store.len();
    store.save(input)?;

    let written_rows = RowStore::load(input)?.len();
    if written_rows == expected_rows {
        info!(rows = written_rows, path = %input.display(), "row count verified");
    } else {
        warn!(
            expected = expected_rows,
            actual = written_rows,
            path = %input.display(),
            "row count mismatch after write"
        );
    }

    Ok(counts)
}

#[cfg(test)]
mod tests {
    use std::fs;

    use super::*;

    #[test]
    fn merge_fills_missing_ratings_and_keeps_valid_ones() {
        let dir = tempfile::tempdir().expect("tempdir");
        let input = dir.path().join("model_x.csv");
        fs::write(
            &input,
            concat!(
                "QA_Pair_ID,Question,Model Answer,Reference Answer,Gemini_Judge_Rating\n",
                "qa1,q1,a,a,\n",
                "qa2,q2,a,b,2\n",
                "qa3,q3,a,c,-1\n",
                "qa4,q4,a,d,\n",
            ),
        )
        .expect("write input");

        let run_dir = dir
            .path()
            .join("output")
            .join("gemini_judge")
            .join("model_x")
            .join("20250101T000000Z");
        fs::create_dir_all(&run_dir).expect("mkdir");
        fs::write(
            run_dir.join("batch_0001.csv"),
            concat!(
                "QA_Pair_ID,Question,Model_Answer,Reference_Answer,Judge_Rating,Judge_Reason\n",
                "qa1,q1,a,a,4,\"same, really\"\n",
                "qa2,q2,a,b,4,would overwrite\n",
                "qa3,q3,a,c,3,partial\n",
                "qa4,q4,a,d,-1,Missing response\n",
            ),
        )
        .expect("write batch");

        let counts =
            merge_into_store(&input, &dir.path().join("output"), Vendor::Gemini).expect("merge");
        assert_eq!(
            counts,
            MergeCounts {
                merged: 2,
                skipped_valid: 1,
                skipped_no_result: 1,
            }
        );

        let store = RowStore::load(&input).expect("reload");
        assert_eq!(store.get(0, "Gemini_Judge_Rating"), "4");
        assert_eq!(store.get(0, "Gemini_Judge_Reason"), "same, really");
        assert_eq!(store.get(1, "Gemini_Judge_Rating"), "2");
        assert_eq!(store.get(2, "Gemini_Judge_Rating"), "3");
        assert_eq!(store.get(3, "Gemini_Judge_Rating"), "");
    }

    #[test]
    fn merge_fails_without_judge_directory() {
        let dir = tempfile::tempdir().expect("tempdir");
        let input = dir.path().join("model_y.csv");
        fs::write(&input, "QA_Pair_ID\nqa1\n").expect("write input");

        let err = merge_into_store(&input, &dir.path().join("output"), Vendor::Claude)
            .expect_err("missing directory");
        assert!(err.to_string().contains("judge directory not found"));
    }
}
