use std::cmp::Ordering;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use tracing::{info, warn};

use crate::cli::ScoresArgs;
use crate::ensemble::teacher_synthetic_scores;
use crate::store::RowStore;
use crate::util::dataset_basename;

const TEMPLATE_SUFFIX: &str = "template.csv";

#[derive(Debug, Clone, PartialEq)]
pub struct ModelScore {
    pub model: String,
    pub scores: Result<(f64, f64), String>,
}

pub fn run(args: ScoresArgs) -> Result<()> {
    let files = model_csv_files(&args.output_root)?;
    if files.is_empty() {
        warn!(path = %args.output_root.display(), "no model csv files found");
        return Ok(());
    }

    let ranked = rank_models(&files);
    info!(models = ranked.len(), "ranked models by ensemble teacher accuracy");

    println!("Model Rankings (Ensemble Judge, Binarized Accuracy)");
    println!("Model Name, Teacher QA, Synthetic QA");
    println!("{}", "=".repeat(60));
    for line in ranked.iter().map(format_score_line) {
        println!("{line}");
    }

    Ok(())
}

pub fn model_csv_files(output_root: &Path) -> Result<Vec<PathBuf>> {
    let mut files = Vec::new();
    for entry in fs::read_dir(output_root)
        .with_context(|| format!("failed to read {}", output_root.display()))?
    {
        let path = entry
            .with_context(|| format!("failed to read entry in {}", output_root.display()))?
            .path();
        let name = path
            .file_name()
            .and_then(|name| name.to_str())
            .unwrap_or_default();
        let is_csv = path
            .extension()
            .and_then(|ext| ext.to_str())
            .map(|ext| ext.eq_ignore_ascii_case("csv"))
            .unwrap_or(false);

        if path.is_file() && is_csv && !name.ends_with(TEMPLATE_SUFFIX) {
            files.push(path);
        }
    }
    files.sort();
    Ok(files)
}

// Sorted by teacher accuracy descending; unreadable files sort last.
pub fn rank_models(files: &[PathBuf]) -> Vec<ModelScore> {
    let mut ranked = files
        .iter()
        .map(|path| ModelScore {
            model: dataset_basename(path),
            scores: RowStore::load(path)
                .map(|store| teacher_synthetic_scores(&store))
                .map_err(|err| format!("{err:#}")),
        })
        .collect::<Vec<_>>();

    let teacher_key = |score: &ModelScore| score.scores.as_ref().map_or(-1.0, |(teacher, _)| *teacher);
    ranked.sort_by(|a, b| {
        teacher_key(b)
            .partial_cmp(&teacher_key(a))
            .unwrap_or(Ordering::Equal)
    });
    ranked
}

pub fn format_score_line(score: &ModelScore) -> String {
    match &score.scores {
        Ok((teacher, synthetic)) => format!("{}: {teacher:.3}, {synthetic:.3}", score.model),
        Err(err) => format!("{}: ERROR - {err}", score.model),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ranks_models_and_skips_templates() {
        let dir = tempfile::tempdir().expect("tempdir");
        fs::write(
            dir.path().join("model_a.csv"),
            "QA Type,Ensemble_Judge_Rating\nteacher,2\nteacher,4\nclaude,4\n",
        )
        .expect("write a");
        fs::write(
            dir.path().join("model_b.csv"),
            "QA Type,Ensemble_Judge_Rating\nteacher,4\ngpt4o,1\n",
        )
        .expect("write b");
        fs::write(dir.path().join("model_c.csv"), "QA Type,Ensemble_Judge_Rating\nteacher\n")
            .expect("write c");
        fs::write(dir.path().join("qa_template.csv"), "QA Type\nteacher\n").expect("write template");
        fs::create_dir_all(dir.path().join("claude_judge")).expect("mkdir");

        let files = model_csv_files(dir.path()).expect("list");
        assert_eq!(files.len(), 3);

        let ranked = rank_models(&files);
        let lines: Vec<String> = ranked.iter().map(format_score_line).collect();
        assert_eq!(lines[0], "model_b: 1.000, 0.000");
        assert_eq!(lines[1], "model_a: 0.500, 1.000");
        assert!(lines[2].starts_with("model_c: ERROR - "));
    }
}
