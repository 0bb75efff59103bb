use std::path::Path;

use anyhow::{Result, bail};
use serde::Serialize;
use tracing::{info, warn};

use crate::cli::EvaluateArgs;
use crate::ensemble::{
    GroupScore, JudgeScoreReport, apply_ensemble, present_judge_columns, score_reports,
};
use crate::store::RowStore;
use crate::util::{dataset_basename, now_utc_string, write_json_pretty};

#[derive(Debug, Serialize)]
struct EvaluationReport {
    generated_at: String,
    input_path: String,
    model: String,
    rows: usize,
    judge_columns: Vec<String>,
    ensemble_written: bool,
    reports: Vec<JudgeScoreReport>,
}

pub fn run(args: EvaluateArgs) -> Result<()> {
    if !args.input.exists() {
        bail!("file not found: {}", args.input.display());
    }

    let mut store = RowStore::load(&args.input)?;
    let judge_columns = present_judge_columns(&store);
    info!(
        input = %args.input.display(),
        rows = store.len(),
        judges = %judge_columns.join(", "),
        "evaluation started"
    );

    let mut ensemble_written = false;
    if !args.skip_ensemble {
        if apply_ensemble(&mut store)? {
            store.save(&args.input)?;
            ensemble_written = true;
            info!(path = %args.input.display(), "ensemble rating column written");
        } else {
            warn!(
                judges = judge_columns.len(),
                "need at least 2 judge columns for ensemble voting, skipping"
            );
        }
    }

    if args.skip_scores {
        return Ok(());
    }

    let reports = score_reports(&store);
    for report in &reports {
        log_report(report);
    }

    if let Some(report_path) = &args.report_path {
        let report = EvaluationReport {
            generated_at: now_utc_string(),
            input_path: args.input.display().to_string(),
            model: dataset_basename(&args.input),
            rows: store.len(),
            judge_columns: judge_columns.iter().map(|c| c.to_string()).collect(),
            ensemble_written,
            reports,
        };
        write_report(report_path, &report)?;
    }

    Ok(())
}

fn write_report(path: &Path, report: &EvaluationReport) -> Result<()> {
    write_json_pretty(path, report)?;
    info!(path = %path.display(), "wrote evaluation report");
    Ok(())
}

fn log_report(report: &JudgeScoreReport) {
    let groups = report
        .teacher
        .iter()
        .chain(report.synthetic.iter())
        .chain(report.by_source.iter());
    for group in groups {
        log_group(&report.judge, group);
    }
}

fn log_group(judge: &str, group: &GroupScore) {
    let dist = &group.distribution;
    let count = |rating: i64| dist.ratings.get(&rating).copied().unwrap_or(0);
    info!(
        judge = %judge,
        group = %group.label,
        accuracy = %format!("{:.1}%", group.accuracy * 100.0),
        n = group.samples,
        r1 = count(1),
        r2 = count(2),
        r3 = count(3),
        r4 = count(4),
        incorrect = dist.incorrect,
        correct = dist.correct,
        "binarized accuracy"
    );
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::fs;
    use std::time::Duration;

    use super::*;
    use crate::commands::judge::execute;
    use crate::commands::merge::merge_into_store;
    use crate::config::{JudgeConfig, PollSettings};
    use crate::ensemble::row_ratings;
    use crate::judge::{BatchJudge, JobHandle, JobStatus, JudgeRequest, RawOutcome, RawRecord};
    use crate::model::{ENSEMBLE_RATING_COLUMN, TokenUsage, Vendor, parse_rating_cell};

    // Replies with a fixed rating per QA id; ids without one get unparseable text.
    struct TableJudge {
        vendor: Vendor,
        ratings: HashMap<&'static str, i64>,
    }

    impl BatchJudge for TableJudge {
        fn vendor(&self) -> Vendor {
            self.vendor
        }

        fn model(&self) -> &str {
            "table"
        }

        fn submit(&self, requests: &[JudgeRequest]) -> Result<JobHandle> {
            Ok(JobHandle {
                id: "job-1".to_string(),
                keys: requests.iter().map(|request| request.key.clone()).collect(),
            })
        }

        fn poll(&self, _handle: &JobHandle) -> Result<JobStatus> {
            Ok(JobStatus::Succeeded {
                state: "ended".to_string(),
                output_ref: Some("results".to_string()),
            })
        }

        fn fetch_results(
            &self,
            handle: &JobHandle,
            _output_ref: &str,
        ) -> Result<Vec<RawRecord>> {
            Ok(handle
                .keys
                .iter()
                .map(|key| RawRecord {
                    key: key.clone(),
                    outcome: match self.ratings.get(key.as_str()) {
                        Some(rating) => RawOutcome::Text(format!(
                            "{{\"rating\": {rating}, \"reason\": \"scored {rating}\"}}"
                        )),
                        None => RawOutcome::Text("no verdict".to_string()),
                    },
                    usage: TokenUsage::default(),
                })
                .collect())
        }
    }

    fn judge_config(output_root: &Path, vendor: Vendor) -> JudgeConfig {
        JudgeConfig {
            vendor,
            model: "table".to_string(),
            batch_size: 10,
            max_tokens: 64,
            poll: PollSettings {
                interval: Duration::ZERO,
                max_wait: None,
            },
            output_root: output_root.to_path_buf(),
            api_key: "test-key".to_string(),
        }
    }

    #[test]
    fn ratings_round_trip_from_batch_files_through_merge_into_ensemble() {
        let dir = tempfile::tempdir().expect("tempdir");
        let input = dir.path().join("model_r.csv");
        fs::write(
            &input,
            concat!(
                "QA_Pair_ID,Question,Model Answer,Reference Answer,QA Type\n",
                "qa1,What is shown?,a dog,a dog,teacher\n",
                "qa2,How many?,two,five,teacher\n",
                "qa3,Which colour?,blue,navy,claude\n",
            ),
        )
        .expect("write input");
        let output_root = dir.path().join("output");

        let judges = [
            TableJudge {
                vendor: Vendor::Claude,
                ratings: HashMap::from([("qa1", 4), ("qa2", 1), ("qa3", 3)]),
            },
            TableJudge {
                vendor: Vendor::Gemini,
                ratings: HashMap::from([("qa1", 3), ("qa2", 2)]),
            },
        ];

        let mut batch_ratings = HashMap::new();
        for judge in &judges {
            let config = judge_config(&output_root, judge.vendor);
            let manifest = execute(&config, judge, &input).expect("judge run");
            assert_eq!(manifest.batch_files, ["batch_0001.csv"]);

            let batch_path = config
                .dataset_dir(&input)
                .join(&manifest.run_id)
                .join("batch_0001.csv");
            let batch = RowStore::load(&batch_path).expect("batch file");
            for row_idx in 0..batch.len() {
                batch_ratings.insert(
                    (judge.vendor, batch.get(row_idx, "QA_Pair_ID").to_string()),
                    batch.get(row_idx, "Judge_Rating").to_string(),
                );
            }
        }
        assert_eq!(batch_ratings[&(Vendor::Gemini, "qa3".to_string())], "-1");

        for judge in &judges {
            merge_into_store(&input, &output_root, judge.vendor).expect("merge");
        }

        let mut store = RowStore::load(&input).expect("reload");
        let columns = [Vendor::Claude.rating_column(), Vendor::Gemini.rating_column()];
        let columns: Vec<&str> = columns.iter().map(String::as_str).collect();
        for row_idx in 0..store.len() {
            let qa_id = store.qa_id(row_idx);
            let read_back = row_ratings(&store, row_idx, &columns);
            for (vendor, rating) in [Vendor::Claude, Vendor::Gemini].into_iter().zip(read_back) {
                let written = &batch_ratings[&(vendor, qa_id.clone())];
                let expected = parse_rating_cell(written).unwrap_or(-1);
                assert_eq!(rating, expected, "{vendor} rating for {qa_id}");
            }
        }
        assert_eq!(store.get(0, "Claude_Judge_Reason"), "scored 4");
        assert_eq!(store.get(2, "Gemini_Judge_Rating"), "");

        assert!(apply_ensemble(&mut store).expect("ensemble"));
        let votes: Vec<&str> = store.column_values(ENSEMBLE_RATING_COLUMN).collect();
        assert_eq!(votes, ["4", "2", "3"]);

        let reports = score_reports(&store);
        let ensemble = &reports[0];
        assert_eq!(ensemble.judge, "Ensemble");
        let teacher = ensemble.teacher.as_ref().expect("teacher group");
        assert_eq!((teacher.accuracy, teacher.samples), (0.5, 2));
        let synthetic = ensemble.synthetic.as_ref().expect("synthetic group");
        assert_eq!((synthetic.accuracy, synthetic.samples), (1.0, 1));

        let gemini = reports
            .iter()
            .find(|report| report.judge == "Gemini")
            .expect("gemini report");
        let teacher = gemini.teacher.as_ref().expect("gemini teacher group");
        assert_eq!((teacher.accuracy, teacher.samples), (0.5, 2));
        assert!(gemini.synthetic.as_ref().is_some_and(|group| group.samples == 0));
    }

    #[test]
    fn run_writes_ensemble_column_and_report() {
        let dir = tempfile::tempdir().expect("tempdir");
        let input = dir.path().join("model_z.csv");
        fs::write(
            &input,
            concat!(
                "QA_Pair_ID,QA Type,Claude_Judge_Rating,Gemini_Judge_Rating,Openai_Judge_Rating\n",
                "qa1,teacher,4,4,1\n",
                "qa2,teacher,1,2,2\n",
                "qa3,claude,3,4,\n",
            ),
        )
        .expect("write input");
        let report_path = dir.path().join("reports").join("model_z.json");

        run(EvaluateArgs {
            input: input.clone(),
            skip_ensemble: false,
            skip_scores: false,
            report_path: Some(report_path.clone()),
        })
        .expect("evaluate");

        let store = RowStore::load(&input).expect("reload");
        let votes: Vec<&str> = store.column_values(ENSEMBLE_RATING_COLUMN).collect();
        assert_eq!(votes, ["4", "2", "4"]);

        let report: serde_json::Value =
            serde_json::from_slice(&fs::read(&report_path).expect("read report"))
                .expect("parse report");
        assert_eq!(report["ensemble_written"], true);
        assert_eq!(report["reports"][0]["judge"], "Ensemble");
        assert_eq!(report["reports"][0]["teacher"]["accuracy"], 0.5);
        assert_eq!(report["reports"][0]["synthetic"]["samples"], 1);
    }

    #[test]
    fn run_rejects_missing_input() {
        let dir = tempfile::tempdir().expect("tempdir");
        let err = run(EvaluateArgs {
            input: dir.path().join("absent.csv"),
            skip_ensemble: false,
            skip_scores: true,
            report_path: None,
        })
        .expect_err("missing input");
        assert!(err.to_string().contains("file not found"));
    }
}
