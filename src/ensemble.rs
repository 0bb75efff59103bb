use std::collections::BTreeMap;

use anyhow::Result;
use serde::Serialize;

use crate::model::{
    CORRECT_THRESHOLD, ENSEMBLE_RATING_COLUMN, INVALID_RATING, MAX_RATING, MIN_RATING,
    QA_TYPE_COLUMN, is_valid_rating, parse_rating_cell,
};
use crate::store::RowStore;

pub const JUDGE_RATING_COLUMNS: [&str; 4] = [
    "Claude_Judge_Rating",
    "Gemini_Judge_Rating",
    "Openai_Judge_Rating",
    "Gpt4o_Judge_Rating",
];

pub const MIN_ENSEMBLE_JUDGES: usize = 2;

pub const TEACHER_QA_TYPE: &str = "teacher";
pub const SYNTHETIC_QA_TYPES: [&str; 2] = ["claude", "gpt4o"];
const ENSEMBLE_SOURCE_ORDER: [&str; 3] = ["teacher", "gpt4o", "claude"];

// Ties go to the higher rating.
pub fn majority_vote(ratings: &[i64]) -> i64 {
    let mut counts = [0usize; (MAX_RATING + 1) as usize];
    for &rating in ratings.iter().filter(|&&rating| is_valid_rating(rating)) {
        counts[rating as usize] += 1;
    }

    let mut best = INVALID_RATING;
    let mut best_count = 0;
    for rating in MIN_RATING..=MAX_RATING {
        let count = counts[rating as usize];
        if count > 0 && count >= best_count {
            best = rating;
            best_count = count;
        }
    }
    best
}

pub fn binarized_accuracy(ratings: &[i64]) -> (f64, usize) {
    let valid = ratings
        .iter()
        .copied()
        .filter(|&rating| is_valid_rating(rating))
        .collect::<Vec<_>>();
    if valid.is_empty() {
        return (0.0, 0);
    }
    let correct = valid
        .iter()
        .filter(|&&rating| rating >= CORRECT_THRESHOLD)
        .count();
    (correct as f64 / valid.len() as f64, valid.len())
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RatingDistribution {
    pub ratings: BTreeMap<i64, usize>,
    pub incorrect: usize,
    pub correct: usize,
}

pub fn rating_distribution(ratings: &[i64]) -> RatingDistribution {
    let mut distribution = RatingDistribution {
        ratings: (MIN_RATING..=MAX_RATING).map(|rating| (rating, 0)).collect(),
        ..RatingDistribution::default()
    };
    for &rating in ratings.iter().filter(|&&rating| is_valid_rating(rating)) {
        *distribution.ratings.entry(rating).or_default() += 1;
        if rating >= CORRECT_THRESHOLD {
            distribution.correct += 1;
        } else {
            distribution.incorrect += 1;
        }
    }
    distribution
}

pub fn present_judge_columns(store: &RowStore) -> Vec<&'static str> {
    JUDGE_RATING_COLUMNS
        .into_iter()
        .filter(|column| store.has_column(column))
        .collect()
}

pub fn row_ratings(store: &RowStore, row_idx: usize, columns: &[&str]) -> Vec<i64> {
    columns
        .iter()
        .map(|column| parse_rating_cell(store.get(row_idx, column)).unwrap_or(INVALID_RATING))
        .collect()
}

// Leaves the store untouched when fewer than two judge columns exist.
pub fn apply_ensemble(store: &mut RowStore) -> Result<bool> {
    let columns = present_judge_columns(store);
    if columns.len() < MIN_ENSEMBLE_JUDGES {
        return Ok(false);
    }

    let votes = (0..store.len())
        .map(|row_idx| majority_vote(&row_ratings(store, row_idx, &columns)))
        .collect::<Vec<_>>();

    store.ensure_column(ENSEMBLE_RATING_COLUMN);
    for (row_idx, vote) in votes.into_iter().enumerate() {
        store.set(row_idx, ENSEMBLE_RATING_COLUMN, vote.to_string())?;
    }
    Ok(true)
}

#[derive(Debug, Clone, Serialize)]
pub struct GroupScore {
    pub label: String,
    pub accuracy: f64,
    pub samples: usize,
    pub distribution: RatingDistribution,
}

impl GroupScore {
    fn from_ratings(label: impl Into<String>, ratings: &[i64]) -> Self {
        let (accuracy, samples) = binarized_accuracy(ratings);
        Self {
            label: label.into(),
            accuracy,
            samples,
            distribution: rating_distribution(ratings),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct JudgeScoreReport {
    pub judge: String,
    pub column: String,
    pub teacher: Option<GroupScore>,
    pub synthetic: Option<GroupScore>,
    pub by_source: Vec<GroupScore>,
}

fn column_ratings_where(
    store: &RowStore,
    column: &str,
    keep: impl Fn(&str) -> bool,
) -> Vec<i64> {
    (0..store.len())
        .filter(|&row_idx| keep(store.get(row_idx, QA_TYPE_COLUMN).trim()))
        .map(|row_idx| parse_rating_cell(store.get(row_idx, column)).unwrap_or(INVALID_RATING))
        .collect()
}

fn qa_types_in_order(store: &RowStore) -> Vec<String> {
    let mut seen = Vec::<String>::new();
    for qa_type in store.column_values(QA_TYPE_COLUMN) {
        let qa_type = qa_type.trim();
        if !seen.iter().any(|known| known == qa_type) {
            seen.push(qa_type.to_string());
        }
    }
    seen
}

fn judge_report(store: &RowStore, judge: &str, column: &str, sources: &[String]) -> JudgeScoreReport {
    let qa_types = qa_types_in_order(store);

    let teacher = qa_types
        .iter()
        .any(|qa_type| qa_type == TEACHER_QA_TYPE)
        .then(|| {
            GroupScore::from_ratings(
                "TEACHER",
                &column_ratings_where(store, column, |qa_type| qa_type == TEACHER_QA_TYPE),
            )
        });

    let synthetic_ratings = column_ratings_where(store, column, |qa_type| {
        SYNTHETIC_QA_TYPES.contains(&qa_type)
    });
    let synthetic = (!synthetic_ratings.is_empty())
        .then(|| GroupScore::from_ratings("SYNTHETIC (Claude+GPT4o)", &synthetic_ratings));

    let by_source = sources
        .iter()
        .filter(|source| qa_types.contains(*source))
        .map(|source| {
            GroupScore::from_ratings(
                source.to_uppercase(),
                &column_ratings_where(store, column, |qa_type| qa_type == source.as_str()),
            )
        })
        .collect();

    JudgeScoreReport {
        judge: judge.to_string(),
        column: column.to_string(),
        teacher,
        synthetic,
        by_source,
    }
}

pub fn score_reports(store: &RowStore) -> Vec<JudgeScoreReport> {
    let mut reports = Vec::new();

    if store.has_column(ENSEMBLE_RATING_COLUMN) {
        let sources = ENSEMBLE_SOURCE_ORDER.map(str::to_string);
        reports.push(judge_report(store, "Ensemble", ENSEMBLE_RATING_COLUMN, &sources));
    }

    let sources = qa_types_in_order(store);
    for column in present_judge_columns(store) {
        let judge = column.trim_end_matches("_Judge_Rating");
        reports.push(judge_report(store, judge, column, &sources));
    }

    reports
}

pub fn teacher_synthetic_scores(store: &RowStore) -> (f64, f64) {
    let teacher = column_ratings_where(store, ENSEMBLE_RATING_COLUMN, |qa_type| {
        qa_type == TEACHER_QA_TYPE
    });
    let synthetic = column_ratings_where(store, ENSEMBLE_RATING_COLUMN, |qa_type| {
        SYNTHETIC_QA_TYPES.contains(&qa_type)
    });
    (binarized_accuracy(&teacher).0, binarized_accuracy(&synthetic).0)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store(headers: &[&str], rows: &[&[&str]]) -> RowStore {
        let mut store = RowStore::new(headers.iter().map(|h| h.to_string()).collect());
        for row in rows {
            store.push_row(row.iter().map(|cell| cell.to_string()).collect());
        }
        store
    }

    #[test]
    fn majority_vote_prefers_mode_then_higher_rating() {
        assert_eq!(majority_vote(&[3, 3, 2, 4]), 3);
        assert_eq!(majority_vote(&[3, 3, 4, 4]), 4);
        assert_eq!(majority_vote(&[1, 2]), 2);
        assert_eq!(majority_vote(&[-1, 2, 7, -1]), 2);
        assert_eq!(majority_vote(&[-1, -1]), INVALID_RATING);
        assert_eq!(majority_vote(&[]), INVALID_RATING);
    }

    #[test]
    fn binarized_accuracy_ignores_invalid_ratings() {
        assert_eq!(binarized_accuracy(&[1, 2, 3, 4]), (0.5, 4));
        assert_eq!(binarized_accuracy(&[4, -1, 3]), (1.0, 2));
        assert_eq!(binarized_accuracy(&[]), (0.0, 0));
        assert_eq!(binarized_accuracy(&[-1]), (0.0, 0));
    }

    #[test]
    fn rating_distribution_counts_each_bucket() {
        let distribution = rating_distribution(&[1, 4, 4, 3, -1]);
        assert_eq!(distribution.ratings[&1], 1);
        assert_eq!(distribution.ratings[&2], 0);
        assert_eq!(distribution.ratings[&4], 2);
        assert_eq!(distribution.incorrect, 1);
        assert_eq!(distribution.correct, 3);
    }

    #[test]
    fn apply_ensemble_requires_two_judges() {
        let mut single = store(&["QA Type", "Claude_Judge_Rating"], &[&["teacher", "4"]]);
        assert!(!apply_ensemble(&mut single).expect("apply"));
        assert!(!single.has_column(ENSEMBLE_RATING_COLUMN));

        let mut rows = store(
            &[
                "QA Type",
                "Claude_Judge_Rating",
                "Gemini_Judge_Rating",
                "Openai_Judge_Rating",
            ],
            &[
                &["teacher", "3", "3.0", "2"],
                &["claude", "", "-1", ""],
                &["gpt4o", "1", "4", "-1"],
            ],
        );
        assert!(apply_ensemble(&mut rows).expect("apply"));
        let votes: Vec<&str> = rows.column_values(ENSEMBLE_RATING_COLUMN).collect();
        assert_eq!(votes, ["3", "-1", "4"]);
    }

    #[test]
    fn score_reports_group_by_teacher_synthetic_and_source() {
        let rows = store(
            &["QA Type", "Claude_Judge_Rating", "Gemini_Judge_Rating", "Ensemble_Judge_Rating"],
            &[
                &["teacher", "4", "3", "4"],
                &["teacher", "1", "2", "2"],
                &["claude", "3", "3", "3"],
                &["gpt4o", "2", "-1", "2"],
                &["human", "4", "4", "4"],
            ],
        );

        let reports = score_reports(&rows);
        assert_eq!(reports.len(), 3);

        let ensemble = &reports[0];
        assert_eq!(ensemble.judge, "Ensemble");
        let teacher = ensemble.teacher.as_ref().expect("teacher group");
        assert_eq!((teacher.accuracy, teacher.samples), (0.5, 2));
        let synthetic = ensemble.synthetic.as_ref().expect("synthetic group");
        assert_eq!((synthetic.accuracy, synthetic.samples), (0.5, 2));
        let labels: Vec<&str> = ensemble.by_source.iter().map(|g| g.label.as_str()).collect();
        assert_eq!(labels, ["TEACHER", "GPT4O", "CLAUDE"]);

        let gemini = &reports[2];
        assert_eq!(gemini.judge, "Gemini");
        let labels: Vec<&str> = gemini.by_source.iter().map(|g| g.label.as_str()).collect();
        assert_eq!(labels, ["TEACHER", "CLAUDE", "GPT4O", "HUMAN"]);
        assert_eq!(gemini.by_source[2].samples, 0);
    }

    #[test]
    fn teacher_synthetic_scores_use_ensemble_column() {
        let rows = store(
            &["QA Type", "Ensemble_Judge_Rating"],
            &[
                &["teacher", "4"],
                &["teacher", "-1"],
                &["claude", "1"],
                &["gpt4o", "3"],
            ],
        );
        assert_eq!(teacher_synthetic_scores(&rows), (1.0, 0.5));
    }
}
