use std::collections::HashMap;
use std::path::Path;

use anyhow::{Context, Result, bail};
use csv::{QuoteStyle, ReaderBuilder, WriterBuilder};
use serde::Serialize;

use crate::model::{
    MODEL_ANSWER_COLUMN, QA_ID_COLUMN, QUESTION_COLUMN, QaRecord, REFERENCE_ANSWER_COLUMN,
};
use crate::util::{commit_staged, ensure_directory, staging_path};

const UTF8_BOM: char = '\u{feff}';

#[derive(Debug, Clone, Default)]
pub struct RowStore {
    headers: Vec<String>,
    index: HashMap<String, usize>,
    rows: Vec<Vec<String>>,
}

impl RowStore {
    pub fn new(headers: Vec<String>) -> Self {
        let index = build_index(&headers);
        Self {
            headers,
            index,
            rows: Vec::new(),
        }
    }

    pub fn load(path: &Path) -> Result<Self> {
        let mut reader = ReaderBuilder::new()
            .has_headers(true)
            .from_path(path)
            .with_context(|| format!("failed to open csv: {}", path.display()))?;

        let mut headers = reader
            .headers()
            .with_context(|| format!("failed to read csv header: {}", path.display()))?
            .iter()
            .map(ToOwned::to_owned)
            .collect::<Vec<_>>();
        if let Some(first) = headers.first_mut() {
            if let Some(stripped) = first.strip_prefix(UTF8_BOM) {
                *first = stripped.to_string();
            }
        }

        let mut store = Self::new(headers);
        for (row_idx, record) in reader.records().enumerate() {
            let record = record.with_context(|| {
                format!("failed to read csv row {} in {}", row_idx + 1, path.display())
            })?;
            store.rows.push(record.iter().map(ToOwned::to_owned).collect());
        }

        Ok(store)
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent().filter(|parent| !parent.as_os_str().is_empty()) {
            ensure_directory(parent)?;
        }

        let staged = staging_path(path);
        {
            let mut writer = WriterBuilder::new()
                .quote_style(QuoteStyle::NonNumeric)
                .from_path(&staged)
                .with_context(|| format!("failed to create csv: {}", staged.display()))?;
            writer
                .write_record(&self.headers)
                .with_context(|| format!("failed to write csv header: {}", staged.display()))?;
            for row in &self.rows {
                writer
                    .write_record(row)
                    .with_context(|| format!("failed to write csv row: {}", staged.display()))?;
            }
            writer
                .flush()
                .with_context(|| format!("failed to flush csv: {}", staged.display()))?;
        }

        commit_staged(&staged, path)
    }

    pub fn headers(&self) -> &[String] {
        &self.headers
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn has_column(&self, column: &str) -> bool {
        self.index.contains_key(column)
    }

    pub fn ensure_column(&mut self, column: &str) -> bool {
        if self.has_column(column) {
            return false;
        }
        self.index.insert(column.to_string(), self.headers.len());
        self.headers.push(column.to_string());
        for row in &mut self.rows {
            row.push(String::new());
        }
        true
    }

    pub fn push_row(&mut self, mut row: Vec<String>) {
        row.resize(self.headers.len(), String::new());
        self.rows.push(row);
    }

    pub fn get(&self, row_idx: usize, column: &str) -> &str {
        self.index
            .get(column)
            .and_then(|&col| self.rows.get(row_idx).and_then(|row| row.get(col)))
            .map(String::as_str)
            .unwrap_or("")
    }

    pub fn set(&mut self, row_idx: usize, column: &str, value: impl Into<String>) -> Result<()> {
        let Some(&col) = self.index.get(column) else {
            bail!("unknown column: {column}");
        };
        let Some(row) = self.rows.get_mut(row_idx) else {
            bail!("row index {row_idx} out of range ({} rows)", self.rows.len());
        };
        if row.len() <= col {
            row.resize(col + 1, String::new());
        }
        row[col] = value.into();
        Ok(())
    }

    pub fn column_values<'a>(&'a self, column: &str) -> impl Iterator<Item = &'a str> + 'a {
        let col = self.index.get(column).copied();
        self.rows.iter().map(move |row| {
            col.and_then(|col| row.get(col))
                .map(String::as_str)
                .unwrap_or("")
        })
    }

    pub fn qa_id(&self, row_idx: usize) -> String {
        let id = self.get(row_idx, QA_ID_COLUMN).trim();
        if id.is_empty() {
            fallback_qa_id(row_idx)
        } else {
            id.to_string()
        }
    }

    pub fn qa_record(&self, row_idx: usize) -> Option<QaRecord> {
        let question = self.get(row_idx, QUESTION_COLUMN).trim();
        let candidate = self.get(row_idx, MODEL_ANSWER_COLUMN).trim();
        let reference = self.get(row_idx, REFERENCE_ANSWER_COLUMN).trim();

        if question.is_empty() || candidate.is_empty() || reference.is_empty() {
            return None;
        }

        Some(QaRecord {
            id: self.qa_id(row_idx),
            question: question.to_string(),
            reference_answer: reference.to_string(),
            candidate_answer: candidate.to_string(),
        })
    }
}

pub fn fallback_qa_id(row_idx: usize) -> String {
    format!("qa_{row_idx:06}")
}

fn build_index(headers: &[String]) -> HashMap<String, usize> {
    let mut index = HashMap::with_capacity(headers.len());
    for (col, header) in headers.iter().enumerate() {
        index.entry(header.clone()).or_insert(col);
    }
    index
}

pub fn write_typed_csv<T: Serialize>(path: &Path, rows: &[T]) -> Result<()> {
    if let Some(parent) = path.parent().filter(|parent| !parent.as_os_str().is_empty()) {
        ensure_directory(parent)?;
    }

    let staged = staging_path(path);
    {
        let mut writer = WriterBuilder::new()
            .quote_style(QuoteStyle::NonNumeric)
            .from_path(&staged)
            .with_context(|| format!("failed to create csv: {}", staged.display()))?;
        for row in rows {
            writer
                .serialize(row)
                .with_context(|| format!("failed to write csv row: {}", staged.display()))?;
        }
        writer
            .flush()
            .with_context(|| format!("failed to flush csv: {}", staged.display()))?;
    }

    commit_staged(&staged, path)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write_file(path: &Path, contents: &str) {
        std::fs::write(path, contents).expect("write fixture");
    }

    #[test]
    fn load_strips_bom_and_reads_columns_by_name() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("rows.csv");
        write_file(
            &path,
            "\u{feff}QA_Pair_ID,Question,Model Answer,Reference Answer\nqa1,\"What, exactly?\",x = 3,3\n",
        );

        let store = RowStore::load(&path).expect("load");
        assert_eq!(store.headers()[0], "QA_Pair_ID");
        assert_eq!(store.len(), 1);
        assert_eq!(store.get(0, "Question"), "What, exactly?");
        assert_eq!(store.get(0, "Missing Column"), "");
    }

    #[test]
    fn qa_record_requires_all_three_texts_and_falls_back_on_missing_id() {
        let mut store = RowStore::new(vec![
            "QA_Pair_ID".to_string(),
            "Question".to_string(),
            "Model Answer".to_string(),
            "Reference Answer".to_string(),
        ]);
        store.push_row(vec![
            String::new(),
            "q".to_string(),
            "a".to_string(),
            "r".to_string(),
        ]);
        store.push_row(vec![
            "qa2".to_string(),
            "q".to_string(),
            "  ".to_string(),
            "r".to_string(),
        ]);

        let record = store.qa_record(0).expect("first row is judgeable");
        assert_eq!(record.id, "qa_000000");
        assert!(store.qa_record(1).is_none());
    }

    #[test]
    fn save_round_trips_added_columns_and_quotes_text() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("rows.csv");
        let mut store = RowStore::new(vec!["QA_Pair_ID".to_string(), "Question".to_string()]);
        store.push_row(vec!["qa1".to_string(), "line one\nline two".to_string()]);

        assert!(store.ensure_column("Claude_Judge_Rating"));
        assert!(!store.ensure_column("Claude_Judge_Rating"));
        store
            .set(0, "Claude_Judge_Rating", "4")
            .expect("set rating");
        store.save(&path).expect("save");

        let raw = std::fs::read_to_string(&path).expect("read back");
        assert!(raw.starts_with("\"QA_Pair_ID\",\"Question\",\"Claude_Judge_Rating\""));
        assert!(!staging_path(&path).exists());

        let reloaded = RowStore::load(&path).expect("reload");
        assert_eq!(reloaded.get(0, "Question"), "line one\nline two");
        assert_eq!(reloaded.get(0, "Claude_Judge_Rating"), "4");
    }

    #[test]
    fn set_rejects_unknown_columns() {
        let mut store = RowStore::new(vec!["QA_Pair_ID".to_string()]);
        store.push_row(vec!["qa1".to_string()]);
        assert!(store.set(0, "Nope", "x").is_err());
    }
}
