use anyhow::Result;
use std::{
    collections::HashMap,
    fs::File,
    io::{BufWriter, Write},
    path::Path,
};

pub const LOG_FILE: &str = "log.csv";

/// Tabular metric log, one row per training iteration. Columns appear in the order their key was
/// first logged; a row may omit any key.
#[derive(Debug, Default)]
pub struct DataLog {
    columns: Vec<String>,
    rows: Vec<HashMap<String, f32>>,
}

impl DataLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn new_row(&mut self) {
        self.rows.push(HashMap::new());
    }

    /// Records `value` under `key` in the current row, opening the first row if needed.
    pub fn log_kv(&mut self, key: &str, value: f32) {
        if !self.columns.iter().any(|column| column == key) {
            self.columns.push(key.to_string());
        }
        if self.rows.is_empty() {
            self.new_row();
        }
        if let Some(row) = self.rows.last_mut() {
            row.insert(key.to_string(), value);
        }
    }

    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    pub fn num_rows(&self) -> usize {
        self.rows.len()
    }

    /// Every row's value for `key`.
    pub fn get(&self, key: &str) -> Vec<Option<f32>> {
        self.rows.iter().map(|row| row.get(key).copied()).collect()
    }

    pub fn latest(&self, key: &str) -> Option<f32> {
        self.rows.last().and_then(|row| row.get(key).copied())
    }

    /// Rewrites `<dir>/log.csv`. Missing metrics are written as empty cells.
    pub fn save_log(&self, dir: &Path) -> Result<()> {
        let mut f = BufWriter::new(File::create(dir.join(LOG_FILE))?);
        writeln!(f, "{}", self.columns.join(","))?;
        for row in &self.rows {
            let cells: Vec<String> = self
                .columns
                .iter()
                .map(|column| row.get(column).map(|v| v.to_string()).unwrap_or_default())
                .collect();
            writeln!(f, "{}", cells.join(","))?;
        }
        f.flush()?;
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn rows_keep_first_seen_column_order() -> Result<()> {
        let mut log = DataLog::new();
        log.log_kv("rollout_score", -3.);
        log.log_kv("iter_time", 0.5);
        log.new_row();
        log.log_kv("eval_score", 1.);
        log.log_kv("rollout_score", -2.);
        assert_eq!(log.columns(), ["rollout_score", "iter_time", "eval_score"]);
        assert_eq!(log.get("rollout_score"), vec![Some(-3.), Some(-2.)]);
        assert_eq!(log.get("eval_score"), vec![None, Some(1.)]);
        assert_eq!(log.latest("iter_time"), None);

        let dir = tempfile::tempdir()?;
        log.save_log(dir.path())?;
        let written = std::fs::read_to_string(dir.path().join(LOG_FILE))?;
        let lines: Vec<&str> = written.lines().collect();
        assert_eq!(lines, ["rollout_score,iter_time,eval_score", "-3,0.5,", "-2,,1"]);
        Ok(())
    }
}
