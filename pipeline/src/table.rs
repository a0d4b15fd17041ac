//! Tabular posterior summaries with joined ground truth.
//!
//! One row per (model, replicate, variable). The statistic columns come from
//! the configured summary functions; `truth` is filled in by [`join_truth`].

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use thiserror::Error;

/// Fixed columns written after the statistic columns
const META_COLUMNS: [&str; 7] = ["truth", "batch", "rep", "index", "seed", "model", "file"];

#[derive(Debug, Error)]
pub enum TableError {
    #[error("ground truth '{variable}' has no matching posterior variable (model '{model}', replicate {index})")]
    UnmatchedTruth {
        variable: String,
        model: String,
        index: usize,
    },

    #[error("missing column '{0}' in summary table")]
    MissingColumn(String),

    #[error("line {line}: {message}")]
    Csv { line: usize, message: String },

    #[error("I/O error on {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Position of a replicate in the batch x rep grid
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ReplicateId {
    pub batch: usize,
    pub rep: usize,
    /// `batch * reps + rep`
    pub index: usize,
    pub seed: u64,
}

impl std::fmt::Display for ReplicateId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "batch {} rep {} (#{})", self.batch, self.rep, self.index)
    }
}

/// Posterior summary of one variable from one model fit on one replicate
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SummaryRow {
    pub variable: String,
    pub stats: BTreeMap<String, f64>,
    /// Ground-truth value, when the generator tagged one for this variable
    pub truth: Option<f64>,
    pub replicate: ReplicateId,
    /// Model name
    pub model: String,
    /// Model file
    pub file: String,
}

impl SummaryRow {
    pub fn stat(&self, column: &str) -> Option<f64> {
        self.stats.get(column).copied()
    }
}

/// Attach ground truth to the rows of one (model, replicate) fit.
///
/// Matching is exact on the variable name. Every truth entry must match at
/// least one row; rows without a truth entry keep `truth = None`.
pub fn join_truth(
    rows: &mut [SummaryRow],
    true_params: &BTreeMap<String, f64>,
) -> Result<(), TableError> {
    for (name, &value) in true_params {
        let mut matched = false;
        for row in rows.iter_mut().filter(|r| &r.variable == name) {
            row.truth = Some(value);
            matched = true;
        }
        if !matched {
            let (model, index) = rows
                .first()
                .map(|r| (r.model.clone(), r.replicate.index))
                .unwrap_or_default();
            return Err(TableError::UnmatchedTruth {
                variable: name.clone(),
                model,
                index,
            });
        }
    }
    Ok(())
}

/// Ordered collection of summary rows
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SummaryTable {
    /// Statistic columns in output order
    pub columns: Vec<String>,
    pub rows: Vec<SummaryRow>,
}

impl SummaryTable {
    pub fn new(columns: Vec<String>) -> Self {
        Self {
            columns,
            rows: Vec::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn extend(&mut self, rows: impl IntoIterator<Item = SummaryRow>) {
        self.rows.extend(rows);
    }

    /// Sort rows by model, replicate and variable
    pub fn sort(&mut self) {
        self.rows.sort_by(|a, b| {
            a.model
                .cmp(&b.model)
                .then(a.replicate.index.cmp(&b.replicate.index))
                .then(a.variable.cmp(&b.variable))
        });
    }

    /// Render as CSV with a header row
    pub fn to_csv(&self) -> String {
        let mut out = String::new();

        let header: Vec<String> = std::iter::once("variable".to_string())
            .chain(self.columns.iter().cloned())
            .chain(META_COLUMNS.iter().map(|c| c.to_string()))
            .map(|c| quote_field(&c))
            .collect();
        out.push_str(&header.join(","));
        out.push('\n');

        for row in &self.rows {
            let mut fields = Vec::with_capacity(self.columns.len() + META_COLUMNS.len() + 1);
            fields.push(quote_field(&row.variable));
            for column in &self.columns {
                fields.push(format_number(row.stat(column)));
            }
            fields.push(format_number(row.truth));
            fields.push(row.replicate.batch.to_string());
            fields.push(row.replicate.rep.to_string());
            fields.push(row.replicate.index.to_string());
            fields.push(row.replicate.seed.to_string());
            fields.push(quote_field(&row.model));
            fields.push(quote_field(&row.file));
            out.push_str(&fields.join(","));
            out.push('\n');
        }
        out
    }

    /// Parse CSV produced by [`SummaryTable::to_csv`]
    pub fn from_csv(content: &str) -> Result<Self, TableError> {
        let mut lines = content.lines().enumerate().filter(|(_, l)| !l.trim().is_empty());

        let (_, header) = lines.next().ok_or(TableError::Csv {
            line: 1,
            message: "empty summary table".to_string(),
        })?;
        let names = split_csv_line(header).map_err(|message| TableError::Csv { line: 1, message })?;

        let position = |name: &str| -> Result<usize, TableError> {
            names
                .iter()
                .position(|n| n == name)
                .ok_or_else(|| TableError::MissingColumn(name.to_string()))
        };
        let variable_idx = position("variable")?;
        let truth_idx = position("truth")?;
        let batch_idx = position("batch")?;
        let rep_idx = position("rep")?;
        let index_idx = position("index")?;
        let seed_idx = position("seed")?;
        let model_idx = position("model")?;
        let file_idx = position("file")?;

        let stat_columns: Vec<(usize, String)> = names
            .iter()
            .enumerate()
            .filter(|(_, n)| n.as_str() != "variable" && !META_COLUMNS.contains(&n.as_str()))
            .map(|(i, n)| (i, n.clone()))
            .collect();

        let mut table = SummaryTable::new(stat_columns.iter().map(|(_, n)| n.clone()).collect());

        for (line_idx, line) in lines {
            let line_num = line_idx + 1;
            let csv_err = |message: String| TableError::Csv {
                line: line_num,
                message,
            };

            let values = split_csv_line(line).map_err(csv_err)?;
            if values.len() != names.len() {
                return Err(csv_err(format!(
                    "{} fields, expected {}",
                    values.len(),
                    names.len()
                )));
            }

            let parse_usize = |idx: usize| -> Result<usize, TableError> {
                values[idx]
                    .parse()
                    .map_err(|_| csv_err(format!("invalid {} '{}'", names[idx], values[idx])))
            };

            let mut stats = BTreeMap::new();
            for (idx, name) in &stat_columns {
                let value = parse_number(&values[*idx])
                    .map_err(|_| csv_err(format!("invalid {} '{}'", name, values[*idx])))?
                    .unwrap_or(f64::NAN);
                stats.insert(name.clone(), value);
            }

            let truth = parse_number(&values[truth_idx])
                .map_err(|_| csv_err(format!("invalid truth '{}'", values[truth_idx])))?;
            let seed = values[seed_idx]
                .parse()
                .map_err(|_| csv_err(format!("invalid seed '{}'", values[seed_idx])))?;

            table.rows.push(SummaryRow {
                variable: values[variable_idx].clone(),
                stats,
                truth,
                replicate: ReplicateId {
                    batch: parse_usize(batch_idx)?,
                    rep: parse_usize(rep_idx)?,
                    index: parse_usize(index_idx)?,
                    seed,
                },
                model: values[model_idx].clone(),
                file: values[file_idx].clone(),
            });
        }

        Ok(table)
    }

    pub fn write_csv(&self, path: &Path) -> Result<(), TableError> {
        fs::write(path, self.to_csv()).map_err(|source| TableError::Io {
            path: path.display().to_string(),
            source,
        })
    }

    pub fn read_csv(path: &Path) -> Result<Self, TableError> {
        let content = fs::read_to_string(path).map_err(|source| TableError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_csv(&content)
    }

    pub fn write_json(&self, path: &Path) -> Result<(), TableError> {
        let content = serde_json::to_string_pretty(self)?;
        fs::write(path, content).map_err(|source| TableError::Io {
            path: path.display().to_string(),
            source,
        })
    }
}

fn format_number(value: Option<f64>) -> String {
    match value {
        Some(v) if v.is_finite() => format!("{}", v),
        Some(v) if v.is_infinite() => {
            if v > 0.0 {
                "Inf".to_string()
            } else {
                "-Inf".to_string()
            }
        }
        _ => "NA".to_string(),
    }
}

fn parse_number(field: &str) -> Result<Option<f64>, std::num::ParseFloatError> {
    match field {
        "NA" | "" => Ok(None),
        other => other.parse().map(Some),
    }
}

pub(crate) fn quote_field(field: &str) -> String {
    if field.contains(',') || field.contains('"') {
        format!("\"{}\"", field.replace('"', "\"\""))
    } else {
        field.to_string()
    }
}

/// Split one CSV line, honouring double-quoted fields
pub(crate) fn split_csv_line(line: &str) -> Result<Vec<String>, String> {
    let mut fields = Vec::new();
    let mut current = String::new();
    let mut in_quotes = false;
    let mut chars = line.chars().peekable();

    while let Some(c) = chars.next() {
        match (c, in_quotes) {
            ('"', true) => {
                if chars.peek() == Some(&'"') {
                    current.push('"');
                    chars.next();
                } else {
                    in_quotes = false;
                }
            }
            ('"', false) if current.is_empty() => in_quotes = true,
            (',', false) => fields.push(std::mem::take(&mut current)),
            (c, _) => current.push(c),
        }
    }
    if in_quotes {
        return Err("unterminated quoted field".to_string());
    }
    fields.push(current);
    Ok(fields)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row(variable: &str, index: usize, lower: f64, upper: f64) -> SummaryRow {
        SummaryRow {
            variable: variable.to_string(),
            stats: [("q2.5".to_string(), lower), ("q97.5".to_string(), upper)]
                .into_iter()
                .collect(),
            truth: None,
            replicate: ReplicateId {
                batch: index / 2,
                rep: index % 2,
                index,
                seed: 1000 + index as u64,
            },
            model: "linear".to_string(),
            file: "models/linear.stan".to_string(),
        }
    }

    #[test]
    fn test_join_truth_exact_match() {
        let mut rows = vec![row("beta", 0, -1.0, 1.0), row("beta[1]", 0, -1.0, 1.0)];
        let truth: BTreeMap<String, f64> = [("beta".to_string(), 0.3)].into_iter().collect();

        join_truth(&mut rows, &truth).unwrap();
        assert_eq!(rows[0].truth, Some(0.3));
        assert_eq!(rows[1].truth, None);
    }

    #[test]
    fn test_join_truth_unmatched_name() {
        let mut rows = vec![row("beta", 3, -1.0, 1.0)];
        let truth: BTreeMap<String, f64> = [("Beta".to_string(), 0.3)].into_iter().collect();

        match join_truth(&mut rows, &truth) {
            Err(TableError::UnmatchedTruth {
                variable, index, ..
            }) => {
                assert_eq!(variable, "Beta");
                assert_eq!(index, 3);
            }
            other => panic!("expected UnmatchedTruth, got {:?}", other),
        }
    }

    #[test]
    fn test_csv_preserves_rows() {
        let mut table = SummaryTable::new(vec!["q2.5".to_string(), "q97.5".to_string()]);
        let mut first = row("beta", 0, -0.5, 1.25);
        first.truth = Some(0.125);
        table.extend(vec![first, row("theta[1,2]", 1, f64::NAN, 2.0)]);

        let csv = table.to_csv();
        assert!(csv.starts_with("variable,q2.5,q97.5,truth,batch,rep,index,seed,model,file\n"));
        assert!(csv.contains("\"theta[1,2]\",NA,2,NA,0,1,1,1001,linear,models/linear.stan"));

        let parsed = SummaryTable::from_csv(&csv).unwrap();
        assert_eq!(parsed.columns, table.columns);
        assert_eq!(parsed.rows[0], table.rows[0]);
        assert_eq!(parsed.rows[1].variable, "theta[1,2]");
        assert!(parsed.rows[1].stat("q2.5").unwrap().is_nan());
        assert_eq!(parsed.rows[1].truth, None);
    }

    #[test]
    fn test_from_csv_missing_column() {
        let csv = "variable,q2.5,q97.5,truth\nbeta,0,1,0.5\n";
        assert!(matches!(
            SummaryTable::from_csv(csv),
            Err(TableError::MissingColumn(c)) if c == "batch"
        ));
    }

    #[test]
    fn test_from_csv_bad_number() {
        let csv = "variable,q2.5,truth,batch,rep,index,seed,model,file\nbeta,abc,1,0,0,0,1,m,f\n";
        assert!(matches!(
            SummaryTable::from_csv(csv),
            Err(TableError::Csv { line: 2, .. })
        ));
    }

    #[test]
    fn test_sort_orders_by_model_then_replicate() {
        let mut table = SummaryTable::new(vec!["q2.5".to_string(), "q97.5".to_string()]);
        let mut other = row("beta", 0, 0.0, 1.0);
        other.model = "a_model".to_string();
        table.extend(vec![row("sigma", 1, 0.0, 1.0), row("beta", 1, 0.0, 1.0), other]);

        table.sort();
        let order: Vec<(&str, usize, &str)> = table
            .rows
            .iter()
            .map(|r| (r.model.as_str(), r.replicate.index, r.variable.as_str()))
            .collect();
        assert_eq!(
            order,
            vec![("a_model", 0, "beta"), ("linear", 1, "beta"), ("linear", 1, "sigma")]
        );
    }

    #[test]
    fn test_split_csv_line_quotes() {
        assert_eq!(
            split_csv_line(r#"a,"b,c","d""e""#).unwrap(),
            vec!["a", "b,c", "d\"e"]
        );
        assert!(split_csv_line("\"open").is_err());
    }
}
