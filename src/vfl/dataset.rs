//! One party's vertical slice of a dataset
//!
//! Rows are keyed by a string id; the label column is only present on the
//! tag party. Loaded from CSV with a header row.

use super::params::{Algorithm, TrainParams};
use crate::error::{DcpError, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::io::{Read, Write};
use std::path::Path;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DataSet {
    pub id_name: String,
    pub ids: Vec<String>,
    /// Feature column names, in column order
    pub features: Vec<String>,
    /// Row-major feature values
    pub rows: Vec<Vec<f64>>,
    /// Label column name and values, tag party only
    pub label: Option<String>,
    pub labels: Option<Vec<f64>>,
}

impl DataSet {
    /// Read a CSV file laid out as described by `params`
    pub fn from_csv_path(path: &Path, algorithm: Algorithm, params: &TrainParams) -> Result<Self> {
        let file = std::fs::File::open(path).map_err(|e| {
            DcpError::Param(format!("cannot open dataset {}: {}", path.display(), e))
        })?;
        Self::from_csv_reader(file, algorithm, params)
    }

    /// Read rows to be scored; the label column is kept when present
    pub fn from_csv_path_for_predict(
        path: &Path,
        algorithm: Algorithm,
        params: &TrainParams,
    ) -> Result<Self> {
        let file = std::fs::File::open(path).map_err(|e| {
            DcpError::GetPredictSet(format!("cannot open dataset {}: {}", path.display(), e))
        })?;
        Self::read(file, algorithm, params, false)
    }

    pub fn from_csv_reader<R: Read>(
        reader: R,
        algorithm: Algorithm,
        params: &TrainParams,
    ) -> Result<Self> {
        Self::read(reader, algorithm, params, true)
    }

    fn read<R: Read>(
        reader: R,
        algorithm: Algorithm,
        params: &TrainParams,
        require_label: bool,
    ) -> Result<Self> {
        let mut rdr = csv::ReaderBuilder::new()
            .has_headers(true)
            .trim(csv::Trim::All)
            .from_reader(reader);
        let headers = rdr.headers()?.clone();

        let id_col = headers
            .iter()
            .position(|h| h == params.id_name)
            .ok_or_else(|| DcpError::Param(format!("id column {:?} not found", params.id_name)))?;
        let label_col = match headers.iter().position(|h| h == params.label) {
            Some(c) if params.is_tag_part => Some(c),
            None if params.is_tag_part && require_label => {
                return Err(DcpError::Param(format!("label column {:?} not found", params.label)))
            }
            _ => None,
        };

        let feature_cols: Vec<usize> = (0..headers.len())
            .filter(|c| *c != id_col && Some(*c) != label_col)
            .collect();
        let features: Vec<String> = feature_cols.iter().map(|c| headers[*c].to_string()).collect();

        let mut ids = Vec::new();
        let mut rows = Vec::new();
        let mut labels = label_col.map(|_| Vec::new());
        let mut seen = HashSet::new();

        for (line, record) in rdr.records().enumerate() {
            let record = record?;
            let id = record.get(id_col).unwrap_or_default().to_string();
            if !seen.insert(id.clone()) {
                return Err(DcpError::Param(format!("duplicate id {:?} at row {}", id, line + 1)));
            }
            let mut row = Vec::with_capacity(feature_cols.len());
            for c in &feature_cols {
                row.push(parse_cell(record.get(*c), &headers[*c], line)?);
            }
            if let (Some(col), Some(labels)) = (label_col, labels.as_mut()) {
                let raw = record.get(col).unwrap_or_default();
                let value = if algorithm.is_logistic() {
                    match &params.label_name {
                        Some(positive) if raw == positive => 1.0,
                        Some(_) => 0.0,
                        None => return Err(DcpError::Param("label_name missing".into())),
                    }
                } else {
                    parse_cell(Some(raw), &headers[col], line)?
                };
                labels.push(value);
            }
            ids.push(id);
            rows.push(row);
        }

        log::debug!(
            "loaded dataset with {} rows, {} features, label={}",
            rows.len(),
            features.len(),
            label_col.is_some()
        );
        Ok(Self {
            id_name: params.id_name.clone(),
            ids,
            features,
            rows,
            label: label_col.map(|c| headers[c].to_string()),
            labels,
        })
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn has_label(&self) -> bool {
        self.labels.is_some()
    }

    /// Subset of rows in the given order
    pub fn select(&self, indices: &[usize]) -> Result<DataSet> {
        let pick = |i: &usize| {
            if *i < self.len() {
                Ok(*i)
            } else {
                Err(DcpError::GetTrainSet(format!(
                    "row {} out of range {}",
                    i,
                    self.len()
                )))
            }
        };
        let idx = indices.iter().map(pick).collect::<Result<Vec<_>>>()?;
        Ok(DataSet {
            id_name: self.id_name.clone(),
            ids: idx.iter().map(|i| self.ids[*i].clone()).collect(),
            features: self.features.clone(),
            rows: idx.iter().map(|i| self.rows[*i].clone()).collect(),
            label: self.label.clone(),
            labels: self
                .labels
                .as_ref()
                .map(|l| idx.iter().map(|i| l[*i]).collect()),
        })
    }

    /// Write back as CSV: id, features, then label
    pub fn write_csv<W: Write>(&self, writer: W) -> Result<()> {
        let mut wtr = csv::Writer::from_writer(writer);
        let mut header = vec![self.id_name.clone()];
        header.extend(self.features.iter().cloned());
        if let Some(label) = &self.label {
            header.push(label.clone());
        }
        wtr.write_record(&header)?;
        for (i, row) in self.rows.iter().enumerate() {
            let mut rec = vec![self.ids[i].clone()];
            rec.extend(row.iter().map(|v| v.to_string()));
            if let Some(labels) = &self.labels {
                rec.push(labels[i].to_string());
            }
            wtr.write_record(&rec)?;
        }
        wtr.flush()?;
        Ok(())
    }
}

fn parse_cell(cell: Option<&str>, column: &str, line: usize) -> Result<f64> {
    let raw = cell.unwrap_or_default();
    raw.parse::<f64>().map_err(|_| {
        DcpError::Param(format!(
            "column {:?} row {}: {:?} is not numeric",
            column,
            line + 1,
            raw
        ))
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    const FEATURES_CSV: &str = "id,a,b\n1,1.0,2.0\n2,3.0,4.0\n3,5.0,6.0\n";
    const LABEL_CSV: &str = "id,c,Label\n3,0.5,yes\n1,0.1,no\n";

    fn params(tag: bool) -> TrainParams {
        TrainParams {
            is_tag_part: tag,
            label: if tag { "Label".into() } else { String::new() },
            label_name: Some("yes".into()),
            ..TrainParams::default()
        }
    }

    #[test]
    fn test_load_feature_party() {
        let ds = DataSet::from_csv_reader(FEATURES_CSV.as_bytes(), Algorithm::LinRegVL, &params(false))
            .unwrap();
        assert_eq!(ds.len(), 3);
        assert_eq!(ds.features, vec!["a", "b"]);
        assert!(!ds.has_label());
        assert_eq!(ds.rows[1], vec![3.0, 4.0]);
    }

    #[test]
    fn test_logistic_label_is_binarised() {
        let ds =
            DataSet::from_csv_reader(LABEL_CSV.as_bytes(), Algorithm::LogRegVL, &params(true)).unwrap();
        assert_eq!(ds.labels, Some(vec![1.0, 0.0]));
        assert_eq!(ds.features, vec!["c"]);
    }

    #[test]
    fn test_duplicate_id_rejected() {
        let csv = "id,a\n1,1\n1,2\n";
        let err = DataSet::from_csv_reader(csv.as_bytes(), Algorithm::LinRegVL, &params(false))
            .unwrap_err();
        assert_eq!(err.code(), 10001);
    }

    #[test]
    fn test_non_numeric_feature_rejected() {
        let csv = "id,a\n1,x\n";
        assert!(DataSet::from_csv_reader(csv.as_bytes(), Algorithm::LinRegVL, &params(false)).is_err());
    }

    #[test]
    fn test_select_and_write() {
        let ds = DataSet::from_csv_reader(FEATURES_CSV.as_bytes(), Algorithm::LinRegVL, &params(false))
            .unwrap();
        let sub = ds.select(&[2, 0]).unwrap();
        assert_eq!(sub.ids, vec!["3", "1"]);
        assert!(ds.select(&[9]).is_err());
        let mut out = Vec::new();
        sub.write_csv(&mut out).unwrap();
        let text = String::from_utf8(out).unwrap();
        assert!(text.starts_with("id,a,b\n3,5,6\n"));
    }

    #[test]
    fn test_predict_loader_tolerates_missing_label() {
        let path = std::env::temp_dir().join(format!("dcp-predict-{}.csv", uuid::Uuid::new_v4()));
        std::fs::write(&path, "id,c\n3,0.5\n").unwrap();
        let ds = DataSet::from_csv_path_for_predict(&path, Algorithm::LogRegVL, &params(true)).unwrap();
        assert!(!ds.has_label());
        assert_eq!(ds.features, vec!["c"]);
        assert!(DataSet::from_csv_path(&path, Algorithm::LogRegVL, &params(true)).is_err());
        let _ = std::fs::remove_file(&path);
    }
}
