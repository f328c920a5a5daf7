use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt;
use std::path::Path;

use anyhow::Result;
use chrono::NaiveDate;
use csv::{ReaderBuilder, Trim, WriterBuilder};
use log::{info, warn};
use ndarray::{Array2, ArrayView1, Axis};

use crate::data::Factor;
use crate::error::{DataError, LoadError};

/// The in-memory subject table.
///
/// Numeric columns (including recoded binary flags and factor indices) live in
/// `numeric_data`, one row per subject, `NaN` marking a missing value. Columns
/// that are only meaningful as text before normalisation (factor codes, date
/// strings) stay in `text` until the normaliser turns them into factors and
/// dates.
#[derive(Debug, Clone)]
pub struct SurvivalData {
    pub ids: Vec<String>,
    pub headers: Vec<String>,
    pub numeric_data: Array2<f64>,
    pub factors: HashMap<String, Factor>,
    pub binary_labels: HashMap<String, [String; 2]>,
    pub text: BTreeMap<String, Vec<String>>,
    pub dates: BTreeMap<String, Vec<Option<NaiveDate>>>,
}

impl Default for SurvivalData {
    fn default() -> Self {
        SurvivalData {
            ids: Vec::new(),
            headers: Vec::new(),
            numeric_data: Array2::zeros((0, 0)),
            factors: HashMap::new(),
            binary_labels: HashMap::new(),
            text: BTreeMap::new(),
            dates: BTreeMap::new(),
        }
    }
}

impl fmt::Display for SurvivalData {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "SurvivalData Summary:")?;
        writeln!(
            f,
            "Rows: {}, numeric columns: {}, date columns: {}",
            self.n_rows(),
            self.numeric_data.ncols(),
            self.dates.len()
        )?;
        for (idx, header) in self.headers.iter().enumerate() {
            let col = self.numeric_data.column(idx);
            let n_na = col.iter().filter(|v| v.is_nan()).count();
            writeln!(f, "  {}: {} ({} NA)", idx, header, n_na)?;
        }
        let mut factors: Vec<&Factor> = self.factors.values().collect();
        factors.sort_by(|a, b| a.column_name.cmp(&b.column_name));
        for factor in factors {
            write!(f, "{}", factor)?;
        }
        Ok(())
    }
}

fn is_missing(value: &str) -> bool {
    value.is_empty() || value.eq_ignore_ascii_case("NA")
}

impl SurvivalData {
    /// Read a delimited file with a header row.
    ///
    /// * `id_col` - column holding the subject identifier (row number if absent)
    /// * `text_cols` - columns kept as raw strings (factor codes, dates)
    /// * `required` - columns that must be present in the header
    ///
    /// A missing file, a missing required column or a row whose field count
    /// differs from the header is fatal. A non-numeric value in a numeric
    /// column becomes `NaN` and is counted per column.
    pub fn from_file<P: AsRef<Path>>(
        file_path: P,
        delimiter: u8,
        id_col: &str,
        text_cols: &HashSet<String>,
        required: &[String],
    ) -> Result<Self> {
        let path = file_path.as_ref();
        let path_str = path.display().to_string();
        if !path.exists() {
            return Err(LoadError::FileNotFound(path_str).into());
        }

        let csv_err = |source| LoadError::Csv {
            path: path_str.clone(),
            source,
        };
        let mut rdr = ReaderBuilder::new()
            .delimiter(delimiter)
            .trim(Trim::All)
            .flexible(true)
            .from_path(path)
            .map_err(csv_err)?;

        let file_headers: Vec<String> = rdr
            .headers()
            .map_err(csv_err)?
            .iter()
            .map(|s| s.trim_matches('"').to_string())
            .collect();

        for col in required {
            if !file_headers.iter().any(|h| h == col) {
                return Err(LoadError::MissingColumn(col.clone()).into());
            }
        }

        let id_idx = file_headers.iter().position(|h| h == id_col);
        let numeric_idx: Vec<usize> = (0..file_headers.len())
            .filter(|&j| Some(j) != id_idx && !text_cols.contains(&file_headers[j]))
            .collect();

        let mut ret = SurvivalData {
            headers: numeric_idx.iter().map(|&j| file_headers[j].clone()).collect(),
            ..SurvivalData::default()
        };
        for (j, h) in file_headers.iter().enumerate() {
            if text_cols.contains(h) && Some(j) != id_idx {
                ret.text.insert(h.clone(), Vec::new());
            }
        }

        let mut raw_rows: Vec<Vec<f64>> = Vec::new();
        let mut parse_failures: BTreeMap<String, usize> = BTreeMap::new();

        for (i, result) in rdr.records().enumerate() {
            let record = result.map_err(csv_err)?;
            if record.len() != file_headers.len() {
                return Err(LoadError::RowLength {
                    line: i + 2,
                    expected: file_headers.len(),
                    found: record.len(),
                }
                .into());
            }
            let mut row = Vec::with_capacity(numeric_idx.len());
            for &j in &numeric_idx {
                let field = record[j].trim_matches('"');
                if is_missing(field) {
                    row.push(f64::NAN);
                    continue;
                }
                match field.parse::<f64>() {
                    Ok(v) => row.push(v),
                    Err(_) => {
                        *parse_failures.entry(file_headers[j].clone()).or_insert(0) += 1;
                        row.push(f64::NAN);
                    }
                }
            }
            raw_rows.push(row);

            for (j, h) in file_headers.iter().enumerate() {
                if let Some(col) = ret.text.get_mut(h) {
                    col.push(record[j].trim_matches('"').to_string());
                }
            }
            ret.ids.push(match id_idx {
                Some(j) => record[j].to_string(),
                None => (i + 1).to_string(),
            });
        }

        for (col, n) in &parse_failures {
            warn!("{n} value(s) in column '{col}' are not numeric - set to NA");
        }

        let n_rows = raw_rows.len();
        let n_cols = numeric_idx.len();
        let mut numeric_data = Array2::<f64>::zeros((n_rows, n_cols));
        for (i, row) in raw_rows.iter().enumerate() {
            for (j, &val) in row.iter().enumerate() {
                numeric_data[[i, j]] = val;
            }
        }
        ret.numeric_data = numeric_data;

        info!(
            "Loaded {} subjects with {} numeric and {} text columns from {}",
            n_rows,
            n_cols,
            ret.text.len(),
            path.display()
        );
        Ok(ret)
    }

    pub fn n_rows(&self) -> usize {
        self.ids.len()
    }

    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.headers.iter().position(|h| h == name)
    }

    pub fn has_column(&self, name: &str) -> bool {
        self.column_index(name).is_some()
    }

    pub fn column(&self, name: &str) -> Result<ArrayView1<'_, f64>, DataError> {
        self.column_index(name)
            .map(|j| self.numeric_data.column(j))
            .ok_or_else(|| DataError::UnknownColumn(name.to_string()))
    }

    pub fn as_vec_f64(&self, name: &str) -> Result<Vec<f64>, DataError> {
        Ok(self.column(name)?.to_vec())
    }

    pub fn date_column(&self, name: &str) -> Result<&[Option<NaiveDate>], DataError> {
        self.dates
            .get(name)
            .map(Vec::as_slice)
            .ok_or_else(|| DataError::UnknownColumn(name.to_string()))
    }

    /// Overwrite an existing numeric column or append a new one.
    pub fn set_column(&mut self, name: &str, values: &[f64]) {
        assert_eq!(
            values.len(),
            self.n_rows(),
            "column '{name}' has the wrong length"
        );
        match self.column_index(name) {
            Some(j) => self
                .numeric_data
                .column_mut(j)
                .assign(&ArrayView1::from(values)),
            None => {
                if self.numeric_data.ncols() == 0 {
                    self.numeric_data = Array2::zeros((values.len(), 0));
                }
                self.numeric_data
                    .push_column(ArrayView1::from(values))
                    .expect("numeric_data rows always match ids");
                self.headers.push(name.to_string());
            }
        }
    }

    /// Store a factor column: numeric level indices plus the factor itself.
    pub fn set_factor_column(&mut self, factor: Factor, values: &[f64]) {
        let name = factor.column_name.clone();
        self.set_column(&name, values);
        self.factors.insert(name, factor);
    }

    pub fn is_factor(&self, name: &str) -> bool {
        self.factors.contains_key(name)
    }

    /// Human readable value of a cell: factor label, binary label or number.
    pub fn display_value(&self, name: &str, value: f64) -> String {
        if value.is_nan() {
            return "NA".to_string();
        }
        if let Some(factor) = self.factors.get(name) {
            return factor.get_label(value);
        }
        if let Some(labels) = self.binary_labels.get(name) {
            if value == 0.0 {
                return labels[0].clone();
            }
            if value == 1.0 {
                return labels[1].clone();
            }
        }
        format!("{value}")
    }

    /// Select a subset of rows (keeps factors, dates and labels).
    pub fn select_rows(&self, rows: &[usize]) -> SurvivalData {
        SurvivalData {
            ids: rows.iter().map(|&i| self.ids[i].clone()).collect(),
            headers: self.headers.clone(),
            numeric_data: self.numeric_data.select(Axis(0), rows),
            factors: self.factors.clone(),
            binary_labels: self.binary_labels.clone(),
            text: self
                .text
                .iter()
                .map(|(k, v)| (k.clone(), rows.iter().map(|&i| v[i].clone()).collect()))
                .collect(),
            dates: self
                .dates
                .iter()
                .map(|(k, v)| (k.clone(), rows.iter().map(|&i| v[i]).collect()))
                .collect(),
        }
    }

    /// Write the table as the pipeline sees it: labels for factors and binary
    /// flags, ISO dates, `NA` for missing values.
    pub fn to_file<P: AsRef<Path>>(&self, file_path: P, delimiter: u8) -> Result<()> {
        let mut wtr = WriterBuilder::new()
            .delimiter(delimiter)
            .from_path(file_path.as_ref())?;

        let mut header = vec!["id".to_string()];
        header.extend(self.headers.iter().cloned());
        header.extend(self.dates.keys().cloned());
        header.extend(self.text.keys().cloned());
        wtr.write_record(&header)?;

        for i in 0..self.n_rows() {
            let mut record = Vec::with_capacity(header.len());
            record.push(self.ids[i].clone());
            for (j, name) in self.headers.iter().enumerate() {
                record.push(self.display_value(name, self.numeric_data[[i, j]]));
            }
            for col in self.dates.values() {
                record.push(match col[i] {
                    Some(d) => d.format("%Y-%m-%d").to_string(),
                    None => "NA".to_string(),
                });
            }
            for col in self.text.values() {
                record.push(col[i].clone());
            }
            wtr.write_record(&record)?;
        }
        wtr.flush()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs::{self, File};
    use std::io::Write;
    use tempfile::tempdir;

    fn write(path: &Path, content: &str) -> std::io::Result<()> {
        let mut f = File::create(path)?;
        f.write_all(content.as_bytes())
    }

    #[test]
    fn test_from_file_splits_numeric_and_text() -> Result<()> {
        let dir = tempdir()?;
        let path = dir.path().join("subjects.tsv");
        write(
            &path,
            "id\tcentre\tage\tdate\n\
             p1\tA\t34\t01/02/95\n\
             p2\tB\tNA\t\n\
             p3\tA\tforty\t03/04/96\n",
        )?;
        let text: HashSet<String> = ["centre", "date"].iter().map(|s| s.to_string()).collect();
        let data = SurvivalData::from_file(&path, b'\t', "id", &text, &["age".to_string()])?;

        assert_eq!(data.ids, vec!["p1", "p2", "p3"]);
        assert_eq!(data.headers, vec!["age"]);
        assert_eq!(data.numeric_data[[0, 0]], 34.0);
        assert!(data.numeric_data[[1, 0]].is_nan());
        assert!(data.numeric_data[[2, 0]].is_nan(), "non numeric text becomes NA");
        assert_eq!(data.text["centre"], vec!["A", "B", "A"]);
        assert_eq!(data.text["date"][1], "");
        Ok(())
    }

    #[test]
    fn test_missing_file_is_an_error() {
        let res = SurvivalData::from_file("/no/such/file.tsv", b'\t', "id", &HashSet::new(), &[]);
        let err = res.expect_err("missing file must fail");
        assert!(matches!(
            err.downcast_ref::<LoadError>(),
            Some(LoadError::FileNotFound(_))
        ));
    }

    #[test]
    fn test_row_length_mismatch_is_an_error() -> Result<()> {
        let dir = tempdir()?;
        let path = dir.path().join("bad.tsv");
        write(&path, "id\ttime\tstatus\np1\t10\t1\np2\t20\n")?;
        let err = SurvivalData::from_file(&path, b'\t', "id", &HashSet::new(), &[])
            .expect_err("short row must fail");
        match err.downcast_ref::<LoadError>() {
            Some(LoadError::RowLength { line, expected, found }) => {
                assert_eq!((*line, *expected, *found), (3, 3, 2));
            }
            other => panic!("unexpected error {other:?}"),
        }
        Ok(())
    }

    #[test]
    fn test_missing_required_column() -> Result<()> {
        let dir = tempdir()?;
        let path = dir.path().join("cols.tsv");
        write(&path, "id\ttime\np1\t10\n")?;
        let err = SurvivalData::from_file(&path, b'\t', "id", &HashSet::new(), &["status".to_string()])
            .expect_err("missing column must fail");
        assert!(err.to_string().contains("status"));
        Ok(())
    }

    #[test]
    fn test_set_column_appends_and_overwrites() {
        let mut data = SurvivalData {
            ids: vec!["a".into(), "b".into()],
            headers: vec!["x".into()],
            numeric_data: Array2::from_shape_vec((2, 1), vec![1.0, 2.0]).unwrap(),
            ..SurvivalData::default()
        };
        data.set_column("y", &[3.0, 4.0]);
        assert_eq!(data.headers, vec!["x", "y"]);
        assert_eq!(data.as_vec_f64("y").unwrap(), vec![3.0, 4.0]);
        data.set_column("x", &[9.0, 8.0]);
        assert_eq!(data.as_vec_f64("x").unwrap(), vec![9.0, 8.0]);
        assert!(matches!(data.as_vec_f64("z"), Err(DataError::UnknownColumn(_))));
    }

    #[test]
    fn test_to_file_writes_labels() -> Result<()> {
        let dir = tempdir()?;
        let mut data = SurvivalData {
            ids: vec!["a".into(), "b".into()],
            headers: vec!["treat".into()],
            numeric_data: Array2::from_shape_vec((2, 1), vec![1.0, 0.0])?,
            ..SurvivalData::default()
        };
        data.binary_labels
            .insert("treat".into(), ["deferred".into(), "immediate".into()]);
        let out = dir.path().join("out.tsv");
        data.to_file(&out, b'\t')?;
        let content = fs::read_to_string(&out)?;
        assert!(content.contains("a\timmediate"));
        assert!(content.contains("b\tdeferred"));
        Ok(())
    }
}
