use std::collections::HashMap;
use std::fmt;

use ordered_float::OrderedFloat;

use crate::config::FactorDef;

/// A named categorical column.
///
/// Raw codes (as found in the input file) map to a numeric level index; every
/// level also carries a display label. The numeric index is what ends up in
/// `SurvivalData::numeric_data`, missing values are `f64::NAN`.
#[derive(Debug, Clone)]
pub struct Factor {
    pub column_name: String,
    levels: Vec<String>,
    labels: Vec<String>,
    level_to_index: HashMap<String, f64>,
    index_to_level: HashMap<OrderedFloat<f64>, String>,
}

impl fmt::Display for Factor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Factor '{}':", self.column_name)?;
        writeln!(f, "  Levels: {:?}", self.levels)?;
        writeln!(f, "  Labels: {:?}", self.labels)
    }
}

fn is_missing(value: &str) -> bool {
    value.is_empty() || value.eq_ignore_ascii_case("NA")
}

impl Factor {
    /// Create an empty factor whose levels are learned with [`Factor::push`].
    pub fn new(column_name: &str) -> Self {
        Factor {
            column_name: column_name.to_string(),
            levels: Vec::new(),
            labels: Vec::new(),
            level_to_index: HashMap::new(),
            index_to_level: HashMap::new(),
        }
    }

    /// Create a factor with a fixed level set. Labels default to the codes.
    pub fn with_levels(column_name: &str, levels: &[String], labels: Option<&[String]>) -> Self {
        let mut factor = Factor::new(column_name);
        for lvl in levels {
            factor.push(lvl);
        }
        if let Some(labels) = labels {
            if labels.len() == factor.levels.len() {
                factor.labels = labels.to_vec();
            }
        }
        factor
    }

    /// Build a factor from its recoding definition. An empty level list is
    /// learned from `observed`, sorted numerically when every code is a number.
    pub fn from_def<'a, I>(def: &FactorDef, observed: I) -> Self
    where
        I: IntoIterator<Item = &'a str>,
    {
        if !def.levels.is_empty() {
            return Factor::with_levels(&def.column, &def.levels, def.labels.as_deref());
        }
        let mut seen: Vec<String> = Vec::new();
        for v in observed {
            let v = v.trim();
            if !is_missing(v) && !seen.iter().any(|s| s == v) {
                seen.push(v.to_string());
            }
        }
        if seen.iter().all(|s| s.parse::<f64>().is_ok()) {
            seen.sort_by(|a, b| {
                let a: f64 = a.parse().unwrap_or(f64::NAN);
                let b: f64 = b.parse().unwrap_or(f64::NAN);
                a.total_cmp(&b)
            });
        } else {
            seen.sort();
        }
        Factor::with_levels(&def.column, &seen, None)
    }

    /// Push a raw code. Unknown codes become a new level; missing codes give `NaN`.
    pub fn push(&mut self, value: &str) -> f64 {
        let trimmed = value.trim();
        if is_missing(trimmed) {
            return f64::NAN;
        }
        if let Some(&i) = self.level_to_index.get(trimmed) {
            return i;
        }
        let new_idx = self.levels.len() as f64;
        self.levels.push(trimmed.to_string());
        self.labels.push(trimmed.to_string());
        self.level_to_index.insert(trimmed.to_string(), new_idx);
        self.index_to_level
            .insert(OrderedFloat(new_idx), trimmed.to_string());
        new_idx
    }

    /// Numeric index of a raw code; `NaN` for missing or unknown codes.
    pub fn get_f64(&self, code: &str) -> f64 {
        *self.level_to_index.get(code.trim()).unwrap_or(&f64::NAN)
    }

    pub fn labels(&self) -> &[String] {
        &self.labels
    }

    pub fn n_levels(&self) -> usize {
        self.levels.len()
    }

    /// Display label for a numeric index, `"NA"` when missing.
    pub fn get_label(&self, value: f64) -> String {
        match self.index_to_level.get(&OrderedFloat(value)) {
            Some(code) => self
                .levels
                .iter()
                .position(|l| l == code)
                .map(|i| self.labels[i].clone())
                .unwrap_or_else(|| code.clone()),
            None => "NA".to_string(),
        }
    }
}
