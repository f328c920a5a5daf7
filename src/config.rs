//! Analysis configuration.
//!
//! Every analyst decision of the trial report (which columns are recoded how,
//! which models are fitted, which thresholds narrow the covariate set) lives in
//! one [`AnalysisConfig`] so a run can be repeated for any covariate / family
//! combination without touching code. The defaults reproduce the trial analysis.

use std::fs::File;
use std::io::{BufReader, BufWriter};
use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::models::{Family, ModelSpec};
use crate::predict::{Profile, ProfileValue};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AnalysisConfig {
    pub columns: ColumnSchema,
    pub recoding: Recoding,
    pub features: FeatureConfig,
    pub checks: CheckConfig,
    pub forest: ForestConfig,
    pub comparison: ComparisonConfig,
    pub models: Vec<ModelSpec>,
    pub final_model: FinalModel,
    pub prediction: PredictionConfig,
    pub output: OutputConfig,
}

/// Names of the columns the pipeline itself needs to know about.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ColumnSchema {
    pub id: String,
    pub time: String,
    pub status: String,
    pub treatment: String,
    pub sex: String,
    pub age: String,
    /// Extra columns the input must contain, on top of the ones named above.
    pub required: Vec<String>,
}

/// A binary column encoded with two raw codes. `one` becomes 1, `zero` becomes 0.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BinaryColumn {
    pub column: String,
    #[serde(default = "default_one")]
    pub one: String,
    #[serde(default = "default_zero")]
    pub zero: String,
    /// Display labels for 0 and 1.
    #[serde(default = "default_binary_labels")]
    pub labels: [String; 2],
}

fn default_one() -> String {
    "1".to_string()
}
fn default_zero() -> String {
    "2".to_string()
}
fn default_binary_labels() -> [String; 2] {
    ["no".to_string(), "yes".to_string()]
}

impl BinaryColumn {
    pub fn new(column: &str, labels: [&str; 2]) -> Self {
        BinaryColumn {
            column: column.to_string(),
            one: default_one(),
            zero: default_zero(),
            labels: [labels[0].to_string(), labels[1].to_string()],
        }
    }
}

/// A categorical column. When `levels` is empty the levels are learned from
/// the data (sorted, numerically where every code is a number).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FactorDef {
    pub column: String,
    #[serde(default)]
    pub levels: Vec<String>,
    /// Optional display labels, same length as `levels`.
    #[serde(default)]
    pub labels: Option<Vec<String>>,
}

/// The EEG rows where the abnormal result is authoritative over the
/// "performed" flag.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EegCorrection {
    pub performed: String,
    pub abnormal: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Recoding {
    pub binary: Vec<BinaryColumn>,
    pub factors: Vec<FactorDef>,
    pub dates: Vec<String>,
    pub date_format: String,
    pub eeg_correction: Option<EegCorrection>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FeatureConfig {
    pub age_band_column: String,
    /// Lower breakpoints; the observed maximum age closes the last band.
    pub age_breaks: Vec<f64>,
    pub period_column: String,
    pub log_period_column: String,
    pub previous_column: String,
    pub previous_flag_column: String,
    pub previous_threshold: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CheckConfig {
    /// Observed events shorter than this are reported as inconsistent.
    pub min_event_time: f64,
    pub first_seizure_date: String,
    pub period: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ForestConfig {
    pub n_trees: usize,
    pub min_node_size: usize,
    /// Covariates tried per split; `None` uses ceil(sqrt(p)).
    pub mtry: Option<usize>,
    /// Random cut points tried per covariate; 0 tries every distinct value.
    pub n_split: usize,
    pub seed: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ComparisonConfig {
    pub alpha: f64,
    pub importance_threshold: f64,
    /// Models whose significant covariates enter the intersection.
    pub significance_from: Vec<String>,
    /// Forest whose important covariates enter the intersection.
    pub importance_from: Option<String>,
    /// Covariates kept in the reduced set regardless of the intersection.
    pub always_include: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FinalModel {
    pub name: String,
    /// `None` picks the parametric family with the lowest AIC.
    pub family: Option<Family>,
    /// `None` uses the reduced covariate set from the comparator.
    pub covariates: Option<Vec<String>>,
    pub interactions: Vec<(String, String)>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PredictionConfig {
    pub profiles: Vec<Profile>,
    pub probabilities: Vec<f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OutputConfig {
    pub plots: bool,
    pub export_normalized: bool,
    pub histogram_bins: usize,
}

impl Default for ColumnSchema {
    fn default() -> Self {
        ColumnSchema {
            id: "id".to_string(),
            time: "time".to_string(),
            status: "status".to_string(),
            treatment: "treat".to_string(),
            sex: "sex".to_string(),
            age: "age".to_string(),
            required: [
                "centre",
                "n_tonic_clonic",
                "n_partial",
                "n_other",
                "previous",
                "period",
                "eeg",
                "eeg_abnormal",
                "first_seizure_date",
                "randomisation_date",
            ]
            .iter()
            .map(|s| s.to_string())
            .collect(),
        }
    }
}

impl Default for Recoding {
    fn default() -> Self {
        Recoding {
            binary: vec![
                BinaryColumn::new("treat", ["deferred", "immediate"]),
                BinaryColumn::new("sex", ["female", "male"]),
                BinaryColumn::new("eeg", ["no", "yes"]),
                BinaryColumn::new("eeg_abnormal", ["no", "yes"]),
                BinaryColumn::new("eeg_epileptiform", ["no", "yes"]),
                BinaryColumn::new("eeg_focal", ["no", "yes"]),
                BinaryColumn::new("eeg_generalised", ["no", "yes"]),
            ],
            factors: vec![FactorDef {
                column: "centre".to_string(),
                levels: Vec::new(),
                labels: None,
            }],
            dates: vec![
                "first_seizure_date".to_string(),
                "randomisation_date".to_string(),
                "event_date".to_string(),
            ],
            date_format: "%d/%m/%y".to_string(),
            eeg_correction: Some(EegCorrection {
                performed: "eeg".to_string(),
                abnormal: "eeg_abnormal".to_string(),
            }),
        }
    }
}

impl Default for FeatureConfig {
    fn default() -> Self {
        FeatureConfig {
            age_band_column: "age_band".to_string(),
            age_breaks: vec![0.0, 5.0, 9.0, 19.0, 29.0, 39.0, 49.0, 59.0, 69.0],
            period_column: "period".to_string(),
            log_period_column: "log_period".to_string(),
            previous_column: "previous".to_string(),
            previous_flag_column: "previous_gt1".to_string(),
            previous_threshold: 1.0,
        }
    }
}

impl Default for CheckConfig {
    fn default() -> Self {
        CheckConfig {
            min_event_time: 1.0,
            first_seizure_date: "first_seizure_date".to_string(),
            period: "period".to_string(),
        }
    }
}

impl Default for ForestConfig {
    fn default() -> Self {
        ForestConfig {
            n_trees: 500,
            min_node_size: 15,
            mtry: None,
            n_split: 10,
            seed: 42,
        }
    }
}

impl Default for ComparisonConfig {
    fn default() -> Self {
        ComparisonConfig {
            alpha: 0.05,
            importance_threshold: 0.002,
            significance_from: vec!["cox_full".to_string()],
            importance_from: Some("forest".to_string()),
            always_include: vec!["treat".to_string()],
        }
    }
}

impl Default for FinalModel {
    fn default() -> Self {
        FinalModel {
            name: "final".to_string(),
            family: None,
            covariates: None,
            interactions: Vec::new(),
        }
    }
}

impl Default for PredictionConfig {
    fn default() -> Self {
        let profile = |name: &str, treat: f64| Profile {
            name: name.to_string(),
            values: [
                ("treat", ProfileValue::Number(treat)),
                ("sex", ProfileValue::Number(1.0)),
                ("age", ProfileValue::Number(30.0)),
                ("log_period", ProfileValue::Number((90.0_f64 + 1.0).ln())),
                ("previous_gt1", ProfileValue::Number(1.0)),
                ("n_tonic_clonic", ProfileValue::Number(2.0)),
                ("n_partial", ProfileValue::Number(0.0)),
                ("n_other", ProfileValue::Number(0.0)),
                ("eeg_abnormal", ProfileValue::Number(1.0)),
                ("eeg_epileptiform", ProfileValue::Number(0.0)),
                ("eeg_focal", ProfileValue::Number(0.0)),
                ("eeg_generalised", ProfileValue::Number(0.0)),
            ]
            .into_iter()
            .map(|(k, v)| (k.to_string(), v))
            .collect(),
        };
        PredictionConfig {
            profiles: vec![profile("immediate", 1.0), profile("deferred", 0.0)],
            probabilities: (1..20).map(|i| f64::from(i) * 0.05).collect(),
        }
    }
}

impl Default for OutputConfig {
    fn default() -> Self {
        OutputConfig {
            plots: true,
            export_normalized: true,
            histogram_bins: 20,
        }
    }
}

/// Covariates of the full models in the trial analysis. Centre is left out.
pub fn full_covariates() -> Vec<String> {
    [
        "treat",
        "sex",
        "age",
        "log_period",
        "previous_gt1",
        "n_tonic_clonic",
        "n_partial",
        "n_other",
        "eeg_abnormal",
        "eeg_epileptiform",
        "eeg_focal",
        "eeg_generalised",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

impl Default for AnalysisConfig {
    fn default() -> Self {
        let full = full_covariates();
        let models = vec![
            ModelSpec::new("cox_treat", Family::Cox, &["treat".to_string()]),
            ModelSpec::new("cox_full", Family::Cox, &full),
            ModelSpec::new("cox_interaction", Family::Cox, &[
                "treat".to_string(),
                "age".to_string(),
                "log_period".to_string(),
            ])
            .with_interaction("treat", "log_period"),
            ModelSpec::new("aalen_full", Family::Aalen, &full),
            ModelSpec::new("exponential_full", Family::Exponential, &full),
            ModelSpec::new("weibull_full", Family::Weibull, &full),
            ModelSpec::new("lognormal_full", Family::LogNormal, &full),
            ModelSpec::new("loglogistic_full", Family::LogLogistic, &full),
            ModelSpec::new("forest", Family::RandomForest, &full),
        ];
        AnalysisConfig {
            columns: ColumnSchema::default(),
            recoding: Recoding::default(),
            features: FeatureConfig::default(),
            checks: CheckConfig::default(),
            forest: ForestConfig::default(),
            comparison: ComparisonConfig::default(),
            models,
            final_model: FinalModel::default(),
            prediction: PredictionConfig::default(),
            output: OutputConfig::default(),
        }
    }
}

impl AnalysisConfig {
    /// Load a JSON configuration; missing sections fall back to the defaults.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let file = File::open(path)
            .with_context(|| format!("Failed to open config file '{}'", path.display()))?;
        let config = serde_json::from_reader(BufReader::new(file))
            .with_context(|| format!("Failed to parse config file '{}'", path.display()))?;
        Ok(config)
    }

    pub fn to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let path = path.as_ref();
        let file = File::create(path)
            .with_context(|| format!("Failed to create config file '{}'", path.display()))?;
        serde_json::to_writer_pretty(BufWriter::new(file), self)?;
        Ok(())
    }

    /// Columns that must be present in the header of the input file.
    pub fn required_columns(&self) -> Vec<String> {
        let c = &self.columns;
        let mut cols = vec![
            c.time.clone(),
            c.status.clone(),
            c.treatment.clone(),
            c.sex.clone(),
            c.age.clone(),
        ];
        for extra in &c.required {
            if !cols.contains(extra) {
                cols.push(extra.clone());
            }
        }
        cols
    }
}
