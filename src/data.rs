pub mod factor;
pub mod features;
pub mod normalize;
pub mod survival_data;
pub mod validate;

pub use factor::Factor;
pub use survival_data::SurvivalData;

use std::collections::HashSet;
use std::path::Path;

use anyhow::Result;

use crate::config::AnalysisConfig;

/// Load the subject table described by `config`.
///
/// Factor and date columns are kept as text for the normaliser; every other
/// column except the id is parsed as a number.
pub fn load_table<P: AsRef<Path>>(
    file_path: P,
    delimiter: u8,
    config: &AnalysisConfig,
) -> Result<SurvivalData> {
    let mut text_cols: HashSet<String> = config
        .recoding
        .factors
        .iter()
        .map(|f| f.column.clone())
        .collect();
    text_cols.extend(config.recoding.dates.iter().cloned());

    SurvivalData::from_file(
        file_path,
        delimiter,
        &config.columns.id,
        &text_cols,
        &config.required_columns(),
    )
}
