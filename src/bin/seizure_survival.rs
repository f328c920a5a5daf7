use std::path::PathBuf;

use anyhow::{bail, Result};
use clap::Parser;
use env_logger::Env;
use log::info;

use seizure_survival::config::AnalysisConfig;
use seizure_survival::pipeline;
use seizure_survival::report;

#[derive(Parser, Debug)]
#[clap(
    author = "Seizure Survival CLI",
    version = "0.3",
    about = "Time to first seizure: describe -> fit -> compare -> predict"
)]
enum Command {
    /// Run the whole analysis and write the report
    Run {
        /// Path to the subject table
        #[clap(short, long)]
        file: PathBuf,

        /// Analysis configuration (JSON); the trial analysis when absent
        #[clap(short, long)]
        config: Option<PathBuf>,

        /// Directory for report.md, normalized.tsv and the figures
        #[clap(short, long)]
        out_dir: PathBuf,

        /// Field delimiter
        #[clap(short = 'd', long, default_value = "\t")]
        delimiter: String,
    },

    /// Load, normalise and describe the table without fitting models
    Describe {
        /// Path to the subject table
        #[clap(short, long)]
        file: PathBuf,

        /// Analysis configuration (JSON)
        #[clap(short, long)]
        config: Option<PathBuf>,

        /// Field delimiter
        #[clap(short = 'd', long, default_value = "\t")]
        delimiter: String,
    },

    /// Write the default configuration for editing
    InitConfig {
        /// Output JSON file
        #[clap(short, long)]
        output: PathBuf,
    },
}

fn delimiter_byte(delimiter: &str) -> Result<u8> {
    match delimiter {
        "\\t" | "tab" => Ok(b'\t'),
        d if d.len() == 1 => Ok(d.as_bytes()[0]),
        d => bail!("The delimiter must be a single character, got '{d}'"),
    }
}

fn load_config(path: Option<PathBuf>) -> Result<AnalysisConfig> {
    match path {
        Some(p) => AnalysisConfig::from_file(p),
        None => Ok(AnalysisConfig::default()),
    }
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(Env::default().default_filter_or("info")).init();

    match Command::parse() {
        Command::Run {
            file,
            config,
            out_dir,
            delimiter,
        } => {
            let config = load_config(config)?;
            let analysis = pipeline::run(&file, delimiter_byte(&delimiter)?, &config, &out_dir)?;
            let fitted = analysis.runs.iter().filter(|r| r.result.is_ok()).count();
            info!(
                "{fitted} of {} model(s) fitted; report in {}",
                analysis.runs.len(),
                out_dir.join("report.md").display()
            );
        }
        Command::Describe {
            file,
            config,
            delimiter,
        } => {
            let config = load_config(config)?;
            let (data, normalized, validation) =
                pipeline::prepare(&file, delimiter_byte(&delimiter)?, &config)?;
            println!("{data}");
            let description = pipeline::describe(
                &file.display().to_string(),
                &data,
                normalized,
                validation,
                &config,
            )?;
            println!("{}", report::render_description(&description));
        }
        Command::InitConfig { output } => {
            AnalysisConfig::default().to_file(&output)?;
            println!("Default configuration written to {}", output.display());
        }
    }
    Ok(())
}
