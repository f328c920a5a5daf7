use thiserror::Error;

/// Errors raised while reading the input table. All of them are fatal.
#[derive(Debug, Error)]
pub enum LoadError {
    #[error("File not found: {0}")]
    FileNotFound(String),
    #[error("Required column '{0}' not found in the header")]
    MissingColumn(String),
    #[error("Row length mismatch at line {line}: expected {expected} fields, found {found}")]
    RowLength {
        line: usize,
        expected: usize,
        found: usize,
    },
    #[error("Failed to read '{path}': {source}")]
    Csv {
        path: String,
        #[source]
        source: csv::Error,
    },
}

/// Errors raised by the consistency checks that run before modelling.
#[derive(Debug, Error)]
pub enum DataError {
    #[error("Column '{0}' is not present in the table")]
    UnknownColumn(String),
    #[error(
        "'{date_col}' and '{period_col}' must be missing together, but {} row(s) disagree: {rows:?}",
        rows.len()
    )]
    InconsistentMissingness {
        date_col: String,
        period_col: String,
        rows: Vec<String>,
    },
}

/// A model specification that could not be fitted.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum FitError {
    #[error("unknown covariate '{0}'")]
    UnknownCovariate(String),
    #[error("no complete rows left after listwise deletion")]
    NoRows,
    #[error("no observed events among the {0} complete rows")]
    NoEvents(usize),
    #[error("information matrix is singular (rank deficient design)")]
    Singular,
    #[error("did not converge within {0} iterations")]
    NonConvergence(usize),
}

/// Errors raised while predicting from a fitted model.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum PredictError {
    #[error("profile '{profile}' has no value for covariate '{covariate}'")]
    MissingValue { profile: String, covariate: String },
    #[error("profile '{profile}': level '{level}' is not a level of '{covariate}'")]
    UnknownLevel {
        profile: String,
        covariate: String,
        level: String,
    },
    #[error("profile '{profile}': covariate '{covariate}' expects a {expected}")]
    WrongKind {
        profile: String,
        covariate: String,
        expected: &'static str,
    },
    #[error("quantile probability {0} is outside (0, 1)")]
    Probability(f64),
}
