pub mod compare;
pub mod config;
pub mod data;
pub mod describe;
pub mod error;
pub mod models;
pub mod pipeline;
pub mod plot;
pub mod predict;
pub mod report;
