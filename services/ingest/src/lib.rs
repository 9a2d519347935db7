//! Education statistics ingest library.
//!
//! Turns the state's published spreadsheets (assessment results, cost per
//! pupil, ...) into deferred INSERT statements against the reporting schema.
//! The flow is: read table -> locate header -> normalize cells -> resolve
//! entity names -> merge legacy spellings -> build statements -> cache ->
//! execute.

pub mod cache;
pub mod config;
pub mod execute;
pub mod locate;
pub mod merge;
pub mod normalize;
pub mod pipeline;
pub mod report;
pub mod resolve;
pub mod statement;
pub mod store;
pub mod table;
