#![deny(warnings, rust_2024_compatibility)]
#![deny(
    clippy::explicit_iter_loop,
    clippy::manual_let_else,
    clippy::semicolon_if_nothing_returned,
    clippy::inconsistent_struct_constructor
)]
#![allow(
    clippy::cast_precision_loss,     // Acceptable for rates/percentages
    clippy::missing_errors_doc,      // Internal API
    clippy::missing_panics_doc,      // Internal API
    clippy::module_name_repetitions, // e.g. FetchError in fetch module
    clippy::must_use_candidate
)]

pub mod app;
pub mod domain;
pub mod fetch;
pub mod index;
pub mod normalize;
pub mod query;

pub use domain::{CanonicalLogRecord, Provider, Severity};

pub const VERSION: &str = env!("CARGO_PKG_VERSION");
