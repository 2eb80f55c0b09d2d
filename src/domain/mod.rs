pub mod provider;
pub mod record;
pub mod severity;

pub use provider::Provider;
pub use record::{CanonicalLogRecord, RawRecord, ingestion_id};
pub use severity::Severity;
