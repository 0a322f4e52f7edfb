//! The ingest-to-store pipeline and its read side.
//!
//! `extract` parses the delimited line stream, `transform` turns parsed
//! records into typed arrow batches, `load` appends them to
//! date-partitioned IPC stream files, and `read` enumerates those files
//! back into filtered, latency-annotated tables.

pub mod extract;
pub mod load;
pub mod read;
pub mod schema;
pub mod transform;

pub use extract::{read_records, IngestRecord};
pub use load::BatchWriter;
pub use read::{read_latency_data, LatencyFilter};
pub use schema::{storage_schema, INGEST_FIELDS};
pub use transform::{partition_date, storage_batch};
