// Tierlake Kernel
//
// Versioned table storage and merge engine for a tiered (bronze, silver,
// gold) data lake.

pub mod adapters;
pub mod clock;
pub mod config;
pub mod constraints;
pub mod datafile;
pub mod log;
pub mod maintenance;
pub mod merge;
pub mod pipeline;
pub mod record;
pub mod replay;
pub mod schema;
pub mod table;

pub use merge::{CommitOutcome, WriteMode};
pub use record::{DataType, Field, RecordBatch, Schema, Value};
pub use table::{InMemoryTable, Table, TableError, TableOptions, TimeTravel};
