//! Collection pipeline: query execution, normalization, format conversion,
//! tabular export and the orchestrator tying them together.

pub mod executor;
pub mod flatten;
pub mod formats;
pub mod identify;
pub mod kml;
pub mod ledger;
pub mod orchestrator;

pub use executor::{QueryExecutor, QueryOutcome, ReconnectPolicy, RetryPolicy};
pub use flatten::{flatten, flatten_artifacts, FlatRole, FlatTable};
pub use formats::{ChainOutput, FormatChain};
pub use identify::{assign_record_id, tag_sector};
pub use ledger::{Ledger, LedgerEntry, LedgerStatus};
pub use orchestrator::{CollectOptions, CollectReport, Collector, OutputLayout};
