pub mod data_persistance;
pub mod dedup_aggregator;
pub mod droid;
pub mod field_extractor;
pub mod harvest_scheduler;
pub mod pagination;
pub mod run_registry;
pub mod selectors;
pub mod waits;

pub use data_persistance::*;
pub use dedup_aggregator::*;
pub use droid::*;
pub use field_extractor::*;
pub use harvest_scheduler::*;
pub use pagination::*;
pub use run_registry::*;
pub use selectors::*;
