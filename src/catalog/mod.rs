pub mod harvester;
pub mod record;

pub use harvester::{CatalogHarvester, FailedRange, HarvestConfig, HarvestOutcome};
pub use record::{CatalogRecord, LookupRef, ParsedRecord};
