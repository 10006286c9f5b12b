//! Token registry records and holder key discovery

pub mod collector;
pub mod registry;

pub use collector::{dedupe_addresses, CollectorError, KeyCollector, KeyLookup, LookupFailure};
pub use registry::{GenesisData, TokenData, TokenEvent, TokenEventKind};
