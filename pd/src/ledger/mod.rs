//! Patch ledger: review-gated lifecycle of produced patches

mod manager;

pub use manager::PatchLedger;
