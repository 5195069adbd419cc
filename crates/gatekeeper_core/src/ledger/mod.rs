//! Override ledger and retention.

pub mod overrides;

pub use overrides::{
    CatastrophicGrant, OverrideEvent, OverrideLedger, PruneSummary, RetentionPolicy,
};
