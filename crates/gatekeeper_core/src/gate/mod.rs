//! Gate Facade and its wire types.

pub mod decision;
pub mod event;
pub mod facade;

pub use decision::{GateDecision, ms_to_retry_secs};
pub use event::GateEvent;
pub use facade::{
    AdminError, GateOutcome, PolicyGate, RuleReport, TUNE_INTERVAL_DEFAULT,
    TUNING_HISTORY_MAX_DEFAULT, UNSPECIFIED_TARGET,
};
