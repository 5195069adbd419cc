pub mod circuit;
pub mod window;

pub use circuit::{
    BreakerAssessment, BreakerBoard, BreakerDecision, CircuitPhase, CircuitState, OutcomeApplied,
};
pub use window::{Tick, WindowState, WindowTracker};
