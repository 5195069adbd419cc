pub mod tuner;

pub use tuner::{
    AdjustmentSource, LOOSEN_FACTOR_DEFAULT, LOOSEN_FP_RATE_DEFAULT, TIGHTEN_FACTOR_DEFAULT,
    TIGHTEN_FP_RATE_DEFAULT, TIGHTEN_MIN_DETECTIONS_DEFAULT, TunerBook, TunerConfig, TunerState,
    TuningAdjustment, round_threshold, tune_rule,
};
