pub mod catalog;
pub mod classifier;
pub mod definition;

pub use catalog::{RuleCatalog, RuleOverride};
pub use classifier::{Classification, ClassificationFault, classify};
pub use definition::{
    CooldownSchedule, RuleCategory, RuleConfigError, RuleDefinition, RulePredicate, Severity,
    TunableRange, Violation, WindowSpec,
};
