//! Rule catalog: the compiled-in policy instances and per-rule config overrides.
//!
//! Each built-in rule is one policy instance plugged into the gate:
//! - `root-pollution`: writes that litter the project root (organization drift).
//! - `path-recursion`: writes into self-nested paths like `src/src/` (organization drift).
//! - `destructive-command`: shell commands that wipe disks, homes, or shared branches.
//! - `hook-explosion`: runaway creation/editing of hook scripts (hook compliance).
//! - `production-pollution`: test/debug/scratch files written into production sources.
//! - `perf-anti-pattern`: unbounded filesystem scans and sleep-polling loops.

use std::collections::{BTreeMap, HashSet};
use std::sync::LazyLock;

use regex::Regex;
use serde::Deserialize;

use super::definition::{
    CooldownSchedule, RuleCategory, RuleConfigError, RuleDefinition, TunableRange, WindowSpec,
};
use crate::gate::GateEvent;

const WRITE_ACTIONS: &[&str] = &["write", "edit", "multiedit", "notebookedit", "create"];
const SHELL_ACTIONS: &[&str] = &["bash", "shell", "exec"];

/// Root-level files that are expected to live at the project root.
const ROOT_ALLOWLIST: &str = r"^/?(\./)?(README(\.md|\.rst|\.txt)?|LICENSE(-[A-Z]+)?(\.md|\.txt)?|CHANGELOG\.md|CONTRIBUTING\.md|CLAUDE\.md|AGENTS\.md|Makefile|Dockerfile|\.gitignore|\.gitattributes|\.editorconfig|\.env\.example|Cargo\.(toml|lock)|package(-lock)?\.json|pyproject\.toml|setup\.(py|cfg)|requirements(-dev)?\.txt|go\.(mod|sum)|rust-toolchain(\.toml)?)$";

static HOOK_PATH_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(^|/)\.?(claude/)?hooks/|(^|/)[^/]*[-_]hook\.(py|sh|js|ts)$")
        .expect("valid hook path regex")
});

static PRODUCTION_DIR_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(^|/)(src|lib|app|pkg)/").expect("valid production dir regex"));

static SCRATCH_FILE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(^|/)(test_[^/]*|[^/]*_test|debug_[^/]*|scratch[^/]*|tmp_[^/]*|temp_[^/]*)\.(py|js|ts|rs|sh|go)$")
        .expect("valid scratch file regex")
});

static DESTRUCTIVE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?x)
        \brm\s+-[a-zA-Z]*(?:rf|fr)[a-zA-Z]*\s+(?:/|~|\$HOME)(?:\s|$)
        | \bgit\s+push\b.*\s(?:--force|-f)\b.*\b(?:main|master)\b
        | \bmkfs(?:\.\w+)?\b
        | \bdd\b.*\bof=/dev/
        ",
    )
    .expect("valid destructive command regex")
});

static PERF_ANTI_PATTERN_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?x)
        \bfind\s+/(?:\s|$)
        | \bgrep\s+-[a-zA-Z]*r[a-zA-Z]*\s+.*\s/(?:\s|$)
        | \bwhile\s+(?:true|:)\b.*\bsleep\b
        | \bsleep\s+\d+\s*;\s*done\b
        ",
    )
    .expect("valid perf anti-pattern regex")
});

fn is_write_action(event: &GateEvent) -> bool {
    WRITE_ACTIONS
        .iter()
        .any(|action| event.action.eq_ignore_ascii_case(action))
}

fn is_shell_action(event: &GateEvent) -> bool {
    SHELL_ACTIONS
        .iter()
        .any(|action| event.action.eq_ignore_ascii_case(action))
}

fn path_segments(target: &str) -> Vec<&str> {
    target
        .split('/')
        .filter(|segment| !segment.is_empty() && *segment != ".")
        .collect()
}

fn root_pollution(event: &GateEvent) -> bool {
    is_write_action(event) && path_segments(&event.target).len() == 1
}

fn path_recursion(event: &GateEvent) -> bool {
    if !is_write_action(event) {
        return false;
    }
    let segments = path_segments(&event.target);
    let repeated = segments.windows(2).any(|pair| pair[0] == pair[1]);
    let cycled = segments
        .windows(4)
        .any(|quad| quad[0] == quad[2] && quad[1] == quad[3]);
    repeated || cycled
}

fn destructive_command(event: &GateEvent) -> bool {
    is_shell_action(event) && DESTRUCTIVE_RE.is_match(&event.target)
}

fn hook_explosion(event: &GateEvent) -> bool {
    is_write_action(event) && HOOK_PATH_RE.is_match(&event.target)
}

fn production_pollution(event: &GateEvent) -> bool {
    is_write_action(event)
        && PRODUCTION_DIR_RE.is_match(&event.target)
        && SCRATCH_FILE_RE.is_match(&event.target)
}

fn perf_anti_pattern(event: &GateEvent) -> bool {
    is_shell_action(event) && PERF_ANTI_PATTERN_RE.is_match(&event.target)
}

/// Validated, ordered set of rules.
#[derive(Debug, Clone)]
pub struct RuleCatalog {
    rules: Vec<RuleDefinition>,
}

impl RuleCatalog {
    pub fn new(rules: Vec<RuleDefinition>) -> Result<Self, RuleConfigError> {
        let mut seen = HashSet::new();
        for rule in &rules {
            rule.validate()?;
            if !seen.insert(rule.id.clone()) {
                return Err(RuleConfigError::DuplicateId {
                    id: rule.id.clone(),
                });
            }
        }
        Ok(Self { rules })
    }

    /// The compiled-in policy instances.
    pub fn builtin() -> Result<Self, RuleConfigError> {
        Self::new(vec![
            RuleDefinition::catastrophic(
                "root-pollution",
                "file written at the project root",
                root_pollution,
            )
            .with_exclusions(&[ROOT_ALLOWLIST])?,
            RuleDefinition::catastrophic(
                "path-recursion",
                "write into a self-nested path",
                path_recursion,
            ),
            RuleDefinition::catastrophic(
                "destructive-command",
                "destructive shell command",
                destructive_command,
            ),
            RuleDefinition::threshold(
                "hook-explosion",
                "hook scripts created or edited",
                hook_explosion,
                WindowSpec::Events(100),
                30.0,
                TunableRange::new(25.0, 40.0),
            ),
            RuleDefinition::threshold(
                "production-pollution",
                "test or debug file written into production sources",
                production_pollution,
                WindowSpec::Seconds(600),
                5.0,
                TunableRange::new(3.0, 10.0),
            )
            .with_exclusions(&[r"(^|/)(tests?|__tests__|spec)/"])?,
            RuleDefinition::threshold(
                "perf-anti-pattern",
                "unbounded scan or sleep-polling command",
                perf_anti_pattern,
                WindowSpec::Seconds(300),
                3.0,
                TunableRange::new(2.0, 8.0),
            ),
        ])
    }

    pub fn get(&self, id: &str) -> Option<&RuleDefinition> {
        self.rules.iter().find(|rule| rule.id == id)
    }

    pub fn iter(&self) -> impl Iterator<Item = &RuleDefinition> {
        self.rules.iter()
    }

    pub fn ids(&self) -> Vec<&str> {
        self.rules.iter().map(|rule| rule.id.as_str()).collect()
    }

    /// Rules of one category, in catalog order.
    pub fn by_category(&self, category: RuleCategory) -> impl Iterator<Item = &RuleDefinition> {
        self.rules
            .iter()
            .filter(move |rule| rule.category == category)
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    /// Apply per-rule overrides from configuration. Overrides are validated like
    /// built-in definitions; an override naming an unknown rule is an error.
    pub fn with_overrides(
        mut self,
        overrides: &BTreeMap<String, RuleOverride>,
    ) -> Result<Self, RuleConfigError> {
        for (id, patch) in overrides {
            let rule = self
                .rules
                .iter_mut()
                .find(|rule| &rule.id == id)
                .ok_or_else(|| RuleConfigError::UnknownRule { id: id.clone() })?;
            patch.apply(rule)?;
        }
        Self::new(self.rules)
    }
}

/// Per-rule tuning knobs an operator may replace in configuration.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RuleOverride {
    #[serde(default)]
    pub base_threshold: Option<f64>,
    #[serde(default)]
    pub tunable_range: Option<TunableRange>,
    #[serde(default)]
    pub window: Option<WindowSpec>,
    #[serde(default)]
    pub cooldown_schedule_s: Option<Vec<u64>>,
    #[serde(default)]
    pub extra_exclusions: Vec<String>,
}

impl RuleOverride {
    fn apply(&self, rule: &mut RuleDefinition) -> Result<(), RuleConfigError> {
        if rule.is_catastrophic() {
            let field = if self.base_threshold.is_some() {
                Some("base_threshold")
            } else if self.tunable_range.is_some() {
                Some("tunable_range")
            } else if self.window.is_some() {
                Some("window")
            } else if self.cooldown_schedule_s.is_some() {
                Some("cooldown_schedule_s")
            } else {
                None
            };
            if let Some(field) = field {
                return Err(RuleConfigError::CatastrophicNotTunable {
                    id: rule.id.clone(),
                    field,
                });
            }
        }
        if let Some(range) = self.tunable_range {
            rule.tunable_range = range;
        }
        if let Some(base) = self.base_threshold {
            rule.base_threshold = base;
        }
        if let Some(window) = self.window {
            rule.window = window;
        }
        if let Some(secs) = &self.cooldown_schedule_s {
            rule.cooldown_schedule = CooldownSchedule::from_secs(secs);
        }
        for pattern in &self.extra_exclusions {
            rule.add_exclusion(pattern)?;
        }
        Ok(())
    }
}
