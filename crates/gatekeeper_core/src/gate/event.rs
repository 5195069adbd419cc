use serde::{Deserialize, Serialize};

/// Inbound lifecycle event from the host, evaluated once per action.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GateEvent {
    #[serde(rename = "tool_or_action_name", alias = "tool_name")]
    pub action: String,
    /// Path, command, or string being acted on.
    pub target: String,
    #[serde(default)]
    pub session_id: String,
    #[serde(default)]
    pub turn_index: u64,
    /// Any non-empty reason requests an override of whatever this event trips.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub override_reason: Option<String>,
}

impl GateEvent {
    pub fn new(action: impl Into<String>, target: impl Into<String>) -> Self {
        Self {
            action: action.into(),
            target: target.into(),
            ..Self::default()
        }
    }

    pub fn with_session(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = session_id.into();
        self
    }

    pub fn with_turn(mut self, turn_index: u64) -> Self {
        self.turn_index = turn_index;
        self
    }

    pub fn with_override(mut self, reason: impl Into<String>) -> Self {
        self.override_reason = Some(reason.into());
        self
    }

    /// The override reason, if one was supplied and is non-blank.
    pub fn override_requested(&self) -> Option<&str> {
        self.override_reason
            .as_deref()
            .map(str::trim)
            .filter(|reason| !reason.is_empty())
    }
}
