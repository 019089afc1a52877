use chrono::Utc;
use serde::{Deserialize, Deserializer, Serialize};

use crate::ids::TurnId;

/// Who authored a turn.
///
/// Deserialization never fails: legacy records with a missing or malformed
/// role are read back as [`Role::User`] so old sessions stay loadable.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    User,
    Assistant,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::User => "user",
            Self::Assistant => "assistant",
        }
    }

    /// Parse a stored role, falling back to `User` for anything unrecognised.
    pub fn coerce(raw: &str) -> Self {
        raw.parse().unwrap_or(Self::User)
    }
}

impl<'de> Deserialize<'de> for Role {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = serde_json::Value::deserialize(deserializer)?;
        Ok(raw.as_str().map_or(Self::User, Self::coerce))
    }
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Role {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "user" => Ok(Self::User),
            "assistant" => Ok(Self::Assistant),
            other => Err(format!("unknown role: {other}")),
        }
    }
}

/// Opaque world-state value captured alongside an assistant turn.
///
/// The engine never looks inside; equality is structural.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Snapshot(serde_json::Value);

impl Snapshot {
    pub fn new(value: serde_json::Value) -> Self {
        Self(value)
    }

    pub fn value(&self) -> &serde_json::Value {
        &self.0
    }

}

/// Short and long summaries attached by an external summarizer.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TurnSummary {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub short: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub long: Option<String>,
}

impl TurnSummary {
    pub fn short(text: impl Into<String>) -> Self {
        Self {
            short: Some(text.into()),
            long: None,
        }
    }

    pub fn short_text(&self) -> Option<&str> {
        non_empty(self.short.as_deref())
    }

    pub fn long_text(&self) -> Option<&str> {
        non_empty(self.long.as_deref())
    }

    pub fn is_empty(&self) -> bool {
        self.short_text().is_none() && self.long_text().is_none()
    }

    /// Prefix every present summary with `header`.
    pub fn with_header(self, header: &str) -> Self {
        Self {
            short: self.short.map(|s| format!("{header}{s}")),
            long: self.long.map(|s| format!("{header}{s}")),
        }
    }
}

fn non_empty(s: Option<&str>) -> Option<&str> {
    s.filter(|s| !s.trim().is_empty())
}

/// One user or assistant message in a session log.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Turn {
    pub id: TurnId,
    #[serde(default = "default_role")]
    pub role: Role,
    pub timestamp: String,
    pub text: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rendered_text: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub summary: Option<TurnSummary>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub world_state_snapshot: Option<Snapshot>,
}

fn default_role() -> Role {
    Role::User
}

impl Turn {
    pub fn is_assistant(&self) -> bool {
        self.role == Role::Assistant
    }

    pub fn has_summary(&self) -> bool {
        self.summary.as_ref().is_some_and(|s| !s.is_empty())
    }
}

/// A turn as submitted by a caller; the store assigns id and timestamp.
#[derive(Clone, Debug, PartialEq)]
pub struct NewTurn {
    pub role: Role,
    pub text: String,
    pub rendered_text: Option<String>,
    pub summary: Option<TurnSummary>,
    pub world_state_snapshot: Option<Snapshot>,
}

impl NewTurn {
    pub fn user(text: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            text: text.into(),
            rendered_text: None,
            summary: None,
            world_state_snapshot: None,
        }
    }

    pub fn assistant(text: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            ..Self::user(text)
        }
    }

    pub fn with_rendered(mut self, rendered: impl Into<String>) -> Self {
        self.rendered_text = Some(rendered.into());
        self
    }

    pub fn with_snapshot(mut self, snapshot: Option<Snapshot>) -> Self {
        self.world_state_snapshot = snapshot;
        self
    }

    /// Materialize into a `Turn` with a fresh id and the current time.
    pub fn into_turn(self) -> Turn {
        Turn {
            id: TurnId::new(),
            role: self.role,
            timestamp: Utc::now().to_rfc3339(),
            text: self.text,
            rendered_text: self.rendered_text,
            summary: self.summary,
            world_state_snapshot: self.world_state_snapshot,
        }
    }
}

/// Partial update applied by `update_turn`. `None` fields are left alone.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct TurnPatch {
    pub text: Option<String>,
    pub rendered_text: Option<String>,
    pub summary: Option<TurnSummary>,
}

impl TurnPatch {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: Some(text.into()),
            ..Default::default()
        }
    }

    pub fn is_empty(&self) -> bool {
        self.text.is_none() && self.rendered_text.is_none() && self.summary.is_none()
    }

    pub fn apply(self, turn: &mut Turn) {
        if let Some(text) = self.text {
            turn.text = text;
        }
        if let Some(rendered) = self.rendered_text {
            turn.rendered_text = Some(rendered);
        }
        if let Some(summary) = self.summary {
            turn.summary = Some(summary);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn malformed_role_coerced_to_user() {
        let json = r#"{"id":"turn_1","role":"narrator","timestamp":"t","text":"hi"}"#;
        let turn: Turn = serde_json::from_str(json).unwrap();
        assert_eq!(turn.role, Role::User);
    }

    #[test]
    fn non_string_roles_coerced_to_user() {
        for role in ["null", "7", r#"{"name":"assistant"}"#, r#"["assistant"]"#, "true"] {
            let json = format!(r#"{{"id":"turn_1","role":{role},"timestamp":"t","text":"hi"}}"#);
            let turn: Turn = serde_json::from_str(&json).unwrap();
            assert_eq!(turn.role, Role::User, "role {role}");
        }
    }

    #[test]
    fn missing_role_coerced_to_user() {
        let json = r#"{"id":"turn_1","timestamp":"t","text":"hi"}"#;
        let turn: Turn = serde_json::from_str(json).unwrap();
        assert_eq!(turn.role, Role::User);
    }

    #[test]
    fn assistant_role_survives_roundtrip() {
        let turn = NewTurn::assistant("hello").into_turn();
        let json = serde_json::to_value(&turn).unwrap();
        assert_eq!(json["role"], "assistant");
        let back: Turn = serde_json::from_value(json).unwrap();
        assert_eq!(back, turn);
    }

    #[test]
    fn optional_fields_skipped_when_absent() {
        let turn = NewTurn::user("hi").into_turn();
        let json = serde_json::to_value(&turn).unwrap();
        assert!(json.get("summary").is_none());
        assert!(json.get("world_state_snapshot").is_none());
    }

    #[test]
    fn blank_summaries_count_as_empty() {
        let summary = TurnSummary {
            short: Some("  ".into()),
            long: None,
        };
        assert!(summary.is_empty());
        assert!(summary.short_text().is_none());
    }

    #[test]
    fn header_prefixes_both_summaries() {
        let summary = TurnSummary {
            short: Some("fled".into()),
            long: Some("the party fled".into()),
        }
        .with_header("#2 ");
        assert_eq!(summary.short.as_deref(), Some("#2 fled"));
        assert_eq!(summary.long.as_deref(), Some("#2 the party fled"));
    }

    #[test]
    fn patch_only_touches_given_fields() {
        let mut turn = NewTurn::assistant("old")
            .with_rendered("<p>old</p>")
            .with_snapshot(Some(Snapshot::new(serde_json::json!({"hp": 3}))))
            .into_turn();
        TurnPatch::text("new").apply(&mut turn);
        assert_eq!(turn.text, "new");
        assert_eq!(turn.rendered_text.as_deref(), Some("<p>old</p>"));
        assert!(turn.world_state_snapshot.is_some());
    }
}
