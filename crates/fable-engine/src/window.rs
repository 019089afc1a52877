//! History window policy.
//!
//! Decides which turns of a session are re-injected into the next generation
//! request and in what form. Per role, the newest `limit` turns go in as full
//! text; older turns are represented by their summaries only, so prompt size
//! stays bounded no matter how long the session grows.

use serde::{Deserialize, Serialize};

use fable_core::generation::{FragmentMode, PromptFragment};
use fable_core::turn::{Role, Turn, TurnSummary};

const DEFAULT_ASSISTANT_TURN_LIMIT: u32 = 4;
const DEFAULT_USER_TURN_LIMIT: u32 = 4;
const DEFAULT_SHORT_SUMMARY_THRESHOLD: u32 = 4;
const DEFAULT_LONG_SUMMARY_THRESHOLD: u32 = 12;

/// Size and summary thresholds for [`build_window`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryWindowConfig {
    pub assistant_turn_limit: u32,
    pub user_turn_limit: u32,
    pub short_summary_threshold: u32,
    pub long_summary_threshold: u32,
}

impl Default for HistoryWindowConfig {
    fn default() -> Self {
        Self {
            assistant_turn_limit: DEFAULT_ASSISTANT_TURN_LIMIT,
            user_turn_limit: DEFAULT_USER_TURN_LIMIT,
            short_summary_threshold: DEFAULT_SHORT_SUMMARY_THRESHOLD,
            long_summary_threshold: DEFAULT_LONG_SUMMARY_THRESHOLD,
        }
    }
}

impl HistoryWindowConfig {
    /// Settings key the configuration is persisted under.
    pub const SETTINGS_KEY: &'static str = "history_window";

    /// Replace zero values with defaults and keep the long threshold at or
    /// above the short one.
    pub fn sanitized(self) -> Self {
        let pick = |v: u32, default: u32| if v == 0 { default } else { v };
        let short = pick(self.short_summary_threshold, DEFAULT_SHORT_SUMMARY_THRESHOLD);
        Self {
            assistant_turn_limit: pick(self.assistant_turn_limit, DEFAULT_ASSISTANT_TURN_LIMIT),
            user_turn_limit: pick(self.user_turn_limit, DEFAULT_USER_TURN_LIMIT),
            short_summary_threshold: short,
            long_summary_threshold: pick(self.long_summary_threshold, DEFAULT_LONG_SUMMARY_THRESHOLD)
                .max(short),
        }
    }

    /// Lenient read of a stored value. Missing, negative, non-numeric or
    /// out-of-range fields fall back to defaults individually.
    pub fn from_value(value: &serde_json::Value) -> Self {
        let field = |name: &str| {
            value
                .get(name)
                .and_then(serde_json::Value::as_i64)
                .filter(|v| *v > 0)
                .and_then(|v| u32::try_from(v).ok())
                .unwrap_or(0)
        };
        Self {
            assistant_turn_limit: field("assistant_turn_limit"),
            user_turn_limit: field("user_turn_limit"),
            short_summary_threshold: field("short_summary_threshold"),
            long_summary_threshold: field("long_summary_threshold"),
        }
        .sanitized()
    }

    pub fn limit_for(&self, role: Role) -> u32 {
        match role {
            Role::User => self.user_turn_limit,
            Role::Assistant => self.assistant_turn_limit,
        }
    }
}

/// Per-mode fragment counts, for observability.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WindowStats {
    pub full: usize,
    pub long_summary: usize,
    pub short_summary: usize,
    pub omitted: usize,
}

impl WindowStats {
    fn record(&mut self, mode: Option<FragmentMode>) {
        match mode {
            Some(FragmentMode::Full) => self.full += 1,
            Some(FragmentMode::LongSummary) => self.long_summary += 1,
            Some(FragmentMode::ShortSummary) => self.short_summary += 1,
            None => self.omitted += 1,
        }
    }

    pub fn included(&self) -> usize {
        self.full + self.long_summary + self.short_summary
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct HistoryWindow {
    /// In the chronological order of the source log.
    pub fragments: Vec<PromptFragment>,
    pub stats: WindowStats,
}

/// Build the bounded history for the next generation call.
///
/// Rank `r` counts a turn's distance past its role's cutoff, starting at 1:
///
/// | rank | representation |
/// |---|---|
/// | within limit | full text |
/// | `r < short_summary_threshold` | long summary, else short, else omitted |
/// | `short ≤ r ≤ long_summary_threshold` | short summary, else long, else omitted |
/// | `r > long_summary_threshold` | short summary, else omitted |
pub fn build_window(turns: &[Turn], config: &HistoryWindowConfig) -> HistoryWindow {
    let config = config.sanitized();

    let user_total = turns.iter().filter(|t| t.role == Role::User).count() as u32;
    let assistant_total = turns.len() as u32 - user_total;

    let mut seen_user = 0u32;
    let mut seen_assistant = 0u32;
    let mut window = HistoryWindow::default();

    for turn in turns {
        let (seen, total) = match turn.role {
            Role::User => (&mut seen_user, user_total),
            Role::Assistant => (&mut seen_assistant, assistant_total),
        };
        let from_newest = total - *seen - 1;
        *seen += 1;

        let limit = config.limit_for(turn.role);
        let choice = if from_newest < limit {
            Some((FragmentMode::Full, turn.text.clone()))
        } else {
            let rank = from_newest - limit + 1;
            turn.summary
                .as_ref()
                .and_then(|summary| summarized(summary, rank, &config))
        };

        window.stats.record(choice.as_ref().map(|(mode, _)| *mode));
        if let Some((mode, content)) = choice {
            window.fragments.push(PromptFragment {
                turn_id: turn.id.clone(),
                role: turn.role,
                mode,
                content,
            });
        }
    }

    window
}

fn summarized(summary: &TurnSummary, rank: u32, config: &HistoryWindowConfig) -> Option<(FragmentMode, String)> {
    let long = || summary.long_text().map(|s| (FragmentMode::LongSummary, s.to_string()));
    let short = || summary.short_text().map(|s| (FragmentMode::ShortSummary, s.to_string()));

    if rank < config.short_summary_threshold {
        long().or_else(short)
    } else if rank <= config.long_summary_threshold {
        short().or_else(long)
    } else {
        short()
    }
}
