//! Context Assembler: bounded window of recent turns for the generator.

use crate::error::{DialogueError, Result};
use crate::log::MessageLog;
use crate::types::{ContextWindow, Turn};

/// Builds the [`ContextWindow`] for one generation call.
///
/// The window holds at most `max_turns` turns, the new turn included, and
/// history is added newest-first only while the total stays within
/// `max_chars`. Assistant turns are measured by their summary. Blocked turns
/// never enter a window.
///
/// Only the last `max_turns` turns of the log are considered. Blocked turns
/// among them still use up slots: they shrink the window rather than letting
/// older turns back in.
#[derive(Clone)]
pub struct ContextAssembler {
    log: MessageLog,
    max_turns: usize,
    max_chars: usize,
}

impl ContextAssembler {
    pub fn new(log: MessageLog, max_turns: usize, max_chars: usize) -> Self {
        Self {
            log,
            max_turns: max_turns.max(1),
            max_chars,
        }
    }

    /// Window ending in `new_turn`, which must already be in the log.
    ///
    /// The new turn is always present, even when it alone exceeds the
    /// character budget.
    pub async fn build(&self, session_id: &str, new_turn: &Turn) -> Result<ContextWindow> {
        if new_turn.verdict.is_blocked() {
            return Err(DialogueError::InvalidInput(
                "blocked turn cannot start a context window".to_string(),
            ));
        }

        let history = self
            .log
            .read(session_id, Some(self.max_turns), None)
            .await?;
        let window = ContextWindow {
            session_id: session_id.to_string(),
            turns: select(history, new_turn, self.max_turns, self.max_chars),
        };

        tracing::debug!(
            session_id,
            turns = window.len(),
            chars = window.total_chars(),
            "Context assembled"
        );
        Ok(window)
    }
}

/// Pick history turns newest-first under both budgets, then append the new turn.
fn select(history: Vec<Turn>, new_turn: &Turn, max_turns: usize, max_chars: usize) -> Vec<Turn> {
    let slots = max_turns.saturating_sub(1);
    let mut budget = max_chars.saturating_sub(new_turn.context_chars());

    let mut picked: Vec<Turn> = Vec::with_capacity(slots + 1);
    for turn in history
        .into_iter()
        .rev()
        .filter(|t| t.sequence < new_turn.sequence && !t.verdict.is_blocked())
    {
        if picked.len() == slots {
            break;
        }
        let chars = turn.context_chars();
        if chars > budget {
            break;
        }
        budget -= chars;
        picked.push(turn);
    }

    picked.reverse();
    picked.push(new_turn.clone());
    picked
}
