//! Conversation truncation.
//!
//! Before each provider call the history is walked newest to oldest,
//! keeping turns until either the message cap or the estimated token budget
//! is reached. Whole turns only - a reply is never cut mid-message.

use cm_domain::types::Turn;

/// Rough chars-per-token estimate.
const CHARS_PER_TOKEN: usize = 4;

/// The suffix of `turns` that fits the caps. Always keeps at least the
/// final turn. Logs when anything was dropped.
pub fn truncate_history(turns: &[Turn], max_messages: usize, max_tokens: usize) -> &[Turn] {
    if turns.is_empty() {
        return turns;
    }

    let budget_chars = max_tokens.saturating_mul(CHARS_PER_TOKEN);
    let mut start = turns.len();
    let mut chars = 0usize;

    for (index, turn) in turns.iter().enumerate().rev() {
        let kept = turns.len() - index;
        if kept > max_messages.max(1) {
            break;
        }
        chars += turn.content.len();
        if chars > budget_chars && kept > 1 {
            break;
        }
        start = index;
    }

    if start > 0 {
        tracing::info!(
            dropped = start,
            kept = turns.len() - start,
            "conversation history truncated"
        );
    }
    &turns[start..]
}

/// Estimated token count for a set of turns.
pub fn estimate_tokens(turns: &[Turn]) -> usize {
    turns.iter().map(|t| t.content.len()).sum::<usize>() / CHARS_PER_TOKEN
}
