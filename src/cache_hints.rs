use crate::config::CachingConfig;
use crate::types::{CacheControl, ChatMessage};
use tracing::debug;

/// Most providers accept at most four cache breakpoints per request.
const MAX_BREAKPOINTS: usize = 4;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct InjectionStats {
    pub eligible_messages: usize,
    pub breakpoints_injected: usize,
}

#[derive(Debug, Clone)]
pub struct InjectionResult {
    pub messages: Vec<ChatMessage>,
    pub stats: InjectionStats,
}

/// Mark long-prefix messages with `cache_control = ephemeral` so downstream
/// providers can reuse the cached prefix.
///
/// A message is eligible when its flattened text length meets the configured
/// threshold, it carries no breakpoint yet, and it is not a tool message.
/// The total number of breakpoints in the result (pre-existing plus injected)
/// is capped at the provider limit, which makes the operation idempotent.
pub fn inject_breakpoints(messages: &[ChatMessage], cfg: &CachingConfig) -> InjectionResult {
    let mut result: Vec<ChatMessage> = messages.to_vec();

    let existing = result.iter().filter(|m| m.cache_control.is_some()).count();
    let mut budget = MAX_BREAKPOINTS.saturating_sub(existing);
    let mut stats = InjectionStats::default();

    for message in result.iter_mut() {
        let eligible = message.role != "tool"
            && message.cache_control.is_none()
            && message.content.len() >= cfg.min_content_length;
        if !eligible {
            continue;
        }

        stats.eligible_messages += 1;
        if budget == 0 {
            continue;
        }

        message.cache_control = Some(CacheControl::ephemeral());
        stats.breakpoints_injected += 1;
        budget -= 1;
    }

    if stats.breakpoints_injected > 0 {
        debug!(
            eligible = stats.eligible_messages,
            injected = stats.breakpoints_injected,
            "injected cache breakpoints"
        );
    }

    InjectionResult {
        messages: result,
        stats,
    }
}
