use crate::config::WindowingConfig;
use crate::tokens::estimate_tokens;
use crate::types::{ChatMessage, WindowingMethod, WindowingOutcome};
use tracing::debug;

/// Upper bound on the heuristic summary length, in characters.
const SUMMARY_CHAR_BUDGET: usize = 600;
/// Per-message excerpt length used when building the summary.
const EXCERPT_CHARS: usize = 80;

/// Trim a conversation to the configured message and token limits, preserving
/// the system prompt and the most recent messages and compressing the dropped
/// prefix into a short summary.
///
/// Never fails: empty or degenerate input produces a passthrough outcome with
/// `method = none`.
pub fn window(messages: &[ChatMessage], cfg: &WindowingConfig) -> WindowingOutcome {
    let original_token_estimate = estimate_tokens(messages);

    // The first system message (if any) is held out of the window entirely.
    let system_index = messages.iter().position(|m| m.role == "system");
    let system_prompt = system_index
        .map(|i| messages[i].content.text())
        .unwrap_or_default();
    let conversation: Vec<ChatMessage> = messages
        .iter()
        .enumerate()
        .filter(|(i, _)| Some(*i) != system_index)
        .map(|(_, m)| m.clone())
        .collect();

    let within_limits = conversation.len() <= cfg.summarize_threshold
        && original_token_estimate <= cfg.max_tokens;
    if conversation.is_empty() || within_limits {
        let windowed_token_estimate = estimate_tokens(&conversation)
            + crate::tokens::estimate_text_tokens(&system_prompt);
        return WindowingOutcome {
            system_prompt,
            context_summary: None,
            windowed_message_count: conversation.len(),
            recent_messages: conversation,
            original_message_count: messages.len(),
            trimmed_message_count: 0,
            original_token_estimate,
            windowed_token_estimate: windowed_token_estimate.min(original_token_estimate),
            summary_token_estimate: 0,
            method: WindowingMethod::None,
        };
    }

    // Keep the most recent maxMessages, then keep dropping oldest entries
    // while the token estimate still exceeds the limit.
    let keep = cfg.max_messages.min(conversation.len());
    let mut cut = conversation.len() - keep;
    loop {
        let recent = &conversation[cut..];
        let estimate =
            estimate_tokens(recent) + crate::tokens::estimate_text_tokens(&system_prompt);
        if estimate <= cfg.max_tokens || recent.len() <= 1 {
            break;
        }
        cut += 1;
    }

    let trimmed = &conversation[..cut];
    let recent_messages: Vec<ChatMessage> = conversation[cut..].to_vec();
    let context_summary = if trimmed.is_empty() {
        None
    } else {
        Some(summarize(trimmed))
    };

    let windowed_token_estimate = estimate_tokens(&recent_messages)
        + crate::tokens::estimate_text_tokens(&system_prompt);
    let summary_token_estimate = context_summary
        .as_deref()
        .map(crate::tokens::estimate_text_tokens)
        .unwrap_or(0);

    debug!(
        trimmed = trimmed.len(),
        kept = recent_messages.len(),
        original_tokens = original_token_estimate,
        windowed_tokens = windowed_token_estimate,
        "windowed conversation"
    );

    WindowingOutcome {
        system_prompt,
        context_summary,
        windowed_message_count: recent_messages.len(),
        recent_messages,
        original_message_count: messages.len(),
        trimmed_message_count: trimmed.len(),
        original_token_estimate,
        windowed_token_estimate: windowed_token_estimate.min(original_token_estimate),
        summary_token_estimate,
        method: WindowingMethod::Heuristic,
    }
}

/// Reconstruct the message sequence described by a windowing outcome: one
/// system message carrying the prompt and the context summary, followed by
/// the recent messages in order. The system message is omitted when both the
/// prompt and the summary are empty.
pub fn build_windowed_messages(outcome: &WindowingOutcome) -> Vec<ChatMessage> {
    let mut messages = Vec::with_capacity(outcome.recent_messages.len() + 1);

    let mut system_text = outcome.system_prompt.clone();
    if let Some(summary) = outcome.context_summary.as_deref() {
        if !summary.is_empty() {
            if !system_text.is_empty() {
                system_text.push_str("\n\n");
            }
            system_text.push_str("<context_summary>\n");
            system_text.push_str(summary);
            system_text.push_str("\n</context_summary>");
        }
    }
    if !system_text.is_empty() {
        messages.push(ChatMessage::new("system", &system_text));
    }

    messages.extend(outcome.recent_messages.iter().cloned());
    messages
}

/// Bounded extractive summary of the trimmed prefix: one excerpt line per
/// message, oldest first, truncated to the overall character budget.
fn summarize(trimmed: &[ChatMessage]) -> String {
    let mut summary = String::new();

    for message in trimmed {
        let text = message.content.text();
        let flattened = text.split_whitespace().collect::<Vec<_>>().join(" ");
        if flattened.is_empty() {
            continue;
        }

        let excerpt: String = flattened.chars().take(EXCERPT_CHARS).collect();
        let ellipsis = if flattened.chars().count() > EXCERPT_CHARS {
            "..."
        } else {
            ""
        };

        let line = format!("- {}: {}{}\n", message.role, excerpt, ellipsis);
        if summary.chars().count() + line.chars().count() > SUMMARY_CHAR_BUDGET {
            break;
        }
        summary.push_str(&line);
    }

    summary.trim_end().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn turns(n: usize) -> Vec<ChatMessage> {
        (0..n)
            .map(|i| {
                let role = if i % 2 == 0 { "user" } else { "assistant" };
                ChatMessage::new(role, &format!("message number {} with some filler text", i))
            })
            .collect()
    }

    fn cfg(max_messages: usize, max_tokens: usize, threshold: usize) -> WindowingConfig {
        WindowingConfig {
            enabled: true,
            max_messages,
            max_tokens,
            summarize_threshold: threshold,
        }
    }

    #[test]
    fn short_conversation_passes_through() {
        let messages = turns(4);
        let outcome = window(&messages, &cfg(10, 4000, 8));

        assert_eq!(outcome.method, WindowingMethod::None);
        assert_eq!(outcome.trimmed_message_count, 0);
        assert_eq!(outcome.windowed_message_count, 4);
        assert_eq!(outcome.windowed_token_estimate, outcome.original_token_estimate);
        assert!(outcome.context_summary.is_none());
    }

    #[test]
    fn empty_input_never_panics() {
        let outcome = window(&[], &cfg(10, 4000, 8));
        assert_eq!(outcome.method, WindowingMethod::None);
        assert_eq!(outcome.original_message_count, 0);
        assert!(build_windowed_messages(&outcome).is_empty());
    }

    #[test]
    fn long_conversation_keeps_recent_suffix() {
        let mut messages = vec![ChatMessage::new("system", "you are helpful")];
        messages.extend(turns(20));
        let outcome = window(&messages, &cfg(10, 4000, 8));

        assert_eq!(outcome.method, WindowingMethod::Heuristic);
        assert_eq!(outcome.windowed_message_count, 10);
        assert_eq!(outcome.trimmed_message_count, 10);
        assert_eq!(outcome.system_prompt, "you are helpful");
        assert!(outcome.context_summary.is_some());

        // Message-count bookkeeping: windowed + trimmed == original - system
        assert_eq!(
            outcome.windowed_message_count + outcome.trimmed_message_count,
            outcome.original_message_count - 1
        );

        // The kept messages are the most recent ones, in order.
        assert_eq!(
            outcome.recent_messages.last().unwrap().content.text(),
            messages.last().unwrap().content.text()
        );
    }

    #[test]
    fn windowed_estimate_never_exceeds_original() {
        let messages = turns(30);
        let outcome = window(&messages, &cfg(10, 4000, 8));
        assert!(outcome.windowed_token_estimate <= outcome.original_token_estimate);
    }

    #[test]
    fn tight_token_limit_drops_further_messages() {
        let mut messages = Vec::new();
        for i in 0..12 {
            // ~100 tokens per message, so ten of them blow a 500-token limit
            messages.push(ChatMessage::new("user", &format!("{} {}", i, "x".repeat(400))));
        }
        let outcome = window(&messages, &cfg(10, 500, 8));

        assert!(outcome.windowed_message_count < 10);
        assert!(outcome.windowed_message_count >= 1);
        assert_eq!(
            outcome.windowed_message_count + outcome.trimmed_message_count,
            outcome.original_message_count
        );
    }

    #[test]
    fn rebuild_prepends_system_with_summary_block() {
        let mut messages = vec![ChatMessage::new("system", "base prompt")];
        messages.extend(turns(20));
        let outcome = window(&messages, &cfg(10, 4000, 8));
        let rebuilt = build_windowed_messages(&outcome);

        assert_eq!(rebuilt[0].role, "system");
        let system_text = rebuilt[0].content.text();
        assert!(system_text.starts_with("base prompt"));
        assert!(system_text.contains("<context_summary>"));
        assert!(system_text.contains("</context_summary>"));
        assert_eq!(rebuilt.len(), outcome.windowed_message_count + 1);
    }

    #[test]
    fn rebuilt_non_system_messages_are_a_suffix_of_input() {
        let messages = turns(25);
        let outcome = window(&messages, &cfg(10, 4000, 8));
        let rebuilt = build_windowed_messages(&outcome);

        let rebuilt_tail: Vec<String> = rebuilt
            .iter()
            .filter(|m| m.role != "system")
            .map(|m| m.content.text())
            .collect();
        let input_tail: Vec<String> = messages
            .iter()
            .map(|m| m.content.text())
            .skip(messages.len() - rebuilt_tail.len())
            .collect();

        assert_eq!(rebuilt_tail, input_tail);
    }

    #[test]
    fn summary_is_bounded() {
        let messages: Vec<ChatMessage> = (0..50)
            .map(|i| ChatMessage::new("user", &format!("{} {}", i, "x".repeat(500))))
            .collect();
        let outcome = window(&messages, &cfg(5, 4000, 8));

        let summary = outcome.context_summary.unwrap();
        assert!(summary.chars().count() <= SUMMARY_CHAR_BUDGET);
    }
}
