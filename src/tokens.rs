use crate::types::ChatMessage;

/// Punctuation density at or above this marks text as code-like.
const CODE_DENSITY_THRESHOLD: f64 = 0.1;

/// Heuristic token estimate for a text fragment.
///
/// Takes the maximum of two estimates: word count scaled by 1.3 for
/// code-like text (1.1 otherwise), and `ceil(chars / 4)`. Deterministic and
/// O(n) in the text length.
pub fn estimate_text_tokens(text: &str) -> usize {
    if text.is_empty() {
        return 0;
    }

    let words = text.split_whitespace().count();
    let chars = text.chars().count();

    let punctuation = text
        .chars()
        .filter(|c| matches!(c, '{' | '}' | '(' | ')' | '[' | ']' | ';'))
        .count();
    let code_like = words > 0 && punctuation as f64 / words as f64 >= CODE_DENSITY_THRESHOLD;

    let multiplier = if code_like { 1.3 } else { 1.1 };
    let word_estimate = (words as f64 * multiplier).ceil() as usize;
    let char_estimate = chars.div_ceil(4);

    word_estimate.max(char_estimate)
}

/// Token estimate for a message sequence. Non-text content blocks contribute
/// only their text payload; all other fields are ignored.
pub fn estimate_tokens(messages: &[ChatMessage]) -> usize {
    messages
        .iter()
        .map(|m| estimate_text_tokens(&m.content.text()))
        .sum()
}
