/// Marker appended to a truncated summary.
pub const ELLIPSIS: char = '…';

/// Collapse `text` to at most `max_tokens` whitespace tokens and `max_chars`
/// characters (marker included), cutting on a word boundary.
///
/// Returns the summary and whether anything was cut. A single word longer
/// than the budget is cut mid-word.
pub fn summarize(text: &str, max_tokens: usize, max_chars: usize) -> (String, bool) {
    let max_tokens = max_tokens.max(1);
    let max_chars = max_chars.max(2);
    let tokens: Vec<&str> = text.split_whitespace().collect();

    let full_len = tokens.iter().map(|t| t.chars().count()).sum::<usize>()
        + tokens.len().saturating_sub(1);
    if tokens.len() <= max_tokens && full_len <= max_chars {
        return (tokens.join(" "), false);
    }

    let budget = max_chars - 1;
    let mut out = String::new();
    let mut used = 0;
    for token in tokens.iter().take(max_tokens) {
        let len = token.chars().count();
        let needed = if out.is_empty() { len } else { len + 1 };
        if used + needed > budget {
            break;
        }
        if !out.is_empty() {
            out.push(' ');
        }
        out.push_str(token);
        used += needed;
    }
    if out.is_empty()
        && let Some(first) = tokens.first()
    {
        out = first.chars().take(budget).collect();
    }
    out.push(ELLIPSIS);
    (out, true)
}
