//! Tolerant extraction of a JSON object from model output.

/// Pull the first complete `{...}` object out of `text`, ignoring markdown
/// code fences and any surrounding prose. Works by finding the first `{`
/// and walking the string counting braces until the matching `}`.
pub fn extract_json_object(text: &str) -> Option<String> {
    let stripped = strip_fences(text);

    let start = stripped.find('{')?;
    let mut depth = 0usize;
    for (offset, ch) in stripped[start..].char_indices() {
        match ch {
            '{' => depth += 1,
            '}' => {
                depth -= 1;
                if depth == 0 {
                    return Some(stripped[start..start + offset + ch.len_utf8()].to_string());
                }
            }
            _ => {}
        }
    }
    None
}

fn strip_fences(text: &str) -> &str {
    let mut s = text.trim();
    if let Some(rest) = s.strip_prefix("```") {
        // Drop the fence line ("```json" or bare "```").
        s = rest.split_once('\n').map(|(_, body)| body).unwrap_or(rest);
    }
    if let Some(rest) = s.trim_end().strip_suffix("```") {
        s = rest;
    }
    s.trim()
}
