//! Placeholder substitution for notification templates.
//!
//! Templates reference values as `{name}`. Substitution is a single left to
//! right pass over the template: inserted values are never rescanned, so a
//! player called `{steam_id}` stays literally `{steam_id}` in the output.
//! Placeholders without a mapping are copied through unchanged.

/// Replace every `{name}` in `template` whose `name` appears in `values`.
///
/// ```
/// use cordrelay_core::template::fill;
///
/// let out = fill("{a}-{b}-{a} {c}", &[("a", "x"), ("b", "y")]);
/// assert_eq!(out, "x-y-x {c}");
/// ```
pub fn fill(template: &str, values: &[(&str, &str)]) -> String {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;

    while let Some(open) = rest.find('{') {
        out.push_str(&rest[..open]);
        let candidate = &rest[open + 1..];

        let replacement = candidate.find('}').and_then(|close| {
            let name = &candidate[..close];
            values
                .iter()
                .find(|(key, _)| *key == name)
                .map(|(_, value)| (*value, close))
        });

        match replacement {
            Some((value, close)) => {
                out.push_str(value);
                rest = &candidate[close + 1..];
            }
            None => {
                // Not a known placeholder: keep the brace and keep scanning
                // right after it so `{{a}` still resolves the inner `{a}`.
                out.push('{');
                rest = candidate;
            }
        }
    }

    out.push_str(rest);
    out
}

/// Encode the characters that are significant in HTML markup.
///
/// Values interpolated into HUD templates must pass through this first;
/// [`fill`] itself performs no escaping.
pub fn html_encode(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    for ch in input.chars() {
        match ch {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            _ => out.push(ch),
        }
    }
    out
}
