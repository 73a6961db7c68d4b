//! Markup-to-text extraction for HTML message bodies.

/// Tags whose start or end marks a line boundary in rendered text.
const BLOCK_TAGS: &[&str] = &[
    "br", "p", "div", "li", "tr", "h1", "h2", "h3", "h4", "h5", "h6", "blockquote", "pre",
    "table", "ul", "ol",
];

/// Tags whose content is never visible.
const HIDDEN_TAGS: &[&str] = &["script", "style", "head", "title"];

/// Convert an HTML body to its visible text, keeping line structure.
///
/// Block-level tags and `<br>` become newlines, the content of
/// script/style/head is dropped, a handful of common entities are decoded,
/// and the result is trimmed.
pub fn html_to_text(html: &str) -> String {
    let mut out = String::with_capacity(html.len());
    let mut rest = html;
    let mut hidden_depth = 0usize;

    while let Some(open) = rest.find('<') {
        if hidden_depth == 0 {
            out.push_str(&decode_entities(&rest[..open]));
        }
        if let Some(comment) = rest[open..].strip_prefix("<!--") {
            // Unterminated comment swallows the remainder.
            rest = comment.find("-->").map_or("", |end| &comment[end + 3..]);
            continue;
        }

        let after = &rest[open + 1..];
        let Some(close) = after.find('>') else {
            // Unterminated tag: treat the remainder as text.
            if hidden_depth == 0 {
                out.push_str(&decode_entities(&rest[open..]));
            }
            rest = "";
            break;
        };

        let tag = &after[..close];
        let (is_end, name) = tag_name(tag);
        if HIDDEN_TAGS.contains(&name.as_str()) {
            if is_end {
                hidden_depth = hidden_depth.saturating_sub(1);
            } else if !tag.ends_with('/') {
                hidden_depth += 1;
            }
        } else if hidden_depth == 0 && BLOCK_TAGS.contains(&name.as_str()) && !out.ends_with('\n') {
            out.push('\n');
        }

        rest = &after[close + 1..];
    }
    if hidden_depth == 0 {
        out.push_str(&decode_entities(rest));
    }

    out.lines()
        .map(str::trim_end)
        .collect::<Vec<_>>()
        .join("\n")
        .trim()
        .to_string()
}

/// Split `"/div class=x"` into `(true, "div")`.
fn tag_name(tag: &str) -> (bool, String) {
    let tag = tag.trim();
    let (is_end, body) = match tag.strip_prefix('/') {
        Some(body) => (true, body),
        None => (false, tag),
    };
    let name: String = body
        .chars()
        .take_while(|c| c.is_ascii_alphanumeric())
        .collect::<String>()
        .to_ascii_lowercase();
    (is_end, name)
}

fn decode_entities(text: &str) -> String {
    if !text.contains('&') {
        return text.to_string();
    }
    let mut out = String::with_capacity(text.len());
    let mut rest = text;
    while let Some(amp) = rest.find('&') {
        out.push_str(&rest[..amp]);
        let candidate = &rest[amp..];
        match candidate.find(';').filter(|&end| end <= 10) {
            Some(end) => match decode_entity(&candidate[1..end]) {
                Some(ch) => {
                    out.push(ch);
                    rest = &candidate[end + 1..];
                }
                None => {
                    out.push('&');
                    rest = &candidate[1..];
                }
            },
            None => {
                out.push('&');
                rest = &candidate[1..];
            }
        }
    }
    out.push_str(rest);
    out
}

fn decode_entity(name: &str) -> Option<char> {
    match name {
        "amp" => Some('&'),
        "lt" => Some('<'),
        "gt" => Some('>'),
        "quot" => Some('"'),
        "apos" => Some('\''),
        "nbsp" => Some(' '),
        "laquo" => Some('«'),
        "raquo" => Some('»'),
        "mdash" => Some('—'),
        "ndash" => Some('–'),
        _ => {
            let num = name.strip_prefix('#')?;
            let code = match num.strip_prefix(['x', 'X']) {
                Some(hex) => u32::from_str_radix(hex, 16).ok()?,
                None => num.parse().ok()?,
            };
            char::from_u32(code)
        }
    }
}
