//! Variable reference extraction from query and filter text.
//!
//! Recognizes `$name`, `${name}` and `${name:modifier}` forms. Names are
//! alphanumeric plus `_` and `-`; the modifier (e.g. `csv`, `pipe`) is not
//! part of the referenced name.

/// Extract every variable name referenced by `text`, in first-seen order,
/// deduplicated.
pub fn extract_references(text: &str) -> Vec<String> {
    let mut names: Vec<String> = Vec::new();
    let bytes = text.as_bytes();
    let mut i = 0;

    while i < bytes.len() {
        if bytes[i] != b'$' {
            i += 1;
            continue;
        }

        // Braced form: ${name} or ${name:modifier}
        if i + 1 < bytes.len() && bytes[i + 1] == b'{' {
            let start = i + 2;
            let mut end = start;
            while end < bytes.len() && bytes[end] != b'}' {
                end += 1;
            }
            if end < bytes.len() {
                let inner = &text[start..end];
                let name = inner.split(':').next().unwrap_or("");
                push_name(&mut names, name);
                i = end + 1;
                continue;
            }
            // Unterminated brace: not a reference.
            i += 2;
            continue;
        }

        // Bare form: $name
        let start = i + 1;
        let mut end = start;
        while end < bytes.len() && is_name_byte(bytes[end]) {
            end += 1;
        }
        if end > start {
            push_name(&mut names, &text[start..end]);
        }
        i = end.max(i + 1);
    }

    names
}

fn is_name_byte(b: u8) -> bool {
    b.is_ascii_alphanumeric() || b == b'_' || b == b'-'
}

fn push_name(names: &mut Vec<String>, name: &str) {
    if name.is_empty() {
        return;
    }
    if !name.bytes().all(is_name_byte) {
        return;
    }
    if !names.iter().any(|existing| existing == name) {
        names.push(name.to_string());
    }
}
