// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Canonical gateway names.
//!
//! Gateway names are stored in kebab-case and are globally unique in that
//! form, so `"My Cool Gateway"` and `"my_cool_gateway"` collide.
//!
//! Rules:
//! - Letters are lowercased; digits are kept.
//! - Whitespace, `_` and `-` separate words.
//! - An uppercase letter starts a new word after a lowercase letter or digit,
//!   and at the end of an acronym (`HTTPServer` → `http-server`).
//! - Everything else is dropped.
//! - Separators never repeat and never lead or trail.
//!
//! The output contains no uppercase letters and no separator other than a
//! single `-` between words, so `slugify(slugify(x)) == slugify(x)`.

/// Normalize a gateway name to its canonical slug.
pub fn slugify(input: &str) -> String {
    let chars: Vec<char> = input.chars().collect();
    let mut out = String::with_capacity(input.len());
    let mut pending_separator = false;

    for (i, &ch) in chars.iter().enumerate() {
        if ch.is_uppercase() {
            let prev = i.checked_sub(1).map(|p| chars[p]);
            let next = chars.get(i + 1).copied();
            let after_word = prev.is_some_and(|p| p.is_lowercase() || p.is_numeric());
            let ends_acronym =
                prev.is_some_and(|p| p.is_uppercase()) && next.is_some_and(|n| n.is_lowercase());
            if after_word || ends_acronym {
                pending_separator = true;
            }
            for lower in ch.to_lowercase().filter(|c| c.is_alphanumeric()) {
                push_char(&mut out, &mut pending_separator, lower);
            }
        } else if ch.is_alphanumeric() {
            push_char(&mut out, &mut pending_separator, ch);
        } else if ch.is_whitespace() || ch == '_' || ch == '-' {
            pending_separator = true;
        }
    }

    out
}

fn push_char(out: &mut String, pending_separator: &mut bool, ch: char) {
    if *pending_separator && !out.is_empty() {
        out.push('-');
    }
    *pending_separator = false;
    out.push(ch);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_spaces_become_dashes() {
        assert_eq!(slugify("My Cool Gateway"), "my-cool-gateway");
    }

    #[test]
    fn test_camel_case_and_acronyms() {
        assert_eq!(slugify("MyGateway"), "my-gateway");
        assert_eq!(slugify("HTTPServer"), "http-server");
        assert_eq!(slugify("gateway2Prod"), "gateway2-prod");
        assert_eq!(slugify("ABC"), "abc");
    }

    #[test]
    fn test_separators_collapse_and_trim() {
        assert_eq!(slugify("  edge__node -- one  "), "edge-node-one");
        assert_eq!(slugify("___"), "");
        assert_eq!(slugify(""), "");
    }

    #[test]
    fn test_punctuation_is_dropped() {
        assert_eq!(slugify("gw#1 (eu)!"), "gw1-eu");
        assert_eq!(slugify("a.b.c"), "abc");
    }

    #[test]
    fn test_unicode_letters_are_kept_lowercase() {
        assert_eq!(slugify("Über Node"), "über-node");
        assert_eq!(slugify("ÉCOLE"), "école");
    }

    #[test]
    fn test_same_slug_for_equivalent_names() {
        assert_eq!(slugify("My Cool Gateway"), slugify("my_cool_gateway"));
        assert_eq!(slugify("My Cool Gateway"), slugify("MyCoolGateway"));
    }

    #[test]
    fn test_slugify_is_idempotent() {
        let samples = [
            "My Cool Gateway",
            "my-cool-gateway",
            "MyCoolGateway",
            "HTTPServer",
            "  leading and trailing  ",
            "__under_scores__",
            "mixed-Separators_and Spaces",
            "gw#1 (eu)!",
            "Über Node",
            "İstanbul Edge",
            "ǅemal",
            "ΣΊΣΥΦΟΣ",
            "a1B2c3D4",
            "---",
            "x",
            "Transcoding-1080P-Node",
        ];

        for sample in samples {
            let once = slugify(sample);
            assert_eq!(slugify(&once), once, "slugify not idempotent for {sample:?}");
            assert!(!once.starts_with('-') && !once.ends_with('-'));
            assert!(!once.contains("--"));
        }
    }
}
