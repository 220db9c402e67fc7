//! Identity labels.
//!
//! A label is used as a dataset folder name, as the identity stored with each
//! embedding and as the key for deletion. All three go through
//! [`canonical_label`] so there is exactly one form of every name.

const FORBIDDEN: &[char] = &['<', '>', ':', '"', '/', '\\', '|', '?', '*'];

/// Canonical form of a person's name: path-hostile characters become `_` and
/// runs of whitespace collapse to a single space. Case and diacritics are kept.
pub fn canonical_label(raw: &str) -> String {
    let replaced: String = raw
        .chars()
        .map(|c| if FORBIDDEN.contains(&c) || c.is_control() { '_' } else { c })
        .collect();
    replaced.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Whether `label` is usable as a dataset folder and store identity: already
/// canonical, non-empty and not hidden (which also rules out `.` and `..`).
pub fn is_valid_label(label: &str) -> bool {
    !label.is_empty() && !label.starts_with('.') && canonical_label(label) == label
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_keeps_diacritics_and_case() {
        assert_eq!(canonical_label("Nguyễn Văn An"), "Nguyễn Văn An");
    }

    #[test]
    fn test_collapses_whitespace() {
        assert_eq!(canonical_label("  Bob \t  Smith \n"), "Bob Smith");
    }

    #[test]
    fn test_replaces_path_characters() {
        assert_eq!(canonical_label("a/b\\c:d*e?f\"g<h>i|j"), "a_b_c_d_e_f_g_h_i_j");
    }

    #[test]
    fn test_idempotent() {
        let once = canonical_label(" x / y ");
        assert_eq!(canonical_label(&once), once);
    }

    #[test]
    fn test_valid_labels() {
        assert!(is_valid_label("Alice"));
        assert!(!is_valid_label(""));
        assert!(!is_valid_label("."));
        assert!(!is_valid_label(".."));
        assert!(!is_valid_label(".hidden"));
        assert!(is_valid_label("J. Doe"));
        assert!(!is_valid_label("Alice  Smith"));
        assert!(!is_valid_label("a/b"));
    }
}
