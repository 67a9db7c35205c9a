//! Output masking for secret values.

use std::borrow::Cow;

use super::SecretValue;

/// Replacement text for masked values.
pub const MASK: &str = "***";

/// Values shorter than this are too likely to collide with ordinary output.
const MIN_MASK_LEN: usize = 4;

/// Replaces known secret values in output lines.
#[derive(Debug, Clone, Default)]
pub struct Masker {
    values: Vec<SecretValue>,
}

impl Masker {
    /// Create an empty masker.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a value to mask. Short or duplicate values are ignored.
    ///
    /// Output is masked one line at a time, so each line of a multi-line
    /// value (a PEM key, say) is registered on its own as well.
    pub fn add(&mut self, value: &SecretValue) {
        if value.expose().contains('\n') {
            for line in value.expose().lines() {
                self.insert(SecretValue::new(line.trim_end_matches('\r')));
            }
        }
        self.insert(value.clone());
    }

    fn insert(&mut self, value: SecretValue) {
        if value.len() < MIN_MASK_LEN || self.values.contains(&value) {
            return;
        }
        self.values.push(value);
        // Longest first so a secret containing another is masked whole.
        self.values.sort_by_key(|v| std::cmp::Reverse(v.len()));
    }

    /// Number of registered values.
    pub fn len(&self) -> usize {
        self.values.len()
    }

    /// Whether nothing is masked.
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Mask every registered value in `text`.
    pub fn mask<'a>(&self, text: &'a str) -> Cow<'a, str> {
        let mut out = Cow::Borrowed(text);
        for value in &self.values {
            if out.contains(value.expose()) {
                out = Cow::Owned(out.replace(value.expose(), MASK));
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn masker(values: &[&str]) -> Masker {
        let mut masker = Masker::new();
        for v in values {
            masker.add(&SecretValue::new(*v));
        }
        masker
    }

    #[test]
    fn test_masks_values() {
        let masker = masker(&["sk-abc123", "241913052"]);
        assert_eq!(masker.mask("key=sk-abc123 blog=241913052"), "key=*** blog=***");
    }

    #[test]
    fn test_unchanged_text_is_borrowed() {
        let masker = masker(&["sk-abc123"]);
        assert!(matches!(masker.mask("nothing here"), Cow::Borrowed(_)));
    }

    #[test]
    fn test_short_values_ignored() {
        let masker = masker(&["abc", ""]);
        assert!(masker.is_empty());
        assert_eq!(masker.mask("abc"), "abc");
    }

    #[test]
    fn test_longest_value_masked_first() {
        let masker = masker(&["token", "token-extended"]);
        assert_eq!(masker.len(), 2);
        assert_eq!(masker.mask("token-extended token"), "*** ***");
    }

    #[test]
    fn test_multiline_secret_masked_per_line() {
        let masker = masker(&["-----BEGIN KEY-----\r\nMIIEvQIBADANBg\nok\n-----END KEY-----"]);

        assert_eq!(masker.mask("-----BEGIN KEY-----"), "***");
        assert_eq!(masker.mask("line MIIEvQIBADANBg"), "line ***");
        // Too short to mask on its own.
        assert_eq!(masker.mask("ok"), "ok");
    }
}
