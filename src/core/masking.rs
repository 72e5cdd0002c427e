use std::collections::BTreeSet;

/// Replacement written in place of any secret value.
pub const MASK: &str = "***";

/// Masks text by value membership: any occurrence of a known secret value is
/// replaced with [`MASK`]. Longer values are replaced first so a secret that
/// contains another secret is never half-masked.
#[derive(Debug, Clone, Default)]
pub struct SecretMasker {
    values: Vec<String>,
}

impl SecretMasker {
    pub fn new<I, S>(values: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut masker = Self::default();
        masker.extend(values);
        masker
    }

    pub fn extend<I, S>(&mut self, values: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut set: BTreeSet<String> = self.values.drain(..).collect();
        for value in values {
            let value = value.into();
            if !value.is_empty() {
                set.insert(value);
            }
        }
        self.values = set.into_iter().collect();
        self.values
            .sort_by(|a, b| b.len().cmp(&a.len()).then_with(|| a.cmp(b)));
    }

    pub fn absorb(&mut self, other: SecretMasker) {
        self.extend(other.values);
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn contains(&self, value: &str) -> bool {
        self.values.iter().any(|v| v == value)
    }

    pub fn mask(&self, text: &str) -> String {
        let mut out = text.to_string();
        for value in &self.values {
            if out.contains(value.as_str()) {
                out = out.replace(value.as_str(), MASK);
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn masks_every_occurrence() {
        let masker = SecretMasker::new(["s3cret"]);
        assert_eq!(masker.mask("a=s3cret b=s3cret"), "a=*** b=***");
    }

    #[test]
    fn longer_values_are_masked_before_their_substrings() {
        let masker = SecretMasker::new(["abc", "abcdef"]);
        assert_eq!(masker.mask("token abcdef"), "token ***");
    }

    #[test]
    fn empty_values_are_ignored() {
        let masker = SecretMasker::new(["", "x1"]);
        assert!(!masker.contains(""));
        assert_eq!(masker.mask("plain text"), "plain text");
    }

    #[test]
    fn absorbed_values_keep_length_ordering() {
        let mut shared = SecretMasker::new(["abc"]);
        shared.absorb(SecretMasker::new(["abcdef", "zz"]));
        assert!(shared.contains("zz"));
        assert_eq!(shared.mask("abcdef abc zz"), "*** *** ***");
    }
}
