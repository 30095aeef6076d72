//! Term frequency statistics for one document

use std::collections::HashMap;

#[derive(Debug, Clone, Default, PartialEq)]
pub struct TermStats {
    pub frequencies: HashMap<String, u32>,
    pub total_terms: usize,
}

impl TermStats {
    pub fn from_terms(terms: &[String]) -> Self {
        let mut frequencies: HashMap<String, u32> = HashMap::new();
        for term in terms {
            *frequencies.entry(term.clone()).or_insert(0) += 1;
        }
        Self {
            frequencies,
            total_terms: terms.len(),
        }
    }

    pub fn unique_terms(&self) -> usize {
        self.frequencies.len()
    }

    pub fn tf(&self, term: &str) -> u32 {
        self.frequencies.get(term).copied().unwrap_or(0)
    }

    /// Log-scaled term weight, `1 + log10(tf)`, zero for absent terms
    pub fn tf_weight(&self, term: &str) -> f64 {
        match self.tf(term) {
            0 => 0.0,
            tf => 1.0 + (tf as f64).log10(),
        }
    }

    /// Most frequent terms, ties broken alphabetically
    pub fn top_terms(&self, n: usize) -> Vec<(String, u32)> {
        let mut terms: Vec<(String, u32)> = self
            .frequencies
            .iter()
            .map(|(t, c)| (t.clone(), *c))
            .collect();
        terms.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
        terms.truncate(n);
        terms
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn terms(words: &[&str]) -> Vec<String> {
        words.iter().map(|w| w.to_string()).collect()
    }

    #[test]
    fn test_counts() {
        let stats = TermStats::from_terms(&terms(&["rust", "crawl", "rust", "index", "rust"]));
        assert_eq!(stats.total_terms, 5);
        assert_eq!(stats.unique_terms(), 3);
        assert_eq!(stats.tf("rust"), 3);
        assert_eq!(stats.tf("missing"), 0);
    }

    #[test]
    fn test_tf_weight_is_log_scaled() {
        let words: Vec<String> = std::iter::repeat("rust".to_string()).take(10).collect();
        let stats = TermStats::from_terms(&words);
        assert!((stats.tf_weight("rust") - 2.0).abs() < 1e-9);
        assert_eq!(stats.tf_weight("none"), 0.0);
    }

    #[test]
    fn test_top_terms_order() {
        let stats = TermStats::from_terms(&terms(&["b", "a", "c", "c", "b"]));
        assert_eq!(
            stats.top_terms(2),
            vec![("b".to_string(), 2), ("c".to_string(), 2)]
        );
    }
}
