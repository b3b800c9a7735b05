//! Query and document tokenization for the text index.
//!
//! Tokenization sits behind the [`Tokenizer`] trait so a different language
//! profile can be swapped in without touching ranking.

/// Query tokens shorter than this are matched exactly instead of by prefix.
const MIN_PREFIX_LEN: usize = 2;

const STOP_WORDS: &[&str] = &[
    // italian
    "il", "lo", "la", "i", "gli", "le", "un", "uno", "una", "di", "da", "in", "con", "su", "per",
    "tra", "fra", "e", "ed", "o", "del", "dello", "della", "dei", "degli", "delle", "al", "allo",
    "alla", "ai", "agli", "alle", "nel", "nella", "nei", "che", "non",
    // english
    "a", "an", "the", "of", "and", "or", "with", "on", "for", "to", "from", "by", "at", "is",
];

/// A single term of a parsed query.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QueryTerm {
    Exact(String),
    Prefix(String),
}

impl QueryTerm {
    pub fn text(&self) -> &str {
        match self {
            QueryTerm::Exact(t) | QueryTerm::Prefix(t) => t,
        }
    }
}

pub trait Tokenizer: Send + Sync {
    /// Split text into normalized tokens. Used for both documents and queries.
    fn tokenize(&self, text: &str) -> Vec<String>;

    fn is_stop_word(&self, _token: &str) -> bool {
        false
    }

    /// Parse a user query into match terms.
    ///
    /// Stop words are dropped unless the query consists of a single token.
    fn query_terms(&self, query: &str) -> Vec<QueryTerm> {
        let tokens = self.tokenize(query);
        let single = tokens.len() == 1;

        let mut terms: Vec<QueryTerm> = Vec::with_capacity(tokens.len());
        for token in tokens {
            if !single && self.is_stop_word(&token) {
                continue;
            }

            let term = if token.chars().count() < MIN_PREFIX_LEN {
                QueryTerm::Exact(token)
            } else {
                QueryTerm::Prefix(token)
            };

            if !terms.contains(&term) {
                terms.push(term);
            }
        }

        terms
    }
}

/// Lowercases, turns every non-alphanumeric character into a separator and
/// splits on whitespace. Italian and English stop words.
#[derive(Debug, Default, Clone)]
pub struct DefaultTokenizer;

impl Tokenizer for DefaultTokenizer {
    fn tokenize(&self, text: &str) -> Vec<String> {
        text.to_lowercase()
            .chars()
            .map(|c| if c.is_alphanumeric() { c } else { ' ' })
            .collect::<String>()
            .split_whitespace()
            .map(str::to_string)
            .collect()
    }

    fn is_stop_word(&self, token: &str) -> bool {
        STOP_WORDS.contains(&token)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tokenize_basic() {
        let tokens = DefaultTokenizer.tokenize("Pane integrale");
        assert_eq!(tokens, vec!["pane", "integrale"]);
    }

    #[test]
    fn test_tokenize_handles_punctuation() {
        let tokens = DefaultTokenizer.tokenize("pomodoro, basilico/olio (extra-vergine)");
        assert_eq!(
            tokens,
            vec!["pomodoro", "basilico", "olio", "extra", "vergine"]
        );
    }

    #[test]
    fn test_tokenize_keeps_accents() {
        let tokens = DefaultTokenizer.tokenize("Caffè Crème");
        assert_eq!(tokens, vec!["caffè", "crème"]);
    }

    #[test]
    fn test_query_terms_prefix_and_exact() {
        let terms = DefaultTokenizer.query_terms("appl x");
        assert_eq!(
            terms,
            vec![
                QueryTerm::Prefix("appl".to_string()),
                QueryTerm::Exact("x".to_string())
            ]
        );
    }

    #[test]
    fn test_query_terms_filters_stop_words() {
        let terms = DefaultTokenizer.query_terms("pasta con le sarde");
        assert_eq!(
            terms,
            vec![
                QueryTerm::Prefix("pasta".to_string()),
                QueryTerm::Prefix("sarde".to_string())
            ]
        );
    }

    #[test]
    fn test_single_stop_word_is_kept() {
        let terms = DefaultTokenizer.query_terms("the");
        assert_eq!(terms, vec![QueryTerm::Prefix("the".to_string())]);
    }

    #[test]
    fn test_only_stop_words_yields_nothing() {
        assert!(DefaultTokenizer.query_terms("di la").is_empty());
        assert!(DefaultTokenizer.query_terms("  ?! ").is_empty());
    }

    #[test]
    fn test_duplicate_terms_collapse() {
        let terms = DefaultTokenizer.query_terms("mela MELA");
        assert_eq!(terms.len(), 1);
    }
}
