use std::collections::HashSet;
use std::path::Path;

use common::error::AppError;
use unicode_normalization::{char::is_combining_mark, UnicodeNormalization};

/// Built-in stopword resource, French-leaning with the common English words
/// mixed in. A deployment can replace it via `stopwords_path`.
const BUILT_IN_STOPWORDS: &str = "le la les un une des du de d l au aux et ou mais donc or ni car \
    ce cet cette ces mon ton son ma ta sa mes tes ses notre votre leur nos vos leurs \
    je tu il elle on nous vous ils elles me te se en y ne pas plus moins tres peu \
    qui que quoi dont est sont etre avoir fait faire pour par avec sans sous sur dans \
    entre vers chez si comme quand lequel laquelle lesquels lesquelles quel quelle quels quelles \
    the a an and or but not of in on at to for from with without is are was were be been \
    this that these those it its they them their there here what which who whom how when where why";

#[derive(Debug, Clone)]
pub struct Stopwords {
    words: HashSet<String>,
}

impl Stopwords {
    pub fn built_in() -> Self {
        Self {
            words: BUILT_IN_STOPWORDS
                .split_whitespace()
                .map(str::to_string)
                .collect(),
        }
    }

    /// Loads one word per line; `#` starts a comment.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, AppError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|e| {
            AppError::InvalidArgument(format!("stopword file {} unreadable: {e}", path.display()))
        })?;
        let words = raw
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty() && !line.starts_with('#'))
            .map(|line| line.to_lowercase())
            .collect();
        Ok(Self { words })
    }

    pub fn from_config(path: Option<&str>) -> Result<Self, AppError> {
        match path {
            Some(path) => Self::from_file(path),
            None => Ok(Self::built_in()),
        }
    }

    pub fn contains(&self, word: &str) -> bool {
        self.words.contains(word)
    }
}

impl Default for Stopwords {
    fn default() -> Self {
        Self::built_in()
    }
}

/// A query token in both its raw (lowercased) and accent-folded form.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueryToken {
    pub raw: String,
    pub folded: String,
}

/// NFKD-normalises, strips combining marks, lowercases.
pub fn fold(text: &str) -> String {
    text.nfkd()
        .filter(|c| !is_combining_mark(*c))
        .collect::<String>()
        .to_lowercase()
}

/// Splits a free-text query into alphabetic word runs, drops stopwords and
/// tokens shorter than two characters.
pub fn tokenize(query: &str, stopwords: &Stopwords) -> Vec<QueryToken> {
    let mut tokens = Vec::new();
    let mut seen = HashSet::new();

    for run in query.split(|c: char| !c.is_alphabetic()) {
        if run.is_empty() {
            continue;
        }
        let raw = run.to_lowercase();
        if raw.chars().count() < 2 {
            continue;
        }
        let folded = fold(&raw);
        if stopwords.contains(&raw) || stopwords.contains(&folded) {
            continue;
        }
        if !seen.insert(folded.clone()) {
            continue;
        }
        tokens.push(QueryToken { raw, folded });
    }

    tokens
}
