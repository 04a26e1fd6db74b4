//! Keyword classification of questions, English and Portuguese.
//!
//! Runs before any I/O. Precedence is correlation, then anomaly, then
//! descriptive; anything else is open-ended.

use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QuestionKind {
    Descriptive,
    Correlation,
    Anomaly,
    OpenEnded,
}

impl QuestionKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Descriptive => "descriptive",
            Self::Correlation => "correlation",
            Self::Anomaly => "anomaly",
            Self::OpenEnded => "open_ended",
        }
    }
}

impl fmt::Display for QuestionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

struct Keywords {
    /// Whole-token matches.
    exact: &'static [&'static str],
    /// Token-prefix matches.
    stems: &'static [&'static str],
}

impl Keywords {
    fn matches(&self, token: &str) -> bool {
        self.exact.contains(&token) || self.stems.iter().any(|s| token.starts_with(s))
    }
}

const CORRELATION: Keywords = Keywords {
    exact: &["r", "pearson"],
    stems: &[
        "correl",
        "relationship",
        "relação",
        "relacao",
        "relacion",
        "associa",
        "covarian",
        "covariân",
    ],
};

const ANOMALY: Keywords = Keywords {
    exact: &["odd", "weird"],
    stems: &[
        "outlier",
        "anomal",
        "atípic",
        "atipic",
        "unusual",
        "extrem",
        "discrepan",
    ],
};

const DESCRIPTIVE: Keywords = Keywords {
    exact: &[
        "mean", "means", "média", "media", "médias", "medias", "avg", "min", "max", "std", "sum",
        "count", "median", "mediana", "moda", "mode", "iqr",
    ],
    stems: &[
        "average",
        "statistic",
        "estatístic",
        "estatistic",
        "distribut",
        "distribui",
        "variance",
        "variância",
        "variancia",
        "deviation",
        "desvio",
        "minimum",
        "máximo",
        "maximo",
        "mínimo",
        "minimo",
        "maximum",
        "quartil",
        "quartile",
        "percentil",
        "histogram",
        "frequen",
        "frequên",
        "contagem",
        "summar",
        "resumo",
        "descri",
        "skew",
        "kurtosis",
        "curtose",
        "assimetria",
        "categor",
        "missing",
        "nulos",
        "null",
        "ausente",
    ],
};

fn tokens(question: &str) -> impl Iterator<Item = String> + '_ {
    question
        .split(|c: char| !c.is_alphanumeric())
        .filter(|t| !t.is_empty())
        .map(str::to_lowercase)
}

pub fn classify(question: &str) -> QuestionKind {
    let words: Vec<String> = tokens(question).collect();
    let any = |kw: &Keywords| words.iter().any(|w| kw.matches(w));

    if any(&CORRELATION) {
        QuestionKind::Correlation
    } else if any(&ANOMALY) {
        QuestionKind::Anomaly
    } else if any(&DESCRIPTIVE) {
        QuestionKind::Descriptive
    } else {
        QuestionKind::OpenEnded
    }
}

fn is_word_char(c: char) -> bool {
    c.is_alphanumeric() || c == '_'
}

/// Column names that appear in the question as whole words, case-insensitive,
/// in the order given.
pub fn mentioned_columns<'a>(
    question: &str,
    columns: impl IntoIterator<Item = &'a str>,
) -> Vec<String> {
    let haystack = question.to_lowercase();
    columns
        .into_iter()
        .filter(|name| {
            let needle = name.trim().to_lowercase();
            if needle.is_empty() {
                return false;
            }
            haystack.match_indices(&needle).any(|(at, m)| {
                let before = haystack[..at].chars().next_back();
                let after = haystack[at + m.len()..].chars().next();
                !before.is_some_and(is_word_char) && !after.is_some_and(is_word_char)
            })
        })
        .map(str::to_owned)
        .collect()
}
