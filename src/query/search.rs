//! Free-text search planning.
//!
//! A search term is matched against several fields, OR-ed together, with a
//! per-field match strategy. Each backend renders the strategies its own way:
//! LIKE patterns for relational plans, regular expressions for pipelines.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use super::descriptor::SearchSpec;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum MatchStrategy {
    Exact,
    #[default]
    Contains,
    StartsWith,
    EndsWith,
    Fuzzy,
}

impl MatchStrategy {
    pub fn name(&self) -> &'static str {
        match self {
            MatchStrategy::Exact => "exact",
            MatchStrategy::Contains => "contains",
            MatchStrategy::StartsWith => "startsWith",
            MatchStrategy::EndsWith => "endsWith",
            MatchStrategy::Fuzzy => "fuzzy",
        }
    }
}

/// Per-field match strategies; fields not listed use `contains`
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SearchConfig(BTreeMap<String, MatchStrategy>);

impl SearchConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_field(mut self, field: impl Into<String>, strategy: MatchStrategy) -> Self {
        self.0.insert(field.into(), strategy);
        self
    }

    pub fn strategy_for(&self, field: &str) -> MatchStrategy {
        self.0.get(field).copied().unwrap_or_default()
    }

    pub fn fields(&self) -> impl Iterator<Item = &String> {
        self.0.keys()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SearchMatch {
    pub field: String,
    pub strategy: MatchStrategy,
}

/// Resolved search: one term, OR-ed across fields
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SearchPlan {
    pub term: String,
    pub matches: Vec<SearchMatch>,
}

impl SearchPlan {
    /// Distinct strategy names in first-use order
    pub fn algorithms_used(&self) -> Vec<String> {
        let mut names: Vec<String> = Vec::new();
        for m in &self.matches {
            let name = m.strategy.name().to_string();
            if !names.contains(&name) {
                names.push(name);
            }
        }
        names
    }
}

/// Build the search plan; blank terms or an empty field set disable search
pub fn plan_search(spec: Option<&SearchSpec>, config: &SearchConfig) -> Option<SearchPlan> {
    let spec = spec?;
    let term = spec.term.trim();
    if term.is_empty() {
        return None;
    }

    let fields: Vec<String> = if spec.fields.is_empty() {
        config.fields().cloned().collect()
    } else {
        spec.fields.clone()
    };
    if fields.is_empty() {
        tracing::debug!("Search term '{}' ignored: no searchable fields", term);
        return None;
    }

    Some(SearchPlan {
        term: term.to_string(),
        matches: fields
            .into_iter()
            .map(|field| SearchMatch {
                strategy: config.strategy_for(&field),
                field,
            })
            .collect(),
    })
}

/// Escape LIKE metacharacters so the term matches literally
fn escape_like(term: &str) -> String {
    let mut out = String::with_capacity(term.len());
    for c in term.chars() {
        if matches!(c, '%' | '_' | '\\') {
            out.push('\\');
        }
        out.push(c);
    }
    out
}

/// LIKE pattern for a non-exact strategy (matched case-insensitively)
pub fn like_pattern(term: &str, strategy: MatchStrategy) -> String {
    let escaped = escape_like(term);
    match strategy {
        MatchStrategy::Exact => escaped,
        MatchStrategy::Contains => format!("%{}%", escaped),
        MatchStrategy::StartsWith => format!("{}%", escaped),
        MatchStrategy::EndsWith => format!("%{}", escaped),
        MatchStrategy::Fuzzy => {
            // Characters in order with anything in between
            let mut pattern = String::from("%");
            for c in term.chars().filter(|c| !c.is_whitespace()) {
                pattern.push_str(&escape_like(&c.to_string()));
                pattern.push('%');
            }
            pattern
        }
    }
}

/// Regular expression for a non-exact strategy (matched case-insensitively)
pub fn regex_pattern(term: &str, strategy: MatchStrategy) -> String {
    let escaped = regex::escape(term);
    match strategy {
        MatchStrategy::Exact => format!("^{}$", escaped),
        MatchStrategy::Contains => escaped,
        MatchStrategy::StartsWith => format!("^{}", escaped),
        MatchStrategy::EndsWith => format!("{}$", escaped),
        MatchStrategy::Fuzzy => term
            .chars()
            .filter(|c| !c.is_whitespace())
            .map(|c| regex::escape(&c.to_string()))
            .collect::<Vec<_>>()
            .join(".*"),
    }
}

/// Translate a SQL LIKE pattern (with `\` escapes) into an anchored regex
pub fn like_to_regex(pattern: &str) -> String {
    let mut out = String::from("^");
    let mut chars = pattern.chars();
    while let Some(c) = chars.next() {
        match c {
            '\\' => {
                if let Some(next) = chars.next() {
                    out.push_str(&regex::escape(&next.to_string()));
                }
            }
            '%' => out.push_str(".*"),
            '_' => out.push('.'),
            other => out.push_str(&regex::escape(&other.to_string())),
        }
    }
    out.push('$');
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_plan_uses_config_strategies() {
        let config = SearchConfig::new()
            .with_field("email", MatchStrategy::Exact)
            .with_field("name", MatchStrategy::Fuzzy);
        let spec = SearchSpec {
            term: " ada ".into(),
            fields: vec!["name".into(), "email".into(), "bio".into()],
        };

        let plan = plan_search(Some(&spec), &config).unwrap();
        assert_eq!(plan.term, "ada");
        assert_eq!(plan.matches[0].strategy, MatchStrategy::Fuzzy);
        assert_eq!(plan.matches[1].strategy, MatchStrategy::Exact);
        assert_eq!(plan.matches[2].strategy, MatchStrategy::Contains);
        assert_eq!(plan.algorithms_used(), vec!["fuzzy", "exact", "contains"]);
    }

    #[test]
    fn test_blank_term_disables_search() {
        let spec = SearchSpec {
            term: "   ".into(),
            fields: vec!["name".into()],
        };
        assert!(plan_search(Some(&spec), &SearchConfig::new()).is_none());
        assert!(plan_search(None, &SearchConfig::new()).is_none());
    }

    #[test]
    fn test_like_patterns() {
        assert_eq!(like_pattern("ab", MatchStrategy::Contains), "%ab%");
        assert_eq!(like_pattern("ab", MatchStrategy::StartsWith), "ab%");
        assert_eq!(like_pattern("ab", MatchStrategy::EndsWith), "%ab");
        assert_eq!(like_pattern("ab", MatchStrategy::Fuzzy), "%a%b%");
        assert_eq!(like_pattern("50%", MatchStrategy::Contains), "%50\\%%");
    }

    #[test]
    fn test_like_to_regex_respects_escapes() {
        let re = regex::Regex::new(&like_to_regex("%50\\%%")).unwrap();
        assert!(re.is_match("save 50% now"));
        assert!(!re.is_match("save 500 now"));

        let re = regex::Regex::new(&like_to_regex("a_c")).unwrap();
        assert!(re.is_match("abc"));
        assert!(!re.is_match("abbc"));
    }

    #[test]
    fn test_fuzzy_regex() {
        let re = regex::Regex::new(&format!("(?i){}", regex_pattern("adl", MatchStrategy::Fuzzy))).unwrap();
        assert!(re.is_match("Ada Lovelace"));
        assert!(!re.is_match("Grace"));
    }
}
