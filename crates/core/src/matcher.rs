use std::collections::BTreeMap;

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Fieldless tag for a matcher variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MatcherKind {
    Regex,
    ParseFormat,
    NluIntent,
    Mention,
    Crontab,
    Webhook,
    Always,
    Catchall,
}

/// How a text expression is applied to the message text. `Match` anchors at
/// the start, `Search` scans anywhere, `FullMatch` anchors both ends.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum MatchCondition {
    Match,
    #[default]
    Search,
    FullMatch,
}

fn default_case_sensitive() -> bool {
    true
}

fn default_score_factor() -> f64 {
    0.6
}

/// A matcher is a pure descriptor attached to a skill; evaluation lives in
/// the dispatcher (text matchers), the scheduler (crontab) and the web
/// surface (webhook).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Matcher {
    Regex {
        expression: String,
        #[serde(default = "default_case_sensitive")]
        case_sensitive: bool,
        #[serde(default)]
        condition: MatchCondition,
        #[serde(default = "default_score_factor")]
        score_factor: f64,
    },
    ParseFormat {
        template: String,
        #[serde(default = "default_case_sensitive")]
        case_sensitive: bool,
        #[serde(default)]
        condition: MatchCondition,
    },
    NluIntent {
        parser: String,
        intent: String,
    },
    Mention {
        user_ref: String,
    },
    Crontab {
        expression: String,
        #[serde(default)]
        timezone: Option<String>,
    },
    Webhook {
        name: String,
    },
    Always,
    Catchall {
        #[serde(default)]
        messages_only: bool,
    },
}

impl Matcher {
    pub fn regex(expression: &str) -> Self {
        Matcher::Regex {
            expression: expression.to_string(),
            case_sensitive: default_case_sensitive(),
            condition: MatchCondition::default(),
            score_factor: default_score_factor(),
        }
    }

    pub fn regex_with(
        expression: &str,
        case_sensitive: bool,
        condition: MatchCondition,
        score_factor: f64,
    ) -> Self {
        Matcher::Regex {
            expression: expression.to_string(),
            case_sensitive,
            condition,
            score_factor,
        }
    }

    pub fn parse_format(template: &str) -> Self {
        Matcher::ParseFormat {
            template: template.to_string(),
            case_sensitive: default_case_sensitive(),
            condition: MatchCondition::default(),
        }
    }

    pub fn parse_format_with(template: &str, case_sensitive: bool, condition: MatchCondition) -> Self {
        Matcher::ParseFormat {
            template: template.to_string(),
            case_sensitive,
            condition,
        }
    }

    pub fn nlu_intent(parser: &str, intent: &str) -> Self {
        Matcher::NluIntent {
            parser: parser.to_string(),
            intent: intent.to_string(),
        }
    }

    pub fn mention(user_ref: &str) -> Self {
        Matcher::Mention { user_ref: user_ref.to_string() }
    }

    pub fn crontab(expression: &str) -> Self {
        Matcher::Crontab { expression: expression.to_string(), timezone: None }
    }

    pub fn crontab_in(expression: &str, timezone: &str) -> Self {
        Matcher::Crontab {
            expression: expression.to_string(),
            timezone: Some(timezone.to_string()),
        }
    }

    pub fn webhook(name: &str) -> Self {
        Matcher::Webhook { name: name.to_string() }
    }

    pub fn always() -> Self {
        Matcher::Always
    }

    pub fn catchall() -> Self {
        Matcher::Catchall { messages_only: false }
    }

    pub fn catchall_messages_only() -> Self {
        Matcher::Catchall { messages_only: true }
    }

    pub fn kind(&self) -> MatcherKind {
        match self {
            Matcher::Regex { .. } => MatcherKind::Regex,
            Matcher::ParseFormat { .. } => MatcherKind::ParseFormat,
            Matcher::NluIntent { .. } => MatcherKind::NluIntent,
            Matcher::Mention { .. } => MatcherKind::Mention,
            Matcher::Crontab { .. } => MatcherKind::Crontab,
            Matcher::Webhook { .. } => MatcherKind::Webhook,
            Matcher::Always => MatcherKind::Always,
            Matcher::Catchall { .. } => MatcherKind::Catchall,
        }
    }

    /// Score a successful local text match. Longer expressions converge
    /// asymptotically to `score_factor`; None for non-text matchers.
    pub fn local_score(&self) -> Option<f64> {
        match self {
            Matcher::Regex { expression, score_factor, .. } => {
                Some(expression_score(expression.chars().count(), *score_factor))
            }
            Matcher::ParseFormat { template, .. } => {
                Some(expression_score(template.chars().count(), 1.0))
            }
            Matcher::Mention { user_ref } => {
                Some(expression_score(user_ref.chars().count(), 1.0))
            }
            _ => None,
        }
    }

    /// Evaluate a local text matcher against message text. `Ok(None)` is a
    /// clean non-match; `Err` is an evaluation failure (bad expression) the
    /// dispatcher logs and treats as non-matching.
    pub fn match_text(&self, text: &str) -> Result<Option<TextMatch>> {
        match self {
            Matcher::Regex { expression, case_sensitive, condition, .. } => {
                match_regex(expression, *case_sensitive, *condition, text)
            }
            Matcher::ParseFormat { template, case_sensitive, condition } => {
                let pattern = template_to_pattern(template)?;
                match_regex(&pattern, *case_sensitive, *condition, text)
            }
            Matcher::Mention { user_ref } => Ok(match_mention(user_ref, text)),
            _ => Ok(None),
        }
    }
}

/// Extracted annotations from a successful local match.
#[derive(Debug, Clone, Default)]
pub struct TextMatch {
    pub entities: BTreeMap<String, serde_json::Value>,
}

/// `(1 - 1/(len+1)^2) * factor`, bounded in [0, factor].
pub fn expression_score(expression_len: usize, score_factor: f64) -> f64 {
    let n = (expression_len + 1) as f64;
    (1.0 - 1.0 / (n * n)) * score_factor
}

fn match_regex(
    expression: &str,
    case_sensitive: bool,
    condition: MatchCondition,
    text: &str,
) -> Result<Option<TextMatch>> {
    let mut pattern = String::new();
    if !case_sensitive {
        pattern.push_str("(?i)");
    }
    match condition {
        MatchCondition::Match => {
            pattern.push_str("^(?:");
            pattern.push_str(expression);
            pattern.push(')');
        }
        MatchCondition::Search => pattern.push_str(expression),
        MatchCondition::FullMatch => {
            pattern.push_str("^(?:");
            pattern.push_str(expression);
            pattern.push_str(")$");
        }
    }

    let regex = Regex::new(&pattern)
        .map_err(|e| Error::Internal(format!("invalid match expression {:?}: {}", expression, e)))?;

    let caps = match regex.captures(text) {
        Some(caps) => caps,
        None => return Ok(None),
    };

    let mut hit = TextMatch::default();
    for name in regex.capture_names().flatten() {
        if let Some(m) = caps.name(name) {
            hit.entities
                .insert(name.to_string(), serde_json::Value::String(m.as_str().to_string()));
        }
    }
    Ok(Some(hit))
}

static TEMPLATE_FIELD: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\{([a-zA-Z_][a-zA-Z0-9_]*)?(?::([dw]))?\}").unwrap());

/// Compile a `"say {text}"` style template into a regex pattern. Literal
/// parts are escaped; fields become capture groups. A field in the final
/// position is greedy so it runs to the end of the text; inner fields stay
/// lazy and stop at the next literal.
fn template_to_pattern(template: &str) -> Result<String> {
    let mut pattern = String::new();
    let mut last = 0;
    let matches: Vec<_> = TEMPLATE_FIELD.captures_iter(template).collect();
    for (i, caps) in matches.iter().enumerate() {
        let whole = caps.get(0).ok_or_else(|| Error::Internal("empty template field".into()))?;
        pattern.push_str(&regex::escape(&template[last..whole.start()]));
        let body = match caps.get(2).map(|m| m.as_str()) {
            Some("d") => r"\d+".to_string(),
            Some("w") => r"\w+".to_string(),
            _ => {
                let trailing = i == matches.len() - 1 && whole.end() == template.len();
                if trailing { ".+".to_string() } else { ".+?".to_string() }
            }
        };
        match caps.get(1) {
            Some(name) => {
                pattern.push_str("(?P<");
                pattern.push_str(name.as_str());
                pattern.push('>');
                pattern.push_str(&body);
                pattern.push(')');
            }
            None => {
                pattern.push('(');
                pattern.push_str(&body);
                pattern.push(')');
            }
        }
        last = whole.end();
    }
    pattern.push_str(&regex::escape(&template[last..]));
    Ok(pattern)
}

fn match_mention(user_ref: &str, text: &str) -> Option<TextMatch> {
    if user_ref.is_empty() {
        return None;
    }
    let pattern = format!(r"(?i)(?:^|\s)@?{}\b", regex::escape(user_ref));
    let regex = match Regex::new(&pattern) {
        Ok(r) => r,
        Err(_) => return None,
    };
    if regex.is_match(text) {
        let mut hit = TextMatch::default();
        hit.entities
            .insert("mention".to_string(), serde_json::Value::String(user_ref.to_string()));
        Some(hit)
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn score_formula_boundaries() {
        assert!((expression_score(1, 1.0) - 0.75).abs() < 1e-9);
        assert!((expression_score(9, 1.0) - 0.99).abs() < 1e-9);
        // Converges towards the factor, never reaches it.
        assert!(expression_score(1000, 0.6) < 0.6);
        assert!(expression_score(1000, 0.6) > 0.599);
    }

    #[test]
    fn regex_case_insensitive_search() {
        let m = Matcher::regex_with("hello", false, MatchCondition::Search, 1.0);
        assert!(m.match_text("Hello world").unwrap().is_some());
        assert!(m.match_text("say HELLO!").unwrap().is_some());
        assert!(m.match_text("goodbye").unwrap().is_none());
    }

    #[test]
    fn regex_conditions() {
        let anchored = Matcher::regex_with("hi", true, MatchCondition::Match, 1.0);
        assert!(anchored.match_text("hi there").unwrap().is_some());
        assert!(anchored.match_text("oh hi").unwrap().is_none());

        let full = Matcher::regex_with("hi", true, MatchCondition::FullMatch, 1.0);
        assert!(full.match_text("hi").unwrap().is_some());
        assert!(full.match_text("hi there").unwrap().is_none());
    }

    #[test]
    fn regex_named_groups_become_entities() {
        let m = Matcher::regex(r"remember (?P<thing>.*)");
        let hit = m.match_text("remember the milk").unwrap().unwrap();
        assert_eq!(hit.entities.get("thing"), Some(&serde_json::json!("the milk")));
    }

    #[test]
    fn invalid_expression_is_an_error_not_a_panic() {
        let m = Matcher::regex("((");
        assert!(m.match_text("anything").is_err());
    }

    #[test]
    fn format_template_fields() {
        let m = Matcher::parse_format("say {text}");
        let hit = m.match_text("say hello world").unwrap().unwrap();
        assert_eq!(hit.entities.get("text"), Some(&serde_json::json!("hello world")));

        let m = Matcher::parse_format("{a} plus {b} equals");
        let hit = m.match_text("2 plus 3 equals").unwrap().unwrap();
        assert_eq!(hit.entities.get("a"), Some(&serde_json::json!("2")));
        assert_eq!(hit.entities.get("b"), Some(&serde_json::json!("3")));
    }

    #[test]
    fn format_typed_field() {
        let m = Matcher::parse_format_with("wait {secs:d} seconds", true, MatchCondition::Search);
        let hit = m.match_text("wait 15 seconds").unwrap().unwrap();
        assert_eq!(hit.entities.get("secs"), Some(&serde_json::json!("15")));
        assert!(m.match_text("wait some seconds").unwrap().is_none());
    }

    #[test]
    fn format_literal_parts_are_escaped() {
        let m = Matcher::parse_format("price (usd): {amount}");
        assert!(m.match_text("price (usd): 10").unwrap().is_some());
        assert!(m.match_text("price usd: 10").unwrap().is_none());
    }

    #[test]
    fn mention_matches_handle() {
        let m = Matcher::mention("courier");
        assert!(m.match_text("@courier what time is it").unwrap().is_some());
        assert!(m.match_text("hey Courier do things").unwrap().is_some());
        assert!(m.match_text("@courierbot hi").unwrap().is_none());
    }

    #[test]
    fn matcher_deserializes_with_defaults() {
        let m: Matcher = serde_json::from_value(serde_json::json!({
            "type": "regex",
            "expression": "hello"
        }))
        .unwrap();
        match m {
            Matcher::Regex { case_sensitive, condition, score_factor, .. } => {
                assert!(case_sensitive);
                assert_eq!(condition, MatchCondition::Search);
                assert!((score_factor - 0.6).abs() < 1e-9);
            }
            _ => panic!("expected regex matcher"),
        }
    }
}
