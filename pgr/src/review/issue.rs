//! Review issues
//!
//! Issues are the unit of currency between review agents, the validator,
//! and the fix prompt. Stable IDs are content fingerprints so the
//! validator's verdicts can be matched back to the originals.

use serde::{Deserialize, Serialize};
use tracing::debug;

/// Verdict value that drops an issue
pub const VERDICT_FALSE_POSITIVE: &str = "false_positive";

/// Verdict value that confirms an issue
pub const VERDICT_VALID: &str = "valid";

/// Issue severity, ordered most severe first
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Critical,
    High,
    Medium,
    Low,
    Info,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Critical => "critical",
            Self::High => "high",
            Self::Medium => "medium",
            Self::Low => "low",
            Self::Info => "info",
        }
    }
}

impl std::str::FromStr for Severity {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "critical" => Ok(Self::Critical),
            "high" => Ok(Self::High),
            "medium" => Ok(Self::Medium),
            "low" => Ok(Self::Low),
            "info" => Ok(Self::Info),
            other => Err(format!("unknown severity: {}", other)),
        }
    }
}

impl std::fmt::Display for Severity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// One finding reported by a review agent
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Issue {
    pub file: String,

    /// Line number; agents sometimes report a range, the first line wins
    #[serde(deserialize_with = "deserialize_line")]
    pub line: u32,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub line_end: Option<u32>,

    pub severity: Severity,

    pub category: String,

    pub description: String,

    #[serde(default)]
    pub suggestion: String,

    /// Name of the agent that reported the issue
    #[serde(default)]
    pub agent: String,

    /// Validator verdict, when one has been assigned
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub verdict: Option<String>,

    /// Stable fingerprint id
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
}

impl Issue {
    /// Content fingerprint: agent, file, normalized line, lowercased
    /// category, lowercased trimmed description
    pub fn fingerprint(&self) -> String {
        use std::hash::{Hash, Hasher};

        let mut hasher = std::collections::hash_map::DefaultHasher::new();
        self.agent.hash(&mut hasher);
        self.file.hash(&mut hasher);
        self.line.hash(&mut hasher);
        self.category.to_lowercase().hash(&mut hasher);
        self.description.trim().to_lowercase().hash(&mut hasher);
        format!("{:016x}", hasher.finish())
    }

    /// Assign the fingerprint id when none is present
    pub fn ensure_id(&mut self) {
        if self.id.is_none() {
            let id = self.fingerprint();
            debug!(file = %self.file, line = self.line, %id, "ensure_id: assigned fingerprint");
            self.id = Some(id);
        }
    }
}

/// Accept a line as an integer, a numeric string, or an "a-b" range
fn deserialize_line<'de, D>(deserializer: D) -> Result<u32, D::Error>
where
    D: serde::Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum LineRepr {
        Num(u32),
        Text(String),
    }

    match LineRepr::deserialize(deserializer)? {
        LineRepr::Num(n) => Ok(n),
        LineRepr::Text(s) => parse_line(&s).ok_or_else(|| serde::de::Error::custom(format!("invalid line: {}", s))),
    }
}

/// Parse "12" or "12-20" into the first line of the range
pub fn parse_line(value: &str) -> Option<u32> {
    value.split('-').next()?.trim().parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn issue(agent: &str, file: &str, line: u32, category: &str, description: &str) -> Issue {
        Issue {
            file: file.to_string(),
            line,
            line_end: None,
            severity: Severity::High,
            category: category.to_string(),
            description: description.to_string(),
            suggestion: String::new(),
            agent: agent.to_string(),
            verdict: None,
            id: None,
        }
    }

    #[test]
    fn test_fingerprint_stable_across_case_and_whitespace() {
        let a = issue("bugs", "src/a.rs", 10, "Logic", "  Off by one  ");
        let b = issue("bugs", "src/a.rs", 10, "logic", "off by one");
        assert_eq!(a.fingerprint(), b.fingerprint());
    }

    #[test]
    fn test_fingerprint_differs_by_agent_and_location() {
        let a = issue("bugs", "src/a.rs", 10, "logic", "off by one");
        let b = issue("security", "src/a.rs", 10, "logic", "off by one");
        let c = issue("bugs", "src/a.rs", 11, "logic", "off by one");
        assert_ne!(a.fingerprint(), b.fingerprint());
        assert_ne!(a.fingerprint(), c.fingerprint());
    }

    #[test]
    fn test_ensure_id_keeps_existing() {
        let mut a = issue("bugs", "src/a.rs", 10, "logic", "off by one");
        a.id = Some("explicit".to_string());
        a.ensure_id();
        assert_eq!(a.id.as_deref(), Some("explicit"));
    }

    #[test]
    fn test_line_accepts_int_and_range() {
        let yaml = "
file: src/a.rs
line: 12
severity: high
category: logic
description: bad
";
        let issue: Issue = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(issue.line, 12);

        let yaml_range = "
file: src/a.rs
line: \"40-52\"
severity: low
category: style
description: long function
";
        let issue: Issue = serde_yaml::from_str(yaml_range).unwrap();
        assert_eq!(issue.line, 40);
    }

    #[test]
    fn test_parse_line_variants() {
        assert_eq!(parse_line("7"), Some(7));
        assert_eq!(parse_line("7-9"), Some(7));
        assert_eq!(parse_line(" 7 - 9 "), Some(7));
        assert_eq!(parse_line("abc"), None);
    }

    #[test]
    fn test_severity_round_trip() {
        for s in ["critical", "high", "medium", "low", "info"] {
            let sev: Severity = s.parse().unwrap();
            assert_eq!(sev.as_str(), s);
        }
        assert!("urgent".parse::<Severity>().is_err());
    }

    #[test]
    fn test_severity_yaml_lowercase() {
        let sev: Severity = serde_yaml::from_str("high").unwrap();
        assert_eq!(sev, Severity::High);
        assert_eq!(serde_yaml::to_string(&Severity::Critical).unwrap().trim(), "critical");
    }
}
