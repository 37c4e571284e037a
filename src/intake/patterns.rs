//! Known abuse signatures matched against inbound message text.

use std::sync::Arc;

use once_cell::sync::Lazy;
use regex::{Regex, RegexBuilder};

pub const MARKUP_INJECTION: &str = "Potential XSS attempt";
pub const SQL_INJECTION: &str = "Potential SQL injection";
pub const CODE_EXECUTION: &str = "Potential code execution attempt";
pub const PATH_TRAVERSAL: &str = "Potential path traversal";
pub const SENSITIVE_FILE: &str = "Sensitive file path reference";

/// `(pattern, description, case_insensitive)`, evaluated in this order.
const BUILTIN: &[(&str, &str, bool)] = &[
    (r"<\s*script", MARKUP_INJECTION, true),
    (r"javascript\s*:", MARKUP_INJECTION, true),
    (r"\bon(?:error|load|click|mouseover)\s*=", MARKUP_INJECTION, true),
    (r"\bunion\s+(?:all\s+)?select\b", SQL_INJECTION, true),
    (r"\b(?:drop|truncate)\s+table\b", SQL_INJECTION, true),
    (r"'\s*or\s+'?1'?\s*=\s*'?1", SQL_INJECTION, true),
    (r";\s*--", SQL_INJECTION, false),
    (r"\b(?:eval|exec)\s*\(", CODE_EXECUTION, true),
    (r"__import__|os\.system|subprocess\.", CODE_EXECUTION, false),
    (r"\.\./|\.\.\\", PATH_TRAVERSAL, false),
    (r"/etc/(?:passwd|shadow)", SENSITIVE_FILE, false),
    (r"(?:^|[\s/\\])\.env\b|\bid_rsa\b", SENSITIVE_FILE, false),
];

struct Signature {
    regex: Regex,
    description: &'static str,
}

static BUILTIN_SIGNATURES: Lazy<Arc<Vec<Signature>>> = Lazy::new(|| {
    Arc::new(
        BUILTIN
            .iter()
            .map(|&(pattern, description, ci)| Signature {
                regex: RegexBuilder::new(pattern)
                    .case_insensitive(ci)
                    .build()
                    .unwrap(),
                description,
            })
            .collect(),
    )
});

/// Stateless classifier; clones share the compiled signature list.
#[derive(Clone)]
pub struct PatternDetector {
    signatures: Arc<Vec<Signature>>,
}

impl Default for PatternDetector {
    fn default() -> Self {
        Self {
            signatures: BUILTIN_SIGNATURES.clone(),
        }
    }
}

impl PatternDetector {
    /// Build a detector from custom `(pattern, description, case_insensitive)`
    /// triples, keeping their order.
    pub fn with_signatures(
        signatures: &[(&str, &'static str, bool)],
    ) -> Result<Self, regex::Error> {
        let compiled = signatures
            .iter()
            .map(|&(pattern, description, ci)| {
                RegexBuilder::new(pattern)
                    .case_insensitive(ci)
                    .build()
                    .map(|regex| Signature { regex, description })
            })
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self {
            signatures: Arc::new(compiled),
        })
    }

    /// Description of the first signature that matches, in declared order.
    pub fn detect(&self, text: &str) -> Option<&'static str> {
        if text.is_empty() {
            return None;
        }
        self.signatures
            .iter()
            .find(|sig| sig.regex.is_match(text))
            .map(|sig| sig.description)
    }

    pub fn len(&self) -> usize {
        self.signatures.len()
    }

    pub fn is_empty(&self) -> bool {
        self.signatures.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builtin_signatures_compile() {
        assert_eq!(PatternDetector::default().len(), BUILTIN.len());
    }

    #[test]
    fn script_tag_detected_in_any_case() {
        let d = PatternDetector::default();
        assert_eq!(d.detect("hi <script>alert(1)</script>"), Some(MARKUP_INJECTION));
        assert_eq!(d.detect("HELLO <SCRIPT src=x>"), Some(MARKUP_INJECTION));
        assert_eq!(d.detect("Hello <ScRiPt"), Some(MARKUP_INJECTION));
    }

    #[test]
    fn benign_text_passes() {
        let d = PatternDetector::default();
        assert_eq!(d.detect("hello world"), None);
        assert_eq!(d.detect(""), None);
        assert_eq!(d.detect("What time does the pool open? I'll be there at 7."), None);
        assert_eq!(d.detect("Can I select a room with a union jack flag?"), None);
    }

    #[test]
    fn each_category_is_recognised() {
        let d = PatternDetector::default();
        assert_eq!(d.detect("1 UNION SELECT password FROM users"), Some(SQL_INJECTION));
        assert_eq!(d.detect("admin' or '1'='1"), Some(SQL_INJECTION));
        assert_eq!(d.detect("please eval(payload)"), Some(CODE_EXECUTION));
        assert_eq!(d.detect("__import__('os')"), Some(CODE_EXECUTION));
        assert_eq!(d.detect("open ../../secret"), Some(PATH_TRAVERSAL));
        assert_eq!(d.detect("cat /etc/passwd"), Some(SENSITIVE_FILE));
        assert_eq!(d.detect("show me your .env file"), Some(SENSITIVE_FILE));
    }

    #[test]
    fn first_match_wins() {
        let d = PatternDetector::default();
        // Both a traversal and a sensitive path; traversal is declared first.
        assert_eq!(d.detect("../../etc/passwd"), Some(PATH_TRAVERSAL));
        // Markup is declared before code execution.
        assert_eq!(d.detect("<script>eval(x)</script>"), Some(MARKUP_INJECTION));
    }

    #[test]
    fn case_sensitivity_is_per_signature() {
        let d = PatternDetector::default();
        assert_eq!(d.detect("/ETC/PASSWD"), None);
        let custom =
            PatternDetector::with_signatures(&[("secret", "word", false), ("TOKEN", "token", true)])
                .unwrap();
        assert_eq!(custom.detect("SECRET"), None);
        assert_eq!(custom.detect("a token here"), Some("token"));
    }

    #[test]
    fn invalid_custom_pattern_is_error() {
        assert!(PatternDetector::with_signatures(&[("(", "broken", false)]).is_err());
    }
}
