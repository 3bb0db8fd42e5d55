//! Static validation of generated code before it reaches the sandbox.
//!
//! The sandbox already blocks network and filesystem escape at the runtime
//! level; these checks catch obviously hostile or broken code earlier and
//! produce a readable error instead of a runtime failure.

use once_cell::sync::Lazy;
use regex::Regex;

use crate::types::Language;

struct Rule {
    pattern: Regex,
    name: &'static str,
}

fn rule(pattern: &str, name: &'static str) -> Rule {
    Rule {
        // Patterns are literals we control; a bad one is a programmer error
        // caught by the rule-table test below.
        pattern: Regex::new(pattern).unwrap_or_else(|e| panic!("invalid rule {name}: {e}")),
        name,
    }
}

static PYTHON_RULES: Lazy<Vec<Rule>> = Lazy::new(|| {
    vec![
        rule(r"\bos\.system\s*\(", "os.system call"),
        rule(r"\bsubprocess\b", "subprocess usage"),
        rule(r"\beval\s*\(", "eval call"),
        rule(r"\bexec\s*\(", "exec call"),
        rule(r"__import__\s*\(", "dynamic import"),
        rule(r"\bimport\s+socket\b", "socket import"),
        rule(r"\bimport\s+(requests|urllib|httpx)\b", "network client import"),
        rule(r"\bshutil\.rmtree\s*\(", "recursive delete"),
        rule(r#"open\s*\(\s*['"]/(etc|proc|sys)"#, "system path access"),
    ]
});

static R_RULES: Lazy<Vec<Rule>> = Lazy::new(|| {
    vec![
        rule(r"\bsystem\s*\(", "system call"),
        rule(r"\bsystem2\s*\(", "system call"),
        rule(r"\bunlink\s*\(", "file deletion"),
        rule(r"\bfile\.remove\s*\(", "file deletion"),
        rule(r"\bdownload\.file\s*\(", "network download"),
        rule(r"\burl\s*\(", "network connection"),
    ]
});

static SQL_RULES: Lazy<Vec<Rule>> = Lazy::new(|| {
    vec![
        rule(r"(?i)\bdrop\s+(table|database|schema|index)\b", "DROP statement"),
        rule(r"(?i)\bdelete\s+from\b", "DELETE statement"),
        rule(r"(?i)\bupdate\s+\w+\s+set\b", "UPDATE statement"),
        rule(r"(?i)\binsert\s+into\b", "INSERT statement"),
        rule(r"(?i)\balter\s+(table|database|schema)\b", "ALTER statement"),
        rule(r"(?i)\btruncate\s+table\b", "TRUNCATE statement"),
        rule(r"(?i)\bgrant\b", "GRANT statement"),
        rule(r"(?i)\brevoke\b", "REVOKE statement"),
    ]
});

/// Validates generated code against the per-language rule tables.
#[derive(Debug, Clone, Copy, Default)]
pub struct CodeValidator;

impl CodeValidator {
    pub fn new() -> Self {
        Self
    }

    /// Returns the names of every violated rule; empty means the code may
    /// run.
    pub fn validate(&self, code: &str, language: Language) -> Result<(), Vec<String>> {
        let mut violations = Vec::new();

        if code.trim().is_empty() {
            violations.push("empty code".to_string());
            return Err(violations);
        }

        let rules: &[Rule] = match language {
            Language::Python => &PYTHON_RULES,
            Language::R => &R_RULES,
            Language::Sql => &SQL_RULES,
        };

        for rule in rules {
            if rule.pattern.is_match(code) {
                violations.push(rule.name.to_string());
            }
        }

        if !balanced(code, '(', ')') {
            violations.push("unbalanced parentheses".to_string());
        }

        if violations.is_empty() {
            Ok(())
        } else {
            Err(violations)
        }
    }
}

fn balanced(code: &str, open: char, close: char) -> bool {
    let mut depth: i64 = 0;
    for c in code.chars() {
        if c == open {
            depth += 1;
        } else if c == close {
            depth -= 1;
            if depth < 0 {
                return false;
            }
        }
    }
    depth == 0
}
