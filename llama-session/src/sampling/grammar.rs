//! GBNF grammar files.
//!
//! Grammars are parsed into named rules and checked for structural problems
//! (no `root`, references to undefined rules, unterminated literals). The
//! parsed grammar travels with the sampling chain; constraining candidates to
//! it is left to the engine binding.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

use tracing::debug;

use crate::error::SessionError;

pub const ROOT_RULE: &str = "root";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GrammarRule {
    pub name: String,
    pub body: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Grammar {
    source: Option<PathBuf>,
    rules: Vec<GrammarRule>,
}

impl Grammar {
    pub fn from_file(path: &Path) -> Result<Self, SessionError> {
        let text = std::fs::read_to_string(path).map_err(|e| SessionError::Grammar {
            path: path.to_path_buf(),
            message: e.to_string(),
        })?;
        let mut grammar = Self::parse(&text).map_err(|message| SessionError::Grammar {
            path: path.to_path_buf(),
            message,
        })?;
        grammar.source = Some(path.to_path_buf());
        debug!("Loaded grammar {} with {} rules", path.display(), grammar.rules.len());
        Ok(grammar)
    }

    pub fn parse(text: &str) -> Result<Self, String> {
        let mut rules: Vec<GrammarRule> = Vec::new();

        for (line_no, raw) in text.lines().enumerate() {
            let line = strip_comment(raw);
            let line = line.trim();
            if line.is_empty() {
                continue;
            }

            match line.split_once("::=") {
                Some((name, body)) => {
                    let name = name.trim();
                    if !is_rule_name(name) {
                        return Err(format!("line {}: invalid rule name '{}'", line_no + 1, name));
                    }
                    if rules.iter().any(|r| r.name == name) {
                        return Err(format!("line {}: rule '{}' defined twice", line_no + 1, name));
                    }
                    rules.push(GrammarRule {
                        name: name.to_string(),
                        body: body.trim().to_string(),
                    });
                }
                None => match rules.last_mut() {
                    Some(rule) => {
                        if !rule.body.is_empty() {
                            rule.body.push(' ');
                        }
                        rule.body.push_str(line);
                    }
                    None => {
                        return Err(format!("line {}: expected '<name> ::= ...'", line_no + 1));
                    }
                },
            }
        }

        if rules.is_empty() {
            return Err("grammar defines no rules".to_string());
        }

        let defined: BTreeSet<&str> = rules.iter().map(|r| r.name.as_str()).collect();
        if !defined.contains(ROOT_RULE) {
            return Err(format!("grammar does not define a '{}' rule", ROOT_RULE));
        }

        for rule in &rules {
            if rule.body.is_empty() {
                return Err(format!("rule '{}' has an empty body", rule.name));
            }
            for reference in references(&rule.body)
                .map_err(|e| format!("rule '{}': {}", rule.name, e))?
            {
                if !defined.contains(reference.as_str()) {
                    return Err(format!(
                        "rule '{}' references undefined rule '{}'",
                        rule.name, reference
                    ));
                }
            }
        }

        Ok(Self {
            source: None,
            rules,
        })
    }

    pub fn source(&self) -> Option<&Path> {
        self.source.as_deref()
    }

    pub fn rules(&self) -> &[GrammarRule] {
        &self.rules
    }

    pub fn rule(&self, name: &str) -> Option<&GrammarRule> {
        self.rules.iter().find(|r| r.name == name)
    }
}

fn is_rule_name(name: &str) -> bool {
    !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
}

/// Remove a trailing `#` comment, ignoring `#` inside literals and classes.
fn strip_comment(line: &str) -> &str {
    let mut in_string = false;
    let mut in_class = false;
    let mut escaped = false;
    for (i, c) in line.char_indices() {
        if escaped {
            escaped = false;
            continue;
        }
        match c {
            '\\' if in_string || in_class => escaped = true,
            '"' if !in_class => in_string = !in_string,
            '[' if !in_string => in_class = true,
            ']' if in_class => in_class = false,
            '#' if !in_string && !in_class => return &line[..i],
            _ => {}
        }
    }
    line
}

/// Rule names referenced by a rule body.
fn references(body: &str) -> Result<Vec<String>, String> {
    let mut found = Vec::new();
    let mut chars = body.chars().peekable();

    while let Some(c) = chars.next() {
        match c {
            '"' => skip_delimited(&mut chars, '"').ok_or("unterminated string literal")?,
            '[' => skip_delimited(&mut chars, ']').ok_or("unterminated character class")?,
            c if c.is_ascii_alphanumeric() || c == '-' || c == '_' => {
                let mut name = String::from(c);
                while let Some(&next) = chars.peek() {
                    if next.is_ascii_alphanumeric() || next == '-' || next == '_' {
                        name.push(next);
                        chars.next();
                    } else {
                        break;
                    }
                }
                // Repetition bounds like {2,3} are digits, not rule names.
                if !name.chars().all(|c| c.is_ascii_digit()) {
                    found.push(name);
                }
            }
            _ => {}
        }
    }
    Ok(found)
}

fn skip_delimited<I: Iterator<Item = char>>(chars: &mut I, close: char) -> Option<()> {
    let mut escaped = false;
    for c in chars.by_ref() {
        if escaped {
            escaped = false;
        } else if c == '\\' {
            escaped = true;
        } else if c == close {
            return Some(());
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    const ARITHMETIC: &str = r##"
# simple arithmetic
root  ::= expr "=" ws num
expr  ::= num ws op ws num
op    ::= "+" | "-" | "#"
num   ::= [0-9]+
ws    ::= [ \t]*
"##;

    #[test]
    fn test_parse_rules_and_comments() {
        let grammar = Grammar::parse(ARITHMETIC).unwrap();
        assert_eq!(grammar.rules().len(), 5);
        assert_eq!(grammar.rule("op").unwrap().body, r##""+" | "-" | "#""##);
        assert!(grammar.source().is_none());
    }

    #[test]
    fn test_continuation_lines_extend_previous_rule() {
        let grammar = Grammar::parse("root ::= a\n  | b\na ::= \"x\"\nb ::= \"y\"\n").unwrap();
        assert_eq!(grammar.rule("root").unwrap().body, "a | b");
    }

    #[test]
    fn test_missing_root_is_rejected() {
        let err = Grammar::parse("expr ::= \"1\"").unwrap_err();
        assert!(err.contains("root"));
    }

    #[test]
    fn test_undefined_reference_is_rejected() {
        let err = Grammar::parse("root ::= missing").unwrap_err();
        assert!(err.contains("missing"));
    }

    #[test]
    fn test_unterminated_literal_is_rejected() {
        assert!(Grammar::parse("root ::= \"abc").is_err());
        assert!(Grammar::parse("root ::= [a-z").is_err());
    }

    #[test]
    fn test_repetition_bounds_are_not_references() {
        assert!(Grammar::parse("root ::= [0-9]{1,3}").is_ok());
    }

    #[test]
    fn test_from_file_reports_path() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.gbnf");
        std::fs::write(&path, "not a grammar").unwrap();
        match Grammar::from_file(&path) {
            Err(SessionError::Grammar { path: p, .. }) => assert_eq!(p, path),
            other => panic!("expected grammar error, got {:?}", other),
        }

        let good = dir.path().join("good.gbnf");
        std::fs::write(&good, ARITHMETIC).unwrap();
        let grammar = Grammar::from_file(&good).unwrap();
        assert_eq!(grammar.source(), Some(good.as_path()));
    }
}
