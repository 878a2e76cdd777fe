//! Line-oriented parser for the directives an agent places in its final reply.
//!
//! Recognised lines (case-insensitive, optionally prefixed by `1.` or `1)`):
//!
//! ```text
//! COMMIT: <message>
//! CLARIFICATION_NEEDED: <question>
//! RESPONSE[<comment id>]: <reply>
//! BRANCH_NAME: <name>
//! PR_TITLE: <title>
//! TOKENS: <count>
//! ```
//!
//! Directive lines never reach the human-facing body. A directive given more
//! than once keeps its last value.

use std::collections::BTreeMap;
use std::sync::LazyLock;

use regex::Regex;
use tern_registry::SessionTarget;

static DIRECTIVE_LINE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)^\s*(?:\d+[.)]\s+)?(COMMIT|CLARIFICATION_NEEDED|RESPONSE\s*\[\s*#?(\d+)\s*\]|BRANCH_NAME|PR_TITLE|TOKENS)\s*:\s*(.*?)\s*$",
    )
    .expect("directive regex is valid")
});

static NUMBERED_BULLET: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^(\s*)\d+[.)]\s+").expect("bullet regex is valid"));

const ABSENT_PLACEHOLDERS: &[&str] = &["none", "n/a", "na", "null", "nil", "-", "no", "nothing"];

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AgentDirectives {
    pub commit_message: Option<String>,
    pub clarification: Option<String>,
    pub responses: BTreeMap<u64, String>,
    pub branch_name: Option<String>,
    pub pr_title: Option<String>,
    pub tokens: Option<u64>,
    /// Reply text with every directive line removed.
    pub body: String,
}

fn non_empty(value: &str) -> Option<String> {
    let value = value.trim();
    (!value.is_empty()).then(|| value.to_string())
}

fn is_placeholder(value: &str) -> bool {
    let normalized = value
        .trim()
        .trim_end_matches(['.', '!'])
        .to_ascii_lowercase();
    normalized.is_empty() || ABSENT_PLACEHOLDERS.contains(&normalized.as_str())
}

fn parse_token_count(value: &str) -> Option<u64> {
    let digits: String = value
        .chars()
        .take_while(|ch| ch.is_ascii_digit() || *ch == ',' || *ch == '_')
        .filter(char::is_ascii_digit)
        .collect();
    digits.parse().ok()
}

pub fn parse_directives(reply: &str) -> AgentDirectives {
    let mut directives = AgentDirectives::default();
    let mut kept = Vec::new();

    for line in reply.lines() {
        let Some(captures) = DIRECTIVE_LINE.captures(line) else {
            kept.push(line);
            continue;
        };
        let keyword = captures
            .get(1)
            .map(|m| m.as_str().to_ascii_uppercase())
            .unwrap_or_default();
        let value = captures.get(3).map_or("", |m| m.as_str());

        if keyword.starts_with("RESPONSE") {
            let id = captures.get(2).and_then(|m| m.as_str().parse::<u64>().ok());
            if let (Some(id), Some(text)) = (id, non_empty(value)) {
                directives.responses.insert(id, text);
            }
            continue;
        }
        match keyword.as_str() {
            "COMMIT" => directives.commit_message = non_empty(value),
            "CLARIFICATION_NEEDED" => {
                directives.clarification = (!is_placeholder(value)).then(|| value.to_string());
            }
            "BRANCH_NAME" => directives.branch_name = non_empty(value),
            "PR_TITLE" => directives.pr_title = non_empty(value),
            "TOKENS" => directives.tokens = parse_token_count(value),
            _ => kept.push(line),
        }
    }

    directives.body = tidy_body(&kept);
    directives
}

fn tidy_body(lines: &[&str]) -> String {
    let mut lines: Vec<String> = lines.iter().map(|line| line.trim_end().to_string()).collect();

    let bullets: Vec<usize> = lines
        .iter()
        .enumerate()
        .filter(|(_, line)| NUMBERED_BULLET.is_match(line))
        .map(|(index, _)| index)
        .collect();
    if let [only] = bullets.as_slice() {
        lines[*only] = NUMBERED_BULLET.replace(&lines[*only], "$1").into_owned();
    }

    let mut collapsed: Vec<String> = Vec::with_capacity(lines.len());
    for line in lines {
        let blank = line.trim().is_empty();
        let previous_blank = collapsed.last().is_some_and(|last| last.trim().is_empty());
        if blank && previous_blank {
            continue;
        }
        collapsed.push(line);
    }
    collapsed.join("\n").trim().to_string()
}

/// Fallback commit message when the agent left no `COMMIT:` line.
pub fn default_commit_message(target: SessionTarget) -> String {
    match target {
        SessionTarget::PullRequest { number } => {
            format!("Address review feedback on #{number}")
        }
        SessionTarget::Issue { number } => format!("Resolve #{number}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn functional_commit_and_response_round_trip() {
        let reply = "Updated the handler.\nCOMMIT: fix: x\nRESPONSE[7]: ok\nAll tests pass.";
        let directives = parse_directives(reply);
        assert_eq!(directives.commit_message.as_deref(), Some("fix: x"));
        assert_eq!(directives.responses, BTreeMap::from([(7, "ok".to_string())]));
        assert_eq!(directives.body, "Updated the handler.\nAll tests pass.");
        assert!(!directives.body.contains("COMMIT"));
        assert!(!directives.body.contains("RESPONSE"));
    }

    #[test]
    fn unit_keywords_are_case_insensitive_and_accept_numbered_prefix() {
        let reply = "1. commit: feat: add\n2) Branch_Name: feature/add\n3. pr_title: Add thing\ntokens: 12,345";
        let directives = parse_directives(reply);
        assert_eq!(directives.commit_message.as_deref(), Some("feat: add"));
        assert_eq!(directives.branch_name.as_deref(), Some("feature/add"));
        assert_eq!(directives.pr_title.as_deref(), Some("Add thing"));
        assert_eq!(directives.tokens, Some(12_345));
        assert!(directives.body.is_empty());
    }

    #[test]
    fn unit_clarification_placeholders_are_absent() {
        for placeholder in ["none", "N/A", "null.", "-", ""] {
            let directives = parse_directives(&format!("CLARIFICATION_NEEDED: {placeholder}"));
            assert_eq!(directives.clarification, None, "{placeholder}");
        }
        let directives = parse_directives("CLARIFICATION_NEEDED: Which module?");
        assert_eq!(directives.clarification.as_deref(), Some("Which module?"));
    }

    #[test]
    fn functional_single_remaining_bullet_loses_its_numeral() {
        let reply = "1. COMMIT: tidy\n2. Renamed the helper for clarity";
        let directives = parse_directives(reply);
        assert_eq!(directives.body, "Renamed the helper for clarity");

        let two = parse_directives("1. first\n2. second\nCOMMIT: x");
        assert_eq!(two.body, "1. first\n2. second");
    }

    #[test]
    fn regression_missing_directives_degrade_to_defaults() {
        let directives = parse_directives("Done, nothing else to say.");
        assert_eq!(directives.commit_message, None);
        assert!(directives.responses.is_empty());
        assert_eq!(
            default_commit_message(SessionTarget::PullRequest { number: 42 }),
            "Address review feedback on #42"
        );
        assert_eq!(
            default_commit_message(SessionTarget::Issue { number: 3 }),
            "Resolve #3"
        );
    }

    #[test]
    fn regression_empty_or_malformed_responses_are_dropped_and_blank_runs_collapse() {
        let reply = "Intro\n\n\n\nRESPONSE[abc]: nope\nRESPONSE[#9]:   \nRESPONSE[ 10 ]: yes\nOutro";
        let directives = parse_directives(reply);
        assert_eq!(directives.responses, BTreeMap::from([(10, "yes".to_string())]));
        assert_eq!(directives.body, "Intro\n\nRESPONSE[abc]: nope\nOutro");
        assert_eq!(parse_directives(""), AgentDirectives::default());
    }
}
