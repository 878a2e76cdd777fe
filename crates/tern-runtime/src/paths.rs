//! On-disk layout of the controller's configuration and state directories.

use std::path::{Path, PathBuf};

use tern_core::{repository_dir_name, sanitize_for_path};
use tern_github::RepoRef;

pub const CONFIG_FILE: &str = "config.toml";
pub const WHITELIST_FILE: &str = "whitelist.json";

/// Process-wide directories.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TernPaths {
    pub config_dir: PathBuf,
    pub state_dir: PathBuf,
}

impl TernPaths {
    pub fn new(config_dir: impl Into<PathBuf>, state_dir: impl Into<PathBuf>) -> Self {
        Self {
            config_dir: config_dir.into(),
            state_dir: state_dir.into(),
        }
    }

    pub fn global_config(&self) -> PathBuf {
        self.config_dir.join(CONFIG_FILE)
    }

    pub fn global_whitelist(&self) -> PathBuf {
        self.config_dir.join(WHITELIST_FILE)
    }

    pub fn repository(&self, repo: &RepoRef) -> RepositoryPaths {
        RepositoryPaths {
            root: self
                .state_dir
                .join(repository_dir_name(&repo.owner, &repo.name)),
        }
    }
}

/// Everything stored for one repository under `<state_dir>/<owner>__<repo>/`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RepositoryPaths {
    pub root: PathBuf,
}

impl RepositoryPaths {
    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn config(&self) -> PathBuf {
        self.root.join(CONFIG_FILE)
    }

    pub fn whitelist(&self) -> PathBuf {
        self.root.join(WHITELIST_FILE)
    }

    pub fn control_dir(&self) -> PathBuf {
        self.root.join("control")
    }

    pub fn logs_dir(&self) -> PathBuf {
        self.root.join("logs")
    }

    pub fn output_log(&self, branch: &str) -> PathBuf {
        self.logs_dir()
            .join(format!("{}.log", sanitize_for_path(branch)))
    }
}

/// tmux window name for a branch. Dots and colons are tmux target separators.
pub fn window_name(branch: &str) -> String {
    format!("tern-{}", sanitize_for_path(branch).replace('.', "_"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unit_repository_paths_are_namespaced() {
        let paths = TernPaths::new("/cfg", "/state");
        let repo = RepoRef::parse("acme/widgets").expect("repo");
        let repository = paths.repository(&repo);
        assert_eq!(repository.root, PathBuf::from("/state/acme__widgets"));
        assert_eq!(
            repository.output_log("feature/x"),
            PathBuf::from("/state/acme__widgets/logs/feature_x.log")
        );
        assert_eq!(paths.global_whitelist(), PathBuf::from("/cfg/whitelist.json"));
    }

    #[test]
    fn unit_window_name_avoids_target_separators() {
        assert_eq!(window_name("release/v1.2"), "tern-release_v1_2");
        assert_eq!(window_name("a:b"), "tern-a_b");
    }
}
