//! In-memory `Forge`, `Multiplexer`, and `Workspace` used by runtime tests.

use std::{
    collections::BTreeMap,
    path::PathBuf,
    sync::{Mutex, MutexGuard},
};

use anyhow::{bail, Result};
use async_trait::async_trait;
use tern_core::sanitize_for_path;
use tern_github::{
    CreatedComment, Forge, GitRef, GithubUser, Issue, IssueComment, NewPullRequest, PullRequest,
    PullRequestState, ReactionTarget, ReviewComment,
};

use crate::{Multiplexer, WindowSpec, Workspace};

pub(crate) fn user(login: &str) -> GithubUser {
    GithubUser {
        login: login.to_string(),
    }
}

pub(crate) fn pull_request(number: u64, head: &str) -> PullRequest {
    PullRequest {
        number,
        title: format!("PR {number}"),
        body: None,
        state: "open".to_string(),
        merged: Some(false),
        merged_at: None,
        head: GitRef {
            ref_name: head.to_string(),
            sha: "abc".to_string(),
        },
        base: GitRef {
            ref_name: "main".to_string(),
            sha: "def".to_string(),
        },
        user: user("alice"),
        html_url: None,
    }
}

pub(crate) fn issue(number: u64, title: &str, body: &str) -> Issue {
    Issue {
        id: 9_000 + number,
        number,
        title: title.to_string(),
        body: Some(body.to_string()),
        created_at: "2026-01-01T00:00:00Z".to_string(),
        updated_at: "2026-01-01T00:00:00Z".to_string(),
        user: user("alice"),
        pull_request: None,
    }
}

pub(crate) fn issue_comment(id: u64, author: &str, body: &str, created_at: &str) -> IssueComment {
    IssueComment {
        id,
        body: Some(body.to_string()),
        created_at: created_at.to_string(),
        updated_at: created_at.to_string(),
        user: user(author),
    }
}

pub(crate) fn review_comment(id: u64, author: &str, body: &str, created_at: &str) -> ReviewComment {
    ReviewComment {
        id,
        body: Some(body.to_string()),
        path: Some("src/lib.rs".to_string()),
        line: Some(12),
        diff_hunk: None,
        in_reply_to_id: None,
        created_at: created_at.to_string(),
        updated_at: created_at.to_string(),
        user: user(author),
    }
}

#[derive(Debug, Default)]
pub(crate) struct ForgeState {
    pub(crate) pull_requests: Vec<PullRequest>,
    pub(crate) issues: Vec<Issue>,
    pub(crate) issue_comments: BTreeMap<u64, Vec<IssueComment>>,
    pub(crate) review_comments: BTreeMap<u64, Vec<ReviewComment>>,
    pub(crate) posted: Vec<(u64, String)>,
    pub(crate) review_replies: Vec<(u64, u64, String)>,
    pub(crate) reactions: Vec<(ReactionTarget, String)>,
    pub(crate) created_pull_requests: Vec<NewPullRequest>,
    pub(crate) closed: BTreeMap<u64, PullRequestState>,
    pub(crate) fail_listing: bool,
    pub(crate) fail_posting: bool,
    next_id: u64,
}

#[derive(Debug, Default)]
pub(crate) struct FakeForge {
    state: Mutex<ForgeState>,
}

impl FakeForge {
    pub(crate) fn state(&self) -> MutexGuard<'_, ForgeState> {
        self.state.lock().expect("forge state lock")
    }

    fn next_id(state: &mut ForgeState) -> u64 {
        state.next_id += 1;
        50_000 + state.next_id
    }
}

#[async_trait]
impl Forge for FakeForge {
    async fn authenticated_login(&self) -> Result<String> {
        Ok("tern-bot".to_string())
    }

    async fn default_branch(&self) -> Result<String> {
        Ok("main".to_string())
    }

    async fn list_open_pull_requests(&self) -> Result<Vec<PullRequest>> {
        let state = self.state();
        if state.fail_listing {
            bail!("github unavailable");
        }
        Ok(state
            .pull_requests
            .iter()
            .filter(|pr| !state.closed.contains_key(&pr.number))
            .cloned()
            .collect())
    }

    async fn list_open_issues(&self) -> Result<Vec<Issue>> {
        let state = self.state();
        if state.fail_listing {
            bail!("github unavailable");
        }
        Ok(state.issues.clone())
    }

    async fn list_issue_comments(&self, number: u64) -> Result<Vec<IssueComment>> {
        Ok(self
            .state()
            .issue_comments
            .get(&number)
            .cloned()
            .unwrap_or_default())
    }

    async fn list_review_comments(&self, pr_number: u64) -> Result<Vec<ReviewComment>> {
        Ok(self
            .state()
            .review_comments
            .get(&pr_number)
            .cloned()
            .unwrap_or_default())
    }

    async fn create_issue_comment(&self, number: u64, body: &str) -> Result<CreatedComment> {
        let mut state = self.state();
        if state.fail_posting {
            bail!("posting failed");
        }
        state.posted.push((number, body.to_string()));
        let id = Self::next_id(&mut state);
        Ok(CreatedComment { id, html_url: None })
    }

    async fn reply_to_review_comment(
        &self,
        pr_number: u64,
        comment_id: u64,
        body: &str,
    ) -> Result<CreatedComment> {
        let mut state = self.state();
        if state.fail_posting {
            bail!("posting failed");
        }
        state
            .review_replies
            .push((pr_number, comment_id, body.to_string()));
        let id = Self::next_id(&mut state);
        Ok(CreatedComment { id, html_url: None })
    }

    async fn add_reaction(&self, target: ReactionTarget, content: &str) -> Result<()> {
        self.state().reactions.push((target, content.to_string()));
        Ok(())
    }

    async fn create_pull_request(&self, request: &NewPullRequest) -> Result<PullRequest> {
        let mut state = self.state();
        state.created_pull_requests.push(request.clone());
        let number = 700 + state.created_pull_requests.len() as u64;
        let pr = pull_request(number, &request.head);
        state.pull_requests.push(pr.clone());
        Ok(pr)
    }

    async fn pull_request_state(&self, number: u64) -> Result<PullRequestState> {
        Ok(self
            .state()
            .closed
            .get(&number)
            .copied()
            .unwrap_or(PullRequestState::Open))
    }
}

#[derive(Debug, Default)]
pub(crate) struct MultiplexerState {
    pub(crate) windows: BTreeMap<String, WindowSpec>,
    pub(crate) spawned: Vec<WindowSpec>,
    pub(crate) keys: Vec<(String, Vec<String>)>,
    pub(crate) pasted: Vec<(String, String)>,
    pub(crate) killed: Vec<String>,
    pub(crate) fail_keys: bool,
}

#[derive(Debug, Default)]
pub(crate) struct FakeMultiplexer {
    state: Mutex<MultiplexerState>,
}

impl FakeMultiplexer {
    pub(crate) fn state(&self) -> MutexGuard<'_, MultiplexerState> {
        self.state.lock().expect("multiplexer state lock")
    }

    /// Simulates the agent process exiting on its own.
    pub(crate) fn exit(&self, window: &str) {
        self.state().windows.remove(window);
    }
}

#[async_trait]
impl Multiplexer for FakeMultiplexer {
    async fn window_exists(&self, window: &str) -> Result<bool> {
        Ok(self.state().windows.contains_key(window))
    }

    async fn spawn_window(&self, spec: &WindowSpec) -> Result<()> {
        let mut state = self.state();
        if state.windows.contains_key(&spec.name) {
            bail!("duplicate window {}", spec.name);
        }
        state.windows.insert(spec.name.clone(), spec.clone());
        state.spawned.push(spec.clone());
        Ok(())
    }

    async fn send_keys(&self, window: &str, keys: &[String]) -> Result<()> {
        let mut state = self.state();
        if state.fail_keys {
            bail!("send-keys failed");
        }
        state.keys.push((window.to_string(), keys.to_vec()));
        Ok(())
    }

    async fn paste_text(&self, window: &str, text: &str) -> Result<()> {
        let mut state = self.state();
        if !state.windows.contains_key(window) {
            bail!("no window {window}");
        }
        state.pasted.push((window.to_string(), text.to_string()));
        Ok(())
    }

    async fn kill_window(&self, window: &str) -> Result<()> {
        let mut state = self.state();
        state.windows.remove(window);
        state.killed.push(window.to_string());
        Ok(())
    }

    async fn list_windows(&self) -> Result<Vec<String>> {
        Ok(self.state().windows.keys().cloned().collect())
    }

    fn attach_command(&self, window: &str) -> Vec<String> {
        vec!["attach".to_string(), window.to_string()]
    }
}

#[derive(Debug, Default)]
pub(crate) struct WorkspaceState {
    pub(crate) prepared: Vec<String>,
    pub(crate) commits: Vec<(String, String, String)>,
    pub(crate) removed: Vec<String>,
    /// Returned by the next `commit_and_push`; `None` means a clean tree.
    pub(crate) next_sha: Option<String>,
}

#[derive(Debug)]
pub(crate) struct FakeWorkspace {
    root: PathBuf,
    state: Mutex<WorkspaceState>,
}

impl FakeWorkspace {
    pub(crate) fn new(root: PathBuf) -> Self {
        Self {
            root,
            state: Mutex::new(WorkspaceState::default()),
        }
    }

    pub(crate) fn state(&self) -> MutexGuard<'_, WorkspaceState> {
        self.state.lock().expect("workspace state lock")
    }
}

#[async_trait]
impl Workspace for FakeWorkspace {
    fn path_for(&self, branch: &str) -> PathBuf {
        self.root.join(sanitize_for_path(branch))
    }

    async fn prepare(&self, branch: &str, _base_branch: &str) -> Result<PathBuf> {
        let dir = self.path_for(branch);
        std::fs::create_dir_all(&dir)?;
        self.state().prepared.push(branch.to_string());
        Ok(dir)
    }

    async fn commit_and_push(
        &self,
        branch: &str,
        push_branch: &str,
        _base_branch: &str,
        message: &str,
    ) -> Result<Option<String>> {
        let mut state = self.state();
        let sha = state.next_sha.take();
        if sha.is_some() {
            state.commits.push((
                branch.to_string(),
                push_branch.to_string(),
                message.to_string(),
            ));
        }
        Ok(sha)
    }

    async fn remove(&self, branch: &str) -> Result<bool> {
        self.state().removed.push(branch.to_string());
        let dir = self.path_for(branch);
        if dir.exists() {
            std::fs::remove_dir_all(dir)?;
            return Ok(true);
        }
        Ok(false)
    }
}
