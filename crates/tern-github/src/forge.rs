use anyhow::Result;
use async_trait::async_trait;

use crate::types::{
    CreatedComment, Issue, IssueComment, NewPullRequest, PullRequest, PullRequestState,
    ReviewComment,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
/// What a reaction is attached to.
pub enum ReactionTarget {
    IssueComment(u64),
    ReviewComment(u64),
    Issue(u64),
}

/// Hosted-repository operations the scheduler depends on.
///
/// Implementations are scoped to a single repository.
#[async_trait]
pub trait Forge: Send + Sync {
    async fn authenticated_login(&self) -> Result<String>;
    async fn default_branch(&self) -> Result<String>;
    async fn list_open_pull_requests(&self) -> Result<Vec<PullRequest>>;
    /// Open issues, excluding pull requests.
    async fn list_open_issues(&self) -> Result<Vec<Issue>>;
    async fn list_issue_comments(&self, number: u64) -> Result<Vec<IssueComment>>;
    async fn list_review_comments(&self, pr_number: u64) -> Result<Vec<ReviewComment>>;
    async fn create_issue_comment(&self, number: u64, body: &str) -> Result<CreatedComment>;
    async fn reply_to_review_comment(
        &self,
        pr_number: u64,
        comment_id: u64,
        body: &str,
    ) -> Result<CreatedComment>;
    async fn add_reaction(&self, target: ReactionTarget, content: &str) -> Result<()>;
    async fn create_pull_request(&self, request: &NewPullRequest) -> Result<PullRequest>;
    async fn pull_request_state(&self, number: u64) -> Result<PullRequestState>;
}
