//! Hosted-repository access layer for tern.
//!
//! Wire types for pull requests, issues, and comments, the `Forge` trait the
//! scheduler talks to, and a retrying GitHub REST implementation.

pub mod client;
pub mod forge;
pub mod repo;
pub mod transport;
pub mod types;

pub use client::{GithubClient, GithubClientConfig};
pub use forge::{Forge, ReactionTarget};
pub use repo::RepoRef;
pub use types::{
    CreatedComment, GitRef, GithubUser, Issue, IssueComment, NewPullRequest, PullRequest,
    PullRequestState, ReviewComment,
};
