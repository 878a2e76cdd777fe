use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct GithubUser {
    pub login: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
/// One side of a pull request (`head` or `base`).
pub struct GitRef {
    #[serde(rename = "ref")]
    pub ref_name: String,
    #[serde(default)]
    pub sha: String,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct PullRequest {
    pub number: u64,
    pub title: String,
    #[serde(default)]
    pub body: Option<String>,
    pub state: String,
    #[serde(default)]
    pub merged: Option<bool>,
    #[serde(default)]
    pub merged_at: Option<String>,
    pub head: GitRef,
    pub base: GitRef,
    pub user: GithubUser,
    #[serde(default)]
    pub html_url: Option<String>,
}

impl PullRequest {
    pub fn lifecycle_state(&self) -> PullRequestState {
        if self.merged.unwrap_or(false) || self.merged_at.is_some() {
            PullRequestState::Merged
        } else if self.state.eq_ignore_ascii_case("closed") {
            PullRequestState::Closed
        } else {
            PullRequestState::Open
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PullRequestState {
    Open,
    Merged,
    Closed,
}

impl PullRequestState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Open => "open",
            Self::Merged => "merged",
            Self::Closed => "closed",
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Issue {
    pub id: u64,
    pub number: u64,
    pub title: String,
    pub body: Option<String>,
    pub created_at: String,
    pub updated_at: String,
    pub user: GithubUser,
    #[serde(default)]
    pub pull_request: Option<Value>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
/// A discussion (conversation-tab) comment on an issue or pull request.
pub struct IssueComment {
    pub id: u64,
    pub body: Option<String>,
    pub created_at: String,
    pub updated_at: String,
    pub user: GithubUser,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
/// An inline review comment attached to a diff line.
pub struct ReviewComment {
    pub id: u64,
    pub body: Option<String>,
    #[serde(default)]
    pub path: Option<String>,
    #[serde(default)]
    pub line: Option<u64>,
    #[serde(default)]
    pub diff_hunk: Option<String>,
    #[serde(default)]
    pub in_reply_to_id: Option<u64>,
    pub created_at: String,
    pub updated_at: String,
    pub user: GithubUser,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct CreatedComment {
    pub id: u64,
    #[serde(default)]
    pub html_url: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NewPullRequest {
    pub title: String,
    pub head: String,
    pub base: String,
    pub body: String,
    pub draft: bool,
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::{PullRequest, PullRequestState, ReviewComment};

    fn pull_request(state: &str, merged_at: Option<&str>) -> PullRequest {
        serde_json::from_value(json!({
            "number": 5,
            "title": "Fix",
            "state": state,
            "merged_at": merged_at,
            "head": {"ref": "feature", "sha": "abc"},
            "base": {"ref": "main", "sha": "def"},
            "user": {"login": "alice"}
        }))
        .expect("decode pull request")
    }

    #[test]
    fn unit_pull_request_lifecycle_state_distinguishes_merged_and_closed() {
        assert_eq!(pull_request("open", None).lifecycle_state(), PullRequestState::Open);
        assert_eq!(
            pull_request("closed", None).lifecycle_state(),
            PullRequestState::Closed
        );
        assert_eq!(
            pull_request("closed", Some("2026-01-01T00:00:00Z")).lifecycle_state(),
            PullRequestState::Merged
        );
    }

    #[test]
    fn functional_review_comment_decodes_without_optional_fields() {
        let comment: ReviewComment = serde_json::from_value(json!({
            "id": 7,
            "body": "rename this",
            "created_at": "2026-01-01T00:00:00Z",
            "updated_at": "2026-01-01T00:00:00Z",
            "user": {"login": "bob"}
        }))
        .expect("decode");
        assert_eq!(comment.id, 7);
        assert!(comment.path.is_none());
        assert!(comment.line.is_none());
    }
}
