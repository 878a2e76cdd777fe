use std::time::Duration;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::debug;

use crate::forge::{Forge, ReactionTarget};
use crate::repo::RepoRef;
use crate::transport::{
    is_retryable_github_status, is_retryable_transport_error, parse_retry_after, retry_delay,
    truncate_for_error,
};
use crate::types::{
    CreatedComment, Issue, IssueComment, NewPullRequest, PullRequest, PullRequestState,
    ReviewComment,
};

const PAGE_SIZE: usize = 100;

#[derive(Debug, Clone)]
pub struct GithubClientConfig {
    pub api_base: String,
    pub token: String,
    pub repo: RepoRef,
    pub request_timeout_ms: u64,
    pub retry_max_attempts: usize,
    pub retry_base_delay_ms: u64,
}

#[derive(Clone)]
/// GitHub REST implementation of [`Forge`] for one repository.
pub struct GithubClient {
    http: reqwest::Client,
    api_base: String,
    repo: RepoRef,
    retry_max_attempts: usize,
    retry_base_delay_ms: u64,
}

impl GithubClient {
    pub fn new(config: GithubClientConfig) -> Result<Self> {
        let mut headers = reqwest::header::HeaderMap::new();
        headers.insert(
            reqwest::header::USER_AGENT,
            reqwest::header::HeaderValue::from_static("tern-controller"),
        );
        headers.insert(
            reqwest::header::ACCEPT,
            reqwest::header::HeaderValue::from_static("application/vnd.github+json"),
        );
        headers.insert(
            "x-github-api-version",
            reqwest::header::HeaderValue::from_static("2022-11-28"),
        );
        let auth_header = format!("Bearer {}", config.token.trim());
        headers.insert(
            reqwest::header::AUTHORIZATION,
            reqwest::header::HeaderValue::from_str(&auth_header)
                .context("invalid github authorization header")?,
        );

        let http = reqwest::Client::builder()
            .default_headers(headers)
            .timeout(Duration::from_millis(config.request_timeout_ms.max(1)))
            .build()
            .context("failed to create github api client")?;
        Ok(Self {
            http,
            api_base: config.api_base.trim_end_matches('/').to_string(),
            repo: config.repo,
            retry_max_attempts: config.retry_max_attempts.max(1),
            retry_base_delay_ms: config.retry_base_delay_ms.max(1),
        })
    }

    pub fn repo(&self) -> &RepoRef {
        &self.repo
    }

    fn repo_url(&self, suffix: &str) -> String {
        format!(
            "{}/repos/{}/{}{}",
            self.api_base, self.repo.owner, self.repo.name, suffix
        )
    }

    async fn list_paginated<T>(
        &self,
        operation: &str,
        url: String,
        query: &[(&str, &str)],
    ) -> Result<Vec<T>>
    where
        T: DeserializeOwned,
    {
        let mut page = 1_u32;
        let mut rows = Vec::new();
        let per_page = PAGE_SIZE.to_string();
        loop {
            let page_value = page.to_string();
            let chunk: Vec<T> = self
                .request_json(operation, || {
                    self.http.get(&url).query(query).query(&[
                        ("per_page", per_page.as_str()),
                        ("page", page_value.as_str()),
                    ])
                })
                .await?;
            let chunk_len = chunk.len();
            rows.extend(chunk);
            if chunk_len < PAGE_SIZE {
                break;
            }
            page = page.saturating_add(1);
        }
        Ok(rows)
    }

    async fn request_json<T, F>(&self, operation: &str, mut request_builder: F) -> Result<T>
    where
        T: DeserializeOwned,
        F: FnMut() -> reqwest::RequestBuilder,
    {
        let mut attempt = 0_usize;
        loop {
            attempt = attempt.saturating_add(1);
            let response = request_builder()
                .header("x-tern-retry-attempt", attempt.saturating_sub(1).to_string())
                .send()
                .await;
            match response {
                Ok(response) => {
                    let status = response.status();
                    if status.is_success() {
                        let parsed = response
                            .json::<T>()
                            .await
                            .with_context(|| format!("failed to decode github {operation}"))?;
                        return Ok(parsed);
                    }

                    let retry_after = parse_retry_after(response.headers());
                    let body = response.text().await.unwrap_or_default();
                    if attempt < self.retry_max_attempts
                        && is_retryable_github_status(status.as_u16())
                    {
                        debug!(
                            operation,
                            status = status.as_u16(),
                            attempt,
                            "retrying github request"
                        );
                        tokio::time::sleep(retry_delay(
                            self.retry_base_delay_ms,
                            attempt,
                            retry_after,
                        ))
                        .await;
                        continue;
                    }

                    bail!(
                        "github api {operation} failed with status {}: {}",
                        status.as_u16(),
                        truncate_for_error(&body, 800)
                    );
                }
                Err(error) => {
                    if attempt < self.retry_max_attempts && is_retryable_transport_error(&error) {
                        tokio::time::sleep(retry_delay(self.retry_base_delay_ms, attempt, None))
                            .await;
                        continue;
                    }
                    return Err(error)
                        .with_context(|| format!("github api {operation} request failed"));
                }
            }
        }
    }
}

#[async_trait]
impl Forge for GithubClient {
    async fn authenticated_login(&self) -> Result<String> {
        #[derive(Deserialize)]
        struct Viewer {
            login: String,
        }

        let viewer: Viewer = self
            .request_json("resolve bot login", || {
                self.http.get(format!("{}/user", self.api_base))
            })
            .await?;
        Ok(viewer.login)
    }

    async fn default_branch(&self) -> Result<String> {
        #[derive(Deserialize)]
        struct Repository {
            default_branch: String,
        }

        let repository: Repository = self
            .request_json("read repository", || self.http.get(self.repo_url("")))
            .await?;
        Ok(repository.default_branch)
    }

    async fn list_open_pull_requests(&self) -> Result<Vec<PullRequest>> {
        self.list_paginated(
            "list pull requests",
            self.repo_url("/pulls"),
            &[("state", "open"), ("sort", "created"), ("direction", "asc")],
        )
        .await
    }

    async fn list_open_issues(&self) -> Result<Vec<Issue>> {
        let rows: Vec<Issue> = self
            .list_paginated(
                "list issues",
                self.repo_url("/issues"),
                &[("state", "open"), ("sort", "created"), ("direction", "asc")],
            )
            .await?;
        Ok(rows
            .into_iter()
            .filter(|issue| issue.pull_request.is_none())
            .collect())
    }

    async fn list_issue_comments(&self, number: u64) -> Result<Vec<IssueComment>> {
        self.list_paginated(
            "list issue comments",
            self.repo_url(&format!("/issues/{number}/comments")),
            &[("sort", "created"), ("direction", "asc")],
        )
        .await
    }

    async fn list_review_comments(&self, pr_number: u64) -> Result<Vec<ReviewComment>> {
        self.list_paginated(
            "list review comments",
            self.repo_url(&format!("/pulls/{pr_number}/comments")),
            &[("sort", "created"), ("direction", "asc")],
        )
        .await
    }

    async fn create_issue_comment(&self, number: u64, body: &str) -> Result<CreatedComment> {
        let payload = json!({ "body": body });
        self.request_json("create issue comment", || {
            self.http
                .post(self.repo_url(&format!("/issues/{number}/comments")))
                .json(&payload)
        })
        .await
    }

    async fn reply_to_review_comment(
        &self,
        pr_number: u64,
        comment_id: u64,
        body: &str,
    ) -> Result<CreatedComment> {
        let payload = json!({ "body": body });
        self.request_json("reply to review comment", || {
            self.http
                .post(self.repo_url(&format!(
                    "/pulls/{pr_number}/comments/{comment_id}/replies"
                )))
                .json(&payload)
        })
        .await
    }

    async fn add_reaction(&self, target: ReactionTarget, content: &str) -> Result<()> {
        let suffix = match target {
            ReactionTarget::IssueComment(id) => format!("/issues/comments/{id}/reactions"),
            ReactionTarget::ReviewComment(id) => format!("/pulls/comments/{id}/reactions"),
            ReactionTarget::Issue(number) => format!("/issues/{number}/reactions"),
        };
        let payload = json!({ "content": content });
        let _: Value = self
            .request_json("add reaction", || {
                self.http.post(self.repo_url(&suffix)).json(&payload)
            })
            .await?;
        Ok(())
    }

    async fn create_pull_request(&self, request: &NewPullRequest) -> Result<PullRequest> {
        self.request_json("create pull request", || {
            self.http.post(self.repo_url("/pulls")).json(request)
        })
        .await
    }

    async fn pull_request_state(&self, number: u64) -> Result<PullRequestState> {
        let pull_request: PullRequest = self
            .request_json("read pull request", || {
                self.http.get(self.repo_url(&format!("/pulls/{number}")))
            })
            .await?;
        Ok(pull_request.lifecycle_state())
    }
}

#[cfg(test)]
mod tests {
    use httpmock::prelude::*;
    use serde_json::json;

    use super::{GithubClient, GithubClientConfig};
    use crate::forge::{Forge, ReactionTarget};
    use crate::repo::RepoRef;
    use crate::types::{NewPullRequest, PullRequestState};

    fn test_client(base_url: &str) -> GithubClient {
        GithubClient::new(GithubClientConfig {
            api_base: base_url.to_string(),
            token: "test-token".to_string(),
            repo: RepoRef::parse("owner/repo").expect("repo"),
            request_timeout_ms: 3_000,
            retry_max_attempts: 3,
            retry_base_delay_ms: 1,
        })
        .expect("client")
    }

    #[tokio::test]
    async fn unit_list_open_issues_filters_pull_requests() {
        let server = MockServer::start();
        let issues = server.mock(|when, then| {
            when.method(GET)
                .path("/repos/owner/repo/issues")
                .query_param("state", "open")
                .header("authorization", "Bearer test-token");
            then.status(200).json_body(json!([
                {
                    "id": 1, "number": 10, "title": "Bug", "body": "fix it",
                    "created_at": "2026-01-01T00:00:00Z", "updated_at": "2026-01-01T00:00:00Z",
                    "user": {"login": "alice"}
                },
                {
                    "id": 2, "number": 11, "title": "PR", "body": null,
                    "created_at": "2026-01-01T00:00:00Z", "updated_at": "2026-01-01T00:00:00Z",
                    "user": {"login": "alice"}, "pull_request": {"url": "x"}
                }
            ]));
        });

        let client = test_client(&server.base_url());
        let rows = client.list_open_issues().await.expect("issues");
        issues.assert_calls(1);
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].number, 10);
    }

    #[tokio::test]
    async fn functional_reply_to_review_comment_posts_to_replies_endpoint() {
        let server = MockServer::start();
        let reply = server.mock(|when, then| {
            when.method(POST)
                .path("/repos/owner/repo/pulls/4/comments/77/replies")
                .json_body(json!({"body": "done"}));
            then.status(201)
                .json_body(json!({"id": 900, "html_url": "https://example.test/900"}));
        });

        let client = test_client(&server.base_url());
        let created = client
            .reply_to_review_comment(4, 77, "done")
            .await
            .expect("reply");
        reply.assert_calls(1);
        assert_eq!(created.id, 900);
    }

    #[tokio::test]
    async fn functional_add_reaction_routes_by_target() {
        let server = MockServer::start();
        let issue_comment = server.mock(|when, then| {
            when.method(POST)
                .path("/repos/owner/repo/issues/comments/5/reactions")
                .json_body(json!({"content": "eyes"}));
            then.status(201).json_body(json!({"id": 1, "content": "eyes"}));
        });
        let review_comment = server.mock(|when, then| {
            when.method(POST)
                .path("/repos/owner/repo/pulls/comments/6/reactions");
            then.status(201).json_body(json!({"id": 2, "content": "eyes"}));
        });

        let client = test_client(&server.base_url());
        client
            .add_reaction(ReactionTarget::IssueComment(5), "eyes")
            .await
            .expect("issue comment reaction");
        client
            .add_reaction(ReactionTarget::ReviewComment(6), "eyes")
            .await
            .expect("review comment reaction");
        issue_comment.assert_calls(1);
        review_comment.assert_calls(1);
    }

    #[tokio::test]
    async fn integration_create_pull_request_and_read_state() {
        let server = MockServer::start();
        let create = server.mock(|when, then| {
            when.method(POST)
                .path("/repos/owner/repo/pulls")
                .body_includes(r#""head":"tern/issue-3""#)
                .body_includes(r#""base":"main""#);
            then.status(201).json_body(json!({
                "number": 21, "title": "Fix", "state": "open",
                "head": {"ref": "tern/issue-3", "sha": "a"},
                "base": {"ref": "main", "sha": "b"},
                "user": {"login": "tern-bot"}
            }));
        });
        let read = server.mock(|when, then| {
            when.method(GET).path("/repos/owner/repo/pulls/21");
            then.status(200).json_body(json!({
                "number": 21, "title": "Fix", "state": "closed", "merged": true,
                "merged_at": "2026-01-02T00:00:00Z",
                "head": {"ref": "tern/issue-3", "sha": "a"},
                "base": {"ref": "main", "sha": "b"},
                "user": {"login": "tern-bot"}
            }));
        });

        let client = test_client(&server.base_url());
        let created = client
            .create_pull_request(&NewPullRequest {
                title: "Fix".to_string(),
                head: "tern/issue-3".to_string(),
                base: "main".to_string(),
                body: "Resolves #3".to_string(),
                draft: false,
            })
            .await
            .expect("create");
        assert_eq!(created.number, 21);
        let state = client.pull_request_state(21).await.expect("state");
        assert_eq!(state, PullRequestState::Merged);
        create.assert_calls(1);
        read.assert_calls(1);
    }

    #[tokio::test]
    async fn regression_request_retries_server_errors_then_fails() {
        let server = MockServer::start();
        let failing = server.mock(|when, then| {
            when.method(GET).path("/repos/owner/repo/issues/9/comments");
            then.status(502).body("bad gateway");
        });

        let client = test_client(&server.base_url());
        let error = client
            .list_issue_comments(9)
            .await
            .expect_err("should fail after retries");
        failing.assert_calls(3);
        assert!(error.to_string().contains("status 502"));
    }
}
