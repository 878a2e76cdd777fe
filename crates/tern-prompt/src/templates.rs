//! Agent instruction payloads rendered with minijinja.

use anyhow::{Context, Result};
use minijinja::{context, Environment};
use serde::Serialize;
use tern_registry::{SessionTarget, TriggerKind, TriggerMessage};

/// Workspace-relative file the agent writes its final reply to.
pub const REPLY_FILE: &str = ".tern/reply.md";

const TASK_TEMPLATE: &str = include_str!("templates/task.md");
const FOLLOWUP_TEMPLATE: &str = include_str!("templates/followup.md");
const CLARIFICATION_ANSWER_TEMPLATE: &str = include_str!("templates/clarification_answer.md");
const REPLY_PROTOCOL_TEMPLATE: &str = include_str!("templates/reply_protocol.md");

#[derive(Debug, Clone, Serialize)]
struct TriggerView<'a> {
    comment_id: u64,
    author: &'a str,
    body: &'a str,
    path: Option<&'a str>,
    line: Option<u64>,
}

impl<'a> TriggerView<'a> {
    fn from_trigger(trigger: &'a TriggerMessage) -> Self {
        let (path, line) = match &trigger.kind {
            TriggerKind::Inline { path, line } => (path.as_deref(), *line),
            TriggerKind::Discussion => (None, None),
        };
        Self {
            comment_id: trigger.comment_id,
            author: &trigger.author,
            body: trigger.body.trim(),
            path,
            line,
        }
    }
}

fn views(triggers: &[TriggerMessage]) -> Vec<TriggerView<'_>> {
    triggers.iter().map(TriggerView::from_trigger).collect()
}

fn target_kind(target: SessionTarget) -> &'static str {
    if target.is_issue() {
        "issue"
    } else {
        "pull request"
    }
}

/// Inputs for the first prompt of a session.
#[derive(Debug, Clone, Copy)]
pub struct TaskContext<'a> {
    pub repo: &'a str,
    pub branch: &'a str,
    pub target: SessionTarget,
    pub issue_body: Option<&'a str>,
    pub triggers: &'a [TriggerMessage],
}

pub struct PromptBuilder {
    env: Environment<'static>,
}

impl PromptBuilder {
    pub fn new() -> Result<Self> {
        let mut env = Environment::new();
        env.add_template("reply_protocol", REPLY_PROTOCOL_TEMPLATE)
            .context("invalid reply protocol template")?;
        env.add_template("task", TASK_TEMPLATE)
            .context("invalid task template")?;
        env.add_template("followup", FOLLOWUP_TEMPLATE)
            .context("invalid followup template")?;
        env.add_template("clarification_answer", CLARIFICATION_ANSWER_TEMPLATE)
            .context("invalid clarification answer template")?;
        Ok(Self { env })
    }

    pub fn render_task(&self, task: &TaskContext<'_>) -> Result<String> {
        let template = self.env.get_template("task")?;
        let rendered = template
            .render(context! {
                repo => task.repo,
                branch => task.branch,
                number => task.target.number(),
                is_issue => task.target.is_issue(),
                issue_body => task.issue_body.map(str::trim).filter(|body| !body.is_empty()),
                triggers => views(task.triggers),
                has_inline => task.triggers.iter().any(TriggerMessage::is_inline),
                reply_file => REPLY_FILE,
            })
            .context("failed to render task prompt")?;
        Ok(rendered.trim().to_string())
    }

    pub fn render_followup(
        &self,
        target: SessionTarget,
        triggers: &[TriggerMessage],
    ) -> Result<String> {
        let template = self.env.get_template("followup")?;
        let rendered = template
            .render(context! {
                kind => target_kind(target),
                number => target.number(),
                is_issue => target.is_issue(),
                triggers => views(triggers),
                has_inline => triggers.iter().any(TriggerMessage::is_inline),
                reply_file => REPLY_FILE,
            })
            .context("failed to render followup prompt")?;
        Ok(rendered.trim().to_string())
    }

    pub fn render_clarification_answer(
        &self,
        target: SessionTarget,
        question: &str,
        answers: &[TriggerMessage],
    ) -> Result<String> {
        let template = self.env.get_template("clarification_answer")?;
        let rendered = template
            .render(context! {
                question => question.trim(),
                is_issue => target.is_issue(),
                triggers => views(answers),
                has_inline => answers.iter().any(TriggerMessage::is_inline),
                reply_file => REPLY_FILE,
            })
            .context("failed to render clarification answer prompt")?;
        Ok(rendered.trim().to_string())
    }
}
