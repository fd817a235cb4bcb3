//! Tool registry and the built-in tools.
//!
//! The turn engine asks the registry for definitions before every model
//! call, so tools registered or replaced mid-session are visible on the
//! next round.  Results longer than the configured limit are truncated
//! before they enter history.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::RwLock;
use serde::Deserialize;
use serde_json::Value;
use tokio::process::Command;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

use sb_domain::error::{Error, Result};
use sb_domain::tool::{ContentBlock, ToolDefinition, ToolResultContent};

use super::restart::{write_marker, RestartMarker};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tool contract
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// What a tool sees of the turn that invoked it.
#[derive(Debug, Clone)]
pub struct ToolContext {
    pub route: String,
    pub session_id: String,
    pub working_dir: PathBuf,
    /// Fires when the turn is aborted.
    pub cancel: CancellationToken,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ToolOutput {
    pub content: ToolResultContent,
    pub is_error: bool,
}

impl ToolOutput {
    pub fn text(content: impl Into<String>) -> Self {
        Self {
            content: ToolResultContent::Text(content.into()),
            is_error: false,
        }
    }

    pub fn error(content: impl Into<String>) -> Self {
        Self {
            content: ToolResultContent::Text(content.into()),
            is_error: true,
        }
    }
}

/// A capability the model can invoke.
#[async_trait]
pub trait Tool: Send + Sync {
    fn definition(&self) -> ToolDefinition;

    async fn execute(&self, input: Value, ctx: &ToolContext) -> Result<ToolOutput>;
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Registry
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Registered tools in registration order.
#[derive(Default)]
pub struct ToolRegistry {
    tools: RwLock<Vec<Arc<dyn Tool>>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a tool, replacing any tool with the same name.  Returns the
    /// replaced tool.
    pub fn register(&self, tool: Arc<dyn Tool>) -> Option<Arc<dyn Tool>> {
        let name = tool.definition().name;
        let mut tools = self.tools.write();
        match tools.iter().position(|t| t.definition().name == name) {
            Some(pos) => Some(std::mem::replace(&mut tools[pos], tool)),
            None => {
                tools.push(tool);
                None
            }
        }
    }

    pub fn remove(&self, name: &str) -> Option<Arc<dyn Tool>> {
        let mut tools = self.tools.write();
        let pos = tools.iter().position(|t| t.definition().name == name)?;
        Some(tools.remove(pos))
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.tools
            .read()
            .iter()
            .find(|t| t.definition().name == name)
            .cloned()
    }

    /// Current definitions, in registration order.
    pub fn definitions(&self) -> Vec<ToolDefinition> {
        self.tools.read().iter().map(|t| t.definition()).collect()
    }

    pub fn names(&self) -> Vec<String> {
        self.tools
            .read()
            .iter()
            .map(|t| t.definition().name)
            .collect()
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Result truncation
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Keep the first `head` and last `tail` characters of `text` when it is
/// longer than `max` characters.  Returns the text and the number of
/// characters dropped.
pub fn truncate_tool_result(text: &str, max: usize, head: usize, tail: usize) -> (String, usize) {
    let total = text.chars().count();
    if total <= max {
        return (text.to_owned(), 0);
    }
    let head = head.min(total);
    let tail = tail.min(total - head);
    let dropped = total - head - tail;
    if dropped == 0 {
        return (text.to_owned(), 0);
    }

    let start: String = text.chars().take(head).collect();
    let end: String = text.chars().skip(total - tail).collect();
    (
        format!("{start}\n\n[truncated {dropped} characters]\n\n{end}"),
        dropped,
    )
}

/// Apply [`truncate_tool_result`] to every text part of a result.
pub fn truncate_result_content(
    content: ToolResultContent,
    max: usize,
    head: usize,
    tail: usize,
) -> (ToolResultContent, usize) {
    match content {
        ToolResultContent::Text(text) => {
            let (text, dropped) = truncate_tool_result(&text, max, head, tail);
            (ToolResultContent::Text(text), dropped)
        }
        ToolResultContent::Blocks(blocks) => {
            let mut dropped_total = 0;
            let blocks = blocks
                .into_iter()
                .map(|block| match block {
                    ContentBlock::Text { text } => {
                        let (text, dropped) = truncate_tool_result(&text, max, head, tail);
                        dropped_total += dropped;
                        ContentBlock::Text { text }
                    }
                    other => other,
                })
                .collect();
            (ToolResultContent::Blocks(blocks), dropped_total)
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// exec
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Deserialize)]
struct ExecRequest {
    command: String,
    /// Override the configured timeout (seconds).
    timeout_sec: Option<u64>,
}

/// Runs a shell command in the turn's working directory.
pub struct ExecTool {
    timeout_sec: u64,
}

impl ExecTool {
    pub fn new(timeout_sec: u64) -> Self {
        Self { timeout_sec }
    }
}

#[async_trait]
impl Tool for ExecTool {
    fn definition(&self) -> ToolDefinition {
        ToolDefinition {
            name: "exec".into(),
            description: "Run a shell command in the working directory and return its output.".into(),
            input_schema: serde_json::json!({
                "type": "object",
                "properties": {
                    "command": { "type": "string", "description": "Shell command to execute" },
                    "timeout_sec": { "type": "integer", "description": "Hard timeout in seconds" }
                },
                "required": ["command"]
            }),
        }
    }

    async fn execute(&self, input: Value, ctx: &ToolContext) -> Result<ToolOutput> {
        let req: ExecRequest = match serde_json::from_value(input) {
            Ok(r) => r,
            Err(e) => return Ok(ToolOutput::error(format!("invalid exec arguments: {e}"))),
        };
        let timeout_sec = req.timeout_sec.unwrap_or(self.timeout_sec);

        let mut cmd = Command::new("sh");
        cmd.arg("-c")
            .arg(&req.command)
            .current_dir(&ctx.working_dir)
            .stdin(std::process::Stdio::null())
            .kill_on_drop(true);

        tracing::debug!(command = %req.command, timeout_sec, "exec");

        let output = tokio::select! {
            _ = ctx.cancel.cancelled() => return Err(Error::Cancelled),
            res = tokio::time::timeout(Duration::from_secs(timeout_sec), cmd.output()) => match res {
                Ok(Ok(output)) => output,
                Ok(Err(e)) => return Ok(ToolOutput::error(format!("failed to spawn: {e}"))),
                Err(_) => {
                    return Ok(ToolOutput::error(format!(
                        "command timed out after {timeout_sec}s"
                    )))
                }
            },
        };

        let mut text = String::from_utf8_lossy(&output.stdout).into_owned();
        let stderr = String::from_utf8_lossy(&output.stderr);
        if !stderr.trim().is_empty() {
            if !text.is_empty() && !text.ends_with('\n') {
                text.push('\n');
            }
            text.push_str("[stderr]\n");
            text.push_str(&stderr);
        }
        match output.status.code() {
            Some(code) => text.push_str(&format!("\n[exit code: {code}]")),
            None => text.push_str("\n[terminated by signal]"),
        }

        Ok(ToolOutput {
            content: ToolResultContent::Text(text),
            is_error: !output.status.success(),
        })
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// restart
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Records a restart marker for the calling route and asks the process to
/// shut down.  The next start resumes the route.
pub struct RestartTool {
    state_path: PathBuf,
    shutdown: Arc<Notify>,
}

impl RestartTool {
    pub fn new(state_path: PathBuf, shutdown: Arc<Notify>) -> Self {
        Self {
            state_path,
            shutdown,
        }
    }
}

#[async_trait]
impl Tool for RestartTool {
    fn definition(&self) -> ToolDefinition {
        ToolDefinition {
            name: "restart".into(),
            description: "Restart the agent process. The conversation resumes automatically after the restart.".into(),
            input_schema: serde_json::json!({ "type": "object", "properties": {} }),
        }
    }

    async fn execute(&self, _input: Value, ctx: &ToolContext) -> Result<ToolOutput> {
        let marker = RestartMarker::new(&ctx.route, &ctx.session_id);
        write_marker(&self.state_path, &marker)?;
        tracing::info!(route = %ctx.route, session_id = %ctx.session_id, "restart requested");
        self.shutdown.notify_one();
        Ok(ToolOutput::text("Restart scheduled."))
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tests
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx(dir: &std::path::Path) -> ToolContext {
        ToolContext {
            route: "test".into(),
            session_id: "s1".into(),
            working_dir: dir.to_path_buf(),
            cancel: CancellationToken::new(),
        }
    }

    #[test]
    fn truncation_keeps_head_and_tail() {
        let text: String = "a".repeat(50) + &"b".repeat(100) + &"c".repeat(50);
        let (out, dropped) = truncate_tool_result(&text, 120, 50, 50);
        assert_eq!(dropped, 100);
        assert!(out.starts_with(&"a".repeat(50)));
        assert!(out.ends_with(&"c".repeat(50)));
        assert!(out.contains("[truncated 100 characters]"));
        assert!(!out.contains('b'));
    }

    #[test]
    fn short_results_pass_through() {
        let (out, dropped) = truncate_tool_result("hello", 10, 2, 2);
        assert_eq!(out, "hello");
        assert_eq!(dropped, 0);
    }

    #[test]
    fn truncation_counts_chars_not_bytes() {
        let text = "é".repeat(30);
        let (out, dropped) = truncate_tool_result(&text, 20, 5, 5);
        assert_eq!(dropped, 20);
        assert!(out.starts_with("ééééé\n"));
    }

    #[test]
    fn registry_replaces_by_name() {
        let reg = ToolRegistry::new();
        assert!(reg.register(Arc::new(ExecTool::new(5))).is_none());
        assert!(reg.register(Arc::new(ExecTool::new(10))).is_some());
        assert_eq!(reg.names(), vec!["exec".to_string()]);
        assert!(reg.remove("exec").is_some());
        assert!(reg.definitions().is_empty());
    }

    #[tokio::test]
    async fn exec_reports_output_and_exit_code() {
        let dir = tempfile::tempdir().unwrap();
        let tool = ExecTool::new(10);

        let out = tool
            .execute(serde_json::json!({"command": "echo hi"}), &ctx(dir.path()))
            .await
            .unwrap();
        assert!(!out.is_error);
        let text = out.content.as_text();
        assert!(text.starts_with("hi\n"));
        assert!(text.ends_with("[exit code: 0]"));

        let out = tool
            .execute(serde_json::json!({"command": "exit 3"}), &ctx(dir.path()))
            .await
            .unwrap();
        assert!(out.is_error);
        assert!(out.content.as_text().ends_with("[exit code: 3]"));
    }

    #[tokio::test]
    async fn exec_times_out() {
        let dir = tempfile::tempdir().unwrap();
        let out = ExecTool::new(10)
            .execute(
                serde_json::json!({"command": "sleep 5", "timeout_sec": 0}),
                &ctx(dir.path()),
            )
            .await
            .unwrap();
        assert!(out.is_error);
        assert!(out.content.as_text().contains("timed out"));
    }

    #[tokio::test]
    async fn exec_honours_cancellation() {
        let dir = tempfile::tempdir().unwrap();
        let c = ctx(dir.path());
        c.cancel.cancel();
        let res = ExecTool::new(10)
            .execute(serde_json::json!({"command": "sleep 5"}), &c)
            .await;
        assert!(matches!(res, Err(Error::Cancelled)));
    }

    #[tokio::test]
    async fn restart_writes_marker_and_signals() {
        let dir = tempfile::tempdir().unwrap();
        let shutdown = Arc::new(Notify::new());
        let tool = RestartTool::new(dir.path().to_path_buf(), shutdown.clone());

        let out = tool
            .execute(serde_json::json!({}), &ctx(dir.path()))
            .await
            .unwrap();
        assert!(!out.is_error);
        // notify_one stores a permit, so this completes immediately.
        shutdown.notified().await;

        let marker = super::super::restart::take_marker(dir.path()).unwrap();
        assert_eq!(marker.route, "test");
        assert_eq!(marker.session_id, "s1");
    }
}
