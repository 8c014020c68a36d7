//! The tool-calling loop that turns a model conversation into sandbox
//! actions and a terminal submission. One runtime, two roles; policy
//! (solver test-file confinement, output truncation, deterministic submit)
//! is enforced here rather than by prompting.

use crate::diff;
use crate::gateway::{AgentRole, Message, ModelGateway, ToolCall, ToolDefinition};
use crate::models::{
    ArtifactMetadata, BugArtifact, EpisodeConfig, TestStatus, ToolCallRecord,
};
use crate::sandbox::{EditOp, Sandbox};
use crate::tools::{
    injector_tools, solver_tools, TOOL_BASH, TOOL_CREATE_DIFF, TOOL_EDIT_FILE, TOOL_FIND_FILES,
    TOOL_LIST_DIR, TOOL_READ_FILE, TOOL_RUN_TESTS, TOOL_SUBMIT_ARTIFACT, TOOL_SUBMIT_PATCH,
};
use crate::CancelToken;
use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Instant;
use studio_core::{mint_id, BUGGY_SNAPSHOT, TEST_PARSER_FILENAME, TEST_SCRIPT_FILENAME};

pub const TOOL_RESULT_HISTORY_CAP: usize = 4096;
pub const TOOL_RESULT_PREVIEW_CAP: usize = 1000;
const GENERATION_MAX_TOKENS: u64 = 4096;
const NUDGE_MESSAGE: &str =
    "Please continue. Use the available tools to make progress toward your submission.";

/// How every component runs the test harness: the script's stdout feeds the
/// parser, and the parser's JSON is authoritative regardless of exit codes.
pub fn harness_command() -> String {
    format!(
        "sh {} 2>&1 | ./{}",
        TEST_SCRIPT_FILENAME, TEST_PARSER_FILENAME
    )
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TerminationReason {
    Submitted,
    BudgetExceeded,
    TokenLimit,
    GatewayFailure(String),
    Cancelled,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolTraceEntry {
    pub timestamp: DateTime<Utc>,
    pub tool_name: String,
    pub arguments: Value,
    pub result: String,
    pub duration_ms: u64,
}

#[derive(Debug)]
pub struct InjectorOutcome {
    pub artifact: Option<BugArtifact>,
    pub termination: TerminationReason,
    pub tool_calls: Vec<ToolCallRecord>,
    pub trace: Vec<ToolTraceEntry>,
    pub total_tokens: u64,
    pub duration_ms: u64,
}

#[derive(Debug)]
pub struct SolverOutcome {
    pub pred_patch: Option<String>,
    pub oracle_patch: String,
    pub termination: TerminationReason,
    pub tool_calls: Vec<ToolCallRecord>,
    pub trace: Vec<ToolTraceEntry>,
    pub total_tokens: u64,
    pub duration_ms: u64,
}

fn injector_system_prompt(config: &EpisodeConfig) -> String {
    let strategy_instructions = match config.injection_strategy {
        crate::models::InjectionStrategy::Direct => {
            "DIRECT INJECTION: introduce the bug by modifying existing logic. \
Subtle changes work best: off-by-one errors, flipped comparisons, missing checks."
        }
        crate::models::InjectionStrategy::RemovalOnly => {
            "REMOVAL-ONLY INJECTION: inject the bug only by removing code \
(lines, branches, or checks). Do not add new code, and keep the repository runnable."
        }
        crate::models::InjectionStrategy::HistoryAware => {
            "HISTORY-AWARE INJECTION: inspect the repository history \
(git log, git show) for past fixes, and reintroduce an old bug by reverting one."
        }
    };
    format!(
        "You are creating a bug-repair task from this repository.\n\
\n\
Produce, in order:\n\
1. A test script ({script}) that runs the test suite and writes raw output to stdout.\n\
2. The list of test files that make up the test surface.\n\
3. A test parser ({parser}) that reads the script output on stdin and prints a single \
JSON object mapping test id to \"passed\", \"failed\", \"skipped\" or \"error\".\n\
4. A unified diff (bug_inject_diff) that introduces a realistic bug in CODE files only.\n\
5. A unified diff (test_weaken_diff) that weakens TEST files only, so at least one \
test that fails under the bug passes again.\n\
\n\
Constraints: the baseline suite must pass with at least {min_passing} tests, the bug must \
fail at least {min_failing} tests, the bug must touch at least {min_changed} code files, \
and the harness must finish within {runtime} seconds.\n\
\n\
{strategy}\n\
\n\
Submit everything with the submit_artifact tool when ready.",
        script = TEST_SCRIPT_FILENAME,
        parser = TEST_PARSER_FILENAME,
        min_passing = config.min_passing_tests,
        min_failing = config.min_failing_tests,
        min_changed = config.min_changed_files,
        runtime = config.max_test_runtime_sec,
        strategy = strategy_instructions,
    )
}

fn solver_system_prompt(oracle_patch: &str) -> String {
    format!(
        "You are fixing a bug in this codebase.\n\
\n\
The diff below is the oracle test specification: assertions that should pass but are \
currently weakened. Your fix must make the restored tests pass.\n\
\n\
```diff\n{oracle}\n```\n\
\n\
Rules:\n\
- Fix the source code only. Test files cannot be edited and any test edits are \
discarded before evaluation.\n\
- The repository history has been re-initialized; do not look for it.\n\
- Run the tests often with run_tests, inspect your changes with create_diff, and \
submit with submit_patch when the suite passes.",
        oracle = oracle_patch,
    )
}

fn truncate_text(text: &str, cap: usize) -> (String, bool) {
    if text.len() <= cap {
        return (text.to_string(), false);
    }
    let mut cut = cap;
    while cut > 0 && !text.is_char_boundary(cut) {
        cut -= 1;
    }
    let mut truncated = text[..cut].to_string();
    truncated.push_str("\n... [truncated]");
    (truncated, true)
}

fn str_arg(args: &Value, key: &str) -> Option<String> {
    args.get(key).and_then(|v| v.as_str()).map(|s| s.to_string())
}

fn usize_arg(args: &Value, key: &str) -> Option<usize> {
    args.get(key).and_then(|v| v.as_u64()).map(|v| v as usize)
}

fn edit_op_from_args(args: &Value) -> Result<EditOp, String> {
    let path = str_arg(args, "file_path").ok_or("edit_file requires file_path")?;
    let operation = str_arg(args, "operation").ok_or("edit_file requires operation")?;
    match operation.as_str() {
        "full_replace" => Ok(EditOp::FullReplace {
            path,
            content: str_arg(args, "content").unwrap_or_default(),
        }),
        "search_replace" => Ok(EditOp::SearchReplace {
            path,
            old_text: str_arg(args, "old_text").ok_or("search_replace requires old_text")?,
            new_text: str_arg(args, "new_text").unwrap_or_default(),
        }),
        "insert_at_line" => Ok(EditOp::InsertAtLine {
            path,
            line: usize_arg(args, "line").unwrap_or(1),
            text: str_arg(args, "text").unwrap_or_default(),
        }),
        "delete_range" => {
            let start_line = usize_arg(args, "start_line").ok_or("delete_range requires start_line")?;
            Ok(EditOp::DeleteRange {
                path,
                start_line,
                end_line: usize_arg(args, "end_line").unwrap_or(start_line),
            })
        }
        "apply_unified_diff" => Ok(EditOp::ApplyUnifiedDiff {
            diff: str_arg(args, "diff").ok_or("apply_unified_diff requires diff")?,
        }),
        other => Err(format!("unknown edit operation: {}", other)),
    }
}

/// Executes shared tools against the sandbox and records the full-fidelity
/// trace plus the preview records that land in the attempt.
struct ToolSession<'a> {
    sandbox: &'a mut Sandbox,
    trace: Vec<ToolTraceEntry>,
    records: Vec<ToolCallRecord>,
}

impl<'a> ToolSession<'a> {
    fn new(sandbox: &'a mut Sandbox) -> ToolSession<'a> {
        ToolSession {
            sandbox,
            trace: Vec::new(),
            records: Vec::new(),
        }
    }

    fn record(&mut self, call: &ToolCall, result: String, started: Instant) -> String {
        let duration_ms = started.elapsed().as_millis() as u64;
        let timestamp = Utc::now();
        self.trace.push(ToolTraceEntry {
            timestamp,
            tool_name: call.name.clone(),
            arguments: call.arguments.clone(),
            result: result.clone(),
            duration_ms,
        });
        let (preview, preview_truncated) = truncate_text(&result, TOOL_RESULT_PREVIEW_CAP);
        self.records.push(ToolCallRecord {
            timestamp,
            tool_name: call.name.clone(),
            arguments: call.arguments.clone(),
            result_preview: preview,
            duration_ms,
            truncated: preview_truncated,
        });
        let (for_history, _) = truncate_text(&result, TOOL_RESULT_HISTORY_CAP);
        for_history
    }

    fn tool_bash(&mut self, args: &Value) -> String {
        let command = match str_arg(args, "command") {
            Some(command) => command,
            None => return "Error: bash requires a command".to_string(),
        };
        let timeout = args.get("timeout").and_then(|v| v.as_u64());
        let cwd = str_arg(args, "cwd");
        match self.sandbox.bash(&command, timeout, cwd.as_deref(), &[]) {
            Ok(result) => {
                let mut out = format!("Exit code: {}\n", result.exit_code);
                if !result.stdout.is_empty() {
                    out.push_str(&format!("STDOUT:\n{}\n", result.stdout));
                }
                if !result.stderr.is_empty() {
                    out.push_str(&format!("STDERR:\n{}\n", result.stderr));
                }
                if result.timed_out {
                    out.push_str("[command timed out]\n");
                }
                out
            }
            Err(e) => format!("Error: {}", e),
        }
    }

    fn tool_read_file(&mut self, args: &Value) -> String {
        let path = match str_arg(args, "file_path") {
            Some(path) => path,
            None => return "Error: read_file requires file_path".to_string(),
        };
        match self.sandbox.read_file(
            &path,
            usize_arg(args, "start_line"),
            usize_arg(args, "end_line"),
        ) {
            Ok(content) => content,
            Err(e) => format!("Error: {}", e),
        }
    }

    fn tool_edit_file(&mut self, args: &Value, forbidden_paths: &[String]) -> String {
        let op = match edit_op_from_args(args) {
            Ok(op) => op,
            Err(message) => return format!("Error: {}", message),
        };
        if !forbidden_paths.is_empty() {
            let touched: Vec<String> = match &op {
                EditOp::ApplyUnifiedDiff { diff } => diff::touched_paths(diff),
                EditOp::FullReplace { path, .. }
                | EditOp::SearchReplace { path, .. }
                | EditOp::InsertAtLine { path, .. }
                | EditOp::DeleteRange { path, .. } => vec![path.clone()],
            };
            for path in &touched {
                let normalized = path.trim_start_matches("./");
                if forbidden_paths.iter().any(|f| f == normalized) {
                    return "Error: editing test files is not permitted; \
fix the source code instead."
                        .to_string();
                }
            }
        }
        let results = self.sandbox.edit(&[op]);
        match results.first() {
            Some(result) if result.success => format!(
                "Edited {} ({} lines changed)",
                result.path, result.lines_changed
            ),
            Some(result) => format!(
                "Edit failed: {}",
                result.error.as_deref().unwrap_or("unknown error")
            ),
            None => "Edit failed: no result".to_string(),
        }
    }

    fn tool_list_dir(&mut self, args: &Value) -> String {
        let path = str_arg(args, "path").unwrap_or_else(|| ".".to_string());
        match self.sandbox.list_dir(&path) {
            Ok(entries) if entries.is_empty() => "(empty directory)".to_string(),
            Ok(entries) => entries
                .iter()
                .map(|e| {
                    if e.is_dir {
                        format!("{}/", e.name)
                    } else {
                        e.name.clone()
                    }
                })
                .collect::<Vec<_>>()
                .join("\n"),
            Err(e) => format!("Error: {}", e),
        }
    }

    fn tool_find_files(&mut self, args: &Value) -> String {
        let pattern = match str_arg(args, "pattern") {
            Some(pattern) => pattern,
            None => return "Error: find_files requires pattern".to_string(),
        };
        let path = str_arg(args, "path").unwrap_or_else(|| ".".to_string());
        match self.sandbox.find_files(&pattern, &path) {
            Ok(files) if files.is_empty() => "(no files found)".to_string(),
            Ok(files) => files.join("\n"),
            Err(e) => format!("Error: {}", e),
        }
    }

    fn tool_run_tests(&mut self, max_test_runtime_sec: u64) -> String {
        let result = match self.sandbox.bash(
            &harness_command(),
            Some(max_test_runtime_sec + 30),
            None,
            &[],
        ) {
            Ok(result) => result,
            Err(e) => return format!("Error: {}", e),
        };
        let stdout = result.stdout.trim();
        if stdout.is_empty() {
            return format!("Test execution produced no output:\n{}", result.stderr);
        }
        match serde_json::from_str::<Value>(stdout) {
            Ok(Value::Object(map)) => {
                let mut passed = 0usize;
                let mut failing: Vec<String> = Vec::new();
                for (test_id, status) in &map {
                    let status = status.as_str().unwrap_or("error");
                    if TestStatus::from_label(status) == TestStatus::Passed {
                        passed += 1;
                    } else {
                        failing.push(format!("  - {} ({})", test_id, status));
                    }
                }
                let mut summary = format!(
                    "Test results: {}/{} passed, {} not passing\n",
                    passed,
                    map.len(),
                    failing.len()
                );
                if !failing.is_empty() {
                    summary.push_str("Not passing:\n");
                    summary.push_str(&failing.join("\n"));
                }
                summary
            }
            _ => {
                let (preview, _) = truncate_text(stdout, 500);
                format!("Could not parse test results:\n{}", preview)
            }
        }
    }

    fn tool_create_diff(&mut self) -> String {
        match self.sandbox.diff_since(BUGGY_SNAPSHOT) {
            Ok(diff) if diff.trim().is_empty() => "No changes made yet.".to_string(),
            Ok(diff) => format!("Current changes:\n```diff\n{}\n```", diff),
            Err(e) => format!("Error: {}", e),
        }
    }
}

struct LoopState {
    messages: Vec<Message>,
    total_tokens: u64,
}

impl LoopState {
    fn push_tool_exchange(&mut self, content: &Option<String>, call: &ToolCall, result: String) {
        self.messages.push(Message::assistant_tool_call(
            content.clone().unwrap_or_default(),
            call,
        ));
        self.messages.push(Message::tool_result(&call.id, result));
    }

    fn push_nudge(&mut self, content: &Option<String>) {
        if let Some(content) = content {
            self.messages.push(Message::assistant(content.clone()));
        }
        self.messages.push(Message::user(NUDGE_MESSAGE));
    }
}

pub fn run_injector(
    sandbox: &mut Sandbox,
    gateway: &dyn ModelGateway,
    env_id: &str,
    config: &EpisodeConfig,
    cancel: &CancelToken,
) -> Result<InjectorOutcome> {
    let started = Instant::now();
    let tools: Vec<ToolDefinition> = injector_tools();
    let mut state = LoopState {
        messages: vec![
            Message::system(injector_system_prompt(config)),
            Message::user(
                "Explore this repository and create the bug artifact. Start by \
understanding the project structure and how its tests run.",
            ),
        ],
        total_tokens: 0,
    };
    let mut session = ToolSession::new(sandbox);
    let mut artifact: Option<BugArtifact> = None;
    let mut termination = TerminationReason::BudgetExceeded;

    'steps: for _ in 0..config.solver_max_tool_steps {
        if cancel.is_cancelled() {
            termination = TerminationReason::Cancelled;
            break;
        }
        if state.total_tokens >= config.solver_max_tokens {
            termination = TerminationReason::TokenLimit;
            break;
        }
        let generated = match gateway.generate(
            AgentRole::Injector,
            &state.messages,
            &tools,
            config.temperature,
            GENERATION_MAX_TOKENS,
        ) {
            Ok(generated) => generated,
            Err(e) => {
                termination = TerminationReason::GatewayFailure(e.to_string());
                break;
            }
        };
        state.total_tokens += generated.tokens.total_tokens;

        if generated.tool_calls.is_empty() {
            state.push_nudge(&generated.content);
            continue;
        }
        for call in &generated.tool_calls {
            let call_started = Instant::now();
            let result = match call.name.as_str() {
                TOOL_BASH => session.tool_bash(&call.arguments),
                TOOL_READ_FILE => session.tool_read_file(&call.arguments),
                TOOL_EDIT_FILE => session.tool_edit_file(&call.arguments, &[]),
                TOOL_LIST_DIR => session.tool_list_dir(&call.arguments),
                TOOL_FIND_FILES => session.tool_find_files(&call.arguments),
                TOOL_SUBMIT_ARTIFACT => {
                    match build_artifact(&call.arguments, env_id, config, gateway.model_id()) {
                        Ok(built) => {
                            let message = format!(
                                "Artifact submitted.\nArtifact id: {}\nTest files: {}\n\
The artifact will now be validated.",
                                built.metadata.artifact_id,
                                built.test_files.len()
                            );
                            artifact = Some(built);
                            message
                        }
                        Err(message) => format!("Submission rejected: {}", message),
                    }
                }
                other => format!("Unknown tool: {}", other),
            };
            let for_history = session.record(call, result, call_started);
            state.push_tool_exchange(&generated.content, call, for_history);
            if artifact.is_some() {
                termination = TerminationReason::Submitted;
                break 'steps;
            }
            if cancel.is_cancelled() {
                termination = TerminationReason::Cancelled;
                break 'steps;
            }
        }
    }

    Ok(InjectorOutcome {
        artifact,
        termination,
        tool_calls: session.records,
        trace: session.trace,
        total_tokens: state.total_tokens,
        duration_ms: started.elapsed().as_millis() as u64,
    })
}

fn build_artifact(
    args: &Value,
    env_id: &str,
    config: &EpisodeConfig,
    model_id: &str,
) -> Result<BugArtifact, String> {
    studio_schemas::validate_artifact_submission(args).map_err(|e| e.to_string())?;
    let test_files: Vec<String> = args["test_files"]
        .as_array()
        .map(|items| {
            items
                .iter()
                .filter_map(|v| v.as_str())
                .map(|s| s.to_string())
                .collect()
        })
        .unwrap_or_default();
    Ok(BugArtifact {
        metadata: ArtifactMetadata {
            artifact_id: mint_id("art"),
            env_id: env_id.to_string(),
            injection_strategy: config.injection_strategy,
            min_passing_tests: config.min_passing_tests,
            min_changed_files: config.min_changed_files,
            min_failing_tests: config.min_failing_tests,
            max_test_runtime_sec: config.max_test_runtime_sec,
            created_by_model: model_id.to_string(),
            created_at: Utc::now(),
            parent_artifact_id: None,
            bug_order: 1,
        },
        test_script: args["test_script"].as_str().unwrap_or_default().to_string(),
        test_files,
        test_parser: args["test_parser"].as_str().unwrap_or_default().to_string(),
        bug_inject_diff: args["bug_inject_diff"]
            .as_str()
            .unwrap_or_default()
            .to_string(),
        test_weaken_diff: args["test_weaken_diff"]
            .as_str()
            .unwrap_or_default()
            .to_string(),
    })
}

pub fn run_solver(
    sandbox: &mut Sandbox,
    gateway: &dyn ModelGateway,
    artifact: &BugArtifact,
    config: &EpisodeConfig,
    cancel: &CancelToken,
) -> Result<SolverOutcome> {
    let started = Instant::now();
    let oracle_patch = diff::reverse_unified_diff(&artifact.test_weaken_diff);
    let tools: Vec<ToolDefinition> = solver_tools();
    let forbidden: Vec<String> = artifact
        .test_files
        .iter()
        .map(|p| p.trim_start_matches("./").to_string())
        .collect();
    let mut state = LoopState {
        messages: vec![
            Message::system(solver_system_prompt(&oracle_patch)),
            Message::user(
                "Fix the bug in this codebase. Start by exploring it and \
understanding which tests the oracle restores.",
            ),
        ],
        total_tokens: 0,
    };
    let mut session = ToolSession::new(sandbox);
    let mut pred_patch: Option<String> = None;
    let mut termination = TerminationReason::BudgetExceeded;

    'steps: for _ in 0..config.solver_max_tool_steps {
        if cancel.is_cancelled() {
            termination = TerminationReason::Cancelled;
            break;
        }
        if state.total_tokens >= config.solver_max_tokens {
            termination = TerminationReason::TokenLimit;
            break;
        }
        let generated = match gateway.generate(
            AgentRole::Solver,
            &state.messages,
            &tools,
            config.temperature,
            GENERATION_MAX_TOKENS,
        ) {
            Ok(generated) => generated,
            Err(e) => {
                termination = TerminationReason::GatewayFailure(e.to_string());
                break;
            }
        };
        state.total_tokens += generated.tokens.total_tokens;

        if generated.tool_calls.is_empty() {
            state.push_nudge(&generated.content);
            continue;
        }
        for call in &generated.tool_calls {
            let call_started = Instant::now();
            let result = match call.name.as_str() {
                TOOL_BASH => session.tool_bash(&call.arguments),
                TOOL_READ_FILE => session.tool_read_file(&call.arguments),
                TOOL_EDIT_FILE => session.tool_edit_file(&call.arguments, &forbidden),
                TOOL_LIST_DIR => session.tool_list_dir(&call.arguments),
                TOOL_FIND_FILES => session.tool_find_files(&call.arguments),
                TOOL_RUN_TESTS => {
                    session.tool_run_tests(artifact.metadata.max_test_runtime_sec)
                }
                TOOL_CREATE_DIFF => session.tool_create_diff(),
                TOOL_SUBMIT_PATCH => {
                    match resolve_submitted_patch(session.sandbox, &call.arguments) {
                        Ok(patch) => {
                            pred_patch = Some(patch);
                            "Patch submitted. It will be evaluated against the \
restored oracle tests."
                                .to_string()
                        }
                        Err(message) => format!("Submission rejected: {}", message),
                    }
                }
                other => format!("Unknown tool: {}", other),
            };
            let for_history = session.record(call, result, call_started);
            state.push_tool_exchange(&generated.content, call, for_history);
            if pred_patch.is_some() {
                termination = TerminationReason::Submitted;
                break 'steps;
            }
            if cancel.is_cancelled() {
                termination = TerminationReason::Cancelled;
                break 'steps;
            }
        }
    }

    Ok(SolverOutcome {
        pred_patch,
        oracle_patch,
        termination,
        tool_calls: session.records,
        trace: session.trace,
        total_tokens: state.total_tokens,
        duration_ms: started.elapsed().as_millis() as u64,
    })
}

/// A bare submit_patch synthesizes the patch from everything the solver
/// changed since the buggy snapshot.
fn resolve_submitted_patch(sandbox: &mut Sandbox, args: &Value) -> Result<String, String> {
    let patch = if let Some(patch) = str_arg(args, "patch") {
        patch
    } else if let Some(patch_file) = str_arg(args, "patch_file") {
        sandbox
            .read_file(&patch_file, None, None)
            .map_err(|e| e.to_string())?
    } else {
        sandbox
            .diff_since(BUGGY_SNAPSHOT)
            .map_err(|e| e.to_string())?
    };
    if patch.trim().is_empty() {
        return Err("empty patch; make some changes first".to_string());
    }
    Ok(patch)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::{GenerationResult, ScriptedGateway};
    use crate::sandbox::SandboxLimits;
    use serde_json::json;
    use std::fs;
    use std::path::PathBuf;
    use studio_core::ensure_dir;

    fn temp_base(label: &str) -> PathBuf {
        let nanos = Utc::now().timestamp_nanos_opt().unwrap_or(0);
        std::env::temp_dir().join(format!(
            "studio_agent_{}_{}_{}",
            label,
            std::process::id(),
            nanos
        ))
    }

    fn seed_image(base: &PathBuf) -> PathBuf {
        let image = base.join("image");
        ensure_dir(&image.join("tests")).expect("image dirs");
        fs::write(image.join("lib.sh"), "add() {\n    echo $(( $1 + $2 ))\n}\n")
            .expect("lib");
        fs::write(image.join("tests").join("checks.txt"), "add 1 2 3 test_add\n")
            .expect("checks");
        image
    }

    fn started_sandbox(base: &PathBuf) -> Sandbox {
        let image = seed_image(base);
        let mut sandbox = Sandbox::process(base.join("sbx"), image, SandboxLimits::default());
        sandbox.start().expect("start");
        sandbox
    }

    fn submission_args() -> Value {
        json!({
            "test_script": "#!/bin/sh\necho PASS test_add\n",
            "test_files": ["tests/checks.txt"],
            "test_parser": "#!/bin/sh\nawk 'BEGIN{print \"{}\"}'\n",
            "bug_inject_diff": "--- a/lib.sh\n+++ b/lib.sh\n@@ -1 +1 @@\n-x\n+y\n",
            "test_weaken_diff": "--- a/tests/checks.txt\n+++ b/tests/checks.txt\n@@ -1 +1 @@\n-x\n+y\n",
        })
    }

    #[test]
    fn injector_submits_artifact_and_terminates() {
        let base = temp_base("inject");
        let mut sandbox = started_sandbox(&base);
        let gateway = ScriptedGateway::new(
            "scripted",
            vec![
                GenerationResult::tool("bash", json!({"command": "ls"})),
                GenerationResult::tool("submit_artifact", submission_args()),
            ],
        );
        let outcome = run_injector(
            &mut sandbox,
            &gateway,
            "env_1",
            &EpisodeConfig::default(),
            &CancelToken::new(),
        )
        .expect("run injector");
        assert_eq!(outcome.termination, TerminationReason::Submitted);
        let artifact = outcome.artifact.expect("artifact");
        assert_eq!(artifact.test_files, vec!["tests/checks.txt"]);
        assert!(artifact.metadata.artifact_id.starts_with("art_"));
        assert_eq!(outcome.tool_calls.len(), 2);
        assert_eq!(outcome.trace.len(), 2);
        let _ = fs::remove_dir_all(base);
    }

    #[test]
    fn injector_rejects_malformed_submission_then_accepts_retry() {
        let base = temp_base("inject_retry");
        let mut sandbox = started_sandbox(&base);
        let mut incomplete = submission_args();
        incomplete.as_object_mut().unwrap().remove("test_parser");
        let gateway = ScriptedGateway::new(
            "scripted",
            vec![
                GenerationResult::tool("submit_artifact", incomplete),
                GenerationResult::tool("submit_artifact", submission_args()),
            ],
        );
        let outcome = run_injector(
            &mut sandbox,
            &gateway,
            "env_1",
            &EpisodeConfig::default(),
            &CancelToken::new(),
        )
        .expect("run injector");
        assert_eq!(outcome.termination, TerminationReason::Submitted);
        assert!(outcome.tool_calls[0]
            .result_preview
            .contains("Submission rejected"));
        let _ = fs::remove_dir_all(base);
    }

    #[test]
    fn injector_without_submission_exceeds_budget() {
        let base = temp_base("inject_budget");
        let mut sandbox = started_sandbox(&base);
        let gateway = ScriptedGateway::new(
            "scripted",
            vec![
                GenerationResult::text("thinking..."),
                GenerationResult::text("still thinking..."),
            ],
        );
        let config = EpisodeConfig {
            solver_max_tool_steps: 2,
            ..EpisodeConfig::default()
        };
        let outcome = run_injector(&mut sandbox, &gateway, "env_1", &config, &CancelToken::new())
            .expect("run injector");
        assert_eq!(outcome.termination, TerminationReason::BudgetExceeded);
        assert!(outcome.artifact.is_none());
        let _ = fs::remove_dir_all(base);
    }

    fn fixture_artifact() -> BugArtifact {
        BugArtifact {
            metadata: ArtifactMetadata {
                artifact_id: "art_test".to_string(),
                env_id: "env_1".to_string(),
                injection_strategy: crate::models::InjectionStrategy::Direct,
                min_passing_tests: 1,
                min_changed_files: 1,
                min_failing_tests: 1,
                max_test_runtime_sec: 30,
                created_by_model: "scripted".to_string(),
                created_at: Utc::now(),
                parent_artifact_id: None,
                bug_order: 1,
            },
            test_script: "#!/bin/sh\n".to_string(),
            test_files: vec!["tests/checks.txt".to_string()],
            test_parser: "#!/bin/sh\n".to_string(),
            bug_inject_diff: String::new(),
            test_weaken_diff: "--- a/tests/checks.txt\n+++ b/tests/checks.txt\n\
@@ -1 +1 @@\n-add 1 2 3 test_add\n+add 1 2 0 test_add\n"
                .to_string(),
        }
    }

    #[test]
    fn solver_refuses_test_file_edits() {
        let base = temp_base("solver_confine");
        let mut sandbox = started_sandbox(&base);
        sandbox.snapshot_init().expect("init");
        sandbox.bash("git init -q", None, None, &[]).expect("git");
        sandbox.snapshot_tag(BUGGY_SNAPSHOT).expect("tag");
        let gateway = ScriptedGateway::new(
            "scripted",
            vec![
                GenerationResult::tool(
                    "edit_file",
                    json!({
                        "file_path": "tests/checks.txt",
                        "operation": "full_replace",
                        "content": "cheating",
                    }),
                ),
                GenerationResult::tool(
                    "edit_file",
                    json!({
                        "file_path": "lib.sh",
                        "operation": "search_replace",
                        "old_text": "+ $2",
                        "new_text": "+ $2 ",
                    }),
                ),
                GenerationResult::tool("submit_patch", json!({})),
            ],
        );
        let outcome = run_solver(
            &mut sandbox,
            &gateway,
            &fixture_artifact(),
            &EpisodeConfig::default(),
            &CancelToken::new(),
        )
        .expect("run solver");
        assert_eq!(outcome.termination, TerminationReason::Submitted);
        assert!(outcome.tool_calls[0]
            .result_preview
            .contains("not permitted"));
        // The refused edit never reached the workspace.
        assert_eq!(
            sandbox
                .read_file("tests/checks.txt", None, None)
                .expect("read"),
            "add 1 2 3 test_add\n"
        );
        // Deterministic submit picked up the real edit.
        let patch = outcome.pred_patch.expect("patch");
        assert!(patch.contains("lib.sh"));
        let _ = fs::remove_dir_all(base);
    }

    #[test]
    fn solver_rejects_diff_that_touches_test_files() {
        let base = temp_base("solver_diff_confine");
        let mut sandbox = started_sandbox(&base);
        sandbox.snapshot_init().expect("init");
        sandbox.bash("git init -q", None, None, &[]).expect("git");
        sandbox.snapshot_tag(BUGGY_SNAPSHOT).expect("tag");
        let sneaky_diff = "--- a/tests/checks.txt\n+++ b/tests/checks.txt\n\
@@ -1 +1 @@\n-add 1 2 3 test_add\n+add 1 2 0 test_add\n";
        let gateway = ScriptedGateway::new(
            "scripted",
            vec![
                GenerationResult::tool(
                    "edit_file",
                    json!({
                        "file_path": "tests/checks.txt",
                        "operation": "apply_unified_diff",
                        "diff": sneaky_diff,
                    }),
                ),
                GenerationResult::tool("submit_patch", json!({"patch": "--- a/x\n+++ b/x\n"})),
            ],
        );
        let outcome = run_solver(
            &mut sandbox,
            &gateway,
            &fixture_artifact(),
            &EpisodeConfig::default(),
            &CancelToken::new(),
        )
        .expect("run solver");
        assert!(outcome.tool_calls[0]
            .result_preview
            .contains("not permitted"));
        let _ = fs::remove_dir_all(base);
    }

    #[test]
    fn solver_empty_submission_is_rejected_until_changes_exist() {
        let base = temp_base("solver_empty");
        let mut sandbox = started_sandbox(&base);
        sandbox.snapshot_init().expect("init");
        sandbox.bash("git init -q", None, None, &[]).expect("git");
        sandbox.snapshot_tag(BUGGY_SNAPSHOT).expect("tag");
        let gateway = ScriptedGateway::new(
            "scripted",
            vec![
                GenerationResult::tool("submit_patch", json!({})),
                GenerationResult::tool(
                    "edit_file",
                    json!({
                        "file_path": "lib.sh",
                        "operation": "search_replace",
                        "old_text": "echo $(( $1 + $2 ))",
                        "new_text": "echo $(( $2 + $1 ))",
                    }),
                ),
                GenerationResult::tool("submit_patch", json!({})),
            ],
        );
        let outcome = run_solver(
            &mut sandbox,
            &gateway,
            &fixture_artifact(),
            &EpisodeConfig::default(),
            &CancelToken::new(),
        )
        .expect("run solver");
        assert!(outcome.tool_calls[0]
            .result_preview
            .contains("Submission rejected"));
        assert_eq!(outcome.termination, TerminationReason::Submitted);
        assert!(outcome.pred_patch.expect("patch").contains("$2 + $1"));
        let _ = fs::remove_dir_all(base);
    }

    #[test]
    fn oracle_patch_is_the_reversed_weakening() {
        let artifact = fixture_artifact();
        let oracle = diff::reverse_unified_diff(&artifact.test_weaken_diff);
        assert!(oracle.contains("+add 1 2 3 test_add"));
        assert!(oracle.contains("-add 1 2 0 test_add"));
    }
}
