//! Episode pipeline for self-play software repair: an injector fabricates a
//! bug artifact in a sandboxed copy of a target repository, a validator
//! proves the artifact is a legitimate task, N solver attempts try to repair
//! it seeing only the oracle, and both roles are rewarded from the outcome.
//!
//! Episodes run in parallel on independent sandboxes; within one episode the
//! stages are strictly sequential and solver attempts share one sandbox with
//! snapshot rollback in between.

pub mod agent;
pub mod diff;
pub mod gateway;
pub mod models;
pub mod reward;
pub mod sandbox;
pub mod sink;
#[cfg(test)]
pub mod testfix;
pub mod tools;
pub mod validator;

pub use gateway::{GatewaySettings, HttpGateway, ModelGateway, ScriptedGateway};
pub use models::{
    Environment, Episode, EpisodeConfig, EpisodeStatus, EpisodeSummary, InjectionStrategy,
    LanguageHint,
};
pub use sandbox::{Sandbox, SandboxLimits};
pub use validator::ValidatorSettings;

use crate::agent::TerminationReason;
use crate::models::{
    BugArtifact, EvaluationReport, SolverAttempt, TestMap, TestStatus, TestSummary,
};
use crate::sandbox::SandboxError;
use crate::sink::{AttemptRow, EpisodeRow, EpisodeSink, JsonlEpisodeSink, ValidationStepRow};
use crate::validator::Validator;
use anyhow::{anyhow, Context, Result};
use chrono::Utc;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{mpsc, Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};
use studio_core::{
    atomic_write_json_pretty, ensure_dir, mint_id, studio_paths, ObjectStore, StudioPaths,
    BASELINE_SNAPSHOT, BUGGY_SNAPSHOT, BUG_INJECT_DIFF_FILENAME, PRED_PATCH_FILENAME,
    TEST_FILES_FILENAME, TEST_PARSER_FILENAME, TEST_SCRIPT_FILENAME, TEST_WEAKEN_DIFF_FILENAME,
    TOOL_TRACE_FILENAME,
};

pub const SCHEDULER_CAPACITY_ERROR_PREFIX: &str = "episode scheduler at capacity:";
const EPISODE_CONTROL_SCHEMA_V1: &str = "episode_control_v1";

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct StudioConfig {
    pub studio_dir: PathBuf,
    pub sandbox: SandboxLimits,
    pub gateway: GatewaySettings,
    pub validator: ValidatorSettings,
    pub max_live_sandboxes: usize,
}

impl StudioConfig {
    pub fn new(studio_dir: impl AsRef<Path>) -> StudioConfig {
        StudioConfig {
            studio_dir: studio_dir.as_ref().to_path_buf(),
            sandbox: SandboxLimits::default(),
            gateway: GatewaySettings::default(),
            validator: ValidatorSettings::default(),
            max_live_sandboxes: 10,
        }
    }

    /// Defaults overridden by `SSR_STUDIO_*` environment variables.
    pub fn from_env(studio_dir: impl AsRef<Path>) -> Result<StudioConfig> {
        let mut config = StudioConfig::new(studio_dir);
        if let Some(value) = parse_optional_positive_u64_env("SSR_STUDIO_BASH_TIMEOUT_SECS")? {
            config.sandbox.bash_timeout_secs = value;
        }
        if let Some(value) = parse_optional_bool_env("SSR_STUDIO_NETWORK_ENABLED")? {
            config.sandbox.network_enabled = value;
        }
        if let Some(value) = parse_optional_positive_usize_env("SSR_STUDIO_MAX_LIVE_SANDBOXES")? {
            config.max_live_sandboxes = value;
        }
        if let Ok(value) = env::var("SSR_STUDIO_GATEWAY_URL") {
            if !value.trim().is_empty() {
                config.gateway.endpoint = value.trim().to_string();
            }
        }
        if let Ok(value) = env::var("SSR_STUDIO_GATEWAY_MODEL") {
            if !value.trim().is_empty() {
                config.gateway.model = value.trim().to_string();
            }
        }
        if let Ok(token_env) = env::var("SSR_STUDIO_GATEWAY_TOKEN_ENV") {
            if !token_env.trim().is_empty() {
                config.gateway.bearer_token = env::var(token_env.trim()).ok();
            }
        }
        if let Some(value) = parse_optional_positive_usize_env("SSR_STUDIO_GATEWAY_MAX_ATTEMPTS")? {
            config.gateway.max_attempts = value;
        }
        if let Some(value) = parse_optional_positive_u64_env("SSR_STUDIO_VALIDATOR_RETRIES")? {
            config.validator.retry_count = value as u32;
        }
        Ok(config)
    }

    pub fn paths(&self) -> StudioPaths {
        studio_paths(&self.studio_dir)
    }
}

fn parse_optional_positive_u64_env(name: &str) -> Result<Option<u64>> {
    match env::var(name) {
        Err(_) => Ok(None),
        Ok(raw) if raw.trim().is_empty() => Ok(None),
        Ok(raw) => {
            let value: u64 = raw
                .trim()
                .parse()
                .map_err(|_| anyhow!("{} must be a positive integer, got {:?}", name, raw))?;
            if value == 0 {
                return Err(anyhow!("{} must be greater than zero", name));
            }
            Ok(Some(value))
        }
    }
}

fn parse_optional_positive_usize_env(name: &str) -> Result<Option<usize>> {
    Ok(parse_optional_positive_u64_env(name)?.map(|v| v as usize))
}

fn parse_optional_bool_env(name: &str) -> Result<Option<bool>> {
    match env::var(name) {
        Err(_) => Ok(None),
        Ok(raw) => match raw.trim() {
            "" => Ok(None),
            "1" | "true" => Ok(Some(true)),
            "0" | "false" => Ok(Some(false)),
            other => Err(anyhow!("{} must be a boolean, got {:?}", name, other)),
        },
    }
}

// ---------------------------------------------------------------------------
// Cancellation
// ---------------------------------------------------------------------------

/// Cooperative cancellation: an in-process flag plus an optional control file
/// other processes can write. Checked at every suspension point.
#[derive(Clone, Default)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
    control_path: Option<PathBuf>,
}

impl CancelToken {
    pub fn new() -> CancelToken {
        CancelToken::default()
    }

    pub fn with_control_file(path: impl AsRef<Path>) -> CancelToken {
        CancelToken {
            flag: Arc::new(AtomicBool::new(false)),
            control_path: Some(path.as_ref().to_path_buf()),
        }
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        if self.flag.load(Ordering::SeqCst) {
            return true;
        }
        if let Some(path) = &self.control_path {
            if let Ok(bytes) = fs::read(path) {
                if let Ok(value) = serde_json::from_slice::<Value>(&bytes) {
                    if value
                        .get("cancel_requested")
                        .and_then(|v| v.as_bool())
                        .unwrap_or(false)
                    {
                        self.flag.store(true, Ordering::SeqCst);
                        return true;
                    }
                }
            }
        }
        false
    }
}

pub fn write_cancel_request(path: &Path) -> Result<()> {
    atomic_write_json_pretty(
        path,
        &json!({
            "schema_version": EPISODE_CONTROL_SCHEMA_V1,
            "cancel_requested": true,
            "requested_at": Utc::now().to_rfc3339(),
        }),
    )
}

// ---------------------------------------------------------------------------
// Record persistence
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct EnvironmentCreate {
    pub name: String,
    pub image_ref: String,
    pub language_hint: LanguageHint,
    pub notes: Option<String>,
}

pub fn create_environment(paths: &StudioPaths, spec: EnvironmentCreate) -> Result<Environment> {
    if spec.name.trim().is_empty() {
        return Err(anyhow!("environment name must not be empty"));
    }
    let environment = Environment {
        schema_version: models::ENVIRONMENT_SCHEMA_V1.to_string(),
        env_id: mint_id("env"),
        name: spec.name,
        image_ref: spec.image_ref,
        image_digest: None,
        language_hint: spec.language_hint,
        created_at: Utc::now(),
        notes: spec.notes,
    };
    atomic_write_json_pretty(
        &paths.environment_record(&environment.env_id),
        &serde_json::to_value(&environment)?,
    )?;
    Ok(environment)
}

pub fn load_environment(paths: &StudioPaths, env_id: &str) -> Result<Environment> {
    let path = paths.environment_record(env_id);
    let bytes = fs::read(&path).with_context(|| format!("environment not found: {}", env_id))?;
    Ok(serde_json::from_slice(&bytes)?)
}

pub fn list_environments(paths: &StudioPaths) -> Result<Vec<Environment>> {
    let mut environments = Vec::new();
    if !paths.environments_dir.exists() {
        return Ok(environments);
    }
    for entry in fs::read_dir(&paths.environments_dir)? {
        let path = entry?.path();
        if path.extension().and_then(|e| e.to_str()) == Some("json") {
            environments.push(serde_json::from_slice(&fs::read(&path)?)?);
        }
    }
    environments.sort_by(|a: &Environment, b: &Environment| a.created_at.cmp(&b.created_at));
    Ok(environments)
}

pub fn save_episode(paths: &StudioPaths, episode: &Episode) -> Result<()> {
    atomic_write_json_pretty(
        &paths.episode_record(&episode.episode_id),
        &serde_json::to_value(episode)?,
    )
}

pub fn load_episode(paths: &StudioPaths, episode_id: &str) -> Result<Episode> {
    let path = paths.episode_record(episode_id);
    let bytes = fs::read(&path).with_context(|| format!("episode not found: {}", episode_id))?;
    Ok(serde_json::from_slice(&bytes)?)
}

pub fn list_episodes(paths: &StudioPaths) -> Result<Vec<EpisodeSummary>> {
    let mut summaries = Vec::new();
    if !paths.episodes_dir.exists() {
        return Ok(summaries);
    }
    for entry in fs::read_dir(&paths.episodes_dir)? {
        let record = entry?.path().join("episode.json");
        if record.exists() {
            let episode: Episode = serde_json::from_slice(&fs::read(&record)?)?;
            summaries.push(EpisodeSummary::from_episode(&episode));
        }
    }
    summaries.sort_by(|a, b| a.created_at.cmp(&b.created_at));
    Ok(summaries)
}

/// The five blob keys an artifact occupies in the object store.
pub fn artifact_store_keys(artifact_id: &str) -> Vec<(String, String)> {
    [
        TEST_SCRIPT_FILENAME,
        TEST_FILES_FILENAME,
        TEST_PARSER_FILENAME,
        BUG_INJECT_DIFF_FILENAME,
        TEST_WEAKEN_DIFF_FILENAME,
    ]
    .iter()
    .map(|name| {
        (
            name.to_string(),
            format!("artifacts/{}/{}", artifact_id, name),
        )
    })
    .collect()
}

fn store_artifact_blobs(store: &ObjectStore, artifact: &BugArtifact) -> Result<()> {
    let artifact_id = &artifact.metadata.artifact_id;
    let blobs: [(&str, String); 5] = [
        (TEST_SCRIPT_FILENAME, artifact.test_script.clone()),
        (TEST_FILES_FILENAME, artifact.test_files.join("\n")),
        (TEST_PARSER_FILENAME, artifact.test_parser.clone()),
        (BUG_INJECT_DIFF_FILENAME, artifact.bug_inject_diff.clone()),
        (TEST_WEAKEN_DIFF_FILENAME, artifact.test_weaken_diff.clone()),
    ];
    for (name, content) in blobs {
        store.write(
            &format!("artifacts/{}/{}", artifact_id, name),
            content.as_bytes(),
        )?;
    }
    store.write(
        &format!("artifacts/{}/metadata.json", artifact_id),
        &serde_json::to_vec_pretty(&artifact.metadata)?,
    )?;
    Ok(())
}

// ---------------------------------------------------------------------------
// Orchestrator
// ---------------------------------------------------------------------------

pub struct EpisodeOrchestrator {
    config: StudioConfig,
    gateway: Arc<dyn ModelGateway>,
}

impl EpisodeOrchestrator {
    pub fn new(config: StudioConfig, gateway: Arc<dyn ModelGateway>) -> EpisodeOrchestrator {
        EpisodeOrchestrator { config, gateway }
    }

    pub fn config(&self) -> &StudioConfig {
        &self.config
    }

    /// Runs one complete episode. Every state transition is persisted before
    /// the next stage starts, so a crash leaves a legible record.
    pub fn run_episode(
        &self,
        environment: &Environment,
        episode_config: EpisodeConfig,
    ) -> Result<Episode> {
        let episode_id = mint_id("ep");
        self.run_episode_with_id(&episode_id, environment, episode_config, None)
    }

    pub fn run_episode_with_id(
        &self,
        episode_id: &str,
        environment: &Environment,
        episode_config: EpisodeConfig,
        cancel: Option<CancelToken>,
    ) -> Result<Episode> {
        let paths = self.config.paths();
        let mut episode = Episode::new(
            episode_id.to_string(),
            environment.env_id.clone(),
            episode_config,
        );
        ensure_dir(&paths.episode_dir(episode_id).join("state"))?;
        let cancel =
            cancel.unwrap_or_else(|| CancelToken::with_control_file(paths.episode_control(episode_id)));
        save_episode(&paths, &episode)?;

        let outcome = self.run_pipeline(&mut episode, environment, &cancel);
        if let Err(e) = outcome {
            if !episode.status.is_terminal() {
                episode.status = EpisodeStatus::Failed;
                episode.error_message = Some(format!("{:#}", e));
                episode.completed_at = Some(Utc::now());
                save_episode(&paths, &episode)?;
            }
        }
        self.append_facts(&episode)?;
        Ok(episode)
    }

    fn transition(
        &self,
        paths: &StudioPaths,
        episode: &mut Episode,
        status: EpisodeStatus,
    ) -> Result<()> {
        episode.status = status;
        save_episode(paths, episode)
    }

    fn finish_cancelled(&self, paths: &StudioPaths, episode: &mut Episode) -> Result<()> {
        episode.status = EpisodeStatus::Cancelled;
        episode.completed_at = Some(Utc::now());
        save_episode(paths, episode)
    }

    fn run_pipeline(
        &self,
        episode: &mut Episode,
        environment: &Environment,
        cancel: &CancelToken,
    ) -> Result<()> {
        let paths = self.config.paths();
        let store = ObjectStore::new(&paths.store_dir);
        episode.started_at = Some(Utc::now());

        let sandbox_root = paths.sandboxes_dir.join(&episode.episode_id);
        let image_path = Path::new(&environment.image_ref);
        let mut sandbox = if image_path.is_dir() {
            Sandbox::process(&sandbox_root, image_path, self.config.sandbox.clone())
        } else {
            Sandbox::docker(&environment.image_ref, self.config.sandbox.clone())
        };
        sandbox
            .start()
            .map_err(|e| anyhow!("sandbox start failed: {}", e))?;
        episode.image_digest = sandbox.image_digest();

        // INJECTING
        self.transition(&paths, episode, EpisodeStatus::Injecting)?;
        if cancel.is_cancelled() {
            return self.finish_cancelled(&paths, episode);
        }
        sandbox
            .snapshot_init()
            .and_then(|_| sandbox.snapshot_tag(BASELINE_SNAPSHOT))
            .map_err(|e| anyhow!("baseline snapshot failed: {}", e))?;

        let injection = agent::run_injector(
            &mut sandbox,
            self.gateway.as_ref(),
            &environment.env_id,
            &episode.config,
            cancel,
        )?;
        let artifact = match injection.termination {
            TerminationReason::Submitted => injection
                .artifact
                .ok_or_else(|| anyhow!("injector reported submission without an artifact"))?,
            TerminationReason::Cancelled => {
                return self.finish_cancelled(&paths, episode);
            }
            TerminationReason::GatewayFailure(message) => {
                return Err(anyhow!("model gateway failed during injection: {}", message));
            }
            TerminationReason::BudgetExceeded => {
                return Err(anyhow!("injector exceeded its tool-step budget without submitting"));
            }
            TerminationReason::TokenLimit => {
                return Err(anyhow!("injector exceeded its token budget without submitting"));
            }
        };
        store_artifact_blobs(&store, &artifact)?;
        episode.artifact_id = Some(artifact.metadata.artifact_id.clone());
        save_episode(&paths, episode)?;

        // VALIDATING
        self.transition(&paths, episode, EpisodeStatus::Validating)?;
        if cancel.is_cancelled() {
            return self.finish_cancelled(&paths, episode);
        }
        sandbox
            .snapshot_restore(BASELINE_SNAPSHOT)
            .map_err(|e| anyhow!("baseline restore failed: {}", e))?;
        let report =
            Validator::new(&mut sandbox, self.config.validator.clone()).validate(&artifact);
        let report_valid = report.valid;
        episode.validation_report = Some(report);
        save_episode(&paths, episode)?;

        if !report_valid {
            episode.r_inject = Some(reward::injector_reward(false, 0.0, episode.config.reward_alpha));
            episode.status = EpisodeStatus::Complete;
            episode.completed_at = Some(Utc::now());
            return save_episode(&paths, episode);
        }

        // SOLVING: N sequential attempts on the same sandbox, baseline
        // restored and buggy state rebuilt between attempts.
        self.transition(&paths, episode, EpisodeStatus::Solving)?;
        let attempts_total = episode.config.solver_attempts;
        let mut outcomes: Vec<bool> = Vec::new();
        for attempt_number in 1..=attempts_total {
            if cancel.is_cancelled() {
                return self.finish_cancelled(&paths, episode);
            }
            sandbox
                .snapshot_restore(BASELINE_SNAPSHOT)
                .map_err(|e| anyhow!("baseline restore failed: {}", e))?;
            self.prepare_buggy_state(&mut sandbox, &artifact)?;

            let solver = agent::run_solver(
                &mut sandbox,
                self.gateway.as_ref(),
                &artifact,
                &episode.config,
                cancel,
            )?;
            match &solver.termination {
                TerminationReason::Cancelled => {
                    return self.finish_cancelled(&paths, episode);
                }
                TerminationReason::GatewayFailure(message) => {
                    return Err(anyhow!("model gateway failed during solving: {}", message));
                }
                // A solver that runs out of budget simply has no patch; the
                // attempt is recorded as unsuccessful.
                _ => {}
            }

            let attempt_id = mint_id("att");
            let evaluation = match &solver.pred_patch {
                Some(patch) => {
                    self.evaluate_attempt(&mut sandbox, &artifact, &attempt_id, patch)?
                }
                None => EvaluationReport {
                    attempt_id: attempt_id.clone(),
                    success: false,
                    tests_passed: 0,
                    tests_failed: 0,
                    tests_total: 0,
                    per_test_status: TestMap::new(),
                    test_files_restored: Vec::new(),
                    duration_ms: 0,
                },
            };

            let mut attempt = SolverAttempt {
                attempt_id: attempt_id.clone(),
                artifact_id: artifact.metadata.artifact_id.clone(),
                attempt_number,
                oracle_test_patch: solver.oracle_patch.clone(),
                pred_patch: solver.pred_patch.clone(),
                success: evaluation.success,
                test_summary: TestSummary::from_map(&evaluation.per_test_status),
                per_test_status: evaluation.per_test_status.clone(),
                tool_calls: solver.tool_calls,
                total_tool_steps: solver.trace.len(),
                total_tokens_used: solver.total_tokens,
                duration_ms: solver.duration_ms,
                pred_patch_ref: None,
                tool_trace_ref: None,
                created_at: Utc::now(),
            };
            if let Some(patch) = &attempt.pred_patch {
                attempt.pred_patch_ref = Some(store.write(
                    &format!("attempts/{}/{}", attempt_id, PRED_PATCH_FILENAME),
                    patch.as_bytes(),
                )?);
            }
            attempt.tool_trace_ref = Some(store.write(
                &format!("attempts/{}/{}", attempt_id, TOOL_TRACE_FILENAME),
                &serde_json::to_vec_pretty(&solver.trace)?,
            )?);

            outcomes.push(attempt.success);
            episode.solver_attempts.push(attempt);
            // Attempt i is durable before attempt i+1 begins.
            save_episode(&paths, episode)?;
        }

        // EVALUATING: aggregate and reward.
        self.transition(&paths, episode, EpisodeStatus::Evaluating)?;
        let successes = outcomes.iter().filter(|s| **s).count();
        let s = reward::solve_rate(successes, attempts_total as usize);
        episode.solve_rate = Some(s);
        episode.r_inject = Some(reward::injector_reward(true, s, episode.config.reward_alpha));
        episode.r_solve_avg = Some(reward::mean_solver_reward(&outcomes));
        episode.status = EpisodeStatus::Complete;
        episode.completed_at = Some(Utc::now());
        save_episode(&paths, episode)
    }

    /// Builds the state the solver sees: baseline + bug + weakening + harness
    /// files, with the VCS history stripped and re-initialized so nothing
    /// reveals the injection.
    fn prepare_buggy_state(&self, sandbox: &mut Sandbox, artifact: &BugArtifact) -> Result<()> {
        sandbox
            .apply_diff(&artifact.bug_inject_diff, false)
            .map_err(|e| anyhow!("applying bug_inject_diff failed: {}", e))?;
        sandbox
            .apply_diff(&artifact.test_weaken_diff, false)
            .map_err(|e| anyhow!("applying test_weaken_diff failed: {}", e))?;
        self.install_harness(sandbox, artifact)?;
        sandbox
            .write_file(TEST_FILES_FILENAME, &artifact.test_files.join("\n"))
            .map_err(|e| anyhow!("writing {} failed: {}", TEST_FILES_FILENAME, e))?;
        let reinit = sandbox
            .bash("rm -rf .git && git init -q", None, None, &[])
            .map_err(|e| anyhow!("history re-init failed: {}", e))?;
        if reinit.exit_code != 0 {
            return Err(anyhow!("history re-init failed: {}", reinit.stderr));
        }
        sandbox
            .snapshot_tag(BUGGY_SNAPSHOT)
            .map_err(|e| anyhow!("buggy snapshot failed: {}", e))?;
        Ok(())
    }

    fn install_harness(&self, sandbox: &mut Sandbox, artifact: &BugArtifact) -> Result<()> {
        sandbox
            .write_file(TEST_SCRIPT_FILENAME, &artifact.test_script)
            .map_err(|e| anyhow!("writing {} failed: {}", TEST_SCRIPT_FILENAME, e))?;
        sandbox
            .write_file(TEST_PARSER_FILENAME, &artifact.test_parser)
            .map_err(|e| anyhow!("writing {} failed: {}", TEST_PARSER_FILENAME, e))?;
        let chmod = sandbox
            .bash(
                &format!("chmod +x {} {}", TEST_SCRIPT_FILENAME, TEST_PARSER_FILENAME),
                None,
                None,
                &[],
            )
            .map_err(|e| anyhow!("chmod failed: {}", e))?;
        if chmod.exit_code != 0 {
            return Err(anyhow!("chmod failed: {}", chmod.stderr));
        }
        Ok(())
    }

    /// Evaluates one predicted patch from the buggy snapshot. Test files and
    /// harness files are restored before the run, so edits to either cannot
    /// influence the verdict.
    fn evaluate_attempt(
        &self,
        sandbox: &mut Sandbox,
        artifact: &BugArtifact,
        attempt_id: &str,
        pred_patch: &str,
    ) -> Result<EvaluationReport> {
        let started = Instant::now();
        let unsuccessful = |started: Instant| EvaluationReport {
            attempt_id: attempt_id.to_string(),
            success: false,
            tests_passed: 0,
            tests_failed: 0,
            tests_total: 0,
            per_test_status: TestMap::new(),
            test_files_restored: artifact.test_files.clone(),
            duration_ms: started.elapsed().as_millis() as u64,
        };

        sandbox
            .snapshot_restore(BUGGY_SNAPSHOT)
            .map_err(|e| anyhow!("buggy restore failed: {}", e))?;
        match sandbox.apply_diff(pred_patch, false) {
            Ok(()) => {}
            Err(SandboxError::PatchApplyFailed(_)) => return Ok(unsuccessful(started)),
            Err(e) => return Err(anyhow!("pred_patch apply failed: {}", e)),
        }

        sandbox
            .snapshot_restore_paths(BASELINE_SNAPSHOT, &artifact.test_files)
            .map_err(|e| anyhow!("test file restoration failed: {}", e))?;
        self.install_harness(sandbox, artifact)?;

        let result = sandbox
            .bash(
                &agent::harness_command(),
                Some(artifact.metadata.max_test_runtime_sec + 30),
                None,
                &[],
            )
            .map_err(|e| anyhow!("evaluation harness failed: {}", e))?;
        if result.timed_out {
            return Ok(unsuccessful(started));
        }
        let value: Value = match serde_json::from_str(result.stdout.trim()) {
            Ok(value) => value,
            Err(_) => return Ok(unsuccessful(started)),
        };
        if studio_schemas::validate_parser_output(&value).is_err() {
            return Ok(unsuccessful(started));
        }

        let mut per_test = TestMap::new();
        for (test_id, status) in value.as_object().expect("schema guarantees an object") {
            per_test.insert(
                test_id.clone(),
                TestStatus::from_label(status.as_str().unwrap_or("")),
            );
        }
        let passed = per_test
            .values()
            .filter(|s| **s == TestStatus::Passed)
            .count();
        let total = per_test.len();
        Ok(EvaluationReport {
            attempt_id: attempt_id.to_string(),
            success: total > 0 && passed == total,
            tests_passed: passed,
            tests_failed: total - passed,
            tests_total: total,
            per_test_status: per_test,
            test_files_restored: artifact.test_files.clone(),
            duration_ms: started.elapsed().as_millis() as u64,
        })
    }

    fn append_facts(&self, episode: &Episode) -> Result<()> {
        if !episode.status.is_terminal() {
            return Ok(());
        }
        let paths = self.config.paths();
        let mut sink = JsonlEpisodeSink::new(&paths.facts_dir)?;
        let duration_ms = match (episode.started_at, episode.completed_at) {
            (Some(started), Some(completed)) => {
                (completed - started).num_milliseconds().max(0) as u64
            }
            _ => 0,
        };
        sink.append_episode_row(&EpisodeRow {
            episode_id: episode.episode_id.clone(),
            env_id: episode.env_id.clone(),
            status: episode.status.as_str().to_string(),
            injection_strategy: episode.config.injection_strategy.as_str().to_string(),
            artifact_id: episode.artifact_id.clone(),
            artifact_valid: episode.validation_report.as_ref().map(|r| r.valid),
            solver_attempts: episode.solver_attempts.len(),
            solve_rate: episode.solve_rate,
            r_inject: episode.r_inject,
            r_solve_avg: episode.r_solve_avg,
            duration_ms,
            created_at: episode.created_at.to_rfc3339(),
        })?;
        let attempt_rows: Vec<AttemptRow> = episode
            .solver_attempts
            .iter()
            .map(|a| AttemptRow {
                episode_id: episode.episode_id.clone(),
                attempt_id: a.attempt_id.clone(),
                attempt_number: a.attempt_number,
                success: a.success,
                tests_passed: a.test_summary.passed,
                tests_failed: a.test_summary.failed,
                total_tool_steps: a.total_tool_steps,
                total_tokens_used: a.total_tokens_used,
                duration_ms: a.duration_ms,
            })
            .collect();
        sink.append_attempt_rows(&attempt_rows)?;
        if let (Some(report), Some(artifact_id)) =
            (&episode.validation_report, &episode.artifact_id)
        {
            let step_rows: Vec<ValidationStepRow> = report
                .steps
                .iter()
                .map(|s| ValidationStepRow {
                    episode_id: episode.episode_id.clone(),
                    artifact_id: artifact_id.clone(),
                    step: s.name.as_str().to_string(),
                    passed: s.passed,
                    error_message: s.error_message.clone(),
                    duration_ms: s.duration_ms,
                })
                .collect();
            sink.append_validation_rows(&step_rows)?;
        }
        sink.flush()
    }
}

// ---------------------------------------------------------------------------
// Scheduler
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct EpisodeTicket {
    pub ticket_id: String,
    pub episode_id: String,
}

#[derive(Debug, Clone)]
pub struct EpisodeCompletion {
    pub ticket: EpisodeTicket,
    pub status: EpisodeStatus,
    pub error_message: Option<String>,
}

struct InFlightEpisode {
    ticket: EpisodeTicket,
    cancel: CancelToken,
}

struct SchedulerInner {
    orchestrator: Arc<EpisodeOrchestrator>,
    max_live_sandboxes: usize,
    next_ticket_seq: AtomicU64,
    completions_tx: mpsc::Sender<EpisodeCompletion>,
    completions_rx: Mutex<mpsc::Receiver<EpisodeCompletion>>,
    state: Mutex<HashMap<String, InFlightEpisode>>,
}

/// Runs episodes on worker threads, bounded by the number of
/// simultaneously-live sandboxes. Submissions beyond the cap fail with a
/// queuing-style error the caller can observe.
pub struct EpisodeScheduler {
    inner: Arc<SchedulerInner>,
}

impl EpisodeScheduler {
    pub fn new(orchestrator: Arc<EpisodeOrchestrator>) -> Result<EpisodeScheduler> {
        let max_live_sandboxes = orchestrator.config().max_live_sandboxes;
        if max_live_sandboxes == 0 {
            return Err(anyhow!("episode scheduler requires max_live_sandboxes > 0"));
        }
        let (tx, rx) = mpsc::channel();
        Ok(EpisodeScheduler {
            inner: Arc::new(SchedulerInner {
                orchestrator,
                max_live_sandboxes,
                next_ticket_seq: AtomicU64::new(1),
                completions_tx: tx,
                completions_rx: Mutex::new(rx),
                state: Mutex::new(HashMap::new()),
            }),
        })
    }

    pub fn submit(
        &self,
        environment: Environment,
        config: EpisodeConfig,
    ) -> Result<EpisodeTicket> {
        let episode_id = mint_id("ep");
        let seq = self.inner.next_ticket_seq.fetch_add(1, Ordering::Relaxed);
        let ticket = EpisodeTicket {
            ticket_id: format!("episode.ticket.{}", seq),
            episode_id: episode_id.clone(),
        };
        let paths = self.inner.orchestrator.config().paths();
        let cancel = CancelToken::with_control_file(paths.episode_control(&episode_id));
        {
            let mut state = self
                .inner
                .state
                .lock()
                .map_err(|_| anyhow!("episode scheduler state lock poisoned"))?;
            if state.len() >= self.inner.max_live_sandboxes {
                return Err(anyhow!(
                    "{} in_flight={} max_live={}",
                    SCHEDULER_CAPACITY_ERROR_PREFIX,
                    state.len(),
                    self.inner.max_live_sandboxes
                ));
            }
            state.insert(
                episode_id.clone(),
                InFlightEpisode {
                    ticket: ticket.clone(),
                    cancel: cancel.clone(),
                },
            );
        }

        let inner = self.inner.clone();
        let ticket_for_worker = ticket.clone();
        thread::Builder::new()
            .name(format!("studio-{}", ticket.ticket_id))
            .spawn(move || {
                let completion = match inner.orchestrator.run_episode_with_id(
                    &ticket_for_worker.episode_id,
                    &environment,
                    config,
                    Some(cancel),
                ) {
                    Ok(episode) => EpisodeCompletion {
                        ticket: ticket_for_worker,
                        status: episode.status,
                        error_message: episode.error_message,
                    },
                    Err(err) => EpisodeCompletion {
                        ticket: ticket_for_worker,
                        status: EpisodeStatus::Failed,
                        error_message: Some(format!("{:#}", err)),
                    },
                };
                let _ = inner.completions_tx.send(completion);
            })
            .map_err(|e| anyhow!("failed to spawn episode worker thread: {}", e))?;

        Ok(ticket)
    }

    pub fn poll_completions(&self, timeout: Duration) -> Result<Vec<EpisodeCompletion>> {
        let mut raw: Vec<EpisodeCompletion> = Vec::new();
        {
            let rx = self
                .inner
                .completions_rx
                .lock()
                .map_err(|_| anyhow!("episode scheduler completion lock poisoned"))?;
            match rx.recv_timeout(timeout) {
                Ok(completion) => raw.push(completion),
                Err(mpsc::RecvTimeoutError::Timeout) => return Ok(Vec::new()),
                Err(mpsc::RecvTimeoutError::Disconnected) => {
                    return Err(anyhow!("episode scheduler completion channel disconnected"));
                }
            }
            while let Ok(completion) = rx.try_recv() {
                raw.push(completion);
            }
        }
        let mut state = self
            .inner
            .state
            .lock()
            .map_err(|_| anyhow!("episode scheduler state lock poisoned"))?;
        for completion in &raw {
            state.remove(&completion.ticket.episode_id);
        }
        Ok(raw)
    }

    /// Cooperative cancel: flips the in-flight token when the episode is
    /// local, and always writes the control file so out-of-process runs see
    /// the request at their next suspension point.
    pub fn cancel(&self, episode_id: &str) -> Result<()> {
        let paths = self.inner.orchestrator.config().paths();
        write_cancel_request(&paths.episode_control(episode_id))?;
        let state = self
            .inner
            .state
            .lock()
            .map_err(|_| anyhow!("episode scheduler state lock poisoned"))?;
        if let Some(in_flight) = state.get(episode_id) {
            in_flight.cancel.cancel();
        }
        Ok(())
    }

    pub fn in_flight(&self) -> usize {
        self.inner.state.lock().map(|s| s.len()).unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::{GenerationResult, ToolDefinition};
    use crate::gateway::{AgentRole, Message};
    use crate::testfix;
    use serde_json::json;
    use std::sync::mpsc as std_mpsc;

    fn injector_submission() -> GenerationResult {
        GenerationResult::tool(
            "submit_artifact",
            json!({
                "test_script": testfix::TEST_SCRIPT,
                "test_files": ["tests/checks.txt"],
                "test_parser": testfix::TEST_PARSER,
                "bug_inject_diff": testfix::BUG_INJECT_DIFF,
                "test_weaken_diff": testfix::TEST_WEAKEN_DIFF,
            }),
        )
    }

    fn studio_setup(base: &Path) -> (StudioConfig, Environment) {
        let image = testfix::write_calculator_image(base);
        let config = StudioConfig::new(base.join("studio"));
        let paths = config.paths();
        let environment = create_environment(
            &paths,
            EnvironmentCreate {
                name: "calculator".to_string(),
                image_ref: image.to_string_lossy().to_string(),
                language_hint: LanguageHint::Unknown,
                notes: None,
            },
        )
        .expect("environment");
        (config, environment)
    }

    #[test]
    fn happy_path_episode_computes_asymmetric_rewards() {
        let base = testfix::temp_base("pipeline_happy");
        let (config, environment) = studio_setup(&base);
        let gateway = Arc::new(ScriptedGateway::new(
            "scripted",
            vec![
                injector_submission(),
                // Attempt 1 repairs the bug, attempt 2 submits garbage.
                GenerationResult::tool("submit_patch", json!({"patch": testfix::FIX_PATCH})),
                GenerationResult::tool(
                    "submit_patch",
                    json!({"patch": "--- a/lib.sh\n+++ b/lib.sh\n@@ -1 +1 @@\n-nope\n+never\n"}),
                ),
            ],
        ));
        let orchestrator = EpisodeOrchestrator::new(config.clone(), gateway);
        let episode_config = EpisodeConfig {
            solver_attempts: 2,
            ..testfix::calculator_config()
        };
        let episode = orchestrator
            .run_episode(&environment, episode_config)
            .expect("episode");

        assert_eq!(episode.status, EpisodeStatus::Complete, "{:?}", episode.error_message);
        let report = episode.validation_report.as_ref().expect("report");
        assert!(report.valid);
        assert_eq!(episode.solver_attempts.len(), 2);
        assert!(episode.solver_attempts[0].success);
        assert!(!episode.solver_attempts[1].success);
        assert_eq!(episode.solver_attempts[0].test_summary.passed, 12);
        assert!((episode.solve_rate.unwrap() - 0.5).abs() < 1e-9);
        assert!((episode.r_inject.unwrap() - 0.1).abs() < 1e-9);
        assert!(episode.r_solve_avg.unwrap().abs() < 1e-9);

        // Persistence: episode record, artifact blobs, attempt blobs, facts.
        let paths = config.paths();
        let stored = load_episode(&paths, &episode.episode_id).expect("stored episode");
        assert_eq!(stored.status, EpisodeStatus::Complete);
        let store = ObjectStore::new(&paths.store_dir);
        let artifact_id = episode.artifact_id.as_ref().expect("artifact id");
        for (_, key) in artifact_store_keys(artifact_id) {
            assert!(store.exists(&key).expect("exists"), "missing blob {}", key);
        }
        let first = &episode.solver_attempts[0];
        assert!(store
            .exists(first.pred_patch_ref.as_ref().expect("patch ref"))
            .expect("exists"));
        assert!(store
            .exists(first.tool_trace_ref.as_ref().expect("trace ref"))
            .expect("exists"));
        assert!(paths.facts_dir.join("episodes.jsonl").exists());
        assert!(paths.facts_dir.join("attempts.jsonl").exists());
        let _ = fs::remove_dir_all(base);
    }

    #[test]
    fn invalid_artifact_completes_with_floor_penalty_and_no_attempts() {
        let base = testfix::temp_base("pipeline_invalid");
        let (config, environment) = studio_setup(&base);
        let gateway = Arc::new(ScriptedGateway::new(
            "scripted",
            vec![GenerationResult::tool(
                "submit_artifact",
                json!({
                    "test_script": testfix::TEST_SCRIPT,
                    "test_files": ["tests/checks.txt"],
                    "test_parser": testfix::TEST_PARSER,
                    "bug_inject_diff": testfix::BUG_INJECT_DIFF,
                    // Weakening that illegally edits a code file.
                    "test_weaken_diff": testfix::TEST_WEAKEN_DIFF_TOUCHES_CODE,
                }),
            )],
        ));
        let orchestrator = EpisodeOrchestrator::new(config, gateway);
        let episode = orchestrator
            .run_episode(&environment, testfix::calculator_config())
            .expect("episode");
        assert_eq!(episode.status, EpisodeStatus::Complete);
        assert!(!episode.validation_report.as_ref().expect("report").valid);
        assert!(episode.solver_attempts.is_empty());
        assert!((episode.r_inject.unwrap() + 1.0).abs() < 1e-9);
        assert!(episode.solve_rate.is_none());
        assert!(episode.r_solve_avg.is_none());
        let _ = fs::remove_dir_all(base);
    }

    #[test]
    fn injector_non_submission_fails_the_episode() {
        let base = testfix::temp_base("pipeline_nosubmit");
        let (config, environment) = studio_setup(&base);
        let gateway = Arc::new(ScriptedGateway::new(
            "scripted",
            vec![GenerationResult::text("I am lost.")],
        ));
        let orchestrator = EpisodeOrchestrator::new(config.clone(), gateway);
        let episode_config = EpisodeConfig {
            solver_max_tool_steps: 1,
            ..testfix::calculator_config()
        };
        let episode = orchestrator
            .run_episode(&environment, episode_config)
            .expect("episode returns despite failure");
        assert_eq!(episode.status, EpisodeStatus::Failed);
        assert!(episode
            .error_message
            .as_deref()
            .unwrap_or("")
            .contains("tool-step budget"));
        let stored =
            load_episode(&config.paths(), &episode.episode_id).expect("persisted failure");
        assert_eq!(stored.status, EpisodeStatus::Failed);
        let _ = fs::remove_dir_all(base);
    }

    /// Gateway that parks every generate call until released, then fails.
    struct BlockingGateway {
        release_rx: Mutex<std_mpsc::Receiver<GenerationResult>>,
    }

    impl ModelGateway for BlockingGateway {
        fn model_id(&self) -> &str {
            "blocking"
        }

        fn generate(
            &self,
            _role: AgentRole,
            _messages: &[Message],
            _tools: &[ToolDefinition],
            _temperature: f64,
            _max_tokens: u64,
        ) -> Result<GenerationResult> {
            let rx = self
                .release_rx
                .lock()
                .map_err(|_| anyhow!("lock poisoned"))?;
            rx.recv().map_err(|_| anyhow!("gateway shut down"))
        }
    }

    #[test]
    fn scheduler_enforces_live_sandbox_cap_and_reports_completions() {
        let base = testfix::temp_base("scheduler_cap");
        let (mut config, environment) = studio_setup(&base);
        config.max_live_sandboxes = 1;
        let (release_tx, release_rx) = std_mpsc::channel();
        let gateway = Arc::new(BlockingGateway {
            release_rx: Mutex::new(release_rx),
        });
        let orchestrator = Arc::new(EpisodeOrchestrator::new(config, gateway));
        let scheduler = EpisodeScheduler::new(orchestrator).expect("scheduler");

        let ticket = scheduler
            .submit(environment.clone(), testfix::calculator_config())
            .expect("first submission");
        let err = scheduler
            .submit(environment.clone(), testfix::calculator_config())
            .expect_err("second submission must hit the cap");
        assert!(err.to_string().starts_with(SCHEDULER_CAPACITY_ERROR_PREFIX));

        // Dropping the release sender makes the blocked gateway call fail,
        // which fails the episode and frees the slot.
        drop(release_tx);
        let completions = scheduler
            .poll_completions(Duration::from_secs(30))
            .expect("completions");
        assert_eq!(completions.len(), 1);
        assert_eq!(completions[0].ticket.ticket_id, ticket.ticket_id);
        assert_eq!(completions[0].status, EpisodeStatus::Failed);
        assert_eq!(scheduler.in_flight(), 0);

        scheduler
            .submit(environment, testfix::calculator_config())
            .expect("slot is free again");
        let _ = scheduler.poll_completions(Duration::from_secs(30));
        let _ = fs::remove_dir_all(base);
    }

    #[test]
    fn cancellation_is_cooperative_and_skips_rewards() {
        let base = testfix::temp_base("scheduler_cancel");
        let (config, environment) = studio_setup(&base);
        let (release_tx, release_rx) = std_mpsc::channel();
        let gateway = Arc::new(BlockingGateway {
            release_rx: Mutex::new(release_rx),
        });
        let orchestrator = Arc::new(EpisodeOrchestrator::new(config.clone(), gateway));
        let scheduler = EpisodeScheduler::new(orchestrator).expect("scheduler");

        let ticket = scheduler
            .submit(environment, testfix::calculator_config())
            .expect("submission");
        scheduler.cancel(&ticket.episode_id).expect("cancel");
        // Let the parked injector turn finish; the loop observes the cancel
        // at its next step boundary.
        release_tx
            .send(GenerationResult::text("still working"))
            .expect("release");

        let completions = scheduler
            .poll_completions(Duration::from_secs(30))
            .expect("completions");
        assert_eq!(completions.len(), 1);
        assert_eq!(completions[0].status, EpisodeStatus::Cancelled);
        let episode =
            load_episode(&config.paths(), &ticket.episode_id).expect("persisted episode");
        assert_eq!(episode.status, EpisodeStatus::Cancelled);
        assert!(episode.r_inject.is_none());
        assert!(episode.r_solve_avg.is_none());
        let _ = fs::remove_dir_all(base);
    }

    #[test]
    fn evaluator_discards_test_edits_before_judging() {
        let base = testfix::temp_base("anti_cheat");
        let mut sandbox = testfix::baseline_sandbox(&base);
        let artifact =
            testfix::calculator_artifact(testfix::BUG_INJECT_DIFF, testfix::TEST_WEAKEN_DIFF);
        let orchestrator = EpisodeOrchestrator::new(
            StudioConfig::new(base.join("studio")),
            Arc::new(ScriptedGateway::new("scripted", vec![])),
        );
        orchestrator
            .prepare_buggy_state(&mut sandbox, &artifact)
            .expect("buggy prep");

        // Rewrites the one still-failing check to expect the buggy output.
        // Without restoration this would make every test pass.
        let test_edit = "--- a/tests/checks.txt\n+++ b/tests/checks.txt\n\
@@ -1,4 +1,4 @@\n add 2 3 -1 test_add_small\n add 10 4 6 test_add_mid\n\
-add 7 8 15 test_add_large\n+add 7 8 -1 test_add_large\n mul 2 3 6 test_mul_a\n";
        let cheat_only = orchestrator
            .evaluate_attempt(&mut sandbox, &artifact, "att_cheat", test_edit)
            .expect("evaluation");
        assert!(!cheat_only.success);
        assert!(cheat_only.tests_failed >= 1);
        assert_eq!(cheat_only.test_files_restored, artifact.test_files);

        // The same test edit combined with the real fix succeeds: restoration
        // makes the test edit irrelevant either way.
        let fix_plus_cheat = format!("{}{}", testfix::FIX_PATCH, test_edit);
        let fixed = orchestrator
            .evaluate_attempt(&mut sandbox, &artifact, "att_fixed", &fix_plus_cheat)
            .expect("evaluation");
        assert!(fixed.success, "report: {:?}", fixed);
        assert_eq!(fixed.tests_passed, 12);
        let _ = fs::remove_dir_all(base);
    }

    #[test]
    fn reverse_apply_of_weakening_restores_baseline_test_files() {
        let base = testfix::temp_base("oracle_roundtrip");
        let mut sandbox = testfix::baseline_sandbox(&base);
        sandbox
            .apply_diff(testfix::TEST_WEAKEN_DIFF, false)
            .expect("weaken");
        let weakened = sandbox
            .read_file("tests/checks.txt", None, None)
            .expect("weakened checks");
        assert_ne!(weakened, testfix::CHECKS);
        // The oracle patch is the genuine reverse-apply of the weakening.
        sandbox
            .apply_diff(testfix::TEST_WEAKEN_DIFF, true)
            .expect("oracle apply");
        assert_eq!(
            sandbox
                .read_file("tests/checks.txt", None, None)
                .expect("restored checks"),
            testfix::CHECKS
        );
        let _ = fs::remove_dir_all(base);
    }

    #[test]
    fn buggy_state_preparation_strips_history_and_installs_harness() {
        let base = testfix::temp_base("buggy_prep");
        let mut sandbox = testfix::baseline_sandbox(&base);
        let artifact =
            testfix::calculator_artifact(testfix::BUG_INJECT_DIFF, testfix::TEST_WEAKEN_DIFF);
        let orchestrator = EpisodeOrchestrator::new(
            StudioConfig::new(base.join("studio")),
            Arc::new(ScriptedGateway::new("scripted", vec![])),
        );
        orchestrator
            .prepare_buggy_state(&mut sandbox, &artifact)
            .expect("buggy prep");

        // The bug and the weakening are both applied.
        assert!(sandbox
            .read_file("lib.sh", None, None)
            .expect("lib")
            .contains("$1 - $2"));
        assert!(sandbox
            .read_file("tests/checks.txt", None, None)
            .expect("checks")
            .contains("add 2 3 -1"));
        // Harness files are installed alongside the test-file manifest.
        assert!(sandbox.read_file(TEST_SCRIPT_FILENAME, None, None).is_ok());
        assert!(sandbox.read_file(TEST_PARSER_FILENAME, None, None).is_ok());
        assert_eq!(
            sandbox
                .read_file(TEST_FILES_FILENAME, None, None)
                .expect("manifest"),
            "tests/checks.txt"
        );
        // History isolation: a single snapshot commit, nothing older.
        let log = sandbox
            .bash("git log --oneline | wc -l", None, None, &[])
            .expect("git log");
        assert_eq!(log.stdout.trim(), "1");
        let grep = sandbox
            .bash("git log -p --all | grep -c '\\$1 + \\$2' || true", None, None, &[])
            .expect("git log -p");
        assert_eq!(grep.stdout.trim(), "0", "history must not reveal the baseline");
        let _ = fs::remove_dir_all(base);
    }

    #[test]
    fn environment_records_round_trip() {
        let base = testfix::temp_base("env_store");
        let config = StudioConfig::new(base.join("studio"));
        let paths = config.paths();
        let created = create_environment(
            &paths,
            EnvironmentCreate {
                name: "repo".to_string(),
                image_ref: "ghcr.io/example/repo:latest".to_string(),
                language_hint: LanguageHint::Python,
                notes: Some("seeded from registry".to_string()),
            },
        )
        .expect("create");
        let loaded = load_environment(&paths, &created.env_id).expect("load");
        assert_eq!(loaded.name, "repo");
        assert_eq!(loaded.language_hint, LanguageHint::Python);
        let listed = list_environments(&paths).expect("list");
        assert_eq!(listed.len(), 1);
        assert!(load_environment(&paths, "env_missing").is_err());
        let _ = fs::remove_dir_all(base);
    }

    #[test]
    fn config_env_overrides_are_applied_and_validated() {
        let base = testfix::temp_base("config_env");
        env::set_var("SSR_STUDIO_BASH_TIMEOUT_SECS", "120");
        env::set_var("SSR_STUDIO_MAX_LIVE_SANDBOXES", "3");
        env::set_var("SSR_STUDIO_GATEWAY_URL", "http://localhost:8080/v1");
        let config = StudioConfig::from_env(&base).expect("config");
        assert_eq!(config.sandbox.bash_timeout_secs, 120);
        assert_eq!(config.max_live_sandboxes, 3);
        assert_eq!(config.gateway.endpoint, "http://localhost:8080/v1");

        env::set_var("SSR_STUDIO_MAX_LIVE_SANDBOXES", "zero");
        assert!(StudioConfig::from_env(&base).is_err());
        env::remove_var("SSR_STUDIO_BASH_TIMEOUT_SECS");
        env::remove_var("SSR_STUDIO_MAX_LIVE_SANDBOXES");
        env::remove_var("SSR_STUDIO_GATEWAY_URL");
        let _ = fs::remove_dir_all(base);
    }

    #[test]
    fn control_file_flips_cancel_token() {
        let base = testfix::temp_base("cancel_token");
        ensure_dir(&base).expect("dir");
        let control = base.join("control.json");
        let token = CancelToken::with_control_file(&control);
        assert!(!token.is_cancelled());
        write_cancel_request(&control).expect("write request");
        assert!(token.is_cancelled());
        let _ = fs::remove_dir_all(base);
    }
}
