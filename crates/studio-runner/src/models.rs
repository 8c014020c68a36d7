//! Record types exchanged between pipeline stages. All of these are written
//! once from the episode's perspective; nothing mutates a persisted record.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

pub const ENVIRONMENT_SCHEMA_V1: &str = "environment_v1";
pub const EPISODE_SCHEMA_V1: &str = "episode_v1";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LanguageHint {
    Unknown,
    Python,
    Javascript,
    Typescript,
    Go,
    Rust,
    Java,
    Cpp,
}

impl Default for LanguageHint {
    fn default() -> Self {
        LanguageHint::Unknown
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InjectionStrategy {
    Direct,
    RemovalOnly,
    HistoryAware,
}

impl InjectionStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            InjectionStrategy::Direct => "direct",
            InjectionStrategy::RemovalOnly => "removal_only",
            InjectionStrategy::HistoryAware => "history_aware",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EpisodeStatus {
    Pending,
    Injecting,
    Validating,
    Solving,
    Evaluating,
    Complete,
    Failed,
    Cancelled,
}

impl EpisodeStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            EpisodeStatus::Pending => "pending",
            EpisodeStatus::Injecting => "injecting",
            EpisodeStatus::Validating => "validating",
            EpisodeStatus::Solving => "solving",
            EpisodeStatus::Evaluating => "evaluating",
            EpisodeStatus::Complete => "complete",
            EpisodeStatus::Failed => "failed",
            EpisodeStatus::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            EpisodeStatus::Complete | EpisodeStatus::Failed | EpisodeStatus::Cancelled
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TestStatus {
    Passed,
    Failed,
    Skipped,
    Error,
}

impl TestStatus {
    /// Parser output values outside the four legal statuses degrade to
    /// `error` instead of being rejected outright.
    pub fn from_label(label: &str) -> TestStatus {
        match label {
            "passed" => TestStatus::Passed,
            "failed" => TestStatus::Failed,
            "skipped" => TestStatus::Skipped,
            _ => TestStatus::Error,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TestStatus::Passed => "passed",
            TestStatus::Failed => "failed",
            TestStatus::Skipped => "skipped",
            TestStatus::Error => "error",
        }
    }
}

pub type TestMap = BTreeMap<String, TestStatus>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ValidationStepName {
    TestFilesExistence,
    ParserValidity,
    OriginalTestsPass,
    BugScope,
    BugValidity,
    TestWeakeningValidity,
    InverseMutationTesting,
}

impl ValidationStepName {
    pub fn as_str(&self) -> &'static str {
        match self {
            ValidationStepName::TestFilesExistence => "test_files_existence",
            ValidationStepName::ParserValidity => "parser_validity",
            ValidationStepName::OriginalTestsPass => "original_tests_pass",
            ValidationStepName::BugScope => "bug_scope",
            ValidationStepName::BugValidity => "bug_validity",
            ValidationStepName::TestWeakeningValidity => "test_weakening_validity",
            ValidationStepName::InverseMutationTesting => "inverse_mutation_testing",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidationStepResult {
    pub name: ValidationStepName,
    pub passed: bool,
    #[serde(default)]
    pub details: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    pub duration_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidationReport {
    pub artifact_id: String,
    pub valid: bool,
    pub steps: Vec<ValidationStepResult>,
    pub total_duration_ms: u64,
    pub created_at: DateTime<Utc>,
}

impl ValidationReport {
    pub fn failed_steps(&self) -> Vec<ValidationStepName> {
        self.steps
            .iter()
            .filter(|s| !s.passed)
            .map(|s| s.name)
            .collect()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArtifactMetadata {
    pub artifact_id: String,
    pub env_id: String,
    pub injection_strategy: InjectionStrategy,
    pub min_passing_tests: usize,
    pub min_changed_files: usize,
    pub min_failing_tests: usize,
    pub max_test_runtime_sec: u64,
    pub created_by_model: String,
    pub created_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent_artifact_id: Option<String>,
    #[serde(default = "default_bug_order")]
    pub bug_order: u32,
}

fn default_bug_order() -> u32 {
    1
}

/// The injector's complete submission: five blobs plus metadata. Immutable
/// once built.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BugArtifact {
    pub metadata: ArtifactMetadata,
    pub test_script: String,
    pub test_files: Vec<String>,
    pub test_parser: String,
    pub bug_inject_diff: String,
    pub test_weaken_diff: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCallRecord {
    pub timestamp: DateTime<Utc>,
    pub tool_name: String,
    pub arguments: Value,
    pub result_preview: String,
    pub duration_ms: u64,
    pub truncated: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TestSummary {
    pub passed: usize,
    pub failed: usize,
    pub skipped: usize,
    pub error: usize,
}

impl TestSummary {
    pub fn from_map(map: &TestMap) -> TestSummary {
        let mut summary = TestSummary::default();
        for status in map.values() {
            match status {
                TestStatus::Passed => summary.passed += 1,
                TestStatus::Failed => summary.failed += 1,
                TestStatus::Skipped => summary.skipped += 1,
                TestStatus::Error => summary.error += 1,
            }
        }
        summary
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SolverAttempt {
    pub attempt_id: String,
    pub artifact_id: String,
    pub attempt_number: u32,
    pub oracle_test_patch: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pred_patch: Option<String>,
    pub success: bool,
    #[serde(default)]
    pub test_summary: TestSummary,
    #[serde(default)]
    pub per_test_status: TestMap,
    #[serde(default)]
    pub tool_calls: Vec<ToolCallRecord>,
    pub total_tool_steps: usize,
    pub total_tokens_used: u64,
    pub duration_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pred_patch_ref: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_trace_ref: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Output of the per-attempt evaluator; `success` is copied onto the attempt
/// record, the rest explains the verdict.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EvaluationReport {
    pub attempt_id: String,
    pub success: bool,
    pub tests_passed: usize,
    pub tests_failed: usize,
    pub tests_total: usize,
    #[serde(default)]
    pub per_test_status: TestMap,
    #[serde(default)]
    pub test_files_restored: Vec<String>,
    pub duration_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EpisodeConfig {
    #[serde(default = "default_strategy")]
    pub injection_strategy: InjectionStrategy,
    #[serde(default = "default_min_passing_tests")]
    pub min_passing_tests: usize,
    #[serde(default = "default_min_changed_files")]
    pub min_changed_files: usize,
    #[serde(default = "default_min_failing_tests")]
    pub min_failing_tests: usize,
    #[serde(default = "default_max_test_runtime_sec")]
    pub max_test_runtime_sec: u64,
    #[serde(default = "default_solver_attempts")]
    pub solver_attempts: u32,
    #[serde(default = "default_reward_alpha")]
    pub reward_alpha: f64,
    #[serde(default = "default_solver_max_tool_steps")]
    pub solver_max_tool_steps: usize,
    #[serde(default = "default_solver_max_tokens")]
    pub solver_max_tokens: u64,
    #[serde(default = "default_temperature")]
    pub temperature: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub random_seed: Option<u64>,
}

fn default_strategy() -> InjectionStrategy {
    InjectionStrategy::RemovalOnly
}
fn default_min_passing_tests() -> usize {
    10
}
fn default_min_changed_files() -> usize {
    1
}
fn default_min_failing_tests() -> usize {
    1
}
fn default_max_test_runtime_sec() -> u64 {
    90
}
fn default_solver_attempts() -> u32 {
    4
}
fn default_reward_alpha() -> f64 {
    0.8
}
fn default_solver_max_tool_steps() -> usize {
    50
}
fn default_solver_max_tokens() -> u64 {
    100_000
}
fn default_temperature() -> f64 {
    0.7
}

impl Default for EpisodeConfig {
    fn default() -> Self {
        EpisodeConfig {
            injection_strategy: default_strategy(),
            min_passing_tests: default_min_passing_tests(),
            min_changed_files: default_min_changed_files(),
            min_failing_tests: default_min_failing_tests(),
            max_test_runtime_sec: default_max_test_runtime_sec(),
            solver_attempts: default_solver_attempts(),
            reward_alpha: default_reward_alpha(),
            solver_max_tool_steps: default_solver_max_tool_steps(),
            solver_max_tokens: default_solver_max_tokens(),
            temperature: default_temperature(),
            random_seed: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Environment {
    pub schema_version: String,
    pub env_id: String,
    pub name: String,
    pub image_ref: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub image_digest: Option<String>,
    #[serde(default)]
    pub language_hint: LanguageHint,
    pub created_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Episode {
    pub schema_version: String,
    pub episode_id: String,
    pub env_id: String,
    pub status: EpisodeStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    pub config: EpisodeConfig,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub artifact_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub validation_report: Option<ValidationReport>,
    #[serde(default)]
    pub solver_attempts: Vec<SolverAttempt>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub solve_rate: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub r_inject: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub r_solve_avg: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub image_digest: Option<String>,
    pub created_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
}

impl Episode {
    pub fn new(episode_id: String, env_id: String, config: EpisodeConfig) -> Episode {
        Episode {
            schema_version: EPISODE_SCHEMA_V1.to_string(),
            episode_id,
            env_id,
            status: EpisodeStatus::Pending,
            error_message: None,
            config,
            artifact_id: None,
            validation_report: None,
            solver_attempts: Vec::new(),
            solve_rate: None,
            r_inject: None,
            r_solve_avg: None,
            image_digest: None,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EpisodeSummary {
    pub episode_id: String,
    pub env_id: String,
    pub status: EpisodeStatus,
    pub injection_strategy: InjectionStrategy,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub artifact_valid: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub solve_rate: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub r_inject: Option<f64>,
    pub created_at: DateTime<Utc>,
}

impl EpisodeSummary {
    pub fn from_episode(episode: &Episode) -> EpisodeSummary {
        EpisodeSummary {
            episode_id: episode.episode_id.clone(),
            env_id: episode.env_id.clone(),
            status: episode.status,
            injection_strategy: episode.config.injection_strategy,
            artifact_valid: episode.validation_report.as_ref().map(|r| r.valid),
            solve_rate: episode.solve_rate,
            r_inject: episode.r_inject,
            created_at: episode.created_at,
        }
    }
}
