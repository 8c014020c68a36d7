//! The seven-step consistency protocol over a bug artifact. Runs against a
//! fresh sandbox at the baseline snapshot and short-circuits on the first
//! failing step; the caller owns restoration afterwards.

use crate::agent::harness_command;
use crate::diff::touched_paths;
use crate::models::{
    BugArtifact, TestMap, TestStatus, ValidationReport, ValidationStepName, ValidationStepResult,
};
use crate::sandbox::{shell_quote, Sandbox, SandboxError};
use chrono::Utc;
use serde_json::{json, Value};
use std::thread;
use std::time::{Duration, Instant};
use studio_core::{BASELINE_SNAPSHOT, TEST_PARSER_FILENAME, TEST_SCRIPT_FILENAME};

#[derive(Debug, Clone)]
pub struct ValidatorSettings {
    pub retry_count: u32,
    pub retry_delay_ms: u64,
    pub enable_inverse_mutation: bool,
}

impl Default for ValidatorSettings {
    fn default() -> Self {
        ValidatorSettings {
            retry_count: 2,
            retry_delay_ms: 500,
            enable_inverse_mutation: true,
        }
    }
}

#[derive(Default)]
struct ValidationContext {
    baseline_map: Option<TestMap>,
    bug_map: Option<TestMap>,
    changed_code_files: Vec<String>,
}

pub struct Validator<'a> {
    sandbox: &'a mut Sandbox,
    settings: ValidatorSettings,
}

impl<'a> Validator<'a> {
    pub fn new(sandbox: &'a mut Sandbox, settings: ValidatorSettings) -> Validator<'a> {
        Validator { sandbox, settings }
    }

    pub fn validate(&mut self, artifact: &BugArtifact) -> ValidationReport {
        let started = Instant::now();
        let mut ctx = ValidationContext::default();
        let mut steps: Vec<ValidationStepResult> = Vec::new();

        macro_rules! run_step {
            ($step:ident) => {{
                let step = self.$step(artifact, &mut ctx);
                let passed = step.passed;
                steps.push(step);
                if !passed {
                    return Self::build_report(artifact, steps, started);
                }
            }};
        }
        run_step!(step_test_files_existence);
        run_step!(step_parser_validity);
        run_step!(step_original_tests_pass);
        run_step!(step_bug_scope);
        run_step!(step_bug_validity);
        run_step!(step_test_weakening);
        if self.settings.enable_inverse_mutation {
            let step = self.step_inverse_mutation(artifact, &mut ctx);
            steps.push(step);
        }
        Self::build_report(artifact, steps, started)
    }

    fn build_report(
        artifact: &BugArtifact,
        steps: Vec<ValidationStepResult>,
        started: Instant,
    ) -> ValidationReport {
        let valid = steps.iter().all(|s| s.passed);
        ValidationReport {
            artifact_id: artifact.metadata.artifact_id.clone(),
            valid,
            steps,
            total_duration_ms: started.elapsed().as_millis() as u64,
            created_at: Utc::now(),
        }
    }

    fn step_result(
        name: ValidationStepName,
        passed: bool,
        details: Value,
        error_message: Option<String>,
        step_started: Instant,
    ) -> ValidationStepResult {
        ValidationStepResult {
            name,
            passed,
            details,
            error_message,
            duration_ms: step_started.elapsed().as_millis() as u64,
        }
    }

    /// Step 1: every test file exists at baseline, and the weakening diff
    /// touches only test files.
    fn step_test_files_existence(
        &mut self,
        artifact: &BugArtifact,
        _ctx: &mut ValidationContext,
    ) -> ValidationStepResult {
        let name = ValidationStepName::TestFilesExistence;
        let step_started = Instant::now();

        let mut missing: Vec<String> = Vec::new();
        for test_file in &artifact.test_files {
            match self
                .sandbox
                .bash(&format!("test -f {}", shell_quote(test_file)), None, None, &[])
            {
                Ok(result) if result.exit_code == 0 => {}
                _ => missing.push(test_file.clone()),
            }
        }
        if !missing.is_empty() {
            return Self::step_result(
                name,
                false,
                json!({ "missing_files": missing }),
                Some(format!("missing test files: {}", missing.join(", "))),
                step_started,
            );
        }

        let weaken_files = touched_paths(&artifact.test_weaken_diff);
        let non_test: Vec<String> = weaken_files
            .iter()
            .filter(|f| !artifact.test_files.contains(f))
            .cloned()
            .collect();
        if !non_test.is_empty() {
            return Self::step_result(
                name,
                false,
                json!({
                    "weaken_diff_files": weaken_files,
                    "non_test_files": non_test,
                }),
                Some(format!(
                    "test_weaken_diff modifies non-test files: {}",
                    non_test.join(", ")
                )),
                step_started,
            );
        }

        Self::step_result(
            name,
            true,
            json!({ "test_files_count": artifact.test_files.len() }),
            None,
            step_started,
        )
    }

    /// Step 2: the harness runs at baseline and its stdout is a single JSON
    /// status object. The resulting map M0 feeds step 3.
    fn step_parser_validity(
        &mut self,
        artifact: &BugArtifact,
        ctx: &mut ValidationContext,
    ) -> ValidationStepResult {
        let name = ValidationStepName::ParserValidity;
        let step_started = Instant::now();

        if let Err(e) = self.install_harness(artifact) {
            return Self::step_result(name, false, json!({}), Some(e.to_string()), step_started);
        }
        match self.run_harness_verified(artifact.metadata.max_test_runtime_sec) {
            Ok(map) => {
                let count = map.len();
                ctx.baseline_map = Some(map);
                Self::step_result(
                    name,
                    true,
                    json!({ "test_count": count }),
                    None,
                    step_started,
                )
            }
            Err(message) => {
                Self::step_result(name, false, json!({}), Some(message), step_started)
            }
        }
    }

    /// Step 3: every baseline test passes and there are enough of them.
    fn step_original_tests_pass(
        &mut self,
        artifact: &BugArtifact,
        ctx: &mut ValidationContext,
    ) -> ValidationStepResult {
        let name = ValidationStepName::OriginalTestsPass;
        let step_started = Instant::now();
        let map = match &ctx.baseline_map {
            Some(map) => map,
            None => {
                return Self::step_result(
                    name,
                    false,
                    json!({}),
                    Some("no baseline test mapping available".to_string()),
                    step_started,
                )
            }
        };

        let not_passing: Vec<String> = map
            .iter()
            .filter(|(_, status)| **status != TestStatus::Passed)
            .map(|(id, status)| format!("{} ({})", id, status.as_str()))
            .collect();
        if !not_passing.is_empty() {
            let preview: Vec<&String> = not_passing.iter().take(10).collect();
            return Self::step_result(
                name,
                false,
                json!({
                    "not_passing_count": not_passing.len(),
                    "not_passing": preview,
                }),
                Some(format!(
                    "{} tests do not pass on the baseline",
                    not_passing.len()
                )),
                step_started,
            );
        }

        let min_required = artifact.metadata.min_passing_tests;
        if map.len() < min_required {
            return Self::step_result(
                name,
                false,
                json!({ "passing_count": map.len(), "min_required": min_required }),
                Some(format!(
                    "only {} passing tests, need at least {}",
                    map.len(),
                    min_required
                )),
                step_started,
            );
        }

        Self::step_result(
            name,
            true,
            json!({ "num_tests": map.len() }),
            None,
            step_started,
        )
    }

    /// Step 4: the bug diff touches enough files and stays out of the test
    /// surface.
    fn step_bug_scope(
        &mut self,
        artifact: &BugArtifact,
        ctx: &mut ValidationContext,
    ) -> ValidationStepResult {
        let name = ValidationStepName::BugScope;
        let step_started = Instant::now();

        let changed = touched_paths(&artifact.bug_inject_diff);
        let overlapping: Vec<String> = changed
            .iter()
            .filter(|f| artifact.test_files.contains(f))
            .cloned()
            .collect();
        if !overlapping.is_empty() {
            return Self::step_result(
                name,
                false,
                json!({ "test_files_modified": overlapping }),
                Some(format!(
                    "bug_inject_diff modifies test files: {}",
                    overlapping.join(", ")
                )),
                step_started,
            );
        }

        let min_required = artifact.metadata.min_changed_files;
        if changed.len() < min_required {
            return Self::step_result(
                name,
                false,
                json!({ "changed_files": changed.len(), "min_required": min_required }),
                Some(format!(
                    "only {} changed files, need at least {}",
                    changed.len(),
                    min_required
                )),
                step_started,
            );
        }

        let details = json!({ "changed_files": changed.len(), "files": changed });
        ctx.changed_code_files = changed;
        Self::step_result(name, true, details, None, step_started)
    }

    /// Step 5: with the bug applied, enough tests fail. Records M1.
    fn step_bug_validity(
        &mut self,
        artifact: &BugArtifact,
        ctx: &mut ValidationContext,
    ) -> ValidationStepResult {
        let name = ValidationStepName::BugValidity;
        let step_started = Instant::now();

        if let Err(e) = self.sandbox.apply_diff(&artifact.bug_inject_diff, false) {
            return Self::step_result(
                name,
                false,
                json!({}),
                Some(format!("failed to apply bug_inject_diff: {}", e)),
                step_started,
            );
        }
        let map = match self.run_harness_checked(artifact.metadata.max_test_runtime_sec) {
            Ok(map) => map,
            Err(message) => {
                return Self::step_result(name, false, json!({}), Some(message), step_started)
            }
        };

        let failing = count_with_status(&map, TestStatus::Failed);
        let min_required = artifact.metadata.min_failing_tests;
        let passed = failing >= min_required;
        let details = json!({ "failing_tests": failing, "min_required": min_required });
        ctx.bug_map = Some(map);
        if passed {
            Self::step_result(name, true, details, None, step_started)
        } else {
            Self::step_result(
                name,
                false,
                details,
                Some(format!(
                    "only {} failing tests, need at least {}",
                    failing, min_required
                )),
                step_started,
            )
        }
    }

    /// Step 6: with the weakening on top, at least one previously-failing
    /// test passes again. These recovered tests are the solver's oracle.
    fn step_test_weakening(
        &mut self,
        artifact: &BugArtifact,
        ctx: &mut ValidationContext,
    ) -> ValidationStepResult {
        let name = ValidationStepName::TestWeakeningValidity;
        let step_started = Instant::now();

        if let Err(e) = self.sandbox.apply_diff(&artifact.test_weaken_diff, false) {
            return Self::step_result(
                name,
                false,
                json!({}),
                Some(format!("failed to apply test_weaken_diff: {}", e)),
                step_started,
            );
        }
        let weak_map = match self.run_harness_checked(artifact.metadata.max_test_runtime_sec) {
            Ok(map) => map,
            Err(message) => {
                return Self::step_result(name, false, json!({}), Some(message), step_started)
            }
        };

        let bug_map = ctx.bug_map.clone().unwrap_or_default();
        let recovered: Vec<String> = weak_map
            .iter()
            .filter(|(id, status)| {
                **status == TestStatus::Passed
                    && bug_map.get(*id) == Some(&TestStatus::Failed)
            })
            .map(|(id, _)| id.clone())
            .collect();

        if recovered.is_empty() {
            return Self::step_result(
                name,
                false,
                json!({}),
                Some("no failing test recovered after applying test_weaken_diff".to_string()),
                step_started,
            );
        }
        Self::step_result(
            name,
            true,
            json!({ "recovered_tests": recovered.len(), "recovered": recovered }),
            None,
            step_started,
        )
    }

    /// Step 7: every file the bug touches must matter. For each changed file,
    /// rebuild the buggy state, restore that file alone from the baseline
    /// snapshot, and require at least one originally-failing test to flip.
    fn step_inverse_mutation(
        &mut self,
        artifact: &BugArtifact,
        ctx: &mut ValidationContext,
    ) -> ValidationStepResult {
        let name = ValidationStepName::InverseMutationTesting;
        let step_started = Instant::now();

        if ctx.changed_code_files.is_empty() {
            return Self::step_result(
                name,
                false,
                json!({}),
                Some("no changed code files to test".to_string()),
                step_started,
            );
        }
        let bug_map = match &ctx.bug_map {
            Some(map) => map.clone(),
            None => {
                return Self::step_result(
                    name,
                    false,
                    json!({}),
                    Some("no bug test mapping available".to_string()),
                    step_started,
                )
            }
        };
        let failing: Vec<String> = bug_map
            .iter()
            .filter(|(_, status)| **status == TestStatus::Failed)
            .map(|(id, _)| id.clone())
            .collect();

        let mut non_contributing: Vec<String> = Vec::new();
        for file in ctx.changed_code_files.clone() {
            let outcome = self.probe_file_contribution(artifact, &file, &failing);
            match outcome {
                Ok(true) => {}
                Ok(false) => non_contributing.push(file),
                // A harness failure during the probe is no evidence either
                // way; skip the file rather than condemn it.
                Err(_) => {}
            }
        }

        if !non_contributing.is_empty() {
            return Self::step_result(
                name,
                false,
                json!({ "non_contributing_files": non_contributing }),
                Some(format!(
                    "files do not contribute to the bug: {}",
                    non_contributing.join(", ")
                )),
                step_started,
            );
        }
        Self::step_result(
            name,
            true,
            json!({ "tested_files": ctx.changed_code_files.len() }),
            None,
            step_started,
        )
    }

    fn probe_file_contribution(
        &mut self,
        artifact: &BugArtifact,
        file: &str,
        failing: &[String],
    ) -> Result<bool, String> {
        self.sandbox
            .snapshot_restore(BASELINE_SNAPSHOT)
            .map_err(|e| e.to_string())?;
        self.install_harness(artifact).map_err(|e| e.to_string())?;
        self.sandbox
            .apply_diff(&artifact.bug_inject_diff, false)
            .map_err(|e| e.to_string())?;
        self.sandbox
            .snapshot_restore_paths(BASELINE_SNAPSHOT, &[file.to_string()])
            .map_err(|e| e.to_string())?;
        let map = self.run_harness_once(artifact.metadata.max_test_runtime_sec)?;
        Ok(failing
            .iter()
            .any(|id| map.get(id) == Some(&TestStatus::Passed)))
    }

    fn install_harness(&mut self, artifact: &BugArtifact) -> Result<(), SandboxError> {
        self.sandbox
            .write_file(TEST_SCRIPT_FILENAME, &artifact.test_script)?;
        self.sandbox
            .write_file(TEST_PARSER_FILENAME, &artifact.test_parser)?;
        let chmod = self.sandbox.bash(
            &format!("chmod +x {} {}", TEST_SCRIPT_FILENAME, TEST_PARSER_FILENAME),
            None,
            None,
            &[],
        )?;
        if chmod.exit_code != 0 {
            return Err(SandboxError::IoFailed(chmod.stderr));
        }
        Ok(())
    }

    fn run_harness_once(&mut self, timeout_secs: u64) -> Result<TestMap, String> {
        let result = self
            .sandbox
            .bash(&harness_command(), Some(timeout_secs), None, &[])
            .map_err(|e| e.to_string())?;
        if result.timed_out {
            return Err(format!("test harness timed out after {}s", timeout_secs));
        }
        let stdout = result.stdout.trim();
        let value: Value = serde_json::from_str(stdout)
            .map_err(|e| format!("parser output is not valid JSON: {}", e))?;
        studio_schemas::validate_parser_output(&value).map_err(|e| e.to_string())?;
        let object = value.as_object().expect("schema guarantees an object");
        let mut map = TestMap::new();
        for (test_id, status) in object {
            map.insert(
                test_id.clone(),
                TestStatus::from_label(status.as_str().unwrap_or("")),
            );
        }
        Ok(map)
    }

    /// Retries structural harness failures (timeout, non-JSON output) up to
    /// the configured bound before giving up.
    fn run_harness_checked(&mut self, timeout_secs: u64) -> Result<TestMap, String> {
        let mut last_error = String::new();
        for attempt in 0..=self.settings.retry_count {
            if attempt > 0 {
                thread::sleep(Duration::from_millis(self.settings.retry_delay_ms));
            }
            match self.run_harness_once(timeout_secs) {
                Ok(map) => return Ok(map),
                Err(message) => last_error = message,
            }
        }
        Err(last_error)
    }

    /// Baseline harness run with a confirmation rerun: a test whose status
    /// disagrees across runs is recorded as `error`, which step 3 rejects.
    fn run_harness_verified(&mut self, timeout_secs: u64) -> Result<TestMap, String> {
        let first = self.run_harness_checked(timeout_secs)?;
        if self.settings.retry_count == 0 {
            return Ok(first);
        }
        thread::sleep(Duration::from_millis(self.settings.retry_delay_ms));
        let second = self.run_harness_checked(timeout_secs)?;
        let mut merged = TestMap::new();
        for (id, status) in &first {
            match second.get(id) {
                Some(other) if other == status => {
                    merged.insert(id.clone(), *status);
                }
                _ => {
                    merged.insert(id.clone(), TestStatus::Error);
                }
            }
        }
        for id in second.keys() {
            if !first.contains_key(id) {
                merged.insert(id.clone(), TestStatus::Error);
            }
        }
        Ok(merged)
    }
}

fn count_with_status(map: &TestMap, wanted: TestStatus) -> usize {
    map.values().filter(|status| **status == wanted).count()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testfix;
    use std::fs;

    fn validate_fixture(
        label: &str,
        bug_diff: &str,
        weaken_diff: &str,
    ) -> (ValidationReport, std::path::PathBuf) {
        let base = testfix::temp_base(label);
        let mut sandbox = testfix::baseline_sandbox(&base);
        let artifact = testfix::calculator_artifact(bug_diff, weaken_diff);
        let report = Validator::new(&mut sandbox, ValidatorSettings::default()).validate(&artifact);
        (report, base)
    }

    #[test]
    fn valid_artifact_passes_all_seven_steps() {
        let (report, base) = validate_fixture(
            "valid",
            testfix::BUG_INJECT_DIFF,
            testfix::TEST_WEAKEN_DIFF,
        );
        assert!(report.valid, "report: {:?}", report);
        assert_eq!(report.steps.len(), 7);
        assert!(report.steps.iter().all(|s| s.passed));
        assert_eq!(
            report.steps[6].name,
            ValidationStepName::InverseMutationTesting
        );
        // Step 5 saw exactly the three broken add checks.
        assert_eq!(report.steps[4].details["failing_tests"], 3);
        // Step 6 recovered the two weakened checks.
        assert_eq!(report.steps[5].details["recovered_tests"], 2);
        let _ = fs::remove_dir_all(base);
    }

    #[test]
    fn weakening_that_touches_code_fails_step_one() {
        let (report, base) = validate_fixture(
            "weaken_scope",
            testfix::BUG_INJECT_DIFF,
            testfix::TEST_WEAKEN_DIFF_TOUCHES_CODE,
        );
        assert!(!report.valid);
        assert_eq!(report.steps.len(), 1);
        assert_eq!(report.steps[0].name, ValidationStepName::TestFilesExistence);
        assert!(report.steps[0]
            .error_message
            .as_deref()
            .unwrap_or("")
            .contains("non-test files"));
        let _ = fs::remove_dir_all(base);
    }

    #[test]
    fn missing_test_file_fails_step_one() {
        let base = testfix::temp_base("missing_file");
        let mut sandbox = testfix::baseline_sandbox(&base);
        let mut artifact =
            testfix::calculator_artifact(testfix::BUG_INJECT_DIFF, testfix::TEST_WEAKEN_DIFF);
        artifact.test_files.push("tests/absent.txt".to_string());
        let report = Validator::new(&mut sandbox, ValidatorSettings::default()).validate(&artifact);
        assert!(!report.valid);
        assert_eq!(report.steps[0].details["missing_files"][0], "tests/absent.txt");
        let _ = fs::remove_dir_all(base);
    }

    #[test]
    fn broken_parser_fails_step_two() {
        let base = testfix::temp_base("bad_parser");
        let mut sandbox = testfix::baseline_sandbox(&base);
        let mut artifact =
            testfix::calculator_artifact(testfix::BUG_INJECT_DIFF, testfix::TEST_WEAKEN_DIFF);
        artifact.test_parser = "#!/bin/sh\necho this is not json\n".to_string();
        let report = Validator::new(&mut sandbox, ValidatorSettings::default()).validate(&artifact);
        assert!(!report.valid);
        assert_eq!(report.steps.len(), 2);
        assert_eq!(report.steps[1].name, ValidationStepName::ParserValidity);
        let _ = fs::remove_dir_all(base);
    }

    #[test]
    fn empty_parser_output_fails_step_three() {
        let base = testfix::temp_base("empty_map");
        let mut sandbox = testfix::baseline_sandbox(&base);
        let mut artifact =
            testfix::calculator_artifact(testfix::BUG_INJECT_DIFF, testfix::TEST_WEAKEN_DIFF);
        // Schema-valid but empty: {} has fewer than min_passing_tests entries.
        artifact.test_parser = "#!/bin/sh\ncat > /dev/null; echo '{}'\n".to_string();
        let report = Validator::new(&mut sandbox, ValidatorSettings::default()).validate(&artifact);
        assert!(!report.valid);
        assert_eq!(report.steps.len(), 3);
        assert_eq!(report.steps[2].name, ValidationStepName::OriginalTestsPass);
        let _ = fs::remove_dir_all(base);
    }

    #[test]
    fn bug_that_breaks_nothing_fails_step_five() {
        // A whitespace-only "bug" applies cleanly but changes no outcome.
        let harmless = "--- a/util.sh\n+++ b/util.sh\n@@ -1,2 +1,2 @@\n \
# helper constants\n-SCALE=1\n+SCALE=2\n";
        let (report, base) = validate_fixture("no_failures", harmless, testfix::TEST_WEAKEN_DIFF);
        assert!(!report.valid);
        assert_eq!(report.steps.len(), 5);
        assert_eq!(report.steps[4].name, ValidationStepName::BugValidity);
        assert_eq!(report.steps[4].details["failing_tests"], 0);
        let _ = fs::remove_dir_all(base);
    }

    #[test]
    fn useless_weakening_fails_step_six() {
        // Reorders two unrelated checks; nothing failing flips to passing.
        let useless = "--- a/tests/checks.txt\n+++ b/tests/checks.txt\n@@ -3,4 +3,4 @@\n \
add 7 8 15 test_add_large\n-mul 2 3 6 test_mul_a\n-mul 4 4 16 test_mul_b\n\
+mul 4 4 16 test_mul_b\n+mul 2 3 6 test_mul_a\n mul 5 2 10 test_mul_c\n";
        let (report, base) = validate_fixture("weak_useless", testfix::BUG_INJECT_DIFF, useless);
        assert!(!report.valid);
        assert_eq!(report.steps.len(), 6);
        assert_eq!(
            report.steps[5].name,
            ValidationStepName::TestWeakeningValidity
        );
        let _ = fs::remove_dir_all(base);
    }

    #[test]
    fn padded_bug_diff_fails_inverse_mutation_with_culprit_listed() {
        let (report, base) = validate_fixture(
            "padded",
            testfix::BUG_INJECT_DIFF_PADDED,
            testfix::TEST_WEAKEN_DIFF,
        );
        assert!(!report.valid);
        let last = report.steps.last().expect("steps");
        assert_eq!(last.name, ValidationStepName::InverseMutationTesting);
        assert_eq!(last.details["non_contributing_files"][0], "util.sh");
        let _ = fs::remove_dir_all(base);
    }

    #[test]
    fn report_is_ordered_and_timed() {
        let (report, base) = validate_fixture(
            "timing",
            testfix::BUG_INJECT_DIFF,
            testfix::TEST_WEAKEN_DIFF,
        );
        let names: Vec<&str> = report.steps.iter().map(|s| s.name.as_str()).collect();
        assert_eq!(
            names,
            vec![
                "test_files_existence",
                "parser_validity",
                "original_tests_pass",
                "bug_scope",
                "bug_validity",
                "test_weakening_validity",
                "inverse_mutation_testing",
            ]
        );
        assert!(report.total_duration_ms > 0);
        let _ = fs::remove_dir_all(base);
    }
}
