//! Shared test fixture: a tiny shell "calculator" repository whose test
//! surface is a list of expected-value checks, plus a complete bug artifact
//! over it. The weakening rewrites expected values, so a failing check
//! genuinely flips to passing, which exercises every validator step.

use crate::models::{ArtifactMetadata, BugArtifact, EpisodeConfig, InjectionStrategy};
use crate::sandbox::{Sandbox, SandboxLimits};
use chrono::Utc;
use std::fs;
use std::path::{Path, PathBuf};
use studio_core::ensure_dir;

pub const LIB_SH: &str = "add() {\n    echo $(( $1 + $2 ))\n}\n\nmul() {\n    echo $(( $1 * $2 ))\n}\n";
pub const UTIL_SH: &str = "# helper constants\nSCALE=1\n";
pub const CHECKS: &str = "\
add 2 3 5 test_add_small
add 10 4 14 test_add_mid
add 7 8 15 test_add_large
mul 2 3 6 test_mul_a
mul 4 4 16 test_mul_b
mul 5 2 10 test_mul_c
mul 6 3 18 test_mul_d
mul 7 2 14 test_mul_e
mul 8 3 24 test_mul_f
mul 9 2 18 test_mul_g
mul 3 3 9 test_mul_h
mul 1 9 9 test_mul_i
";

pub const TEST_SCRIPT: &str = "\
#!/bin/sh
. ./lib.sh
while read -r fn a b expected name; do
    [ -n \"$name\" ] || continue
    got=$(\"$fn\" \"$a\" \"$b\")
    if [ \"$got\" = \"$expected\" ]; then
        echo \"PASS $name\"
    else
        echo \"FAIL $name\"
    fi
done < tests/checks.txt
";

pub const TEST_PARSER: &str = "\
#!/bin/sh
awk 'BEGIN { printf \"{\"; n = 0 }
$1 == \"PASS\" || $1 == \"FAIL\" {
    if (n++) printf \",\"
    printf \"\\\"%s\\\":\\\"%s\\\"\", $2, ($1 == \"PASS\" ? \"passed\" : \"failed\")
}
END { print \"}\" }'
";

pub const BUG_INJECT_DIFF: &str = "\
--- a/lib.sh
+++ b/lib.sh
@@ -1,3 +1,3 @@
 add() {
-    echo $(( $1 + $2 ))
+    echo $(( $1 - $2 ))
 }
";

/// Same bug plus a second, irrelevant edit; reverting util.sh alone changes
/// no test outcome, so inverse mutation testing must flag it.
pub const BUG_INJECT_DIFF_PADDED: &str = "\
--- a/lib.sh
+++ b/lib.sh
@@ -1,3 +1,3 @@
 add() {
-    echo $(( $1 + $2 ))
+    echo $(( $1 - $2 ))
 }
--- a/util.sh
+++ b/util.sh
@@ -1,2 +1,2 @@
 # helper constants
-SCALE=1
+SCALE=2
";

/// Rewrites the expected values of two of the three failing add checks to
/// the buggy outputs; the third keeps failing.
pub const TEST_WEAKEN_DIFF: &str = "\
--- a/tests/checks.txt
+++ b/tests/checks.txt
@@ -1,4 +1,4 @@
-add 2 3 5 test_add_small
-add 10 4 14 test_add_mid
+add 2 3 -1 test_add_small
+add 10 4 6 test_add_mid
 add 7 8 15 test_add_large
 mul 2 3 6 test_mul_a
";

/// A weakening that illegally touches a code file; step 1 must reject it.
pub const TEST_WEAKEN_DIFF_TOUCHES_CODE: &str = "\
--- a/lib.sh
+++ b/lib.sh
@@ -1,3 +1,3 @@
 add() {
-    echo $(( $1 + $2 ))
+    echo $(( $1 + $2 + 0 ))
 }
";

/// The correct repair for the injected bug.
pub const FIX_PATCH: &str = "\
--- a/lib.sh
+++ b/lib.sh
@@ -1,3 +1,3 @@
 add() {
-    echo $(( $1 - $2 ))
+    echo $(( $1 + $2 ))
 }
";

pub fn write_calculator_image(base: &Path) -> PathBuf {
    let image = base.join("image");
    ensure_dir(&image.join("tests")).expect("image dirs");
    fs::write(image.join("lib.sh"), LIB_SH).expect("lib.sh");
    fs::write(image.join("util.sh"), UTIL_SH).expect("util.sh");
    fs::write(image.join("tests").join("checks.txt"), CHECKS).expect("checks.txt");
    image
}

pub fn baseline_sandbox(base: &Path) -> Sandbox {
    let image = write_calculator_image(base);
    let mut sandbox = Sandbox::process(base.join("sbx"), image, SandboxLimits::default());
    sandbox.start().expect("sandbox start");
    sandbox.snapshot_init().expect("snapshot init");
    sandbox
        .snapshot_tag(studio_core::BASELINE_SNAPSHOT)
        .expect("baseline tag");
    sandbox
}

pub fn calculator_config() -> EpisodeConfig {
    EpisodeConfig {
        min_passing_tests: 10,
        max_test_runtime_sec: 30,
        ..EpisodeConfig::default()
    }
}

pub fn calculator_artifact(bug_diff: &str, weaken_diff: &str) -> BugArtifact {
    let config = calculator_config();
    BugArtifact {
        metadata: ArtifactMetadata {
            artifact_id: studio_core::mint_id("art"),
            env_id: "env_fixture".to_string(),
            injection_strategy: InjectionStrategy::Direct,
            min_passing_tests: config.min_passing_tests,
            min_changed_files: config.min_changed_files,
            min_failing_tests: config.min_failing_tests,
            max_test_runtime_sec: config.max_test_runtime_sec,
            created_by_model: "fixture".to_string(),
            created_at: Utc::now(),
            parent_artifact_id: None,
            bug_order: 1,
        },
        test_script: TEST_SCRIPT.to_string(),
        test_files: vec!["tests/checks.txt".to_string()],
        test_parser: TEST_PARSER.to_string(),
        bug_inject_diff: bug_diff.to_string(),
        test_weaken_diff: weaken_diff.to_string(),
    }
}

pub fn temp_base(label: &str) -> PathBuf {
    let nanos = Utc::now().timestamp_nanos_opt().unwrap_or(0);
    std::env::temp_dir().join(format!(
        "studio_fix_{}_{}_{}",
        label,
        std::process::id(),
        nanos
    ))
}
