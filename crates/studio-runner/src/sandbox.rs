//! Isolated, rollback-capable workspaces. Each episode gets one sandbox:
//! either a seeded host directory (process backend) or a docker container
//! with network, cpu and memory caps. All mutation goes through `bash`,
//! `write_file` and `edit`; snapshots are tar archives kept outside the
//! workspace so restoration stays byte-exact even after the workspace's VCS
//! history has been stripped.

use serde::{Deserialize, Serialize};
use std::fs;
use std::io::Read;
use std::path::{Component, Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::sync::atomic::{AtomicU64, Ordering};
use std::thread;
use std::time::{Duration, Instant};
use studio_core::{ensure_dir, sha256_dir};

pub const MAX_STREAM_BYTES: usize = 50 * 1024;
pub const TRUNCATION_MARKER: &str = "\n... [truncated]";
pub const TIMEOUT_EXIT_CODE: i32 = -1;

const WORKSPACE_DIR: &str = "workspace";
const STATE_DIR: &str = "state";
const DOCKER_STATE_DIR: &str = "/ssr-state";
const DOCKER_WORKSPACE_DIR: &str = "/workspace";

static PATCH_SEQ: AtomicU64 = AtomicU64::new(0);

#[derive(Debug)]
pub enum SandboxError {
    ImageMissing(String),
    StartFailed(String),
    NotStarted,
    BashTimeout { timeout_secs: u64 },
    PatchApplyFailed(String),
    NotFound(String),
    IoFailed(String),
}

impl std::fmt::Display for SandboxError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SandboxError::ImageMissing(image) => write!(f, "sandbox image missing: {}", image),
            SandboxError::StartFailed(detail) => write!(f, "sandbox start failed: {}", detail),
            SandboxError::NotStarted => write!(f, "sandbox not started"),
            SandboxError::BashTimeout { timeout_secs } => {
                write!(f, "command timed out after {}s", timeout_secs)
            }
            SandboxError::PatchApplyFailed(detail) => {
                write!(f, "patch apply failed: {}", detail)
            }
            SandboxError::NotFound(path) => write!(f, "not found: {}", path),
            SandboxError::IoFailed(detail) => write!(f, "sandbox io failed: {}", detail),
        }
    }
}

impl std::error::Error for SandboxError {}

pub type SandboxResult<T> = Result<T, SandboxError>;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BashResult {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
    pub duration_ms: u64,
    pub truncated: bool,
    pub timed_out: bool,
}

#[derive(Debug, Clone)]
pub struct SandboxLimits {
    pub cpus: f64,
    pub memory: String,
    pub bash_timeout_secs: u64,
    pub network_enabled: bool,
}

impl Default for SandboxLimits {
    fn default() -> Self {
        SandboxLimits {
            cpus: 2.0,
            memory: "4g".to_string(),
            bash_timeout_secs: 300,
            network_enabled: false,
        }
    }
}

/// File edit operations; each op is all-or-nothing for its file, there is no
/// cross-op transaction.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum EditOp {
    FullReplace {
        path: String,
        content: String,
    },
    SearchReplace {
        path: String,
        old_text: String,
        new_text: String,
    },
    InsertAtLine {
        path: String,
        line: usize,
        text: String,
    },
    DeleteRange {
        path: String,
        start_line: usize,
        end_line: usize,
    },
    ApplyUnifiedDiff {
        diff: String,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EditResult {
    pub success: bool,
    pub path: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub lines_changed: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DirEntry {
    pub name: String,
    pub is_dir: bool,
}

/// Backend primitives the high-level sandbox is built on. `exec` runs inside
/// the workspace; state paths (snapshots, scratch patches) live outside it
/// and are addressed through `state_shell_path`.
pub trait ExecBackend: Send {
    fn start(&mut self) -> SandboxResult<()>;
    fn stop(&mut self);
    fn exec(
        &mut self,
        command: &str,
        timeout: Duration,
        cwd: Option<&str>,
        env: &[(String, String)],
    ) -> SandboxResult<BashResult>;
    fn write_workspace_file(&mut self, rel_path: &str, content: &str) -> SandboxResult<()>;
    fn read_workspace_file(&mut self, rel_path: &str) -> SandboxResult<String>;
    fn write_state_file(&mut self, rel_path: &str, content: &str) -> SandboxResult<()>;
    fn state_shell_path(&self) -> String;
    fn image_digest(&self) -> Option<String>;
}

fn is_safe_token(value: &str) -> bool {
    !value.is_empty()
        && value
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
}

/// Rejects absolute paths and any path escaping the workspace.
pub fn confine_path(path: &str) -> SandboxResult<String> {
    if path.is_empty() {
        return Err(SandboxError::NotFound("<empty path>".to_string()));
    }
    let p = Path::new(path);
    if p.is_absolute() {
        return Err(SandboxError::IoFailed(format!(
            "absolute paths are not permitted: {}",
            path
        )));
    }
    let mut parts: Vec<String> = Vec::new();
    for component in p.components() {
        match component {
            Component::CurDir => {}
            Component::Normal(part) => parts.push(part.to_string_lossy().to_string()),
            _ => {
                return Err(SandboxError::IoFailed(format!(
                    "path escapes the workspace: {}",
                    path
                )))
            }
        }
    }
    if parts.is_empty() {
        return Ok(".".to_string());
    }
    Ok(parts.join("/"))
}

pub fn shell_quote(s: &str) -> String {
    if s.is_empty() {
        "''".to_string()
    } else if s
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || "-_./:".contains(c))
    {
        s.to_string()
    } else {
        format!("'{}'", s.replace('\'', "'\"'\"'"))
    }
}

fn truncate_stream(raw: Vec<u8>) -> (String, bool) {
    let mut text = String::from_utf8_lossy(&raw).to_string();
    if text.len() <= MAX_STREAM_BYTES {
        return (text, false);
    }
    let mut cut = MAX_STREAM_BYTES;
    while cut > 0 && !text.is_char_boundary(cut) {
        cut -= 1;
    }
    text.truncate(cut);
    text.push_str(TRUNCATION_MARKER);
    (text, true)
}

/// Spawns the child with piped streams, drains them on reader threads and
/// polls for exit against a deadline. On expiry the child is killed and the
/// result is marked timed out with the sentinel exit code.
fn run_with_deadline(mut cmd: Command, timeout: Duration) -> SandboxResult<BashResult> {
    cmd.stdin(Stdio::null());
    cmd.stdout(Stdio::piped());
    cmd.stderr(Stdio::piped());

    let started = Instant::now();
    let mut child: Child = cmd
        .spawn()
        .map_err(|e| SandboxError::IoFailed(format!("spawn failed: {}", e)))?;

    let stdout_handle = child.stdout.take().map(|mut pipe| {
        thread::spawn(move || {
            let mut buf = Vec::new();
            let _ = pipe.read_to_end(&mut buf);
            buf
        })
    });
    let stderr_handle = child.stderr.take().map(|mut pipe| {
        thread::spawn(move || {
            let mut buf = Vec::new();
            let _ = pipe.read_to_end(&mut buf);
            buf
        })
    });

    let deadline = started + timeout;
    let mut timed_out = false;
    let exit_code = loop {
        match child.try_wait() {
            Ok(Some(status)) => break status.code().unwrap_or(TIMEOUT_EXIT_CODE),
            Ok(None) => {
                if Instant::now() >= deadline {
                    let _ = child.kill();
                    let _ = child.wait();
                    timed_out = true;
                    break TIMEOUT_EXIT_CODE;
                }
                thread::sleep(Duration::from_millis(25));
            }
            Err(e) => return Err(SandboxError::IoFailed(format!("wait failed: {}", e))),
        }
    };

    let stdout_raw = stdout_handle
        .map(|h| h.join().unwrap_or_default())
        .unwrap_or_default();
    let stderr_raw = stderr_handle
        .map(|h| h.join().unwrap_or_default())
        .unwrap_or_default();
    let (stdout, stdout_truncated) = truncate_stream(stdout_raw);
    let (mut stderr, stderr_truncated) = truncate_stream(stderr_raw);
    if timed_out {
        if !stderr.is_empty() {
            stderr.push('\n');
        }
        stderr.push_str(&format!("command timed out after {}s", timeout.as_secs()));
    }

    Ok(BashResult {
        exit_code,
        stdout,
        stderr,
        duration_ms: started.elapsed().as_millis() as u64,
        truncated: stdout_truncated || stderr_truncated,
        timed_out,
    })
}

// ---------------------------------------------------------------------------
// Process backend
// ---------------------------------------------------------------------------

/// Workspace seeded by copying a host directory. Used for local environments
/// and the test suite; the isolation guarantees of the docker backend do not
/// apply here.
pub struct ProcessBackend {
    root: PathBuf,
    image_path: PathBuf,
    digest: Option<String>,
    started: bool,
}

impl ProcessBackend {
    pub fn new(root: impl AsRef<Path>, image_path: impl AsRef<Path>) -> Self {
        ProcessBackend {
            root: root.as_ref().to_path_buf(),
            image_path: image_path.as_ref().to_path_buf(),
            digest: None,
            started: false,
        }
    }

    fn workspace(&self) -> PathBuf {
        self.root.join(WORKSPACE_DIR)
    }

    fn state(&self) -> PathBuf {
        self.root.join(STATE_DIR)
    }

    fn guard_started(&self) -> SandboxResult<()> {
        if self.started {
            Ok(())
        } else {
            Err(SandboxError::NotStarted)
        }
    }
}

impl ExecBackend for ProcessBackend {
    fn start(&mut self) -> SandboxResult<()> {
        if self.started {
            return Ok(());
        }
        if !self.image_path.is_dir() {
            return Err(SandboxError::ImageMissing(
                self.image_path.to_string_lossy().to_string(),
            ));
        }
        ensure_dir(&self.workspace())
            .and_then(|_| ensure_dir(&self.state().join("snapshots")))
            .and_then(|_| ensure_dir(&self.state().join("tmp")))
            .map_err(|e| SandboxError::StartFailed(e.to_string()))?;
        let seed = Command::new("cp")
            .arg("-a")
            .arg(format!("{}/.", self.image_path.to_string_lossy()))
            .arg(self.workspace())
            .output()
            .map_err(|e| SandboxError::StartFailed(e.to_string()))?;
        if !seed.status.success() {
            return Err(SandboxError::StartFailed(
                String::from_utf8_lossy(&seed.stderr).trim().to_string(),
            ));
        }
        self.digest = sha256_dir(&self.image_path).ok();
        self.started = true;
        Ok(())
    }

    fn stop(&mut self) {
        if self.started {
            let _ = fs::remove_dir_all(&self.root);
            self.started = false;
        }
    }

    fn exec(
        &mut self,
        command: &str,
        timeout: Duration,
        cwd: Option<&str>,
        env: &[(String, String)],
    ) -> SandboxResult<BashResult> {
        self.guard_started()?;
        let cwd_path = match cwd {
            Some(rel) => self.workspace().join(rel),
            None => self.workspace(),
        };
        let mut cmd = Command::new("sh");
        cmd.arg("-lc").arg(command).current_dir(cwd_path);
        for (key, value) in env {
            cmd.env(key, value);
        }
        run_with_deadline(cmd, timeout)
    }

    fn write_workspace_file(&mut self, rel_path: &str, content: &str) -> SandboxResult<()> {
        self.guard_started()?;
        let path = self.workspace().join(rel_path);
        if let Some(parent) = path.parent() {
            ensure_dir(parent).map_err(|e| SandboxError::IoFailed(e.to_string()))?;
        }
        fs::write(&path, content).map_err(|e| SandboxError::IoFailed(e.to_string()))
    }

    fn read_workspace_file(&mut self, rel_path: &str) -> SandboxResult<String> {
        self.guard_started()?;
        let path = self.workspace().join(rel_path);
        fs::read_to_string(&path).map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                SandboxError::NotFound(rel_path.to_string())
            } else {
                SandboxError::IoFailed(e.to_string())
            }
        })
    }

    fn write_state_file(&mut self, rel_path: &str, content: &str) -> SandboxResult<()> {
        self.guard_started()?;
        let path = self.state().join(rel_path);
        if let Some(parent) = path.parent() {
            ensure_dir(parent).map_err(|e| SandboxError::IoFailed(e.to_string()))?;
        }
        fs::write(&path, content).map_err(|e| SandboxError::IoFailed(e.to_string()))
    }

    fn state_shell_path(&self) -> String {
        self.state().to_string_lossy().to_string()
    }

    fn image_digest(&self) -> Option<String> {
        self.digest.clone()
    }
}

// ---------------------------------------------------------------------------
// Docker backend
// ---------------------------------------------------------------------------

/// Docker container per sandbox: no network by default, cpu and memory caps,
/// dropped capabilities, removed unconditionally on stop or drop.
pub struct DockerBackend {
    image_ref: String,
    container_name: String,
    container_id: Option<String>,
    limits: SandboxLimits,
    digest: Option<String>,
}

impl DockerBackend {
    pub fn new(image_ref: &str, limits: SandboxLimits) -> Self {
        DockerBackend {
            image_ref: image_ref.to_string(),
            container_name: format!("ssr-sandbox-{}", studio_core::mint_id("sbx")),
            container_id: None,
            limits,
            digest: None,
        }
    }

    fn guard_container(&self) -> SandboxResult<&str> {
        self.container_id
            .as_deref()
            .ok_or(SandboxError::NotStarted)
    }

    fn run_checked(mut cmd: Command, step: &str) -> SandboxResult<std::process::Output> {
        let out = cmd
            .output()
            .map_err(|e| SandboxError::IoFailed(format!("{}: {}", step, e)))?;
        if out.status.success() {
            return Ok(out);
        }
        let stderr = String::from_utf8_lossy(&out.stderr).trim().to_string();
        let stdout = String::from_utf8_lossy(&out.stdout).trim().to_string();
        let detail = if !stderr.is_empty() {
            stderr
        } else if !stdout.is_empty() {
            stdout
        } else {
            "command exited non-zero".to_string()
        };
        Err(SandboxError::IoFailed(format!("{}: {}", step, detail)))
    }
}

impl ExecBackend for DockerBackend {
    fn start(&mut self) -> SandboxResult<()> {
        if self.container_id.is_some() {
            return Ok(());
        }
        let mut create = Command::new("docker");
        create
            .arg("create")
            .args(["--name", &self.container_name])
            .args(["--workdir", DOCKER_WORKSPACE_DIR])
            .args(["--cpus", &format!("{}", self.limits.cpus)])
            .args(["--memory", &self.limits.memory])
            .args(["--security-opt", "no-new-privileges:true"])
            .args(["--cap-drop", "ALL"])
            .args(["--label", "ssr.sandbox=1"]);
        if !self.limits.network_enabled {
            create.args(["--network", "none"]);
        }
        create.arg(&self.image_ref);
        create.args(["tail", "-f", "/dev/null"]);
        let created = match Self::run_checked(create, "docker create failed") {
            Ok(out) => out,
            Err(SandboxError::IoFailed(detail)) if detail.contains("No such image") => {
                return Err(SandboxError::ImageMissing(self.image_ref.clone()))
            }
            Err(err) => return Err(SandboxError::StartFailed(err.to_string())),
        };
        let container_id = String::from_utf8_lossy(&created.stdout).trim().to_string();
        if container_id.is_empty() {
            return Err(SandboxError::StartFailed(
                "docker create returned no container id".to_string(),
            ));
        }
        self.container_id = Some(container_id.clone());

        let mut start = Command::new("docker");
        start.args(["start", &container_id]);
        Self::run_checked(start, "docker start failed")
            .map_err(|e| SandboxError::StartFailed(e.to_string()))?;

        let mut prepare = Command::new("docker");
        prepare.args(["exec", &container_id, "sh", "-lc"]);
        prepare.arg(format!(
            "mkdir -p {dir}/snapshots {dir}/tmp {ws}",
            dir = DOCKER_STATE_DIR,
            ws = DOCKER_WORKSPACE_DIR
        ));
        Self::run_checked(prepare, "sandbox state dir setup failed")
            .map_err(|e| SandboxError::StartFailed(e.to_string()))?;

        let mut inspect = Command::new("docker");
        inspect.args(["image", "inspect", "--format", "{{.Id}}", &self.image_ref]);
        self.digest = inspect
            .output()
            .ok()
            .filter(|out| out.status.success())
            .map(|out| String::from_utf8_lossy(&out.stdout).trim().to_string());
        Ok(())
    }

    fn stop(&mut self) {
        if let Some(container_id) = self.container_id.take() {
            let _ = Command::new("docker")
                .args(["rm", "-f", &container_id])
                .output();
        }
    }

    fn exec(
        &mut self,
        command: &str,
        timeout: Duration,
        cwd: Option<&str>,
        env: &[(String, String)],
    ) -> SandboxResult<BashResult> {
        let container_id = self.guard_container()?.to_string();
        let workdir = match cwd {
            Some(rel) => format!("{}/{}", DOCKER_WORKSPACE_DIR, rel),
            None => DOCKER_WORKSPACE_DIR.to_string(),
        };
        let mut cmd = Command::new("docker");
        cmd.arg("exec").args(["-w", &workdir]);
        for (key, value) in env {
            cmd.args(["-e", &format!("{}={}", key, value)]);
        }
        cmd.arg(&container_id).args(["sh", "-lc", command]);
        run_with_deadline(cmd, timeout)
    }

    fn write_workspace_file(&mut self, rel_path: &str, content: &str) -> SandboxResult<()> {
        let container_id = self.guard_container()?.to_string();
        if let Some((parent, _)) = rel_path.rsplit_once('/') {
            let mut mkdir = Command::new("docker");
            mkdir.args(["exec", &container_id, "sh", "-lc"]);
            mkdir.arg(format!(
                "mkdir -p {}/{}",
                DOCKER_WORKSPACE_DIR,
                shell_quote(parent)
            ));
            Self::run_checked(mkdir, "mkdir failed")?;
        }
        let staging = std::env::temp_dir().join(format!(
            "ssr_cp_{}_{}",
            std::process::id(),
            PATCH_SEQ.fetch_add(1, Ordering::Relaxed)
        ));
        fs::write(&staging, content).map_err(|e| SandboxError::IoFailed(e.to_string()))?;
        let mut copy = Command::new("docker");
        copy.arg("cp").arg(&staging).arg(format!(
            "{}:{}/{}",
            container_id, DOCKER_WORKSPACE_DIR, rel_path
        ));
        let outcome = Self::run_checked(copy, "docker cp failed");
        let _ = fs::remove_file(&staging);
        outcome.map(|_| ())
    }

    fn read_workspace_file(&mut self, rel_path: &str) -> SandboxResult<String> {
        let container_id = self.guard_container()?.to_string();
        let mut cat = Command::new("docker");
        cat.args(["exec", &container_id, "sh", "-lc"]);
        cat.arg(format!("cat {}", shell_quote(rel_path)));
        let out = cat
            .output()
            .map_err(|e| SandboxError::IoFailed(e.to_string()))?;
        if !out.status.success() {
            return Err(SandboxError::NotFound(rel_path.to_string()));
        }
        Ok(String::from_utf8_lossy(&out.stdout).to_string())
    }

    fn write_state_file(&mut self, rel_path: &str, content: &str) -> SandboxResult<()> {
        let container_id = self.guard_container()?.to_string();
        let staging = std::env::temp_dir().join(format!(
            "ssr_state_{}_{}",
            std::process::id(),
            PATCH_SEQ.fetch_add(1, Ordering::Relaxed)
        ));
        fs::write(&staging, content).map_err(|e| SandboxError::IoFailed(e.to_string()))?;
        let mut copy = Command::new("docker");
        copy.arg("cp")
            .arg(&staging)
            .arg(format!("{}:{}/{}", container_id, DOCKER_STATE_DIR, rel_path));
        let outcome = Self::run_checked(copy, "docker cp failed");
        let _ = fs::remove_file(&staging);
        outcome.map(|_| ())
    }

    fn state_shell_path(&self) -> String {
        DOCKER_STATE_DIR.to_string()
    }

    fn image_digest(&self) -> Option<String> {
        self.digest.clone()
    }
}

impl Drop for DockerBackend {
    fn drop(&mut self) {
        self.stop();
    }
}

// ---------------------------------------------------------------------------
// High-level sandbox
// ---------------------------------------------------------------------------

pub struct Sandbox {
    backend: Box<dyn ExecBackend>,
    limits: SandboxLimits,
}

impl Sandbox {
    pub fn process(root: impl AsRef<Path>, image_path: impl AsRef<Path>, limits: SandboxLimits) -> Sandbox {
        Sandbox {
            backend: Box::new(ProcessBackend::new(root, image_path)),
            limits,
        }
    }

    pub fn docker(image_ref: &str, limits: SandboxLimits) -> Sandbox {
        Sandbox {
            backend: Box::new(DockerBackend::new(image_ref, limits.clone())),
            limits,
        }
    }

    pub fn start(&mut self) -> SandboxResult<()> {
        self.backend.start()
    }

    pub fn destroy(&mut self) {
        self.backend.stop();
    }

    pub fn image_digest(&self) -> Option<String> {
        self.backend.image_digest()
    }

    pub fn bash(
        &mut self,
        command: &str,
        timeout_secs: Option<u64>,
        cwd: Option<&str>,
        env: &[(String, String)],
    ) -> SandboxResult<BashResult> {
        let timeout = Duration::from_secs(timeout_secs.unwrap_or(self.limits.bash_timeout_secs));
        let cwd = match cwd {
            Some(path) => Some(confine_path(path)?),
            None => None,
        };
        self.backend.exec(command, timeout, cwd.as_deref(), env)
    }

    pub fn read_file(
        &mut self,
        path: &str,
        start_line: Option<usize>,
        end_line: Option<usize>,
    ) -> SandboxResult<String> {
        let rel = confine_path(path)?;
        let content = self.backend.read_workspace_file(&rel)?;
        match (start_line, end_line) {
            (None, None) => Ok(content),
            (start, end) => {
                let lines: Vec<&str> = content.lines().collect();
                let from = start.unwrap_or(1).max(1) - 1;
                let to = end.unwrap_or(lines.len()).min(lines.len());
                if from >= to {
                    return Ok(String::new());
                }
                Ok(lines[from..to].join("\n"))
            }
        }
    }

    pub fn write_file(&mut self, path: &str, content: &str) -> SandboxResult<()> {
        let rel = confine_path(path)?;
        self.backend.write_workspace_file(&rel, content)
    }

    pub fn edit(&mut self, ops: &[EditOp]) -> Vec<EditResult> {
        ops.iter().map(|op| self.apply_edit(op)).collect()
    }

    fn apply_edit(&mut self, op: &EditOp) -> EditResult {
        match op {
            EditOp::FullReplace { path, content } => match self.write_file(path, content) {
                Ok(()) => EditResult {
                    success: true,
                    path: path.clone(),
                    error: None,
                    lines_changed: content.lines().count(),
                },
                Err(e) => edit_failure(path, e),
            },
            EditOp::SearchReplace {
                path,
                old_text,
                new_text,
            } => {
                let content = match self.read_file(path, None, None) {
                    Ok(content) => content,
                    Err(e) => return edit_failure(path, e),
                };
                let occurrences = content.matches(old_text.as_str()).count();
                if occurrences == 0 {
                    return EditResult {
                        success: false,
                        path: path.clone(),
                        error: Some("old_text not found in file".to_string()),
                        lines_changed: 0,
                    };
                }
                let updated = content.replace(old_text.as_str(), new_text.as_str());
                match self.write_file(path, &updated) {
                    Ok(()) => EditResult {
                        success: true,
                        path: path.clone(),
                        error: None,
                        lines_changed: occurrences,
                    },
                    Err(e) => edit_failure(path, e),
                }
            }
            EditOp::InsertAtLine { path, line, text } => {
                let content = match self.read_file(path, None, None) {
                    Ok(content) => content,
                    Err(e) => return edit_failure(path, e),
                };
                let mut lines: Vec<String> = content.lines().map(|l| l.to_string()).collect();
                let at = line.saturating_sub(1).min(lines.len());
                let inserted = text.lines().count().max(1);
                let new_lines: Vec<String> = text.lines().map(|l| l.to_string()).collect();
                lines.splice(at..at, new_lines);
                let mut updated = lines.join("\n");
                if content.ends_with('\n') || content.is_empty() {
                    updated.push('\n');
                }
                match self.write_file(path, &updated) {
                    Ok(()) => EditResult {
                        success: true,
                        path: path.clone(),
                        error: None,
                        lines_changed: inserted,
                    },
                    Err(e) => edit_failure(path, e),
                }
            }
            EditOp::DeleteRange {
                path,
                start_line,
                end_line,
            } => {
                let content = match self.read_file(path, None, None) {
                    Ok(content) => content,
                    Err(e) => return edit_failure(path, e),
                };
                let lines: Vec<&str> = content.lines().collect();
                if *start_line == 0 || *start_line > *end_line || *end_line > lines.len() {
                    return EditResult {
                        success: false,
                        path: path.clone(),
                        error: Some(format!(
                            "invalid line range {}..{} for {} lines",
                            start_line,
                            end_line,
                            lines.len()
                        )),
                        lines_changed: 0,
                    };
                }
                let mut kept: Vec<&str> = Vec::new();
                kept.extend(&lines[..start_line - 1]);
                kept.extend(&lines[*end_line..]);
                let mut updated = kept.join("\n");
                if content.ends_with('\n') && !updated.is_empty() {
                    updated.push('\n');
                }
                match self.write_file(path, &updated) {
                    Ok(()) => EditResult {
                        success: true,
                        path: path.clone(),
                        error: None,
                        lines_changed: end_line - start_line + 1,
                    },
                    Err(e) => edit_failure(path, e),
                }
            }
            EditOp::ApplyUnifiedDiff { diff } => {
                let path = crate::diff::touched_paths(diff)
                    .into_iter()
                    .next()
                    .unwrap_or_else(|| "<diff>".to_string());
                match self.apply_diff(diff, false) {
                    Ok(()) => EditResult {
                        success: true,
                        path,
                        error: None,
                        lines_changed: diff
                            .lines()
                            .filter(|l| {
                                (l.starts_with('+') && !l.starts_with("+++"))
                                    || (l.starts_with('-') && !l.starts_with("---"))
                            })
                            .count(),
                    },
                    Err(e) => EditResult {
                        success: false,
                        path,
                        error: Some(e.to_string()),
                        lines_changed: 0,
                    },
                }
            }
        }
    }

    pub fn list_dir(&mut self, path: &str) -> SandboxResult<Vec<DirEntry>> {
        let rel = confine_path(path)?;
        let result = self.bash(&format!("ls -1Ap {}", shell_quote(&rel)), None, None, &[])?;
        if result.exit_code != 0 {
            return Err(SandboxError::NotFound(path.to_string()));
        }
        Ok(result
            .stdout
            .lines()
            .filter(|l| !l.is_empty())
            .map(|l| {
                let is_dir = l.ends_with('/');
                DirEntry {
                    name: l.trim_end_matches('/').to_string(),
                    is_dir,
                }
            })
            .collect())
    }

    pub fn find_files(&mut self, pattern: &str, path: &str) -> SandboxResult<Vec<String>> {
        let rel = confine_path(path)?;
        let result = self.bash(
            &format!(
                "find {} -name {} -type f 2>/dev/null",
                shell_quote(&rel),
                shell_quote(pattern)
            ),
            None,
            None,
            &[],
        )?;
        Ok(result
            .stdout
            .lines()
            .filter(|l| !l.is_empty())
            .map(|l| l.strip_prefix("./").unwrap_or(l).to_string())
            .collect())
    }

    fn snapshot_tar(&self, name: &str) -> String {
        format!("{}/snapshots/{}.tar", self.backend.state_shell_path(), name)
    }

    pub fn snapshot_init(&mut self) -> SandboxResult<()> {
        let state = self.backend.state_shell_path();
        let result = self.bash(&format!("mkdir -p {0}/snapshots {0}/tmp", state), None, None, &[])?;
        if result.exit_code != 0 {
            return Err(SandboxError::IoFailed(result.stderr));
        }
        Ok(())
    }

    /// Archives the workspace (dotfiles included) as `<name>` and, when the
    /// workspace carries a git repo, records a matching tag for `diff_since`.
    pub fn snapshot_tag(&mut self, name: &str) -> SandboxResult<()> {
        if !is_safe_token(name) {
            return Err(SandboxError::IoFailed(format!(
                "invalid snapshot name: {}",
                name
            )));
        }
        let result = self.bash(
            &format!("tar -cf {} .", self.snapshot_tar(name)),
            None,
            None,
            &[],
        )?;
        if result.exit_code != 0 {
            return Err(SandboxError::IoFailed(format!(
                "snapshot tar failed: {}",
                result.stderr
            )));
        }
        let has_git = self.bash("test -d .git", None, None, &[])?.exit_code == 0;
        if has_git {
            let tag = self.bash(
                &format!(
                    "git add -A && git -c user.email=studio@local -c user.name=studio \
                     commit -qm 'snapshot {0}' --allow-empty && git tag -f {0}",
                    name
                ),
                None,
                None,
                &[],
            )?;
            if tag.exit_code != 0 {
                return Err(SandboxError::IoFailed(format!(
                    "snapshot tag failed: {}",
                    tag.stderr
                )));
            }
        }
        Ok(())
    }

    /// Returns the workspace to the exact content it had at `snapshot_tag`.
    pub fn snapshot_restore(&mut self, name: &str) -> SandboxResult<()> {
        let tar = self.snapshot_tar(name);
        if self.bash(&format!("test -f {}", tar), None, None, &[])?.exit_code != 0 {
            return Err(SandboxError::NotFound(format!("snapshot {}", name)));
        }
        let result = self.bash(
            &format!("find . -mindepth 1 -delete && tar -xf {}", tar),
            None,
            None,
            &[],
        )?;
        if result.exit_code != 0 {
            return Err(SandboxError::IoFailed(format!(
                "snapshot restore failed: {}",
                result.stderr
            )));
        }
        Ok(())
    }

    /// Restores only the named paths from a snapshot, leaving the rest of the
    /// workspace untouched.
    pub fn snapshot_restore_paths(&mut self, name: &str, paths: &[String]) -> SandboxResult<()> {
        let tar = self.snapshot_tar(name);
        for path in paths {
            let rel = confine_path(path)?;
            let result = self.bash(
                &format!("tar -xf {} ./{}", tar, shell_quote(&rel)),
                None,
                None,
                &[],
            )?;
            if result.exit_code != 0 {
                return Err(SandboxError::NotFound(format!(
                    "snapshot {} has no member {}",
                    name, rel
                )));
            }
        }
        Ok(())
    }

    /// Unified diff of the workspace against a tagged snapshot. New files are
    /// staged intent-to-add so they appear in the diff.
    pub fn diff_since(&mut self, name: &str) -> SandboxResult<String> {
        let result = self.bash(
            &format!("git add -AN . >/dev/null 2>&1; git diff {}", name),
            None,
            None,
            &[],
        )?;
        if result.exit_code != 0 {
            return Err(SandboxError::IoFailed(format!(
                "diff since {} failed: {}",
                name, result.stderr
            )));
        }
        Ok(result.stdout)
    }

    /// Applies a unified diff at strip level 1; `reverse` performs a genuine
    /// reverse-apply via the patch utility.
    pub fn apply_diff(&mut self, diff: &str, reverse: bool) -> SandboxResult<()> {
        let seq = PATCH_SEQ.fetch_add(1, Ordering::Relaxed);
        let rel = format!("tmp/patch_{}.diff", seq);
        self.backend.write_state_file(&rel, diff)?;
        let flag = if reverse { " -R" } else { "" };
        let result = self.bash(
            &format!(
                "patch -p1{} --no-backup-if-mismatch < {}/{}",
                flag,
                self.backend.state_shell_path(),
                rel
            ),
            None,
            None,
            &[],
        )?;
        if result.exit_code != 0 {
            return Err(SandboxError::PatchApplyFailed(format!(
                "{}{}",
                result.stdout.trim(),
                result.stderr.trim()
            )));
        }
        Ok(())
    }
}

fn edit_failure(path: &str, error: SandboxError) -> EditResult {
    EditResult {
        success: false,
        path: path.to_string(),
        error: Some(error.to_string()),
        lines_changed: 0,
    }
}

impl Drop for Sandbox {
    fn drop(&mut self) {
        self.backend.stop();
    }
}
