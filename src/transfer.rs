use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use reqwest::Url;
use reqwest::blocking::Client;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tracing::{debug, info, warn};

use crate::domain::{ArchiveDescriptor, Checksum};
use crate::error::KiraError;

pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(200);
pub const MAX_CONNECTIONS_PER_SERVER: u32 = 16;
/// aria2 exit/error code reported for a failed checksum validation.
pub const ARIA2_CHECKSUM_ERROR: &str = "32";
pub const DAEMON_STOP_TIMEOUT: Duration = Duration::from_secs(5);
const STOP_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Connection caps handed to aria2. They bound the transfer layer only and are
/// independent of the worker count.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ConnectionBudget {
    total: u32,
    per_server: u32,
}

impl ConnectionBudget {
    pub fn new(total: u32, per_server: Option<u32>) -> Self {
        let total = total.max(1);
        let per_server = per_server
            .unwrap_or(total)
            .clamp(1, MAX_CONNECTIONS_PER_SERVER);
        Self { total, per_server }
    }

    pub fn total(&self) -> u32 {
        self.total
    }

    pub fn per_server(&self) -> u32 {
        self.per_server
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferJob {
    pub url: String,
    pub output_dir: PathBuf,
    pub output_name: String,
    pub checksum: Option<Checksum>,
}

impl TransferJob {
    pub fn output_path(&self) -> PathBuf {
        self.output_dir.join(&self.output_name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct JobHandle(pub String);

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobStatus {
    Pending,
    Complete,
    Failed {
        code: Option<String>,
        message: String,
    },
}

/// Control interface of a long-lived download daemon.
pub trait TransferClient: Send + Sync {
    fn submit(&self, job: &TransferJob) -> Result<JobHandle, KiraError>;
    fn poll(&self, handle: &JobHandle) -> Result<JobStatus, KiraError>;
    fn remove(&self, handle: &JobHandle) -> Result<(), KiraError>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttemptFailure {
    pub checksum_mismatch: bool,
    pub message: String,
}

impl AttemptFailure {
    fn from_error(err: KiraError) -> Self {
        Self {
            checksum_mismatch: false,
            message: err.to_string(),
        }
    }
}

/// One blocking transfer attempt, however it is carried out.
pub trait TransferBackend: Send + Sync {
    fn attempt(&self, job: &TransferJob) -> Result<(), AttemptFailure>;
}

/// Submits to a daemon and polls the job until it settles.
pub struct DaemonBackend<C: TransferClient> {
    client: C,
    poll_interval: Duration,
}

impl<C: TransferClient> DaemonBackend<C> {
    pub fn new(client: C) -> Self {
        Self {
            client,
            poll_interval: DEFAULT_POLL_INTERVAL,
        }
    }

    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    pub fn client(&self) -> &C {
        &self.client
    }

    fn wait_on(&self, handle: &JobHandle) -> Result<JobStatus, KiraError> {
        loop {
            match self.client.poll(handle)? {
                JobStatus::Pending => thread::sleep(self.poll_interval),
                settled => return Ok(settled),
            }
        }
    }
}

impl<C: TransferClient> TransferBackend for DaemonBackend<C> {
    fn attempt(&self, job: &TransferJob) -> Result<(), AttemptFailure> {
        let handle = self.client.submit(job).map_err(AttemptFailure::from_error)?;
        debug!(gid = %handle.0, url = %job.url, "transfer submitted");
        let status = self.wait_on(&handle);
        if let Err(err) = self.client.remove(&handle) {
            warn!(gid = %handle.0, error = %err, "failed to remove transfer record");
        }
        match status.map_err(AttemptFailure::from_error)? {
            JobStatus::Complete => Ok(()),
            JobStatus::Failed { code, message } => Err(AttemptFailure {
                checksum_mismatch: code.as_deref() == Some(ARIA2_CHECKSUM_ERROR),
                message,
            }),
            JobStatus::Pending => Err(AttemptFailure {
                checksum_mismatch: false,
                message: format!("job {} did not settle", handle.0),
            }),
        }
    }
}

/// Runs a one-shot `aria2c` per attempt.
#[derive(Debug, Clone)]
pub struct DirectBackend {
    program: PathBuf,
    budget: ConnectionBudget,
    extra_args: Vec<String>,
}

impl DirectBackend {
    pub fn new(budget: ConnectionBudget, extra_opts: &str) -> Result<Self, KiraError> {
        let program =
            find_in_path("aria2c").ok_or_else(|| KiraError::MissingTool("aria2c".to_string()))?;
        Ok(Self::with_program(program, budget, extra_opts))
    }

    pub fn with_program(program: PathBuf, budget: ConnectionBudget, extra_opts: &str) -> Self {
        Self {
            program,
            budget,
            extra_args: extra_opts.split_whitespace().map(str::to_string).collect(),
        }
    }

    pub fn args(&self, job: &TransferJob) -> Vec<String> {
        let mut args = vec![
            "-d".to_string(),
            job.output_dir.to_string_lossy().to_string(),
            "-o".to_string(),
            job.output_name.clone(),
            "-c".to_string(),
            "--auto-file-renaming=false".to_string(),
            format!("-s{}", self.budget.total()),
            format!("-j{}", self.budget.total()),
            format!("-x{}", self.budget.per_server()),
        ];
        if let Some(checksum) = &job.checksum {
            args.push("--check-integrity=true".to_string());
            args.push(format!("--checksum={checksum}"));
        }
        args.extend(self.extra_args.iter().cloned());
        args.push(job.url.clone());
        args
    }
}

impl TransferBackend for DirectBackend {
    fn attempt(&self, job: &TransferJob) -> Result<(), AttemptFailure> {
        let output = Command::new(&self.program)
            .args(self.args(job))
            .output()
            .map_err(|err| AttemptFailure {
                checksum_mismatch: false,
                message: format!("failed to run {}: {err}", self.program.display()),
            })?;
        if output.status.success() {
            return Ok(());
        }
        let code = output.status.code().map(|code| code.to_string());
        let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
        let message = if stderr.is_empty() {
            format!(
                "{} exited with {}",
                self.program.display(),
                code.as_deref().unwrap_or("signal")
            )
        } else {
            stderr
        };
        Err(AttemptFailure {
            checksum_mismatch: code.as_deref() == Some(ARIA2_CHECKSUM_ERROR),
            message,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum TransferState {
    Pending,
    Succeeded { path: PathBuf },
    Failed { reason: String },
}

/// Tracks a single archive's transfer from first submission to its terminal
/// state.
#[derive(Debug, Clone)]
pub struct TransferRequest {
    job: TransferJob,
    remaining: u32,
    attempts: u32,
    checksum_failures: u32,
    state: TransferState,
}

impl TransferRequest {
    fn new(job: TransferJob, max_attempts: u32) -> Self {
        Self {
            job,
            remaining: max_attempts,
            attempts: 0,
            checksum_failures: 0,
            state: TransferState::Pending,
        }
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub fn checksum_failures(&self) -> u32 {
        self.checksum_failures
    }

    pub fn state(&self) -> &TransferState {
        &self.state
    }

    pub fn local_path(&self) -> Option<&Path> {
        match &self.state {
            TransferState::Succeeded { path } => Some(path),
            _ => None,
        }
    }

    pub fn job(&self) -> &TransferJob {
        &self.job
    }
}

/// Drives a backend with a bounded number of attempts per archive.
pub struct TransferCoordinator {
    backend: Box<dyn TransferBackend>,
    max_attempts: u32,
    verify_checksums: bool,
}

impl TransferCoordinator {
    pub fn new(
        backend: Box<dyn TransferBackend>,
        max_attempts: u32,
        verify_checksums: bool,
    ) -> Self {
        Self {
            backend,
            max_attempts: max_attempts.max(1),
            verify_checksums,
        }
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    pub fn job_for(&self, archive: &ArchiveDescriptor, output_dir: &Path) -> TransferJob {
        TransferJob {
            url: archive.url.clone(),
            output_dir: output_dir.to_path_buf(),
            output_name: archive.file_name.clone(),
            checksum: if self.verify_checksums {
                archive.checksum.clone()
            } else {
                None
            },
        }
    }

    /// Makes at most `max_attempts` submissions of the same job.
    pub fn fetch(&self, archive: &ArchiveDescriptor, output_dir: &Path) -> TransferRequest {
        let job = self.job_for(archive, output_dir);
        let mut request = TransferRequest::new(job, self.max_attempts);
        let mut last_failure = String::new();

        while request.remaining > 0 {
            request.remaining -= 1;
            request.attempts += 1;
            match self.backend.attempt(&request.job) {
                Ok(()) => {
                    let path = request.job.output_path();
                    if path.exists() {
                        info!(
                            archive = %archive.label(),
                            attempts = request.attempts,
                            "downloaded"
                        );
                        request.state = TransferState::Succeeded { path };
                        return request;
                    }
                    last_failure = format!(
                        "transfer reported success but {} is missing",
                        path.display()
                    );
                }
                Err(failure) => {
                    if failure.checksum_mismatch {
                        request.checksum_failures += 1;
                    }
                    last_failure = failure.message;
                }
            }
            warn!(
                archive = %archive.label(),
                attempt = request.attempts,
                remaining = request.remaining,
                reason = %last_failure,
                "transfer attempt failed"
            );
        }

        request.state = TransferState::Failed {
            reason: last_failure,
        };
        request
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct Aria2Settings {
    pub uri: String,
    pub secret: Option<String>,
    pub create_server: bool,
    pub cmdline_opts: String,
}

impl Default for Aria2Settings {
    fn default() -> Self {
        Self {
            uri: "http://localhost:6800".to_string(),
            secret: None,
            create_server: true,
            cmdline_opts: String::new(),
        }
    }
}

/// aria2 JSON-RPC client.
#[derive(Clone)]
pub struct Aria2RpcClient {
    client: Client,
    endpoint: String,
    token: Option<String>,
}

impl Aria2RpcClient {
    pub fn new(uri: &str, secret: Option<&str>) -> Result<Self, KiraError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(|err| KiraError::Aria2Rpc(err.to_string()))?;
        Ok(Self {
            client,
            endpoint: rpc_endpoint(uri),
            token: secret
                .filter(|secret| !secret.is_empty())
                .map(|secret| format!("token:{secret}")),
        })
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    pub fn version(&self) -> Result<String, KiraError> {
        let result = self.call("aria2.getVersion", Vec::new())?;
        Ok(result
            .get("version")
            .and_then(Value::as_str)
            .unwrap_or("unknown")
            .to_string())
    }

    /// Blocks until the daemon answers or `timeout` elapses.
    pub fn wait_ready(&self, timeout: Duration) -> Result<(), KiraError> {
        let start = Instant::now();
        loop {
            match self.version() {
                Ok(version) => {
                    debug!(version = %version, endpoint = %self.endpoint, "aria2 ready");
                    return Ok(());
                }
                Err(err) if start.elapsed() >= timeout => return Err(err),
                Err(_) => thread::sleep(DEFAULT_POLL_INTERVAL),
            }
        }
    }

    fn call(&self, method: &str, params: Vec<Value>) -> Result<Value, KiraError> {
        let mut all_params = Vec::with_capacity(params.len() + 1);
        if let Some(token) = &self.token {
            all_params.push(Value::String(token.clone()));
        }
        all_params.extend(params);
        let body = json!({
            "jsonrpc": "2.0",
            "id": "kira-dd",
            "method": method,
            "params": all_params,
        });

        let response = self
            .client
            .post(&self.endpoint)
            .json(&body)
            .send()
            .map_err(|err| KiraError::Aria2Rpc(err.to_string()))?;
        let payload: RpcResponse = response
            .json()
            .map_err(|err| KiraError::Aria2Rpc(err.to_string()))?;
        if let Some(error) = payload.error {
            return Err(KiraError::Aria2Status {
                code: error.code,
                message: error.message,
            });
        }
        payload
            .result
            .ok_or_else(|| KiraError::Aria2Rpc(format!("{method}: empty result")))
    }
}

#[derive(Debug, Deserialize)]
struct RpcResponse {
    #[serde(default)]
    result: Option<Value>,
    #[serde(default)]
    error: Option<RpcError>,
}

#[derive(Debug, Deserialize)]
struct RpcError {
    code: i64,
    message: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TellStatus {
    status: String,
    #[serde(default)]
    error_code: Option<String>,
    #[serde(default)]
    error_message: Option<String>,
}

impl TransferClient for Aria2RpcClient {
    fn submit(&self, job: &TransferJob) -> Result<JobHandle, KiraError> {
        let mut options = serde_json::Map::new();
        options.insert("out".to_string(), json!(job.output_name));
        options.insert(
            "dir".to_string(),
            json!(job.output_dir.to_string_lossy().to_string()),
        );
        if let Some(checksum) = &job.checksum {
            options.insert("check-integrity".to_string(), json!("true"));
            options.insert("checksum".to_string(), json!(checksum.to_string()));
        }
        let result = self.call(
            "aria2.addUri",
            vec![json!([job.url]), Value::Object(options)],
        )?;
        result
            .as_str()
            .map(|gid| JobHandle(gid.to_string()))
            .ok_or_else(|| KiraError::Aria2Rpc("aria2.addUri did not return a gid".to_string()))
    }

    fn poll(&self, handle: &JobHandle) -> Result<JobStatus, KiraError> {
        let result = self.call(
            "aria2.tellStatus",
            vec![
                json!(handle.0),
                json!(["status", "errorCode", "errorMessage"]),
            ],
        )?;
        let status: TellStatus =
            serde_json::from_value(result).map_err(|err| KiraError::Aria2Rpc(err.to_string()))?;
        Ok(job_status(status))
    }

    fn remove(&self, handle: &JobHandle) -> Result<(), KiraError> {
        self.call("aria2.removeDownloadResult", vec![json!(handle.0)])
            .map(|_| ())
    }
}

fn job_status(status: TellStatus) -> JobStatus {
    match status.status.as_str() {
        "complete" => JobStatus::Complete,
        "error" | "removed" => JobStatus::Failed {
            message: status
                .error_message
                .filter(|message| !message.is_empty())
                .unwrap_or_else(|| format!("aria2 download {}", status.status)),
            code: status.error_code,
        },
        _ => JobStatus::Pending,
    }
}

pub fn rpc_endpoint(uri: &str) -> String {
    let trimmed = uri.trim().trim_end_matches('/');
    if trimmed.ends_with("/jsonrpc") {
        trimmed.to_string()
    } else {
        format!("{trimmed}/jsonrpc")
    }
}

/// Keeps a background `aria2c --enable-rpc` alive for the duration of a run.
/// The daemon is stopped when the guard drops or the process is interrupted.
pub struct DaemonGuard {
    child: Arc<Mutex<Option<Child>>>,
    stop_timeout: Duration,
}

impl DaemonGuard {
    pub fn spawn(
        settings: &Aria2Settings,
        budget: ConnectionBudget,
    ) -> Result<Self, KiraError> {
        let program =
            find_in_path("aria2c").ok_or_else(|| KiraError::MissingTool("aria2c".to_string()))?;
        let args = daemon_args(settings, budget)?;
        info!(program = %program.display(), "starting aria2c download daemon");
        let child = Command::new(&program)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
            .map_err(|err| KiraError::MissingTool(format!("{}: {err}", program.display())))?;
        Ok(Self::from_child(child))
    }

    pub fn from_child(child: Child) -> Self {
        Self {
            child: Arc::new(Mutex::new(Some(child))),
            stop_timeout: DAEMON_STOP_TIMEOUT,
        }
    }

    /// How long the daemon gets to exit after SIGINT before it is killed.
    pub fn with_stop_timeout(mut self, stop_timeout: Duration) -> Self {
        self.stop_timeout = stop_timeout;
        self
    }

    /// Stops the daemon on Ctrl-C before exiting with status 130.
    pub fn stop_on_interrupt(&self) {
        let child = Arc::clone(&self.child);
        let stop_timeout = self.stop_timeout;
        let installed = ctrlc::set_handler(move || {
            stop_child(&child, stop_timeout);
            std::process::exit(130);
        });
        if let Err(err) = installed {
            warn!(error = %err, "could not install interrupt handler");
        }
    }

    pub fn stop(&self) {
        stop_child(&self.child, self.stop_timeout);
    }
}

impl Drop for DaemonGuard {
    fn drop(&mut self) {
        self.stop();
    }
}

/// SIGINT first so aria2 can write its control files, SIGKILL once
/// `stop_timeout` runs out.
fn stop_child(child: &Mutex<Option<Child>>, stop_timeout: Duration) {
    let mut guard = match child.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    };
    let Some(mut child) = guard.take() else {
        return;
    };
    debug!(pid = child.id(), "stopping aria2c daemon");
    if interrupt(&child) {
        let start = Instant::now();
        loop {
            match child.try_wait() {
                Ok(Some(status)) => {
                    debug!(pid = child.id(), status = %status, "aria2c daemon exited");
                    return;
                }
                Ok(None) if start.elapsed() < stop_timeout => {
                    thread::sleep(STOP_POLL_INTERVAL);
                }
                Ok(None) => {
                    warn!(
                        pid = child.id(),
                        timeout_ms = stop_timeout.as_millis() as u64,
                        "aria2c daemon ignored SIGINT, killing it"
                    );
                    break;
                }
                Err(err) => {
                    warn!(pid = child.id(), error = %err, "could not wait on aria2c daemon");
                    break;
                }
            }
        }
    }
    let _ = child.kill();
    let _ = child.wait();
}

#[cfg(unix)]
fn interrupt(child: &Child) -> bool {
    use nix::sys::signal::{self, Signal};
    use nix::unistd::Pid;

    match signal::kill(Pid::from_raw(child.id() as i32), Signal::SIGINT) {
        Ok(()) => true,
        Err(err) => {
            warn!(pid = child.id(), error = %err, "could not send SIGINT to aria2c daemon");
            false
        }
    }
}

#[cfg(not(unix))]
fn interrupt(_child: &Child) -> bool {
    false
}

#[derive(Debug, Clone)]
pub enum TransferMode {
    Daemon(Aria2Settings),
    Direct { cmdline_opts: String },
}

impl TransferMode {
    /// An empty uri or `none` selects one-shot `aria2c` runs.
    pub fn from_settings(settings: Aria2Settings) -> Self {
        let uri = settings.uri.trim();
        if uri.is_empty() || uri.eq_ignore_ascii_case("none") {
            TransferMode::Direct {
                cmdline_opts: settings.cmdline_opts,
            }
        } else {
            TransferMode::Daemon(settings)
        }
    }
}

/// Backend for a run plus the daemon it may have started. The daemon lives as
/// long as the session's guard.
pub struct TransferSession {
    backend: Box<dyn TransferBackend>,
    daemon: Option<DaemonGuard>,
}

impl TransferSession {
    pub fn open(
        mode: &TransferMode,
        budget: ConnectionBudget,
        ready_timeout: Duration,
    ) -> Result<Self, KiraError> {
        match mode {
            TransferMode::Direct { cmdline_opts } => Ok(Self {
                backend: Box::new(DirectBackend::new(budget, cmdline_opts)?),
                daemon: None,
            }),
            TransferMode::Daemon(settings) => {
                let daemon = if settings.create_server {
                    let guard = DaemonGuard::spawn(settings, budget)?;
                    guard.stop_on_interrupt();
                    info!(
                        "aria2c daemon running in background; run 'aria2p' in another window to view status"
                    );
                    Some(guard)
                } else {
                    None
                };
                let client = Aria2RpcClient::new(&settings.uri, settings.secret.as_deref())?;
                client.wait_ready(ready_timeout)?;
                Ok(Self {
                    backend: Box::new(DaemonBackend::new(client)),
                    daemon,
                })
            }
        }
    }

    pub fn into_parts(self) -> (Box<dyn TransferBackend>, Option<DaemonGuard>) {
        (self.backend, self.daemon)
    }
}

pub fn daemon_args(
    settings: &Aria2Settings,
    budget: ConnectionBudget,
) -> Result<Vec<String>, KiraError> {
    let url = Url::parse(&settings.uri)
        .map_err(|err| KiraError::Aria2Rpc(format!("invalid aria2 uri {}: {err}", settings.uri)))?;
    let port = url.port_or_known_default().unwrap_or(6800);
    let mut args = vec![
        "--enable-rpc".to_string(),
        "--rpc-listen-all".to_string(),
        format!("--rpc-listen-port={port}"),
        "-c".to_string(),
        "--auto-file-renaming=false".to_string(),
        "--optimize-concurrent-downloads".to_string(),
        format!("-s{}", budget.total()),
        format!("-j{}", budget.total()),
        format!("-x{}", budget.per_server()),
    ];
    if let Some(secret) = settings.secret.as_deref().filter(|secret| !secret.is_empty()) {
        args.push(format!("--rpc-secret={secret}"));
    }
    args.extend(settings.cmdline_opts.split_whitespace().map(str::to_string));
    Ok(args)
}

fn find_in_path(name: &str) -> Option<PathBuf> {
    let path_var = std::env::var_os("PATH")?;
    for path in std::env::split_paths(&path_var) {
        let exe = path.join(format!("{name}.exe"));
        if exe.exists() {
            return Some(exe);
        }
        let plain = path.join(name);
        if plain.exists() {
            return Some(plain);
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::fs;
    use std::sync::atomic::{AtomicU32, Ordering};

    use assert_matches::assert_matches;

    use super::*;

    fn job(dir: &Path, checksum: Option<&str>) -> TransferJob {
        TransferJob {
            url: "https://h/taskonomy/allensville-rgb.tar".to_string(),
            output_dir: dir.to_path_buf(),
            output_name: "allensville-rgb.tar".to_string(),
            checksum: checksum.map(|value| value.parse().unwrap()),
        }
    }

    #[test]
    fn budget_defaults_and_clamps() {
        let budget = ConnectionBudget::new(8, None);
        assert_eq!((budget.total(), budget.per_server()), (8, 8));
        let budget = ConnectionBudget::new(40, None);
        assert_eq!((budget.total(), budget.per_server()), (40, 16));
        let budget = ConnectionBudget::new(40, Some(4));
        assert_eq!(budget.per_server(), 4);
        assert_eq!(ConnectionBudget::new(0, Some(0)).total(), 1);
    }

    #[test]
    fn direct_args_include_checksum() {
        let temp = tempfile::tempdir().unwrap();
        let backend = DirectBackend::with_program(
            PathBuf::from("aria2c"),
            ConnectionBudget::new(20, Some(10)),
            "--quiet=true",
        );
        let args = backend.args(&job(
            temp.path(),
            Some("md5=9f9752d74b07bcc164af4a6c61b0eca1"),
        ));
        assert!(args.contains(&"-s20".to_string()));
        assert!(args.contains(&"-x10".to_string()));
        assert!(args.contains(&"--check-integrity=true".to_string()));
        assert!(args.contains(
            &"--checksum=md5=9f9752d74b07bcc164af4a6c61b0eca1".to_string()
        ));
        assert!(args.contains(&"--quiet=true".to_string()));
        assert_eq!(args.last().unwrap(), "https://h/taskonomy/allensville-rgb.tar");

        let args = backend.args(&job(temp.path(), None));
        assert!(!args.iter().any(|arg| arg.starts_with("--checksum")));
    }

    #[test]
    fn daemon_args_use_uri_port() {
        let settings = Aria2Settings {
            uri: "http://localhost:6900".to_string(),
            secret: Some("s3cret".to_string()),
            create_server: true,
            cmdline_opts: "--max-tries=2".to_string(),
        };
        let args = daemon_args(&settings, ConnectionBudget::new(30, None)).unwrap();
        assert!(args.contains(&"--rpc-listen-port=6900".to_string()));
        assert!(args.contains(&"-x16".to_string()));
        assert!(args.contains(&"--rpc-secret=s3cret".to_string()));
        assert!(args.contains(&"--max-tries=2".to_string()));
    }

    #[test]
    fn rpc_endpoint_normalization() {
        assert_eq!(
            rpc_endpoint("http://localhost:6800"),
            "http://localhost:6800/jsonrpc"
        );
        assert_eq!(
            rpc_endpoint("http://localhost:6800/jsonrpc/"),
            "http://localhost:6800/jsonrpc"
        );
    }

    #[test]
    fn mode_from_uri() {
        assert_matches!(
            TransferMode::from_settings(Aria2Settings::default()),
            TransferMode::Daemon(_)
        );
        let direct = Aria2Settings {
            uri: "None".to_string(),
            cmdline_opts: "--lowest-speed-limit=1K".to_string(),
            ..Aria2Settings::default()
        };
        assert_matches!(
            TransferMode::from_settings(direct),
            TransferMode::Direct { cmdline_opts } if cmdline_opts == "--lowest-speed-limit=1K"
        );
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn guard_stops_child() {
        let child = Command::new("sleep").arg("30").spawn().unwrap();
        let pid = child.id();
        let guard = DaemonGuard::from_child(child);
        guard.stop();
        guard.stop();
        assert!(!Path::new(&format!("/proc/{pid}")).exists());
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn guard_interrupts_before_killing() {
        let temp = tempfile::tempdir().unwrap();
        let marker = temp.path().join("interrupted");
        let script = format!(
            "trap 'touch {}; exit 0' INT; while :; do sleep 0.05; done",
            marker.display()
        );
        let child = Command::new("sh").arg("-c").arg(&script).spawn().unwrap();
        // give the shell time to install its trap
        thread::sleep(Duration::from_millis(300));
        let guard = DaemonGuard::from_child(child);
        let started = Instant::now();
        guard.stop();
        assert!(started.elapsed() < DAEMON_STOP_TIMEOUT);
        assert!(marker.exists());

        // a daemon that ignores SIGINT is killed once the timeout runs out
        let stubborn = Command::new("sh")
            .arg("-c")
            .arg("trap '' INT; while :; do sleep 0.05; done")
            .spawn()
            .unwrap();
        let pid = stubborn.id();
        thread::sleep(Duration::from_millis(300));
        let shared = Arc::new(Mutex::new(Some(stubborn)));
        let started = Instant::now();
        stop_child(&shared, Duration::from_millis(200));
        assert!(started.elapsed() >= Duration::from_millis(200));
        assert!(shared.lock().unwrap().is_none());
        assert!(!Path::new(&format!("/proc/{pid}")).exists());
    }

    #[test]
    fn tell_status_mapping() {
        let status = |value: Value| job_status(serde_json::from_value(value).unwrap());
        assert_eq!(status(json!({"status": "active"})), JobStatus::Pending);
        assert_eq!(status(json!({"status": "waiting"})), JobStatus::Pending);
        assert_eq!(status(json!({"status": "complete"})), JobStatus::Complete);
        assert_eq!(
            status(json!({"status": "error", "errorCode": "32", "errorMessage": "checksum"})),
            JobStatus::Failed {
                code: Some("32".to_string()),
                message: "checksum".to_string()
            }
        );
    }

    /// Daemon stand-in: jobs complete after two polls and either write the
    /// output file or fail with a checksum error.
    struct FakeDaemon {
        fail_checksum: bool,
        submits: AtomicU32,
        removes: AtomicU32,
        polls: Mutex<HashMap<String, u32>>,
        jobs: Mutex<HashMap<String, TransferJob>>,
    }

    impl FakeDaemon {
        fn new(fail_checksum: bool) -> Self {
            Self {
                fail_checksum,
                submits: AtomicU32::new(0),
                removes: AtomicU32::new(0),
                polls: Mutex::new(HashMap::new()),
                jobs: Mutex::new(HashMap::new()),
            }
        }
    }

    impl TransferClient for FakeDaemon {
        fn submit(&self, job: &TransferJob) -> Result<JobHandle, KiraError> {
            let n = self.submits.fetch_add(1, Ordering::SeqCst);
            let gid = format!("gid{n}");
            self.jobs.lock().unwrap().insert(gid.clone(), job.clone());
            Ok(JobHandle(gid))
        }

        fn poll(&self, handle: &JobHandle) -> Result<JobStatus, KiraError> {
            let mut polls = self.polls.lock().unwrap();
            let count = polls.entry(handle.0.clone()).or_insert(0);
            *count += 1;
            if *count < 2 {
                return Ok(JobStatus::Pending);
            }
            if self.fail_checksum {
                return Ok(JobStatus::Failed {
                    code: Some(ARIA2_CHECKSUM_ERROR.to_string()),
                    message: "Checksum validation failed".to_string(),
                });
            }
            let job = self.jobs.lock().unwrap()[&handle.0].clone();
            fs::write(job.output_path(), b"payload").unwrap();
            Ok(JobStatus::Complete)
        }

        fn remove(&self, _handle: &JobHandle) -> Result<(), KiraError> {
            self.removes.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn archive() -> ArchiveDescriptor {
        ArchiveDescriptor::new(
            "rgb",
            "taskonomy",
            "allensville",
            "https://h/taskonomy/allensville-rgb.tar",
        )
        .unwrap()
        .with_checksum(Some("md5=9f9752d74b07bcc164af4a6c61b0eca1".parse().unwrap()))
    }

    #[test]
    fn daemon_success_removes_job() {
        let temp = tempfile::tempdir().unwrap();
        let backend = DaemonBackend::new(FakeDaemon::new(false))
            .with_poll_interval(Duration::from_millis(1));
        let job = job(temp.path(), None);
        backend.attempt(&job).unwrap();
        assert_eq!(backend.client().removes.load(Ordering::SeqCst), 1);
        assert!(job.output_path().exists());
    }

    #[test]
    fn checksum_failure_uses_every_attempt() {
        let temp = tempfile::tempdir().unwrap();
        for max_attempts in 1..=4u32 {
            let daemon = Arc::new(FakeDaemon::new(true));
            let backend = DaemonBackend::new(SharedDaemon(Arc::clone(&daemon)))
                .with_poll_interval(Duration::from_millis(1));
            let coordinator = TransferCoordinator::new(Box::new(backend), max_attempts, true);
            let request = coordinator.fetch(&archive(), temp.path());
            assert_matches!(request.state(), TransferState::Failed { .. });
            assert_eq!(request.attempts(), max_attempts);
            assert_eq!(request.checksum_failures(), max_attempts);
            assert_eq!(daemon.submits.load(Ordering::SeqCst), max_attempts);
            assert_eq!(daemon.removes.load(Ordering::SeqCst), max_attempts);
        }
    }

    struct Liar;

    impl TransferBackend for Liar {
        fn attempt(&self, _job: &TransferJob) -> Result<(), AttemptFailure> {
            Ok(())
        }
    }

    #[test]
    fn checksum_is_forwarded_only_when_verifying() {
        let temp = tempfile::tempdir().unwrap();
        let verifying = TransferCoordinator::new(Box::new(Liar), 1, true);
        assert!(verifying.job_for(&archive(), temp.path()).checksum.is_some());
        let ignoring = TransferCoordinator::new(Box::new(Liar), 1, false);
        assert!(ignoring.job_for(&archive(), temp.path()).checksum.is_none());
    }

    struct SharedDaemon(Arc<FakeDaemon>);

    impl TransferClient for SharedDaemon {
        fn submit(&self, job: &TransferJob) -> Result<JobHandle, KiraError> {
            self.0.submit(job)
        }

        fn poll(&self, handle: &JobHandle) -> Result<JobStatus, KiraError> {
            self.0.poll(handle)
        }

        fn remove(&self, handle: &JobHandle) -> Result<(), KiraError> {
            self.0.remove(handle)
        }
    }

    #[test]
    fn success_after_transient_failure() {
        struct Flaky(AtomicU32);

        impl TransferBackend for Flaky {
            fn attempt(&self, job: &TransferJob) -> Result<(), AttemptFailure> {
                if self.0.fetch_add(1, Ordering::SeqCst) == 0 {
                    return Err(AttemptFailure {
                        checksum_mismatch: true,
                        message: "mismatch".to_string(),
                    });
                }
                fs::write(job.output_path(), b"ok").unwrap();
                Ok(())
            }
        }

        let temp = tempfile::tempdir().unwrap();
        let coordinator = TransferCoordinator::new(Box::new(Flaky(AtomicU32::new(0))), 3, true);
        let request = coordinator.fetch(&archive(), temp.path());
        assert_eq!(request.attempts(), 2);
        assert_eq!(
            request.local_path(),
            Some(temp.path().join("allensville-rgb.tar").as_path())
        );
    }

    #[test]
    fn reported_success_without_file_is_a_failure() {
        let temp = tempfile::tempdir().unwrap();
        let coordinator = TransferCoordinator::new(Box::new(Liar), 2, true);
        let request = coordinator.fetch(&archive(), temp.path());
        assert_eq!(request.attempts(), 2);
        assert_matches!(
            request.state(),
            TransferState::Failed { reason } if reason.contains("missing")
        );
    }
}
