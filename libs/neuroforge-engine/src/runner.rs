//! Isolated Runner - Docker sandbox lifecycle.
//!
//! **Responsibility:** provision a hardened container for one submission,
//! run the compile step and test executions inside it, capture bounded
//! output, and guarantee teardown no matter how execution ended.
//!
//! **Isolation boundary per container:**
//! - network disabled
//! - read-only root filesystem; tmpfs `/code` and `/tmp` are the only
//!   writable paths
//! - submitted code execs as a non-root identity (65534:65534), all
//!   capabilities dropped, no-new-privileges; only the inert keepalive
//!   process runs as root, so the sandbox user can be mass-killed without
//!   taking the container down
//! - memory, swap, CPU share and pid caps from the enforcement plan
//!
//! The runner classifies nothing beyond raw facts (exit code, kill flags,
//! truncation); mapping into the outcome taxonomy is `normalize`'s job.

use crate::catalog::LanguageSpec;
use crate::config::OutputOverflowPolicy;
use crate::limits::EnforcementPlan;
use crate::workspace::WorkspaceLease;
use bollard::container::{
    Config, CreateContainerOptions, RemoveContainerOptions, StartContainerOptions,
    StopContainerOptions,
};
use bollard::exec::{CreateExecOptions, StartExecOptions, StartExecResults};
use bollard::image::CreateImageOptions;
use bollard::models::HostConfig;
use bollard::Docker;
use futures_util::stream::StreamExt;
use neuroforge_common::EngineError;
use std::collections::HashMap;
use std::time::{Duration, Instant};
use tokio::io::AsyncWriteExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Identity submitted code execs as. The keepalive process is not this user.
const SANDBOX_USER: &str = "65534:65534";

/// Raw facts about one process execution, before normalization.
#[derive(Debug, Clone, Default)]
pub struct RawExecutionResult {
    pub stdout: String,
    pub stderr: String,
    pub stdout_truncated: bool,
    pub stderr_truncated: bool,
    pub exit_code: Option<i64>,
    pub duration_ms: u64,
    pub timed_out: bool,
    pub oom_killed: bool,
    pub cancelled: bool,
    /// Set when the Kill overflow policy terminated the run at the output cap.
    pub output_killed: bool,
    /// Structural capture failure (log stream broke mid-run).
    pub capture_failed: Option<String>,
}

/// Output buffer capped at `max_output_bytes`. Past the cap, bytes are
/// counted as discarded and the truncation flag sticks.
#[derive(Debug)]
struct BoundedBuf {
    buf: String,
    cap: usize,
    truncated: bool,
}

impl BoundedBuf {
    fn new(cap: usize) -> Self {
        Self {
            buf: String::new(),
            cap,
            truncated: false,
        }
    }

    /// Returns false once the cap has been reached.
    fn push(&mut self, chunk: &[u8]) -> bool {
        if self.buf.len() >= self.cap {
            self.truncated = true;
            return false;
        }
        let text = String::from_utf8_lossy(chunk);
        let room = self.cap - self.buf.len();
        if text.len() <= room {
            self.buf.push_str(&text);
        } else {
            let mut cut = room;
            while !text.is_char_boundary(cut) {
                cut -= 1;
            }
            self.buf.push_str(&text[..cut]);
            self.truncated = true;
        }
        !self.truncated
    }

    fn into_parts(self) -> (String, bool) {
        (self.buf, self.truncated)
    }
}

/// Container cleanup guard. Force-removes the container on drop so cleanup
/// survives panics and caller cancellation; the coordinator's explicit
/// teardown disarms it on the normal path.
struct ContainerGuard {
    docker: Docker,
    container_id: String,
    armed: bool,
}

impl ContainerGuard {
    fn new(docker: Docker, container_id: String) -> Self {
        Self {
            docker,
            container_id,
            armed: true,
        }
    }
}

impl Drop for ContainerGuard {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        // Drop cannot await; best-effort background removal.
        let docker = self.docker.clone();
        let container_id = self.container_id.clone();
        tokio::spawn(async move {
            let options = RemoveContainerOptions {
                force: true,
                ..Default::default()
            };
            if let Err(e) = docker.remove_container(&container_id, Some(options)).await {
                warn!(container_id = %container_id, error = %e, "background container cleanup failed");
            }
        });
    }
}

/// One in-flight sandbox: container identity, workspace lease, start instant.
/// Exclusively owned by the coordinator call that provisioned it and
/// destroyed when that call returns.
pub struct ExecutionHandle {
    container_id: String,
    started: Instant,
    guard: ContainerGuard,
    _workspace: WorkspaceLease,
}

impl ExecutionHandle {
    pub fn container_id(&self) -> &str {
        &self.container_id
    }

    pub fn age(&self) -> Duration {
        self.started.elapsed()
    }
}

pub struct DockerRunner {
    docker: Docker,
}

impl DockerRunner {
    pub fn connect() -> Result<Self, EngineError> {
        let docker = Docker::connect_with_local_defaults()
            .map_err(|e| EngineError::Docker(format!("failed to connect to Docker daemon: {}", e)))?;
        Ok(Self { docker })
    }

    /// Verify the image exists locally, pulling it if missing.
    async fn ensure_image(&self, image: &str) -> Result<(), EngineError> {
        if self.docker.inspect_image(image).await.is_ok() {
            debug!(image = %image, "image cache hit");
            return Ok(());
        }

        warn!(image = %image, "image cache miss, pulling");
        let options = Some(CreateImageOptions {
            from_image: image,
            ..Default::default()
        });
        let mut stream = self.docker.create_image(options, None, None);
        while let Some(result) = stream.next().await {
            result.map_err(|e| EngineError::Launch(format!("failed to pull image {}: {}", image, e)))?;
        }
        info!(image = %image, "image pulled");
        Ok(())
    }

    /// Provision the isolation boundary for one submission: hardened
    /// container kept alive for the duration of the attempt, source injected
    /// into its private /code tmpfs.
    pub async fn provision(
        &self,
        code: &str,
        spec: &LanguageSpec,
        plan: &EnforcementPlan,
        attempt_budget: Duration,
        workspace: WorkspaceLease,
    ) -> Result<ExecutionHandle, EngineError> {
        self.ensure_image(&spec.image).await?;

        // Host-side copy for operator inspection; the container works from
        // its own tmpfs so concurrent runs share nothing.
        workspace
            .write_source(&spec.source_file, code)
            .map_err(EngineError::Workspace)?;

        let container_name = format!("neuroforge-{}", Uuid::new_v4());
        let keepalive_secs = attempt_budget.as_secs() + 60;

        let mut tmpfs = HashMap::new();
        tmpfs.insert("/code".to_string(), "rw,exec,size=256m,mode=1777".to_string());
        tmpfs.insert("/tmp".to_string(), "rw,size=256m".to_string());

        // The keepalive runs as the image's root user on purpose: submitted
        // code execs as SANDBOX_USER and can be mass-killed without touching
        // the container's pid 1.
        let config = Config {
            image: Some(spec.image.clone()),
            cmd: Some(vec![
                "/bin/sh".to_string(),
                "-c".to_string(),
                format!("sleep {}", keepalive_secs),
            ]),
            entrypoint: Some(vec![]),
            working_dir: Some("/code".to_string()),
            attach_stdout: Some(true),
            attach_stderr: Some(true),
            network_disabled: Some(true),
            host_config: Some(HostConfig {
                memory: Some(plan.memory_bytes),
                memory_swap: Some(plan.memory_swap_bytes),
                nano_cpus: Some(plan.nano_cpus),
                pids_limit: Some(plan.pids_limit),
                readonly_rootfs: Some(true),
                cap_drop: Some(vec!["ALL".to_string()]),
                security_opt: Some(vec!["no-new-privileges".to_string()]),
                tmpfs: Some(tmpfs),
                ..Default::default()
            }),
            ..Default::default()
        };

        let create_options = CreateContainerOptions {
            name: container_name.as_str(),
            platform: None,
        };

        let container = self
            .docker
            .create_container(Some(create_options), config)
            .await
            .map_err(|e| EngineError::Launch(format!("failed to create container: {}", e)))?;

        let container_id = container.id;
        // Guard is armed before the first await that could fail, so a
        // half-provisioned container still gets removed.
        let guard = ContainerGuard::new(self.docker.clone(), container_id.clone());

        self.docker
            .start_container(&container_id, None::<StartContainerOptions<String>>)
            .await
            .map_err(|e| EngineError::Launch(format!("failed to start container: {}", e)))?;

        // Source travels over the exec's attached stdin; inlining it into a
        // shell argument would hit the kernel's per-argument size limit well
        // below the configured source ceiling.
        self.exec_checked(
            &container_id,
            vec![
                "/bin/sh".to_string(),
                "-c".to_string(),
                format!("cat > /code/{}", spec.source_file),
            ],
            Some(code.to_string()),
        )
        .await
        .map_err(|e| EngineError::Launch(format!("failed to inject source: {}", e)))?;

        debug!(container_id = %container_id, image = %spec.image, "sandbox provisioned");

        Ok(ExecutionHandle {
            container_id,
            started: Instant::now(),
            guard,
            _workspace: workspace,
        })
    }

    /// Run the compile step for compiled languages. Exit status and compiler
    /// output come back raw; a non-zero exit is the submitter's problem, not
    /// a platform error.
    pub async fn compile(
        &self,
        handle: &ExecutionHandle,
        spec: &LanguageSpec,
        plan: &EnforcementPlan,
        cancel: &CancellationToken,
    ) -> Result<RawExecutionResult, EngineError> {
        let command = match &spec.compile_command {
            Some(command) => command.clone(),
            None => {
                return Ok(RawExecutionResult {
                    exit_code: Some(0),
                    ..Default::default()
                })
            }
        };
        self.run_exec(handle, command, None, plan.wall_time, plan, cancel)
            .await
    }

    /// Execute one case against the provisioned sandbox, feeding `input` over
    /// the exec's attached stdin and waiting at most `budget`. A run that
    /// outlives the budget or the output cap is killed before this returns,
    /// so later cases start from a quiet container.
    pub async fn exec_case(
        &self,
        handle: &ExecutionHandle,
        spec: &LanguageSpec,
        input: &str,
        budget: Duration,
        plan: &EnforcementPlan,
        cancel: &CancellationToken,
    ) -> Result<RawExecutionResult, EngineError> {
        self.run_exec(
            handle,
            spec.run_command.clone(),
            Some(input.to_string()),
            budget,
            plan,
            cancel,
        )
        .await
    }

    async fn run_exec(
        &self,
        handle: &ExecutionHandle,
        command: Vec<String>,
        stdin: Option<String>,
        budget: Duration,
        plan: &EnforcementPlan,
        cancel: &CancellationToken,
    ) -> Result<RawExecutionResult, EngineError> {
        let exec_config = CreateExecOptions {
            cmd: Some(command),
            user: Some(SANDBOX_USER.to_string()),
            attach_stdin: Some(stdin.is_some()),
            attach_stdout: Some(true),
            attach_stderr: Some(true),
            working_dir: Some("/code".to_string()),
            ..Default::default()
        };

        let exec = self
            .docker
            .create_exec(&handle.container_id, exec_config)
            .await
            .map_err(|e| EngineError::Docker(format!("failed to create exec: {}", e)))?;

        let start_config = StartExecOptions {
            detach: false,
            ..Default::default()
        };

        let started = Instant::now();
        let attached = self
            .docker
            .start_exec(&exec.id, Some(start_config))
            .await
            .map_err(|e| EngineError::Docker(format!("failed to start exec: {}", e)))?;

        let mut stdout = BoundedBuf::new(plan.max_output_bytes);
        let mut stderr = BoundedBuf::new(plan.max_output_bytes);
        let mut result = RawExecutionResult::default();

        if let StartExecResults::Attached { mut output, input } = attached {
            if let Some(data) = stdin {
                // Writer runs concurrently with the read loop; a process
                // that never reads stdin must not wedge output capture.
                let mut sink = input;
                tokio::spawn(async move {
                    if let Err(e) = sink.write_all(data.as_bytes()).await {
                        debug!(error = %e, "stdin writer finished early");
                    }
                    let _ = sink.shutdown().await;
                });
            }

            let deadline = tokio::time::sleep(budget);
            tokio::pin!(deadline);

            loop {
                tokio::select! {
                    _ = &mut deadline => {
                        result.timed_out = true;
                        break;
                    }
                    _ = cancel.cancelled() => {
                        result.cancelled = true;
                        break;
                    }
                    msg = output.next() => match msg {
                        Some(Ok(bollard::container::LogOutput::StdOut { message })) => {
                            let accepting = stdout.push(&message);
                            if !accepting && plan.overflow == OutputOverflowPolicy::Kill {
                                result.output_killed = true;
                                break;
                            }
                        }
                        Some(Ok(bollard::container::LogOutput::StdErr { message })) => {
                            let accepting = stderr.push(&message);
                            if !accepting && plan.overflow == OutputOverflowPolicy::Kill {
                                result.output_killed = true;
                                break;
                            }
                        }
                        Some(Ok(_)) => {}
                        Some(Err(e)) => {
                            result.capture_failed = Some(format!("log stream error: {}", e));
                            break;
                        }
                        None => break,
                    }
                }
            }
        } else {
            result.capture_failed = Some("failed to attach to exec output".to_string());
        }

        let (out, out_truncated) = stdout.into_parts();
        let (err, err_truncated) = stderr.into_parts();
        result.stdout = out;
        result.stderr = err;
        result.stdout_truncated = out_truncated;
        result.stderr_truncated = err_truncated;
        result.duration_ms = started.elapsed().as_millis() as u64;

        // The process behind a timed-out or overflow-killed exec is still
        // alive; kill it so it cannot starve whatever runs next in this
        // container.
        if result.timed_out || result.output_killed {
            self.kill_sandbox_processes(&handle.container_id).await;
        }

        if !result.timed_out && !result.cancelled && !result.output_killed {
            match self.docker.inspect_exec(&exec.id).await {
                Ok(inspect) => result.exit_code = inspect.exit_code,
                Err(e) => {
                    result.capture_failed =
                        Some(format!("failed to inspect exec exit status: {}", e));
                }
            }
        }

        // An exec killed by the memory cgroup surfaces as SIGKILL (137);
        // the container inspect distinguishes OOM from other kills.
        if result.exit_code == Some(137) || result.timed_out {
            result.oom_killed = self.container_oom(&handle.container_id).await;
        }

        if result.timed_out {
            debug!(
                container_id = %handle.container_id,
                duration_ms = result.duration_ms,
                "execution hit wall-clock budget"
            );
        }

        Ok(result)
    }

    /// Tear down the sandbox with escalation: graceful stop bounded by the
    /// kill grace, then forced removal. Always called before the coordinator
    /// returns; the drop guard only backstops abnormal exits.
    pub async fn teardown(&self, mut handle: ExecutionHandle, grace: Duration) {
        let container_id = handle.container_id.clone();

        let stop_options = StopContainerOptions {
            t: grace.as_secs().max(1) as i64,
        };
        if let Err(e) = self.docker.stop_container(&container_id, Some(stop_options)).await {
            // Already-exited containers fail stop; the forced remove below
            // covers every state.
            debug!(container_id = %container_id, error = %e, "graceful stop failed");
        }

        let remove_options = RemoveContainerOptions {
            force: true,
            ..Default::default()
        };
        match self.docker.remove_container(&container_id, Some(remove_options)).await {
            Ok(_) => {
                handle.guard.armed = false;
                debug!(container_id = %container_id, "sandbox removed");
            }
            Err(e) => {
                // Leave the guard armed as a second attempt.
                warn!(container_id = %container_id, error = %e, "sandbox removal failed");
            }
        }
        // Workspace lease drops with the handle here.
    }

    async fn container_oom(&self, container_id: &str) -> bool {
        match self.docker.inspect_container(container_id, None).await {
            Ok(inspect) => inspect
                .state
                .and_then(|state| state.oom_killed)
                .unwrap_or(false),
            Err(e) => {
                debug!(container_id = %container_id, error = %e, "container inspect failed");
                false
            }
        }
    }

    /// Kill every process owned by the sandbox user. The keepalive process
    /// is root-owned, so the container survives and later executions start
    /// clean. Best effort: the container is force-removed at teardown anyway.
    async fn kill_sandbox_processes(&self, container_id: &str) {
        let exec_config = CreateExecOptions {
            cmd: Some(vec![
                "/bin/sh".to_string(),
                "-c".to_string(),
                "kill -9 -1".to_string(),
            ]),
            user: Some(SANDBOX_USER.to_string()),
            attach_stdout: Some(true),
            attach_stderr: Some(true),
            ..Default::default()
        };
        let exec = match self.docker.create_exec(container_id, exec_config).await {
            Ok(exec) => exec,
            Err(e) => {
                warn!(container_id = %container_id, error = %e, "failed to create kill exec");
                return;
            }
        };
        // The killer shell is itself a sandbox-user process and dies with
        // its targets; its exit status carries no information.
        match self
            .docker
            .start_exec(&exec.id, Some(StartExecOptions::default()))
            .await
        {
            Ok(StartExecResults::Attached { mut output, .. }) => {
                while output.next().await.is_some() {}
                debug!(container_id = %container_id, "sandbox processes killed");
            }
            Ok(_) => {}
            Err(e) => {
                warn!(container_id = %container_id, error = %e, "failed to start kill exec");
            }
        }
    }

    /// Run a short housekeeping exec as the sandbox user, optionally feeding
    /// stdin, discarding output, failing on non-zero exit.
    async fn exec_checked(
        &self,
        container_id: &str,
        cmd: Vec<String>,
        stdin: Option<String>,
    ) -> anyhow::Result<()> {
        let exec_config = CreateExecOptions {
            cmd: Some(cmd),
            user: Some(SANDBOX_USER.to_string()),
            attach_stdin: Some(stdin.is_some()),
            attach_stdout: Some(true),
            attach_stderr: Some(true),
            ..Default::default()
        };
        let exec = self.docker.create_exec(container_id, exec_config).await?;
        let attached = self
            .docker
            .start_exec(&exec.id, Some(StartExecOptions::default()))
            .await?;

        if let StartExecResults::Attached { mut output, input } = attached {
            if let Some(data) = stdin {
                let mut sink = input;
                sink.write_all(data.as_bytes()).await?;
                sink.shutdown().await?;
            }
            while output.next().await.is_some() {}
        }

        let inspect = self.docker.inspect_exec(&exec.id).await?;
        if inspect.exit_code != Some(0) {
            anyhow::bail!("housekeeping exec exited with {:?}", inspect.exit_code);
        }
        Ok(())
    }
}
