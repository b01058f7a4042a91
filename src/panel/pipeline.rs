//! Deploy pipeline — replaces the workspace contents and restarts the
//! supervised process.
//!
//! A deploy is an ordered list of [`DeployStage`]s run by a single
//! coordinator task; the first stage to return `Err` aborts the rest and is
//! reported as one `error` log entry. There is no rollback: a failed deploy
//! leaves the workspace as the last successful stage left it.
//!
//! Only one deploy may be in flight. A second request while one is running is
//! rejected with [`DeployError::AlreadyInProgress`].

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tokio::task::JoinHandle;

use super::fetch::{DefaultFetcher, SourceFetcher};
use super::logbuf::LogBroadcast;
use super::models::{DeployRequest, DeploySource, DeployStage};
use super::supervisor::{OutputStream, ProcessSupervisor, pump_lines, shell_command};
use crate::errors::DeployError;

pub const DEFAULT_RUN_COMMAND: &str = "node index.js";
pub const DEFAULT_INSTALL_COMMAND: &str = "npm install";
pub const DEFAULT_INSTALL_TIMEOUT: Duration = Duration::from_secs(600);

/// Commands used when a request leaves them unspecified.
#[derive(Debug, Clone)]
pub struct DeployDefaults {
    pub run_command: String,
    pub install_command: String,
    pub install_timeout: Duration,
}

impl Default for DeployDefaults {
    fn default() -> Self {
        Self {
            run_command: DEFAULT_RUN_COMMAND.to_string(),
            install_command: DEFAULT_INSTALL_COMMAND.to_string(),
            install_timeout: DEFAULT_INSTALL_TIMEOUT,
        }
    }
}

/// Outcome of a completed deploy: the pid of the started process.
pub type DeployOutcome = Result<u32, DeployError>;

type StageResult = Result<(), String>;

/// Mutable state threaded through the stages of one deploy.
struct DeployRun {
    request: DeployRequest,
    command: String,
    pid: Option<u32>,
}

/// Clears the in-flight flag when a deploy finishes, panics included.
struct InFlightGuard(Arc<AtomicBool>);

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

pub struct DeployPipeline {
    workspace: PathBuf,
    staging_dir: PathBuf,
    supervisor: Arc<ProcessSupervisor>,
    logs: Arc<LogBroadcast>,
    fetcher: Arc<dyn SourceFetcher>,
    defaults: DeployDefaults,
    in_flight: Arc<AtomicBool>,
}

impl DeployPipeline {
    pub fn new(
        workspace: impl Into<PathBuf>,
        staging_dir: impl Into<PathBuf>,
        supervisor: Arc<ProcessSupervisor>,
        logs: Arc<LogBroadcast>,
    ) -> Self {
        Self {
            workspace: workspace.into(),
            staging_dir: staging_dir.into(),
            supervisor,
            logs,
            fetcher: Arc::new(DefaultFetcher),
            defaults: DeployDefaults::default(),
            in_flight: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn with_fetcher(mut self, fetcher: Arc<dyn SourceFetcher>) -> Self {
        self.fetcher = fetcher;
        self
    }

    pub fn with_defaults(mut self, defaults: DeployDefaults) -> Self {
        self.defaults = defaults;
        self
    }

    pub fn staging_dir(&self) -> &Path {
        &self.staging_dir
    }

    pub fn is_deploying(&self) -> bool {
        self.in_flight.load(Ordering::Acquire)
    }

    /// Accept a deploy and run it in the background.
    ///
    /// Returns immediately; progress is observable only through the log
    /// buffer. The handle resolves when the deploy finishes.
    pub fn trigger(self: &Arc<Self>, request: DeployRequest) -> Result<JoinHandle<DeployOutcome>, DeployError> {
        if self
            .in_flight
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(DeployError::AlreadyInProgress);
        }
        let guard = InFlightGuard(Arc::clone(&self.in_flight));

        let pipeline = Arc::clone(self);
        Ok(tokio::spawn(async move {
            let _guard = guard;
            pipeline.run(request).await
        }))
    }

    async fn run(&self, request: DeployRequest) -> DeployOutcome {
        let command = request
            .run_command
            .as_deref()
            .map(str::trim)
            .filter(|c| !c.is_empty())
            .unwrap_or(&self.defaults.run_command)
            .to_string();
        let mut run = DeployRun {
            request,
            command,
            pid: None,
        };

        for stage in DeployStage::ALL {
            tracing::debug!(%stage, "deploy stage starting");
            if let Err(message) = self.run_stage(stage, &mut run).await {
                let err = DeployError::StageFailed { stage, message };
                self.logs.error(err.to_string());
                return Err(err);
            }
        }

        tracing::info!(pid = ?run.pid, "deploy finished");
        run.pid.ok_or_else(|| DeployError::StageFailed {
            stage: DeployStage::StartProcess,
            message: "process did not start".to_string(),
        })
    }

    async fn run_stage(&self, stage: DeployStage, run: &mut DeployRun) -> StageResult {
        match stage {
            DeployStage::StopProcess => {
                self.supervisor.stop().await;
                Ok(())
            }
            DeployStage::WipeWorkspace => self.wipe_workspace().await,
            DeployStage::Materialize => self.materialize(&run.request.source).await,
            DeployStage::InstallDependencies => {
                if run.request.install_dependencies {
                    self.install_dependencies().await;
                }
                Ok(())
            }
            DeployStage::StartProcess => {
                let pid = self
                    .supervisor
                    .start(&run.command)
                    .await
                    .map_err(|e| e.to_string())?;
                run.pid = Some(pid);
                Ok(())
            }
            DeployStage::Cleanup => {
                self.cleanup_staging(&run.request.source).await;
                Ok(())
            }
        }
    }

    async fn wipe_workspace(&self) -> StageResult {
        self.logs.warn("Clearing workspace directory...");
        empty_dir(&self.workspace)
            .await
            .map_err(|e| format!("failed to clear workspace: {}", e))
    }

    async fn materialize(&self, source: &DeploySource) -> StageResult {
        match source {
            DeploySource::Archive { .. } => self.logs.info("Extracting archive..."),
            DeploySource::Repository { url } => self.logs.info(format!("Cloning {}...", url)),
        };
        self.fetcher
            .materialize(source, &self.workspace)
            .await
            .map_err(|e| format!("{:#}", e))
    }

    /// Run the install command as its own subprocess. Failure of any kind is
    /// logged and swallowed: the run command is attempted regardless.
    async fn install_dependencies(&self) {
        let command = &self.defaults.install_command;
        self.logs
            .info(format!("Installing dependencies: {} (please wait)...", command));

        let mut child = match shell_command(command, &self.workspace).spawn() {
            Ok(child) => child,
            Err(e) => {
                self.logs
                    .error(format!("Failed to start dependency install: {}", e));
                return;
            }
        };
        // Nothing is ever typed into the installer.
        drop(child.stdin.take());

        let noise = self.supervisor.noise_filter().clone();
        let stdout = child.stdout.take().map(|out| {
            tokio::spawn(pump_lines(out, OutputStream::Stdout, Arc::clone(&self.logs), noise.clone()))
        });
        let stderr = child.stderr.take().map(|err| {
            tokio::spawn(pump_lines(err, OutputStream::Stderr, Arc::clone(&self.logs), noise.clone()))
        });

        let waited = tokio::time::timeout(self.defaults.install_timeout, child.wait()).await;
        let status = match waited {
            Ok(status) => status,
            Err(_) => {
                self.logs.error(format!(
                    "Dependency install timed out after {}s; killing it",
                    self.defaults.install_timeout.as_secs()
                ));
                kill_install(&mut child).await;
                child.wait().await
            }
        };
        for reader in [stdout, stderr].into_iter().flatten() {
            let _ = tokio::time::timeout(Duration::from_secs(2), reader).await;
        }

        match status {
            Ok(status) if status.success() => self.logs.success("Dependency install finished (exit code 0)"),
            Ok(status) => match status.code() {
                Some(code) => self.logs.warn(format!(
                    "Dependency install exited with code {}; starting anyway",
                    code
                )),
                None => self
                    .logs
                    .warn("Dependency install was terminated by a signal; starting anyway"),
            },
            Err(e) => self
                .logs
                .error(format!("Failed to wait for dependency install: {}", e)),
        };
    }

    /// Best-effort removal of the staged source material.
    async fn cleanup_staging(&self, source: &DeploySource) {
        if let DeploySource::Archive { staged } = source
            && let Err(e) = tokio::fs::remove_file(staged).await
            && e.kind() != std::io::ErrorKind::NotFound
        {
            tracing::warn!(path = %staged.display(), "failed to remove staged archive: {}", e);
        }
    }
}

async fn kill_install(child: &mut tokio::process::Child) {
    #[cfg(unix)]
    if let Some(pid) = child.id().and_then(|pid| libc::pid_t::try_from(pid).ok())
        && pid > 0
    {
        // SAFETY: killpg has no memory-safety preconditions; pid is positive.
        unsafe {
            libc::killpg(pid, libc::SIGKILL);
        }
    }
    if let Err(e) = child.start_kill() {
        tracing::debug!("install kill: {}", e);
    }
}

/// Remove every entry in `dir`, creating `dir` if it does not exist.
pub async fn empty_dir(dir: &Path) -> std::io::Result<()> {
    tokio::fs::create_dir_all(dir).await?;
    let mut entries = tokio::fs::read_dir(dir).await?;
    while let Some(entry) = entries.next_entry().await? {
        let path = entry.path();
        let file_type = entry.file_type().await?;
        if file_type.is_dir() {
            tokio::fs::remove_dir_all(&path).await?;
        } else {
            tokio::fs::remove_file(&path).await?;
        }
    }
    Ok(())
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::panel::models::{LogKind, ProcessState};
    use anyhow::Result;
    use async_trait::async_trait;

    /// Writes a fixed set of files instead of fetching anything.
    struct StaticFetcher(Vec<(&'static str, &'static str)>);

    #[async_trait]
    impl SourceFetcher for StaticFetcher {
        async fn materialize(&self, _source: &DeploySource, workspace: &Path) -> Result<()> {
            for (name, contents) in &self.0 {
                std::fs::write(workspace.join(name), contents)?;
            }
            Ok(())
        }
    }

    struct FailingFetcher;

    #[async_trait]
    impl SourceFetcher for FailingFetcher {
        async fn materialize(&self, _source: &DeploySource, _workspace: &Path) -> Result<()> {
            anyhow::bail!("repository not found")
        }
    }

    struct Harness {
        _dir: tempfile::TempDir,
        root: PathBuf,
        workspace: PathBuf,
        logs: Arc<LogBroadcast>,
        supervisor: Arc<ProcessSupervisor>,
    }

    fn harness() -> Harness {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().to_path_buf();
        let workspace = root.join("workspace");
        std::fs::create_dir_all(&workspace).unwrap();
        let logs = Arc::new(LogBroadcast::new(200));
        let supervisor = Arc::new(
            ProcessSupervisor::new(&workspace, Arc::clone(&logs))
                .with_stop_grace(Duration::from_millis(500)),
        );
        Harness {
            _dir: dir,
            root,
            workspace,
            logs,
            supervisor,
        }
    }

    fn pipeline(h: &Harness, fetcher: Arc<dyn SourceFetcher>, defaults: DeployDefaults) -> Arc<DeployPipeline> {
        Arc::new(
            DeployPipeline::new(
                &h.workspace,
                h.root.join("staging"),
                Arc::clone(&h.supervisor),
                Arc::clone(&h.logs),
            )
            .with_fetcher(fetcher)
            .with_defaults(defaults),
        )
    }

    fn repo_request(run_command: Option<&str>, install: bool) -> DeployRequest {
        DeployRequest {
            source: DeploySource::Repository {
                url: "https://example.invalid/bot.git".to_string(),
            },
            run_command: run_command.map(str::to_string),
            install_dependencies: install,
        }
    }

    async fn wait_idle(sup: &ProcessSupervisor) {
        for _ in 0..100 {
            if sup.status().await == ProcessState::Idle {
                return;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        panic!("supervisor did not return to Idle");
    }

    #[tokio::test]
    async fn test_deploy_runs_default_command_and_streams_output() {
        let h = harness();
        let defaults = DeployDefaults {
            run_command: "sh index.sh".to_string(),
            ..DeployDefaults::default()
        };
        let p = pipeline(&h, Arc::new(StaticFetcher(vec![("index.sh", "echo hello\n")])), defaults);

        let pid = p.trigger(repo_request(Some("  "), false)).unwrap().await.unwrap().unwrap();
        assert!(pid > 0);
        wait_idle(&h.supervisor).await;

        let entries = h.logs.snapshot();
        let start = entries
            .iter()
            .position(|e| e.kind == LogKind::Success && e.text == "Starting process: sh index.sh")
            .expect("start entry");
        let hello = entries
            .iter()
            .position(|e| e.kind == LogKind::Info && e.text.contains("hello"))
            .expect("hello entry");
        let exit = entries
            .iter()
            .position(|e| e.kind == LogKind::Warn && e.text == "Process exited with code 0")
            .expect("exit entry");
        assert!(start < hello && hello < exit);
    }

    #[tokio::test]
    async fn test_wipe_removes_previous_files() {
        let h = harness();
        std::fs::write(h.workspace.join("stale.txt"), "old").unwrap();
        std::fs::create_dir_all(h.workspace.join("node_modules/pkg")).unwrap();
        let p = pipeline(&h, Arc::new(StaticFetcher(vec![("fresh.txt", "new")])), DeployDefaults::default());

        p.trigger(repo_request(Some("true"), false)).unwrap().await.unwrap().unwrap();

        assert!(!h.workspace.join("stale.txt").exists());
        assert!(!h.workspace.join("node_modules").exists());
        assert!(h.workspace.join("fresh.txt").exists());
    }

    #[tokio::test]
    async fn test_failed_install_still_starts_run_command_once() {
        let h = harness();
        let counter = h.root.join("runs.txt");
        let defaults = DeployDefaults {
            install_command: "echo 'npm WARN old' >&2; exit 3".to_string(),
            ..DeployDefaults::default()
        };
        let p = pipeline(&h, Arc::new(StaticFetcher(vec![])), defaults);
        let run_command = format!("echo ran >> '{}'", counter.display());

        p.trigger(repo_request(Some(&run_command), true)).unwrap().await.unwrap().unwrap();
        wait_idle(&h.supervisor).await;

        assert_eq!(std::fs::read_to_string(&counter).unwrap(), "ran\n");
        let entries = h.logs.snapshot();
        assert!(entries.iter().any(|e| e.kind == LogKind::Warn
            && e.text.contains("Dependency install exited with code 3")));
        assert!(entries.iter().any(|e| e.kind == LogKind::Input && e.text == "npm WARN old"));
    }

    #[tokio::test]
    async fn test_install_runs_before_start() {
        let h = harness();
        let defaults = DeployDefaults {
            install_command: "echo installed > marker".to_string(),
            ..DeployDefaults::default()
        };
        let p = pipeline(&h, Arc::new(StaticFetcher(vec![])), defaults);

        p.trigger(repo_request(Some("cat marker"), true)).unwrap().await.unwrap().unwrap();
        wait_idle(&h.supervisor).await;

        assert!(h.logs.snapshot().iter().any(|e| e.kind == LogKind::Info && e.text == "installed"));
    }

    #[tokio::test]
    async fn test_materialize_failure_aborts_before_start() {
        let h = harness();
        let p = pipeline(&h, Arc::new(FailingFetcher), DeployDefaults::default());

        let err = p.trigger(repo_request(Some("echo never"), false)).unwrap().await.unwrap().unwrap_err();
        match err {
            DeployError::StageFailed { stage, message } => {
                assert_eq!(stage, DeployStage::Materialize);
                assert!(message.contains("repository not found"));
            }
            other => panic!("Expected StageFailed, got {:?}", other),
        }
        assert_eq!(h.supervisor.status().await, ProcessState::Idle);
        let entries = h.logs.snapshot();
        assert!(!entries.iter().any(|e| e.text.starts_with("Starting process")));
        assert_eq!(entries.last().unwrap().kind, LogKind::Error);
    }

    #[tokio::test]
    async fn test_concurrent_deploy_is_rejected() {
        let h = harness();
        let p = pipeline(&h, Arc::new(StaticFetcher(vec![])), DeployDefaults::default());

        // Occupy the supervisor so the first deploy spends time stopping it.
        h.supervisor.start("trap '' TERM; sleep 30").await.unwrap();
        let first = p.trigger(repo_request(Some("true"), false)).unwrap();
        assert!(p.is_deploying());
        let second = p.trigger(repo_request(Some("true"), false));
        assert!(matches!(second, Err(DeployError::AlreadyInProgress)));

        first.await.unwrap().unwrap();
        assert!(!p.is_deploying());
        assert!(p.trigger(repo_request(Some("true"), false)).is_ok());
    }

    #[tokio::test]
    async fn test_deploy_during_operator_stop_waits_for_exit_before_wipe() {
        let h = harness();
        let p = pipeline(&h, Arc::new(StaticFetcher(vec![])), DeployDefaults::default());

        h.supervisor.start("trap '' TERM; sleep 30").await.unwrap();
        let operator_stop = {
            let supervisor = Arc::clone(&h.supervisor);
            tokio::spawn(async move { supervisor.stop().await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;

        let pid = p.trigger(repo_request(Some("sleep 5"), false)).unwrap().await.unwrap().unwrap();
        assert!(pid > 0);
        operator_stop.await.unwrap();

        let entries = h.logs.snapshot();
        let exited = entries
            .iter()
            .position(|e| e.kind == LogKind::Warn && e.text.starts_with("Process exited"))
            .expect("exit entry");
        let wipe = entries
            .iter()
            .position(|e| e.text == "Clearing workspace directory...")
            .expect("wipe entry");
        assert!(exited < wipe);
        assert!(matches!(h.supervisor.status().await, ProcessState::Running { .. }));

        h.supervisor.stop().await;
    }

    #[tokio::test]
    async fn test_redeploy_replaces_running_process() {
        let h = harness();
        let p = pipeline(&h, Arc::new(StaticFetcher(vec![])), DeployDefaults::default());

        let first = p.trigger(repo_request(Some("sleep 30"), false)).unwrap().await.unwrap().unwrap();
        let second = p.trigger(repo_request(Some("sleep 30"), false)).unwrap().await.unwrap().unwrap();
        assert_ne!(first, second);
        assert_eq!(h.supervisor.status().await, ProcessState::Running { pid: second });

        h.supervisor.stop().await;
    }

    #[tokio::test]
    async fn test_cleanup_removes_staged_archive() {
        let h = harness();
        let staging = h.root.join("staging");
        std::fs::create_dir_all(&staging).unwrap();
        let staged = staging.join("upload.zip");
        std::fs::write(&staged, "zip bytes").unwrap();
        let p = pipeline(&h, Arc::new(StaticFetcher(vec![])), DeployDefaults::default());

        let request = DeployRequest {
            source: DeploySource::Archive {
                staged: staged.clone(),
            },
            run_command: Some("true".to_string()),
            install_dependencies: false,
        };
        p.trigger(request).unwrap().await.unwrap().unwrap();

        assert!(!staged.exists());
        assert!(staging.exists());
    }

    #[tokio::test]
    async fn test_empty_dir_creates_missing_directory() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("a/b");
        empty_dir(&target).await.unwrap();
        assert!(target.is_dir());
    }
}
