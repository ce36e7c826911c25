//! Lifecycle of the mihomo process and the routing that depends on it
//!
//! A start kills whatever the PID file points at, patches the core config
//! for the routing mode, spawns the core, waits until it (and the TUN device,
//! when needed) is up and only then programs the kernel. Any failure after
//! the spawn kills the new process again, removes the PID file and tears
//! down whatever routing was applied.
//!
//! Start, stop, restart and config updates are serialized through an
//! explicit state machine, and across clashd processes through a lock file
//! next to the application config; overlapping calls fail with
//! [`ServiceError::Busy`].

use crate::config::{AppConfig, ConfigLoader, ConfigValidator};
use crate::error::{Result, ServiceError};
use crate::lock::LifecycleLock;
use crate::logs;
use crate::patcher;
use crate::pidfile::{self, PidFile};
use crate::readiness::{self, Check, ReadinessConfig};
use clashd_nft::{DeviceWait, InstalledEngines, Kernel, RoutingConfig, RoutingEngine};
use std::fmt;
use std::fs::{self, File, OpenOptions};
use std::os::unix::process::CommandExt;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::time::{sleep, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

const EXIT_POLL: Duration = Duration::from_millis(50);

/// What `status` reports to callers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceStatus {
    Running,
    Stopped,
}

impl ServiceStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ServiceStatus::Running => "running",
            ServiceStatus::Stopped => "stopped",
        }
    }
}

impl fmt::Display for ServiceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lifecycle {
    Stopped,
    Starting,
    Running,
    Stopping,
}

impl Lifecycle {
    fn in_transition(&self) -> bool {
        matches!(self, Lifecycle::Starting | Lifecycle::Stopping)
    }
}

/// Timing knobs; the defaults suit a router, tests shrink them
#[derive(Debug, Clone, Copy)]
pub struct SupervisorOptions {
    pub readiness: ReadinessConfig,
    pub device_wait: DeviceWait,
    /// Time between SIGTERM and SIGKILL
    pub stop_grace: Duration,
}

impl Default for SupervisorOptions {
    fn default() -> Self {
        Self {
            readiness: ReadinessConfig::default(),
            device_wait: DeviceWait::default(),
            stop_grace: Duration::from_secs(5),
        }
    }
}

/// Puts the lifecycle back into a resting state when dropped, so a failed
/// or abandoned transition never leaves the supervisor stuck as busy.
/// Also holds the host-wide lock for the duration of the transition.
struct Transition<'a> {
    lifecycle: &'a Mutex<Lifecycle>,
    outcome: Lifecycle,
    _host_lock: LifecycleLock,
}

impl Transition<'_> {
    fn finish(mut self, outcome: Lifecycle) {
        self.outcome = outcome;
    }
}

impl Drop for Transition<'_> {
    fn drop(&mut self) {
        *self.lifecycle.lock().unwrap_or_else(|e| e.into_inner()) = self.outcome;
    }
}

/// The core instance this supervisor started
#[derive(Debug, Clone)]
struct ActiveRun {
    pid_file: PidFile,
    /// Routing applied for it, if any
    routing: Option<RoutingConfig>,
}

fn settled(result: &Result<()>) -> Lifecycle {
    if result.is_ok() {
        Lifecycle::Running
    } else {
        Lifecycle::Stopped
    }
}

pub struct Supervisor {
    config_path: PathBuf,
    config: Mutex<AppConfig>,
    lifecycle: Mutex<Lifecycle>,
    /// Whether the watchdog should keep the core alive; independent of what
    /// `status` last observed
    keep_alive: AtomicBool,
    child: Mutex<Option<Child>>,
    active: Mutex<Option<ActiveRun>>,
    kernel: Arc<dyn Kernel>,
    routing: Arc<RoutingEngine>,
    options: SupervisorOptions,
    cancel: CancellationToken,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

impl Supervisor {
    /// `config_path` is where auto-start changes and config updates are saved.
    /// Every process using the same path shares one lifecycle lock.
    pub fn new(config_path: impl Into<PathBuf>, config: AppConfig, kernel: Arc<dyn Kernel>) -> Self {
        Self::with_options(config_path, config, kernel, SupervisorOptions::default())
    }

    pub fn with_options(
        config_path: impl Into<PathBuf>,
        config: AppConfig,
        kernel: Arc<dyn Kernel>,
        options: SupervisorOptions,
    ) -> Self {
        let routing = RoutingEngine::new(kernel.clone()).with_device_wait(options.device_wait);
        Self {
            config_path: config_path.into(),
            config: Mutex::new(config),
            lifecycle: Mutex::new(Lifecycle::Stopped),
            keep_alive: AtomicBool::new(false),
            child: Mutex::new(None),
            active: Mutex::new(None),
            kernel,
            routing: Arc::new(routing),
            options,
            cancel: CancellationToken::new(),
        }
    }

    pub fn app_config(&self) -> AppConfig {
        lock(&self.config).clone()
    }

    pub fn lifecycle(&self) -> Lifecycle {
        *lock(&self.lifecycle)
    }

    /// PID file of the instance we started, falling back to the configured one
    fn pid_file(&self) -> PidFile {
        if let Some(run) = lock(&self.active).as_ref() {
            return run.pid_file.clone();
        }
        PidFile::new(lock(&self.config).mihomo.pid_file())
    }

    /// Running iff the PID file names a live process. Never fails; a stale
    /// PID file is removed along the way.
    pub fn status(&self) -> ServiceStatus {
        self.reap();
        let status = match self.pid_file().live_pid() {
            Some(_) => ServiceStatus::Running,
            None => ServiceStatus::Stopped,
        };

        let mut lifecycle = lock(&self.lifecycle);
        if status == ServiceStatus::Stopped && *lifecycle == Lifecycle::Running {
            *lifecycle = Lifecycle::Stopped;
        }
        status
    }

    pub async fn start(&self) -> Result<()> {
        let transition = self.begin(Lifecycle::Starting)?;
        let result = self.start_inner().await;
        transition.finish(settled(&result));
        result
    }

    /// Stop the core. With `save_state` the auto-start flag is cleared so the
    /// next daemon start does not bring it back.
    pub async fn stop(&self, save_state: bool) -> Result<()> {
        let transition = self.begin(Lifecycle::Stopping)?;
        let result = self.stop_inner(save_state).await;
        transition.finish(Lifecycle::Stopped);
        result
    }

    pub async fn restart(&self) -> Result<()> {
        let transition = self.begin(Lifecycle::Stopping)?;
        let result = self.restart_inner().await;
        transition.finish(settled(&result));
        result
    }

    /// Bring the core back after a reboot if it was running before
    pub async fn restore_state(&self) -> Result<()> {
        if !lock(&self.config).mihomo.auto_start {
            debug!("Auto-start disabled, not restoring");
            return Ok(());
        }
        if self.status() == ServiceStatus::Running {
            info!("mihomo already running, adopting it");
            *lock(&self.lifecycle) = Lifecycle::Running;
            self.keep_alive.store(true, Ordering::SeqCst);
            return Ok(());
        }
        info!("Restoring mihomo after startup");
        self.start().await
    }

    /// Validate, persist and adopt a new configuration. A running core is
    /// restarted under the new settings when `auto_restart` is set; otherwise
    /// it keeps running and the changes apply from its next start.
    pub async fn update_app_config(&self, mut config: AppConfig) -> Result<()> {
        ConfigValidator::validate(&config)?;
        let transition = self.begin(Lifecycle::Stopping)?;

        ConfigLoader::save(&config, &self.config_path)?;
        ConfigLoader::refresh_core_api(&mut config);
        info!("Application config updated");

        self.adopt_config(transition, config).await?;
        Ok(())
    }

    /// Replace the contents of the active core config. Returns whether the
    /// core was restarted to pick them up.
    pub async fn write_core_config(&self, contents: &str) -> Result<bool> {
        let transition = self.begin(Lifecycle::Stopping)?;
        let config = self.app_config();
        let path = config.mihomo.config_path.clone();
        if !path.is_file() {
            return Err(ServiceError::CoreConfigMissing { path });
        }

        fs::write(&path, contents).map_err(|source| ServiceError::PatchConfig {
            path: path.clone(),
            source,
        })?;
        info!("Core config {:?} rewritten", path);

        self.adopt_config(transition, config).await
    }

    /// Point the core at another config file. Returns whether the core was
    /// restarted to use it.
    pub async fn switch_core_config(&self, path: impl Into<PathBuf>) -> Result<bool> {
        let path = path.into();
        if !path.is_file() {
            return Err(ServiceError::CoreConfigMissing { path });
        }
        let transition = self.begin(Lifecycle::Stopping)?;

        let mut config = self.app_config();
        config.mihomo.config_path = path;
        ConfigLoader::save(&config, &self.config_path)?;
        ConfigLoader::refresh_core_api(&mut config);
        info!("Active core config is now {:?}", config.mihomo.config_path);

        self.adopt_config(transition, config).await
    }

    pub fn logs(&self, lines: usize) -> Result<Vec<String>> {
        let path = self.log_path()?;
        logs::tail(&path, lines)
            .map_err(|e| ServiceError::LogUnavailable(format!("{}: {}", path.display(), e)))
    }

    pub fn clear_logs(&self) -> Result<()> {
        let path = self.log_path()?;
        logs::clear(&path).map_err(|source| ServiceError::ClearLog { path, source })
    }

    pub fn installed_routing(&self) -> Result<InstalledEngines> {
        self.routing.installed().map_err(ServiceError::Cleanup)
    }

    /// Restart the core if it exited on its own. A core stopped through
    /// another clashd process (auto-start cleared on disk) is left alone.
    /// Returns whether a restart was attempted.
    pub async fn check_health(&self) -> bool {
        if !self.keep_alive.load(Ordering::SeqCst) {
            return false;
        }
        let transition = match self.begin(Lifecycle::Starting) {
            Ok(transition) => transition,
            Err(e) => {
                debug!("Skipping health check: {}", e);
                return false;
            }
        };

        self.reap();
        if self.pid_file().live_pid().is_some() {
            return false;
        }

        match ConfigLoader::load_from_file(&self.config_path) {
            Ok(mut persisted) => {
                ConfigLoader::refresh_core_api(&mut persisted);
                *lock(&self.config) = persisted;
            }
            Err(e) => warn!("Failed to re-read {:?}: {}", self.config_path, e),
        }
        let mihomo = self.app_config().mihomo;

        if !mihomo.auto_start {
            info!("mihomo was stopped elsewhere, not restarting");
            self.keep_alive.store(false, Ordering::SeqCst);
            *lock(&self.active) = None;
            transition.finish(Lifecycle::Stopped);
            return false;
        }
        if !mihomo.restart_on_exit {
            warn!("mihomo exited and restart_on_exit is off");
            self.keep_alive.store(false, Ordering::SeqCst);
            transition.finish(Lifecycle::Stopped);
            return false;
        }

        warn!("mihomo is no longer running, restarting");
        let result = self.start_inner().await;
        if let Err(ref e) = result {
            error!("Automatic restart failed: {}", e);
        }
        transition.finish(settled(&result));
        true
    }

    /// Run [`check_health`](Self::check_health) every `interval` until shutdown
    pub async fn watch(&self, interval: Duration) {
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => return,
                _ = sleep(interval) => {}
            }
            self.check_health().await;
        }
    }

    /// Abort any readiness wait and stop the watchdog
    pub fn shutdown(&self) {
        self.cancel.cancel();
    }

    fn begin(&self, state: Lifecycle) -> Result<Transition<'_>> {
        let mut lifecycle = lock(&self.lifecycle);
        if lifecycle.in_transition() {
            return Err(ServiceError::Busy);
        }
        let host_lock = LifecycleLock::try_acquire(&LifecycleLock::path_for(&self.config_path))?
            .ok_or(ServiceError::Busy)?;

        let previous = *lifecycle;
        *lifecycle = state;
        Ok(Transition {
            lifecycle: &self.lifecycle,
            outcome: previous,
            _host_lock: host_lock,
        })
    }

    /// Install `config` and restart a running core under it when
    /// `auto_restart` asks for that. The old core is stopped with the
    /// settings it was started with.
    async fn adopt_config(&self, transition: Transition<'_>, config: AppConfig) -> Result<bool> {
        let restart = config.mihomo.auto_restart && self.status() == ServiceStatus::Running;
        if !restart {
            *lock(&self.config) = config;
            return Ok(false);
        }

        let stopped = self.stop_inner(false).await;
        *lock(&self.config) = config;
        match stopped {
            Ok(()) | Err(ServiceError::NotRunning) => {}
            Err(e) => {
                transition.finish(Lifecycle::Stopped);
                return Err(e);
            }
        }

        *lock(&self.lifecycle) = Lifecycle::Starting;
        let result = self.start_inner().await;
        transition.finish(settled(&result));
        result.map(|()| true)
    }

    async fn restart_inner(&self) -> Result<()> {
        match self.stop_inner(false).await {
            Ok(()) | Err(ServiceError::NotRunning) => {}
            Err(e) => return Err(e),
        }
        *lock(&self.lifecycle) = Lifecycle::Starting;
        self.start_inner().await
    }

    fn log_path(&self) -> Result<PathBuf> {
        lock(&self.config)
            .mihomo
            .log_path()
            .map(Path::to_path_buf)
            .ok_or_else(|| ServiceError::LogUnavailable("no log_file configured".to_string()))
    }

    async fn start_inner(&self) -> Result<()> {
        let existing = self.pid_file();
        if let Some(pid) = existing.live_pid() {
            info!("Stopping existing mihomo instance (pid {})", pid);
            self.terminate(pid)
                .await
                .map_err(|e| ServiceError::KillExisting(Box::new(e)))?;
            existing
                .remove()
                .map_err(|e| ServiceError::KillExisting(Box::new(e)))?;
        }

        let config = self.app_config();
        let mihomo = &config.mihomo;
        let routing = mihomo.routing.clone();
        let pid_file = PidFile::new(mihomo.pid_file());

        patch_core_config(&mihomo.config_path, &routing)?;

        let log_path = mihomo.log_path().map(Path::to_path_buf);
        if let Some(ref path) = log_path {
            logs::remove(path).map_err(|source| ServiceError::ClearLog {
                path: path.clone(),
                source,
            })?;
        }

        let pid = self.spawn_core(&config, log_path.as_deref())?;
        info!("Started mihomo (pid {})", pid);

        if let Err(e) = pid_file.write(pid) {
            self.rollback(pid, &pid_file, false).await;
            return Err(e);
        }

        let mut applied = None;
        if routing.needs_routing() {
            if let Err(e) = self.wait_ready(pid, &routing).await {
                error!("mihomo did not become ready: {}", e);
                self.rollback(pid, &pid_file, false).await;
                return Err(e);
            }

            let engine = self.routing.clone();
            let wanted = routing.clone();
            let setup = tokio::task::spawn_blocking(move || engine.setup(&wanted))
                .await
                .map_err(|e| ServiceError::Task(e.to_string()))
                .and_then(|r| r.map_err(ServiceError::Setup));
            if let Err(e) = setup {
                error!("Routing setup failed: {}", e);
                self.rollback(pid, &pid_file, true).await;
                return Err(e);
            }
            applied = Some(routing.clone());
        }

        *lock(&self.active) = Some(ActiveRun {
            pid_file,
            routing: applied,
        });
        self.keep_alive.store(true, Ordering::SeqCst);
        if let Err(e) = self.persist_auto_start(true) {
            warn!("Failed to persist auto-start flag: {}", e);
        }
        info!(
            "mihomo running (tcp: {}, udp: {})",
            routing.tcp, routing.udp
        );
        Ok(())
    }

    /// Teardown of the routing is best-effort: once the core is gone a
    /// cleanup failure is logged and the stop still succeeds
    async fn stop_inner(&self, save_state: bool) -> Result<()> {
        self.keep_alive.store(false, Ordering::SeqCst);
        if self.status() == ServiceStatus::Stopped {
            return Err(ServiceError::NotRunning);
        }
        let pid_file = self.pid_file();
        let Some(pid) = pid_file.read() else {
            return Err(ServiceError::NotRunning);
        };

        info!("Stopping mihomo (pid {})", pid);
        self.terminate(pid).await?;
        pid_file.remove()?;

        let applied = lock(&self.active).take().and_then(|run| run.routing);
        let needs_cleanup =
            applied.is_some() || lock(&self.config).mihomo.routing.needs_routing();
        if needs_cleanup {
            if let Err(e) = self.cleanup_routing().await {
                warn!("Routing cleanup after stop failed: {}", e);
            }
        }

        if save_state {
            if let Err(e) = self.persist_auto_start(false) {
                warn!("Failed to persist auto-start flag: {}", e);
            }
        }
        info!("mihomo stopped");
        Ok(())
    }

    fn spawn_core(&self, config: &AppConfig, log_path: Option<&Path>) -> Result<u32> {
        let mihomo = &config.mihomo;
        let spawn_err = |source: std::io::Error| ServiceError::Spawn {
            path: mihomo.core_path.clone(),
            source,
        };

        fs::create_dir_all(&mihomo.working_dir).map_err(spawn_err)?;

        let (stdout, stderr) = match log_path {
            Some(path) => {
                let file = open_log(path).map_err(|source| ServiceError::ClearLog {
                    path: path.to_path_buf(),
                    source,
                })?;
                let clone = file.try_clone().map_err(spawn_err)?;
                (Stdio::from(file), Stdio::from(clone))
            }
            None => (Stdio::null(), Stdio::null()),
        };

        debug!(
            "Spawning {:?} -d {:?} -f {:?}",
            mihomo.core_path, mihomo.working_dir, mihomo.config_path
        );
        let child = Command::new(&mihomo.core_path)
            .arg("-d")
            .arg(&mihomo.working_dir)
            .arg("-f")
            .arg(&mihomo.config_path)
            .stdin(Stdio::null())
            .stdout(stdout)
            .stderr(stderr)
            // keep terminal signals aimed at us away from the core
            .process_group(0)
            .spawn()
            .map_err(spawn_err)?;

        let pid = child.id();
        *lock(&self.child) = Some(child);
        Ok(pid)
    }

    async fn wait_ready(&self, pid: u32, routing: &RoutingConfig) -> Result<()> {
        let device = routing.needs_tun().then(|| routing.tun_device().to_string());
        readiness::wait_until_ready(pid, self.options.readiness, &self.cancel, || {
            if let Some(status) = self.reap() {
                return Check::Exited(status);
            }
            if !self.process_alive(pid) {
                return Check::Exited("no longer running".to_string());
            }
            match device {
                Some(ref name) if !self.kernel.link_exists(name) => {
                    Check::Waiting(format!("TUN device {}", name))
                }
                _ => Check::Ready,
            }
        })
        .await
    }

    /// Undo a start that failed after the spawn
    async fn rollback(&self, pid: u32, pid_file: &PidFile, cleanup_routing: bool) {
        if let Err(e) = self.terminate(pid).await {
            warn!("Failed to kill pid {} during rollback: {}", pid, e);
        }
        if let Err(e) = pid_file.remove() {
            warn!("Failed to remove PID file during rollback: {}", e);
        }
        if cleanup_routing {
            if let Err(e) = self.cleanup_routing().await {
                warn!("Routing cleanup during rollback failed: {}", e);
            }
        }
    }

    async fn cleanup_routing(&self) -> Result<()> {
        let engine = self.routing.clone();
        tokio::task::spawn_blocking(move || engine.cleanup())
            .await
            .map_err(|e| ServiceError::Task(e.to_string()))?
            .map_err(ServiceError::Cleanup)
    }

    /// SIGTERM, then SIGKILL once the grace period is over
    async fn terminate(&self, pid: u32) -> Result<()> {
        pidfile::send_signal(pid, libc::SIGTERM)?;
        if self.wait_exit(pid, self.options.stop_grace).await {
            return Ok(());
        }

        warn!("pid {} ignored SIGTERM, sending SIGKILL", pid);
        pidfile::send_signal(pid, libc::SIGKILL)?;
        if !self.wait_exit(pid, self.options.stop_grace).await {
            warn!("pid {} still present after SIGKILL", pid);
        }
        Ok(())
    }

    async fn wait_exit(&self, pid: u32, within: Duration) -> bool {
        let deadline = Instant::now() + within;
        loop {
            if !self.process_alive(pid) {
                return true;
            }
            if Instant::now() >= deadline {
                return false;
            }
            sleep(EXIT_POLL).await;
        }
    }

    /// Liveness that does not mistake our own exited child for a live process
    fn process_alive(&self, pid: u32) -> bool {
        let mut child = lock(&self.child);
        if let Some(ref mut owned) = *child {
            if owned.id() == pid {
                return match owned.try_wait() {
                    Ok(Some(status)) => {
                        debug!("mihomo (pid {}) exited: {}", pid, status);
                        *child = None;
                        false
                    }
                    Ok(None) => true,
                    Err(_) => pidfile::is_alive(pid),
                };
            }
        }
        pidfile::is_alive(pid)
    }

    /// Collect our child if it has exited; returns its exit status
    fn reap(&self) -> Option<String> {
        let mut child = lock(&self.child);
        let status = match child.as_mut()?.try_wait() {
            Ok(Some(status)) => status,
            _ => return None,
        };
        *child = None;
        info!("mihomo exited: {}", status);
        Some(status.to_string())
    }

    /// Flip auto-start on disk without clobbering changes other clashd
    /// processes made to the file
    fn persist_auto_start(&self, value: bool) -> Result<()> {
        lock(&self.config).mihomo.auto_start = value;
        let mut on_disk = match ConfigLoader::load_from_file(&self.config_path) {
            Ok(config) => config,
            Err(e) => {
                debug!("Rewriting {:?} from memory: {}", self.config_path, e);
                self.app_config()
            }
        };
        if on_disk.mihomo.auto_start == value {
            return Ok(());
        }
        on_disk.mihomo.auto_start = value;
        ConfigLoader::save(&on_disk, &self.config_path)
    }
}

fn open_log(path: &Path) -> std::io::Result<File> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    OpenOptions::new().create(true).append(true).open(path)
}

/// Enable or disable the core's TUN stanza to match the routing mode
fn patch_core_config(path: &Path, routing: &RoutingConfig) -> Result<()> {
    let patch_err = |source| ServiceError::PatchConfig {
        path: path.to_path_buf(),
        source,
    };

    let original = fs::read_to_string(path).map_err(patch_err)?;
    let patched = if routing.needs_tun() {
        patcher::enable_tun(&original, routing.tun_device())
    } else {
        patcher::disable_tun(&original)
    };

    if patched != original {
        fs::write(path, &patched).map_err(patch_err)?;
        debug!("Patched TUN section of {:?}", path);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clashd_nft::ruleset::TableFamily;
    use clashd_nft::{MemoryKernel, RoutingMode};
    use std::os::unix::fs::PermissionsExt;
    use tempfile::TempDir;

    const SLEEPER: &str = "#!/bin/sh\necho core starting\nexec sleep 30\n";
    const CRASHER: &str = "#!/bin/sh\nexit 1\n";

    struct Fixture {
        dir: TempDir,
        kernel: Arc<MemoryKernel>,
        supervisor: Arc<Supervisor>,
    }

    impl Fixture {
        fn app_toml(&self) -> PathBuf {
            self.dir.path().join("app.toml")
        }

        fn core_yaml(&self) -> String {
            fs::read_to_string(self.dir.path().join("config.yaml")).unwrap()
        }

        fn saved(&self) -> AppConfig {
            ConfigLoader::load_from_file(self.app_toml()).unwrap()
        }

        fn pid(&self, working_dir: &str) -> Option<u32> {
            PidFile::new(self.dir.path().join(working_dir).join("mihomo.pid")).read()
        }

        /// Another clashd process working on the same app.toml
        fn peer(&self) -> Supervisor {
            Supervisor::with_options(
                self.app_toml(),
                self.saved(),
                self.kernel.clone(),
                quick_options(Duration::from_millis(500)),
            )
        }
    }

    fn quick_options(readiness: Duration) -> SupervisorOptions {
        SupervisorOptions {
            readiness: ReadinessConfig {
                timeout: readiness,
                interval: Duration::from_millis(20),
            },
            device_wait: DeviceWait {
                attempts: 2,
                interval: Duration::from_millis(5),
            },
            stop_grace: Duration::from_secs(2),
        }
    }

    fn fixture(script: &str, tcp: RoutingMode, udp: RoutingMode) -> Fixture {
        fixture_with(script, RoutingConfig::new(tcp, udp), Duration::from_millis(500))
    }

    fn fixture_with(script: &str, routing: RoutingConfig, readiness: Duration) -> Fixture {
        let dir = TempDir::new().unwrap();
        let core = dir.path().join("mihomo");
        fs::write(&core, script).unwrap();
        fs::set_permissions(&core, fs::Permissions::from_mode(0o755)).unwrap();
        fs::write(dir.path().join("config.yaml"), "mixed-port: 7890\ntun:\n  enable: false\n").unwrap();

        let mut config = AppConfig::default();
        config.mihomo.core_path = core;
        config.mihomo.config_path = dir.path().join("config.yaml");
        config.mihomo.working_dir = dir.path().join("work");
        config.mihomo.log_file = Some(dir.path().join("logs/mihomo.log"));
        config.mihomo.auto_restart = true;
        config.mihomo.routing = routing;
        ConfigLoader::save(&config, dir.path().join("app.toml")).unwrap();

        let kernel = Arc::new(MemoryKernel::with_links(&["Meta"]));
        let supervisor = Arc::new(Supervisor::with_options(
            dir.path().join("app.toml"),
            config,
            kernel.clone(),
            quick_options(readiness),
        ));
        Fixture {
            dir,
            kernel,
            supervisor,
        }
    }

    async fn wait_for_status(supervisor: &Supervisor, want: ServiceStatus) -> bool {
        for _ in 0..100 {
            if supervisor.status() == want {
                return true;
            }
            sleep(Duration::from_millis(20)).await;
        }
        false
    }

    #[tokio::test]
    async fn test_start_stop_status() {
        let fx = fixture(SLEEPER, RoutingMode::Disable, RoutingMode::Disable);
        let sup = &fx.supervisor;

        assert_eq!(sup.status(), ServiceStatus::Stopped);
        sup.start().await.unwrap();
        assert_eq!(sup.status(), ServiceStatus::Running);
        assert_eq!(sup.lifecycle(), Lifecycle::Running);
        assert!(fx.dir.path().join("work/mihomo.pid").exists());
        assert!(fx.saved().mihomo.auto_start);

        sup.stop(true).await.unwrap();
        assert_eq!(sup.status(), ServiceStatus::Stopped);
        assert!(!fx.dir.path().join("work/mihomo.pid").exists());
        assert!(!fx.saved().mihomo.auto_start);
        assert_eq!(fx.kernel.mutations(), 0);
    }

    #[tokio::test]
    async fn test_stop_when_stopped() {
        let fx = fixture(SLEEPER, RoutingMode::Tproxy, RoutingMode::Tproxy);
        let err = fx.supervisor.stop(true).await.unwrap_err();
        assert!(matches!(err, ServiceError::NotRunning));
        assert_eq!(fx.kernel.mutations(), 0);
        assert_eq!(fx.supervisor.lifecycle(), Lifecycle::Stopped);
    }

    #[tokio::test]
    async fn test_external_kill_is_detected() {
        let fx = fixture(SLEEPER, RoutingMode::Disable, RoutingMode::Disable);
        let sup = &fx.supervisor;
        sup.start().await.unwrap();

        let pid = PidFile::new(fx.dir.path().join("work/mihomo.pid")).read().unwrap();
        pidfile::send_signal(pid, libc::SIGKILL).unwrap();

        assert!(wait_for_status(sup, ServiceStatus::Stopped).await);
        assert!(!fx.dir.path().join("work/mihomo.pid").exists());
        assert_eq!(sup.lifecycle(), Lifecycle::Stopped);
    }

    #[tokio::test]
    async fn test_tun_start_applies_only_tun() {
        let fx = fixture(SLEEPER, RoutingMode::Tun, RoutingMode::Tun);
        let sup = &fx.supervisor;
        sup.start().await.unwrap();

        assert_eq!(
            sup.installed_routing().unwrap(),
            InstalledEngines { tproxy: false, tun: true, redirect: false }
        );
        assert!(fx
            .kernel
            .routes()
            .iter()
            .any(|r| r.table == 200 && r.device == "Meta"));
        assert_eq!(
            fx.core_yaml(),
            "mixed-port: 7890\ntun:\n  enable: true\n  device: Meta\n"
        );

        sup.stop(false).await.unwrap();
        assert!(!sup.installed_routing().unwrap().any());
        assert!(fx.kernel.routes().is_empty());
        assert!(fx.saved().mihomo.auto_start);
    }

    #[tokio::test]
    async fn test_missing_device_times_out_and_rolls_back() {
        let mut routing = RoutingConfig::new(RoutingMode::Tun, RoutingMode::Tun);
        routing.tun_device = "Absent".to_string();
        let fx = fixture_with(SLEEPER, routing, Duration::from_millis(200));
        let sup = &fx.supervisor;

        let err = sup.start().await.unwrap_err();
        assert!(matches!(err, ServiceError::ReadinessTimeout { .. }), "{}", err);
        assert_eq!(sup.status(), ServiceStatus::Stopped);
        assert!(!fx.dir.path().join("work/mihomo.pid").exists());
        assert!(!fx.kernel.has_table(TableFamily::Ip, "clashd_tun"));
        assert!(!fx.saved().mihomo.auto_start);
    }

    #[tokio::test]
    async fn test_core_dying_during_startup() {
        let fx = fixture(CRASHER, RoutingMode::Tproxy, RoutingMode::Tproxy);
        let err = fx.supervisor.start().await.unwrap_err();
        assert!(matches!(err, ServiceError::ProcessDied { .. }), "{}", err);
        assert_eq!(fx.supervisor.status(), ServiceStatus::Stopped);
        assert_eq!(fx.kernel.mutations(), 0);
    }

    #[tokio::test]
    async fn test_setup_failure_kills_core() {
        let fx = fixture(SLEEPER, RoutingMode::Tproxy, RoutingMode::Disable);
        fx.kernel.fail_table("clashd_tproxy");

        let err = fx.supervisor.start().await.unwrap_err();
        assert!(matches!(err, ServiceError::Setup(_)), "{}", err);
        assert!(err.to_string().contains("tproxy"));
        assert_eq!(fx.supervisor.status(), ServiceStatus::Stopped);
        assert!(!fx.dir.path().join("work/mihomo.pid").exists());
    }

    #[tokio::test]
    async fn test_concurrent_stop_is_busy() {
        let mut routing = RoutingConfig::new(RoutingMode::Tun, RoutingMode::Tun);
        routing.tun_device = "Late".to_string();
        let fx = fixture_with(SLEEPER, routing, Duration::from_secs(5));

        let sup = fx.supervisor.clone();
        let starting = tokio::spawn(async move { sup.start().await });

        for _ in 0..100 {
            if fx.supervisor.lifecycle() == Lifecycle::Starting {
                break;
            }
            sleep(Duration::from_millis(5)).await;
        }
        assert!(matches!(
            fx.supervisor.stop(false).await,
            Err(ServiceError::Busy)
        ));
        assert!(matches!(fx.supervisor.restart().await, Err(ServiceError::Busy)));

        fx.kernel.add_link("Late");
        starting.await.unwrap().unwrap();
        assert_eq!(fx.supervisor.lifecycle(), Lifecycle::Running);
        fx.supervisor.stop(false).await.unwrap();
    }

    #[tokio::test]
    async fn test_restart_replaces_process() {
        let fx = fixture(SLEEPER, RoutingMode::Redirect, RoutingMode::Disable);
        let sup = &fx.supervisor;
        let pid_path = fx.dir.path().join("work/mihomo.pid");

        // restart from stopped just starts
        sup.restart().await.unwrap();
        let first = PidFile::new(&pid_path).read().unwrap();
        sup.restart().await.unwrap();
        let second = PidFile::new(&pid_path).read().unwrap();

        assert_ne!(first, second);
        assert!(!pidfile::is_alive(first));
        assert!(sup.installed_routing().unwrap().redirect);
        sup.stop(false).await.unwrap();
    }

    #[tokio::test]
    async fn test_restore_state() {
        let fx = fixture(SLEEPER, RoutingMode::Disable, RoutingMode::Disable);
        fx.supervisor.restore_state().await.unwrap();
        assert_eq!(fx.supervisor.status(), ServiceStatus::Stopped);

        let mut config = fx.supervisor.app_config();
        config.mihomo.auto_start = true;
        fx.supervisor.update_app_config(config).await.unwrap();

        fx.supervisor.restore_state().await.unwrap();
        assert_eq!(fx.supervisor.status(), ServiceStatus::Running);
        fx.supervisor.stop(false).await.unwrap();
    }

    #[tokio::test]
    async fn test_update_rejects_udp_redirect() {
        let fx = fixture(SLEEPER, RoutingMode::Disable, RoutingMode::Disable);
        let mut config = fx.supervisor.app_config();
        config.mihomo.routing.udp = RoutingMode::Redirect;

        assert!(matches!(
            fx.supervisor.update_app_config(config).await,
            Err(ServiceError::Validation(_))
        ));
        assert_eq!(fx.saved().mihomo.routing.udp, RoutingMode::Disable);
    }

    #[tokio::test]
    async fn test_logs_capture_core_output() {
        let fx = fixture(SLEEPER, RoutingMode::Disable, RoutingMode::Disable);
        let sup = &fx.supervisor;
        sup.start().await.unwrap();

        let mut lines = Vec::new();
        for _ in 0..50 {
            lines = sup.logs(10).unwrap();
            if !lines.is_empty() {
                break;
            }
            sleep(Duration::from_millis(20)).await;
        }
        assert_eq!(lines, vec!["core starting"]);

        sup.clear_logs().unwrap();
        assert!(sup.logs(10).unwrap().is_empty());
        sup.stop(false).await.unwrap();
    }

    #[tokio::test]
    async fn test_watchdog_restarts_dead_core() {
        let fx = fixture(SLEEPER, RoutingMode::Disable, RoutingMode::Disable);
        let sup = &fx.supervisor;
        sup.start().await.unwrap();
        assert!(!sup.check_health().await);

        let pid_path = fx.dir.path().join("work/mihomo.pid");
        let pid = PidFile::new(&pid_path).read().unwrap();
        pidfile::send_signal(pid, libc::SIGKILL).unwrap();
        // let the kernel deliver the signal
        sleep(Duration::from_millis(100)).await;

        assert!(sup.check_health().await);
        assert_eq!(sup.status(), ServiceStatus::Running);
        assert_ne!(PidFile::new(&pid_path).read(), Some(pid));
        sup.stop(false).await.unwrap();
    }

    #[tokio::test]
    async fn test_watchdog_after_status_saw_exit() {
        let fx = fixture(SLEEPER, RoutingMode::Disable, RoutingMode::Disable);
        let sup = &fx.supervisor;
        sup.start().await.unwrap();

        let pid = fx.pid("work").unwrap();
        pidfile::send_signal(pid, libc::SIGKILL).unwrap();
        assert!(wait_for_status(sup, ServiceStatus::Stopped).await);
        assert_eq!(sup.lifecycle(), Lifecycle::Stopped);

        assert!(sup.check_health().await);
        assert_eq!(sup.status(), ServiceStatus::Running);
        sup.stop(false).await.unwrap();
    }

    #[tokio::test]
    async fn test_watchdog_honours_restart_on_exit() {
        let fx = fixture(SLEEPER, RoutingMode::Disable, RoutingMode::Disable);
        let sup = &fx.supervisor;
        let mut config = sup.app_config();
        config.mihomo.restart_on_exit = false;
        sup.update_app_config(config).await.unwrap();
        sup.start().await.unwrap();

        pidfile::send_signal(fx.pid("work").unwrap(), libc::SIGKILL).unwrap();
        assert!(wait_for_status(sup, ServiceStatus::Stopped).await);

        assert!(!sup.check_health().await);
        assert_eq!(sup.status(), ServiceStatus::Stopped);
        assert!(!sup.check_health().await);
    }

    #[tokio::test]
    async fn test_stop_from_another_process_sticks() {
        let fx = fixture(SLEEPER, RoutingMode::Tproxy, RoutingMode::Disable);
        let daemon = &fx.supervisor;
        daemon.start().await.unwrap();

        let cli = fx.peer();
        cli.stop(true).await.unwrap();
        assert_eq!(cli.status(), ServiceStatus::Stopped);
        assert!(!fx.saved().mihomo.auto_start);
        assert!(!daemon.installed_routing().unwrap().any());

        assert!(!daemon.check_health().await);
        assert_eq!(daemon.status(), ServiceStatus::Stopped);
        assert_eq!(daemon.lifecycle(), Lifecycle::Stopped);
        assert!(!daemon.check_health().await);
        assert_eq!(fx.pid("work"), None);
    }

    #[tokio::test]
    async fn test_start_while_another_process_holds_lock() {
        let fx = fixture(SLEEPER, RoutingMode::Disable, RoutingMode::Disable);
        let held = LifecycleLock::try_acquire(&LifecycleLock::path_for(&fx.app_toml()))
            .unwrap()
            .unwrap();

        assert!(matches!(fx.supervisor.start().await, Err(ServiceError::Busy)));
        assert_eq!(fx.supervisor.lifecycle(), Lifecycle::Stopped);
        assert_eq!(fx.pid("work"), None);

        drop(held);
        fx.supervisor.start().await.unwrap();
        fx.supervisor.stop(false).await.unwrap();
    }

    #[tokio::test]
    async fn test_restart_survives_cleanup_failure() {
        let fx = fixture(SLEEPER, RoutingMode::Tproxy, RoutingMode::Disable);
        let sup = &fx.supervisor;
        sup.start().await.unwrap();
        let first = fx.pid("work").unwrap();

        fx.kernel.fail_teardown();
        sup.restart().await.unwrap();
        assert_eq!(sup.status(), ServiceStatus::Running);
        assert_eq!(sup.lifecycle(), Lifecycle::Running);
        assert_ne!(fx.pid("work"), Some(first));
        assert!(sup.installed_routing().unwrap().tproxy);

        sup.stop(false).await.unwrap();
        assert_eq!(sup.status(), ServiceStatus::Stopped);
        fx.kernel.clear_failures();
    }

    #[tokio::test]
    async fn test_core_config_rewrite_restarts() {
        let fx = fixture(SLEEPER, RoutingMode::Disable, RoutingMode::Disable);
        let sup = &fx.supervisor;
        sup.start().await.unwrap();
        let first = fx.pid("work").unwrap();

        assert!(sup.write_core_config("mixed-port: 7891\n").await.unwrap());
        assert!(fx.core_yaml().contains("mixed-port: 7891"));
        assert_eq!(sup.status(), ServiceStatus::Running);
        assert_ne!(fx.pid("work"), Some(first));
        assert!(!pidfile::is_alive(first));
        sup.stop(false).await.unwrap();
    }

    #[tokio::test]
    async fn test_core_config_rewrite_without_auto_restart() {
        let fx = fixture(SLEEPER, RoutingMode::Disable, RoutingMode::Disable);
        let sup = &fx.supervisor;
        let mut config = sup.app_config();
        config.mihomo.auto_restart = false;
        sup.update_app_config(config).await.unwrap();
        sup.start().await.unwrap();
        let first = fx.pid("work").unwrap();

        assert!(!sup.write_core_config("mixed-port: 7891\n").await.unwrap());
        assert_eq!(fx.core_yaml(), "mixed-port: 7891\n");
        assert_eq!(fx.pid("work"), Some(first));
        assert_eq!(sup.lifecycle(), Lifecycle::Running);
        sup.stop(false).await.unwrap();
    }

    #[tokio::test]
    async fn test_switch_core_config() {
        let fx = fixture(SLEEPER, RoutingMode::Disable, RoutingMode::Disable);
        let sup = &fx.supervisor;
        let other = fx.dir.path().join("other.yaml");
        fs::write(&other, "mixed-port: 7892\n").unwrap();

        let err = sup
            .switch_core_config(fx.dir.path().join("absent.yaml"))
            .await
            .unwrap_err();
        assert!(matches!(err, ServiceError::CoreConfigMissing { .. }), "{}", err);

        sup.start().await.unwrap();
        let first = fx.pid("work").unwrap();
        assert!(sup.switch_core_config(&other).await.unwrap());
        assert_eq!(sup.app_config().mihomo.config_path, other);
        assert_eq!(fx.saved().mihomo.config_path, other);
        assert_ne!(fx.pid("work"), Some(first));
        sup.stop(false).await.unwrap();
    }

    #[tokio::test]
    async fn test_update_restarts_from_old_working_dir() {
        let fx = fixture(SLEEPER, RoutingMode::Disable, RoutingMode::Disable);
        let sup = &fx.supervisor;
        sup.start().await.unwrap();
        let first = fx.pid("work").unwrap();

        let mut config = sup.app_config();
        config.mihomo.working_dir = fx.dir.path().join("work2");
        sup.update_app_config(config).await.unwrap();

        assert!(!pidfile::is_alive(first));
        assert_eq!(fx.pid("work"), None);
        assert!(fx.pid("work2").is_some());
        assert_eq!(sup.status(), ServiceStatus::Running);
        sup.stop(false).await.unwrap();
        assert_eq!(fx.pid("work2"), None);
    }

    #[tokio::test]
    async fn test_update_without_restart_keeps_tracking_core() {
        let fx = fixture(SLEEPER, RoutingMode::Disable, RoutingMode::Disable);
        let sup = &fx.supervisor;
        sup.start().await.unwrap();
        let first = fx.pid("work").unwrap();

        let mut config = sup.app_config();
        config.mihomo.auto_restart = false;
        config.mihomo.working_dir = fx.dir.path().join("work2");
        sup.update_app_config(config).await.unwrap();

        assert_eq!(sup.app_config().mihomo.working_dir, fx.dir.path().join("work2"));
        assert_eq!(fx.pid("work"), Some(first));
        assert_eq!(sup.status(), ServiceStatus::Running);

        sup.stop(false).await.unwrap();
        assert!(!pidfile::is_alive(first));
        assert_eq!(fx.pid("work"), None);
    }
}
