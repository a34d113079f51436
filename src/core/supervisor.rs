use crate::config::toml_config::SupervisorSettings;
use crate::core::probe::Prober;
use crate::domain::model::{RestartPolicy, ServiceSpec, ServiceState};
use crate::utils::error::{BootstrapError, Result, ServiceStartError};
use nix::sys::signal::{killpg, Signal};
use nix::unistd::Pid;
use std::collections::{HashMap, HashSet};
use std::process::Stdio;
use std::time::Duration;
use tokio::process::{Child, Command};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinSet;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// 等待 process group 清空時的輪詢間隔
const GROUP_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// 供觀察與測試使用的監管事件
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SupervisorEvent {
    StateChanged {
        service: String,
        from: ServiceState,
        to: ServiceState,
    },
    RestartScheduled {
        service: String,
        attempt: u32,
        delay: Duration,
    },
}

/// 依相依關係啟動服務，並持續監管直到關機
pub struct ServiceSupervisor {
    specs: Vec<ServiceSpec>,
    layers: Vec<Vec<String>>,
    settings: SupervisorSettings,
    events: Option<mpsc::UnboundedSender<SupervisorEvent>>,
    prober: Prober,
}

impl ServiceSupervisor {
    /// 驗證服務圖並計算拓撲分層
    pub fn new(specs: Vec<ServiceSpec>, settings: SupervisorSettings) -> Result<Self> {
        let layers = validate_graph(&specs)?;
        Ok(Self {
            specs,
            layers,
            settings,
            events: None,
            prober: Prober::new(),
        })
    }

    pub fn with_events(mut self, events: mpsc::UnboundedSender<SupervisorEvent>) -> Self {
        self.events = Some(events);
        self
    }

    /// 每一層的服務只依賴前面各層
    pub fn layers(&self) -> &[Vec<String>] {
        &self.layers
    }

    /// 啟動所有服務；所有 mandatory 服務就緒後回傳
    ///
    /// 發生致命錯誤或收到關機訊號時，會先依反向順序停止已啟動的服務再回傳錯誤。
    pub async fn launch(self, shutdown: &CancellationToken) -> Result<SupervisorHandle> {
        let stop = shutdown.child_token();
        let (fatal_tx, fatal_rx) = mpsc::unbounded_channel();

        let mut senders = HashMap::new();
        let mut receivers = HashMap::new();
        let mut settled = HashMap::new();
        for spec in &self.specs {
            let (tx, rx) = watch::channel(ServiceState::NotStarted);
            let (settled_tx, settled_rx) = watch::channel(false);
            senders.insert(spec.name.clone(), (tx, settled_tx));
            receivers.insert(spec.name.clone(), rx);
            settled.insert(spec.name.clone(), settled_rx);
        }

        tracing::info!(
            "🚀 Launching {} services in {} layers",
            self.specs.len(),
            self.layers.len()
        );

        let mut tasks = JoinSet::new();
        for spec in &self.specs {
            let Some((state_tx, settled_tx)) = senders.remove(&spec.name) else {
                continue;
            };
            let dependencies = spec
                .depends_on
                .iter()
                .filter_map(|dep| receivers.get(dep).map(|rx| (dep.clone(), rx.clone())))
                .collect();
            let dependents = self
                .specs
                .iter()
                .filter(|other| other.depends_on.contains(&spec.name))
                .filter_map(|other| receivers.get(&other.name).cloned())
                .collect();

            let runner = ServiceRunner {
                spec: spec.clone(),
                settings: self.settings.clone(),
                prober: self.prober.clone(),
                events: self.events.clone(),
                state_tx,
                settled_tx,
                dependencies,
                dependents,
                stop: stop.clone(),
                fatal_tx: fatal_tx.clone(),
            };
            tasks.spawn(runner.run());
        }

        let mut handle = SupervisorHandle {
            order: self.specs.iter().map(|s| s.name.clone()).collect(),
            states: receivers,
            stop,
            fatal_rx,
            tasks,
        };

        let mandatory: Vec<String> = self
            .specs
            .iter()
            .filter(|s| s.mandatory)
            .map(|s| s.name.clone())
            .collect();

        let mut mandatory_states: Vec<(String, watch::Receiver<ServiceState>, watch::Receiver<bool>)> =
            mandatory
                .iter()
                .filter_map(|name| {
                    let state = handle.states.get(name)?.clone();
                    let settled = settled.get(name)?.clone();
                    Some((name.clone(), state, settled))
                })
                .collect();
        let all_mandatory_up = async {
            for (name, state, settled) in &mut mandatory_states {
                if !wait_until_up(state, settled).await {
                    return Err(name.clone());
                }
            }
            Ok(())
        };

        let mut outcome = tokio::select! {
            biased;
            Some(err) = handle.fatal_rx.recv() => Err(BootstrapError::Service(err)),
            _ = shutdown.cancelled() => Err(BootstrapError::Interrupted),
            up = all_mandatory_up => up.map_err(|service| {
                BootstrapError::Service(ServiceStartError::EndedBeforeReady { service })
            }),
        };

        // 服務結束前送出的致命錯誤比 EndedBeforeReady 更具體
        if matches!(
            outcome,
            Err(BootstrapError::Service(ServiceStartError::EndedBeforeReady { .. }))
        ) {
            if let Ok(err) = handle.fatal_rx.try_recv() {
                outcome = Err(BootstrapError::Service(err));
            }
        }

        match outcome {
            Ok(()) => {
                tracing::info!("✅ All mandatory services ready: {:?}", mandatory);
                Ok(handle)
            }
            Err(e) => {
                tracing::error!("❌ Launch aborted: {}", e);
                handle.shutdown().await;
                Err(e)
            }
        }
    }
}

/// 已啟動的服務群組
pub struct SupervisorHandle {
    order: Vec<String>,
    states: HashMap<String, watch::Receiver<ServiceState>>,
    stop: CancellationToken,
    fatal_rx: mpsc::UnboundedReceiver<ServiceStartError>,
    tasks: JoinSet<()>,
}

impl SupervisorHandle {
    pub fn state(&self, service: &str) -> Option<ServiceState> {
        self.states.get(service).map(|rx| *rx.borrow())
    }

    /// 依宣告順序列出所有服務的目前狀態
    pub fn states(&self) -> Vec<(String, ServiceState)> {
        self.order
            .iter()
            .filter_map(|name| self.state(name).map(|state| (name.clone(), state)))
            .collect()
    }

    /// 持續監管，直到第一個致命錯誤或關機
    pub async fn monitor(&mut self) -> std::result::Result<(), ServiceStartError> {
        tokio::select! {
            Some(err) = self.fatal_rx.recv() => Err(err),
            _ = self.stop.cancelled() => Ok(()),
        }
    }

    /// 依相依順序的反向停止所有服務
    pub async fn shutdown(mut self) {
        tracing::info!("🛑 Stopping services");
        self.stop.cancel();

        while let Some(joined) = self.tasks.join_next().await {
            if let Err(e) = joined {
                tracing::error!("❌ Service task panicked: {}", e);
            }
        }
        tracing::info!("✅ All services stopped");
    }
}

enum Readiness {
    Ready,
    TimedOut,
    Exited(bool),
    Stopped,
}

enum Lifetime {
    Exited(bool),
    Stopped,
}

/// 單一服務的監管迴圈，狀態只由這裡修改
struct ServiceRunner {
    spec: ServiceSpec,
    settings: SupervisorSettings,
    prober: Prober,
    events: Option<mpsc::UnboundedSender<SupervisorEvent>>,
    state_tx: watch::Sender<ServiceState>,
    /// 成功結束且不會再重啟時設為 `true`
    settled_tx: watch::Sender<bool>,
    dependencies: Vec<(String, watch::Receiver<ServiceState>)>,
    dependents: Vec<watch::Receiver<ServiceState>>,
    stop: CancellationToken,
    fatal_tx: mpsc::UnboundedSender<ServiceStartError>,
}

impl ServiceRunner {
    async fn run(mut self) {
        if !self.wait_for_dependencies().await {
            return;
        }

        let mut restarts = 0u32;
        let mut ever_ready = false;
        loop {
            self.set_state(ServiceState::Starting);
            tracing::info!(
                "🚀 Starting {}: {} {}",
                self.spec.name,
                self.spec.command,
                self.spec.args.join(" ")
            );

            let mut child = match self.spawn() {
                Ok(child) => child,
                Err(e) => {
                    tracing::error!("❌ {} failed to spawn: {}", self.spec.name, e);
                    if self.spec.mandatory {
                        self.fatal(ServiceStartError::Spawn {
                            service: self.spec.name.clone(),
                            message: e.to_string(),
                        });
                    }
                    self.set_state(ServiceState::Crashed);
                    return;
                }
            };
            let group = child
                .id()
                .and_then(|pid| i32::try_from(pid).ok())
                .map(Pid::from_raw);

            let lifetime = match self.await_ready(&mut child).await {
                Readiness::Ready => {
                    ever_ready = true;
                    self.set_state(ServiceState::Ready);
                    self.watch_liveness(&mut child).await
                }
                Readiness::TimedOut if self.spec.mandatory => {
                    let timeout = self.spec.readiness.timeout();
                    tracing::error!("❌ {} not ready within {:?}", self.spec.name, timeout);
                    self.terminate(&mut child, group).await;
                    self.fatal(ServiceStartError::ReadinessTimeout {
                        service: self.spec.name.clone(),
                        timeout,
                    });
                    self.set_state(ServiceState::Crashed);
                    return;
                }
                Readiness::TimedOut => {
                    tracing::warn!("⚠️ {} not ready in time, restarting it", self.spec.name);
                    self.set_state(ServiceState::Degraded);
                    self.terminate(&mut child, group).await;
                    Lifetime::Exited(false)
                }
                Readiness::Exited(success) => Lifetime::Exited(success),
                Readiness::Stopped => Lifetime::Stopped,
            };

            let success = match lifetime {
                Lifetime::Stopped => {
                    self.wait_for_dependents().await;
                    self.terminate(&mut child, group).await;
                    self.set_state(ServiceState::Exited);
                    return;
                }
                Lifetime::Exited(success) => success,
            };

            let restart = match self.spec.restart {
                RestartPolicy::Never => false,
                RestartPolicy::OnFailure => !success,
                RestartPolicy::Always => true,
            };

            if !restart {
                if !success && self.spec.mandatory {
                    self.fatal(ServiceStartError::CrashLoop {
                        service: self.spec.name.clone(),
                        restarts,
                    });
                }
                self.set_state(ServiceState::Exited);
                if success {
                    self.settled_tx.send_replace(true);
                }
                return;
            }

            // mandatory 服務在第一次 ready 之前的重啟，不論策略都受 max_restarts 限制
            let budgeted =
                self.spec.restart == RestartPolicy::OnFailure || (self.spec.mandatory && !ever_ready);
            if budgeted && restarts >= self.spec.max_restarts {
                tracing::error!(
                    "💥 {} crashed after {} restarts, giving up",
                    self.spec.name,
                    restarts
                );
                if self.spec.mandatory {
                    self.fatal(ServiceStartError::CrashLoop {
                        service: self.spec.name.clone(),
                        restarts,
                    });
                }
                self.set_state(ServiceState::Crashed);
                return;
            }

            self.set_state(ServiceState::Exited);
            let delay = self.settings.restart_backoff.delay(restarts);
            restarts += 1;
            tracing::warn!(
                "🔁 Restarting {} in {:?} (attempt {})",
                self.spec.name,
                delay,
                restarts
            );
            self.emit(SupervisorEvent::RestartScheduled {
                service: self.spec.name.clone(),
                attempt: restarts,
                delay,
            });

            tokio::select! {
                _ = self.stop.cancelled() => return,
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }

    fn spawn(&self) -> std::io::Result<Child> {
        let mut command = Command::new(&self.spec.command);
        command
            .args(&self.spec.args)
            .envs(&self.spec.env)
            .stdin(Stdio::null())
            .process_group(0)
            .kill_on_drop(true);
        if let Some(dir) = &self.spec.working_dir {
            command.current_dir(dir);
        }
        command.spawn()
    }

    /// 所有相依服務都 ready 才回傳 `true`；途中關機則回傳 `false`
    async fn wait_for_dependencies(&mut self) -> bool {
        loop {
            for (name, rx) in &mut self.dependencies {
                if *rx.borrow() != ServiceState::Ready {
                    tracing::debug!("⏳ {} waiting for {}", self.spec.name, name);
                }
                tokio::select! {
                    _ = self.stop.cancelled() => return false,
                    ready = wait_until_ready(rx) => {
                        if !ready {
                            return false;
                        }
                    }
                }
            }

            if self
                .dependencies
                .iter()
                .all(|(_, rx)| *rx.borrow() == ServiceState::Ready)
            {
                return true;
            }
        }
    }

    async fn wait_for_dependents(&mut self) {
        for rx in &mut self.dependents {
            let _ = rx.wait_for(|s| s.is_stopped()).await;
        }
    }

    async fn await_ready(&self, child: &mut Child) -> Readiness {
        let probe = &self.spec.readiness;
        let deadline = Instant::now() + probe.timeout();

        loop {
            if self.prober.check(&probe.check).await {
                return Readiness::Ready;
            }
            if Instant::now() >= deadline {
                return Readiness::TimedOut;
            }

            let next = (Instant::now() + probe.interval()).min(deadline);
            tokio::select! {
                _ = self.stop.cancelled() => return Readiness::Stopped,
                status = child.wait() => return Readiness::Exited(exited_cleanly(&self.spec.name, status)),
                _ = tokio::time::sleep_until(next) => {}
            }
        }
    }

    /// ready 之後的存活探測：失敗 → degraded，恢復 → ready
    async fn watch_liveness(&self, child: &mut Child) -> Lifetime {
        let probe = &self.spec.readiness;

        loop {
            tokio::select! {
                _ = self.stop.cancelled() => return Lifetime::Stopped,
                status = child.wait() => return Lifetime::Exited(exited_cleanly(&self.spec.name, status)),
                _ = tokio::time::sleep(probe.interval()) => {
                    let healthy = self.prober.check(&probe.check).await;
                    let current = *self.state_tx.borrow();
                    match (current, healthy) {
                        (ServiceState::Ready, false) => {
                            tracing::warn!("⚠️ {} failed its liveness probe", self.spec.name);
                            self.set_state(ServiceState::Degraded);
                        }
                        (ServiceState::Degraded, true) => {
                            tracing::info!("💚 {} recovered", self.spec.name);
                            self.set_state(ServiceState::Ready);
                        }
                        _ => {}
                    }
                }
            }
        }
    }

    /// 對整個 process group 送 SIGTERM，寬限期後 SIGKILL
    async fn terminate(&self, child: &mut Child, group: Option<Pid>) {
        let grace = self.settings.shutdown_grace;
        let deadline = Instant::now() + grace;

        if let Some(group) = group {
            tracing::debug!("📨 SIGTERM → {} (process group {})", self.spec.name, group);
            if killpg(group, Signal::SIGTERM).is_ok() {
                let _ = tokio::time::timeout_at(deadline, child.wait()).await;

                // 直接子程序結束後，同組的其他程序可能還在
                while group_alive(group) && Instant::now() < deadline {
                    tokio::time::sleep(GROUP_POLL_INTERVAL).await;
                }
                if !group_alive(group) {
                    return;
                }

                tracing::warn!(
                    "⚠️ {} ignored SIGTERM for {:?}, sending SIGKILL",
                    self.spec.name,
                    grace
                );
                if let Err(e) = killpg(group, Signal::SIGKILL) {
                    tracing::debug!("{} killpg: {}", self.spec.name, e);
                }
            }
        }

        if let Err(e) = child.kill().await {
            tracing::debug!("{} kill: {}", self.spec.name, e);
        }
    }

    fn set_state(&self, next: ServiceState) {
        let current = *self.state_tx.borrow();
        if current == next {
            return;
        }
        tracing::debug!("🔄 {}: {} → {}", self.spec.name, current, next);

        // 先送事件再更新 watch，事件順序與相依服務觀察到的順序一致
        self.emit(SupervisorEvent::StateChanged {
            service: self.spec.name.clone(),
            from: current,
            to: next,
        });
        self.state_tx.send_replace(next);
    }

    fn emit(&self, event: SupervisorEvent) {
        if let Some(events) = &self.events {
            let _ = events.send(event);
        }
    }

    fn fatal(&self, err: ServiceStartError) {
        let _ = self.fatal_tx.send(err);
    }
}

/// ready (或其後的 degraded)，或已成功結束不再重啟
///
/// 服務 task 在兩者都未發生前就結束時回傳 `false`。
async fn wait_until_up(
    state: &mut watch::Receiver<ServiceState>,
    settled: &mut watch::Receiver<bool>,
) -> bool {
    let ready = async {
        state
            .wait_for(|s| matches!(s, ServiceState::Ready | ServiceState::Degraded))
            .await
            .is_ok()
    };
    let finished = async { settled.wait_for(|done| *done).await.is_ok() };

    tokio::select! {
        true = ready => true,
        true = finished => true,
        else => false,
    }
}

fn group_alive(group: Pid) -> bool {
    killpg(group, None).is_ok()
}

/// 相依服務的 task 結束 (sender 被丟棄) 時回傳 `false`
async fn wait_until_ready(rx: &mut watch::Receiver<ServiceState>) -> bool {
    rx.wait_for(|s| *s == ServiceState::Ready).await.is_ok()
}

fn exited_cleanly(name: &str, status: std::io::Result<std::process::ExitStatus>) -> bool {
    match status {
        Ok(status) => {
            if status.success() {
                tracing::info!("⏹️ {} exited", name);
            } else {
                tracing::warn!("💥 {} exited with {}", name, status);
            }
            status.success()
        }
        Err(e) => {
            tracing::error!("❌ Failed to wait for {}: {}", name, e);
            false
        }
    }
}

/// 檢查重複名稱、未知相依、循環，以及依賴非 mandatory 服務的 mandatory 服務
fn validate_graph(specs: &[ServiceSpec]) -> Result<Vec<Vec<String>>> {
    let mut by_name: HashMap<&str, &ServiceSpec> = HashMap::new();
    for spec in specs {
        if by_name.insert(spec.name.as_str(), spec).is_some() {
            return Err(BootstrapError::config(
                "services",
                format!("service '{}' is declared more than once", spec.name),
            ));
        }
    }

    for spec in specs {
        for dep in &spec.depends_on {
            let Some(dependency) = by_name.get(dep.as_str()) else {
                return Err(BootstrapError::config(
                    "services",
                    format!("service '{}' depends on unknown service '{}'", spec.name, dep),
                ));
            };
            if spec.mandatory && !dependency.mandatory {
                return Err(BootstrapError::config(
                    "services",
                    format!(
                        "mandatory service '{}' depends on non-mandatory service '{}'",
                        spec.name, dep
                    ),
                ));
            }
        }
    }

    // Kahn 分層
    let mut placed: HashSet<&str> = HashSet::new();
    let mut layers = Vec::new();
    while placed.len() < specs.len() {
        let layer: Vec<String> = specs
            .iter()
            .filter(|s| !placed.contains(s.name.as_str()))
            .filter(|s| s.depends_on.iter().all(|d| placed.contains(d.as_str())))
            .map(|s| s.name.clone())
            .collect();

        if layer.is_empty() {
            let cycle: Vec<&str> = specs
                .iter()
                .map(|s| s.name.as_str())
                .filter(|name| !placed.contains(name))
                .collect();
            return Err(BootstrapError::config(
                "services",
                format!("dependency cycle involving: {}", cycle.join(", ")),
            ));
        }

        for name in &layer {
            if let Some(spec) = by_name.get(name.as_str()) {
                placed.insert(spec.name.as_str());
            }
        }
        layers.push(layer);
    }

    Ok(layers)
}
