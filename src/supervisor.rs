use crate::config::{AppConfig, CaptureConfig};
use crate::engine::{self, WorkerLauncher, WorkerSpec};
use crate::error::StartError;
use crate::frame::{age_of, FrameStore, FrameVersion};
use crate::pipeline::PipelineParams;
use crate::quality::select_quality;
use crate::resolver::SourceResolver;
use crate::target::ChannelTarget;
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime};
use tokio::process::Child;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// 监控器运行参数
#[derive(Debug, Clone)]
pub struct SupervisorSettings {
    pub capture: CaptureConfig,
    pub stale_after: Duration,
    pub stop_timeout: Duration,
    pub restart_min_interval: Duration,
    pub restart_max_interval: Duration,
}

impl SupervisorSettings {
    pub fn from_config(config: &AppConfig) -> Self {
        let sup = &config.supervision;
        Self {
            capture: config.capture.clone(),
            stale_after: sup.stale_after(),
            stop_timeout: sup.stop_timeout(),
            restart_min_interval: Duration::from_secs(sup.restart_min_interval_secs),
            restart_max_interval: Duration::from_secs(sup.restart_max_interval_secs),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Phase {
    Idle,
    Starting,
    Running,
    Stale,
    Dead,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StartOutcome {
    /// 目标一致且进程存活，无需任何操作
    AlreadyRunning,
    /// 距离上次重启不足退避间隔
    Throttled,
    Started { quality: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealReason {
    /// 有目标但没有进程 (上次启动失败或尚未启动)
    Pending,
    Dead,
    Stale,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealOutcome {
    NoTarget,
    Healthy,
    /// 已有修复任务在执行或排队
    InFlight,
    Triggered(HealReason),
}

struct HealRequest {
    target: ChannelTarget,
    reason: HealReason,
}

/// 运行中的转码进程
struct WorkerHandle {
    child: Child,
    pid: Option<u32>,
    started_at: Instant,
    /// 与帧文件修改时间比较，判断是否已有本进程产出的帧
    started_wall: SystemTime,
    target: ChannelTarget,
    resolved_quality: String,
}

impl WorkerHandle {
    fn is_alive(&mut self) -> bool {
        match self.child.try_wait() {
            Ok(None) => true,
            Ok(Some(status)) => {
                debug!("Worker pid {:?} exited with {}", self.pid, status);
                false
            }
            Err(e) => {
                error!("Process monitor error [{:?}]: {}", self.pid, e);
                false
            }
        }
    }
}

/// 重启限流：同一目标两次重启间隔不小于当前退避间隔
///
/// 连续故障时间隔从 `min_interval` 开始翻倍，直至 `max_interval`；
/// 观察到进程健康后清零
#[derive(Debug)]
struct RestartBudget {
    last_restart_at: Option<Instant>,
    last_target: Option<ChannelTarget>,
    min_interval: Duration,
    max_interval: Duration,
    consecutive_failures: u32,
}

impl RestartBudget {
    fn new(min_interval: Duration, max_interval: Duration) -> Self {
        Self {
            last_restart_at: None,
            last_target: None,
            min_interval,
            max_interval: max_interval.max(min_interval),
            consecutive_failures: 0,
        }
    }

    fn interval(&self) -> Duration {
        let multiplier = 1u32
            .checked_shl(self.consecutive_failures)
            .unwrap_or(u32::MAX);
        self.min_interval
            .checked_mul(multiplier)
            .unwrap_or(self.max_interval)
            .min(self.max_interval)
    }

    /// 不同目标不受限流约束
    fn allows(&self, target: &ChannelTarget, now: Instant) -> bool {
        match (&self.last_restart_at, &self.last_target) {
            (Some(at), Some(last)) if last == target => now.duration_since(*at) >= self.interval(),
            _ => true,
        }
    }

    fn record(&mut self, target: &ChannelTarget, now: Instant) {
        if self.last_target.as_ref() != Some(target) {
            self.consecutive_failures = 0;
        }
        self.last_restart_at = Some(now);
        self.last_target = Some(target.clone());
    }

    fn record_failure(&mut self) {
        self.consecutive_failures = self.consecutive_failures.saturating_add(1);
    }

    fn record_healthy(&mut self) {
        if self.consecutive_failures > 0 {
            debug!("Worker healthy again, resetting restart backoff");
        }
        self.consecutive_failures = 0;
    }
}

struct Inner {
    worker: Option<WorkerHandle>,
    /// 期望播放的目标；启动失败时保留，供后续重试
    target: Option<ChannelTarget>,
    budget: RestartBudget,
    restarts: u64,
    last_error: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SupervisorStatus {
    pub phase: Phase,
    pub target: Option<ChannelTarget>,
    /// 有目标但没有运行中的进程，等待重试
    pub pending: bool,
    pub resolved_quality: Option<String>,
    pub pid: Option<u32>,
    pub alive: bool,
    pub stale: bool,
    pub uptime_secs: Option<u64>,
    pub frame_age_secs: Option<u64>,
    pub version: Option<FrameVersion>,
    pub restarts: u64,
    pub consecutive_failures: u32,
    pub last_error: Option<String>,
}

impl SupervisorStatus {
    fn empty() -> Self {
        Self {
            phase: Phase::Idle,
            target: None,
            pending: false,
            resolved_quality: None,
            pid: None,
            alive: false,
            stale: false,
            uptime_secs: None,
            frame_age_secs: None,
            version: None,
            restarts: 0,
            consecutive_failures: 0,
            last_error: None,
        }
    }
}

/// 转码进程监控器
///
/// 任意时刻最多只有一个转码进程。启动、停止、目标比较与限流检查
/// 都在同一把锁内完成；请求处理路径只通过 [`Supervisor::heal`]
/// 把修复请求投递给单独的后台任务，不会阻塞在进程启动或网络解析上
pub struct Supervisor {
    inner: Mutex<Inner>,
    settings: SupervisorSettings,
    resolver: Arc<dyn SourceResolver>,
    launcher: Arc<dyn WorkerLauncher>,
    frames: Arc<FrameStore>,
    heal_tx: mpsc::Sender<HealRequest>,
    heal_rx: parking_lot::Mutex<Option<mpsc::Receiver<HealRequest>>>,
    heal_pending: AtomicBool,
    last_status: parking_lot::Mutex<Option<SupervisorStatus>>,
}

impl Supervisor {
    pub fn new(
        settings: SupervisorSettings,
        resolver: Arc<dyn SourceResolver>,
        launcher: Arc<dyn WorkerLauncher>,
        frames: Arc<FrameStore>,
    ) -> Self {
        // 深度为 1：重复的修复信号在此合并
        let (heal_tx, heal_rx) = mpsc::channel(1);
        Self {
            inner: Mutex::new(Inner {
                worker: None,
                target: None,
                budget: RestartBudget::new(
                    settings.restart_min_interval,
                    settings.restart_max_interval,
                ),
                restarts: 0,
                last_error: None,
            }),
            settings,
            resolver,
            launcher,
            frames,
            heal_tx,
            heal_rx: parking_lot::Mutex::new(Some(heal_rx)),
            heal_pending: AtomicBool::new(false),
            last_status: parking_lot::Mutex::new(None),
        }
    }

    /// 启动目标 (幂等)
    ///
    /// 目标一致且进程存活时直接返回；同一目标处于限流窗口内时也直接返回。
    /// 解析或启动失败时目标仍被保留，之后的调用会重试
    pub async fn start(&self, target: ChannelTarget) -> Result<StartOutcome, StartError> {
        self.ensure(target, false).await
    }

    /// 与 `start` 相同，但进程存活也会重启 (用于画面卡死)。仍受限流约束
    pub async fn restart(&self, target: ChannelTarget) -> Result<StartOutcome, StartError> {
        self.ensure(target, true).await
    }

    async fn ensure(&self, target: ChannelTarget, force: bool) -> Result<StartOutcome, StartError> {
        let mut inner = self.inner.lock().await;
        let now = Instant::now();

        let mut worker_failed = false;
        if let Some(worker) = inner.worker.as_mut() {
            if worker.target == target {
                let alive = worker.is_alive();
                if alive && !force {
                    return Ok(StartOutcome::AlreadyRunning);
                }
                worker_failed = true;
            }
        }

        if !inner.budget.allows(&target, now) {
            debug!(
                "Restart for [{}] throttled (interval {:?})",
                target,
                inner.budget.interval()
            );
            return Ok(StartOutcome::Throttled);
        }

        // 同一输出路径上绝不能同时存在两个进程：先停旧的
        if let Some(worker) = inner.worker.take() {
            self.stop_worker(worker).await;
        }

        let switching = inner.target.as_ref() != Some(&target);
        if switching {
            info!("Switching target to [{}]", target);
            self.frames.reset().await;
        }

        inner.target = Some(target.clone());
        inner.budget.record(&target, now);
        if worker_failed {
            inner.budget.record_failure();
        }
        inner.restarts += 1;
        // 启动期间持有锁，状态查询返回这份快照
        let snapshot = Self::snapshot(&mut inner, self.settings.stale_after, None, None);
        *self.last_status.lock() = Some(snapshot);

        match self.launch(&target).await {
            Ok((child, quality)) => {
                let pid = child.id();
                info!(
                    "Worker for [{}] running (pid {:?}, quality {})",
                    target, pid, quality
                );
                inner.worker = Some(WorkerHandle {
                    child,
                    pid,
                    started_at: Instant::now(),
                    started_wall: SystemTime::now(),
                    target,
                    resolved_quality: quality.clone(),
                });
                inner.last_error = None;
                Ok(StartOutcome::Started { quality })
            }
            Err(e) => {
                error!("Failed to start [{}]: {}", target, e);
                inner.budget.record_failure();
                inner.last_error = Some(e.to_string());
                Err(e)
            }
        }
    }

    async fn launch(&self, target: &ChannelTarget) -> Result<(Child, String), StartError> {
        engine::ensure_memory()?;

        let available = self.resolver.qualities(&target.channel).await?;
        let quality = select_quality(&available, &target.quality)
            .ok_or_else(|| StartError::NoUsableQuality(target.channel.clone()))?;
        if !quality.eq_ignore_ascii_case(&target.quality) {
            info!(
                "Quality {} unavailable for {}, using {} (offered: {:?})",
                target.quality, target.channel, quality, available
            );
        }
        let url = self.resolver.playable_url(&target.channel, &quality).await?;

        let params = PipelineParams::new(target, &self.settings.capture);
        let spec = WorkerSpec {
            input_url: url,
            filter_graph: params.filter_graph(),
            jpeg_qscale: params.jpeg_qscale,
            output: self.frames.path().to_path_buf(),
        };
        debug!("Worker filter graph: {}", spec.filter_graph);

        let child = self.launcher.launch(&spec)?;
        Ok((child, quality))
    }

    async fn stop_worker(&self, mut worker: WorkerHandle) {
        match engine::terminate(&mut worker.child, self.settings.stop_timeout).await {
            Ok(status) => info!(
                "Worker for [{}] (pid {:?}) stopped: {}",
                worker.target, worker.pid, status
            ),
            Err(e) => error!("Failed to stop worker pid {:?}: {}", worker.pid, e),
        }
    }

    /// 停止当前进程并清除目标；没有进程时为空操作
    pub async fn stop(&self) {
        let mut inner = self.inner.lock().await;
        if let Some(worker) = inner.worker.take() {
            self.stop_worker(worker).await;
        }
        if inner.target.take().is_some() {
            info!("Supervisor idle");
        }
    }

    /// 当前跟踪的目标；锁被占用 (正在启动) 时返回 `None`
    pub fn current_target(&self) -> Option<ChannelTarget> {
        self.inner.try_lock().ok().and_then(|inner| inner.target.clone())
    }

    /// 对当前跟踪的目标执行 [`Supervisor::heal`]
    pub async fn heal_current(&self) -> HealOutcome {
        match self.current_target() {
            Some(target) => self.heal(&target).await,
            None => HealOutcome::NoTarget,
        }
    }

    /// 非阻塞修复
    ///
    /// 进程已退出、输出过期或尚未运行时，把启动请求投递给后台任务后立即返回。
    /// 全局同一时刻最多只有一个修复在途，并发触发会被合并。
    /// `target` 即当前跟踪的目标，运行中的进程总是为它启动的
    async fn heal(&self, target: &ChannelTarget) -> HealOutcome {
        if self
            .heal_pending
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return HealOutcome::InFlight;
        }

        let Some(reason) = self.diagnose(target).await else {
            self.heal_pending.store(false, Ordering::Release);
            return HealOutcome::Healthy;
        };

        let request = HealRequest {
            target: target.clone(),
            reason,
        };
        match self.heal_tx.try_send(request) {
            Ok(()) => {
                debug!("Heal triggered for [{}]: {:?}", target, reason);
                HealOutcome::Triggered(reason)
            }
            Err(_) => {
                self.heal_pending.store(false, Ordering::Release);
                HealOutcome::InFlight
            }
        }
    }

    async fn diagnose(&self, target: &ChannelTarget) -> Option<HealReason> {
        let (started_at, started_wall) = {
            // 锁被占用说明正在启动，不需要再修复
            let mut inner = self.inner.try_lock().ok()?;
            let worker = match inner.worker.as_mut() {
                Some(worker) => worker,
                None => return Some(HealReason::Pending),
            };
            if !worker.is_alive() {
                warn!("Worker for [{}] exited unexpectedly", target);
                return Some(HealReason::Dead);
            }
            (worker.started_at, worker.started_wall)
        };

        let window = stale_window(self.settings.stale_after, target.fps);
        // 新启动的进程有一个阈值窗口用来产出第一帧
        if started_at.elapsed() > window && self.frames.is_stale(window).await {
            warn!("Worker for [{}] produced no frame for {:?}", target, window);
            return Some(HealReason::Stale);
        }

        // 只有看到本进程写出的帧才算恢复，宽限期内不清零退避
        let fresh = self
            .frames
            .modified()
            .await
            .is_some_and(|modified| modified > started_wall);
        if fresh {
            if let Ok(mut inner) = self.inner.try_lock() {
                inner.budget.record_healthy();
            }
        }
        None
    }

    /// 启动后台修复任务；只能调用一次
    pub fn spawn_heal_worker(self: &Arc<Self>, shutdown: CancellationToken) -> Option<JoinHandle<()>> {
        let mut rx = self.heal_rx.lock().take()?;
        let this = Arc::clone(self);

        Some(tokio::spawn(async move {
            loop {
                let request = tokio::select! {
                    _ = shutdown.cancelled() => break,
                    request = rx.recv() => match request {
                        Some(request) => request,
                        None => break,
                    },
                };

                let result = match request.reason {
                    HealReason::Stale => this.restart(request.target).await,
                    _ => this.start(request.target).await,
                };
                match result {
                    Ok(outcome) => debug!("Heal finished: {:?}", outcome),
                    Err(e) => warn!("Heal attempt failed, will retry later: {}", e),
                }
                this.heal_pending.store(false, Ordering::Release);
            }
            debug!("Heal worker exited");
        }))
    }

    pub async fn status(&self) -> SupervisorStatus {
        let frame_modified = self.frames.modified().await;
        let version = self.frames.version().await;

        let Ok(mut inner) = self.inner.try_lock() else {
            // 正在启动：沿用启动前的快照，只刷新帧文件信息
            let mut status = self
                .last_status
                .lock()
                .clone()
                .unwrap_or_else(SupervisorStatus::empty);
            status.phase = Phase::Starting;
            status.frame_age_secs = frame_modified.map(|m| age_of(m).as_secs());
            status.version = version;
            return status;
        };

        let status = Self::snapshot(&mut inner, self.settings.stale_after, frame_modified, version);
        *self.last_status.lock() = Some(status.clone());
        status
    }

    fn snapshot(
        inner: &mut Inner,
        stale_after: Duration,
        frame_modified: Option<SystemTime>,
        version: Option<FrameVersion>,
    ) -> SupervisorStatus {
        let (phase, alive, stale, pid, quality, uptime) = match inner.worker.as_mut() {
            Some(worker) => {
                let alive = worker.is_alive();
                let window = stale_window(stale_after, worker.target.fps);
                let stale = worker.started_at.elapsed() > window
                    && frame_modified.map_or(true, |m| age_of(m) > window);
                let phase = match (alive, stale) {
                    (false, _) => Phase::Dead,
                    (true, true) => Phase::Stale,
                    (true, false) => Phase::Running,
                };
                (
                    phase,
                    alive,
                    stale,
                    worker.pid,
                    Some(worker.resolved_quality.clone()),
                    Some(worker.started_at.elapsed().as_secs()),
                )
            }
            None => (Phase::Idle, false, false, None, None, None),
        };

        SupervisorStatus {
            phase,
            pending: inner.worker.is_none() && inner.target.is_some(),
            target: inner.target.clone(),
            resolved_quality: quality,
            pid,
            alive,
            stale,
            uptime_secs: uptime,
            frame_age_secs: frame_modified.map(|m| age_of(m).as_secs()),
            version,
            restarts: inner.restarts,
            consecutive_failures: inner.budget.consecutive_failures,
            last_error: inner.last_error.clone(),
        }
    }
}

/// 卡死判定窗口：低帧率目标两帧之间的间隔可能超过固定阈值，
/// 窗口至少覆盖两个帧周期
pub fn stale_window(stale_after: Duration, fps: f32) -> Duration {
    if !(fps > 0.0) {
        return stale_after;
    }
    let two_frames = Duration::try_from_secs_f32(2.0 / fps).unwrap_or(Duration::MAX);
    stale_after.max(two_frames)
}
