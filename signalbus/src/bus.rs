//! 命令入口（SignalBus）
//!
//! 面向运维与应用的操作集合：
//! - `signals`：列出已注册的信号；
//! - `pending`：各信号的待发送行数及合计；
//! - `flush` / `flush_many` / `flush_ordered`：对全部或指定信号刷新；
//! - `begin` / `atomic`：挂载自动刷新钩子的工作单元；
//! - `start`：周期刷新任务，返回可关闭/等待的 `FlushHandle`。
//!
//! 指定的信号名在执行任何刷新之前统一校验。
//!
use crate::autoflush::{self, AutoFlushHook, CommitReport, PostCommitHook, UnitOfWork};
use crate::error::{FlushError, SignalBusError, SignalBusResult};
use crate::flush::{FlushEngine, FlushMode};
use crate::registry::RegisteredSignal;
use crate::retry::RetryPolicy;
use crate::store::OutboxStore;
use futures_core::future::BoxFuture;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{self, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// 各信号待发送行数，按数量升序
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PendingReport {
    counts: Vec<(String, u64)>,
}

impl PendingReport {
    pub fn new(mut counts: Vec<(String, u64)>) -> Self {
        counts.sort_by(|a, b| a.1.cmp(&b.1).then_with(|| a.0.cmp(&b.0)));
        Self { counts }
    }

    pub fn count(&self, signal: &str) -> Option<u64> {
        self.counts
            .iter()
            .find(|(name, _)| name == signal)
            .map(|(_, n)| *n)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, u64)> {
        self.counts.iter().map(|(name, n)| (name.as_str(), *n))
    }

    pub fn total(&self) -> u64 {
        self.counts.iter().map(|(_, n)| n).sum()
    }
}

impl fmt::Display for PendingReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let total = self.total();
        let width = total.to_string().len();
        for (name, n) in &self.counts {
            writeln!(f, "{n:>width$} {name}")?;
        }
        write!(f, "{total:>width$} Total pending")
    }
}

/// 周期刷新方式
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum PeriodicMode {
    All,
    #[default]
    Many,
    Ordered,
}

/// 周期刷新配置
#[derive(Clone, Copy, Debug)]
pub struct PeriodicFlushConfig {
    pub mode: PeriodicMode,
    pub interval: Duration,
}

impl Default for PeriodicFlushConfig {
    fn default() -> Self {
        Self {
            mode: PeriodicMode::Many,
            interval: Duration::from_secs(60),
        }
    }
}

pub struct SignalBus {
    engine: Arc<FlushEngine>,
    hook: Arc<AutoFlushHook>,
    conflict_retry: RetryPolicy,
}

impl SignalBus {
    pub fn new(engine: Arc<FlushEngine>) -> Self {
        Self {
            hook: Arc::new(AutoFlushHook::new(engine.clone())),
            engine,
            conflict_retry: RetryPolicy::conflicts(),
        }
    }

    /// 覆盖 `atomic` 使用的冲突重试策略
    pub fn with_conflict_retry(mut self, policy: RetryPolicy) -> Self {
        self.conflict_retry = policy;
        self
    }

    pub fn engine(&self) -> &Arc<FlushEngine> {
        &self.engine
    }

    pub fn auto_flush_hook(&self) -> Arc<dyn PostCommitHook> {
        self.hook.clone()
    }

    /// 已注册的信号名（排序）
    pub fn signals(&self) -> Vec<String> {
        self.engine
            .registry()
            .names()
            .map(str::to_string)
            .collect()
    }

    fn resolve(&self, names: Option<&[&str]>) -> SignalBusResult<Vec<&RegisteredSignal>> {
        let registry = self.engine.registry();
        match names {
            None => Ok(registry.iter().collect()),
            Some(names) => names.iter().map(|name| registry.require(name)).collect(),
        }
    }

    pub async fn pending(&self, names: Option<&[&str]>) -> SignalBusResult<PendingReport> {
        let mut counts = Vec::new();
        for entry in self.resolve(names)? {
            let n = self.engine.store().count(entry.name()).await?;
            counts.push((entry.name().to_string(), n));
        }
        Ok(PendingReport::new(counts))
    }

    /// 无序刷新（`All`）
    pub async fn flush(&self, names: Option<&[&str]>) -> Result<usize, FlushError> {
        let entries = self.resolve(names).map_err(Self::rejected)?;
        let mut total = 0;
        for entry in entries {
            total += self
                .engine
                .flush(entry.name(), FlushMode::All)
                .await
                .map_err(|e| Self::accumulated(total, e))?;
        }
        Ok(total)
    }

    /// 扫描器驱动的刷新
    pub async fn flush_many(&self, names: Option<&[&str]>) -> Result<usize, FlushError> {
        let entries = self.resolve(names).map_err(Self::rejected)?;
        let mut total = 0;
        for entry in entries {
            total += self
                .engine
                .flush_many(entry.name())
                .await
                .map_err(|e| Self::accumulated(total, e))?;
        }
        Ok(total)
    }

    /// 有序刷新；未指定名称时只处理配置了 `order_by` 的信号
    pub async fn flush_ordered(&self, names: Option<&[&str]>) -> Result<usize, FlushError> {
        let entries: Vec<&RegisteredSignal> = match names {
            None => self.engine.registry().ordered().collect(),
            Some(_) => {
                let entries = self.resolve(names).map_err(Self::rejected)?;
                if let Some(unordered) = entries.iter().find(|e| e.descriptor().order_by().is_none())
                {
                    return Err(FlushError::new(
                        unordered.name(),
                        0,
                        SignalBusError::OrderingNotConfigured {
                            name: unordered.name().to_string(),
                        },
                    ));
                }
                entries
            }
        };
        let mut total = 0;
        for entry in entries {
            total += self
                .engine
                .flush(entry.name(), FlushMode::Ordered)
                .await
                .map_err(|e| Self::accumulated(total, e))?;
        }
        Ok(total)
    }

    fn rejected(err: SignalBusError) -> FlushError {
        let signal = match &err {
            SignalBusError::UnknownSignal { name } => name.clone(),
            _ => String::new(),
        };
        FlushError::new(signal, 0, err)
    }

    fn accumulated(before: usize, err: FlushError) -> FlushError {
        FlushError::new(err.signal, before + err.sent, err.source)
    }

    /// 开启挂载了自动刷新钩子的工作单元
    pub async fn begin(&self) -> SignalBusResult<UnitOfWork> {
        Ok(UnitOfWork::begin(self.engine.store().as_ref())
            .await?
            .with_hook(self.auto_flush_hook()))
    }

    /// 原子块：冲突时整体重跑，提交后自动刷新
    pub async fn atomic<T, F>(&self, work: F) -> SignalBusResult<(T, CommitReport)>
    where
        T: Send,
        F: for<'a> FnMut(&'a mut UnitOfWork) -> BoxFuture<'a, SignalBusResult<T>>,
    {
        autoflush::atomic(
            self.engine.store().as_ref(),
            Some(self.auto_flush_hook()),
            &self.conflict_retry,
            work,
        )
        .await
    }

    /// 启动周期刷新任务；单次失败只记录日志，下个周期继续
    pub fn start(self: Arc<Self>, config: PeriodicFlushConfig) -> FlushHandle {
        let token = CancellationToken::new();
        info!(mode = ?config.mode, interval = ?config.interval, "periodic flush started");
        let task = tokio::spawn(self.run_periodic(config, token.clone()));
        FlushHandle {
            token,
            task: Some(task),
        }
    }

    async fn run_periodic(self: Arc<Self>, config: PeriodicFlushConfig, token: CancellationToken) {
        let mut ticker = time::interval(config.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        // 正在进行的一轮刷新结束后才响应关闭
        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                _ = ticker.tick() => {}
            }
            let outcome = match config.mode {
                PeriodicMode::All => self.flush(None).await,
                PeriodicMode::Many => self.flush_many(None).await,
                PeriodicMode::Ordered => self.flush_ordered(None).await,
            };
            match outcome {
                Ok(sent) => debug!(sent, "periodic flush tick"),
                Err(err) => warn!(
                    signal = %err.signal,
                    sent = err.sent,
                    error = %err.source,
                    "periodic flush failed, retrying next tick"
                ),
            }
        }
        info!("periodic flush stopped");
    }
}

/// 周期刷新任务句柄；丢弃句柄即请求关闭
pub struct FlushHandle {
    token: CancellationToken,
    task: Option<JoinHandle<()>>,
}

impl FlushHandle {
    pub fn shutdown(&self) {
        self.token.cancel();
    }

    pub fn is_running(&self) -> bool {
        self.task.as_ref().is_some_and(|task| !task.is_finished())
    }

    /// 等待任务退出；需先调用 `shutdown`
    pub async fn join(mut self) {
        let Some(task) = self.task.take() else {
            return;
        };
        if let Err(err) = task.await {
            warn!(error = %err, "periodic flush task ended abnormally");
        }
    }
}

impl Drop for FlushHandle {
    fn drop(&mut self) {
        self.token.cancel();
    }
}
