//! 刷新引擎（FlushEngine）
//!
//! 每个批次在一个事务内完成“选取 → 发送 → 删除 → 提交”：
//! - 发送成功后才删除，提交失败时已发送的行会在下次刷新重发（至少一次）；
//! - 序列化冲突按退避重试整个批次，代理故障不在本次调用内重试；
//! - 失败时报告已发送数量与触发错误（`FlushError`）。
//!
//! 刷新方式：
//! - `Auto(ids)`：仅刷新给定行（提交后自动刷新使用）；
//! - `All`：无序、跳过已锁行，直到某批不满；
//! - `Ordered`：按 `order_by` 排序、等待锁，从不越过更早的行；
//! - `flush_many`：由 `BatchScanner` 发现行，再按 `burst_count` 切片。
//!
use crate::channel::DeliveryChannel;
use crate::error::{FlushError, SignalBusError, SignalBusResult};
use crate::registry::{RegisteredSignal, SignalRegistry};
use crate::retry::RetryPolicy;
use crate::scanner::{BatchScanner, StoreScanner};
use crate::signal::{OrderBy, RowId};
use crate::store::{LockMode, OutboxStore, OutboxTx};
use bon::Builder;
use futures_util::StreamExt;
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio::time;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

// 导入由 bon::Builder 生成的 typestate 模块与状态转换别名
use self::flush_engine_builder::{IsUnset, SetChannel, State as BuilderState};

/// 刷新方式
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FlushMode {
    /// 仅刷新给定行
    Auto(Vec<RowId>),
    /// 无序刷新全部积压
    All,
    /// 按排序键刷新全部积压
    Ordered,
}

impl FlushMode {
    fn label(&self) -> &'static str {
        match self {
            FlushMode::Auto(_) => "auto",
            FlushMode::All => "all",
            FlushMode::Ordered => "ordered",
        }
    }
}

/// 刷新配置
#[derive(Clone, Copy, Debug)]
pub struct FlushConfig {
    /// 序列化冲突的重试策略
    pub conflict_retry: RetryPolicy,
    /// 未配置扫描器时，默认扫描器每批的行数
    pub scan_batch_rows: usize,
}

impl Default for FlushConfig {
    fn default() -> Self {
        Self {
            conflict_retry: RetryPolicy::conflicts(),
            scan_batch_rows: 5000,
        }
    }
}

enum Selection<'a> {
    Burst {
        order_by: Option<&'a OrderBy>,
        lock: LockMode,
    },
    Rows(&'a [RowId]),
}

#[derive(Builder)]
pub struct FlushEngine {
    registry: Arc<SignalRegistry>,
    store: Arc<dyn OutboxStore>,
    #[builder(setters(vis = "pub(crate)"))]
    channel: Mutex<DeliveryChannel>,
    scanner: Option<Arc<dyn BatchScanner>>,
    #[builder(default)]
    config: FlushConfig,
    /// 取消后，正在进行的刷新在当前批次结束后停止
    #[builder(default)]
    cancel: CancellationToken,
}

impl<S: BuilderState> FlushEngineBuilder<S> {
    pub fn delivery_channel(self, channel: DeliveryChannel) -> FlushEngineBuilder<SetChannel<S>>
    where
        <S as BuilderState>::Channel: IsUnset,
    {
        self.channel(Mutex::new(channel))
    }
}

impl FlushEngine {
    pub fn registry(&self) -> &Arc<SignalRegistry> {
        &self.registry
    }

    pub fn store(&self) -> &Arc<dyn OutboxStore> {
        &self.store
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// 按给定方式刷新一种信号，返回已发送并删除的行数
    pub async fn flush(&self, signal: &str, mode: FlushMode) -> Result<usize, FlushError> {
        let entry = self
            .registry
            .require(signal)
            .map_err(|e| FlushError::new(signal, 0, e))?;

        info!(signal, mode = mode.label(), "flushing signals");
        let outcome = match mode {
            FlushMode::Auto(ids) => self.flush_rows(entry, &ids).await,
            FlushMode::All => self.flush_all(entry).await,
            FlushMode::Ordered => self.flush_ordered(entry).await,
        };
        Self::report(signal, outcome)
    }

    /// 由扫描器发现待发送行并刷新
    pub async fn flush_many(&self, signal: &str) -> Result<usize, FlushError> {
        let entry = self
            .registry
            .require(signal)
            .map_err(|e| FlushError::new(signal, 0, e))?;

        info!(signal, mode = "many", "flushing signals");
        let outcome = self.flush_scanned(entry).await;
        Self::report(signal, outcome)
    }

    fn report(
        signal: &str,
        outcome: Result<usize, (usize, SignalBusError)>,
    ) -> Result<usize, FlushError> {
        match outcome {
            Ok(sent) => {
                if sent > 0 {
                    info!(signal, sent, "flush finished");
                }
                Ok(sent)
            }
            Err((sent, err)) => {
                error!(signal, sent, error = %err, "flush aborted");
                Err(FlushError::new(signal, sent, err))
            }
        }
    }

    async fn flush_rows(
        &self,
        entry: &RegisteredSignal,
        ids: &[RowId],
    ) -> Result<usize, (usize, SignalBusError)> {
        let burst = entry.descriptor().burst_count();
        let mut sent = 0;
        for chunk in ids.chunks(burst) {
            if self.cancel.is_cancelled() {
                break;
            }
            sent += self
                .run_batch(entry, Selection::Rows(chunk))
                .await
                .map_err(|e| (sent, e))?;
        }
        Ok(sent)
    }

    async fn flush_all(&self, entry: &RegisteredSignal) -> Result<usize, (usize, SignalBusError)> {
        let burst = entry.descriptor().burst_count();
        let mut sent = 0;
        while !self.cancel.is_cancelled() {
            let selection = Selection::Burst {
                order_by: None,
                lock: LockMode::SkipLocked,
            };
            let n = self
                .run_batch(entry, selection)
                .await
                .map_err(|e| (sent, e))?;
            sent += n;
            if n < burst {
                break;
            }
        }
        Ok(sent)
    }

    async fn flush_ordered(
        &self,
        entry: &RegisteredSignal,
    ) -> Result<usize, (usize, SignalBusError)> {
        let Some(order_by) = entry.descriptor().order_by() else {
            return Err((
                0,
                SignalBusError::OrderingNotConfigured {
                    name: entry.name().to_string(),
                },
            ));
        };
        let burst = entry.descriptor().burst_count();
        let mut sent = 0;
        while !self.cancel.is_cancelled() {
            let selection = Selection::Burst {
                order_by: Some(order_by),
                lock: LockMode::Wait,
            };
            let n = self
                .run_batch(entry, selection)
                .await
                .map_err(|e| (sent, e))?;
            sent += n;
            if n < burst {
                break;
            }
        }
        Ok(sent)
    }

    async fn flush_scanned(
        &self,
        entry: &RegisteredSignal,
    ) -> Result<usize, (usize, SignalBusError)> {
        let scanner: Arc<dyn BatchScanner> = match &self.scanner {
            Some(scanner) => scanner.clone(),
            None => Arc::new(StoreScanner::new(
                self.store.clone(),
                self.config.scan_batch_rows,
            )),
        };
        let mut batches = scanner.scan(entry.name()).await.map_err(|e| (0, e))?;

        let burst = entry.descriptor().burst_count();
        let mut sent = 0;
        'scan: while let Some(batch) = batches.next().await {
            let ids = batch.map_err(|e| (sent, e))?;
            for chunk in ids.chunks(burst) {
                if self.cancel.is_cancelled() {
                    debug!(signal = entry.name(), sent, "scanned flush cancelled");
                    break 'scan;
                }
                sent += self
                    .run_batch(entry, Selection::Rows(chunk))
                    .await
                    .map_err(|e| (sent, e))?;
            }
        }
        Ok(sent)
    }

    /// 执行一个批次；序列化冲突时按退避重试
    async fn run_batch(
        &self,
        entry: &RegisteredSignal,
        selection: Selection<'_>,
    ) -> SignalBusResult<usize> {
        let policy = self.config.conflict_retry;
        let mut attempt = 0;
        loop {
            attempt += 1;
            match self.try_batch(entry, &selection).await {
                Err(err) if err.is_conflict() && policy.allows_retry(attempt) => {
                    let delay = policy.delay(attempt);
                    warn!(
                        signal = entry.name(),
                        attempt,
                        ?delay,
                        error = %err,
                        "serialization conflict, retrying batch"
                    );
                    time::sleep(delay).await;
                }
                outcome => return outcome,
            }
        }
    }

    async fn try_batch(
        &self,
        entry: &RegisteredSignal,
        selection: &Selection<'_>,
    ) -> SignalBusResult<usize> {
        let name = entry.name();
        let mut tx = self.store.begin().await?;

        let selected = match selection {
            Selection::Burst { order_by, lock } => {
                tx.burst(name, *order_by, entry.descriptor().burst_count(), *lock)
                    .await
            }
            Selection::Rows(ids) => tx.fetch(name, ids, LockMode::SkipLocked).await,
        };
        let rows = match selected {
            Ok(rows) => rows,
            Err(err) => return Err(Self::abort(tx, err).await),
        };
        if rows.is_empty() {
            tx.rollback().await?;
            return Ok(0);
        }

        let sent = {
            let mut channel = self.channel.lock().await;
            if rows.len() > 1 {
                entry.signal().send_many(&mut *channel, &rows).await
            } else {
                entry.signal().send_one(&mut *channel, &rows[0]).await
            }
        };
        if let Err(err) = sent {
            return Err(Self::abort(tx, err).await);
        }

        let ids: Vec<RowId> = rows.iter().map(|r| r.id()).collect();
        let deleted = match tx.delete(name, &ids).await {
            Ok(deleted) => deleted,
            Err(err) => return Err(Self::abort(tx, err).await),
        };
        tx.commit().await?;

        debug!(signal = name, sent = rows.len(), deleted, "batch flushed");
        Ok(rows.len())
    }

    async fn abort(tx: Box<dyn OutboxTx>, err: SignalBusError) -> SignalBusError {
        if let Err(rollback_err) = tx.rollback().await {
            warn!(error = %rollback_err, "rollback after failed batch also failed");
        }
        err
    }
}
