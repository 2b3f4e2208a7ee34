//! 提交后自动刷新（UnitOfWork / AutoFlushHook）
//!
//! 工作单元记录本事务新增的信号行（同一事务内又被删除的行不计），
//! 事务提交成功后立即通知提交钩子；回滚或提交失败则不通知。
//!
//! `AutoFlushHook` 对 `autoflush = true` 的信号以 `FlushMode::Auto` 刷新这些行，
//! 失败只记录在报告中，不会影响已经完成的提交；遗留的行由后续的全量刷新兜底。
//!
use crate::error::{FlushError, SignalBusError, SignalBusResult};
use crate::flush::{FlushEngine, FlushMode};
use crate::retry::RetryPolicy;
use crate::signal::RowId;
use crate::store::{OutboxStore, OutboxTx};
use async_trait::async_trait;
use futures_core::future::BoxFuture;
use serde::Serialize;
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};
use std::future::Future;
use std::sync::Arc;
use tokio::time;
use tracing::{debug, warn};

/// 一次提交新增的信号行（按信号名分组）
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommittedSignals {
    rows: BTreeMap<String, Vec<RowId>>,
}

impl CommittedSignals {
    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn signals(&self) -> impl Iterator<Item = &str> {
        self.rows.keys().map(String::as_str)
    }

    pub fn rows(&self, signal: &str) -> &[RowId] {
        self.rows.get(signal).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &[RowId])> {
        self.rows.iter().map(|(k, v)| (k.as_str(), v.as_slice()))
    }

    pub fn total(&self) -> usize {
        self.rows.values().map(Vec::len).sum()
    }
}

/// 自动刷新结果
#[derive(Debug, Default)]
pub struct AutoFlushReport {
    pub sent: usize,
    pub failures: Vec<FlushError>,
}

/// 提交钩子：在提交成功后、`commit` 返回前调用
#[async_trait]
pub trait PostCommitHook: Send + Sync {
    async fn after_commit(&self, committed: &CommittedSignals) -> AutoFlushReport;
}

pub struct AutoFlushHook {
    engine: Arc<FlushEngine>,
}

impl AutoFlushHook {
    pub fn new(engine: Arc<FlushEngine>) -> Self {
        Self { engine }
    }
}

#[async_trait]
impl PostCommitHook for AutoFlushHook {
    async fn after_commit(&self, committed: &CommittedSignals) -> AutoFlushReport {
        let mut report = AutoFlushReport::default();
        for (name, ids) in committed.iter() {
            let Some(entry) = self.engine.registry().get(name) else {
                debug!(signal = name, "skipping rows of unregistered signal");
                continue;
            };
            if !entry.descriptor().autoflush() {
                continue;
            }
            match self.engine.flush(name, FlushMode::Auto(ids.to_vec())).await {
                Ok(sent) => report.sent += sent,
                Err(err) => {
                    warn!(
                        signal = name,
                        sent = err.sent,
                        error = %err.source,
                        "auto-flush failed, rows left for a later flush"
                    );
                    report.sent += err.sent;
                    report.failures.push(err);
                }
            }
        }
        report
    }
}

/// 提交结果
#[derive(Debug, Default)]
pub struct CommitReport {
    pub committed: CommittedSignals,
    /// 未挂载钩子或没有新增行时为 `None`
    pub autoflush: Option<AutoFlushReport>,
}

/// 工作单元：一个存储事务加上新增信号行的记录
pub struct UnitOfWork {
    tx: Box<dyn OutboxTx>,
    added: BTreeMap<String, BTreeSet<RowId>>,
    hook: Option<Arc<dyn PostCommitHook>>,
}

impl UnitOfWork {
    pub async fn begin<S>(store: &S) -> SignalBusResult<Self>
    where
        S: OutboxStore + ?Sized,
    {
        Ok(Self {
            tx: store.begin().await?,
            added: BTreeMap::new(),
            hook: None,
        })
    }

    pub fn with_hook(mut self, hook: Arc<dyn PostCommitHook>) -> Self {
        self.hook = Some(hook);
        self
    }

    /// 写入一行信号
    pub async fn add(&mut self, signal: &str, payload: Value) -> SignalBusResult<RowId> {
        let id = self.tx.insert(signal, payload).await?;
        self.added.entry(signal.to_string()).or_default().insert(id);
        Ok(id)
    }

    pub async fn add_serialized<T>(&mut self, signal: &str, value: &T) -> SignalBusResult<RowId>
    where
        T: Serialize + ?Sized,
    {
        let payload = serde_json::to_value(value)?;
        self.add(signal, payload).await
    }

    /// 删除信号行；本事务新增后又删除的行不再参与自动刷新
    pub async fn remove(&mut self, signal: &str, ids: &[RowId]) -> SignalBusResult<u64> {
        let deleted = self.tx.delete(signal, ids).await?;
        if let Some(added) = self.added.get_mut(signal) {
            for id in ids {
                added.remove(id);
            }
            if added.is_empty() {
                self.added.remove(signal);
            }
        }
        Ok(deleted)
    }

    /// 同一事务内执行其它存储操作
    pub fn transaction(&mut self) -> &mut dyn OutboxTx {
        self.tx.as_mut()
    }

    pub fn added(&self, signal: &str) -> Vec<RowId> {
        self.added
            .get(signal)
            .map(|ids| ids.iter().copied().collect())
            .unwrap_or_default()
    }

    /// 提交；成功后同步调用提交钩子
    pub async fn commit(self) -> SignalBusResult<CommitReport> {
        let Self { tx, added, hook } = self;
        tx.commit().await?;

        let committed = CommittedSignals {
            rows: added
                .into_iter()
                .map(|(name, ids)| (name, ids.into_iter().collect()))
                .collect(),
        };
        let autoflush = match hook {
            Some(hook) if !committed.is_empty() => Some(hook.after_commit(&committed).await),
            _ => None,
        };
        Ok(CommitReport {
            committed,
            autoflush,
        })
    }

    pub async fn rollback(self) -> SignalBusResult<()> {
        self.tx.rollback().await
    }
}

/// 在工作单元中执行 `work` 并提交；遇到序列化冲突时整体重跑
///
/// ```ignore
/// let (id, report) = atomic(store.as_ref(), Some(hook), &RetryPolicy::conflicts(), |uow| {
///     Box::pin(async move { uow.add("transfer", json!({"amount": 10})).await })
/// })
/// .await?;
/// ```
pub async fn atomic<S, T, F>(
    store: &S,
    hook: Option<Arc<dyn PostCommitHook>>,
    policy: &RetryPolicy,
    mut work: F,
) -> SignalBusResult<(T, CommitReport)>
where
    S: OutboxStore + ?Sized,
    T: Send,
    F: for<'a> FnMut(&'a mut UnitOfWork) -> BoxFuture<'a, SignalBusResult<T>>,
{
    let mut attempt = 0;
    loop {
        attempt += 1;
        let mut uow = UnitOfWork::begin(store).await?;
        if let Some(hook) = &hook {
            uow = uow.with_hook(hook.clone());
        }

        let outcome = match work(&mut uow).await {
            Ok(value) => uow.commit().await.map(|report| (value, report)),
            Err(err) => {
                if let Err(rollback_err) = uow.rollback().await {
                    warn!(error = %rollback_err, "rollback of atomic block failed");
                }
                Err(err)
            }
        };

        match outcome {
            Err(err) if err.is_conflict() && policy.allows_retry(attempt) => {
                let delay = policy.delay(attempt);
                warn!(attempt, ?delay, error = %err, "serialization conflict, retrying atomic block");
                time::sleep(delay).await;
            }
            outcome => return outcome,
        }
    }
}

/// 把完整性冲突改报为序列化冲突，使外层 `atomic` 重跑整个块
///
/// 用于“先检查不存在再插入”的竞争：另一事务抢先插入同一主键时，
/// 重跑后检查会看到该行。只在 `atomic` 块内使用；块外没有重试。
///
/// ```ignore
/// bus.atomic(|uow| {
///     Box::pin(async move {
///         retry_on_integrity_error(insert_account(uow.transaction(), id)).await
///     })
/// })
/// .await?;
/// ```
pub async fn retry_on_integrity_error<T, Fut>(work: Fut) -> SignalBusResult<T>
where
    Fut: Future<Output = SignalBusResult<T>>,
{
    match work.await {
        Err(SignalBusError::IntegrityViolation { reason }) => {
            debug!(%reason, "integrity violation, requesting atomic retry");
            Err(SignalBusError::conflict(reason))
        }
        outcome => outcome,
    }
}
