//! 内存版发件箱存储（InMemoryOutboxStore）
//!
//! 语义对齐可重复读隔离：
//! - 事务开启时取快照，读取只看到快照与本事务自身的写入；
//! - 删除在提交时校验：若该行在快照之后已被其它事务修改，提交失败并报告
//!   `SerializationConflict`（先提交者胜）；
//! - 行标识序列不随事务回滚；
//! - 不实现行锁，`LockMode` 仅对真实数据库有意义。
//!
//! 典型用途：测试环境、示例与本地开发。
//!
use super::{LockMode, OutboxStore, OutboxTx};
use crate::error::{SignalBusError, SignalBusResult};
use crate::signal::{OrderBy, PendingEvent, RowId};
use async_trait::async_trait;
use futures_core::stream::BoxStream;
use futures_util::{StreamExt, stream};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

type Table = BTreeMap<RowId, Value>;

#[derive(Default)]
struct StoreState {
    tables: HashMap<String, Table>,
    sequences: HashMap<String, i64>,
    /// 每行最后一次被修改时的提交序号
    versions: HashMap<(String, RowId), u64>,
    commit_seq: u64,
    fail_commits: usize,
}

impl StoreState {
    fn next_id(&mut self, signal: &str) -> RowId {
        let seq = self.sequences.entry(signal.to_string()).or_insert(0);
        *seq += 1;
        RowId::new(*seq)
    }
}

#[derive(Clone, Default)]
pub struct InMemoryOutboxStore {
    state: Arc<Mutex<StoreState>>,
}

impl InMemoryOutboxStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, StoreState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// 直接写入一行已提交数据
    pub fn insert_committed(&self, signal: &str, payload: Value) -> RowId {
        let mut state = self.lock();
        let id = state.next_id(signal);
        state.commit_seq += 1;
        let seq = state.commit_seq;
        state
            .tables
            .entry(signal.to_string())
            .or_default()
            .insert(id, payload);
        state.versions.insert((signal.to_string(), id), seq);
        id
    }

    /// 接下来 `n` 次提交报告序列化冲突
    pub fn fail_next_commits(&self, n: usize) {
        self.lock().fail_commits = n;
    }

    /// 已提交的行（按标识排序）
    pub fn rows(&self, signal: &str) -> Vec<PendingEvent> {
        self.lock()
            .tables
            .get(signal)
            .map(|t| {
                t.iter()
                    .map(|(id, payload)| PendingEvent::new(signal, *id, payload.clone()))
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn ids(&self, signal: &str) -> Vec<RowId> {
        self.lock()
            .tables
            .get(signal)
            .map(|t| t.keys().copied().collect())
            .unwrap_or_default()
    }

    pub fn len(&self, signal: &str) -> usize {
        self.lock().tables.get(signal).map_or(0, BTreeMap::len)
    }
}

fn sort_rows(rows: &mut [PendingEvent], order_by: Option<&OrderBy>) {
    match order_by {
        Some(order_by) => rows.sort_by(|a, b| order_by.compare(a, b)),
        None => rows.sort_by_key(PendingEvent::id),
    }
}

#[async_trait]
impl OutboxStore for InMemoryOutboxStore {
    async fn begin(&self) -> SignalBusResult<Box<dyn OutboxTx>> {
        let state = self.lock();
        Ok(Box::new(MemoryTx {
            state: self.state.clone(),
            snapshot_seq: state.commit_seq,
            snapshot: state.tables.clone(),
            inserted: HashMap::new(),
            deleted: HashSet::new(),
        }))
    }

    async fn pending(
        &self,
        signal: &str,
        order_by: Option<&OrderBy>,
    ) -> SignalBusResult<BoxStream<'static, SignalBusResult<RowId>>> {
        let mut rows = self.rows(signal);
        sort_rows(&mut rows, order_by);
        let ids: Vec<SignalBusResult<RowId>> = rows.iter().map(|r| Ok(r.id())).collect();
        Ok(stream::iter(ids).boxed())
    }

    async fn count(&self, signal: &str) -> SignalBusResult<u64> {
        Ok(self.len(signal) as u64)
    }
}

struct MemoryTx {
    state: Arc<Mutex<StoreState>>,
    snapshot_seq: u64,
    snapshot: HashMap<String, Table>,
    inserted: HashMap<String, Table>,
    deleted: HashSet<(String, RowId)>,
}

impl MemoryTx {
    fn lock(&self) -> MutexGuard<'_, StoreState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn visible(&self, signal: &str) -> Vec<PendingEvent> {
        let from_snapshot = self
            .snapshot
            .get(signal)
            .into_iter()
            .flatten()
            .filter(|(id, _)| !self.deleted.contains(&(signal.to_string(), **id)));
        let from_self = self.inserted.get(signal).into_iter().flatten();
        from_snapshot
            .chain(from_self)
            .map(|(id, payload)| PendingEvent::new(signal, *id, payload.clone()))
            .collect()
    }
}

#[async_trait]
impl OutboxTx for MemoryTx {
    async fn insert(&mut self, signal: &str, payload: Value) -> SignalBusResult<RowId> {
        let id = self.lock().next_id(signal);
        self.inserted
            .entry(signal.to_string())
            .or_default()
            .insert(id, payload);
        Ok(id)
    }

    async fn burst(
        &mut self,
        signal: &str,
        order_by: Option<&OrderBy>,
        limit: usize,
        _lock: LockMode,
    ) -> SignalBusResult<Vec<PendingEvent>> {
        let mut rows = self.visible(signal);
        sort_rows(&mut rows, order_by);
        rows.truncate(limit);
        Ok(rows)
    }

    async fn fetch(
        &mut self,
        signal: &str,
        ids: &[RowId],
        _lock: LockMode,
    ) -> SignalBusResult<Vec<PendingEvent>> {
        let wanted: HashSet<RowId> = ids.iter().copied().collect();
        let mut rows: Vec<PendingEvent> = self
            .visible(signal)
            .into_iter()
            .filter(|r| wanted.contains(&r.id()))
            .collect();
        sort_rows(&mut rows, None);
        Ok(rows)
    }

    async fn delete(&mut self, signal: &str, ids: &[RowId]) -> SignalBusResult<u64> {
        let mut deleted = 0;
        for id in ids {
            let own = self
                .inserted
                .get_mut(signal)
                .and_then(|t| t.remove(id))
                .is_some();
            if own {
                deleted += 1;
                continue;
            }
            let in_snapshot = self
                .snapshot
                .get(signal)
                .is_some_and(|t| t.contains_key(id));
            if in_snapshot && self.deleted.insert((signal.to_string(), *id)) {
                deleted += 1;
            }
        }
        Ok(deleted)
    }

    async fn commit(self: Box<Self>) -> SignalBusResult<()> {
        let mut state = self.lock();
        if state.fail_commits > 0 {
            state.fail_commits -= 1;
            return Err(SignalBusError::conflict("could not serialize access (injected)"));
        }
        for key in &self.deleted {
            if state.versions.get(key).is_some_and(|v| *v > self.snapshot_seq) {
                return Err(SignalBusError::conflict(format!(
                    "row {} of {} was modified by a concurrent transaction",
                    key.1, key.0
                )));
            }
        }

        state.commit_seq += 1;
        let seq = state.commit_seq;
        for (signal, id) in &self.deleted {
            if let Some(table) = state.tables.get_mut(signal) {
                table.remove(id);
            }
            state.versions.insert((signal.clone(), *id), seq);
        }
        for (signal, rows) in &self.inserted {
            for (id, payload) in rows {
                state
                    .tables
                    .entry(signal.clone())
                    .or_default()
                    .insert(*id, payload.clone());
                state.versions.insert((signal.clone(), *id), seq);
            }
        }
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> SignalBusResult<()> {
        Ok(())
    }
}
