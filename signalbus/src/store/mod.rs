//! 发件箱存储（OutboxStore）协议
//!
//! 每种信号对应一张表，行标识由存储分配。刷新在事务内完成：
//! 选取一批行 → 发送 → 删除 → 提交；提交可能因并发事务报告 `SerializationConflict`。
//!
//! - `OutboxStore`：开启事务、列出待发送行、计数；
//! - `OutboxTx`：事务内的插入、批量选取（可跳过已锁行）、按标识读取与删除；
//! - `OutboxStoreExt`：自动提交的便捷方法。
//!
pub mod memory;
#[cfg(feature = "postgres")]
pub mod postgres;

pub use memory::InMemoryOutboxStore;
#[cfg(feature = "postgres")]
pub use postgres::{PgKeysetScanner, PgOutboxStore};

use crate::error::SignalBusResult;
use crate::signal::{OrderBy, PendingEvent, RowId};
use async_trait::async_trait;
use futures_core::stream::BoxStream;
use serde_json::Value;

/// 行锁策略
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LockMode {
    /// 跳过已被其它事务锁定的行（无序刷新）
    #[default]
    SkipLocked,
    /// 等待锁释放，绝不越过更早的行（有序刷新）
    Wait,
}

#[async_trait]
pub trait OutboxStore: Send + Sync {
    async fn begin(&self) -> SignalBusResult<Box<dyn OutboxTx>>;

    /// 当前待发送行的标识序列；给定 `order_by` 时按其排序
    async fn pending(
        &self,
        signal: &str,
        order_by: Option<&OrderBy>,
    ) -> SignalBusResult<BoxStream<'static, SignalBusResult<RowId>>>;

    async fn count(&self, signal: &str) -> SignalBusResult<u64>;
}

/// 一个可重复读事务
#[async_trait]
pub trait OutboxTx: Send {
    async fn insert(&mut self, signal: &str, payload: Value) -> SignalBusResult<RowId>;

    /// 选取至多 `limit` 行并加锁；给定 `order_by` 时取排序最靠前的行
    async fn burst(
        &mut self,
        signal: &str,
        order_by: Option<&OrderBy>,
        limit: usize,
        lock: LockMode,
    ) -> SignalBusResult<Vec<PendingEvent>>;

    /// 按标识读取并加锁；已不存在的标识被忽略
    async fn fetch(
        &mut self,
        signal: &str,
        ids: &[RowId],
        lock: LockMode,
    ) -> SignalBusResult<Vec<PendingEvent>>;

    /// 删除给定行，返回实际删除的行数；已删除的行计 0（幂等）
    async fn delete(&mut self, signal: &str, ids: &[RowId]) -> SignalBusResult<u64>;

    async fn commit(self: Box<Self>) -> SignalBusResult<()>;

    async fn rollback(self: Box<Self>) -> SignalBusResult<()>;
}

#[async_trait]
impl<T> OutboxStore for std::sync::Arc<T>
where
    T: OutboxStore + ?Sized,
{
    async fn begin(&self) -> SignalBusResult<Box<dyn OutboxTx>> {
        (**self).begin().await
    }

    async fn pending(
        &self,
        signal: &str,
        order_by: Option<&OrderBy>,
    ) -> SignalBusResult<BoxStream<'static, SignalBusResult<RowId>>> {
        (**self).pending(signal, order_by).await
    }

    async fn count(&self, signal: &str) -> SignalBusResult<u64> {
        (**self).count(signal).await
    }
}

/// 自动提交的便捷方法
#[async_trait]
pub trait OutboxStoreExt: OutboxStore {
    /// 在独立事务中插入一行并提交
    async fn insert_one(&self, signal: &str, payload: Value) -> SignalBusResult<RowId> {
        let mut tx = self.begin().await?;
        let id = tx.insert(signal, payload).await?;
        tx.commit().await?;
        Ok(id)
    }

    /// 只读地查看至多 `limit` 行
    async fn peek(
        &self,
        signal: &str,
        order_by: Option<&OrderBy>,
        limit: usize,
    ) -> SignalBusResult<Vec<PendingEvent>> {
        let mut tx = self.begin().await?;
        let rows = tx.burst(signal, order_by, limit, LockMode::SkipLocked).await;
        tx.rollback().await?;
        rows
    }

    /// 在独立事务中删除并提交
    async fn delete_committed(&self, signal: &str, ids: &[RowId]) -> SignalBusResult<u64> {
        let mut tx = self.begin().await?;
        let deleted = tx.delete(signal, ids).await?;
        tx.commit().await?;
        Ok(deleted)
    }
}

impl<T: OutboxStore + ?Sized> OutboxStoreExt for T {}
