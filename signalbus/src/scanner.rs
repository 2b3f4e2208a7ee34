//! 批量扫描器（BatchScanner）
//!
//! 为 `flush_many` 发现待发送行：返回有限、不可重启的行标识批次序列，
//! 每批行数不超过 `rows_per_batch`。
//!
use crate::error::SignalBusResult;
use crate::signal::RowId;
use crate::store::OutboxStore;
use async_trait::async_trait;
use futures_core::stream::BoxStream;
use futures_util::StreamExt;
use std::sync::Arc;

#[async_trait]
pub trait BatchScanner: Send + Sync {
    async fn scan(
        &self,
        signal: &str,
    ) -> SignalBusResult<BoxStream<'static, SignalBusResult<Vec<RowId>>>>;
}

#[async_trait]
impl<T> BatchScanner for Arc<T>
where
    T: BatchScanner + ?Sized,
{
    async fn scan(
        &self,
        signal: &str,
    ) -> SignalBusResult<BoxStream<'static, SignalBusResult<Vec<RowId>>>> {
        (**self).scan(signal).await
    }
}

/// 基于 `OutboxStore::pending` 的扫描器
pub struct StoreScanner {
    store: Arc<dyn OutboxStore>,
    rows_per_batch: usize,
}

impl StoreScanner {
    pub fn new(store: Arc<dyn OutboxStore>, rows_per_batch: usize) -> Self {
        Self {
            store,
            rows_per_batch: rows_per_batch.max(1),
        }
    }
}

#[async_trait]
impl BatchScanner for StoreScanner {
    async fn scan(
        &self,
        signal: &str,
    ) -> SignalBusResult<BoxStream<'static, SignalBusResult<Vec<RowId>>>> {
        let ids = self.store.pending(signal, None).await?;
        let batches = ids
            .chunks(self.rows_per_batch)
            .map(|chunk| chunk.into_iter().collect::<SignalBusResult<Vec<RowId>>>());
        Ok(batches.boxed())
    }
}
