//! Postgres 发件箱存储（PgOutboxStore）
//!
//! 每种信号映射到一张应用自有的表，主键须为 `bigint`：
//! - 事务以 REPEATABLE READ 运行，冲突（40001/40P01）报告为 `SerializationConflict`；
//! - 无序选取使用 `FOR UPDATE SKIP LOCKED`，有序选取使用 `FOR UPDATE`；
//! - 行以 `to_jsonb(row)` 读取，以 `jsonb_populate_record` 写入。
//!
//! `PgKeysetScanner` 以主键键集分页实现 `BatchScanner`。
//!
use super::{LockMode, OutboxStore, OutboxTx};
use crate::error::{SignalBusError, SignalBusResult};
use crate::scanner::BatchScanner;
use crate::signal::{Direction, OrderBy, PendingEvent, RowId, is_valid_identifier};
use async_trait::async_trait;
use futures_core::stream::BoxStream;
use futures_util::{StreamExt, stream};
use serde_json::Value;
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Postgres, Row, Transaction};
use std::collections::HashMap;
use std::sync::Arc;

/// 信号对应的表
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PgTable {
    table: String,
    id_column: String,
}

impl PgTable {
    pub fn new(table: impl Into<String>, id_column: impl Into<String>) -> SignalBusResult<Self> {
        let table = table.into();
        let id_column = id_column.into();
        for ident in [&table, &id_column] {
            if !is_valid_identifier(ident) {
                return Err(SignalBusError::invalid_descriptor(format!(
                    "invalid identifier \"{ident}\""
                )));
            }
        }
        Ok(Self { table, id_column })
    }

    fn table(&self) -> String {
        quote(&self.table)
    }

    fn id(&self) -> String {
        quote(&self.id_column)
    }

    fn order_clause(&self, order_by: Option<&OrderBy>) -> String {
        let mut parts: Vec<String> = order_by
            .map(|o| {
                o.columns()
                    .iter()
                    .map(|c| match c.direction() {
                        Direction::Asc => format!("t.{} ASC", quote(c.column())),
                        Direction::Desc => format!("t.{} DESC", quote(c.column())),
                    })
                    .collect()
            })
            .unwrap_or_default();
        parts.push(format!("t.{} ASC", self.id()));
        format!("ORDER BY {}", parts.join(", "))
    }
}

// 标识符已校验，只含字母、数字与下划线
fn quote(ident: &str) -> String {
    format!("\"{ident}\"")
}

#[derive(Clone)]
pub struct PgOutboxStore {
    pool: PgPool,
    tables: Arc<HashMap<String, PgTable>>,
}

impl PgOutboxStore {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool,
            tables: Arc::new(HashMap::new()),
        }
    }

    /// 把信号映射到表 `table`（主键列 `id_column`）
    pub fn with_table(
        mut self,
        signal: impl Into<String>,
        table: impl Into<String>,
        id_column: impl Into<String>,
    ) -> SignalBusResult<Self> {
        let mapping = PgTable::new(table, id_column)?;
        Arc::make_mut(&mut self.tables).insert(signal.into(), mapping);
        Ok(self)
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    fn table(&self, signal: &str) -> SignalBusResult<&PgTable> {
        lookup(&self.tables, signal)
    }
}

fn lookup<'a>(tables: &'a HashMap<String, PgTable>, signal: &str) -> SignalBusResult<&'a PgTable> {
    tables.get(signal).ok_or_else(|| SignalBusError::UnknownSignal {
        name: signal.to_string(),
    })
}

fn decode_rows(signal: &str, rows: Vec<PgRow>) -> SignalBusResult<Vec<PendingEvent>> {
    rows.into_iter()
        .map(|row| {
            let id: i64 = row.try_get("__id")?;
            let payload: Value = row.try_get("__payload")?;
            Ok(PendingEvent::new(signal, RowId::new(id), payload))
        })
        .collect()
}

fn lock_clause(lock: LockMode) -> &'static str {
    match lock {
        LockMode::SkipLocked => "FOR UPDATE OF t SKIP LOCKED",
        LockMode::Wait => "FOR UPDATE OF t",
    }
}

#[async_trait]
impl OutboxStore for PgOutboxStore {
    async fn begin(&self) -> SignalBusResult<Box<dyn OutboxTx>> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("SET TRANSACTION ISOLATION LEVEL REPEATABLE READ")
            .execute(&mut *tx)
            .await?;
        Ok(Box::new(PgTx {
            tx,
            tables: self.tables.clone(),
        }))
    }

    async fn pending(
        &self,
        signal: &str,
        order_by: Option<&OrderBy>,
    ) -> SignalBusResult<BoxStream<'static, SignalBusResult<RowId>>> {
        let table = self.table(signal)?;
        let sql = format!(
            "SELECT t.{id}::bigint FROM {table} AS t {order}",
            id = table.id(),
            table = table.table(),
            order = table.order_clause(order_by),
        );
        let ids: Vec<i64> = sqlx::query_scalar(&sql).fetch_all(&self.pool).await?;
        let ids: Vec<SignalBusResult<RowId>> = ids.into_iter().map(|id| Ok(RowId::new(id))).collect();
        Ok(stream::iter(ids).boxed())
    }

    async fn count(&self, signal: &str) -> SignalBusResult<u64> {
        let table = self.table(signal)?;
        let sql = format!("SELECT count(*) FROM {}", table.table());
        let n: i64 = sqlx::query_scalar(&sql).fetch_one(&self.pool).await?;
        Ok(n.max(0) as u64)
    }
}

struct PgTx {
    tx: Transaction<'static, Postgres>,
    tables: Arc<HashMap<String, PgTable>>,
}

#[async_trait]
impl OutboxTx for PgTx {
    async fn insert(&mut self, signal: &str, payload: Value) -> SignalBusResult<RowId> {
        let table = lookup(&self.tables, signal)?.clone();
        let Value::Object(fields) = &payload else {
            return Err(SignalBusError::database(format!(
                "payload of {signal} must be a JSON object"
            )));
        };
        let mut columns = Vec::with_capacity(fields.len());
        for key in fields.keys() {
            if !is_valid_identifier(key) {
                return Err(SignalBusError::database(format!(
                    "invalid column \"{key}\" in payload of {signal}"
                )));
            }
            columns.push(quote(key));
        }

        let sql = if columns.is_empty() {
            format!(
                "INSERT INTO {table} DEFAULT VALUES RETURNING {id}::bigint",
                table = table.table(),
                id = table.id(),
            )
        } else {
            let columns = columns.join(", ");
            format!(
                "INSERT INTO {table} ({columns}) \
                 SELECT {columns} FROM jsonb_populate_record(NULL::{table}, $1) \
                 RETURNING {id}::bigint",
                table = table.table(),
                id = table.id(),
            )
        };
        let mut query = sqlx::query_scalar::<_, i64>(&sql);
        if !fields.is_empty() {
            query = query.bind(&payload);
        }
        let id = query.fetch_one(&mut *self.tx).await?;
        Ok(RowId::new(id))
    }

    async fn burst(
        &mut self,
        signal: &str,
        order_by: Option<&OrderBy>,
        limit: usize,
        lock: LockMode,
    ) -> SignalBusResult<Vec<PendingEvent>> {
        let table = lookup(&self.tables, signal)?.clone();
        let sql = format!(
            "SELECT t.{id}::bigint AS __id, to_jsonb(t) AS __payload \
             FROM {table} AS t {order} LIMIT $1 {lock}",
            id = table.id(),
            table = table.table(),
            order = table.order_clause(order_by),
            lock = lock_clause(lock),
        );
        let rows = sqlx::query(&sql)
            .bind(limit as i64)
            .fetch_all(&mut *self.tx)
            .await?;
        decode_rows(signal, rows)
    }

    async fn fetch(
        &mut self,
        signal: &str,
        ids: &[RowId],
        lock: LockMode,
    ) -> SignalBusResult<Vec<PendingEvent>> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let table = lookup(&self.tables, signal)?.clone();
        let sql = format!(
            "SELECT t.{id}::bigint AS __id, to_jsonb(t) AS __payload \
             FROM {table} AS t WHERE t.{id} = ANY($1) {order} {lock}",
            id = table.id(),
            table = table.table(),
            order = table.order_clause(None),
            lock = lock_clause(lock),
        );
        let raw: Vec<i64> = ids.iter().map(RowId::value).collect();
        let rows = sqlx::query(&sql)
            .bind(raw)
            .fetch_all(&mut *self.tx)
            .await?;
        decode_rows(signal, rows)
    }

    async fn delete(&mut self, signal: &str, ids: &[RowId]) -> SignalBusResult<u64> {
        if ids.is_empty() {
            return Ok(0);
        }
        let table = lookup(&self.tables, signal)?.clone();
        let sql = format!(
            "DELETE FROM {table} WHERE {id} = ANY($1)",
            table = table.table(),
            id = table.id(),
        );
        let raw: Vec<i64> = ids.iter().map(RowId::value).collect();
        let done = sqlx::query(&sql).bind(raw).execute(&mut *self.tx).await?;
        Ok(done.rows_affected())
    }

    async fn commit(self: Box<Self>) -> SignalBusResult<()> {
        self.tx.commit().await?;
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> SignalBusResult<()> {
        self.tx.rollback().await?;
        Ok(())
    }
}

/// 主键键集分页扫描器
pub struct PgKeysetScanner {
    pool: PgPool,
    tables: Arc<HashMap<String, PgTable>>,
    rows_per_batch: usize,
}

impl PgKeysetScanner {
    pub fn new(store: &PgOutboxStore, rows_per_batch: usize) -> Self {
        Self {
            pool: store.pool.clone(),
            tables: store.tables.clone(),
            rows_per_batch: rows_per_batch.max(1),
        }
    }
}

async fn next_page(
    pool: PgPool,
    sql: String,
    limit: i64,
    cursor: Option<i64>,
) -> SignalBusResult<Option<(Vec<RowId>, Option<i64>)>> {
    let Some(after) = cursor else {
        return Ok(None);
    };
    let ids: Vec<i64> = sqlx::query_scalar(&sql)
        .bind(after)
        .bind(limit)
        .fetch_all(&pool)
        .await?;
    if ids.is_empty() {
        return Ok(None);
    }
    let next = if (ids.len() as i64) < limit {
        None
    } else {
        ids.last().copied()
    };
    Ok(Some((ids.into_iter().map(RowId::new).collect(), next)))
}

#[async_trait]
impl BatchScanner for PgKeysetScanner {
    async fn scan(
        &self,
        signal: &str,
    ) -> SignalBusResult<BoxStream<'static, SignalBusResult<Vec<RowId>>>> {
        let table = lookup(&self.tables, signal)?;
        let sql = format!(
            "SELECT {id}::bigint FROM {table} WHERE {id} > $1 ORDER BY {id} LIMIT $2",
            id = table.id(),
            table = table.table(),
        );
        let pool = self.pool.clone();
        let limit = self.rows_per_batch as i64;
        let pages = stream::try_unfold(Some(i64::MIN), move |cursor| {
            next_page(pool.clone(), sql.clone(), limit, cursor)
        });
        Ok(pages.boxed())
    }
}
