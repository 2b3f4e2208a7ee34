//! 信号类型模型
//!
//! - `RowId`：发件箱行标识（数据库分配，单表内唯一）
//! - `PendingEvent`：一条待发送的信号行
//! - `SignalDescriptor`：每种信号的静态描述（批量大小、是否自动刷新、排序键）
//! - `Signal`：把行转换为消息并通过 `Publisher` 发送
//!
use crate::channel::Publisher;
use crate::error::{SignalBusError, SignalBusResult};
use async_trait::async_trait;
use bon::Builder;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::cmp::Ordering;
use std::fmt;

/// 发件箱行标识
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RowId(i64);

impl RowId {
    pub const fn new(value: i64) -> Self {
        Self(value)
    }

    pub const fn value(&self) -> i64 {
        self.0
    }
}

impl From<i64> for RowId {
    fn from(value: i64) -> Self {
        Self(value)
    }
}

impl fmt::Display for RowId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// 一条待发送的信号行
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingEvent {
    signal: String,
    id: RowId,
    payload: Value,
}

impl PendingEvent {
    pub fn new(signal: impl Into<String>, id: RowId, payload: Value) -> Self {
        Self {
            signal: signal.into(),
            id,
            payload,
        }
    }

    pub fn signal(&self) -> &str {
        &self.signal
    }

    pub fn id(&self) -> RowId {
        self.id
    }

    pub fn payload(&self) -> &Value {
        &self.payload
    }

    /// 按列名取值；`id` 列总是解析为行标识
    pub fn column(&self, name: &str) -> Value {
        if name == "id" {
            return Value::from(self.id.value());
        }
        self.payload.get(name).cloned().unwrap_or(Value::Null)
    }

    /// 同一行重复投递时保持不变的去重键
    pub fn dedup_key(&self) -> String {
        format!("{}:{}", self.signal, self.id)
    }

    /// 将负载反序列化为业务类型
    pub fn decode<T: serde::de::DeserializeOwned>(&self) -> SignalBusResult<T> {
        Ok(serde_json::from_value(self.payload.clone())?)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    #[default]
    Asc,
    Desc,
}

/// 排序列
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OrderColumn {
    column: String,
    direction: Direction,
}

impl OrderColumn {
    pub fn asc(column: impl Into<String>) -> Self {
        Self {
            column: column.into(),
            direction: Direction::Asc,
        }
    }

    pub fn desc(column: impl Into<String>) -> Self {
        Self {
            column: column.into(),
            direction: Direction::Desc,
        }
    }

    pub fn column(&self) -> &str {
        &self.column
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }
}

/// 有序刷新使用的排序键（按列优先级）
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OrderBy(Vec<OrderColumn>);

impl OrderBy {
    pub fn new(columns: Vec<OrderColumn>) -> Self {
        Self(columns)
    }

    /// 解析形如 `"created_at desc, id"` 的排序文本
    pub fn parse(text: &str) -> SignalBusResult<Self> {
        let mut columns = Vec::new();
        for part in text.split(',') {
            let mut words = part.split_whitespace();
            let Some(column) = words.next() else {
                return Err(SignalBusError::invalid_descriptor(format!(
                    "empty column in order_by \"{text}\""
                )));
            };
            let direction = match words.next().map(str::to_ascii_lowercase).as_deref() {
                None | Some("asc") => Direction::Asc,
                Some("desc") => Direction::Desc,
                Some(other) => {
                    return Err(SignalBusError::invalid_descriptor(format!(
                        "unknown direction \"{other}\" in order_by \"{text}\""
                    )));
                }
            };
            if words.next().is_some() {
                return Err(SignalBusError::invalid_descriptor(format!(
                    "malformed order_by \"{text}\""
                )));
            }
            columns.push(OrderColumn {
                column: column.to_string(),
                direction,
            });
        }
        let order_by = Self(columns);
        order_by.validate()?;
        Ok(order_by)
    }

    pub fn columns(&self) -> &[OrderColumn] {
        &self.0
    }

    pub fn validate(&self) -> SignalBusResult<()> {
        if self.0.is_empty() {
            return Err(SignalBusError::invalid_descriptor("order_by has no columns"));
        }
        for c in &self.0 {
            if !is_valid_identifier(&c.column) {
                return Err(SignalBusError::invalid_descriptor(format!(
                    "invalid order_by column \"{}\"",
                    c.column
                )));
            }
        }
        Ok(())
    }

    /// 按排序键比较两行；全部列相等时以行标识兜底，保证全序
    pub fn compare(&self, a: &PendingEvent, b: &PendingEvent) -> Ordering {
        for c in &self.0 {
            let ord = compare_json(&a.column(&c.column), &b.column(&c.column));
            let ord = match c.direction {
                Direction::Asc => ord,
                Direction::Desc => ord.reverse(),
            };
            if ord != Ordering::Equal {
                return ord;
            }
        }
        a.id.cmp(&b.id)
    }
}

impl fmt::Display for OrderBy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, c) in self.0.iter().enumerate() {
            if i > 0 {
                f.write_str(", ")?;
            }
            match c.direction {
                Direction::Asc => write!(f, "{}", c.column)?,
                Direction::Desc => write!(f, "{} desc", c.column)?,
            }
        }
        Ok(())
    }
}

fn json_rank(v: &Value) -> u8 {
    match v {
        Value::Null => 0,
        Value::Bool(_) => 1,
        Value::Number(_) => 2,
        Value::String(_) => 3,
        Value::Array(_) => 4,
        Value::Object(_) => 5,
    }
}

fn compare_json(a: &Value, b: &Value) -> Ordering {
    match (a, b) {
        (Value::Bool(x), Value::Bool(y)) => x.cmp(y),
        (Value::Number(x), Value::Number(y)) => match (x.as_i64(), y.as_i64()) {
            (Some(x), Some(y)) => x.cmp(&y),
            _ => x
                .as_f64()
                .partial_cmp(&y.as_f64())
                .unwrap_or(Ordering::Equal),
        },
        (Value::String(x), Value::String(y)) => x.cmp(y),
        _ => json_rank(a).cmp(&json_rank(b)),
    }
}

/// SQL 标识符校验：字母或下划线开头，仅含字母、数字、下划线
pub fn is_valid_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

/// 信号类型描述
#[derive(Debug, Clone, PartialEq, Eq, Builder)]
pub struct SignalDescriptor {
    #[builder(into)]
    name: String,
    /// 单个批次的最大行数（>= 1）
    #[builder(default = 1)]
    burst_count: usize,
    /// 提交后是否自动刷新本事务新增的行
    #[builder(default = true)]
    autoflush: bool,
    /// 有序刷新的排序键；未配置时不支持 ordered 模式
    order_by: Option<OrderBy>,
}

impl SignalDescriptor {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn burst_count(&self) -> usize {
        self.burst_count
    }

    pub fn autoflush(&self) -> bool {
        self.autoflush
    }

    pub fn order_by(&self) -> Option<&OrderBy> {
        self.order_by.as_ref()
    }

    pub fn validate(&self) -> SignalBusResult<()> {
        if !is_valid_identifier(&self.name) {
            return Err(SignalBusError::invalid_descriptor(format!(
                "invalid signal name \"{}\"",
                self.name
            )));
        }
        if self.burst_count == 0 {
            return Err(SignalBusError::invalid_descriptor(format!(
                "burst_count of {} must be at least 1",
                self.name
            )));
        }
        if let Some(order_by) = &self.order_by {
            order_by.validate()?;
        }
        Ok(())
    }

    /// 以配置项覆盖描述
    pub fn with_options(&self, options: &SignalOptions) -> SignalBusResult<Self> {
        let order_by = match &options.order_by {
            Some(text) => Some(OrderBy::parse(text)?),
            None => self.order_by.clone(),
        };
        let descriptor = Self {
            name: self.name.clone(),
            burst_count: options.burst_count,
            autoflush: options.autoflush,
            order_by,
        };
        descriptor.validate()?;
        Ok(descriptor)
    }
}

/// 注册配置项（可从配置文件反序列化）
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignalOptions {
    #[serde(default = "default_burst_count")]
    pub burst_count: usize,
    #[serde(default = "default_autoflush")]
    pub autoflush: bool,
    #[serde(default)]
    pub order_by: Option<String>,
}

impl Default for SignalOptions {
    fn default() -> Self {
        Self {
            burst_count: default_burst_count(),
            autoflush: default_autoflush(),
            order_by: None,
        }
    }
}

fn default_burst_count() -> usize {
    1
}

fn default_autoflush() -> bool {
    true
}

/// 静态描述（由 `#[signal]` 宏生成）
pub trait DescribeSignal {
    const NAME: &'static str;

    fn describe() -> SignalDescriptor;
}

/// 信号类型：把待发送行转换为消息并发布
///
/// `send_many` 仅在批次多于一行时被调用，默认逐条调用 `send_one`。
#[async_trait]
pub trait Signal: Send + Sync {
    fn descriptor(&self) -> SignalDescriptor;

    async fn send_one(
        &self,
        publisher: &mut dyn Publisher,
        event: &PendingEvent,
    ) -> SignalBusResult<()>;

    async fn send_many(
        &self,
        publisher: &mut dyn Publisher,
        events: &[PendingEvent],
    ) -> SignalBusResult<()> {
        for event in events {
            self.send_one(publisher, event).await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn row(id: i64, payload: Value) -> PendingEvent {
        PendingEvent::new("transfer", RowId::new(id), payload)
    }

    #[test]
    fn order_by_parses_directions() {
        let ob = OrderBy::parse("created_at desc, id").unwrap();
        assert_eq!(ob.columns().len(), 2);
        assert_eq!(ob.columns()[0].column(), "created_at");
        assert_eq!(ob.columns()[0].direction(), Direction::Desc);
        assert_eq!(ob.columns()[1].direction(), Direction::Asc);
        assert_eq!(ob.to_string(), "created_at desc, id");
    }

    #[test]
    fn order_by_rejects_bad_input() {
        assert!(OrderBy::parse("").is_err());
        assert!(OrderBy::parse("a sideways").is_err());
        assert!(OrderBy::parse("drop table; --").is_err());
        assert!(OrderBy::parse("a, , b").is_err());
    }

    #[test]
    fn compare_uses_columns_then_id() {
        let ob = OrderBy::parse("seqnum desc").unwrap();
        let a = row(1, json!({"seqnum": 5}));
        let b = row(2, json!({"seqnum": 9}));
        let c = row(3, json!({"seqnum": 9}));
        let mut rows = vec![a.clone(), c.clone(), b.clone()];
        rows.sort_by(|x, y| ob.compare(x, y));
        assert_eq!(rows, vec![b, c, a]);
    }

    #[test]
    fn descriptor_defaults_and_validation() {
        let d = SignalDescriptor::builder().name("transfer").build();
        assert_eq!(d.burst_count(), 1);
        assert!(d.autoflush());
        assert!(d.order_by().is_none());
        assert!(d.validate().is_ok());

        let bad = SignalDescriptor::builder()
            .name("transfer")
            .burst_count(0)
            .build();
        assert!(matches!(
            bad.validate(),
            Err(SignalBusError::InvalidDescriptor { .. })
        ));
    }

    #[test]
    fn options_override_descriptor() {
        let d = SignalDescriptor::builder().name("transfer").build();
        let options: SignalOptions =
            serde_json::from_value(json!({"burst_count": 50, "order_by": "id"})).unwrap();
        let d = d.with_options(&options).unwrap();
        assert_eq!(d.burst_count(), 50);
        assert!(d.autoflush());
        assert_eq!(d.order_by().map(|o| o.to_string()), Some("id".to_string()));

        let zero = SignalOptions {
            burst_count: 0,
            ..Default::default()
        };
        assert!(d.with_options(&zero).is_err());
    }

    #[test]
    fn dedup_key_is_stable() {
        let e = row(42, json!({}));
        assert_eq!(e.dedup_key(), "transfer:42");
        assert_eq!(e.column("id"), json!(42));
        assert_eq!(e.column("missing"), Value::Null);
    }
}
