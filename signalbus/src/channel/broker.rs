//! 代理协议（BrokerConnector / BrokerLink）
//!
//! 对接具体消息代理的最小集合：建立连接、确认发布、拉取投递、确认/拒绝、关闭。
//! 任何 I/O 故障都以 `SignalBusError::Connection` 报告，由 `DeliveryChannel` 负责重连。
//!
use super::Message;
use crate::error::SignalBusResult;
use async_trait::async_trait;
use std::time::Duration;

/// 代理对一次发布的确认结果
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Confirmation {
    Ack,
    Nack { reason: String },
    /// 消息无法路由被退回
    Returned { reason: String },
}

/// 代理侧的一次投递
#[derive(Debug, Clone)]
pub struct RawDelivery {
    pub delivery_tag: u64,
    pub redelivered: bool,
    pub message: Message,
}

/// 连接工厂
#[async_trait]
pub trait BrokerConnector: Send + Sync {
    async fn connect(&self) -> SignalBusResult<Box<dyn BrokerLink>>;
}

/// 一条已建立的连接（含通道）
#[async_trait]
pub trait BrokerLink: Send {
    /// 发布并等待代理确认
    async fn publish(&mut self, message: &Message) -> SignalBusResult<Confirmation>;

    /// 从队列取下一条投递，最多等待 `wait`；超时返回 `None`
    async fn next_delivery(
        &mut self,
        queue: &str,
        wait: Duration,
    ) -> SignalBusResult<Option<RawDelivery>>;

    async fn ack(&mut self, delivery_tag: u64) -> SignalBusResult<()>;

    async fn nack(&mut self, delivery_tag: u64, requeue: bool) -> SignalBusResult<()>;

    async fn close(&mut self) -> SignalBusResult<()>;
}

#[async_trait]
impl<T> BrokerConnector for std::sync::Arc<T>
where
    T: BrokerConnector + ?Sized,
{
    async fn connect(&self) -> SignalBusResult<Box<dyn BrokerLink>> {
        (**self).connect().await
    }
}
