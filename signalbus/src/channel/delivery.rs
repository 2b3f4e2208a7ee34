//! 投递通道（DeliveryChannel）
//!
//! 状态机：`Disconnected → Connecting → Ready → Publishing/Consuming → Ready`，
//! 任意状态下 I/O 故障都会回到 `Disconnected`，`close` 之后为终态 `Closed`。
//! - 发布：等待代理确认，超过 `publish_timeout` 视为失败；
//! - 重连：下一次操作前按退避策略重试连接，调用方无需手动重连；
//! - 确认句柄携带连接代数，重连后旧句柄一律失效（`Delivery` 错误）；
//! - 取消：`shutdown_token` 被取消后，消费返回 `TerminatedConsumption`。
//!
use super::broker::{BrokerConnector, BrokerLink, Confirmation};
use super::{Message, Publisher};
use crate::error::{SignalBusError, SignalBusResult};
use crate::retry::RetryPolicy;
use async_trait::async_trait;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::time;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    Disconnected,
    Connecting,
    Ready,
    Publishing,
    Consuming,
    Closed,
}

/// 通道配置
#[derive(Clone, Copy, Debug)]
pub struct ChannelConfig {
    /// 单条发布等待确认的期限
    pub publish_timeout: Duration,
    /// 连接、确认/拒绝等其它操作的期限
    pub operation_timeout: Duration,
    /// 消费时单次等待投递的时长
    pub poll_interval: Duration,
    /// 重连策略
    pub reconnect: RetryPolicy,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            publish_timeout: Duration::from_secs(5),
            operation_timeout: Duration::from_secs(10),
            poll_interval: Duration::from_secs(1),
            reconnect: RetryPolicy::reconnect(),
        }
    }
}

/// 确认句柄：仅在签发它的连接代数内有效
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct AckHandle {
    generation: u64,
    delivery_tag: u64,
}

impl AckHandle {
    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn delivery_tag(&self) -> u64 {
        self.delivery_tag
    }
}

/// 消费到的一条消息及其确认句柄
#[derive(Debug, Clone)]
pub struct Delivery {
    message: Message,
    handle: AckHandle,
    redelivered: bool,
}

impl Delivery {
    pub fn message(&self) -> &Message {
        &self.message
    }

    pub fn handle(&self) -> AckHandle {
        self.handle
    }

    pub fn redelivered(&self) -> bool {
        self.redelivered
    }

    pub fn into_message(self) -> Message {
        self.message
    }
}

pub struct DeliveryChannel {
    connector: Arc<dyn BrokerConnector>,
    link: Option<Box<dyn BrokerLink>>,
    state: ChannelState,
    generation: u64,
    connection_id: Option<Uuid>,
    outstanding: HashSet<u64>,
    config: ChannelConfig,
    shutdown: CancellationToken,
}

impl DeliveryChannel {
    pub fn new(connector: Arc<dyn BrokerConnector>, config: ChannelConfig) -> Self {
        Self {
            connector,
            link: None,
            state: ChannelState::Disconnected,
            generation: 0,
            connection_id: None,
            outstanding: HashSet::new(),
            config,
            shutdown: CancellationToken::new(),
        }
    }

    /// 使用调用方提供的取消令牌
    pub fn with_shutdown(mut self, token: CancellationToken) -> Self {
        self.shutdown = token;
        self
    }

    pub fn state(&self) -> ChannelState {
        self.state
    }

    /// 连接代数：每次成功（重）连接后加一
    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn config(&self) -> &ChannelConfig {
        &self.config
    }

    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// 显式建立连接；其它操作也会按需自动连接
    pub async fn connect(&mut self) -> SignalBusResult<()> {
        self.ensure_ready().await
    }

    async fn ensure_ready(&mut self) -> SignalBusResult<()> {
        if self.state == ChannelState::Closed {
            return Err(SignalBusError::ChannelClosed);
        }
        if self.link.is_some() {
            self.state = ChannelState::Ready;
            return Ok(());
        }

        let policy = self.config.reconnect;
        let limit = self.config.operation_timeout;
        let mut attempt = 0;
        loop {
            attempt += 1;
            if self.shutdown.is_cancelled() {
                self.state = ChannelState::Disconnected;
                return Err(SignalBusError::TerminatedConsumption);
            }
            self.state = ChannelState::Connecting;

            let outcome = match time::timeout(limit, self.connector.connect()).await {
                Ok(result) => result,
                Err(_) => Err(SignalBusError::Timeout {
                    operation: "connect",
                    after: limit,
                }),
            };

            match outcome {
                Ok(link) => {
                    let id = Uuid::new_v4();
                    self.link = Some(link);
                    self.generation += 1;
                    self.connection_id = Some(id);
                    self.outstanding.clear();
                    self.state = ChannelState::Ready;
                    info!(
                        connection = %id,
                        generation = self.generation,
                        attempt,
                        "broker channel connected"
                    );
                    return Ok(());
                }
                Err(err) => {
                    self.state = ChannelState::Disconnected;
                    if !policy.allows_retry(attempt) {
                        warn!(attempt, error = %err, "giving up connecting to broker");
                        return Err(SignalBusError::connection(format!(
                            "gave up after {attempt} attempts: {err}"
                        )));
                    }
                    let delay = policy.delay(attempt);
                    warn!(attempt, ?delay, error = %err, "broker connect failed, retrying");
                    let token = self.shutdown.clone();
                    tokio::select! {
                        _ = token.cancelled() => return Err(SignalBusError::TerminatedConsumption),
                        _ = time::sleep(delay) => {}
                    }
                }
            }
        }
    }

    fn mark_disconnected(&mut self, reason: &str) {
        if self.link.take().is_some() {
            warn!(
                connection = ?self.connection_id,
                generation = self.generation,
                pending_acks = self.outstanding.len(),
                reason,
                "broker channel lost"
            );
        }
        self.outstanding.clear();
        self.connection_id = None;
        if self.state != ChannelState::Closed {
            self.state = ChannelState::Disconnected;
        }
    }

    /// 发布一条消息并等待确认
    pub async fn publish(&mut self, message: Message) -> SignalBusResult<()> {
        self.ensure_ready().await?;
        let Some(link) = self.link.as_mut() else {
            return Err(SignalBusError::connection("channel has no link"));
        };
        self.state = ChannelState::Publishing;

        let limit = self.config.publish_timeout;
        match time::timeout(limit, link.publish(&message)).await {
            Err(_) => {
                self.mark_disconnected("publish confirmation timed out");
                Err(SignalBusError::Timeout {
                    operation: "publish",
                    after: limit,
                })
            }
            Ok(Err(err)) => {
                self.after_failure(&err);
                Err(err)
            }
            Ok(Ok(Confirmation::Ack)) => {
                self.state = ChannelState::Ready;
                debug!(message_id = message.message_id(), "publish confirmed");
                Ok(())
            }
            Ok(Ok(Confirmation::Nack { reason })) => {
                self.state = ChannelState::Ready;
                Err(SignalBusError::delivery(format!(
                    "message {} nacked by broker: {reason}",
                    message.message_id()
                )))
            }
            Ok(Ok(Confirmation::Returned { reason })) => {
                self.state = ChannelState::Ready;
                Err(SignalBusError::delivery(format!(
                    "message {} returned by broker: {reason}",
                    message.message_id()
                )))
            }
        }
    }

    fn after_failure(&mut self, err: &SignalBusError) {
        if err.is_connection() {
            self.mark_disconnected(&err.to_string());
        } else if self.state != ChannelState::Closed {
            self.state = ChannelState::Ready;
        }
    }

    /// 惰性消费序列
    pub fn consume(&mut self, queue: impl Into<String>) -> Consumption<'_> {
        Consumption {
            channel: self,
            queue: queue.into(),
        }
    }

    /// 等待至多 `wait` 获取下一条投递；期间无消息返回 `None`
    pub async fn receive(&mut self, queue: &str, wait: Duration) -> SignalBusResult<Option<Delivery>> {
        if self.shutdown.is_cancelled() {
            return Err(SignalBusError::TerminatedConsumption);
        }
        self.ensure_ready().await?;
        let token = self.shutdown.clone();
        let Some(link) = self.link.as_mut() else {
            return Err(SignalBusError::connection("channel has no link"));
        };
        self.state = ChannelState::Consuming;

        let limit = wait + self.config.operation_timeout;
        let polled = tokio::select! {
            biased;
            _ = token.cancelled() => None,
            r = time::timeout(limit, link.next_delivery(queue, wait)) => Some(r),
        };

        match polled {
            None => {
                self.state = ChannelState::Ready;
                Err(SignalBusError::TerminatedConsumption)
            }
            Some(Err(_)) => {
                self.mark_disconnected("consume timed out");
                Err(SignalBusError::Timeout {
                    operation: "consume",
                    after: limit,
                })
            }
            Some(Ok(Ok(Some(raw)))) => {
                self.state = ChannelState::Ready;
                self.outstanding.insert(raw.delivery_tag);
                debug!(
                    queue,
                    delivery_tag = raw.delivery_tag,
                    redelivered = raw.redelivered,
                    "message received"
                );
                Ok(Some(Delivery {
                    message: raw.message,
                    handle: AckHandle {
                        generation: self.generation,
                        delivery_tag: raw.delivery_tag,
                    },
                    redelivered: raw.redelivered,
                }))
            }
            Some(Ok(Ok(None))) => {
                self.state = ChannelState::Ready;
                Ok(None)
            }
            Some(Ok(Err(err))) => {
                self.after_failure(&err);
                Err(err)
            }
        }
    }

    pub async fn ack(&mut self, handle: AckHandle) -> SignalBusResult<()> {
        self.settle(handle, None).await
    }

    pub async fn nack(&mut self, handle: AckHandle, requeue: bool) -> SignalBusResult<()> {
        self.settle(handle, Some(requeue)).await
    }

    async fn settle(&mut self, handle: AckHandle, requeue: Option<bool>) -> SignalBusResult<()> {
        if handle.generation != self.generation || !self.outstanding.remove(&handle.delivery_tag) {
            debug!(
                delivery_tag = handle.delivery_tag,
                handle_generation = handle.generation,
                generation = self.generation,
                "ignoring stale ack handle"
            );
            return Err(SignalBusError::delivery(format!(
                "stale ack handle: tag {} of generation {} (current generation {})",
                handle.delivery_tag, handle.generation, self.generation
            )));
        }
        let Some(link) = self.link.as_mut() else {
            return Err(SignalBusError::delivery("channel is disconnected"));
        };

        let limit = self.config.operation_timeout;
        let operation = match requeue {
            None => link.ack(handle.delivery_tag),
            Some(requeue) => link.nack(handle.delivery_tag, requeue),
        };
        match time::timeout(limit, operation).await {
            Err(_) => {
                self.mark_disconnected("ack timed out");
                Err(SignalBusError::Timeout {
                    operation: "ack",
                    after: limit,
                })
            }
            Ok(Err(err)) => {
                self.after_failure(&err);
                Err(err)
            }
            Ok(Ok(())) => {
                debug!(delivery_tag = handle.delivery_tag, ?requeue, "delivery settled");
                Ok(())
            }
        }
    }

    /// 关闭通道（终态）
    pub async fn close(&mut self) -> SignalBusResult<()> {
        self.state = ChannelState::Closed;
        self.outstanding.clear();
        if let Some(mut link) = self.link.take() {
            link.close().await?;
        }
        info!(generation = self.generation, "broker channel closed");
        Ok(())
    }
}

#[async_trait]
impl Publisher for DeliveryChannel {
    async fn publish(&mut self, message: Message) -> SignalBusResult<()> {
        DeliveryChannel::publish(self, message).await
    }
}

/// 惰性消费序列：`next` 按需拉取，`ack/nack` 经由同一通道
pub struct Consumption<'a> {
    channel: &'a mut DeliveryChannel,
    queue: String,
}

impl Consumption<'_> {
    pub fn queue(&self) -> &str {
        &self.queue
    }

    /// 阻塞直到下一条消息、取消或故障
    pub async fn next(&mut self) -> SignalBusResult<Delivery> {
        loop {
            if let Some(delivery) = self.try_next().await? {
                return Ok(delivery);
            }
        }
    }

    /// 在一个 `poll_interval` 内无消息时返回 `None`
    pub async fn try_next(&mut self) -> SignalBusResult<Option<Delivery>> {
        let wait = self.channel.config.poll_interval;
        self.channel.receive(&self.queue, wait).await
    }

    pub async fn ack(&mut self, handle: AckHandle) -> SignalBusResult<()> {
        self.channel.ack(handle).await
    }

    pub async fn nack(&mut self, handle: AckHandle, requeue: bool) -> SignalBusResult<()> {
        self.channel.nack(handle, requeue).await
    }
}
