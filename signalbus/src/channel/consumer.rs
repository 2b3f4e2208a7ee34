//! 消费者（Consumer）
//!
//! 从队列持续拉取消息交给应用处理器，按处理结果确认：
//! - `Ok(true)`：处理成功，ack；
//! - `Ok(false)`：消息格式错误，拒绝且不重新入队（进入死信）；
//! - `Err(_)`：处理失败，重新入队并停止消费（`Processing`）。
//!
//! 消费者自身的停止令牌或通道的关闭令牌被取消时以 `TerminatedConsumption`
//! 结束；前者不影响通道，`into_channel` 取回后仍可发布。连接丢失时以
//! `Connection` 结束，调用方可再次调用 `run` 继续。
//!
//! 排空模式（draining）：连续多次空轮询后暂停消费，暂停时长逐次翻倍直至上限，
//! 收到消息后复位。
//!
use super::{DeliveryChannel, Message};
use crate::error::{SignalBusError, SignalBusResult};
use async_trait::async_trait;
use bon::Builder;
use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;
use tokio::time;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// 应用侧消息处理器
#[async_trait]
pub trait MessageProcessor: Send + Sync {
    /// 返回 `false` 表示消息格式错误、不应重投
    async fn process(&self, message: &Message) -> anyhow::Result<bool>;
}

#[async_trait]
impl<T> MessageProcessor for Arc<T>
where
    T: MessageProcessor + ?Sized,
{
    async fn process(&self, message: &Message) -> anyhow::Result<bool> {
        (**self).process(message).await
    }
}

/// 消费者配置
#[derive(Clone, Copy, Debug)]
pub struct ConsumerConfig {
    /// 是否启用排空模式
    pub draining_mode: bool,
    /// 连续空轮询多少次后进入暂停
    pub idle_polls_before_pause: u32,
    /// 首次暂停时长
    pub draining_pause: Duration,
    /// 暂停时长上限
    pub max_draining_pause: Duration,
}

impl Default for ConsumerConfig {
    fn default() -> Self {
        Self {
            draining_mode: false,
            idle_polls_before_pause: 3,
            draining_pause: Duration::from_secs(15),
            max_draining_pause: Duration::from_secs(3600),
        }
    }
}

#[derive(Builder)]
pub struct Consumer {
    channel: DeliveryChannel,
    #[builder(into)]
    queue: String,
    processor: Arc<dyn MessageProcessor>,
    #[builder(default)]
    config: ConsumerConfig,
    /// 只结束本消费者；通道的关闭令牌同样会结束消费
    #[builder(skip)]
    stop: CancellationToken,
}

impl Consumer {
    pub fn queue(&self) -> &str {
        &self.queue
    }

    pub fn channel(&self) -> &DeliveryChannel {
        &self.channel
    }

    pub fn into_channel(self) -> DeliveryChannel {
        self.channel
    }

    /// 供其它任务请求停止消费；停止后通道仍可继续发布
    pub fn stop_token(&self) -> CancellationToken {
        self.stop.clone()
    }

    pub fn stop(&self) {
        self.stop.cancel();
    }

    /// 持续消费，直到停止或出错；永不返回 `Ok`
    pub async fn run(&mut self) -> SignalBusResult<Infallible> {
        let stop = self.stop.clone();
        let processor = self.processor.clone();
        let config = self.config;
        let queue = self.queue.clone();
        let mut consumption = self.channel.consume(queue.clone());

        info!(queue = %queue, draining = config.draining_mode, "consumer started");
        let mut idle_polls = 0u32;
        let mut pause = config.draining_pause;

        loop {
            let polled = tokio::select! {
                biased;
                _ = stop.cancelled() => Err(SignalBusError::TerminatedConsumption),
                polled = consumption.try_next() => polled,
            };
            let delivery = match polled {
                Ok(Some(delivery)) => {
                    idle_polls = 0;
                    pause = config.draining_pause;
                    delivery
                }
                Ok(None) => {
                    idle_polls += 1;
                    if config.draining_mode && idle_polls >= config.idle_polls_before_pause {
                        info!(queue = %queue, ?pause, "queue drained, pausing consumption");
                        tokio::select! {
                            _ = stop.cancelled() => {
                                info!(queue = %queue, "consumer stopped");
                                return Err(SignalBusError::TerminatedConsumption);
                            }
                            _ = time::sleep(pause) => {}
                        }
                        pause = (pause * 2).min(config.max_draining_pause);
                        idle_polls = 0;
                    }
                    continue;
                }
                Err(SignalBusError::TerminatedConsumption) => {
                    info!(queue = %queue, "consumer stopped");
                    return Err(SignalBusError::TerminatedConsumption);
                }
                Err(err) => {
                    warn!(queue = %queue, error = %err, "consumer interrupted");
                    return Err(err);
                }
            };

            let handle = delivery.handle();
            let message = delivery.message();
            match processor.process(message).await {
                Ok(true) => consumption.ack(handle).await?,
                Ok(false) => {
                    warn!(
                        queue = %queue,
                        message_id = message.message_id(),
                        "rejecting malformed message"
                    );
                    consumption.nack(handle, false).await?;
                }
                Err(err) => {
                    error!(
                        queue = %queue,
                        message_id = message.message_id(),
                        error = %err,
                        "message processing failed"
                    );
                    if let Err(nack_err) = consumption.nack(handle, true).await {
                        warn!(error = %nack_err, "failed to requeue message");
                    }
                    return Err(SignalBusError::Processing {
                        reason: err.to_string(),
                    });
                }
            }
        }
    }
}
