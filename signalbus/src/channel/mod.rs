//! 可靠投递通道（channel）
//!
//! 在消息代理之上提供带确认的发布与消费：
//! - `BrokerConnector` / `BrokerLink`：与具体代理（AMQP、内存等）对接的最小协议；
//! - `DeliveryChannel`：状态机，负责发布确认、超时、断线检测与带退避的自动重连；
//! - `Consumption` / `AckHandle`：惰性消费序列与按连接代数失效的确认句柄；
//! - `Consumer`：把消费序列交给应用处理器，并按结果确认或拒绝；
//! - `InMemoryBroker`：带故障注入的内存代理，用于测试与本地开发。
//!
pub mod broker;
pub mod consumer;
pub mod delivery;
pub mod memory;
pub mod message;

pub use broker::{BrokerConnector, BrokerLink, Confirmation, RawDelivery};
pub use consumer::{Consumer, ConsumerConfig, MessageProcessor};
pub use delivery::{
    AckHandle, ChannelConfig, ChannelState, Consumption, Delivery, DeliveryChannel,
};
pub use memory::{InMemoryBroker, PublishFault};
pub use message::Message;

use crate::error::SignalBusResult;
use async_trait::async_trait;

/// 发布者：`Signal::send_one/send_many` 通过它发布消息
///
/// 返回 `Ok` 即代表代理已确认接收。
#[async_trait]
pub trait Publisher: Send {
    async fn publish(&mut self, message: Message) -> SignalBusResult<()>;
}
