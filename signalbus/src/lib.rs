//! 事务性发件箱基础库（signalbus）
//!
//! 业务事务中写入“信号行”，提交后再把这些行发布到消息代理，
//! 确认成功后在同一事务内删除，从而获得至少一次（at-least-once）投递：
//! - 信号类型与描述（`signal`）及显式注册表（`registry`）
//! - 发件箱存储接口与实现（`store`）、批量扫描器（`scanner`）
//! - 可靠投递通道：确认发布、自动重连、消费与确认（`channel`）
//! - 刷新引擎：auto / all / ordered / scanner 四种刷新方式（`flush`）
//! - 提交后自动刷新的工作单元（`autoflush`）
//! - 命令入口与周期刷新（`bus`）
//!
//! 典型用法：
//! 1. 为每种信号实现 `Signal`（可借助 `#[signal]` 宏生成描述）；
//! 2. 构建 `SignalRegistry`、`OutboxStore` 与 `DeliveryChannel`；
//! 3. 用 `FlushEngine` 组装刷新引擎，再由 `SignalBus` 暴露命令；
//! 4. 业务代码通过 `UnitOfWork` 写入信号行，提交后自动刷新。
//!
pub mod autoflush;
pub mod bus;
pub mod channel;
pub mod error;
pub mod flush;
pub mod registry;
pub mod retry;
pub mod scanner;
pub mod signal;
pub mod store;

pub use error::{FlushError, SignalBusError, SignalBusResult};

// 允许在本 crate 内部通过 ::signalbus 进行自引用，
// 以便过程宏在本 crate 的单元测试中也能解析到 ::signalbus 路径。
extern crate self as signalbus;
