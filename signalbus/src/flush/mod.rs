//! 刷新子系统（flush）
//!
//! `FlushEngine` 把发件箱中的信号行按批次发送到投递通道，
//! 发送确认后在同一事务内删除。
//!
pub mod engine;

pub use engine::{FlushConfig, FlushEngine, FlushMode};
