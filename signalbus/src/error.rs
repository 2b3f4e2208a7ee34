//! 统一错误定义
//!
//! 按消息代理、数据库、信号类型与序列化分组，
//! 各实现层统一转换为 `SignalBusError`；刷新失败额外携带已发送数量（`FlushError`）。
//!
use std::time::Duration;
use thiserror::Error;

/// 统一错误类型
#[non_exhaustive]
#[derive(Debug, Error)]
pub enum SignalBusError {
    // --- 消息代理 ---
    #[error("connection error: {reason}")]
    Connection { reason: String },
    #[error("timeout: operation={operation}, after={after:?}")]
    Timeout {
        operation: &'static str,
        after: Duration,
    },
    #[error("delivery error: {reason}")]
    Delivery { reason: String },
    #[error("consumption terminated")]
    TerminatedConsumption,
    #[error("channel closed")]
    ChannelClosed,

    // --- 数据库 ---
    #[error("serialization conflict: {reason}")]
    SerializationConflict { reason: String },
    #[error("database error: {reason}")]
    Database { reason: String },
    /// 唯一约束等完整性冲突；默认不重试，见 `autoflush::retry_on_integrity_error`
    #[error("integrity violation: {reason}")]
    IntegrityViolation { reason: String },

    // --- 信号类型/发送 ---
    #[error("unknown signal: {name}")]
    UnknownSignal { name: String },
    #[error("signal {name} has no order_by configured")]
    OrderingNotConfigured { name: String },
    #[error("invalid signal descriptor: {reason}")]
    InvalidDescriptor { reason: String },
    #[error("duplicate signal: {name}")]
    DuplicateSignal { name: String },
    #[error("send failed: signal={signal}, reason={reason}")]
    Send { signal: String, reason: String },
    #[error("message processing failed: {reason}")]
    Processing { reason: String },

    // --- 序列化 ---
    #[error("serialization error: {source}")]
    Serde {
        #[from]
        source: serde_json::Error,
    },
}

impl SignalBusError {
    pub fn connection(reason: impl Into<String>) -> Self {
        Self::Connection {
            reason: reason.into(),
        }
    }

    pub fn delivery(reason: impl Into<String>) -> Self {
        Self::Delivery {
            reason: reason.into(),
        }
    }

    pub fn conflict(reason: impl Into<String>) -> Self {
        Self::SerializationConflict {
            reason: reason.into(),
        }
    }

    pub fn database(reason: impl Into<String>) -> Self {
        Self::Database {
            reason: reason.into(),
        }
    }

    pub fn integrity(reason: impl Into<String>) -> Self {
        Self::IntegrityViolation {
            reason: reason.into(),
        }
    }

    pub fn invalid_descriptor(reason: impl Into<String>) -> Self {
        Self::InvalidDescriptor {
            reason: reason.into(),
        }
    }

    pub fn send(signal: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Send {
            signal: signal.into(),
            reason: reason.into(),
        }
    }

    /// 瞬时故障：连接、超时与序列化冲突
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Connection { .. } | Self::Timeout { .. } | Self::SerializationConflict { .. }
        )
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::SerializationConflict { .. })
    }

    pub fn is_integrity_violation(&self) -> bool {
        matches!(self, Self::IntegrityViolation { .. })
    }

    pub fn is_connection(&self) -> bool {
        matches!(self, Self::Connection { .. })
    }
}

/// 统一 Result 类型别名
pub type SignalBusResult<T> = Result<T, SignalBusError>;

/// 刷新失败：`sent` 为失败前已确认并删除的行数
#[derive(Debug, Error)]
#[error("flush of {signal} failed after {sent} sent: {source}")]
pub struct FlushError {
    pub signal: String,
    pub sent: usize,
    #[source]
    pub source: SignalBusError,
}

impl FlushError {
    pub fn new(signal: impl Into<String>, sent: usize, source: SignalBusError) -> Self {
        Self {
            signal: signal.into(),
            sent,
            source,
        }
    }

    pub fn is_retryable(&self) -> bool {
        self.source.is_retryable()
    }
}

// 40001 serialization_failure / 40P01 deadlock_detected 视为可重试冲突；
// 23505 unique_violation 单独归类，由调用方决定是否重试
#[cfg(feature = "postgres")]
impl From<sqlx::Error> for SignalBusError {
    fn from(err: sqlx::Error) -> Self {
        if let sqlx::Error::Database(db) = &err {
            match db.code().as_deref() {
                Some("40001") | Some("40P01") => {
                    return SignalBusError::conflict(db.message().to_string());
                }
                Some("23505") => return SignalBusError::integrity(db.message().to_string()),
                _ => {}
            }
        }
        SignalBusError::database(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retryable_classification() {
        assert!(SignalBusError::connection("reset").is_retryable());
        assert!(SignalBusError::conflict("40001").is_retryable());
        assert!(
            SignalBusError::Timeout {
                operation: "publish",
                after: Duration::from_secs(5),
            }
            .is_retryable()
        );
        assert!(!SignalBusError::delivery("nack").is_retryable());
        assert!(!SignalBusError::send("transfer", "bad payload").is_retryable());
        assert!(!SignalBusError::TerminatedConsumption.is_retryable());
        assert!(!SignalBusError::integrity("duplicate key").is_retryable());
        assert!(SignalBusError::integrity("duplicate key").is_integrity_violation());
    }

    #[test]
    fn flush_error_keeps_sent_count() {
        let err = FlushError::new("transfer", 2, SignalBusError::connection("dropped"));
        assert_eq!(err.sent, 2);
        assert!(err.is_retryable());
        assert_eq!(
            err.to_string(),
            "flush of transfer failed after 2 sent: connection error: dropped"
        );
    }
}
