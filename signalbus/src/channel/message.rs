//! 消息模型
//!
use crate::error::SignalBusResult;
use crate::signal::PendingEvent;
use bon::Builder;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// 发往代理的一条消息
#[derive(Debug, Clone, PartialEq, Builder, Serialize, Deserialize)]
pub struct Message {
    /// 去重标识：同一行重复投递时保持不变
    #[builder(into)]
    message_id: String,
    #[builder(into, default = String::new())]
    exchange: String,
    #[builder(into)]
    routing_key: String,
    #[builder(into, default = String::from("application/json"))]
    content_type: String,
    #[builder(default)]
    headers: BTreeMap<String, String>,
    #[builder(into)]
    body: Vec<u8>,
    #[builder(default = Utc::now())]
    created_at: DateTime<Utc>,
}

impl Message {
    /// 以 JSON 负载构造消息，`message_id` 取行的去重键
    pub fn for_event<T: Serialize + ?Sized>(
        event: &PendingEvent,
        exchange: impl Into<String>,
        routing_key: impl Into<String>,
        payload: &T,
    ) -> SignalBusResult<Self> {
        Ok(Message::builder()
            .message_id(event.dedup_key())
            .exchange(exchange)
            .routing_key(routing_key)
            .body(serde_json::to_vec(payload)?)
            .headers(BTreeMap::from([(
                "signal".to_string(),
                event.signal().to_string(),
            )]))
            .build())
    }

    pub fn message_id(&self) -> &str {
        &self.message_id
    }

    pub fn exchange(&self) -> &str {
        &self.exchange
    }

    pub fn routing_key(&self) -> &str {
        &self.routing_key
    }

    pub fn content_type(&self) -> &str {
        &self.content_type
    }

    pub fn headers(&self) -> &BTreeMap<String, String> {
        &self.headers
    }

    pub fn header(&self, key: &str) -> Option<&str> {
        self.headers.get(key).map(String::as_str)
    }

    pub fn body(&self) -> &[u8] {
        &self.body
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn decode<T: serde::de::DeserializeOwned>(&self) -> SignalBusResult<T> {
        Ok(serde_json::from_slice(&self.body)?)
    }
}
