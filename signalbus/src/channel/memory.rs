//! 内存版消息代理（InMemoryBroker）
//!
//! 满足 `BrokerConnector` / `BrokerLink` 协议的轻量实现：
//! - 按 routing key 路由到同名队列，发布即确认；
//! - 未确认消息在连接断开时重新入队（标记 redelivered）；
//! - 拒绝且不重新入队的消息进入死信列表；
//! - 故障注入：离线、断开全部连接、指定第 N 次发布的故障。
//!
//! 典型用途：测试环境、示例与本地开发。
//!
use super::broker::{BrokerConnector, BrokerLink, Confirmation, RawDelivery};
use super::Message;
use crate::error::{SignalBusError, SignalBusResult};
use async_trait::async_trait;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::Notify;

/// 针对某一次发布注入的故障
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PublishFault {
    /// 连接在确认前断开
    DropConnection,
    /// 永远不返回确认
    Hang,
    Nack(String),
    Return(String),
}

struct Queued {
    message: Message,
    redelivered: bool,
}

struct BrokerState {
    online: bool,
    queues: HashMap<String, VecDeque<Queued>>,
    published: Vec<Message>,
    dead_letters: Vec<Message>,
    live_links: HashSet<u64>,
    unacked: HashMap<(u64, u64), (String, Message)>,
    next_link: u64,
    connect_attempts: usize,
    publish_attempts: usize,
    faults: HashMap<usize, PublishFault>,
}

impl BrokerState {
    fn kill_link(&mut self, link: u64) {
        if !self.live_links.remove(&link) {
            return;
        }
        let mut orphaned: Vec<(u64, String, Message)> = self
            .unacked
            .iter()
            .filter(|((l, _), _)| *l == link)
            .map(|((_, tag), (queue, msg))| (*tag, queue.clone(), msg.clone()))
            .collect();
        // 按投递顺序倒序放回队首，保持原有次序
        orphaned.sort_by_key(|(tag, _, _)| std::cmp::Reverse(*tag));
        for (tag, queue, message) in orphaned {
            self.unacked.remove(&(link, tag));
            self.queues.entry(queue).or_default().push_front(Queued {
                message,
                redelivered: true,
            });
        }
    }

    fn ensure_live(&self, link: u64) -> SignalBusResult<()> {
        if self.online && self.live_links.contains(&link) {
            Ok(())
        } else {
            Err(SignalBusError::connection("connection to broker lost"))
        }
    }
}

#[derive(Clone)]
pub struct InMemoryBroker {
    state: Arc<Mutex<BrokerState>>,
    notify: Arc<Notify>,
}

impl Default for InMemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryBroker {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(BrokerState {
                online: true,
                queues: HashMap::new(),
                published: Vec::new(),
                dead_letters: Vec::new(),
                live_links: HashSet::new(),
                unacked: HashMap::new(),
                next_link: 0,
                connect_attempts: 0,
                publish_attempts: 0,
                faults: HashMap::new(),
            })),
            notify: Arc::new(Notify::new()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, BrokerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// 离线时新连接失败，已有连接全部断开
    pub fn set_online(&self, online: bool) {
        let mut state = self.lock();
        state.online = online;
        if !online {
            let links: Vec<u64> = state.live_links.iter().copied().collect();
            for link in links {
                state.kill_link(link);
            }
        }
        drop(state);
        self.notify.notify_waiters();
    }

    pub fn disconnect_all(&self) {
        let mut state = self.lock();
        let links: Vec<u64> = state.live_links.iter().copied().collect();
        for link in links {
            state.kill_link(link);
        }
        drop(state);
        self.notify.notify_waiters();
    }

    /// 第 `nth` 次发布尝试（从 1 开始，跨连接累计）触发 `fault`
    pub fn fault_on_publish(&self, nth: usize, fault: PublishFault) {
        self.lock().faults.insert(nth, fault);
    }

    /// 直接向队列放入一条消息
    pub fn push(&self, queue: &str, message: Message) {
        self.lock()
            .queues
            .entry(queue.to_string())
            .or_default()
            .push_back(Queued {
                message,
                redelivered: false,
            });
        self.notify.notify_waiters();
    }

    /// 已确认的发布（按确认顺序）
    pub fn published(&self) -> Vec<Message> {
        self.lock().published.clone()
    }

    pub fn published_ids(&self) -> Vec<String> {
        self.lock()
            .published
            .iter()
            .map(|m| m.message_id().to_string())
            .collect()
    }

    pub fn queue_len(&self, queue: &str) -> usize {
        self.lock().queues.get(queue).map_or(0, VecDeque::len)
    }

    pub fn dead_letters(&self) -> Vec<Message> {
        self.lock().dead_letters.clone()
    }

    pub fn unacked_count(&self) -> usize {
        self.lock().unacked.len()
    }

    pub fn connect_attempts(&self) -> usize {
        self.lock().connect_attempts
    }

    pub fn publish_attempts(&self) -> usize {
        self.lock().publish_attempts
    }
}

#[async_trait]
impl BrokerConnector for InMemoryBroker {
    async fn connect(&self) -> SignalBusResult<Box<dyn BrokerLink>> {
        let mut state = self.lock();
        state.connect_attempts += 1;
        if !state.online {
            return Err(SignalBusError::connection("broker unreachable"));
        }
        state.next_link += 1;
        let id = state.next_link;
        state.live_links.insert(id);
        Ok(Box::new(MemoryLink {
            id,
            next_tag: 0,
            state: self.state.clone(),
            notify: self.notify.clone(),
        }))
    }
}

struct MemoryLink {
    id: u64,
    next_tag: u64,
    state: Arc<Mutex<BrokerState>>,
    notify: Arc<Notify>,
}

impl MemoryLink {
    fn lock(&self) -> MutexGuard<'_, BrokerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn pop(&mut self, queue: &str) -> SignalBusResult<Option<RawDelivery>> {
        let state = self.state.clone();
        let mut state = state.lock().unwrap_or_else(PoisonError::into_inner);
        state.ensure_live(self.id)?;
        let Some(queued) = state.queues.get_mut(queue).and_then(VecDeque::pop_front) else {
            return Ok(None);
        };
        self.next_tag += 1;
        let tag = self.next_tag;
        state
            .unacked
            .insert((self.id, tag), (queue.to_string(), queued.message.clone()));
        Ok(Some(RawDelivery {
            delivery_tag: tag,
            redelivered: queued.redelivered,
            message: queued.message,
        }))
    }
}

#[async_trait]
impl BrokerLink for MemoryLink {
    async fn publish(&mut self, message: &Message) -> SignalBusResult<Confirmation> {
        let hang = {
            let mut state = self.lock();
            state.ensure_live(self.id)?;
            state.publish_attempts += 1;
            let attempt = state.publish_attempts;
            match state.faults.remove(&attempt) {
                Some(PublishFault::DropConnection) => {
                    state.kill_link(self.id);
                    return Err(SignalBusError::connection("connection dropped during publish"));
                }
                Some(PublishFault::Nack(reason)) => return Ok(Confirmation::Nack { reason }),
                Some(PublishFault::Return(reason)) => {
                    return Ok(Confirmation::Returned { reason });
                }
                Some(PublishFault::Hang) => true,
                None => {
                    state.published.push(message.clone());
                    state
                        .queues
                        .entry(message.routing_key().to_string())
                        .or_default()
                        .push_back(Queued {
                            message: message.clone(),
                            redelivered: false,
                        });
                    false
                }
            }
        };
        if hang {
            std::future::pending::<()>().await;
        }
        self.notify.notify_waiters();
        Ok(Confirmation::Ack)
    }

    async fn next_delivery(
        &mut self,
        queue: &str,
        wait: Duration,
    ) -> SignalBusResult<Option<RawDelivery>> {
        let notify = self.notify.clone();
        // 先创建等待者再检查队列，避免错过检查与等待之间的通知
        let notified = notify.notified();
        if let Some(delivery) = self.pop(queue)? {
            return Ok(Some(delivery));
        }
        let _ = tokio::time::timeout(wait, notified).await;
        self.pop(queue)
    }

    async fn ack(&mut self, delivery_tag: u64) -> SignalBusResult<()> {
        let mut state = self.lock();
        state.ensure_live(self.id)?;
        match state.unacked.remove(&(self.id, delivery_tag)) {
            Some(_) => Ok(()),
            None => Err(SignalBusError::delivery(format!(
                "unknown delivery tag {delivery_tag}"
            ))),
        }
    }

    async fn nack(&mut self, delivery_tag: u64, requeue: bool) -> SignalBusResult<()> {
        {
            let mut state = self.lock();
            state.ensure_live(self.id)?;
            let Some((queue, message)) = state.unacked.remove(&(self.id, delivery_tag)) else {
                return Err(SignalBusError::delivery(format!(
                    "unknown delivery tag {delivery_tag}"
                )));
            };
            if requeue {
                state.queues.entry(queue).or_default().push_front(Queued {
                    message,
                    redelivered: true,
                });
            } else {
                state.dead_letters.push(message);
            }
        }
        self.notify.notify_waiters();
        Ok(())
    }

    async fn close(&mut self) -> SignalBusResult<()> {
        self.lock().kill_link(self.id);
        self.notify.notify_waiters();
        Ok(())
    }
}

impl Drop for MemoryLink {
    fn drop(&mut self) {
        self.lock().kill_link(self.id);
        self.notify.notify_waiters();
    }
}
