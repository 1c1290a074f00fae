//! 事件总线
//!
//! 单一FIFO队列，一个消费者。消费者以有限超时等待下一个事件，
//! 队列空闲时也能定期醒来做其他工作。

use std::sync::Arc;
use std::time::Duration;

use pipeline_core::Clock;
use pipeline_domain::{Event, EventPayload};
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// 一次等待的结果
#[derive(Debug)]
pub enum Received {
    Event(Event),
    Timeout,
    /// 所有发布端都已释放
    Closed,
}

pub fn channel(clock: Arc<dyn Clock>) -> (EventPublisher, EventReceiver) {
    let (tx, rx) = mpsc::unbounded_channel();
    (EventPublisher { tx, clock }, EventReceiver { rx })
}

/// 事件发布端，可克隆
#[derive(Clone)]
pub struct EventPublisher {
    tx: mpsc::UnboundedSender<Event>,
    clock: Arc<dyn Clock>,
}

impl EventPublisher {
    /// 发布事件；接收端已关闭时返回 false
    pub fn publish(&self, payload: EventPayload) -> bool {
        let event = Event::new(payload, self.clock.now());
        debug!(event_type = event.event_type(), event_id = %event.id, "发布事件");
        match self.tx.send(event) {
            Ok(()) => true,
            Err(e) => {
                warn!(event_type = e.0.event_type(), "事件总线已关闭，事件被丢弃");
                false
            }
        }
    }
}

pub struct EventReceiver {
    rx: mpsc::UnboundedReceiver<Event>,
}

impl EventReceiver {
    pub async fn next(&mut self, wait: Duration) -> Received {
        match tokio::time::timeout(wait, self.rx.recv()).await {
            Ok(Some(event)) => Received::Event(event),
            Ok(None) => Received::Closed,
            Err(_) => Received::Timeout,
        }
    }

    /// 取出当前队列中剩余的全部事件，不等待
    pub fn drain(&mut self) -> Vec<Event> {
        let mut events = Vec::new();
        while let Ok(event) = self.rx.try_recv() {
            events.push(event);
        }
        events
    }
}
