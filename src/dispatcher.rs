use crate::bus::EventBus;
use crate::event::{Event, EventKind, parse_event_type};
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// 把转发来的上报帧按到达顺序发布到总线
///
/// 单消费者，保证同一连接的事件不会乱序。
pub struct EventPump {
    bus: EventBus,
    rx: mpsc::UnboundedReceiver<Value>,
}

impl EventPump {
    pub fn new(bus: EventBus, rx: mpsc::UnboundedReceiver<Value>) -> Self {
        Self { bus, rx }
    }

    /// 发布一帧；无法识别的帧返回 None
    pub async fn dispatch(bus: &EventBus, frame: Value) -> Option<Arc<Event>> {
        let Some(kind) = parse_event_type(&frame) else {
            debug!(target: "Dispatcher", "忽略未知上报: {}", frame);
            return None;
        };

        if kind == EventKind::Meta {
            debug!(
                target: "Dispatcher",
                "元事件: {}",
                frame.get("meta_event_type").and_then(serde_json::Value::as_str).unwrap_or("?")
            );
        }

        let event = Arc::new(Event::new(kind.bus_key(), frame));
        bus.publish(&event).await;

        for err in event.exceptions() {
            warn!(target: "Dispatcher", "{} 处理异常: {}", event.event_type(), err);
        }
        Some(event)
    }

    pub async fn run(mut self) {
        while let Some(frame) = self.rx.recv().await {
            Self::dispatch(&self.bus, frame).await;
        }
        debug!(target: "Dispatcher", "事件通道关闭，分发结束");
    }
}
