use crate::error::HandlerError;
use crate::message::Segment;
use serde_json::Value;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

/// 事件命名空间
pub const EVENT_NAMESPACE: &str = "napbot";

// ================== 事件信封 ==================

/// 在总线上传递的事件
///
/// `data` 一经创建不再修改；处理器只能通过 `add_result` / `add_exception` /
/// `stop_propagation` / `intercept` 改变信封状态。
pub struct Event {
    event_type: String,
    data: Arc<Value>,
    results: Mutex<Vec<Value>>,
    exceptions: Mutex<Vec<HandlerError>>,
    propagation_stopped: AtomicBool,
    intercepted: AtomicBool,
}

impl Event {
    pub fn new(event_type: impl Into<String>, data: Value) -> Self {
        Self::from_shared(event_type, Arc::new(data))
    }

    pub fn from_shared(event_type: impl Into<String>, data: Arc<Value>) -> Self {
        Self {
            event_type: event_type.into(),
            data,
            results: Mutex::new(Vec::new()),
            exceptions: Mutex::new(Vec::new()),
            propagation_stopped: AtomicBool::new(false),
            intercepted: AtomicBool::new(false),
        }
    }

    pub fn event_type(&self) -> &str {
        &self.event_type
    }

    /// 数据副本
    pub fn data(&self) -> Value {
        (*self.data).clone()
    }

    /// 共享只读数据
    pub fn payload(&self) -> Arc<Value> {
        self.data.clone()
    }

    pub fn add_result(&self, value: Value) {
        self.results
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(value);
    }

    pub fn add_exception(&self, err: HandlerError) {
        self.exceptions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(err);
    }

    pub fn results(&self) -> Vec<Value> {
        self.results
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn exceptions(&self) -> Vec<HandlerError> {
        self.exceptions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn stop_propagation(&self) {
        self.propagation_stopped.store(true, Ordering::SeqCst);
    }

    /// 拦截事件，隐含 stop_propagation
    pub fn intercept(&self) {
        self.intercepted.store(true, Ordering::SeqCst);
        self.stop_propagation();
    }

    pub fn is_propagation_stopped(&self) -> bool {
        self.propagation_stopped.load(Ordering::SeqCst)
    }

    pub fn is_intercepted(&self) -> bool {
        self.intercepted.load(Ordering::SeqCst)
    }
}

impl fmt::Debug for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Event")
            .field("event_type", &self.event_type)
            .field("propagation_stopped", &self.is_propagation_stopped())
            .field("intercepted", &self.is_intercepted())
            .finish()
    }
}

// ================== OneBot 事件分类 ==================

/// OneBot11 上报类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    Message,
    MessageSent,
    Notice,
    Request,
    Meta,
}

impl EventKind {
    pub fn from_post_type(post_type: &str) -> Option<Self> {
        match post_type {
            "message" => Some(Self::Message),
            "message_sent" => Some(Self::MessageSent),
            "notice" => Some(Self::Notice),
            "request" => Some(Self::Request),
            "meta_event" => Some(Self::Meta),
            _ => None,
        }
    }

    fn suffix(self) -> &'static str {
        match self {
            Self::Message => "message_event",
            Self::MessageSent => "message_sent_event",
            Self::Notice => "notice_event",
            Self::Request => "request_event",
            Self::Meta => "meta_event",
        }
    }

    /// 总线上的事件类型字符串，如 `napbot.message_event`
    pub fn bus_key(self) -> String {
        format!("{}.{}", EVENT_NAMESPACE, self.suffix())
    }

    pub fn is_message(self) -> bool {
        matches!(self, Self::Message | Self::MessageSent)
    }
}

/// 根据 `post_type` 判断上报帧的事件类型
pub fn parse_event_type(frame: &Value) -> Option<EventKind> {
    frame
        .get("post_type")
        .and_then(Value::as_str)
        .and_then(EventKind::from_post_type)
}

/// 定时任务事件类型
pub fn time_task_key(name: &str) -> String {
    format!("{EVENT_NAMESPACE}.time_task.{name}")
}

fn get_i64(v: &Value, key: &str) -> Option<i64> {
    let field = v.get(key)?;
    field
        .as_i64()
        .or_else(|| field.as_u64().map(|n| n as i64))
        .or_else(|| field.as_str().and_then(|s| s.parse().ok()))
}

// ================== 消息事件视图 ==================

/// 消息事件封装，提供便捷的强类型访问
#[derive(Debug, Clone)]
pub struct MessageEvent(Arc<Value>);

impl MessageEvent {
    /// 仅当 `post_type` 为 message / message_sent 时返回视图
    pub fn from_payload(payload: Arc<Value>) -> Option<Self> {
        match parse_event_type(&payload) {
            Some(kind) if kind.is_message() => Some(Self(payload)),
            _ => None,
        }
    }

    pub fn raw(&self) -> &Value {
        &self.0
    }

    pub fn payload(&self) -> Arc<Value> {
        self.0.clone()
    }

    pub fn kind(&self) -> Option<EventKind> {
        parse_event_type(&self.0)
    }

    pub fn message_type(&self) -> Option<&str> {
        self.0.get("message_type").and_then(Value::as_str)
    }

    /// 是否为群消息
    pub fn is_group(&self) -> bool {
        self.message_type() == Some("group")
    }

    pub fn is_private(&self) -> bool {
        self.message_type() == Some("private")
    }

    /// 获取群号 (如果是群消息)
    pub fn group_id(&self) -> Option<i64> {
        get_i64(&self.0, "group_id")
    }

    /// 获取用户 ID
    pub fn user_id(&self) -> i64 {
        get_i64(&self.0, "user_id").unwrap_or(0)
    }

    pub fn self_id(&self) -> i64 {
        get_i64(&self.0, "self_id").unwrap_or(0)
    }

    /// 获取消息 ID
    pub fn message_id(&self) -> i64 {
        get_i64(&self.0, "message_id").unwrap_or(0)
    }

    /// 发送者是否为机器人自身
    pub fn is_from_self(&self) -> bool {
        let self_id = self.self_id();
        self_id != 0 && self_id == self.user_id()
    }

    /// 获取纯文本内容 (raw_message)
    pub fn raw_message(&self) -> &str {
        self.0
            .get("raw_message")
            .and_then(Value::as_str)
            .unwrap_or("")
    }

    /// 获取发送者角色 (owner, admin, member)
    pub fn sender_role(&self) -> Option<&str> {
        self.0
            .get("sender")
            .and_then(|s| s.get("role"))
            .and_then(Value::as_str)
    }

    /// 获取发送者显示名称 (优先名片，其次昵称)
    pub fn sender_name(&self) -> &str {
        let sender = self.0.get("sender");
        sender
            .and_then(|s| s.get("card"))
            .and_then(Value::as_str)
            .filter(|s| !s.is_empty())
            .or_else(|| {
                sender
                    .and_then(|s| s.get("nickname"))
                    .and_then(Value::as_str)
            })
            .unwrap_or("Unknown")
    }

    /// 消息段列表
    ///
    /// 上报格式为 string 时退化为单个文本段。
    pub fn segments(&self) -> Vec<Segment> {
        match self.0.get("message") {
            Some(Value::Array(items)) => items
                .iter()
                .filter_map(|item| serde_json::from_value(item.clone()).ok())
                .collect(),
            Some(Value::String(s)) => vec![Segment::text(s.as_str())],
            _ => vec![Segment::text(self.raw_message())],
        }
    }
}

#[cfg(test)]
pub(crate) mod fixtures {
    use serde_json::{Value, json};

    pub fn group_message(text: &str) -> Value {
        json!({
            "post_type": "message",
            "message_type": "group",
            "self_id": 999,
            "user_id": 10001,
            "group_id": 123456,
            "message_id": 42,
            "raw_message": text,
            "message": [{"type": "text", "data": {"text": text}}],
            "sender": {"user_id": 10001, "nickname": "alice", "card": "", "role": "member"}
        })
    }

    pub fn private_message(text: &str) -> Value {
        json!({
            "post_type": "message",
            "message_type": "private",
            "self_id": 999,
            "user_id": 10001,
            "message_id": 43,
            "raw_message": text,
            "message": [{"type": "text", "data": {"text": text}}],
            "sender": {"user_id": 10001, "nickname": "alice"}
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn intercept_implies_stop_propagation() {
        let ev = Event::new("napbot.test", json!({}));
        assert!(!ev.is_propagation_stopped());
        ev.intercept();
        assert!(ev.is_intercepted());
        assert!(ev.is_propagation_stopped());
    }

    #[test]
    fn data_is_a_copy() {
        let ev = Event::new("napbot.test", json!({"a": 1}));
        let mut copy = ev.data();
        copy["a"] = json!(2);
        assert_eq!(ev.payload()["a"], json!(1));
    }

    #[test]
    fn post_type_maps_to_bus_key() {
        let cases = [
            ("message", "napbot.message_event"),
            ("message_sent", "napbot.message_sent_event"),
            ("notice", "napbot.notice_event"),
            ("request", "napbot.request_event"),
            ("meta_event", "napbot.meta_event"),
        ];
        for (post_type, key) in cases {
            let kind = parse_event_type(&json!({ "post_type": post_type })).unwrap();
            assert_eq!(kind.bus_key(), key);
        }
        assert!(parse_event_type(&json!({"status": "ok"})).is_none());
    }

    #[test]
    fn message_view_reads_onebot_fields() {
        let ev = MessageEvent::from_payload(Arc::new(fixtures::group_message("/ping"))).unwrap();
        assert!(ev.is_group());
        assert_eq!(ev.group_id(), Some(123456));
        assert_eq!(ev.user_id(), 10001);
        assert_eq!(ev.sender_name(), "alice");
        assert_eq!(ev.sender_role(), Some("member"));
        assert!(!ev.is_from_self());
        assert_eq!(ev.segments()[0].as_text(), Some("/ping"));
    }

    #[test]
    fn non_message_payload_has_no_view() {
        let notice = Arc::new(json!({"post_type": "notice", "notice_type": "group_increase"}));
        assert!(MessageEvent::from_payload(notice).is_none());
    }
}
