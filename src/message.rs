use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// 消息段 (Segment)
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct Segment {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub data: Map<String, Value>,
}

impl Segment {
    pub fn new(kind: &str, data: Map<String, Value>) -> Self {
        Self {
            kind: kind.to_string(),
            data,
        }
    }

    pub fn text(text: impl Into<String>) -> Self {
        let mut data = Map::new();
        data.insert("text".into(), Value::from(text.into()));
        Self::new("text", data)
    }

    pub fn is_text(&self) -> bool {
        self.kind == "text"
    }

    /// 文本段内容，非文本段返回 None
    pub fn as_text(&self) -> Option<&str> {
        if self.is_text() {
            self.data.get("text").and_then(Value::as_str)
        } else {
            None
        }
    }

    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.data.get(key).and_then(Value::as_str)
    }

    /// 单行摘要，用于帮助与错误提示
    pub fn summary(&self) -> String {
        match self.as_text() {
            Some(t) => t.to_string(),
            None => format!("[{}]", self.kind),
        }
    }
}

/// 消息链 (Message Chain)
#[derive(Debug, Serialize, Deserialize, Clone, Default, PartialEq)]
pub struct Message(Vec<Segment>);

impl Message {
    pub fn new() -> Self {
        Self::default()
    }

    /// 通用添加方法：手动构建 Segment
    pub fn add(mut self, kind: &str, data: Map<String, Value>) -> Self {
        self.0.push(Segment::new(kind, data));
        self
    }

    pub fn push(mut self, segment: Segment) -> Self {
        self.0.push(segment);
        self
    }

    /// 纯文本
    pub fn text(self, text: impl Into<String>) -> Self {
        self.push(Segment::text(text))
    }

    /// QQ 表情 (ID)
    pub fn face(self, id: impl ToString) -> Self {
        let mut data = Map::new();
        data.insert("id".into(), Value::from(id.to_string()));
        self.add("face", data)
    }

    /// 图片
    /// - `file`: 图片文件名、URL、Base64 或文件路径
    pub fn image(self, file: impl Into<String>) -> Self {
        let mut data = Map::new();
        data.insert("file".into(), Value::from(file.into()));
        self.add("image", data)
    }

    /// @某人
    pub fn at(self, user_id: impl ToString) -> Self {
        let mut data = Map::new();
        data.insert("qq".into(), Value::from(user_id.to_string()));
        self.add("at", data)
    }

    /// 回复消息
    pub fn reply(self, message_id: impl ToString) -> Self {
        let mut data = Map::new();
        data.insert("id".into(), Value::from(message_id.to_string()));
        self.add("reply", data)
    }

    pub fn segments(&self) -> &[Segment] {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// 拼接所有文本段
    pub fn plain_text(&self) -> String {
        self.0.iter().filter_map(Segment::as_text).collect()
    }
}

impl From<&str> for Message {
    fn from(s: &str) -> Self {
        Message::new().text(s)
    }
}

impl From<String> for Message {
    fn from(s: String) -> Self {
        Message::new().text(s)
    }
}

impl From<Vec<Segment>> for Message {
    fn from(v: Vec<Segment>) -> Self {
        Message(v)
    }
}
