use std::time::Duration;
use thiserror::Error;

use crate::command::RegistrationError;

/// 框架核心错误类型
#[derive(Debug, Error)]
pub enum BotError {
    #[error("WebSocket 尚未连接")]
    NotConnected,

    #[error("连接已关闭，请求被取消")]
    ConnectionClosed,

    #[error("API 请求超时: {action} ({after:?})")]
    Timeout { action: String, after: Duration },

    #[error("API 调用失败: {action} (retcode: {retcode}) {message}")]
    Action {
        action: String,
        retcode: i64,
        message: String,
    },

    #[error("重连失败，已尝试 {attempts} 次")]
    Reconnect { attempts: u32 },

    #[error("前缀冲突: '{shorter}' 是 '{longer}' 的前缀")]
    PrefixConflict { shorter: String, longer: String },

    #[error("命令注册失败: {0}")]
    Registration(#[from] RegistrationError),

    #[error("配置错误: {0}")]
    Config(String),

    #[error("WebSocket 错误: {0}")]
    Ws(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("JSON 错误: {0}")]
    Serde(#[from] serde_json::Error),

    #[error("配置解析失败: {0}")]
    TomlDe(#[from] toml::de::Error),

    #[error("配置序列化失败: {0}")]
    TomlSer(#[from] toml::ser::Error),

    #[error("IO 错误: {0}")]
    Io(#[from] std::io::Error),
}

pub type BotResult<T> = Result<T, BotError>;

/// 订阅者执行失败的记录，追加到 `Event::exceptions`
#[derive(Debug, Clone, Error, PartialEq)]
pub enum HandlerError {
    #[error("处理器 {handler} 超时 ({timeout:?})")]
    Timeout { handler: String, timeout: Duration },

    #[error("处理器 {handler} 执行出错: {message}")]
    Failed { handler: String, message: String },

    #[error("处理器 {handler} 发生 panic")]
    Panicked { handler: String },
}

impl HandlerError {
    pub fn handler(&self) -> &str {
        match self {
            Self::Timeout { handler, .. }
            | Self::Failed { handler, .. }
            | Self::Panicked { handler } => handler,
        }
    }
}
