use crate::error::BotResult;
use crate::event::MessageEvent;
use crate::message::Message;
use crate::router::{ActionResponse, RequestRouter};
use serde::Serialize;
use serde_json::{Value, json};
use std::sync::Arc;

#[derive(Serialize)]
struct SendParamsInner<'a> {
    message_type: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    group_id: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    user_id: Option<i64>,
    message: &'a Message,
}

/// OneBot 动作的便捷封装
#[derive(Clone)]
pub struct Api {
    router: Arc<RequestRouter>,
}

impl Api {
    pub fn new(router: Arc<RequestRouter>) -> Self {
        Self { router }
    }

    pub fn router(&self) -> &Arc<RequestRouter> {
        &self.router
    }

    /// 直接调用任意动作，返回原始响应
    pub async fn call_raw(&self, action: &str, params: Value) -> BotResult<ActionResponse> {
        self.router.call(action, params).await
    }

    /// 调用动作，失败状态转换为错误
    pub async fn call(&self, action: &str, params: Value) -> BotResult<Value> {
        self.router.call(action, params).await?.into_data(action)
    }

    pub async fn send_msg(
        &self,
        group_id: Option<i64>,
        user_id: Option<i64>,
        message: impl Into<Message>,
    ) -> BotResult<Value> {
        let message = message.into();
        let (message_type, group_id, user_id) = match group_id.filter(|&id| id != 0) {
            Some(gid) => ("group", Some(gid), None),
            None => ("private", None, user_id),
        };
        let params = SendParamsInner {
            message_type,
            group_id,
            user_id,
            message: &message,
        };
        self.call("send_msg", serde_json::to_value(&params)?).await
    }

    pub async fn send_group_msg(&self, group_id: i64, message: impl Into<Message>) -> BotResult<Value> {
        self.send_msg(Some(group_id), None, message).await
    }

    pub async fn send_private_msg(&self, user_id: i64, message: impl Into<Message>) -> BotResult<Value> {
        self.send_msg(None, Some(user_id), message).await
    }

    /// 回复事件来源（群聊回群，私聊回人）
    pub async fn reply(&self, event: &MessageEvent, message: impl Into<Message>) -> BotResult<Value> {
        let target_group = if event.is_group() { event.group_id() } else { None };
        self.send_msg(target_group, Some(event.user_id()), message)
            .await
    }

    pub async fn get_login_info(&self) -> BotResult<Value> {
        self.call("get_login_info", json!({})).await
    }
}
