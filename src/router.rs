//! API 请求与响应的关联层
//!
//! 每次调用分配一个 echo，响应帧按 echo 完成等待中的调用；其余帧作为事件转发。

use crate::error::{BotError, BotResult};
use serde::Deserialize;
use serde_json::{Value, json};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

/// OneBot 动作响应
#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct ActionResponse {
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub retcode: i64,
    #[serde(default)]
    pub data: Value,
    #[serde(default, alias = "msg")]
    pub message: String,
    #[serde(default)]
    pub wording: String,
    #[serde(default)]
    pub echo: Value,
}

impl ActionResponse {
    pub fn is_ok(&self) -> bool {
        self.status == "ok" || self.status == "async"
    }

    /// 失败状态转换为 `BotError::Action`
    pub fn into_data(self, action: &str) -> BotResult<Value> {
        if self.status == "failed" {
            let message = if self.wording.is_empty() {
                self.message
            } else {
                self.wording
            };
            return Err(BotError::Action {
                action: action.to_string(),
                retcode: self.retcode,
                message,
            });
        }
        Ok(self.data)
    }
}

type PendingSlot = oneshot::Sender<BotResult<ActionResponse>>;

/// echo 可能是字符串也可能是数字
fn echo_of(frame: &Value) -> Option<String> {
    match frame.get("echo")? {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

pub struct RequestRouter {
    pending: Mutex<HashMap<String, PendingSlot>>,
    next_echo: AtomicU64,
    outbound: Mutex<Option<mpsc::UnboundedSender<String>>>,
    events: mpsc::UnboundedSender<Value>,
    default_timeout: Duration,
}

impl RequestRouter {
    /// `events` 接收所有未被关联的上报帧
    pub fn new(events: mpsc::UnboundedSender<Value>, default_timeout: Duration) -> Self {
        Self {
            pending: Mutex::new(HashMap::new()),
            next_echo: AtomicU64::new(1),
            outbound: Mutex::new(None),
            events,
            default_timeout,
        }
    }

    fn pending(&self) -> std::sync::MutexGuard<'_, HashMap<String, PendingSlot>> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// 挂接写出队列，由连接的写任务串行消费
    pub fn attach(&self, outbound: mpsc::UnboundedSender<String>) {
        *self.outbound.lock().unwrap_or_else(PoisonError::into_inner) = Some(outbound);
    }

    /// 断开写出队列并取消所有等待中的调用
    pub fn detach(&self) {
        self.outbound
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        self.cancel_all();
    }

    pub fn default_timeout(&self) -> Duration {
        self.default_timeout
    }

    pub fn pending_count(&self) -> usize {
        self.pending().len()
    }

    pub fn is_pending(&self, echo: &str) -> bool {
        self.pending().contains_key(echo)
    }

    pub async fn call(&self, action: &str, params: Value) -> BotResult<ActionResponse> {
        self.call_with_timeout(action, params, self.default_timeout)
            .await
    }

    /// 发送动作并等待对应 echo 的响应
    pub async fn call_with_timeout(
        &self,
        action: &str,
        params: Value,
        timeout: Duration,
    ) -> BotResult<ActionResponse> {
        let action = action.trim_start_matches('/');
        let echo = self.next_echo.fetch_add(1, Ordering::SeqCst).to_string();
        let frame = json!({
            "action": action,
            "params": params,
            "echo": echo,
        });

        let (tx, rx) = oneshot::channel();
        self.pending().insert(echo.clone(), tx);
        // 调用方被取消（外层超时、select!）时也要释放槽位
        let _slot = PendingGuard { router: self, echo: &echo };

        let sent = {
            let outbound = self.outbound.lock().unwrap_or_else(PoisonError::into_inner);
            match outbound.as_ref() {
                Some(sender) => sender.send(frame.to_string()).is_ok(),
                None => false,
            }
        };
        if !sent {
            return Err(BotError::NotConnected);
        }
        debug!(target: "Router", "-> {} (echo={})", action, echo);

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(BotError::ConnectionClosed),
            Err(_) => {
                warn!(target: "Router", "{} 超时 (echo={})", action, echo);
                Err(BotError::Timeout {
                    action: action.to_string(),
                    after: timeout,
                })
            }
        }
    }

    /// 处理一帧入站数据，返回 true 表示该帧是某个调用的响应
    pub fn route(&self, frame: Value) -> bool {
        if let Some(echo) = echo_of(&frame) {
            let slot = self.pending().remove(&echo);
            if let Some(slot) = slot {
                let result = serde_json::from_value::<ActionResponse>(frame).map_err(BotError::from);
                let _ = slot.send(result);
                return true;
            }
        }

        if self.events.send(frame).is_err() {
            debug!(target: "Router", "事件通道已关闭，丢弃上报");
        }
        false
    }

    /// 以连接错误结束所有等待中的调用，返回取消数量
    pub fn cancel_all(&self) -> usize {
        let drained: Vec<PendingSlot> = self.pending().drain().map(|(_, slot)| slot).collect();
        let count = drained.len();
        for slot in drained {
            let _ = slot.send(Err(BotError::ConnectionClosed));
        }
        if count > 0 {
            warn!(target: "Router", "连接断开，取消 {} 个等待中的请求", count);
        }
        count
    }
}

/// 离开作用域时移除对应 echo 的等待项；已被 route 取走时无操作
struct PendingGuard<'a> {
    router: &'a RequestRouter,
    echo: &'a str,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        self.router.pending().remove(self.echo);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn router() -> (
        Arc<RequestRouter>,
        mpsc::UnboundedReceiver<String>,
        mpsc::UnboundedReceiver<Value>,
    ) {
        let (ev_tx, ev_rx) = mpsc::unbounded_channel();
        let (out_tx, out_rx) = mpsc::unbounded_channel();
        let router = Arc::new(RequestRouter::new(ev_tx, Duration::from_secs(5)));
        router.attach(out_tx);
        (router, out_rx, ev_rx)
    }

    #[tokio::test]
    async fn response_resolves_call_and_other_frames_become_events() {
        let (router, mut out_rx, mut ev_rx) = router();

        let r = router.clone();
        let call = tokio::spawn(async move { r.call("/get_login_info", json!({})).await });

        let sent: Value = serde_json::from_str(&out_rx.recv().await.unwrap()).unwrap();
        assert_eq!(sent["action"], "get_login_info");
        let echo = sent["echo"].as_str().unwrap().to_string();
        assert!(router.is_pending(&echo));

        let consumed = router.route(json!({
            "echo": echo, "status": "ok", "retcode": 0, "data": {"user_id": 1}
        }));
        assert!(consumed);

        let resp = call.await.unwrap().unwrap();
        assert_eq!(resp.data, json!({"user_id": 1}));
        assert!(!router.is_pending(&echo));

        let unrelated = json!({"post_type": "notice", "echo": "nobody"});
        assert!(!router.route(unrelated.clone()));
        assert_eq!(ev_rx.recv().await.unwrap(), unrelated);
    }

    #[tokio::test]
    async fn numeric_echo_matches() {
        let (router, mut out_rx, _ev_rx) = router();
        let r = router.clone();
        let call = tokio::spawn(async move { r.call("get_status", json!({})).await });

        let sent: Value = serde_json::from_str(&out_rx.recv().await.unwrap()).unwrap();
        let echo: u64 = sent["echo"].as_str().unwrap().parse().unwrap();
        assert!(router.route(json!({"echo": echo, "status": "ok", "data": null})));
        assert!(call.await.unwrap().unwrap().is_ok());
    }

    #[tokio::test]
    async fn disconnect_cancels_every_pending_call() {
        let (router, mut out_rx, _ev_rx) = router();

        let r1 = router.clone();
        let r2 = router.clone();
        let c1 = tokio::spawn(async move { r1.call("a", json!({})).await });
        let c2 = tokio::spawn(async move { r2.call("b", json!({})).await });
        out_rx.recv().await.unwrap();
        out_rx.recv().await.unwrap();
        assert_eq!(router.pending_count(), 2);
        assert!(router.is_pending("1") && router.is_pending("2"));

        router.detach();

        let (a, b) = tokio::time::timeout(Duration::from_secs(1), async {
            (c1.await.unwrap(), c2.await.unwrap())
        })
        .await
        .unwrap();
        assert!(matches!(a, Err(BotError::ConnectionClosed)));
        assert!(matches!(b, Err(BotError::ConnectionClosed)));
        assert_eq!(router.pending_count(), 0);

        let after = router.call("c", json!({})).await;
        assert!(matches!(after, Err(BotError::NotConnected)));
    }

    #[tokio::test]
    async fn timeout_frees_the_slot() {
        let (router, _out_rx, _ev_rx) = router();
        let res = router
            .call_with_timeout("slow", json!({}), Duration::from_millis(20))
            .await;
        assert!(matches!(res, Err(BotError::Timeout { ref action, .. }) if action == "slow"));
        assert_eq!(router.pending_count(), 0);
    }

    #[tokio::test]
    async fn dropped_caller_frees_the_slot() {
        let (router, mut out_rx, _ev_rx) = router();
        let res = tokio::time::timeout(
            Duration::from_millis(20),
            router.call_with_timeout("slow", json!({}), Duration::from_secs(5)),
        )
        .await;
        assert!(res.is_err());
        assert!(out_rx.recv().await.is_some());
        assert_eq!(router.pending_count(), 0);

        // 迟到的响应不再对应任何调用，按事件转发
        assert!(!router.route(json!({"echo": "1", "status": "ok"})));
    }

    #[test]
    fn failed_status_maps_to_action_error() {
        let resp: ActionResponse = serde_json::from_value(json!({
            "status": "failed", "retcode": 1404, "msg": "not found", "echo": "9"
        }))
        .unwrap();
        assert!(!resp.is_ok());
        let err = resp.into_data("send_msg").unwrap_err();
        assert!(matches!(err, BotError::Action { retcode: 1404, .. }));
    }
}
