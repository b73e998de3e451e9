//! WebSocket 传输层
//!
//! 只负责收发 JSON 帧，不解释内容。意外断线时按指数退避重连。

use crate::error::{BotError, BotResult};
use async_trait::async_trait;
use futures_util::future::BoxFuture;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use http::HeaderValue;
use serde_json::Value;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::{Mutex as AsyncMutex, Notify, watch};
use tokio_tungstenite::{
    MaybeTlsStream, WebSocketStream, connect_async,
    tungstenite::{client::IntoClientRequest, protocol::Message as WsMessage},
};
use tracing::{debug, error, info, warn};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
pub type WsWriter = SplitSink<WsStream, WsMessage>;
type WsReader = SplitStream<WsStream>;

/// 帧回调，每个解码后的帧原样交给它
pub type FrameCallback = Arc<dyn Fn(Value) -> BoxFuture<'static, ()> + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    Disconnected,
    Connected,
    Reconnecting,
}

/// 服务可达性探测
#[async_trait]
pub trait ServiceProbe: Send + Sync {
    async fn reachable(&self) -> bool;
}

/// 通过 TCP 握手判断 NapCat 端口是否开放
pub struct TcpProbe {
    addr: String,
}

impl TcpProbe {
    pub fn from_uri(uri: &str) -> BotResult<Self> {
        let parsed = uri
            .parse::<http::Uri>()
            .map_err(|e| BotError::Config(format!("无效的 WebSocket 地址 {uri}: {e}")))?;
        let host = parsed
            .host()
            .ok_or_else(|| BotError::Config(format!("WebSocket 地址缺少主机: {uri}")))?;
        let port = parsed.port_u16().unwrap_or(match parsed.scheme_str() {
            Some("wss") => 443,
            _ => 80,
        });
        Ok(Self {
            addr: format!("{host}:{port}"),
        })
    }
}

#[async_trait]
impl ServiceProbe for TcpProbe {
    async fn reachable(&self) -> bool {
        matches!(
            tokio::time::timeout(Duration::from_secs(2), TcpStream::connect(&self.addr)).await,
            Ok(Ok(_))
        )
    }
}

#[derive(Debug, Clone, Copy)]
pub struct ReconnectPolicy {
    pub attempts: u32,
    pub base: Duration,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            attempts: 5,
            base: Duration::from_millis(500),
        }
    }
}

impl ReconnectPolicy {
    /// 第 `attempt` 次失败后的等待时间：2^attempt * base
    pub fn delay(&self, attempt: u32) -> Duration {
        self.base.saturating_mul(1u32 << attempt.min(16))
    }
}

pub struct WebSocketLink {
    uri: String,
    access_token: Option<String>,
    policy: ReconnectPolicy,
    probe: Arc<dyn ServiceProbe>,
    writer: AsyncMutex<Option<WsWriter>>,
    reader: AsyncMutex<Option<WsReader>>,
    listening: AtomicBool,
    shutdown: Notify,
    state: watch::Sender<LinkState>,
}

impl WebSocketLink {
    pub fn new(
        uri: impl Into<String>,
        access_token: Option<String>,
        policy: ReconnectPolicy,
    ) -> BotResult<Self> {
        let uri = uri.into();
        let probe = Arc::new(TcpProbe::from_uri(&uri)?);
        Ok(Self::with_probe(uri, access_token, policy, probe))
    }

    pub fn with_probe(
        uri: impl Into<String>,
        access_token: Option<String>,
        policy: ReconnectPolicy,
        probe: Arc<dyn ServiceProbe>,
    ) -> Self {
        let (state, _) = watch::channel(LinkState::Disconnected);
        Self {
            uri: uri.into(),
            access_token,
            policy,
            probe,
            writer: AsyncMutex::new(None),
            reader: AsyncMutex::new(None),
            listening: AtomicBool::new(false),
            shutdown: Notify::new(),
            state,
        }
    }

    pub fn uri(&self) -> &str {
        &self.uri
    }

    pub fn state(&self) -> watch::Receiver<LinkState> {
        self.state.subscribe()
    }

    pub fn is_connected(&self) -> bool {
        *self.state.borrow() == LinkState::Connected
    }

    async fn open(&self) -> BotResult<WsStream> {
        let mut request = self.uri.as_str().into_client_request()?;
        if let Some(token) = self.access_token.as_deref().filter(|t| !t.is_empty()) {
            let header = HeaderValue::from_str(&format!("Bearer {token}"))
                .map_err(|e| BotError::Config(format!("无效的 access_token: {e}")))?;
            request.headers_mut().insert("Authorization", header);
        }
        let (stream, _) = connect_async(request).await?;
        Ok(stream)
    }

    async fn install(&self, stream: WsStream) {
        let (write_half, read_half) = stream.split();
        *self.writer.lock().await = Some(write_half);
        *self.reader.lock().await = Some(read_half);
        self.state.send_replace(LinkState::Connected);
    }

    pub async fn connect(&self) -> BotResult<()> {
        let stream = self.open().await?;
        self.install(stream).await;
        info!(target: "Link", "已连接 {}", self.uri);
        Ok(())
    }

    /// 主动断开；正在运行的 listen 会正常返回
    pub async fn disconnect(&self) {
        self.listening.store(false, Ordering::SeqCst);
        self.shutdown.notify_waiters();
        if let Some(mut writer) = self.writer.lock().await.take() {
            let _ = writer.close().await;
        }
        self.reader.lock().await.take();
        self.state.send_replace(LinkState::Disconnected);
        info!(target: "Link", "已断开 {}", self.uri);
    }

    /// 串行发送一帧
    pub async fn send(&self, frame: &Value) -> BotResult<()> {
        self.send_text(frame.to_string()).await
    }

    pub async fn send_text(&self, text: String) -> BotResult<()> {
        let mut guard = self.writer.lock().await;
        let writer = guard.as_mut().ok_or(BotError::NotConnected)?;
        writer.send(WsMessage::Text(text.into())).await?;
        Ok(())
    }

    fn decode(text: &str) -> Option<Value> {
        let mut bytes = text.as_bytes().to_vec();
        match simd_json::serde::from_slice::<Value>(&mut bytes) {
            Ok(v) => Some(v),
            Err(e) => {
                debug!(target: "Link", "丢弃无法解析的帧: {}", e);
                None
            }
        }
    }

    /// 接收循环，直到主动断开或重连耗尽
    pub async fn listen(&self, callback: FrameCallback) -> BotResult<()> {
        let mut reader = self.reader.lock().await.take().ok_or(BotError::NotConnected)?;
        self.listening.store(true, Ordering::SeqCst);

        loop {
            let next = tokio::select! {
                _ = self.shutdown.notified() => None,
                msg = reader.next() => Some(msg),
            };

            let lost = match next {
                None => return Ok(()),
                Some(Some(Ok(WsMessage::Text(text)))) => {
                    if let Some(frame) = Self::decode(text.as_str()) {
                        callback(frame).await;
                    }
                    false
                }
                Some(Some(Ok(WsMessage::Close(_)))) | Some(None) => true,
                Some(Some(Ok(_))) => false,
                Some(Some(Err(e))) => {
                    warn!(target: "Link", "接收出错: {}", e);
                    true
                }
            };

            if lost {
                if !self.listening.load(Ordering::SeqCst) {
                    return Ok(());
                }
                self.writer.lock().await.take();
                reader = self.reconnect().await?;
            }
        }
    }

    async fn reconnect(&self) -> BotResult<WsReader> {
        self.state.send_replace(LinkState::Reconnecting);
        warn!(target: "Link", "连接丢失，开始重连 {}", self.uri);

        for attempt in 0..self.policy.attempts {
            if !self.listening.load(Ordering::SeqCst) {
                break;
            }
            if self.probe.reachable().await {
                match self.open().await {
                    Ok(stream) => {
                        self.install(stream).await;
                        if let Some(reader) = self.reader.lock().await.take() {
                            info!(target: "Link", "第 {} 次重连成功", attempt + 1);
                            return Ok(reader);
                        }
                    }
                    Err(e) => warn!(target: "Link", "第 {} 次重连失败: {}", attempt + 1, e),
                }
            } else {
                debug!(target: "Link", "服务不可达，第 {} 次重连跳过", attempt + 1);
            }
            tokio::time::sleep(self.policy.delay(attempt)).await;
        }

        self.state.send_replace(LinkState::Disconnected);
        error!(target: "Link", "重连 {} 次后仍失败", self.policy.attempts);
        Err(BotError::Reconnect {
            attempts: self.policy.attempts,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::FutureExt;
    use serde_json::json;
    use tokio::net::TcpListener;
    use tokio::sync::mpsc;

    struct Unreachable;

    #[async_trait]
    impl ServiceProbe for Unreachable {
        async fn reachable(&self) -> bool {
            false
        }
    }

    struct Reachable;

    #[async_trait]
    impl ServiceProbe for Reachable {
        async fn reachable(&self) -> bool {
            true
        }
    }

    async fn next_frame(rx: &mut mpsc::UnboundedReceiver<Value>) -> Value {
        tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .unwrap()
            .unwrap()
    }

    /// 第一条连接推送一帧后立即关闭，第二条连接推送一帧并回应请求
    async fn flaky_server() -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut ws = tokio_tungstenite::accept_async(stream).await.unwrap();
            ws.send(WsMessage::Text(r#"{"seq":1}"#.into())).await.unwrap();
            let _ = ws.close(None).await;
            drop(ws);

            let (stream, _) = listener.accept().await.unwrap();
            let mut ws = tokio_tungstenite::accept_async(stream).await.unwrap();
            ws.send(WsMessage::Text(r#"{"seq":2}"#.into())).await.unwrap();
            while let Some(Ok(msg)) = ws.next().await {
                if let WsMessage::Text(text) = msg {
                    let req: Value = serde_json::from_str(text.as_str()).unwrap();
                    let resp = json!({"status": "ok", "echo": req["echo"]});
                    ws.send(WsMessage::Text(resp.to_string().into())).await.unwrap();
                }
            }
        });
        format!("ws://{addr}")
    }

    /// 回声服务器：把收到的 action 帧包装为响应回写，然后关闭
    async fn echo_server(close_after: usize) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut ws = tokio_tungstenite::accept_async(stream).await.unwrap();
            ws.send(WsMessage::Text(r#"{"post_type":"meta_event"}"#.into()))
                .await
                .unwrap();
            let mut seen = 0;
            while let Some(Ok(msg)) = ws.next().await {
                if let WsMessage::Text(text) = msg {
                    let req: Value = serde_json::from_str(text.as_str()).unwrap();
                    let resp = json!({"status": "ok", "echo": req["echo"], "data": {}});
                    ws.send(WsMessage::Text(resp.to_string().into())).await.unwrap();
                    seen += 1;
                    if seen >= close_after {
                        let _ = ws.close(None).await;
                        break;
                    }
                }
            }
        });
        format!("ws://{addr}")
    }

    #[test]
    fn backoff_doubles() {
        let p = ReconnectPolicy::default();
        assert_eq!(p.delay(0), Duration::from_millis(500));
        assert_eq!(p.delay(1), Duration::from_millis(1000));
        assert_eq!(p.delay(4), Duration::from_millis(8000));
    }

    #[test]
    fn tcp_probe_parses_default_ports() {
        assert_eq!(TcpProbe::from_uri("ws://127.0.0.1:3001").unwrap().addr, "127.0.0.1:3001");
        assert_eq!(TcpProbe::from_uri("ws://localhost").unwrap().addr, "localhost:80");
        assert!(TcpProbe::from_uri("not a uri").is_err());
    }

    #[tokio::test]
    async fn send_before_connect_fails() {
        let link = WebSocketLink::with_probe(
            "ws://127.0.0.1:1",
            None,
            ReconnectPolicy::default(),
            Arc::new(Unreachable),
        );
        assert!(matches!(link.send(&json!({})).await, Err(BotError::NotConnected)));
    }

    #[tokio::test]
    async fn frames_reach_callback_and_lost_link_gives_up() {
        let uri = echo_server(1).await;
        let policy = ReconnectPolicy {
            attempts: 2,
            base: Duration::from_millis(10),
        };
        let link = Arc::new(WebSocketLink::with_probe(uri, Some("token".into()), policy, Arc::new(Unreachable)));
        link.connect().await.unwrap();
        assert!(link.is_connected());

        let (tx, mut rx) = mpsc::unbounded_channel();
        let callback: FrameCallback = Arc::new(move |frame| {
            let tx = tx.clone();
            async move {
                let _ = tx.send(frame);
            }
            .boxed()
        });

        let l = link.clone();
        let listener = tokio::spawn(async move { l.listen(callback).await });

        let first = rx.recv().await.unwrap();
        assert_eq!(first["post_type"], "meta_event");

        link.send(&json!({"action": "get_status", "params": {}, "echo": "7"}))
            .await
            .unwrap();
        let resp = rx.recv().await.unwrap();
        assert_eq!(resp["echo"], "7");

        let outcome = tokio::time::timeout(Duration::from_secs(5), listener)
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(outcome, Err(BotError::Reconnect { attempts: 2 })));
        assert_eq!(*link.state().borrow(), LinkState::Disconnected);
    }

    #[tokio::test]
    async fn lost_link_reconnects_and_keeps_delivering() {
        let uri = flaky_server().await;
        let policy = ReconnectPolicy {
            attempts: 3,
            base: Duration::from_millis(10),
        };
        let link = Arc::new(WebSocketLink::with_probe(uri, None, policy, Arc::new(Reachable)));
        link.connect().await.unwrap();

        let (tx, mut rx) = mpsc::unbounded_channel();
        let callback: FrameCallback = Arc::new(move |frame| {
            let tx = tx.clone();
            async move {
                let _ = tx.send(frame);
            }
            .boxed()
        });
        let l = link.clone();
        let listener = tokio::spawn(async move { l.listen(callback).await });

        assert_eq!(next_frame(&mut rx).await["seq"], 1);
        assert_eq!(next_frame(&mut rx).await["seq"], 2);
        assert_eq!(*link.state().borrow(), LinkState::Connected);

        // 新连接的写半部已就位
        link.send(&json!({"action": "get_status", "echo": "8"})).await.unwrap();
        assert_eq!(next_frame(&mut rx).await["echo"], "8");

        link.disconnect().await;
        let outcome = tokio::time::timeout(Duration::from_secs(2), listener)
            .await
            .unwrap()
            .unwrap();
        assert!(outcome.is_ok());
    }

    #[tokio::test]
    async fn disconnect_ends_listen_cleanly() {
        let uri = echo_server(10).await;
        let link = Arc::new(WebSocketLink::with_probe(
            uri,
            None,
            ReconnectPolicy::default(),
            Arc::new(Unreachable),
        ));
        link.connect().await.unwrap();

        let callback: FrameCallback = Arc::new(|_| async {}.boxed());
        let l = link.clone();
        let listener = tokio::spawn(async move { l.listen(callback).await });

        tokio::time::sleep(Duration::from_millis(50)).await;
        link.disconnect().await;
        let outcome = tokio::time::timeout(Duration::from_secs(2), listener)
            .await
            .unwrap()
            .unwrap();
        assert!(outcome.is_ok());
    }
}
