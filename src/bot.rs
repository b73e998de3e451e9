//! 机器人主体：把配置、插件与各组件装配起来并运行到连接结束

use crate::api::Api;
use crate::bus::EventBus;
use crate::config::{AppConfig, ConfigManager};
use crate::dispatcher::EventPump;
use crate::filter::RoleTable;
use crate::plugins::{Plugin, PluginHost, PluginLoader, fill_default_configs, get_plugins};
use crate::registry::UnifiedRegistry;
use crate::router::RequestRouter;
use crate::scheduler::TimeTaskScheduler;
use crate::transport::{FrameCallback, LinkState, ReconnectPolicy, WebSocketLink};
use futures_util::FutureExt;
use serde_json::Value;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tracing::{info, warn};

/// 构建器
pub struct NapBotBuilder {
    config_path: PathBuf,
    config: Option<AppConfig>,
    plugins: &'static [Plugin],
}

impl NapBotBuilder {
    pub fn new() -> Self {
        Self {
            config_path: PathBuf::from("config.toml"),
            config: None,
            plugins: get_plugins(),
        }
    }

    /// 设置配置文件路径
    pub fn config_path<P: AsRef<Path>>(mut self, path: P) -> Self {
        self.config_path = path.as_ref().to_path_buf();
        self
    }

    /// 直接使用给定配置，不读写配置文件
    pub fn config(mut self, config: AppConfig) -> Self {
        self.config = Some(config);
        self
    }

    /// 替换插件表
    pub fn plugins(mut self, plugins: &'static [Plugin]) -> Self {
        self.plugins = plugins;
        self
    }

    pub fn build(self) -> NapBot {
        NapBot {
            config_path: self.config_path,
            config: self.config,
            plugins: self.plugins,
        }
    }
}

impl Default for NapBotBuilder {
    fn default() -> Self {
        Self::new()
    }
}

pub struct NapBot {
    config_path: PathBuf,
    config: Option<AppConfig>,
    plugins: &'static [Plugin],
}

impl NapBot {
    pub fn builder() -> NapBotBuilder {
        NapBotBuilder::new()
    }

    /// 直接给定的配置只保存在内存中，运行时的修改不会写盘
    async fn load_config(&mut self) -> anyhow::Result<(AppConfig, Arc<ConfigManager>)> {
        if let Some(mut config) = self.config.take() {
            fill_default_configs(&mut config, self.plugins);
            let manager = ConfigManager::detached(config.clone());
            return Ok((config, Arc::new(manager)));
        }

        let manager = ConfigManager::new(&self.config_path);
        let mut config = manager.load().await?;
        if fill_default_configs(&mut config, self.plugins) {
            info!(target: "Bot", "检测到新插件，正在更新配置文件...");
            manager.save_atomic(&config).await?;
        }
        Ok((config, Arc::new(manager)))
    }

    /// 运行到连接结束；重连耗尽时返回错误，收到 Ctrl-C 时正常返回
    pub async fn run(mut self) -> anyhow::Result<()> {
        let (config, store) = self.load_config().await?;
        crate::log::init(&config.core.log_level);
        info!(target: "Bot", "napbot {} 正在启动", env!("CARGO_PKG_VERSION"));

        let bus = EventBus::with_default_timeout(config.core.handler_timeout());
        bus.bind_runtime(Handle::current());

        let (events_tx, events_rx) = mpsc::unbounded_channel::<Value>();
        let router = Arc::new(RequestRouter::new(events_tx, config.napcat.api_timeout()));
        let api = Api::new(router.clone());

        let roles = Arc::new(RoleTable::from_config(&config.core));
        let registry = Arc::new(UnifiedRegistry::new(&config.core, roles.clone()));
        let scheduler = Arc::new(TimeTaskScheduler::new(bus.clone()));
        scheduler.start()?;

        let policy = ReconnectPolicy {
            attempts: config.napcat.reconnect_attempts,
            base: config.napcat.reconnect_base(),
        };
        let link = Arc::new(WebSocketLink::new(
            config.napcat.ws_uri.clone(),
            config.napcat.access_token.clone(),
            policy,
        )?);

        let loader = PluginLoader::new(PluginHost::new(
            registry.clone(),
            bus.clone(),
            scheduler.clone(),
            api.clone(),
            store,
            roles,
        ));
        let loaded = loader.load_all(self.plugins);
        info!(target: "Bot", "已加载 {} 个插件: {:?}", loaded, loader.loaded());

        registry.initialize()?;
        registry.subscribe_to(&bus, api.clone())?;

        link.connect().await?;

        let (out_tx, mut out_rx) = mpsc::unbounded_channel::<String>();
        router.attach(out_tx);

        let writer = {
            let link = link.clone();
            tokio::spawn(async move {
                while let Some(text) = out_rx.recv().await {
                    if let Err(e) = link.send_text(text).await {
                        warn!(target: "Bot", "发送失败: {}", e);
                    }
                }
            })
        };

        let pump = tokio::spawn(EventPump::new(bus.clone(), events_rx).run());

        let watcher = {
            let router = router.clone();
            let mut state = link.state();
            tokio::spawn(async move {
                while state.changed().await.is_ok() {
                    let current = *state.borrow();
                    if current != LinkState::Connected {
                        router.cancel_all();
                    }
                }
            })
        };

        {
            let api = api.clone();
            tokio::spawn(async move {
                match api.get_login_info().await {
                    Ok(info) => info!(
                        target: "Bot",
                        "登录账号: {} ({})",
                        info.get("nickname").and_then(serde_json::Value::as_str).unwrap_or("?"),
                        info.get("user_id").and_then(serde_json::Value::as_i64).unwrap_or_default()
                    ),
                    Err(e) => warn!(target: "Bot", "获取登录信息失败: {}", e),
                }
            });
        }

        let callback: FrameCallback = {
            let router = router.clone();
            Arc::new(move |frame| {
                router.route(frame);
                async {}.boxed()
            })
        };

        info!(target: "Bot", "事件循环已启动，等待消息...");
        let outcome = tokio::select! {
            res = link.listen(callback) => res,
            _ = tokio::signal::ctrl_c() => {
                info!(target: "Bot", "收到关闭信号，正在停止...");
                Ok(())
            }
        };

        link.disconnect().await;
        router.detach();
        writer.abort();
        watcher.abort();
        pump.abort();
        for name in loader.loaded() {
            loader.unload(name);
        }
        tokio::task::spawn_blocking(move || scheduler.shutdown()).await?;
        info!(target: "Bot", "已停止");

        outcome.map_err(Into::into)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::BotError;
    use crate::event::fixtures;
    use futures_util::{SinkExt, StreamExt};
    use serde_json::json;
    use std::time::Duration;
    use tokio::net::TcpListener;
    use tokio::sync::oneshot;
    use tokio_tungstenite::tungstenite::protocol::Message as WsMessage;

    /// 推送一条 `/ping`，收到机器人发出的第一条消息后断开
    async fn gateway() -> (String, oneshot::Receiver<Value>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (tx, rx) = oneshot::channel();
        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut ws = tokio_tungstenite::accept_async(stream).await.unwrap();
            ws.send(WsMessage::Text(fixtures::group_message("/ping").to_string().into()))
                .await
                .unwrap();
            let mut tx = Some(tx);
            while let Some(Ok(msg)) = ws.next().await {
                let WsMessage::Text(text) = msg else { continue };
                let req: Value = serde_json::from_str(text.as_str()).unwrap();
                let resp = json!({"status": "ok", "retcode": 0, "echo": req["echo"], "data": {}});
                ws.send(WsMessage::Text(resp.to_string().into())).await.unwrap();
                if req["action"] == "send_msg"
                    && let Some(tx) = tx.take()
                {
                    let _ = tx.send(req);
                    let _ = ws.close(None).await;
                    break;
                }
            }
        });
        (format!("ws://{addr}"), rx)
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn answers_ping_and_reports_lost_connection() {
        let (uri, sent) = gateway().await;
        let mut config = AppConfig::default();
        config.napcat.ws_uri = uri;
        config.napcat.reconnect_attempts = 0;

        let bot = NapBot::builder().config(config).build();
        let outcome = tokio::time::timeout(Duration::from_secs(10), bot.run()).await.unwrap();

        let err = outcome.unwrap_err();
        assert!(matches!(err.downcast_ref::<BotError>(), Some(BotError::Reconnect { attempts: 0 })));

        let req = sent.await.unwrap();
        assert_eq!(req["params"]["group_id"], 123456);
        assert!(
            req["params"]["message"][0]["data"]["text"]
                .as_str()
                .unwrap()
                .starts_with("Pong!")
        );
    }
}
