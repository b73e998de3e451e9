use crate::command::Signature;
use crate::config::build_config;
use crate::plugins::PluginContext;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use toml::Value;

#[derive(Debug, Serialize, Deserialize, Clone)]
struct PingConfig {
    #[serde(default = "default_true")]
    enabled: bool,
    #[serde(default = "default_reply")]
    reply: String,
}

fn default_true() -> bool {
    true
}

fn default_reply() -> String {
    "Pong!".to_string()
}

pub fn default_config() -> Value {
    build_config(PingConfig {
        enabled: true,
        reply: default_reply(),
    })
}

pub fn on_load(ctx: &PluginContext) -> anyhow::Result<()> {
    // 每次回复时读取，`set_config` 修改后立即生效
    let settings = ctx.settings();
    let count = Arc::new(AtomicU64::new(0));

    ctx.command("ping")
        .description("检查机器人是否在线")
        .signature(Signature::message())
        .async_handler(move |inv| {
            let n = count.fetch_add(1, Ordering::Relaxed) + 1;
            let reply = settings.get::<PingConfig>().map_or_else(default_reply, |c| c.reply);
            let text = format!("{reply} 本次运行累计 Ping 次数: {n}");
            async move {
                inv.reply(text).await?;
                Ok(())
            }
        })
        .register()?;
    Ok(())
}
