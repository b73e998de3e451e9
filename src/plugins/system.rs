//! 系统管理：运行状态、管理员增删、插件配置修改
//!
//! 权限与配置的修改会同步写回配置文件。

use crate::command::{Annotation, ArgValue, OptionGroupSpec, Signature};
use crate::config::build_config;
use crate::filter::Role;
use crate::plugins::PluginContext;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use toml::Value;
use tracing::{info, warn};

#[derive(Serialize, Deserialize)]
struct Config {
    enabled: bool,
}

pub fn default_config() -> Value {
    build_config(Config { enabled: true })
}

fn format_uptime(d: Duration) -> String {
    let secs = d.as_secs();
    let (days, hours, minutes, seconds) = (secs / 86_400, secs / 3600 % 24, secs / 60 % 60, secs % 60);
    if days > 0 {
        format!("{days}天{hours}小时{minutes}分")
    } else if hours > 0 {
        format!("{hours}小时{minutes}分{seconds}秒")
    } else {
        format!("{minutes}分{seconds}秒")
    }
}

/// 字符串不加引号，其余按 TOML 字面量显示
fn show(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// QQ 号可以直接给出，也可以 @ 对方
fn target_user(value: Option<&ArgValue>) -> Option<i64> {
    match value? {
        ArgValue::Int(n) => Some(*n),
        ArgValue::Segment(seg) if seg.kind == "at" => match seg.data.get("qq")? {
            serde_json::Value::Number(n) => n.as_i64(),
            serde_json::Value::String(s) => s.parse().ok(),
            _ => None,
        },
        _ => None,
    }
}

pub fn on_load(ctx: &PluginContext) -> anyhow::Result<()> {
    let host = ctx.host().clone();
    ctx.command("napbot_status")
        .alias("ncs")
        .description("查看机器人运行状态")
        .signature(Signature::message())
        .filter_named("root")
        .async_handler(move |inv| {
            let plugins = host.loaded_plugins();
            let text = format!(
                "📊 napbot 状态\n插件数量: {}\n插件列表: {}\n命令数量: {}\n等待中的请求: {}\n运行时长: {}\n版本: {}",
                plugins.len(),
                plugins.join(", "),
                host.registry.commands().len(),
                host.api.router().pending_count(),
                format_uptime(host.uptime()),
                env!("CARGO_PKG_VERSION"),
            );
            async move {
                inv.reply(text).await?;
                Ok(())
            }
        })
        .register()?;

    let host = ctx.host().clone();
    ctx.command("set_admin")
        .alias("sa")
        .description("添加或移除管理员，例如 /sa 10001 --remove")
        .signature(
            Signature::message()
                .param("user", Annotation::Union(vec![Annotation::Int, Annotation::segment("at")]))
                .param("mode", Annotation::Str),
        )
        .option_group(
            OptionGroupSpec::new("mode", &["add", "remove"])
                .default_choice("add")
                .describe("添加或移除"),
        )
        .filter_named("root")
        .async_handler(move |inv| {
            let host = host.clone();
            async move {
                let Some(user) = target_user(inv.value("user")) else {
                    inv.reply("无法识别的用户").await?;
                    return Ok(());
                };
                let remove = inv.arg::<String>("mode").as_deref() == Some("remove");
                let changed = if remove {
                    host.roles.unassign(user, Role::Admin)
                } else {
                    host.roles.assign(user, Role::Admin)
                };
                let verb = if remove { "删除" } else { "添加" };
                if !changed {
                    inv.reply(format!("{user} 无需{verb}，管理员列表未变化")).await?;
                    return Ok(());
                }

                let roles = host.roles.clone();
                if let Err(e) = host.config.update(|c| roles.write_to(&mut c.core)).await {
                    warn!(target: "Plugin", "[system] 保存管理员列表失败: {}", e);
                    inv.reply(format!("已{verb}管理员 {user}，但保存配置失败: {e}")).await?;
                    return Ok(());
                }
                info!(target: "Plugin", "[system] {} 管理员 {}", verb, user);
                inv.reply(format!("已{verb}管理员 {user}")).await?;
                Ok(())
            }
        })
        .register()?;

    let host = ctx.host().clone();
    ctx.command("set_config")
        .alias("cfg")
        .description("修改插件配置项，例如 /cfg ping reply 在的")
        .signature(
            Signature::message()
                .param("plugin", Annotation::Str)
                .param("key", Annotation::Str)
                .param("value", Annotation::Str),
        )
        .filter_named("admin")
        .async_handler(move |inv| {
            let host = host.clone();
            async move {
                let plugin: String = inv.arg("plugin").unwrap_or_default();
                let key: String = inv.arg("key").unwrap_or_default();
                let raw: String = inv.arg("value").unwrap_or_default();

                if !host.config.with(|c| c.plugins.contains_key(&plugin)) {
                    inv.reply(format!("未找到插件 {plugin}")).await?;
                    return Ok(());
                }
                let text = match host.config.try_update(|c| c.set_plugin_option(&plugin, &key, &raw)).await {
                    Ok((value, _)) => {
                        info!(target: "Plugin", "[system] {}.{} = {}", plugin, key, value);
                        format!("插件 {plugin} 配置 {key} 更新为 {}", show(&value))
                    }
                    Err(e) => format!("插件 {plugin} 配置 {key} 更新失败: {e}"),
                };
                inv.reply(text).await?;
                Ok(())
            }
        })
        .register()?;

    Ok(())
}
