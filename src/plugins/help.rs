use crate::command::{Annotation, CommandSpec, HelpGenerator, Signature};
use crate::config::build_config;
use crate::plugins::PluginContext;
use serde::{Deserialize, Serialize};
use toml::Value;

#[derive(Serialize, Deserialize)]
struct Config {
    enabled: bool,
}

pub fn default_config() -> Value {
    build_config(Config { enabled: true })
}

/// 命令名匹配：完整名称或别名，点分与空格等价
fn matches(spec: &CommandSpec, query: &str, case_sensitive: bool) -> bool {
    let eq = |a: &str, b: &str| if case_sensitive { a == b } else { a.eq_ignore_ascii_case(b) };
    let query = query.replace('.', " ");
    if eq(&spec.full_name(), &query) {
        return true;
    }
    spec.aliases.iter().any(|alias| {
        let mut path = spec.group_path.clone();
        path.push(alias.clone());
        eq(&path.join(" "), &query)
    })
}

pub fn on_load(ctx: &PluginContext) -> anyhow::Result<()> {
    let root = ctx.root().clone();
    let global = ctx.core().command_prefix.first().cloned().unwrap_or_default();
    let case_sensitive = ctx.core().case_sensitive;

    ctx.command("help")
        .description("查看命令列表或某个命令的用法")
        .signature(Signature::message().param_default("command", Annotation::Str, ""))
        .async_handler(move |inv| {
            let query: String = inv.arg("command").unwrap_or_default();
            let commands = root.all_commands();
            let text = if query.trim().is_empty() {
                HelpGenerator::listing(&commands, &global)
            } else {
                match commands.iter().find(|c| matches(c, query.trim(), case_sensitive)) {
                    Some(spec) => {
                        let prefix = spec
                            .prefixes
                            .as_ref()
                            .and_then(|p| p.first())
                            .unwrap_or(&global);
                        HelpGenerator::command_help(spec, prefix)
                    }
                    None => format!("未找到命令 '{}'，发送 {}help 查看全部命令", query.trim(), global),
                }
            };
            async move {
                inv.reply(text).await?;
                Ok(())
            }
        })
        .register()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use crate::config::AppConfig;
    use crate::plugins::tests::{group_message, host, sent_text};
    use crate::plugins::{PluginLoader, get_plugins};

    #[tokio::test]
    async fn lists_commands_and_shows_usage() {
        let (host, mut outbound) = host(AppConfig::default());
        let loader = PluginLoader::new(host);
        assert_eq!(loader.load_all(get_plugins()), 4);
        let h = loader.host();
        h.registry.initialize().unwrap();

        h.registry.handle_message(&group_message("/help"), &h.api).await;
        let listing = sent_text(&outbound.recv().await.unwrap());
        assert!(listing.contains("/echo - 复读一段文字"));
        assert!(listing.contains("/ping"));
        assert!(listing.contains("/set_admin"));

        h.registry.handle_message(&group_message("/help SAY"), &h.api).await;
        let usage = sent_text(&outbound.recv().await.unwrap());
        assert!(usage.contains("/echo <text:str> [-u, --upper]"));

        h.registry.handle_message(&group_message("/help nope"), &h.api).await;
        assert!(sent_text(&outbound.recv().await.unwrap()).starts_with("未找到命令 'nope'"));
    }
}
