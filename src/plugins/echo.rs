use crate::command::{Annotation, OptionSpec, ParamSpec, Signature};
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

/// `/echo <text> [-u] [--times=N]`，含空格的内容需要加引号
pub fn on_load(ctx: &PluginContext) -> anyhow::Result<()> {
    ctx.command("echo")
        .alias("say")
        .description("复读一段文字")
        .signature(
            Signature::message()
                .param("text", Annotation::Str)
                .param("upper", Annotation::Bool)
                .param("times", Annotation::Int),
        )
        .option(OptionSpec::short("u").with_long("upper").describe("转为大写"))
        .param(
            ParamSpec::new("times")
                .default_value(1)
                .choices(&["1", "2", "3"])
                .describe("重复次数"),
        )
        .async_handler(|inv| async move {
            let text: String = inv.arg("text").unwrap_or_default();
            let text = if inv.arg("upper").unwrap_or(false) {
                text.to_uppercase()
            } else {
                text
            };
            let times = inv.arg::<i64>("times").unwrap_or(1).clamp(1, 3) as usize;
            inv.reply(vec![text; times].join(" ")).await?;
            Ok(())
        })
        .register()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use crate::config::AppConfig;
    use crate::plugins::tests::{group_message, host, sent_text};
    use crate::plugins::{PluginLoader, get_plugins};
    use crate::registry::DispatchOutcome;

    #[tokio::test]
    async fn echoes_quoted_text_with_options() {
        let (host, mut outbound) = host(AppConfig::default());
        let loader = PluginLoader::new(host);
        loader.load(&get_plugins()[1]).unwrap();
        let h = loader.host();
        h.registry.initialize().unwrap();

        h.registry.handle_message(&group_message("/echo \"hi there\" -u --times=2"), &h.api).await;
        assert_eq!(sent_text(&outbound.recv().await.unwrap()), "HI THERE HI THERE");

        h.registry.handle_message(&group_message("/say ok"), &h.api).await;
        assert_eq!(sent_text(&outbound.recv().await.unwrap()), "ok");

        let report = h.registry.handle_message(&group_message("/echo x --times=9"), &h.api).await;
        assert!(matches!(report.outcome, DispatchOutcome::BindFailed { .. }));
    }
}
