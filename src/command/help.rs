use super::spec::{ArgValue, CommandSpec};
use std::fmt::Write as _;
use std::sync::Arc;

/// 根据命令描述生成帮助文本
pub struct HelpGenerator;

impl HelpGenerator {
    /// 单行用法，如 `/admin kick <user:int> [reason:str=无] [-q, --quiet]`
    pub fn usage(spec: &CommandSpec, prefix: &str) -> String {
        let mut out = format!("{prefix}{}", spec.full_name());

        for p in &spec.positionals {
            match &p.default {
                Some(d) => write!(out, " [{}:{}={}]", p.name, p.annotation, d.as_text()),
                None => write!(out, " <{}:{}>", p.name, p.annotation),
            }
            .ok();
        }
        for o in &spec.options {
            write!(out, " [{}]", o.spec.display()).ok();
        }
        for g in &spec.option_groups {
            let choices: Vec<String> = g.spec.choices.iter().map(|c| format!("--{c}")).collect();
            write!(out, " [{}]", choices.join("|")).ok();
        }
        for p in &spec.params {
            if p.spec.required {
                write!(out, " --{}=<{}>", p.spec.name, p.annotation).ok();
            } else {
                write!(out, " [--{}=<{}>]", p.spec.name, p.annotation).ok();
            }
        }
        out
    }

    /// 单个命令的完整帮助
    pub fn command_help(spec: &CommandSpec, prefix: &str) -> String {
        let mut out = format!("📖 {}", Self::usage(spec, prefix));
        if !spec.description.is_empty() {
            write!(out, "\n{}", spec.description).ok();
        }
        if !spec.aliases.is_empty() {
            write!(out, "\n别名: {}", spec.aliases.join(", ")).ok();
        }

        if !spec.options.is_empty() {
            out.push_str("\n选项:");
            for o in &spec.options {
                write!(out, "\n  {}  {}", o.spec.display(), o.spec.description).ok();
            }
        }
        for g in &spec.option_groups {
            write!(
                out,
                "\n选项组 {} (默认 {}): {}",
                g.spec.name,
                g.default,
                g.spec.choices.join(" / ")
            )
            .ok();
            if !g.spec.description.is_empty() {
                write!(out, "  {}", g.spec.description).ok();
            }
        }
        if !spec.params.is_empty() {
            out.push_str("\n参数:");
            for p in &spec.params {
                write!(out, "\n  --{}", p.spec.name).ok();
                if let Some(d) = p.default.as_ref().map(ArgValue::as_text) {
                    write!(out, " (默认 {d})").ok();
                }
                if !p.spec.choices.is_empty() {
                    write!(out, " [{}]", p.spec.choices.join("|")).ok();
                }
                if !p.spec.description.is_empty() {
                    write!(out, "  {}", p.spec.description).ok();
                }
            }
        }
        out
    }

    /// 命令列表，按完整名称排序
    pub fn listing(commands: &[Arc<CommandSpec>], prefix: &str) -> String {
        let mut sorted: Vec<&Arc<CommandSpec>> = commands.iter().collect();
        sorted.sort_by_key(|c| c.full_name());

        let mut out = String::from("📋 可用命令:");
        for c in sorted {
            write!(out, "\n  {prefix}{}", c.full_name()).ok();
            if !c.description.is_empty() {
                write!(out, " - {}", c.description).ok();
            }
        }
        out
    }
}
