//! 命令解析
//!
//! 从参数序列开头的若干个词中剥离前缀，按路径索引找到最长匹配的命令。

use super::error::{CommandNotFound, RegistrationError};
use super::group::CommandGroup;
use super::lexer::Arg;
use super::spec::CommandSpec;
use crate::error::{BotError, BotResult};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

/// 建议的最低相似度
const SUGGESTION_THRESHOLD: f64 = 0.6;
const MAX_SUGGESTIONS: usize = 3;

#[derive(Debug)]
pub enum Resolution {
    Matched {
        spec: Arc<CommandSpec>,
        /// 命令路径占用的参数个数
        consumed: usize,
        prefix: String,
    },
    /// 使用了前缀但没有找到命令
    NotFound { error: CommandNotFound, prefix: String },
    /// 不是命令
    NotCommand,
}

pub struct CommandResolver {
    global_prefixes: Vec<String>,
    /// 全部非空前缀，长的在前
    all_prefixes: Vec<String>,
    case_sensitive: bool,
    index: HashMap<Vec<String>, Arc<CommandSpec>>,
    max_depth: usize,
    revision: u64,
}

impl std::fmt::Debug for CommandResolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CommandResolver")
            .field("global_prefixes", &self.global_prefixes)
            .field("all_prefixes", &self.all_prefixes)
            .field("case_sensitive", &self.case_sensitive)
            .field("max_depth", &self.max_depth)
            .field("revision", &self.revision)
            .finish_non_exhaustive()
    }
}

impl CommandResolver {
    /// 校验前缀并建立索引
    pub fn build(root: &CommandGroup, prefixes: &[String], case_sensitive: bool) -> BotResult<Self> {
        let commands = root.all_commands();

        let mut all: Vec<String> = prefixes.to_vec();
        for c in &commands {
            all.extend(c.prefixes.iter().flatten().cloned());
        }
        all.retain(|p| !p.is_empty());
        all.sort();
        all.dedup();
        check_prefixes(&all)?;
        all.sort_by_key(|p| std::cmp::Reverse(p.chars().count()));

        let mut index: HashMap<Vec<String>, Arc<CommandSpec>> = HashMap::new();
        let mut max_depth = 0;
        for c in &commands {
            let mut paths = vec![c.path()];
            for alias in &c.aliases {
                let mut p = c.group_path.clone();
                p.push(alias.clone());
                paths.push(p);
            }
            for path in paths {
                let key: Vec<String> = path.iter().map(|s| normalize(s, case_sensitive)).collect();
                max_depth = max_depth.max(key.len());
                if let Some(existing) = index.get(&key) {
                    return Err(BotError::Registration(RegistrationError::single(
                        c.full_name(),
                        format!("调用路径 '{}' 与命令 '{}' 冲突", path.join(" "), existing.full_name()),
                    )));
                }
                index.insert(key, c.clone());
            }
        }

        Ok(Self {
            global_prefixes: prefixes.to_vec(),
            all_prefixes: all,
            case_sensitive,
            index,
            max_depth,
            revision: root.revision(),
        })
    }

    pub fn revision(&self) -> u64 {
        self.revision
    }

    pub fn command_count(&self) -> usize {
        let unique: HashSet<*const CommandSpec> = self.index.values().map(Arc::as_ptr).collect();
        unique.len()
    }

    /// 命令实际接受的前缀
    pub fn prefixes_of<'a>(&'a self, spec: &'a CommandSpec) -> &'a [String] {
        spec.prefixes.as_deref().unwrap_or(&self.global_prefixes)
    }

    /// 文本是否以某个非空前缀开头
    pub fn has_prefix(&self, text: &str) -> bool {
        self.all_prefixes.iter().any(|p| text.starts_with(p.as_str()))
    }

    /// 展示用的首选前缀
    pub fn display_prefix(&self, spec: &CommandSpec) -> String {
        self.prefixes_of(spec).first().cloned().unwrap_or_default()
    }

    pub fn resolve(&self, args: &[Arg]) -> Resolution {
        let Some(first) = args.first().and_then(Arg::word) else {
            return Resolution::NotCommand;
        };

        let prefix = self
            .all_prefixes
            .iter()
            .find(|p| first.starts_with(p.as_str()))
            .cloned()
            .unwrap_or_default();

        // (段, 该段结束时已占用的参数个数；不在词尾则为 None)
        let mut segments: Vec<(String, Option<usize>)> = Vec::new();
        for (i, arg) in args.iter().enumerate() {
            let Some(word) = arg.word() else { break };
            let word = if i == 0 { &word[prefix.len()..] } else { word };
            let parts: Vec<&str> = word.split('.').filter(|p| !p.is_empty()).collect();
            for (j, part) in parts.iter().enumerate() {
                let end = (j + 1 == parts.len()).then_some(i + 1);
                segments.push((normalize(part, self.case_sensitive), end));
            }
            if segments.len() >= self.max_depth {
                break;
            }
        }

        for len in (1..=segments.len().min(self.max_depth)).rev() {
            let Some(consumed) = segments[len - 1].1 else { continue };
            let key: Vec<String> = segments[..len].iter().map(|(s, _)| s.clone()).collect();
            if let Some(spec) = self.index.get(&key)
                && self.prefixes_of(spec).contains(&prefix)
            {
                return Resolution::Matched {
                    spec: spec.clone(),
                    consumed,
                    prefix,
                };
            }
        }

        if prefix.is_empty() || segments.is_empty() {
            return Resolution::NotCommand;
        }
        let input: Vec<String> = segments.iter().map(|(s, _)| s.clone()).collect();
        let input = input.join(" ");
        Resolution::NotFound {
            error: CommandNotFound {
                suggestions: self.suggest(&input),
                input,
            },
            prefix,
        }
    }

    /// 相似度不低于阈值的命令，最多三个
    pub fn suggest(&self, input: &str) -> Vec<String> {
        let mut scored: Vec<(f64, String)> = Vec::new();
        for key in self.index.keys() {
            let candidate = key.join(" ");
            let score = similarity(input, &candidate);
            if score >= SUGGESTION_THRESHOLD {
                scored.push((score, candidate));
            }
        }
        scored.sort_by(|a, b| b.0.total_cmp(&a.0).then_with(|| a.1.cmp(&b.1)));
        scored.dedup_by(|a, b| a.1 == b.1);
        scored.into_iter().take(MAX_SUGGESTIONS).map(|(_, c)| c).collect()
    }
}

fn normalize(s: &str, case_sensitive: bool) -> String {
    if case_sensitive { s.to_string() } else { s.to_lowercase() }
}

/// 任一前缀是另一个的开头即视为冲突
pub fn check_prefixes(prefixes: &[String]) -> BotResult<()> {
    for a in prefixes.iter().filter(|p| !p.is_empty()) {
        for b in prefixes {
            if a != b && b.starts_with(a.as_str()) {
                return Err(BotError::PrefixConflict {
                    shorter: a.clone(),
                    longer: b.clone(),
                });
            }
        }
    }
    Ok(())
}

fn levenshtein(a: &str, b: &str) -> usize {
    let b: Vec<char> = b.chars().collect();
    let mut prev: Vec<usize> = (0..=b.len()).collect();
    for (i, ca) in a.chars().enumerate() {
        let mut cur = vec![i + 1; b.len() + 1];
        for (j, cb) in b.iter().enumerate() {
            let cost = usize::from(ca != *cb);
            cur[j + 1] = (prev[j] + cost).min(prev[j + 1] + 1).min(cur[j] + 1);
        }
        prev = cur;
    }
    prev[b.len()]
}

/// 归一化编辑距离相似度，取值 0..=1
pub fn similarity(a: &str, b: &str) -> f64 {
    let len = a.chars().count().max(b.chars().count());
    if len == 0 {
        return 1.0;
    }
    1.0 - levenshtein(a, b) as f64 / len as f64
}
