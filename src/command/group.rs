//! 命令组树
//!
//! 根节点为空名称的组。子组按需创建，命令注册在所属组内；同一组中命令名与
//! 别名不得重复。

use super::analyzer::{Analyzer, CommandDraft};
use super::error::RegistrationError;
use super::spec::{CommandSpec, Decorator, FilterDecl, OptionGroupSpec, OptionSpec, ParamSpec, Signature};
use crate::executor::{HandlerFn, Invocation};
use crate::filter::{Filter, FilterRegistry};
use std::collections::BTreeMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock, Weak};
use tracing::debug;

#[derive(Default)]
struct GroupState {
    commands: BTreeMap<String, Arc<CommandSpec>>,
    /// 别名 -> 命令名
    aliases: BTreeMap<String, String>,
    subgroups: BTreeMap<String, Arc<CommandGroup>>,
    description: String,
}

struct Shared {
    filters: FilterRegistry,
    /// 树结构每次变化加一，解析器据此判断是否需要重建索引
    revision: AtomicU64,
}

pub struct CommandGroup {
    name: String,
    parent: Weak<CommandGroup>,
    state: RwLock<GroupState>,
    shared: Arc<Shared>,
}

impl CommandGroup {
    pub fn root(filters: FilterRegistry) -> Arc<Self> {
        Arc::new(Self {
            name: String::new(),
            parent: Weak::new(),
            state: RwLock::new(GroupState::default()),
            shared: Arc::new(Shared {
                filters,
                revision: AtomicU64::new(0),
            }),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn filters(&self) -> &FilterRegistry {
        &self.shared.filters
    }

    pub fn revision(&self) -> u64 {
        self.shared.revision.load(Ordering::SeqCst)
    }

    fn bump(&self) {
        self.shared.revision.fetch_add(1, Ordering::SeqCst);
    }

    /// 获取或创建子组，`a.b` 表示嵌套
    pub fn group(self: &Arc<Self>, name: &str) -> Arc<CommandGroup> {
        let mut current = self.clone();
        for part in name.split('.').filter(|p| !p.is_empty()) {
            let next = {
                let mut state = current.state.write().unwrap_or_else(PoisonError::into_inner);
                state
                    .subgroups
                    .entry(part.to_string())
                    .or_insert_with(|| {
                        Arc::new(CommandGroup {
                            name: part.to_string(),
                            parent: Arc::downgrade(&current),
                            state: RwLock::new(GroupState::default()),
                            shared: current.shared.clone(),
                        })
                    })
                    .clone()
            };
            current = next;
        }
        current
    }

    pub fn subgroup(&self, name: &str) -> Option<Arc<CommandGroup>> {
        self.read().subgroups.get(name).cloned()
    }

    pub fn describe(&self, text: &str) {
        self.state.write().unwrap_or_else(PoisonError::into_inner).description = text.to_string();
    }

    pub fn description(&self) -> String {
        self.read().description.clone()
    }

    /// 从根到本组的路径，根为空
    pub fn path(&self) -> Vec<String> {
        let mut path = Vec::new();
        let mut node = self.parent.upgrade();
        if !self.name.is_empty() {
            path.push(self.name.clone());
        }
        while let Some(group) = node {
            if !group.name.is_empty() {
                path.push(group.name.clone());
            }
            node = group.parent.upgrade();
        }
        path.reverse();
        path
    }

    pub fn full_name(&self) -> String {
        self.path().join(" ")
    }

    pub fn command(self: &Arc<Self>, name: &str) -> CommandBuilder {
        CommandBuilder {
            group: self.clone(),
            draft: CommandDraft {
                name: name.to_string(),
                group_path: self.path(),
                ..CommandDraft::default()
            },
        }
    }

    /// 本组内按名称或别名查找
    pub fn get_command(&self, name: &str) -> Option<Arc<CommandSpec>> {
        let state = self.read();
        state.commands.get(name).cloned().or_else(|| {
            state
                .aliases
                .get(name)
                .and_then(|target| state.commands.get(target))
                .cloned()
        })
    }

    /// 递归收集所有命令
    pub fn all_commands(&self) -> Vec<Arc<CommandSpec>> {
        let state = self.read();
        let mut out: Vec<Arc<CommandSpec>> = state.commands.values().cloned().collect();
        for sub in state.subgroups.values() {
            out.extend(sub.all_commands());
        }
        out
    }

    /// 递归收集所有 (别名, 命令全名)
    pub fn all_aliases(&self) -> Vec<(String, String)> {
        let state = self.read();
        let mut out: Vec<(String, String)> = state
            .aliases
            .iter()
            .filter_map(|(alias, target)| state.commands.get(target).map(|c| (alias.clone(), c.full_name())))
            .collect();
        for sub in state.subgroups.values() {
            out.extend(sub.all_aliases());
        }
        out
    }

    fn insert(&self, spec: CommandSpec) -> Result<Arc<CommandSpec>, RegistrationError> {
        let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
        let taken = |key: &str| state.commands.contains_key(key) || state.aliases.contains_key(key);

        let mut problems = Vec::new();
        if taken(&spec.name) {
            problems.push(format!("组 '{}' 中已存在命令或别名 '{}'", self.full_name(), spec.name));
        }
        for alias in &spec.aliases {
            if taken(alias) {
                problems.push(format!("别名 '{alias}' 已被组 '{}' 中的其他命令占用", self.full_name()));
            }
        }
        if !problems.is_empty() {
            return Err(RegistrationError::new(spec.full_name(), problems));
        }

        let spec = Arc::new(spec);
        for alias in &spec.aliases {
            state.aliases.insert(alias.clone(), spec.name.clone());
        }
        state.commands.insert(spec.name.clone(), spec.clone());
        drop(state);
        self.bump();
        Ok(spec)
    }

    /// 递归移除某插件注册的命令与别名，组节点保留
    pub fn revoke_plugin(&self, owner: &str) -> usize {
        let removed = {
            let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
            let doomed: Vec<String> = state
                .commands
                .iter()
                .filter(|(_, c)| c.owner.as_deref() == Some(owner))
                .map(|(name, _)| name.clone())
                .collect();
            for name in &doomed {
                state.commands.remove(name);
            }
            state.aliases.retain(|_, target| !doomed.contains(target));
            doomed.len()
        };
        if removed > 0 {
            self.bump();
        }
        let subgroups: Vec<Arc<CommandGroup>> = self.read().subgroups.values().cloned().collect();
        removed + subgroups.iter().map(|g| g.revoke_plugin(owner)).sum::<usize>()
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, GroupState> {
        self.state.read().unwrap_or_else(PoisonError::into_inner)
    }
}

/// 命令注册构建器
///
/// ```ignore
/// root.command("kick")
///     .signature(Signature::message().param("user", Annotation::segment("at")))
///     .filter_named("group_admin")
///     .async_handler(|inv| async move { ... })
///     .register()?;
/// ```
pub struct CommandBuilder {
    group: Arc<CommandGroup>,
    draft: CommandDraft,
}

impl CommandBuilder {
    pub fn alias(mut self, alias: &str) -> Self {
        self.draft.aliases.push(alias.to_string());
        self
    }

    pub fn aliases(mut self, aliases: &[&str]) -> Self {
        self.draft.aliases.extend(aliases.iter().map(|a| a.to_string()));
        self
    }

    pub fn description(mut self, text: &str) -> Self {
        self.draft.description = text.to_string();
        self
    }

    /// 覆盖全局前缀，空字符串表示允许无前缀调用
    pub fn prefixes(mut self, prefixes: &[&str]) -> Self {
        self.draft.prefixes = Some(prefixes.iter().map(|p| p.to_string()).collect());
        self
    }

    pub fn signature(mut self, signature: Signature) -> Self {
        self.draft.signature = Some(signature);
        self
    }

    pub fn option(mut self, option: OptionSpec) -> Self {
        self.draft.decorators.push(Decorator::Option(option));
        self
    }

    pub fn option_group(mut self, group: OptionGroupSpec) -> Self {
        self.draft.decorators.push(Decorator::Group(group));
        self
    }

    pub fn param(mut self, param: ParamSpec) -> Self {
        self.draft.decorators.push(Decorator::Param(param));
        self
    }

    pub fn filter(mut self, filter: Filter) -> Self {
        self.draft.filters.push(FilterDecl::Inline(filter));
        self
    }

    pub fn filter_named(mut self, name: &str) -> Self {
        self.draft.filters.push(FilterDecl::Named(name.to_string()));
        self
    }

    pub fn owner(mut self, owner: &str) -> Self {
        self.draft.owner = Some(owner.to_string());
        self
    }

    pub fn handler(mut self, handler: HandlerFn) -> Self {
        self.draft.handler = Some(handler);
        self
    }

    pub fn sync_handler<F>(self, f: F) -> Self
    where
        F: Fn(&Invocation) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.handler(HandlerFn::sync(f))
    }

    pub fn async_handler<F, Fut>(self, f: F) -> Self
    where
        F: Fn(Invocation) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.handler(HandlerFn::from_async(f))
    }

    pub fn register(self) -> Result<Arc<CommandSpec>, RegistrationError> {
        let spec = Analyzer::new(&self.group.shared.filters).analyze(self.draft)?;
        let spec = self.group.insert(spec)?;
        debug!(target: "Command", "注册命令 {}", spec.full_name());
        Ok(spec)
    }
}
