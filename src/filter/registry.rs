use super::builtin::{
    Always, GroupOnly, GroupRole, GroupRoleAtLeast, MessageSent, PrivateOnly, RoleAtLeast, SenderIsNotSelf,
    SenderIsSelf,
};
use super::{Filter, Role};
use crate::command::RegistrationError;
use crate::executor::HandlerFn;
use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};
use tracing::{debug, warn};

/// 不属于任何命令的消息处理器，例如复读、关键词回复
#[derive(Clone)]
pub struct FilteredHandler {
    pub plugin: String,
    pub name: String,
    pub filters: Vec<Filter>,
    pub handler: HandlerFn,
}

impl FilteredHandler {
    pub fn new(plugin: &str, name: &str, handler: HandlerFn) -> Self {
        Self {
            plugin: plugin.to_string(),
            name: name.to_string(),
            filters: Vec::new(),
            handler,
        }
    }

    pub fn filter(mut self, filter: Filter) -> Self {
        self.filters.push(filter);
        self
    }

    /// `plugin::name`
    pub fn id(&self) -> String {
        format!("{}::{}", self.plugin, self.name)
    }
}

struct NamedFilter {
    filter: Filter,
    owner: Option<String>,
}

#[derive(Default)]
struct RegistryInner {
    filters: RwLock<HashMap<String, NamedFilter>>,
    handlers: RwLock<Vec<FilteredHandler>>,
}

/// 具名过滤器与纯消息处理器的注册表
#[derive(Clone, Default)]
pub struct FilterRegistry {
    inner: Arc<RegistryInner>,
}

impl FilterRegistry {
    /// 预置内置过滤器
    pub fn new() -> Self {
        let registry = Self::default();
        let builtins = [
            ("group", Filter::new(GroupOnly::any())),
            ("private", Filter::new(PrivateOnly)),
            ("admin", Filter::new(RoleAtLeast(Role::Admin))),
            ("root", Filter::new(RoleAtLeast(Role::Root))),
            ("self", Filter::new(SenderIsSelf)),
            ("non_self", Filter::new(SenderIsNotSelf)),
            ("message_sent", Filter::new(MessageSent)),
            ("group_admin", Filter::new(GroupRoleAtLeast(GroupRole::Admin))),
            ("group_owner", Filter::new(GroupRoleAtLeast(GroupRole::Owner))),
            ("always", Filter::new(Always)),
        ];
        for (name, filter) in builtins {
            registry.register(name, filter, None);
        }
        registry
    }

    /// 注册具名过滤器；重名时保留旧的并返回 false
    pub fn register(&self, name: &str, filter: Filter, owner: Option<&str>) -> bool {
        let mut filters = self
            .inner
            .filters
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        if filters.contains_key(name) {
            warn!(target: "Filter", "过滤器 '{}' 已存在，忽略重复注册", name);
            return false;
        }
        filters.insert(
            name.to_string(),
            NamedFilter {
                filter,
                owner: owner.map(str::to_string),
            },
        );
        true
    }

    pub fn get(&self, name: &str) -> Option<Filter> {
        self.inner
            .filters
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(name)
            .map(|nf| nf.filter.clone())
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .inner
            .filters
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect();
        names.sort();
        names
    }

    pub fn add_handler(&self, handler: FilteredHandler) -> Result<(), RegistrationError> {
        let mut handlers = self
            .inner
            .handlers
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        let id = handler.id();
        if handlers.iter().any(|h| h.id() == id) {
            return Err(RegistrationError::single(id, "同名消息处理器已存在"));
        }
        debug!(target: "Filter", "注册消息处理器 {}", id);
        handlers.push(handler);
        Ok(())
    }

    /// 按注册顺序返回全部纯处理器
    pub fn handlers(&self) -> Vec<FilteredHandler> {
        self.inner
            .handlers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// 移除某插件注册的过滤器与处理器，返回移除数量
    pub fn revoke_plugin(&self, plugin: &str) -> usize {
        let mut removed = 0;
        {
            let mut handlers = self
                .inner
                .handlers
                .write()
                .unwrap_or_else(PoisonError::into_inner);
            let before = handlers.len();
            handlers.retain(|h| h.plugin != plugin);
            removed += before - handlers.len();
        }
        let mut filters = self
            .inner
            .filters
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        let before = filters.len();
        filters.retain(|_, nf| nf.owner.as_deref() != Some(plugin));
        removed + before - filters.len()
    }
}
