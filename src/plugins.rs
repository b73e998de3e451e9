//! 插件加载
//!
//! 插件以静态表的形式编译进程序。加载时每个插件得到一个 [`PluginContext`]，
//! 通过它注册的命令、订阅、过滤器与定时任务都会记在该插件名下，卸载时一并撤销。

use crate::api::Api;
use crate::bus::{BusHandler, EventBus, SubscribeOptions, SubscriptionId};
use crate::command::{CommandBuilder, CommandGroup, RegistrationError};
use crate::config::{AppConfig, ConfigManager, CoreConfig};
use crate::error::BotResult;
use crate::event::time_task_key;
use crate::executor::HandlerFn;
use crate::filter::{Filter, FilteredHandler, RoleTable};
use crate::registry::UnifiedRegistry;
use crate::scheduler::{Schedule, TimeTaskScheduler};
use serde::de::DeserializeOwned;
use std::sync::{Arc, Mutex, OnceLock, PoisonError};
use std::time::{Duration, Instant};
use toml::Value;
use tracing::{error, info, warn};

pub mod echo;
pub mod help;
pub mod ping;
pub mod system;

pub struct Plugin {
    pub name: &'static str,
    pub description: &'static str,
    pub on_load: fn(&PluginContext) -> anyhow::Result<()>,
    pub default_config: fn() -> Value,
}

static PLUGINS: OnceLock<Vec<Plugin>> = OnceLock::new();

/// 获取内置插件列表
pub fn get_plugins() -> &'static [Plugin] {
    PLUGINS.get_or_init(|| {
        vec![
            Plugin {
                name: "ping",
                description: "在线检测",
                on_load: ping::on_load,
                default_config: ping::default_config,
            },
            Plugin {
                name: "echo",
                description: "复读指定内容",
                on_load: echo::on_load,
                default_config: echo::default_config,
            },
            Plugin {
                name: "help",
                description: "命令帮助",
                on_load: help::on_load,
                default_config: help::default_config,
            },
            Plugin {
                name: "system",
                description: "运行状态与权限、配置管理",
                on_load: system::on_load,
                default_config: system::default_config,
            },
        ]
    })
}

/// 插件可以接触到的运行时组件
#[derive(Clone)]
pub struct PluginHost {
    pub registry: Arc<UnifiedRegistry>,
    pub bus: EventBus,
    pub scheduler: Arc<TimeTaskScheduler>,
    pub api: Api,
    pub config: Arc<ConfigManager>,
    pub roles: Arc<RoleTable>,
    loaded: Arc<Mutex<Vec<&'static str>>>,
    started: Instant,
}

impl PluginHost {
    pub fn new(
        registry: Arc<UnifiedRegistry>,
        bus: EventBus,
        scheduler: Arc<TimeTaskScheduler>,
        api: Api,
        config: Arc<ConfigManager>,
        roles: Arc<RoleTable>,
    ) -> Self {
        Self {
            registry,
            bus,
            scheduler,
            api,
            config,
            roles,
            loaded: Arc::default(),
            started: Instant::now(),
        }
    }

    /// 按加载顺序排列的插件名
    pub fn loaded_plugins(&self) -> Vec<&'static str> {
        self.loaded.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    pub fn uptime(&self) -> Duration {
        self.started.elapsed()
    }
}

/// 插件配置的实时视图，每次读取都反映最新修改
#[derive(Clone)]
pub struct PluginSettings {
    plugin: String,
    store: Arc<ConfigManager>,
}

impl PluginSettings {
    pub fn get<T: DeserializeOwned>(&self) -> Option<T> {
        self.store.with(|c| c.plugin_config(&self.plugin))
    }
}

/// 单个插件的注册入口
pub struct PluginContext<'a> {
    plugin: &'a str,
    host: &'a PluginHost,
}

impl<'a> PluginContext<'a> {
    pub fn new(plugin: &'a str, host: &'a PluginHost) -> Self {
        Self { plugin, host }
    }

    pub fn name(&self) -> &str {
        self.plugin
    }

    pub fn api(&self) -> &Api {
        &self.host.api
    }

    pub fn bus(&self) -> &EventBus {
        &self.host.bus
    }

    pub fn host(&self) -> &PluginHost {
        self.host
    }

    pub fn core(&self) -> CoreConfig {
        self.host.config.with(|c| c.core.clone())
    }

    /// 本插件当前的配置表
    pub fn config<T: DeserializeOwned>(&self) -> Option<T> {
        self.host.config.with(|c| c.plugin_config(self.plugin))
    }

    /// 供处理器在运行时读取配置
    pub fn settings(&self) -> PluginSettings {
        PluginSettings {
            plugin: self.plugin.to_string(),
            store: self.host.config.clone(),
        }
    }

    pub fn root(&self) -> &Arc<CommandGroup> {
        self.host.registry.root()
    }

    /// 点分路径的命令组，不存在时创建
    pub fn group(&self, path: &str) -> Arc<CommandGroup> {
        self.host.registry.root().group(path)
    }

    pub fn command(&self, name: &str) -> CommandBuilder {
        self.host.registry.root().command(name).owner(self.plugin)
    }

    pub fn command_in(&self, group: &Arc<CommandGroup>, name: &str) -> CommandBuilder {
        group.command(name).owner(self.plugin)
    }

    pub fn subscribe(&self, event_type: &str, handler: BusHandler) -> BotResult<SubscriptionId> {
        self.subscribe_with(event_type, handler, SubscribeOptions::default())
    }

    pub fn subscribe_with(
        &self,
        event_type: &str,
        handler: BusHandler,
        opts: SubscribeOptions,
    ) -> BotResult<SubscriptionId> {
        let opts = match opts.name {
            Some(_) => opts,
            None => opts.name(format!("{}::{}", self.plugin, event_type)),
        };
        self.host.bus.subscribe_with(event_type, handler, opts.owner(self.plugin))
    }

    /// 注册纯消息处理器，每条消息都会经过
    pub fn on_message(
        &self,
        name: &str,
        filters: impl IntoIterator<Item = Filter>,
        handler: HandlerFn,
    ) -> Result<(), RegistrationError> {
        let handler = filters
            .into_iter()
            .fold(FilteredHandler::new(self.plugin, name, handler), FilteredHandler::filter);
        self.host.registry.filters().add_handler(handler)
    }

    /// 注册具名过滤器，供命令通过名称引用
    pub fn register_filter(&self, name: &str, filter: Filter) -> bool {
        self.host.registry.filters().register(name, filter, Some(self.plugin))
    }

    /// 添加定时任务；到点时发布 `napbot.time_task.<name>`
    pub fn schedule(&self, name: &str, schedule: Schedule) -> Option<u64> {
        self.host.scheduler.add(name, schedule, Some(self.plugin))
    }

    /// 添加定时任务并订阅其事件
    pub fn on_schedule(&self, name: &str, schedule: Schedule, handler: BusHandler) -> BotResult<Option<u64>> {
        self.subscribe(&time_task_key(name), handler)?;
        Ok(self.schedule(name, schedule))
    }
}

/// 插件生命周期
pub struct PluginLoader {
    host: PluginHost,
}

impl PluginLoader {
    pub fn new(host: PluginHost) -> Self {
        Self { host }
    }

    pub fn host(&self) -> &PluginHost {
        &self.host
    }

    pub fn loaded(&self) -> Vec<&'static str> {
        self.host.loaded_plugins()
    }

    pub fn is_loaded(&self, name: &str) -> bool {
        self.loaded().iter().any(|n| *n == name)
    }

    /// 加载全部已启用的插件，返回成功数量
    pub fn load_all(&self, plugins: &'static [Plugin]) -> usize {
        let enabled: Vec<&'static Plugin> = plugins
            .iter()
            .filter(|p| self.host.config.with(|c| c.plugin_enabled(p.name)))
            .collect();
        info!(
            target: "Plugin",
            "正在加载插件系统 (已启用 {}/{})",
            enabled.len(),
            plugins.len()
        );

        enabled.into_iter().filter(|p| self.load(*p).is_ok()).count()
    }

    /// 加载单个插件；失败时撤销它已完成的注册
    pub fn load(&self, plugin: &'static Plugin) -> anyhow::Result<()> {
        if self.is_loaded(plugin.name) {
            warn!(target: "Plugin", "[{}] 已加载，跳过", plugin.name);
            return Ok(());
        }

        let ctx = PluginContext::new(plugin.name, &self.host);
        match (plugin.on_load)(&ctx) {
            Ok(()) => {
                self.host
                    .loaded
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .push(plugin.name);
                info!(target: "Plugin", "✅ [{}] 就绪 ({})", plugin.name, plugin.description);
                Ok(())
            }
            Err(e) => {
                error!(target: "Plugin", "❌ [{}] 加载失败: {:#}", plugin.name, e);
                self.revoke(plugin.name);
                Err(e)
            }
        }
    }

    /// 卸载插件；未加载时返回 false
    pub fn unload(&self, name: &str) -> bool {
        let removed = {
            let mut loaded = self.host.loaded.lock().unwrap_or_else(PoisonError::into_inner);
            let before = loaded.len();
            loaded.retain(|n| *n != name);
            before != loaded.len()
        };
        if removed {
            self.revoke(name);
            info!(target: "Plugin", "[{}] 已卸载", name);
        }
        removed
    }

    fn revoke(&self, name: &str) -> usize {
        self.host.bus.revoke_owner(name)
            + self.host.registry.revoke_plugin(name)
            + self.host.scheduler.revoke_owner(name)
    }
}

/// 为缺失配置的插件补上默认配置，返回是否有改动
pub fn fill_default_configs(config: &mut AppConfig, plugins: &[Plugin]) -> bool {
    let mut modified = false;
    for p in plugins {
        if !config.plugins.contains_key(p.name) {
            info!(target: "Plugin", "+ 初始化插件配置: {}", p.name);
            config.plugins.insert(p.name.to_string(), (p.default_config)());
            modified = true;
        }
    }
    modified
}
