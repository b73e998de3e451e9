//! 消息分发
//!
//! 一条消息先尝试作为命令处理，再依次交给所有纯消息处理器。机器人自身发出的
//! 消息（`message_sent`）不触发命令，只交给纯消息处理器。

use crate::api::Api;
use crate::bus::{BusHandler, EventBus, SubscribeOptions, SubscriptionId};
use crate::command::{
    ArgumentError, Binder, BoundArgs, CommandGroup, CommandResolver, CommandSpec, ErrorFormatter, EventAnnotation,
    LexError, Resolution, parse_message,
};
use crate::config::CoreConfig;
use crate::error::BotResult;
use crate::event::{EventKind, MessageEvent};
use crate::executor::{FunctionExecutor, Invocation};
use crate::filter::{FilterRegistry, RoleProvider};
use serde_json::{Value, json};
use std::sync::{Arc, PoisonError, RwLock};
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, PartialEq)]
pub enum DispatchOutcome {
    /// 不是命令
    Ignored,
    LexFailed(LexError),
    NotFound { input: String },
    /// 事件类型或过滤器不满足
    Denied { command: String },
    BindFailed { command: String, error: ArgumentError },
    Executed { command: String, ok: bool },
}

impl DispatchOutcome {
    pub fn label(&self) -> &'static str {
        match self {
            Self::Ignored => "ignored",
            Self::LexFailed(_) => "lex_failed",
            Self::NotFound { .. } => "not_found",
            Self::Denied { .. } => "denied",
            Self::BindFailed { .. } => "bind_failed",
            Self::Executed { .. } => "executed",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct DispatchReport {
    pub outcome: DispatchOutcome,
    /// 成功执行的纯消息处理器数量
    pub handlers_run: usize,
}

pub struct UnifiedRegistry {
    root: Arc<CommandGroup>,
    filters: FilterRegistry,
    executor: FunctionExecutor,
    prefixes: Vec<String>,
    case_sensitive: bool,
    resolver: RwLock<Option<Arc<CommandResolver>>>,
}

impl UnifiedRegistry {
    pub fn new(core: &CoreConfig, roles: Arc<dyn RoleProvider>) -> Self {
        let filters = FilterRegistry::new();
        Self {
            root: CommandGroup::root(filters.clone()),
            filters,
            executor: FunctionExecutor::new(roles),
            prefixes: core.command_prefix.clone(),
            case_sensitive: core.case_sensitive,
            resolver: RwLock::new(None),
        }
    }

    pub fn root(&self) -> &Arc<CommandGroup> {
        &self.root
    }

    pub fn filters(&self) -> &FilterRegistry {
        &self.filters
    }

    pub fn executor(&self) -> &FunctionExecutor {
        &self.executor
    }

    pub fn prefixes(&self) -> &[String] {
        &self.prefixes
    }

    pub fn commands(&self) -> Vec<Arc<CommandSpec>> {
        self.root.all_commands()
    }

    /// 校验前缀并建立命令索引，失败时应终止启动
    pub fn initialize(&self) -> BotResult<()> {
        let resolver = CommandResolver::build(&self.root, &self.prefixes, self.case_sensitive)?;
        info!(
            target: "Registry",
            "命令索引就绪: {} 个命令，前缀 {:?}",
            resolver.command_count(),
            self.prefixes
        );
        *self.resolver.write().unwrap_or_else(PoisonError::into_inner) = Some(Arc::new(resolver));
        Ok(())
    }

    /// 当前解析器；命令树变化后自动重建，重建失败沿用旧索引
    fn resolver(&self) -> Option<Arc<CommandResolver>> {
        let current = self.resolver.read().unwrap_or_else(PoisonError::into_inner).clone()?;
        if current.revision() == self.root.revision() {
            return Some(current);
        }
        match CommandResolver::build(&self.root, &self.prefixes, self.case_sensitive) {
            Ok(rebuilt) => {
                debug!(target: "Registry", "命令树已变化，重建索引");
                let rebuilt = Arc::new(rebuilt);
                *self.resolver.write().unwrap_or_else(PoisonError::into_inner) = Some(rebuilt.clone());
                Some(rebuilt)
            }
            Err(e) => {
                error!(target: "Registry", "重建命令索引失败，沿用旧索引: {}", e);
                Some(current)
            }
        }
    }

    pub async fn handle_message(&self, event: &MessageEvent, api: &Api) -> DispatchReport {
        let outcome = if event.kind() == Some(EventKind::MessageSent) {
            DispatchOutcome::Ignored
        } else {
            self.dispatch_command(event, api).await
        };
        let handlers_run = self.run_handlers(event, api).await;
        DispatchReport { outcome, handlers_run }
    }

    async fn dispatch_command(&self, event: &MessageEvent, api: &Api) -> DispatchOutcome {
        let Some(resolver) = self.resolver() else {
            warn!(target: "Registry", "命令系统尚未初始化，忽略消息");
            return DispatchOutcome::Ignored;
        };

        let segments = event.segments();
        let args = match parse_message(&segments) {
            Ok(args) => args,
            Err(e) => {
                let leading = segments.iter().find_map(|s| s.as_text()).unwrap_or("").trim_start();
                if resolver.has_prefix(leading) {
                    send_reply(api, event, ErrorFormatter::lex(&e));
                    return DispatchOutcome::LexFailed(e);
                }
                return DispatchOutcome::Ignored;
            }
        };

        let (spec, consumed, prefix) = match resolver.resolve(&args) {
            Resolution::NotCommand => return DispatchOutcome::Ignored,
            Resolution::NotFound { error, prefix } => {
                debug!(target: "Registry", "未找到命令: {}", error.input);
                send_reply(api, event, ErrorFormatter::not_found(&error, &prefix));
                return DispatchOutcome::NotFound { input: error.input };
            }
            Resolution::Matched { spec, consumed, prefix } => (spec, consumed, prefix),
        };
        let command = spec.full_name();

        if !event_fits(spec.event, event) || !self.executor.passes(&spec.filters, event) {
            debug!(target: "Registry", "命令 {} 被过滤", command);
            return DispatchOutcome::Denied { command };
        }

        let args = match Binder::bind(&spec, &args[consumed..]) {
            Ok(args) => args,
            Err(e) => {
                send_reply(api, event, ErrorFormatter::argument(&spec, &e, &prefix));
                return DispatchOutcome::BindFailed { command, error: e };
            }
        };

        info!(
            target: "Registry",
            "[{}] {} 调用命令 {}",
            event.group_id().map_or_else(|| "私聊".to_string(), |g| g.to_string()),
            event.user_id(),
            command
        );
        let inv = Invocation {
            event: event.clone(),
            args,
            api: api.clone(),
            command: Some(command.clone()),
        };
        let ok = self.executor.run(&command, &spec.handler, inv).await;
        DispatchOutcome::Executed { command, ok }
    }

    async fn run_handlers(&self, event: &MessageEvent, api: &Api) -> usize {
        let mut ran = 0;
        for h in self.filters.handlers() {
            let inv = Invocation {
                event: event.clone(),
                args: BoundArgs::new(),
                api: api.clone(),
                command: None,
            };
            if self.executor.execute(&h.id(), &h.filters, &h.handler, inv).await {
                ran += 1;
            }
        }
        ran
    }

    /// 订阅消息事件与自身发出的消息事件
    pub fn subscribe_to(self: &Arc<Self>, bus: &EventBus, api: Api) -> BotResult<SubscriptionId> {
        let registry = self.clone();
        let handler = BusHandler::from_async(move |ev| {
            let registry = registry.clone();
            let api = api.clone();
            async move {
                let Some(msg) = MessageEvent::from_payload(ev.payload()) else {
                    return Ok(Value::Null);
                };
                let report = registry.handle_message(&msg, &api).await;
                Ok(json!({
                    "outcome": report.outcome.label(),
                    "handlers_run": report.handlers_run,
                }))
            }
        });
        let pattern = format!(
            "re:{}$|{}$",
            regex::escape(&EventKind::Message.bus_key()),
            regex::escape(&EventKind::MessageSent.bus_key())
        );
        bus.subscribe_with(
            &pattern,
            handler,
            SubscribeOptions::default().name("registry"),
        )
    }

    /// 移除插件的命令、具名过滤器与消息处理器
    pub fn revoke_plugin(&self, plugin: &str) -> usize {
        self.root.revoke_plugin(plugin) + self.filters.revoke_plugin(plugin)
    }
}

fn event_fits(annotation: EventAnnotation, event: &MessageEvent) -> bool {
    match annotation {
        EventAnnotation::GroupMessage => event.is_group(),
        EventAnnotation::PrivateMessage => event.is_private(),
        _ => true,
    }
}

/// 后台发送提示，失败只记录日志
fn send_reply(api: &Api, event: &MessageEvent, text: String) {
    let api = api.clone();
    let event = event.clone();
    tokio::spawn(async move {
        if let Err(e) = api.reply(&event, text).await {
            warn!(target: "Registry", "发送提示失败: {}", e);
        }
    });
}
