// lib.rs
//
// ================================================================================
// napbot - NapCat / OneBot11 机器人核心
//
// 架构：WebSocket 传输 | 请求路由 | 事件总线 | 命令系统 | 过滤器 | 静态插件
// ================================================================================

pub mod api;
pub mod bot;
pub mod bus;
pub mod command;
pub mod config;
pub mod dispatcher;
pub mod error;
pub mod event;
pub mod executor;
pub mod filter;
pub mod log;
pub mod message;
pub mod plugins;
pub mod registry;
pub mod router;
pub mod scheduler;
pub mod transport;

pub use bot::{NapBot, NapBotBuilder};
pub use error::{BotError, BotResult};

pub mod prelude {
    //! 常用类型的预导入模块
    //!
    //! 开发插件时使用：
    //! ```rust
    //! use napbot::prelude::*;
    //! ```

    // 1. 框架核心与错误处理
    pub use crate::{BotError, BotResult, NapBot, NapBotBuilder};

    // 2. 插件与注册
    pub use crate::plugins::{Plugin, PluginContext, PluginHost, PluginLoader, PluginSettings};
    pub use crate::executor::{HandlerFn, Invocation};
    pub use crate::bus::{BusHandler, EventBus, SubscribeOptions};
    pub use crate::scheduler::Schedule;

    // 3. 命令声明
    pub use crate::command::{
        Annotation, ArgValue, EventAnnotation, OptionGroupSpec, OptionSpec, ParamSpec, Signature,
    };

    // 4. 过滤器
    pub use crate::filter::{
        Always, Custom, Filter, GroupOnly, GroupRole, GroupRoleAtLeast, MessageSent, PrivateOnly, Role,
        RoleAtLeast, RoleTable, SenderIsNotSelf, SenderIsSelf,
    };

    // 5. 事件与消息
    pub use crate::api::Api;
    pub use crate::config::{AppConfig, CoreConfig, build_config};
    pub use crate::event::{Event, EventKind, MessageEvent};
    pub use crate::message::{Message, Segment};

    // 导出 toml 供插件序列化配置使用
    pub use toml;
}
