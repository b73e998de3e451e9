//! 统一执行同步与异步处理函数

use crate::api::Api;
use crate::command::{ArgValue, BoundArgs, FromArg};
use crate::error::BotResult;
use crate::event::MessageEvent;
use crate::filter::{Filter, FilterContext, RoleProvider, check_all};
use crate::message::Message;
use futures_util::FutureExt;
use futures_util::future::BoxFuture;
use serde_json::Value;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tracing::{debug, error};

/// 一次处理函数调用的上下文
#[derive(Clone)]
pub struct Invocation {
    pub event: MessageEvent,
    pub args: BoundArgs,
    pub api: Api,
    /// 命中的命令全名，纯消息处理器为 None
    pub command: Option<String>,
}

impl Invocation {
    pub fn arg<T: FromArg>(&self, name: &str) -> Option<T> {
        self.args.get(name)
    }

    pub fn value(&self, name: &str) -> Option<&ArgValue> {
        self.args.value(name)
    }

    /// 回复事件来源
    pub async fn reply(&self, message: impl Into<Message>) -> BotResult<Value> {
        self.api.reply(&self.event, message).await
    }
}

type SyncHandler = dyn Fn(&Invocation) -> anyhow::Result<()> + Send + Sync;
type AsyncHandler = dyn Fn(Invocation) -> BoxFuture<'static, anyhow::Result<()>> + Send + Sync;

#[derive(Clone)]
pub enum HandlerFn {
    Sync(Arc<SyncHandler>),
    Async(Arc<AsyncHandler>),
}

impl HandlerFn {
    pub fn sync<F>(f: F) -> Self
    where
        F: Fn(&Invocation) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        Self::Sync(Arc::new(f))
    }

    pub fn from_async<F, Fut>(f: F) -> Self
    where
        F: Fn(Invocation) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        Self::Async(Arc::new(move |inv| f(inv).boxed()))
    }
}

pub struct FunctionExecutor {
    roles: Arc<dyn RoleProvider>,
}

impl FunctionExecutor {
    pub fn new(roles: Arc<dyn RoleProvider>) -> Self {
        Self { roles }
    }

    pub fn roles(&self) -> &Arc<dyn RoleProvider> {
        &self.roles
    }

    /// 全部过滤器通过才返回 true
    pub fn passes(&self, filters: &[Filter], event: &MessageEvent) -> bool {
        let ctx = FilterContext {
            event,
            roles: self.roles.as_ref(),
        };
        check_all(filters, &ctx)
    }

    /// 先检查过滤器再执行；被拒绝、出错或 panic 都返回 false
    pub async fn execute(&self, name: &str, filters: &[Filter], handler: &HandlerFn, inv: Invocation) -> bool {
        if !self.passes(filters, &inv.event) {
            debug!(target: "Executor", "{} 未通过过滤器", name);
            return false;
        }
        self.run(name, handler, inv).await
    }

    /// 直接执行处理函数
    pub async fn run(&self, name: &str, handler: &HandlerFn, inv: Invocation) -> bool {
        let outcome = match handler {
            HandlerFn::Sync(f) => std::panic::catch_unwind(AssertUnwindSafe(|| f(&inv))),
            HandlerFn::Async(f) => match std::panic::catch_unwind(AssertUnwindSafe(|| f(inv))) {
                Ok(fut) => AssertUnwindSafe(fut).catch_unwind().await,
                Err(panic) => Err(panic),
            },
        };
        match outcome {
            Ok(Ok(())) => true,
            Ok(Err(e)) => {
                error!(target: "Executor", "{} 执行失败: {:#}", name, e);
                false
            }
            Err(_) => {
                error!(target: "Executor", "{} 执行时 panic", name);
                false
            }
        }
    }
}
