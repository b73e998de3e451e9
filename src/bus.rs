//! 事件总线
//!
//! 精确订阅与模式订阅分开索引。一次 `publish` 先按优先级（降序，同级按注册
//! 顺序）执行精确订阅者，再执行匹配的模式订阅者。

use crate::error::{BotError, BotResult, HandlerError};
use crate::event::Event;
use futures_util::FutureExt;
use futures_util::future::BoxFuture;
use regex::Regex;
use serde_json::Value;
use std::cell::Cell;
use std::collections::HashMap;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::runtime::Handle;
use tracing::{debug, warn};

pub type HandlerOutput = anyhow::Result<Value>;

type SyncFn = dyn Fn(&Event) -> HandlerOutput + Send + Sync;
type AsyncFn = dyn Fn(Arc<Event>) -> BoxFuture<'static, HandlerOutput> + Send + Sync;

/// 订阅处理器，同步处理器在事件循环上直接执行
#[derive(Clone)]
pub enum BusHandler {
    Sync(Arc<SyncFn>),
    Async(Arc<AsyncFn>),
}

impl BusHandler {
    pub fn sync<F>(f: F) -> Self
    where
        F: Fn(&Event) -> HandlerOutput + Send + Sync + 'static,
    {
        Self::Sync(Arc::new(f))
    }

    pub fn from_async<F, Fut>(f: F) -> Self
    where
        F: Fn(Arc<Event>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = HandlerOutput> + Send + 'static,
    {
        Self::Async(Arc::new(move |ev| f(ev).boxed()))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriptionId(u64);

impl std::fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "sub#{}", self.0)
    }
}

/// 订阅参数
#[derive(Debug, Clone, Default)]
pub struct SubscribeOptions {
    pub priority: i32,
    pub timeout: Option<Duration>,
    pub owner: Option<String>,
    pub name: Option<String>,
}

impl SubscribeOptions {
    pub fn priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn owner(mut self, owner: impl Into<String>) -> Self {
        self.owner = Some(owner.into());
        self
    }

    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }
}

// ============================================================================
// 1. 模式匹配
// ============================================================================

#[derive(Debug)]
enum Pattern {
    /// `re:` 前缀，从开头匹配
    Regex(Regex),
    /// 点分通配：`*` 匹配一段，`**` 匹配零或多段
    Glob(Vec<String>),
}

impl Pattern {
    fn parse(raw: &str) -> BotResult<Option<Self>> {
        if let Some(expr) = raw.strip_prefix("re:") {
            let re = Regex::new(&format!("^(?:{expr})"))
                .map_err(|e| BotError::Config(format!("无效的订阅正则 '{expr}': {e}")))?;
            return Ok(Some(Self::Regex(re)));
        }
        if raw.split('.').any(|seg| seg == "*" || seg == "**") {
            return Ok(Some(Self::Glob(
                raw.split('.').map(str::to_string).collect(),
            )));
        }
        Ok(None)
    }

    fn matches(&self, event_type: &str) -> bool {
        match self {
            Self::Regex(re) => re.is_match(event_type),
            Self::Glob(segs) => {
                let target: Vec<&str> = event_type.split('.').collect();
                glob_match(segs, &target)
            }
        }
    }
}

fn glob_match(pattern: &[String], target: &[&str]) -> bool {
    match pattern.split_first() {
        None => target.is_empty(),
        Some((head, rest)) if head == "**" => {
            (0..=target.len()).any(|skip| glob_match(rest, &target[skip..]))
        }
        Some((head, rest)) => match target.split_first() {
            Some((t, t_rest)) => (head == "*" || head == t) && glob_match(rest, t_rest),
            None => false,
        },
    }
}

// ============================================================================
// 2. 订阅表
// ============================================================================

#[derive(Clone)]
struct Subscription {
    id: SubscriptionId,
    seq: u64,
    name: String,
    handler: BusHandler,
    priority: i32,
    timeout: Option<Duration>,
    owner: Option<String>,
}

struct PatternEntry {
    pattern: Pattern,
    sub: Subscription,
}

#[derive(Default)]
struct Registry {
    exact: HashMap<String, Vec<Subscription>>,
    patterns: Vec<PatternEntry>,
}

fn sort_subs(list: &mut [Subscription]) {
    list.sort_by(|a, b| b.priority.cmp(&a.priority).then(a.seq.cmp(&b.seq)));
}

impl Registry {
    /// 获取快照，执行处理器时不持有锁
    fn snapshot(&self, event_type: &str) -> Vec<Subscription> {
        let mut exact = self.exact.get(event_type).cloned().unwrap_or_default();
        sort_subs(&mut exact);

        let mut pattern: Vec<Subscription> = self
            .patterns
            .iter()
            .filter(|p| p.pattern.matches(event_type))
            .map(|p| p.sub.clone())
            .collect();
        sort_subs(&mut pattern);

        exact.extend(pattern);
        exact
    }

    fn remove(&mut self, id: SubscriptionId) -> bool {
        for list in self.exact.values_mut() {
            if let Some(pos) = list.iter().position(|s| s.id == id) {
                list.remove(pos);
                return true;
            }
        }
        if let Some(pos) = self.patterns.iter().position(|p| p.sub.id == id) {
            self.patterns.remove(pos);
            return true;
        }
        false
    }

    fn len(&self) -> usize {
        self.exact.values().map(Vec::len).sum::<usize>() + self.patterns.len()
    }
}

// ============================================================================
// 3. EventBus
// ============================================================================

thread_local! {
    /// 当前线程是否驱动过事件循环；spawn_blocking 线程池不会被标记
    static LOOP_THREAD: Cell<bool> = const { Cell::new(false) };
}

fn mark_loop_thread() {
    LOOP_THREAD.with(|flag| flag.set(true));
}

fn on_loop_thread() -> bool {
    LOOP_THREAD.with(Cell::get)
}

struct BusInner {
    registry: Mutex<Registry>,
    next_id: AtomicU64,
    default_timeout: Option<Duration>,
    runtime: Mutex<Option<Handle>>,
}

/// 进程内发布订阅总线，克隆开销很小
#[derive(Clone)]
pub struct EventBus {
    inner: Arc<BusInner>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBus {
    pub fn new() -> Self {
        Self::with_default_timeout(None)
    }

    /// 未显式声明超时的异步处理器使用此默认值
    pub fn with_default_timeout(default_timeout: Option<Duration>) -> Self {
        Self {
            inner: Arc::new(BusInner {
                registry: Mutex::new(Registry::default()),
                next_id: AtomicU64::new(1),
                default_timeout,
                runtime: Mutex::new(None),
            }),
        }
    }

    fn registry(&self) -> std::sync::MutexGuard<'_, Registry> {
        self.inner
            .registry
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// 绑定事件循环，供 `publish_threadsafe_wait` 使用
    ///
    /// 在异步上下文中调用时，当前线程同时记为事件循环线程。
    pub fn bind_runtime(&self, handle: Handle) {
        if Handle::try_current().is_ok() {
            mark_loop_thread();
        }
        *self
            .inner
            .runtime
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(handle);
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
        let pattern = Pattern::parse(event_type)?;
        let seq = self.inner.next_id.fetch_add(1, Ordering::SeqCst);
        let id = SubscriptionId(seq);

        let sub = Subscription {
            id,
            seq,
            name: opts.name.unwrap_or_else(|| id.to_string()),
            handler,
            priority: opts.priority,
            timeout: opts.timeout,
            owner: opts.owner,
        };

        let mut registry = self.registry();
        match pattern {
            Some(pattern) => registry.patterns.push(PatternEntry { pattern, sub }),
            None => registry
                .exact
                .entry(event_type.to_string())
                .or_default()
                .push(sub),
        }
        debug!(target: "EventBus", "订阅 {} -> {}", event_type, id);
        Ok(id)
    }

    /// 取消订阅；未知 id 返回 false
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.registry().remove(id)
    }

    /// 移除某插件的全部订阅，返回移除数量
    pub fn revoke_owner(&self, owner: &str) -> usize {
        let mut registry = self.registry();
        let before = registry.len();
        for list in registry.exact.values_mut() {
            list.retain(|s| s.owner.as_deref() != Some(owner));
        }
        registry
            .patterns
            .retain(|p| p.sub.owner.as_deref() != Some(owner));
        registry.exact.retain(|_, list| !list.is_empty());
        before - registry.len()
    }

    pub fn subscription_count(&self) -> usize {
        self.registry().len()
    }

    /// 按顺序分发事件，返回各处理器的返回值
    pub async fn publish(&self, event: &Arc<Event>) -> Vec<Value> {
        mark_loop_thread();
        let subs = self.registry().snapshot(event.event_type());

        for sub in subs {
            match self.invoke(&sub, event).await {
                Ok(value) => event.add_result(value),
                Err(err) => {
                    warn!(target: "EventBus", "{}", err);
                    event.add_exception(err);
                }
            }

            if event.is_intercepted() || event.is_propagation_stopped() {
                debug!(target: "EventBus", "{} 在 {} 处停止传播", event.event_type(), sub.name);
                break;
            }
        }

        event.results()
    }

    async fn invoke(&self, sub: &Subscription, event: &Arc<Event>) -> Result<Value, HandlerError> {
        let failed = |e: anyhow::Error| HandlerError::Failed {
            handler: sub.name.clone(),
            message: format!("{e:#}"),
        };

        match &sub.handler {
            BusHandler::Sync(f) => match std::panic::catch_unwind(AssertUnwindSafe(|| f(event.as_ref()))) {
                Ok(res) => res.map_err(failed),
                Err(_) => Err(HandlerError::Panicked {
                    handler: sub.name.clone(),
                }),
            },
            BusHandler::Async(f) => {
                let fut = AssertUnwindSafe(f(event.clone())).catch_unwind();
                let outcome = match sub.timeout.or(self.inner.default_timeout) {
                    Some(limit) => match tokio::time::timeout(limit, fut).await {
                        Ok(outcome) => outcome,
                        Err(_) => {
                            return Err(HandlerError::Timeout {
                                handler: sub.name.clone(),
                                timeout: limit,
                            });
                        }
                    },
                    None => fut.await,
                };
                match outcome {
                    Ok(res) => res.map_err(failed),
                    Err(_) => Err(HandlerError::Panicked {
                        handler: sub.name.clone(),
                    }),
                }
            }
        }
    }

    /// 从事件循环以外的线程发布事件并阻塞等待
    ///
    /// 超时返回 None，底层的 publish 不会被取消。在事件循环线程上调用会直接返回 None，
    /// `spawn_blocking` 线程与普通系统线程均可使用。
    pub fn publish_threadsafe_wait(&self, event: Event, timeout: Duration) -> Option<Vec<Value>> {
        if on_loop_thread() {
            warn!(target: "EventBus", "publish_threadsafe_wait 不能在事件循环线程中调用");
            return None;
        }

        let handle = self
            .inner
            .runtime
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        let Some(handle) = handle else {
            warn!(target: "EventBus", "事件总线尚未绑定运行时，丢弃事件 {}", event.event_type());
            return None;
        };

        let (tx, rx) = std::sync::mpsc::channel();
        let bus = self.clone();
        let event = Arc::new(event);
        handle.spawn(async move {
            let results = bus.publish(&event).await;
            let _ = tx.send(results);
        });

        match rx.recv_timeout(timeout) {
            Ok(results) => Some(results),
            Err(_) => {
                debug!(target: "EventBus", "publish_threadsafe_wait 等待超时 ({:?})", timeout);
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::time::Instant;

    fn recorder(log: Arc<Mutex<Vec<&'static str>>>, tag: &'static str) -> BusHandler {
        BusHandler::sync(move |_| {
            log.lock().unwrap().push(tag);
            Ok(json!(tag))
        })
    }

    #[tokio::test]
    async fn higher_priority_runs_first_and_ties_keep_order() {
        let bus = EventBus::new();
        let log = Arc::new(Mutex::new(Vec::new()));

        bus.subscribe_with("a.b", recorder(log.clone(), "low"), SubscribeOptions::default().priority(1))
            .unwrap();
        bus.subscribe_with("a.b", recorder(log.clone(), "high"), SubscribeOptions::default().priority(10))
            .unwrap();
        bus.subscribe_with("a.b", recorder(log.clone(), "low2"), SubscribeOptions::default().priority(1))
            .unwrap();

        let ev = Arc::new(Event::new("a.b", json!({})));
        let results = bus.publish(&ev).await;

        assert_eq!(*log.lock().unwrap(), vec!["high", "low", "low2"]);
        assert_eq!(results, vec![json!("high"), json!("low"), json!("low2")]);
    }

    #[tokio::test]
    async fn exact_subscribers_run_before_patterns() {
        let bus = EventBus::new();
        let log = Arc::new(Mutex::new(Vec::new()));

        bus.subscribe_with("napbot.*", recorder(log.clone(), "glob"), SubscribeOptions::default().priority(100))
            .unwrap();
        bus.subscribe("re:napbot\\.notice", recorder(log.clone(), "regex")).unwrap();
        bus.subscribe("napbot.notice_event", recorder(log.clone(), "exact")).unwrap();
        bus.subscribe("napbot.message_event", recorder(log.clone(), "other")).unwrap();

        let ev = Arc::new(Event::new("napbot.notice_event", json!({})));
        bus.publish(&ev).await;

        assert_eq!(*log.lock().unwrap(), vec!["exact", "glob", "regex"]);
    }

    #[test]
    fn glob_double_star_spans_segments() {
        let p = Pattern::parse("napbot.**").unwrap().unwrap();
        assert!(p.matches("napbot.time_task.daily"));
        assert!(p.matches("napbot"));
        let p = Pattern::parse("napbot.*.daily").unwrap().unwrap();
        assert!(p.matches("napbot.time_task.daily"));
        assert!(!p.matches("napbot.daily"));
        assert!(Pattern::parse("napbot.message_event").unwrap().is_none());
    }

    #[tokio::test]
    async fn intercept_skips_remaining_handlers() {
        let bus = EventBus::new();
        let log = Arc::new(Mutex::new(Vec::new()));

        let l = log.clone();
        bus.subscribe_with(
            "x",
            BusHandler::sync(move |ev| {
                l.lock().unwrap().push("first");
                ev.intercept();
                Ok(Value::Null)
            }),
            SubscribeOptions::default().priority(5),
        )
        .unwrap();
        bus.subscribe("x", recorder(log.clone(), "second")).unwrap();
        bus.subscribe("x.*", recorder(log.clone(), "pattern")).unwrap();

        let ev = Arc::new(Event::new("x", json!({})));
        bus.publish(&ev).await;
        assert_eq!(*log.lock().unwrap(), vec!["first"]);
        assert!(ev.is_intercepted());
    }

    #[tokio::test]
    async fn stop_propagation_alone_also_stops() {
        let bus = EventBus::new();
        let log = Arc::new(Mutex::new(Vec::new()));

        let l = log.clone();
        bus.subscribe_with(
            "x",
            BusHandler::from_async(move |ev| {
                let l = l.clone();
                async move {
                    l.lock().unwrap().push("first");
                    ev.stop_propagation();
                    Ok(Value::Null)
                }
            }),
            SubscribeOptions::default().priority(5),
        )
        .unwrap();
        bus.subscribe("x", recorder(log.clone(), "second")).unwrap();

        let ev = Arc::new(Event::new("x", json!({})));
        bus.publish(&ev).await;
        assert_eq!(*log.lock().unwrap(), vec!["first"]);
        assert!(!ev.is_intercepted());
    }

    #[tokio::test]
    async fn failures_are_recorded_and_isolated() {
        let bus = EventBus::new();
        bus.subscribe_with(
            "x",
            BusHandler::sync(|_| Err(anyhow::anyhow!("boom"))),
            SubscribeOptions::default().priority(3).name("bad"),
        )
        .unwrap();
        bus.subscribe_with(
            "x",
            BusHandler::sync(|_| panic!("oops")),
            SubscribeOptions::default().priority(2).name("panicky"),
        )
        .unwrap();
        bus.subscribe_with(
            "x",
            BusHandler::from_async(|_| async {
                tokio::time::sleep(Duration::from_secs(5)).await;
                Ok(Value::Null)
            }),
            SubscribeOptions::default()
                .priority(1)
                .name("slow")
                .timeout(Duration::from_millis(20)),
        )
        .unwrap();
        bus.subscribe("x", BusHandler::sync(|_| Ok(json!("ok")))).unwrap();

        let ev = Arc::new(Event::new("x", json!({})));
        let results = bus.publish(&ev).await;

        assert_eq!(results, vec![json!("ok")]);
        let errs = ev.exceptions();
        assert_eq!(errs.len(), 3);
        assert!(matches!(&errs[0], HandlerError::Failed { handler, message } if handler == "bad" && message.contains("boom")));
        assert!(matches!(&errs[1], HandlerError::Panicked { handler } if handler == "panicky"));
        assert!(matches!(&errs[2], HandlerError::Timeout { handler, .. } if handler == "slow"));
    }

    #[test]
    fn unsubscribe_twice_returns_false_second_time() {
        let bus = EventBus::new();
        let id = bus.subscribe("x", BusHandler::sync(|_| Ok(Value::Null))).unwrap();
        let pid = bus.subscribe("x.*", BusHandler::sync(|_| Ok(Value::Null))).unwrap();

        assert!(bus.unsubscribe(id));
        assert!(!bus.unsubscribe(id));
        assert!(bus.unsubscribe(pid));
        assert!(!bus.unsubscribe(SubscriptionId(9_999)));
        assert_eq!(bus.subscription_count(), 0);
    }

    #[test]
    fn revoke_owner_removes_only_that_plugin() {
        let bus = EventBus::new();
        let noop = || BusHandler::sync(|_| Ok(Value::Null));
        bus.subscribe_with("a", noop(), SubscribeOptions::default().owner("p1")).unwrap();
        bus.subscribe_with("a.*", noop(), SubscribeOptions::default().owner("p1")).unwrap();
        bus.subscribe_with("a", noop(), SubscribeOptions::default().owner("p2")).unwrap();

        assert_eq!(bus.revoke_owner("p1"), 2);
        assert_eq!(bus.subscription_count(), 1);
        assert_eq!(bus.revoke_owner("p1"), 0);
    }

    #[test]
    fn invalid_regex_is_rejected() {
        let bus = EventBus::new();
        let res = bus.subscribe("re:(", BusHandler::sync(|_| Ok(Value::Null)));
        assert!(matches!(res, Err(BotError::Config(_))));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn threadsafe_wait_returns_results_from_other_thread() {
        let bus = EventBus::new();
        bus.bind_runtime(Handle::current());
        bus.subscribe("tick", BusHandler::sync(|ev| Ok(ev.data()))).unwrap();

        let b = bus.clone();
        let worker = std::thread::spawn(move || {
            b.publish_threadsafe_wait(Event::new("tick", json!({"n": 1})), Duration::from_secs(2))
        });
        let out = tokio::task::spawn_blocking(move || worker.join().unwrap())
            .await
            .unwrap();

        assert_eq!(out, Some(vec![json!({"n": 1})]));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn threadsafe_wait_works_from_blocking_pool() {
        let bus = EventBus::new();
        bus.bind_runtime(Handle::current());
        bus.subscribe("tick", BusHandler::sync(|ev| Ok(ev.data()))).unwrap();

        // 先在循环上发布一次，确保标记只落在工作线程上
        bus.publish(&Arc::new(Event::new("tick", json!({})))).await;

        let b = bus.clone();
        let out = tokio::task::spawn_blocking(move || {
            b.publish_threadsafe_wait(Event::new("tick", json!({"n": 2})), Duration::from_secs(2))
        })
        .await
        .unwrap();

        assert_eq!(out, Some(vec![json!({"n": 2})]));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn threadsafe_wait_times_out_with_none() {
        let bus = EventBus::new();
        bus.bind_runtime(Handle::current());
        bus.subscribe(
            "slow",
            BusHandler::from_async(|_| async {
                tokio::time::sleep(Duration::from_millis(800)).await;
                Ok(Value::Null)
            }),
        )
        .unwrap();

        let b = bus.clone();
        let handle = std::thread::spawn(move || {
            let start = Instant::now();
            let out = b.publish_threadsafe_wait(Event::new("slow", json!({})), Duration::from_millis(100));
            (out, start.elapsed())
        });
        let (out, elapsed) = tokio::task::spawn_blocking(move || handle.join().unwrap())
            .await
            .unwrap();

        assert!(out.is_none());
        assert!(elapsed < Duration::from_millis(500), "took {elapsed:?}");
    }

    #[tokio::test]
    async fn threadsafe_wait_refuses_on_runtime_thread() {
        let bus = EventBus::new();
        bus.bind_runtime(Handle::current());
        bus.subscribe("x", BusHandler::sync(|_| Ok(json!(1)))).unwrap();

        let start = Instant::now();
        assert!(
            bus.publish_threadsafe_wait(Event::new("x", json!({})), Duration::from_secs(1))
                .is_none()
        );
        assert!(start.elapsed() < Duration::from_millis(500));
    }
}
