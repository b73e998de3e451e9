//! 定时任务
//!
//! 调度在独立的系统线程上进行，到点后以 `napbot.time_task.<name>` 事件发布到
//! 总线，由订阅者完成实际工作。

use crate::bus::EventBus;
use crate::event::{Event, time_task_key};
use chrono::{DateTime, Local, TimeZone};
use serde_json::json;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread::JoinHandle;
use std::time::Duration;
use tracing::{debug, info, warn};

/// 单次发布的最长等待时间
const PUBLISH_TIMEOUT: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, PartialEq)]
pub enum Schedule {
    /// 固定间隔，首次在一个间隔之后
    Interval(Duration),
    /// 每天固定时间
    DailyAt { hour: u32, minute: u32, second: u32 },
    /// 只执行一次
    Once(DateTime<Local>),
}

impl Schedule {
    /// 下一次执行时间，None 表示任务结束
    pub fn next_after(&self, now: DateTime<Local>, first: bool) -> Option<DateTime<Local>> {
        match self {
            Self::Interval(d) => chrono::Duration::from_std(*d).ok().map(|d| now + d),
            Self::Once(at) => first.then_some(*at),
            Self::DailyAt { hour, minute, second } => {
                let today = now.date_naive();
                let target_today = today
                    .and_hms_opt(*hour, *minute, *second)
                    .and_then(|t| Local.from_local_datetime(&t).single());
                if let Some(target) = target_today
                    && target > now
                {
                    return Some(target);
                }
                // 今天已过或时间无效（如夏令时跳变），改为明天
                today
                    .succ_opt()?
                    .and_hms_opt(*hour, *minute, *second)
                    .and_then(|t| Local.from_local_datetime(&t).single())
            }
        }
    }
}

#[derive(Debug)]
struct Task {
    name: String,
    schedule: Schedule,
    next: DateTime<Local>,
    owner: Option<String>,
}

#[derive(Default)]
struct Shared {
    tasks: Mutex<HashMap<u64, Task>>,
    wake: Condvar,
    stop: AtomicBool,
    next_id: AtomicU64,
}

impl Shared {
    fn tasks(&self) -> MutexGuard<'_, HashMap<u64, Task>> {
        self.tasks.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

pub struct TimeTaskScheduler {
    shared: Arc<Shared>,
    bus: EventBus,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl TimeTaskScheduler {
    pub fn new(bus: EventBus) -> Self {
        Self {
            shared: Arc::new(Shared {
                next_id: AtomicU64::new(1),
                ..Shared::default()
            }),
            bus,
            thread: Mutex::new(None),
        }
    }

    /// 启动调度线程，重复调用无效
    pub fn start(&self) -> std::io::Result<()> {
        let mut slot = self.thread.lock().unwrap_or_else(PoisonError::into_inner);
        if slot.is_some() {
            return Ok(());
        }
        self.shared.stop.store(false, Ordering::SeqCst);
        let shared = self.shared.clone();
        let bus = self.bus.clone();
        let handle = std::thread::Builder::new()
            .name("napbot-scheduler".into())
            .spawn(move || run_loop(&shared, &bus))?;
        *slot = Some(handle);
        info!(target: "Scheduler", "定时任务线程已启动");
        Ok(())
    }

    /// 添加任务；无法算出执行时间时返回 None，已过期的一次性任务会立即执行
    pub fn add(&self, name: &str, schedule: Schedule, owner: Option<&str>) -> Option<u64> {
        let now = Local::now();
        let next = schedule.next_after(now, true)?;
        let id = self.shared.next_id.fetch_add(1, Ordering::SeqCst);
        debug!(target: "Scheduler", "添加任务 #{} {} 下次执行 {}", id, name, next.format("%F %T"));
        let mut tasks = self.shared.tasks();
        tasks.insert(
            id,
            Task {
                name: name.to_string(),
                schedule,
                next,
                owner: owner.map(str::to_string),
            },
        );
        self.shared.wake.notify_all();
        Some(id)
    }

    pub fn add_interval(&self, name: &str, every: Duration) -> Option<u64> {
        self.add(name, Schedule::Interval(every), None)
    }

    pub fn add_daily_at(&self, name: &str, hour: u32, minute: u32, second: u32) -> Option<u64> {
        self.add(name, Schedule::DailyAt { hour, minute, second }, None)
    }

    pub fn add_once(&self, name: &str, at: DateTime<Local>) -> Option<u64> {
        self.add(name, Schedule::Once(at), None)
    }

    pub fn remove(&self, id: u64) -> bool {
        let mut tasks = self.shared.tasks();
        let removed = tasks.remove(&id).is_some();
        self.shared.wake.notify_all();
        removed
    }

    pub fn revoke_owner(&self, owner: &str) -> usize {
        let mut tasks = self.shared.tasks();
        let before = tasks.len();
        tasks.retain(|_, t| t.owner.as_deref() != Some(owner));
        before - tasks.len()
    }

    pub fn task_count(&self) -> usize {
        self.shared.tasks().len()
    }

    /// 停止调度线程并等待其退出，任务表保留
    pub fn shutdown(&self) {
        {
            // 必须持锁修改，否则可能落在调度线程检查 stop 与 wait 之间而丢失唤醒
            let _tasks = self.shared.tasks();
            self.shared.stop.store(true, Ordering::SeqCst);
            self.shared.wake.notify_all();
        }
        let handle = self.thread.lock().unwrap_or_else(PoisonError::into_inner).take();
        if let Some(handle) = handle {
            info!(target: "Scheduler", "正在清理定时任务...");
            if handle.join().is_err() {
                warn!(target: "Scheduler", "定时任务线程异常退出");
            }
        }
    }
}

impl Drop for TimeTaskScheduler {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn run_loop(shared: &Shared, bus: &EventBus) {
    let mut tasks = shared.tasks();
    loop {
        if shared.stop.load(Ordering::SeqCst) {
            break;
        }
        let now = Local::now();
        let earliest = tasks.values().map(|t| t.next).min();
        match earliest {
            None => {
                tasks = shared.wake.wait(tasks).unwrap_or_else(PoisonError::into_inner);
            }
            Some(next) if next > now => {
                let wait = (next - now).to_std().unwrap_or(Duration::ZERO);
                tasks = shared
                    .wake
                    .wait_timeout(tasks, wait)
                    .unwrap_or_else(PoisonError::into_inner)
                    .0;
            }
            Some(_) => {
                let due = take_due(&mut tasks, now);
                drop(tasks);
                for (id, name) in due {
                    fire(bus, id, &name, now);
                }
                tasks = shared.tasks();
            }
        }
    }
    debug!(target: "Scheduler", "定时任务线程退出");
}

/// 取出到期任务并推进下一次时间
fn take_due(tasks: &mut HashMap<u64, Task>, now: DateTime<Local>) -> Vec<(u64, String)> {
    let mut due = Vec::new();
    let mut finished = Vec::new();
    for (id, task) in tasks.iter_mut() {
        if task.next > now {
            continue;
        }
        due.push((*id, task.name.clone()));
        match task.schedule.next_after(now, false) {
            Some(next) => task.next = next,
            None => finished.push(*id),
        }
    }
    for id in finished {
        tasks.remove(&id);
    }
    due.sort_by_key(|(id, _)| *id);
    due
}

fn fire(bus: &EventBus, id: u64, name: &str, now: DateTime<Local>) {
    let event = Event::new(
        time_task_key(name),
        json!({
            "task_id": id,
            "name": name,
            "time": now.to_rfc3339(),
        }),
    );
    match bus.publish_threadsafe_wait(event, PUBLISH_TIMEOUT) {
        Some(results) => debug!(target: "Scheduler", "任务 {} 执行完毕，{} 个结果", name, results.len()),
        None => warn!(target: "Scheduler", "任务 {} 未在 {:?} 内完成", name, PUBLISH_TIMEOUT),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::BusHandler;
    use chrono::Timelike;
    use serde_json::Value;

    #[test]
    fn daily_schedule_rolls_over_to_tomorrow() {
        let now = Local.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).single().unwrap();
        let later = Schedule::DailyAt {
            hour: 18,
            minute: 30,
            second: 0,
        };
        let next = later.next_after(now, true).unwrap();
        assert_eq!(next.date_naive(), now.date_naive());
        assert_eq!(next.hour(), 18);

        let earlier = Schedule::DailyAt {
            hour: 8,
            minute: 0,
            second: 0,
        };
        let next = earlier.next_after(now, true).unwrap();
        assert_eq!(next.date_naive(), now.date_naive().succ_opt().unwrap());
    }

    #[test]
    fn once_fires_a_single_time() {
        let now = Local::now();
        let once = Schedule::Once(now);
        assert_eq!(once.next_after(now, true), Some(now));
        assert_eq!(once.next_after(now, false), None);

        let every = Schedule::Interval(Duration::from_secs(5));
        assert_eq!(every.next_after(now, false), Some(now + chrono::Duration::seconds(5)));
    }

    #[test]
    fn due_tasks_are_published_on_the_bus() {
        let rt = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(1)
            .enable_all()
            .build()
            .unwrap();
        let bus = EventBus::new();
        bus.bind_runtime(rt.handle().clone());

        let ticks = Arc::new(Mutex::new(Vec::new()));
        let t = ticks.clone();
        bus.subscribe(
            "napbot.time_task.*",
            BusHandler::sync(move |ev| {
                t.lock().unwrap().push(ev.event_type().to_string());
                Ok(Value::Null)
            }),
        )
        .unwrap();

        let scheduler = TimeTaskScheduler::new(bus);
        scheduler.start().unwrap();
        scheduler.add_interval("tick", Duration::from_millis(30)).unwrap();
        scheduler.add_once("boot", Local::now()).unwrap();
        std::thread::sleep(Duration::from_millis(250));
        scheduler.shutdown();

        let ticks = ticks.lock().unwrap();
        assert_eq!(ticks.iter().filter(|n| *n == "napbot.time_task.boot").count(), 1);
        assert!(ticks.iter().filter(|n| *n == "napbot.time_task.tick").count() >= 2);
        assert_eq!(scheduler.task_count(), 1);
    }

    #[test]
    fn revoke_owner_removes_only_owned_tasks() {
        let scheduler = TimeTaskScheduler::new(EventBus::new());
        scheduler.add("a", Schedule::Interval(Duration::from_secs(60)), Some("p1"));
        scheduler.add("b", Schedule::Interval(Duration::from_secs(60)), Some("p2"));
        let id = scheduler.add_interval("c", Duration::from_secs(60)).unwrap();

        assert_eq!(scheduler.revoke_owner("p1"), 1);
        assert!(scheduler.remove(id));
        assert!(!scheduler.remove(id));
        assert_eq!(scheduler.task_count(), 1);
    }

    #[test]
    fn repeated_start_and_shutdown_never_hang() {
        let scheduler = Arc::new(TimeTaskScheduler::new(EventBus::new()));
        for round in 0..100 {
            scheduler.start().unwrap();
            let (tx, rx) = std::sync::mpsc::channel();
            let s = scheduler.clone();
            std::thread::spawn(move || {
                s.shutdown();
                let _ = tx.send(());
            });
            assert!(
                rx.recv_timeout(Duration::from_secs(2)).is_ok(),
                "shutdown hung on round {round}"
            );
        }
    }

    #[test]
    fn shutdown_wakes_thread_waiting_on_far_task() {
        let scheduler = TimeTaskScheduler::new(EventBus::new());
        scheduler.start().unwrap();
        scheduler.add_interval("later", Duration::from_secs(3600)).unwrap();
        std::thread::sleep(Duration::from_millis(20));

        let start = std::time::Instant::now();
        scheduler.shutdown();
        assert!(start.elapsed() < Duration::from_secs(1));
        assert_eq!(scheduler.task_count(), 1);
    }
}
