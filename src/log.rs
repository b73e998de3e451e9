use chrono::Local;
use std::fmt;
use tracing::{Event, Level, Subscriber};
use tracing_subscriber::fmt::format::Writer;
use tracing_subscriber::fmt::{FmtContext, FormatEvent, FormatFields};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::registry::LookupSpan;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, fmt as tfmt};

/// 统一日志格式
/// 格式: [Time] [LEVEL] [Target] Message
pub struct BotFormatter {
    ansi: bool,
}

impl BotFormatter {
    pub fn new(ansi: bool) -> Self {
        Self { ansi }
    }
}

fn level_style(level: &Level) -> (&'static str, &'static str) {
    match *level {
        Level::INFO => ("\x1b[32m", "INFO"),  // Green
        Level::WARN => ("\x1b[33m", "WARN"),  // Yellow
        Level::ERROR => ("\x1b[31m", "ERRO"), // Red
        Level::DEBUG => ("\x1b[34m", "DEBG"), // Blue
        Level::TRACE => ("\x1b[35m", "TRAC"),
    }
}

impl<S, N> FormatEvent<S, N> for BotFormatter
where
    S: Subscriber + for<'a> LookupSpan<'a>,
    N: for<'a> FormatFields<'a> + 'static,
{
    fn format_event(
        &self,
        ctx: &FmtContext<'_, S, N>,
        mut writer: Writer<'_>,
        event: &Event<'_>,
    ) -> fmt::Result {
        let now = Local::now().format("%H:%M:%S");
        let meta = event.metadata();
        let (color, level_str) = level_style(meta.level());

        if self.ansi {
            let gray = "\x1b[90m";
            let reset = "\x1b[0m";
            let cyan = "\x1b[36m";
            write!(
                writer,
                "{gray}[{now}] {color}[{level_str}]{reset} {cyan}[{}]{reset} ",
                meta.target()
            )?;
        } else {
            write!(writer, "[{now}] [{level_str}] [{}] ", meta.target())?;
        }

        ctx.field_format().format_fields(writer.by_ref(), event)?;
        writeln!(writer)
    }
}

/// 安装全局日志订阅器
///
/// `RUST_LOG` 优先于配置中的等级。重复调用不会报错。
pub fn init(level: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(tfmt::layer().event_format(BotFormatter::new(true)))
        .try_init();
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io;
    use std::sync::{Arc, Mutex};

    #[derive(Clone, Default)]
    struct Capture(Arc<Mutex<Vec<u8>>>);

    impl io::Write for Capture {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn plain_layout_shows_component_target() {
        let capture = Capture::default();
        let writer = capture.clone();
        let subscriber = tfmt::fmt()
            .event_format(BotFormatter::new(false))
            .with_writer(move || writer.clone())
            .finish();

        tracing::subscriber::with_default(subscriber, || {
            tracing::info!(target: "Dispatcher", "事件泵已启动");
            tracing::warn!(target: "Registry", "未知命令");
            tracing::info!(target: "Executor", "处理器执行完毕");
        });

        let out = String::from_utf8(capture.0.lock().unwrap().clone()).unwrap();
        let lines: Vec<&str> = out.lines().collect();
        assert_eq!(lines.len(), 3);
        assert!(lines[0].starts_with('['));
        assert!(lines[0].ends_with("[INFO] [Dispatcher] 事件泵已启动"));
        assert!(lines[1].ends_with("[WARN] [Registry] 未知命令"));
        assert!(lines[2].ends_with("[INFO] [Executor] 处理器执行完毕"));
    }

    #[test]
    fn init_twice_is_harmless() {
        init("debug");
        init("info");
        tracing::info!(target: "Test", "日志已初始化");
    }

    #[test]
    fn level_labels_are_four_chars() {
        for level in [
            Level::INFO,
            Level::WARN,
            Level::ERROR,
            Level::DEBUG,
            Level::TRACE,
        ] {
            assert_eq!(level_style(&level).1.len(), 4);
        }
    }
}
