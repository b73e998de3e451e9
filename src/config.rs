use crate::error::{BotError, BotResult};
use serde::{Deserialize, Serialize, de::DeserializeOwned};
use std::collections::HashMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{PoisonError, RwLock};
use std::time::Duration;

/// 应用配置
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct AppConfig {
    /// 核心配置
    #[serde(default)]
    pub core: CoreConfig,
    /// NapCat 连接配置
    #[serde(default)]
    pub napcat: NapCatConfig,
    /// 插件配置（使用 flatten 支持任意插件配置）
    #[serde(flatten)]
    pub plugins: HashMap<String, toml::Value>,
}

/// 核心配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoreConfig {
    // 全局指令前缀（支持多个，如 ["/", "#"]）
    #[serde(default = "default_prefix")]
    pub command_prefix: Vec<String>,
    /// 指令匹配是否区分大小写
    #[serde(default)]
    pub case_sensitive: bool,
    /// 管理员 QQ 号
    #[serde(default)]
    pub admin_users: Vec<i64>,
    /// 超级管理员 QQ 号
    #[serde(default)]
    pub root_users: Vec<i64>,
    /// 事件处理器默认超时（秒），不填则不限时
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub handler_timeout_secs: Option<u64>,
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NapCatConfig {
    #[serde(default = "default_ws_uri")]
    pub ws_uri: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub access_token: Option<String>,
    #[serde(default = "default_api_timeout")]
    pub api_timeout_secs: u64,
    #[serde(default = "default_reconnect_attempts")]
    pub reconnect_attempts: u32,
    #[serde(default = "default_reconnect_base")]
    pub reconnect_base_ms: u64,
}

fn default_prefix() -> Vec<String> {
    vec!["/".to_string()]
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_ws_uri() -> String {
    "ws://127.0.0.1:3001".to_string()
}

fn default_api_timeout() -> u64 {
    30
}

fn default_reconnect_attempts() -> u32 {
    5
}

fn default_reconnect_base() -> u64 {
    500
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            command_prefix: default_prefix(),
            case_sensitive: false,
            admin_users: Vec::new(),
            root_users: Vec::new(),
            handler_timeout_secs: None,
            log_level: default_log_level(),
        }
    }
}

impl Default for NapCatConfig {
    fn default() -> Self {
        Self {
            ws_uri: default_ws_uri(),
            access_token: None,
            api_timeout_secs: default_api_timeout(),
            reconnect_attempts: default_reconnect_attempts(),
            reconnect_base_ms: default_reconnect_base(),
        }
    }
}

impl CoreConfig {
    pub fn handler_timeout(&self) -> Option<Duration> {
        self.handler_timeout_secs.map(Duration::from_secs)
    }
}

impl NapCatConfig {
    pub fn api_timeout(&self) -> Duration {
        Duration::from_secs(self.api_timeout_secs)
    }

    pub fn reconnect_base(&self) -> Duration {
        Duration::from_millis(self.reconnect_base_ms)
    }
}

impl AppConfig {
    /// 获取指定插件的配置
    pub fn plugin_config<T: DeserializeOwned>(&self, plugin: &str) -> Option<T> {
        self.plugins
            .get(plugin)
            .and_then(|v| v.clone().try_into().ok())
    }

    /// 修改插件配置中的一项，按原有值的类型转换，返回新值
    ///
    /// 原本没有的键按 TOML 字面量解析，解析失败时作为字符串保存。
    pub fn set_plugin_option(&mut self, plugin: &str, key: &str, raw: &str) -> BotResult<toml::Value> {
        let table = self
            .plugins
            .get_mut(plugin)
            .and_then(toml::Value::as_table_mut)
            .ok_or_else(|| BotError::Config(format!("未找到插件 {plugin} 的配置")))?;
        let invalid = |kind: &str| BotError::Config(format!("{key} 需要 {kind} 类型的值，收到 '{raw}'"));
        let value = match table.get(key) {
            Some(toml::Value::String(_)) => toml::Value::String(raw.to_string()),
            Some(toml::Value::Integer(_)) => toml::Value::Integer(raw.parse().map_err(|_| invalid("整数"))?),
            Some(toml::Value::Float(_)) => toml::Value::Float(raw.parse().map_err(|_| invalid("小数"))?),
            Some(toml::Value::Boolean(_)) => toml::Value::Boolean(raw.parse().map_err(|_| invalid("布尔"))?),
            Some(other) => {
                return Err(BotError::Config(format!("{key} 是 {} 类型，不支持直接修改", other.type_str())));
            }
            None => parse_literal(raw),
        };
        table.insert(key.to_string(), value.clone());
        Ok(value)
    }

    /// 插件是否启用（未配置时视为启用）
    pub fn plugin_enabled(&self, plugin: &str) -> bool {
        self.plugins
            .get(plugin)
            .and_then(|v| v.get("enabled"))
            .and_then(|v| v.as_bool())
            .unwrap_or(true)
    }
}

/// 辅助函数：构建默认配置 Value，并确保包含 enabled 字段
pub fn build_config<T: Serialize>(data: T) -> toml::Value {
    let mut val =
        toml::Value::try_from(data).unwrap_or(toml::Value::Table(Default::default()));
    if let toml::Value::Table(ref mut map) = val
        && !map.contains_key("enabled")
    {
        map.insert("enabled".to_string(), toml::Value::Boolean(true));
    }
    val
}

fn parse_literal(raw: &str) -> toml::Value {
    #[derive(Deserialize)]
    struct Literal {
        v: toml::Value,
    }
    toml::from_str::<Literal>(&format!("v = {raw}"))
        .map(|l| l.v)
        .unwrap_or_else(|_| toml::Value::String(raw.to_string()))
}

/// 配置管理器
///
/// 未指定路径时只在内存中保存，修改不会写盘。
pub struct ConfigManager {
    path: Option<PathBuf>,
    config: RwLock<AppConfig>,
    // 串行化修改，避免并发更新互相覆盖
    writes: tokio::sync::Mutex<()>,
}

impl ConfigManager {
    pub fn new<P: AsRef<Path>>(path: P) -> Self {
        Self {
            path: Some(path.as_ref().to_path_buf()),
            config: RwLock::new(AppConfig::default()),
            writes: tokio::sync::Mutex::new(()),
        }
    }

    /// 不关联文件的配置
    pub fn detached(config: AppConfig) -> Self {
        Self {
            path: None,
            config: RwLock::new(config),
            writes: tokio::sync::Mutex::new(()),
        }
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    fn store(&self, cfg: &AppConfig) {
        *self.config.write().unwrap_or_else(PoisonError::into_inner) = cfg.clone();
    }

    /// 加载配置，如果文件不存在则创建默认配置
    pub async fn load(&self) -> BotResult<AppConfig> {
        let Some(path) = self.path.as_deref() else {
            return Ok(self.get());
        };
        if !path.exists() {
            let default_cfg = AppConfig::default();
            self.save_atomic(&default_cfg).await?;
            return Ok(default_cfg);
        }

        let content = tokio::fs::read_to_string(path).await?;
        let cfg: AppConfig = toml::from_str(&content)?;

        self.store(&cfg);
        Ok(cfg)
    }

    /// 原子写入配置（写临时文件 -> Rename 覆盖）
    pub async fn save_atomic(&self, cfg: &AppConfig) -> BotResult<()> {
        let Some(path) = self.path.clone() else {
            self.store(cfg);
            return Ok(());
        };
        let content = toml::to_string_pretty(cfg)?;
        let tmp_path = path.with_extension("tmp");

        tokio::task::spawn_blocking(move || -> std::io::Result<()> {
            if let Some(parent) = path.parent()
                && !parent.as_os_str().is_empty()
            {
                fs::create_dir_all(parent)?;
            }

            let mut file = fs::File::create(&tmp_path)?;
            file.write_all(content.as_bytes())?;
            file.sync_all()?; // 确保落盘
            fs::rename(&tmp_path, &path)?;
            Ok(())
        })
        .await
        .map_err(|e| BotError::Config(format!("写入任务异常: {e}")))??;

        self.store(cfg);
        Ok(())
    }

    /// 获取当前配置（只读快照）
    pub fn get(&self) -> AppConfig {
        self.config.read().unwrap_or_else(PoisonError::into_inner).clone()
    }

    /// 读取当前配置的一部分，避免整份克隆
    pub fn with<R>(&self, f: impl FnOnce(&AppConfig) -> R) -> R {
        f(&self.config.read().unwrap_or_else(PoisonError::into_inner))
    }

    /// 更新配置（会自动保存）
    pub async fn update<F>(&self, f: F) -> BotResult<AppConfig>
    where
        F: FnOnce(&mut AppConfig),
    {
        self.try_update(|cfg| {
            f(cfg);
            Ok(())
        })
        .await
        .map(|((), cfg)| cfg)
    }

    /// 在副本上修改，成功后保存并替换当前配置；失败时保持不变
    pub async fn try_update<F, R>(&self, f: F) -> BotResult<(R, AppConfig)>
    where
        F: FnOnce(&mut AppConfig) -> BotResult<R>,
    {
        let _writing = self.writes.lock().await;
        let mut new_cfg = self.get();
        let out = f(&mut new_cfg)?;
        self.save_atomic(&new_cfg).await?;
        Ok((out, new_cfg))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    fn temp_path(name: &str) -> PathBuf {
        std::env::temp_dir()
            .join(format!("napbot-test-{}-{}", std::process::id(), name))
            .join("config.toml")
    }

    #[test]
    fn defaults_fill_missing_sections() {
        let cfg: AppConfig = toml::from_str("").unwrap();
        assert_eq!(cfg.core.command_prefix, vec!["/".to_string()]);
        assert_eq!(cfg.napcat.reconnect_attempts, 5);
        assert_eq!(cfg.napcat.api_timeout(), Duration::from_secs(30));
        assert!(cfg.core.handler_timeout().is_none());
    }

    #[test]
    fn plugin_tables_are_flattened() {
        #[derive(Deserialize)]
        struct EchoCfg {
            max_len: usize,
        }

        let cfg: AppConfig = toml::from_str(
            r#"
            [core]
            command_prefix = ["/", "!"]

            [echo]
            enabled = false
            max_len = 32
            "#,
        )
        .unwrap();

        assert_eq!(cfg.core.command_prefix.len(), 2);
        assert!(!cfg.plugin_enabled("echo"));
        assert!(cfg.plugin_enabled("ping"));
        assert_eq!(cfg.plugin_config::<EchoCfg>("echo").unwrap().max_len, 32);
    }

    #[test]
    fn build_config_injects_enabled() {
        #[derive(Serialize)]
        struct Empty {}
        let v = build_config(Empty {});
        assert_eq!(v.get("enabled").and_then(|v| v.as_bool()), Some(true));
    }

    #[tokio::test]
    async fn load_creates_file_then_update_persists() {
        let path = temp_path("load");
        let _ = fs::remove_file(&path);
        let manager = ConfigManager::new(&path);

        let cfg = manager.load().await.unwrap();
        assert!(path.exists());
        assert_eq!(cfg.core.log_level, "info");

        manager
            .update(|c| c.core.admin_users.push(10001))
            .await
            .unwrap();

        let reloaded = ConfigManager::new(&path).load().await.unwrap();
        assert_eq!(reloaded.core.admin_users, vec![10001]);
        assert!(!path.with_extension("tmp").exists());
    }

    #[test]
    fn plugin_options_keep_their_type() {
        let mut cfg: AppConfig = toml::from_str(
            r#"
            [ping]
            enabled = true
            reply = "Pong!"
            limit = 3
            "#,
        )
        .unwrap();

        assert_eq!(
            cfg.set_plugin_option("ping", "reply", "42").unwrap(),
            toml::Value::String("42".into())
        );
        assert_eq!(cfg.set_plugin_option("ping", "limit", "5").unwrap(), toml::Value::Integer(5));
        assert!(cfg.set_plugin_option("ping", "limit", "many").is_err());
        assert!(cfg.set_plugin_option("ping", "enabled", "yes").is_err());
        assert_eq!(cfg.set_plugin_option("ping", "ratio", "0.5").unwrap(), toml::Value::Float(0.5));
        assert_eq!(
            cfg.set_plugin_option("ping", "note", "hello world").unwrap(),
            toml::Value::String("hello world".into())
        );
        assert!(matches!(cfg.set_plugin_option("nope", "x", "1"), Err(BotError::Config(_))));
        assert_eq!(cfg.plugins["ping"]["limit"].as_integer(), Some(5));
    }

    #[tokio::test]
    async fn detached_manager_updates_in_memory_only() {
        let manager = ConfigManager::detached(AppConfig::default());
        assert!(manager.path().is_none());

        let failed = manager
            .try_update(|c| {
                c.core.admin_users.push(1);
                c.set_plugin_option("missing", "k", "v")
            })
            .await;
        assert!(failed.is_err());
        assert!(manager.get().core.admin_users.is_empty());

        manager.update(|c| c.core.root_users.push(2)).await.unwrap();
        assert_eq!(manager.with(|c| c.core.root_users.clone()), vec![2]);
        assert_eq!(manager.load().await.unwrap().core.root_users, vec![2]);
    }
}
