//! 应用配置：从 config/default.toml 与环境变量加载
//!
//! 加载顺序：先读 TOML 文件，再用环境变量 `HIVE__*` 覆盖（双下划线表示嵌套，如 `HIVE__SESSION__AUTO_RUN=true`）。

use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;

use crate::checkpoint::RejectPolicy;
use crate::core::SessionConfig;

/// 应用配置根（对应 config/default.toml 的顶层）
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct AppConfig {
    pub app: AppSection,
    pub llm: LlmSection,
    pub session: SessionSection,
    pub checkpoint: CheckpointSection,
    pub snapshot: SnapshotSection,
    pub storage: StorageSection,
}

/// [app] 段
#[derive(Debug, Clone, Deserialize, Default)]
pub struct AppSection {
    pub name: Option<String>,
}

/// [llm] 段：后端选择
#[derive(Debug, Clone, Deserialize)]
pub struct LlmSection {
    /// 后端：deepseek / openai / mock；优先级由 API Key 与 provider 共同决定
    #[serde(default = "default_provider")]
    pub provider: String,
    /// 会话未指定 model_id 时使用
    #[serde(default = "default_model")]
    pub model: String,
    pub base_url: Option<String>,
    #[serde(default)]
    pub deepseek: LlmModelSection,
    #[serde(default)]
    pub openai: LlmModelSection,
}

impl Default for LlmSection {
    fn default() -> Self {
        Self {
            provider: default_provider(),
            model: default_model(),
            base_url: None,
            deepseek: LlmModelSection::default(),
            openai: LlmModelSection::default(),
        }
    }
}

fn default_provider() -> String {
    "deepseek".to_string()
}

fn default_model() -> String {
    "deepseek-chat".to_string()
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct LlmModelSection {
    pub model: Option<String>,
}

/// [session] 段：新会话的默认配置
#[derive(Debug, Clone, Deserialize)]
pub struct SessionSection {
    #[serde(default)]
    pub auto_run: bool,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_step_delay_ms")]
    pub step_delay_ms: u64,
    /// 单次执行尝试的超时（秒）
    #[serde(default = "default_step_timeout_secs")]
    pub step_timeout_secs: u64,
}

impl Default for SessionSection {
    fn default() -> Self {
        Self {
            auto_run: false,
            max_retries: default_max_retries(),
            step_delay_ms: default_step_delay_ms(),
            step_timeout_secs: default_step_timeout_secs(),
        }
    }
}

impl SessionSection {
    pub fn session_config(&self) -> SessionConfig {
        SessionConfig {
            auto_run: self.auto_run,
            max_retries: self.max_retries,
            step_delay_ms: self.step_delay_ms,
            context: serde_json::Map::new(),
        }
    }

    pub fn step_timeout(&self) -> Duration {
        Duration::from_secs(self.step_timeout_secs.max(1))
    }
}

fn default_max_retries() -> u32 {
    2
}

fn default_step_delay_ms() -> u64 {
    500
}

fn default_step_timeout_secs() -> u64 {
    120
}

/// [checkpoint] 段：哪些分类需要人工审批，以及拒绝后的下一步
#[derive(Debug, Clone, Deserialize)]
pub struct CheckpointSection {
    #[serde(default = "default_gated_categories")]
    pub gated_categories: Vec<String>,
    /// 未设置时检查点永不过期
    #[serde(default)]
    pub ttl_secs: Option<u64>,
    #[serde(default)]
    pub reject_policy: RejectPolicy,
    #[serde(default = "default_true")]
    pub snapshot_before_checkpoint: bool,
}

impl Default for CheckpointSection {
    fn default() -> Self {
        Self {
            gated_categories: default_gated_categories(),
            ttl_secs: None,
            reject_policy: RejectPolicy::default(),
            snapshot_before_checkpoint: true,
        }
    }
}

fn default_gated_categories() -> Vec<String> {
    vec!["resource_selection".to_string()]
}

fn default_true() -> bool {
    true
}

/// [snapshot] 段
#[derive(Debug, Clone, Deserialize, Default)]
pub struct SnapshotSection {
    /// 每完成 N 步自动快照；未设置或 0 表示关闭
    #[serde(default)]
    pub auto_every: Option<usize>,
    /// 控制台 cleanup 未给出时长时使用的保留期（秒）
    #[serde(default)]
    pub retention_secs: Option<u64>,
}

impl SnapshotSection {
    pub fn auto_every(&self) -> Option<usize> {
        self.auto_every.filter(|n| *n > 0)
    }
}

/// [storage] 段：memory / sqlite
#[derive(Debug, Clone, Deserialize)]
pub struct StorageSection {
    #[serde(default = "default_backend")]
    pub backend: String,
    pub db_path: Option<PathBuf>,
}

impl Default for StorageSection {
    fn default() -> Self {
        Self {
            backend: default_backend(),
            db_path: None,
        }
    }
}

fn default_backend() -> String {
    "memory".to_string()
}

/// 从 config 目录加载配置，环境变量 HIVE__* 可覆盖
///
/// 1. 按顺序查找 config/default.toml、../config/default.toml、default.toml，找到则作为第一源
/// 2. 若传入 config_path 且文件存在，则追加该文件（可覆盖前面的键）
/// 3. 最后叠加环境变量 HIVE__*（双下划线表示嵌套键）
pub fn load_config(config_path: Option<PathBuf>) -> Result<AppConfig, config::ConfigError> {
    let mut builder = config::Config::builder();

    let default_names = ["config/default", "../config/default", "default"];
    for name in default_names {
        let path = format!("{}.toml", name);
        if std::path::Path::new(&path).exists() {
            builder = builder.add_source(config::File::with_name(name).required(false));
            break;
        }
    }

    if let Some(ref path) = config_path {
        if path.exists() {
            builder = builder.add_source(config::File::from(path.clone()).required(false));
        }
    }

    builder = builder.add_source(
        config::Environment::with_prefix("HIVE")
            .separator("__")
            .try_parsing(true),
    );

    let c = builder.build()?;
    c.try_deserialize()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let cfg = AppConfig::default();
        assert_eq!(cfg.storage.backend, "memory");
        assert_eq!(cfg.session.max_retries, 2);
        assert_eq!(cfg.checkpoint.gated_categories, vec!["resource_selection"]);
        assert!(cfg.checkpoint.snapshot_before_checkpoint);
        assert_eq!(cfg.snapshot.auto_every(), None);
    }

    #[test]
    fn test_load_explicit_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("hive.toml");
        std::fs::write(
            &path,
            r#"
[session]
auto_run = true
max_retries = 0

[checkpoint]
gated_categories = ["deploy", "resource_selection"]
ttl_secs = 60
reject_policy = "retry_item"

[snapshot]
auto_every = 2
"#,
        )
        .unwrap();

        let cfg = load_config(Some(path)).unwrap();
        assert!(cfg.session.auto_run);
        assert_eq!(cfg.session.max_retries, 0);
        assert_eq!(cfg.session.step_delay_ms, 500);
        assert_eq!(cfg.checkpoint.ttl_secs, Some(60));
        assert_eq!(cfg.checkpoint.reject_policy, RejectPolicy::RetryItem);
        assert_eq!(cfg.snapshot.auto_every(), Some(2));
        assert!(cfg.session.session_config().auto_run);
    }
}
