//! 运行时构建器：统一的初始化逻辑
//!
//! 按配置选择存储与 LLM 后端，组装 Oracle / 执行器 / 检查点策略，产出 HiveRuntime。
//! 测试与嵌入方可用 with_* 替换任一协作者。

use std::path::PathBuf;
use std::sync::Arc;

use crate::checkpoint::{CheckpointLedger, CheckpointPolicy};
use crate::config::{load_config, AppConfig};
use crate::core::agent_loop::LoopServices;
use crate::core::SessionRegistry;
use crate::llm::{LlmClient, MockLlmClient, OpenAiClient};
use crate::plan::{GoalOracle, LlmGoalOracle, LlmStepExecutor, StepExecutor};
use crate::snapshot::SnapshotManager;
use crate::storage::{create_store, Store};

/// 根据配置与环境变量选择 LLM 后端（DeepSeek / OpenAI 兼容 / Mock）
pub fn create_llm_from_config(cfg: &AppConfig) -> Arc<dyn LlmClient> {
    let provider = cfg.llm.provider.to_lowercase();
    if provider == "mock" {
        tracing::info!("Using Mock LLM");
        return Arc::new(MockLlmClient::default());
    }

    let deepseek_key = std::env::var("DEEPSEEK_API_KEY").ok();
    let openai_key = std::env::var("OPENAI_API_KEY").ok();
    // 有 DeepSeek Key，或配置为 deepseek 且仅有 OpenAI Key 时也走 DeepSeek 兼容端点
    let use_deepseek =
        deepseek_key.is_some() || (provider == "deepseek" && openai_key.is_some());
    let use_openai = openai_key.is_some() && provider != "deepseek";

    if use_deepseek {
        let model = cfg
            .llm
            .deepseek
            .model
            .clone()
            .unwrap_or_else(|| cfg.llm.model.clone());
        tracing::info!("Using DeepSeek LLM ({})", model);
        let key = deepseek_key.or(openai_key);
        Arc::new(OpenAiClient::deepseek(Some(&model), key.as_deref()))
    } else if use_openai {
        let model = cfg
            .llm
            .openai
            .model
            .clone()
            .unwrap_or_else(|| "gpt-4o-mini".to_string());
        tracing::info!("Using OpenAI LLM ({})", model);
        Arc::new(OpenAiClient::new(
            cfg.llm.base_url.as_deref(),
            &model,
            openai_key.as_deref(),
        ))
    } else {
        tracing::warn!("No API key set or provider unknown, using Mock LLM");
        Arc::new(MockLlmClient::default())
    }
}

/// 组装完成的运行时
#[derive(Clone)]
pub struct HiveRuntime {
    pub registry: Arc<SessionRegistry>,
    pub ledger: CheckpointLedger,
    pub snapshots: SnapshotManager,
    pub config: AppConfig,
}

impl HiveRuntime {
    pub async fn shutdown(&self) {
        self.registry.shutdown_all().await;
    }
}

/// 运行时构建器
pub struct HiveBuilder {
    config: AppConfig,
    store: Option<Arc<dyn Store>>,
    llm: Option<Arc<dyn LlmClient>>,
    oracle: Option<Arc<dyn GoalOracle>>,
    executor: Option<Arc<dyn StepExecutor>>,
    policy: Option<CheckpointPolicy>,
}

impl HiveBuilder {
    pub fn new(config: AppConfig) -> Self {
        Self {
            config,
            store: None,
            llm: None,
            oracle: None,
            executor: None,
            policy: None,
        }
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    pub fn with_store(mut self, store: Arc<dyn Store>) -> Self {
        self.store = Some(store);
        self
    }

    /// 同时用于默认 Oracle 与默认执行器
    pub fn with_llm(mut self, llm: Arc<dyn LlmClient>) -> Self {
        self.llm = Some(llm);
        self
    }

    pub fn with_oracle(mut self, oracle: Arc<dyn GoalOracle>) -> Self {
        self.oracle = Some(oracle);
        self
    }

    pub fn with_executor(mut self, executor: Arc<dyn StepExecutor>) -> Self {
        self.executor = Some(executor);
        self
    }

    pub fn with_policy(mut self, policy: CheckpointPolicy) -> Self {
        self.policy = Some(policy);
        self
    }

    pub async fn build(self) -> HiveRuntime {
        let cfg = self.config;
        let store = match self.store {
            Some(store) => store,
            None => create_store(&cfg.storage.backend, cfg.storage.db_path.as_deref()).await,
        };

        let llm = self.llm.unwrap_or_else(|| create_llm_from_config(&cfg));
        let oracle: Arc<dyn GoalOracle> = match self.oracle {
            Some(oracle) => oracle,
            None => Arc::new(LlmGoalOracle::new(llm.clone())),
        };
        let executor: Arc<dyn StepExecutor> = match self.executor {
            Some(executor) => executor,
            None => Arc::new(LlmStepExecutor::new(llm)),
        };
        let policy = self
            .policy
            .unwrap_or_else(|| CheckpointPolicy::from_config(&cfg.checkpoint));

        let services = Arc::new(
            LoopServices::new(store, oracle, executor)
                .with_policy(policy)
                .with_default_model(cfg.llm.model.clone())
                .with_step_timeout(cfg.session.step_timeout())
                .with_auto_snapshot_every(cfg.snapshot.auto_every()),
        );
        let ledger = services.ledger.clone();
        let snapshot_store = services.snapshots.clone();
        let registry = Arc::new(SessionRegistry::new(
            services,
            cfg.session.session_config(),
        ));
        let snapshots = SnapshotManager::new(registry.clone(), snapshot_store);

        HiveRuntime {
            registry,
            ledger,
            snapshots,
            config: cfg,
        }
    }
}

/// 加载配置并创建构建器；配置加载失败时使用默认配置
pub fn create_hive_builder(config_path: Option<PathBuf>) -> HiveBuilder {
    let cfg = load_config(config_path).unwrap_or_else(|e| {
        tracing::warn!("Config load failed ({}), using defaults", e);
        AppConfig::default()
    });
    HiveBuilder::new(cfg)
}
