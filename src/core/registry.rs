//! 会话注册表：session id → 存活的 Agent Loop
//!
//! get_or_create 在单个写锁内完成查找与创建（actor 在锁内同步 spawn），
//! 同一 id 在并发调用下也只会有一个存活的 loop。不同会话之间没有全局锁。

use std::collections::HashMap;
use std::sync::Arc;

use futures_util::future::join_all;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;

use crate::core::agent_loop::{AgentLoop, AgentLoopHandle, LoopServices};
use crate::core::{HiveError, HiveResult, SessionConfig, StatusView};

struct LiveLoop {
    handle: AgentLoopHandle,
    join: JoinHandle<()>,
}

pub struct SessionRegistry {
    services: Arc<LoopServices>,
    defaults: SessionConfig,
    loops: RwLock<HashMap<String, LiveLoop>>,
}

impl SessionRegistry {
    pub fn new(services: Arc<LoopServices>, defaults: SessionConfig) -> Self {
        Self {
            services,
            defaults,
            loops: RwLock::new(HashMap::new()),
        }
    }

    pub fn services(&self) -> &Arc<LoopServices> {
        &self.services
    }

    /// 新会话使用的默认配置（来自 [session] 段）
    pub fn default_config(&self) -> &SessionConfig {
        &self.defaults
    }

    pub async fn has(&self, session_id: &str) -> bool {
        self.loops
            .read()
            .await
            .get(session_id)
            .is_some_and(|l| !l.handle.is_closed())
    }

    pub async fn get(&self, session_id: &str) -> Option<AgentLoopHandle> {
        self.loops
            .read()
            .await
            .get(session_id)
            .filter(|l| !l.handle.is_closed())
            .map(|l| l.handle.clone())
    }

    pub async fn get_status(&self, session_id: &str) -> HiveResult<StatusView> {
        self.get(session_id)
            .await
            .map(|h| h.get_status())
            .ok_or_else(|| HiveError::not_found("session", session_id))
    }

    /// 已存在则返回现有 loop（忽略 config），否则以 config 创建
    pub async fn get_or_create(
        &self,
        session_id: &str,
        config: SessionConfig,
    ) -> HiveResult<AgentLoopHandle> {
        if session_id.trim().is_empty() {
            return Err(HiveError::Validation("session id must not be empty".to_string()));
        }
        if let Some(handle) = self.get(session_id).await {
            return Ok(handle);
        }

        let mut loops = self.loops.write().await;
        if let Some(live) = loops.get(session_id) {
            if !live.handle.is_closed() {
                return Ok(live.handle.clone());
            }
            tracing::warn!(session_id, "replacing closed agent loop");
        }
        let (handle, join) = AgentLoop::spawn(session_id, config, self.services.clone());
        loops.insert(
            session_id.to_string(),
            LiveLoop {
                handle: handle.clone(),
                join,
            },
        );
        Ok(handle)
    }

    /// 以默认配置 get_or_create
    pub async fn get_or_create_default(&self, session_id: &str) -> HiveResult<AgentLoopHandle> {
        self.get_or_create(session_id, self.defaults.clone()).await
    }

    /// 移除并停止 loop；不触碰已持久化的检查点与快照。返回是否存在
    pub async fn delete(&self, session_id: &str) -> bool {
        let removed = self.loops.write().await.remove(session_id);
        match removed {
            Some(live) => {
                live.handle.shutdown();
                tracing::info!(session_id, "session deleted from registry");
                true
            }
            None => false,
        }
    }

    /// 没有存活 loop 时，从已存储的 Todo List 重建会话
    ///
    /// 存在性检查与插入在同一个写锁内完成；重建失败时只移除本次创建的条目
    pub async fn resume(
        &self,
        session_id: &str,
        todo_list_id: &str,
        config: SessionConfig,
    ) -> HiveResult<AgentLoopHandle> {
        if session_id.trim().is_empty() {
            return Err(HiveError::Validation("session id must not be empty".to_string()));
        }
        let handle = {
            let mut loops = self.loops.write().await;
            if let Some(live) = loops.get(session_id).filter(|l| !l.handle.is_closed()) {
                return Err(HiveError::StateConflict {
                    op: "resume",
                    detail: format!(
                        "session {} already has a live loop ({})",
                        session_id,
                        live.handle.get_status().status
                    ),
                });
            }
            let (handle, join) = AgentLoop::spawn(session_id, config.clone(), self.services.clone());
            loops.insert(
                session_id.to_string(),
                LiveLoop {
                    handle: handle.clone(),
                    join,
                },
            );
            handle
        };

        match handle.reconstitute(todo_list_id, config).await {
            Ok(_) => Ok(handle),
            Err(e) => {
                tracing::warn!(session_id, todo_list_id, error = %e, "resume failed, discarding loop");
                self.remove_if_same(session_id, &handle).await;
                Err(e)
            }
        }
    }

    /// 仅当当前条目仍是 handle 对应的 loop 时移除并停止它
    async fn remove_if_same(&self, session_id: &str, handle: &AgentLoopHandle) -> bool {
        let mut loops = self.loops.write().await;
        if !loops.get(session_id).is_some_and(|l| l.handle.same_loop(handle)) {
            handle.shutdown();
            return false;
        }
        if let Some(live) = loops.remove(session_id) {
            live.handle.shutdown();
        }
        true
    }

    pub async fn session_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self
            .loops
            .read()
            .await
            .iter()
            .filter(|(_, l)| !l.handle.is_closed())
            .map(|(id, _)| id.clone())
            .collect();
        ids.sort();
        ids
    }

    pub async fn active_count(&self) -> usize {
        self.loops
            .read()
            .await
            .values()
            .filter(|l| !l.handle.is_closed())
            .count()
    }

    /// 进程退出时停止所有 actor 并等待其结束
    pub async fn shutdown_all(&self) {
        let drained: Vec<LiveLoop> = self.loops.write().await.drain().map(|(_, l)| l).collect();
        if drained.is_empty() {
            return;
        }
        tracing::info!(count = drained.len(), "shutting down agent loops");
        let joins = drained.into_iter().map(|live| {
            live.handle.shutdown();
            live.join
        });
        for result in join_all(joins).await {
            if let Err(e) = result {
                tracing::warn!(error = %e, "agent loop task ended abnormally");
            }
        }
    }
}
