//! Agent Loop：每个会话一个 actor，是该会话状态的唯一写入者
//!
//! - 命令经 mpsc 队列按提交顺序处理，结果经 oneshot 回复
//! - 只读查询读取 watch 通道中的不可变 LoopState，不会看到半途写入，也不会排在慢步骤之后
//! - 每次变更先写存储再发布；存储失败时内存状态保持上一个一致值
//! - 过程事件经 broadcast 通道发布，供控制台 / 前端订阅

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde::Serialize;
use tokio::sync::mpsc::error::TryRecvError;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::checkpoint::{
    Checkpoint, CheckpointLedger, CheckpointPolicy, CheckpointStatus, CheckpointView, Decision,
    RejectPolicy, Resolution,
};
use crate::core::state::SessionRecord;
use crate::core::{
    HiveError, HiveResult, RecoveryAction, RecoveryEngine, SessionConfig, SessionStatus,
    SessionSupervisor, StatusView,
};
use crate::plan::executor::execute_with_audit;
use crate::plan::{GoalOracle, StepContext, StepExecutor};
use crate::snapshot::{RestoreOutcome, Snapshot, SnapshotState, SnapshotStore, SnapshotTrigger};
use crate::storage::Store;
use crate::todo::{TodoItem, TodoList};

/// 审批反馈注入执行上下文时使用的键
pub const FEEDBACK_CONTEXT_KEY: &str = "checkpoint_feedback";
/// RetryItem 策略下，最近一次拒绝记录在会话上下文中的键
pub const REJECTION_CONTEXT_KEY: &str = "last_rejection";

const EVENT_CAPACITY: usize = 64;

/// 所有会话共享的协作者与策略
#[derive(Clone)]
pub struct LoopServices {
    pub store: Arc<dyn Store>,
    pub oracle: Arc<dyn GoalOracle>,
    pub executor: Arc<dyn StepExecutor>,
    pub ledger: CheckpointLedger,
    pub snapshots: SnapshotStore,
    pub policy: CheckpointPolicy,
    /// start 未指定 model_id 时使用
    pub default_model: String,
    pub step_timeout: Duration,
    /// 每完成 N 步自动快照
    pub auto_snapshot_every: Option<usize>,
}

impl LoopServices {
    pub fn new(
        store: Arc<dyn Store>,
        oracle: Arc<dyn GoalOracle>,
        executor: Arc<dyn StepExecutor>,
    ) -> Self {
        Self {
            ledger: CheckpointLedger::new(store.clone()),
            snapshots: SnapshotStore::new(store.clone()),
            store,
            oracle,
            executor,
            policy: CheckpointPolicy::default(),
            default_model: "default".to_string(),
            step_timeout: Duration::from_secs(120),
            auto_snapshot_every: None,
        }
    }

    pub fn with_policy(mut self, policy: CheckpointPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn with_default_model(mut self, model: impl Into<String>) -> Self {
        self.default_model = model.into();
        self
    }

    pub fn with_step_timeout(mut self, timeout: Duration) -> Self {
        self.step_timeout = timeout;
        self
    }

    pub fn with_auto_snapshot_every(mut self, every: Option<usize>) -> Self {
        self.auto_snapshot_every = every.filter(|n| *n > 0);
        self
    }
}

/// 经 watch 发布的只读状态
#[derive(Debug, Clone, PartialEq)]
pub struct LoopState {
    pub session: SessionRecord,
    pub todo_list: Option<TodoList>,
}

impl LoopState {
    fn new(session_id: &str, config: SessionConfig) -> Self {
        Self {
            session: SessionRecord::new(session_id, config),
            todo_list: None,
        }
    }

    pub fn view(&self) -> StatusView {
        self.session.view()
    }

    fn snapshot_state(&self) -> SnapshotState {
        SnapshotState {
            session: self.session.clone(),
            todo_list: self.todo_list.clone(),
        }
    }

    fn list_mut(&mut self, op: &'static str) -> HiveResult<&mut TodoList> {
        self.todo_list.as_mut().ok_or_else(|| HiveError::StateConflict {
            op,
            detail: "session has no plan".to_string(),
        })
    }

    /// 游标移到下一个 pending 条目；计划结束时进入 completed
    fn advance_cursor(&mut self) {
        let Some(list) = &self.todo_list else {
            return;
        };
        self.session.progress = list.progress();
        if list.is_finished() {
            self.session.status = SessionStatus::Completed;
            self.session.current_item_id = None;
        } else {
            self.session.status = self.session.working_status();
            self.session.current_item_id = list.next_pending().map(|i| i.id.clone());
        }
    }
}

/// Agent Loop 过程事件（可序列化为 JSON 供前端展示）
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum LoopEvent {
    StatusChanged {
        from: SessionStatus,
        to: SessionStatus,
    },
    PlanCreated {
        todo_list_id: String,
        items: usize,
        warnings: Vec<String>,
    },
    StepStarted {
        item_id: String,
        attempt: u32,
    },
    StepCompleted {
        item_id: String,
        progress: u8,
    },
    StepFailed {
        item_id: String,
        attempt: u32,
        error: String,
        will_retry: bool,
    },
    CheckpointRaised {
        checkpoint_id: String,
        item_id: String,
    },
    CheckpointResolved {
        checkpoint_id: String,
        item_id: String,
        decision: Decision,
    },
    SnapshotCreated {
        snapshot_id: String,
        trigger: SnapshotTrigger,
    },
    Restored {
        snapshot_id: String,
        step_index: usize,
    },
}

/// start 的可选参数
#[derive(Debug, Clone, Default)]
pub struct StartOptions {
    pub model_id: Option<String>,
    /// 合并进会话 config.context
    pub context: serde_json::Map<String, serde_json::Value>,
    /// 覆盖会话配置中的 auto_run
    pub auto_run: Option<bool>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct StartOutcome {
    pub todo_list: TodoList,
    pub status: StatusView,
}

#[derive(Debug, Clone, PartialEq)]
pub enum StepOutcome {
    /// 执行器成功完成一个条目
    Completed {
        item_id: String,
        output: Option<String>,
        status: StatusView,
    },
    /// 条目需要人工审批，会话进入 waiting
    CheckpointRaised {
        checkpoint: CheckpointView,
        status: StatusView,
    },
    /// 没有剩余 pending 条目
    Finished { status: StatusView },
    /// 重试耗尽，会话进入 failed
    Failed {
        item_id: String,
        error: String,
        status: StatusView,
    },
}

impl StepOutcome {
    pub fn status(&self) -> &StatusView {
        match self {
            Self::Completed { status, .. }
            | Self::CheckpointRaised { status, .. }
            | Self::Finished { status }
            | Self::Failed { status, .. } => status,
        }
    }
}

/// approve / reject 的结果
#[derive(Debug, Clone, PartialEq)]
pub struct ResolveOutcome {
    pub checkpoint_id: String,
    pub item_id: String,
    pub status: StatusView,
    /// 接下来要处理的条目；计划结束时为 None
    pub next_step: Option<String>,
    /// 审批后执行失败导致会话 failed 时的错误
    pub error: Option<String>,
}

type Reply<T> = oneshot::Sender<HiveResult<T>>;

enum LoopCommand {
    Start {
        goal: String,
        options: StartOptions,
        reply: Reply<StartOutcome>,
    },
    Step {
        reply: Reply<StepOutcome>,
    },
    Pause {
        reason: Option<String>,
        reply: Reply<StatusView>,
    },
    Resume {
        reply: Reply<StatusView>,
    },
    Approve {
        item_id: String,
        feedback: Option<String>,
        reply: Reply<ResolveOutcome>,
    },
    Reject {
        item_id: String,
        reason: Option<String>,
        reply: Reply<ResolveOutcome>,
    },
    Snapshot {
        trigger: SnapshotTrigger,
        label: Option<String>,
        reply: Reply<Snapshot>,
    },
    Restore {
        snapshot: Box<Snapshot>,
        reply: Reply<RestoreOutcome>,
    },
    Reconstitute {
        todo_list_id: String,
        config: SessionConfig,
        reply: Reply<StatusView>,
    },
    Shutdown,
}

/// 调用方持有的会话句柄；可克隆，所有克隆指向同一个 actor
#[derive(Clone)]
pub struct AgentLoopHandle {
    session_id: String,
    cmd_tx: mpsc::UnboundedSender<LoopCommand>,
    state_rx: watch::Receiver<LoopState>,
    events: broadcast::Sender<LoopEvent>,
    supervisor: Arc<SessionSupervisor>,
    ledger: CheckpointLedger,
}

impl fmt::Debug for AgentLoopHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AgentLoopHandle")
            .field("session_id", &self.session_id)
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl AgentLoopHandle {
    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub async fn start(&self, goal: impl Into<String>, options: StartOptions) -> HiveResult<StartOutcome> {
        let goal = goal.into();
        self.request(|reply| LoopCommand::Start {
            goal,
            options,
            reply,
        })
        .await
    }

    pub async fn step(&self) -> HiveResult<StepOutcome> {
        self.request(|reply| LoopCommand::Step { reply }).await
    }

    /// 立即阻止自动运行发起新的一步；进行中的一步完成后才进入 paused
    pub async fn pause(&self, reason: Option<String>) -> HiveResult<StatusView> {
        self.supervisor.request_pause();
        let result = self
            .request(|reply| LoopCommand::Pause { reason, reply })
            .await;
        if result.is_err() {
            self.supervisor.clear_pause_request();
        }
        result
    }

    pub async fn resume(&self) -> HiveResult<StatusView> {
        self.request(|reply| LoopCommand::Resume { reply }).await
    }

    pub async fn approve_checkpoint(
        &self,
        item_id: impl Into<String>,
        feedback: Option<String>,
    ) -> HiveResult<ResolveOutcome> {
        let item_id = item_id.into();
        self.request(|reply| LoopCommand::Approve {
            item_id,
            feedback,
            reply,
        })
        .await
    }

    /// reason 缺失或为空白时返回 Validation，不做任何修改
    pub async fn reject_checkpoint(
        &self,
        item_id: impl Into<String>,
        reason: Option<String>,
    ) -> HiveResult<ResolveOutcome> {
        let item_id = item_id.into();
        self.request(|reply| LoopCommand::Reject {
            item_id,
            reason,
            reply,
        })
        .await
    }

    pub async fn create_snapshot(
        &self,
        trigger: SnapshotTrigger,
        label: Option<String>,
    ) -> HiveResult<Snapshot> {
        self.request(|reply| LoopCommand::Snapshot {
            trigger,
            label,
            reply,
        })
        .await
    }

    /// 用快照整体替换当前状态
    pub async fn restore(&self, snapshot: Snapshot) -> HiveResult<RestoreOutcome> {
        self.request(|reply| LoopCommand::Restore {
            snapshot: Box::new(snapshot),
            reply,
        })
        .await
    }

    /// 从已存储的 Todo List 重建会话（仅用于新建的空闲 loop）
    pub(crate) async fn reconstitute(
        &self,
        todo_list_id: impl Into<String>,
        config: SessionConfig,
    ) -> HiveResult<StatusView> {
        let todo_list_id = todo_list_id.into();
        self.request(|reply| LoopCommand::Reconstitute {
            todo_list_id,
            config,
            reply,
        })
        .await
    }

    pub fn get_status(&self) -> StatusView {
        self.state_rx.borrow().view()
    }

    /// 返回副本，修改它不会影响 loop 状态
    pub fn get_todo_list(&self) -> Option<TodoList> {
        self.state_rx.borrow().todo_list.clone()
    }

    pub fn state(&self) -> LoopState {
        self.state_rx.borrow().clone()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<LoopEvent> {
        self.events.subscribe()
    }

    pub async fn get_pending_checkpoints(
        &self,
        status: Option<CheckpointStatus>,
    ) -> HiveResult<Vec<CheckpointView>> {
        self.ledger
            .get_pending_checkpoints(&self.session_id, status)
            .await
    }

    /// 等待状态满足条件（自动运行时使用）
    pub async fn wait_until<F>(&self, mut predicate: F) -> HiveResult<StatusView>
    where
        F: FnMut(&StatusView) -> bool,
    {
        let mut rx = self.state_rx.clone();
        let view = rx
            .wait_for(|state| predicate(&state.view()))
            .await
            .map_err(|_| self.closed())?
            .view();
        Ok(view)
    }

    pub fn is_closed(&self) -> bool {
        self.cmd_tx.is_closed()
    }

    pub fn same_loop(&self, other: &AgentLoopHandle) -> bool {
        self.cmd_tx.same_channel(&other.cmd_tx)
    }

    /// 停止 actor 并取消进行中的执行与重试等待
    pub(crate) fn shutdown(&self) {
        let _ = self.cmd_tx.send(LoopCommand::Shutdown);
        self.supervisor.cancel();
    }

    fn closed(&self) -> HiveError {
        HiveError::LoopClosed(self.session_id.clone())
    }

    async fn request<T>(
        &self,
        make: impl FnOnce(Reply<T>) -> LoopCommand,
    ) -> HiveResult<T> {
        let (tx, rx) = oneshot::channel();
        self.cmd_tx.send(make(tx)).map_err(|_| self.closed())?;
        rx.await.map_err(|_| self.closed())?
    }
}

enum Execution {
    Done(Option<String>),
    Failed(String),
}

/// actor 本体
pub struct AgentLoop {
    state: LoopState,
    state_tx: watch::Sender<LoopState>,
    events: broadcast::Sender<LoopEvent>,
    supervisor: Arc<SessionSupervisor>,
    services: Arc<LoopServices>,
    /// 自动运行出错后暂停自动推进，直到收到下一条命令
    auto_hold: bool,
}

impl AgentLoop {
    /// 启动 actor 任务，返回句柄与任务 JoinHandle
    pub fn spawn(
        session_id: impl Into<String>,
        config: SessionConfig,
        services: Arc<LoopServices>,
    ) -> (AgentLoopHandle, JoinHandle<()>) {
        let session_id = session_id.into();
        let state = LoopState::new(&session_id, config);
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let (state_tx, state_rx) = watch::channel(state.clone());
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let supervisor = Arc::new(SessionSupervisor::new());

        let handle = AgentLoopHandle {
            session_id: session_id.clone(),
            cmd_tx,
            state_rx,
            events: events.clone(),
            supervisor: supervisor.clone(),
            ledger: services.ledger.clone(),
        };

        let actor = AgentLoop {
            state,
            state_tx,
            events,
            supervisor,
            services,
            auto_hold: false,
        };
        let join = tokio::spawn(actor.run(cmd_rx));
        tracing::info!(session_id = %session_id, "agent loop spawned");
        (handle, join)
    }

    fn session_id(&self) -> &str {
        &self.state.session.id
    }

    async fn run(mut self, mut cmd_rx: mpsc::UnboundedReceiver<LoopCommand>) {
        let cancel = self.supervisor.cancel_token();
        loop {
            let next = if self.should_auto_step() {
                match cmd_rx.try_recv() {
                    Ok(cmd) => Some(cmd),
                    Err(TryRecvError::Empty) => None,
                    Err(TryRecvError::Disconnected) => break,
                }
            } else {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    cmd = cmd_rx.recv() => match cmd {
                        Some(cmd) => Some(cmd),
                        None => break,
                    },
                }
            };

            match next {
                Some(LoopCommand::Shutdown) => break,
                Some(cmd) => {
                    self.auto_hold = false;
                    self.handle(cmd, &cancel).await;
                }
                None => {
                    if let Err(e) = self.step(&cancel).await {
                        tracing::warn!(session_id = %self.session_id(), error = %e, "auto step failed, holding");
                        self.auto_hold = true;
                    }
                }
            }

            if cancel.is_cancelled() {
                break;
            }
        }
        tracing::info!(session_id = %self.session_id(), "agent loop stopped");
    }

    fn should_auto_step(&self) -> bool {
        let session = &self.state.session;
        session.config.auto_run
            && session.status == SessionStatus::Running
            && !self.auto_hold
            && !self.supervisor.pause_requested()
            && !self.supervisor.is_cancelled()
    }

    async fn handle(&mut self, cmd: LoopCommand, cancel: &CancellationToken) {
        match cmd {
            LoopCommand::Start {
                goal,
                options,
                reply,
            } => {
                let _ = reply.send(self.start(goal, options, cancel).await);
            }
            LoopCommand::Step { reply } => {
                let _ = reply.send(self.step(cancel).await);
            }
            LoopCommand::Pause { reason, reply } => {
                let result = self.pause(reason).await;
                self.supervisor.clear_pause_request();
                let _ = reply.send(result);
            }
            LoopCommand::Resume { reply } => {
                let _ = reply.send(self.resume().await);
            }
            LoopCommand::Approve {
                item_id,
                feedback,
                reply,
            } => {
                let _ = reply.send(self.approve(&item_id, feedback, cancel).await);
            }
            LoopCommand::Reject {
                item_id,
                reason,
                reply,
            } => {
                let _ = reply.send(self.reject(&item_id, reason).await);
            }
            LoopCommand::Snapshot {
                trigger,
                label,
                reply,
            } => {
                let _ = reply.send(self.capture(trigger, label).await);
            }
            LoopCommand::Restore { snapshot, reply } => {
                let _ = reply.send(self.restore(*snapshot).await);
            }
            LoopCommand::Reconstitute {
                todo_list_id,
                config,
                reply,
            } => {
                let _ = reply.send(self.reconstitute(&todo_list_id, config).await);
            }
            LoopCommand::Shutdown => {}
        }
    }

    fn emit(&self, event: LoopEvent) {
        let _ = self.events.send(event);
    }

    /// 持久化草稿，成功后发布；失败时 self.state 保持不变
    async fn commit(&mut self, mut draft: LoopState) -> HiveResult<()> {
        let now = Utc::now();
        let mut list_saved = false;
        if draft.todo_list != self.state.todo_list {
            if let Some(list) = draft.todo_list.as_mut() {
                list.updated_at = now;
                self.services.store.save_todo_list(list).await?;
                list_saved = true;
            }
        }
        draft.session.updated_at = now;
        if let Err(e) = self.services.store.save_session(&draft.session).await {
            if let Some(previous) = self.state.todo_list.as_ref().filter(|_| list_saved) {
                if let Err(undo) = self.services.store.save_todo_list(previous).await {
                    tracing::error!(session_id = %self.session_id(), error = %undo, "failed to roll back todo list");
                }
            }
            return Err(e);
        }

        let from = self.state.session.status;
        let to = draft.session.status;
        self.state = draft;
        self.state_tx.send_replace(self.state.clone());
        if from != to {
            tracing::info!(session_id = %self.session_id(), %from, %to, "status changed");
            self.emit(LoopEvent::StatusChanged { from, to });
        }
        Ok(())
    }

    async fn start(
        &mut self,
        goal: String,
        options: StartOptions,
        cancel: &CancellationToken,
    ) -> HiveResult<StartOutcome> {
        let status = self.state.session.status;
        if status != SessionStatus::Idle || self.state.todo_list.is_some() {
            return Err(HiveError::conflict("start", status));
        }
        let goal = goal.trim().to_string();
        if goal.is_empty() {
            return Err(HiveError::Validation("goal must not be empty".to_string()));
        }
        let model_id = options
            .model_id
            .filter(|m| !m.trim().is_empty())
            .unwrap_or_else(|| self.services.default_model.clone());

        let mut draft = self.state.clone();
        draft.session.goal = Some(goal.clone());
        draft.session.model_id = Some(model_id.clone());
        draft.session.config.context.extend(options.context);
        if let Some(auto_run) = options.auto_run {
            draft.session.config.auto_run = auto_run;
        }
        draft.session.last_error = None;
        draft.session.status = SessionStatus::Running;
        self.commit(draft).await?;

        let context = self.state.session.config.context.clone();
        let decomposed = tokio::select! {
            result = self.services.oracle.decompose(&goal, &model_id, &context) => result,
            _ = cancel.cancelled() => Err(HiveError::LoopClosed(self.session_id().to_string())),
        };

        let decomposition = match decomposed {
            Ok(d) => d,
            Err(e) => {
                tracing::warn!(session_id = %self.session_id(), error = %e, "goal decomposition failed");
                let mut failed = self.state.clone();
                failed.session.status = SessionStatus::Failed;
                failed.session.last_error = Some(e.to_string());
                self.commit(failed).await?;
                return Err(e);
            }
        };

        let list = TodoList::from_plan(
            self.session_id(),
            goal,
            model_id,
            decomposition.items,
            decomposition.warnings,
        );
        let mut draft = self.state.clone();
        draft.session.todo_list_id = Some(list.id.clone());
        draft.session.current_item_id = list.next_pending().map(|i| i.id.clone());
        draft.session.progress = 0;
        draft.session.status = if list.is_empty() {
            SessionStatus::Idle
        } else {
            draft.session.working_status()
        };
        draft.todo_list = Some(list.clone());
        self.commit(draft).await?;

        if list.is_empty() {
            tracing::warn!(session_id = %self.session_id(), "oracle returned an empty plan");
        }
        tracing::info!(
            session_id = %self.session_id(),
            todo_list_id = %list.id,
            items = list.len(),
            "plan created"
        );
        self.emit(LoopEvent::PlanCreated {
            todo_list_id: list.id.clone(),
            items: list.len(),
            warnings: list.warnings.clone(),
        });
        Ok(StartOutcome {
            todo_list: list,
            status: self.state.view(),
        })
    }

    async fn step(&mut self, cancel: &CancellationToken) -> HiveResult<StepOutcome> {
        let status = self.state.session.status;
        if !status.can_step() {
            return Err(HiveError::conflict("step", status));
        }
        let list = self.state.todo_list.as_ref().ok_or_else(|| HiveError::StateConflict {
            op: "step",
            detail: "session has no plan".to_string(),
        })?;
        if list.is_empty() {
            return Err(HiveError::StateConflict {
                op: "step",
                detail: "plan has no items".to_string(),
            });
        }

        let Some(item) = list.next_pending().cloned() else {
            let mut draft = self.state.clone();
            draft.advance_cursor();
            self.commit(draft).await?;
            return Ok(StepOutcome::Finished {
                status: self.state.view(),
            });
        };

        if self.services.policy.gates(&item) {
            return self.raise_checkpoint(&item).await;
        }

        match self.execute_item(&item, None, cancel).await? {
            Execution::Done(output) => Ok(StepOutcome::Completed {
                item_id: item.id,
                output,
                status: self.state.view(),
            }),
            Execution::Failed(error) => Ok(StepOutcome::Failed {
                item_id: item.id,
                error,
                status: self.state.view(),
            }),
        }
    }

    async fn raise_checkpoint(&mut self, item: &TodoItem) -> HiveResult<StepOutcome> {
        let services = self.services.clone();
        let checkpoint = match services.ledger.pending_for_session(self.session_id()).await? {
            Some(existing) if existing.todo_item_id == item.id => existing,
            Some(existing) => {
                return Err(HiveError::StateConflict {
                    op: "step",
                    detail: format!(
                        "checkpoint {} for item {} is still pending",
                        existing.id, existing.todo_item_id
                    ),
                })
            }
            None => {
                if services.policy.snapshot_before_checkpoint {
                    let label = format!("before checkpoint on step {}", item.position + 1);
                    self.capture(SnapshotTrigger::Checkpoint, Some(label)).await?;
                }
                services
                    .ledger
                    .create(
                        self.session_id(),
                        &item.id,
                        services.policy.reason_for(item),
                        services
                            .policy
                            .preview_for(item, self.state.session.goal.as_deref()),
                        services.policy.options_for(item),
                        services.policy.ttl,
                    )
                    .await?
            }
        };

        let mut draft = self.state.clone();
        draft.session.status = SessionStatus::Waiting;
        draft.session.current_item_id = Some(item.id.clone());
        self.commit(draft).await?;

        self.emit(LoopEvent::CheckpointRaised {
            checkpoint_id: checkpoint.id.clone(),
            item_id: item.id.clone(),
        });
        Ok(StepOutcome::CheckpointRaised {
            checkpoint: checkpoint.view_at(Utc::now()),
            status: self.state.view(),
        })
    }

    /// 执行一个条目：in_progress → 重试循环 → completed，或重试耗尽后 failed
    async fn execute_item(
        &mut self,
        item: &TodoItem,
        feedback: Option<String>,
        cancel: &CancellationToken,
    ) -> HiveResult<Execution> {
        self.mark_started(item).await?;
        self.run_item(item, feedback, cancel).await
    }

    async fn mark_started(&mut self, item: &TodoItem) -> HiveResult<()> {
        let mut draft = self.state.clone();
        draft.list_mut("step")?.start_item(&item.id)?;
        draft.session.status = SessionStatus::Running;
        draft.session.current_item_id = Some(item.id.clone());
        self.commit(draft).await
    }

    async fn run_item(
        &mut self,
        item: &TodoItem,
        feedback: Option<String>,
        cancel: &CancellationToken,
    ) -> HiveResult<Execution> {
        let session = &self.state.session;
        let mut context = session.config.context.clone();
        if let Some(feedback) = feedback {
            context.insert(FEEDBACK_CONTEXT_KEY.to_string(), serde_json::Value::String(feedback));
        }
        let mut ctx = StepContext {
            session_id: session.id.clone(),
            goal: session.goal.clone(),
            model_id: session.model_id.clone(),
            context,
            attempt: 1,
        };
        let engine = RecoveryEngine::from_config(&session.config);
        let executor = self.services.executor.clone();
        let limit = self.services.step_timeout;

        let outcome = loop {
            self.emit(LoopEvent::StepStarted {
                item_id: item.id.clone(),
                attempt: ctx.attempt,
            });
            let result = tokio::select! {
                result = execute_with_audit(executor.as_ref(), item, &ctx, limit) => result,
                _ = cancel.cancelled() => return Err(HiveError::LoopClosed(self.session_id().to_string())),
            };
            if result.success {
                break Execution::Done(result.output);
            }

            let error = result
                .error
                .unwrap_or_else(|| "step reported failure".to_string());
            match engine.handle(&HiveError::Executor(error.clone()), ctx.attempt) {
                RecoveryAction::RetryAfter(delay) => {
                    tracing::warn!(
                        session_id = %self.session_id(),
                        item_id = %item.id,
                        attempt = ctx.attempt,
                        error = %error,
                        "step failed, retrying"
                    );
                    self.emit(LoopEvent::StepFailed {
                        item_id: item.id.clone(),
                        attempt: ctx.attempt,
                        error,
                        will_retry: true,
                    });
                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        _ = cancel.cancelled() => return Err(HiveError::LoopClosed(self.session_id().to_string())),
                    }
                    ctx.attempt += 1;
                }
                RecoveryAction::Fail(message) => {
                    self.emit(LoopEvent::StepFailed {
                        item_id: item.id.clone(),
                        attempt: ctx.attempt,
                        error,
                        will_retry: false,
                    });
                    break Execution::Failed(message);
                }
            }
        };

        match outcome {
            Execution::Done(output) => {
                let mut draft = self.state.clone();
                draft.list_mut("step")?.complete_item(&item.id)?;
                draft.advance_cursor();
                draft.session.last_error = None;
                self.commit(draft).await?;

                let progress = self.state.session.progress;
                tracing::info!(session_id = %self.session_id(), item_id = %item.id, progress, "step completed");
                self.emit(LoopEvent::StepCompleted {
                    item_id: item.id.clone(),
                    progress,
                });
                self.auto_snapshot().await;
                Ok(Execution::Done(output))
            }
            Execution::Failed(message) => {
                tracing::warn!(session_id = %self.session_id(), item_id = %item.id, error = %message, "step failed, session failed");
                let mut draft = self.state.clone();
                draft.list_mut("step")?.reset_item(&item.id)?;
                draft.session.status = SessionStatus::Failed;
                draft.session.last_error = Some(message.clone());
                self.commit(draft).await?;
                Ok(Execution::Failed(message))
            }
        }
    }

    async fn auto_snapshot(&mut self) {
        let Some(every) = self.services.auto_snapshot_every else {
            return;
        };
        let completed = self
            .state
            .todo_list
            .as_ref()
            .map(TodoList::completed_count)
            .unwrap_or(0);
        if completed == 0 || completed % every != 0 {
            return;
        }
        let label = format!("after {completed} completed steps");
        if let Err(e) = self.capture(SnapshotTrigger::Auto, Some(label)).await {
            tracing::warn!(session_id = %self.session_id(), error = %e, "auto snapshot failed");
        }
    }

    async fn pause(&mut self, reason: Option<String>) -> HiveResult<StatusView> {
        let status = self.state.session.status;
        if !status.can_pause() {
            return Err(HiveError::conflict("pause", status));
        }
        if self.state.todo_list.as_ref().map_or(true, TodoList::is_empty) {
            return Err(HiveError::StateConflict {
                op: "pause",
                detail: "session has no plan items".to_string(),
            });
        }
        let mut draft = self.state.clone();
        draft.session.paused_from = Some(status);
        draft.session.paused_reason = reason.filter(|r| !r.trim().is_empty());
        draft.session.status = SessionStatus::Paused;
        self.commit(draft).await?;
        Ok(self.state.view())
    }

    async fn resume(&mut self) -> HiveResult<StatusView> {
        let status = self.state.session.status;
        if status != SessionStatus::Paused {
            return Err(HiveError::conflict("resume", status));
        }
        let mut draft = self.state.clone();
        draft.session.status = draft
            .session
            .paused_from
            .take()
            .unwrap_or_else(|| draft.session.working_status());
        draft.session.paused_reason = None;
        self.commit(draft).await?;
        Ok(self.state.view())
    }

    /// 校验会话处于 waiting 且 pending 检查点指向 item_id
    async fn pending_checkpoint_for(
        &self,
        op: &'static str,
        item_id: &str,
    ) -> HiveResult<Checkpoint> {
        let status = self.state.session.status;
        if status != SessionStatus::Waiting {
            return Err(HiveError::conflict(op, status));
        }
        let checkpoint = self
            .services
            .ledger
            .pending_for_session(self.session_id())
            .await?
            .ok_or_else(|| HiveError::StateConflict {
                op,
                detail: "no pending checkpoint".to_string(),
            })?;
        if checkpoint.todo_item_id != item_id {
            return Err(HiveError::StateConflict {
                op,
                detail: format!(
                    "pending checkpoint targets item {}, not {}",
                    checkpoint.todo_item_id, item_id
                ),
            });
        }
        Ok(checkpoint)
    }

    async fn approve(
        &mut self,
        item_id: &str,
        feedback: Option<String>,
        cancel: &CancellationToken,
    ) -> HiveResult<ResolveOutcome> {
        let checkpoint = self.pending_checkpoint_for("approve_checkpoint", item_id).await?;
        let item = self
            .state
            .todo_list
            .as_ref()
            .and_then(|l| l.get(item_id))
            .cloned()
            .ok_or_else(|| HiveError::not_found("todo item", item_id))?;
        let feedback = feedback.filter(|f| !f.trim().is_empty());

        self.services
            .ledger
            .resolve(&checkpoint.id, Resolution::approved(feedback.clone()))
            .await?;
        if let Err(e) = self.mark_started(&item).await {
            return Err(self.reopen_checkpoint(&checkpoint, e).await);
        }
        self.emit(LoopEvent::CheckpointResolved {
            checkpoint_id: checkpoint.id.clone(),
            item_id: item.id.clone(),
            decision: Decision::Approved,
        });

        let error = match self.run_item(&item, feedback, cancel).await? {
            Execution::Done(_) => None,
            Execution::Failed(error) => Some(error),
        };
        Ok(ResolveOutcome {
            checkpoint_id: checkpoint.id,
            item_id: item.id,
            status: self.state.view(),
            next_step: self.state.session.current_item_id.clone(),
            error,
        })
    }

    async fn reject(&mut self, item_id: &str, reason: Option<String>) -> HiveResult<ResolveOutcome> {
        let reason = match reason.map(|r| r.trim().to_string()) {
            Some(r) if !r.is_empty() => r,
            _ => {
                return Err(HiveError::Validation(
                    "a reason is required to reject a checkpoint".to_string(),
                ))
            }
        };
        let checkpoint = self.pending_checkpoint_for("reject_checkpoint", item_id).await?;

        let mut draft = self.state.clone();
        match self.services.policy.reject_policy {
            RejectPolicy::SkipForward => {
                draft.list_mut("reject_checkpoint")?.skip_item(item_id)?;
            }
            RejectPolicy::RetryItem => {
                draft.list_mut("reject_checkpoint")?.reset_item(item_id)?;
                draft.session.config.context.insert(
                    REJECTION_CONTEXT_KEY.to_string(),
                    serde_json::json!({ "item_id": item_id, "reason": reason }),
                );
            }
        }
        draft.advance_cursor();

        self.services
            .ledger
            .resolve(&checkpoint.id, Resolution::rejected(reason))
            .await?;
        if let Err(e) = self.commit(draft).await {
            return Err(self.reopen_checkpoint(&checkpoint, e).await);
        }
        self.emit(LoopEvent::CheckpointResolved {
            checkpoint_id: checkpoint.id.clone(),
            item_id: item_id.to_string(),
            decision: Decision::Rejected,
        });

        Ok(ResolveOutcome {
            checkpoint_id: checkpoint.id,
            item_id: item_id.to_string(),
            status: self.state.view(),
            next_step: self.state.session.current_item_id.clone(),
            error: None,
        })
    }

    /// 会话提交失败后把已响应的检查点恢复为 pending，返回原错误
    async fn reopen_checkpoint(&self, checkpoint: &Checkpoint, err: HiveError) -> HiveError {
        tracing::warn!(
            session_id = %self.session_id(),
            checkpoint_id = %checkpoint.id,
            error = %err,
            "session commit failed, reopening checkpoint"
        );
        if let Err(reopen_err) = self.services.ledger.reopen(checkpoint).await {
            tracing::error!(
                session_id = %self.session_id(),
                checkpoint_id = %checkpoint.id,
                error = %reopen_err,
                "failed to reopen checkpoint"
            );
        }
        err
    }

    async fn capture(
        &mut self,
        trigger: SnapshotTrigger,
        label: Option<String>,
    ) -> HiveResult<Snapshot> {
        let snapshot = self
            .services
            .snapshots
            .capture(self.state.snapshot_state(), trigger, label)
            .await?;
        self.emit(LoopEvent::SnapshotCreated {
            snapshot_id: snapshot.id.clone(),
            trigger,
        });
        Ok(snapshot)
    }

    async fn restore(&mut self, snapshot: Snapshot) -> HiveResult<RestoreOutcome> {
        if snapshot.session_id != self.session_id() {
            return Err(HiveError::Validation(format!(
                "snapshot {} belongs to session {}",
                snapshot.id, snapshot.session_id
            )));
        }
        let step_index = snapshot.state.step_index();

        let mut draft = LoopState {
            session: snapshot.state.session,
            todo_list: snapshot.state.todo_list,
        };
        if let Some(list) = draft.todo_list.as_mut() {
            list.normalize_interrupted();
        }
        // 快照之后创建的检查点保留为历史；游标之外的 pending 检查点被关闭，不再阻塞
        let pending = self
            .services
            .ledger
            .pending_for_session(self.session_id())
            .await?;
        let cursor = draft.session.current_item_id.clone();
        let blocked = pending
            .as_ref()
            .is_some_and(|c| Some(&c.todo_item_id) == cursor.as_ref());
        if draft.session.status == SessionStatus::Waiting && !blocked {
            draft.session.status = draft.session.working_status();
        }
        if draft.session.paused_from == Some(SessionStatus::Waiting) && !blocked {
            draft.session.paused_from = Some(draft.session.working_status());
        }
        let orphan = pending.filter(|_| !blocked);
        if let Some(orphan) = &orphan {
            let note = format!("session restored to snapshot {}", snapshot.id);
            self.services
                .ledger
                .resolve(&orphan.id, Resolution::discarded(note))
                .await?;
            tracing::warn!(
                session_id = %self.session_id(),
                checkpoint_id = %orphan.id,
                "discarded checkpoint raised after the snapshot"
            );
        }

        if let Err(e) = self.commit(draft).await {
            return Err(match &orphan {
                Some(orphan) => self.reopen_checkpoint(orphan, e).await,
                None => e,
            });
        }
        if let Some(orphan) = orphan {
            self.emit(LoopEvent::CheckpointResolved {
                checkpoint_id: orphan.id,
                item_id: orphan.todo_item_id,
                decision: Decision::Discarded,
            });
        }
        self.supervisor.clear_pause_request();

        let restored_at = Utc::now();
        tracing::info!(session_id = %self.session_id(), snapshot_id = %snapshot.id, step_index, "snapshot restored");
        self.emit(LoopEvent::Restored {
            snapshot_id: snapshot.id.clone(),
            step_index,
        });
        Ok(RestoreOutcome {
            snapshot_id: snapshot.id,
            session_id: self.session_id().to_string(),
            restored_at,
            step_index,
        })
    }

    /// 游标落在第一个未结算的条目上：completed 与 skipped 都算已结算，被跳过的条目不会重新执行。
    /// 列表属于其他会话时复制为本会话的新列表，原记录不变
    async fn reconstitute(
        &mut self,
        todo_list_id: &str,
        config: SessionConfig,
    ) -> HiveResult<StatusView> {
        let status = self.state.session.status;
        if status != SessionStatus::Idle || self.state.todo_list.is_some() {
            return Err(HiveError::conflict("resume", status));
        }
        let mut list = self
            .services
            .store
            .load_todo_list(todo_list_id)
            .await?
            .ok_or_else(|| HiveError::not_found("todo list", todo_list_id))?;
        let interrupted = list.normalize_interrupted();
        if list.session_id != self.session_id() {
            let source = std::mem::replace(&mut list.id, format!("plan_{}", uuid::Uuid::new_v4()));
            tracing::info!(
                session_id = %self.session_id(),
                source_todo_list_id = %source,
                owner = %list.session_id,
                todo_list_id = %list.id,
                "copying todo list from another session"
            );
            list.session_id = self.session_id().to_string();
            list.created_at = Utc::now();
        }

        let mut draft = self.state.clone();
        draft.session.config = config;
        draft.session.goal = Some(list.goal.clone());
        draft.session.model_id = Some(list.model_id.clone());
        draft.session.todo_list_id = Some(list.id.clone());
        draft.session.current_item_id = list.first_unsettled().map(|i| i.id.clone());
        draft.session.progress = list.progress();
        draft.session.status = if list.is_finished() {
            SessionStatus::Completed
        } else {
            draft.session.working_status()
        };
        if list.is_empty() {
            draft.session.status = SessionStatus::Idle;
        }

        let pending = self
            .services
            .ledger
            .pending_for_session(self.session_id())
            .await?;
        if let (Some(checkpoint), Some(cursor)) = (pending, &draft.session.current_item_id) {
            if &checkpoint.todo_item_id == cursor {
                draft.session.status = SessionStatus::Waiting;
            }
        }
        draft.todo_list = Some(list);
        self.commit(draft).await?;

        tracing::info!(
            session_id = %self.session_id(),
            todo_list_id,
            interrupted,
            progress = self.state.session.progress,
            "session reconstituted"
        );
        Ok(self.state.view())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

    use async_trait::async_trait;
    use chrono::{DateTime, Utc};

    use super::*;
    use crate::plan::{Decomposition, PlanItem, StepResult};
    use crate::snapshot::SnapshotFilter;
    use crate::storage::MemoryStore;

    struct FixedOracle(Result<Vec<PlanItem>, String>);

    #[async_trait]
    impl GoalOracle for FixedOracle {
        async fn decompose(
            &self,
            _goal: &str,
            _model_id: &str,
            _context: &serde_json::Map<String, serde_json::Value>,
        ) -> Result<Decomposition, HiveError> {
            match &self.0 {
                Ok(items) => Ok(Decomposition {
                    items: items.clone(),
                    warnings: Vec::new(),
                }),
                Err(e) => Err(HiveError::Oracle(e.clone())),
            }
        }
    }

    /// 前 fail_first 次调用失败，之后成功
    #[derive(Default)]
    struct CountingExecutor {
        fail_first: u32,
        calls: AtomicU32,
        last_feedback: std::sync::Mutex<Option<String>>,
    }

    #[async_trait]
    impl StepExecutor for CountingExecutor {
        async fn execute(&self, item: &TodoItem, ctx: &StepContext) -> StepResult {
            let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            if let Some(f) = ctx.context.get(FEEDBACK_CONTEXT_KEY).and_then(|v| v.as_str()) {
                *self.last_feedback.lock().unwrap() = Some(f.to_string());
            }
            if n <= self.fail_first {
                StepResult::failed(format!("attempt {n} failed"))
            } else {
                StepResult::ok(format!("did {}", item.content))
            }
        }
    }

    /// 可切换为写入失败的存储；fail_sessions 只让会话写入失败
    #[derive(Default)]
    struct FlakyStore {
        inner: MemoryStore,
        fail_writes: AtomicBool,
        fail_sessions: AtomicBool,
    }

    impl FlakyStore {
        fn check(&self) -> Result<(), HiveError> {
            if self.fail_writes.load(Ordering::SeqCst) {
                Err(HiveError::Storage("disk full".to_string()))
            } else {
                Ok(())
            }
        }
    }

    #[async_trait]
    impl Store for FlakyStore {
        async fn save_session(&self, session: &SessionRecord) -> Result<(), HiveError> {
            self.check()?;
            if self.fail_sessions.load(Ordering::SeqCst) {
                return Err(HiveError::Storage("session table locked".to_string()));
            }
            self.inner.save_session(session).await
        }
        async fn load_session(&self, id: &str) -> Result<Option<SessionRecord>, HiveError> {
            self.inner.load_session(id).await
        }
        async fn save_todo_list(&self, list: &TodoList) -> Result<(), HiveError> {
            self.check()?;
            self.inner.save_todo_list(list).await
        }
        async fn load_todo_list(&self, id: &str) -> Result<Option<TodoList>, HiveError> {
            self.inner.load_todo_list(id).await
        }
        async fn insert_checkpoint(&self, c: &Checkpoint) -> Result<(), HiveError> {
            self.check()?;
            self.inner.insert_checkpoint(c).await
        }
        async fn update_checkpoint(&self, c: &Checkpoint) -> Result<(), HiveError> {
            self.check()?;
            self.inner.update_checkpoint(c).await
        }
        async fn get_checkpoint(&self, id: &str) -> Result<Option<Checkpoint>, HiveError> {
            self.inner.get_checkpoint(id).await
        }
        async fn list_checkpoints(&self, session_id: &str) -> Result<Vec<Checkpoint>, HiveError> {
            self.inner.list_checkpoints(session_id).await
        }
        async fn insert_snapshot(&self, s: &Snapshot) -> Result<(), HiveError> {
            self.check()?;
            self.inner.insert_snapshot(s).await
        }
        async fn get_snapshot(&self, id: &str) -> Result<Option<Snapshot>, HiveError> {
            self.inner.get_snapshot(id).await
        }
        async fn delete_snapshot(&self, id: &str) -> Result<bool, HiveError> {
            self.inner.delete_snapshot(id).await
        }
        async fn query_snapshots(&self, f: &SnapshotFilter) -> Result<Vec<Snapshot>, HiveError> {
            self.inner.query_snapshots(f).await
        }
        async fn delete_snapshots_before(
            &self,
            session_id: &str,
            cutoff: DateTime<Utc>,
        ) -> Result<usize, HiveError> {
            self.inner.delete_snapshots_before(session_id, cutoff).await
        }
    }

    fn plan(categories: &[&str]) -> Vec<PlanItem> {
        categories
            .iter()
            .enumerate()
            .map(|(i, c)| PlanItem::new(format!("step {i}"), *c))
            .collect()
    }

    fn services(
        store: Arc<dyn Store>,
        items: Vec<PlanItem>,
        executor: Arc<CountingExecutor>,
    ) -> Arc<LoopServices> {
        Arc::new(
            LoopServices::new(store, Arc::new(FixedOracle(Ok(items))), executor)
                .with_policy(CheckpointPolicy::new(["resource_selection"])),
        )
    }

    fn fast_config() -> SessionConfig {
        SessionConfig {
            step_delay_ms: 1,
            ..SessionConfig::default()
        }
    }

    #[tokio::test]
    async fn test_steps_advance_progress_and_complete() {
        let exec = Arc::new(CountingExecutor::default());
        let svc = services(Arc::new(MemoryStore::new()), plan(&["a", "b", "c"]), exec);
        let (handle, _join) = AgentLoop::spawn("s1", fast_config(), svc);

        let started = handle.start("write a report", StartOptions::default()).await.unwrap();
        assert_eq!(started.todo_list.len(), 3);
        assert_eq!(started.status.status, SessionStatus::Idle);
        assert_eq!(started.status.progress, 0);

        let mut seen = Vec::new();
        for _ in 0..3 {
            let outcome = handle.step().await.unwrap();
            assert!(matches!(outcome, StepOutcome::Completed { .. }));
            seen.push(outcome.status().progress);
        }
        assert_eq!(seen, vec![33, 66, 100]);
        let status = handle.get_status();
        assert_eq!(status.status, SessionStatus::Completed);
        assert_eq!(status.current_item_id, None);
        assert!(matches!(
            handle.step().await,
            Err(HiveError::StateConflict { op: "step", .. })
        ));
    }

    #[tokio::test]
    async fn test_start_twice_is_conflict() {
        let exec = Arc::new(CountingExecutor::default());
        let svc = services(Arc::new(MemoryStore::new()), plan(&["a"]), exec);
        let (handle, _join) = AgentLoop::spawn("s1", fast_config(), svc);
        handle.start("goal", StartOptions::default()).await.unwrap();
        let before = handle.state();
        let err = handle.start("other", StartOptions::default()).await.unwrap_err();
        assert!(matches!(err, HiveError::StateConflict { op: "start", .. }));
        assert_eq!(handle.state(), before);
    }

    #[tokio::test]
    async fn test_oracle_failure_fails_session() {
        let svc = Arc::new(LoopServices::new(
            Arc::new(MemoryStore::new()),
            Arc::new(FixedOracle(Err("model unavailable".to_string()))),
            Arc::new(CountingExecutor::default()),
        ));
        let (handle, _join) = AgentLoop::spawn("s1", fast_config(), svc);
        let err = handle.start("goal", StartOptions::default()).await.unwrap_err();
        assert!(matches!(err, HiveError::Oracle(_)));
        assert_eq!(handle.get_status().status, SessionStatus::Failed);
        assert!(handle.get_todo_list().is_none());
    }

    #[tokio::test]
    async fn test_empty_plan_stays_idle() {
        let exec = Arc::new(CountingExecutor::default());
        let svc = services(Arc::new(MemoryStore::new()), Vec::new(), exec);
        let (handle, _join) = AgentLoop::spawn("s1", fast_config(), svc);
        let options = StartOptions {
            auto_run: Some(true),
            ..StartOptions::default()
        };
        let started = handle.start("goal", options).await.unwrap();
        assert_eq!(started.status.status, SessionStatus::Idle);
        assert_eq!(started.status.progress, 0);
        assert!(handle.step().await.is_err());
        assert!(matches!(
            handle.pause(None).await,
            Err(HiveError::StateConflict { op: "pause", .. })
        ));
        assert_eq!(handle.get_status().status, SessionStatus::Idle);
    }

    #[tokio::test]
    async fn test_pause_before_start_is_conflict() {
        let exec = Arc::new(CountingExecutor::default());
        let svc = services(Arc::new(MemoryStore::new()), plan(&["a"]), exec);
        let (handle, _join) = AgentLoop::spawn("s1", fast_config(), svc);
        assert!(matches!(
            handle.pause(Some("early".to_string())).await,
            Err(HiveError::StateConflict { .. })
        ));
        assert_eq!(handle.get_status().status, SessionStatus::Idle);
        handle.start("goal", StartOptions::default()).await.unwrap();
        assert_eq!(handle.pause(None).await.unwrap().status, SessionStatus::Paused);
    }

    #[tokio::test]
    async fn test_retries_then_fails() {
        let exec = Arc::new(CountingExecutor {
            fail_first: 10,
            ..CountingExecutor::default()
        });
        let svc = services(Arc::new(MemoryStore::new()), plan(&["a"]), exec.clone());
        let (handle, _join) = AgentLoop::spawn("s1", fast_config(), svc);
        handle.start("goal", StartOptions::default()).await.unwrap();

        let outcome = handle.step().await.unwrap();
        assert!(matches!(outcome, StepOutcome::Failed { .. }));
        assert_eq!(outcome.status().status, SessionStatus::Failed);
        // 首次 + max_retries(2)
        assert_eq!(exec.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_retry_recovers_within_budget() {
        let exec = Arc::new(CountingExecutor {
            fail_first: 1,
            ..CountingExecutor::default()
        });
        let svc = services(Arc::new(MemoryStore::new()), plan(&["a", "b"]), exec.clone());
        let (handle, _join) = AgentLoop::spawn("s1", fast_config(), svc);
        handle.start("goal", StartOptions::default()).await.unwrap();
        let outcome = handle.step().await.unwrap();
        assert!(matches!(outcome, StepOutcome::Completed { .. }));
        assert_eq!(outcome.status().progress, 50);
        assert_eq!(exec.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_gated_item_waits_and_reject_requires_reason() {
        let exec = Arc::new(CountingExecutor::default());
        let svc = services(
            Arc::new(MemoryStore::new()),
            plan(&["resource_selection", "b"]),
            exec.clone(),
        );
        let (handle, _join) = AgentLoop::spawn("s1", fast_config(), svc);
        let list = handle.start("goal", StartOptions::default()).await.unwrap().todo_list;
        let gated = list.items[0].id.clone();

        let outcome = handle.step().await.unwrap();
        let StepOutcome::CheckpointRaised { checkpoint, status } = outcome else {
            panic!("expected checkpoint, got {outcome:?}");
        };
        assert_eq!(status.status, SessionStatus::Waiting);
        assert_eq!(checkpoint.checkpoint.todo_item_id, gated);
        assert_eq!(exec.calls.load(Ordering::SeqCst), 0);
        assert!(matches!(handle.step().await, Err(HiveError::StateConflict { .. })));

        let before = handle.state();
        for reason in [None, Some("   ".to_string())] {
            let err = handle.reject_checkpoint(&gated, reason).await.unwrap_err();
            assert!(matches!(err, HiveError::Validation(_)));
        }
        assert_eq!(handle.state(), before);

        let resolved = handle
            .reject_checkpoint(&gated, Some("wrong dataset".to_string()))
            .await
            .unwrap();
        assert_eq!(resolved.status.status, SessionStatus::Idle);
        assert_eq!(resolved.next_step, Some(list.items[1].id.clone()));
        let todo = handle.get_todo_list().unwrap();
        assert_eq!(todo.items[0].status, crate::todo::TodoStatus::Skipped);

        let responded = handle
            .get_pending_checkpoints(Some(CheckpointStatus::Responded))
            .await
            .unwrap();
        assert_eq!(responded.len(), 1);

        let outcome = handle.step().await.unwrap();
        assert_eq!(outcome.status().status, SessionStatus::Completed);
        assert_eq!(outcome.status().progress, 50);
    }

    #[tokio::test]
    async fn test_approve_runs_item_with_feedback() {
        let exec = Arc::new(CountingExecutor::default());
        let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
        let svc = services(store.clone(), plan(&["resource_selection"]), exec.clone());
        let (handle, _join) = AgentLoop::spawn("s1", fast_config(), svc);
        let list = handle.start("goal", StartOptions::default()).await.unwrap().todo_list;
        let gated = list.items[0].id.clone();
        handle.step().await.unwrap();

        let err = handle.approve_checkpoint("item_other", None).await.unwrap_err();
        assert!(matches!(err, HiveError::StateConflict { .. }));

        let resolved = handle
            .approve_checkpoint(&gated, Some("use the 2024 data".to_string()))
            .await
            .unwrap();
        assert_eq!(resolved.status.status, SessionStatus::Completed);
        assert_eq!(resolved.status.progress, 100);
        assert_eq!(resolved.next_step, None);
        assert_eq!(
            exec.last_feedback.lock().unwrap().as_deref(),
            Some("use the 2024 data")
        );

        let err = handle.approve_checkpoint(&gated, None).await.unwrap_err();
        assert!(matches!(err, HiveError::StateConflict { .. }));

        // 发起检查点前自动快照
        let snapshots = store
            .query_snapshots(&SnapshotFilter::for_session("s1").with_trigger(SnapshotTrigger::Checkpoint))
            .await
            .unwrap();
        assert_eq!(snapshots.len(), 1);
    }

    #[tokio::test]
    async fn test_retry_item_policy_raises_again() {
        let exec = Arc::new(CountingExecutor::default());
        let svc = Arc::new(
            LoopServices::new(
                Arc::new(MemoryStore::new()),
                Arc::new(FixedOracle(Ok(plan(&["resource_selection"])))),
                exec,
            )
            .with_policy(
                CheckpointPolicy::new(["resource_selection"])
                    .with_reject_policy(RejectPolicy::RetryItem),
            ),
        );
        let (handle, _join) = AgentLoop::spawn("s1", fast_config(), svc);
        let list = handle.start("goal", StartOptions::default()).await.unwrap().todo_list;
        let gated = list.items[0].id.clone();
        handle.step().await.unwrap();
        let resolved = handle
            .reject_checkpoint(&gated, Some("not yet".to_string()))
            .await
            .unwrap();
        assert_eq!(resolved.next_step, Some(gated.clone()));
        assert!(handle.state().session.config.context.contains_key(REJECTION_CONTEXT_KEY));

        let outcome = handle.step().await.unwrap();
        let StepOutcome::CheckpointRaised { checkpoint, .. } = outcome else {
            panic!("expected a fresh checkpoint");
        };
        assert_eq!(checkpoint.checkpoint.todo_item_id, gated);
        assert_ne!(checkpoint.checkpoint.id, resolved.checkpoint_id);
    }

    #[tokio::test]
    async fn test_pause_and_resume_preserve_cursor() {
        let exec = Arc::new(CountingExecutor::default());
        let svc = services(Arc::new(MemoryStore::new()), plan(&["a", "b", "c"]), exec);
        let (handle, _join) = AgentLoop::spawn("s1", fast_config(), svc);
        handle.start("goal", StartOptions::default()).await.unwrap();
        handle.step().await.unwrap();
        let before = handle.get_status();

        let paused = handle.pause(Some("lunch".to_string())).await.unwrap();
        assert_eq!(paused.status, SessionStatus::Paused);
        assert!(handle.step().await.is_err());
        assert!(handle.pause(None).await.is_err());

        let resumed = handle.resume().await.unwrap();
        assert_eq!(resumed, before);
        assert!(handle.resume().await.is_err());
    }

    #[tokio::test]
    async fn test_auto_run_completes_on_its_own() {
        let exec = Arc::new(CountingExecutor::default());
        let svc = services(Arc::new(MemoryStore::new()), plan(&["a", "b", "c"]), exec);
        let (handle, _join) = AgentLoop::spawn("s1", fast_config().with_auto_run(true), svc);
        handle.start("goal", StartOptions::default()).await.unwrap();
        let done = handle
            .wait_until(|s| s.status.is_terminal())
            .await
            .unwrap();
        assert_eq!(done.status, SessionStatus::Completed);
        assert_eq!(done.progress, 100);
    }

    #[tokio::test]
    async fn test_storage_failure_rolls_back() {
        let exec = Arc::new(CountingExecutor::default());
        let store = Arc::new(FlakyStore::default());
        let svc = services(store.clone(), plan(&["a", "b"]), exec);
        let (handle, _join) = AgentLoop::spawn("s1", fast_config(), svc);
        handle.start("goal", StartOptions::default()).await.unwrap();
        let before = handle.state();

        store.fail_writes.store(true, Ordering::SeqCst);
        let err = handle.pause(None).await.unwrap_err();
        assert!(matches!(err, HiveError::Storage(_)));
        assert_eq!(handle.state(), before);

        store.fail_writes.store(false, Ordering::SeqCst);
        assert_eq!(handle.pause(None).await.unwrap().status, SessionStatus::Paused);
    }

    #[tokio::test]
    async fn test_failed_session_write_keeps_checkpoint_pending() {
        let exec = Arc::new(CountingExecutor::default());
        let store = Arc::new(FlakyStore::default());
        let svc = services(store.clone(), plan(&["resource_selection", "b"]), exec.clone());
        let (handle, _join) = AgentLoop::spawn("s1", fast_config(), svc);
        let list = handle.start("goal", StartOptions::default()).await.unwrap().todo_list;
        let gated = list.items[0].id.clone();
        handle.step().await.unwrap();
        let before = handle.state();

        store.fail_sessions.store(true, Ordering::SeqCst);
        let err = handle
            .reject_checkpoint(&gated, Some("wrong source".to_string()))
            .await
            .unwrap_err();
        assert!(matches!(err, HiveError::Storage(_)));
        let err = handle.approve_checkpoint(&gated, None).await.unwrap_err();
        assert!(matches!(err, HiveError::Storage(_)));
        assert_eq!(handle.state(), before);
        assert_eq!(exec.calls.load(Ordering::SeqCst), 0);
        let persisted = store.inner.load_todo_list(&list.id).await.unwrap().unwrap();
        assert_eq!(persisted.items[0].status, crate::todo::TodoStatus::Pending);
        let pending = handle
            .get_pending_checkpoints(Some(CheckpointStatus::Pending))
            .await
            .unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].checkpoint.todo_item_id, gated);

        store.fail_sessions.store(false, Ordering::SeqCst);
        let resolved = handle
            .reject_checkpoint(&gated, Some("wrong source".to_string()))
            .await
            .unwrap();
        assert_eq!(resolved.status.status, SessionStatus::Idle);
        assert_eq!(resolved.next_step, Some(list.items[1].id.clone()));
    }

    #[tokio::test]
    async fn test_restore_discards_checkpoint_raised_later() {
        let exec = Arc::new(CountingExecutor::default());
        let svc = Arc::new(
            LoopServices::new(
                Arc::new(MemoryStore::new()),
                Arc::new(FixedOracle(Ok(plan(&["resource_selection", "resource_selection"])))),
                exec,
            )
            .with_policy(
                CheckpointPolicy::new(["resource_selection"]).with_snapshot_before_checkpoint(false),
            ),
        );
        let (handle, _join) = AgentLoop::spawn("s1", fast_config(), svc);
        let list = handle.start("goal", StartOptions::default()).await.unwrap().todo_list;
        let (first, second) = (list.items[0].id.clone(), list.items[1].id.clone());
        let snapshot = handle.create_snapshot(SnapshotTrigger::Manual, None).await.unwrap();

        handle.step().await.unwrap();
        handle
            .reject_checkpoint(&first, Some("not this one".to_string()))
            .await
            .unwrap();
        let outcome = handle.step().await.unwrap();
        let StepOutcome::CheckpointRaised { checkpoint: later, .. } = outcome else {
            panic!("expected checkpoint on the second item, got {outcome:?}");
        };
        assert_eq!(later.checkpoint.todo_item_id, second);

        handle.restore(snapshot).await.unwrap();
        assert_eq!(handle.get_status().status, SessionStatus::Idle);
        let discarded = handle
            .get_pending_checkpoints(None)
            .await
            .unwrap()
            .into_iter()
            .find(|v| v.checkpoint.id == later.checkpoint.id)
            .unwrap();
        assert_eq!(discarded.checkpoint.status, CheckpointStatus::Responded);
        assert_eq!(
            discarded.checkpoint.resolution.map(|r| r.decision),
            Some(Decision::Discarded)
        );

        // 会话可以继续：重新对第一个条目发起检查点并批准
        let outcome = handle.step().await.unwrap();
        let StepOutcome::CheckpointRaised { checkpoint, .. } = outcome else {
            panic!("expected a fresh checkpoint, got {outcome:?}");
        };
        assert_eq!(checkpoint.checkpoint.todo_item_id, first);
        let resolved = handle.approve_checkpoint(&first, None).await.unwrap();
        assert_eq!(resolved.status.progress, 50);
        assert_eq!(resolved.next_step, Some(second));
    }

    #[tokio::test]
    async fn test_events_are_published() {
        let exec = Arc::new(CountingExecutor::default());
        let svc = services(Arc::new(MemoryStore::new()), plan(&["a"]), exec);
        let (handle, _join) = AgentLoop::spawn("s1", fast_config(), svc);
        let mut events = handle.subscribe();
        handle.start("goal", StartOptions::default()).await.unwrap();
        handle.step().await.unwrap();

        let mut kinds = Vec::new();
        while let Ok(event) = events.try_recv() {
            kinds.push(serde_json::to_value(&event).unwrap()["type"].as_str().unwrap().to_string());
        }
        assert!(kinds.contains(&"plan_created".to_string()));
        assert!(kinds.contains(&"step_started".to_string()));
        assert!(kinds.contains(&"step_completed".to_string()));
    }

    #[tokio::test]
    async fn test_shutdown_closes_handle() {
        let exec = Arc::new(CountingExecutor::default());
        let svc = services(Arc::new(MemoryStore::new()), plan(&["a"]), exec);
        let (handle, join) = AgentLoop::spawn("s1", fast_config(), svc);
        handle.shutdown();
        join.await.unwrap();
        assert!(handle.is_closed());
        assert!(matches!(handle.step().await, Err(HiveError::LoopClosed(_))));
    }
}
