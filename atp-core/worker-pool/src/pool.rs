//! 工作池
//!
//! 按需启动工作者，最多 `max_workers` 个；没有空闲工作者时 `acquire` 按先来先服务排队。
//! 后台巡检按以下规则回收工作者：
//! - 空闲超过 `idle_timeout`：终止并移除
//! - 任务执行超过运行超时 + `force_kill_grace`：向任务转发 `Exit` 后强制终止
//! - 心跳丢失超过 `unresponsive`：向任务转发错误消息和 `Exit` 后强制终止（不论状态）

use atp_common::RunMessage;
use std::collections::{BTreeMap, VecDeque};
use std::sync::{Arc, Weak};
use tokio::sync::{oneshot, Mutex};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::PoolConfig;
use crate::message::TaskEvent;
use crate::worker::{spawn_worker, TaskRunner, WorkerHandle, WorkerState};
use crate::{PoolError, Result};

/// 工作池统计
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PoolStats {
    pub total: usize,
    pub idle: usize,
    pub busy: usize,
    pub waiters: usize,
}

struct WorkerRecord {
    handle: WorkerHandle,
    join: JoinHandle<()>,
}

#[derive(Default)]
struct PoolState {
    workers: BTreeMap<usize, WorkerRecord>,
    waiters: VecDeque<oneshot::Sender<WorkerHandle>>,
    next_id: usize,
    shut_down: bool,
}

impl PoolState {
    fn take_idle(&mut self) -> Option<WorkerHandle> {
        let record = self
            .workers
            .values()
            .find(|r| r.handle.state() == WorkerState::Idle)?;
        record.handle.shared.set_state(WorkerState::Busy);
        Some(record.handle.clone())
    }

    /// 交给排队中的第一个调用方
    fn hand_off(&mut self, handle: &WorkerHandle) -> bool {
        while let Some(waiter) = self.waiters.pop_front() {
            if waiter.send(handle.clone()).is_ok() {
                debug!("工作者 #{} 交给排队的调用方", handle.id());
                return true;
            }
        }
        false
    }
}

#[derive(Debug, Clone, Copy)]
enum Eviction {
    Idle,
    Overdue,
    Unresponsive,
}

struct PoolInner {
    config: PoolConfig,
    runner: Arc<dyn TaskRunner>,
    state: Mutex<PoolState>,
}

impl PoolInner {
    fn capacity(&self) -> usize {
        self.config.max_workers.max(1)
    }

    fn spawn(&self, state: &mut PoolState) -> WorkerHandle {
        let id = state.next_id;
        state.next_id += 1;
        let (handle, join) =
            spawn_worker(id, Arc::clone(&self.runner), self.config.heartbeat_interval());
        info!("启动工作者 #{} ({}/{})", id, state.workers.len() + 1, self.capacity());
        state.workers.insert(
            id,
            WorkerRecord {
                handle: handle.clone(),
                join,
            },
        );
        handle
    }

    async fn sweep(&self, now: Instant) -> usize {
        let mut state = self.state.lock().await;
        if state.shut_down {
            return 0;
        }

        let config = &self.config;
        let evictions: Vec<(usize, Eviction)> = state
            .workers
            .iter()
            .filter_map(|(id, record)| {
                let view = record.handle.shared.view();
                if now.saturating_duration_since(view.last_seen) > config.unresponsive() {
                    return Some((*id, Eviction::Unresponsive));
                }
                match (view.state, view.running) {
                    (WorkerState::Idle, _)
                        if now.saturating_duration_since(view.idle_since) > config.idle_timeout() =>
                    {
                        Some((*id, Eviction::Idle))
                    }
                    (WorkerState::Busy, Some((dispatched_at, run_timeout)))
                        if now.saturating_duration_since(dispatched_at)
                            > run_timeout + config.force_kill_grace() =>
                    {
                        Some((*id, Eviction::Overdue))
                    }
                    _ => None,
                }
            })
            .collect();

        for (id, eviction) in &evictions {
            let Some(record) = state.workers.remove(id) else {
                continue;
            };
            let shared = &record.handle.shared;
            shared.set_state(WorkerState::Dying);

            match eviction {
                Eviction::Idle => {
                    info!("回收空闲工作者 #{}", id);
                    record.handle.shutdown();
                }
                Eviction::Overdue => {
                    warn!("工作者 #{} 执行超时，强制终止", id);
                    shared.relay(TaskEvent::Exit {
                        reason: format!("工作者 #{} 执行超时被强制终止", id),
                    });
                }
                Eviction::Unresponsive => {
                    warn!("工作者 #{} 失去响应，强制终止", id);
                    shared.relay(TaskEvent::Message(RunMessage::Error {
                        message: format!("工作者 #{} 失去响应", id),
                    }));
                    shared.relay(TaskEvent::Exit {
                        reason: format!("工作者 #{} 失去响应被强制终止", id),
                    });
                }
            }
            record.join.abort();
        }

        // 释放出的容量交给排队的调用方
        while state.waiters.iter().any(|w| !w.is_closed())
            && state.workers.len() < self.capacity()
        {
            let handle = self.spawn(&mut state);
            if !state.hand_off(&handle) {
                handle.shared.set_state(WorkerState::Idle);
                break;
            }
        }

        evictions.len()
    }
}

/// 工作池
pub struct WorkerPool {
    inner: Arc<PoolInner>,
    sweeper: CancellationToken,
}

impl WorkerPool {
    /// 创建工作池并启动后台巡检（需在 tokio 运行时内调用）
    pub fn new(config: PoolConfig, runner: Arc<dyn TaskRunner>) -> Self {
        let sweep_interval = config.sweep_interval();
        let inner = Arc::new(PoolInner {
            config,
            runner,
            state: Mutex::new(PoolState::default()),
        });

        let sweeper = CancellationToken::new();
        let weak: Weak<PoolInner> = Arc::downgrade(&inner);
        let token = sweeper.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(sweep_interval);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let Some(inner) = weak.upgrade() else { break };
                        inner.sweep(Instant::now()).await;
                    }
                    _ = token.cancelled() => break,
                }
            }
            debug!("工作池巡检已停止");
        });

        Self { inner, sweeper }
    }

    pub fn config(&self) -> &PoolConfig {
        &self.inner.config
    }

    /// 获取一个工作者；已满时排队等待
    pub async fn acquire(&self) -> Result<WorkerHandle> {
        let waiter = {
            let mut state = self.inner.state.lock().await;
            if state.shut_down {
                return Err(PoolError::ShutDown);
            }
            if let Some(handle) = state.take_idle() {
                debug!("复用空闲工作者 #{}", handle.id());
                return Ok(handle);
            }
            if state.workers.len() < self.inner.capacity() {
                return Ok(self.inner.spawn(&mut state));
            }

            let (tx, rx) = oneshot::channel();
            state.waiters.push_back(tx);
            debug!("工作池已满，排队等待 (排队数 {})", state.waiters.len());
            rx
        };

        waiter.await.map_err(|_| PoolError::ShutDown)
    }

    /// 归还工作者
    pub async fn release(&self, handle: WorkerHandle) {
        let mut state = self.inner.state.lock().await;
        if !state.workers.contains_key(&handle.id()) || handle.state() == WorkerState::Dying {
            debug!("工作者 #{} 已被移除，忽略归还", handle.id());
            return;
        }
        if handle.shared.has_task() {
            warn!("工作者 #{} 归还时任务仍在执行", handle.id());
        }
        if !state.hand_off(&handle) {
            handle.shared.set_state(WorkerState::Idle);
        }
    }

    /// 立即执行一次巡检，返回回收的工作者数量
    pub async fn sweep(&self) -> usize {
        self.inner.sweep(Instant::now()).await
    }

    /// 以指定时间点执行巡检
    pub async fn sweep_at(&self, now: Instant) -> usize {
        self.inner.sweep(now).await
    }

    pub async fn stats(&self) -> PoolStats {
        let state = self.inner.state.lock().await;
        let mut stats = PoolStats {
            total: state.workers.len(),
            waiters: state.waiters.iter().filter(|w| !w.is_closed()).count(),
            ..Default::default()
        };
        for record in state.workers.values() {
            match record.handle.state() {
                WorkerState::Idle => stats.idle += 1,
                WorkerState::Busy => stats.busy += 1,
                WorkerState::Dying => {}
            }
        }
        stats
    }

    /// 关闭工作池：终止全部工作者，排队的调用方收到 [`PoolError::ShutDown`]
    pub async fn shutdown(&self) {
        self.sweeper.cancel();
        let mut state = self.inner.state.lock().await;
        if state.shut_down {
            return;
        }
        state.shut_down = true;
        state.waiters.clear();

        let workers = std::mem::take(&mut state.workers);
        info!("关闭工作池，终止 {} 个工作者", workers.len());
        for (_, record) in workers {
            let shared = &record.handle.shared;
            shared.set_state(WorkerState::Dying);
            if shared.relay(TaskEvent::Exit {
                reason: "工作池已关闭".to_string(),
            }) {
                record.join.abort();
            } else {
                record.handle.shutdown();
            }
        }
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.sweeper.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::{TaskAssignment, TaskEndpoint};
    use async_trait::async_trait;
    use std::time::Duration;

    struct PendingRunner;

    #[async_trait]
    impl TaskRunner for PendingRunner {
        async fn run(&self, _assignment: TaskAssignment, _endpoint: TaskEndpoint) {
            std::future::pending::<()>().await;
        }
    }

    fn config(max_workers: usize) -> PoolConfig {
        PoolConfig {
            max_workers,
            idle_timeout_secs: 10,
            force_kill_grace_secs: 1,
            unresponsive_secs: 1000,
            heartbeat_interval_ms: 100,
            sweep_interval_ms: 3_600_000,
        }
    }

    fn assignment(task_id: usize, run_timeout_ms: u64) -> TaskAssignment {
        TaskAssignment {
            task_id,
            attempt: 0,
            payload: Vec::new(),
            env: Default::default(),
            options: 0,
            run_timeout_ms,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_idle_worker_reclaimed() {
        let pool = WorkerPool::new(config(2), Arc::new(PendingRunner));
        let worker = pool.acquire().await.unwrap();
        pool.release(worker).await;
        assert_eq!(pool.stats().await.idle, 1);

        assert_eq!(pool.sweep_at(Instant::now() + Duration::from_secs(5)).await, 0);
        assert_eq!(pool.sweep_at(Instant::now() + Duration::from_secs(11)).await, 1);
        assert_eq!(pool.stats().await.total, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_overdue_task_gets_exit() {
        let pool = WorkerPool::new(config(1), Arc::new(PendingRunner));
        let worker = pool.acquire().await.unwrap();
        let link = worker.dispatch(assignment(7, 2_000)).unwrap();

        assert_eq!(pool.sweep_at(Instant::now() + Duration::from_secs(2)).await, 0);
        assert_eq!(pool.sweep_at(Instant::now() + Duration::from_secs(4)).await, 1);

        match link.recv().await {
            Some(TaskEvent::Exit { reason }) => assert!(reason.contains("超时")),
            other => panic!("unexpected event: {:?}", other),
        }
        assert_eq!(worker.state(), WorkerState::Dying);
        assert_eq!(pool.stats().await.total, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unresponsive_worker_evicted_and_waiter_served() {
        let mut cfg = config(1);
        cfg.unresponsive_secs = 5;
        let pool = Arc::new(WorkerPool::new(cfg, Arc::new(PendingRunner)));

        let worker = pool.acquire().await.unwrap();
        let link = worker.dispatch(assignment(1, 600_000)).unwrap();

        let waiting = {
            let pool = Arc::clone(&pool);
            tokio::spawn(async move { pool.acquire().await })
        };
        while pool.stats().await.waiters == 0 {
            tokio::task::yield_now().await;
        }

        assert_eq!(pool.sweep_at(Instant::now() + Duration::from_secs(6)).await, 1);

        assert!(matches!(
            link.recv().await,
            Some(TaskEvent::Message(RunMessage::Error { .. }))
        ));
        assert!(matches!(link.recv().await, Some(TaskEvent::Exit { .. })));

        let replacement = waiting.await.unwrap().unwrap();
        assert_ne!(replacement.id(), worker.id());
        assert_eq!(pool.stats().await.busy, 1);
    }

    #[tokio::test]
    async fn test_shutdown_rejects_acquire() {
        let pool = WorkerPool::new(config(1), Arc::new(PendingRunner));
        let _worker = pool.acquire().await.unwrap();
        pool.shutdown().await;
        assert!(matches!(pool.acquire().await, Err(PoolError::ShutDown)));
        assert_eq!(pool.stats().await, PoolStats::default());
    }
}
