//! 调度器 + 执行引擎集成测试

use serde_json::{json, Map};
use std::sync::Arc;

use atp_common::{RunMessage, RunStatus, StepStatus, TaskMode};
use atp_executor::{AdapterRegistry, DecodedRunResult, RunDefinition};
use atp_scheduler::*;
use atp_worker_pool::{PoolConfig, WorkerPool};

fn scheduler(max_workers: usize, retry_count: u32) -> Scheduler {
    let runner = EngineRunner::new(Arc::new(AdapterRegistry::with_builtins()));
    let pool = WorkerPool::new(
        PoolConfig {
            max_workers,
            ..Default::default()
        },
        Arc::new(runner),
    );
    Scheduler::new(
        Arc::new(pool),
        SchedulerConfig {
            retry_count,
            ..Default::default()
        },
    )
}

fn definition(yaml: &str) -> RunDefinition {
    RunDefinition::from_yaml_str(yaml).unwrap()
}

async fn collect(events: async_channel::Receiver<SchedulerEvent>) -> Vec<SchedulerEvent> {
    let mut all = Vec::new();
    while let Ok(event) = events.recv().await {
        all.push(event);
    }
    all
}

fn summary(events: &[SchedulerEvent]) -> Vec<RunStatus> {
    match events.last() {
        Some(SchedulerEvent::Summary { statuses }) => statuses.clone(),
        other => panic!("最后一条事件不是 Summary: {:?}", other),
    }
}

fn result_of(events: &[SchedulerEvent], id: usize) -> DecodedRunResult {
    let payload = events
        .iter()
        .find_map(|e| match e {
            SchedulerEvent::Done {
                task_id, payload, ..
            } if *task_id == id => Some(payload.clone()),
            _ => None,
        })
        .unwrap_or_else(|| panic!("任务 {} 没有结果", id));
    DecodedRunResult::decode(&payload).unwrap()
}

#[tokio::test]
async fn test_encoded_batch_runs_through_engine() {
    let mut batch = Batch::new(Map::new(), 0);
    batch
        .push(
            TaskMode::Async,
            &definition("name: a\nsteps:\n  - type: echo\n    config: { response: 1 }\n"),
        )
        .unwrap();
    batch
        .push(
            TaskMode::Async,
            &definition("name: b\nsteps:\n  - type: wait\n    config: { ms: 5 }\n"),
        )
        .unwrap();
    let batch = Batch::decode(&batch.encode().unwrap()).unwrap();

    let (_handle, events) = scheduler(2, 0).submit(batch);
    let events = collect(events).await;

    assert_eq!(summary(&events), vec![RunStatus::Done, RunStatus::Done]);
    assert!(events.iter().any(|e| matches!(
        e,
        SchedulerEvent::Message {
            message: RunMessage::Progress(_),
            ..
        }
    )));

    let decoded = result_of(&events, 0);
    assert_eq!(decoded.header.status, RunStatus::Done);
    assert_eq!(decoded.header.progress, 255);
    let index = decoded.index.unwrap();
    assert_eq!(index.find("0").unwrap().status, StepStatus::Done);
}

#[tokio::test]
async fn test_interact_answer_relayed() {
    let mut batch = Batch::new(Map::new(), 0);
    batch
        .push(
            TaskMode::Sync,
            &definition("steps:\n  - type: echo\n    interact:\n      - message: 继续?\n"),
        )
        .unwrap();

    let (handle, events) = scheduler(1, 0).submit(batch);
    loop {
        if let SchedulerEvent::InteractAsk { task_id, ask } = events.recv().await.unwrap() {
            assert_eq!(task_id, 0);
            assert_eq!(ask.prompts[0].message, "继续?");
            handle
                .interact(task_id, ask.step_index, vec!["yes".to_string()])
                .unwrap();
            break;
        }
    }

    let events = collect(events).await;
    assert_eq!(summary(&events), vec![RunStatus::Done]);
}

#[tokio::test]
async fn test_query_and_cancel_running_task() {
    let mut batch = Batch::new(Map::new(), 0);
    batch
        .push(
            TaskMode::Async,
            &definition("steps:\n  - type: wait\n    config: { ms: 60000 }\n"),
        )
        .unwrap();

    let (handle, events) = scheduler(1, 2).submit(batch);
    loop {
        if let SchedulerEvent::Started { task_id, .. } = events.recv().await.unwrap() {
            handle.query(task_id).unwrap();
            break;
        }
    }
    loop {
        if let SchedulerEvent::Message {
            message: RunMessage::QueryReply(snapshot),
            ..
        } = events.recv().await.unwrap()
        {
            assert_eq!(snapshot.counters.total(), 1);
            break;
        }
    }
    handle.cancel(0).unwrap();

    let events = collect(events).await;
    assert_eq!(summary(&events), vec![RunStatus::Cancel]);
    assert!(!events
        .iter()
        .any(|e| matches!(e, SchedulerEvent::Retry { .. })));
    assert_eq!(result_of(&events, 0).header.status, RunStatus::Cancel);
}

#[tokio::test]
async fn test_cancel_while_waiting_for_worker_never_starts_run() {
    let busy = scheduler(1, 0);
    let idle_later = Scheduler::new(Arc::clone(busy.pool()), SchedulerConfig::default());

    let mut first = Batch::new(Map::new(), 0);
    first
        .push(
            TaskMode::Async,
            &definition("steps:\n  - type: wait\n    config: { ms: 200 }\n"),
        )
        .unwrap();
    let (_first_handle, first_events) = busy.submit(first);
    loop {
        if let SchedulerEvent::Started { .. } = first_events.recv().await.unwrap() {
            break;
        }
    }

    // 唯一的工作者被占用，第二个批次的任务停在 acquire
    let mut second = Batch::new(Map::new(), 0);
    second
        .push(
            TaskMode::Async,
            &definition("steps:\n  - type: echo\n    config: { response: 1 }\n"),
        )
        .unwrap();
    let (handle, second_events) = idle_later.submit(second);
    handle.cancel(0).unwrap();

    let second_events = collect(second_events).await;
    assert_eq!(summary(&second_events), vec![RunStatus::Cancel]);
    assert!(!second_events
        .iter()
        .any(|e| matches!(e, SchedulerEvent::Started { .. } | SchedulerEvent::Message { .. })));
    assert!(second_events.iter().any(|e| matches!(
        e,
        SchedulerEvent::Done { status: RunStatus::Cancel, payload, .. } if payload.is_empty()
    )));

    let first_events = collect(first_events).await;
    assert_eq!(summary(&first_events), vec![RunStatus::Done]);
}

#[tokio::test]
async fn test_undecodable_run_yields_error_payload() {
    let batch = Batch {
        context: SharedContext::default(),
        runs: vec![BatchRun {
            mode: TaskMode::Async,
            payload: b"not zlib".to_vec(),
        }],
    };

    let (_handle, events) = scheduler(1, 0).submit(batch);
    let events = collect(events).await;

    assert_eq!(summary(&events), vec![RunStatus::Error]);
    let decoded = result_of(&events, 0);
    assert_eq!(decoded.header.status, RunStatus::Error);
    assert!(!decoded.index.unwrap().errors.is_empty());
}

#[tokio::test]
async fn test_batch_options_reach_runs() {
    let mut batch = Batch::new(Map::new(), 0x1 | 0x2);
    batch
        .push(
            TaskMode::Async,
            &definition(
                "steps:\n  - type: echo\n    config: { error: boom }\n  - type: echo\n    config: { response: 1 }\n",
            ),
        )
        .unwrap();

    let (_handle, events) = scheduler(1, 0).submit(batch);
    let events = collect(events).await;

    let decoded = result_of(&events, 0);
    assert_eq!(decoded.header.options, 0x3);
    let second = decoded.index.as_ref().unwrap().find("1").unwrap();
    assert_eq!(second.status, StepStatus::Done);
    assert_eq!(decoded.detail(second.step_index.unwrap()).unwrap(), None);
}

#[tokio::test]
async fn test_global_assignment_visible_to_later_sync_run() {
    let mut batch = Batch::new(Map::new(), 0);
    batch
        .push(
            TaskMode::Sync,
            &definition(
                r#"
steps:
  - type: echo
    config: { response: { token: abc } }
    assignments:
      - { name: token, path: token, scope: global }
"#,
            ),
        )
        .unwrap();
    batch
        .push(
            TaskMode::Sync,
            &definition(
                "steps:\n  - type: echo\n    config: { response: \"{{token}}\" }\n    asserts:\n      - expected: abc\n",
            ),
        )
        .unwrap();

    let (_handle, events) = scheduler(2, 0).submit(batch);
    let events = collect(events).await;

    assert!(events.contains(&SchedulerEvent::SetGlobalVariable {
        task_id: 0,
        name: "token".to_string(),
        value: json!("abc"),
    }));
    assert_eq!(summary(&events), vec![RunStatus::Done, RunStatus::Done]);
}
