//! 端到端流水线场景，全部使用 FakeStageClient

use serde_json::json;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use vidpipe::application::{CallContext, PipelineError, StageError, StageRegistry};
use vidpipe::domain::stage::{RetryPolicy, StageDescriptor};
use vidpipe::domain::task::{StagePhase, TaskId, TaskStatus};
use vidpipe::infrastructure::adapters::{FakeStageClient, FakeStageClientConfig};
use vidpipe::infrastructure::events::{ProgressEvent, ProgressLevel, ProgressTracker};
use vidpipe::infrastructure::gpu::GpuResourceManager;
use vidpipe::infrastructure::memory::InMemoryTaskManager;
use vidpipe::infrastructure::resilience::{CircuitBreaker, CircuitBreakerConfig, CircuitState};
use vidpipe::infrastructure::worker::{
    OrchestratorConfig, OrchestratorDeps, PipelineOrchestrator, SubmitRequest, TaskStatusSnapshot,
};

const GIB: u64 = 1024 * 1024 * 1024;
const FAST: Duration = Duration::from_millis(10);

struct Pipeline {
    orchestrator: PipelineOrchestrator,
    clients: HashMap<String, Arc<FakeStageClient>>,
}

impl Pipeline {
    fn build(stages: Vec<(StageDescriptor, FakeStageClientConfig)>) -> Self {
        Self::build_with_breaker(stages, CircuitBreakerConfig::default())
    }

    fn build_with_breaker(
        stages: Vec<(StageDescriptor, FakeStageClientConfig)>,
        breaker: CircuitBreakerConfig,
    ) -> Self {
        let mut registry = StageRegistry::new();
        let mut clients = HashMap::new();
        for (descriptor, config) in stages {
            let client = Arc::new(FakeStageClient::new(config));
            clients.insert(descriptor.name.clone(), client.clone());
            registry.register(descriptor, client).unwrap();
        }
        registry.validate(15 * GIB).unwrap();

        let resources = GpuResourceManager::new(15 * GIB, registry.class_limits().unwrap());
        let (orchestrator, dispatcher) = PipelineOrchestrator::new(
            OrchestratorConfig::default(),
            OrchestratorDeps {
                registry,
                resources,
                tracker: ProgressTracker::default(),
                breaker: Arc::new(CircuitBreaker::new(breaker)),
                tasks: Arc::new(InMemoryTaskManager::new()),
            },
        );
        tokio::spawn(dispatcher.run());

        Self {
            orchestrator,
            clients,
        }
    }

    fn client(&self, stage: &str) -> &FakeStageClient {
        &self.clients[stage]
    }

    fn submit(&self, stages: &[&str]) -> TaskId {
        self.orchestrator
            .submit(SubmitRequest {
                stages: stages.iter().map(|s| s.to_string()).collect(),
                input: json!({"image": "portrait.png", "text": "hello there"}),
                params: HashMap::new(),
            })
            .unwrap()
    }

    async fn wait_for(
        &self,
        task_id: &TaskId,
        predicate: impl Fn(&TaskStatusSnapshot) -> bool,
    ) -> TaskStatusSnapshot {
        for _ in 0..1000 {
            let snapshot = self.orchestrator.status(task_id).unwrap();
            if predicate(&snapshot) {
                return snapshot;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("condition not reached for task {}", task_id);
    }

    async fn wait_terminal(&self, task_id: &TaskId) -> TaskStatusSnapshot {
        self.wait_for(task_id, |s| s.status.is_terminal()).await
    }

    /// 订阅并收集全部事件，直到流结束
    async fn collect_events(&self, task_id: TaskId) -> Vec<ProgressEvent> {
        let mut subscription = self.orchestrator.tracker().subscribe(task_id);
        let mut events = Vec::new();
        while let Ok(Some(event)) =
            tokio::time::timeout(Duration::from_secs(10), subscription.recv()).await
        {
            events.push(event);
        }
        events
    }
}

fn video_stages(
    stage_latency: Duration,
    render_latency: Duration,
) -> Vec<(StageDescriptor, FakeStageClientConfig)> {
    vec![
        (
            StageDescriptor::new("detect_person", "yolo")
                .with_max_concurrent(2)
                .with_vram(2 * GIB),
            FakeStageClientConfig::new("yolo").with_latency(stage_latency),
        ),
        (
            StageDescriptor::new("segment_background", "segmentation").with_vram(3 * GIB),
            FakeStageClientConfig::new("segmentation").with_latency(stage_latency),
        ),
        (
            StageDescriptor::new("synthesize_voice", "tts")
                .with_vram(4 * GIB)
                .with_retry(RetryPolicy::new(2))
                .with_fallback("synthesize_voice_fallback"),
            FakeStageClientConfig::new("tts").with_latency(stage_latency),
        ),
        (
            StageDescriptor::new("synthesize_voice_fallback", "tts_fallback").with_vram(GIB),
            FakeStageClientConfig::new("tts_fallback").with_latency(stage_latency),
        ),
        (
            StageDescriptor::new("render_video", "lipsync").with_vram(8 * GIB),
            FakeStageClientConfig::new("lipsync").with_latency(render_latency),
        ),
    ]
}

const FOUR_STAGES: [&str; 4] = [
    "detect_person",
    "segment_background",
    "synthesize_voice",
    "render_video",
];

#[tokio::test]
async fn sequential_pipeline_emits_one_event_per_stage_boundary() {
    let latency = Duration::from_millis(100);
    let pipeline = Pipeline::build(video_stages(latency, latency));
    let task_id = pipeline.submit(&FOUR_STAGES);

    let snapshot = pipeline.wait_terminal(&task_id).await;
    assert_eq!(snapshot.status, TaskStatus::Succeeded);
    assert_eq!(snapshot.current_stage_index, 3);
    assert!(snapshot.failure.is_none());

    // 任务结束后订阅仍能拿到完整历史
    let events = pipeline.collect_events(task_id).await;
    let percentages: Vec<i8> = events.iter().map(|e| e.percentage).collect();
    assert_eq!(percentages, vec![0, 25, 50, 75, 100]);
    assert!(events.iter().all(|e| e.level == ProgressLevel::Info));

    let sequences: Vec<u64> = events.iter().map(|e| e.sequence).collect();
    assert_eq!(sequences, vec![1, 2, 3, 4, 5]);

    let utilization = pipeline.orchestrator.resources().utilization();
    assert_eq!(utilization.vram_in_use, 0);
}

#[tokio::test]
async fn exclusive_render_class_serializes_tasks() {
    let render_latency = Duration::from_millis(100);
    let pipeline = Pipeline::build(video_stages(FAST, render_latency));

    let first = pipeline.submit(&FOUR_STAGES);
    let second = pipeline.submit(&FOUR_STAGES);

    assert_eq!(
        pipeline.wait_terminal(&first).await.status,
        TaskStatus::Succeeded
    );
    assert_eq!(
        pipeline.wait_terminal(&second).await.status,
        TaskStatus::Succeeded
    );

    let render = pipeline.client("render_video");
    assert_eq!(render.calls(), 2);
    assert_eq!(render.peak_concurrency(), 1);

    let starts = render.start_times();
    let gap = starts[1].duration_since(starts[0]);
    assert!(gap >= Duration::from_millis(90), "render calls overlapped: {:?}", gap);

    // 进度事件的时间戳同样体现串行
    let mut render_started = Vec::new();
    for task_id in [first, second] {
        let events = pipeline.collect_events(task_id).await;
        let started = events
            .iter()
            .find(|e| e.level == ProgressLevel::Info && e.message.ends_with("render_video"))
            .expect("render_video start event");
        assert_eq!(started.percentage, 75);
        render_started.push(started.timestamp);
    }
    render_started.sort();
    let event_gap = render_started[1] - render_started[0];
    assert!(
        event_gap.num_milliseconds() >= 90,
        "render start events {}ms apart",
        event_gap.num_milliseconds()
    );
}

#[tokio::test]
async fn failing_voice_stage_falls_back_after_retries() {
    let mut stages = video_stages(FAST, FAST);
    stages[2].1 = FakeStageClientConfig::new("tts").always_failing();
    let pipeline = Pipeline::build(stages);

    let task_id = pipeline.submit(&FOUR_STAGES);
    let snapshot = pipeline.wait_terminal(&task_id).await;

    assert_eq!(snapshot.status, TaskStatus::Succeeded);
    assert_eq!(pipeline.client("synthesize_voice").calls(), 2);
    assert_eq!(pipeline.client("synthesize_voice_fallback").calls(), 1);
    assert_eq!(pipeline.client("render_video").calls(), 1);

    let events = pipeline.collect_events(task_id).await;
    let warnings: Vec<&ProgressEvent> = events
        .iter()
        .filter(|e| e.level == ProgressLevel::Warn)
        .collect();
    // 第一次失败的重试提示 + 切换 fallback 的提示
    assert_eq!(warnings.len(), 2);
    assert!(warnings.iter().all(|e| e.percentage == 50));
    assert!(warnings[1].message.contains("synthesize_voice_fallback"));

    // 每个阶段边界仍只有一条 info 事件
    let info: Vec<i8> = events
        .iter()
        .filter(|e| e.level == ProgressLevel::Info)
        .map(|e| e.percentage)
        .collect();
    assert_eq!(info, vec![0, 25, 50, 75, 100]);
    assert!(events.windows(2).all(|w| w[0].percentage <= w[1].percentage));
}

#[tokio::test]
async fn cancelling_task_awaiting_slot_leaves_usage_unchanged() {
    let pipeline = Pipeline::build(video_stages(FAST, Duration::from_secs(2)));

    let holder = pipeline.submit(&["render_video"]);
    pipeline
        .wait_for(&holder, |s| s.phase == Some(StagePhase::Executing))
        .await;

    let waiter = pipeline.submit(&["render_video"]);
    pipeline
        .wait_for(&waiter, |s| {
            s.status == TaskStatus::Running && s.phase == Some(StagePhase::AwaitingSlot)
        })
        .await;
    tokio::time::sleep(Duration::from_millis(20)).await;

    let before = pipeline.orchestrator.resources().utilization();
    assert_eq!(before.class("lipsync").unwrap().in_use, 1);

    pipeline.orchestrator.cancel(&waiter).unwrap();
    let snapshot = pipeline.wait_terminal(&waiter).await;
    assert_eq!(snapshot.status, TaskStatus::Cancelled);

    let after = pipeline.orchestrator.resources().utilization();
    assert_eq!(after, before);
    assert_eq!(pipeline.client("render_video").calls(), 1);

    // 持有 slot 的任务不受影响
    pipeline.orchestrator.cancel(&holder).unwrap();
    assert_eq!(
        pipeline.wait_terminal(&holder).await.status,
        TaskStatus::Cancelled
    );
    assert_eq!(
        pipeline.orchestrator.resources().utilization().vram_in_use,
        0
    );
}

#[tokio::test]
async fn open_circuit_fails_fast_without_calling_service() {
    let stages = vec![(
        StageDescriptor::new("segment_background", "segmentation"),
        FakeStageClientConfig::new("segmentation").always_failing(),
    )];
    let pipeline = Pipeline::build_with_breaker(
        stages,
        CircuitBreakerConfig {
            failure_threshold: 2,
            cooldown: Duration::from_secs(60),
            ..Default::default()
        },
    );

    for _ in 0..2 {
        let task_id = pipeline.submit(&["segment_background"]);
        let snapshot = pipeline.wait_terminal(&task_id).await;
        assert_eq!(snapshot.failure.unwrap().code, "upstream_unavailable");
    }
    assert_eq!(
        pipeline.orchestrator.breaker().state("segmentation"),
        CircuitState::Open
    );

    let task_id = pipeline.submit(&["segment_background"]);
    let snapshot = pipeline.wait_terminal(&task_id).await;
    assert_eq!(snapshot.status, TaskStatus::Failed);
    assert_eq!(snapshot.failure.unwrap().code, "circuit_open");
    assert_eq!(pipeline.client("segment_background").calls(), 2);

    let events = pipeline.orchestrator.tracker().history(&task_id);
    assert!(events.last().unwrap().is_errored());
}

#[tokio::test]
async fn primary_circuit_opens_while_fallback_keeps_serving() {
    let mut stages = video_stages(FAST, FAST);
    stages[2].1 = FakeStageClientConfig::new("tts").always_failing();
    let pipeline = Pipeline::build(stages);

    for _ in 0..6 {
        let task_id = pipeline.submit(&["synthesize_voice"]);
        let snapshot = pipeline.wait_terminal(&task_id).await;
        assert_eq!(snapshot.status, TaskStatus::Succeeded);
        assert_eq!(snapshot.active_stage.as_deref(), Some("synthesize_voice_fallback"));
    }

    // 阈值 5：第三个任务的第一次尝试打开电路，之后不再调用主服务
    let breaker = pipeline.orchestrator.breaker();
    assert_eq!(breaker.state("tts"), CircuitState::Open);
    assert_eq!(breaker.state("tts_fallback"), CircuitState::Closed);
    assert_eq!(pipeline.client("synthesize_voice").calls(), 5);
    assert_eq!(pipeline.client("synthesize_voice_fallback").calls(), 6);
}

#[tokio::test]
async fn open_circuit_routes_to_fallback_stage() {
    let stages = vec![
        (
            StageDescriptor::new("segment_background", "segmentation")
                .with_vram(3 * GIB)
                .with_fallback("segment_background_cpu"),
            FakeStageClientConfig::new("segmentation"),
        ),
        (
            StageDescriptor::new("segment_background_cpu", "segmentation_cpu"),
            FakeStageClientConfig::new("segmentation_cpu"),
        ),
    ];
    let pipeline = Pipeline::build_with_breaker(
        stages,
        CircuitBreakerConfig {
            failure_threshold: 1,
            cooldown: Duration::from_secs(60),
            ..Default::default()
        },
    );

    let breaker = pipeline.orchestrator.breaker();
    let tripped = breaker
        .call(&CallContext::background(), "segmentation", || async {
            Err::<(), _>(StageError::Timeout)
        })
        .await;
    assert!(tripped.is_err());
    assert_eq!(breaker.state("segmentation"), CircuitState::Open);

    let task_id = pipeline.submit(&["segment_background"]);
    let snapshot = pipeline.wait_terminal(&task_id).await;

    assert_eq!(snapshot.status, TaskStatus::Succeeded);
    assert_eq!(snapshot.active_stage.as_deref(), Some("segment_background_cpu"));
    assert!(snapshot.failure.is_none());
    assert_eq!(pipeline.client("segment_background").calls(), 0);
    assert_eq!(pipeline.client("segment_background_cpu").calls(), 1);

    let events = pipeline.collect_events(task_id).await;
    let fallback_notice = events
        .iter()
        .find(|e| e.level == ProgressLevel::Warn)
        .expect("fallback warning");
    assert!(fallback_notice.message.contains("Circuit open"));
    assert!(fallback_notice.message.contains("segment_background_cpu"));
    assert_eq!(events.last().unwrap().percentage, 100);
}

#[tokio::test]
async fn submit_rejects_unregistered_stage() {
    let pipeline = Pipeline::build(video_stages(FAST, FAST));
    let result = pipeline.orchestrator.submit(SubmitRequest {
        stages: vec!["detect_person".to_string(), "dance".to_string()],
        ..Default::default()
    });
    assert_eq!(result, Err(PipelineError::UnknownStage("dance".to_string())));
}
