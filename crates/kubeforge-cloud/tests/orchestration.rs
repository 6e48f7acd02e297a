//! Orchestration properties across tasks, actions and procedures

use async_trait::async_trait;
use futures_util::future::join_all;
use parking_lot::Mutex;
use serde::Deserialize;
use serde_json::{Value, json};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use kubeforge_cloud::{
    ActionHandle, ActionRuntime, ActionState, CloudAccount, CloudError, CloudProvider, Collection,
    Engine, EntityStore, HandlerRegistry, Kube, KubernetesApi, KubernetesConnector, MemoryStore,
    Node, Procedure, ProviderContext, ProviderKind, Result, TaskCollection, TaskHandler,
    TaskOutcome, TaskStatus, TaskType, Worker, cancellable_wait_for,
};

fn memory_store() -> Arc<dyn EntityStore> {
    Arc::new(MemoryStore::new())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_at_most_one_claim() {
    let tasks = TaskCollection::new(memory_store());
    let task = tasks
        .start(TaskType::DeployComponent, &json!({"component": "web"}))
        .await
        .unwrap();

    let attempts = (0..16).map(|_| {
        let tasks = tasks.clone();
        let observed = task.clone();
        tokio::spawn(async move { tasks.claim(&observed).await })
    });
    let results: Vec<_> = join_all(attempts)
        .await
        .into_iter()
        .map(|joined| joined.unwrap())
        .collect();

    let winners = results.iter().filter(|r| r.is_ok()).count();
    assert_eq!(winners, 1);
    assert!(
        results
            .iter()
            .filter_map(|r| r.as_ref().err())
            .all(|e| e.is_conflict())
    );
    assert_eq!(tasks.get(&task.id).await.unwrap().status, TaskStatus::Running);
}

struct AlwaysFails(Arc<AtomicUsize>);

#[async_trait]
impl TaskHandler for AlwaysFails {
    async fn handle(&self, _data: Value) -> Result<()> {
        self.0.fetch_add(1, Ordering::SeqCst);
        Err(CloudError::Provider("droplet API unavailable".to_string()))
    }
}

#[tokio::test]
async fn test_retry_bound_then_never_claimed() {
    let tasks = TaskCollection::new(memory_store())
        .with_max_attempts(5)
        .with_retry_delay(Duration::ZERO);
    let task = tasks.start(TaskType::StopInstance, &json!({})).await.unwrap();
    let calls = Arc::new(AtomicUsize::new(0));
    let worker = Worker::new(
        "w",
        tasks.clone(),
        Arc::new(HandlerRegistry::new().with(TaskType::StopInstance, AlwaysFails(calls.clone()))),
        Duration::from_millis(10),
    );

    let mut outcomes = Vec::new();
    while let Some(outcome) = worker.run_once().await.unwrap() {
        outcomes.push(outcome);
    }

    assert_eq!(outcomes.len(), 5);
    assert!(matches!(outcomes.last(), Some(TaskOutcome::Failed(_))));
    assert_eq!(calls.load(Ordering::SeqCst), 5);

    let stored = tasks.get(&task.id).await.unwrap();
    assert_eq!(stored.status, TaskStatus::Failed);
    assert_eq!(stored.attempts, 5);
    assert_eq!(stored.error, "Provider error: droplet API unavailable");

    let err = tasks.claim(&stored).await.unwrap_err();
    assert!(err.is_conflict());
}

struct ResumeTracker {
    log: Mutex<Vec<&'static str>>,
    master_creations: AtomicUsize,
    fail_second: AtomicBool,
}

fn create_procedure(store: Arc<dyn EntityStore>, tracker: Arc<ResumeTracker>) -> Procedure<Kube> {
    let mut procedure = Procedure::new("Create Kube", store);

    let p = tracker.clone();
    procedure.add_step("create master", move |kube: &mut Kube| {
        Box::pin(async move {
            p.log.lock().push("s1");
            if kube.master_id == 0 {
                p.master_creations.fetch_add(1, Ordering::SeqCst);
                kube.master_id = 1001;
            }
            Ok(())
        })
    });

    let p = tracker.clone();
    procedure.add_step("assign address", move |kube: &mut Kube| {
        Box::pin(async move {
            p.log.lock().push("s2");
            if p.fail_second.swap(false, Ordering::SeqCst) {
                return Err(CloudError::Provider("address not yet assigned".to_string()));
            }
            kube.master_public_ip = "198.51.100.7".to_string();
            Ok(())
        })
    });

    let p = tracker;
    procedure.add_step("mark ready", move |kube: &mut Kube| {
        Box::pin(async move {
            p.log.lock().push("s3");
            kube.ready = true;
            Ok(())
        })
    });

    procedure
}

#[tokio::test]
async fn test_procedure_resumes_from_checkpoint() {
    let store = memory_store();
    let kubes: Collection<Kube> = Collection::new(store.clone());
    let mut kube = Kube::new("staging", "1");
    kubes.create(&mut kube).await.unwrap();

    let tracker = Arc::new(ResumeTracker {
        log: Mutex::new(Vec::new()),
        master_creations: AtomicUsize::new(0),
        fail_second: AtomicBool::new(true),
    });

    let err = create_procedure(store.clone(), tracker.clone())
        .run(&mut kube)
        .await
        .unwrap_err();
    assert!(matches!(err, CloudError::Provider(_)));
    assert_eq!(*tracker.log.lock(), vec!["s1", "s2"]);

    // restart from what was persisted, as after a crash
    let mut reloaded = kubes.get(&kube.id).await.unwrap();
    assert_eq!(reloaded.master_id, 1001);
    create_procedure(store.clone(), tracker.clone())
        .run(&mut reloaded)
        .await
        .unwrap();

    assert_eq!(*tracker.log.lock(), vec!["s1", "s2", "s1", "s2", "s3"]);
    assert_eq!(tracker.master_creations.load(Ordering::SeqCst), 1);

    let stored = kubes.get(&kube.id).await.unwrap();
    assert_eq!(stored.master_public_ip, "198.51.100.7");
    assert!(stored.ready);
}

#[tokio::test]
async fn test_cancel_existing_preempts_waiting_action() {
    let store = memory_store();
    let kubes: Collection<Kube> = Collection::new(store.clone());
    let mut kube = Kube::new("prod", "1");
    kubes.create(&mut kube).await.unwrap();

    let runtime = ActionRuntime::new(store);
    let events = Arc::new(Mutex::new(Vec::<String>::new()));
    let interval = Duration::from_millis(500);

    let entered = CancellationToken::new();
    let entered_signal = entered.clone();
    let a_events = events.clone();
    runtime
        .action(kube.clone())
        .description("provisioning")
        .run(move |action, _| {
            Box::pin(async move {
                a_events.lock().push("A waiting".to_string());
                entered_signal.cancel();
                let result = action
                    .cancellable_wait_for(
                        "kubernetes",
                        Duration::from_secs(60),
                        interval,
                        || async { Ok(false) },
                    )
                    .await;
                a_events.lock().push(match &result {
                    Err(e) if e.is_cancelled() => "A cancelled".to_string(),
                    other => format!("A returned {:?}", other.is_ok()),
                });
                result
            })
        })
        .run_async()
        .await
        .unwrap();

    entered.cancelled().await;
    let started = Instant::now();

    let b_events = events.clone();
    runtime
        .action(kube.clone())
        .description("deleting")
        .cancel_existing(true)
        .run(move |_, _| {
            Box::pin(async move {
                b_events.lock().push("B started".to_string());
                Ok(())
            })
        })
        .now()
        .await
        .unwrap();

    assert!(started.elapsed() < interval);
    assert_eq!(
        *events.lock(),
        vec!["A waiting", "A cancelled", "B started"]
    );

    let status = kubes.get(&kube.id).await.unwrap().action_status.unwrap();
    assert_eq!(status.description, "deleting");
    assert_eq!(status.state, ActionState::Succeeded);
}

#[tokio::test(start_paused = true)]
async fn test_wait_times_out_after_about_four_polls() {
    let polls = Arc::new(AtomicUsize::new(0));
    let counter = polls.clone();
    let started = Instant::now();

    let err = cancellable_wait_for(
        &CancellationToken::new(),
        "x",
        Duration::from_millis(200),
        Duration::from_millis(50),
        move || {
            counter.fetch_add(1, Ordering::SeqCst);
            async { Ok(false) }
        },
    )
    .await
    .unwrap_err();

    assert!(err.is_timeout());
    assert_eq!(polls.load(Ordering::SeqCst), 4);
    assert!(started.elapsed() >= Duration::from_millis(200));
}

#[derive(Deserialize)]
struct StartInstance {
    #[serde(rename = "nodeID")]
    node_id: u64,
}

/// Fails on its first call, then succeeds; records what it saw in the store
struct FlakyStart {
    tasks: TaskCollection,
    calls: AtomicUsize,
    seen: Mutex<Vec<(u64, TaskStatus)>>,
}

struct FlakyHandler(Arc<FlakyStart>);

#[async_trait]
impl TaskHandler for FlakyHandler {
    async fn handle(&self, data: Value) -> Result<()> {
        let payload: StartInstance = serde_json::from_value(data)?;
        let status = self.0.tasks.list().await?[0].status;
        self.0.seen.lock().push((payload.node_id, status));

        if self.0.calls.fetch_add(1, Ordering::SeqCst) == 0 {
            return Err(CloudError::Provider("connection reset".to_string()));
        }
        Ok(())
    }
}

#[tokio::test]
async fn test_start_instance_end_to_end() {
    let tasks = TaskCollection::new(memory_store()).with_retry_delay(Duration::ZERO);
    let task = tasks
        .start(TaskType::StartInstance, &json!({"nodeID": 7}))
        .await
        .unwrap();
    assert_eq!(task.status, TaskStatus::Queued);
    assert_eq!(task.max_attempts, 20);

    let handler = Arc::new(FlakyStart {
        tasks: tasks.clone(),
        calls: AtomicUsize::new(0),
        seen: Mutex::new(Vec::new()),
    });
    let registry = Arc::new(HandlerRegistry::new().with(TaskType::StartInstance, FlakyHandler(handler.clone())));
    let first = Worker::new("first", tasks.clone(), registry.clone(), Duration::from_millis(10));
    let second = Worker::new("second", tasks.clone(), registry, Duration::from_millis(10));

    assert_eq!(
        first.run_once().await.unwrap(),
        Some(TaskOutcome::Requeued(task.id.clone()))
    );
    let requeued = tasks.get(&task.id).await.unwrap();
    assert_eq!(requeued.status, TaskStatus::Queued);
    assert_eq!(requeued.attempts, 1);
    assert_eq!(requeued.error, "Provider error: connection reset");

    assert_eq!(
        second.run_once().await.unwrap(),
        Some(TaskOutcome::Completed(task.id.clone()))
    );
    assert_eq!(
        *handler.seen.lock(),
        vec![(7, TaskStatus::Running), (7, TaskStatus::Running)]
    );

    assert!(tasks.get(&task.id).await.unwrap_err().is_not_found());
    assert_eq!(first.run_once().await.unwrap(), None);
}

struct NoKubernetes;

impl KubernetesConnector for NoKubernetes {
    fn connect(&self, _kube: &Kube) -> Arc<dyn KubernetesApi> {
        unreachable!("not used by the fake provider")
    }
}

#[derive(Default)]
struct FakeProvider {
    deleted_nodes: Mutex<Vec<String>>,
    deleted_kubes: AtomicUsize,
}

#[async_trait]
impl CloudProvider for FakeProvider {
    fn kind(&self) -> ProviderKind {
        ProviderKind::DigitalOcean
    }

    async fn validate_account(&self, _account: &CloudAccount) -> Result<()> {
        Ok(())
    }

    async fn create_kube(
        &self,
        ctx: &ProviderContext,
        kube: &mut Kube,
        _action: &ActionHandle,
    ) -> Result<()> {
        kube.master_id = 1;
        kube.master_public_ip = "192.0.2.1".to_string();
        let mut node = Node::new(kube.id.clone(), "s-1vcpu-2gb");
        ctx.engine.nodes().create(&mut node).await
    }

    async fn delete_kube(&self, _ctx: &ProviderContext, kube: &mut Kube) -> Result<()> {
        kube.master_id = 0;
        self.deleted_kubes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn create_node(
        &self,
        _ctx: &ProviderContext,
        node: &mut Node,
        _kube: &Kube,
        _action: &ActionHandle,
    ) -> Result<()> {
        node.provider_id = format!("droplet-{}", node.id);
        Ok(())
    }

    async fn delete_node(&self, _ctx: &ProviderContext, node: &Node) -> Result<()> {
        self.deleted_nodes.lock().push(node.provider_id.clone());
        Ok(())
    }
}

async fn eventually<F, Fut>(mut check: F)
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    for _ in 0..200 {
        if check().await {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("condition not reached");
}

#[tokio::test]
async fn test_kube_lifecycle() {
    let provider = Arc::new(FakeProvider::default());
    let engine = Engine::builder(memory_store())
        .provider(provider.clone())
        .kubernetes(Arc::new(NoKubernetes))
        .build()
        .unwrap();

    let mut account = CloudAccount {
        name: "do".to_string(),
        token: "secret".to_string(),
        ..Default::default()
    };
    engine.cloud_accounts().create(&mut account).await.unwrap();

    let mut kube = Kube::new("prod", account.id.clone());
    engine.kubes().create(&mut kube).await.unwrap();
    assert_eq!(kube.username.len(), 16);
    assert_eq!(kube.password.len(), 8);

    eventually(|| {
        let engine = engine.clone();
        let id = kube.id.clone();
        async move {
            let kube = engine.kubes().get(&id).await.unwrap();
            let nodes = engine.nodes().collection().list().await.unwrap();
            kube.ready && nodes.iter().all(|n| !n.provider_id.is_empty()) && !nodes.is_empty()
        }
    })
    .await;

    let stored = engine.kubes().get(&kube.id).await.unwrap();
    assert_eq!(stored.master_public_ip, "192.0.2.1");
    assert_eq!(stored.action_status.as_ref().unwrap().state, ActionState::Succeeded);
    let nodes = engine.nodes().collection().list().await.unwrap();
    assert_eq!(nodes.len(), 1);
    assert!(nodes[0].name.starts_with("prod-minion-"));

    engine.kubes().delete(stored).now().await.unwrap();

    assert!(engine.kubes().get(&kube.id).await.unwrap_err().is_not_found());
    assert!(engine.nodes().collection().list().await.unwrap().is_empty());
    assert_eq!(
        *provider.deleted_nodes.lock(),
        vec![format!("droplet-{}", nodes[0].id)]
    );
    assert_eq!(provider.deleted_kubes.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_unregistered_provider_is_rejected() {
    let engine = Engine::builder(memory_store())
        .kubernetes(Arc::new(NoKubernetes))
        .build()
        .unwrap();
    let mut account = CloudAccount {
        name: "do".to_string(),
        provider: ProviderKind::DigitalOcean,
        ..Default::default()
    };
    engine.cloud_accounts().create(&mut account).await.unwrap();

    let mut kube = Kube::new("prod", account.id.clone());
    let err = engine.kubes().create(&mut kube).await.unwrap_err();
    assert!(matches!(err, CloudError::ProviderNotFound(ref p) if p == "digitalocean"));
    assert!(engine.kubes().list().await.unwrap().is_empty());
}

/// Provisioning that blocks until its action is cancelled
#[derive(Default)]
struct NeverBoots {
    waiting: CancellationToken,
    cancelled: AtomicBool,
    deleted_kubes: AtomicUsize,
}

#[async_trait]
impl CloudProvider for NeverBoots {
    fn kind(&self) -> ProviderKind {
        ProviderKind::DigitalOcean
    }

    async fn validate_account(&self, _account: &CloudAccount) -> Result<()> {
        Ok(())
    }

    async fn create_kube(
        &self,
        _ctx: &ProviderContext,
        kube: &mut Kube,
        action: &ActionHandle,
    ) -> Result<()> {
        kube.master_id = 7;
        self.waiting.cancel();
        let result = action
            .cancellable_wait_for(
                "master droplet",
                Duration::from_secs(60),
                Duration::from_millis(10),
                || async { Ok(false) },
            )
            .await;
        if matches!(&result, Err(e) if e.is_cancelled()) {
            self.cancelled.store(true, Ordering::SeqCst);
        }
        result
    }

    async fn delete_kube(&self, _ctx: &ProviderContext, _kube: &mut Kube) -> Result<()> {
        self.deleted_kubes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn create_node(
        &self,
        _ctx: &ProviderContext,
        _node: &mut Node,
        _kube: &Kube,
        _action: &ActionHandle,
    ) -> Result<()> {
        Ok(())
    }

    async fn delete_node(&self, _ctx: &ProviderContext, _node: &Node) -> Result<()> {
        Ok(())
    }
}

#[tokio::test]
async fn test_delete_preempts_blocked_provisioning() {
    let provider = Arc::new(NeverBoots::default());
    let engine = Engine::builder(memory_store())
        .provider(provider.clone())
        .kubernetes(Arc::new(NoKubernetes))
        .build()
        .unwrap();
    let mut account = CloudAccount {
        name: "do".to_string(),
        ..Default::default()
    };
    engine.cloud_accounts().create(&mut account).await.unwrap();

    let mut kube = Kube::new("prod", account.id.clone());
    engine.kubes().create(&mut kube).await.unwrap();
    provider.waiting.cancelled().await;
    assert!(engine.actions().registry().is_running(&kube.uuid));

    let stale = engine.kubes().get(&kube.id).await.unwrap();
    tokio::time::timeout(Duration::from_secs(5), engine.kubes().delete(stale).now())
        .await
        .expect("delete waited for the provisioning timeout")
        .unwrap();

    assert!(provider.cancelled.load(Ordering::SeqCst));
    assert_eq!(provider.deleted_kubes.load(Ordering::SeqCst), 1);
    assert!(!engine.actions().registry().is_running(&kube.uuid));

    // nothing writes the record back once the superseded action is gone
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(engine.kubes().get(&kube.id).await.unwrap_err().is_not_found());
    assert!(engine.kubes().list().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_lifecycle_tasks_run_through_the_queue() {
    let provider = Arc::new(FakeProvider::default());
    let engine = Engine::builder(memory_store())
        .provider(provider.clone())
        .kubernetes(Arc::new(NoKubernetes))
        .build()
        .unwrap();
    let mut account = CloudAccount {
        name: "do".to_string(),
        ..Default::default()
    };
    engine.cloud_accounts().create(&mut account).await.unwrap();

    // a stored kube that was never provisioned
    let mut kube = Kube::new("prod", account.id.clone());
    engine.kubes().collection().create(&mut kube).await.unwrap();

    let worker = Worker::new(
        "w",
        engine.tasks().clone(),
        Arc::new(kubeforge_cloud::handlers::registry(&engine)),
        Duration::from_millis(10),
    );

    let task = engine
        .tasks()
        .start(TaskType::CreateKube, &json!({"kubeID": kube.id}))
        .await
        .unwrap();
    assert_eq!(
        worker.run_once().await.unwrap(),
        Some(TaskOutcome::Completed(task.id.clone()))
    );
    assert!(engine.kubes().get(&kube.id).await.unwrap().ready);
    eventually(|| {
        let engine = engine.clone();
        async move {
            let nodes = engine.nodes().collection().list().await.unwrap();
            nodes.len() == 1 && !nodes[0].provider_id.is_empty()
        }
    })
    .await;

    let task = engine
        .tasks()
        .start(TaskType::DeleteKube, &json!({"kubeID": kube.id}))
        .await
        .unwrap();
    assert_eq!(
        worker.run_once().await.unwrap(),
        Some(TaskOutcome::Completed(task.id.clone()))
    );
    assert!(engine.kubes().get(&kube.id).await.unwrap_err().is_not_found());
    assert!(engine.nodes().collection().list().await.unwrap().is_empty());
    assert_eq!(provider.deleted_kubes.load(Ordering::SeqCst), 1);
    assert!(engine.tasks().list().await.unwrap().is_empty());
}
