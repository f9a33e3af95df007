//! End-to-end node lifecycle against the in-process store
//!
//! Run with: cargo test --test node_lifecycle -- --nocapture

use bytes::Bytes;
use std::sync::Arc;
use std::time::Duration;
use taskgraph_core::coordinator::NodePhase;
use taskgraph_core::runtime::ShutdownSignal;
use taskgraph_core::store::{CoordinationStore, MemoryStore};
use taskgraph_core::testing::{RecordingTaskBuilder, TaskEvent};
use taskgraph_core::{Bootstrap, JobController, NodeConfig, TaskGraphError, TreeTopology};
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::task::JoinHandle;

const WAIT: Duration = Duration::from_secs(5);

fn config(job: &str) -> NodeConfig {
    NodeConfig {
        heartbeat_interval: Duration::from_millis(100),
        liveness_ttl: Duration::from_millis(400),
        shutdown_grace: Duration::from_millis(500),
        ..NodeConfig::new(job)
    }
}

struct TestNode {
    handle: JoinHandle<taskgraph_core::Result<()>>,
    shutdown: ShutdownSignal,
    phases: watch::Receiver<NodePhase>,
}

async fn start_node(
    store: &Arc<MemoryStore>,
    config: NodeConfig,
    builder: &Arc<RecordingTaskBuilder>,
    num_tasks: u64,
) -> TestNode {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let node = Bootstrap::new(config, store.clone(), listener)
        .with_task_builder(builder.clone())
        .with_topology(Box::new(TreeTopology::new(1, num_tasks)));
    let shutdown = node.shutdown_signal();
    let phases = node.phases();
    TestNode {
        handle: tokio::spawn(node.run()),
        shutdown,
        phases,
    }
}

async fn wait_phase(node: &mut TestNode, pred: impl FnMut(&NodePhase) -> bool) -> NodePhase {
    let phase = tokio::time::timeout(WAIT, node.phases.wait_for(pred))
        .await
        .expect("phase not reached in time")
        .expect("bootstrap dropped its phase tracker");
    *phase
}

async fn running(node: &mut TestNode) -> u64 {
    match wait_phase(node, |p| matches!(p, NodePhase::Running(_))).await {
        NodePhase::Running(id) => id,
        other => panic!("unexpected phase {:?}", other),
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_two_node_job() {
    let store = MemoryStore::new();
    let controller = JobController::new(store.clone(), "pipeline", 2);
    controller.init_layout().await.unwrap();

    let builder = Arc::new(RecordingTaskBuilder::with_chunks(["part-a|", "part-b"]));
    let mut a = start_node(&store, config("pipeline"), &builder, 2).await;
    let mut b = start_node(&store, config("pipeline"), &builder, 2).await;
    let mut ids = vec![running(&mut a).await, running(&mut b).await];
    ids.sort();
    assert_eq!(ids, vec![0, 1]);

    let root = builder.task(0).unwrap();
    let leaf = builder.task(1).unwrap();

    // Epochs arrive in order, starting from the initial one
    controller.advance_epoch().await.unwrap();
    controller.advance_epoch().await.unwrap();
    assert!(leaf.wait_for(|_| leaf.epochs().len() == 3, WAIT).await);
    assert_eq!(leaf.epochs(), vec![0, 1, 2]);

    // Meta flows parent -> child exactly once per value
    let root_fw = root.framework().unwrap();
    root_fw.flag_meta_to_child("ready").await.unwrap();
    root_fw.flag_meta_to_child("ready").await.unwrap();
    let got_meta = |events: &[TaskEvent]| {
        events.contains(&TaskEvent::ParentMeta {
            parent_id: 0,
            meta: "ready".into(),
        })
    };
    assert!(leaf.wait_for(got_meta, WAIT).await);
    tokio::time::sleep(Duration::from_millis(100)).await;
    let deliveries = leaf
        .events()
        .iter()
        .filter(|e| matches!(e, TaskEvent::ParentMeta { .. }))
        .count();
    assert_eq!(deliveries, 1);

    // Data pulled from the parent comes back through parent_data_ready
    leaf.framework().unwrap().data_request(0, "chunk1");
    let expected = TaskEvent::ParentData {
        parent_id: 0,
        req: "chunk1".into(),
        data: Bytes::from_static(b"part-a|part-b"),
    };
    assert!(leaf.wait_for(|e| e.contains(&expected), WAIT).await);
    assert!(root.events().contains(&TaskEvent::ServeAsParent {
        from_id: 1,
        req: "chunk1".into()
    }));

    // Orderly shutdown frees both slots
    a.shutdown.shutdown();
    b.shutdown.shutdown();
    a.handle.await.unwrap().unwrap();
    b.handle.await.unwrap().unwrap();
    assert_eq!(*a.phases.borrow(), NodePhase::Released);
    assert!(root.events().contains(&TaskEvent::Exit));

    let slots = store.list("/pipeline/slots").await.unwrap();
    assert!(slots.node.nodes.iter().all(|n| n.value.is_empty()));
    assert!(store.get("/pipeline/healthy/0").await.unwrap_err().is_key_not_found());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_task_can_end_the_node() {
    let store = MemoryStore::new();
    JobController::new(store.clone(), "solo", 1).init_layout().await.unwrap();

    let builder = Arc::new(RecordingTaskBuilder::default());
    let mut node = start_node(&store, config("solo"), &builder, 1).await;
    assert_eq!(running(&mut node).await, 0);

    builder.task(0).unwrap().framework().unwrap().shutdown();
    node.handle.await.unwrap().unwrap();
    assert_eq!(*node.phases.borrow(), NodePhase::Released);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_inc_epoch_reaches_peers() {
    let store = MemoryStore::new();
    JobController::new(store.clone(), "rounds", 2).init_layout().await.unwrap();

    let builder = Arc::new(RecordingTaskBuilder::default());
    let mut a = start_node(&store, config("rounds"), &builder, 2).await;
    let mut b = start_node(&store, config("rounds"), &builder, 2).await;
    running(&mut a).await;
    running(&mut b).await;

    let root = builder.task(0).unwrap();
    let leaf = builder.task(1).unwrap();
    assert!(root.framework().unwrap().inc_epoch().await.unwrap());
    assert!(leaf.wait_for(|_| leaf.epochs().ends_with(&[1]), WAIT).await);

    a.shutdown.shutdown();
    b.shutdown.shutdown();
    a.handle.await.unwrap().unwrap();
    b.handle.await.unwrap().unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_corrupt_epoch_is_fatal() {
    let store = MemoryStore::new();
    JobController::new(store.clone(), "broken", 1).init_layout().await.unwrap();
    store.set("/broken/epoch", "not-a-number", None).await.unwrap();

    let builder = Arc::new(RecordingTaskBuilder::default());
    let node = start_node(&store, config("broken"), &builder, 1).await;
    let err = node.handle.await.unwrap().unwrap_err();
    assert!(err.is_corruption(), "unexpected error {}", err);
    assert_eq!(*node.phases.borrow(), NodePhase::Failed);

    // The slot is handed back for another node to try
    assert_eq!(store.get("/broken/slots/0").await.unwrap().node.value, "");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_missing_layout_is_fatal_after_timeout() {
    let store = MemoryStore::new();
    let builder = Arc::new(RecordingTaskBuilder::default());
    let cfg = NodeConfig {
        standby_timeout: Some(Duration::from_millis(200)),
        ..config("nowhere")
    };
    let node = start_node(&store, cfg, &builder, 1).await;
    let err = node.handle.await.unwrap().unwrap_err();
    assert!(matches!(err, TaskGraphError::StandbyTimeout { .. }));
    assert_eq!(*node.phases.borrow(), NodePhase::Failed);
}
