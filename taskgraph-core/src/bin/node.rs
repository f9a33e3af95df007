//! Task-graph node binary
//!
//! Joins the job named by `JOB_NAME` through the etcd endpoints in
//! `ETCD_ENDPOINTS` and runs a demo task that relays meta and echoes data
//! requests over a `TreeTopology` of `NUM_TASKS` tasks.

use bytes::Bytes;
use std::sync::Arc;
use taskgraph_core::config::env_parse;
use taskgraph_core::store::{EtcdConfig, EtcdStore};
use taskgraph_core::{Bootstrap, Context, FrameworkHandle, NodeConfig, Task, TreeTopology};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

/// Logs every callback, flags its epoch to neighbors and echoes requests
struct RelayTask {
    framework: parking_lot::Mutex<Option<FrameworkHandle>>,
}

impl RelayTask {
    fn framework(&self) -> Option<FrameworkHandle> {
        self.framework.lock().clone()
    }
}

impl Task for RelayTask {
    fn init(&self, task_id: u64, framework: FrameworkHandle) {
        info!("Task {} initialized for job {}", task_id, framework.job());
        *self.framework.lock() = Some(framework);
    }

    fn exit(&self) {
        info!("Task exiting");
    }

    fn set_epoch(&self, ctx: Context, epoch: u64) {
        info!("Task {} at epoch {}", ctx.task_id(), epoch);
        let Some(fw) = self.framework() else { return };
        let meta = format!("epoch-{}", epoch);
        tokio::spawn(async move {
            if let Err(e) = fw.flag_meta_to_child(&meta).await {
                warn!("Failed to flag {} to children: {}", meta, e);
            }
            if let Err(e) = fw.flag_meta_to_parent(&meta).await {
                warn!("Failed to flag {} to parents: {}", meta, e);
            }
        });
    }

    fn parent_meta_ready(&self, ctx: Context, parent_id: u64, meta: &str) {
        info!("Task {}: parent {} ready with {:?}", ctx.task_id(), parent_id, meta);
        if let Some(fw) = self.framework() {
            fw.data_request(parent_id, meta);
        }
    }

    fn child_meta_ready(&self, ctx: Context, child_id: u64, meta: &str) {
        info!("Task {}: child {} ready with {:?}", ctx.task_id(), child_id, meta);
        if let Some(fw) = self.framework() {
            fw.data_request(child_id, meta);
        }
    }

    fn parent_data_ready(&self, ctx: Context, parent_id: u64, req: &str, resp: Bytes) {
        info!("Task {}: {} bytes from parent {} for {:?}", ctx.task_id(), resp.len(), parent_id, req);
    }

    fn child_data_ready(&self, ctx: Context, child_id: u64, req: &str, resp: Bytes) {
        info!("Task {}: {} bytes from child {} for {:?}", ctx.task_id(), resp.len(), child_id, req);
    }

    fn serve_as_parent(&self, from_id: u64, req: &str, data: mpsc::Sender<Bytes>) {
        echo(from_id, req, data);
    }

    fn serve_as_child(&self, from_id: u64, req: &str, data: mpsc::Sender<Bytes>) {
        echo(from_id, req, data);
    }
}

fn echo(from_id: u64, req: &str, data: mpsc::Sender<Bytes>) {
    let payload = Bytes::from(format!("{} -> {}", from_id, req));
    tokio::spawn(async move {
        let _ = data.send(payload).await;
    });
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config = NodeConfig::from_env()?;
    let num_tasks = env_parse::<u64>("NUM_TASKS")?.unwrap_or(1);
    let fanout = env_parse::<u64>("TREE_FANOUT")?.unwrap_or(2);
    let bind_addr = std::env::var("BIND_ADDR").unwrap_or_else(|_| "127.0.0.1:0".into());

    let etcd = EtcdConfig::from_env();
    info!("Starting node for job {} against {:?}", config.job_name, etcd.endpoints);
    let store = Arc::new(EtcdStore::new(etcd)?);

    let listener = match TcpListener::bind(&bind_addr).await {
        Ok(l) => l,
        Err(e) => {
            error!("Job {}: cannot listen on {}: {}", config.job_name, bind_addr, e);
            std::process::exit(1);
        }
    };

    let job = config.job_name.clone();
    let node = Bootstrap::new(config, store, listener)
        .with_task_builder(Arc::new(|_task_id: u64| -> Arc<dyn Task> {
            Arc::new(RelayTask {
                framework: parking_lot::Mutex::new(None),
            })
        }))
        .with_topology(Box::new(TreeTopology::new(fanout, num_tasks)));

    let shutdown = node.shutdown_signal();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Interrupted, shutting down");
            shutdown.shutdown();
        }
    });

    if let Err(e) = node.run().await {
        error!("Job {}: node failed: {}", job, e);
        std::process::exit(1);
    }
    Ok(())
}
