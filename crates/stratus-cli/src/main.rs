//! Demo: run a compute fleet through its whole lifecycle on the
//! in-memory store — allocate, provision, remove — polling task status
//! along the way.

use anyhow::{Context, Result};
use std::sync::Arc;
use tokio::time::{Duration, sleep};
use tracing::info;
use tracing_subscriber::EnvFilter;

use stratus_core::domain::{DocumentLink, TaskCreate, TaskStage};
use stratus_core::engine::ServiceHost;
use stratus_core::impls::{InMemoryStore, MockAdapter};
use stratus_core::workflows::compute::{
    ComputeAllocationPayload, ComputeAllocationTask, ComputeProvisionPayload,
    ComputeProvisionTask, ComputeRemovalPayload, ComputeRemovalTask,
};
use stratus_core::workflows::placement::PlacementSelectionTask;
use stratus_core::workflows::resources::{self, ComputeState, PowerState, ResourcePoolState, kinds};
use stratus_core::engine::TaskWorkflow;

async fn await_terminal(host: &Arc<ServiceHost>, link: &DocumentLink) -> Result<TaskStage> {
    loop {
        let status = host.status(link).await.context("task vanished")?;
        println!(
            "  [{}] {:?} {} ({}%)",
            status.phase, status.stage, status.sub_stage, status.progress
        );
        if status.stage.is_terminal() {
            if let Some(failure) = &status.failure {
                println!("  failure: {}", failure.message);
            }
            return Ok(status.stage);
        }
        sleep(Duration::from_millis(50)).await;
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let host = ServiceHost::builder(Arc::new(InMemoryStore::new()))
        .adapter(Arc::new(MockAdapter::new()))
        .register(PlacementSelectionTask)
        .register(ComputeAllocationTask)
        .register(ComputeProvisionTask)
        .register(ComputeRemovalTask)
        .build();

    // seed a pool with two powered-on hosts
    let pool = resources::create_document(
        &host,
        kinds::POOL,
        Vec::new(),
        &ResourcePoolState {
            name: "demo-pool".into(),
        },
    )
    .await?;
    for i in 0..2 {
        resources::create_document(
            &host,
            kinds::HOST,
            Vec::new(),
            &ComputeState {
                name: format!("host-{i}"),
                power_state: PowerState::On,
                pool_link: Some(pool.clone()),
                ..Default::default()
            },
        )
        .await?;
    }
    info!(pool = %pool, "seeded demo pool");

    println!("allocating 3 instances...");
    let create = TaskCreate::new(ComputeAllocationPayload {
        resource_count: Some(3),
        name_prefix: Some("demo".into()),
        pool_link: Some(pool),
        ..Default::default()
    });
    let task = host
        .start_task(ComputeAllocationTask::FACTORY, serde_json::to_value(create)?)
        .await?;
    await_terminal(&host, &task).await?;
    let links = host
        .status(&task)
        .await?
        .resource_links
        .context("allocation reported no links")?;
    for link in &links {
        let c: ComputeState = resources::get_document(&host, link).await?;
        println!(
            "  allocated {} on {}",
            c.name,
            c.host_link.context("compute has no host")?
        );
    }

    println!("provisioning...");
    let create = TaskCreate::new(ComputeProvisionPayload {
        resource_links: Some(links.clone()),
    });
    let task = host
        .start_task(ComputeProvisionTask::FACTORY, serde_json::to_value(create)?)
        .await?;
    await_terminal(&host, &task).await?;
    for link in &links {
        let c: ComputeState = resources::get_document(&host, link).await?;
        println!(
            "  {} is {:?} at {}",
            c.name,
            c.power_state,
            c.address.as_deref().unwrap_or("<no address>")
        );
    }

    println!("removing...");
    let create = TaskCreate::new(ComputeRemovalPayload {
        resource_links: Some(links),
        error_threshold: Some(1.0),
    });
    let task = host
        .start_task(ComputeRemovalTask::FACTORY, serde_json::to_value(create)?)
        .await?;
    await_terminal(&host, &task).await?;
    println!("done.");
    Ok(())
}
