use std::{
    env, io,
    num::{NonZeroU64, NonZeroUsize},
};

use log::info;
use model_sync::{DecaySchedule, DenseTensor, ModelSync, SyncConfig};
use ps_client::{LocalClient, LocalCluster};
use rand::{Rng, SeedableRng, rngs::StdRng};

const DEFAULT_WORKERS: usize = 2;
const DEFAULT_STEPS: usize = 20;
const WARMUP_WINDOW: NonZeroU64 = NonZeroU64::new(10).unwrap();

#[tokio::main]
async fn main() -> io::Result<()> {
    env_logger::init();

    let workers = parse_env("WORKERS", DEFAULT_WORKERS)?;
    let steps = parse_env("STEPS", DEFAULT_STEPS)?;
    let decay = decay_from_env()?;
    let worker_count =
        NonZeroUsize::new(workers).ok_or_else(|| io::Error::other("WORKERS must be nonzero"))?;

    let cluster = LocalCluster::new(worker_count);
    info!("cluster up with {} workers, {steps} steps each", cluster.workers());

    let mut tasks = Vec::with_capacity(cluster.workers());
    for worker_id in 0..cluster.workers() {
        let client = cluster.client();
        tasks.push(tokio::spawn(run_worker(
            worker_id,
            client,
            worker_count,
            steps,
            decay,
        )));
    }
    for task in tasks {
        task.await.map_err(io::Error::other)??;
    }

    Ok(())
}

async fn run_worker(
    worker_id: usize,
    client: LocalClient,
    worker_count: NonZeroUsize,
    steps: usize,
    decay: DecaySchedule,
) -> io::Result<()> {
    let cfg = SyncConfig::new(true, decay, worker_count);
    let mut engine = ModelSync::new(cfg, client)?;

    // A toy two-layer model, seeded differently per worker.
    let mut rng = StdRng::seed_from_u64(worker_id as u64 + 1);
    let mut tensors = vec![
        random_tensor(&mut rng, 4, 8),
        random_tensor(&mut rng, 8, 2),
    ];

    engine.init_model(&mut tensors).await?;
    info!("worker {worker_id} initialized");

    for _ in 0..steps {
        // Fake a training step: nudge every parameter a little.
        for tensor in &mut tensors {
            for value in tensor.as_mut_slice() {
                *value += rng.random_range(-0.05..0.05);
            }
        }
        engine.push_and_pull(&mut tensors).await?;
    }

    engine.shutdown().await?;
    let metrics = engine.metrics();
    info!(
        "worker {worker_id} done: {} syncs, {} background merges, waited {:?} on joins",
        metrics.syncs, metrics.merges_spawned, metrics.join_wait
    );
    Ok(())
}

fn random_tensor(rng: &mut StdRng, rows: usize, cols: usize) -> DenseTensor {
    let values = (0..rows * cols)
        .map(|_| rng.random_range(-1.0..1.0))
        .collect();
    DenseTensor::from_values(rows, cols, values)
}

fn parse_env(name: &str, default: usize) -> io::Result<usize> {
    match env::var(name) {
        Ok(value) => value
            .parse()
            .map_err(|e| io::Error::other(format!("{name}: {e}"))),
        Err(env::VarError::NotPresent) => Ok(default),
        Err(e) => Err(io::Error::other(e)),
    }
}

/// Reads the decay schedule from `DECAY` as JSON, e.g.
/// `{"linear":{"coefficient":0.2,"window":10}}` or `"none"`.
fn decay_from_env() -> io::Result<DecaySchedule> {
    match env::var("DECAY") {
        Ok(raw) => serde_json::from_str(&raw).map_err(|e| io::Error::other(format!("DECAY: {e}"))),
        Err(env::VarError::NotPresent) => Ok(DecaySchedule::Linear {
            coefficient: 0.2,
            window: WARMUP_WINDOW,
        }),
        Err(e) => Err(io::Error::other(e)),
    }
}
