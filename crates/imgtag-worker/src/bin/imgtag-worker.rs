//! Worker entry point: builds a processor pool from a subprocess template,
//! connects to NATS, and runs a `Worker` until SIGINT.
//! CLI layout follows onefuzz-supervisor's `main.rs`: a single `Run`
//! surface, `env_logger::init()` up front, a manually constructed runtime.

use std::sync::Arc;

use anyhow::Result;
use clap::Parser;
use imgtag_bus::NatsBusFactory;
use imgtag_core::Processor;
use imgtag_nurse::{nurse, NurseConfig};
use imgtag_processor::{PooledProcessor, SubprocessProcessor};
use imgtag_worker::{Worker, WorkerConfig};
use tokio_util::sync::CancellationToken;

#[derive(Debug, Parser)]
#[command(name = "imgtag-worker")]
struct Opt {
    /// Node name this worker schedules jobs under.
    #[arg(short = 'w', long)]
    name: String,

    /// Number of subprocess instances to run concurrently.
    #[arg(long, default_value_t = 1)]
    pool_size: usize,

    /// Path to the processor subprocess executable.
    #[arg(long)]
    processor_exe: String,

    /// Extra arguments passed to each processor subprocess.
    #[arg(long, num_args = 0..)]
    processor_args: Vec<String>,

    #[arg(short = 'n', long, env = "NATS_URL", default_value = "nats://127.0.0.1:4222")]
    nats_url: String,
}

fn main() -> Result<()> {
    env_logger::init();

    let opt = Opt::parse();

    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(run(opt))
}

async fn run(opt: Opt) -> Result<()> {
    if opt.pool_size == 0 {
        anyhow::bail!("pool-size must be at least 1");
    }

    let global = CancellationToken::new();
    tokio::spawn({
        let global = global.clone();
        async move {
            let _ = tokio::signal::ctrl_c().await;
            log::info!("received ctrl-c, shutting down");
            global.cancel();
        }
    });

    let client = async_nats::connect(&opt.nats_url).await?;
    let bus_factory = Arc::new(NatsBusFactory::new(client));

    let mut processors: Vec<Arc<dyn Processor>> = Vec::with_capacity(opt.pool_size);
    for i in 0..opt.pool_size {
        let config = NurseConfig::new(opt.processor_exe.clone()).args(opt.processor_args.clone());
        let (child, handle) = nurse(config);
        tokio::spawn(child.run(global.clone()));
        log::debug!("started processor subprocess {i} of {}", opt.pool_size);
        processors.push(Arc::new(SubprocessProcessor::new(handle)));
    }
    let processor: Arc<dyn Processor> = Arc::new(PooledProcessor::new(processors));

    let worker = Worker::new(opt.name.clone(), bus_factory, processor, WorkerConfig::default());
    log::info!("worker {} starting with pool size {}", opt.name, opt.pool_size);

    worker.run(global).await?;

    log::info!("worker {} stopped", opt.name);
    Ok(())
}
