//! Manager entry point: resolves the authorizer, connects to Postgres and
//! NATS, and runs a `Manager` until SIGINT. Flags and
//! env overrides mirror the original `cmd/manager`: `-a/--authorizer-url`,
//! `-d/--database-url`, `-n/--nats-url`.

use std::sync::Arc;

use anyhow::Result;
use clap::Parser;
use imgtag_auth::{Authorizer, HttpAuthorizer, NoopAuthorizer};
use imgtag_bus::{NatsBusFactory, PgStorage};
use imgtag_manager::{Manager, ManagerConfig};
use sqlx::postgres::PgPoolOptions;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Parser)]
#[command(name = "imgtag-manager")]
struct Opt {
    /// Authorizer HTTP endpoint. Empty or unset resolves every credential
    /// to anonymous.
    #[arg(short = 'a', long, env = "AUTHORIZER_URL", default_value = "")]
    authorizer_url: String,

    #[arg(short = 'd', long, env = "DATABASE_URL")]
    database_url: String,

    #[arg(short = 'n', long, env = "NATS_URL", default_value = "nats://127.0.0.1:4222")]
    nats_url: String,
}

fn main() -> Result<()> {
    env_logger::init();

    let opt = Opt::parse();

    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(run(opt))
}

fn authorizer(url: &str) -> Arc<dyn Authorizer> {
    if url.is_empty() {
        Arc::new(NoopAuthorizer)
    } else {
        Arc::new(HttpAuthorizer::new(url.to_string()))
    }
}

async fn run(opt: Opt) -> Result<()> {
    let authorizer = authorizer(&opt.authorizer_url);

    let pool = PgPoolOptions::new().connect(&opt.database_url).await?;
    let storage = Arc::new(PgStorage::new(pool));

    let client = async_nats::connect(&opt.nats_url).await?;
    let bus_factory = Arc::new(NatsBusFactory::new(client));

    let global = CancellationToken::new();
    tokio::spawn({
        let global = global.clone();
        async move {
            let _ = tokio::signal::ctrl_c().await;
            log::info!("received ctrl-c, shutting down");
            global.cancel();
        }
    });

    let manager = Manager::new(bus_factory, storage, authorizer, ManagerConfig::default());
    log::info!("manager starting");

    manager.run(global).await?;

    log::info!("manager stopped");
    Ok(())
}
