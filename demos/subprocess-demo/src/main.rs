//! Interactive harness for a subprocess processor: spawns `argv[1..]` under
//! a `Nurse`, then reads urls from stdin one per line, printing the tags
//! or error each comes back with. Ctrl-C aborts the in-flight url without
//! killing the child; a blank line or EOF shuts the whole thing down.
//! Mirrors the original `demo-subprocess-processor` command.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use imgtag_core::Processor;
use imgtag_nurse::{nurse, NurseConfig};
use imgtag_processor::SubprocessProcessor;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

const PROCESS_TIMEOUT: Duration = Duration::from_secs(10);

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::init();

    let mut args = std::env::args().skip(1);
    let path = match args.next() {
        Some(path) => path,
        None => {
            println!("Usage: subprocess-demo command [args...]");
            return Ok(());
        }
    };
    let child_args: Vec<String> = args.collect();

    let global = CancellationToken::new();
    let (child, handle) = nurse(NurseConfig::new(path).args(child_args));
    let supervisor = tokio::spawn(child.run(global.clone()));
    let processor = SubprocessProcessor::new(handle);

    println!("Starting worker...");

    let current_task: Arc<Mutex<Option<CancellationToken>>> = Arc::new(Mutex::new(None));
    tokio::spawn({
        let current_task = current_task.clone();
        async move {
            loop {
                if tokio::signal::ctrl_c().await.is_err() {
                    break;
                }
                if let Some(token) = current_task.lock().await.as_ref() {
                    println!("Aborting task");
                    token.cancel();
                }
            }
        }
    });

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(url) = lines.next_line().await? {
        if url.is_empty() {
            println!("Terminating");
            break;
        }

        let local = CancellationToken::new();
        *current_task.lock().await = Some(local.clone());

        match processor.process(global.clone(), local, PROCESS_TIMEOUT, &url).await {
            Ok(tags) => {
                for tag in tags {
                    println!("{} {}", tag.name, tag.score);
                }
            }
            Err(err) => println!("Error: {err}"),
        }

        *current_task.lock().await = None;
    }

    global.cancel();
    let _ = supervisor.await;

    Ok(())
}
