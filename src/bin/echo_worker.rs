//! Echo worker process.
//!
//! Registers `com.redhat.Yggdrasil1.Worker1.echo` on the session bus (or
//! the bus chosen by flags/config) and echoes every dispatched message.
//!
//! ```text
//! echo-worker --loop 3 --sleep 0.5
//! echo-worker --config /etc/yggdrasil/echo.toml --bus system
//! ```

use std::process::ExitCode;

use clap::Parser;
use ygg_worker::{logging, DbusBus, EchoHandler, WorkerArgs, WorkerBuilder};

#[tokio::main]
async fn main() -> ExitCode {
    logging::init("info");

    let args = WorkerArgs::parse();
    match run(args).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!("{}", e);
            ExitCode::FAILURE
        }
    }
}

async fn run(args: WorkerArgs) -> ygg_worker::Result<()> {
    let config = args.resolve()?;
    let identity = config.identity()?;
    let handler = EchoHandler::from_settings(&config.echo)?;

    tracing::info!(
        worker = %identity,
        loop_count = handler.loop_count(),
        sleep = ?handler.sleep(),
        "Starting echo worker"
    );

    let bus = DbusBus::from_config(&config)?;
    let worker = WorkerBuilder::new(identity)
        .handler(handler)
        .config(&config)?
        .register(&bus)
        .await?;

    worker.run_until_shutdown().await
}
