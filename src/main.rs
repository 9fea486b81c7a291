//! relaykv server binary.
//!
//! Parses the command line, starts the pipeline, and runs until SIGINT.

use relaykv::{Config, Server, NUM_SHARDS};
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

fn main() -> anyhow::Result<()> {
    let config = Config::from_args();

    FmtSubscriber::builder()
        .with_max_level(Level::INFO)
        .with_target(false)
        .init();

    print_banner(&config);

    let mut server = Server::bind(&config)?;
    info!(
        addr = %server.local_addr(),
        shards = NUM_SHARDS,
        "ready to accept connections; Ctrl+C to shut down"
    );

    let handle = server.handle();
    ctrlc::set_handler(move || handle.signal())?;

    server.run();

    let stats = server.stats();
    info!(
        connections = stats.connections_accepted,
        commands = stats.commands_processed,
        "server stopped"
    );
    Ok(())
}

fn print_banner(config: &Config) {
    println!(
        r#"
        ─────────────────────────────────────────────
          relaykv v{} - staged RESP key-value server
          listening on {}
        ─────────────────────────────────────────────
"#,
        relaykv::VERSION,
        config.bind_address()
    );
}
