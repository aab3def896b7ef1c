// Entrypoint for the CLI application.
// - Sets up logging (`RUST_LOG` wins over the default filter).
// - Loads the layered config and hands it to the menu loop.

use apitasks_cli::{config::Config, ui::main_menu};
use tracing_subscriber::EnvFilter;

fn main() -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("apitasks_cli=info,warn"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();

    let config = Config::load()?;

    // Blocks until the user picks "Exit".
    main_menu(config)?;
    Ok(())
}
