// otasync entry point

use clap::Parser;
use otasync_cli::{commands, logging, output::OutputStyle, Cli};

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    logging::init_logging(cli.verbose, cli.quiet);

    if let Err(e) = commands::execute(cli).await {
        eprintln!("{}", OutputStyle::default().error(&format!("{:#}", e)));
        std::process::exit(1);
    }
}
