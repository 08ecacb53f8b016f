use clap::Parser;
use hc_spin::cli::{run, Cli};
use hc_spin::telemetry::init_logging;

fn main() {
    let cli = Cli::parse();
    init_logging();
    match run(cli) {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            tracing::error!(error = %err, "hc-spin failed");
            std::process::exit(err.exit_code());
        }
    }
}
