use snssqs_relay::run_cli;
use tracing::error;

#[tokio::main]
async fn main() {
    if let Err(e) = run_cli().await {
        error!(error = %e, "snssqs-relay failed");
        eprintln!("Error: {}", e);
        std::process::exit(e.exit_code());
    }
}
