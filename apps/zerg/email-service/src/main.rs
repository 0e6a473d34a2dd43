//! Email Events Service
//!
//! Binary entry point.

#[tokio::main]
async fn main() {
    if let Err(e) = zerg_email_service::run().await {
        eprintln!("Fatal error: {:#}", e);
        std::process::exit(1);
    }
}
