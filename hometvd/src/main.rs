use clap::Parser;

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();
    let cli = hometvd::Cli::parse();
    if let Err(err) = hometvd::run(cli).await {
        eprintln!("error: {err}");
        std::process::exit(1);
    }
}
