use clap::Parser;

#[tokio::main]
async fn main() {
    let cli = splicecastctl::Cli::parse();
    splicecastctl::init_tracing(&cli.log_level);
    if let Err(err) = splicecastctl::run(cli).await {
        eprintln!("error: {err}");
        std::process::exit(1);
    }
}
