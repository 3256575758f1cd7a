use docwriter::cli;

#[tokio::main]
async fn main() {
    if let Err(e) = cli::run_main().await {
        cli::terminal::print_error(&format!("{}", e));
        std::process::exit(1);
    }
}
