use clap::Parser;
use om_harvester::cli;

#[tokio::main]
async fn main() {
    let args = cli::Args::parse();
    let code = match cli::dispatch(args).await {
        Ok(code) => code,
        Err(err) => {
            // Logging may not be up yet when configuration fails.
            eprintln!("error: {err:#}");
            cli::exit_code_for(&err)
        }
    };
    std::process::exit(code);
}
