use crate::demo::{
    run_demo, run_dispatch, run_lien_deadlines, DemoArgs, DispatchArgs, LienDeadlineArgs,
};
use crate::server;
use clap::{Args, Parser, Subcommand};
use collectflow::error::AppError;

#[derive(Parser, Debug)]
#[command(
    name = "CollectFlow",
    about = "Run compliance-gated collection campaigns and lien deadline tracking",
    version
)]
struct Cli {
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Start the HTTP service (default command)
    Serve(ServeArgs),
    /// Run one dispatcher pass over seeded demo data
    Dispatch(DispatchArgs),
    /// Print mechanic's lien filing, preliminary notice and response deadlines
    LienDeadlines(LienDeadlineArgs),
    /// Simulate a reminder campaign against an in-memory store
    Demo(DemoArgs),
}

#[derive(Args, Debug, Default)]
pub(crate) struct ServeArgs {
    /// Override the configured host for the HTTP server
    #[arg(long)]
    pub(crate) host: Option<String>,
    /// Override the configured port for the HTTP server
    #[arg(long)]
    pub(crate) port: Option<u16>,
    /// Load a demo organization, sequence and overdue invoices at startup
    #[arg(long)]
    pub(crate) seed_demo: bool,
}

pub(crate) async fn run() -> Result<(), AppError> {
    let cli = Cli::parse();
    let command = cli
        .command
        .unwrap_or_else(|| Command::Serve(ServeArgs::default()));

    match command {
        Command::Serve(args) => server::run(args).await,
        Command::Dispatch(args) => run_dispatch(args).await,
        Command::LienDeadlines(args) => run_lien_deadlines(args),
        Command::Demo(args) => run_demo(args).await,
    }
}
