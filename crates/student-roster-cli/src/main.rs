use anyhow::Result;
use clap::Parser;

fn main() -> Result<()> {
    student_roster_cli::init_tracing();
    let cli = student_roster_cli::Cli::parse();
    student_roster_cli::run_cli(cli)
}
