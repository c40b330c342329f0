use anyhow::Result;
use clap::Parser;
use std::process::Command;
use warden::Supervisor;

#[derive(Parser, Debug)]
#[clap(version, about)]
struct Args {
    #[clap(flatten)]
    supervisor: Supervisor,

    /// Client command and arguments.
    #[clap(required = true)]
    command: Vec<String>,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt().with_writer(std::io::stderr).init();
    let Args { supervisor, command } = Args::parse();

    let mut client = Command::new(&command[0]);
    client.args(&command[1..]);
    unsafe { supervisor.run(client) }
}
