use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::sleep;
use std::time::Duration;
use tracing::{event, Level};
use warden::{daemon, sig};

#[derive(Parser, Debug)]
#[clap(version, about)]
struct Args {
    /// Daemon name, or an absolute pidfile path.
    #[clap(long)]
    name: String,

    /// File to write a greeting message to once the daemon is up.
    #[clap(long)]
    greeting_file: Option<PathBuf>,
}

static TERMINATED: AtomicBool = AtomicBool::new(false);

fn on_terminate(_signo: libc::c_int) {
    TERMINATED.store(true, Ordering::SeqCst);
}

fn main() -> Result<()> {
    tracing_subscriber::fmt().with_writer(std::io::stderr).init();
    let Args { name, greeting_file } = Args::parse();

    if let Err(e) = unsafe { daemon::init(Some(&name)) } {
        event!(Level::ERROR, "daemon initialisation failed ({e})");
        std::process::exit(1);
    }

    let result = main_loop(&greeting_file);
    daemon::close();
    if let Err(ref e) = result {
        event!(Level::ERROR, "{e}");
    }
    result
}

fn main_loop(greeting_file: &Option<PathBuf>) -> Result<()> {
    sig::set_handler(libc::SIGTERM, 0, on_terminate)?;

    let greeting = format!("test-daemon: running as pid {}", std::process::id());
    if let Some(filename) = greeting_file {
        std::fs::write(filename, greeting.as_bytes())
            .with_context(|| format!("could not write {}", filename.display()))?;
    }

    loop {
        sig::handle_all();
        if TERMINATED.load(Ordering::SeqCst) {
            return Ok(());
        }
        sleep(Duration::from_millis(100));
    }
}
