use std::sync::atomic::{AtomicBool, Ordering};

use anyhow::{Context, Result};
use nix::sys::signal::{signal, SigHandler, Signal};

/// Prints message to standard error and exits with code 1.
macro_rules! abort {
    ($($arg:tt)*) => ({
        eprint!("{}: ", env!("CARGO_PKG_NAME"));
        eprintln!($($arg)*);
        std::process::exit(1);
    })
}

mod body;
mod cgi;
mod config;
mod handler;
mod mime;
mod request;
mod response;
mod server;

use server::Server;

static RUNNING: AtomicBool = AtomicBool::new(true);

extern "C" fn stop_running(_signal: libc::c_int) {
    RUNNING.store(false, Ordering::Relaxed);
}

fn is_running() -> bool {
    RUNNING.load(Ordering::Relaxed)
}

fn usage(argv0: &str) {
    eprintln!(
        "usage:\t{} /path/to/config\n\n\
        Serves the server blocks declared in the configuration file until\n\
        interrupted. There are no flags.",
        argv0
    );
}

fn main() -> Result<()> {
    let args: Vec<String> = std::env::args().collect();
    if args.len() != 2 {
        usage(args.get(0).map(|s| s.as_str()).unwrap_or("oxhttpd"));
        std::process::exit(1);
    }

    println!("{}/{}", env!("CARGO_PKG_NAME"), env!("CARGO_PKG_VERSION"));

    let config = match config::load(&args[1]) {
        Ok(config) => config,
        Err(e) => abort!("{:#}", e),
    };

    // set signal handlers
    unsafe { signal(Signal::SIGPIPE, SigHandler::SigIgn) }
        .context("failed to set SIGPIPE handler")?;
    unsafe { signal(Signal::SIGINT, SigHandler::Handler(stop_running)) }
        .context("failed to set SIGINT handler")?;
    unsafe { signal(Signal::SIGTERM, SigHandler::Handler(stop_running)) }
        .context("failed to set SIGTERM handler")?;

    let mut server = match Server::new(config) {
        Ok(server) => server,
        Err(e) => abort!("{:#}", e),
    };

    // main loop
    while is_running() {
        server.poll();
    }

    // clean exit
    server.shutdown();
    Ok(())
}
