// src/main.rs
mod config;
mod connection;
mod fetch;
mod http;
mod mcast;
mod net;
mod playlist;
mod pool;
mod routes;
mod rtp;
mod rtsp;
mod sendq;
mod service;
mod status;
mod stream;
mod supervisor;
mod util;
mod worker;

use log::error;

fn main() {
    let args = match config::parse_cli(std::env::args().skip(1)) {
        Ok(Some(args)) => args,
        Ok(None) => {
            print!("{}", config::USAGE);
            return;
        }
        Err(e) => {
            eprintln!("rtp2httpd: {e:#}");
            eprintln!("{}", config::USAGE);
            std::process::exit(2);
        }
    };

    // Logger before config load so file-parse warnings are visible. CLI
    // verbosity wins; RUST_LOG can still raise per-module detail.
    let level = match args.overrides.verbosity.unwrap_or(2) {
        0 => "off",
        1 => "error",
        2 => "info",
        3 => "debug",
        _ => "trace",
    };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level)).init();

    let cfg = match config::build(&args) {
        Ok(cfg) => cfg,
        Err(e) => {
            error!("configuration: {e:#}");
            std::process::exit(1);
        }
    };

    let sup = match supervisor::Supervisor::new(cfg, args) {
        Ok(s) => s,
        Err(e) => {
            error!("startup: {e:#}");
            std::process::exit(1);
        }
    };
    if let Err(e) = sup.run() {
        error!("fatal: {e:#}");
        std::process::exit(1);
    }
}
