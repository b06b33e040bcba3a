use std::sync::Arc;

use log::*;

use veles::config;
use veles::net::Server;
use veles::storage::Storage;

fn setup_logger() {
    if std::env::var("RUST_LOG").is_err() {
        std::env::set_var("RUST_LOG", concat!(env!("CARGO_PKG_NAME"), "=debug"));
    }
    env_logger::init();
}

fn print_usage() {
    eprintln!("usage: veles config_file_path");
}

fn main() {
    setup_logger();

    let mut args = std::env::args().skip(1);
    let config_path = match (args.next(), args.next()) {
        (Some(path), None) => path,
        _ => {
            print_usage();
            std::process::exit(1);
        }
    };

    let cfg = config::load_config(&config_path).unwrap_or_else(|e| {
        eprintln!("failed to read config {}: {}", config_path, e);
        std::process::exit(1);
    });
    let cfg = Arc::new(cfg);
    info!("config loaded from {}", config_path);

    // Opened up front so a bad data dir fails the process before we start
    // accepting traffic. The replication layer will drive deliver() calls.
    let _storage = Storage::open(&cfg.data_dir).unwrap_or_else(|e| {
        eprintln!("failed to open storage: {}", e);
        std::process::exit(1);
    });

    let server = Server::new(cfg).unwrap_or_else(|e| {
        eprintln!("failed to start server: {}", e);
        std::process::exit(1);
    });

    let shutdown = server.shutdown_handle();
    ctrlc::set_handler(move || {
        info!("termination signal received; shutting down");
        shutdown.shutdown();
    })
    .unwrap_or_else(|e| {
        eprintln!("failed to install signal handler: {}", e);
        std::process::exit(1);
    });

    let dispatch_thread = std::thread::Builder::new()
        .name("dispatch".into())
        .spawn(move || server.run())
        .unwrap_or_else(|e| {
            eprintln!("failed to spawn dispatch thread: {}", e);
            std::process::exit(1);
        });

    // Fail fast on unexpected internal errors: a dispatch loop fault ends
    // the process with a non-zero exit code for the supervisor to restart.
    match dispatch_thread.join() {
        Ok(Ok(())) => info!("Goodbye."),
        Ok(Err(e)) => {
            error!("dispatch loop failed: {}", e);
            std::process::exit(1);
        }
        Err(_) => {
            error!("dispatch thread panicked");
            std::process::exit(1);
        }
    }
}
