// src/main.rs
//! `cache-cli`: a small operator tool for probing or clearing a compositor's disk
//! cache directory without spinning up the full compositor.

use std::panic;

use comp_cache::{CacheContext, CacheManager};
use log::{error, info, LevelFilter};

#[cfg(feature = "mimalloc")]
#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

fn main() {
    setup_diagnostics();

    let args: Vec<String> = std::env::args().collect();
    let exit_code = match std::panic::catch_unwind(|| run(&args)) {
        Ok(Ok(())) => 0,
        Ok(Err(e)) => {
            error!("cache-cli: {e}");
            1
        }
        Err(payload) => {
            error!("cache-cli panicked: {:?}", payload);
            1
        }
    };
    std::process::exit(exit_code);
}

fn run(args: &[String]) -> comp_cache::error::Result<()> {
    let (command, rest) = match args.get(1).map(String::as_str) {
        Some(cmd) => (cmd, &args[2..]),
        None => {
            print_usage();
            return Ok(());
        }
    };

    match command {
        "stat" => cmd_stat(rest),
        "clear" => cmd_clear(rest),
        other => {
            error!("unknown subcommand {other:?}");
            print_usage();
            Ok(())
        }
    }
}

fn print_usage() {
    eprintln!("usage: cache-cli <stat|clear> <disk-root>");
}

fn cmd_stat(args: &[String]) -> comp_cache::error::Result<()> {
    let Some(root) = args.first() else {
        print_usage();
        return Ok(());
    };
    let ctx = CacheContext {
        disk_root: root.into(),
        ..Default::default()
    };
    let mut mgr = CacheManager::new(0);
    mgr.initialize(&ctx)?;
    let stats = mgr.stats();
    info!(
        "memory: {} entries, {} bytes; disk: {} entries, {} bytes",
        stats.memory_entries, stats.memory_bytes, stats.disk_entries, stats.disk_bytes
    );
    println!(
        "disk_entries={} disk_bytes={}",
        stats.disk_entries, stats.disk_bytes
    );
    Ok(())
}

fn cmd_clear(args: &[String]) -> comp_cache::error::Result<()> {
    let Some(root) = args.first() else {
        print_usage();
        return Ok(());
    };
    let ctx = CacheContext {
        disk_root: root.into(),
        ..Default::default()
    };
    let mut mgr = CacheManager::new(0);
    mgr.initialize(&ctx)?;
    mgr.clear()?;
    info!("cleared disk cache under {root}");
    Ok(())
}

fn setup_diagnostics() {
    env_logger::Builder::new()
        .filter_level(if cfg!(debug_assertions) {
            LevelFilter::Debug
        } else {
            LevelFilter::Warn
        })
        .format_timestamp_millis()
        .format_target(false)
        .parse_default_env()
        .init();

    panic::set_hook(Box::new(|panic_info| {
        let msg = match panic_info.payload().downcast_ref::<&'static str>() {
            Some(s) => *s,
            None => match panic_info.payload().downcast_ref::<String>() {
                Some(s) => &s[..],
                None => "Box<dyn Any>",
            },
        };
        let location = panic_info
            .location()
            .map_or("unknown location".to_string(), |loc| format!("{}:{}", loc.file(), loc.line()));
        eprintln!("\x1b[31;1mcache-cli crashed: {msg} at {location}\x1b[0m");
    }));
}
