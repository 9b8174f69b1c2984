//! Thin binary wiring configuration, logging, and a downstream pipeline
//! stand-in onto `netmap-capture`. Production deployments replace
//! `pipeline::BoundedPool`/`PassthroughSink` with the real detection
//! engine's pool and receive-module registration (§6).

mod cli;
mod pipeline;

use std::fs;
use std::sync::Arc;
use std::thread;

use anyhow::{Context, Result};
use clap::Parser;

use netmap_capture::config::CaptureConfig;
use netmap_capture::registry::DeviceRegistry;
use netmap_capture::stats::NullCounters;
use netmap_capture::{CaptureThreadConfig, CaptureThreadState, PacketPool, ShutdownFlag};

use cli::Cli;
use pipeline::{BoundedPool, PassthroughSink};

const POOL_CAPACITY: usize = 64;

fn main() -> Result<()> {
    let cli = Cli::parse();

    let raw = fs::read_to_string(&cli.config)
        .with_context(|| format!("reading config file {:?}", cli.config))?;
    let config = CaptureConfig::from_toml_str(&raw)
        .with_context(|| format!("parsing config file {:?}", cli.config))?;

    let log_level = cli.log_level.unwrap_or_else(|| config.log_level.clone());
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(log_level)).init();

    if config.bpf_filter.is_some() {
        log::warn!("bpf_filter is configured but filter compilation is out of scope; ignoring");
    }

    let registry = Arc::new(DeviceRegistry::new());
    let shutdown = Arc::new(ShutdownFlag::new());

    let mut handles = Vec::with_capacity(config.threads);
    for thread_id in 0..config.threads {
        let registry = Arc::clone(&registry);
        let shutdown = Arc::clone(&shutdown);
        let config = config.clone();

        let handle = thread::Builder::new()
            .name(format!("capture-{thread_id}"))
            .spawn(move || -> Result<()> {
                let thread_cfg = CaptureThreadConfig {
                    iface: &config.iface,
                    out_iface: config.out_iface.as_deref(),
                    thread_count: config.threads,
                    promisc: config.promisc,
                    copy_mode: config.copy_mode,
                    checksum_mode: config.checksum_mode,
                    checksum_policy: config.checksum_auto_policy(),
                    bpf: None,
                    workers_run_mode: true,
                    verbose: true,
                };

                let mut state = CaptureThreadState::init(&registry, &thread_cfg, &NullCounters)
                    .context("initializing capture thread")?;

                let pool: Arc<dyn PacketPool> = Arc::new(BoundedPool::new(POOL_CAPACITY));
                let sink = PassthroughSink::new(Arc::clone(&pool));
                state.run(&shutdown, pool.as_ref(), &sink);
                state.deinit(&registry).context("releasing capture devices")?;
                Ok(())
            })
            .context("spawning capture thread")?;
        handles.push(handle);
    }

    for handle in handles {
        handle.join().expect("capture thread panicked")?;
    }
    Ok(())
}
