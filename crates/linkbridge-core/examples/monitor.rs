//! Find a device, then echo its lines while a fixed-rate loop polls the link.
//!
//! Usage: cargo run --example monitor -- [config.json]
//!
//! Set RUST_LOG=linkbridge_core=debug to watch the worker's state changes.

use linkbridge_core::prelude::*;
use std::time::{Duration, Instant};
use tracing_subscriber::EnvFilter;

const FRAME: Duration = Duration::from_millis(16);

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let config = match std::env::args().nth(1) {
        Some(path) => LinkConfig::load(path)?,
        None => LinkConfig::default(),
    };

    let mut link = Controller::new(config)?;
    link.on_connected(|| println!("-- connected"));
    link.on_disconnected(|| println!("-- lost device, reconnecting"));
    link.on_message(|line| println!("<< {line}"));

    let farewell = link.outbound_sender();
    link.set_teardown_hook(move || {
        farewell.send("bye");
        Ok(())
    });

    println!("searching for a device...");
    link.connect()?;
    println!("found {}", link.port_name().unwrap_or("?"));

    let started = Instant::now();
    let mut frames: u64 = 0;
    while started.elapsed() < Duration::from_secs(30) {
        link.poll();
        if frames % 60 == 0 {
            link.send(format!("tick {}", frames / 60));
        }
        frames += 1;
        std::thread::sleep(FRAME);
    }

    println!("dropped {} lines while busy", link.dropped_messages());
    link.disconnect();
    Ok(())
}
