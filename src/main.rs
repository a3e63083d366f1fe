use std::io::{self, BufRead};
use std::process::ExitCode;

use anyhow::{bail, Context, Result};
use chrono::Local;
use log::{error, info, warn};

use miband_rs::prelude::*;

const USAGE: &str = "usage: miband <ADDRESS> <KEY_HEX> <fetch | heart | monitor <minutes> | monitor off>";

enum Command {
    Fetch,
    Heart,
    Monitor { enabled: bool, interval_minutes: u8 },
}

fn parse_command(args: &[String]) -> Result<Command> {
    match args {
        [cmd] if cmd == "fetch" => Ok(Command::Fetch),
        [cmd] if cmd == "heart" => Ok(Command::Heart),
        [cmd, arg] if cmd == "monitor" && arg == "off" => Ok(Command::Monitor {
            enabled: false,
            interval_minutes: 0,
        }),
        [cmd, arg] if cmd == "monitor" => {
            let interval_minutes = arg
                .parse::<u8>()
                .with_context(|| format!("invalid interval '{arg}'"))?;
            if interval_minutes == 0 {
                bail!("interval must be at least one minute (use 'monitor off' to disable)");
            }
            Ok(Command::Monitor {
                enabled: true,
                interval_minutes,
            })
        }
        _ => bail!("{USAGE}"),
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    // ── Logging ───────────────────────────────────────────────────────────────
    // Set RUST_LOG=debug for verbose output, e.g.:
    //   RUST_LOG=miband_rs=debug cargo run -- <ADDRESS> <KEY> fetch
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    match run().await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{e:#}");
            ExitCode::FAILURE
        }
    }
}

async fn run() -> Result<()> {
    let args: Vec<String> = std::env::args().skip(1).collect();
    let [address, key, rest @ ..] = args.as_slice() else {
        bail!("{USAGE}");
    };
    let command = parse_command(rest)?;
    let identity = DeviceIdentity::from_hex(address.as_str(), key)?;

    // ── Connect ───────────────────────────────────────────────────────────────
    let transport = BtleplugTransport::find(&identity.address, BtleplugConfig::default()).await?;
    info!("Connecting to {} …", transport.name());
    let session = Session::new(transport, identity, SessionConfig::default());
    session.connect().await?;

    let mut store = MemoryStore::new();
    let outcome = match command {
        Command::Fetch => fetch(&session, &mut store).await,
        Command::Heart => heart(&session, &mut store).await,
        Command::Monitor {
            enabled,
            interval_minutes,
        } => session
            .configure_background_monitor(enabled, interval_minutes)
            .await
            .map_err(Into::into),
    };

    if let Err(e) = session.disconnect().await {
        warn!("disconnect: {e}");
    }
    outcome
}

async fn fetch<T: Transport>(session: &Session<T>, store: &mut MemoryStore) -> Result<()> {
    let since = resume_point(
        store.last_activity_timestamp()?,
        Local::now().naive_local(),
    );
    let records = session.fetch_since(since).await?;
    store.insert_activity_records(&records)?;

    for record in store.all_activity_records()? {
        println!("{}", serde_json::to_string(&record)?);
    }
    info!("{} minute(s) of activity", records.len());
    Ok(())
}

async fn heart<T: Transport>(session: &Session<T>, store: &mut MemoryStore) -> Result<()> {
    let mut stream = session.start_heart_rate_stream().await?;
    info!("Streaming heart rate. Press Ctrl-C or type 'q' + Enter to stop.");

    // ── Stdin ─────────────────────────────────────────────────────────────────
    // Lines are read on a dedicated OS thread so the blocking StdinLock never
    // sits across an await point.
    let (quit_tx, mut quit_rx) = tokio::sync::mpsc::unbounded_channel::<()>();
    std::thread::spawn(move || {
        for line in io::stdin().lock().lines() {
            match line {
                Ok(l) if l.trim() == "q" => {
                    let _ = quit_tx.send(());
                    break;
                }
                Ok(_) => {}
                Err(_) => break,
            }
        }
    });

    let ended = loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break None,
            Some(()) = quit_rx.recv() => break None,
            sample = stream.next_sample() => match sample {
                Some(Ok(sample)) => {
                    store.insert_heart_beats(&[sample])?;
                    println!("{}", serde_json::to_string(&sample)?);
                }
                Some(Err(e)) => break Some(e),
                None => break None,
            },
        }
    };

    info!("Stopping heart-rate stream …");
    let stopped = stream.stop().await;
    info!("{} heart-beat sample(s) recorded", store.all_heart_beats()?.len());
    match ended {
        Some(e) => Err(e.into()),
        None => stopped.map_err(Into::into),
    }
}
