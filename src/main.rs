// Copyright 2025 Lablup Inc. and Jeongkyu Shin
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use std::io::{self, Write};

use clap::Parser;
use tokio::signal;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use nputop::cli::Cli;
use nputop::collector::SnapshotCollector;
use nputop::device::{
    create_backend, resolve_visible_devices, take_process_snapshots, take_snapshots,
    BackendSession, Device, DeviceSnapshot, HostProcessTable, ProcessSnapshot,
};
use nputop::utils::{bytes2human, utilization2string};
use nputop::{Error, Result};

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .with_writer(io::stderr)
        .init();

    let cli = Cli::parse();
    if let Err(e) = run(cli).await {
        eprintln!("Error: {e}");
        std::process::exit(1);
    }
}

async fn run(cli: Cli) -> Result<()> {
    let backend = create_backend(cli.backend.into(), cli.npu_smi_config())?;
    let session = BackendSession::new(backend);
    let _open = session.open()?;

    let devices = resolve_visible_devices(&session, cli.visible_devices.as_deref())?;
    info!(count = devices.len(), backend = %session.kind(), "devices resolved");
    if devices.is_empty() {
        eprintln!("No visible devices");
        return Ok(());
    }

    if cli.once {
        return print_once(&cli, devices).await;
    }

    let interval = cli.poll_interval();
    let collector = SnapshotCollector::devices(devices.clone(), interval);
    let processes = cli
        .processes
        .then(|| SnapshotCollector::processes(devices, interval));
    let mut updates = collector.subscribe();

    loop {
        tokio::select! {
            _ = signal::ctrl_c() => break,
            changed = updates.changed() => {
                if changed.is_err() {
                    break;
                }
                let latest = updates.borrow_and_update().clone();
                if let Some(snapshots) = latest {
                    let listed = processes.as_ref().and_then(|c| c.latest());
                    emit(&cli, &snapshots, listed.as_deref().map(Vec::as_slice))?;
                }
            }
        }
    }

    collector.stop().await;
    if let Some(processes) = processes {
        processes.stop().await;
    }
    Ok(())
}

async fn print_once(cli: &Cli, devices: Vec<Device>) -> Result<()> {
    let with_processes = cli.processes;
    let (snapshots, processes) = tokio::task::spawn_blocking(move || {
        let snapshots = take_snapshots(&devices);
        let processes = with_processes.then(|| {
            let mut host = HostProcessTable::new();
            take_process_snapshots(&devices, &mut host)
        });
        (snapshots, processes)
    })
    .await
    .map_err(|e| Error::Backend(format!("snapshot task failed: {e}")))?;

    emit(cli, &snapshots, processes.as_deref())
}

fn emit(
    cli: &Cli,
    snapshots: &[DeviceSnapshot],
    processes: Option<&[ProcessSnapshot]>,
) -> Result<()> {
    let stdout = io::stdout();
    let mut out = stdout.lock();
    if cli.json {
        let value = serde_json::json!({
            "devices": snapshots,
            "processes": processes,
        });
        let text = if cli.once {
            serde_json::to_string_pretty(&value)
        } else {
            serde_json::to_string(&value)
        }
        .map_err(|e| Error::Parse(e.to_string()))?;
        writeln!(out, "{text}")?;
    } else {
        write_table(&mut out, snapshots, processes)?;
    }
    out.flush()?;
    Ok(())
}

fn write_table(
    out: &mut impl Write,
    snapshots: &[DeviceSnapshot],
    processes: Option<&[ProcessSnapshot]>,
) -> io::Result<()> {
    if let Some(first) = snapshots.first() {
        writeln!(out, "{}", first.timestamp.format("%Y-%m-%d %H:%M:%S"))?;
    }
    writeln!(
        out,
        "{:>3}  {:<22} {:<8} {:>22} {:>6} {:>6} {:>5} {:>17}",
        "#", "Name", "Health", "Memory", "Mem%", "Util", "Temp", "Power"
    )?;
    for snapshot in snapshots {
        if snapshot.is_lost {
            warn!(index = snapshot.index, "device is lost");
        }
        writeln!(
            out,
            "{:>3}  {:<22} {:<8} {:>22} {:>6} {:>6} {:>5} {:>17}",
            snapshot.index,
            snapshot.name.to_string(),
            snapshot.health.to_string(),
            format!("{} / {}", snapshot.memory_used_human, snapshot.memory_total_human),
            utilization2string(snapshot.memory_percent),
            utilization2string(snapshot.compute_utilization()),
            snapshot.temperature.map(|t| format!("{t}C")).to_string(),
            snapshot.power_status,
        )?;
    }

    if let Some(processes) = processes {
        writeln!(out)?;
        writeln!(
            out,
            "{:>3} {:>8} {:>4} {:>10} {:<10} {}",
            "#", "PID", "Type", "Memory", "User", "Command"
        )?;
        if processes.is_empty() {
            writeln!(out, "    No running processes found")?;
        }
        for process in processes {
            let (user, command) = match &process.host {
                Some(host) => (host.user.clone(), host.command.clone()),
                None => (
                    "N/A".to_string(),
                    process
                        .process
                        .name
                        .clone()
                        .unwrap_or_else(|| "No Such Process".to_string()),
                ),
            };
            writeln!(
                out,
                "{:>3} {:>8} {:>4} {:>10} {:<10} {}",
                process.process.device_index,
                process.process.pid,
                process.process.context_type(),
                bytes2human(process.process.memory_used),
                user,
                command,
            )?;
        }
    }
    writeln!(out)
}
