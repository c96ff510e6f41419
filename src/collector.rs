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

//! Background pollers that publish immutable snapshots.
//!
//! Each collector owns one tokio task with its own interval. Backend calls
//! are synchronous, so every tick runs on the blocking pool; the result is
//! published through a `watch` channel that any number of consumers read.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, warn};

use crate::device::process::{take_process_snapshots, HostProcessTable, ProcessSnapshot};
use crate::device::snapshot::{take_snapshots, DeviceSnapshot};
use crate::device::Device;
use crate::utils::lock_or_recover;

pub struct SnapshotCollector<T = Vec<DeviceSnapshot>> {
    receiver: watch::Receiver<Option<Arc<T>>>,
    stop: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

impl SnapshotCollector<Vec<DeviceSnapshot>> {
    /// Publish a snapshot of every device each `interval`.
    pub fn devices(devices: Vec<Device>, interval: Duration) -> Self {
        Self::spawn("devices", devices, interval, take_snapshots)
    }
}

impl SnapshotCollector<Vec<ProcessSnapshot>> {
    /// Publish the processes on every device, joined with host info.
    pub fn processes(devices: Vec<Device>, interval: Duration) -> Self {
        let mut host = HostProcessTable::new();
        Self::spawn("processes", devices, interval, move |devices| {
            take_process_snapshots(devices, &mut host)
        })
    }
}

impl<T: Send + Sync + 'static> SnapshotCollector<T> {
    pub fn spawn<F>(name: &'static str, devices: Vec<Device>, interval: Duration, job: F) -> Self
    where
        F: FnMut(&[Device]) -> T + Send + 'static,
    {
        let (sender, receiver) = watch::channel(None);
        let (stop, mut stopped) = watch::channel(false);
        let devices = Arc::new(devices);
        let job = Arc::new(Mutex::new(job));

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {}
                    changed = stopped.changed() => {
                        if changed.is_err() || *stopped.borrow() {
                            break;
                        }
                    }
                }
                if *stopped.borrow() {
                    break;
                }

                let devices = devices.clone();
                let job = job.clone();
                let result = tokio::task::spawn_blocking(move || {
                    let mut job = lock_or_recover(&job);
                    (*job)(&devices)
                })
                .await;
                match result {
                    Ok(value) => {
                        sender.send_replace(Some(Arc::new(value)));
                    }
                    Err(e) => warn!(collector = name, "collection task failed: {e}"),
                }
            }
            debug!(collector = name, "collector stopped");
        });

        Self {
            receiver,
            stop,
            handle,
        }
    }

    pub fn subscribe(&self) -> watch::Receiver<Option<Arc<T>>> {
        self.receiver.clone()
    }

    /// Most recently published value, if any tick has completed.
    pub fn latest(&self) -> Option<Arc<T>> {
        self.receiver.borrow().clone()
    }

    /// Stop at the next tick boundary and wait for the task to finish.
    pub async fn stop(self) {
        let _ = self.stop.send(true);
        if let Err(e) = self.handle.await {
            warn!("collector task ended abnormally: {e}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::session::BackendSession;
    use crate::device::testing::FakeBackend;

    fn devices(count: u32) -> (Arc<FakeBackend>, Vec<Device>) {
        let fake = Arc::new(FakeBackend::with_devices(count));
        let session = BackendSession::new(fake.clone());
        let devices = Device::all(&session).unwrap();
        (fake, devices)
    }

    #[tokio::test]
    async fn test_publishes_snapshots() {
        let (_fake, devices) = devices(2);
        let collector = SnapshotCollector::devices(devices.clone(), Duration::from_millis(20));
        let mut updates = collector.subscribe();

        updates.changed().await.unwrap();
        let latest = collector.latest().unwrap();
        assert_eq!(latest.len(), 2);
        assert_eq!(latest[1].index, 1);
        assert!(latest[0].memory_total.is_value());

        collector.stop().await;
        assert!(devices.iter().all(|d| !d.in_oneshot()));
    }

    #[tokio::test]
    async fn test_stop_before_first_publish_is_clean() {
        let (_fake, devices) = devices(1);
        let collector =
            SnapshotCollector::spawn("noop", devices, Duration::from_secs(60), |d| d.len());
        collector.stop().await;
    }

    #[tokio::test]
    async fn test_each_tick_reads_fresh_values() {
        let (fake, devices) = devices(1);
        let collector = SnapshotCollector::devices(devices, Duration::from_millis(10));
        let mut updates = collector.subscribe();
        updates.changed().await.unwrap();
        updates.changed().await.unwrap();
        collector.stop().await;
        assert!(fake.calls("memory_info") >= 2);
    }
}
