// Copyright 2024 GarnetFS Team
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

//! Per-target bandwidth accounting for replication transfers. Uploads are
//! streamed through a monitored reader; operators read the observed
//! throughput per ARN. Throttled transfers run under a long deadline so
//! large objects still complete.

use std::collections::HashMap;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock, RwLock};
use std::task::{Context, Poll};
use std::time::{Duration, Instant};
use tokio::io::{AsyncRead, ReadBuf};

/// Deadline applied to bandwidth-throttled replication transfers.
pub const THROTTLE_DEADLINE: Duration = Duration::from_secs(60 * 60);

#[derive(Debug)]
struct TargetMeasurement {
    bytes_since_start: AtomicU64,
    started: Instant,
}

/// Observed replication throughput for one target ARN.
#[derive(Debug, Clone, Default)]
pub struct BandwidthDetails {
    pub total_bytes: u64,
    pub avg_bytes_per_sec: f64,
}

#[derive(Debug, Default)]
pub struct BandwidthMonitor {
    targets: RwLock<HashMap<String, Arc<TargetMeasurement>>>,
}

impl BandwidthMonitor {
    pub fn global() -> &'static BandwidthMonitor {
        static MONITOR: OnceLock<BandwidthMonitor> = OnceLock::new();
        MONITOR.get_or_init(BandwidthMonitor::default)
    }

    fn measurement(&self, arn: &str) -> Arc<TargetMeasurement> {
        if let Ok(targets) = self.targets.read() {
            if let Some(m) = targets.get(arn) {
                return m.clone();
            }
        }
        let m = Arc::new(TargetMeasurement {
            bytes_since_start: AtomicU64::new(0),
            started: Instant::now(),
        });
        if let Ok(mut targets) = self.targets.write() {
            targets.entry(arn.to_string()).or_insert_with(|| m.clone()).clone()
        } else {
            m
        }
    }

    pub fn track(&self, arn: &str, bytes: u64) {
        self.measurement(arn).bytes_since_start.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn details(&self, arn: &str) -> BandwidthDetails {
        let m = self.measurement(arn);
        let total = m.bytes_since_start.load(Ordering::Relaxed);
        let elapsed = m.started.elapsed().as_secs_f64().max(1e-3);
        BandwidthDetails {
            total_bytes: total,
            avg_bytes_per_sec: total as f64 / elapsed,
        }
    }

    pub fn delete_target(&self, arn: &str) {
        if let Ok(mut targets) = self.targets.write() {
            targets.remove(arn);
        }
    }
}

/// AsyncRead wrapper that accounts every byte against a target ARN.
pub struct MonitoredReader<R> {
    inner: R,
    arn: String,
}

impl<R> MonitoredReader<R> {
    pub fn new(inner: R, arn: &str) -> Self {
        Self {
            inner,
            arn: arn.to_string(),
        }
    }
}

impl<R: AsyncRead + Unpin> AsyncRead for MonitoredReader<R> {
    fn poll_read(mut self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &mut ReadBuf<'_>) -> Poll<std::io::Result<()>> {
        let before = buf.filled().len();
        let res = Pin::new(&mut self.inner).poll_read(cx, buf);
        if let Poll::Ready(Ok(())) = &res {
            let n = buf.filled().len() - before;
            if n > 0 {
                BandwidthMonitor::global().track(&self.arn, n as u64);
            }
        }
        res
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncReadExt;

    #[tokio::test]
    async fn test_monitored_reader_accounts_bytes() {
        let payload = vec![1u8; 4096];
        let mut reader = MonitoredReader::new(std::io::Cursor::new(payload.clone()), "arn:bw-test");
        let mut out = Vec::new();
        reader.read_to_end(&mut out).await.unwrap();
        assert_eq!(out, payload);

        let details = BandwidthMonitor::global().details("arn:bw-test");
        assert!(details.total_bytes >= 4096);
        BandwidthMonitor::global().delete_target("arn:bw-test");
    }
}
