//! Shared helpers for split integration tests

#![allow(dead_code)]

use mbox_split::checkpoint::{Checkpoint, CheckpointStore};
use mbox_split::config::SplitConfig;
use mbox_split::mbox::BoundaryScanner;
use mbox_split::split::{ProgressSink, SplitController, SplitEvent};
use mbox_split::utils::RetryPolicy;
use mbox_split::SplitReport;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Records every event and cancels the run once message `cancel_at` is written
pub struct TestSink {
    events: Mutex<Vec<SplitEvent>>,
    cancel_at: Option<u64>,
    token: CancellationToken,
}

impl ProgressSink for TestSink {
    fn emit(&self, event: SplitEvent) {
        if let (Some(limit), SplitEvent::MessageWritten { index, .. }) = (self.cancel_at, &event) {
            if *index >= limit {
                self.token.cancel();
            }
        }
        self.events.lock().unwrap().push(event);
    }
}

/// Helper to build an mbox archive with `count` messages of varying size
pub fn build_mbox(count: usize) -> Vec<u8> {
    let mut out = Vec::new();

    for i in 0..count {
        out.extend_from_slice(
            format!("From sender{}@example.com Mon Jan  1 00:00:00 2024\n", i).as_bytes(),
        );
        out.extend_from_slice(
            format!("Subject: message {}\nMessage-ID: <{}@example.com>\n\n", i, i).as_bytes(),
        );
        for line in 0..(i % 4) {
            out.extend_from_slice(
                format!("Body line {} of message {}. From here on it continues.\n", line, i).as_bytes(),
            );
        }
        out.extend_from_slice(b">From an escaped line\n\n");
    }

    out
}

/// Helper to write an input archive into `dir`
pub fn write_input(dir: &Path, count: usize) -> PathBuf {
    let path = dir.join("archive.mbox");
    std::fs::write(&path, build_mbox(count)).unwrap();
    path
}

/// Helper to build a split config with quick retries
pub fn split_config(input: &Path, output: &Path, capacity: u64, interval: u64) -> SplitConfig {
    SplitConfig::new(input, output, capacity)
        .with_checkpoint_interval(interval)
        .with_retry(RetryPolicy {
            attempts: 2,
            initial_backoff: Duration::from_millis(1),
            max_backoff: Duration::from_millis(1),
        })
}

/// Helper to run a split, optionally cancelling after message `cancel_at`
pub async fn run_split(config: SplitConfig, cancel_at: Option<u64>) -> (SplitReport, Vec<SplitEvent>) {
    let token = CancellationToken::new();
    if cancel_at == Some(0) {
        token.cancel();
    }

    let sink = Arc::new(TestSink {
        events: Mutex::new(Vec::new()),
        cancel_at,
        token: token.clone(),
    });

    let mut controller = SplitController::new(config, sink.clone(), token);
    let report = controller.run().await;
    let events = sink.events.lock().unwrap().clone();

    (report, events)
}

/// Helper to read every part file of an output directory, keyed by name
pub fn read_parts(dir: &Path) -> BTreeMap<String, Vec<u8>> {
    std::fs::read_dir(dir)
        .unwrap()
        .flatten()
        .filter_map(|entry| {
            let name = entry.file_name().to_string_lossy().into_owned();
            if name.starts_with("part_") && name.ends_with(".mbox") {
                Some((name, std::fs::read(entry.path()).unwrap()))
            } else {
                None
            }
        })
        .collect()
}

/// Helper to count messages per part, in part order
pub async fn messages_per_part(dir: &Path) -> Vec<u64> {
    let mut counts = Vec::new();
    let mut index = 1;

    loop {
        let path = dir.join(format!("part_{}.mbox", index));
        if !path.exists() {
            break;
        }
        let bytes = std::fs::read(&path).unwrap();
        let mut scanner = BoundaryScanner::new(&bytes[..]);
        let mut count = 0;
        while scanner.next_message().await.unwrap().is_some() {
            count += 1;
        }
        counts.push(count);
        index += 1;
    }

    counts
}

/// Helper to load the stored checkpoint of an output directory
pub async fn stored_checkpoint(dir: &Path) -> Option<Checkpoint> {
    CheckpointStore::new(dir, RetryPolicy::default())
        .load()
        .await
        .unwrap()
}

/// Helper to concatenate all parts in part order
pub fn concatenated_parts(dir: &Path) -> Vec<u8> {
    let mut out = Vec::new();
    let mut index = 1;
    loop {
        let path = dir.join(format!("part_{}.mbox", index));
        if !path.exists() {
            break;
        }
        out.extend(std::fs::read(&path).unwrap());
        index += 1;
    }
    out
}
