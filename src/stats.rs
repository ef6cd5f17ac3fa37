// Run counters shared between the command thread and the readout worker.
// Counters are lock-free atomics; the rolling buffer-occupancy samples sit
// behind a shared/exclusive lock (exclusive on push, shared on read).

use crate::config::HLT_REPORT_SLOTS;
use serde::Serialize;
use std::collections::{BTreeMap, VecDeque};
use std::fs::File;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::RwLock;

/// Upper bound on retained occupancy samples.
pub const BUFFER_SAMPLE_CAP: usize = 1000;

/// All counters for one run. Created at `conf` (the per-bit maps depend on
/// which triggers are enabled), reset at `start`, frozen after `stop`.
#[derive(Debug)]
pub struct RunCounters {
    /// HLT words observed across the run; monotone.
    pub total_hlt: AtomicU64,
    /// TS words observed; exchange-read by telemetry.
    pub ts_words: AtomicU64,
    pub run_hlt: AtomicU64,
    pub run_llt: AtomicU64,
    pub run_channel_status: AtomicU64,
    /// Reported in the run-trigger report's `Good Part` line.
    pub good_particles: AtomicU64,
    pub last_readout_hlt_timestamp: AtomicU64,
    pub last_sent_timestamp: AtomicU64,
    pub failed_sends: AtomicU64,
    // Per-bit maps: a slot exists iff the corresponding trigger is enabled
    // in the configuration. The map structure itself is immutable after
    // construction, so the values can be plain atomics.
    hlt_per_bit: BTreeMap<u32, AtomicU64>,
    llt_per_bit: BTreeMap<u32, AtomicU64>,
    buffer_counts: RwLock<VecDeque<u64>>,
}

impl RunCounters {
    pub fn new(
        hlt_bits: impl IntoIterator<Item = u32>,
        llt_bits: impl IntoIterator<Item = u32>,
    ) -> Self {
        RunCounters {
            total_hlt: AtomicU64::new(0),
            ts_words: AtomicU64::new(0),
            run_hlt: AtomicU64::new(0),
            run_llt: AtomicU64::new(0),
            run_channel_status: AtomicU64::new(0),
            good_particles: AtomicU64::new(0),
            last_readout_hlt_timestamp: AtomicU64::new(0),
            last_sent_timestamp: AtomicU64::new(0),
            failed_sends: AtomicU64::new(0),
            hlt_per_bit: hlt_bits.into_iter().map(|b| (b, AtomicU64::new(0))).collect(),
            llt_per_bit: llt_bits.into_iter().map(|b| (b, AtomicU64::new(0))).collect(),
            buffer_counts: RwLock::new(VecDeque::with_capacity(BUFFER_SAMPLE_CAP)),
        }
    }

    /// Zero everything at the start of a run.
    pub fn reset_for_run(&self) {
        self.total_hlt.store(0, Ordering::Relaxed);
        self.ts_words.store(0, Ordering::Relaxed);
        self.run_hlt.store(0, Ordering::Relaxed);
        self.run_llt.store(0, Ordering::Relaxed);
        self.run_channel_status.store(0, Ordering::Relaxed);
        self.good_particles.store(0, Ordering::Relaxed);
        self.last_readout_hlt_timestamp.store(0, Ordering::Relaxed);
        self.last_sent_timestamp.store(0, Ordering::Relaxed);
        self.failed_sends.store(0, Ordering::Relaxed);
        for counter in self.hlt_per_bit.values().chain(self.llt_per_bit.values()) {
            counter.store(0, Ordering::Relaxed);
        }
        if let Ok(mut counts) = self.buffer_counts.write() {
            counts.clear();
        }
    }

    /// Zero the per-run word counters after `stop`.
    pub fn reset_run_scoped(&self) {
        self.run_hlt.store(0, Ordering::Relaxed);
        self.run_llt.store(0, Ordering::Relaxed);
        self.run_channel_status.store(0, Ordering::Relaxed);
    }

    /// Increment the tracked per-bit HLT counters for every set bit.
    pub fn count_hlt_bits(&self, trigger_word: u64) {
        for (bit, counter) in &self.hlt_per_bit {
            if (trigger_word >> bit) & 0x1 == 0x1 {
                counter.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    pub fn count_llt_bits(&self, trigger_word: u64) {
        for (bit, counter) in &self.llt_per_bit {
            if (trigger_word >> bit) & 0x1 == 0x1 {
                counter.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    /// Record one packet's word count in the rolling occupancy window.
    pub fn record_buffer_count(&self, n_words: u64) {
        let Ok(mut counts) = self.buffer_counts.write() else {
            return;
        };
        if counts.len() >= BUFFER_SAMPLE_CAP {
            counts.pop_front();
        }
        counts.push_back(n_words);
    }

    pub fn average_buffer_count(&self) -> f64 {
        let Ok(counts) = self.buffer_counts.read() else {
            return 0.0;
        };
        if counts.is_empty() {
            return 0.0;
        }
        counts.iter().sum::<u64>() as f64 / counts.len() as f64
    }

    pub fn buffer_sample_len(&self) -> usize {
        self.buffer_counts.read().map(|c| c.len()).unwrap_or(0)
    }

    /// Current value of one per-bit HLT counter, if tracked.
    pub fn hlt_bit_count(&self, bit: u32) -> Option<u64> {
        self.hlt_per_bit.get(&bit).map(|c| c.load(Ordering::Relaxed))
    }

    pub fn llt_bit_count(&self, bit: u32) -> Option<u64> {
        self.llt_per_bit.get(&bit).map(|c| c.load(Ordering::Relaxed))
    }

    /// Snapshot for telemetry. Rate-like counters (per-bit maps, TS words)
    /// are exchange-zeroed so each collection reports a delta; monotone
    /// counters and timestamps are plain loads.
    pub fn collect(&self) -> CounterSnapshot {
        CounterSnapshot {
            total_hlt_count: self.total_hlt.load(Ordering::Relaxed),
            ts_word_count: self.ts_words.swap(0, Ordering::Relaxed),
            last_readout_timestamp: self.last_readout_hlt_timestamp.load(Ordering::Relaxed),
            last_sent_timestamp: self.last_sent_timestamp.load(Ordering::Relaxed),
            failed_to_send_counter: self.failed_sends.load(Ordering::Relaxed),
            average_buffer_occupancy: self.average_buffer_count(),
            hlt_counts: self
                .hlt_per_bit
                .iter()
                .map(|(bit, c)| (*bit, c.swap(0, Ordering::Relaxed)))
                .collect(),
            llt_counts: self
                .llt_per_bit
                .iter()
                .map(|(bit, c)| (*bit, c.swap(0, Ordering::Relaxed)))
                .collect(),
        }
    }
}

/// One telemetry collection of the counter set.
#[derive(Debug, Clone, Serialize)]
pub struct CounterSnapshot {
    pub total_hlt_count: u64,
    pub ts_word_count: u64,
    pub last_readout_timestamp: u64,
    pub last_sent_timestamp: u64,
    pub failed_to_send_counter: u64,
    pub average_buffer_occupancy: f64,
    pub hlt_counts: BTreeMap<u32, u64>,
    pub llt_counts: BTreeMap<u32, u64>,
}

/// Write the per-run trigger report to `<dir>/run_<N>_triggers.txt`.
pub fn write_run_trigger_report(
    dir: &Path,
    run_number: u32,
    counters: &RunCounters,
) -> io::Result<PathBuf> {
    let path = dir.join(format!("run_{run_number}_triggers.txt"));
    let mut out = File::create(&path)?;
    writeln!(out, "Good Part\t {}", counters.good_particles.load(Ordering::Relaxed))?;
    writeln!(out, "Total HLT\t {}", counters.run_hlt.load(Ordering::Relaxed))?;
    for bit in 0..HLT_REPORT_SLOTS as u32 {
        writeln!(out, "HLT {bit} \t {}", counters.hlt_bit_count(bit).unwrap_or(0))?;
    }
    Ok(path)
}
