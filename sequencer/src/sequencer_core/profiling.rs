// (c) Cartesi and individual authors (see AUTHORS)
// SPDX-License-Identifier: Apache-2.0 (see LICENSE)

use std::time::{Duration, Instant};
use tracing::info;

#[derive(Debug)]
pub(super) struct SequencerCoreMetrics {
    enabled: bool,
    log_interval: Duration,
    window_started_at: Instant,
    loops: u64,
    sequenced: u64,
    ingested_blocks: u64,
    duplicate_blocks: u64,
    buffered_blocks: u64,
    rejected: u64,
    storage_failures: u64,
    idle_sleeps: u64,
    max_queue_depth: usize,
    sequence_phase: Duration,
    block_phase: Duration,
    idle_sleep: Duration,
}

impl SequencerCoreMetrics {
    pub(super) fn new(enabled: bool, log_interval: Duration) -> Self {
        Self {
            enabled,
            log_interval,
            window_started_at: Instant::now(),
            loops: 0,
            sequenced: 0,
            ingested_blocks: 0,
            duplicate_blocks: 0,
            buffered_blocks: 0,
            rejected: 0,
            storage_failures: 0,
            idle_sleeps: 0,
            max_queue_depth: 0,
            sequence_phase: Duration::ZERO,
            block_phase: Duration::ZERO,
            idle_sleep: Duration::ZERO,
        }
    }

    pub(super) fn phase_started_at(&self) -> Option<Instant> {
        self.enabled.then(Instant::now)
    }

    pub(super) fn on_loop_start(&mut self, queue_depth: usize) {
        if !self.enabled {
            return;
        }
        self.loops = self.loops.saturating_add(1);
        self.max_queue_depth = self.max_queue_depth.max(queue_depth);
    }

    pub(super) fn on_sequence_phase_end(&mut self, started_at: Option<Instant>) {
        if !self.enabled {
            return;
        }
        self.sequence_phase = self
            .sequence_phase
            .saturating_add(elapsed_or_zero(started_at));
    }

    pub(super) fn on_block_phase_end(&mut self, started_at: Option<Instant>) {
        if !self.enabled {
            return;
        }
        self.block_phase = self
            .block_phase
            .saturating_add(elapsed_or_zero(started_at));
    }

    pub(super) fn on_sequenced(&mut self) {
        if self.enabled {
            self.sequenced = self.sequenced.saturating_add(1);
        }
    }

    pub(super) fn on_block_ingested(&mut self) {
        if self.enabled {
            self.ingested_blocks = self.ingested_blocks.saturating_add(1);
        }
    }

    pub(super) fn on_duplicate_block(&mut self) {
        if self.enabled {
            self.duplicate_blocks = self.duplicate_blocks.saturating_add(1);
        }
    }

    pub(super) fn on_block_buffered(&mut self) {
        if self.enabled {
            self.buffered_blocks = self.buffered_blocks.saturating_add(1);
        }
    }

    pub(super) fn on_rejected(&mut self) {
        if self.enabled {
            self.rejected = self.rejected.saturating_add(1);
        }
    }

    pub(super) fn on_storage_failure(&mut self) {
        if self.enabled {
            self.storage_failures = self.storage_failures.saturating_add(1);
        }
    }

    pub(super) fn on_idle_sleep_end(&mut self, started_at: Option<Instant>) {
        if !self.enabled {
            return;
        }
        self.idle_sleeps = self.idle_sleeps.saturating_add(1);
        self.idle_sleep = self.idle_sleep.saturating_add(elapsed_or_zero(started_at));
    }

    pub(super) fn maybe_log_window(&mut self, tip_height: u64, pending_blocks: usize) {
        if !self.enabled {
            return;
        }
        let elapsed = self.window_started_at.elapsed();
        if elapsed < self.log_interval {
            return;
        }
        self.log_window(elapsed, false, tip_height, pending_blocks);
        self.reset_window();
    }

    pub(super) fn log_final(&mut self, tip_height: u64, pending_blocks: usize) {
        if !self.enabled {
            return;
        }
        let elapsed = self.window_started_at.elapsed();
        if elapsed.is_zero() && self.loops == 0 {
            return;
        }
        self.log_window(elapsed, true, tip_height, pending_blocks);
    }

    fn log_window(
        &self,
        elapsed: Duration,
        final_window: bool,
        tip_height: u64,
        pending_blocks: usize,
    ) {
        let elapsed_secs = elapsed.as_secs_f64();
        let blocks_per_sec = if elapsed_secs > 0.0 {
            self.sequenced.saturating_add(self.ingested_blocks) as f64 / elapsed_secs
        } else {
            0.0
        };
        info!(
            final_window,
            window_ms = elapsed.as_millis() as u64,
            loops = self.loops,
            tip_height,
            pending_blocks,
            sequenced = self.sequenced,
            ingested_blocks = self.ingested_blocks,
            duplicate_blocks = self.duplicate_blocks,
            buffered_blocks = self.buffered_blocks,
            rejected = self.rejected,
            storage_failures = self.storage_failures,
            blocks_per_sec,
            idle_sleeps = self.idle_sleeps,
            max_queue_depth = self.max_queue_depth,
            sequence_phase_ms = self.sequence_phase.as_millis() as u64,
            block_phase_ms = self.block_phase.as_millis() as u64,
            idle_sleep_ms = self.idle_sleep.as_millis() as u64,
            "sequencer core metrics"
        );
    }

    fn reset_window(&mut self) {
        self.window_started_at = Instant::now();
        self.loops = 0;
        self.sequenced = 0;
        self.ingested_blocks = 0;
        self.duplicate_blocks = 0;
        self.buffered_blocks = 0;
        self.rejected = 0;
        self.storage_failures = 0;
        self.idle_sleeps = 0;
        self.max_queue_depth = 0;
        self.sequence_phase = Duration::ZERO;
        self.block_phase = Duration::ZERO;
        self.idle_sleep = Duration::ZERO;
    }
}

fn elapsed_or_zero(started_at: Option<Instant>) -> Duration {
    started_at.map_or(Duration::ZERO, |value| value.elapsed())
}
