//! Schedule of the windowed metric adaptation during warmup.
//!
//! Warmup is split into an initial fast buffer where only the step size is
//! adapted, a series of slow windows of doubling size at whose ends the
//! metric is re-estimated, and a terminal fast buffer.

use serde::{Deserialize, Serialize};
use tracing::warn;

/// Widths of the adaptation windows.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WindowOptions {
    pub init_buffer: u64,
    pub term_buffer: u64,
    /// Size of the first slow window.
    pub window: u64,
}

impl Default for WindowOptions {
    fn default() -> Self {
        Self {
            init_buffer: 75,
            term_buffer: 50,
            window: 25,
        }
    }
}

/// What to do with the metric in one warmup iteration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WindowStep {
    /// Outside a slow window.
    Skip,
    /// Add the draw to the metric estimate.
    Collect,
    /// Add the draw, then update the metric and restart the estimate.
    CollectAndUpdate,
}

#[derive(Debug, Clone)]
pub struct WindowSchedule {
    num_warmup: u64,
    init_buffer: u64,
    term_buffer: u64,
    counter: u64,
    window_size: u64,
    next_window: u64,
    enabled: bool,
}

impl WindowSchedule {
    /// A schedule that never adapts the metric.
    pub fn disabled(num_warmup: u64) -> Self {
        Self {
            num_warmup,
            init_buffer: 0,
            term_buffer: 0,
            counter: 0,
            window_size: 0,
            next_window: 0,
            enabled: false,
        }
    }

    pub fn new(options: WindowOptions, num_warmup: u64, chain: usize) -> Self {
        if num_warmup < 20 {
            warn!(
                chain,
                num_warmup, "No metric adaptation will be performed, warmup is shorter than 20 iterations"
            );
            return Self::disabled(num_warmup);
        }

        let WindowOptions {
            mut init_buffer,
            mut term_buffer,
            window: mut base_window,
        } = options;

        if init_buffer + base_window + term_buffer > num_warmup {
            init_buffer = (0.15 * num_warmup as f64) as u64;
            term_buffer = (0.1 * num_warmup as f64) as u64;
            base_window = num_warmup - (init_buffer + term_buffer);
            warn!(
                chain,
                num_warmup,
                init_buffer,
                window = base_window,
                term_buffer,
                "Adaptation windows exceed the number of warmup iterations, \
                 using 15% / 75% / 10% of warmup instead"
            );
        }

        Self {
            num_warmup,
            init_buffer,
            term_buffer,
            counter: 0,
            window_size: base_window,
            next_window: init_buffer + base_window - 1,
            enabled: true,
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Index of the last iteration of the final slow window.
    fn last_window_end(&self) -> u64 {
        self.num_warmup - self.term_buffer - 1
    }

    fn in_window(&self) -> bool {
        self.counter >= self.init_buffer
            && self.counter < self.num_warmup - self.term_buffer
            && self.counter != self.num_warmup
    }

    fn end_of_window(&self) -> bool {
        self.counter == self.next_window && self.counter != self.num_warmup
    }

    fn compute_next_window(&mut self) {
        if self.next_window == self.last_window_end() {
            return;
        }
        self.window_size *= 2;
        self.next_window = self.counter + self.window_size;
        if self.next_window != self.last_window_end() {
            let boundary = self.next_window + 2 * self.window_size;
            if boundary >= self.num_warmup - self.term_buffer {
                self.next_window = self.last_window_end();
            }
        }
    }

    /// Advance by one warmup iteration.
    pub fn step(&mut self) -> WindowStep {
        if !self.enabled || self.counter >= self.num_warmup {
            self.counter += 1;
            return WindowStep::Skip;
        }
        let step = if self.end_of_window() {
            self.compute_next_window();
            WindowStep::CollectAndUpdate
        } else if self.in_window() {
            WindowStep::Collect
        } else {
            WindowStep::Skip
        };
        self.counter += 1;
        step
    }
}
