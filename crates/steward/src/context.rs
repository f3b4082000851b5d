// SPDX-FileCopyrightText: 2025 Caspar Water Company
//
// SPDX-License-Identifier: Apache-2.0

use std::time::Instant;

/// State that lives for exactly one cycle across all nodes.
#[derive(Debug)]
pub struct CycleContext {
    started: Instant,
    transport_done: bool,
}

impl CycleContext {
    #[must_use]
    pub fn new() -> Self {
        Self {
            started: Instant::now(),
            transport_done: false,
        }
    }

    /// Whether a transfer onto a transport node completed this cycle.
    #[must_use]
    pub fn transport_done(&self) -> bool {
        self.transport_done
    }

    pub fn mark_transport_done(&mut self) {
        self.transport_done = true;
    }

    #[must_use]
    pub fn started(&self) -> Instant {
        self.started
    }
}

impl Default for CycleContext {
    fn default() -> Self {
        Self::new()
    }
}
