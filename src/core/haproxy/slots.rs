// src/core/haproxy/slots.rs

//! Server slot calculation for HAProxy backends.
//!
//! HAProxy cannot change server counts without a process reload; by
//! over-provisioning stable named slots the daemon absorbs scale-up without
//! touching the backend topology.

use crate::config::{GrowthType, ServerSlotsConfig};

/// Calculates how many server slots a backend should have and generates
/// their names.
#[derive(Debug, Clone)]
pub struct SlotAllocator {
    base: usize,
    growth_factor: f64,
    growth_type: GrowthType,
}

impl SlotAllocator {
    pub fn new(config: &ServerSlotsConfig) -> Self {
        Self {
            base: config.base,
            growth_factor: config.growth_factor,
            growth_type: config.growth_type,
        }
    }

    /// Return the number of server slots needed for the given active count.
    ///
    /// Counts at or below the base return the base; above it the slot count
    /// grows linearly (`base + ceil((count - base) * factor)`) or
    /// exponentially (smallest `base * factor^n` covering the count, never
    /// less than the count itself).
    pub fn calculate_slots(&self, active_count: usize) -> usize {
        if active_count <= self.base {
            return self.base;
        }

        match self.growth_type {
            GrowthType::Exponential => {
                // Config validation guarantees growth_factor > 1 here.
                let mut grown = self.base as f64 * self.growth_factor;
                while grown < active_count as f64 {
                    grown *= self.growth_factor;
                }
                (grown.ceil() as usize).max(active_count)
            }
            GrowthType::Linear => {
                let extra =
                    ((active_count - self.base) as f64 * self.growth_factor).ceil() as usize;
                self.base + extra
            }
        }
    }

    /// Generate server slot names: `["srv1", "srv2", ..., "srvN"]`.
    pub fn generate_server_names(count: usize) -> Vec<String> {
        (1..=count).map(|i| format!("srv{i}")).collect()
    }
}
