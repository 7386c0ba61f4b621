//! Supply-rail monitoring for power output cards.
//!
//! Overvolt and undervolt latch into the node's fault register and also
//! enter the output-inhibit set: while either is in that set, every
//! power output is forced off and output handlers answer `hardware
//! fault`. The latch outlives the condition; the inhibit lifts only when
//! the operator clears the latch through the faults port. Undervolt is
//! deferred through a down-counter so that inrush at power-up does not
//! trip it.

use tbg_protocol::Faults;

use crate::Node;

/// PWM cycles an undervolt condition must persist before latching.
pub const UNDERVOLT_INHIBIT_CYCLES: u32 = 50_000;

#[derive(Debug, Clone, Copy)]
pub struct SupplyLimits {
    pub overvolt_mv: u32,
    pub undervolt_mv: u32,
}

impl Default for SupplyLimits {
    fn default() -> SupplyLimits {
        // 24 V nominal rail.
        SupplyLimits {
            overvolt_mv: 30_000,
            undervolt_mv: 18_000,
        }
    }
}

#[derive(Debug)]
pub struct PowerMonitor {
    limits: SupplyLimits,
    undervolt_inhibit: u32,
    inhibit: Faults,
}

impl PowerMonitor {
    pub fn new(limits: SupplyLimits) -> PowerMonitor {
        PowerMonitor {
            limits,
            undervolt_inhibit: UNDERVOLT_INHIBIT_CYCLES,
            inhibit: Faults::empty(),
        }
    }

    /// Evaluate one PWM cycle's rail measurement against the limits,
    /// updating the node's fault latch and inhibit set.
    pub fn step(&mut self, millivolts: u32, node: &mut Node) {
        if millivolts > self.limits.overvolt_mv {
            node.latch_fault(Faults::OVERVOLT);
            self.inhibit.insert(Faults::OVERVOLT);
        }

        if millivolts < self.limits.undervolt_mv {
            if self.undervolt_inhibit > 0 {
                self.undervolt_inhibit -= 1;
            } else {
                node.latch_fault(Faults::UNDERVOLT);
                self.inhibit.insert(Faults::UNDERVOLT);
            }
        } else {
            self.undervolt_inhibit = UNDERVOLT_INHIBIT_CYCLES;
        }

        // The inhibit lifts once the operator clears the latch.
        for f in [Faults::OVERVOLT, Faults::UNDERVOLT].iter() {
            if self.inhibit.contains(*f) && !node.faults().contains(*f) {
                self.inhibit.remove(*f);
                if *f == Faults::UNDERVOLT {
                    self.undervolt_inhibit = UNDERVOLT_INHIBIT_CYCLES;
                }
            }
        }

        node.set_inhibit(self.inhibit);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::bare_node;
    use tbg_protocol::{Msg, PORT_FAULTS};

    #[test]
    fn overvolt_latches_and_inhibits() {
        let mut node = bare_node();
        let mut mon = PowerMonitor::new(SupplyLimits::default());
        mon.step(24_000, &mut node);
        assert!(!node.outputs_inhibited());
        mon.step(31_000, &mut node);
        assert!(node.faults().contains(Faults::OVERVOLT));
        assert!(node.outputs_inhibited());
        // Rail recovers but the latch (and inhibit) persist.
        mon.step(24_000, &mut node);
        assert!(node.outputs_inhibited());
    }

    #[test]
    fn clearing_the_latch_lifts_the_inhibit() {
        let mut node = bare_node();
        node.set_addr(9);
        let mut mon = PowerMonitor::new(SupplyLimits::default());
        mon.step(31_000, &mut node);
        assert!(node.outputs_inhibited());

        let mut req = Msg::request(9, PORT_FAULTS, &[0x01, 0x00]);
        req.set_src_addr(62);
        node.dispatch(&req).unwrap();
        mon.step(24_000, &mut node);
        assert!(!node.outputs_inhibited());
    }

    #[test]
    fn undervolt_is_deferred_by_inhibit_counter() {
        let mut node = bare_node();
        let mut mon = PowerMonitor::new(SupplyLimits::default());
        for _ in 0..UNDERVOLT_INHIBIT_CYCLES {
            mon.step(5_000, &mut node);
            assert!(node.faults().is_empty());
        }
        mon.step(5_000, &mut node);
        assert!(node.faults().contains(Faults::UNDERVOLT));
        assert!(node.outputs_inhibited());
    }

    #[test]
    fn healthy_rail_reloads_the_counter() {
        let mut node = bare_node();
        let mut mon = PowerMonitor::new(SupplyLimits::default());
        for _ in 0..1000 {
            mon.step(5_000, &mut node);
        }
        // A healthy cycle resets the deferral in full.
        mon.step(24_000, &mut node);
        for _ in 0..UNDERVOLT_INHIBIT_CYCLES {
            mon.step(5_000, &mut node);
            assert!(node.faults().is_empty());
        }
        mon.step(5_000, &mut node);
        assert!(node.faults().contains(Faults::UNDERVOLT));
    }
}
