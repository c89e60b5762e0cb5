//! In-process steering tables.
//!
//! A fixed array of atomic binding flags, one `ArcSwapOption` slot per queue
//! for consumer handles and an `ArcSwap` snapshot of the port set. Readers
//! never lock; a single control plane writes through [`ControlPlane`].
//!
//! Used by `ts-steer classify` to evaluate frames offline against a
//! configuration, with the same engine the XDP program runs.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::{anyhow, Result};
use arc_swap::{ArcSwap, ArcSwapOption};
use ts_steer_common::{classify, Outcome, PortSet, QueueBindings, RedirectTargets, MAX_QUEUES};

use crate::control::{check_queue, ControlPlane};

pub struct SteeringTables<H> {
    bindings: Box<[AtomicBool]>,
    targets: Box<[ArcSwapOption<H>]>,
    ports: ArcSwap<PortSet>,
}

impl<H> Default for SteeringTables<H> {
    fn default() -> Self {
        Self::new()
    }
}

impl<H> SteeringTables<H> {
    /// Tables with every queue unbound and no port filter.
    pub fn new() -> Self {
        Self {
            bindings: (0..MAX_QUEUES).map(|_| AtomicBool::new(false)).collect(),
            targets: (0..MAX_QUEUES).map(|_| ArcSwapOption::empty()).collect(),
            ports: ArcSwap::from_pointee(PortSet::any()),
        }
    }

    /// Current port filter snapshot.
    pub fn port_filter(&self) -> PortSet {
        **self.ports.load()
    }

    /// Classify one frame received on `queue`.
    pub fn classify(&self, packet: &[u8], queue: u32) -> Outcome<Arc<H>> {
        let filter = self.ports.load();
        classify(packet, queue, self, &**filter, self)
    }
}

impl<H> QueueBindings for SteeringTables<H> {
    fn is_bound(&self, queue: u32) -> bool {
        self.bindings
            .get(queue as usize)
            .is_some_and(|flag| flag.load(Ordering::Acquire))
    }
}

impl<H> RedirectTargets for SteeringTables<H> {
    type Handle = Arc<H>;

    fn target(&self, queue: u32) -> Option<Arc<H>> {
        self.targets.get(queue as usize)?.load_full()
    }
}

/// Writes go through interior atomics, so a shared reference is enough to
/// drive the control plane while readers classify.
impl<H> ControlPlane for &SteeringTables<H> {
    type Handle = H;

    fn set_binding(&mut self, queue: u32, bound: bool) -> Result<()> {
        check_queue(queue)?;
        self.bindings[queue as usize].store(bound, Ordering::Release);
        Ok(())
    }

    fn set_redirect_target(&mut self, queue: u32, target: Option<H>) -> Result<()> {
        check_queue(queue)?;
        self.targets[queue as usize].store(target.map(Arc::new));
        Ok(())
    }

    fn configure_port_filter(&mut self, ports: &[u16]) -> Result<()> {
        let set = PortSet::new(ports).map_err(|e| anyhow!("{}", e))?;
        self.ports.store(Arc::new(set));
        Ok(())
    }
}
