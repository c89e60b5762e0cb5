//! Control-plane operations on the steering tables.
//!
//! The classifier only reads the binding registry and redirect table; every
//! write goes through a [`ControlPlane`]. [`bind_queue`] and [`unbind_queue`]
//! keep the publication order readers rely on: a handle is published before
//! its queue is marked bound, and the binding is cleared before the handle is
//! withdrawn. A reader therefore never sees "bound" with an unusable handle.

use anyhow::{bail, Context, Result};
use tracing::debug;
use ts_steer_common::MAX_QUEUES;

/// Writer side of the binding registry, redirect table and port filter.
pub trait ControlPlane {
    /// Opaque consumer handle stored in the redirect table.
    type Handle;

    /// Enable or disable redirect eligibility for a queue.
    fn set_binding(&mut self, queue: u32, bound: bool) -> Result<()>;

    /// Publish (`Some`) or withdraw (`None`) the consumer handle for a queue.
    fn set_redirect_target(&mut self, queue: u32, target: Option<Self::Handle>) -> Result<()>;

    /// Replace the destination-port allowlist. Empty means any port.
    fn configure_port_filter(&mut self, ports: &[u16]) -> Result<()>;
}

/// Attach a consumer to `queue`: publish its handle, then mark the queue bound.
pub fn bind_queue<C: ControlPlane>(plane: &mut C, queue: u32, handle: C::Handle) -> Result<()> {
    check_queue(queue)?;
    plane
        .set_redirect_target(queue, Some(handle))
        .with_context(|| format!("publishing redirect target for queue {}", queue))?;
    plane
        .set_binding(queue, true)
        .with_context(|| format!("binding queue {}", queue))?;
    debug!(queue, "queue bound");
    Ok(())
}

/// Detach the consumer from `queue`: clear the binding, then withdraw the handle.
pub fn unbind_queue<C: ControlPlane>(plane: &mut C, queue: u32) -> Result<()> {
    check_queue(queue)?;
    plane
        .set_binding(queue, false)
        .with_context(|| format!("unbinding queue {}", queue))?;
    plane
        .set_redirect_target(queue, None)
        .with_context(|| format!("withdrawing redirect target for queue {}", queue))?;
    debug!(queue, "queue unbound");
    Ok(())
}

pub fn check_queue(queue: u32) -> Result<()> {
    if queue >= MAX_QUEUES {
        bail!("queue {} out of range (max {})", queue, MAX_QUEUES - 1);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Records every write so the ordering can be asserted.
    #[derive(Default)]
    struct Recorder {
        ops: Vec<String>,
    }

    impl ControlPlane for Recorder {
        type Handle = i32;

        fn set_binding(&mut self, queue: u32, bound: bool) -> Result<()> {
            self.ops.push(format!("binding {} {}", queue, bound));
            Ok(())
        }

        fn set_redirect_target(&mut self, queue: u32, target: Option<i32>) -> Result<()> {
            self.ops.push(format!("target {} {:?}", queue, target));
            Ok(())
        }

        fn configure_port_filter(&mut self, ports: &[u16]) -> Result<()> {
            self.ops.push(format!("ports {:?}", ports));
            Ok(())
        }
    }

    #[test]
    fn test_bind_publishes_target_first() {
        let mut rec = Recorder::default();
        bind_queue(&mut rec, 2, 17).unwrap();
        assert_eq!(rec.ops, vec!["target 2 Some(17)", "binding 2 true"]);
    }

    #[test]
    fn test_unbind_clears_binding_first() {
        let mut rec = Recorder::default();
        unbind_queue(&mut rec, 2).unwrap();
        assert_eq!(rec.ops, vec!["binding 2 false", "target 2 None"]);
    }

    #[test]
    fn test_out_of_range_queue_is_rejected() {
        let mut rec = Recorder::default();
        assert!(bind_queue(&mut rec, MAX_QUEUES, 1).is_err());
        assert!(unbind_queue(&mut rec, MAX_QUEUES).is_err());
        assert!(rec.ops.is_empty());
    }
}
