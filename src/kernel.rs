//! Kernel callbacks
//!
//! The port never chooses the next task itself. Ready queues, priorities
//! and tick bookkeeping belong to the kernel above it, which the port
//! consumes through this trait.
//!
//! Author: Moroya Sakamoto

use std::sync::Arc;

use crate::task::TaskId;

/// The external scheduler driving the port
///
/// All three callbacks run while the running token is held, so they must
/// not call back into the port.
pub trait Kernel: Send + Sync {
    /// One tick period has elapsed
    fn advance_time(&self);

    /// Pick the task to run next; may change [`Kernel::current_task`]
    fn select_next_task(&self);

    /// The task the kernel considers current
    fn current_task(&self) -> TaskId;
}

impl<K: Kernel + ?Sized> Kernel for Arc<K> {
    fn advance_time(&self) {
        (**self).advance_time()
    }

    fn select_next_task(&self) {
        (**self).select_next_task()
    }

    fn current_task(&self) -> TaskId {
        (**self).current_task()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::RoundRobin;

    #[test]
    fn test_arc_kernel_forwards() {
        let kernel = Arc::new(RoundRobin::new(&[TaskId(1), TaskId(2)]));
        let shared: Arc<dyn Kernel> = kernel.clone();

        assert_eq!(shared.current_task(), TaskId(1));
        shared.select_next_task();
        shared.advance_time();
        assert_eq!(shared.current_task(), TaskId(2));
        assert_eq!(kernel.selections(), 1);
        assert_eq!(kernel.advances(), 1);
    }
}
