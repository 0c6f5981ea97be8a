use memory_addr::VirtAddr;

use crate::percpu::CoreId;
use crate::task::TrapFrame;

/// Kinds of inter-processor interrupts the scheduler sends.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IpiKind {
    /// Ask the target core to re-evaluate its ready lists.
    Resched,
    /// Ask the target core to drain its handoff list.
    IrqWork,
    /// Ask the target core to process its [`crate::smp::SmpCall`] mailbox.
    Call,
}

/// The interfaces which the underlying platform (boot code, interrupt controller driver,
/// architecture glue) must implement.
///
/// Every method takes the core it acts on explicitly where that matters; nothing here
/// reads an implicit "current core" register.
pub trait KernelHal: Send + Sync {
    /// Disables interrupts on the calling core and returns the previous state.
    fn irq_save(&self) -> usize;

    /// Restores the interrupt state returned by [`KernelHal::irq_save`].
    fn irq_restore(&self, flags: usize);

    /// Sends an IPI of the given kind to `target`.
    fn send_ipi(&self, target: CoreId, kind: IpiKind);

    /// Monotonic scheduler tick counter.
    fn now_ticks(&self) -> u64;

    /// Allocates a task stack of `size` bytes, returning its lowest address.
    ///
    /// Returns `None` when memory is exhausted.
    fn alloc_stack(&self, size: usize) -> Option<VirtAddr>;

    /// Releases a stack obtained from [`KernelHal::alloc_stack`].
    fn free_stack(&self, base: VirtAddr, size: usize);

    /// Switches the register context on `core` from `prev` to `next`.
    ///
    /// On real hardware this returns only when `prev` is scheduled again.
    fn switch_context(&self, core: CoreId, prev: &mut TrapFrame, next: &TrapFrame);

    /// Masks a physical interrupt line (passthrough virqs).
    fn irq_mask(&self, _hwirq: u32) {}

    /// Unmasks a physical interrupt line (passthrough virqs).
    fn irq_unmask(&self, _hwirq: u32) {}
}

/// Saves the interrupt state on creation and restores it on drop, so the restore also
/// happens on early returns.
pub(crate) struct IrqGuard<'a, H: KernelHal> {
    hal: &'a H,
    flags: usize,
}

impl<'a, H: KernelHal> IrqGuard<'a, H> {
    pub(crate) fn new(hal: &'a H) -> Self {
        let flags = hal.irq_save();
        Self { hal, flags }
    }
}

impl<H: KernelHal> Drop for IrqGuard<'_, H> {
    fn drop(&mut self) {
        self.hal.irq_restore(self.flags);
    }
}
