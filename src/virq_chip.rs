use axerrno::AxResult;
use bitflags::bitflags;

use crate::percpu::CoreId;
use crate::virq::{VirqDesc, VirqState};

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct VirqChipFlags: u32 {
        /// Injection goes through hardware virtualization support (list registers).
        const HW_VIRT = 1 << 0;
    }
}

/// Bookkeeping requests passed to [`VirqChip::update_virq`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum VirqAction {
    /// A physical interrupt was bound to the virq.
    Add,
    /// The binding was dropped.
    Remove,
    /// Empty the slot the virq occupies.
    Clear,
}

/// The interrupt controller a VM sees.
///
/// One chip is bound to a VM for its whole life. All calls for a vCPU are made with that
/// vCPU's virq lock held and on the core the vCPU is loaded on; implementations must not
/// block or reschedule.
pub trait VirqChip: Send + Sync {
    fn name(&self) -> &str;

    fn flags(&self) -> VirqChipFlags;

    /// Number of injection slots per vCPU.
    fn nr_slots(&self) -> usize;

    /// Called after every pending virq of `vcpu` got its chance at a slot.
    fn enter_to_guest(&self, _core: CoreId, _vcpu: usize) {}

    /// Called before the active virqs of `vcpu` are examined.
    fn exit_from_guest(&self, _core: CoreId, _vcpu: usize) {}

    /// Make `desc` pending in its slot `desc.id`.
    fn send_virq(&self, core: CoreId, vcpu: usize, desc: &VirqDesc) -> AxResult;

    /// What the guest did with the virq in slot `desc.id`.
    fn get_virq_state(&self, core: CoreId, vcpu: usize, desc: &VirqDesc) -> VirqState;

    fn update_virq(&self, core: CoreId, vcpu: usize, desc: &VirqDesc, action: VirqAction)
        -> AxResult;

    /// Translate a device-tree interrupt specifier into `(irq number, trigger flags)`.
    fn xlate(&self, intspec: &[u32]) -> AxResult<(u32, u32)>;
}
