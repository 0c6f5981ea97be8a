//! Per-vCPU virtual interrupt descriptors and their delivery state machine.
//!
//! Descriptors live in an arena indexed by virq number (SGIs and PPIs first, then the
//! VM's SPIs) and are linked on either the pending or the active list. A descriptor holds
//! a slot id exactly while it is on the active list.

use alloc::vec::Vec;

use axerrno::{ax_err, AxResult};
use bitflags::bitflags;

use crate::config::MAX_VIRQ_SLOTS;
use crate::hal::{IrqGuard, KernelHal};
use crate::hook::{HookItem, HookRegistry, HookType};
use crate::kernel::Kernel;
use crate::list::{IndexList, Link, LinkStore};
use crate::percpu::CoreId;
use crate::vcpu::Vcpu;
use crate::virq_chip::{VirqAction, VirqChip, VirqChipFlags};

/// Number of software generated interrupts per vCPU.
pub const VIRQ_NR_SGI: u32 = 16;
/// Number of banked (SGI + PPI) interrupts per vCPU; SPIs are numbered from here.
pub const VIRQ_NR_LOCAL: u32 = 32;
/// Priority given to a descriptor until the guest programs one.
pub const VIRQ_DEFAULT_PRIO: u8 = 0xa0;

/// Delivery state of a virq.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum VirqState {
    Inactive,
    Pending,
    Active,
    ActiveAndPending,
    /// The VM is suspended or going away; assertions are latched.
    Offline,
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct VirqFlags: u32 {
        /// Backed by a physical interrupt (passthrough).
        const HW = 1 << 0;
        /// Unmasked; only enabled virqs are injected.
        const ENABLED = 1 << 1;
        /// Raising it resumes a suspended VM.
        const CAN_WAKEUP = 1 << 2;
        /// Raised while offline, delivered when the VM comes back.
        const LATCHED = 1 << 3;
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum VirqList {
    Pending,
    Active,
}

/// One virtual interrupt of a vCPU.
#[derive(Debug, Clone)]
pub struct VirqDesc {
    pub vno: u32,
    /// Physical interrupt number, for [`VirqFlags::HW`] virqs.
    pub hno: u32,
    pub flags: VirqFlags,
    pub state: VirqState,
    /// Injection slot (list register) while active.
    pub id: Option<u8>,
    pub pr: u8,
    /// Sending vCPU of an SGI.
    pub src: u8,
    link: Link<VirqList>,
}

impl VirqDesc {
    fn new(vno: u32) -> Self {
        Self {
            vno,
            hno: 0,
            flags: VirqFlags::ENABLED,
            state: VirqState::Inactive,
            id: None,
            pr: VIRQ_DEFAULT_PRIO,
            src: 0,
            link: Link::default(),
        }
    }

    pub fn is_hw(&self) -> bool {
        self.flags.contains(VirqFlags::HW)
    }

    pub fn is_enabled(&self) -> bool {
        self.flags.contains(VirqFlags::ENABLED)
    }

    pub fn is_local(&self) -> bool {
        self.vno < VIRQ_NR_LOCAL
    }
}

impl LinkStore<VirqList> for Vec<VirqDesc> {
    fn link(&self, idx: usize) -> &Link<VirqList> {
        &self[idx].link
    }

    fn link_mut(&mut self, idx: usize) -> &mut Link<VirqList> {
        &mut self[idx].link
    }
}

/// What raising a virq did.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RaiseOutcome {
    /// Newly queued for delivery.
    Queued,
    /// Already waiting for delivery; nothing changed.
    AlreadyPending,
    /// The virq is offline; the assertion was remembered.
    Latched,
}

/// The virq state of one vCPU.
pub struct VirqStruct {
    descs: Vec<VirqDesc>,
    pending: IndexList<VirqList>,
    active: IndexList<VirqList>,
    slot_bitmap: u64,
    nr_slots: usize,
    /// The VM is suspended or going away; new assertions are latched.
    offline: bool,
}

impl VirqStruct {
    pub fn new(nr_spis: u32, nr_slots: usize) -> Self {
        let nr = VIRQ_NR_LOCAL + nr_spis;
        Self {
            descs: (0..nr).map(VirqDesc::new).collect(),
            pending: IndexList::new(VirqList::Pending),
            active: IndexList::new(VirqList::Active),
            slot_bitmap: 0,
            nr_slots: nr_slots.min(MAX_VIRQ_SLOTS),
            offline: false,
        }
    }

    fn index(&self, vno: u32) -> AxResult<usize> {
        if (vno as usize) < self.descs.len() {
            Ok(vno as usize)
        } else {
            ax_err!(InvalidInput, format!("virq {} out of range", vno))
        }
    }

    pub fn desc(&self, vno: u32) -> AxResult<&VirqDesc> {
        let idx = self.index(vno)?;
        Ok(&self.descs[idx])
    }

    pub fn state(&self, vno: u32) -> AxResult<VirqState> {
        Ok(self.desc(vno)?.state)
    }

    pub fn nr_virqs(&self) -> usize {
        self.descs.len()
    }

    /// Virq numbers on the pending list, in delivery order.
    pub fn pending_virqs(&self) -> Vec<u32> {
        self.pending
            .to_vec(&self.descs)
            .into_iter()
            .map(|i| self.descs[i].vno)
            .collect()
    }

    /// Virq numbers on the active list.
    pub fn active_virqs(&self) -> Vec<u32> {
        self.active
            .to_vec(&self.descs)
            .into_iter()
            .map(|i| self.descs[i].vno)
            .collect()
    }

    /// Number of slots currently holding a virq.
    pub fn slots_in_use(&self) -> u32 {
        self.slot_bitmap.count_ones()
    }

    /// Whether any enabled virq waits for injection or sits in a slot.
    pub fn has_pending(&self) -> bool {
        !self.active.is_empty()
            || self
                .pending
                .to_vec(&self.descs)
                .into_iter()
                .any(|i| self.descs[i].is_enabled())
    }

    fn alloc_slot(&mut self) -> Option<u8> {
        let usable = if self.nr_slots >= 64 {
            u64::MAX
        } else {
            (1u64 << self.nr_slots) - 1
        };
        let free = !self.slot_bitmap & usable;
        if free == 0 {
            return None;
        }
        let id = free.trailing_zeros() as u8;
        self.slot_bitmap |= 1 << id;
        Some(id)
    }

    fn free_slot(&mut self, id: u8) {
        assert!(self.slot_bitmap & (1 << id) != 0, "virq slot {} freed twice", id);
        self.slot_bitmap &= !(1 << id);
    }

    /// Assert `vno` with SGI source `src`.
    pub fn raise(&mut self, vno: u32, src: u8) -> AxResult<RaiseOutcome> {
        let idx = self.index(vno)?;
        let desc = &mut self.descs[idx];
        if vno < VIRQ_NR_SGI {
            desc.src = src;
        }
        if self.offline {
            desc.flags |= VirqFlags::LATCHED;
            return Ok(RaiseOutcome::Latched);
        }
        let outcome = match desc.state {
            VirqState::Inactive => {
                desc.state = VirqState::Pending;
                self.pending.push_back(&mut self.descs, idx);
                RaiseOutcome::Queued
            }
            VirqState::Active => {
                desc.state = VirqState::ActiveAndPending;
                RaiseOutcome::Queued
            }
            VirqState::Pending | VirqState::ActiveAndPending => RaiseOutcome::AlreadyPending,
            VirqState::Offline => {
                desc.flags |= VirqFlags::LATCHED;
                RaiseOutcome::Latched
            }
        };
        Ok(outcome)
    }

    pub fn mask(&mut self, vno: u32) -> AxResult {
        let idx = self.index(vno)?;
        self.descs[idx].flags.remove(VirqFlags::ENABLED);
        Ok(())
    }

    pub fn unmask(&mut self, vno: u32) -> AxResult {
        let idx = self.index(vno)?;
        self.descs[idx].flags.insert(VirqFlags::ENABLED);
        Ok(())
    }

    pub fn set_priority(&mut self, vno: u32, pr: u8) -> AxResult {
        let idx = self.index(vno)?;
        self.descs[idx].pr = pr;
        Ok(())
    }

    pub fn set_wakeup(&mut self, vno: u32, enable: bool) -> AxResult {
        let idx = self.index(vno)?;
        self.descs[idx].flags.set(VirqFlags::CAN_WAKEUP, enable);
        Ok(())
    }

    /// Withdraw an assertion that has not been delivered yet.
    pub fn clear_pending(&mut self, vno: u32) -> AxResult {
        let idx = self.index(vno)?;
        self.descs[idx].flags.remove(VirqFlags::LATCHED);
        match self.descs[idx].state {
            VirqState::Pending => {
                self.pending.remove(&mut self.descs, idx);
                self.descs[idx].state = VirqState::Inactive;
            }
            VirqState::ActiveAndPending => self.descs[idx].state = VirqState::Active,
            _ => {}
        }
        Ok(())
    }

    /// Mark `vno` as backed by physical interrupt `hno`.
    pub fn bind_hw(&mut self, vno: u32, hno: u32) -> AxResult {
        let idx = self.index(vno)?;
        let desc = &mut self.descs[idx];
        desc.flags |= VirqFlags::HW | VirqFlags::ENABLED;
        desc.hno = hno;
        Ok(())
    }

    pub fn unbind_hw(&mut self, vno: u32) -> AxResult {
        let idx = self.index(vno)?;
        self.descs[idx].flags.remove(VirqFlags::HW);
        Ok(())
    }

    /// Inject pending virqs into free slots. Runs right before the vCPU enters the guest.
    pub(crate) fn enter(&mut self, core: CoreId, vcpu: usize, chip: &dyn VirqChip) {
        if self.offline {
            chip.enter_to_guest(core, vcpu);
            return;
        }
        for idx in self.pending.to_vec(&self.descs) {
            if !self.descs[idx].is_enabled() {
                continue;
            }
            let Some(id) = self.alloc_slot() else {
                warn!(
                    "vcpu {}: no free virq slot, {} virqs deferred",
                    vcpu,
                    self.pending.len()
                );
                break;
            };
            self.descs[idx].id = Some(id);
            if let Err(e) = chip.send_virq(core, vcpu, &self.descs[idx]) {
                warn!("vcpu {}: inject virq {} failed: {:?}", vcpu, self.descs[idx].vno, e);
                self.descs[idx].id = None;
                self.free_slot(id);
                continue;
            }
            self.pending.remove(&mut self.descs, idx);
            self.descs[idx].state = VirqState::Active;
            self.active.push_back(&mut self.descs, idx);
        }
        chip.enter_to_guest(core, vcpu);
    }

    /// Retire what the guest has handled. Runs right after the vCPU left the guest.
    pub(crate) fn exit(&mut self, core: CoreId, vcpu: usize, chip: &dyn VirqChip) {
        chip.exit_from_guest(core, vcpu);
        for idx in self.active.to_vec(&self.descs) {
            let hw_state = chip.get_virq_state(core, vcpu, &self.descs[idx]);
            let requeue = match hw_state {
                VirqState::Inactive => self.descs[idx].state == VirqState::ActiveAndPending,
                // never taken by the guest
                VirqState::Pending => true,
                _ => continue,
            };
            self.retire_slot(core, vcpu, chip, idx);
            if self.offline {
                if requeue {
                    self.descs[idx].flags |= VirqFlags::LATCHED;
                }
                self.descs[idx].state = VirqState::Offline;
            } else if requeue {
                self.descs[idx].state = VirqState::Pending;
                self.pending.push_back(&mut self.descs, idx);
            } else {
                self.descs[idx].state = VirqState::Inactive;
            }
        }
    }

    fn retire_slot(&mut self, core: CoreId, vcpu: usize, chip: &dyn VirqChip, idx: usize) {
        if let Err(e) = chip.update_virq(core, vcpu, &self.descs[idx], VirqAction::Clear) {
            warn!("vcpu {}: clear virq {} failed: {:?}", vcpu, self.descs[idx].vno, e);
        }
        self.active.remove(&mut self.descs, idx);
        if let Some(id) = self.descs[idx].id.take() {
            self.free_slot(id);
        }
    }

    /// Take every virq offline, latching the ones still waiting for delivery.
    ///
    /// Virqs already in a slot stay there: the slot content lives in the chip or in the
    /// vCPU's saved context, so it is only retired by that vCPU's own next exit.
    pub(crate) fn set_offline(&mut self) {
        self.offline = true;
        for idx in self.pending.to_vec(&self.descs) {
            self.pending.remove(&mut self.descs, idx);
            self.descs[idx].flags |= VirqFlags::LATCHED;
        }
        for desc in self.descs.iter_mut() {
            if desc.id.is_none() {
                desc.state = VirqState::Offline;
            }
        }
    }

    /// Bring every virq back online, queueing the latched ones.
    pub(crate) fn set_online(&mut self) {
        self.offline = false;
        for idx in 0..self.descs.len() {
            let desc = &mut self.descs[idx];
            let latched = desc.flags.contains(VirqFlags::LATCHED);
            desc.flags.remove(VirqFlags::LATCHED);
            match desc.state {
                VirqState::Offline if latched => {
                    desc.state = VirqState::Pending;
                    self.pending.push_back(&mut self.descs, idx);
                }
                VirqState::Offline => desc.state = VirqState::Inactive,
                VirqState::Active if latched => desc.state = VirqState::ActiveAndPending,
                _ => {}
            }
        }
    }

    /// Drop every assertion, pending, latched or in flight.
    ///
    /// Slots are emptied in the chip when the vCPU is `loaded` on `core`, or when the chip
    /// keeps per-vCPU state itself. Otherwise the caller resets the saved contexts.
    pub(crate) fn reset(&mut self, core: CoreId, vcpu: usize, chip: &dyn VirqChip, loaded: bool) {
        let clear_chip = loaded || !chip.flags().contains(VirqChipFlags::HW_VIRT);
        for idx in self.active.to_vec(&self.descs) {
            if clear_chip {
                self.retire_slot(core, vcpu, chip, idx);
            } else {
                self.active.remove(&mut self.descs, idx);
                if let Some(id) = self.descs[idx].id.take() {
                    self.free_slot(id);
                }
            }
        }
        for idx in self.pending.to_vec(&self.descs) {
            self.pending.remove(&mut self.descs, idx);
        }
        for desc in self.descs.iter_mut() {
            desc.flags.remove(VirqFlags::LATCHED);
            desc.state = VirqState::Inactive;
        }
        self.offline = false;
    }
}

impl Vcpu {
    /// Inject pending virqs through the VM's chip. Interrupts must be disabled.
    pub(crate) fn virq_enter(&self, core: CoreId) {
        self.virq.lock().enter(core, self.id(), self.chip().as_ref());
    }

    /// Collect the virq state the guest left behind. Interrupts must be disabled.
    pub(crate) fn virq_exit(&self, core: CoreId) {
        self.virq.lock().exit(core, self.id(), self.chip().as_ref());
    }
}

impl<H: KernelHal> Kernel<H> {
    /// Run `f` on the virq state of `vcpu`, with interrupts disabled since the host
    /// interrupt path raises virqs too.
    pub fn with_virqs<F, T>(&self, vcpu: &Vcpu, f: F) -> T
    where
        F: FnOnce(&mut VirqStruct) -> T,
    {
        let _irq = IrqGuard::new(&self.hal);
        f(&mut vcpu.virq.lock())
    }

    pub fn virq_mask(&self, vcpu: &Vcpu, vno: u32) -> AxResult {
        self.with_virqs(vcpu, |v| v.mask(vno))
    }

    pub fn virq_unmask(&self, vcpu: &Vcpu, vno: u32) -> AxResult {
        self.with_virqs(vcpu, |v| v.unmask(vno))
    }

    pub fn clear_pending_virq(&self, vcpu: &Vcpu, vno: u32) -> AxResult {
        self.with_virqs(vcpu, |v| v.clear_pending(vno))
    }

    pub fn virq_state(&self, vcpu: &Vcpu, vno: u32) -> AxResult<VirqState> {
        self.with_virqs(vcpu, |v| v.state(vno))
    }

    pub fn has_pending_virq(&self, vcpu: &Vcpu) -> bool {
        self.with_virqs(vcpu, |v| v.has_pending())
    }
}

/// Attach the virq pipeline to the guest entry/exit hooks.
pub(crate) fn register_virq_hooks(hooks: &HookRegistry) {
    hooks.register(HookType::ExitFromGuest, |item| {
        if let HookItem::Vcpu { core, vcpu } = item {
            vcpu.virq_exit(*core);
        }
        0
    });
    hooks.register(HookType::EnterToGuest, |item| {
        if let HookItem::Vcpu { core, vcpu } = item {
            vcpu.virq_enter(*core);
        }
        0
    });
}
