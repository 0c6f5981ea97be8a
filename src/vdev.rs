//! A software-emulated interrupt controller for guests without hardware-assisted GIC
//! virtualization.
//!
//! Each vCPU sees a small memory-mapped block. Injection slots play the part of list
//! registers: a slot is pending after injection, active once the guest acknowledged it,
//! and free again after end-of-interrupt. The chip drives a virtual IRQ line per vCPU,
//! which the platform reflects into the guest (HCR_EL2.VI on ARM64).

use alloc::vec::Vec;

use axerrno::{ax_err, AxResult};
use spin::Mutex;

use crate::config::MAX_VIRQ_SLOTS;
use crate::percpu::CoreId;
use crate::virq::{VirqDesc, VirqState};
use crate::virq_chip::{VirqAction, VirqChip, VirqChipFlags};

/// Control register; bit 0 enables the IRQ line.
pub const EMU_CTRL: usize = 0x00;
/// Pending slot bitmap, read-only.
pub const EMU_PENDING: usize = 0x08;
/// Active slot bitmap, read-only.
pub const EMU_ACTIVE: usize = 0x10;
/// Acknowledge: reading returns the highest-priority pending virq and activates it.
pub const EMU_ACK: usize = 0x18;
/// End of interrupt: write the virq number to deactivate it.
pub const EMU_EOI: usize = 0x20;
/// Masked slot bitmap.
pub const EMU_MASK: usize = 0x28;

/// Value read from [`EMU_ACK`] when nothing is pending.
pub const EMU_SPURIOUS: u64 = 1023;

struct EmuCpu {
    enabled: bool,
    pending: u64,
    active: u64,
    masked: u64,
    slot_virq: Vec<Option<u32>>,
    irq_line: bool,
}

impl EmuCpu {
    fn new(nr_slots: usize) -> Self {
        Self {
            enabled: true,
            pending: 0,
            active: 0,
            masked: 0,
            slot_virq: vec![None; nr_slots],
            irq_line: false,
        }
    }

    fn update_line(&mut self) {
        self.irq_line = self.enabled && (self.pending & !self.masked != 0 || self.active != 0);
    }
}

/// The emulated chip of one VM.
pub struct EmulatedVirqChip {
    nr_slots: usize,
    cpus: Vec<Mutex<EmuCpu>>,
}

impl EmulatedVirqChip {
    pub fn new(nr_vcpus: usize, nr_slots: usize) -> Self {
        let nr_slots = nr_slots.clamp(1, MAX_VIRQ_SLOTS);
        Self {
            nr_slots,
            cpus: (0..nr_vcpus).map(|_| Mutex::new(EmuCpu::new(nr_slots))).collect(),
        }
    }

    fn cpu(&self, vcpu: usize) -> AxResult<&Mutex<EmuCpu>> {
        match self.cpus.get(vcpu) {
            Some(cpu) => Ok(cpu),
            None => ax_err!(InvalidInput, "vcpu not served by this chip"),
        }
    }

    /// Whether the virtual IRQ line of `vcpu` is asserted.
    pub fn irq_line(&self, vcpu: usize) -> bool {
        self.cpus.get(vcpu).is_some_and(|c| c.lock().irq_line)
    }

    /// Guest read of the register at `offset`.
    pub fn mmio_read(&self, vcpu: usize, offset: usize) -> AxResult<u64> {
        let mut cpu = self.cpu(vcpu)?.lock();
        let val = match offset {
            EMU_CTRL => cpu.enabled as u64,
            EMU_PENDING => cpu.pending,
            EMU_ACTIVE => cpu.active,
            EMU_MASK => cpu.masked,
            EMU_ACK => {
                let ready = cpu.pending & !cpu.masked;
                if ready == 0 {
                    EMU_SPURIOUS
                } else {
                    let slot = ready.trailing_zeros() as usize;
                    cpu.pending &= !(1 << slot);
                    cpu.active |= 1 << slot;
                    cpu.update_line();
                    cpu.slot_virq[slot].map_or(EMU_SPURIOUS, |v| v as u64)
                }
            }
            _ => return ax_err!(InvalidInput, format!("bad emulated irq register {:#x}", offset)),
        };
        Ok(val)
    }

    /// Guest write of `val` to the register at `offset`.
    pub fn mmio_write(&self, vcpu: usize, offset: usize, val: u64) -> AxResult {
        let mut cpu = self.cpu(vcpu)?.lock();
        match offset {
            EMU_CTRL => cpu.enabled = val & 1 != 0,
            EMU_MASK => cpu.masked = val,
            EMU_EOI => {
                let found = cpu
                    .slot_virq
                    .iter()
                    .enumerate()
                    .find(|(slot, v)| **v == Some(val as u32) && cpu.active & (1u64 << *slot) != 0)
                    .map(|(slot, _)| slot);
                match found {
                    Some(slot) => cpu.active &= !(1 << slot),
                    None => warn!("vcpu {}: EOI of inactive virq {}", vcpu, val),
                }
            }
            EMU_PENDING | EMU_ACTIVE | EMU_ACK => {
                return ax_err!(PermissionDenied, "read-only emulated irq register");
            }
            _ => return ax_err!(InvalidInput, format!("bad emulated irq register {:#x}", offset)),
        }
        cpu.update_line();
        Ok(())
    }

    fn slot_of(&self, desc: &VirqDesc) -> AxResult<usize> {
        match desc.id {
            Some(id) if (id as usize) < self.nr_slots => Ok(id as usize),
            _ => ax_err!(InvalidInput, "virq has no valid slot"),
        }
    }
}

impl VirqChip for EmulatedVirqChip {
    fn name(&self) -> &str {
        "emulated-irq"
    }

    fn flags(&self) -> VirqChipFlags {
        VirqChipFlags::empty()
    }

    fn nr_slots(&self) -> usize {
        self.nr_slots
    }

    fn enter_to_guest(&self, _core: CoreId, vcpu: usize) {
        if let Some(cpu) = self.cpus.get(vcpu) {
            cpu.lock().update_line();
        }
    }

    fn send_virq(&self, _core: CoreId, vcpu: usize, desc: &VirqDesc) -> AxResult {
        let slot = self.slot_of(desc)?;
        let mut cpu = self.cpu(vcpu)?.lock();
        cpu.pending |= 1 << slot;
        cpu.slot_virq[slot] = Some(desc.vno);
        Ok(())
    }

    fn get_virq_state(&self, _core: CoreId, vcpu: usize, desc: &VirqDesc) -> VirqState {
        let (Ok(slot), Ok(cpu)) = (self.slot_of(desc), self.cpu(vcpu)) else {
            return VirqState::Inactive;
        };
        let cpu = cpu.lock();
        let bit = 1u64 << slot;
        match (cpu.pending & bit != 0, cpu.active & bit != 0) {
            (true, true) => VirqState::ActiveAndPending,
            (true, false) => VirqState::Pending,
            (false, true) => VirqState::Active,
            (false, false) => VirqState::Inactive,
        }
    }

    fn update_virq(
        &self,
        _core: CoreId,
        vcpu: usize,
        desc: &VirqDesc,
        action: VirqAction,
    ) -> AxResult {
        if action != VirqAction::Clear {
            return Ok(());
        }
        let slot = self.slot_of(desc)?;
        let mut cpu = self.cpu(vcpu)?.lock();
        cpu.pending &= !(1 << slot);
        cpu.active &= !(1 << slot);
        cpu.slot_virq[slot] = None;
        cpu.update_line();
        Ok(())
    }

    /// `<bank irq>`: 32 interrupts per bank.
    fn xlate(&self, intspec: &[u32]) -> AxResult<(u32, u32)> {
        match intspec {
            [bank, irq, ..] if *irq < 32 => Ok((bank * 32 + irq, 0)),
            _ => ax_err!(InvalidInput, "bad interrupt specifier"),
        }
    }
}
