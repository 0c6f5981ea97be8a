use axerrno::{ax_err, AxResult};
use log::LevelFilter;

/// Upper bound on the number of physical cores a [`crate::Kernel`] can manage.
///
/// Core masks are carried in a `u64`.
pub const MAX_CPUS: usize = 64;

/// Number of priority levels on each core. Level 0 is the highest priority.
pub const NR_PRIO_LEVELS: usize = 64;

/// The priority reserved for the idle task of each core.
pub const PRIO_IDLE: u8 = (NR_PRIO_LEVELS - 1) as u8;

/// The lowest priority an ordinary task may be created with.
pub const LOWEST_TASK_PRIO: u8 = PRIO_IDLE - 1;

/// Default stack size of a task.
pub const DEFAULT_STACK_SIZE: usize = 4096 * 2;

/// Timeout value that never expires, like 0.
pub const WAIT_FOREVER: u64 = u64::MAX;

/// Upper bound on the number of list-register style slots a virq chip may expose.
pub const MAX_VIRQ_SLOTS: usize = 64;

/// Boot-time configuration of the kernel.
///
/// This replaces the process-wide boot options and print level: the
/// [`crate::Kernel`] owns one copy and everything below it reads from there.
#[derive(Debug, Clone)]
pub struct KernelConfig {
    /// Number of physical cores brought up by the platform.
    pub nr_cpus: usize,
    /// Stack size used when a task is created with a stack size of zero.
    pub default_stack_size: usize,
    /// Capacity of the task table, idle tasks included.
    pub max_tasks: usize,
    /// Length of a round-robin time slice, in scheduler ticks.
    pub time_slice_ticks: u64,
    /// Number of injection slots given to software-emulated virq chips.
    pub emulated_virq_slots: usize,
    /// Maximum log level; applied with [`log::set_max_level`] when the kernel is built.
    pub print_level: LevelFilter,
    /// Backoff rounds spent waiting for another core to acknowledge an [`crate::SmpCall`].
    pub smp_call_rounds: u32,
}

impl Default for KernelConfig {
    fn default() -> Self {
        Self {
            nr_cpus: 1,
            default_stack_size: DEFAULT_STACK_SIZE,
            max_tasks: 512,
            time_slice_ticks: 10,
            emulated_virq_slots: 16,
            print_level: LevelFilter::Info,
            smp_call_rounds: 1 << 16,
        }
    }
}

impl KernelConfig {
    /// Create a configuration for `nr_cpus` cores with every other field defaulted.
    pub fn with_cpus(nr_cpus: usize) -> Self {
        Self {
            nr_cpus,
            ..Self::default()
        }
    }

    /// Check that the configuration can be used to build a kernel.
    pub fn validate(&self) -> AxResult {
        if self.nr_cpus == 0 || self.nr_cpus > MAX_CPUS {
            return ax_err!(
                InvalidInput,
                format!("nr_cpus must be within 1..={}", MAX_CPUS)
            );
        }
        // every core needs its idle task plus at least one more
        if self.max_tasks <= self.nr_cpus {
            return ax_err!(InvalidInput, "task table too small for the idle tasks");
        }
        if self.time_slice_ticks == 0 {
            return ax_err!(InvalidInput, "time slice must be at least one tick");
        }
        if self.emulated_virq_slots == 0 || self.emulated_virq_slots > MAX_VIRQ_SLOTS {
            return ax_err!(InvalidInput, "invalid emulated virq slot count");
        }
        if self.smp_call_rounds == 0 {
            return ax_err!(InvalidInput, "smp calls need at least one wait round");
        }
        Ok(())
    }
}
