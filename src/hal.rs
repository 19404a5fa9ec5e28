//! Host-hypervisor seam.
//!
//! The broker executes in trap, hypercall and IPI context of whatever
//! hypervisor embeds it. Everything it needs from that host (CPU and VM
//! identity, the trapping vCPU's register file, interrupt injection,
//! cross-CPU messaging, park/resume) is reached through [`HostCpu`].
//! The embedding hypervisor implements it once in its exception glue;
//! tests implement it with a mock.

use crate::protocol::CpuMessage;

/// Physical CPU identifier.
pub type CpuId = usize;

/// VM identifier (index into the boot configuration).
pub type VmId = usize;

/// Virtual interrupt line. Zero means "no line bound".
pub type IrqId = u32;

/// The broker's view of the physical CPU it is currently executing on.
pub trait HostCpu {
    /// Identifier of this physical CPU.
    fn cpu_id(&self) -> CpuId;

    /// VM of the vCPU currently loaded on this CPU.
    fn vm_id(&self) -> VmId;

    /// Read a general-purpose register of the current vCPU.
    fn read_reg(&self, reg: u8) -> u64;

    /// Write a general-purpose register of the current vCPU.
    fn write_reg(&mut self, reg: u8, value: u64);

    /// Inject a virtual interrupt into the current vCPU.
    fn inject_irq(&mut self, irq: IrqId);

    /// Mark the current vCPU runnable (`true`) or parked (`false`).
    fn set_vcpu_active(&mut self, active: bool);

    /// Advance the current vCPU past the trapping MMIO instruction.
    /// Instruction width is the host's business, not the broker's.
    fn advance_pc(&mut self);

    /// Post a broker message to another physical CPU.
    fn send_message(&mut self, target: CpuId, msg: CpuMessage);

    /// Yield this physical CPU to the host scheduler. Called with the
    /// current vCPU already parked; returns once the CPU is handed back.
    fn idle(&mut self);
}

/// A decoded guest MMIO access, as delivered by the host's trap decoder.
#[derive(Debug, Clone, Copy)]
pub struct MmioAccess {
    /// Faulting guest virtual address.
    pub addr: u64,
    /// General-purpose register that sources (store) or receives (load)
    /// the accessed value.
    pub reg: u8,
    /// Access width in bytes (1, 2, 4 or 8).
    pub width: u8,
    /// True for a store, false for a load.
    pub write: bool,
}
