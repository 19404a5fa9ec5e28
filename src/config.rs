//! Boot-time VirtIO configuration.
//!
//! The broker consumes a per-VM list of VirtIO device entries, fixed at
//! boot. Tables are either assembled programmatically by the platform
//! port or parsed from the host device tree (zero-copy, `fdt` crate).
//!
//! Device-tree binding: `/vms/vm@N` nodes, one per VM in boot order, each
//! with `virtio@ID` children carrying `instance-id`, `backend` (flag),
//! `device-type`, `priority`, `device-irq`, `backend-irq`, `polling`
//! (flag) and `reg = <base size>` for the frontend MMIO window.

use crate::hal::{IrqId, VmId};
use crate::protocol::InstanceId;
use thiserror::Error;

/// Maximum number of configured VMs.
pub const VMS_MAX: usize = 8;

/// Maximum VirtIO device entries per VM.
pub const DEVICES_PER_VM_MAX: usize = 8;

/// One VirtIO device entry in a VM's configuration.
///
/// A frontend entry and a backend entry sharing an `instance_id` form one
/// instance; each side only fills the fields of its role.
#[derive(Debug, Clone, Copy)]
pub struct VirtioDeviceConfig {
    pub instance_id: InstanceId,
    /// True if this VM hosts the device emulation for the instance.
    pub backend: bool,
    /// Opaque device tag forwarded to the backend.
    pub device_type: u32,
    /// Dispatch key; higher value = lower priority.
    pub priority: u32,
    /// Interrupt raised in the frontend when a response lands.
    pub device_irq: IrqId,
    /// Interrupt raised in the backend when a request arrives.
    pub backend_irq: IrqId,
    /// Backend polls instead of waiting on `backend_irq`.
    pub polling: bool,
    /// Frontend MMIO window base (guest virtual address).
    pub mmio_base: u64,
    /// Frontend MMIO window size in bytes.
    pub mmio_size: u64,
}

impl VirtioDeviceConfig {
    /// Frontend entry; backend-side fields stay unset.
    pub fn frontend(
        instance_id: InstanceId,
        priority: u32,
        device_irq: IrqId,
        mmio_base: u64,
        mmio_size: u64,
    ) -> Self {
        Self {
            instance_id,
            backend: false,
            device_type: 0,
            priority,
            device_irq,
            backend_irq: 0,
            polling: false,
            mmio_base,
            mmio_size,
        }
    }

    /// Backend entry; frontend-side fields stay unset.
    pub fn backend(
        instance_id: InstanceId,
        device_type: u32,
        backend_irq: IrqId,
        polling: bool,
    ) -> Self {
        Self {
            instance_id,
            backend: true,
            device_type,
            priority: 0,
            device_irq: 0,
            backend_irq,
            polling,
            mmio_base: 0,
            mmio_size: 0,
        }
    }
}

/// Errors surfaced while assembling or validating the boot configuration.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("more than one backend bound to virtio instance {0}")]
    DuplicateBackend(InstanceId),
    #[error("more than one frontend bound to virtio instance {0}")]
    DuplicateFrontend(InstanceId),
    #[error("virtio instance {0} has no backend")]
    MissingBackend(InstanceId),
    #[error("virtio instance {0} has no frontend")]
    MissingFrontend(InstanceId),
    #[error("virtio instance capacity exceeded")]
    TooManyInstances,
    #[error("vm capacity exceeded")]
    TooManyVms,
    #[error("per-vm virtio device capacity exceeded")]
    TooManyDevices,
    #[error("malformed virtio node in device tree")]
    BadDeviceTree,
}

/// VirtIO device list of a single VM.
#[derive(Debug, Clone, Copy)]
pub struct VmConfig {
    devices: [Option<VirtioDeviceConfig>; DEVICES_PER_VM_MAX],
    count: usize,
}

impl VmConfig {
    pub const fn new() -> Self {
        Self {
            devices: [None; DEVICES_PER_VM_MAX],
            count: 0,
        }
    }

    pub fn push(&mut self, device: VirtioDeviceConfig) -> Result<(), ConfigError> {
        if self.count == DEVICES_PER_VM_MAX {
            return Err(ConfigError::TooManyDevices);
        }
        self.devices[self.count] = Some(device);
        self.count += 1;
        Ok(())
    }

    pub fn devices(&self) -> impl Iterator<Item = &VirtioDeviceConfig> {
        self.devices[..self.count].iter().flatten()
    }
}

impl Default for VmConfig {
    fn default() -> Self {
        Self::new()
    }
}

/// The full boot configuration: one `VmConfig` per VM, indexed by boot
/// order (the index is the VM id).
pub struct VmConfigTable {
    vms: [Option<VmConfig>; VMS_MAX],
    count: usize,
}

impl VmConfigTable {
    pub const fn new() -> Self {
        Self {
            vms: [None; VMS_MAX],
            count: 0,
        }
    }

    /// Append a VM's device list; returns the VM id it was assigned.
    pub fn push_vm(&mut self, vm: VmConfig) -> Result<VmId, ConfigError> {
        if self.count == VMS_MAX {
            return Err(ConfigError::TooManyVms);
        }
        let id = self.count;
        self.vms[id] = Some(vm);
        self.count += 1;
        Ok(id)
    }

    pub fn vms(&self) -> impl Iterator<Item = &VmConfig> {
        self.vms[..self.count].iter().flatten()
    }

    pub fn vm_count(&self) -> usize {
        self.count
    }

    /// Build the table from the host device tree.
    ///
    /// VM nodes are consumed in device-tree order, which must match boot
    /// order. Missing optional properties fall back to zero / unset, the
    /// same defaulting the host applies to its own platform nodes.
    pub fn from_fdt(fdt: &fdt::Fdt) -> Result<Self, ConfigError> {
        let mut table = Self::new();
        let vms = fdt.find_node("/vms").ok_or(ConfigError::BadDeviceTree)?;

        for vm_node in vms.children() {
            if !vm_node.name.starts_with("vm@") {
                continue;
            }
            let mut vm = VmConfig::new();
            for dev_node in vm_node.children() {
                if !dev_node.name.starts_with("virtio@") {
                    continue;
                }
                vm.push(parse_device(&dev_node)?)?;
            }
            table.push_vm(vm)?;
        }
        Ok(table)
    }
}

impl Default for VmConfigTable {
    fn default() -> Self {
        Self::new()
    }
}

fn parse_device(node: &fdt::node::FdtNode) -> Result<VirtioDeviceConfig, ConfigError> {
    let prop = |name: &str| {
        node.property(name)
            .and_then(|p| p.as_usize())
            .map(|v| v as u64)
    };

    let instance_id = prop("instance-id").ok_or(ConfigError::BadDeviceTree)?;
    let (mmio_base, mmio_size) = match node.reg().and_then(|mut regs| regs.next()) {
        Some(region) => (
            region.starting_address as u64,
            region.size.unwrap_or(0) as u64,
        ),
        None => (0, 0),
    };

    Ok(VirtioDeviceConfig {
        instance_id,
        backend: node.property("backend").is_some(),
        device_type: prop("device-type").unwrap_or(0) as u32,
        priority: prop("priority").unwrap_or(0) as u32,
        device_irq: prop("device-irq").unwrap_or(0) as IrqId,
        backend_irq: prop("backend-irq").unwrap_or(0) as IrqId,
        polling: node.property("polling").is_some(),
        mmio_base,
        mmio_size,
    })
}
