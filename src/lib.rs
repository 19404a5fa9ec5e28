//! Inter-VM VirtIO request broker for static-partitioning hypervisors.
//!
//! A frontend VM runs an unmodified VirtIO driver against an MMIO window
//! with no device behind it; the access traps into the hypervisor. A
//! backend VM emulates the device in user-level code. This crate bridges
//! the two: it queues the trapping access for the backend, wakes the
//! backend CPU, parks the frontend vCPU, and later delivers the backend's
//! hypercall result back to the frontend together with the right virtual
//! interrupt.
//!
//! The crate is freestanding. Every host service it consumes (CPU and VM
//! identity, the vCPU register file, interrupt injection, cross-CPU
//! messages, idling) goes through the [`hal::HostCpu`] trait implemented
//! by the embedding hypervisor's exception glue. Device semantics
//! (virtqueues, feature negotiation) stay in the backend VM; the broker
//! only moves register accesses and wakeups between the two sides.

#![no_std]

mod broker;
pub mod config;
pub mod global;
pub mod hal;
pub mod protocol;
pub mod queue;
pub mod registry;
pub mod sync;

pub use config::{ConfigError, VirtioDeviceConfig, VmConfig, VmConfigTable};
pub use hal::{CpuId, HostCpu, IrqId, MmioAccess, VmId};
pub use protocol::{CpuMessage, HypercallResult, InstanceId, MessageEvent, VirtioOp};
pub use registry::{Direction, Instance, VirtioBroker, VIRTIO_INSTANCES_MAX};
