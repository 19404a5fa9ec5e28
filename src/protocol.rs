//! Wire-level protocol shared with the backend VM and the host's cross-CPU
//! message plumbing.
//!
//! The backend drives the broker through a hypercall whose operation
//! selector travels in a well-known register; the broker signals remote
//! CPUs with a small typed message. Both vocabularies are fixed ABI and
//! must not be renumbered.

/// Unique identifier linking one frontend driver to one backend device.
pub type InstanceId = u64;

/// Hypercall operation selector (register x5 of the backend hypercall).
///
/// `Write`/`Read` double as the request kind recorded on a trapping MMIO
/// access, which is why the broker echoes them back in the `ASK` reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u64)]
pub enum VirtioOp {
    /// Backend completed a write request (echo acknowledgement).
    Write = 0,
    /// Backend completed a read request (carries the read value).
    Read = 1,
    /// Backend fetches the next unhanded request.
    Ask = 2,
    /// Backend asks for a frontend device interrupt (e.g. used-ring
    /// advanced); no request involved.
    Notify = 3,
}

impl TryFrom<u64> for VirtioOp {
    type Error = ();

    fn try_from(raw: u64) -> Result<Self, ()> {
        match raw {
            0 => Ok(VirtioOp::Write),
            1 => Ok(VirtioOp::Read),
            2 => Ok(VirtioOp::Ask),
            3 => Ok(VirtioOp::Notify),
            _ => Err(()),
        }
    }
}

/// Hypercall return taxonomy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HypercallResult {
    Success,
    Failure,
    InvalidArgs,
}

impl HypercallResult {
    /// Encode for the caller's return register: codes travel negated, so
    /// success is 0 and errors are small negative values.
    pub fn encode(self) -> i64 {
        match self {
            HypercallResult::Success => 0,
            HypercallResult::Failure => -1,
            HypercallResult::InvalidArgs => -2,
        }
    }
}

/// Cross-CPU message events.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum MessageEvent {
    /// A write completion is waiting on the frontend CPU.
    WriteNotify = 0,
    /// A read completion is waiting on the frontend CPU.
    ReadNotify = 1,
    /// Inject the instance's interrupt line on the receiving CPU.
    InjectInterrupt = 2,
    /// Wake a polling backend; it re-enters its `ASK` loop when scheduled.
    NotifyBackendPoll = 3,
}

impl TryFrom<u32> for MessageEvent {
    type Error = ();

    fn try_from(raw: u32) -> Result<Self, ()> {
        match raw {
            0 => Ok(MessageEvent::WriteNotify),
            1 => Ok(MessageEvent::ReadNotify),
            2 => Ok(MessageEvent::InjectInterrupt),
            3 => Ok(MessageEvent::NotifyBackendPoll),
            _ => Err(()),
        }
    }
}

/// Typed message carried between physical CPUs on the broker's channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CpuMessage {
    pub event: MessageEvent,
    pub instance_id: InstanceId,
}

impl CpuMessage {
    /// Channel identifier in the host's cpu_msg dispatch table, reserved
    /// for VirtIO broker traffic. The host routes messages tagged with
    /// this id to `VirtioBroker::handle_message`.
    pub const CHANNEL: u32 = 0x5649_4f42; // "VIOB"
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn op_codes_round_trip() {
        for op in [VirtioOp::Write, VirtioOp::Read, VirtioOp::Ask, VirtioOp::Notify] {
            assert_eq!(VirtioOp::try_from(op as u64), Ok(op));
        }
        assert_eq!(VirtioOp::try_from(4), Err(()));
    }

    #[test]
    fn result_encoding_is_negated() {
        assert_eq!(HypercallResult::Success.encode(), 0);
        assert_eq!(HypercallResult::Failure.encode(), -1);
        assert_eq!(HypercallResult::InvalidArgs.encode(), -2);
    }

    #[test]
    fn event_codes_round_trip() {
        assert_eq!(MessageEvent::try_from(3), Ok(MessageEvent::NotifyBackendPoll));
        assert_eq!(MessageEvent::try_from(4), Err(()));
    }
}
