//! # Page Faults
//!
//! The only fault the core repairs is a write to a page shared
//! copy-on-write after `fork`. Everything else is reported as fatal, either
//! to the faulting process or to the kernel.

use crate::Kernel;
use bitfield_struct::bitfield;
use kernel_alloc::PhysMapper;
use kernel_info::sched::FAULT_EXIT_STATUS;
use kernel_memory_addresses::VirtualAddress;
use kernel_sched::Arch;
use kernel_vmem::{AddressSpace, FaultOutcome, resolve_write_fault};

/// Page-fault error code layout (x86-64).
///
/// Reference: Intel SDM Vol. 3A, §6.15 "Page-Fault Exception (#PF)".
#[bitfield(u64)]
pub struct PageFaultError {
    /// 0 = non-present page, 1 = protection violation.
    pub present: bool,
    /// 0 = read or execute, 1 = write.
    pub write: bool,
    /// 1 = the access came from CPL 3.
    pub user: bool,
    /// 1 = reserved bit set in a paging structure.
    pub reserved_bit: bool,
    pub instruction_fetch: bool,
    /// Protection-key violation (CR4.PKE).
    pub protection_key: bool,
    /// Shadow-stack access (CET).
    pub shadow_stack: bool,
    #[bits(57)]
    __: u64,
}

impl PageFaultError {
    #[must_use]
    pub const fn explain(&self) -> &'static str {
        if self.reserved_bit() {
            "reserved bit set in a paging structure"
        } else if !self.present() {
            "non-present page"
        } else if self.instruction_fetch() {
            if self.user() {
                "user-mode instruction fetch from a protected page"
            } else {
                "kernel instruction fetch from a protected page"
            }
        } else if self.write() {
            "write to a protected page"
        } else {
            "read from a protected page"
        }
    }

    /// Could this be the first write to a copy-on-write page?
    const fn may_be_cow(self) -> bool {
        self.present() && self.write() && !self.reserved_bit() && !self.instruction_fetch()
    }
}

/// What the fault entry stub should do next.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum PageFaultDecision {
    /// Fixed; retry the faulting instruction.
    Resume,
    /// A user process touched memory it may not; terminate it.
    KillProcess,
    /// The kernel itself faulted.
    Panic,
}

impl<A: Arch, M: PhysMapper> Kernel<'_, A, M> {
    /// Decides how to continue after a page fault at `addr`.
    ///
    /// Copy-on-write faults in the running process's user half are resolved
    /// here. Running out of memory while copying is fatal like any other
    /// unresolved fault.
    pub fn handle_page_fault(&self, addr: VirtualAddress, err: PageFaultError) -> PageFaultDecision {
        if err.may_be_cow() && addr.is_user() {
            let mut frames = self.frames;
            let mapper = self.mapper;
            let outcome = self.sched.with_current(|p| {
                let root = p.address_space()?;
                let space = AddressSpace::<M, A>::from_root(mapper, root);
                Some(resolve_write_fault(&space, &mut frames, p.vmas(), addr, true))
            });
            match outcome {
                Some(Ok(FaultOutcome::Copied(_) | FaultOutcome::Reclaimed)) => {
                    return PageFaultDecision::Resume;
                }
                Some(Err(e)) => log::error!("copy-on-write fault at {addr} unresolved: {e}"),
                Some(Ok(FaultOutcome::NotMine)) | None => {}
            }
        }

        log::error!(
            "page fault at {addr} in {} (error {:#x}): {}",
            self.sched.getpid(),
            err.into_bits(),
            err.explain()
        );
        if err.user() {
            PageFaultDecision::KillProcess
        } else {
            PageFaultDecision::Panic
        }
    }

    /// Acts on [`handle_page_fault`](Self::handle_page_fault): returns if
    /// the fault was resolved, otherwise terminates the process with
    /// [`FAULT_EXIT_STATUS`].
    ///
    /// # Panics
    /// On a fault the kernel caused itself.
    pub fn page_fault(&self, addr: VirtualAddress, err: PageFaultError) {
        match self.handle_page_fault(addr, err) {
            PageFaultDecision::Resume => {}
            PageFaultDecision::KillProcess => self.sched.exit(FAULT_EXIT_STATUS),
            PageFaultDecision::Panic => panic!("kernel page fault at {addr}: {}", err.explain()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_code_bits() {
        let e = PageFaultError::from_bits(0b111);
        assert!(e.present() && e.write() && e.user());
        assert!(e.may_be_cow());
        assert_eq!(e.explain(), "write to a protected page");

        let e = PageFaultError::new().with_user(true);
        assert_eq!(e.explain(), "non-present page");
        assert!(!e.may_be_cow());

        let e = PageFaultError::new().with_present(true).with_instruction_fetch(true);
        assert_eq!(e.explain(), "kernel instruction fetch from a protected page");
        assert_eq!(PageFaultError::from_bits(0b1011).explain(), "reserved bit set in a paging structure");
    }
}
