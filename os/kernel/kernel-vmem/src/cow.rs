//! # Copy-on-Write Faults
//!
//! After a fork both processes map the same frames read-only. The first
//! write from either side faults; the fault is resolved here by giving the
//! writer a private copy, or, when it is already the last sharer, by simply
//! making its mapping writable again.

use crate::vma::VmaList;
use crate::{AddressSpace, Mmu, VmemError};
use kernel_alloc::{FrameAlloc, PhysMapper};
use kernel_memory_addresses::{PhysicalFrame, Size4K, VirtualAddress};

/// How a page fault was dealt with.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum FaultOutcome {
    /// The page was shared; the writer now owns this fresh copy.
    Copied(PhysicalFrame),
    /// The writer was the only sharer left; write access was restored.
    Reclaimed,
    /// Not a copy-on-write fault. The caller treats it as a real fault.
    NotMine,
}

/// Resolve a fault at `addr` in `space`, whose areas are `vmas`.
///
/// # Errors
/// [`VmemError::OutOfMemory`] if a private copy is needed and no frame is
/// left. The mapping is unchanged in that case.
pub fn resolve_write_fault<M: PhysMapper, U: Mmu, A: FrameAlloc>(
    space: &AddressSpace<'_, M, U>,
    alloc: &mut A,
    vmas: &VmaList,
    addr: VirtualAddress,
    is_write: bool,
) -> Result<FaultOutcome, VmemError> {
    if !is_write {
        return Ok(FaultOutcome::NotMine);
    }
    let Some(vma) = vmas.find(addr).filter(|v| v.cow && v.is_writable()) else {
        return Ok(FaultOutcome::NotMine);
    };
    let page = addr.align_down::<Size4K>();
    let Some(entry) = space.leaf_entry(page) else {
        return Ok(FaultOutcome::NotMine);
    };

    let old = entry.frame();
    if alloc.refcount(old) > 1 {
        let new = alloc.alloc_frame()?;
        space.mapper().copy_frame(old, new);
        // Areas only describe the user half, whatever flags they were given.
        let flags = vma
            .flags
            .with_present(true)
            .with_user_access(true)
            .with_writable(true);
        if let Err(e) = space.map_page(alloc, page, new, flags) {
            alloc.free_frame(new);
            return Err(e);
        }
        alloc.refcount_dec(old);
        log::trace!("cow copy {page}: {old} -> {new}");
        Ok(FaultOutcome::Copied(new))
    } else {
        space.protect(page, entry.flags().with_writable(true))?;
        log::trace!("cow reclaim {page} ({old})");
        Ok(FaultOutcome::Reclaimed)
    }
}
