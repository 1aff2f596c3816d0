//! # Address Space (x86-64, PML4-rooted)
//!
//! [`AddressSpace`] is a handle to one page-table tree. It does not own the
//! tree: the root frame is stored by whoever owns the space (a process, the
//! kernel) and a handle is rebuilt from it when needed.
//!
//! ## Sharing rules
//!
//! - Top-level slots `256..512` (the kernel half) are copied **by reference**
//!   into every new space, so kernel mappings below them are seen by all.
//! - The slot holding the kernel-stack window ([`KERNEL_STACK_SLOT`]) is the
//!   exception: each space gets its own, freed with it.
//! - Lower-half tables are private. Leaf frames in the lower half may be
//!   shared between spaces after [`clone_cow`](AddressSpace::clone_cow); the
//!   frame allocator's share count tracks how many.
//!
//! ## TLB
//!
//! Every change to an existing translation invalidates it through the
//! [`Mmu`]. Cloning write-protects the source and ends with a full flush.

use crate::page_table::{ENTRIES, PageTable, get_table};
use crate::{Mmu, PageEntryBits, VmemError};
use core::marker::PhantomData;
use kernel_alloc::{FrameAlloc, PhysMapper};
use kernel_info::memory::{KERNEL_PML4_START, KERNEL_STACK_SLOT};
use kernel_memory_addresses::{
    PhysicalAddress, PhysicalFrame, Size1G, Size2M, Size4K, VirtualAddress,
};

/// The PML4 frame of an [`AddressSpace`].
pub type RootPage = PhysicalFrame;

/// Handle to a single, concrete address space.
pub struct AddressSpace<'m, M: PhysMapper, U: Mmu> {
    root: RootPage,
    mapper: &'m M,
    _mmu: PhantomData<fn() -> U>,
}

/// Top-level slots whose subtrees belong to one space only.
fn private_slots() -> impl Iterator<Item = usize> {
    (0..KERNEL_PML4_START).chain(core::iter::once(KERNEL_STACK_SLOT))
}

/// Leaf permission checks every mapping must pass.
fn check_leaf_flags(va: VirtualAddress, flags: PageEntryBits) {
    if !va.is_canonical() {
        log::error!("mapping requested at non-canonical {va}");
        panic!("non-canonical virtual address {va}");
    }
    if va.is_kernel() && flags.user_access() {
        log::error!("user-accessible mapping requested in kernel range at {va}");
        panic!("user-accessible mapping in kernel range at {va}");
    }
    if va.is_user() && !flags.user_access() {
        log::error!("supervisor-only mapping requested in user range at {va}");
        panic!("supervisor-only mapping in user range at {va}");
    }
}

impl<'m, M: PhysMapper, U: Mmu> AddressSpace<'m, M, U> {
    #[inline]
    pub const fn from_root(mapper: &'m M, root: RootPage) -> Self {
        Self {
            root,
            mapper,
            _mmu: PhantomData,
        }
    }

    /// The currently active address space.
    pub fn current(mapper: &'m M) -> Self {
        Self::from_root(mapper, U::current_root())
    }

    /// New space sharing the kernel half of `kernel_root`.
    ///
    /// The lower half and the kernel-stack slot start empty.
    ///
    /// # Errors
    /// [`VmemError::OutOfMemory`] if no frame is left for the root.
    pub fn create<A: FrameAlloc>(
        mapper: &'m M,
        alloc: &mut A,
        kernel_root: RootPage,
    ) -> Result<Self, VmemError> {
        let root = alloc.alloc_frame()?;
        mapper.zero_frame(root);

        // SAFETY: `root` is freshly allocated; `kernel_root` is only read.
        let (pml4, template) = unsafe { (get_table(mapper, root), get_table(mapper, kernel_root)) };
        for i in KERNEL_PML4_START..ENTRIES {
            if i != KERNEL_STACK_SLOT {
                pml4.set(i, template.get(i));
            }
        }

        log::debug!("created address space {root}");
        Ok(Self::from_root(mapper, root))
    }

    #[inline]
    #[must_use]
    pub const fn root(&self) -> RootPage {
        self.root
    }

    #[inline]
    #[must_use]
    pub const fn mapper(&self) -> &'m M {
        self.mapper
    }

    /// # Safety
    /// See [`get_table`]: the frame must be a table of this space and no
    /// other reference to it may be in use.
    #[inline]
    unsafe fn table<'t>(&self, frame: PhysicalFrame) -> &'t mut PageTable {
        unsafe { get_table(self.mapper, frame) }
    }

    /// Next-level table behind `table[idx]`, creating a zeroed one if absent.
    fn ensure_table<A: FrameAlloc>(
        &self,
        alloc: &mut A,
        table: &mut PageTable,
        idx: usize,
        user: bool,
    ) -> Result<PhysicalFrame, VmemError> {
        let e = table.get(idx);
        if e.present() {
            return Ok(e.frame());
        }
        let frame = alloc.alloc_frame()?;
        self.mapper.zero_frame(frame);
        table.set(idx, PageEntryBits::table(user).with_frame(frame));
        Ok(frame)
    }

    /// Map the 4 KiB page containing `va` to `frame` with `flags`.
    ///
    /// Missing intermediate tables are allocated. A 2 MiB kernel leaf
    /// covering `va` is split into 4 KiB pages first. An existing mapping
    /// of `va` is replaced.
    ///
    /// # Panics
    /// If `va` is non-canonical, or `flags` grant user access in the kernel
    /// half, or deny it in the user half.
    ///
    /// # Errors
    /// - [`VmemError::OutOfMemory`] if a table cannot be allocated.
    /// - [`VmemError::HugePage`] if a user-half or 1 GiB leaf covers `va`.
    pub fn map_page<A: FrameAlloc>(
        &self,
        alloc: &mut A,
        va: VirtualAddress,
        frame: PhysicalFrame,
        flags: PageEntryBits,
    ) -> Result<(), VmemError> {
        check_leaf_flags(va, flags);
        let va = va.align_down::<Size4K>();
        let user = va.is_user();

        // SAFETY: each table is a distinct frame of this space.
        let pml4 = unsafe { self.table(self.root) };
        let pdpt_frame = self.ensure_table(alloc, pml4, va.table_index(4), user)?;

        let pdpt = unsafe { self.table(pdpt_frame) };
        let i3 = va.table_index(3);
        if pdpt.get(i3).present() && pdpt.get(i3).large_page() {
            return Err(VmemError::HugePage(va));
        }
        let pd_frame = self.ensure_table(alloc, pdpt, i3, user)?;

        let pd = unsafe { self.table(pd_frame) };
        let i2 = va.table_index(2);
        if pd.get(i2).present() && pd.get(i2).large_page() {
            if user {
                return Err(VmemError::HugePage(va));
            }
            self.split_2m(alloc, pd, i2)?;
        }
        let pt_frame = self.ensure_table(alloc, pd, i2, user)?;

        let pt = unsafe { self.table(pt_frame) };
        pt.set(
            va.table_index(1),
            flags.with_present(true).with_frame(frame),
        );
        U::invalidate_page(va);
        log::trace!("map {va} -> {frame} in {}", self.root);
        Ok(())
    }

    /// Replace the 2 MiB leaf `pd[i2]` by a page table with the same
    /// translation and permissions.
    fn split_2m<A: FrameAlloc>(
        &self,
        alloc: &mut A,
        pd: &mut PageTable,
        i2: usize,
    ) -> Result<(), VmemError> {
        let huge = pd.get(i2);
        let pt_frame = alloc.alloc_frame()?;
        // SAFETY: freshly allocated.
        let pt = unsafe { self.table(pt_frame) };

        let base = huge.huge_2m_base();
        // PS would read as PAT at L1.
        let leaf = huge.flags().with_large_page(false);
        for i in 0..ENTRIES {
            let pa = base + (i as u64) * 4096;
            pt.set(i, leaf.with_frame(PhysicalFrame::containing(pa)));
        }
        pd.set(i2, PageEntryBits::table(false).with_frame(pt_frame));
        U::flush_all();
        log::debug!("split 2 MiB kernel page at {base}");
        Ok(())
    }

    /// The 4 KiB leaf slot for `va`, present or not.
    ///
    /// # Safety
    /// Same as [`table`](Self::table).
    unsafe fn pte<'t>(&self, va: VirtualAddress) -> Option<&'t mut PageEntryBits> {
        let mut table = unsafe { self.table(self.root) };
        for level in [4, 3, 2] {
            let e = table.get(va.table_index(level));
            if !e.present() || (level < 4 && e.large_page()) {
                return None;
            }
            table = unsafe { self.table(e.frame()) };
        }
        Some(&mut table[va.table_index(1)])
    }

    /// The present 4 KiB leaf mapping `va`, if any.
    #[must_use]
    pub fn leaf_entry(&self, va: VirtualAddress) -> Option<PageEntryBits> {
        // SAFETY: read only.
        unsafe { self.pte(va) }
            .as_deref()
            .copied()
            .filter(PageEntryBits::present)
    }

    /// Remove the 4 KiB mapping of `va` and return the frame it pointed at.
    ///
    /// The frame's share count is left alone; the caller decides whether
    /// to drop its reference.
    ///
    /// # Errors
    /// [`VmemError::NotMapped`] if no 4 KiB leaf maps `va`.
    pub fn unmap_page(&self, va: VirtualAddress) -> Result<PhysicalFrame, VmemError> {
        let va = va.align_down::<Size4K>();
        // SAFETY: the entry is only touched here.
        let pte = unsafe { self.pte(va) }
            .filter(|e| e.present())
            .ok_or(VmemError::NotMapped(va))?;
        let frame = pte.frame();
        *pte = PageEntryBits::new();
        U::invalidate_page(va);
        log::trace!("unmap {va} ({frame}) in {}", self.root);
        Ok(frame)
    }

    /// Replace the permissions of an existing 4 KiB mapping.
    ///
    /// # Panics
    /// As [`map_page`](Self::map_page) for inconsistent user flags.
    ///
    /// # Errors
    /// [`VmemError::NotMapped`] if no 4 KiB leaf maps `va`.
    pub fn protect(&self, va: VirtualAddress, flags: PageEntryBits) -> Result<(), VmemError> {
        check_leaf_flags(va, flags);
        let va = va.align_down::<Size4K>();
        // SAFETY: the entry is only touched here.
        let pte = unsafe { self.pte(va) }
            .filter(|e| e.present())
            .ok_or(VmemError::NotMapped(va))?;
        *pte = pte.with_flags_of(flags.with_present(true));
        U::invalidate_page(va);
        Ok(())
    }

    /// Translate `va` to a physical address, following 2 MiB and 1 GiB leaves.
    #[must_use]
    pub fn translate(&self, va: VirtualAddress) -> Option<PhysicalAddress> {
        // SAFETY: read-only walk.
        let pml4 = unsafe { self.table(self.root) };
        let e4 = pml4.get(va.table_index(4));
        if !e4.present() {
            return None;
        }

        let pdpt = unsafe { self.table(e4.frame()) };
        let e3 = pdpt.get(va.table_index(3));
        if !e3.present() {
            return None;
        }
        if e3.large_page() {
            return Some(e3.huge_1g_base() + va.offset::<Size1G>());
        }

        let pd = unsafe { self.table(e3.frame()) };
        let e2 = pd.get(va.table_index(2));
        if !e2.present() {
            return None;
        }
        if e2.large_page() {
            return Some(e2.huge_2m_base() + va.offset::<Size2M>());
        }

        let pt = unsafe { self.table(e2.frame()) };
        let e1 = pt.get(va.table_index(1));
        e1.present()
            .then(|| e1.physical_address() + va.offset::<Size4K>())
    }

    /// Load this space's root into the MMU.
    ///
    /// # Safety
    /// The space must map the code and stack currently executing.
    #[inline]
    pub unsafe fn activate(&self) {
        unsafe { U::load_root(self.root) }
    }

    #[inline]
    #[must_use]
    pub fn is_active(&self) -> bool {
        U::current_root() == self.root
    }

    /// Share every user page of `self` with `dst` copy-on-write.
    ///
    /// Intermediate tables are allocated fresh for `dst`; leaf entries are
    /// copied with the writable bit cleared in both trees and the frame's
    /// share count raised. On error `dst` holds a consistent subset of the
    /// mappings and must be freed by the caller.
    ///
    /// # Errors
    /// [`VmemError::OutOfMemory`] if an intermediate table cannot be allocated.
    pub fn copy_on_write_into<A: FrameAlloc>(
        &self,
        dst: &Self,
        alloc: &mut A,
    ) -> Result<(), VmemError> {
        // SAFETY: two different roots.
        let (src4, dst4) = unsafe { (self.table(self.root), dst.table(dst.root)) };
        let mut result = Ok(());
        for i4 in 0..KERNEL_PML4_START {
            let e4 = src4.get(i4);
            if !e4.present() {
                continue;
            }
            result = dst
                .ensure_table(alloc, dst4, i4, true)
                .and_then(|d3| self.share_tables(dst, alloc, e4.frame(), d3, 3));
            if result.is_err() {
                break;
            }
        }
        // Source leaves may be read-only now, even after a failure.
        U::flush_all();
        result
    }

    fn share_tables<A: FrameAlloc>(
        &self,
        dst: &Self,
        alloc: &mut A,
        src_frame: PhysicalFrame,
        dst_frame: PhysicalFrame,
        level: u8,
    ) -> Result<(), VmemError> {
        // SAFETY: one table from each tree.
        let (src, d) = unsafe { (self.table(src_frame), dst.table(dst_frame)) };
        for i in 0..ENTRIES {
            let e = src.get(i);
            if !e.present() {
                continue;
            }
            if level == 1 {
                let shared = e.with_writable(false);
                src.set(i, shared);
                d.set(i, shared);
                alloc.refcount_inc(e.frame());
            } else if e.large_page() {
                log::warn!("huge user page in {} not shared with clone", self.root);
            } else {
                let child = dst.ensure_table(alloc, d, i, true)?;
                self.share_tables(dst, alloc, e.frame(), child, level - 1)?;
            }
        }
        Ok(())
    }

    /// Copy-on-write clone of this space.
    ///
    /// # Errors
    /// [`VmemError::OutOfMemory`]; the partial clone is freed before returning.
    pub fn clone_cow<A: FrameAlloc>(&self, alloc: &mut A) -> Result<Self, VmemError> {
        let dst = Self::create(self.mapper, alloc, self.root)?;
        if let Err(e) = self.copy_on_write_into(&dst, alloc) {
            log::warn!("clone of {} failed: {e}", self.root);
            dst.release(alloc);
            return Err(VmemError::OutOfMemory);
        }
        log::debug!("cloned address space {} -> {}", self.root, dst.root);
        Ok(dst)
    }

    /// Free every private table and frame of this space, then the root.
    ///
    /// Shared leaf frames only lose one reference.
    ///
    /// # Panics
    /// If this is `kernel_root` or the active space.
    pub fn free<A: FrameAlloc>(self, alloc: &mut A, kernel_root: RootPage) {
        if self.root == kernel_root {
            log::error!("attempt to free the kernel address space {kernel_root}");
            panic!("refusing to free the kernel address space");
        }
        if self.is_active() {
            log::error!("attempt to free the active address space {}", self.root);
            panic!("refusing to free the active address space");
        }
        self.release(alloc);
    }

    fn release<A: FrameAlloc>(self, alloc: &mut A) {
        // SAFETY: the space is being torn down; nobody else walks it.
        let pml4 = unsafe { self.table(self.root) };
        for i4 in private_slots() {
            let e = pml4.get(i4);
            if e.present() {
                self.free_tables(alloc, e.frame(), 3);
                pml4.set(i4, PageEntryBits::new());
            }
        }
        alloc.free_frame(self.root);
        log::debug!("freed address space {}", self.root);
    }

    fn free_tables<A: FrameAlloc>(&self, alloc: &mut A, frame: PhysicalFrame, level: u8) {
        // SAFETY: private table of a space being torn down.
        let table = unsafe { self.table(frame) };
        for i in 0..ENTRIES {
            let e = table.get(i);
            if !e.present() {
                continue;
            }
            if level == 1 {
                alloc.free_frame(e.frame());
            } else if e.large_page() {
                log::warn!("huge page in private slot of {} left allocated", self.root);
            } else {
                self.free_tables(alloc, e.frame(), level - 1);
            }
        }
        alloc.free_frame(frame);
    }
}
