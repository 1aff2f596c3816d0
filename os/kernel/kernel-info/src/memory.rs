//! # Memory Layout

/// First address past the lower canonical half. User mappings live below.
pub const USER_SPACE_END: u64 = 0x0000_8000_0000_0000;

/// First address of the upper canonical half. Kernel mappings live above.
pub const KERNEL_SPACE_START: u64 = 0xffff_8000_0000_0000;

/// Index of the first kernel slot in a top-level table.
pub const KERNEL_PML4_START: usize = 256;

/// Direct-map base used when the boot hand-off does not override it.
/// Anything at [`DEFAULT_HHDM_BASE`] + `pa` aliases physical address `pa`.
pub const DEFAULT_HHDM_BASE: u64 = 0xffff_8880_0000_0000;

/// Where the kernel image executes.
pub const KERNEL_BASE: u64 = 0xffff_ffff_8000_0000;

/// Size of every kernel stack.
pub const KERNEL_STACK_SIZE: usize = 16 * 1024;

/// Number of 4 KiB frames per kernel stack.
pub const KERNEL_STACK_PAGES: usize = KERNEL_STACK_SIZE / 4096;

/// Fixed top of the kernel stack inside every private address space. This is
/// the value `rsp0` is programmed with whenever such a process runs.
pub const KERNEL_STACK_TOP: u64 = 0xffff_ff80_0000_0000;

/// Lowest byte of the kernel-stack window.
pub const KERNEL_STACK_BASE: u64 = KERNEL_STACK_TOP - KERNEL_STACK_SIZE as u64;

/// The PML4 slot holding the kernel-stack window. Private per address space.
pub const KERNEL_STACK_SLOT: usize = ((KERNEL_STACK_BASE >> 39) & 0x1ff) as usize;

/// Start of the window from which MMIO and DMA mappings are carved.
pub const MMIO_WINDOW_BASE: u64 = 0xffff_ffff_9000_0000;

/// End (exclusive) of the MMIO window.
pub const MMIO_WINDOW_END: u64 = 0xffff_ffff_f000_0000;

const _: () = {
    assert!(KERNEL_STACK_SIZE.is_multiple_of(4096));
    assert!(KERNEL_STACK_SLOT >= KERNEL_PML4_START);
    assert!(KERNEL_STACK_SLOT != ((DEFAULT_HHDM_BASE >> 39) & 0x1ff) as usize);
    assert!(KERNEL_STACK_SLOT != ((KERNEL_BASE >> 39) & 0x1ff) as usize);
    assert!(KERNEL_STACK_SLOT != ((MMIO_WINDOW_BASE >> 39) & 0x1ff) as usize);
    assert!(MMIO_WINDOW_BASE > KERNEL_BASE);
    assert!(MMIO_WINDOW_END > MMIO_WINDOW_BASE);
    assert!(DEFAULT_HHDM_BASE >= KERNEL_SPACE_START);
};
