//! Virtual-memory subsystems: frame table, supplemental page table, swap
//! area, and mmap — the three components spec.md §2 groups under
//! "virtual-memory manager".

pub mod frame;
pub mod mmap;
pub mod spte;
pub mod swap;
