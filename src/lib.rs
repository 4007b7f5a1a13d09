//! Storage, virtual-memory, and file-system core of a small educational
//! operating system: a buffered block cache, an extensible inode layer,
//! and a virtual-memory manager (frame table, supplemental page table,
//! swap area, mmap), wired together by [`kernel::Kernel`].
//!
//! Everything above this crate — syscall argument marshalling, user-pointer
//! validation, directory traversal, process scheduling — is an external
//! collaborator that drives these subsystems through the types here;
//! [`process::Process`] is a minimal stand-in for that layer's process
//! object, carrying only the fields the core's contract needs.

pub mod cache;
pub mod device;
pub mod error;
pub mod freemap;
pub mod inode;
pub mod kernel;
pub mod process;
pub mod vm;
pub mod writeback;
