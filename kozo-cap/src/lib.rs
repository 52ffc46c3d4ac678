//! # kozo-cap
//!
//! The capability engine of the KOZO microkernel.
//!
//! A **capability** is an unforgeable token held in a kernel-managed slot.
//! It combines an object reference, a set of access rights, and a
//! kernel-assigned badge. Capabilities are the only way user code reaches
//! kernel resources: they cannot be forged or guessed, only granted.
//!
//! # Core Types
//!
//! - [`CapRights`]: access permissions (Read, Write, Grant, Map)
//! - [`Badge`] / [`BadgeMinter`]: kernel-assigned sender identifiers
//! - [`CapSlot`]: storage for a single capability, including its derivation
//!   links (32 bytes)
//! - [`SlotRef`]: index-based slot address `(cnode, index)`
//! - [`UntypedObject`]: watermark allocator over raw physical memory
//!
//! # Derivation Tree
//!
//! Every capability records where it was derived from. The links
//! (parent, first child, next sibling) live inside the slot itself and are
//! slot indices, never pointers, so revocation is an iterative traversal
//! with no shared ownership to untangle.
//!
//! Derivation rules:
//!
//! - **Retype** creates children of an Untyped capability
//! - **Mint** creates a child with attenuated rights and a fresh badge
//! - **Transfer** copies (as a sibling) or moves (links follow the slot)
//! - **Delete** removes one slot, reparenting its children
//! - **Revoke** destroys an entire subtree, children first
//!
//! # Storage Split
//!
//! This crate defines the capability logic; the kernel provides storage.
//! The [`CapStore`] trait is the seam: the kernel implements it over CNode
//! frames, tests implement it over plain arrays. Resource teardown during
//! revocation goes through [`ResourceReclaim`].

#![no_std]
#![deny(unsafe_op_in_unsafe_fn)]
#![warn(missing_docs)]

#[cfg(test)]
extern crate std;

mod badge;
mod cnode;
mod error;
pub mod ops;
mod rights;
mod slot;
mod untyped;

pub use badge::{Badge, BadgeMinter};
pub use cnode::{CNodeId, CNODE_RADIX, CNODE_SLOTS};
pub use error::{CapError, CapResult};
pub use ops::{CapStore, ObjectMemory, ResourceReclaim};
pub use rights::CapRights;
pub use slot::{CapSlot, ObjectType, SlotFlags, SlotRef};
pub use untyped::{object_alignment, object_size, UntypedObject};
