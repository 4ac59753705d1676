//! Symbols and externs that `chunkalloc` depends on.
//!
//! This crate provides the page mapping, scheduling and logging primitives for Linux, BSD, and
//! Mac OS, together with the tweakable configuration of the allocator.

#![cfg_attr(not(test), no_std)]
#![warn(missing_docs)]

pub mod config;
pub mod syscalls;
