//! Live binary patching of running processes.
//!
//! Seizes every thread of a target, proves no thread executes inside the
//! code about to change, injects the patch through remote syscalls and
//! direct memory writes, and releases the target, all without restarting it.

#[macro_use]
extern crate lazy_static;

pub mod debugger;
pub mod errors;
pub mod patch;
pub mod proc;
pub mod process;
pub mod remote;
pub mod stack;
pub mod threads;

pub use crate::errors::{Error, Result};
pub use crate::patch::{check_process, patch_process, CodePatch, PatchOps};
pub use crate::process::ProcessCtx;
