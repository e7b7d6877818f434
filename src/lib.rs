#![allow(
    clippy::upper_case_acronyms,
    non_camel_case_types,
    clippy::too_many_arguments,
    clippy::missing_panics_doc,
    clippy::missing_errors_doc,
    clippy::too_many_lines,
    clippy::cast_precision_loss,
    clippy::cast_sign_loss,
    clippy::cast_possible_truncation,
    clippy::cast_possible_wrap
)]

pub mod config;
pub mod core;
pub mod dim;
pub mod instruction;
pub mod kernel;
pub mod mem_fetch;
pub mod opcodes;
pub mod register_set;
pub mod resources;
pub mod simt_stack;
pub mod streams;
pub mod warp;

#[cfg(test)]
pub mod testing;

pub type address = u64;
