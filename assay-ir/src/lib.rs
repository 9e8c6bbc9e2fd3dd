#![forbid(unsafe_code)]

pub mod ir;

pub mod build;
pub mod fmt;
pub mod hash;
pub mod validate;

pub use ir::*;
pub use fmt::{format_expr, format_method, format_place};
pub use hash::structural_hash;
pub use validate::{MalformedIr, validate};
