#![forbid(unsafe_code)]

use sha2::Digest;

use crate::{Method, Program, fmt::format_method};

/// Hash of a method's signature and body; source positions do not contribute.
///
/// Two methods with the same hash produce the same summary given the same callee summaries.
pub fn structural_hash(program: &Program, method: &Method) -> String {
    let mut hasher = sha2::Sha256::new();
    hasher.update(format_method(program, method).as_bytes());
    hasher.update([u8::from(method.is_static)]);
    hex::encode(hasher.finalize())
}
