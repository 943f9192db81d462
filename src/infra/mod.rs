//! Infrastructure adapters for wire framing.

pub mod framing;

pub use framing::{Framing, HttpFraming, LengthPrefixedFraming};
