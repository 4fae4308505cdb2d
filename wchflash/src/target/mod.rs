//! Target chip support.

pub mod chip;

pub use chip::{ChipDef, ChipIdentity, IdentitySource, chips, find_chip, lookup};
