//! Local filesystem helpers: masks, hashing and tree scanning.

pub mod hash;
pub mod mask;
pub mod walker;
