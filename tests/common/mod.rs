#![allow(dead_code)]

pub mod builders;
pub mod harness;
pub mod strategies;

pub use builders::*;
pub use harness::*;
