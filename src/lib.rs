#![doc = include_str!("../README.md")]
#![deny(unsafe_op_in_unsafe_fn)]
#![no_std]

extern crate alloc;

#[cfg(test)]
extern crate std;

mod descriptor;
mod error;
mod loom;

pub mod buckets;
pub mod vector;

#[doc(inline)]
pub use buckets::Buckets;

#[doc(inline)]
pub use error::Error;

#[doc(inline)]
pub use vector::Vector;
