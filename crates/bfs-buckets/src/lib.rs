#![forbid(unsafe_code)]
//! Per-bucket state for BucketFS devices.
//!
//! Every bucket has one 64-bit mark word ([`BucketMark`]) mutated only
//! through [`AtomicBucketMark::mutate`]'s compare-and-swap transform. The
//! marks of a device live in a [`BucketArray`] published through an
//! [`RcuCell`], so a resize can swap in a new table while markers still
//! hold the old one.

pub mod array;
pub mod bitmap;
pub mod mark;
pub mod rcu;

pub use array::{Bucket, BucketArray, BucketSideArrays};
pub use mark::{AtomicBucketMark, BucketMark, BucketState, checked_sector_add};
pub use rcu::RcuCell;
