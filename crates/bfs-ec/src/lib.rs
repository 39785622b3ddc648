#![forbid(unsafe_code)]
//! Erasure-coded stripe bookkeeping.
//!
//! Only sector accounting lives here: how many sectors each block of a
//! stripe holds, how many blocks are nonempty, and which live stripe is
//! least occupied. Encoding and reconstruction are elsewhere.
//!
//! # Logging
//!
//! - **TRACE** `bfs::ec`: `stripe_table_grow`, `stripe_heap_update`
//! - **DEBUG** `bfs::ec`: `stripe_insert`, `stripe_delete`, `stripe_table_reset`

pub mod heap;
pub mod stripe;
pub mod table;

pub use heap::StripesHeap;
pub use stripe::{BlockCharge, Stripe, StripeGeometry};
pub use table::{StripeError, StripeTable};
