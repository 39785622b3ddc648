#![forbid(unsafe_code)]
//! Allocator-facing per-device structures.
//!
//! Allocation policy is not here. These are the queues and signals the
//! allocator and copy-GC read, which must be resized together with the
//! bucket array: reserve-class free FIFOs, the incoming-free FIFO, the
//! allocation-scan heap, the copy-GC heap, the wake signal and the copy-GC
//! thread handle.
//!
//! # Logging
//!
//! - **TRACE** `bfs::alloc`: `allocator_wake`
//! - **DEBUG** `bfs::alloc`: `alloc_queue_entries_dropped`
//! - **INFO**  `bfs::alloc`: `copygc_start`, `copygc_stop`

pub mod copygc;
pub mod fifo;
pub mod heap;
pub mod queues;
pub mod waker;

pub use copygc::CopyGcWorker;
pub use fifo::Fifo;
pub use heap::{BoundedHeap, HeapCandidate};
pub use queues::{AllocQueues, QueueSizes, ReserveClass};
pub use waker::AllocatorWaker;
