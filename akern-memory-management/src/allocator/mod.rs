//! Physical allocators
//!
//! The buddy allocator hands out page frames per zone; the slab allocator
//! carves buddy pages into fixed-size objects.

pub mod buddy;
pub mod slab;
