//! Bounded queues of asynchronous work.

pub mod work;
