// Module Definition
pub mod chunked; // Row partitioning + Rayon map over chunks
pub mod cluster; // Worker pool with bounded task slots
pub mod controller; // Main logic binding steps, kernels and modes
pub mod dispatch; // Type/shape keyed specialisation cache
pub mod kernels; // Cumulative walk kernels
pub mod memory;
pub mod rng;
pub mod stats;
