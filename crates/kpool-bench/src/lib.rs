//! Benchmark host crate; see `benches/`.
