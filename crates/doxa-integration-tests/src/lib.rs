//! This crate has no library surface of its own; it exists to host the
//! cross-crate end-to-end scenarios under `tests/`.
