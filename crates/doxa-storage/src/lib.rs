//! Object-store abstraction, Parquet columnar codec, `$data`-variant
//! reconstruction, and the cached read path.

pub mod cache;
pub mod columnar;
pub mod objectstore;
