pub mod circuit;
pub mod wal;
