pub mod buffer;
pub mod builder;
pub mod core;
pub mod data;
pub mod ipc;
pub mod types;
pub mod value;
pub mod vector;

#[cfg(feature = "testutil")]
pub mod testutil;
