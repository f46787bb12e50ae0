#[macro_use]
extern crate log;

pub mod config;
pub mod entry;
pub mod env;
pub mod error;
pub mod file;
pub mod filter;
mod hash;
pub mod segment;
pub mod slice;

pub type Result<T> = std::result::Result<T, error::Error>;

pub use config::SegmentConfig;
pub use segment::Segment;
