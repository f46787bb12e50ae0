pub(crate) mod bloom_filter;

pub use bloom_filter::BloomFilter;
