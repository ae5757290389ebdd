mod filter_policy;

pub use filter_policy::{BloomFilterPolicy, FilterPolicy};
