pub mod block;
pub mod block_builder;
pub mod block_handler;
pub mod filter_block;
pub mod table_builder;
pub mod table_reader;

pub use table_builder::TableBuilder;
pub use table_reader::Table;

const SIZE_U32: usize = std::mem::size_of::<u32>();
