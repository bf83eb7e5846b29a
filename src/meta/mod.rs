pub mod block_meta;
pub mod line_meta;
pub mod object_meta;
