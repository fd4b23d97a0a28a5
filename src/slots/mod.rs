pub mod codec;
pub mod error;
pub mod model;
pub mod mutation;
pub mod segmenter;
pub mod storage;
pub mod store;
