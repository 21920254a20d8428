pub mod engine;
pub mod feed;
pub mod http;
pub mod limits;
pub mod model;
pub mod observability;
pub mod sync;
pub mod tenant;
pub mod wal;
