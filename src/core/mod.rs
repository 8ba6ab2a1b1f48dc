// Core modules implementing the store seam, codec, cursors, and error modeling.
pub mod cancel;
pub mod codec;
pub mod connection;
pub mod cursor;
pub mod error;
pub mod memory;
pub mod notify;
pub mod position;
pub mod resp;
pub mod store;
