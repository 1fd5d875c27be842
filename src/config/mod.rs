mod loader;
mod schema;

pub use loader::load;
pub use schema::{Config, DEFAULT_BUFFER_SIZE, DEFAULT_LISTEN_ADDR, DEFAULT_MAX_BODY_SIZE};
