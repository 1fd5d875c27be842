//! In-memory capture of proxied traffic.
//!
//! [`CaptureStore`] keeps the most recent transactions in a bounded ring and
//! answers filtered queries and aggregate statistics over them.

mod filter;
mod listener;
mod store;
mod types;

pub use filter::{is_textual, match_host, matches_filter, MAX_SEARCHABLE_BODY};
pub use listener::{CaptureListener, ListenerHandle, DEFAULT_LISTENER_QUEUE};
pub use store::CaptureStore;
pub use types::{CaptureStats, CapturedRequest, FilterOptions, HeaderValues};
