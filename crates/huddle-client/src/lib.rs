//! Client-side synchronization for huddle chats: merges history pages,
//! live relay events and optimistic sends into one consistent timeline.

pub mod api;
pub mod credentials;
pub mod error;
pub mod receipts;
pub mod session;
pub mod single_flight;
pub mod timeline;
pub mod typing;

pub use error::ClientError;
pub use timeline::Timeline;
