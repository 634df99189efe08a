pub mod chats;
pub mod error;
pub mod lifecycle;
pub mod media;
pub mod messages;
pub mod middleware;
pub mod records;
pub mod routes;
pub mod state;
