pub mod connection;
pub mod credentials;
pub mod dispatcher;
pub mod policy;
pub mod routing;
