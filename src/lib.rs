pub mod bridge;
pub mod config;
pub mod coordinator;
pub mod delivery;
pub mod discovery;
pub mod friends;
pub mod handlers;
pub mod logging;
pub mod protocol;
pub mod storage;
pub mod transport;
