// Library for tests to access modules

pub mod config;
pub mod counter;
pub mod error;
pub mod models;
pub mod poller;
pub mod transport;
pub mod vendor;
pub mod version;
pub mod worker;
