pub mod broker;

pub use broker::{Bearer, TokenBroker};
