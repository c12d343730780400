pub mod config;
pub mod engine;
pub mod error;
pub mod lookup;
pub mod resolver;

pub use config::Config;
pub use engine::QueryId;
pub use error::{Error, ResolveError};
pub use lookup::{AddressResolver, Lookup};
pub use resolver::{bridge::BridgeState, Resolver};

pub type Result<T> = std::result::Result<T, Error>;
