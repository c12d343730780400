use serde::Deserialize;
use std::net::{IpAddr, Ipv4Addr};

pub const DEFAULT_CONCURRENCY: u32 = 4096;
pub const DEFAULT_VERBOSITY: u8 = 1;

/// Settings fixed when the resolver is created.
///
/// Caching and the processing module are not part of this struct: caches are
/// always disabled and the engine always runs only its iterator module.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct Config {
    pub outbound: IpAddr,
    #[serde(default = "default_concurrency")]
    pub concurrency: u32,
    #[serde(default = "default_verbosity")]
    pub verbosity: u8,
}

fn default_concurrency() -> u32 {
    DEFAULT_CONCURRENCY
}

fn default_verbosity() -> u8 {
    DEFAULT_VERBOSITY
}

impl Config {
    pub fn new(outbound: IpAddr) -> Self {
        Self {
            outbound,
            concurrency: DEFAULT_CONCURRENCY,
            verbosity: DEFAULT_VERBOSITY,
        }
    }

    /// The option profile handed to the engine, in the order it is applied.
    pub fn engine_options(&self) -> Vec<(&'static str, String)> {
        let outbound = self.outbound.to_string();
        vec![
            ("interface:", outbound.clone()),
            ("outgoing-interface:", outbound),
            ("msg-cache-size:", "0".to_owned()),
            ("rrset-cache-size:", "0".to_owned()),
            ("key-cache-size:", "0".to_owned()),
            ("module-config:", "iterator".to_owned()),
            ("verbosity:", self.verbosity.to_string()),
            ("outgoing-range:", self.concurrency.to_string()),
            ("num-queries-per-thread:", self.concurrency.to_string()),
        ]
    }
}

impl Default for Config {
    fn default() -> Self {
        Self::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED))
    }
}
