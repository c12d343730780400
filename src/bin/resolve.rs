use anyhow::Context;
use dandelion_resolver::{engine::hickory::HickoryEngine, Config, Resolver};
use futures::future::join_all;
use itertools::Itertools;
use std::{
    net::{IpAddr, SocketAddr},
    time::Duration,
};
use structopt::StructOpt;
use tokio::task::LocalSet;
use tracing::info_span;

#[derive(Debug, StructOpt)]
#[structopt(name = "dandelion-resolve", about = "Resolve IPv4 addresses of host names")]
struct Opt {
    /// Address queries are sent from
    #[structopt(long, default_value = "0.0.0.0")]
    outbound: IpAddr,

    /// Name server to query, may be repeated; defaults to the system ones
    #[structopt(long)]
    upstream: Vec<SocketAddr>,

    /// Give up on a name after this many milliseconds
    #[structopt(long, default_value = "5000")]
    timeout: u64,

    #[structopt(long, default_value = "4096")]
    concurrency: u32,

    names: Vec<String>,
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> anyhow::Result<()> {
    let _logger =
        flexi_logger::Logger::try_with_env_or_str("warn,dandelion_resolver=info")?.start()?;

    let opt = Opt::from_args();

    let config = Config {
        concurrency: opt.concurrency,
        ..Config::new(opt.outbound)
    };
    let span = info_span!("resolver", outbound = %config.outbound);
    let upstreams = opt.upstream.clone();

    let resolver = Resolver::with_engine(config, span, move || {
        if upstreams.is_empty() {
            HickoryEngine::create()
        } else {
            HickoryEngine::with_upstreams(upstreams)
        }
    })
    .context("Failed to create resolver")?;

    let timeout = Duration::from_millis(opt.timeout);

    LocalSet::new()
        .run_until(async move {
            resolver.start().context("Failed to start resolver")?;

            let results = join_all(
                opt.names
                    .iter()
                    .map(|name| resolver.lookup_timeout(name, timeout)),
            )
            .await;

            for (name, result) in opt.names.iter().zip(results) {
                match result {
                    Ok(addrs) => println!("{}: {}", name, addrs.iter().join(", ")),
                    Err(err) => println!("{}: {}", name, err),
                }
            }

            log::debug!("Resolved {} names", opt.names.len());

            anyhow::Ok(())
        })
        .await
}
