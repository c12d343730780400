use super::{status, Completion, Engine, QueryId, RawResult, RR_CLASS_IN, RR_TYPE_A, RR_TYPE_AAAA};
use hickory_proto::{
    op::ResponseCode,
    rr::{Name, RData, RecordType},
    xfer::Protocol,
    ProtoError, ProtoErrorKind,
};
use hickory_resolver::{
    config::{NameServerConfig, ResolverConfig, ResolverOpts},
    lookup::Lookup,
    name_server::TokioConnectionProvider,
    system_conf::read_system_conf,
    ResolveError, TokioResolver,
};
use rustc_hash::FxHashMap;
use std::{
    collections::VecDeque,
    io::{self, Read, Write},
    net::{IpAddr, SocketAddr},
    os::{
        fd::{AsRawFd, RawFd},
        unix::net::UnixStream,
    },
    str::FromStr,
    sync::{Arc, Mutex, PoisonError},
};
use tokio::{
    runtime::{Builder, Runtime},
    sync::Semaphore,
    task::AbortHandle,
};
use tracing::{debug, trace, warn};

/// An engine running hickory lookups on a private worker runtime.
///
/// Options can be set until the first query is scheduled; that query builds
/// the worker and freezes the configuration.
pub struct HickoryEngine {
    options: Options,
    worker: Option<Worker>,
    in_flight: FxHashMap<QueryId, InFlight>,
    next_id: u32,
    next_serial: u64,
    reader: UnixStream,
    notifier: Arc<Notifier>,
}

#[derive(Debug, Clone)]
struct Options {
    interface: Option<IpAddr>,
    outgoing_interface: Option<IpAddr>,
    msg_cache_size: u64,
    rrset_cache_size: u64,
    key_cache_size: u64,
    verbosity: u8,
    outgoing_range: usize,
    queries_per_thread: usize,
    upstreams: Vec<SocketAddr>,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            interface: None,
            outgoing_interface: None,
            msg_cache_size: 32,
            rrset_cache_size: 32,
            key_cache_size: 32,
            verbosity: 1,
            outgoing_range: 4096,
            queries_per_thread: 1024,
            upstreams: Vec::new(),
        }
    }
}

struct InFlight {
    serial: u64,
    abort: AbortHandle,
}

struct Worker {
    runtime: Option<Runtime>,
    resolver: TokioResolver,
    permits: Arc<Semaphore>,
}

impl Drop for Worker {
    fn drop(&mut self) {
        // The engine is usually dropped on a thread driven by another runtime,
        // where blocking on shutdown is not allowed.
        if let Some(runtime) = self.runtime.take() {
            runtime.shutdown_background();
        }
    }
}

struct Finished {
    serial: u64,
    completion: Completion,
}

struct Notifier {
    queue: Mutex<VecDeque<Finished>>,
    writer: UnixStream,
}

impl Notifier {
    fn push(&self, finished: Finished) {
        self.queue
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push_back(finished);

        match (&self.writer).write(&[1]) {
            Ok(_) => {}
            // The descriptor is already readable.
            Err(err) if err.kind() == io::ErrorKind::WouldBlock => {}
            Err(err) => warn!(%err, "failed to signal engine readiness"),
        }
    }

    fn take(&self) -> VecDeque<Finished> {
        std::mem::take(&mut *self.queue.lock().unwrap_or_else(PoisonError::into_inner))
    }
}

impl HickoryEngine {
    pub fn create() -> io::Result<Self> {
        let (reader, writer) = UnixStream::pair()?;
        reader.set_nonblocking(true)?;
        writer.set_nonblocking(true)?;

        Ok(Self {
            options: Options::default(),
            worker: None,
            in_flight: FxHashMap::default(),
            next_id: 1,
            next_serial: 0,
            reader,
            notifier: Arc::new(Notifier {
                queue: Mutex::new(VecDeque::new()),
                writer,
            }),
        })
    }

    /// Creates the engine and points it at `upstreams` instead of the
    /// servers from the system configuration.
    pub fn with_upstreams(upstreams: Vec<SocketAddr>) -> io::Result<Self> {
        let mut engine = Self::create()?;
        engine.options.upstreams = upstreams;
        Ok(engine)
    }

    fn worker(&mut self) -> Result<&Worker, i32> {
        if self.worker.is_none() {
            self.worker = Some(self.build_worker()?);
        }

        self.worker.as_ref().ok_or(status::INIT_FAIL)
    }

    fn build_worker(&self) -> Result<Worker, i32> {
        let runtime = Builder::new_multi_thread()
            .worker_threads(1)
            .thread_name("resolver-engine")
            .enable_all()
            .build()
            .map_err(|err| {
                warn!(%err, "failed to start engine worker");
                status::INIT_FAIL
            })?;

        let mut config = ResolverConfig::new();
        for mut server in self.name_servers() {
            server.bind_addr = self.bind_addr(&server.socket_addr);
            config.add_name_server(server);
        }

        let resolver = {
            let _entered = runtime.enter();
            TokioResolver::builder_with_config(config, TokioConnectionProvider::default())
                .with_options(self.resolver_options())
                .build()
        };

        debug!(
            upstreams = ?self.options.upstreams,
            interface = ?self.options.interface,
            outgoing_interface = ?self.options.outgoing_interface,
            msg_cache_size = self.options.msg_cache_size,
            rrset_cache_size = self.options.rrset_cache_size,
            key_cache_size = self.options.key_cache_size,
            outgoing_range = self.options.outgoing_range,
            "engine finalized"
        );

        Ok(Worker {
            runtime: Some(runtime),
            resolver,
            permits: Arc::new(Semaphore::new(self.options.outgoing_range)),
        })
    }

    fn name_servers(&self) -> Vec<NameServerConfig> {
        if !self.options.upstreams.is_empty() {
            return self
                .options
                .upstreams
                .iter()
                .map(|addr| NameServerConfig::new(*addr, Protocol::Udp))
                .collect();
        }

        match read_system_conf() {
            Ok((config, _)) if !config.name_servers().is_empty() => {
                config.name_servers().to_vec()
            }
            Ok(_) => ResolverConfig::google().name_servers().to_vec(),
            Err(err) => {
                warn!(%err, "failed to read system resolver configuration");
                ResolverConfig::google().name_servers().to_vec()
            }
        }
    }

    /// Exchanges go out from the outgoing interface, or from the listening
    /// interface when no outgoing one is set.
    fn bind_addr(&self, server: &SocketAddr) -> Option<SocketAddr> {
        self.options
            .outgoing_interface
            .or(self.options.interface)
            .filter(|ip| !ip.is_unspecified())
            .filter(|ip| ip.is_ipv4() == server.is_ipv4())
            .map(|ip| SocketAddr::new(ip, 0))
    }

    /// hickory keeps a single cache for messages, record sets and keys; it is
    /// off as soon as any of the three is.
    fn resolver_options(&self) -> ResolverOpts {
        let smallest = self
            .options
            .msg_cache_size
            .min(self.options.rrset_cache_size)
            .min(self.options.key_cache_size);

        let mut options = ResolverOpts::default();
        options.cache_size = usize::try_from(smallest).unwrap_or(usize::MAX);
        options
    }

    fn allocate_id(&mut self) -> QueryId {
        loop {
            let id = QueryId(self.next_id);
            self.next_id = self.next_id.checked_add(1).unwrap_or(1);
            if !self.in_flight.contains_key(&id) {
                return id;
            }
        }
    }
}

impl Engine for HickoryEngine {
    fn set_option(&mut self, name: &str, value: &str) -> Result<(), i32> {
        if self.worker.is_some() {
            return Err(status::AFTER_FINAL);
        }

        let value = value.trim();
        match name {
            "interface:" => self.options.interface = Some(parse(value)?),
            "outgoing-interface:" => self.options.outgoing_interface = Some(parse(value)?),
            "msg-cache-size:" => self.options.msg_cache_size = parse_size(value)?,
            "rrset-cache-size:" => self.options.rrset_cache_size = parse_size(value)?,
            "key-cache-size:" => self.options.key_cache_size = parse_size(value)?,
            "module-config:" => {
                if value != "iterator" {
                    return Err(status::SYNTAX);
                }
            }
            "verbosity:" => self.options.verbosity = parse(value)?,
            "outgoing-range:" => self.options.outgoing_range = parse_count(value)?,
            "num-queries-per-thread:" => self.options.queries_per_thread = parse_count(value)?,
            "upstream:" => self.options.upstreams.push(parse(value)?),
            _ => return Err(status::SYNTAX),
        }

        Ok(())
    }

    fn readiness_fd(&self) -> RawFd {
        self.reader.as_raw_fd()
    }

    fn resolve_async(&mut self, name: &str, rrtype: u16, rrclass: u16) -> Result<QueryId, i32> {
        let record_type = match (rrtype, rrclass) {
            (RR_TYPE_A, RR_CLASS_IN) => RecordType::A,
            (RR_TYPE_AAAA, RR_CLASS_IN) => RecordType::AAAA,
            _ => return Err(status::SYNTAX),
        };
        let qname = Name::from_str(name).map_err(|_| status::SYNTAX)?;

        if self.in_flight.len() >= self.options.queries_per_thread {
            return Err(status::NOMEM);
        }

        let id = self.allocate_id();
        let serial = self.next_serial;
        self.next_serial += 1;

        let verbose = self.options.verbosity >= 2;
        let notifier = self.notifier.clone();
        let worker = self.worker()?;
        let resolver = worker.resolver.clone();
        let permits = worker.permits.clone();
        let Some(runtime) = worker.runtime.as_ref() else {
            return Err(status::INIT_FAIL);
        };

        let task = runtime.spawn(async move {
            // Only fails once the semaphore is closed, which never happens.
            let _permit = permits.acquire_owned().await.ok();

            let completion = match resolver.lookup(qname.clone(), record_type).await {
                Ok(lookup) => answered(id, &qname, rrtype, &lookup),
                Err(err) => failed(id, &qname, rrtype, &err),
            };

            if verbose {
                debug!(%id, name = %qname, status = completion.status, "engine finished query");
            }

            notifier.push(Finished { serial, completion });
        });

        self.in_flight.insert(
            id,
            InFlight {
                serial,
                abort: task.abort_handle(),
            },
        );

        Ok(id)
    }

    fn cancel(&mut self, id: QueryId) -> Result<(), i32> {
        match self.in_flight.remove(&id) {
            Some(query) => {
                query.abort.abort();
                Ok(())
            }
            None => Err(status::NO_ID),
        }
    }

    fn process(&mut self, deliver: &mut dyn FnMut(Completion)) -> io::Result<()> {
        let mut buf = [0u8; 256];
        loop {
            match (&self.reader).read(&mut buf) {
                Ok(0) => return Err(io::ErrorKind::UnexpectedEof.into()),
                Ok(_) => continue,
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => break,
                Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) => return Err(err),
            }
        }

        for finished in self.notifier.take() {
            let id = finished.completion.id;
            match self.in_flight.get(&id) {
                Some(query) if query.serial == finished.serial => {
                    self.in_flight.remove(&id);
                    deliver(finished.completion);
                }
                _ => trace!(%id, "discarding completion of a cancelled query"),
            }
        }

        Ok(())
    }
}

impl Drop for HickoryEngine {
    fn drop(&mut self) {
        for (_, query) in self.in_flight.drain() {
            query.abort.abort();
        }
    }
}

fn parse<T: FromStr>(value: &str) -> Result<T, i32> {
    value.parse().map_err(|_| status::SYNTAX)
}

fn parse_count(value: &str) -> Result<usize, i32> {
    match parse::<usize>(value)? {
        0 => Err(status::SYNTAX),
        count => Ok(count),
    }
}

/// Parses sizes such as `0`, `512k` or `4m`.
fn parse_size(value: &str) -> Result<u64, i32> {
    let (digits, scale) = match value.char_indices().last() {
        Some((i, 'k' | 'K')) => (&value[..i], 1 << 10),
        Some((i, 'm' | 'M')) => (&value[..i], 1 << 20),
        Some((i, 'g' | 'G')) => (&value[..i], 1 << 30),
        _ => (value, 1),
    };

    parse::<u64>(digits)?
        .checked_mul(scale)
        .ok_or(status::SYNTAX)
}

fn answered(id: QueryId, qname: &Name, rrtype: u16, lookup: &Lookup) -> Completion {
    let data: Vec<Vec<u8>> = lookup
        .record_iter()
        .filter_map(|record| match record.data() {
            RData::A(a) => Some(a.0.octets().to_vec()),
            RData::AAAA(aaaa) => Some(aaaa.0.octets().to_vec()),
            _ => None,
        })
        .collect();

    let canonname = lookup.record_iter().find_map(|record| match record.data() {
        RData::CNAME(cname) => Some(cname.0.to_utf8()),
        _ => None,
    });

    Completion {
        id,
        status: 0,
        result: Some(RawResult {
            qname: qname.to_utf8(),
            qtype: rrtype,
            qclass: RR_CLASS_IN,
            has_data: !data.is_empty(),
            data,
            canonname,
            rcode: 0,
            nxdomain: false,
            ttl: lookup.record_iter().map(|record| record.ttl()).min().unwrap_or(0),
        }),
    }
}

fn failed(id: QueryId, qname: &Name, rrtype: u16, err: &ResolveError) -> Completion {
    match err.proto().map(ProtoError::kind) {
        Some(ProtoErrorKind::NoRecordsFound { response_code, .. }) => Completion {
            id,
            status: 0,
            result: Some(RawResult {
                qname: qname.to_utf8(),
                qtype: rrtype,
                qclass: RR_CLASS_IN,
                rcode: u16::from(*response_code),
                nxdomain: *response_code == ResponseCode::NXDomain,
                ..Default::default()
            }),
        },
        _ => {
            debug!(%id, name = %qname, %err, "engine lookup failed");
            Completion {
                id,
                status: status::SERVFAIL,
                result: None,
            }
        }
    }
}
