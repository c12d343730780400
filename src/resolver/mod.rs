pub mod bridge;

use crate::{
    config::Config,
    engine::{hickory::HickoryEngine, status, Engine, QueryId, RawResult, RR_CLASS_IN, RR_TYPE_A},
    error::{Error, ResolveError},
    lookup::{CancelQuery, Lookup},
    Result,
};
use bridge::{BridgeState, ReadinessHandle};
use futures::channel::oneshot;
use rustc_hash::FxHashMap;
use std::{
    cell::{Cell, OnceCell, RefCell},
    fmt::{self, Debug},
    io,
    net::Ipv4Addr,
    os::fd::RawFd,
    rc::Rc,
    time::Duration,
};
use tokio::{io::unix::AsyncFd, task::JoinHandle};
use tracing::{debug, error, info_span, trace, warn, Span};

pub type Resolution = std::result::Result<Vec<Ipv4Addr>, ResolveError>;

type Callback = Box<dyn FnOnce(Resolution)>;

struct PendingQuery {
    name: String,
    on_complete: Callback,
}

/// A resolver bound to the reactor of the thread that created it.
///
/// Every completion callback runs on this thread, either from the readiness
/// monitor spawned by [`Resolver::start`] or, when the engine refuses a query
/// outright, from inside [`Resolver::submit`].
pub struct Resolver<E: Engine + 'static> {
    shared: Rc<Shared<E>>,
}

pub(crate) struct Shared<E: Engine> {
    // Dropped before `engine`: the registration must go before the engine
    // closes the descriptor.
    readiness: OnceCell<AsyncFd<ReadinessHandle>>,
    engine: RefCell<E>,
    pending: RefCell<FxHashMap<QueryId, PendingQuery>>,
    state: Cell<BridgeState>,
    draining: Cell<bool>,
    monitor: RefCell<Option<JoinHandle<()>>>,
    config: Config,
    span: Span,
}

impl Resolver<HickoryEngine> {
    pub fn new(config: Config) -> Result<Self> {
        let span = default_span(&config);
        Self::with_engine(config, span, HickoryEngine::create)
    }
}

fn default_span(config: &Config) -> Span {
    info_span!("resolver", outbound = %config.outbound)
}

impl<E: Engine + 'static> Resolver<E> {
    /// Allocates the engine context with `create` and applies the fixed option
    /// profile of `config` to it.
    pub fn with_engine<F>(config: Config, span: Span, create: F) -> Result<Self>
    where
        F: FnOnce() -> io::Result<E>,
    {
        let mut engine = span.in_scope(create).map_err(Error::EngineInit)?;

        for (name, value) in config.engine_options() {
            if let Err(code) = engine.set_option(name, &value) {
                error!(parent: &span, name, %value, code, "engine rejected option");
                return Err(Error::EngineOption {
                    name: name.to_owned(),
                    value,
                    code,
                });
            }
        }

        debug!(parent: &span, concurrency = config.concurrency, "resolver created");

        Ok(Self {
            shared: Rc::new(Shared {
                readiness: OnceCell::new(),
                engine: RefCell::new(engine),
                pending: RefCell::new(FxHashMap::default()),
                state: Cell::new(BridgeState::Idle),
                draining: Cell::new(false),
                monitor: RefCell::new(None),
                config,
                span,
            }),
        })
    }

    /// Starts monitoring the engine's readiness descriptor.
    ///
    /// Must be called from within a [`tokio::task::LocalSet`] on a runtime
    /// with IO enabled. Fails with [`Error::AlreadyStarted`] on a second call.
    pub fn start(&self) -> Result<()> {
        self.shared.start()
    }

    /// Schedules an A lookup for `name`. `on_complete` is called exactly once,
    /// unless the query is cancelled or the resolver is dropped first.
    ///
    /// When the engine refuses the query, `on_complete` runs before this
    /// returns and the returned id is [`QueryId::NONE`].
    pub fn submit<F>(&self, name: &str, on_complete: F) -> QueryId
    where
        F: FnOnce(Resolution) + 'static,
    {
        self.shared.submit(name, Box::new(on_complete))
    }

    /// Returns `false` when `id` is not pending, which includes queries whose
    /// callback already ran. On `true` the callback will never run.
    pub fn cancel(&self, id: QueryId) -> bool {
        self.shared.cancel(id)
    }

    /// A future resolving `name`; dropping it before it finishes cancels the
    /// query.
    pub fn lookup(&self, name: &str) -> Lookup {
        let (sender, receiver) = oneshot::channel();
        let id = self.submit(name, move |result| {
            let _ = sender.send(result);
        });

        let shared: Rc<dyn CancelQuery> = self.shared.clone();
        Lookup::new(id, receiver, Rc::downgrade(&shared))
    }

    /// Like [`Resolver::lookup`], cancelling the query once `timeout` passes.
    pub async fn lookup_timeout(&self, name: &str, timeout: Duration) -> Resolution {
        tokio::time::timeout(timeout, self.lookup(name))
            .await
            .unwrap_or(Err(ResolveError::TimedOut))
    }

    /// Handles one readiness event from the host reactor. The monitor task
    /// started by [`Resolver::start`] calls this for every event.
    pub fn on_readiness_event(&self, event: io::Result<()>) -> BridgeState {
        self.shared.on_readiness_event(event)
    }

    pub fn state(&self) -> BridgeState {
        self.shared.state.get()
    }

    pub fn is_stopped(&self) -> bool {
        self.state() == BridgeState::Stopped
    }

    pub fn pending_queries(&self) -> usize {
        self.shared.pending.borrow().len()
    }

    pub fn readiness_fd(&self) -> RawFd {
        self.shared.engine.borrow().readiness_fd()
    }

    pub fn config(&self) -> &Config {
        &self.shared.config
    }

    /// Stops monitoring and releases the engine. Pending callbacks are
    /// dropped without being called.
    pub fn destroy(self) {
        debug!(parent: &self.shared.span, "destroying resolver");
    }
}

impl<E: Engine + 'static> Drop for Resolver<E> {
    fn drop(&mut self) {
        if let Some(monitor) = self.shared.monitor.borrow_mut().take() {
            monitor.abort();
        }

        let abandoned = std::mem::take(&mut *self.shared.pending.borrow_mut());
        if !abandoned.is_empty() {
            debug!(
                parent: &self.shared.span,
                count = abandoned.len(),
                "abandoning pending queries"
            );
        }
    }
}

impl<E: Engine + 'static> Debug for Resolver<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Resolver")
            .field("outbound", &self.shared.config.outbound)
            .field("state", &self.shared.state.get())
            .field("pending", &self.shared.pending.borrow().len())
            .finish()
    }
}

impl<E: Engine> Shared<E> {
    fn submit(&self, name: &str, on_complete: Callback) -> QueryId {
        let _entered = self.span.enter();

        let submitted = self
            .engine
            .borrow_mut()
            .resolve_async(name, RR_TYPE_A, RR_CLASS_IN);

        let id = match submitted {
            Ok(id) => id,
            Err(code) => {
                warn!(name, code, "engine rejected query");
                on_complete(Err(ResolveError::Rejected(code)));
                return QueryId::NONE;
            }
        };

        let mut pending = self.pending.borrow_mut();
        // The engine keeps running its own query under a reused id, and its
        // completion goes to the callback already registered there.
        if id.is_none() || pending.contains_key(&id) {
            drop(pending);
            error!(%id, name, "engine handed out an id that is not free");
            on_complete(Err(ResolveError::Rejected(status::NO_ID)));
            return QueryId::NONE;
        }

        pending.insert(
            id,
            PendingQuery {
                name: name.to_owned(),
                on_complete,
            },
        );
        trace!(%id, name, "query submitted");

        id
    }

    fn cancel(&self, id: QueryId) -> bool {
        let _entered = self.span.enter();

        let removed = self.pending.borrow_mut().remove(&id);
        let Some(query) = removed else {
            trace!(%id, "nothing to cancel");
            return false;
        };

        // The registry decides: a completion the engine still delivers for
        // this id finds no callback.
        if let Err(code) = self.engine.borrow_mut().cancel(id) {
            debug!(%id, code, "engine no longer tracks the cancelled query");
        }
        debug!(%id, name = %query.name, "query cancelled");

        true
    }

    /// Runs the engine's drain once and dispatches what it delivered.
    /// Returns the number of callbacks invoked, or the engine's error once its
    /// readiness channel is unusable.
    fn drain(&self) -> io::Result<usize> {
        let mut ready = Vec::new();
        let processed = self
            .engine
            .borrow_mut()
            .process(&mut |completion| ready.push(completion));

        let mut delivered = 0;
        for completion in ready {
            let query = self.pending.borrow_mut().remove(&completion.id);
            let Some(query) = query else {
                trace!(id = %completion.id, "dropping completion of a query no longer pending");
                continue;
            };

            let result = translate(completion.status, completion.result.as_ref());
            match &result {
                Ok(addrs) => debug!(id = %completion.id, name = %query.name, ?addrs, "resolved"),
                Err(err) => debug!(id = %completion.id, name = %query.name, %err, "resolution failed"),
            }

            (query.on_complete)(result);
            delivered += 1;
        }

        processed.map(|()| delivered)
    }
}

impl<E: Engine> CancelQuery for Shared<E> {
    fn cancel_query(&self, id: QueryId) -> bool {
        self.cancel(id)
    }
}

/// Turns a raw engine completion into the caller facing result.
pub fn translate(status: i32, raw: Option<&RawResult>) -> Resolution {
    if status != 0 {
        return Err(ResolveError::Failed(status));
    }

    match raw {
        Some(raw) if raw.has_data => {
            let addrs: Vec<Ipv4Addr> = raw
                .data
                .iter()
                .filter_map(|rdata| <[u8; 4]>::try_from(rdata.as_slice()).ok())
                .map(Ipv4Addr::from)
                .collect();

            if addrs.is_empty() {
                Err(ResolveError::Malformed)
            } else {
                Ok(addrs)
            }
        }
        Some(raw) if raw.rcode != 0 => Err(ResolveError::Response(raw.rcode)),
        _ => Err(ResolveError::Canceled),
    }
}
