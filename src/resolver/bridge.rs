use super::Shared;
use crate::{engine::Engine, error::Error, Result};
use std::{
    io,
    os::fd::{AsRawFd, RawFd},
    rc::Rc,
};
use tokio::io::{unix::AsyncFd, Interest};
use tracing::{error, info, trace, warn};

/// Where the readiness monitor is in its life.
///
/// `Armed` moves to `Stopped` once, when the reactor reports an error or a
/// hang-up on the descriptor, or when the engine can no longer read it.
/// Nothing leaves `Stopped`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BridgeState {
    Idle,
    Armed,
    Stopped,
}

/// The engine's readiness descriptor as seen by the reactor. The engine owns
/// and closes the descriptor; this only borrows its number.
pub(crate) struct ReadinessHandle(RawFd);

impl AsRawFd for ReadinessHandle {
    fn as_raw_fd(&self) -> RawFd {
        self.0
    }
}

impl<E: Engine + 'static> Shared<E> {
    pub(super) fn start(self: &Rc<Self>) -> Result<()> {
        let _entered = self.span.enter();

        if self.state.get() != BridgeState::Idle {
            return Err(Error::AlreadyStarted);
        }

        let fd = self.engine.borrow().readiness_fd();
        let readiness = AsyncFd::with_interest(ReadinessHandle(fd), Interest::READABLE)?;
        if self.readiness.set(readiness).is_err() {
            return Err(Error::AlreadyStarted);
        }

        self.state.set(BridgeState::Armed);
        *self.monitor.borrow_mut() = Some(tokio::task::spawn_local(monitor(self.clone())));

        info!(fd, "monitoring engine readiness");

        Ok(())
    }
}

impl<E: Engine> Shared<E> {
    pub(super) fn on_readiness_event(&self, event: io::Result<()>) -> BridgeState {
        let _entered = self.span.enter();

        if self.state.get() != BridgeState::Armed {
            return self.state.get();
        }

        if self.draining.get() {
            warn!("ignoring readiness event raised from inside a drain");
            return BridgeState::Armed;
        }

        let drained = event.and_then(|()| {
            self.draining.set(true);
            let _draining = scopeguard::guard(&self.draining, |draining| draining.set(false));

            self.drain()
        });

        match drained {
            Ok(delivered) => trace!(delivered, "drained engine"),
            Err(err) => {
                error!(%err, "readiness handle failed, no further query will complete");
                self.state.set(BridgeState::Stopped);
            }
        }

        self.state.get()
    }
}

async fn monitor<E: Engine>(shared: Rc<Shared<E>>) {
    let Some(readiness) = shared.readiness.get() else {
        return;
    };

    loop {
        let event = match readiness.readable().await {
            // Closed readiness survives `clear_ready`, so the descriptor would
            // report ready forever.
            Ok(guard) if guard.ready().is_read_closed() || guard.ready().is_error() => {
                Err(io::Error::new(
                    io::ErrorKind::BrokenPipe,
                    "engine readiness channel closed",
                ))
            }
            Ok(mut guard) => {
                // The drain reads the descriptor until it would block, so any
                // byte written after this point raises a fresh event.
                guard.clear_ready();
                Ok(())
            }
            Err(err) => Err(err),
        };

        if shared.on_readiness_event(event) != BridgeState::Armed {
            break;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        config::Config,
        engine::testing::{answer, negative, ScriptedEngine},
        error::ResolveError,
        resolver::{Resolution, Resolver},
    };
    use std::{cell::RefCell, net::Ipv4Addr, time::Duration};
    use tokio::task::LocalSet;
    use tracing::Span;

    fn scripted() -> (Resolver<ScriptedEngine>, crate::engine::testing::ScriptHandle) {
        let (engine, handle) = ScriptedEngine::new().unwrap();
        let resolver = Resolver::with_engine(
            Config::new("127.0.0.1".parse().unwrap()),
            Span::none(),
            move || Ok(engine),
        )
        .unwrap();
        (resolver, handle)
    }

    async fn settle() {
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    #[test]
    fn events_before_start_are_ignored() {
        let (resolver, handle) = scripted();

        assert_eq!(resolver.on_readiness_event(Ok(())), BridgeState::Idle);
        assert_eq!(handle.process_calls(), 0);
    }

    #[test_log::test(tokio::test)]
    async fn start_twice_fails() {
        LocalSet::new()
            .run_until(async {
                let (resolver, _handle) = scripted();

                resolver.start().unwrap();
                assert_eq!(resolver.state(), BridgeState::Armed);
                assert!(matches!(resolver.start(), Err(Error::AlreadyStarted)));
            })
            .await;
    }

    #[test_log::test(tokio::test)]
    async fn empty_drain_keeps_monitoring_armed() {
        LocalSet::new()
            .run_until(async {
                let (resolver, handle) = scripted();
                resolver.start().unwrap();

                assert_eq!(resolver.on_readiness_event(Ok(())), BridgeState::Armed);
                assert_eq!(handle.process_calls(), 1);

                // A spurious wake-up with nothing queued.
                handle.signal();
                settle().await;

                assert_eq!(resolver.state(), BridgeState::Armed);
                assert_eq!(handle.process_calls(), 2);
            })
            .await;
    }

    #[test_log::test(tokio::test)]
    async fn readiness_drives_callbacks() {
        LocalSet::new()
            .run_until(async {
                let (resolver, handle) = scripted();
                resolver.start().unwrap();

                let results = Rc::new(RefCell::new(Vec::<Resolution>::new()));
                let ids: Vec<_> = ["ok.example", "example.invalid", "third.example"]
                    .into_iter()
                    .map(|name| {
                        let results = results.clone();
                        resolver.submit(name, move |r| results.borrow_mut().push(r))
                    })
                    .collect();

                let addrs: Vec<Ipv4Addr> =
                    vec!["192.0.2.1".parse().unwrap(), "192.0.2.2".parse().unwrap()];
                handle.queue(ids[0], 0, Some(answer(&addrs)));
                handle.queue(ids[1], 0, Some(negative(3)));
                handle.signal();
                settle().await;

                assert_eq!(
                    *results.borrow(),
                    vec![Ok(addrs.clone()), Err(ResolveError::Response(3))]
                );

                // Monitoring was re-armed after the first drain.
                handle.answer(ids[2], &addrs[..1]);
                settle().await;

                assert_eq!(results.borrow().len(), 3);
                assert_eq!(resolver.pending_queries(), 0);
            })
            .await;
    }

    #[test_log::test(tokio::test)]
    async fn lookup_future_resolves_through_the_monitor() {
        LocalSet::new()
            .run_until(async {
                let (resolver, handle) = scripted();
                resolver.start().unwrap();

                let lookup = resolver.lookup("ok.example");
                let id = handle.pending()[0].0;
                handle.answer(id, &["198.51.100.7".parse().unwrap()]);

                assert_eq!(lookup.await, Ok(vec!["198.51.100.7".parse().unwrap()]));
            })
            .await;
    }

    #[test_log::test(tokio::test)]
    async fn handle_error_stops_monitoring_for_good() {
        LocalSet::new()
            .run_until(async {
                let (resolver, handle) = scripted();
                resolver.start().unwrap();

                let broken = io::Error::from(io::ErrorKind::BrokenPipe);
                let state = resolver.on_readiness_event(Err(broken));
                assert_eq!(state, BridgeState::Stopped);
                assert!(resolver.is_stopped());
                settle().await;

                let fired = Rc::new(RefCell::new(false));
                let id = {
                    let fired = fired.clone();
                    resolver.submit("late.example", move |_| *fired.borrow_mut() = true)
                };
                handle.answer(id, &["192.0.2.9".parse().unwrap()]);

                let lookup = resolver.lookup("later.example");
                assert_eq!(
                    tokio::time::timeout(Duration::from_millis(100), lookup).await.ok(),
                    None
                );
                assert!(!*fired.borrow());
                assert_eq!(resolver.on_readiness_event(Ok(())), BridgeState::Stopped);
                assert!(!*fired.borrow());
            })
            .await;
    }

    #[test_log::test(tokio::test)]
    async fn closed_readiness_channel_stops_the_monitor() {
        LocalSet::new()
            .run_until(async {
                let (resolver, handle) = scripted();
                resolver.start().unwrap();

                let lookup = resolver.lookup("ok.example");
                handle.close();

                tokio::time::timeout(Duration::from_secs(1), async {
                    while !resolver.is_stopped() {
                        tokio::time::sleep(Duration::from_millis(5)).await;
                    }
                })
                .await
                .unwrap();

                assert!(handle.process_calls() <= 1);
                assert_eq!(resolver.pending_queries(), 1);
                assert_eq!(
                    tokio::time::timeout(Duration::from_millis(50), lookup).await.ok(),
                    None
                );
            })
            .await;
    }

    #[test_log::test(tokio::test)]
    async fn engine_failing_to_read_its_channel_stops_monitoring() {
        LocalSet::new()
            .run_until(async {
                let (resolver, handle) = scripted();
                resolver.start().unwrap();

                // The monitor has not run yet; drive the event by hand.
                handle.close();
                assert_eq!(resolver.on_readiness_event(Ok(())), BridgeState::Stopped);
                assert_eq!(handle.process_calls(), 0);
                assert!(!resolver.shared.draining.get());
            })
            .await;
    }

    #[test_log::test(tokio::test)]
    async fn timeout_cancels_the_query() {
        LocalSet::new()
            .run_until(async {
                let (resolver, handle) = scripted();
                resolver.start().unwrap();

                let result = resolver
                    .lookup_timeout("slow.example", Duration::from_millis(20))
                    .await;

                assert_eq!(result, Err(ResolveError::TimedOut));
                assert_eq!(resolver.pending_queries(), 0);
                assert_eq!(handle.cancelled().len(), 1);
            })
            .await;
    }
}
