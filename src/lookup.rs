use crate::{
    engine::{Engine, QueryId},
    error::ResolveError,
    resolver::{Resolution, Resolver},
};
use futures::{channel::oneshot, FutureExt};
use std::{
    fmt::Debug,
    future::Future,
    net::IpAddr,
    pin::Pin,
    rc::Weak,
    task::{Context, Poll},
};

pub(crate) trait CancelQuery {
    fn cancel_query(&self, id: QueryId) -> bool;
}

/// An address lookup in flight. Dropping it early cancels the query.
pub struct Lookup {
    id: QueryId,
    receiver: oneshot::Receiver<Resolution>,
    resolver: Weak<dyn CancelQuery>,
    finished: bool,
}

impl Lookup {
    pub(crate) fn new(
        id: QueryId,
        receiver: oneshot::Receiver<Resolution>,
        resolver: Weak<dyn CancelQuery>,
    ) -> Self {
        Self {
            id,
            receiver,
            resolver,
            finished: false,
        }
    }

    pub fn id(&self) -> QueryId {
        self.id
    }
}

impl Future for Lookup {
    type Output = Resolution;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let received = futures::ready!(self.receiver.poll_unpin(cx));
        self.finished = true;

        // A dropped sender means the resolver went away with the query.
        Poll::Ready(received.unwrap_or(Err(ResolveError::Canceled)))
    }
}

impl Drop for Lookup {
    fn drop(&mut self) {
        if self.finished || self.id.is_none() {
            return;
        }

        if let Some(resolver) = self.resolver.upgrade() {
            resolver.cancel_query(self.id);
        }
    }
}

#[async_trait::async_trait(?Send)]
#[auto_impl::auto_impl(&, Rc)]
pub trait AddressResolver: Debug {
    async fn lookup_ipv4(&self, name: &str) -> Resolution;

    async fn lookup_ip(&self, name: &str) -> Result<Vec<IpAddr>, ResolveError> {
        Ok(self
            .lookup_ipv4(name)
            .await?
            .into_iter()
            .map(Into::into)
            .collect())
    }
}

#[async_trait::async_trait(?Send)]
impl<E: Engine + 'static> AddressResolver for Resolver<E> {
    async fn lookup_ipv4(&self, name: &str) -> Resolution {
        self.lookup(name).await
    }
}
