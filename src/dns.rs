//! DNS resolution utilities.
//!
//! Resolution results are kept as an [`IpAddrs`] set, split by address family
//! so that IPv6 addresses are always attempted before IPv4 ones.

use std::future::Future;
use std::net::{IpAddr, ToSocketAddrs};
use std::pin::Pin;
use std::sync::Arc;
use std::task::{ready, Context, Poll};
use std::{fmt, io};

use pin_project::{pin_project, pinned_drop};
use tokio::task::JoinHandle;
use tower::ServiceExt as _;

use crate::BoxFuture;

/// A de-duplicated set of IP addresses, partitioned by family.
///
/// Within a family, addresses keep the order in which they were first seen.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IpAddrs {
    v6: Vec<IpAddr>,
    v4: Vec<IpAddr>,
}

impl IpAddrs {
    /// An empty set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add an address unless it is already present.
    pub fn push(&mut self, addr: IpAddr) {
        let family = match addr {
            IpAddr::V6(_) => &mut self.v6,
            IpAddr::V4(_) => &mut self.v4,
        };
        if !family.contains(&addr) {
            family.push(addr);
        }
    }

    /// All addresses, IPv6 first.
    pub fn iter(&self) -> impl Iterator<Item = IpAddr> + '_ {
        self.v6.iter().chain(self.v4.iter()).copied()
    }

    /// The IPv6 addresses.
    pub fn v6(&self) -> &[IpAddr] {
        &self.v6
    }

    /// The IPv4 addresses.
    pub fn v4(&self) -> &[IpAddr] {
        &self.v4
    }

    /// Addresses in the same family as `addr`.
    pub fn same_family(&self, addr: &IpAddr) -> impl Iterator<Item = IpAddr> + '_ {
        match addr {
            IpAddr::V6(_) => self.v6.iter().copied(),
            IpAddr::V4(_) => self.v4.iter().copied(),
        }
    }

    /// Number of addresses.
    pub fn len(&self) -> usize {
        self.v6.len() + self.v4.len()
    }

    /// Whether there are no addresses.
    pub fn is_empty(&self) -> bool {
        self.v6.is_empty() && self.v4.is_empty()
    }
}

impl FromIterator<IpAddr> for IpAddrs {
    fn from_iter<T: IntoIterator<Item = IpAddr>>(iter: T) -> Self {
        let mut addrs = IpAddrs::new();
        addrs.extend(iter);
        addrs
    }
}

impl Extend<IpAddr> for IpAddrs {
    fn extend<T: IntoIterator<Item = IpAddr>>(&mut self, iter: T) {
        for addr in iter {
            self.push(addr);
        }
    }
}

impl fmt::Display for IpAddrs {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.iter()).finish()
    }
}

/// GetAddrInfo based resolver.
///
/// This resolver uses the `getaddrinfo` system call to resolve
/// hostnames to IP addresses via the operating system.
///
/// Any `tower::Service<Box<str>, Response = IpAddrs, Error = io::Error>` can
/// stand in for it, which is how tests inject fixed answers.
#[derive(Debug, Default, Clone)]
pub struct GaiResolver {
    _priv: (),
}

impl GaiResolver {
    /// Create a new `GaiResolver`.
    pub fn new() -> Self {
        Self { _priv: () }
    }
}

impl tower::Service<Box<str>> for GaiResolver {
    type Response = IpAddrs;
    type Error = io::Error;
    type Future = JoinHandleFuture<IpAddrs>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, host: Box<str>) -> Self::Future {
        let span = tracing::Span::current();
        JoinHandleFuture {
            handle: tokio::task::spawn_blocking(move || {
                tracing::trace_span!(parent: &span, "getaddrinfo", %host).in_scope(|| {
                    tracing::trace!("dns resolution starting");
                    let addrs: IpAddrs = (host.as_ref(), 0)
                        .to_socket_addrs()?
                        .map(|addr| addr.ip())
                        .collect();
                    tracing::trace!(%addrs, "dns resolution finished");
                    if addrs.is_empty() {
                        return Err(io::Error::new(
                            io::ErrorKind::AddrNotAvailable,
                            format!("no addresses found for {host}"),
                        ));
                    }
                    Ok(addrs)
                })
            }),
        }
    }
}

type ResolveFn = dyn Fn(Box<str>) -> BoxFuture<'static, io::Result<IpAddrs>> + Send + Sync;

/// A shareable handle to any resolver service.
///
/// Connections and listeners resolve host names through this handle; it
/// defaults to [`GaiResolver`].
#[derive(Clone)]
pub struct Resolver {
    inner: Arc<ResolveFn>,
}

impl Resolver {
    /// Wrap a resolver service.
    pub fn new<S>(service: S) -> Self
    where
        S: tower::Service<Box<str>, Response = IpAddrs, Error = io::Error>
            + Clone
            + Send
            + Sync
            + 'static,
        S::Future: Send + 'static,
    {
        Self {
            inner: Arc::new(move |host| -> BoxFuture<'static, io::Result<IpAddrs>> {
                Box::pin(service.clone().oneshot(host))
            }),
        }
    }

    /// Resolve a host name.
    pub async fn resolve(&self, host: &str) -> io::Result<IpAddrs> {
        (self.inner)(host.into()).await
    }
}

impl Default for Resolver {
    fn default() -> Self {
        Self::new(GaiResolver::new())
    }
}

impl fmt::Debug for Resolver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Resolver").finish()
    }
}

/// Future returned by `GaiResolver` when resolving
/// via getaddrinfo in a worker thread.
#[pin_project(PinnedDrop)]
pub struct JoinHandleFuture<Addr> {
    #[pin]
    handle: JoinHandle<Result<Addr, io::Error>>,
}

impl<Addr> fmt::Debug for JoinHandleFuture<Addr> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GaiFuture").finish()
    }
}

impl<Addr> Future for JoinHandleFuture<Addr> {
    type Output = Result<Addr, io::Error>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match ready!(self.project().handle.poll(cx)) {
            Ok(Ok(addrs)) => Poll::Ready(Ok(addrs)),
            Ok(Err(error)) => Poll::Ready(Err(error)),
            Err(join_err) => {
                if join_err.is_cancelled() {
                    Poll::Ready(Err(io::Error::new(io::ErrorKind::Interrupted, join_err)))
                } else {
                    Poll::Ready(Err(io::Error::other(join_err)))
                }
            }
        }
    }
}

#[pinned_drop]
impl<Addr> PinnedDrop for JoinHandleFuture<Addr> {
    fn drop(self: Pin<&mut Self>) {
        self.handle.abort()
    }
}

#[cfg(test)]
mod tests {
    use std::net::{Ipv4Addr, Ipv6Addr};

    use tower::ServiceExt as _;

    use super::*;

    #[test]
    fn partition_puts_ipv6_first_and_dedups() {
        let a4 = IpAddr::V4(Ipv4Addr::new(192, 0, 2, 1));
        let b4 = IpAddr::V4(Ipv4Addr::new(192, 0, 2, 2));
        let a6 = IpAddr::V6(Ipv6Addr::new(0x2001, 0xdb8, 0, 0, 0, 0, 0, 1));

        let addrs = IpAddrs::from_iter([a4, a6, b4, a4, a6]);
        assert_eq!(addrs.iter().collect::<Vec<_>>(), vec![a6, a4, b4]);
        assert_eq!(addrs.len(), 3);
        assert_eq!(addrs.v4(), &[a4, b4]);
        assert_eq!(addrs.same_family(&a6).collect::<Vec<_>>(), vec![a6]);
    }

    #[tokio::test]
    async fn resolve_localhost() {
        let addrs = GaiResolver::new()
            .oneshot("localhost".into())
            .await
            .unwrap();
        assert!(!addrs.is_empty());
        assert!(addrs.iter().all(|addr| addr.is_loopback()));
    }

    #[tokio::test]
    async fn resolver_wraps_any_service() {
        let fixed = IpAddrs::from_iter([IpAddr::V4(Ipv4Addr::new(192, 0, 2, 7))]);
        let answer = fixed.clone();
        let resolver = Resolver::new(tower::service_fn(move |host: Box<str>| {
            let answer = answer.clone();
            async move {
                assert_eq!(&*host, "example.test");
                Ok::<_, io::Error>(answer)
            }
        }));

        assert_eq!(resolver.resolve("example.test").await.unwrap(), fixed);
    }
}
