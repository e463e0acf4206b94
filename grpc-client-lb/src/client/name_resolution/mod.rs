/*
 *
 * Copyright 2025 gRPC authors.
 *
 * Permission is hereby granted, free of charge, to any person obtaining a copy
 * of this software and associated documentation files (the "Software"), to
 * deal in the Software without restriction, including without limitation the
 * rights to use, copy, modify, merge, publish, distribute, sublicense, and/or
 * sell copies of the Software, and to permit persons to whom the Software is
 * furnished to do so, subject to the following conditions:
 *
 * The above copyright notice and this permission notice shall be included in
 * all copies or substantial portions of the Software.
 *
 * THE SOFTWARE IS PROVIDED "AS IS", WITHOUT WARRANTY OF ANY KIND, EXPRESS OR
 * IMPLIED, INCLUDING BUT NOT LIMITED TO THE WARRANTIES OF MERCHANTABILITY,
 * FITNESS FOR A PARTICULAR PURPOSE AND NONINFRINGEMENT. IN NO EVENT SHALL THE
 * AUTHORS OR COPYRIGHT HOLDERS BE LIABLE FOR ANY CLAIM, DAMAGES OR OTHER
 * LIABILITY, WHETHER IN AN ACTION OF CONTRACT, TORT OR OTHERWISE, ARISING
 * FROM, OUT OF OR IN CONNECTION WITH THE SOFTWARE OR THE USE OR OTHER DEALINGS
 * IN THE SOFTWARE.
 *
 */

//! Name Resolution for gRPC.
//!
//! Name Resolution is the process by which a channel's target is converted into
//! network addresses (typically IP addresses) used by the channel to connect to
//! a service.
use std::{
    fmt::{self, Display, Formatter},
    hash::{Hash, Hasher},
    str::FromStr,
    sync::Arc,
};

use tonic::Status;
use url::Url;

use super::channel::{WorkItem, WorkQueueTx};
use super::service_config::ServiceConfig;
use crate::rt::Runtime;

mod passthrough;
mod registry;

pub use passthrough::PassthroughResolverBuilder;
pub use registry::{GLOBAL_RESOLVER_REGISTRY, ResolverRegistry};

/// Target represents a target for gRPC, as specified in:
/// https://github.com/grpc/grpc/blob/master/doc/naming.md.
/// It is parsed from the target string that gets passed during channel creation
/// by the user. gRPC passes it to the resolver and the balancer.
#[derive(Debug, Clone)]
pub struct Target {
    url: Url,
}

impl FromStr for Target {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.parse::<Url>() {
            Ok(url) => Ok(Target { url }),
            Err(err) => Err(err.to_string()),
        }
    }
}

impl From<url::Url> for Target {
    fn from(url: url::Url) -> Self {
        Target { url }
    }
}

impl Target {
    pub fn scheme(&self) -> &str {
        self.url.scheme()
    }

    /// The host part of the authority.
    pub fn authority_host(&self) -> &str {
        self.url.host_str().unwrap_or("")
    }

    /// The port part of the authority.
    pub fn authority_port(&self) -> Option<u16> {
        self.url.port()
    }

    /// Returns either host:port or host depending on the existence of the port
    /// in the authority.
    pub fn authority_host_port(&self) -> String {
        let host = self.authority_host();
        let port = self.authority_port();
        if let Some(port) = port {
            format!("{host}:{port}")
        } else {
            host.to_owned()
        }
    }

    /// Retrieves endpoint from `Url.path()`.
    pub fn path(&self) -> &str {
        self.url.path()
    }
}

impl Display for Target {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}://{}{}",
            self.scheme(),
            self.authority_host_port(),
            self.path()
        )
    }
}

/// A name resolver factory that produces Resolver instances used by the channel
/// to resolve network addresses for the target URI.
pub trait ResolverBuilder: Send + Sync {
    /// Builds a name resolver instance.
    ///
    /// Note that build must not fail.  Instead, an erroring Resolver may be
    /// returned that reports errors through the `ResolverListener`.
    fn build(&self, target: &Target, options: ResolverOptions) -> Box<dyn Resolver>;

    /// Reports the URI scheme handled by this name resolver.
    fn scheme(&self) -> &str;

    /// Returns the default authority for a channel using this name resolver
    /// and target. This refers to the *dataplane authority*: the value used
    /// in the `:authority` header of HTTP/2 requests.
    ///
    /// By default, this method returns the path portion of the target URI,
    /// with the leading prefix removed.
    fn default_authority(&self, target: &Target) -> String {
        let path = target.path();
        path.strip_prefix("/").unwrap_or(path).to_string()
    }
}

/// A collection of data configured on the channel that is constructing this
/// name resolver.
#[non_exhaustive]
pub struct ResolverOptions {
    /// The authority that will be used for the channel by default.
    pub authority: String,

    /// The runtime which provides utilities to do async work.
    pub runtime: Arc<dyn Runtime>,

    /// Where the resolver delivers its results.
    pub listener: ResolverListener,
}

/// Resolver watches for the updates on the specified target.  Results are
/// delivered asynchronously through the `ResolverListener` it was built
/// with.  Dropping the resolver ends the subscription.
pub trait Resolver: Send {
    /// Asks the resolver to obtain an updated resolution result.
    ///
    /// The implementation is not required to re-resolve immediately upon
    /// receiving this call; it may coalesce the request with one that is
    /// already in flight.
    fn update_resolution(&mut self);
}

/// The outcome of one resolution attempt.
#[derive(Debug, Clone)]
pub enum ResolutionResult {
    Success {
        addresses: Vec<Address>,
        /// `None` means the resolver explicitly provided no service config,
        /// or the one it found could not be parsed, in which case
        /// `service_config_error` is set.
        service_config: Option<ServiceConfig>,
        service_config_error: Option<Status>,
    },
    Error(Status),
}

/// The subscription through which a resolver reports results to the channel.
/// Results are processed strictly in the order they are reported.
#[derive(Clone)]
pub struct ResolverListener {
    work_tx: WorkQueueTx,
}

impl ResolverListener {
    pub(crate) fn new(work_tx: WorkQueueTx) -> Self {
        Self { work_tx }
    }

    /// Reports a successful resolution.
    pub fn on_successful_resolution(
        &self,
        addresses: Vec<Address>,
        service_config: Option<ServiceConfig>,
        service_config_error: Option<Status>,
    ) {
        self.send(ResolutionResult::Success {
            addresses,
            service_config,
            service_config_error,
        });
    }

    /// Reports that the target could not be resolved.
    pub fn on_error(&self, error: Status) {
        self.send(ResolutionResult::Error(error));
    }

    fn send(&self, result: ResolutionResult) {
        // The channel may already be gone, in which case nobody is interested
        // in the result.
        let _ = self.work_tx.send(WorkItem::Resolution(result));
    }
}

/// An Address is an identifier that indicates how to connect to a server.
#[derive(Debug, Clone, Default, Ord, PartialOrd)]
pub struct Address {
    /// The network type is used to identify what kind of transport to create
    /// when connecting to this address.  Typically TCP_IP_NETWORK_TYPE.
    pub network_type: &'static str,

    /// The address itself is passed to the transport in order to create a
    /// connection to it.
    pub address: String,
}

impl Address {
    /// Creates a TCP/IP address.
    pub fn tcp(address: impl Into<String>) -> Self {
        Self {
            network_type: TCP_IP_NETWORK_TYPE,
            address: address.into(),
        }
    }
}

impl Eq for Address {}

impl PartialEq for Address {
    fn eq(&self, other: &Self) -> bool {
        self.network_type == other.network_type && self.address == other.address
    }
}

impl Hash for Address {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.network_type.hash(state);
        self.address.hash(state);
    }
}

impl Display for Address {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.network_type, self.address)
    }
}

/// Indicates the address is an IPv4 or IPv6 address that should be connected to
/// via TCP/IP.
pub static TCP_IP_NETWORK_TYPE: &str = "tcp";
