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

use std::fmt::{self, Display, Formatter};
use std::hash::{Hash, Hasher};
use std::str::FromStr;
use std::sync::Arc;

use url::Url;

use crate::byte_str::ByteStr;
use crate::client::channel_args::ChannelArgs;
use crate::client::config_selector::ConfigSelector;
use crate::client::service_config::ServiceConfig;

mod manual;
mod passthrough;
mod registry;

pub use manual::{ManualResolverBuilder, ManualResolverHandle};
pub use passthrough::PassthroughResolverBuilder;
pub use registry::ResolverRegistry;

/// Target represents a target for gRPC, as specified in:
/// https://github.com/grpc/grpc/blob/master/doc/naming.md.
/// It is parsed from the target string that gets passed during channel creation
/// by the user. gRPC passes it to the resolver and the balancer.
#[derive(Debug, Clone)]
pub struct Target {
    url: Url,
}

impl FromStr for Target {
    type Err = url::ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Target { url: s.parse()? })
    }
}

impl From<Url> for Target {
    fn from(url: Url) -> Self {
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
        match self.authority_port() {
            Some(port) => format!("{host}:{port}"),
            None => host.to_owned(),
        }
    }

    /// Retrieves endpoint from `Url.path()`.
    pub fn path(&self) -> &str {
        self.url.path()
    }

    /// The name of the server the channel talks to: the path with any leading
    /// slash removed. Retry throttling state is shared per server name.
    pub fn server_name(&self) -> &str {
        let path = self.path();
        path.strip_prefix('/').unwrap_or(path)
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
    /// returned that calls ChannelController.update() with an Err value.
    fn build(&self, target: &Target, options: ResolverOptions) -> Box<dyn Resolver>;

    /// Reports the URI scheme handled by this name resolver.
    fn scheme(&self) -> &str;

    /// Returns the default authority for a channel using this name resolver
    /// and target.  This is the `:authority` used for RPCs, not the authority
    /// portion of the target URI.
    ///
    /// By default, this method returns the path portion of the target URI,
    /// with the leading prefix removed.
    fn default_authority(&self, target: &Target) -> String {
        target.server_name().to_string()
    }

    /// Returns a bool indicating whether the input uri is valid to create a
    /// resolver.
    fn is_valid_uri(&self, uri: &Target) -> bool;
}

/// A collection of data configured on the channel that is constructing this
/// name resolver.
#[non_exhaustive]
pub struct ResolverOptions {
    /// The authority that will be used for the channel by default.
    pub authority: String,

    /// The channel's args.
    pub channel_args: ChannelArgs,

    /// A hook into the channel's work scheduler that allows the Resolver to
    /// request the ability to perform operations on the ChannelController.
    pub work_scheduler: Arc<dyn WorkScheduler>,
}

/// Used to asynchronously request a call into the Resolver's work method.
pub trait WorkScheduler: Send + Sync {
    // Schedules a call into the Resolver's work method.  If there is already a
    // pending work call that has not yet started, this may not schedule another
    // call.
    fn schedule_work(&self);
}

/// Resolver watches for the updates on the specified target.
/// Updates include address updates and service config updates.
///
/// The channel calls `work` once right after building the resolver, and again
/// whenever the resolver asks for it through its [`WorkScheduler`].  All
/// methods are called serially from the channel's work queue.
pub trait Resolver: Send {
    /// Asks the resolver to obtain an updated resolver result, if applicable.
    ///
    /// The implementation is not required to re-resolve immediately; it may
    /// rate limit.  For watch based resolvers, this may be a no-op.
    fn resolve_now(&mut self);

    /// Called serially by the channel to provide access to the
    /// `ChannelController`.
    fn work(&mut self, channel_controller: &mut dyn ChannelController);

    /// Resets any re-resolution backoff so the next request proceeds
    /// immediately.
    fn reset_backoff(&mut self) {}
}

/// The `ChannelController` trait provides the resolver with functionality
/// to interact with the channel.
pub trait ChannelController: Send {
    /// Notifies the channel about the current state of the name resolver.  If
    /// an error value is returned, the name resolver should attempt to
    /// re-resolve, if possible.  The resolver is responsible for applying an
    /// appropriate backoff mechanism to avoid overloading the system or the
    /// remote resolver.
    fn update(&mut self, update: ResolverUpdate) -> Result<(), String>;

    /// Parses the provided JSON service config.
    fn parse_service_config(&self, config: &str) -> Result<ServiceConfig, String>;
}

/// ResolverUpdate contains the current Resolver state relevant to the
/// channel.
#[derive(Clone, Debug)]
#[non_exhaustive]
pub struct ResolverUpdate {
    /// Arbitrary args intended for the channel and the LB policy.  The
    /// `grpc.lb_policy_name` arg selects a policy when the service config does
    /// not.
    pub args: ChannelArgs,

    /// A list of endpoints which each identify a logical host serving the
    /// service indicated by the target URI.  An error here is reported to the
    /// channel as a resolver error.
    pub endpoints: Result<Vec<Endpoint>, String>,

    /// The service config which the client should use for communicating with
    /// the service. If it is None, it indicates no service config is present or
    /// the resolver does not provide service configs.
    pub service_config: Result<Option<Arc<ServiceConfig>>, String>,

    /// Overrides the default method-path based config selection.
    pub config_selector: Option<Arc<dyn ConfigSelector>>,

    /// An optional human-readable note describing context about the
    /// resolution, to be passed along to the LB policy for inclusion in
    /// RPC failure status messages.
    pub resolution_note: Option<String>,
}

impl Default for ResolverUpdate {
    fn default() -> Self {
        ResolverUpdate {
            args: ChannelArgs::default(),
            endpoints: Ok(Vec::new()),
            service_config: Ok(None),
            config_selector: None,
            resolution_note: None,
        }
    }
}

impl ResolverUpdate {
    /// An update carrying one endpoint per address.
    pub fn from_addresses(addresses: impl IntoIterator<Item = Address>) -> Self {
        ResolverUpdate {
            endpoints: Ok(addresses
                .into_iter()
                .map(|address| Endpoint {
                    addresses: vec![address],
                    args: ChannelArgs::default(),
                })
                .collect()),
            ..Default::default()
        }
    }

    /// An update reporting a resolution failure.
    pub fn from_error(error: impl Into<String>) -> Self {
        ResolverUpdate {
            endpoints: Err(error.into()),
            ..Default::default()
        }
    }

    pub fn with_args(mut self, args: ChannelArgs) -> Self {
        self.args = args;
        self
    }

    pub fn with_service_config(mut self, service_config: Result<Option<Arc<ServiceConfig>>, String>) -> Self {
        self.service_config = service_config;
        self
    }

    pub fn with_config_selector(mut self, selector: Arc<dyn ConfigSelector>) -> Self {
        self.config_selector = Some(selector);
        self
    }
}

/// An Endpoint is an address or a collection of addresses which reference one
/// logical server.  Multiple addresses may be used if there are multiple ways
/// which the server can be reached, e.g. via IPv4 and IPv6 addresses.
#[derive(Debug, Default, Clone)]
#[non_exhaustive]
pub struct Endpoint {
    /// Addresses contains a list of addresses used to access this endpoint.
    pub addresses: Vec<Address>,

    /// Args intended for the LB policy.
    pub args: ChannelArgs,
}

impl Endpoint {
    pub fn new(addresses: Vec<Address>) -> Self {
        Endpoint {
            addresses,
            args: ChannelArgs::default(),
        }
    }
}

impl Hash for Endpoint {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.addresses.hash(state);
    }
}

/// An Address is an identifier that indicates how to connect to a server.
#[non_exhaustive]
#[derive(Debug, Clone, Default, Ord, PartialOrd)]
pub struct Address {
    /// The network type is used to identify what kind of transport to create
    /// when connecting to this address.  Typically TCP_IP_NETWORK_TYPE.
    pub network_type: &'static str,

    /// The address itself is passed to the transport in order to create a
    /// connection to it.
    pub address: ByteStr,

    /// Args intended for the subchannel.  They become part of the
    /// subchannel's identity.
    pub args: ChannelArgs,
}

impl Address {
    pub fn new(network_type: &'static str, address: impl Into<ByteStr>) -> Self {
        Address {
            network_type,
            address: address.into(),
            args: ChannelArgs::default(),
        }
    }

    pub fn tcp(address: impl Into<ByteStr>) -> Self {
        Self::new(TCP_IP_NETWORK_TYPE, address)
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

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn parse_target() {
        struct TestCase {
            input: &'static str,
            want_scheme: &'static str,
            want_host_port: &'static str,
            want_path: &'static str,
            want_server_name: &'static str,
        }
        let test_cases = [
            TestCase {
                input: "dns:///grpc.io",
                want_scheme: "dns",
                want_host_port: "",
                want_path: "/grpc.io",
                want_server_name: "grpc.io",
            },
            TestCase {
                input: "dns://8.8.8.8:53/grpc.io:443",
                want_scheme: "dns",
                want_host_port: "8.8.8.8:53",
                want_path: "/grpc.io:443",
                want_server_name: "grpc.io:443",
            },
            TestCase {
                input: "passthrough:///127.0.0.1:50051",
                want_scheme: "passthrough",
                want_host_port: "",
                want_path: "/127.0.0.1:50051",
                want_server_name: "127.0.0.1:50051",
            },
            TestCase {
                input: "unix:path/to/file",
                want_scheme: "unix",
                want_host_port: "",
                want_path: "path/to/file",
                want_server_name: "path/to/file",
            },
        ];

        for tc in test_cases {
            let target: Target = tc.input.parse().unwrap();
            assert_eq!(target.scheme(), tc.want_scheme);
            assert_eq!(target.authority_host_port(), tc.want_host_port);
            assert_eq!(target.path(), tc.want_path);
            assert_eq!(target.server_name(), tc.want_server_name);
        }
    }

    #[test]
    fn address_identity_ignores_args() {
        let a = Address::tcp("10.0.0.1:80");
        let mut b = Address::tcp("10.0.0.1:80");
        b.args = ChannelArgs::new().set("k", "v");
        assert_eq!(a, b);
        assert_ne!(a, Address::new("fake", "10.0.0.1:80"));
        assert_eq!(a.to_string(), "tcp:10.0.0.1:80");
    }
}
