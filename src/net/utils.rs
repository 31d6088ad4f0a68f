use http::uri::Authority;
use std::error::Error;
use std::fmt::Debug;
use std::fmt::Display;
use std::str::FromStr;
use std::time::Duration;
use tokio::sync::oneshot;
use tonic::transport::Channel;
use tonic::transport::ClientTlsConfig;

/// Deadline attached to every unary request.
pub const DEFAULT_DEADLINE: Duration = Duration::from_secs(60);

/// Connection timeout for transport channel.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Coarse classification of failures, deciding retry behavior.
/// Transient failures are retried at the next natural opportunity
/// (next round, next peer); the rest never are.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Network or peer unavailable.
    Transient,
    /// Signature or hash mismatch, out-of-group sender.
    Invalid,
    /// Duplicate round with differing content.
    Conflict,
    /// An operation exceeded its deadline.
    Timeout,
    /// Requested before the node is able to serve (e.g. pre-DKG).
    NotReady,
    /// Lookup miss.
    NotFound,
}

pub trait Classify {
    fn kind(&self) -> ErrorKind;
}

#[derive(thiserror::Error, Debug)]
pub enum DialError {
    #[error("invalid peer uri: {0}")]
    InvalidUri(String),
    #[error("connection failed: {0}")]
    Transient(String),
}

impl Classify for DialError {
    fn kind(&self) -> ErrorKind {
        match self {
            DialError::InvalidUri(_) => ErrorKind::Invalid,
            DialError::Transient(_) => ErrorKind::Transient,
        }
    }
}

/// Address is protected type of URI Authority which always contains
/// host:port (see [`Address::precheck`]).
#[derive(Eq, PartialEq, Clone)]
pub struct Address(Authority);

impl Address {
    pub fn precheck(data: &str) -> Result<Self, InvalidAddress> {
        let authority = data
            .parse::<Authority>()
            .map_err(|err| InvalidAddress(format!("{data}, source: {err:?}")))?;

        if authority.host().is_empty() || authority.port().is_none() {
            return Err(InvalidAddress(data.into()));
        }

        Ok(Self(authority))
    }

    pub fn as_str(&self) -> &str {
        self.0.as_str()
    }
}

impl PartialOrd for Address {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Address {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.0.as_str().cmp(other.0.as_str())
    }
}

impl Display for Address {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.0.as_str())
    }
}

impl Debug for Address {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.0.as_str())
    }
}

#[derive(thiserror::Error, Debug)]
#[error("expected valid host:port, received {0}")]
pub struct InvalidAddress(String);

/// Dialable endpoint of a group member. Plaintext is permitted only when
/// the group file flags the node non-TLS.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Peer {
    pub address: Address,
    pub tls: bool,
}

impl Display for Peer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.address.as_str())
    }
}

/// Returns a lazily-connected channel for a generic tonic client.
/// The channel re-establishes the underlying connection on use, which
/// covers re-dialing after transient failures.
pub fn connect_lazy(peer: &Peer) -> Result<Channel, DialError> {
    let scheme = if peer.tls { "https" } else { "http" };
    let endpoint = Channel::from_shared(format!("{scheme}://{}", peer.address))
        .map_err(|err| DialError::InvalidUri(err.to_string()))?
        .connect_timeout(CONNECT_TIMEOUT)
        .keep_alive_while_idle(true)
        .keep_alive_timeout(Duration::from_secs(60));

    let endpoint = if peer.tls {
        endpoint
            .tls_config(ClientTlsConfig::new().with_native_roots())
            .map_err(|err| DialError::Transient(err.to_string()))?
    } else {
        endpoint
    };

    Ok(endpoint.connect_lazy())
}

#[derive(Debug, Default, PartialEq, Eq, Copy, Clone)]
pub struct Seconds {
    value: u32,
}

impl Seconds {
    pub fn new(value: u32) -> Self {
        Self { value }
    }

    pub fn get_value(self) -> u32 {
        self.value
    }

    pub fn as_duration(self) -> Duration {
        Duration::from_secs(self.value.into())
    }
}

impl From<u32> for Seconds {
    fn from(value: u32) -> Self {
        Seconds { value }
    }
}

impl From<Seconds> for u32 {
    fn from(seconds: Seconds) -> Self {
        seconds.value
    }
}

impl Display for Seconds {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}s", self.value)
    }
}

#[derive(Debug, PartialEq, Eq)]
pub struct ParseSecondsError;

impl FromStr for Seconds {
    type Err = ParseSecondsError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let value = value
            .strip_suffix("s")
            .ok_or(ParseSecondsError)?
            .parse()
            .map_err(|_| ParseSecondsError)?;

        Ok(Self::new(value))
    }
}

/// One-shot reply handle carried inside actor commands.
pub struct Callback<T, E: Error> {
    inner: oneshot::Sender<Result<T, E>>,
}

impl<T, E: Error> Callback<T, E> {
    pub fn new() -> (Self, oneshot::Receiver<Result<T, E>>) {
        let (tx, rx) = oneshot::channel();
        (Self { inner: tx }, rx)
    }

    #[inline]
    pub fn reply(self, result: Result<T, E>) {
        let _ = self.inner.send(result);
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn address_requires_host_and_port() {
        assert!(Address::precheck("127.0.0.1:8080").is_ok());
        assert!(Address::precheck("example.org:443").is_ok());
        assert!(Address::precheck("127.0.0.1").is_err());
        assert!(Address::precheck(":8080").is_err());
        assert!(Address::precheck("").is_err());
    }

    #[test]
    fn seconds_parse_display() {
        let s = Seconds::from_str("30s").unwrap();
        assert_eq!(s.get_value(), 30);
        assert_eq!(s.to_string(), "30s");
        assert_eq!(Seconds::from_str("30"), Err(ParseSecondsError));
    }
}
