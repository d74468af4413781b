//! Loopback alias management for transparent binding.
//!
//! When a route has no explicit local address, the proxy binds the exact
//! address the client already targets. To make that possible the resolved
//! remote address is added to the loopback interface as a host-only alias
//! (`/32` for IPv4, `/128` for IPv6) and removed again when the route stops.
//!
//! # Platform Support
//!
//! Aliasing is inherently non-portable, so it sits behind the
//! [`LoopbackAliaser`] trait:
//!
//! - [`CommandAliaser`] shells out to the platform tool (`ip` on Linux,
//!   `ifconfig` on macOS, `netsh` on Windows), optionally through an
//!   elevation prefix such as `sudo -n`
//! - [`RecordingAliaser`] records operations in memory for tests
//!
//! # Requirements
//!
//! - `CAP_NET_ADMIN` or root on Linux, an administrator shell elsewhere
//!
//! # Example
//!
//! ```ignore
//! use tapwire::loopback::{CommandAliaser, LoopbackAlias, LoopbackAliaser};
//!
//! let aliaser = CommandAliaser::new().with_elevation(vec!["sudo".into(), "-n".into()]);
//! let alias = LoopbackAlias::new("10.0.0.5".parse()?);
//! let added = aliaser.ensure_alias(&alias)?;
//! // ... bind 10.0.0.5:443 ...
//! if added {
//!     aliaser.remove_alias(&alias)?;
//! }
//! ```

mod command;
mod error;
mod recording;

use std::fmt;
use std::net::IpAddr;

pub use command::CommandAliaser;
pub use error::AliasError;
pub use recording::{AliasOp, RecordingAliaser};

/// A host-only address added to the loopback interface.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct LoopbackAlias {
    addr: IpAddr,
}

impl LoopbackAlias {
    /// Create an alias for the given address.
    pub fn new(addr: IpAddr) -> Self {
        Self { addr }
    }

    /// The aliased address.
    pub fn addr(&self) -> IpAddr {
        self.addr
    }

    /// Prefix length of a single-host network for this address family.
    pub fn prefix_len(&self) -> u8 {
        match self.addr {
            IpAddr::V4(_) => 32,
            IpAddr::V6(_) => 128,
        }
    }
}

impl fmt::Display for LoopbackAlias {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.addr, self.prefix_len())
    }
}

/// Adds and removes loopback aliases.
///
/// Both operations may block (they typically spawn a privileged
/// subprocess); callers in async code must run them on a blocking task.
pub trait LoopbackAliaser: Send + Sync {
    /// Make `alias` reachable on the loopback interface.
    ///
    /// Returns `true` when the alias was added by this call and `false` when
    /// the address was already present. Only added aliases should be removed.
    fn ensure_alias(&self, alias: &LoopbackAlias) -> Result<bool, AliasError>;

    /// Remove a previously added alias.
    fn remove_alias(&self, alias: &LoopbackAlias) -> Result<(), AliasError>;
}
