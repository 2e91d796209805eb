//! Endpoint addresses.
//!
//! SP endpoints are named by URLs: `tcp://10.0.0.1:5000`,
//! `ipc:///tmp/pair.sock`, `inproc://bench`, `wss://host:443/path`. Only
//! the schemes the transports understand are accepted; everything else is
//! `InvalidAddress`.

use std::fmt;
use std::net::{SocketAddr, ToSocketAddrs};

use crate::error::{Error, Result};

/// Address family restriction carried by `tcp4`/`tcp6`-style schemes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IpFamily {
    Any,
    V4,
    V6,
}

/// A parsed endpoint URL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Url {
    raw: String,
    scheme: String,
    host: String,
    port: Option<u16>,
    path: String,
}

const SCHEMES: &[&str] = &[
    "tcp", "tcp4", "tcp6", "ipc", "unix", "abstract", "inproc", "tls+tcp", "tls+tcp4", "tls+tcp6",
    "ws", "ws4", "ws6", "wss", "wss4", "wss6",
];

impl Url {
    pub fn parse(raw: &str) -> Result<Url> {
        let (scheme, rest) = raw.split_once("://").ok_or(Error::InvalidAddress)?;
        if !SCHEMES.contains(&scheme) {
            return Err(Error::InvalidAddress);
        }
        let scheme = scheme.to_string();

        // Path-style schemes: everything after :// is the name.
        if matches!(scheme.as_str(), "ipc" | "unix" | "abstract" | "inproc") {
            if rest.is_empty() {
                return Err(Error::InvalidAddress);
            }
            return Ok(Url {
                raw: raw.to_string(),
                scheme,
                host: String::new(),
                port: None,
                path: rest.to_string(),
            });
        }

        // Host-style schemes: [authority][/path].
        let (authority, path) = match rest.find('/') {
            Some(idx) => (&rest[..idx], &rest[idx..]),
            None => (rest, ""),
        };

        let (host, port) = split_host_port(authority)?;
        Ok(Url {
            raw: raw.to_string(),
            scheme,
            host,
            port,
            path: path.to_string(),
        })
    }

    pub fn scheme(&self) -> &str {
        &self.scheme
    }

    /// Host name or address, brackets stripped for IPv6 literals. Empty
    /// means "any interface" for listeners.
    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> Option<u16> {
        self.port
    }

    /// Path component: the socket path for ipc, the rendezvous name for
    /// inproc, the HTTP resource for ws/wss ("/" when omitted).
    pub fn path(&self) -> &str {
        if self.path.is_empty() {
            match self.scheme.as_str() {
                "ws" | "ws4" | "ws6" | "wss" | "wss4" | "wss6" => "/",
                _ => "",
            }
        } else {
            &self.path
        }
    }

    pub fn family(&self) -> IpFamily {
        match self.scheme.as_str() {
            s if s.ends_with('4') => IpFamily::V4,
            s if s.ends_with('6') => IpFamily::V6,
            _ => IpFamily::Any,
        }
    }

    /// Whether the transport runs TLS under the SP layer.
    pub(crate) fn is_tls(&self) -> bool {
        matches!(
            self.scheme.as_str(),
            "tls+tcp" | "tls+tcp4" | "tls+tcp6" | "wss" | "wss4" | "wss6"
        )
    }

    /// The port to use when the URL omits one.
    fn default_port(&self) -> Option<u16> {
        match self.scheme.as_str() {
            "ws" | "ws4" | "ws6" => Some(80),
            "wss" | "wss4" | "wss6" => Some(443),
            _ => None,
        }
    }

    pub(crate) fn effective_port(&self) -> Result<u16> {
        self.port
            .or_else(|| self.default_port())
            .ok_or(Error::InvalidAddress)
    }

    /// Resolves the authority for dialing. Blocking name resolution is
    /// acceptable here; dial paths run it before issuing the connect.
    pub(crate) fn resolve(&self) -> Result<SocketAddr> {
        let port = self.effective_port()?;
        if self.host.is_empty() {
            return Err(Error::InvalidAddress);
        }
        let addrs = (self.host.as_str(), port)
            .to_socket_addrs()
            .map_err(|_| Error::InvalidAddress)?;
        let family = self.family();
        addrs
            .into_iter()
            .find(|a| match family {
                IpFamily::Any => true,
                IpFamily::V4 => a.is_ipv4(),
                IpFamily::V6 => a.is_ipv6(),
            })
            .ok_or(Error::InvalidAddress)
    }

    /// Resolves the authority for binding; an empty host binds the
    /// wildcard address of the requested family.
    pub(crate) fn resolve_local(&self) -> Result<SocketAddr> {
        let port = self.effective_port()?;
        if self.host.is_empty() || self.host == "*" {
            let addr = match self.family() {
                IpFamily::V6 => "[::]",
                _ => "0.0.0.0",
            };
            return format!("{}:{}", addr, port)
                .parse()
                .map_err(|_| Error::InvalidAddress);
        }
        self.resolve()
    }
}

fn split_host_port(authority: &str) -> Result<(String, Option<u16>)> {
    if authority.is_empty() {
        return Ok((String::new(), None));
    }
    if let Some(rest) = authority.strip_prefix('[') {
        // Bracketed IPv6 literal.
        let end = rest.find(']').ok_or(Error::InvalidAddress)?;
        let host = rest[..end].to_string();
        let tail = &rest[end + 1..];
        if tail.is_empty() {
            return Ok((host, None));
        }
        let port = tail
            .strip_prefix(':')
            .ok_or(Error::InvalidAddress)?
            .parse()
            .map_err(|_| Error::InvalidAddress)?;
        return Ok((host, Some(port)));
    }
    match authority.rsplit_once(':') {
        Some((host, port)) => {
            let port = port.parse().map_err(|_| Error::InvalidAddress)?;
            Ok((host.to_string(), Some(port)))
        }
        None => Ok((authority.to_string(), None)),
    }
}

impl fmt::Display for Url {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tcp_host_port() {
        let u = Url::parse("tcp://127.0.0.1:4545").unwrap();
        assert_eq!(u.scheme(), "tcp");
        assert_eq!(u.host(), "127.0.0.1");
        assert_eq!(u.port(), Some(4545));
        assert_eq!(u.family(), IpFamily::Any);
    }

    #[test]
    fn bracketed_ipv6() {
        let u = Url::parse("tcp6://[::1]:9000").unwrap();
        assert_eq!(u.host(), "::1");
        assert_eq!(u.port(), Some(9000));
        assert_eq!(u.family(), IpFamily::V6);
    }

    #[test]
    fn ipc_path() {
        let u = Url::parse("ipc:///tmp/test.sock").unwrap();
        assert_eq!(u.path(), "/tmp/test.sock");
        let u = Url::parse("unix:///tmp/test.sock").unwrap();
        assert_eq!(u.scheme(), "unix");
    }

    #[test]
    fn inproc_name() {
        let u = Url::parse("inproc://rendezvous-17").unwrap();
        assert_eq!(u.path(), "rendezvous-17");
    }

    #[test]
    fn ws_defaults() {
        let u = Url::parse("ws://example.com").unwrap();
        assert_eq!(u.effective_port().unwrap(), 80);
        assert_eq!(u.path(), "/");
        let u = Url::parse("wss://example.com:8443/sp").unwrap();
        assert_eq!(u.effective_port().unwrap(), 8443);
        assert_eq!(u.path(), "/sp");
        assert!(u.is_tls());
    }

    #[test]
    fn rejects_unknown_scheme_and_garbage() {
        assert_eq!(Url::parse("ftp://x"), Err(Error::InvalidAddress));
        assert_eq!(Url::parse("tcp:127.0.0.1"), Err(Error::InvalidAddress));
        assert_eq!(Url::parse("tcp://h:notaport"), Err(Error::InvalidAddress));
        assert_eq!(Url::parse("ipc://"), Err(Error::InvalidAddress));
    }
}
