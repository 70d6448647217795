use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use serde::de::Error as _;
use serde::{Deserialize, Deserializer};
use url::Url;

/// An error parsing a listen address URL.
#[derive(Debug, thiserror::Error)]
pub enum ListenAddrError {
    /// The string is not a URL.
    #[error("invalid listen address: {0}")]
    Url(#[from] url::ParseError),
    /// The URL is missing a host or port.
    #[error("listen address is missing host or port")]
    MissingAuthority,
    /// The URL scheme is not one of `udp`, `tcp`, `unix`.
    #[error("unsupported listen scheme `{0}`")]
    UnsupportedScheme(String),
}

/// A socket address for an ingest listener, given as a URL.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ListenAddr {
    /// A UDP datagram socket, e.g. `udp://127.0.0.1:8126`.
    Udp(String),
    /// A TCP stream socket, e.g. `tcp://127.0.0.1:8126`.
    Tcp(String),
    /// A unix domain socket, e.g. `unix:///run/tributary.sock`.
    Unix(PathBuf),
}

impl FromStr for ListenAddr {
    type Err = ListenAddrError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let url = Url::parse(s)?;

        match url.scheme() {
            "udp" | "tcp" => {
                let host = url.host_str().ok_or(ListenAddrError::MissingAuthority)?;
                let port = url.port().ok_or(ListenAddrError::MissingAuthority)?;
                let addr = format!("{host}:{port}");

                Ok(match url.scheme() {
                    "udp" => Self::Udp(addr),
                    _ => Self::Tcp(addr),
                })
            }
            "unix" => Ok(Self::Unix(PathBuf::from(url.path()))),
            other => Err(ListenAddrError::UnsupportedScheme(other.to_owned())),
        }
    }
}

impl fmt::Display for ListenAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Udp(addr) => write!(f, "udp://{addr}"),
            Self::Tcp(addr) => write!(f, "tcp://{addr}"),
            Self::Unix(path) => write!(f, "unix://{}", path.display()),
        }
    }
}

impl<'de> Deserialize<'de> for ListenAddr {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(D::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_udp_and_tcp() {
        assert_eq!(
            "udp://127.0.0.1:8126".parse::<ListenAddr>().unwrap(),
            ListenAddr::Udp("127.0.0.1:8126".to_owned())
        );
        assert_eq!(
            "tcp://0.0.0.0:8127".parse::<ListenAddr>().unwrap(),
            ListenAddr::Tcp("0.0.0.0:8127".to_owned())
        );
    }

    #[test]
    fn parses_unix() {
        assert_eq!(
            "unix:///run/tributary.sock".parse::<ListenAddr>().unwrap(),
            ListenAddr::Unix(PathBuf::from("/run/tributary.sock"))
        );
    }

    #[test]
    fn rejects_unsupported_schemes() {
        assert!(matches!(
            "http://127.0.0.1:80".parse::<ListenAddr>(),
            Err(ListenAddrError::UnsupportedScheme(_))
        ));
    }

    #[test]
    fn rejects_missing_port() {
        assert!(matches!(
            "udp://127.0.0.1".parse::<ListenAddr>(),
            Err(ListenAddrError::MissingAuthority)
        ));
    }

    #[test]
    fn display_roundtrip() {
        let addr: ListenAddr = "udp://127.0.0.1:8126".parse().unwrap();
        assert_eq!(addr.to_string(), "udp://127.0.0.1:8126");
    }
}
