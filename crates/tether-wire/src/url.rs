//! Endpoint addresses: `tcp://host:port` or bare `host:port`.

use std::fmt;
use std::str::FromStr;
use tether_types::{Error, Result};

/// A parsed endpoint address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Url {
    pub host: String,
    pub port: u16,
}

impl Url {
    pub fn parse(text: &str) -> Result<Self> {
        let rest = match text.split_once("://") {
            Some(("tcp", rest)) => rest,
            Some((scheme, _)) => {
                return Err(Error::Config(format!("unsupported scheme '{scheme}' in {text}")))
            }
            None => text,
        };
        let (host, port) = rest
            .rsplit_once(':')
            .ok_or_else(|| Error::Config(format!("missing port in {text}")))?;
        let host = host.trim_start_matches('[').trim_end_matches(']');
        if host.is_empty() {
            return Err(Error::Config(format!("missing host in {text}")));
        }
        let port = port
            .parse::<u16>()
            .map_err(|_| Error::Config(format!("bad port in {text}")))?;
        Ok(Self {
            host: host.to_string(),
            port,
        })
    }

    /// `host:port`, as accepted by tokio's socket helpers.
    pub fn socket_addr(&self) -> String {
        if self.host.contains(':') {
            format!("[{}]:{}", self.host, self.port)
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }
}

impl FromStr for Url {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl fmt::Display for Url {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "tcp://{}", self.socket_addr())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_accepted_forms() {
        let url = Url::parse("tcp://127.0.0.1:9559").unwrap();
        assert_eq!(url.host, "127.0.0.1");
        assert_eq!(url.port, 9559);
        assert_eq!(Url::parse("localhost:0").unwrap().port, 0);
        assert_eq!(Url::parse("tcp://[::1]:80").unwrap().socket_addr(), "[::1]:80");
        assert_eq!(url.to_string(), "tcp://127.0.0.1:9559");
    }

    #[test]
    fn test_rejected_forms() {
        for text in ["udp://a:1", "nohost", ":80", "tcp://host:port", "host:70000"] {
            assert!(Url::parse(text).is_err(), "{text} should be rejected");
        }
    }
}
