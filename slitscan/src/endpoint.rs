use std::fmt;
use std::net::Ipv4Addr;
use std::str::FromStr;

/// An IPv4 address and TCP port, the unit of work the engine tests.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Endpoint {
    pub ip: Ipv4Addr,
    pub port: u16,
}

impl Endpoint {
    pub fn new(ip: Ipv4Addr, port: u16) -> Self {
        Self { ip, port }
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.ip, self.port)
    }
}

/// Parse error for `Endpoint::from_str`. The ingest path validates with a
/// regex before ever reaching here (see `engine::ingest`); this impl exists
/// for the CLI (`--callback-ip`/`--callback-port` are parsed separately) and
/// for tests that construct endpoints from literal strings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ParseEndpointError;

impl fmt::Display for ParseEndpointError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "expected ip:port")
    }
}

impl std::error::Error for ParseEndpointError {}

impl FromStr for Endpoint {
    type Err = ParseEndpointError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (ip, port) = s.rsplit_once(':').ok_or(ParseEndpointError)?;
        let ip: Ipv4Addr = ip.parse().map_err(|_| ParseEndpointError)?;
        let port: u16 = port.parse().map_err(|_| ParseEndpointError)?;
        if port == 0 {
            return Err(ParseEndpointError);
        }
        Ok(Endpoint::new(ip, port))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn displays_as_ip_colon_port() {
        let e = Endpoint::new(Ipv4Addr::new(127, 0, 0, 1), 8080);
        assert_eq!(e.to_string(), "127.0.0.1:8080");
    }

    #[test]
    fn round_trips_through_parse() {
        let e: Endpoint = "10.0.0.1:3128".parse().unwrap();
        assert_eq!(e, Endpoint::new(Ipv4Addr::new(10, 0, 0, 1), 3128));
    }

    #[test]
    fn rejects_port_zero() {
        assert!("1.2.3.4:0".parse::<Endpoint>().is_err());
    }

    #[test]
    fn rejects_missing_port() {
        assert!("1.2.3.4".parse::<Endpoint>().is_err());
    }

    #[test]
    fn equality_and_hash_are_on_the_pair() {
        let a: Endpoint = "1.2.3.4:80".parse().unwrap();
        let b: Endpoint = "1.2.3.4:80".parse().unwrap();
        assert_eq!(a, b);
    }
}
