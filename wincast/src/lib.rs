use anyhow::Result;
use rand::Rng;
use std::net::{IpAddr, SocketAddr, TcpListener};

use crate::error::Error;

pub mod cli;
pub mod cloud;
pub mod communicator;
pub mod config;
pub mod context;
pub mod driver;
pub mod error;
pub mod http;
pub mod provisioners;
pub mod resolver;
pub mod steps;
pub mod ui;

/// Build info
pub mod built_info {
    include!(concat!(env!("OUT_DIR"), "/built.rs"));
}

/// Ports in `[lower, upper)` in the order they should be tried: a sweep over
/// the whole range starting at a random offset, so every port is tried at most
/// once.
fn port_candidates(lower: u16, upper: u16) -> impl Iterator<Item = u16> {
    let span = u32::from(upper.saturating_sub(lower));
    let offset = if span == 0 {
        0
    } else {
        rand::rng().random_range(0..span)
    };
    (0..span).filter_map(move |i| u16::try_from(u32::from(lower) + (offset + i) % span).ok())
}

/// Find a random open TCP port in the given range.
pub fn find_open_port(ip: IpAddr, lower: u16, upper: u16) -> Result<u16> {
    for port in port_candidates(lower, upper) {
        if TcpListener::bind(SocketAddr::new(ip, port)).is_ok() {
            return Ok(port);
        }
    }
    Err(Error::PortRangeExhausted { lower, upper }.into())
}

/// Bind a listener on a random open port in the given range. Unlike
/// [`find_open_port`], the port stays reserved.
pub async fn bind_open_port(ip: IpAddr, lower: u16, upper: u16) -> Result<tokio::net::TcpListener> {
    for port in port_candidates(lower, upper) {
        if let Ok(listener) = tokio::net::TcpListener::bind(SocketAddr::new(ip, port)).await {
            return Ok(listener);
        }
    }
    Err(Error::PortRangeExhausted { lower, upper }.into())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    const LOCALHOST: IpAddr = IpAddr::V4(Ipv4Addr::LOCALHOST);

    #[test]
    fn test_find_open_port() {
        let port = find_open_port(LOCALHOST, 9000, 9999).unwrap();

        assert!(port < 9999);
        assert!(port >= 9000);
    }

    #[test]
    fn test_port_candidates_cover_range_once() {
        let mut ports: Vec<u16> = port_candidates(4985, 4995).collect();
        ports.sort();
        assert_eq!(ports, (4985..4995).collect::<Vec<_>>());
    }

    #[test]
    fn test_find_open_port_exhausted() {
        let taken = TcpListener::bind((LOCALHOST, 0)).unwrap();
        let port = taken.local_addr().unwrap().port();

        let error = find_open_port(LOCALHOST, port, port + 1).unwrap_err();
        assert!(matches!(
            error.downcast_ref::<Error>(),
            Some(Error::PortRangeExhausted { .. })
        ));
    }

    #[test]
    fn test_empty_range() {
        assert!(find_open_port(LOCALHOST, 5000, 5000).is_err());
    }

    #[tokio::test]
    async fn test_bind_open_port() {
        let listener = bind_open_port(LOCALHOST, 8000, 9000).await.unwrap();
        let port = listener.local_addr().unwrap().port();
        assert!((8000..9000).contains(&port));
    }
}
