//! Process lookup for `PROCESS-NAME` / `PROCESS-PATH` rules.
//!
//! Mapping a socket back to its owning process is platform specific and
//! lives outside this crate; embedders plug a finder into the tunnel.

use std::io;
use std::net::IpAddr;
use std::path::Path;

use crate::metadata::Network;

pub trait ProcessFinder: Send + Sync {
    /// Full executable path of the process owning the local socket.
    fn find_process(&self, network: Network, src_ip: IpAddr, src_port: u16) -> io::Result<String>;
}

/// Finder for platforms without process lookup.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoProcessFinder;

impl ProcessFinder for NoProcessFinder {
    fn find_process(&self, _network: Network, _src_ip: IpAddr, _src_port: u16) -> io::Result<String> {
        Err(io::Error::new(
            io::ErrorKind::Unsupported,
            "process lookup is not supported on this platform",
        ))
    }
}

/// File name component of an executable path.
pub fn process_name(path: &str) -> String {
    Path::new(path)
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn name_from_path() {
        assert_eq!(process_name("/usr/bin/curl"), "curl");
        assert_eq!(process_name("curl"), "curl");
    }

    #[test]
    fn no_finder_is_unsupported() {
        let err = NoProcessFinder
            .find_process(Network::Tcp, "127.0.0.1".parse().unwrap(), 1234)
            .unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::Unsupported);
    }
}
