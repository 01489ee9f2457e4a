//! Local TCP port discovery.
//!
//! All functions take plain `i32` bounds so out-of-range input can be rejected
//! instead of silently wrapping. "No port" is reported as `None`.

use crate::config::PortConfig;
use rand::Rng;
use sha2::{Digest, Sha256};
use std::net::{Ipv4Addr, TcpListener};
use tracing::debug;

/// Check whether a loopback port can currently be bound.
///
/// Binds and immediately releases a listener. Any bind error counts as
/// unavailable, whether the port is in use or the bind failed for another
/// reason.
pub fn is_available(port: i32) -> bool {
    let Ok(port) = u16::try_from(port) else {
        return false;
    };
    if port == 0 {
        return false;
    }
    TcpListener::bind((Ipv4Addr::LOCALHOST, port)).is_ok()
}

fn valid_range(min: i32, max: i32) -> bool {
    let lo = i32::from(PortConfig::MIN_ALLOWED);
    let hi = i32::from(PortConfig::MAX_ALLOWED);
    min <= max && min >= lo && max <= hi
}

fn as_port(port: i32) -> Option<u16> {
    u16::try_from(port).ok()
}

/// First available port in `min..=max`, scanning upwards.
pub fn find_available(min: i32, max: i32) -> Option<u16> {
    if !valid_range(min, max) {
        return None;
    }
    (min..=max).find(|&port| is_available(port)).and_then(as_port)
}

/// Stable hash of a project name: first 8 bytes of its SHA-256 digest.
fn stable_hash(name: &str) -> u64 {
    let digest = Sha256::digest(name.as_bytes());
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&digest[..8]);
    u64::from_be_bytes(bytes)
}

/// Deterministic port for a project, so the same project tends to land on
/// the same port across restarts.
///
/// The first candidate is derived from the project name. If it is taken,
/// offsets +1..=+50 are tried, then -1..=-50, and finally the whole range.
pub fn recommended_port(project_name: &str, min: i32, max: i32) -> Option<u16> {
    if !valid_range(min, max) {
        return None;
    }

    let span = (max - min) as u64;
    let candidate = if span == 0 {
        min
    } else {
        min + (stable_hash(project_name) % span) as i32
    };

    if is_available(candidate) {
        return as_port(candidate);
    }

    let in_range = |port: &i32| (min..=max).contains(port);
    let forward = (1..=PortConfig::RECOMMENDED_PROBE_SPAN).map(|offset| candidate + offset);
    let backward = (1..=PortConfig::RECOMMENDED_PROBE_SPAN).map(|offset| candidate - offset);

    if let Some(port) = forward
        .chain(backward)
        .filter(in_range)
        .find(|&port| is_available(port))
    {
        debug!(
            "Recommended port {} for '{}' taken, using {}",
            candidate, project_name, port
        );
        return as_port(port);
    }

    find_available(min, max)
}

/// Random available port in `min..=max`.
///
/// Makes up to 10 attempts, each picking a random start and scanning the next
/// ten ports (clamped to the range).
pub fn random_available(min: i32, max: i32) -> Option<u16> {
    if !valid_range(min, max) {
        return None;
    }

    let mut rng = rand::rng();
    for _ in 0..PortConfig::RANDOM_ATTEMPTS {
        let start = rng.random_range(min..=max);
        let end = (start + PortConfig::RANDOM_SCAN_SPAN - 1).min(max);
        if let Some(port) = (start..=end).find(|&port| is_available(port)) {
            return as_port(port);
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Grab an OS-assigned port and keep it bound.
    fn hold_port() -> (TcpListener, i32) {
        let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).unwrap();
        let port = i32::from(listener.local_addr().unwrap().port());
        (listener, port)
    }

    #[test]
    fn test_out_of_range_ports_are_unavailable() {
        for port in [i32::MIN, -1, 0, 65536, 70000, i32::MAX] {
            assert!(!is_available(port), "port {} should be unavailable", port);
        }
    }

    #[test]
    fn test_bound_port_is_unavailable() {
        let (listener, port) = hold_port();
        assert!(!is_available(port));
        drop(listener);
        assert!(is_available(port));
    }

    #[test]
    fn test_find_available_rejects_bad_ranges() {
        assert_eq!(find_available(100, 50), None);
        assert_eq!(find_available(8200, 8100), None);
        assert_eq!(find_available(1000, 2000), None);
        assert_eq!(find_available(60000, 65536), None);
    }

    #[test]
    fn test_find_available_returns_first_free_port() {
        if let Some(port) = find_available(8100, 8200) {
            let port = i32::from(port);
            assert!((8100..=8200).contains(&port));
            for earlier in 8100..port {
                assert!(!is_available(earlier));
            }
        }
    }

    #[test]
    fn test_find_available_skips_held_port() {
        let (listener, port) = hold_port();
        if port < 1024 {
            return;
        }
        assert_eq!(find_available(port, port), None);
        drop(listener);
        assert_eq!(find_available(port, port), as_port(port));
    }

    #[test]
    fn test_recommended_port_is_deterministic() {
        let first = recommended_port("my-project", 20000, 20999);
        let second = recommended_port("my-project", 20000, 20999);
        assert!(first.is_some());
        assert_eq!(first, second);
    }

    #[test]
    fn test_recommended_port_stays_in_range() {
        for name in ["a", "beacon", "another-project", ""] {
            if let Some(port) = recommended_port(name, 21000, 21100) {
                assert!((21000..=21100).contains(&port));
            }
        }
        assert_eq!(recommended_port("x", 21100, 21000), None);
    }

    #[test]
    fn test_recommended_port_moves_forward_when_taken() {
        let (listener, port) = hold_port();
        if port < 1024 || port + 1 > 65535 {
            return;
        }
        // A single-port range starting at the held port has no alternative.
        assert_eq!(recommended_port("held", port, port), None);

        // With room above, the forward probe wins before the backward one.
        if is_available(port + 1) {
            assert_eq!(recommended_port("held", port, port + 1), as_port(port + 1));
        }
        drop(listener);
    }

    #[test]
    fn test_stable_hash_is_stable() {
        assert_eq!(stable_hash("beacon"), stable_hash("beacon"));
        assert_ne!(stable_hash("beacon"), stable_hash("Beacon"));
    }

    #[test]
    fn test_random_available() {
        assert_eq!(random_available(100, 50), None);
        if let Some(port) = random_available(30000, 30500) {
            assert!((30000..=30500).contains(&port));
        }
    }
}
