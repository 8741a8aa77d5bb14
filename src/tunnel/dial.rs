//! Allow-list for dials requested over a tunnel
//!
//! The coordinator asks the agent to open connections by `proto` and
//! `address`. Only two destinations are ever honoured: the backend itself and
//! the coordinator's fixed liveness probe address, which is rewritten to the
//! backend's loopback address. Everything else is refused. The filter is
//! consulted for every Connect frame.

use std::fmt;

/// Protocol accepted for tunnelled dials
pub const DIAL_PROTO: &str = "tcp";

/// Outcome of checking a dial request
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum DialDecision {
    /// Dial `address` as requested
    Allow(String),
    /// Dial `to` in place of the requested probe address
    Rewrite {
        /// Address the coordinator asked for
        from: String,
        /// Address actually dialled
        to: String,
    },
    /// Refuse without dialling
    Deny,
}

impl DialDecision {
    /// Address to dial, if any
    pub fn target(&self) -> Option<&str> {
        match self {
            DialDecision::Allow(address) => Some(address),
            DialDecision::Rewrite { to, .. } => Some(to),
            DialDecision::Deny => None,
        }
    }
}

/// Per-session dial allow-list
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DialFilter {
    backend_address: String,
    probe_address: String,
    probe_target: String,
}

impl DialFilter {
    /// Allow the backend, and the probe address rewritten to the backend
    pub fn new(backend_address: impl Into<String>, probe_address: impl Into<String>) -> Self {
        let backend_address = backend_address.into();
        Self {
            probe_target: backend_address.clone(),
            backend_address,
            probe_address: probe_address.into(),
        }
    }

    /// Check one dial request
    pub fn check(&self, proto: &str, address: &str) -> DialDecision {
        if proto != DIAL_PROTO {
            return DialDecision::Deny;
        }
        if address == self.backend_address {
            DialDecision::Allow(address.to_string())
        } else if address == self.probe_address {
            DialDecision::Rewrite {
                from: address.to_string(),
                to: self.probe_target.clone(),
            }
        } else {
            DialDecision::Deny
        }
    }

    /// Exact `proto:address` strings this filter accepts
    pub fn allowed_destinations(&self) -> Vec<String> {
        vec![
            format!("{}:{}", DIAL_PROTO, self.backend_address),
            format!("{}:{}", DIAL_PROTO, self.probe_address),
        ]
    }
}

impl fmt::Display for DialFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}]", self.allowed_destinations().join(", "))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn filter() -> DialFilter {
        DialFilter::new("127.0.0.1:8001", "10.43.0.1:443")
    }

    #[test]
    fn test_backend_is_allowed() {
        assert_eq!(
            filter().check("tcp", "127.0.0.1:8001"),
            DialDecision::Allow("127.0.0.1:8001".to_string())
        );
    }

    #[test]
    fn test_probe_is_rewritten_to_backend() {
        let decision = filter().check("tcp", "10.43.0.1:443");
        assert_eq!(decision.target(), Some("127.0.0.1:8001"));
        assert!(matches!(decision, DialDecision::Rewrite { ref from, .. } if from == "10.43.0.1:443"));
    }

    /// Story: anything that is not the backend or the probe is refused,
    /// including near misses
    #[test]
    fn story_everything_else_is_refused() {
        let filter = filter();
        for (proto, address) in [
            ("tcp", "127.0.0.1:8011"),
            ("tcp", "localhost:8001"),
            ("tcp", "10.43.0.1:80"),
            ("tcp", "169.254.169.254:80"),
            ("udp", "127.0.0.1:8001"),
            ("unix", "/var/run/docker.sock"),
            ("tcp", ""),
        ] {
            assert_eq!(filter.check(proto, address), DialDecision::Deny, "{proto}/{address}");
        }
    }

    #[test]
    fn test_allowed_destinations() {
        assert_eq!(
            filter().allowed_destinations(),
            vec!["tcp:127.0.0.1:8001", "tcp:10.43.0.1:443"]
        );
        assert_eq!(
            filter().to_string(),
            "[tcp:127.0.0.1:8001, tcp:10.43.0.1:443]"
        );
    }
}
