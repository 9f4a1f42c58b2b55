use std::fmt;
use std::net::IpAddr;
use std::str::FromStr;

/// Wire reply of a rendezvous allocation request: the literal ASCII string
/// `"<ip>,<portA>,<portB>,<nonce>"` (spec.md §3, §6).
///
/// `port_a` is the client-facing listener, `port_b` the daemon-facing one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RendezvousAllocation {
    pub ip: IpAddr,
    pub port_a: u16,
    pub port_b: u16,
    pub nonce: String,
}

#[derive(Debug, thiserror::Error)]
pub enum RendezvousParseError {
    #[error("expected 4 comma-separated fields, got {0}")]
    WrongArity(usize),
    #[error("could not parse ip address: {0}")]
    BadIp(#[from] std::net::AddrParseError),
    #[error("could not parse port: {0}")]
    BadPort(#[from] std::num::ParseIntError),
}

impl fmt::Display for RendezvousAllocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{},{},{},{}", self.ip, self.port_a, self.port_b, self.nonce)
    }
}

impl FromStr for RendezvousAllocation {
    type Err = RendezvousParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let fields: Vec<&str> = s.split(',').collect();
        let [ip, port_a, port_b, nonce] = fields.as_slice() else {
            return Err(RendezvousParseError::WrongArity(fields.len()));
        };
        Ok(Self {
            ip: ip.parse()?,
            port_a: port_a.parse()?,
            port_b: port_b.parse()?,
            nonce: (*nonce).to_owned(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_through_display_and_fromstr() {
        let alloc = RendezvousAllocation {
            ip: "127.0.0.1".parse().unwrap(),
            port_a: 4001,
            port_b: 4002,
            nonce: "abc123==".into(),
        };
        let s = alloc.to_string();
        assert_eq!(s, "127.0.0.1,4001,4002,abc123==");
        let parsed: RendezvousAllocation = s.parse().unwrap();
        assert_eq!(parsed, alloc);
    }

    #[test]
    fn rejects_wrong_arity() {
        assert!(matches!(
            "127.0.0.1,4001,4002".parse::<RendezvousAllocation>(),
            Err(RendezvousParseError::WrongArity(3))
        ));
    }

    #[test]
    fn rejects_unparsable_port() {
        assert!(matches!(
            "127.0.0.1,notaport,4002,nonce".parse::<RendezvousAllocation>(),
            Err(RendezvousParseError::BadPort(_))
        ));
    }
}
