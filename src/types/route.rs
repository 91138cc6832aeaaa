use std::fmt;
use std::net::IpAddr;
use std::str::FromStr;

use inetnum::addr::Prefix;

use crate::types::af::AddressFamily;
use crate::types::errors::FibStoreError;

//------------ NexthopId -----------------------------------------------------

/// A small integer interning one (gateway, output port) pair.
///
/// Id 0 is reserved for the default route and is never reference counted.
/// Ids fit in 13 bits, so they are valid in the 15-bit direct encoding of
/// the DIR-24-8 table and in both DXR range formats.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NexthopId(pub(crate) u16);

impl NexthopId {
    pub const DEFAULT: NexthopId = NexthopId(0);

    pub fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for NexthopId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "nh{}", self.0)
    }
}

//------------ Route ---------------------------------------------------------

/// One route: a destination prefix, a gateway and an output port.
///
/// An all-zero gateway means "no gateway". Output ports are small
/// non-negative integers; port -1 only ever appears on the lookup side and
/// means "discard".
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Route {
    pub prefix: Prefix,
    pub gw: IpAddr,
    pub port: i32,
}

impl Route {
    pub fn new(prefix: Prefix, gw: IpAddr, port: i32) -> Self {
        Route { prefix, gw, port }
    }
}

impl fmt::Display for Route {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}\t{}\t{}", self.prefix, self.gw, self.port)
    }
}

//------------ Textual route specifications ----------------------------------

/// Parse `ADDR/MASK` into a prefix, truncating any host bits so the
/// address is the canonical network address.
pub(crate) fn parse_prefix(s: &str) -> Option<Prefix> {
    let (addr, len) = s.split_once('/')?;
    let addr = IpAddr::from_str(addr).ok()?;
    let len = u8::from_str(len).ok()?;
    let addr = match addr {
        IpAddr::V4(a) => {
            if len > 32 {
                return None;
            }
            u32::from(a).truncate_to_len(len).into_ipaddr()
        }
        IpAddr::V6(a) => {
            if len > 128 {
                return None;
            }
            u128::from(a).truncate_to_len(len).into_ipaddr()
        }
    };
    Prefix::new(addr, len).ok()
}

/// Parse one `ADDR/MASK [GW] OUT` route specification. `arg` is the
/// 1-based position of the specification in its argument list and is
/// carried into the error.
pub(crate) fn parse_route_spec(
    spec: &str,
    arg: usize,
) -> Result<Route, FibStoreError> {
    let words: Vec<&str> = spec.split_whitespace().collect();
    if words.len() < 2 || words.len() > 3 {
        return Err(FibStoreError::Malformed(arg));
    }

    let prefix =
        parse_prefix(words[0]).ok_or(FibStoreError::Malformed(arg))?;

    let gw = if words.len() == 3 {
        IpAddr::from_str(words[1]).map_err(|_| FibStoreError::Malformed(arg))?
    } else if prefix.is_v4() {
        IpAddr::V4(std::net::Ipv4Addr::UNSPECIFIED)
    } else {
        IpAddr::V6(std::net::Ipv6Addr::UNSPECIFIED)
    };

    // A v6 gateway for a v4 destination makes no sense, and vice versa.
    if gw.is_ipv4() != prefix.is_v4() {
        return Err(FibStoreError::Malformed(arg));
    }

    let port = i32::from_str(words[words.len() - 1])
        .map_err(|_| FibStoreError::Malformed(arg))?;
    if port < 0 {
        return Err(FibStoreError::Malformed(arg));
    }

    Ok(Route::new(prefix, gw, port))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_route_spec() {
        let r = parse_route_spec("10.0.0.0/8 1.2.3.4 3", 1).unwrap();
        assert_eq!(r.prefix, Prefix::from_str("10.0.0.0/8").unwrap());
        assert_eq!(r.gw, IpAddr::from_str("1.2.3.4").unwrap());
        assert_eq!(r.port, 3);

        let r = parse_route_spec("2001:db8::/32 5", 1).unwrap();
        assert!(!r.prefix.is_v4());
        assert_eq!(r.port, 5);

        // Host bits are truncated, not rejected.
        let r = parse_route_spec("10.1.2.3/8 0", 1).unwrap();
        assert_eq!(r.prefix, Prefix::from_str("10.0.0.0/8").unwrap());
    }

    #[test]
    fn test_parse_route_spec_rejects() {
        for bad in [
            "10.0.0.0/8",           // no port
            "10.0.0.0 1",           // no mask
            "10.0.0.0/33 1",        // mask too long
            "10.0.0.0/8 -1",        // negative port
            "10.0.0.0/8 x 1 2",     // too many words
            "10.0.0.0/8 2001:db8::1 1", // family mismatch
        ] {
            assert_eq!(
                parse_route_spec(bad, 7),
                Err(FibStoreError::Malformed(7)),
                "{}",
                bad
            );
        }
    }
}
