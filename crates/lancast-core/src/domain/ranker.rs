//! Candidate address ranking for presence records.
//!
//! An mDNS record can carry several addresses for the same host: loopback,
//! link-local, VPN tunnels, and the actual LAN address.  Viewers need the one
//! a peer on the same network can actually reach, so each candidate gets a
//! score and the best scorer wins.
//!
//! Preference order: private IPv4 (the normal LAN case), then public IPv4,
//! then global IPv6, then unique-local IPv6, then link-local of either
//! family.  Loopback and unspecified addresses are disqualified outright; if
//! nothing survives, the caller falls back to the record's hostname.

use std::net::{IpAddr, Ipv6Addr};

/// Picks the most reachable address from a list of candidates.
///
/// Ties are broken by input order, so the first of two equally ranked
/// candidates wins.  Returns `None` when every candidate is disqualified
/// (loopback or unspecified only).
pub fn best_address<I>(candidates: I) -> Option<IpAddr>
where
    I: IntoIterator<Item = IpAddr>,
{
    let mut best: Option<(u32, IpAddr)> = None;
    for addr in candidates {
        let Some(score) = score(&addr) else {
            continue;
        };
        // Strictly-greater keeps the earliest candidate on a tie.
        match best {
            Some((best_score, _)) if score <= best_score => {}
            _ => best = Some((score, addr)),
        }
    }
    best.map(|(_, addr)| addr)
}

/// Scores one candidate; `None` disqualifies it.
fn score(addr: &IpAddr) -> Option<u32> {
    match addr {
        IpAddr::V4(v4) => {
            if v4.is_loopback() || v4.is_unspecified() {
                None
            } else if v4.is_private() {
                Some(100)
            } else if v4.is_link_local() {
                Some(30)
            } else {
                Some(80)
            }
        }
        IpAddr::V6(v6) => {
            if v6.is_loopback() || v6.is_unspecified() {
                None
            } else if is_unicast_link_local(v6) {
                Some(20)
            } else if is_unique_local(v6) {
                Some(60)
            } else {
                Some(70)
            }
        }
    }
}

// fe80::/10
fn is_unicast_link_local(addr: &Ipv6Addr) -> bool {
    addr.segments()[0] & 0xffc0 == 0xfe80
}

// fc00::/7
fn is_unique_local(addr: &Ipv6Addr) -> bool {
    addr.segments()[0] & 0xfe00 == 0xfc00
}
