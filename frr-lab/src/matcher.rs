// FrrLab: External BGP speaker and cluster sampling for route-advertisement tests
// Copyright (C) 2022-2023 Tibor Schneider <sctibor@ethz.ch>
//
// This program is free software; you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation; either version 2 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License along
// with this program; if not, write to the Free Software Foundation, Inc.,
// 51 Franklin Street, Fifth Floor, Boston, MA 02110-1301 USA.

//! Matchers deciding whether a sampled route table or neighbor dump contains an expected fact.
//!
//! The sampled text is never fully parsed. Instead, every literal (subnet, next-hop, peer) is
//! escaped and compiled into a pattern that tolerates the column alignment of `vtysh` and `ip
//! route`. Every matcher returns `false` rather than failing, so it can be evaluated on any text.

use std::{fmt, net::IpAddr};

use ipnet::IpNet;
use lazy_static::lazy_static;
use regex::Regex;

/// Marker printed by `show bgp neighbor` for an established session.
pub const ESTABLISHED: &str = "BGP state = Established";

/// The table in which a route is looked up.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RouteView {
    /// `show ip bgp` or `show bgp ipv6`
    BgpTable,
    /// `ip [-6] route show | grep bgp`
    Kernel,
}

impl fmt::Display for RouteView {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::BgpTable => f.write_str("BGP table"),
            Self::Kernel => f.write_str("kernel routing table"),
        }
    }
}

/// Escape a literal so that it can be embedded into a pattern.
pub fn literal(s: impl AsRef<str>) -> String {
    regex::escape(s.as_ref())
}

/// Pattern of a subnet. Host routes are printed without prefix length by `ip route`, so the
/// length is optional for them.
fn subnet_pattern(subnet: &IpNet) -> String {
    let net = subnet.trunc();
    if net.prefix_len() == net.max_prefix_len() {
        format!(
            "{}(?:/{})?",
            literal(net.addr().to_string()),
            net.prefix_len()
        )
    } else {
        literal(net.to_string())
    }
}

/// Build the pattern matching a line associating `subnet` with `next_hop`.
///
/// - In the BGP table, the next-hop follows the network column, possibly on the next line if the
///   network is too wide: `<subnet>\s+<next_hop>`.
/// - In the kernel table, the route must be installed by BGP: `<subnet> ... via <next_hop> ...
///   proto bgp`.
///
/// The subnet must not be preceded by an address character, such that `10.0.0.0/24` does not
/// match `110.0.0.0/24`.
pub fn route_pattern(
    view: RouteView,
    subnet: &IpNet,
    next_hop: &IpAddr,
) -> Result<Regex, regex::Error> {
    let subnet = subnet_pattern(subnet);
    let next_hop = literal(next_hop.to_string());
    Regex::new(&match view {
        RouteView::BgpTable => {
            format!(r"(?m)(?:^|[^0-9A-Fa-f.:]){subnet}\s+{next_hop}(?:\s|$)")
        }
        RouteView::Kernel => {
            format!(r"(?m)^{subnet}\s.*\bvia {next_hop}\s.*\bproto bgp\b")
        }
    })
}

/// Check whether the sample contains a route towards `subnet` via `next_hop`.
pub fn match_route_present(
    sample: &str,
    view: RouteView,
    subnet: &IpNet,
    next_hop: &IpAddr,
) -> bool {
    match route_pattern(view, subnet, next_hop) {
        Ok(re) => re.is_match(sample),
        Err(e) => {
            log::error!("[matcher] Cannot compile the route pattern: {e}");
            false
        }
    }
}

/// Check whether the sample shows an established session with `peer`.
///
/// The output of `show bgp neighbor` is split into blocks, each starting with `BGP neighbor is
/// <addr>,`. The matcher succeeds if the block of `peer` contains [`ESTABLISHED`]. If the sample
/// contains no such header at all, the peer address and the marker must both appear in the text.
pub fn match_neighbor_established(sample: &str, peer: &IpAddr) -> bool {
    lazy_static! {
        static ref NEIGHBOR_HEADER: Regex =
            Regex::new(r"(?m)^BGP neighbor is ([0-9A-Fa-f.:]+),").unwrap();
    }

    let headers: Vec<_> = NEIGHBOR_HEADER.captures_iter(sample).collect();
    if headers.is_empty() {
        let peer = Regex::new(&format!(
            r"(?:^|[^0-9A-Fa-f.:]){}(?:[^0-9A-Fa-f.:]|$)",
            literal(peer.to_string())
        ));
        return match peer {
            Ok(re) => re.is_match(sample) && sample.contains(ESTABLISHED),
            Err(_) => false,
        };
    }

    headers.iter().enumerate().any(|(i, cap)| {
        let whole = match cap.get(0) {
            Some(m) => m,
            None => return false,
        };
        let addr: Option<IpAddr> = cap.get(1).and_then(|a| a.as_str().parse().ok());
        if addr.as_ref() != Some(peer) {
            return false;
        }
        let end = headers
            .get(i + 1)
            .and_then(|next| next.get(0))
            .map(|m| m.start())
            .unwrap_or(sample.len());
        sample[whole.start()..end].contains(ESTABLISHED)
    })
}

/// Apply the expected polarity to a raw match result. `expected = true` requires the match to be
/// present, `expected = false` requires it to be absent.
pub fn verdict(matched: bool, expected: bool) -> bool {
    matched == expected
}

/// A fact to look for in a sample.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Check {
    /// A route towards `subnet` via `next_hop` in the given view.
    Route {
        /// The table to look in.
        view: RouteView,
        /// Destination network
        subnet: IpNet,
        /// Expected next-hop
        next_hop: IpAddr,
    },
    /// An established session with `peer`.
    Neighbor {
        /// Address of the peer
        peer: IpAddr,
    },
}

impl Check {
    /// Evaluate the check on a sample, without polarity.
    pub fn matches(&self, sample: &str) -> bool {
        match self {
            Check::Route {
                view,
                subnet,
                next_hop,
            } => match_route_present(sample, *view, subnet, next_hop),
            Check::Neighbor { peer } => match_neighbor_established(sample, peer),
        }
    }
}

impl fmt::Display for Check {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Check::Route {
                view,
                subnet,
                next_hop,
            } => write!(f, "route {subnet} via {next_hop} in the {view}"),
            Check::Neighbor { peer } => write!(f, "established BGP session with {peer}"),
        }
    }
}

/// A check together with its expected polarity.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Expectation {
    /// What to look for
    pub check: Check,
    /// Whether it must be present (`true`) or absent (`false`)
    pub present: bool,
}

impl Expectation {
    /// The check must match.
    pub fn present(check: Check) -> Self {
        Self {
            check,
            present: true,
        }
    }

    /// The check must not match.
    pub fn absent(check: Check) -> Self {
        Self {
            check,
            present: false,
        }
    }

    /// The same check with inverted polarity.
    pub fn negate(&self) -> Self {
        Self {
            check: self.check.clone(),
            present: !self.present,
        }
    }

    /// Evaluate the expectation on a sample.
    pub fn evaluate(&self, sample: &str) -> bool {
        verdict(self.check.matches(sample), self.present)
    }
}

impl fmt::Display for Expectation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.present {
            write!(f, "{} (expected present)", self.check)
        } else {
            write!(f, "{} (expected absent)", self.check)
        }
    }
}
