// Copyright (C) 2025 Joseph Sacchini
//
// This program is free software: you can redistribute it and/or modify it under
// the terms of the GNU Affero General Public License as published by the Free
// Software Foundation, version 3.
//
// This program is distributed in the hope that it will be useful, but WITHOUT
// ANY WARRANTY; without even the implied warranty of MERCHANTABILITY or FITNESS
// FOR A PARTICULAR PURPOSE. See the GNU Affero General Public License for more
// details.
//
// You should have received a copy of the GNU Affero General Public License
// along with this program. If not, see <https://www.gnu.org/licenses/>.

//! Subnet allocation and host address math.
//!
//! Each gateway owns a /24 carved out of 10.0.0.0/8. Host index 1 is the
//! gateway interface; peers start at index 2.

use std::net::Ipv4Addr;

use ipnetwork::Ipv4Network;

/// Host index reserved for the gateway's own interface.
pub const GATEWAY_HOST_INDEX: i32 = 1;

/// First host index handed to peers.
pub const FIRST_PEER_HOST_INDEX: i32 = 2;

const SUBNET_PREFIX: u8 = 24;
// Scanning starts at 10.10.0.0 so the first gateway lands on the
// long-standing default subnet.
const FIRST_SECOND_OCTET: u8 = 10;

/// The address at `index` within `subnet`.
pub fn host_address(subnet: Ipv4Network, index: i32) -> Ipv4Addr {
    let base = u32::from(subnet.network());
    Ipv4Addr::from(base + index as u32)
}

/// The gateway interface's own address.
pub fn gateway_address(subnet: Ipv4Network) -> Ipv4Addr {
    host_address(subnet, GATEWAY_HOST_INDEX)
}

/// Highest usable host index (excludes the broadcast address). Zero for
/// /31 and /32 networks, which have no room for hosts alongside the
/// network and broadcast addresses.
pub fn max_host_index(subnet: Ipv4Network) -> i32 {
    let size = 1u64 << (32 - subnet.prefix());
    size.saturating_sub(2).min(i32::MAX as u64) as i32
}

/// Pick the next free /24 under 10.0.0.0/8, skipping subnets already held
/// by the caller's live gateways. Scans from 10.10.0.0/24 upward so the
/// first gateway lands on the historical default.
pub fn allocate(in_use: &[Ipv4Network]) -> Option<Ipv4Network> {
    for second in FIRST_SECOND_OCTET..=u8::MAX {
        for third in 0..=u8::MAX {
            let candidate =
                Ipv4Network::new(Ipv4Addr::new(10, second, third, 0), SUBNET_PREFIX).ok()?;
            let taken = in_use
                .iter()
                .any(|used| used.contains(candidate.ip()) || candidate.contains(used.ip()));
            if !taken {
                return Some(candidate);
            }
        }
    }
    None
}
