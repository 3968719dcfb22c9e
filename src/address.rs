//! Address model and CIDR arithmetic shared by the expander and the scanner.
//!
//! Addresses are kept as plain integers (`u32` for IPv4, `u128` for IPv6) so
//! range bounds, counting and stepping are simple integer operations. The
//! two families never compare with each other: asking whether an IPv4 address
//! is below an IPv6 one is a caller bug and is reported as
//! [`AddressError::InvalidOperand`].

use std::cmp::Ordering;
use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::str::FromStr;

use thiserror::Error;

/// The most addresses a single IPv6 block contributes to a run.
///
/// Wider blocks are enumerated from their lowest address until this many
/// have been produced.
pub const IPV6_HOST_CAP: u64 = 1_000_000;

const IPV4_BITS: u8 = 32;
const IPV6_BITS: u8 = 128;

/// Errors produced while parsing or comparing addresses.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum AddressError {
    /// The text before the `/` is not an IPv4 or IPv6 literal.
    #[error("invalid address literal '{0}'")]
    InvalidLiteral(String),
    /// The text after the `/` is not a decimal number.
    #[error("invalid prefix length '{0}'")]
    InvalidPrefix(String),
    /// The prefix does not fit the address family.
    #[error("prefix /{prefix} is out of range for {family} (0-{max})")]
    PrefixOutOfRange {
        /// Prefix as written by the user.
        prefix: u32,
        /// `IPv4` or `IPv6`.
        family: Family,
        /// Widest prefix for the family.
        max: u8,
    },
    /// The operands belong to different address families.
    #[error("cannot compare {0} with {1}: address families differ")]
    InvalidOperand(Address, Address),
}

/// Address family of an [`Address`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Family {
    /// 32-bit addresses.
    IPv4,
    /// 128-bit addresses.
    IPv6,
}

impl Family {
    /// Number of bits in an address of this family.
    pub const fn bits(self) -> u8 {
        match self {
            Self::IPv4 => IPV4_BITS,
            Self::IPv6 => IPV6_BITS,
        }
    }
}

impl fmt::Display for Family {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::IPv4 => f.write_str("IPv4"),
            Self::IPv6 => f.write_str("IPv6"),
        }
    }
}

/// A single IPv4 or IPv6 address in host integer form.
///
/// ```rust
/// # use cidrprobe::address::Address;
/// let addr: Address = "10.0.0.255".parse().unwrap();
/// assert_eq!(addr.increment().unwrap().to_string(), "10.0.1.0");
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Address {
    /// IPv4 address as a big-endian `u32`.
    V4(u32),
    /// IPv6 address as a big-endian `u128`.
    V6(u128),
}

impl Address {
    /// Family this address belongs to.
    pub const fn family(&self) -> Family {
        match self {
            Self::V4(_) => Family::IPv4,
            Self::V6(_) => Family::IPv6,
        }
    }

    /// The next address in the same family, or `None` at the top of the space.
    ///
    /// IPv6 carries across all sixteen bytes; neither family wraps around.
    #[must_use]
    pub fn increment(self) -> Option<Self> {
        match self {
            Self::V4(ip) => ip.checked_add(1).map(Self::V4),
            Self::V6(ip) => ip.checked_add(1).map(Self::V6),
        }
    }

    /// Returns `self <= other`.
    ///
    /// Fails with [`AddressError::InvalidOperand`] when the families differ.
    pub fn compare_less_equal(self, other: Self) -> Result<bool, AddressError> {
        self.partial_cmp(&other)
            .map(Ordering::is_le)
            .ok_or(AddressError::InvalidOperand(self, other))
    }

    /// Whether a TCP connect to this address is meaningful.
    ///
    /// The unspecified address, multicast groups and the IPv4 limited
    /// broadcast address are not.
    pub fn is_probe_target(&self) -> bool {
        match IpAddr::from(*self) {
            IpAddr::V4(ip) => !(ip.is_unspecified() || ip.is_multicast() || ip.is_broadcast()),
            IpAddr::V6(ip) => !(ip.is_unspecified() || ip.is_multicast()),
        }
    }

    /// Socket address for a probe of `port` on this address.
    pub fn socket_addr(self, port: u16) -> SocketAddr {
        SocketAddr::new(self.into(), port)
    }
}

impl PartialOrd for Address {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        match (self, other) {
            (Self::V4(a), Self::V4(b)) => Some(a.cmp(b)),
            (Self::V6(a), Self::V6(b)) => Some(a.cmp(b)),
            _ => None,
        }
    }
}

impl From<IpAddr> for Address {
    fn from(ip: IpAddr) -> Self {
        match ip {
            IpAddr::V4(ip) => Self::V4(u32::from(ip)),
            IpAddr::V6(ip) => Self::V6(u128::from(ip)),
        }
    }
}

impl From<Address> for IpAddr {
    fn from(addr: Address) -> Self {
        match addr {
            Address::V4(ip) => Self::V4(Ipv4Addr::from(ip)),
            Address::V6(ip) => Self::V6(Ipv6Addr::from(ip)),
        }
    }
}

impl FromStr for Address {
    type Err = AddressError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        IpAddr::from_str(s)
            .map(Self::from)
            .map_err(|_| AddressError::InvalidLiteral(s.to_owned()))
    }
}

/// Dotted quad for IPv4, RFC 5952 compressed form for IPv6.
impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::V4(ip) => Ipv4Addr::from(*ip).fmt(f),
            Self::V6(ip) => Ipv6Addr::from(*ip).fmt(f),
        }
    }
}

/// A parsed `base/prefix` block with the host bits of `base` cleared.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CidrBlock {
    start: Address,
    prefix: u8,
}

impl CidrBlock {
    /// Parses CIDR notation such as `10.0.0.0/30` or `2606:4700::/32`.
    ///
    /// Surrounding whitespace is ignored and a bare address is taken as a
    /// single-host block. Host bits set in the base are masked off.
    ///
    /// ```rust
    /// # use cidrprobe::address::CidrBlock;
    /// let block = CidrBlock::parse("10.0.0.7/30").unwrap();
    /// assert_eq!(block.start().to_string(), "10.0.0.4");
    /// assert_eq!(block.end().to_string(), "10.0.0.7");
    /// assert_eq!(block.address_count(), 4);
    /// ```
    pub fn parse(text: &str) -> Result<Self, AddressError> {
        let text = text.trim();
        let (literal, prefix) = match text.split_once('/') {
            Some((literal, prefix)) => (literal.trim(), Some(prefix.trim())),
            None => (text, None),
        };

        let base: Address = literal.parse()?;
        let max = base.family().bits();
        let prefix = match prefix {
            Some(prefix) => parse_prefix(prefix, base.family())?,
            None => max,
        };

        let start = match base {
            Address::V4(ip) => Address::V4(ip & v4_mask(prefix)),
            Address::V6(ip) => Address::V6(ip & v6_mask(prefix)),
        };
        Ok(Self { start, prefix })
    }

    /// Prefix length in bits.
    pub const fn prefix(&self) -> u8 {
        self.prefix
    }

    /// Family of the block.
    pub const fn family(&self) -> Family {
        self.start.family()
    }

    /// Lowest address of the block.
    pub const fn start(&self) -> Address {
        self.start
    }

    /// Highest address of the block.
    pub fn end(&self) -> Address {
        match self.start {
            Address::V4(ip) => Address::V4(ip | !v4_mask(self.prefix)),
            Address::V6(ip) => Address::V6(ip | !v6_mask(self.prefix)),
        }
    }

    /// `(start, end)` bounds of the block, both inclusive.
    pub fn range(&self) -> (Address, Address) {
        (self.start, self.end())
    }

    /// Number of addresses the block contributes to a run.
    ///
    /// Exact for IPv4. For IPv6 the exact count `2^(128 - prefix)` is capped
    /// at [`IPV6_HOST_CAP`], which covers every prefix of /64 or wider.
    pub fn address_count(&self) -> u64 {
        let host_bits = u32::from(self.family().bits() - self.prefix);
        match self.family() {
            Family::IPv4 => 1u64 << host_bits,
            Family::IPv6 if host_bits < 64 => (1u64 << host_bits).min(IPV6_HOST_CAP),
            Family::IPv6 => IPV6_HOST_CAP,
        }
    }
}

impl FromStr for CidrBlock {
    type Err = AddressError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl fmt::Display for CidrBlock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.start, self.prefix)
    }
}

/// Parses CIDR text into its inclusive `(start, end)` bounds.
pub fn parse_cidr(text: &str) -> Result<(Address, Address), AddressError> {
    CidrBlock::parse(text).map(|block| block.range())
}

fn parse_prefix(text: &str, family: Family) -> Result<u8, AddressError> {
    if text.is_empty() || text.len() > 3 || !text.bytes().all(|b| b.is_ascii_digit()) {
        return Err(AddressError::InvalidPrefix(text.to_owned()));
    }
    let prefix: u32 = text
        .parse()
        .map_err(|_| AddressError::InvalidPrefix(text.to_owned()))?;

    let max = family.bits();
    match u8::try_from(prefix) {
        Ok(prefix) if prefix <= max => Ok(prefix),
        _ => Err(AddressError::PrefixOutOfRange {
            prefix,
            family,
            max,
        }),
    }
}

fn v4_mask(prefix: u8) -> u32 {
    u32::MAX
        .checked_shl(u32::from(IPV4_BITS - prefix))
        .unwrap_or(0)
}

fn v6_mask(prefix: u8) -> u128 {
    u128::MAX
        .checked_shl(u32::from(IPV6_BITS - prefix))
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::{parse_cidr, Address, AddressError, CidrBlock, Family, IPV6_HOST_CAP};
    use parameterized::parameterized;

    fn addr(text: &str) -> Address {
        text.parse().unwrap()
    }

    #[test]
    fn parse_ipv4_block_bounds() {
        let block = CidrBlock::parse("192.168.0.0/30").unwrap();
        assert_eq!(block.range(), (addr("192.168.0.0"), addr("192.168.0.3")));
        assert_eq!(block.address_count(), 4);
    }

    #[test]
    fn parse_cidr_returns_bounds() {
        assert_eq!(
            parse_cidr("2001:db8::/126"),
            Ok((addr("2001:db8::"), addr("2001:db8::3")))
        );
        assert!(parse_cidr("2001:db8::/129").is_err());
    }

    #[test]
    fn parse_masks_host_bits() {
        let block = CidrBlock::parse("10.1.2.200/24").unwrap();
        assert_eq!(block.start(), addr("10.1.2.0"));
        assert_eq!(block.end(), addr("10.1.2.255"));
        assert_eq!(block.to_string(), "10.1.2.0/24");
    }

    #[test]
    fn parse_ipv6_partial_byte_prefix() {
        let block = CidrBlock::parse("2001:db8:ffff::/36").unwrap();
        assert_eq!(block.start(), addr("2001:db8:f000::"));
        assert_eq!(block.end(), addr("2001:db8:ffff:ffff:ffff:ffff:ffff:ffff"));
    }

    #[test]
    fn parse_trims_whitespace() {
        let block = CidrBlock::parse("  10.0.0.0 / 31 \t").unwrap();
        assert_eq!(block.address_count(), 2);
    }

    #[test]
    fn bare_address_is_single_host() {
        let v4 = CidrBlock::parse("1.1.1.1").unwrap();
        assert_eq!(v4.prefix(), 32);
        assert_eq!(v4.address_count(), 1);

        let v6 = CidrBlock::parse("::1").unwrap();
        assert_eq!(v6.prefix(), 128);
        assert_eq!(v6.range(), (addr("::1"), addr("::1")));
    }

    #[test]
    fn whole_ipv4_space() {
        let block = CidrBlock::parse("0.0.0.0/0").unwrap();
        assert_eq!(block.end(), addr("255.255.255.255"));
        assert_eq!(block.address_count(), 1 << 32);
    }

    #[parameterized(text = {
        "2606:4700::/32", "::/0", "2001:db8::/64", "2001:db8::/65", "2001:db8::/96",
    })]
    fn wide_ipv6_blocks_are_capped(text: &str) {
        let block = CidrBlock::parse(text).unwrap();
        assert_eq!(block.address_count(), IPV6_HOST_CAP);
    }

    #[parameterized(text = {
        "2001:db8::/128", "2001:db8::/120", "2001:db8::/112",
    }, count = {
        1, 256, 65_536,
    })]
    fn narrow_ipv6_blocks_are_exact(text: &str, count: u64) {
        assert_eq!(CidrBlock::parse(text).unwrap().address_count(), count);
    }

    #[parameterized(text = {
        "not-a-cidr", "300.10.1.1/24", "10.0.0/24", "10.0.0.0/", "10.0.0.0/abc",
        "10.0.0.0/-1", "10.0.0.0/+8", "10.0.0.0/24/8", "2001:db8:::1/64", "",
    })]
    fn rejects_malformed_input(text: &str) {
        assert!(CidrBlock::parse(text).is_err(), "accepted {text:?}");
    }

    #[test]
    fn rejects_prefix_out_of_range() {
        assert_eq!(
            CidrBlock::parse("10.0.0.0/33"),
            Err(AddressError::PrefixOutOfRange {
                prefix: 33,
                family: Family::IPv4,
                max: 32
            })
        );
        assert!(matches!(
            CidrBlock::parse("::/129"),
            Err(AddressError::PrefixOutOfRange { prefix: 129, .. })
        ));
    }

    #[test]
    fn increment_carries_across_bytes() {
        assert_eq!(addr("10.0.0.255").increment(), Some(addr("10.0.1.0")));
        assert_eq!(addr("2001:db8::ffff").increment(), Some(addr("2001:db8::1:0")));
        assert_eq!(
            addr("2001:db8:0:0:ffff:ffff:ffff:ffff").increment(),
            Some(addr("2001:db8:0:1::"))
        );
    }

    #[test]
    fn increment_stops_at_top_of_space() {
        assert_eq!(addr("255.255.255.255").increment(), None);
        assert_eq!(addr("ffff:ffff:ffff:ffff:ffff:ffff:ffff:ffff").increment(), None);
    }

    #[test]
    fn compare_within_family() {
        assert_eq!(addr("10.0.0.1").compare_less_equal(addr("10.0.0.2")), Ok(true));
        assert_eq!(addr("10.0.0.2").compare_less_equal(addr("10.0.0.2")), Ok(true));
        assert_eq!(addr("::2").compare_less_equal(addr("::1")), Ok(false));
    }

    #[test]
    fn compare_across_families_is_an_error() {
        let v4 = addr("10.0.0.1");
        let v6 = addr("::1");
        assert_eq!(
            v4.compare_less_equal(v6),
            Err(AddressError::InvalidOperand(v4, v6))
        );
        assert_eq!(v4.partial_cmp(&v6), None);
    }

    #[test]
    fn formats_canonical_text() {
        assert_eq!(addr("10.0.0.1").to_string(), "10.0.0.1");
        assert_eq!(addr("2606:4700:0000:0000:0000:0000:0000:0001").to_string(), "2606:4700::1");
    }

    #[test]
    fn probe_targets() {
        assert!(addr("10.0.0.0").is_probe_target());
        assert!(addr("2606:4700::").is_probe_target());
        assert!(!addr("0.0.0.0").is_probe_target());
        assert!(!addr("224.0.0.1").is_probe_target());
        assert!(!addr("255.255.255.255").is_probe_target());
        assert!(!addr("::").is_probe_target());
        assert!(!addr("ff02::1").is_probe_target());
    }
}
