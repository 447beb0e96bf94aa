//! Detour router - rule based traffic dispatch with a multi-upstream DNS
//! resolver.
//!
//! Flows arrive as [`metadata::TcpFlow`] and [`metadata::UdpPacket`]
//! descriptors on the queues returned by [`tunnel::Tunnel::start`], are
//! matched against the active rule list and handed to an outbound. DNS
//! questions are answered by [`resolver::Resolver`] with caching, request
//! coalescing, fallback racing and per-domain nameserver policy.

pub mod cache;
pub mod dns;
pub mod enhancer;
pub mod error;
pub mod fakeip;
pub mod filter;
pub mod lookup;
pub mod metadata;
pub mod nat;
pub mod outbound;
pub mod process;
pub mod resolver;
pub mod rule;
pub mod service;
pub mod singleflight;
pub mod state;
pub mod stats;
pub mod transport;
pub mod trie;
pub mod tunnel;
