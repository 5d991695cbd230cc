mod logging;
pub use logging::setup_logging;
mod cli;
pub use cli::Args;
mod app;
pub use app::App;
mod limiter;
pub use limiter::RateLimiter;
mod connection;
pub use connection::{AsyncUdpSocket, Connection};
mod lockdown;
pub use lockdown::{is_lockdown, set_lockdown};
mod exec;
pub mod blacklist;
pub mod command;
pub mod dns;
pub mod proxy;
pub mod unlocker;

use std::time::Duration;

/// Rate limit counters are evaluated over this interval.
pub const RATE_LIMIT_INTERVAL: Duration = Duration::from_secs(1);
/// IO deadline for a round trip with an upstream forwarder.
pub const FORWARDER_TIMEOUT: Duration = Duration::from_secs(2);
/// IO deadline for a round trip with an inbound DNS client.
pub const CLIENT_TIMEOUT: Duration = Duration::from_secs(60);
/// IO deadline for relay and unlocker transfers.
pub const IO_TIMEOUT: Duration = Duration::from_secs(120);
/// Largest acceptable packet, for both DNS over UDP and relay copy buffers.
pub const MAX_PACKET_SIZE: usize = 9038;
/// A query shorter than this cannot possibly be a name query.
pub const MIN_NAME_QUERY_SIZE: usize = 14;
/// The ad-server blacklist is rebuilt at this interval.
pub const BLACKLIST_UPDATE_INTERVAL: Duration = Duration::from_secs(12 * 3600);
/// How long to wait before downloading blacklists for the first time.
pub const BLACKLIST_INITIAL_DELAY: Duration = Duration::from_secs(120);
/// Deadline for downloading a single blacklist hosts file.
pub const BLACKLIST_DOWNLOAD_TIMEOUT: Duration = Duration::from_secs(30);
/// Entries accepted into the blacklist after retrieving public sources.
pub const BLACKLIST_MAX_ENTRIES: usize = 100_000;
/// How often the daemon's own public IP is re-discovered and admitted as a
/// query source.
pub const PUBLIC_IP_REFRESH_INTERVAL: Duration = Duration::from_secs(900);
/// TTL of a text command reply. Leave it low.
pub const TEXT_COMMAND_REPLY_TTL: Duration = Duration::from_secs(30);
/// A TXT query whose name starts with this character is most likely a text
/// command. Keep it short, DNS query input has to be pretty short.
pub const COMMAND_PREFIX: char = '_';

/// Well tested public recursive resolvers that support both TCP and UDP.
/// Used whenever the operator leaves the forwarder list unspecified; each
/// client query is handled by one of them picked at random.
pub const DEFAULT_FORWARDERS: &[&str] = &[
    // Quad9
    "9.9.9.9:53",
    "149.112.112.112:53",
    // CloudFlare with malware prevention
    "1.1.1.2:53",
    "1.0.0.2:53",
    // OpenDNS
    "208.67.222.222:53",
    "208.67.220.220:53",
    // AdGuard DNS
    "176.103.130.130:53",
    "176.103.130.131:53",
    // SafeDNS
    "195.46.39.39:53",
    "195.46.39.40:53",
];
