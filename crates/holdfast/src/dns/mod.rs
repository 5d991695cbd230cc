mod allow;
mod message;
mod resolver;
mod server;
mod upstream;

pub use allow::AllowedSources;
pub use message::{blackhole_response, txt_response, DnsQuery, QueryKind};
pub use resolver::Resolver;
pub use server::{DnsServer, DnsServerConfig};
