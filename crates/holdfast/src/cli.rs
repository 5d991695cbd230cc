use std::net::IpAddr;
use std::path::PathBuf;

use clap::Parser;

#[derive(Parser, Debug, Clone)]
#[command(version, name = "holdfast")]
pub struct Args {
    /// Network address all listeners bind to
    #[arg(long, value_name = "ADDR", default_value = "0.0.0.0")]
    pub host: IpAddr,
    /// UDP port of the DNS forwarder; 0 disables the UDP listener
    #[arg(long, value_name = "PORT", default_value_t = 53)]
    pub dns_udp_port: u16,
    /// TCP port of the DNS forwarder; 0 disables the TCP listener
    #[arg(long, value_name = "PORT", default_value_t = 53)]
    pub dns_tcp_port: u16,
    /// Upstream recursive resolvers as host:port; a built-in list of public
    /// resolvers is used when none are given
    #[arg(long = "forwarder", value_name = "ADDR:PORT")]
    pub forwarders: Vec<String>,
    /// Client address prefixes (textual) that are allowed to query, in
    /// addition to localhost and this host's own public IP
    #[arg(long = "allow-query-prefix", value_name = "PREFIX")]
    pub allow_query_prefixes: Vec<String>,
    /// Approximately how many operations per second to admit per client IP
    #[arg(long, value_name = "COUNT", default_value_t = 48)]
    pub per_ip_limit: usize,
    #[arg(long, value_name = "WORKERS", default_value_t = 5, value_parser = clap::value_parser!(u8).range(1..=10))]
    pub max_parallel_connections: u8,
    /// Access PIN of the TXT command tunnel; the tunnel stays disabled
    /// without it
    #[arg(long, value_name = "PIN")]
    pub command_pin: Option<String>,

    /// TCP port of the cipher relay; the relay stays disabled without it
    #[arg(long, value_name = "PORT")]
    pub relay_port: Option<u16>,
    /// Preshared password of the cipher relay
    #[arg(long, value_name = "PASSWORD")]
    pub relay_password: Option<String>,

    /// TCP port of the bootstrap unlocker. When given, the process serves
    /// only the unlocker until a successful unlock re-executes it.
    #[arg(long, value_name = "PORT")]
    pub pwdserver_port: Option<u16>,
    /// Secret URL path of the unlock page, including the leading slash
    #[arg(long, value_name = "PATH")]
    pub pwdserver_url: Option<String>,
    /// Path to the encrypted program archive
    #[arg(long, value_name = "PATH")]
    pub pwdserver_archive: Option<PathBuf>,
}
