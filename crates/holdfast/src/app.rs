use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Context as _;
use tokio::sync::watch;
use tokio::task::JoinSet;

use crate::blacklist::{run_refresher, Blacklist};
use crate::command::ShellCommandProcessor;
use crate::dns::{DnsServer, DnsServerConfig};
use crate::proxy::CipherProxy;
use crate::{Args, DEFAULT_FORWARDERS};

pub struct App;

impl App {
    /// Wires the daemons together and blocks until they all stop. The DNS
    /// forwarder and the cipher relay share one blacklist; every long-lived
    /// task observes the same stop signal, fired on Ctrl-C.
    pub async fn run_until_completion(args: Args) -> anyhow::Result<()> {
        let blacklist = Arc::new(Blacklist::new());
        let (stop_tx, stop_rx) = watch::channel(false);

        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::info!("interrupted; asking all listeners to stop");
                let _ = stop_tx.send(true);
            }
        });

        let forwarders = parse_forwarders(&args.forwarders)?;
        let processor = args.command_pin.clone().map(|pin| Arc::new(ShellCommandProcessor::new(pin)));

        let config = DnsServerConfig {
            bind_ip: args.host,
            udp_port: (args.dns_udp_port != 0).then_some(args.dns_udp_port),
            tcp_port: (args.dns_tcp_port != 0).then_some(args.dns_tcp_port),
            forwarders,
            allow_query_prefixes: args.allow_query_prefixes.clone(),
            per_ip_limit: args.per_ip_limit,
        };
        let mut server = DnsServer::new(config, blacklist.clone(), processor, stop_rx.clone())
            .await
            .context("failed to instantiate the DNS server")?;
        server.add_workers(args.max_parallel_connections);
        tracing::info!(udp = ?server.udp_addr(), tcp = ?server.tcp_addr(), "DNS forwarder is listening");

        let mut tasks = JoinSet::new();
        tasks.spawn(run_refresher(blacklist.clone(), stop_rx.clone()));
        tasks.spawn(server.block_until_completion());

        if let Some(relay_port) = args.relay_port {
            let password = args
                .relay_password
                .as_deref()
                .context("--relay-password is required together with --relay-port")?;
            let proxy = CipherProxy::new(
                SocketAddr::new(args.host, relay_port),
                password,
                args.per_ip_limit,
                blacklist.clone(),
                stop_rx.clone(),
            )
            .await
            .context("failed to instantiate the cipher relay")?;
            tasks.spawn(proxy.start_and_block());
        }

        while let Some(result) = tasks.join_next().await {
            if let Err(e) = result.context("failed to execute a task")? {
                tracing::debug!("error: {:#}", e);
            }
        }

        Ok(())
    }
}

fn parse_forwarders(configured: &[String]) -> anyhow::Result<Vec<SocketAddr>> {
    let sources: Vec<&str> = if configured.is_empty() {
        DEFAULT_FORWARDERS.to_vec()
    } else {
        configured.iter().map(String::as_str).collect()
    };
    sources
        .iter()
        .map(|addr| {
            addr.parse()
                .with_context(|| format!("forwarder '{}' is not a host:port address", addr))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_forwarders_all_parse() {
        let forwarders = parse_forwarders(&[]).expect("shouldn't have failed");
        assert_eq!(forwarders.len(), DEFAULT_FORWARDERS.len());
    }

    #[test]
    fn malformed_forwarders_are_rejected() {
        assert!(parse_forwarders(&["not an address".to_owned()]).is_err());
    }
}
