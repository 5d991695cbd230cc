use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Context as _;
use rand::Rng as _;
use tokio::net::UdpSocket;

use super::message::{blackhole_response, txt_response, DnsQuery, QueryKind};
use super::upstream::forward_query;
use super::AllowedSources;
use crate::blacklist::Blacklist;
use crate::command::{decode_dtmf, CommandProcessor, LatestCommandCache, DTMF_DECODE_TABLE};
use crate::{
    Connection, CLIENT_TIMEOUT, COMMAND_PREFIX, FORWARDER_TIMEOUT, MIN_NAME_QUERY_SIZE, TEXT_COMMAND_REPLY_TTL,
};

/// The per-query pipeline shared by the UDP and TCP listeners.
pub struct Resolver<P> {
    blacklist: Arc<Blacklist>,
    allowed: AllowedSources,
    forwarders: Vec<SocketAddr>,
    processor: Option<Arc<P>>,
    latest_commands: LatestCommandCache,
}

impl<P: CommandProcessor> Resolver<P> {
    pub fn new(
        blacklist: Arc<Blacklist>,
        allowed: AllowedSources,
        forwarders: Vec<SocketAddr>,
        processor: Option<Arc<P>>,
    ) -> Self {
        Resolver {
            blacklist,
            allowed,
            forwarders,
            processor,
            latest_commands: LatestCommandCache::new(),
        }
    }

    /// Handles one inbound query. Parse errors and forwarder failures drop
    /// the query without a response.
    pub async fn handle_query(self: Arc<Self>, mut connection: Connection<Arc<UdpSocket>>) -> anyhow::Result<()> {
        let client_ip = connection.client_ip()?;
        if !self.allowed.is_allowed(client_ip).await {
            tracing::debug!(%client_ip, "dropping a query from a disallowed source");
            return Ok(());
        }

        let raw = tokio::time::timeout(CLIENT_TIMEOUT, connection.read_query())
            .await
            .context("client timed out")??;

        if raw.len() < MIN_NAME_QUERY_SIZE {
            tracing::debug!(%client_ip, len = raw.len(), "dropping a packet too short to be a query");
            return Ok(());
        }

        let query = match DnsQuery::parse(&raw) {
            Ok(query) => query,
            Err(err) => {
                tracing::debug!(%client_ip, "dropping a malformed query: {:#}", err);
                return Ok(());
            }
        };

        let response = match query.kind {
            QueryKind::Name if self.blacklist.contains(&query.name) => {
                tracing::debug!(name = %query.name, "answering a black listed name with the black hole");
                blackhole_response(&query)?
            }
            QueryKind::Text if self.processor.is_some() && command_text(&query.name).is_some() => {
                self.answer_command(&query).await?
            }
            _ => {
                let use_tcp = connection.is_tcp();
                match self.forward(&query, use_tcp).await {
                    Ok(response) => response,
                    Err(err) => {
                        // No synthesized SERVFAIL; the client retries on its own
                        tracing::debug!(name = %query.name, "dropping a query after forwarder failure: {:#}", err);
                        return Ok(());
                    }
                }
            }
        };

        if let Err(err) = connection.send_response(&response).await {
            // Per-client and thus recoverable
            tracing::debug!(%client_ip, "error while sending a DNS response: {:#}", err);
        }

        Ok(())
    }

    /// Runs the command carried in a TXT query name and wraps its output in
    /// a TXT answer. Identical queries within the reply TTL are served from
    /// the cache without re-running anything.
    async fn answer_command(&self, query: &DnsQuery) -> anyhow::Result<Vec<u8>> {
        let processor = self.processor.as_ref().context("bug: command tunnel without a processor")?;
        let encoded = command_text(&query.name)
            .context("bug: command tunnel without command text")?
            .to_owned();

        let result = match self.latest_commands.get(&encoded) {
            Some(result) => result,
            None => {
                let decoded = decode_dtmf(&encoded, DTMF_DECODE_TABLE);
                let result = processor.process(&decoded, 2 * FORWARDER_TIMEOUT).await;
                self.latest_commands.put(encoded, result.clone(), TEXT_COMMAND_REPLY_TTL);
                result
            }
        };

        txt_response(query, &result, TEXT_COMMAND_REPLY_TTL.as_secs() as u32)
    }

    /// Relays the query bytes to one forwarder picked uniformly at random.
    async fn forward(&self, query: &DnsQuery, use_tcp: bool) -> anyhow::Result<Vec<u8>> {
        anyhow::ensure!(!self.forwarders.is_empty(), "no forwarders are configured");
        let forwarder = {
            let mut rng = rand::thread_rng();
            self.forwarders[rng.gen_range(0..self.forwarders.len())]
        };
        forward_query(&query.raw, forwarder, use_tcp).await
    }
}

/// The command smuggled in a query name: everything between the leading
/// prefix character and the first dot. `_.apple.com` carries nothing and is
/// a legitimate TXT name, not a command.
fn command_text(name: &str) -> Option<&str> {
    let rest = name.strip_prefix(COMMAND_PREFIX)?;
    let text = rest.split('.').next().unwrap_or_default();
    (!text.is_empty()).then_some(text)
}
