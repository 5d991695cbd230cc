use std::net::IpAddr;
use std::time::{Duration, Instant};

use tokio::sync::Mutex;

use crate::PUBLIC_IP_REFRESH_INTERVAL;

const PUBLIC_IP_PROVIDERS: &[&str] = &["https://checkip.amazonaws.com", "https://api.ipify.org"];
const PUBLIC_IP_FETCH_TIMEOUT: Duration = Duration::from_secs(10);

/// Decides which clients may query the DNS forwarder: localhost is always
/// in, this host's own public IP is kept in lazily, and the operator may add
/// textual address prefixes.
pub struct AllowedSources {
    prefixes: Vec<String>,
    state: Mutex<PublicIpState>,
}

#[derive(Default)]
struct PublicIpState {
    public_ip: Option<String>,
    refreshed_at: Option<Instant>,
}

impl AllowedSources {
    pub fn new(prefixes: Vec<String>) -> Self {
        AllowedSources {
            prefixes,
            state: Mutex::new(PublicIpState::default()),
        }
    }

    pub async fn is_allowed(&self, client_ip: IpAddr) -> bool {
        // Fast track: localhost may always query
        if client_ip.is_loopback() {
            return true;
        }

        let client_text = client_ip.to_string();
        if client_text.len() > 64 {
            return false;
        }

        let mut state = self.state.lock().await;
        if state
            .public_ip
            .as_ref()
            .is_some_and(|public_ip| *public_ip == client_text)
        {
            return true;
        }

        // At a regular interval make sure the latest public IP is allowed to
        // query, so clients using this host as a VPN exit can use its DNS too.
        let stale = state
            .refreshed_at
            .map_or(true, |at| at.elapsed() >= PUBLIC_IP_REFRESH_INTERVAL);
        if stale {
            state.refreshed_at = Some(Instant::now());
            match fetch_public_ip().await {
                Some(public_ip) => {
                    tracing::info!("the latest public IP {} of this host is now allowed to query", public_ip);
                    let matched = public_ip == client_text;
                    state.public_ip = Some(public_ip);
                    if matched {
                        return true;
                    }
                }
                None => {
                    tracing::warn!("unable to determine the public IP; this host cannot query itself");
                }
            }
        }
        drop(state);

        self.prefixes.iter().any(|prefix| client_text.starts_with(prefix))
    }
}

async fn fetch_public_ip() -> Option<String> {
    let client = reqwest::Client::builder().timeout(PUBLIC_IP_FETCH_TIMEOUT).build().ok()?;
    for provider in PUBLIC_IP_PROVIDERS {
        match client.get(*provider).send().await {
            Ok(response) => {
                if let Ok(text) = response.text().await {
                    let text = text.trim();
                    if text.parse::<IpAddr>().is_ok() {
                        return Some(text.to_owned());
                    }
                }
            }
            Err(err) => tracing::debug!("public IP provider {} failed: {:#}", provider, err),
        }
    }
    None
}
