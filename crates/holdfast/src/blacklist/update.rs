use std::collections::HashSet;
use std::sync::Arc;

use anyhow::Context as _;
use tokio::sync::watch;
use tokio::task::JoinSet;

use super::Blacklist;
use crate::{BLACKLIST_DOWNLOAD_TIMEOUT, BLACKLIST_INITIAL_DELAY, BLACKLIST_MAX_ENTRIES, BLACKLIST_UPDATE_INTERVAL};

/// Public hosts-file sources of ad and tracker domains.
pub const BLACKLIST_SOURCES: &[&str] = &[
    "https://winhelp2002.mvps.org/hosts.txt",
    "https://pgl.yoyo.org/adservers/serverlist.php?hostformat=hosts&showintro=0&mimetype=plaintext",
];

cfg_if::cfg_if! {
    if #[cfg(windows)] {
        // Windows is very slow to do concurrent DNS lookups; too many
        // parallel resolvers trick it into thinking there is no Internet.
        const NUM_RESOLVE_WORKERS: usize = 4;
    } else {
        const NUM_RESOLVE_WORKERS: usize = 8;
    }
}

/// Keeps the shared blacklist fresh until the stop signal fires. The first
/// rebuild starts after a short delay so daemon startup isn't dominated by
/// downloads.
pub async fn run_refresher(blacklist: Arc<Blacklist>, mut stop_rx: watch::Receiver<bool>) -> anyhow::Result<()> {
    let mut next_run = tokio::time::Instant::now() + BLACKLIST_INITIAL_DELAY;
    loop {
        tokio::select! {
            _ = tokio::time::sleep_until(next_run) => {
                next_run += BLACKLIST_UPDATE_INTERVAL;
                update_blacklist(&blacklist, BLACKLIST_MAX_ENTRIES).await;
            }
            result = stop_rx.changed() => {
                if result.is_err() || *stop_rx.borrow() {
                    tracing::debug!("blacklist refresher is stopping");
                    return Ok(());
                }
            }
        }
    }
}

/// Downloads the latest blacklist sources, resolves the listed names into IP
/// addresses, and swaps the combined result into the shared blacklist.
/// Concurrent invocations are suppressed; the second caller returns at once.
pub async fn update_blacklist(blacklist: &Blacklist, max_entries: usize) {
    if !blacklist.begin_update() {
        tracing::info!("will skip this run because an update is already ongoing");
        return;
    }
    rebuild(blacklist, max_entries).await;
    blacklist.finish_update();
}

async fn rebuild(blacklist: &Blacklist, max_entries: usize) {
    let mut all_names = download_all_sources().await;
    if all_names.len() > max_entries {
        all_names.truncate(max_entries);
    }
    let total_names = all_names.len();

    let mut new_entries: HashSet<String> = HashSet::with_capacity(total_names * 2);
    let mut resolved_names = 0usize;
    let mut failed_names = 0usize;
    let mut resolved_ips = 0usize;

    // Resolve in bounded batches; every name enters the set regardless of
    // whether resolution succeeds, resolved IPs come along as a bonus used
    // by the relay's destination check.
    let mut names = all_names.into_iter();
    let mut workers: JoinSet<(String, Option<Vec<std::net::IpAddr>>)> = JoinSet::new();
    loop {
        while workers.len() < NUM_RESOLVE_WORKERS {
            let Some(name) = names.next() else {
                break;
            };
            // A NUL byte would end up in the OS resolver's C string
            if name.contains('\0') {
                continue;
            }
            workers.spawn(async move {
                let ips = tokio::net::lookup_host((name.as_str(), 0))
                    .await
                    .map(|addrs| addrs.map(|addr| addr.ip()).collect::<Vec<_>>())
                    .ok();
                (name, ips)
            });
        }

        let Some(result) = workers.join_next().await else {
            break;
        };
        let Ok((name, ips)) = result else {
            continue;
        };
        match ips {
            Some(ips) if !ips.is_empty() => {
                resolved_names += 1;
                resolved_ips += ips.len();
                new_entries.extend(ips.iter().map(|ip| ip.to_string()));
            }
            _ => failed_names += 1,
        }
        new_entries.insert(name);

        let attempted = resolved_names + failed_names;
        if attempted % 500 == 1 {
            tracing::info!("resolving {} of {} black listed domain names", attempted, total_names);
        }
    }

    blacklist.replace(new_entries);
    tracing::info!(
        "out of {} domains, {} resolved into {} IPs and {} failed; the blacklist now has {} entries",
        total_names,
        resolved_names,
        resolved_ips,
        failed_names,
        blacklist.len()
    );
}

async fn download_all_sources() -> Vec<String> {
    let client = match reqwest::Client::builder().timeout(BLACKLIST_DOWNLOAD_TIMEOUT).build() {
        Ok(client) => client,
        Err(err) => {
            tracing::warn!("failed to build a download client: {:#}", err);
            return Vec::new();
        }
    };

    let mut deduped: HashSet<String> = HashSet::new();
    let mut all_names = Vec::new();
    for source in BLACKLIST_SOURCES {
        match download_source(&client, source).await {
            Ok(text) => {
                let names = parse_hosts_text(&text);
                tracing::info!("downloaded {} entries from {}", names.len(), source);
                for name in names {
                    if deduped.insert(name.clone()) {
                        all_names.push(name);
                    }
                }
            }
            Err(err) => {
                tracing::warn!("failed to download blacklist from {}: {:#}", source, err);
            }
        }
    }
    all_names
}

async fn download_source(client: &reqwest::Client, url: &str) -> anyhow::Result<String> {
    client
        .get(url)
        .send()
        .await
        .context("request failed")?
        .error_for_status()
        .context("unexpected status")?
        .text()
        .await
        .context("failed to read the response body")
}

/// Extracts blocked names from hosts-file syntax: comment lines are skipped,
/// `0.0.0.0 name` and `127.0.0.1 name` lines yield the name, bare-name lines
/// yield the name itself.
pub fn parse_hosts_text(text: &str) -> Vec<String> {
    text.lines()
        .filter_map(|line| {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                return None;
            }
            let mut fields = line.split_whitespace();
            let first = fields.next()?;
            let name = match fields.next() {
                // "0.0.0.0 ads.example.com  # comment"
                Some(second) if first.parse::<std::net::IpAddr>().is_ok() => second,
                _ => first,
            };
            let name = name.trim().to_lowercase();
            // The sinkhole targets themselves are not blocked names
            if name.is_empty() || name == "localhost" || name.parse::<std::net::IpAddr>().is_ok() {
                return None;
            }
            Some(name)
        })
        .collect()
}
