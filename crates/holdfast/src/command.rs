use std::collections::HashMap;
use std::future::Future;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use crate::exec::invoke_program;

/// Substitutions applied to command text smuggled through a TXT query name,
/// where only digits survive some input devices. Longer patterns are matched
/// first.
pub const DTMF_DECODE_TABLE: &[(&str, &str)] = &[("142", "."), ("0", " ")];

/// Administrative command execution, provided by an external collaborator.
/// Implementations decide authentication and what the text means.
pub trait CommandProcessor: Send + Sync + 'static {
    /// Processes one command and returns its textual result. The result is
    /// also what authentication failures look like to the client.
    fn process(&self, input: &str, deadline: Duration) -> impl Future<Output = String> + Send;
}

/// Decodes digit substitutions in command text, longest pattern first.
pub fn decode_dtmf(input: &str, table: &[(&str, &str)]) -> String {
    let mut patterns: Vec<&(&str, &str)> = table.iter().collect();
    patterns.sort_by_key(|(pattern, _)| std::cmp::Reverse(pattern.len()));

    let mut out = String::with_capacity(input.len());
    let mut rest = input;
    'outer: while !rest.is_empty() {
        for (pattern, replacement) in patterns.iter() {
            if let Some(tail) = rest.strip_prefix(pattern) {
                out.push_str(replacement);
                rest = tail;
                continue 'outer;
            }
        }
        let mut chars = rest.chars();
        // Always succeeds: rest is non-empty
        if let Some(c) = chars.next() {
            out.push(c);
        }
        rest = chars.as_str();
    }
    out
}

/// Replaces non-printable characters with underscores and caps the length,
/// so command output is safe to log and to embed in a TXT answer.
pub fn lint_output(input: &str, max_len: usize) -> String {
    input
        .chars()
        .take(max_len)
        .map(|c| {
            if c.is_control() && c != '\n' && c != '\t' {
                '_'
            } else {
                c
            }
        })
        .collect()
}

struct CachedReply {
    result: String,
    expires_at: Instant,
}

/// Remembers the result of recently executed commands, so that DNS clients
/// retrying a TXT query within the reply TTL observe one stable answer
/// instead of re-running the command.
#[derive(Default)]
pub struct LatestCommandCache {
    entries: Mutex<HashMap<String, CachedReply>>,
}

impl LatestCommandCache {
    pub fn new() -> Self {
        Default::default()
    }

    pub fn get(&self, key: &str) -> Option<String> {
        let entries = self.entries.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        entries
            .get(key)
            .filter(|reply| reply.expires_at > Instant::now())
            .map(|reply| reply.result.clone())
    }

    pub fn put(&self, key: String, result: String, ttl: Duration) {
        let mut entries = self.entries.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        // Expired leftovers are reclaimed on insert rather than by a timer.
        entries.retain(|_, reply| reply.expires_at > Instant::now());
        entries.insert(
            key,
            CachedReply {
                result,
                expires_at: Instant::now() + ttl,
            },
        );
    }
}

/// A [`CommandProcessor`] that runs shell one-liners. The command text must
/// start with the configured PIN, followed by `.s` and the shell code, e.g.
/// `verysecret.s date`.
pub struct ShellCommandProcessor {
    pin: String,
    interpreter: String,
}

impl ShellCommandProcessor {
    pub fn new(pin: String) -> Self {
        ShellCommandProcessor {
            pin,
            interpreter: default_shell_interpreter(),
        }
    }
}

fn default_shell_interpreter() -> String {
    for shell in ["/bin/bash", "/usr/bin/bash", "/bin/dash", "/bin/sh", "/usr/bin/sh"] {
        if std::path::Path::new(shell).exists() {
            return shell.to_owned();
        }
    }
    "/bin/sh".to_owned()
}

impl CommandProcessor for ShellCommandProcessor {
    async fn process(&self, input: &str, deadline: Duration) -> String {
        let Some(rest) = input.strip_prefix(&self.pin) else {
            tracing::info!("rejected a command with a bad PIN");
            return "invalid PIN".to_owned();
        };
        let Some(shell_code) = rest.strip_prefix(".s ").map(str::trim) else {
            return "unknown command feature".to_owned();
        };

        let result = match invoke_program(&self.interpreter, &["-c", shell_code], deadline).await {
            Ok(out) => out,
            // The error already carries whatever the child printed
            Err(err) => format!("{:#}", err),
        };
        lint_output(&result, 4096)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dtmf_decoding_matches_longest_pattern_first() {
        // `142` must decode as one full stop, not as `1` + two spaces ("0"
        // would otherwise shadow nothing here, but the order still matters
        // for tables where patterns share a prefix)
        assert_eq!(decode_dtmf("verysecret142s0date", DTMF_DECODE_TABLE), "verysecret.s date");
        assert_eq!(decode_dtmf("a0b0c", DTMF_DECODE_TABLE), "a b c");
        assert_eq!(decode_dtmf("142142", DTMF_DECODE_TABLE), "..");
        assert_eq!(decode_dtmf("", DTMF_DECODE_TABLE), "");
        assert_eq!(decode_dtmf("plain", DTMF_DECODE_TABLE), "plain");
    }

    #[test]
    fn lint_replaces_control_characters() {
        assert_eq!(lint_output("ok\x01\x02", 100), "ok__");
        assert_eq!(lint_output("keep\nnewline", 100), "keep\nnewline");
        assert_eq!(lint_output("truncated", 5), "trunc");
    }

    #[test]
    fn command_cache_serves_until_expiry() {
        let cache = LatestCommandCache::new();
        cache.put("key".into(), "result".into(), Duration::from_secs(30));
        assert_eq!(cache.get("key").as_deref(), Some("result"));
        assert_eq!(cache.get("other"), None);
    }

    #[test]
    fn command_cache_expires_entries() {
        let cache = LatestCommandCache::new();
        cache.put("key".into(), "result".into(), Duration::from_millis(0));
        assert_eq!(cache.get("key"), None);
    }

    #[tokio::test]
    async fn shell_processor_rejects_bad_pin() {
        let processor = ShellCommandProcessor::new("goodpin".into());
        let reply = processor.process("badpin.s date", Duration::from_secs(5)).await;
        assert_eq!(reply, "invalid PIN");
    }

    #[tokio::test]
    async fn shell_processor_runs_shell_code() {
        let processor = ShellCommandProcessor::new("verysecret".into());
        let reply = processor.process("verysecret.s echo hi there", Duration::from_secs(5)).await;
        assert_eq!(reply, "hi there");
    }
}
