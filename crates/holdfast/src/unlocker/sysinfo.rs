use std::sync::OnceLock;
use std::time::{Duration, Instant};

use crate::exec::invoke_program;

static STARTUP_TIME: OnceLock<Instant> = OnceLock::new();

/// Call once at process start so the page can show program uptime.
pub fn mark_startup() {
    let _ = STARTUP_TIME.set(Instant::now());
}

/// Human-readable system information shown above the password form.
pub async fn sysinfo_text() -> String {
    let (used_mem_kb, total_mem_kb) = system_memory_kb();
    let (used_root_kb, total_root_kb) = root_disk_kb().await;
    format!(
        "\nClock: {}\nSys/prog uptime: {}s / {}s\nTotal/used/prog mem: {} / {} / {} MB\nTotal/used rootfs: {} / {} MB\nSys load: {}\nNum CPU/threads: {} / {}\n",
        chrono::Local::now().to_rfc2822(),
        system_uptime_secs(),
        STARTUP_TIME.get().map(|at| at.elapsed().as_secs()).unwrap_or(0),
        total_mem_kb / 1024,
        used_mem_kb / 1024,
        program_memory_kb() / 1024,
        total_root_kb / 1024,
        used_root_kb / 1024,
        system_load(),
        std::thread::available_parallelism().map(|n| n.get()).unwrap_or(0),
        program_thread_count(),
    )
}

fn proc_field(path: &str, field: &str) -> Option<u64> {
    let content = std::fs::read_to_string(path).ok()?;
    content
        .lines()
        .find(|line| line.starts_with(field))?
        .split_whitespace()
        .nth(1)?
        .parse()
        .ok()
}

/// Used and total system memory in KB; zeros when they cannot be read.
fn system_memory_kb() -> (u64, u64) {
    let total = proc_field("/proc/meminfo", "MemTotal:").unwrap_or(0);
    let available = proc_field("/proc/meminfo", "MemAvailable:")
        .or_else(|| proc_field("/proc/meminfo", "MemFree:"))
        .unwrap_or(0);
    (total.saturating_sub(available), total)
}

/// RSS of this process in KB, or 0 when it cannot be read.
fn program_memory_kb() -> u64 {
    proc_field("/proc/self/status", "VmRSS:").unwrap_or(0)
}

fn program_thread_count() -> u64 {
    proc_field("/proc/self/status", "Threads:").unwrap_or(0)
}

fn system_uptime_secs() -> u64 {
    std::fs::read_to_string("/proc/uptime")
        .ok()
        .and_then(|content| content.split('.').next().and_then(|secs| secs.trim().parse().ok()))
        .unwrap_or(0)
}

fn system_load() -> String {
    std::fs::read_to_string("/proc/loadavg").map(|load| load.trim().to_owned()).unwrap_or_default()
}

/// Used and total size of the filesystem mounted on /, in KB. Zeros when
/// `df` is unavailable.
async fn root_disk_kb() -> (u64, u64) {
    let Ok(out) = invoke_program("df", &["-Pk", "/"], Duration::from_secs(10)).await else {
        return (0, 0);
    };
    // POSIX df: "fs 1024-blocks used available capacity mount"
    let Some(data_line) = out.lines().nth(1) else {
        return (0, 0);
    };
    let mut fields = data_line.split_whitespace().skip(1);
    let total = fields.next().and_then(|v| v.parse().ok()).unwrap_or(0);
    let used = fields.next().and_then(|v| v.parse().ok()).unwrap_or(0);
    (used, total)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn sysinfo_renders_every_line() {
        mark_startup();
        let text = sysinfo_text().await;
        assert!(text.contains("Clock: "));
        assert!(text.contains("uptime"));
        assert!(text.contains("mem"));
        assert!(text.contains("CPU"));
    }
}
