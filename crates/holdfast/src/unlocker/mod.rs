mod archive;
mod ramdisk;
mod sysinfo;

use std::future::IntoFuture as _;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context as _;
use axum::extract::{Form, State};
use axum::http::header;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use serde::Deserialize;
use tokio::sync::{watch, Mutex};

pub use archive::{decrypt_archive_bytes, encrypt_archive_bytes, extract};
pub use ramdisk::Ramdisk;
pub use sysinfo::{mark_startup, sysinfo_text};

/// A rather randomly typed string sent as the Content-Location header value
/// by the unlock page (and only that page), so automated clients can tell a
/// genuine unlocker apart from any other web server.
pub const CONTENT_LOCATION_MAGIC: &str = "vmseuijt5oj4d5x7fygfqj4398";
/// Name of the HTML form element that accepts the password.
pub const PASSWORD_INPUT_NAME: &str = "password";
/// CLI flags with this stem belong to the unlocker and are stripped from
/// the re-executed program's argv.
pub const CLI_FLAG: &str = "pwdserver";

/// Pending transfers get this long to finish before the server goes away.
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(10);

const MIB: u64 = 1024 * 1024;

pub struct UnlockerConfig {
    pub port: u16,
    /// The secret path serving the unlock page, with the leading slash.
    pub secret_path: String,
    pub archive_path: PathBuf,
}

struct UnlockState {
    archive_path: PathBuf,
    archive_size: u64,
    unlock_tx: watch::Sender<bool>,
    inner: Mutex<UnlockInner>,
}

#[derive(Default)]
struct UnlockInner {
    already_unlocked: bool,
    ramdisk: Option<Ramdisk>,
}

#[derive(Deserialize)]
struct PasswordForm {
    #[serde(default)]
    password: String,
}

fn render_page(sysinfo: &str, message: &str) -> String {
    format!(
        "<!doctype html>\n<html>\n<head>\n    <meta http-equiv=\"Content-Type\" content=\"text/html; charset=utf-8\" />\n\t<title>Hello</title>\n</head>\n<body>\n\t<pre>{}</pre>\n    <form action=\"#\" method=\"post\">\n        <p>Enter password to launch main program: <input type=\"password\" name=\"{}\"/></p>\n        <p><input type=\"submit\" value=\"Launch\"/></p>\n        <p>{}</p>\n    </form>\n</body>\n</html>\n",
        sysinfo, PASSWORD_INPUT_NAME, message
    )
}

/// Every response on the secret path carries the no-store directives and
/// the magic Content-Location.
fn secret_page_response(body: String) -> Response {
    (
        [
            (header::CACHE_CONTROL, "no-cache, no-store, must-revalidate"),
            (header::CONTENT_LOCATION, CONTENT_LOCATION_MAGIC),
            (header::CONTENT_TYPE, "text/html; charset=utf-8"),
        ],
        body,
    )
        .into_response()
}

async fn show_form(State(state): State<Arc<UnlockState>>) -> Response {
    if state.inner.lock().await.already_unlocked {
        return secret_page_response("OK".to_owned());
    }
    tracing::info!("just visiting");
    secret_page_response(render_page(&sysinfo_text().await, ""))
}

async fn attempt_unlock(State(state): State<Arc<UnlockState>>, Form(form): Form<PasswordForm>) -> Response {
    // One attempt at a time, and none at all once somebody has succeeded
    let mut inner = state.inner.lock().await;
    if inner.already_unlocked {
        return secret_page_response("OK".to_owned());
    }
    tracing::info!("an unlock attempt has been made");

    // Room for the decrypted archive plus the extracted files, plus a
    // little headroom
    let size_mb = (2 * state.archive_size).div_ceil(MIB) + 8;
    let ramdisk = match Ramdisk::create(size_mb).await {
        Ok(ramdisk) => ramdisk,
        Err(err) => {
            return secret_page_response(render_page(&sysinfo_text().await, &format!("{:#}", err)));
        }
    };
    // A predecessor process killed outright never got to clean up after its
    // own ramdisk; do it for it before filling ours
    Ramdisk::destroy_all_stale().await;

    let tmp_path = ramdisk.path().join("extract-tmp");
    let password = form.password.trim();
    if let Err(err) = extract(&state.archive_path, &tmp_path, ramdisk.path(), password).await {
        ramdisk.destroy().await;
        return secret_page_response(render_page(&sysinfo_text().await, &format!("{:#}", err)));
    }

    inner.already_unlocked = true;
    inner.ramdisk = Some(ramdisk);
    drop(inner);

    // The serve loop picks this up and relaunches once the response is out
    let _ = state.unlock_tx.send(true);
    secret_page_response(render_page(&sysinfo_text().await, "success"))
}

fn build_router(secret_path: &str, state: Arc<UnlockState>) -> Router {
    Router::new()
        .route(secret_path, get(show_form).post(attempt_unlock))
        // Every other path renders an empty page, revealing nothing
        .fallback(|| async { "" })
        .with_state(state)
}

/// Serves the unlock page until a successful unlock, then re-executes this
/// program from inside the ramdisk and waits for it. The ramdisk is
/// destroyed on every exit path.
pub async fn run(config: UnlockerConfig) -> anyhow::Result<()> {
    let archive_size = tokio::fs::metadata(&config.archive_path)
        .await
        .with_context(|| format!("failed to read the archive file at {}", config.archive_path.display()))?
        .len();

    let (unlock_tx, mut unlock_rx) = watch::channel(false);
    let state = Arc::new(UnlockState {
        archive_path: config.archive_path,
        archive_size,
        unlock_tx,
        inner: Mutex::new(UnlockInner::default()),
    });

    let listener = tokio::net::TcpListener::bind(("0.0.0.0", config.port))
        .await
        .with_context(|| format!("failed to listen on TCP port {}", config.port))?;
    tracing::info!(port = config.port, "unlocker will listen for the password");

    let shutdown_rx = unlock_rx.clone();
    let server = axum::serve(listener, build_router(&config.secret_path, state.clone())).with_graceful_shutdown(async move {
        let mut shutdown_rx = shutdown_rx;
        let _ = shutdown_rx.changed().await;
    });
    let mut server_task = tokio::spawn(server.into_future());

    tokio::select! {
        result = &mut server_task => {
            result.context("unlocker server task failed")?.context("unlocker server failed")?;
        }
        _ = unlock_rx.changed() => {
            // Pending transfers (the success page among them) may finish,
            // but not indefinitely
            if tokio::time::timeout(SHUTDOWN_TIMEOUT, &mut server_task).await.is_err() {
                tracing::warn!("unlocker server did not shut down in time");
                server_task.abort();
            }
        }
    }

    let ramdisk = state
        .inner
        .lock()
        .await
        .ramdisk
        .take()
        .context("unlocker server stopped without a successful unlock")?;

    let result = launch_main_program(&ramdisk).await;
    ramdisk.destroy().await;
    result
}

/// Re-executes this program from inside the ramdisk: same executable, same
/// argv minus the unlocker's own flags, stdio inherited.
async fn launch_main_program(ramdisk: &Ramdisk) -> anyhow::Result<()> {
    let executable = std::env::current_exe().context("failed to determine the path to this program's executable")?;
    std::env::set_current_dir(ramdisk.path())
        .with_context(|| format!("failed to cd to {}", ramdisk.path().display()))?;

    let flags = strip_unlocker_flags(std::env::args().skip(1).collect());
    tracing::info!(?flags, "about to launch the main program");

    let status = tokio::process::Command::new(&executable)
        .args(&flags)
        .status()
        .await
        .context("failed to launch the main program")?;
    anyhow::ensure!(status.success(), "the main program exited abnormally: {}", status);
    tracing::info!("the main program has exited cleanly");
    Ok(())
}

/// Drops every `-pwdserver*` flag, and the value it carries in the
/// following argument, from a replicated argv.
fn strip_unlocker_flags(args: Vec<String>) -> Vec<String> {
    let mut kept = Vec::with_capacity(args.len());
    let mut iter = args.into_iter().peekable();
    while let Some(arg) = iter.next() {
        let stem = arg.trim_start_matches('-');
        if arg.starts_with('-') && stem.starts_with(CLI_FLAG) {
            // All unlocker flags take a value; it may ride in the same
            // argument after '=' or in the next one
            if !arg.contains('=') {
                if iter.peek().is_some_and(|next| !next.starts_with('-')) {
                    iter.next();
                }
            }
            continue;
        }
        kept.push(arg);
    }
    kept
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn strips_unlocker_flags_and_their_values() {
        assert_eq!(
            strip_unlocker_flags(args(&[
                "--dns-udp-port",
                "5353",
                "--pwdserver-port",
                "8080",
                "--pwdserver-url=/secret",
                "--pwdserver-archive",
                "/opt/archive.bin",
                "--relay-port",
                "1080",
            ])),
            args(&["--dns-udp-port", "5353", "--relay-port", "1080"])
        );
    }

    #[test]
    fn keeps_unrelated_flags_untouched() {
        let unchanged = args(&["--host", "0.0.0.0", "--per-ip-limit", "48"]);
        assert_eq!(strip_unlocker_flags(unchanged.clone()), unchanged);
    }

    #[test]
    fn ramdisk_size_has_headroom_for_extraction() {
        let archive_size: u64 = 4 * MIB;
        assert_eq!((2 * archive_size).div_ceil(MIB) + 8, 16);
        // Sub-MiB archives still round up
        assert_eq!((2 * 100u64).div_ceil(MIB) + 8, 9);
    }

    async fn spawn_unlocker(state: Arc<UnlockState>) -> std::net::SocketAddr {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.expect("bind failed");
        let addr = listener.local_addr().expect("local addr");
        tokio::spawn(async move {
            let _ = axum::serve(listener, build_router("/secret", state)).await;
        });
        addr
    }

    fn test_state(archive_path: PathBuf) -> Arc<UnlockState> {
        let (unlock_tx, _unlock_rx) = watch::channel(false);
        Arc::new(UnlockState {
            archive_path,
            archive_size: 4 * MIB,
            unlock_tx,
            inner: Mutex::new(UnlockInner::default()),
        })
    }

    #[tokio::test]
    async fn the_secret_path_carries_the_magic_header() {
        let state = test_state(PathBuf::from("/nonexistent"));
        let addr = spawn_unlocker(state).await;

        let response = reqwest::get(format!("http://{}/secret", addr)).await.expect("request failed");
        assert_eq!(response.status(), 200);
        assert_eq!(
            response.headers().get("content-location").and_then(|v| v.to_str().ok()),
            Some(CONTENT_LOCATION_MAGIC)
        );
        assert_eq!(
            response.headers().get("cache-control").and_then(|v| v.to_str().ok()),
            Some("no-cache, no-store, must-revalidate")
        );
        let body = response.text().await.expect("body");
        assert!(body.contains("Enter password to launch main program"));
        assert!(body.contains(&format!("name=\"{}\"", PASSWORD_INPUT_NAME)));
    }

    #[tokio::test]
    async fn any_other_path_renders_an_empty_page() {
        let state = test_state(PathBuf::from("/nonexistent"));
        let addr = spawn_unlocker(state).await;

        let response = reqwest::get(format!("http://{}/anything-else", addr)).await.expect("request failed");
        assert_eq!(response.status(), 200);
        assert!(response.headers().get("content-location").is_none());
        assert_eq!(response.text().await.expect("body"), "");
    }

    #[tokio::test]
    async fn post_after_a_successful_unlock_answers_ok() {
        let state = test_state(PathBuf::from("/nonexistent"));
        state.inner.lock().await.already_unlocked = true;
        let addr = spawn_unlocker(state).await;

        let client = reqwest::Client::new();
        let response = client
            .post(format!("http://{}/secret", addr))
            .form(&[(PASSWORD_INPUT_NAME, "whatever")])
            .send()
            .await
            .expect("request failed");
        assert_eq!(response.text().await.expect("body"), "OK");
    }
}
