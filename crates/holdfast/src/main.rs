use anyhow::Context as _;
use clap::Parser as _;
use holdfast::{setup_logging, unlocker, App, Args};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    setup_logging()?;
    unlocker::mark_startup();

    let args = Args::parse();

    // The unlocker runs before everything else: with its flags present,
    // this process only ever serves the unlock page and then re-executes
    // itself (without those flags) from the ramdisk.
    if let Some(port) = args.pwdserver_port {
        let config = unlocker::UnlockerConfig {
            port,
            secret_path: args
                .pwdserver_url
                .clone()
                .context("--pwdserver-url is required together with --pwdserver-port")?,
            archive_path: args
                .pwdserver_archive
                .clone()
                .context("--pwdserver-archive is required together with --pwdserver-port")?,
        };
        return unlocker::run(config).await;
    }

    App::run_until_completion(args).await
}
