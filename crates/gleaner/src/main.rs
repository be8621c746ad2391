mod cli;

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tracing_subscriber::EnvFilter;

use gleaner_grab::{Fsm, Grabber, Server, Strategy};
use gleaner_nzb::NzbParser;

use crate::cli::Cli;

fn init_tracing(level: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

fn read_password(cli: &Cli) -> Result<String> {
    let Some(passfile) = &cli.passfile else {
        return Ok(String::new());
    };
    let password = std::fs::read_to_string(passfile)
        .with_context(|| format!("reading password from {}", passfile.display()))?;
    Ok(password.trim_end_matches(['\r', '\n']).to_string())
}

fn build_strategy(cli: &Cli, password: &str) -> Arc<Strategy> {
    let mut nntp = gleaner_nntp::Server::new(cli.server.clone(), cli.port, cli.connections);
    if cli.tls {
        nntp = nntp.with_tls(gleaner_nntp::build_tls_config(!cli.insecure));
    }
    if let Some(username) = &cli.username {
        nntp = nntp.with_credentials(username.clone(), password);
    }

    let mut server = Server::new(cli.server.clone(), Arc::new(nntp));
    if let Some(days) = cli.retention_days {
        server = server.with_retention(chrono::Duration::days(days));
    }
    if cli.group_required {
        server = server.with_group_required();
    }
    Arc::new(Strategy::new(vec![Arc::new(server)]))
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(&cli.log_level);

    let password = read_password(&cli)?;
    let nzb = NzbParser::parse_file(&cli.nzb)
        .with_context(|| format!("parsing {}", cli.nzb.display()))?;
    tracing::info!(nzb = %cli.nzb.display(), files = nzb.files.len(), "parsed NZB");

    let strategy = build_strategy(&cli, &password);
    let mut builder = Grabber::builder();
    for pattern in &cli.filter {
        let filter = regex::Regex::new(pattern)
            .with_context(|| format!("invalid filter regex {pattern:?}"))?;
        builder = builder.filter(filter);
    }
    let (grabber, mut post_processable) = builder
        .build(cli.outdir.clone(), strategy, &nzb)
        .context("building download job")?;

    grabber.handle_grabs().await;
    grabber.grab_all().await.context("queueing files")?;
    tracing::info!(job = grabber.name(), "download started");

    let mut progress = tokio::time::interval(Duration::from_secs(5));
    progress.tick().await;
    loop {
        tokio::select! {
            signal = post_processable.recv() => {
                if signal.is_some() {
                    tracing::info!(
                        job = grabber.name(),
                        health = format!("{:.1}%", grabber.health()),
                        "required files downloaded; ready for post-processing"
                    );
                }
                break;
            }
            _ = progress.tick() => {
                tracing::info!(
                    rate = format!("{:.0} B/s", grabber.strategy().rate()),
                    health = format!("{:.1}%", grabber.health()),
                    "downloading"
                );
            }
        }
    }

    if let Some(err) = grabber.shutdown(None).await {
        tracing::warn!(error = %err, "shutdown finished with error");
    }

    for file in grabber.grabbed_files() {
        if let Some(err) = file.err() {
            tracing::warn!(subject = file.subject(), error = %err, "file finished with error");
        }
    }
    tracing::info!(job = grabber.name(), "done");
    Ok(())
}
