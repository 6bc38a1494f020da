mod api;
mod bot;
mod config;
mod console;
mod json_scan;
mod links;
mod lookup;
mod report;
mod scheduler;
mod session;
mod store;
mod types;
mod verifier;

use std::sync::Arc;

use anyhow::Context;
use tokio::{io::BufReader, sync::mpsc};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use crate::{
    api::{RapidApiClient, build_http_client},
    bot::{Bot, BotParts, Notice},
    config::RaidConfig,
    lookup::DirectoryLookup,
    report::Report,
    scheduler::Scheduler,
    store::{RaidStore, SqliteStore},
    types::TriggerKind,
    verifier::EngagementVerifier,
};

// ── Entry point ───────────────────────────────────────────────────────────────

#[tokio::main(flavor = "current_thread")]
async fn main() -> anyhow::Result<()> {
    let _ = dotenvy::dotenv();
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("raidbot=info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cfg = RaidConfig::from_env()?;
    let store: Arc<dyn RaidStore> = Arc::new(
        SqliteStore::open(&cfg.db_path)
            .with_context(|| format!("failed to open `{}`", cfg.db_path.display()))?,
    );
    let http = build_http_client(cfg.api.timeout)?;
    let api = Arc::new(RapidApiClient::new(http, &cfg.api));

    let (trigger_tx, trigger_rx) = mpsc::channel::<TriggerKind>(16);
    let (report_tx, report_rx) = mpsc::channel::<Report>(1);
    let (notice_tx, notice_rx) = mpsc::channel::<Vec<Notice>>(8);

    let mut bot = Bot::new(BotParts {
        store,
        lookup: DirectoryLookup::new(api.clone(), cfg.fields.clone()),
        verifier: EngagementVerifier::new(api, cfg.fields.clone(), cfg.verifier.clone()),
        scheduler: Scheduler::new(trigger_tx, cfg.schedule.report_delay_hours),
        report_tx,
        notice_tx,
        super_admin: cfg.super_admin.clone(),
        default_hours: cfg.schedule.default_hours,
        pace: cfg.verifier.pace(),
    });
    bot.start()?;
    info!(version = bot::VERSION, db = %cfg.db_path.display(), "raidbot ready");

    let (line_tx, line_rx) = mpsc::channel::<String>(64);
    tokio::spawn(console::pump_lines(BufReader::new(tokio::io::stdin()), line_tx));

    run_loop(&mut bot, line_rx, trigger_rx, report_rx, notice_rx).await
}

async fn run_loop(
    bot: &mut Bot,
    mut line_rx: mpsc::Receiver<String>,
    mut trigger_rx: mpsc::Receiver<TriggerKind>,
    mut report_rx: mpsc::Receiver<Report>,
    mut notice_rx: mpsc::Receiver<Vec<Notice>>,
) -> anyhow::Result<()> {
    let mut stdin_open = true;

    loop {
        tokio::select! {
            line = line_rx.recv(), if stdin_open => match line {
                Some(line) => match console::parse_line(&line) {
                    Ok(Some(event)) => emit(bot.handle(event).await),
                    Ok(None) => {}
                    Err(e) => warn!(error = %format!("{e:#}"), "skipping input line"),
                },
                None => {
                    stdin_open = false;
                    if !bot.report_running() {
                        break;
                    }
                    info!("input closed; waiting for the running report");
                }
            },
            Some(kind) = trigger_rx.recv() => emit(bot.on_trigger(kind).await),
            Some(notices) = notice_rx.recv() => emit(notices),
            Some(report) = report_rx.recv() => {
                emit(bot.on_report_finished(report));
                if !stdin_open {
                    break;
                }
            }
            else => {
                error!("all event sources closed");
                break;
            }
        }
    }
    Ok(())
}

fn emit(notices: Vec<Notice>) {
    for notice in notices {
        for line in console::format_notice(&notice) {
            println!("{line}");
        }
        if let Notice::Ephemeral { ttl, .. } = &notice {
            let ttl = *ttl;
            tokio::spawn(async move {
                tokio::time::sleep(ttl).await;
                if let Some(line) = console::format_expired(&notice) {
                    println!("{line}");
                }
            });
        }
    }
}
