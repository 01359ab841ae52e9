//! Service assembly and the command loop.
//!
//! `Service::build` constructs every component (startup failures abort the
//! process); `Service::run` serves commands until shutdown, then stops the
//! watcher and waits for in-flight pipelines up to the grace period.

use anyhow::{Context, Result};
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinSet;
use tracing::{error, info, warn};

use crate::api::{ApiServer, AppCommand, ServiceInfo};
use crate::config::Config;
use crate::detector::PanelDetector;
use crate::drive::client::{DriveApiClient, DriveFolder};
use crate::drive::processed::ProcessedSet;
use crate::drive::{DriveWatcher, RecordingSink};
use crate::generator::claude::ClaudeApiClient;
use crate::generator::MinutesGenerator;
use crate::pipeline::Orchestrator;
use crate::publisher::chat::{ChatPort, DiscordRestClient};
use crate::transcription::whisper::WhisperEngine;
use crate::transcription::Transcriber;

pub struct Service {
    cfg: Arc<Config>,
    orchestrator: Arc<Orchestrator>,
    watcher: Option<Arc<DriveWatcher>>,
    detector: PanelDetector,
    api: ApiServer,
    rx: mpsc::Receiver<AppCommand>,
    shutdown_tx: watch::Sender<bool>,
}

impl Service {
    /// Build every component. Any failure here is a startup failure.
    pub fn build(config: Config) -> Result<Self> {
        let cfg = Arc::new(config);

        let http = reqwest::Client::builder()
            .user_agent(concat!("minutier/", env!("CARGO_PKG_VERSION")))
            .build()
            .context("Failed to build HTTP client")?;

        let engine =
            Arc::new(WhisperEngine::load(&cfg.recognizer).context("Recognizer startup failed")?);
        let transcriber = Arc::new(Transcriber::new(engine));

        let llm = Arc::new(ClaudeApiClient::new(http.clone(), &cfg.generator));
        let generator = Arc::new(
            MinutesGenerator::load(&cfg.generator, llm).context("Generator startup failed")?,
        );

        let chat: Arc<dyn ChatPort> = Arc::new(DiscordRestClient::new(
            http.clone(),
            cfg.chat.bot_token.clone(),
        ));

        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let drive_client: Option<Arc<dyn DriveFolder>> = if cfg.drive.enabled {
            let client = DriveApiClient::from_credentials(http.clone(), &cfg.drive)
                .context("Drive watcher startup failed")?;
            Some(Arc::new(client))
        } else {
            None
        };

        let orchestrator = Arc::new(Orchestrator::new(
            Arc::clone(&cfg),
            http,
            transcriber.clone(),
            generator.clone(),
            chat,
            drive_client.clone(),
            shutdown_rx.clone(),
        ));

        let watcher = match drive_client {
            Some(client) => {
                let processed = ProcessedSet::load(Path::new(&cfg.drive.processed_db_path))
                    .context("Processed-set load failed")?;
                Some(Arc::new(DriveWatcher::new(
                    cfg.drive.clone(),
                    client,
                    Arc::clone(&orchestrator) as Arc<dyn RecordingSink>,
                    processed,
                    shutdown_rx,
                )))
            }
            None => None,
        };

        let (tx, rx) = mpsc::channel::<AppCommand>(32);

        let service_info = Arc::new(ServiceInfo {
            started_at: Instant::now(),
            engine: transcriber.describe(),
            generator_model: generator.model().to_string(),
            watch_channel_id: cfg.chat.watch_channel_id,
            output_channel_id: cfg.chat.output_channel_id,
            drive_enabled: cfg.drive.enabled,
            active_pipelines: {
                let orchestrator = Arc::clone(&orchestrator);
                Box::new(move || orchestrator.active_count())
            },
        });

        let api = ApiServer::new(
            cfg.api.bind_port,
            tx,
            service_info,
            cfg.source.domain_allowlist.clone(),
        );

        let detector = PanelDetector::new(
            cfg.source.bot_id,
            cfg.chat.watch_channel_id,
            cfg.source.domain_allowlist.clone(),
        );

        Ok(Self {
            cfg,
            orchestrator,
            watcher,
            detector,
            api,
            rx,
            shutdown_tx,
        })
    }

    /// Serve commands until ctrl-c, then shut down cooperatively.
    pub async fn run(self) -> Result<()> {
        let Service {
            cfg,
            orchestrator,
            watcher,
            detector,
            api,
            mut rx,
            shutdown_tx,
        } = self;

        if let Some(watcher) = &watcher {
            let watcher = Arc::clone(watcher);
            tokio::spawn(async move { watcher.run().await });
            info!("Drive watcher started");
        }

        tokio::spawn(async move {
            if let Err(err) = api.start().await {
                error!("API server failed: {err:#}");
            }
        });

        info!(
            "Minutier is ready (watch_channel={}, output_channel={})",
            cfg.chat.watch_channel_id, cfg.chat.output_channel_id
        );

        let mut pipelines: JoinSet<()> = JoinSet::new();

        loop {
            tokio::select! {
                signal = tokio::signal::ctrl_c() => {
                    if let Err(err) = signal {
                        error!("Signal handler failed: {err}");
                    }
                    info!("Shutdown requested");
                    break;
                }
                command = rx.recv() => {
                    let Some(command) = command else { break };
                    handle_command(&detector, &orchestrator, &watcher, command, &mut pipelines);
                    // Reap finished pipeline tasks without blocking.
                    while pipelines.try_join_next().is_some() {}
                }
            }
        }

        // Refuse new starts and stop the watcher between ticks.
        let _ = shutdown_tx.send(true);

        if !pipelines.is_empty() {
            let grace = Duration::from_secs(cfg.pipeline.shutdown_grace_sec);
            info!(
                "Waiting up to {}s for {} running pipeline(s)",
                grace.as_secs(),
                pipelines.len()
            );
            let drained = tokio::time::timeout(grace, async {
                while pipelines.join_next().await.is_some() {}
            })
            .await;
            if drained.is_err() {
                warn!("Grace period expired with pipelines still running");
            }
        }

        info!("Minutier stopped");
        Ok(())
    }
}

fn handle_command(
    detector: &PanelDetector,
    orchestrator: &Arc<Orchestrator>,
    watcher: &Option<Arc<DriveWatcher>>,
    command: AppCommand,
    pipelines: &mut JoinSet<()>,
) {
    match command {
        AppCommand::MessageEdit(event) => {
            if let Some(handle) = detector.detect(&event) {
                info!(
                    "Recording ended detected: recording_id={} (channel={})",
                    handle.recording_id, handle.origin_channel_id
                );
                let orchestrator = Arc::clone(orchestrator);
                pipelines.spawn(async move { orchestrator.run(handle).await });
            }
        }
        AppCommand::Process(handle) => {
            info!(
                "Manual trigger for recording {} accepted",
                handle.recording_id
            );
            let orchestrator = Arc::clone(orchestrator);
            pipelines.spawn(async move { orchestrator.run(handle).await });
        }
        AppCommand::DrivePoll => match watcher {
            Some(watcher) => {
                let watcher = Arc::clone(watcher);
                tokio::spawn(async move {
                    if let Err(err) = watcher.poll_once().await {
                        error!("Manual drive poll failed: {err}");
                    }
                });
            }
            None => warn!("Manual drive poll requested but the watcher is disabled"),
        },
    }
}
