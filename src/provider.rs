use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use crate::api::{ApiClient, ApiError, Job};
use crate::engine::{Engine, EngineError, UciEngine};

const INITIAL_BACKOFF: f64 = 1.0;
const MAX_BACKOFF: f64 = 10.0;

/// Breather after a failed upload, a dead engine or a spawn failure
const FAILURE_COOLDOWN: Duration = Duration::from_secs(5);

/// Process-lifetime configuration, immutable after start
#[derive(Debug, Clone)]
pub struct ProviderConfig {
    pub engine_command: String,
    pub lichess_url: String,
    pub broker_url: String,
    pub token: String,
    pub provider_secret: Option<String>,
    pub engine_name: String,
    pub max_threads: u32,
    pub max_hash: u32,
    pub keep_alive: Duration,
    pub extra_options: Vec<(String, String)>,
}

/// Drive the provider forever: acquire work, preempt the previous job,
/// restart dead or idle-terminated engines, run jobs one at a time.
pub async fn run(config: ProviderConfig, api: ApiClient, secret: String, engine: Engine) {
    let mut control = Some(engine.handle());
    let mut idle = Some(engine);
    let mut busy: Option<JoinHandle<Engine>> = None;
    let mut backoff = INITIAL_BACKOFF;

    loop {
        let job = match api.acquire(&secret).await {
            Ok(Some(job)) => {
                backoff = INITIAL_BACKOFF;
                job
            }
            Ok(None) => {
                backoff = INITIAL_BACKOFF;
                // No work: reclaim a finished worker, then shut down an
                // engine that has sat idle for too long.
                if let Some(task) = busy.take() {
                    if task.is_finished() {
                        match task.await {
                            Ok(engine) => idle = Some(engine),
                            Err(err) => {
                                log::error!("Analysis task panicked: {err}");
                                control = None;
                            }
                        }
                    } else {
                        busy = Some(task);
                    }
                }
                if let Some(ctl) = &control {
                    if ctl.alive() && ctl.idle_time() > config.keep_alive {
                        log::info!("Terminating idle engine");
                        ctl.terminate();
                    }
                }
                continue;
            }
            Err(err) => {
                log::error!("Error while trying to acquire work: {err}");
                tokio::time::sleep(Duration::from_secs_f64(backoff)).await;
                backoff = (backoff * 1.5).min(MAX_BACKOFF);
                continue;
            }
        };

        // Preempt: ask the running analysis to wrap up, then wait for its
        // engine to come back with the closing bestmove consumed.
        if let Some(task) = busy.take() {
            if let Some(ctl) = &control {
                ctl.stop().await;
            }
            match task.await {
                Ok(engine) => idle = Some(engine),
                Err(err) => {
                    log::error!("Analysis task panicked: {err}");
                    idle = None;
                }
            }
        }

        let engine = match idle.take() {
            Some(engine) if engine.alive() => engine,
            _ => match Engine::new(&config.engine_command, &config.extra_options).await {
                Ok(engine) => engine,
                Err(err) => {
                    log::error!("Failed to start engine: {err}");
                    tokio::time::sleep(FAILURE_COOLDOWN).await;
                    continue;
                }
            },
        };
        control = Some(engine.handle());

        log::info!("Handling job {}", job.id);
        let (started_tx, started_rx) = oneshot::channel();
        busy = Some(tokio::spawn(handle_job(engine, job, started_tx, api.clone())));

        // Do not long-poll again before the engine has actually begun, or
        // the broker may hand out overlapping jobs.
        let _ = started_rx.await;
    }
}

/// Run a single job: the scoped analysis streams into the broker upload.
/// The engine is always handed back so the loop can reuse or rebuild it.
async fn handle_job(
    mut engine: Engine,
    job: Job,
    started: oneshot::Sender<()>,
    api: ApiClient,
) -> Engine {
    let (tx, rx) = mpsc::channel(1);
    let (upload_res, analysis_res) = tokio::join!(
        api.upload(&job.id, rx),
        engine.analyse(&job, tx, started),
    );

    let mut cooldown = false;
    if let Err(err) = analysis_res {
        match err {
            EngineError::MalformedJob => log::error!("Skipping job {}: {err}", job.id),
            err => {
                log::error!("Analysis of job {} failed: {err}", job.id);
                cooldown = true;
            }
        }
    }
    match upload_res {
        Ok(()) => (),
        Err(ApiError::PeerClosed(_)) => {
            log::info!("Connection closed while streaming analysis");
        }
        Err(err) => {
            log::error!("Error while uploading analysis of job {}: {err}", job.id);
            cooldown = true;
        }
    }
    if cooldown {
        tokio::time::sleep(FAILURE_COOLDOWN).await;
    }
    engine
}
