use std::io;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio::sync::{mpsc, oneshot, Mutex};

use crate::api::Job;
use crate::parse::{parse_uci, UciOut};

/// One fragment of analysis output, ready to be shipped to the broker.
/// An `Err` aborts the streamed upload instead of ending the body cleanly.
pub type AnalysisChunk = Result<Vec<u8>, io::Error>;

/// Errors produced by the engine driver
#[derive(Error, Debug)]
pub enum EngineError {
    /// The subprocess closed its pipes or was terminated
    #[error("engine process died")]
    Died,

    /// The job carries no movetime, depth or nodes budget
    #[error("job has no movetime, depth or nodes limit")]
    MalformedJob,

    #[error("engine i/o failed: {0}")]
    Io(#[from] io::Error),
}

/// UciEngine is the contract the provider drives a chess engine through. It
/// can be implemented for any structure that speaks the UCI protocol.
#[async_trait]
pub trait UciEngine {
    /// Run the 'uci' handshake, collecting the advertised variants
    async fn uci(&mut self) -> Result<(), EngineError>;

    /// Block until the engine answers 'readyok'
    async fn isready(&mut self) -> Result<(), EngineError>;

    /// Set an option in the engine. No acknowledgment is read; interpose
    /// [`UciEngine::isready`] before depending on the change.
    async fn setoption(&mut self, name: &str, value: &str) -> Result<(), EngineError>;

    /// Run one analysis job, pushing score-bearing 'info' lines into
    /// `chunks`. `started` fires once the job's 'go' has been issued, or as
    /// soon as the preamble fails. Whatever the exit path, a 'stop' is sent
    /// and the engine is drained to its closing 'bestmove'.
    async fn analyse(
        &mut self,
        job: &Job,
        chunks: mpsc::Sender<AnalysisChunk>,
        started: oneshot::Sender<()>,
    ) -> Result<(), EngineError>;

    /// Cut the current search short. Idempotent and safe to call from
    /// another task while `analyse` is streaming.
    async fn stop(&self);

    /// Kill the subprocess. A pending read unblocks with EOF.
    fn terminate(&self);

    fn alive(&self) -> bool;

    /// Time since the last analysis finished
    fn idle_time(&self) -> Duration;
}

/// Shared control surface for a running engine, usable from the acquisition
/// loop while a worker owns the [`Engine`] itself. The stdin mutex
/// serializes the cross-task 'stop' against whatever the worker is writing;
/// 'stop' is the only write allowed from outside the worker.
#[derive(Clone)]
pub struct EngineHandle {
    stdin: Arc<Mutex<ChildStdin>>,
    child: Arc<StdMutex<Child>>,
    alive: Arc<AtomicBool>,
    last_used: Arc<StdMutex<Instant>>,
    pid: u32,
}

impl EngineHandle {
    /// Best-effort 'stop'; a no-op once the engine is gone
    pub async fn stop(&self) {
        if !self.alive() {
            return;
        }
        let mut stdin = self.stdin.lock().await;
        log::debug!("{} << stop", self.pid);
        let res = async {
            stdin.write_all(b"stop\n").await?;
            stdin.flush().await
        }
        .await;
        if let Err(err) = res {
            log::warn!("{}: stop not delivered: {}", self.pid, err);
            self.alive.store(false, Ordering::SeqCst);
        }
    }

    /// Kill the subprocess; pending reads unblock with EOF
    pub fn terminate(&self) {
        self.alive.store(false, Ordering::SeqCst);
        let mut child = self.child.lock().expect("couldn't acquire child lock");
        if let Err(err) = child.start_kill() {
            log::debug!("{}: kill: {}", self.pid, err);
        }
    }

    pub fn alive(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }

    pub fn idle_time(&self) -> Duration {
        self.last_used
            .lock()
            .expect("couldn't acquire last_used lock")
            .elapsed()
    }

    fn touch(&self) {
        *self
            .last_used
            .lock()
            .expect("couldn't acquire last_used lock") = Instant::now();
    }

    fn mark_dead(&self) {
        self.alive.store(false, Ordering::SeqCst);
    }
}

/// Engine drives any UCI subprocess through the handshake, option
/// management and scoped analysis runs.
pub struct Engine {
    handle: EngineHandle,
    stdout: BufReader<ChildStdout>,
    supported_variants: Vec<String>,
    session_id: Option<String>,
    threads: Option<u32>,
    hash: Option<u32>,
    multi_pv: Option<u32>,
    uci_variant: Option<String>,
}

impl Engine {
    /// Spawn `command` through the shell and run the UCI handshake,
    /// followed by the analysis options and any configured extras.
    pub async fn new(command: &str, extra_options: &[(String, String)]) -> Result<Self, EngineError> {
        log::info!("Starting engine: {}", command);
        let (child, stdin, stdout, pid) = spawn_process(command)?;
        let mut engine = Engine {
            handle: EngineHandle {
                stdin: Arc::new(Mutex::new(stdin)),
                child: Arc::new(StdMutex::new(child)),
                alive: Arc::new(AtomicBool::new(true)),
                last_used: Arc::new(StdMutex::new(Instant::now())),
                pid,
            },
            stdout: BufReader::new(stdout),
            supported_variants: Vec::new(),
            session_id: None,
            threads: None,
            hash: None,
            multi_pv: None,
            uci_variant: None,
        };
        engine.uci().await?;
        engine.setoption("UCI_AnalyseMode", "true").await?;
        engine.setoption("UCI_Chess960", "true").await?;
        for (name, value) in extra_options {
            engine.setoption(name, value).await?;
        }
        Ok(engine)
    }

    /// Control surface for stop/terminate from another task
    pub fn handle(&self) -> EngineHandle {
        self.handle.clone()
    }

    /// Variants advertised during the handshake
    pub fn supported_variants(&self) -> &[String] {
        &self.supported_variants
    }

    /// Write one command line to the engine
    async fn send(&self, command: &str) -> Result<(), EngineError> {
        let mut stdin = self.handle.stdin.lock().await;
        log::debug!("{} << {}", self.handle.pid, command);
        let res = async {
            stdin.write_all(command.as_bytes()).await?;
            stdin.write_all(b"\n").await?;
            stdin.flush().await
        }
        .await;
        if let Err(err) = res {
            self.handle.mark_dead();
            return Err(EngineError::Io(err));
        }
        Ok(())
    }

    /// Read one non-empty line from the engine. EOF means the process is
    /// gone.
    async fn recv(&mut self) -> Result<String, EngineError> {
        loop {
            let mut line = String::new();
            let n = match self.stdout.read_line(&mut line).await {
                Ok(n) => n,
                Err(err) => {
                    self.handle.mark_dead();
                    return Err(EngineError::Io(err));
                }
            };
            if n == 0 {
                self.handle.mark_dead();
                return Err(EngineError::Died);
            }
            let line = line.trim_end();
            if line.is_empty() {
                continue;
            }
            log::debug!("{} >> {}", self.handle.pid, line);
            return Ok(line.to_string());
        }
    }

    /// Bring the engine's mutable state in line with the job, then issue
    /// 'position' and 'go'.
    async fn prepare(&mut self, job: &Job) -> Result<(), EngineError> {
        let work = &job.work;

        if self.session_id.as_deref() != Some(work.session_id.as_str()) {
            self.session_id = Some(work.session_id.clone());
            self.send("ucinewgame").await?;
            self.isready().await?;
        }

        let mut changed = false;
        if self.threads != Some(work.threads) {
            self.setoption("Threads", &work.threads.to_string()).await?;
            self.threads = Some(work.threads);
            changed = true;
        }
        if self.hash != Some(work.hash) {
            self.setoption("Hash", &work.hash.to_string()).await?;
            self.hash = Some(work.hash);
            changed = true;
        }
        if self.multi_pv != Some(work.multi_pv) {
            self.setoption("MultiPV", &work.multi_pv.to_string()).await?;
            self.multi_pv = Some(work.multi_pv);
            changed = true;
        }
        if self.uci_variant.as_deref() != Some(work.variant.as_str()) {
            self.setoption("UCI_Variant", &work.variant).await?;
            self.uci_variant = Some(work.variant.clone());
            changed = true;
        }
        if changed {
            self.isready().await?;
        }

        self.send(&format!(
            "position fen {} moves {}",
            work.initial_fen,
            work.moves.join(" ")
        ))
        .await?;

        let go = if let Some(movetime) = work.movetime {
            format!("go movetime {movetime}")
        } else if let Some(depth) = work.depth {
            format!("go depth {depth}")
        } else if let Some(nodes) = work.nodes {
            format!("go nodes {nodes}")
        } else {
            return Err(EngineError::MalformedJob);
        };
        self.send(&go).await
    }

    /// Forward score-bearing 'info' lines until 'bestmove'. `Ok(true)`
    /// means the bestmove was consumed, `Ok(false)` that the consumer went
    /// away first.
    async fn stream(&mut self, chunks: &mpsc::Sender<AnalysisChunk>) -> Result<bool, EngineError> {
        loop {
            let line = self.recv().await?;
            match parse_uci(&line) {
                UciOut::BestMove => return Ok(true),
                UciOut::Info { has_score: true } => {
                    let mut bytes = line.into_bytes();
                    bytes.push(b'\n');
                    if chunks.send(Ok(bytes)).await.is_err() {
                        return Ok(false);
                    }
                }
                UciOut::Info { .. } => (),
                _ => log::warn!("{} >> unexpected during analysis: {}", self.handle.pid, line),
            }
        }
    }

    /// Consume engine output until the pending 'bestmove' arrives
    async fn drain(&mut self) -> Result<(), EngineError> {
        loop {
            if let UciOut::BestMove = parse_uci(&self.recv().await?) {
                return Ok(());
            }
        }
    }
}

/// Spawn the engine command through the shell and take its pipe handles
fn spawn_process(command: &str) -> Result<(Child, ChildStdin, ChildStdout, u32), EngineError> {
    let mut cmd = Command::new("sh");
    cmd.arg("-c").arg(command);
    cmd.stdin(Stdio::piped());
    cmd.stdout(Stdio::piped());
    cmd.kill_on_drop(true);
    let mut proc = cmd.spawn()?;
    let stdin = proc
        .stdin
        .take()
        .ok_or_else(|| io::Error::new(io::ErrorKind::BrokenPipe, "no stdin available"))?;
    let stdout = proc
        .stdout
        .take()
        .ok_or_else(|| io::Error::new(io::ErrorKind::BrokenPipe, "no stdout available"))?;
    let pid = proc.id().unwrap_or(0);
    Ok((proc, stdin, stdout, pid))
}

#[async_trait]
impl UciEngine for Engine {
    async fn uci(&mut self) -> Result<(), EngineError> {
        self.send("uci").await?;
        loop {
            let line = self.recv().await?;
            match parse_uci(&line) {
                UciOut::UciOk => return Ok(()),
                UciOut::Option { name, vars } if name == "UCI_Variant" => {
                    self.supported_variants = vars;
                }
                _ => (),
            }
        }
    }

    async fn isready(&mut self) -> Result<(), EngineError> {
        self.send("isready").await?;
        loop {
            if let UciOut::ReadyOk = parse_uci(&self.recv().await?) {
                return Ok(());
            }
        }
    }

    async fn setoption(&mut self, name: &str, value: &str) -> Result<(), EngineError> {
        self.send(&format!("setoption name {} value {}", name, value))
            .await
    }

    async fn analyse(
        &mut self,
        job: &Job,
        chunks: mpsc::Sender<AnalysisChunk>,
        started: oneshot::Sender<()>,
    ) -> Result<(), EngineError> {
        let mut go_sent = false;
        let mut bestmove_seen = false;

        let res = match self.prepare(job).await {
            Ok(()) => {
                go_sent = true;
                let _ = started.send(());
                match self.stream(&chunks).await {
                    Ok(done) => {
                        bestmove_seen = done;
                        Ok(())
                    }
                    Err(err) => Err(err),
                }
            }
            Err(err) => {
                // the loop is blocked on this signal, fire it even though
                // the analysis never began
                let _ = started.send(());
                Err(err)
            }
        };

        if let Err(err) = &res {
            // abort the streamed upload instead of ending the body cleanly
            let _ = chunks
                .send(Err(io::Error::new(
                    io::ErrorKind::BrokenPipe,
                    err.to_string(),
                )))
                .await;
        }

        // Scope finalization, on every exit path: best-effort stop, then
        // drain to the closing bestmove so the next go cycle starts clean.
        self.handle.stop().await;
        if go_sent && !bestmove_seen && self.alive() {
            if let Err(err) = self.drain().await {
                log::debug!("{}: drain after stop: {}", self.handle.pid, err);
            }
        }
        self.handle.touch();
        res
    }

    async fn stop(&self) {
        self.handle.stop().await;
    }

    fn terminate(&self) {
        self.handle.terminate();
    }

    fn alive(&self) -> bool {
        self.handle.alive()
    }

    fn idle_time(&self) -> Duration {
        self.handle.idle_time()
    }
}
