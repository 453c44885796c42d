//! Scripted doubles for the tests: a fake site/broker HTTP server with
//! programmable responses, and a handle to the scripted fake UCI engine in
//! res/test/fakefish.sh.

use std::collections::{HashMap, VecDeque};
use std::io;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};

/// One recorded request (streamed uploads are tracked in [`Upload`])
#[derive(Debug, Clone)]
pub struct Recorded {
    pub method: String,
    pub path: String,
    pub body: String,
    pub at: Instant,
}

/// A streamed upload, possibly still in progress
#[derive(Debug, Clone)]
pub struct Upload {
    pub job: String,
    pub chunks: Vec<Vec<u8>>,
    pub done: bool,
}

enum WorkScript {
    Job(String),
    Status(u16),
}

#[derive(Default)]
struct State {
    engines: Vec<(String, String)>,
    requests: Vec<Recorded>,
    work: VecDeque<WorkScript>,
    uploads: Vec<Upload>,
    close_after: HashMap<String, usize>,
}

/// Fake site + broker on one listener. Responses to the work endpoint are
/// scripted with [`FakeLichess::push_job`] / [`FakeLichess::push_status`];
/// an empty script answers 204 after a short delay.
pub struct FakeLichess {
    pub url: String,
    state: Arc<Mutex<State>>,
}

impl FakeLichess {
    pub async fn start() -> FakeLichess {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let url = format!("http://{}", listener.local_addr().expect("local addr"));
        let state = Arc::new(Mutex::new(State::default()));
        let accept_state = state.clone();
        tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                let state = accept_state.clone();
                tokio::spawn(async move {
                    let _ = handle(stream, state).await;
                });
            }
        });
        FakeLichess { url, state }
    }

    pub fn seed_engine(&self, id: &str, name: &str) {
        self.state
            .lock()
            .unwrap()
            .engines
            .push((id.to_string(), name.to_string()));
    }

    pub fn push_job(&self, job: serde_json::Value) {
        self.state
            .lock()
            .unwrap()
            .work
            .push_back(WorkScript::Job(job.to_string()));
    }

    pub fn push_status(&self, status: u16) {
        self.state
            .lock()
            .unwrap()
            .work
            .push_back(WorkScript::Status(status));
    }

    /// Drop the connection of `job`'s upload after `chunks` chunks
    pub fn close_upload_after(&self, job: &str, chunks: usize) {
        self.state
            .lock()
            .unwrap()
            .close_after
            .insert(job.to_string(), chunks);
    }

    pub fn requests(&self) -> Vec<Recorded> {
        self.state.lock().unwrap().requests.clone()
    }

    pub fn work_requests(&self) -> Vec<Recorded> {
        self.requests()
            .into_iter()
            .filter(|r| r.method == "POST" && r.path == "/api/external-engine/work")
            .collect()
    }

    pub fn uploads(&self) -> Vec<Upload> {
        self.state.lock().unwrap().uploads.clone()
    }
}

async fn handle(stream: TcpStream, state: Arc<Mutex<State>>) -> io::Result<()> {
    let (read, mut write) = stream.into_split();
    let mut reader = BufReader::new(read);

    let mut request_line = String::new();
    reader.read_line(&mut request_line).await?;
    let mut parts = request_line.split_whitespace();
    let method = parts.next().unwrap_or("").to_string();
    let path = parts.next().unwrap_or("").to_string();

    let mut content_length = 0usize;
    let mut chunked = false;
    loop {
        let mut line = String::new();
        reader.read_line(&mut line).await?;
        let line = line.trim_end();
        if line.is_empty() {
            break;
        }
        let lower = line.to_ascii_lowercase();
        if let Some(value) = lower.strip_prefix("content-length:") {
            content_length = value.trim().parse().unwrap_or(0);
        }
        if lower.starts_with("transfer-encoding:") && lower.contains("chunked") {
            chunked = true;
        }
    }

    if method == "POST" && path.starts_with("/api/external-engine/work/") {
        let job = path.rsplit('/').next().unwrap_or("").to_string();
        return handle_upload(&mut reader, &mut write, state, job, chunked, content_length).await;
    }

    if method == "POST" && path == "/api/external-engine/work" {
        let body = read_body(&mut reader, content_length).await?;
        record(&state, &method, &path, &body);
        let script = state.lock().unwrap().work.pop_front();
        return match script {
            Some(WorkScript::Job(json)) => respond(&mut write, 200, &json).await,
            Some(WorkScript::Status(status)) => respond(&mut write, status, "").await,
            None => {
                tokio::time::sleep(Duration::from_millis(25)).await;
                respond(&mut write, 204, "").await
            }
        };
    }

    if path.starts_with("/api/external-engine") {
        let body = read_body(&mut reader, content_length).await?;
        record(&state, &method, &path, &body);
        if method == "GET" {
            let engines: Vec<serde_json::Value> = state
                .lock()
                .unwrap()
                .engines
                .iter()
                .map(|(id, name)| serde_json::json!({ "id": id, "name": name }))
                .collect();
            let listing = serde_json::Value::Array(engines).to_string();
            return respond(&mut write, 200, &listing).await;
        }
        return respond(&mut write, 200, "{}").await;
    }

    respond(&mut write, 404, "").await
}

async fn handle_upload(
    reader: &mut BufReader<OwnedReadHalf>,
    write: &mut OwnedWriteHalf,
    state: Arc<Mutex<State>>,
    job: String,
    chunked: bool,
    content_length: usize,
) -> io::Result<()> {
    let close_after = state.lock().unwrap().close_after.get(&job).copied();
    let ix = {
        let mut st = state.lock().unwrap();
        st.uploads.push(Upload {
            job,
            chunks: Vec::new(),
            done: false,
        });
        st.uploads.len() - 1
    };

    if chunked {
        let mut seen = 0usize;
        while let Some(chunk) = read_chunk(reader).await? {
            state.lock().unwrap().uploads[ix].chunks.push(chunk);
            seen += 1;
            if close_after == Some(seen) {
                // hang up mid-stream, like a user navigating away
                return Ok(());
            }
        }
    } else if content_length > 0 {
        let mut buf = vec![0u8; content_length];
        reader.read_exact(&mut buf).await?;
        state.lock().unwrap().uploads[ix].chunks.push(buf);
    }

    state.lock().unwrap().uploads[ix].done = true;
    respond(write, 200, "").await
}

/// One chunk of a chunked transfer body, `None` on the final zero chunk
async fn read_chunk(reader: &mut BufReader<OwnedReadHalf>) -> io::Result<Option<Vec<u8>>> {
    let mut size_line = String::new();
    reader.read_line(&mut size_line).await?;
    let size = usize::from_str_radix(size_line.trim(), 16)
        .map_err(|err| io::Error::new(io::ErrorKind::InvalidData, err))?;
    if size == 0 {
        let mut trailer = String::new();
        reader.read_line(&mut trailer).await?;
        return Ok(None);
    }
    let mut chunk = vec![0u8; size];
    reader.read_exact(&mut chunk).await?;
    let mut crlf = [0u8; 2];
    reader.read_exact(&mut crlf).await?;
    Ok(Some(chunk))
}

async fn read_body(reader: &mut BufReader<OwnedReadHalf>, content_length: usize) -> io::Result<String> {
    let mut buf = vec![0u8; content_length];
    reader.read_exact(&mut buf).await?;
    Ok(String::from_utf8_lossy(&buf).to_string())
}

fn record(state: &Arc<Mutex<State>>, method: &str, path: &str, body: &str) {
    state.lock().unwrap().requests.push(Recorded {
        method: method.to_string(),
        path: path.to_string(),
        body: body.to_string(),
        at: Instant::now(),
    });
}

async fn respond(write: &mut OwnedWriteHalf, status: u16, body: &str) -> io::Result<()> {
    let reason = match status {
        200 => "OK",
        204 => "No Content",
        404 => "Not Found",
        _ => "Error",
    };
    let response = if status == 204 {
        format!("HTTP/1.1 {status} {reason}\r\nconnection: close\r\n\r\n")
    } else {
        format!(
            "HTTP/1.1 {status} {reason}\r\n\
             content-type: application/json\r\n\
             content-length: {}\r\n\
             connection: close\r\n\r\n{body}",
            body.len()
        )
    };
    write.write_all(response.as_bytes()).await?;
    write.flush().await
}

/// Handle to one scripted fake engine instance: a scratch directory with the
/// scenario files fakefish.sh plays back, and the log of every command the
/// driver sent. See res/test/fakefish.sh for the file format.
pub struct Fakefish {
    dir: tempfile::TempDir,
}

impl Fakefish {
    pub fn new() -> Fakefish {
        let dir = tempfile::tempdir().expect("tempdir");
        std::fs::write(dir.path().join("log"), "").expect("create log");
        Fakefish { dir }
    }

    /// Lines printed between 'uci' and 'uciok'
    pub fn options(&self, lines: &str) {
        std::fs::write(self.dir.path().join("options"), format!("{lines}\n"))
            .expect("write options");
    }

    /// Script for the nth 'go' (counted across engine restarts)
    pub fn go(&self, n: usize, script: &str) {
        std::fs::write(
            self.dir.path().join(format!("go{n}")),
            format!("{script}\n"),
        )
        .expect("write go script");
    }

    /// Shell command that launches this scripted engine
    pub fn command(&self) -> String {
        format!(
            "/bin/sh {} {} {}",
            concat!(env!("CARGO_MANIFEST_DIR"), "/res/test/fakefish.sh"),
            self.log_path().display(),
            self.dir.path().display(),
        )
    }

    pub fn log_path(&self) -> PathBuf {
        self.dir.path().join("log")
    }

    /// Every line the engine received so far, across all instances
    pub fn log_lines(&self) -> Vec<String> {
        std::fs::read_to_string(self.log_path())
            .unwrap_or_default()
            .lines()
            .map(str::to_string)
            .collect()
    }
}

/// Poll `cond` every 10ms until it holds, panicking after `timeout`
pub async fn wait_for(what: &str, timeout: Duration, mut cond: impl FnMut() -> bool) {
    let deadline = Instant::now() + timeout;
    while !cond() {
        if Instant::now() > deadline {
            panic!("timed out waiting for {what}");
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
