// Test doubles shared by the executor's unit tests.

use anyhow::anyhow;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::io::Cursor;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncReadExt;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use url::Url;

use crate::cache::{CachedDownloader, ChecksumInfo, Uploader};
use crate::container::{
    BackendContainerSpec, ByteStream, Container, ContainerBackend, ContainerInfo, Process,
    ProcessIo, ProcessSpec, Signal, StreamSpec,
};
use crate::container_store::ContainerRegistry;
use crate::steps::{Step, StepError};

pub type Journal = Arc<Mutex<Vec<String>>>;

/// Shared, ordered record of `start:<name>` / `finish:<name>` events.
pub fn journal() -> Journal {
    Arc::new(Mutex::new(Vec::new()))
}

// ---------------------------------------------------------------------------
// FakeStep
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
enum Outcome {
    Succeed,
    Fail(String),
    Emittable(String),
    Block,
}

/// A step with a scripted outcome that counts how it was driven.
pub struct FakeStep {
    name: String,
    outcome: Outcome,
    delay: Duration,
    journal: Option<Journal>,
    cancel: CancellationToken,
    performs: AtomicUsize,
    cancels: AtomicUsize,
    finishes: AtomicUsize,
}

impl FakeStep {
    fn with_outcome(name: &str, outcome: Outcome) -> Self {
        Self {
            name: name.to_string(),
            outcome,
            delay: Duration::ZERO,
            journal: None,
            cancel: CancellationToken::new(),
            performs: AtomicUsize::new(0),
            cancels: AtomicUsize::new(0),
            finishes: AtomicUsize::new(0),
        }
    }

    pub fn succeeding(name: &str) -> Self {
        Self::with_outcome(name, Outcome::Succeed)
    }

    pub fn failing(name: &str, message: &str) -> Self {
        Self::with_outcome(name, Outcome::Fail(message.to_string()))
    }

    pub fn emittable(name: &str, message: &str) -> Self {
        Self::with_outcome(name, Outcome::Emittable(message.to_string()))
    }

    /// Runs until cancelled.
    pub fn blocking(name: &str) -> Self {
        Self::with_outcome(name, Outcome::Block)
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn with_journal(mut self, journal: &Journal) -> Self {
        self.journal = Some(Arc::clone(journal));
        self
    }

    pub fn performs(&self) -> usize {
        self.performs.load(Ordering::SeqCst)
    }

    pub fn cancels(&self) -> usize {
        self.cancels.load(Ordering::SeqCst)
    }

    /// Performs that reached their scripted outcome without being cancelled.
    pub fn finishes(&self) -> usize {
        self.finishes.load(Ordering::SeqCst)
    }

    fn record(&self, event: &str) {
        if let Some(journal) = &self.journal {
            journal.lock().push(format!("{event}:{}", self.name));
        }
    }
}

#[async_trait]
impl Step for FakeStep {
    async fn perform(&self) -> Result<(), StepError> {
        self.performs.fetch_add(1, Ordering::SeqCst);
        self.record("start");
        if self.cancel.is_cancelled() {
            return Err(StepError::Cancelled);
        }

        if !self.delay.is_zero() {
            tokio::select! {
                _ = tokio::time::sleep(self.delay) => {}
                _ = self.cancel.cancelled() => return Err(StepError::Cancelled),
            }
        }

        let result = match &self.outcome {
            Outcome::Succeed => Ok(()),
            Outcome::Fail(message) => Err(StepError::Other(anyhow!("{message}"))),
            Outcome::Emittable(message) => Err(StepError::emittable(message.clone())),
            Outcome::Block => {
                self.cancel.cancelled().await;
                return Err(StepError::Cancelled);
            }
        };

        self.finishes.fetch_add(1, Ordering::SeqCst);
        self.record("finish");
        result
    }

    fn cancel(&self) {
        self.cancels.fetch_add(1, Ordering::SeqCst);
        self.cancel.cancel();
    }
}

// ---------------------------------------------------------------------------
// FakeContainer
// ---------------------------------------------------------------------------

/// How processes started in a [`FakeContainer`] exit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessExit {
    /// Exit immediately with this status.
    Status(i32),
    /// Exit once this signal arrives. `Terminate` also exits on `Kill`.
    OnSignal(Signal),
    /// Ignore every signal.
    Never,
}

impl Default for ProcessExit {
    fn default() -> Self {
        ProcessExit::Status(0)
    }
}

#[derive(Default)]
struct FakeContainerState {
    exit: ProcessExit,
    exit_by_path: HashMap<String, ProcessExit>,
    events: Vec<String>,
    output: Vec<String>,
    output_by_path: HashMap<String, Vec<String>>,
    run_error: Option<String>,
    stream_in_error: Option<String>,
    stream_out_data: Vec<u8>,
    stream_out_error: Option<String>,
    hang_stream_out: bool,
    runs: Vec<ProcessSpec>,
    streamed_in: Vec<(StreamSpec, Vec<u8>)>,
    streamed_out: Vec<StreamSpec>,
}

pub struct FakeContainer {
    handle: String,
    state: Mutex<FakeContainerState>,
    signals: Arc<Mutex<Vec<Signal>>>,
}

impl FakeContainer {
    pub fn new(handle: &str) -> Self {
        Self {
            handle: handle.to_string(),
            state: Mutex::new(FakeContainerState::default()),
            signals: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn set_exit(&self, exit: ProcessExit) {
        self.state.lock().exit = exit;
    }

    pub fn set_exit_for(&self, path: &str, exit: ProcessExit) {
        self.state.lock().exit_by_path.insert(path.to_string(), exit);
    }

    pub fn set_events(&self, events: Vec<String>) {
        self.state.lock().events = events;
    }

    /// Lines every process writes to stdout when it starts.
    pub fn set_output(&self, lines: Vec<String>) {
        self.state.lock().output = lines;
    }

    pub fn set_output_for(&self, path: &str, lines: Vec<String>) {
        self.state.lock().output_by_path.insert(path.to_string(), lines);
    }

    pub fn fail_run(&self, message: &str) {
        self.state.lock().run_error = Some(message.to_string());
    }

    pub fn fail_stream_in(&self, message: &str) {
        self.state.lock().stream_in_error = Some(message.to_string());
    }

    pub fn set_stream_out_data(&self, data: Vec<u8>) {
        self.state.lock().stream_out_data = data;
    }

    pub fn fail_stream_out(&self, message: &str) {
        self.state.lock().stream_out_error = Some(message.to_string());
    }

    /// Make `stream_out` never return.
    pub fn hang_stream_out(&self) {
        self.state.lock().hang_stream_out = true;
    }

    pub fn runs(&self) -> Vec<ProcessSpec> {
        self.state.lock().runs.clone()
    }

    pub fn signals(&self) -> Vec<Signal> {
        self.signals.lock().clone()
    }

    pub fn streamed_in(&self) -> Vec<(StreamSpec, Vec<u8>)> {
        self.state.lock().streamed_in.clone()
    }

    pub fn streamed_out(&self) -> Vec<StreamSpec> {
        self.state.lock().streamed_out.clone()
    }
}

struct FakeProcess {
    id: String,
    exit: ProcessExit,
    signal_tx: watch::Sender<Option<Signal>>,
    signals: Arc<Mutex<Vec<Signal>>>,
}

#[async_trait]
impl Process for FakeProcess {
    fn id(&self) -> &str {
        &self.id
    }

    async fn wait(&self) -> anyhow::Result<i32> {
        let trigger = match self.exit {
            ProcessExit::Status(status) => return Ok(status),
            ProcessExit::Never => std::future::pending().await,
            ProcessExit::OnSignal(trigger) => trigger,
        };

        let mut rx = self.signal_tx.subscribe();
        let status = {
            let received = rx
                .wait_for(|signal| match (trigger, signal) {
                    (_, None) => false,
                    (Signal::Terminate, Some(_)) => true,
                    (Signal::Kill, Some(signal)) => *signal == Signal::Kill,
                })
                .await
                .map_err(|_| anyhow!("process {} went away", self.id))?;
            match *received {
                Some(Signal::Kill) => 137,
                _ => 143,
            }
        };
        Ok(status)
    }

    async fn signal(&self, signal: Signal) -> anyhow::Result<()> {
        self.signals.lock().push(signal);
        self.signal_tx.send_replace(Some(signal));
        Ok(())
    }
}

#[async_trait]
impl Container for FakeContainer {
    fn handle(&self) -> &str {
        &self.handle
    }

    async fn run(&self, spec: ProcessSpec, io: ProcessIo) -> anyhow::Result<Box<dyn Process>> {
        let (exit, output) = {
            let mut state = self.state.lock();
            state.runs.push(spec.clone());
            if let Some(message) = &state.run_error {
                return Err(anyhow!("{message}"));
            }
            let exit = state.exit_by_path.get(&spec.path).copied().unwrap_or(state.exit);
            let output = state
                .output_by_path
                .get(&spec.path)
                .cloned()
                .unwrap_or_else(|| state.output.clone());
            (exit, output)
        };

        if let ProcessIo::Stream(streamer) = &io {
            for line in &output {
                streamer.stdout(line);
            }
        }

        let id = format!("{}-process-{}", self.handle, self.state.lock().runs.len());
        let (signal_tx, _) = watch::channel(None);
        Ok(Box::new(FakeProcess {
            id,
            exit,
            signal_tx,
            signals: Arc::clone(&self.signals),
        }))
    }

    async fn stream_in(&self, spec: StreamSpec, mut stream: ByteStream) -> anyhow::Result<()> {
        if let Some(message) = self.state.lock().stream_in_error.clone() {
            return Err(anyhow!("{message}"));
        }
        let mut data = Vec::new();
        stream.read_to_end(&mut data).await?;
        self.state.lock().streamed_in.push((spec, data));
        Ok(())
    }

    async fn stream_out(&self, spec: StreamSpec) -> anyhow::Result<ByteStream> {
        {
            let mut state = self.state.lock();
            state.streamed_out.push(spec);
            if let Some(message) = &state.stream_out_error {
                return Err(anyhow!("{message}"));
            }
            if !state.hang_stream_out {
                return Ok(Box::new(Cursor::new(state.stream_out_data.clone())));
            }
        }
        std::future::pending().await
    }

    async fn info(&self) -> anyhow::Result<ContainerInfo> {
        Ok(ContainerInfo {
            events: self.state.lock().events.clone(),
        })
    }
}

// ---------------------------------------------------------------------------
// FakeBackend
// ---------------------------------------------------------------------------

#[derive(Default)]
struct FakeBackendState {
    containers: HashMap<String, (HashMap<String, String>, Option<Arc<FakeContainer>>)>,
    created: Vec<BackendContainerSpec>,
    destroyed: Vec<String>,
    default_exit: ProcessExit,
    create_error: Option<String>,
    destroy_errors: HashSet<String>,
    list_error: Option<String>,
    list_calls: usize,
}

#[derive(Default)]
pub struct FakeBackend {
    state: Mutex<FakeBackendState>,
}

impl FakeBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed a container the executor did not create through this backend.
    pub fn add_container(&self, handle: &str, properties: HashMap<String, String>) {
        self.state
            .lock()
            .containers
            .insert(handle.to_string(), (properties, None));
    }

    /// Make a container disappear without going through `destroy`.
    pub fn remove_container(&self, handle: &str) {
        self.state.lock().containers.remove(handle);
    }

    /// Exit behavior for processes of containers created from now on.
    pub fn set_default_exit(&self, exit: ProcessExit) {
        self.state.lock().default_exit = exit;
    }

    pub fn fail_create(&self, message: &str) {
        self.state.lock().create_error = Some(message.to_string());
    }

    pub fn fail_destroy(&self, handle: &str) {
        self.state.lock().destroy_errors.insert(handle.to_string());
    }

    pub fn allow_destroy(&self, handle: &str) {
        self.state.lock().destroy_errors.remove(handle);
    }

    pub fn fail_list(&self, message: &str) {
        self.state.lock().list_error = Some(message.to_string());
    }

    pub fn created(&self) -> Vec<BackendContainerSpec> {
        self.state.lock().created.clone()
    }

    pub fn destroyed(&self) -> Vec<String> {
        self.state.lock().destroyed.clone()
    }

    pub fn list_calls(&self) -> usize {
        self.state.lock().list_calls
    }

    pub fn container(&self, handle: &str) -> Option<Arc<FakeContainer>> {
        self.state
            .lock()
            .containers
            .get(handle)
            .and_then(|(_, container)| container.clone())
    }
}

#[async_trait]
impl ContainerBackend for FakeBackend {
    async fn create(&self, spec: BackendContainerSpec) -> anyhow::Result<Arc<dyn Container>> {
        let mut state = self.state.lock();
        if let Some(message) = &state.create_error {
            return Err(anyhow!("{message}"));
        }
        let container = Arc::new(FakeContainer::new(&spec.handle));
        container.set_exit(state.default_exit);
        state.containers.insert(
            spec.handle.clone(),
            (spec.properties.clone(), Some(Arc::clone(&container))),
        );
        state.created.push(spec);
        Ok(container)
    }

    async fn list(&self, properties: &HashMap<String, String>) -> anyhow::Result<Vec<String>> {
        let mut state = self.state.lock();
        state.list_calls += 1;
        if let Some(message) = &state.list_error {
            return Err(anyhow!("{message}"));
        }
        let mut handles: Vec<String> = state
            .containers
            .iter()
            .filter(|(_, (tags, _))| properties.iter().all(|(k, v)| tags.get(k) == Some(v)))
            .map(|(handle, _)| handle.clone())
            .collect();
        handles.sort();
        Ok(handles)
    }

    async fn destroy(&self, handle: &str) -> anyhow::Result<()> {
        let mut state = self.state.lock();
        if state.destroy_errors.contains(handle) {
            return Err(anyhow!("failed to destroy {handle}"));
        }
        state.containers.remove(handle);
        state.destroyed.push(handle.to_string());
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// FakeRegistry
// ---------------------------------------------------------------------------

/// Registry whose tracked containers all count as created.
pub struct FakeRegistry {
    known: HashSet<String>,
    completed: Mutex<Vec<String>>,
}

impl FakeRegistry {
    pub fn new(handles: &[&str]) -> Self {
        Self {
            known: handles.iter().map(|h| h.to_string()).collect(),
            completed: Mutex::new(Vec::new()),
        }
    }

    pub fn completed(&self) -> Vec<String> {
        self.completed.lock().clone()
    }
}

impl ContainerRegistry for FakeRegistry {
    fn contains(&self, handle: &str) -> bool {
        self.known.contains(handle)
    }

    fn complete_missing(&self, observed: &HashSet<String>) -> Vec<String> {
        let mut completed = self.completed.lock();
        let mut missing: Vec<String> = self
            .known
            .iter()
            .filter(|h| !observed.contains(*h) && !completed.contains(*h))
            .cloned()
            .collect();
        missing.sort();
        completed.extend(missing.iter().cloned());
        missing
    }
}

// ---------------------------------------------------------------------------
// FakeCache
// ---------------------------------------------------------------------------

/// Scripted result of a cache fetch, keyed by URL.
#[derive(Debug, Clone)]
pub enum FetchBehavior {
    Succeed {
        size: u64,
        data: Vec<u8>,
        delay: Duration,
        /// Finish the delay even after cancellation.
        ignore_cancel: bool,
    },
    Fail {
        message: String,
        delay: Duration,
    },
    /// Wait until cancelled, then fail.
    Hang,
}

impl Default for FetchBehavior {
    fn default() -> Self {
        FetchBehavior::succeed(0)
    }
}

impl FetchBehavior {
    pub fn succeed(size: u64) -> Self {
        FetchBehavior::Succeed {
            size,
            data: Vec::new(),
            delay: Duration::ZERO,
            ignore_cancel: false,
        }
    }

    pub fn fail(message: &str) -> Self {
        FetchBehavior::Fail {
            message: message.to_string(),
            delay: Duration::ZERO,
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        match &mut self {
            FetchBehavior::Succeed { delay: d, .. } | FetchBehavior::Fail { delay: d, .. } => {
                *d = delay
            }
            FetchBehavior::Hang => {}
        }
        self
    }

    pub fn ignoring_cancel(mut self) -> Self {
        if let FetchBehavior::Succeed { ignore_cancel, .. } = &mut self {
            *ignore_cancel = true;
        }
        self
    }

    pub fn with_data(mut self, bytes: &[u8]) -> Self {
        if let FetchBehavior::Succeed { data, .. } = &mut self {
            *data = bytes.to_vec();
        }
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchRecord {
    pub url: String,
    pub cache_key: String,
    pub checksum: ChecksumInfo,
}

#[derive(Default)]
struct FakeCacheState {
    behaviors: HashMap<String, FetchBehavior>,
    fetches: Vec<FetchRecord>,
    close_errors: HashSet<String>,
    closed: Vec<(String, PathBuf)>,
    fail_save_state: bool,
    save_state_calls: usize,
}

#[derive(Default)]
pub struct FakeCache {
    state: Mutex<FakeCacheState>,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

struct InFlight<'a>(&'a AtomicUsize);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

impl FakeCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_behavior(&self, url: &str, behavior: FetchBehavior) {
        self.state.lock().behaviors.insert(url.to_string(), behavior);
    }

    pub fn fetches(&self) -> Vec<FetchRecord> {
        self.state.lock().fetches.clone()
    }

    /// Highest number of fetches observed running at once.
    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    pub fn fail_close(&self, cache_key: &str) {
        self.state.lock().close_errors.insert(cache_key.to_string());
    }

    pub fn closed(&self) -> Vec<(String, PathBuf)> {
        self.state.lock().closed.clone()
    }

    pub fn fail_save_state(&self) {
        self.state.lock().fail_save_state = true;
    }

    pub fn save_state_calls(&self) -> usize {
        self.state.lock().save_state_calls
    }

    async fn resolve(
        &self,
        url: &Url,
        cache_key: &str,
        checksum: &ChecksumInfo,
        cancel: &CancellationToken,
    ) -> anyhow::Result<(Vec<u8>, u64)> {
        let behavior = {
            let mut state = self.state.lock();
            state.fetches.push(FetchRecord {
                url: url.to_string(),
                cache_key: cache_key.to_string(),
                checksum: checksum.clone(),
            });
            state.behaviors.get(url.as_str()).cloned().unwrap_or_default()
        };

        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);
        let _in_flight = InFlight(&self.in_flight);

        let (delay, ignore_cancel) = match &behavior {
            FetchBehavior::Succeed {
                delay, ignore_cancel, ..
            } => (*delay, *ignore_cancel),
            FetchBehavior::Fail { delay, .. } => (*delay, false),
            FetchBehavior::Hang => {
                cancel.cancelled().await;
                return Err(anyhow!("fetch of {url} cancelled"));
            }
        };
        if ignore_cancel {
            tokio::time::sleep(delay).await;
        } else if !delay.is_zero() {
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = cancel.cancelled() => return Err(anyhow!("fetch of {url} cancelled")),
            }
        }

        match behavior {
            FetchBehavior::Succeed { size, data, .. } => Ok((data, size)),
            FetchBehavior::Fail { message, .. } => Err(anyhow!("{message}")),
            FetchBehavior::Hang => Err(anyhow!("fetch of {url} cancelled")),
        }
    }
}

#[async_trait]
impl CachedDownloader for FakeCache {
    async fn fetch(
        &self,
        url: &Url,
        cache_key: &str,
        checksum: &ChecksumInfo,
        cancel: &CancellationToken,
    ) -> anyhow::Result<(ByteStream, u64)> {
        let (data, size) = self.resolve(url, cache_key, checksum, cancel).await?;
        Ok((Box::new(Cursor::new(data)), size))
    }

    async fn fetch_as_directory(
        &self,
        url: &Url,
        cache_key: &str,
        checksum: &ChecksumInfo,
        cancel: &CancellationToken,
    ) -> anyhow::Result<(PathBuf, u64)> {
        let (_, size) = self.resolve(url, cache_key, checksum, cancel).await?;
        Ok((PathBuf::from(format!("/cache/{cache_key}")), size))
    }

    async fn close_directory(&self, cache_key: &str, dir: &Path) -> anyhow::Result<()> {
        let mut state = self.state.lock();
        if state.close_errors.contains(cache_key) {
            return Err(anyhow!("{cache_key} is still in use"));
        }
        state.closed.push((cache_key.to_string(), dir.to_path_buf()));
        Ok(())
    }

    async fn save_state(&self) -> anyhow::Result<()> {
        let mut state = self.state.lock();
        state.save_state_calls += 1;
        if state.fail_save_state {
            return Err(anyhow!("disk full"));
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// FakeUploader
// ---------------------------------------------------------------------------

#[derive(Default)]
struct FakeUploaderState {
    reported_size: Option<u64>,
    error: Option<String>,
    hang: bool,
    uploads: Vec<(String, Vec<u8>)>,
}

#[derive(Default)]
pub struct FakeUploader {
    state: Mutex<FakeUploaderState>,
}

impl FakeUploader {
    pub fn new() -> Self {
        Self::default()
    }

    /// Size reported back instead of the number of bytes read.
    pub fn set_reported_size(&self, size: u64) {
        self.state.lock().reported_size = Some(size);
    }

    pub fn fail(&self, message: &str) {
        self.state.lock().error = Some(message.to_string());
    }

    pub fn hang_until_cancelled(&self) {
        self.state.lock().hang = true;
    }

    pub fn uploads(&self) -> Vec<(String, Vec<u8>)> {
        self.state.lock().uploads.clone()
    }
}

#[async_trait]
impl Uploader for FakeUploader {
    async fn upload(
        &self,
        mut stream: ByteStream,
        to: &Url,
        cancel: &CancellationToken,
    ) -> anyhow::Result<u64> {
        let (hang, error) = {
            let state = self.state.lock();
            (state.hang, state.error.clone())
        };
        if hang {
            cancel.cancelled().await;
            return Err(anyhow!("upload to {to} cancelled"));
        }
        if let Some(message) = error {
            return Err(anyhow!("{message}"));
        }

        let mut data = Vec::new();
        stream.read_to_end(&mut data).await?;
        let mut state = self.state.lock();
        state.uploads.push((to.to_string(), data.clone()));
        Ok(state.reported_size.unwrap_or(data.len() as u64))
    }
}
