//! Concurrent chunked upload orchestration.
//!
//! An upload initializes a multipart session, fans the parts out over a
//! bounded set of workers that claim part numbers from a shared cursor, then
//! completes the session with the sorted manifest. Any failure after the
//! session exists triggers a best-effort abort before the error is returned.

use std::{
    fmt::Display,
    sync::{
        Mutex, PoisonError,
        atomic::{AtomicBool, AtomicUsize, Ordering},
    },
};

use futures::{future::join_all, stream::BoxStream};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::backend::{PartResult, PartStore, SessionAuthority, UploadSession};
use crate::error::{BackendError, Result, UploadError};
use crate::partition::{DEFAULT_PART_SIZE, PartDescriptor, plan_parts};
use crate::source::UploadSource;

pub const DEFAULT_CONCURRENCY: usize = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UploadState {
    Idle,
    Initializing,
    Transferring,
    Completing,
    Done,
    Aborting,
    Failed,
}

impl Display for UploadState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            UploadState::Idle => write!(f, "Idle"),
            UploadState::Initializing => write!(f, "Initializing"),
            UploadState::Transferring => write!(f, "Transferring"),
            UploadState::Completing => write!(f, "Completing"),
            UploadState::Done => write!(f, "Done"),
            UploadState::Aborting => write!(f, "Aborting"),
            UploadState::Failed => write!(f, "Failed"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UploadEvent {
    State(UploadState),
    PartUploaded { part_number: u32, bytes: u64 },
    Complete(String),
}

/// Forwards progress to an optional listener. A listener that went away is ignored.
struct Reporter {
    events: Option<mpsc::UnboundedSender<UploadEvent>>,
}

impl Reporter {
    fn state(&self, state: UploadState) {
        debug!(%state, "upload state changed");
        self.send(UploadEvent::State(state));
    }

    fn part_uploaded(&self, part: &PartDescriptor) {
        debug!(part_number = part.part_number, bytes = part.len(), "part uploaded");
        self.send(UploadEvent::PartUploaded {
            part_number: part.part_number,
            bytes: part.len(),
        });
    }

    fn send(&self, event: UploadEvent) {
        if let Some(events) = &self.events {
            let _ = events.send(event);
        }
    }
}

/// Shared state of one transfer phase.
struct WorkQueue<'p> {
    parts: &'p [PartDescriptor],
    next: AtomicUsize,
    failed: AtomicBool,
    results: Mutex<Vec<PartResult>>,
    first_error: Mutex<Option<UploadError>>,
}

impl<'p> WorkQueue<'p> {
    fn new(parts: &'p [PartDescriptor]) -> Self {
        Self {
            parts,
            next: AtomicUsize::new(0),
            failed: AtomicBool::new(false),
            results: Mutex::new(Vec::with_capacity(parts.len())),
            first_error: Mutex::new(None),
        }
    }

    /// Hands out each part exactly once; nothing once a worker has failed.
    fn claim(&self) -> Option<&'p PartDescriptor> {
        if self.failed.load(Ordering::Acquire) {
            return None;
        }
        let index = self.next.fetch_add(1, Ordering::AcqRel);
        self.parts.get(index)
    }

    fn record(&self, result: PartResult) {
        self.results
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(result);
    }

    fn fail(&self, error: UploadError) {
        self.failed.store(true, Ordering::Release);
        let mut first_error = self
            .first_error
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if first_error.is_none() {
            *first_error = Some(error);
        } else {
            debug!(%error, "dropping error observed after the first failure");
        }
    }

    fn finish(self) -> Result<Vec<PartResult>> {
        if let Some(error) = self
            .first_error
            .into_inner()
            .unwrap_or_else(PoisonError::into_inner)
        {
            return Err(error);
        }
        Ok(self
            .results
            .into_inner()
            .unwrap_or_else(PoisonError::into_inner))
    }
}

/// Sorts collected results into the completion manifest.
///
/// Fails unless the results cover part numbers `1..=total_parts` exactly once.
pub fn build_manifest(mut results: Vec<PartResult>, total_parts: usize) -> Result<Vec<PartResult>> {
    results.sort_by_key(|result| result.part_number);

    let complete = results.len() == total_parts
        && results
            .iter()
            .enumerate()
            .all(|(index, result)| result.part_number as usize == index + 1);
    if !complete {
        return Err(UploadError::Completion(BackendError::Other(format!(
            "expected {} parts, collected {}",
            total_parts,
            results.len()
        ))));
    }

    Ok(results)
}

pub struct Uploader<A, S> {
    authority: A,
    store: S,
    part_size: u64,
    concurrency: usize,
}

impl<A, S> Uploader<A, S>
where
    A: SessionAuthority,
    S: PartStore,
{
    pub fn new(authority: A, store: S) -> Self {
        Self {
            authority,
            store,
            part_size: DEFAULT_PART_SIZE,
            concurrency: DEFAULT_CONCURRENCY,
        }
    }

    pub fn part_size(mut self, part_size: u64) -> Self {
        self.part_size = part_size;
        self
    }

    pub fn concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency;
        self
    }

    /// Uploads `source` under `module` and returns the final object reference.
    pub async fn upload<U>(&self, source: &U, module: &str) -> Result<String>
    where
        U: UploadSource + ?Sized,
    {
        self.run(source, module, Reporter { events: None }).await
    }

    /// Like [`Uploader::upload`], publishing state changes and finished parts to `events`.
    pub async fn upload_with_events<U>(
        &self,
        source: &U,
        module: &str,
        events: mpsc::UnboundedSender<UploadEvent>,
    ) -> Result<String>
    where
        U: UploadSource + ?Sized,
    {
        self.run(
            source,
            module,
            Reporter {
                events: Some(events),
            },
        )
        .await
    }

    /// Streams progress events, ending with [`UploadEvent::Complete`] or the terminal error.
    pub fn upload_stream<'a, U>(
        &'a self,
        source: &'a U,
        module: &'a str,
    ) -> BoxStream<'a, Result<UploadEvent>>
    where
        U: UploadSource + ?Sized,
    {
        let stream = async_stream::try_stream! {
            let (events_tx, mut events_rx) = mpsc::unbounded_channel();

            let upload_fut = self.upload_with_events(source, module, events_tx);
            tokio::pin!(upload_fut);

            let upload_result = loop {
                tokio::select! {
                    biased;
                    Some(event) = events_rx.recv() => {
                        yield event;
                    }
                    result = &mut upload_fut => {
                        break result;
                    }
                }
            };

            while let Ok(event) = events_rx.try_recv() {
                yield event;
            }

            let url = upload_result?;
            yield UploadEvent::Complete(url);
        };

        Box::pin(stream)
    }

    async fn run<U>(&self, source: &U, module: &str, reporter: Reporter) -> Result<String>
    where
        U: UploadSource + ?Sized,
    {
        if self.concurrency == 0 {
            return Err(UploadError::Validation(
                "concurrency must be greater than zero".to_string(),
            ));
        }
        let parts = plan_parts(source.len(), self.part_size)?;

        reporter.state(UploadState::Initializing);
        let session = match self.authority.init_session(module, source.name()).await {
            Ok(session) => session,
            Err(error) => {
                reporter.state(UploadState::Failed);
                return Err(UploadError::SessionInit(error));
            }
        };
        info!(
            upload_id = %session.upload_id,
            key = %session.key,
            parts = parts.len(),
            bytes = source.len(),
            "multipart upload started"
        );

        reporter.state(UploadState::Transferring);
        let outcome = match self.transfer(source, &session, &parts, &reporter).await {
            Ok(results) => {
                reporter.state(UploadState::Completing);
                self.complete(&session, results, parts.len()).await
            }
            Err(error) => Err(error),
        };

        match outcome {
            Ok(url) => {
                info!(key = %session.key, %url, "multipart upload completed");
                reporter.state(UploadState::Done);
                Ok(url)
            }
            Err(error) => {
                reporter.state(UploadState::Aborting);
                self.abort(&session).await;
                reporter.state(UploadState::Failed);
                Err(error)
            }
        }
    }

    async fn transfer<U>(
        &self,
        source: &U,
        session: &UploadSession,
        parts: &[PartDescriptor],
        reporter: &Reporter,
    ) -> Result<Vec<PartResult>>
    where
        U: UploadSource + ?Sized,
    {
        let queue = WorkQueue::new(parts);
        let workers = self.concurrency.min(parts.len());
        debug!(workers, parts = parts.len(), "starting part workers");

        join_all((0..workers).map(|_| self.work(source, session, &queue, reporter))).await;

        queue.finish()
    }

    async fn work<U>(
        &self,
        source: &U,
        session: &UploadSession,
        queue: &WorkQueue<'_>,
        reporter: &Reporter,
    ) where
        U: UploadSource + ?Sized,
    {
        while let Some(part) = queue.claim() {
            match self.upload_part(source, session, part).await {
                Ok(result) => {
                    queue.record(result);
                    reporter.part_uploaded(part);
                }
                Err(error) => {
                    queue.fail(error);
                    break;
                }
            }
        }
    }

    async fn upload_part<U>(
        &self,
        source: &U,
        session: &UploadSession,
        part: &PartDescriptor,
    ) -> Result<PartResult>
    where
        U: UploadSource + ?Sized,
    {
        let part_number = part.part_number;
        let content_type = source.content_type();

        let authorization = self
            .authority
            .authorize_part(session, part_number, content_type)
            .await
            .map_err(|source| UploadError::PartAuthorization {
                part_number,
                source,
            })?;

        let transfer_error = |source: BackendError| UploadError::PartTransfer {
            part_number,
            source,
        };

        let body = source
            .read_range(part.range.clone())
            .await
            .map_err(|error| transfer_error(BackendError::Io(error)))?;

        let e_tag = self
            .store
            .put_part(&authorization, body, content_type)
            .await
            .map_err(transfer_error)?;
        if e_tag.is_empty() {
            return Err(transfer_error(BackendError::MissingChecksum));
        }

        Ok(PartResult { part_number, e_tag })
    }

    async fn complete(
        &self,
        session: &UploadSession,
        results: Vec<PartResult>,
        total_parts: usize,
    ) -> Result<String> {
        let manifest = build_manifest(results, total_parts)?;
        self.authority
            .complete_session(session, &manifest)
            .await
            .map_err(UploadError::Completion)
    }

    async fn abort(&self, session: &UploadSession) {
        if let Err(error) = self.authority.abort_session(session).await {
            warn!(
                upload_id = %session.upload_id,
                key = %session.key,
                %error,
                "failed to abort multipart upload"
            );
        }
    }
}
