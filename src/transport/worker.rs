//! Background upload worker.
//!
//! Uploads run on a dedicated thread so the capture loop keeps going while the
//! network is slow. The channel is a rendezvous: at most one artifact is being
//! uploaded, and `enqueue` blocks while it is.

use anyhow::{anyhow, Context, Result};
use std::sync::mpsc::{sync_channel, Receiver, SyncSender};
use std::thread::{self, JoinHandle};

use super::upload::{ArtifactUploader, UploadOutcome};
use crate::artifact::Artifact;

struct UploadJob {
    artifact: Artifact,
    jpeg: Vec<u8>,
}

/// Running counts of finished uploads. Skipped (disabled) uploads count as
/// neither.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct UploadTally {
    pub complete: u64,
    pub degraded: u64,
}

impl UploadTally {
    pub fn record(&mut self, outcome: &UploadOutcome) {
        if !outcome.attempted() {
            return;
        }
        if outcome.is_complete() {
            self.complete += 1;
        } else {
            self.degraded += 1;
        }
    }
}

pub struct UploadWorker {
    sender: Option<SyncSender<UploadJob>>,
    handle: Option<JoinHandle<UploadTally>>,
}

impl UploadWorker {
    pub fn spawn(mut uploader: Box<dyn ArtifactUploader>) -> Result<Self> {
        let (sender, receiver): (SyncSender<UploadJob>, Receiver<UploadJob>) = sync_channel(0);
        let handle = thread::Builder::new()
            .name("crack-upload".to_string())
            .spawn(move || {
                let mut tally = UploadTally::default();
                for job in receiver {
                    let outcome = uploader.submit(&job.artifact, &job.jpeg);
                    log::info!("upload: {}", outcome);
                    tally.record(&outcome);
                }
                tally
            })
            .context("failed to spawn upload worker")?;
        Ok(Self {
            sender: Some(sender),
            handle: Some(handle),
        })
    }

    /// Hand an artifact to the worker. Blocks until the worker takes it.
    pub fn enqueue(&self, artifact: Artifact, jpeg: Vec<u8>) -> Result<()> {
        let sender = self
            .sender
            .as_ref()
            .ok_or_else(|| anyhow!("upload worker already shut down"))?;
        sender
            .send(UploadJob { artifact, jpeg })
            .map_err(|_| anyhow!("upload worker stopped unexpectedly"))
    }

    /// Close the queue, wait for the in-flight upload, and return the counts.
    pub fn shutdown(mut self) -> Result<UploadTally> {
        self.join()
    }

    fn join(&mut self) -> Result<UploadTally> {
        drop(self.sender.take());
        match self.handle.take() {
            Some(handle) => handle
                .join()
                .map_err(|_| anyhow!("upload worker panicked")),
            None => Ok(UploadTally::default()),
        }
    }
}

impl Drop for UploadWorker {
    fn drop(&mut self) {
        if let Err(err) = self.join() {
            log::error!("{:#}", err);
        }
    }
}
