//! Folder and camera front ends over one shared pipeline.
//!
//! Both drivers feed frames through the same [`Pipeline`]: detect, buffer,
//! build on flush, persist locally, then hand the artifact to the uploader.
//! Nothing that happens to a single frame or artifact ends a run; only a camera
//! that cannot be opened or an external interrupt does.

use anyhow::{Context, Result};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::artifact::{Artifact, ArtifactBuilder};
use crate::config::RunConfig;
use crate::detect::{Detection, DetectorBackend};
use crate::frame::Frame;
use crate::ingest::{CaptureDevice, FolderSource};
use crate::pacing::{Pacer, Sleeper};
use crate::sequence::{BufferedFrame, PushOutcome, SequenceBuffer};
use crate::storage::{ArtifactStore, LocalStore, PersistedArtifact};
use crate::transport::{
    ArtifactUploader, DisabledUploader, ResilientClient, UploadClient, UploadOutcome, UploadTally,
    UploadWorker,
};
use crate::ui::Progress;

/// Delay before retrying a failed camera read.
pub const READ_RETRY_DELAY: Duration = Duration::from_millis(100);

/// Where finished artifacts go after local persistence.
pub enum UploadDispatch {
    /// Upload on the capture thread; the loop waits for it.
    Inline(Box<dyn ArtifactUploader>),
    /// Upload on a worker thread, one in flight.
    Background(UploadWorker),
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RunSummary {
    pub frames_read: u64,
    pub frames_skipped: u64,
    pub read_failures: u64,
    pub detector_errors: u64,
    /// Frames with at least one box.
    pub detections: u64,
    pub artifacts: u64,
    pub build_failures: u64,
    pub persist_failures: u64,
    pub uploads_complete: u64,
    pub uploads_degraded: u64,
    /// Frames of a partial sequence still buffered when the run ended.
    pub discarded_trailing: u64,
}

impl RunSummary {
    fn record_upload(&mut self, outcome: &UploadOutcome) {
        let mut tally = UploadTally::default();
        tally.record(outcome);
        self.add_uploads(tally);
    }

    fn add_uploads(&mut self, tally: UploadTally) {
        self.uploads_complete += tally.complete;
        self.uploads_degraded += tally.degraded;
    }
}

impl fmt::Display for RunSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "frames={} skipped={} read_failures={} detector_errors={} detections={} \
             artifacts={} build_failures={} persist_failures={} uploads_ok={} \
             uploads_degraded={} discarded_trailing={}",
            self.frames_read,
            self.frames_skipped,
            self.read_failures,
            self.detector_errors,
            self.detections,
            self.artifacts,
            self.build_failures,
            self.persist_failures,
            self.uploads_complete,
            self.uploads_degraded,
            self.discarded_trailing
        )
    }
}

/// What one flush produced.
#[derive(Debug)]
pub struct FlushReport {
    pub id: String,
    pub frame_count: usize,
    pub persisted: Option<PersistedArtifact>,
    /// `None` when the upload was handed to the background worker.
    pub upload: Option<UploadOutcome>,
}

pub struct Pipeline {
    buffer: SequenceBuffer,
    builder: ArtifactBuilder,
    store: Box<dyn ArtifactStore>,
    uploads: UploadDispatch,
    jpeg_quality: u8,
    summary: RunSummary,
}

impl Pipeline {
    pub fn new(
        buffer: SequenceBuffer,
        builder: ArtifactBuilder,
        store: Box<dyn ArtifactStore>,
        uploads: UploadDispatch,
        jpeg_quality: u8,
    ) -> Self {
        Self {
            buffer,
            builder,
            store,
            uploads,
            jpeg_quality,
            summary: RunSummary::default(),
        }
    }

    /// Wire the pipeline described by `cfg`. `sleeper` paces transport retries.
    pub fn from_config(cfg: &RunConfig, sleeper: Arc<dyn Sleeper>) -> Result<Self> {
        let store = LocalStore::open(&cfg.output_dir)?;
        let builder = ArtifactBuilder::new(
            cfg.pixels_per_unit,
            cfg.position.clone(),
            cfg.material.clone(),
            cfg.location_policy.resolver(),
        );

        let uploader: Box<dyn ArtifactUploader> = match &cfg.upload.endpoint {
            Some(endpoint) => {
                let client = ResilientClient::new(&cfg.transport).with_sleeper(sleeper);
                let api_key = cfg.upload.api_key.clone().unwrap_or_default();
                log::info!("uploads: {} via {}", endpoint, cfg.upload.image_method.as_str());
                Box::new(UploadClient::new(
                    client,
                    endpoint.clone(),
                    api_key,
                    cfg.upload.image_method,
                ))
            }
            None => {
                log::info!("uploads: disabled (no endpoint), keeping local copies only");
                Box::new(DisabledUploader)
            }
        };
        let uploads = if cfg.upload.background {
            UploadDispatch::Background(UploadWorker::spawn(uploader)?)
        } else {
            UploadDispatch::Inline(uploader)
        };

        Ok(Self::new(
            SequenceBuffer::new(cfg.left_threshold),
            builder,
            Box::new(store),
            uploads,
            cfg.jpeg_quality,
        ))
    }

    pub fn summary(&self) -> &RunSummary {
        &self.summary
    }

    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    pub fn record_frame_read(&mut self) {
        self.summary.frames_read += 1;
    }

    pub fn record_skipped_frame(&mut self) {
        self.summary.frames_skipped += 1;
    }

    pub fn record_read_failure(&mut self) {
        self.summary.read_failures += 1;
    }

    pub fn record_detector_error(&mut self) {
        self.summary.detector_errors += 1;
    }

    /// Feed one detected frame. Returns a report when it completed an
    /// observation.
    pub fn observe(&mut self, frame: Frame, detection: Detection) -> Option<FlushReport> {
        if !detection.is_empty() {
            self.summary.detections += 1;
        }
        let seq = frame.seq;
        match self.buffer.push(frame, detection) {
            PushOutcome::Discarded => None,
            PushOutcome::Accumulating { buffered } => {
                log::debug!("frame {}: crack entering margin, {} buffered", seq, buffered);
                None
            }
            PushOutcome::Flushed(frames) => self.flush(&frames),
        }
    }

    fn flush(&mut self, frames: &[BufferedFrame]) -> Option<FlushReport> {
        let store = &self.store;
        let artifact = match self.builder.build(frames, |id| store.contains(id)) {
            Ok(artifact) => artifact,
            Err(err) => {
                log::error!("dropping {}-frame sequence: {:#}", frames.len(), err);
                self.summary.build_failures += 1;
                return None;
            }
        };
        let jpeg = match artifact.encode_jpeg(self.jpeg_quality) {
            Ok(jpeg) => jpeg,
            Err(err) => {
                log::error!("dropping {}: {:#}", artifact.id(), err);
                self.summary.build_failures += 1;
                return None;
            }
        };
        self.summary.artifacts += 1;
        let m = artifact.measurement();
        log::info!(
            "issue {}: {} frame(s), {} {}x{} at {}",
            m.id,
            artifact.frame_count(),
            m.crack_type,
            m.length,
            m.width,
            m.crack_location
        );

        let persisted = match self.store.persist(&artifact, &jpeg) {
            Ok(persisted) => Some(persisted),
            Err(err) => {
                log::error!("local save failed for {}: {:#}", artifact.id(), err);
                self.summary.persist_failures += 1;
                None
            }
        };

        let id = artifact.id().to_string();
        let frame_count = artifact.frame_count();
        let upload = self.dispatch(artifact, jpeg);
        Some(FlushReport {
            id,
            frame_count,
            persisted,
            upload,
        })
    }

    fn dispatch(&mut self, artifact: Artifact, jpeg: Vec<u8>) -> Option<UploadOutcome> {
        match &mut self.uploads {
            UploadDispatch::Inline(uploader) => {
                let outcome = uploader.submit(&artifact, &jpeg);
                log::info!("upload: {}", outcome);
                self.summary.record_upload(&outcome);
                Some(outcome)
            }
            UploadDispatch::Background(worker) => {
                let id = artifact.id().to_string();
                if let Err(err) = worker.enqueue(artifact, jpeg) {
                    log::error!("upload of {} not queued: {:#}", id, err);
                    self.summary.uploads_degraded += 1;
                }
                None
            }
        }
    }

    /// End the run: drop any partial sequence and wait for background uploads.
    pub fn finish(self) -> Result<RunSummary> {
        let Pipeline {
            mut buffer,
            uploads,
            mut summary,
            ..
        } = self;

        let trailing = buffer.reset();
        if trailing > 0 {
            log::warn!(
                "run ended with {} frame(s) of an incomplete sequence; not flushed",
                trailing
            );
        }
        summary.discarded_trailing = trailing as u64;

        if let UploadDispatch::Background(worker) = uploads {
            summary.add_uploads(worker.shutdown()?);
        }
        Ok(summary)
    }
}

/// Processes a folder of images once, in sorted order.
pub struct FolderDriver {
    source: FolderSource,
    detector: Box<dyn DetectorBackend>,
    pipeline: Pipeline,
    pacer: Pacer,
    progress: Progress,
}

impl FolderDriver {
    pub fn new(
        source: FolderSource,
        detector: Box<dyn DetectorBackend>,
        pipeline: Pipeline,
        pacer: Pacer,
        progress: Progress,
    ) -> Self {
        Self {
            source,
            detector,
            pipeline,
            pacer,
            progress,
        }
    }

    pub fn run(self) -> Result<RunSummary> {
        let FolderDriver {
            source,
            mut detector,
            mut pipeline,
            pacer,
            mut progress,
        } = self;
        detector
            .warm_up()
            .with_context(|| format!("{} detector warm-up failed", detector.name()))?;
        log::info!(
            "folder: {} image(s) in {}",
            source.len(),
            source.dir().display()
        );

        for (path, frame) in source {
            let started = Instant::now();
            let label = path
                .file_name()
                .map(|name| name.to_string_lossy().into_owned())
                .unwrap_or_else(|| path.display().to_string());
            match frame {
                Ok(frame) => {
                    pipeline.record_frame_read();
                    match detector.detect(&frame.image) {
                        Ok(detection) => {
                            pipeline.observe(frame, detection);
                        }
                        Err(err) => {
                            log::error!("detector failed on {}: {}", label, err);
                            pipeline.record_detector_error();
                        }
                    }
                }
                Err(err) => {
                    log::warn!("skipping {}: {:#}", label, err);
                    pipeline.record_skipped_frame();
                }
            }
            progress.advance(&label);
            pacer.pace(started);
        }
        progress.finish();

        let summary = pipeline.finish()?;
        log::info!("folder complete: {}", summary);
        Ok(summary)
    }
}

/// Live capture until interrupted.
pub struct CameraDriver {
    device: Box<dyn CaptureDevice>,
    detector: Box<dyn DetectorBackend>,
    pipeline: Pipeline,
    pacer: Pacer,
    frame_limit: Option<u64>,
}

impl CameraDriver {
    pub fn new(
        device: Box<dyn CaptureDevice>,
        detector: Box<dyn DetectorBackend>,
        pipeline: Pipeline,
        pacer: Pacer,
    ) -> Self {
        Self {
            device,
            detector,
            pipeline,
            pacer,
            frame_limit: None,
        }
    }

    /// Stop after this many frames have been read.
    pub fn with_frame_limit(mut self, limit: u64) -> Self {
        self.frame_limit = Some(limit);
        self
    }

    pub fn run(self, shutdown: &AtomicBool) -> Result<RunSummary> {
        let CameraDriver {
            mut device,
            mut detector,
            mut pipeline,
            pacer,
            frame_limit,
        } = self;
        let name = device.describe();
        device
            .open()
            .with_context(|| format!("cannot open camera {}", name))?;
        if let Err(err) = detector.warm_up() {
            device.release();
            return Err(err).with_context(|| format!("{} detector warm-up failed", detector.name()));
        }
        log::info!("camera: capturing from {}", name);

        while !shutdown.load(Ordering::SeqCst) {
            if frame_limit.is_some_and(|limit| pipeline.summary().frames_read >= limit) {
                break;
            }
            let started = Instant::now();
            let frame = match device.read() {
                Ok(frame) => frame,
                Err(err) => {
                    log::debug!("camera read failed: {:#}", err);
                    pipeline.record_read_failure();
                    pacer.pause(READ_RETRY_DELAY);
                    continue;
                }
            };
            pipeline.record_frame_read();
            match detector.detect(&frame.image) {
                Ok(detection) => {
                    pipeline.observe(frame, detection);
                }
                Err(err) => {
                    log::error!("detector failed on frame {}: {}", frame.seq, err);
                    pipeline.record_detector_error();
                }
            }
            pacer.pace(started);
        }
        if shutdown.load(Ordering::SeqCst) {
            log::info!("camera: interrupted");
        }
        device.release();

        let summary = pipeline.finish()?;
        log::info!("camera complete: {}", summary);
        Ok(summary)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::artifact::FixedLocation;
    use crate::detect::{BoundingBox, ClassNames, DetectedBox};
    use crate::storage::InMemoryArtifactStore;
    use image::RgbImage;

    #[derive(Default)]
    struct CountingUploader {
        submitted: Vec<String>,
    }

    impl ArtifactUploader for CountingUploader {
        fn submit(&mut self, artifact: &Artifact, _jpeg: &[u8]) -> UploadOutcome {
            self.submitted.push(artifact.id().to_string());
            UploadOutcome::disabled(artifact.id())
        }
    }

    fn pipeline(uploads: UploadDispatch) -> Pipeline {
        Pipeline::new(
            SequenceBuffer::new(100),
            ArtifactBuilder::new(10.0, "mountain", "concrete", Box::new(FixedLocation("C".into()))),
            Box::new(InMemoryArtifactStore::new()),
            uploads,
            90,
        )
    }

    fn detection(boxes: &[(u32, u32, u32, u32)]) -> Detection {
        let names = Arc::new(ClassNames::from_list(["Longitudinal".to_string()]));
        let boxes = boxes
            .iter()
            .map(|&(x1, y1, x2, y2)| DetectedBox {
                bbox: BoundingBox::new(x1, y1, x2, y2).unwrap(),
                class_id: 0,
                score: 0.9,
            })
            .collect();
        Detection::new(boxes, names)
    }

    fn frame(seq: u64) -> Frame {
        Frame::new(RgbImage::new(200, 60), seq, format!("frame-{}", seq))
    }

    #[test]
    fn flushes_once_the_crack_clears_the_margin() {
        let mut pipeline = pipeline(UploadDispatch::Inline(Box::new(DisabledUploader)));
        assert!(pipeline.observe(frame(1), detection(&[(5, 0, 20, 30)])).is_none());
        assert!(pipeline.observe(frame(2), detection(&[(50, 0, 70, 40)])).is_none());
        let report = pipeline
            .observe(frame(3), detection(&[(120, 0, 140, 35)]))
            .expect("third frame flushes");
        assert_eq!(report.frame_count, 3);
        assert!(report.persisted.is_some());
        assert!(!report.upload.expect("inline outcome").attempted());

        let summary = pipeline.finish().unwrap();
        assert_eq!(summary.artifacts, 1);
        assert_eq!(summary.detections, 3);
        assert_eq!(summary.uploads_complete + summary.uploads_degraded, 0);
    }

    #[test]
    fn empty_detections_do_not_count_or_buffer() {
        let mut pipeline = pipeline(UploadDispatch::Inline(Box::new(DisabledUploader)));
        let empty = Detection::empty(Arc::new(ClassNames::default()));
        assert!(pipeline.observe(frame(1), empty).is_none());
        assert_eq!(pipeline.buffered(), 0);
        assert_eq!(pipeline.summary().detections, 0);
    }

    #[test]
    fn trailing_partial_sequence_is_reported_not_flushed() {
        let mut pipeline = pipeline(UploadDispatch::Inline(Box::new(CountingUploader::default())));
        pipeline.observe(frame(1), detection(&[(5, 0, 20, 30)]));
        pipeline.observe(frame(2), detection(&[(40, 0, 60, 30)]));
        let summary = pipeline.finish().unwrap();
        assert_eq!(summary.artifacts, 0);
        assert_eq!(summary.discarded_trailing, 2);
    }

    #[test]
    fn background_dispatch_collects_outcomes_on_finish() {
        let worker = UploadWorker::spawn(Box::new(CountingUploader::default())).unwrap();
        let mut pipeline = pipeline(UploadDispatch::Background(worker));
        let report = pipeline
            .observe(frame(1), detection(&[(150, 0, 180, 20)]))
            .expect("single frame clear of the margin flushes");
        assert!(report.upload.is_none());
        let summary = pipeline.finish().unwrap();
        assert_eq!(summary.artifacts, 1);
    }
}
