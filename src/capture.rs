use std::time::Duration;

use tracing::{debug, error, info, warn};

use crate::config::{Config, ImageConfig};
use crate::console::{Command, CommandSource};
use crate::error::TransferError;
use crate::presence::{Clock, FingerWait, PresenceMonitor, PresenceTiming};
use crate::sensor::{Sensor, SensorLink};
use crate::upload::{UploadReply, UploadRequest, Uploader};

const DRAIN_POLL: Duration = Duration::from_millis(5);

/// Give up draining a link that never goes quiet
const DRAIN_LIMIT: Duration = Duration::from_secs(10);

/// How a capture mode ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ModeOutcome {
    Completed,
    Aborted(Command),
}

impl ModeOutcome {
    /// The operator asked to leave the program, not just the mode
    pub fn ends_process(&self) -> bool {
        matches!(self, ModeOutcome::Aborted(Command::Quit))
    }
}

/// Enrollment progress for one subject
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CaptureSession {
    pub subject_id: i64,
    pub target_count: u32,
    pub collected_count: u32,
}

impl CaptureSession {
    pub fn new(subject_id: i64, target_count: u32) -> Self {
        CaptureSession {
            subject_id,
            target_count,
            collected_count: 0,
        }
    }

    /// 1-based index of the sample being collected
    pub fn next_sample(&self) -> u32 {
        self.collected_count + 1
    }

    pub fn record_success(&mut self) {
        self.collected_count += 1;
    }

    pub fn is_complete(&self) -> bool {
        self.collected_count >= self.target_count
    }
}

/// Drives capture cycles: wait for finger, stream one image, wait for lift.
///
/// Owns the sensor link for its whole lifetime, so at most one transfer is
/// ever in flight.
pub struct Orchestrator<L, U, C> {
    sensor: Sensor<L>,
    uploader: U,
    monitor: PresenceMonitor<C>,
    image: ImageConfig,
    samples_per_subject: u32,
    drain_quiet: Duration,
    cls_counter: u32,
}

impl<L, U, C> Orchestrator<L, U, C>
where
    L: SensorLink,
    U: Uploader,
    C: Clock,
{
    pub fn new(sensor: Sensor<L>, uploader: U, clock: C, config: &Config) -> Self {
        Orchestrator {
            sensor,
            uploader,
            monitor: PresenceMonitor::new(PresenceTiming::from(&config.capture), clock),
            image: config.image.clone(),
            samples_per_subject: config.capture.samples_per_subject,
            drain_quiet: Duration::from_millis(config.sensor.drain_quiet_ms),
            cls_counter: 1,
        }
    }

    /// Collect `samples_per_subject` images of the same finger for `subject_id`.
    ///
    /// A failed transfer does not use up a sample slot; the same index is
    /// retried on the next placement.
    pub fn run_detect(&mut self, subject_id: i64, commands: &mut dyn CommandSource) -> ModeOutcome {
        let mut session = CaptureSession::new(subject_id, self.samples_per_subject);
        info!(
            "DETECT mode: person_id={} - capture the same finger {} times",
            subject_id, session.target_count
        );

        while !session.is_complete() {
            if let FingerWait::Aborted(command) = self.monitor.wait_for_finger(&mut self.sensor, commands) {
                info!("command: {}", command);
                return ModeOutcome::Aborted(command);
            }
            self.drain_link();

            let request = UploadRequest::detect(&self.image, subject_id, session.next_sample());
            match self.transfer(&request) {
                Ok((sent, _)) => {
                    info!(
                        "Saved capture {}/{} ({} bytes)",
                        session.next_sample(),
                        session.target_count,
                        sent
                    );
                    self.monitor.wait_for_lift(&mut self.sensor);
                    self.drain_link();
                    session.record_success();
                }
                Err(e) => {
                    error!("Upload error for {}: {}", request.filename(), e);
                    self.recover();
                }
            }

            if let Some(command) = commands.poll_abort() {
                info!("command: {}", command);
                return ModeOutcome::Aborted(command);
            }
        }

        info!(
            "DETECT complete: {} images captured for person_id={}",
            session.collected_count, subject_id
        );
        ModeOutcome::Completed
    }

    /// One upload per placement until aborted. Uploads carry no subject id.
    pub fn run_classify(&mut self, commands: &mut dyn CommandSource) -> ModeOutcome {
        info!("CLS mode (predict): one capture per placement. Type 'stop' to exit.");

        loop {
            if let FingerWait::Aborted(command) = self.monitor.wait_for_finger(&mut self.sensor, commands) {
                info!("command: {}", command);
                return ModeOutcome::Aborted(command);
            }
            self.drain_link();

            let request = UploadRequest::classify(&self.image, self.cls_counter);
            match self.transfer(&request) {
                Ok((sent, reply)) => {
                    if let Some(reply) = reply {
                        log_identification(&reply);
                    }
                    info!("Sent {} ({} bytes). Next...", request.filename(), sent);
                    self.cls_counter += 1;
                    self.monitor.wait_for_lift(&mut self.sensor);
                    self.drain_link();
                }
                Err(e) => {
                    error!("Upload/identify failed for {}: {}", request.filename(), e);
                    self.recover();
                }
            }

            if let Some(command) = commands.poll_abort() {
                info!("command: {}", command);
                return ModeOutcome::Aborted(command);
            }
        }
    }

    #[cfg(test)]
    pub fn sensor(&self) -> &Sensor<L> {
        &self.sensor
    }

    /// Open a request, relay the image into it, close it.
    ///
    /// The request is closed on every path; a broken body is left short of
    /// its declared length, which the server rejects.
    fn transfer(&mut self, request: &UploadRequest) -> Result<(usize, Option<UploadReply>), TransferError> {
        let mut body = self.uploader.begin(request)?;

        let sent = match self.sensor.stream_image(&mut body) {
            Ok(sent) => sent,
            Err(e) => {
                self.uploader.finish(body);
                return Err(e);
            }
        };

        if sent != request.content_length {
            warn!(
                "{}: streamed {} bytes, expected {}",
                request.filename(),
                sent,
                request.content_length
            );
        }

        let reply = self.uploader.finish(body);
        match &reply {
            Some(reply) if !reply.is_success() => {
                warn!("{}: server replied with status {:?}", request.filename(), reply.status)
            }
            Some(reply) => debug!("{}: server replied {:?}", request.filename(), reply.status),
            None => debug!("{}: no reply from server", request.filename()),
        }
        Ok((sent, reply))
    }

    // Resynchronise after a failed transfer: the sensor may still be sending
    // DATA packets, which must be gone before the lift probes go out.
    fn recover(&mut self) {
        self.drain_link();
        self.monitor.wait_for_lift(&mut self.sensor);
        self.drain_link();
    }

    /// Discard received bytes until the link stays silent for `drain_quiet`
    fn drain_link(&mut self) {
        let clock = self.monitor.clock();
        let start = clock.now();
        let mut quiet_since = start;
        let mut discarded = 0usize;

        loop {
            match self.sensor.discard_pending() {
                Ok(0) => {
                    if clock.now().duration_since(quiet_since) >= self.drain_quiet {
                        break;
                    }
                }
                Ok(n) => {
                    discarded += n;
                    quiet_since = clock.now();
                }
                Err(e) => {
                    warn!("Failed to flush sensor input: {}", e);
                    break;
                }
            }
            if clock.now().duration_since(start) > DRAIN_LIMIT {
                warn!("Sensor link still busy after {}s", DRAIN_LIMIT.as_secs());
                break;
            }
            clock.sleep(DRAIN_POLL);
        }

        if discarded > 0 {
            warn!("Flushed {} stale bytes from the sensor link", discarded);
        }
    }
}

fn log_identification(reply: &UploadReply) {
    match reply.identification() {
        Some(verdict) => match verdict.matched() {
            Some(id) => info!(
                "MATCH {} (score={:.1}, thr={:.1})",
                id, verdict.score, verdict.threshold
            ),
            None => info!(
                "NOT MATCH (score={:.1}, thr={:.1})",
                verdict.score, verdict.threshold
            ),
        },
        None if !reply.body.is_empty() => debug!("Server replied (non-JSON): {}", reply.body),
        None => {}
    }
}
