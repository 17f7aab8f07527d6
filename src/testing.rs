//! Deterministic stand-ins for the sensor, the clock, the console and the
//! upload server.

use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::io::{self, ErrorKind, Read, Write};
use std::rc::Rc;
use std::time::{Duration, Instant};

use crate::config::Config;
use crate::console::{Command, CommandSource};
use crate::error::{ProtocolError, TransportError};
use crate::presence::{Clock, PresenceProbe};
use crate::protocol::{
    confirm, decode_body, decode_header, encode, instruction, PacketType, HEADER_LEN,
};
use crate::sensor::SensorLink;
use crate::upload::{UploadReply, UploadRequest, Uploader};

pub const ADDRESS: u32 = 0xFFFF_FFFF;

pub fn test_config() -> Config {
    serde_json::from_str(
        r#"{
            "sensor": { "port": "/dev/null", "read_timeout_ms": 20 },
            "server": { "host": "127.0.0.1", "port": 3000 },
            "image": { "width": 16, "height": 8 },
            "capture": { "samples_per_subject": 3 }
        }"#,
    )
    .unwrap()
}

/// Link with a fixed receive script; reads past the end time out like an
/// idle serial port.
#[derive(Debug, Default)]
pub struct ScriptedLink {
    rx: VecDeque<u8>,
    tx: Vec<u8>,
}

impl ScriptedLink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, bytes: &[u8]) {
        self.rx.extend(bytes);
    }

    pub fn written(&self) -> &[u8] {
        &self.tx
    }

    pub fn unread(&self) -> usize {
        self.rx.len()
    }
}

fn read_queue(rx: &mut VecDeque<u8>, buf: &mut [u8]) -> io::Result<usize> {
    if rx.is_empty() {
        return Err(io::Error::new(ErrorKind::TimedOut, "no data"));
    }
    let n = buf.len().min(rx.len());
    for (slot, byte) in buf.iter_mut().zip(rx.drain(..n)) {
        *slot = byte;
    }
    Ok(n)
}

impl Read for ScriptedLink {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        read_queue(&mut self.rx, buf)
    }
}

impl Write for ScriptedLink {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.tx.extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl SensorLink for ScriptedLink {
    fn pending(&mut self) -> io::Result<usize> {
        Ok(self.rx.len())
    }
}

/// How the fake answers the next UpImage command
#[derive(Debug, Clone)]
pub enum ImageReply {
    Chunks(Vec<Vec<u8>>),
    Nack(u8),
    /// ACK, then the first DATA packet with a broken checksum, then the rest
    Corrupt(Vec<Vec<u8>>),
}

/// Number of absent GenImg probes the fake waits out before a placement
const PLACE_AFTER_ABSENT: usize = 15;

/// A finger that was never uploaded is lifted after this many present probes
const LIFT_AFTER_PRESENT: usize = 5;

/// Fingerprint module simulator that parses command packets and answers them.
///
/// A finger lands once enough consecutive absent probes were seen and a
/// placement is left. It lifts on the first probe after an UpImage, or after
/// a few probes when no upload came.
///
/// Commands arriving while reply bytes are still unread are recorded as
/// stale: on real hardware their replies would be misread.
#[derive(Debug, Default)]
pub struct FakeSensor {
    rx: VecDeque<u8>,
    tx: Vec<u8>,
    images: VecDeque<ImageReply>,
    placements: usize,
    finger_down: bool,
    uploaded: bool,
    absent_streak: usize,
    present_streak: usize,
    instructions: Vec<u8>,
    stale: Vec<u8>,
    placement_noise: Vec<u8>,
}

impl FakeSensor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_placements(placements: usize) -> Self {
        FakeSensor {
            placements,
            ..Self::default()
        }
    }

    /// Bytes emitted right after the ACK of every new placement
    pub fn with_placement_noise(mut self, noise: &[u8]) -> Self {
        self.placement_noise = noise.to_vec();
        self
    }

    pub fn queue_image(&mut self, chunks: Vec<Vec<u8>>) {
        self.images.push_back(ImageReply::Chunks(chunks));
    }

    pub fn queue_reply(&mut self, reply: ImageReply) {
        self.images.push_back(reply);
    }

    pub fn count(&self, instruction: u8) -> usize {
        self.instructions.iter().filter(|&&i| i == instruction).count()
    }

    pub fn unread(&self) -> usize {
        self.rx.len()
    }

    /// Instructions written while earlier replies were still unread
    pub fn stale_commands(&self) -> &[u8] {
        &self.stale
    }

    fn reply(&mut self, packet_type: PacketType, payload: &[u8]) {
        self.rx.extend(encode(ADDRESS, packet_type, payload));
    }

    fn gen_image(&mut self) -> u8 {
        if self.finger_down {
            if self.uploaded || self.present_streak >= LIFT_AFTER_PRESENT {
                self.finger_down = false;
                self.uploaded = false;
                self.absent_streak = 1;
                return confirm::NO_FINGER;
            }
            self.present_streak += 1;
            return confirm::OK;
        }

        if self.placements > 0 && self.absent_streak >= PLACE_AFTER_ABSENT {
            self.placements -= 1;
            self.finger_down = true;
            self.absent_streak = 0;
            self.present_streak = 0;
            return confirm::OK;
        }

        self.absent_streak += 1;
        confirm::NO_FINGER
    }

    fn up_image(&mut self) {
        self.uploaded = true;
        match self.images.pop_front() {
            Some(ImageReply::Chunks(chunks)) => {
                self.reply(PacketType::Ack, &[confirm::OK]);
                self.send_chunks(&chunks);
            }
            Some(ImageReply::Nack(code)) => self.reply(PacketType::Ack, &[code]),
            Some(ImageReply::Corrupt(chunks)) => {
                self.reply(PacketType::Ack, &[confirm::OK]);
                let mut first = encode(ADDRESS, PacketType::Data, &chunks[0]);
                let last = first.len() - 1;
                first[last] ^= 0xFF;
                self.rx.extend(first);
                self.send_chunks(&chunks[1..]);
            }
            // Nothing captured to upload
            None => self.reply(PacketType::Ack, &[0x15]),
        }
    }

    fn send_chunks(&mut self, chunks: &[Vec<u8>]) {
        for (i, chunk) in chunks.iter().enumerate() {
            let packet_type = if i + 1 == chunks.len() {
                PacketType::DataEnd
            } else {
                PacketType::Data
            };
            self.reply(packet_type, chunk);
        }
    }

    fn handle_commands(&mut self) {
        while self.tx.len() >= HEADER_LEN {
            let mut header_bytes = [0u8; HEADER_LEN];
            header_bytes.copy_from_slice(&self.tx[..HEADER_LEN]);
            let header = decode_header(&header_bytes).expect("host sent a malformed header");
            let total = HEADER_LEN + header.length as usize;
            if self.tx.len() < total {
                return;
            }

            let frame: Vec<u8> = self.tx.drain(..total).collect();
            let payload = decode_body(&header, &frame[HEADER_LEN..])
                .expect("host sent a bad checksum")
                .to_vec();
            let op = payload[0];
            self.instructions.push(op);
            if !self.rx.is_empty() {
                self.stale.push(op);
            }

            match op {
                instruction::GEN_IMAGE => {
                    let landed = !self.finger_down;
                    let code = self.gen_image();
                    self.reply(PacketType::Ack, &[code]);
                    if landed && self.finger_down {
                        let noise = self.placement_noise.clone();
                        self.rx.extend(noise);
                    }
                }
                instruction::UP_IMAGE => self.up_image(),
                instruction::VERIFY_PASSWORD => self.reply(PacketType::Ack, &[confirm::OK]),
                _ => self.reply(PacketType::Ack, &[0x01]),
            }
        }
    }
}

impl Read for FakeSensor {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        read_queue(&mut self.rx, buf)
    }
}

impl Write for FakeSensor {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.tx.extend_from_slice(buf);
        self.handle_commands();
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl SensorLink for FakeSensor {
    fn pending(&mut self) -> io::Result<usize> {
        Ok(self.rx.len())
    }
}

/// Clock whose `sleep` only moves time forward
#[derive(Debug, Clone)]
pub struct FakeClock {
    now: Rc<Cell<Instant>>,
}

impl FakeClock {
    pub fn new() -> Self {
        FakeClock {
            now: Rc::new(Cell::new(Instant::now())),
        }
    }
}

impl Clock for FakeClock {
    fn now(&self) -> Instant {
        self.now.get()
    }

    fn sleep(&self, duration: Duration) {
        self.now.set(self.now.get() + duration);
    }
}

/// Probe answering from a script; `None` entries fail the probe
#[derive(Debug)]
pub struct ScriptedProbe {
    script: VecDeque<Option<bool>>,
    fallback: bool,
    resyncs: usize,
}

impl ScriptedProbe {
    pub fn new(script: Vec<Option<bool>>, fallback: bool) -> Self {
        ScriptedProbe {
            script: script.into(),
            fallback,
            resyncs: 0,
        }
    }

    pub fn remaining(&self) -> usize {
        self.script.len()
    }

    pub fn resyncs(&self) -> usize {
        self.resyncs
    }
}

impl PresenceProbe for ScriptedProbe {
    fn finger_present(&mut self) -> Result<bool, ProtocolError> {
        match self.script.pop_front() {
            Some(Some(present)) => Ok(present),
            Some(None) => Err(ProtocolError::DeviceNack(0x01)),
            None => Ok(self.fallback),
        }
    }

    fn resync(&mut self) {
        self.resyncs += 1;
    }
}

/// Command source replaying a script, optionally aborting after N polls
#[derive(Debug, Default)]
pub struct ScriptedCommands {
    script: VecDeque<Option<Command>>,
    abort_after: Option<(usize, Command)>,
    polls: usize,
}

impl ScriptedCommands {
    pub fn new(script: Vec<Option<Command>>) -> Self {
        ScriptedCommands {
            script: script.into(),
            ..Self::default()
        }
    }

    pub fn aborting_after(polls: usize, command: Command) -> Self {
        ScriptedCommands {
            abort_after: Some((polls, command)),
            ..Self::default()
        }
    }

    /// Keep the script, then abort once `polls` polls have passed
    pub fn or_abort_after(mut self, polls: usize, command: Command) -> Self {
        self.abort_after = Some((polls, command));
        self
    }
}

impl CommandSource for ScriptedCommands {
    fn poll_command(&mut self) -> Option<Command> {
        self.polls += 1;
        if let Some(next) = self.script.pop_front() {
            return next;
        }
        match &self.abort_after {
            Some((after, command)) if self.polls > *after => Some(command.clone()),
            _ => None,
        }
    }
}

/// One request seen by `RecordingUploader`
#[derive(Debug, Clone)]
pub struct RecordedUpload {
    pub request: UploadRequest,
    pub body: Vec<u8>,
}

#[derive(Debug)]
pub struct RecordingBody {
    buf: Vec<u8>,
    request: UploadRequest,
    fail_writes: bool,
}

impl Write for RecordingBody {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if self.fail_writes {
            return Err(io::Error::new(ErrorKind::ConnectionReset, "peer reset"));
        }
        self.buf.extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// Uploader that keeps every finished request in memory
#[derive(Debug, Default)]
pub struct RecordingUploader {
    uploads: Rc<RefCell<Vec<RecordedUpload>>>,
    attempts: Rc<Cell<usize>>,
    /// Outcome per `begin` call, consumed in order: `Some(true)` refuses the
    /// connection, `Some(false)` breaks the body mid-stream
    failures: VecDeque<Option<bool>>,
    reply: Option<UploadReply>,
}

impl RecordingUploader {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_failures(failures: Vec<Option<bool>>) -> Self {
        RecordingUploader {
            failures: failures.into(),
            ..Self::default()
        }
    }

    pub fn with_reply(mut self, reply: UploadReply) -> Self {
        self.reply = Some(reply);
        self
    }

    pub fn uploads(&self) -> Rc<RefCell<Vec<RecordedUpload>>> {
        Rc::clone(&self.uploads)
    }

    pub fn attempts(&self) -> Rc<Cell<usize>> {
        Rc::clone(&self.attempts)
    }
}

impl Uploader for RecordingUploader {
    type Body = RecordingBody;

    fn begin(&mut self, request: &UploadRequest) -> Result<RecordingBody, TransportError> {
        self.attempts.set(self.attempts.get() + 1);
        let failure = self.failures.pop_front().flatten();
        if failure == Some(true) {
            return Err(TransportError::Connect(io::Error::new(
                ErrorKind::ConnectionRefused,
                "refused",
            )));
        }
        Ok(RecordingBody {
            buf: Vec::new(),
            request: request.clone(),
            fail_writes: failure == Some(false),
        })
    }

    fn finish(&mut self, body: RecordingBody) -> Option<UploadReply> {
        self.uploads.borrow_mut().push(RecordedUpload {
            request: body.request,
            body: body.buf,
        });
        self.reply.clone()
    }
}

/// Sink that refuses every write
#[derive(Debug, Default)]
pub struct FailingSink;

impl Write for FailingSink {
    fn write(&mut self, _buf: &[u8]) -> io::Result<usize> {
        Err(io::Error::new(ErrorKind::BrokenPipe, "sink closed"))
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}
