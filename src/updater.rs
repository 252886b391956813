//! Update orchestrator.
//!
//! Sequences a set of image transfers over one bootloader session: build the
//! command list from an [`UpdatePlan`], capture the bootloader once, then for
//! each command issue its opcode, wait for the "Ready" banner, and stream the
//! image with XMODEM. A command that keeps failing after its bounded retries
//! aborts the run; the transport is closed on every exit path.

use crate::error::{Error, Result};
use crate::image::merged::{MergedImage, SegmentType};
use crate::monitor::{clean_debug_text, drain_utf8_lossy};
use crate::port::Port;
use crate::protocol::{BLOCK_SIZE, XmodemTransfer};
use crate::session::BootloaderSession;
use log::{debug, info, trace, warn};
use std::path::PathBuf;
use std::thread;
use std::time::Duration;

/// Attempts per command (opcode + banner + transfer).
const STREAM_ATTEMPTS: u32 = 3;

/// Delay between command attempts.
const STREAM_RETRY_DELAY: Duration = Duration::from_secs(1);

/// Banner lines read after issuing an opcode.
const BANNER_LINES: u32 = 4;

/// Opcode storing network information.
pub const NETWORK_INFO_OPCODE: &str = "o";

/// Opcode storing a test image.
pub const TEST_IMAGE_OPCODE: &str = "t";

/// Opcode storing the user application.
const USER_APP_OPCODE: &str = "s";

/// Opcode storing the second system image part.
const SYSTEM_IMAGE_PART2_OPCODE: &str = "S";

/// Flash address the system image is written to when none is given.
pub const DEFAULT_SYSTEM_IMAGE_ADDRESS: u32 = 0x0800_0000;

/// Payload of the implicit network-info-clear command.
const NETWORK_INFO_CLEAR: [u8; 10] = [0; 10];

/// One queued transfer: an opcode and the bytes to stream after its banner.
#[derive(Debug, Clone)]
pub struct UpdateCommand {
    /// Opcode text written to the bootloader.
    pub opcode: String,
    /// Human-readable name used in logs and progress callbacks.
    pub label: String,
    /// Image bytes to stream.
    pub data: Vec<u8>,
}

/// What to update in one run.
///
/// Individual images take priority over the merged container; within the
/// individual images the system image goes first so a power loss mid-run
/// leaves the module bootable.
#[derive(Debug, Clone, Default)]
pub struct UpdatePlan {
    /// System image file, streamed to `system_image_address`.
    pub system_image: Option<PathBuf>,
    /// User application file.
    pub user_app: Option<PathBuf>,
    /// Network information file.
    pub network_info: Option<PathBuf>,
    /// Extra (opcode, file) pairs streamed verbatim.
    pub raw: Vec<(String, PathBuf)>,
    /// Merged multi-image container, expanded segment by segment.
    pub merged: Option<PathBuf>,
    /// Overrides [`DEFAULT_SYSTEM_IMAGE_ADDRESS`] when set.
    pub system_image_address: Option<u32>,
    /// Jump to the application once all transfers succeed.
    pub start_app: bool,
    /// After starting the application, stream its debug output until
    /// interrupted. Implies `start_app`.
    pub stream_debug: bool,
}

impl UpdatePlan {
    fn system_image_opcode(&self) -> String {
        let addr = self.system_image_address.unwrap_or(DEFAULT_SYSTEM_IMAGE_ADDRESS);
        format!("a{addr:x}")
    }

    fn opcode_for(&self, seg_type: SegmentType) -> String {
        match seg_type {
            SegmentType::SystemImage => self.system_image_opcode(),
            SegmentType::UserApp => USER_APP_OPCODE.to_string(),
            SegmentType::NetworkInfo => NETWORK_INFO_OPCODE.to_string(),
            SegmentType::SystemImagePart2 => SYSTEM_IMAGE_PART2_OPCODE.to_string(),
        }
    }

    /// Expand the plan into the ordered command list.
    ///
    /// A merged container is fully validated before any of its segments is
    /// queued. Unless the final command is a network-info or test-image
    /// store, an implicit network-info-clear is appended so a stale network
    /// state never survives a system image swap.
    pub fn build_commands(&self) -> Result<Vec<UpdateCommand>> {
        let mut commands = Vec::new();

        if let Some(path) = &self.system_image {
            commands.push(UpdateCommand {
                opcode: self.system_image_opcode(),
                label: "system image".to_string(),
                data: std::fs::read(path)?,
            });
        }
        if let Some(path) = &self.user_app {
            commands.push(UpdateCommand {
                opcode: USER_APP_OPCODE.to_string(),
                label: "user application".to_string(),
                data: std::fs::read(path)?,
            });
        }
        if let Some(path) = &self.network_info {
            commands.push(UpdateCommand {
                opcode: NETWORK_INFO_OPCODE.to_string(),
                label: "network information".to_string(),
                data: std::fs::read(path)?,
            });
        }
        for (opcode, path) in &self.raw {
            commands.push(UpdateCommand {
                opcode: opcode.clone(),
                label: format!("raw {opcode:?}"),
                data: std::fs::read(path)?,
            });
        }
        if let Some(path) = &self.merged {
            let image = MergedImage::from_file(path)?;
            for (seg_type, payload) in image.extract() {
                commands.push(UpdateCommand {
                    opcode: self.opcode_for(seg_type),
                    label: seg_type.name().to_string(),
                    data: payload.to_vec(),
                });
            }
        }

        if commands.is_empty() {
            return Err(Error::Config("nothing to update".to_string()));
        }

        let keeps_network_info = commands.last().is_some_and(|cmd| {
            cmd.opcode == NETWORK_INFO_OPCODE || cmd.opcode == TEST_IMAGE_OPCODE
        });
        if !keeps_network_info {
            commands.push(UpdateCommand {
                opcode: NETWORK_INFO_OPCODE.to_string(),
                label: "network information clear".to_string(),
                data: NETWORK_INFO_CLEAR.to_vec(),
            });
        }

        Ok(commands)
    }
}

/// Orchestrates a full update over one bootloader session.
pub struct Updater<P: Port> {
    session: BootloaderSession<P>,
    retry_delay: Duration,
}

impl<P: Port> Updater<P> {
    /// Create an updater over a session. The session need not be captured
    /// yet; [`Updater::run`] captures it.
    pub fn new(session: BootloaderSession<P>) -> Self {
        Self {
            session,
            retry_delay: STREAM_RETRY_DELAY,
        }
    }

    /// Override the delay between command attempts.
    #[must_use]
    pub fn with_retry_delay(mut self, retry_delay: Duration) -> Self {
        self.retry_delay = retry_delay;
        self
    }

    /// Get a mutable reference to the underlying session.
    pub fn session_mut(&mut self) -> &mut BootloaderSession<P> {
        &mut self.session
    }

    /// Consume the updater and return the session.
    pub fn into_session(self) -> BootloaderSession<P> {
        self.session
    }

    /// Issue one command's opcode and stream its image.
    ///
    /// `progress` receives `(label, sent_bytes, total_bytes)` after each
    /// acknowledged block; byte counts are at block granularity.
    ///
    /// A "Fail" banner before any block of this command was ever accepted
    /// means the bootloader rejected the opcode outright (image targets a
    /// partition this module does not have) and fails immediately; every
    /// other failure is retried up to [`STREAM_ATTEMPTS`] times.
    pub fn update_stream<F>(&mut self, cmd: &UpdateCommand, progress: &mut F) -> Result<()>
    where
        F: FnMut(&str, usize, usize),
    {
        let total = cmd.data.len().div_ceil(BLOCK_SIZE) * BLOCK_SIZE;
        let mut any_acked = false;

        for attempt in 1..=STREAM_ATTEMPTS {
            if crate::is_interrupt_requested() {
                return Err(Error::Interrupted);
            }
            if attempt > 1 {
                thread::sleep(self.retry_delay);
                warn!(
                    "Retrying {} (attempt {attempt}/{STREAM_ATTEMPTS})",
                    cmd.label
                );
            }

            self.session.port_mut().reset_input_buffer()?;
            self.session.execute_cmd(&cmd.opcode)?;

            let mut crc_ready = false;
            let mut saw_ready = false;
            let mut saw_fail = false;
            for _ in 0..BANNER_LINES {
                let line = self.session.port_mut().read_line()?;
                if !line.is_empty() {
                    trace!(
                        "banner: {}",
                        String::from_utf8_lossy(&line).trim_end()
                    );
                }
                if line.contains(&b'C') {
                    crc_ready = true;
                }
                if contains(&line, b"Fail") {
                    saw_fail = true;
                    break;
                }
                if contains(&line, b"Ready") {
                    saw_ready = true;
                    break;
                }
            }

            if saw_fail {
                if any_acked {
                    warn!("{} reported failure mid-transfer", cmd.label);
                    continue;
                }
                return Err(Error::PartitionMismatch(format!(
                    "bootloader rejected {} (opcode {:?})",
                    cmd.label, cmd.opcode
                )));
            }
            if !saw_ready {
                warn!("no Ready banner for {}", cmd.label);
                continue;
            }

            debug!("Streaming {} ({} bytes)", cmd.label, cmd.data.len());
            let result = XmodemTransfer::new(self.session.port_mut())
                .crc_ready(crc_ready)
                .send(&cmd.data, |sent| {
                    any_acked = true;
                    progress(&cmd.label, sent, total);
                });
            match result {
                Ok(()) => {
                    info!("{} updated", cmd.label);
                    return Ok(());
                },
                Err(e) => warn!("{} transfer failed: {e}", cmd.label),
            }
        }

        Err(Error::Transfer(format!(
            "{} failed after {STREAM_ATTEMPTS} attempts",
            cmd.label
        )))
    }

    /// Run the whole plan.
    ///
    /// Captures the bootloader once, executes every command in order and
    /// aborts on the first failure. On success the application is started
    /// and, when requested, its debug output is streamed to `debug_sink`
    /// until an interrupt is requested. The transport is closed before
    /// returning, whatever the outcome.
    pub fn run<F, D>(&mut self, plan: &UpdatePlan, progress: &mut F, debug_sink: &mut D) -> Result<()>
    where
        F: FnMut(&str, usize, usize),
        D: FnMut(&str),
    {
        let result = self.run_inner(plan, progress, debug_sink);
        if let Err(e) = self.session.close() {
            warn!("closing the port failed: {e}");
        }
        result
    }

    fn run_inner<F, D>(&mut self, plan: &UpdatePlan, progress: &mut F, debug_sink: &mut D) -> Result<()>
    where
        F: FnMut(&str, usize, usize),
        D: FnMut(&str),
    {
        let commands = plan.build_commands()?;
        info!("{} command(s) queued", commands.len());

        self.session.capture_bootloader()?;
        for cmd in &commands {
            self.update_stream(cmd, progress)?;
        }

        if plan.start_app || plan.stream_debug {
            self.session.jump_to_app()?;
        }
        if plan.stream_debug {
            self.stream_debug(debug_sink)?;
        }
        Ok(())
    }

    /// Forward the running application's debug output to `sink` until an
    /// interrupt is requested.
    fn stream_debug<D>(&mut self, sink: &mut D) -> Result<()>
    where
        D: FnMut(&str),
    {
        info!("Streaming debug output, interrupt to stop");
        let mut pending = Vec::new();
        let mut chunk = [0u8; 256];

        loop {
            if crate::is_interrupt_requested() {
                return Ok(());
            }
            match self.session.port_mut().read(&mut chunk) {
                Ok(0) => {},
                Ok(n) => {
                    pending.extend_from_slice(&chunk[..n]);
                    let text = clean_debug_text(&drain_utf8_lossy(&mut pending));
                    if !text.is_empty() {
                        sink(&text);
                    }
                },
                Err(e) if e.kind() == std::io::ErrorKind::TimedOut => {},
                Err(e) => return Err(Error::Io(e)),
            }
        }
    }
}

fn contains(haystack: &[u8], needle: &[u8]) -> bool {
    haystack.windows(needle.len()).any(|w| w == needle)
}
