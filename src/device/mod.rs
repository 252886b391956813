//! USB device discovery and classification.
//!
//! Module development boards show up as USB-to-UART bridges, usually a
//! multi-interface FTDI part where only one interface is wired to the
//! bootloader UART. Classification therefore matches on VID/PID plus, where
//! the profile specifies one, the USB interface index: on Windows and Linux
//! the index reported by the OS, on macOS the trailing digit of the device
//! path.

use crate::error::{Error, Result};
use log::{debug, info, trace};
use std::time::Duration;

/// Poll interval for [`detect_new_port`].
pub const DETECT_POLL_INTERVAL: Duration = Duration::from_millis(500);

/// Module generation behind a detected serial port.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChipKind {
    /// Second-generation module.
    G2,
    /// Third-generation module.
    G3,
    /// Generic USB-to-UART bridge, module generation unknown.
    Generic,
}

/// Immutable USB identity of a known board, kept in a static table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UsbDeviceProfile {
    /// Human-readable board name.
    pub display_name: &'static str,
    /// Module generation on the board.
    pub chip: ChipKind,
    /// USB vendor ID.
    pub vendor_id: u16,
    /// USB product ID.
    pub product_id: u16,
    /// USB interface index, for multi-interface bridges. `None` matches any.
    pub interface: Option<u8>,
}

impl UsbDeviceProfile {
    /// Whether this profile is a debug-console companion interface rather
    /// than the programmable bootloader UART.
    pub fn is_debug_console(&self) -> bool {
        self.display_name.contains("debug console")
    }
}

/// Known development board identities, in match-priority order.
pub static KNOWN_PROFILES: &[UsbDeviceProfile] = &[
    UsbDeviceProfile {
        display_name: "G2 development board",
        chip: ChipKind::G2,
        vendor_id: 0x0403,
        product_id: 0x6011,
        interface: Some(0),
    },
    UsbDeviceProfile {
        display_name: "G2 debug console",
        chip: ChipKind::G2,
        vendor_id: 0x0403,
        product_id: 0x6011,
        interface: Some(2),
    },
    UsbDeviceProfile {
        display_name: "G3 development board",
        chip: ChipKind::G3,
        vendor_id: 0x0403,
        product_id: 0x6010,
        interface: Some(0),
    },
    UsbDeviceProfile {
        display_name: "G3 debug console",
        chip: ChipKind::G3,
        vendor_id: 0x0403,
        product_id: 0x6010,
        interface: Some(1),
    },
    UsbDeviceProfile {
        display_name: "USB-serial adapter",
        chip: ChipKind::Generic,
        vendor_id: 0x10C4,
        product_id: 0xEA60,
        interface: None,
    },
];

/// A serial port observed during one enumeration pass. Ephemeral; produced
/// per call and not owned by any component.
#[derive(Debug, Clone)]
pub struct DetectedPort {
    /// Port name/path (e.g., "/dev/ttyUSB0" or "COM3").
    pub name: String,
    /// Matched board profile, if any.
    pub profile: Option<&'static UsbDeviceProfile>,
    /// USB Vendor ID (if available).
    pub vid: Option<u16>,
    /// USB Product ID (if available).
    pub pid: Option<u16>,
}

impl DetectedPort {
    /// Whether this port matched a known board profile.
    pub fn is_known(&self) -> bool {
        self.profile.is_some()
    }
}

/// Match a USB identity against [`KNOWN_PROFILES`]. First match wins.
pub fn classify(vid: u16, pid: u16, interface: Option<u8>) -> Option<&'static UsbDeviceProfile> {
    KNOWN_PROFILES.iter().find(|profile| {
        profile.vendor_id == vid
            && profile.product_id == pid
            && (profile.interface.is_none() || profile.interface == interface)
    })
}

/// Parse the trailing decimal digit of a device path, if any.
///
/// macOS encodes the USB interface index as the last character of the
/// `/dev/cu.usbserial-*` path.
pub fn trailing_digit(port_name: &str) -> Option<u8> {
    port_name
        .chars()
        .last()
        .and_then(|c| c.to_digit(10))
        .and_then(|d| u8::try_from(d).ok())
}

#[cfg(target_os = "macos")]
fn platform_interface_index(port_name: &str, _reported: Option<u8>) -> Option<u8> {
    trailing_digit(port_name)
}

#[cfg(not(target_os = "macos"))]
fn platform_interface_index(_port_name: &str, reported: Option<u8>) -> Option<u8> {
    reported
}

/// Enumerate serial ports and classify each against the profile table.
pub fn enumerate() -> Vec<DetectedPort> {
    let mut result = Vec::new();

    match serialport::available_ports() {
        Ok(ports) => {
            for port_info in ports {
                let mut detected = DetectedPort {
                    name: port_info.port_name.clone(),
                    profile: None,
                    vid: None,
                    pid: None,
                };

                if let serialport::SerialPortType::UsbPort(usb_info) = port_info.port_type {
                    let interface =
                        platform_interface_index(&port_info.port_name, usb_info.interface);
                    detected.vid = Some(usb_info.vid);
                    detected.pid = Some(usb_info.pid);
                    detected.profile = classify(usb_info.vid, usb_info.pid, interface);

                    trace!(
                        "Found USB port: {} (VID: {:04X}, PID: {:04X}, interface: {:?}, profile: {:?})",
                        port_info.port_name,
                        usb_info.vid,
                        usb_info.pid,
                        interface,
                        detected.profile.map(|p| p.display_name)
                    );
                }

                result.push(detected);
            }
        },
        Err(e) => {
            debug!("Failed to enumerate serial ports: {e}");
        },
    }

    result
}

/// Ports present in `after` but not in `before`, excluding those whose
/// profile appears in `ignore`.
pub fn diff_snapshots(
    before: &[DetectedPort],
    after: &[DetectedPort],
    ignore: &[&'static UsbDeviceProfile],
) -> Vec<DetectedPort> {
    after
        .iter()
        .filter(|port| !before.iter().any(|prev| prev.name == port.name))
        .filter(|port| {
            port.profile
                .is_none_or(|profile| !ignore.iter().any(|ignored| **ignored == *profile))
        })
        .cloned()
        .collect()
}

/// Block until exactly one new serial port appears.
///
/// Takes a snapshot, then polls [`enumerate`] every 500 ms and diffs against
/// it, skipping ports whose profile is in `ignore` (debug-console companion
/// interfaces, typically). Intentionally unbounded: the call is paced by an
/// operator plugging in a cable. Cancellation goes through the global
/// interrupt checker.
///
/// Fails if a single poll reveals more than one new candidate port.
pub fn detect_new_port(ignore: &[&'static UsbDeviceProfile]) -> Result<DetectedPort> {
    let baseline = enumerate();
    info!(
        "Waiting for a new serial port ({} already present)...",
        baseline.len()
    );

    loop {
        if crate::is_interrupt_requested() {
            return Err(Error::Interrupted);
        }
        std::thread::sleep(DETECT_POLL_INTERVAL);

        let mut candidates = diff_snapshots(&baseline, &enumerate(), ignore);
        match candidates.len() {
            0 => {},
            1 => {
                let port = candidates.remove(0);
                info!(
                    "New port detected: {}{}",
                    port.name,
                    port.profile
                        .map(|p| format!(" ({})", p.display_name))
                        .unwrap_or_default()
                );
                return Ok(port);
            },
            n => {
                return Err(Error::Protocol(format!(
                    "{n} new serial ports appeared at once; connect one device at a time"
                )));
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn port(name: &str, profile: Option<&'static UsbDeviceProfile>) -> DetectedPort {
        DetectedPort {
            name: name.to_string(),
            profile,
            vid: profile.map(|p| p.vendor_id),
            pid: profile.map(|p| p.product_id),
        }
    }

    #[test]
    fn test_classify_requires_interface_match() {
        let dev = classify(0x0403, 0x6011, Some(0)).unwrap();
        assert_eq!(dev.display_name, "G2 development board");

        let console = classify(0x0403, 0x6011, Some(2)).unwrap();
        assert_eq!(console.display_name, "G2 debug console");
        assert!(console.is_debug_console());

        // Interface 1 on the quad bridge is not wired to anything we know.
        assert!(classify(0x0403, 0x6011, Some(1)).is_none());
        // Unknown interface cannot satisfy a profile that names one.
        assert!(classify(0x0403, 0x6011, None).is_none());
    }

    #[test]
    fn test_classify_wildcard_interface() {
        // The CP210x profile has no interface constraint.
        assert!(classify(0x10C4, 0xEA60, None).is_some());
        assert!(classify(0x10C4, 0xEA60, Some(7)).is_some());
    }

    #[test]
    fn test_classify_unknown_identity() {
        assert!(classify(0x1234, 0x5678, Some(0)).is_none());
    }

    #[test]
    fn test_trailing_digit() {
        assert_eq!(trailing_digit("/dev/cu.usbserial-0145B3"), Some(3));
        assert_eq!(trailing_digit("/dev/cu.usbserial-0145B0"), Some(0));
        assert_eq!(trailing_digit("/dev/cu.Bluetooth"), None);
        assert_eq!(trailing_digit(""), None);
    }

    #[test]
    fn test_diff_snapshots_reports_additions_only() {
        let before = vec![port("/dev/ttyUSB0", None)];
        let after = vec![
            port("/dev/ttyUSB0", None),
            port("/dev/ttyUSB1", Some(&KNOWN_PROFILES[0])),
        ];
        let new = diff_snapshots(&before, &after, &[]);
        assert_eq!(new.len(), 1);
        assert_eq!(new[0].name, "/dev/ttyUSB1");

        // Removals are not additions.
        let new = diff_snapshots(&after, &before, &[]);
        assert!(new.is_empty());
    }

    #[test]
    fn test_diff_snapshots_skips_ignored_profiles() {
        let console = &KNOWN_PROFILES[1];
        assert!(console.is_debug_console());

        let before = vec![];
        let after = vec![
            port("/dev/ttyUSB0", Some(&KNOWN_PROFILES[0])),
            port("/dev/ttyUSB2", Some(console)),
        ];
        let new = diff_snapshots(&before, &after, &[console]);
        assert_eq!(new.len(), 1);
        assert_eq!(new[0].name, "/dev/ttyUSB0");
    }

    #[test]
    fn test_diff_snapshots_keeps_unknown_ports() {
        let before = vec![];
        let after = vec![port("/dev/ttyACM0", None)];
        let new = diff_snapshots(&before, &after, &[&KNOWN_PROFILES[1]]);
        assert_eq!(new.len(), 1);
    }
}
