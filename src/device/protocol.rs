//! Wire format of the 15-key deck
//!
//! Input reports carry one status byte per key at a fixed offset. Key
//! images are streamed as fixed-size output reports, each with an 8-byte
//! header followed by a slice of the encoded image. Control commands and
//! identity queries go over 32-byte feature reports.

use super::transport::DeviceError;

/// USB vendor id of the deck
pub const VENDOR_ID: u16 = 0x0fd9;
/// USB product id of the 15-key MK.2 model
pub const PRODUCT_ID: u16 = 0x0080;

/// Number of physical keys
pub const KEY_COUNT: usize = 15;

/// Offset of the first key status byte in an input report
pub const KEY_STATE_OFFSET: usize = 4;
/// Length of an input report, header included
pub const INPUT_REPORT_LENGTH: usize = KEY_STATE_OFFSET + KEY_COUNT;

/// Total size of one image output report
pub const IMAGE_REPORT_LENGTH: usize = 1024;
/// Size of the image report header
pub const IMAGE_HEADER_LENGTH: usize = 8;
/// Image bytes carried per report
pub const IMAGE_PAYLOAD_CAPACITY: usize = IMAGE_REPORT_LENGTH - IMAGE_HEADER_LENGTH;

/// Output report id used for image transfers
pub const IMAGE_REPORT_ID: u8 = 0x02;
/// "Set key image" command code
pub const SET_ICON_COMMAND: u8 = 0x07;

/// Size of every feature report
pub const FEATURE_REPORT_LENGTH: usize = 32;
/// Feature report id for control commands
pub const CONTROL_REPORT_ID: u8 = 0x03;
const RESET_COMMAND: u8 = 0x02;
const BRIGHTNESS_COMMAND: u8 = 0x08;

/// Feature report holding the serial number
pub const SERIAL_REPORT_ID: u8 = 0x06;
/// Offset of the serial number text
pub const SERIAL_TEXT_OFFSET: usize = 2;
/// Feature report holding the firmware version
pub const FIRMWARE_REPORT_ID: u8 = 0x05;
/// Offset of the firmware version text
pub const FIRMWARE_TEXT_OFFSET: usize = 6;

/// A key changed state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KeyEdgeEvent {
    pub key_index: u8,
    pub pressed: bool,
}

/// Last known pressed/released state of every key
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyStates {
    pressed: [bool; KEY_COUNT],
}

impl Default for KeyStates {
    fn default() -> Self {
        Self {
            pressed: [false; KEY_COUNT],
        }
    }
}

impl KeyStates {
    /// Mark every key released
    pub fn reset(&mut self) {
        self.pressed = [false; KEY_COUNT];
    }

    /// Whether a key is currently held
    pub fn is_pressed(&self, key_index: usize) -> bool {
        self.pressed.get(key_index).copied().unwrap_or(false)
    }

    /// Apply an input report, returning one edge per changed key
    ///
    /// Edges come out in ascending key order. Reports too short to hold
    /// every key status byte are ignored.
    pub fn apply_report(&mut self, report: &[u8]) -> Vec<KeyEdgeEvent> {
        let Some(states) = report.get(KEY_STATE_OFFSET..KEY_STATE_OFFSET + KEY_COUNT) else {
            return Vec::new();
        };

        let mut edges = Vec::new();
        for (index, &byte) in states.iter().enumerate() {
            let pressed = byte != 0;
            if self.pressed[index] != pressed {
                self.pressed[index] = pressed;
                edges.push(KeyEdgeEvent {
                    key_index: index as u8,
                    pressed,
                });
            }
        }
        edges
    }
}

/// One output report of an image transfer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImagePacket {
    pub report_id: u8,
    pub command: u8,
    pub key_index: u8,
    pub is_last_packet: bool,
    pub byte_count: u16,
    pub page_index: u16,
    /// Always `IMAGE_PAYLOAD_CAPACITY` bytes; zero padded past `byte_count`
    pub payload: Vec<u8>,
}

impl ImagePacket {
    /// Serialize header and payload into a full output report
    pub fn to_report(&self) -> Vec<u8> {
        let mut report = Vec::with_capacity(IMAGE_REPORT_LENGTH);
        report.push(self.report_id);
        report.push(self.command);
        report.push(self.key_index);
        report.push(u8::from(self.is_last_packet));
        report.extend_from_slice(&self.byte_count.to_le_bytes());
        report.extend_from_slice(&self.page_index.to_le_bytes());
        report.extend_from_slice(&self.payload);
        report
    }
}

/// Split an encoded image into ordered output reports for one key
pub fn image_packets(key_index: u8, image: &[u8]) -> Result<Vec<ImagePacket>, DeviceError> {
    if image.is_empty() {
        return Err(DeviceError::EmptyImage);
    }
    if image.len().div_ceil(IMAGE_PAYLOAD_CAPACITY) > usize::from(u16::MAX) {
        return Err(DeviceError::ImageTooLarge(image.len()));
    }

    let chunks = image.chunks(IMAGE_PAYLOAD_CAPACITY);
    let total = chunks.len();

    let packets = chunks
        .enumerate()
        .map(|(page, chunk)| {
            let mut payload = chunk.to_vec();
            payload.resize(IMAGE_PAYLOAD_CAPACITY, 0);
            ImagePacket {
                report_id: IMAGE_REPORT_ID,
                command: SET_ICON_COMMAND,
                key_index,
                is_last_packet: page + 1 == total,
                byte_count: chunk.len() as u16,
                page_index: page as u16,
                payload,
            }
        })
        .collect();

    Ok(packets)
}

fn feature_report(bytes: &[u8]) -> Vec<u8> {
    let mut report = vec![0u8; FEATURE_REPORT_LENGTH];
    report[..bytes.len()].copy_from_slice(bytes);
    report
}

/// Feature report that resets the deck to its logo screen
pub fn reset_report() -> Vec<u8> {
    feature_report(&[CONTROL_REPORT_ID, RESET_COMMAND])
}

/// Feature report setting backlight brightness, clamped to 0..=100
pub fn brightness_report(percent: u8) -> Vec<u8> {
    feature_report(&[CONTROL_REPORT_ID, BRIGHTNESS_COMMAND, percent.min(100)])
}

/// Extract NUL-terminated text from a feature response
pub fn decode_feature_text(response: &[u8], offset: usize) -> String {
    let text = response.get(offset..).unwrap_or_default();
    let end = text.iter().position(|&b| b == 0).unwrap_or(text.len());
    String::from_utf8_lossy(&text[..end]).trim().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn report_with(pressed: &[usize]) -> Vec<u8> {
        let mut report = vec![0u8; INPUT_REPORT_LENGTH];
        report[0] = 0x01;
        for &key in pressed {
            report[KEY_STATE_OFFSET + key] = 1;
        }
        report
    }

    #[test]
    fn test_identical_reports_produce_no_edges() {
        let mut keys = KeyStates::default();
        let report = report_with(&[3, 7]);

        assert_eq!(keys.apply_report(&report).len(), 2);
        assert!(keys.apply_report(&report).is_empty());
        assert!(keys.apply_report(&report).is_empty());
    }

    #[test]
    fn test_single_flip_produces_single_edge() {
        let mut keys = KeyStates::default();
        keys.apply_report(&report_with(&[]));

        let edges = keys.apply_report(&report_with(&[5]));
        assert_eq!(
            edges,
            vec![KeyEdgeEvent {
                key_index: 5,
                pressed: true
            }]
        );
        assert!(keys.is_pressed(5));

        let edges = keys.apply_report(&report_with(&[]));
        assert_eq!(
            edges,
            vec![KeyEdgeEvent {
                key_index: 5,
                pressed: false
            }]
        );
    }

    #[test]
    fn test_edges_in_ascending_key_order() {
        let mut keys = KeyStates::default();
        let edges = keys.apply_report(&report_with(&[14, 0, 9]));
        let order: Vec<u8> = edges.iter().map(|e| e.key_index).collect();
        assert_eq!(order, vec![0, 9, 14]);
    }

    #[test]
    fn test_short_report_ignored() {
        let mut keys = KeyStates::default();
        assert!(keys.apply_report(&[1, 0, 0, 0, 1]).is_empty());
        assert!(!keys.is_pressed(0));
    }

    #[test]
    fn test_image_packet_split() {
        let size = IMAGE_PAYLOAD_CAPACITY * 2 + 100;
        let image: Vec<u8> = (0..size).map(|i| (i % 251) as u8).collect();

        let packets = image_packets(4, &image).unwrap();
        assert_eq!(packets.len(), 3);

        for (i, packet) in packets.iter().enumerate() {
            assert_eq!(packet.page_index as usize, i);
            assert_eq!(packet.key_index, 4);
            assert_eq!(packet.payload.len(), IMAGE_PAYLOAD_CAPACITY);
        }
        assert!(!packets[0].is_last_packet);
        assert!(!packets[1].is_last_packet);
        assert_eq!(packets[0].byte_count as usize, IMAGE_PAYLOAD_CAPACITY);
        assert!(packets[2].is_last_packet);
        assert_eq!(packets[2].byte_count, 100);
        assert_eq!(&packets[2].payload[..100], &image[IMAGE_PAYLOAD_CAPACITY * 2..]);
        assert!(packets[2].payload[100..].iter().all(|&b| b == 0));
    }

    #[test]
    fn test_exact_multiple_has_full_last_packet() {
        let image = vec![0xAB; IMAGE_PAYLOAD_CAPACITY];
        let packets = image_packets(0, &image).unwrap();
        assert_eq!(packets.len(), 1);
        assert!(packets[0].is_last_packet);
        assert_eq!(packets[0].byte_count as usize, IMAGE_PAYLOAD_CAPACITY);
    }

    #[test]
    fn test_empty_image_rejected() {
        assert!(matches!(image_packets(0, &[]), Err(DeviceError::EmptyImage)));
    }

    #[test]
    fn test_report_header_layout() {
        let image = vec![0x11; IMAGE_PAYLOAD_CAPACITY + 0x0102];
        let packets = image_packets(9, &image).unwrap();
        let report = packets[1].to_report();

        assert_eq!(report.len(), IMAGE_REPORT_LENGTH);
        assert_eq!(&report[..8], &[0x02, 0x07, 9, 1, 0x02, 0x01, 0x01, 0x00]);
    }

    #[test]
    fn test_brightness_clamped() {
        let report = brightness_report(250);
        assert_eq!(report.len(), FEATURE_REPORT_LENGTH);
        assert_eq!(&report[..3], &[0x03, 0x08, 100]);
    }

    #[test]
    fn test_decode_feature_text() {
        let mut response = vec![0u8; FEATURE_REPORT_LENGTH];
        response[0] = FIRMWARE_REPORT_ID;
        response[FIRMWARE_TEXT_OFFSET..FIRMWARE_TEXT_OFFSET + 8].copy_from_slice(b"1.05.009");
        assert_eq!(decode_feature_text(&response, FIRMWARE_TEXT_OFFSET), "1.05.009");
        assert_eq!(decode_feature_text(&response, 64), "");
    }
}
