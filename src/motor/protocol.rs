// GM6020 link wire protocol
//
// Command  (client -> motor): [0xA1, ID, torque:f32 LE, XOR]          7 bytes
// Feedback (motor -> client): [0xA0, ID, angle:f32 LE, omega:f32 LE, XOR] 11 bytes
//
// The checksum is the XOR of every byte before it. Streams are resynchronised
// by dropping a single byte whenever a candidate frame fails its checksum.

use std::marker::PhantomData;

/// Motor address on the wire (also the port offset from the base port)
pub type MotorId = u8;

/// Header byte of a command frame
pub const COMMAND_HEADER: u8 = 0xA1;
/// Header byte of a feedback frame
pub const FEEDBACK_HEADER: u8 = 0xA0;

pub const COMMAND_FRAME_LEN: usize = 7;
pub const FEEDBACK_FRAME_LEN: usize = 11;

/// XOR of all bytes in `data`
pub fn xor_checksum(data: &[u8]) -> u8 {
    data.iter().fold(0u8, |acc, &b| acc ^ b)
}

fn f32_at(bytes: &[u8], offset: usize) -> f32 {
    f32::from_le_bytes([
        bytes[offset],
        bytes[offset + 1],
        bytes[offset + 2],
        bytes[offset + 3],
    ])
}

/// A fixed-size, header-prefixed, XOR-terminated frame
pub trait Frame: Sized {
    const HEADER: u8;
    const LEN: usize;

    /// Build the frame from `LEN` bytes whose header and checksum are already verified
    fn from_verified(bytes: &[u8]) -> Self;
}

/// Torque command sent to a motor
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CommandFrame {
    pub motor_id: MotorId,
    pub torque: f32,
}

impl CommandFrame {
    pub fn new(motor_id: MotorId, torque: f32) -> Self {
        Self { motor_id, torque }
    }

    pub fn encode(&self) -> [u8; COMMAND_FRAME_LEN] {
        let mut packet = [0u8; COMMAND_FRAME_LEN];
        packet[0] = COMMAND_HEADER;
        packet[1] = self.motor_id;
        packet[2..6].copy_from_slice(&self.torque.to_le_bytes());
        packet[6] = xor_checksum(&packet[..6]);
        packet
    }
}

impl Frame for CommandFrame {
    const HEADER: u8 = COMMAND_HEADER;
    const LEN: usize = COMMAND_FRAME_LEN;

    fn from_verified(bytes: &[u8]) -> Self {
        Self {
            motor_id: bytes[1],
            torque: f32_at(bytes, 2),
        }
    }
}

/// Telemetry reported by a motor
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FeedbackFrame {
    pub motor_id: MotorId,
    /// Rotor angle in degrees
    pub angle: f32,
    /// Angular velocity in rad/s
    pub omega: f32,
}

impl FeedbackFrame {
    pub fn new(motor_id: MotorId, angle: f32, omega: f32) -> Self {
        Self {
            motor_id,
            angle,
            omega,
        }
    }

    pub fn encode(&self) -> [u8; FEEDBACK_FRAME_LEN] {
        let mut packet = [0u8; FEEDBACK_FRAME_LEN];
        packet[0] = FEEDBACK_HEADER;
        packet[1] = self.motor_id;
        packet[2..6].copy_from_slice(&self.angle.to_le_bytes());
        packet[6..10].copy_from_slice(&self.omega.to_le_bytes());
        packet[10] = xor_checksum(&packet[..10]);
        packet
    }
}

impl Frame for FeedbackFrame {
    const HEADER: u8 = FEEDBACK_HEADER;
    const LEN: usize = FEEDBACK_FRAME_LEN;

    fn from_verified(bytes: &[u8]) -> Self {
        Self {
            motor_id: bytes[1],
            angle: f32_at(bytes, 2),
            omega: f32_at(bytes, 6),
        }
    }
}

/// Encode a torque command for `motor_id`
pub fn encode_command(motor_id: MotorId, torque: f32) -> [u8; COMMAND_FRAME_LEN] {
    CommandFrame::new(motor_id, torque).encode()
}

/// Decode every complete frame at the front of `buffer`.
///
/// Returns the frames in stream order and the number of leading bytes that
/// were consumed (valid frames plus discarded garbage). Bytes after that
/// point may be the prefix of a frame that has not fully arrived yet.
pub fn decode_frames<F: Frame>(buffer: &[u8]) -> (Vec<F>, usize) {
    let mut frames = Vec::new();
    let mut start = 0;

    while buffer.len() - start >= F::LEN {
        let Some(offset) = buffer[start..].iter().position(|&b| b == F::HEADER) else {
            // No header anywhere; the tail might still begin a frame
            start = buffer.len() - (F::LEN - 1);
            break;
        };

        let pos = start + offset;
        if buffer.len() - pos < F::LEN {
            start = pos;
            break;
        }

        let candidate = &buffer[pos..pos + F::LEN];
        if xor_checksum(&candidate[..F::LEN - 1]) != candidate[F::LEN - 1] {
            // Spurious header inside payload data: skip just this byte
            start = pos + 1;
            continue;
        }

        frames.push(F::from_verified(candidate));
        start = pos + F::LEN;
    }

    (frames, start)
}

/// Decode feedback frames from the front of `buffer`
pub fn decode_feedback(buffer: &[u8]) -> (Vec<FeedbackFrame>, usize) {
    decode_frames(buffer)
}

/// Decode command frames from the front of `buffer` (motor side of the link)
pub fn decode_commands(buffer: &[u8]) -> (Vec<CommandFrame>, usize) {
    decode_frames(buffer)
}

/// Accumulating receive buffer for one direction of the link
pub struct FrameBuffer<F: Frame> {
    data: Vec<u8>,
    discarded: u64,
    _frame: PhantomData<F>,
}

impl<F: Frame> FrameBuffer<F> {
    pub fn new() -> Self {
        Self {
            data: Vec::with_capacity(F::LEN * 16),
            discarded: 0,
            _frame: PhantomData,
        }
    }

    /// Append freshly received bytes and return every frame they complete
    pub fn push(&mut self, bytes: &[u8]) -> Vec<F> {
        self.data.extend_from_slice(bytes);
        let (frames, consumed) = decode_frames::<F>(&self.data);
        self.discarded += (consumed - frames.len() * F::LEN) as u64;
        self.data.drain(..consumed);
        frames
    }

    /// Bytes held back waiting for the rest of a frame
    pub fn residual(&self) -> &[u8] {
        &self.data
    }

    /// Total bytes thrown away while resynchronising
    pub fn discarded(&self) -> u64 {
        self.discarded
    }
}

impl<F: Frame> Default for FrameBuffer<F> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_command_layout() {
        let packet = encode_command(3, 1.5);
        assert_eq!(packet.len(), 7);
        assert_eq!(packet[0], 0xA1);
        assert_eq!(packet[1], 3);
        assert_eq!(&packet[2..6], &1.5f32.to_le_bytes());
        assert_eq!(packet[6], xor_checksum(&packet[..6]));
    }

    #[test]
    fn test_checksum() {
        assert_eq!(xor_checksum(&[]), 0);
        assert_eq!(xor_checksum(&[0xA0, 0x01]), 0xA1);
        assert_eq!(xor_checksum(&[0xFF, 0x0F, 0xF0]), 0x00);
    }

    #[test]
    fn test_feedback_bit_exact() {
        for &(angle, omega) in &[
            (12.5f32, 3.3f32),
            (-0.0, f32::MIN_POSITIVE),
            (359.999, -1.0e-7),
            (f32::MAX, f32::MIN),
        ] {
            let bytes = FeedbackFrame::new(9, angle, omega).encode();
            let (frames, consumed) = decode_feedback(&bytes);
            assert_eq!(consumed, FEEDBACK_FRAME_LEN);
            assert_eq!(frames.len(), 1);
            assert_eq!(frames[0].motor_id, 9);
            assert_eq!(frames[0].angle.to_bits(), angle.to_bits());
            assert_eq!(frames[0].omega.to_bits(), omega.to_bits());
        }
    }

    #[test]
    fn test_resync_after_garbage() {
        let frame = FeedbackFrame::new(0, 12.5, 3.3);
        // Garbage sprinkled with header bytes that never checksum correctly
        for n in 0..64usize {
            let mut stream: Vec<u8> = (0..n)
                .map(|i| if i % 3 == 0 { FEEDBACK_HEADER } else { (i + 1) as u8 })
                .collect();
            stream.extend_from_slice(&frame.encode());

            let mut rx = FrameBuffer::<FeedbackFrame>::new();
            let frames = rx.push(&stream);
            assert_eq!(frames, vec![frame], "garbage prefix of {} bytes", n);
            assert!(rx.residual().is_empty());
        }
    }

    #[test]
    fn test_checksum_rejection_each_bit() {
        let good = FeedbackFrame::new(2, -45.0, 7.25).encode();
        for byte in 1..FEEDBACK_FRAME_LEN - 1 {
            for bit in 0..8 {
                let mut bad = good;
                bad[byte] ^= 1 << bit;
                let (frames, consumed) = decode_feedback(&bad);
                assert!(frames.is_empty(), "byte {} bit {} accepted", byte, bit);
                // Only the header byte is skipped, the rest waits for more data
                assert!(consumed >= 1);
            }
        }
    }

    #[test]
    fn test_mismatch_drops_single_byte() {
        let mut bad = FeedbackFrame::new(1, 1.0, 2.0).encode();
        bad[4] ^= 0x10;
        let mut rx = FrameBuffer::<FeedbackFrame>::new();
        assert!(rx.push(&bad).is_empty());
        assert_eq!(rx.residual(), &bad[1..]);
        assert_eq!(rx.discarded(), 1);
    }

    #[test]
    fn test_header_inside_payload() {
        // angle bytes contain 0xA0, which must not derail decoding
        let angle = f32::from_le_bytes([0xA0, 0x00, 0x20, 0x41]);
        let frame = FeedbackFrame::new(0, angle, 0.5);
        let mut stream = vec![FEEDBACK_HEADER, 0x00, 0xA0];
        stream.extend_from_slice(&frame.encode());
        stream.extend_from_slice(&frame.encode());

        let (frames, consumed) = decode_feedback(&stream);
        assert_eq!(frames, vec![frame, frame]);
        assert_eq!(consumed, stream.len());
    }

    #[test]
    fn test_three_frames_one_read() {
        let a = FeedbackFrame::new(0, 1.0, 10.0);
        let b = FeedbackFrame::new(0, 2.0, 20.0);
        let c = FeedbackFrame::new(1, 3.0, 30.0);
        let stream: Vec<u8> = [a, b, c].iter().flat_map(|f| f.encode()).collect();

        let mut rx = FrameBuffer::<FeedbackFrame>::new();
        assert_eq!(rx.push(&stream), vec![a, b, c]);
        assert!(rx.residual().is_empty());
        assert_eq!(rx.discarded(), 0);
    }

    #[test]
    fn test_partial_frame_carry_over() {
        let frame = FeedbackFrame::new(4, 90.0, -2.5);
        let bytes = frame.encode();

        let mut rx = FrameBuffer::<FeedbackFrame>::new();
        assert!(rx.push(&bytes[..5]).is_empty());
        assert_eq!(rx.residual().len(), 5);
        assert_eq!(rx.push(&bytes[5..]), vec![frame]);
        assert!(rx.residual().is_empty());
    }

    #[test]
    fn test_no_header_keeps_tail() {
        let junk = [0x11u8; 25];
        let (frames, consumed) = decode_feedback(&junk);
        assert!(frames.is_empty());
        assert_eq!(consumed, 25 - (FEEDBACK_FRAME_LEN - 1));
    }

    #[test]
    fn test_short_buffer_untouched() {
        let (frames, consumed) = decode_feedback(&[FEEDBACK_HEADER, 1, 2]);
        assert!(frames.is_empty());
        assert_eq!(consumed, 0);
    }

    #[test]
    fn test_command_stream_decode() {
        let mut stream = vec![0x00, COMMAND_HEADER];
        stream.extend_from_slice(&encode_command(5, -3.75));
        stream.extend_from_slice(&encode_command(5, 0.25)[..3]);

        let mut rx = FrameBuffer::<CommandFrame>::new();
        let frames = rx.push(&stream);
        assert_eq!(frames, vec![CommandFrame::new(5, -3.75)]);
        assert_eq!(rx.residual().len(), 3);
    }
}
