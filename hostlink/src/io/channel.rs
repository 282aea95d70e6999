//! Length-prefixed message channel.
//!
//! ## Wire format
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────┐
//! │  1-5 bytes: body length, 7-bit groups, low group first   │
//! │             (high bit set = more length bytes follow)    │
//! ├──────────────────────────────────────────────────────────┤
//! │  N bytes: UTF-8 message text                             │
//! └──────────────────────────────────────────────────────────┘
//! ```
//!
//! The header and body are assembled into one buffer and written with a single
//! `write_all` + `flush` under the writer lock, so concurrent senders can never
//! interleave partial frames.

use std::io::{self, Read, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use tracing::{debug, trace, warn};

use crate::error::CommunicationError;

/// Default upper bound for a single frame body.
pub const DEFAULT_MAX_FRAME_BYTES: usize = 64 * 1024 * 1024;

const MAX_LENGTH_PREFIX_BYTES: usize = 5;

/// Callback raised for every decoded frame.
pub type MessageCallback = Arc<dyn Fn(&str) + Send + Sync>;

/// A bidirectional, message-oriented channel to one peer.
pub trait CommunicationChannel: Send + Sync {
    /// Frame and send `data`.
    fn send(&self, data: &str) -> Result<(), CommunicationError>;

    /// Replace the message-arrived subscriber. `None` unsubscribes.
    fn set_message_received(&self, callback: Option<MessageCallback>);
}

/// Encode `len` as a 7-bit variable-length integer.
pub fn encode_length(mut len: u32, out: &mut Vec<u8>) {
    loop {
        let mut byte = (len & 0x7f) as u8;
        len >>= 7;
        if len != 0 {
            byte |= 0x80;
        }
        out.push(byte);
        if len == 0 {
            break;
        }
    }
}

/// Write one frame holding `data`.
pub fn write_frame<W: Write>(writer: &mut W, data: &str) -> Result<(), CommunicationError> {
    let body = data.as_bytes();
    let len = u32::try_from(body.len()).map_err(|_| CommunicationError::FrameTooLarge {
        size: body.len(),
        max: u32::MAX as usize,
    })?;
    let mut frame = Vec::with_capacity(body.len() + MAX_LENGTH_PREFIX_BYTES);
    encode_length(len, &mut frame);
    frame.extend_from_slice(body);
    writer.write_all(&frame).map_err(CommunicationError::Send)?;
    writer.flush().map_err(CommunicationError::Send)
}

/// Read one frame.
///
/// Returns `Ok(None)` when the stream ends cleanly before the first header
/// byte; an end of stream anywhere inside a frame is an error.
pub fn read_frame<R: Read>(
    reader: &mut R,
    max_frame_bytes: usize,
) -> Result<Option<String>, CommunicationError> {
    let mut len: u32 = 0;
    let mut shift = 0u32;
    for index in 0..MAX_LENGTH_PREFIX_BYTES {
        let mut byte = [0u8; 1];
        match reader.read_exact(&mut byte) {
            Ok(()) => {}
            Err(err) if err.kind() == io::ErrorKind::UnexpectedEof && index == 0 => return Ok(None),
            Err(err) => return Err(CommunicationError::Receive(err)),
        }
        let group = u32::from(byte[0] & 0x7f);
        if index == MAX_LENGTH_PREFIX_BYTES - 1 && (byte[0] & 0x80 != 0 || group > 0x0f) {
            return Err(CommunicationError::InvalidFrame(
                "length prefix overflows u32".to_string(),
            ));
        }
        len |= group << shift;
        shift += 7;
        if byte[0] & 0x80 == 0 {
            break;
        }
    }

    let len = len as usize;
    if len > max_frame_bytes {
        return Err(CommunicationError::FrameTooLarge {
            size: len,
            max: max_frame_bytes,
        });
    }

    let mut body = vec![0u8; len];
    reader
        .read_exact(&mut body)
        .map_err(CommunicationError::Receive)?;
    String::from_utf8(body)
        .map(Some)
        .map_err(|err| CommunicationError::InvalidFrame(format!("frame is not UTF-8: {err}")))
}

/// [`CommunicationChannel`] over any reader/writer pair.
///
/// Reads happen on whichever thread drives [`Self::notify_data_available`];
/// only one read is outstanding at a time.
pub struct LengthPrefixChannel {
    reader: Mutex<Option<Box<dyn Read + Send>>>,
    writer: Mutex<Option<Box<dyn Write + Send>>>,
    on_message: RwLock<Option<MessageCallback>>,
    disposed: AtomicBool,
    max_frame_bytes: usize,
}

impl LengthPrefixChannel {
    pub fn new<R, W>(reader: R, writer: W, max_frame_bytes: usize) -> Self
    where
        R: Read + Send + 'static,
        W: Write + Send + 'static,
    {
        Self {
            reader: Mutex::new(Some(Box::new(reader))),
            writer: Mutex::new(Some(Box::new(writer))),
            on_message: RwLock::new(None),
            disposed: AtomicBool::new(false),
            max_frame_bytes,
        }
    }

    /// Block until one frame arrives and return it without dispatching.
    pub fn receive(&self) -> Result<String, CommunicationError> {
        if self.disposed.load(Ordering::Acquire) {
            return Err(CommunicationError::Disposed);
        }
        let mut guard = self
            .reader
            .lock()
            .map_err(|_| CommunicationError::Disposed)?;
        let reader = guard.as_mut().ok_or(CommunicationError::Disposed)?;
        match read_frame(reader, self.max_frame_bytes)? {
            Some(data) => {
                trace!(bytes = data.len(), "frame received");
                Ok(data)
            }
            None => Err(CommunicationError::PeerClosed),
        }
    }

    /// Read one frame and raise message-arrived on the calling thread.
    ///
    /// Reads even without a subscriber: on sockets a peer disconnect is only
    /// observable by attempting a read.
    pub fn notify_data_available(&self) -> Result<(), CommunicationError> {
        let data = self.receive()?;
        let callback = self
            .on_message
            .read()
            .ok()
            .and_then(|guard| guard.as_ref().map(Arc::clone));
        match callback {
            Some(callback) => callback(&data),
            None => debug!("no subscriber for received message"),
        }
        Ok(())
    }

    /// Release reader and writer. Idempotent.
    pub fn dispose(&self) {
        if self.disposed.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Ok(mut writer) = self.writer.lock() {
            writer.take();
        }
        // A blocked reader keeps its lock; the stream owner unblocks it by shutting down the socket.
        if let Ok(mut reader) = self.reader.try_lock() {
            reader.take();
        }
        if let Ok(mut on_message) = self.on_message.write() {
            on_message.take();
        }
    }
}

impl CommunicationChannel for LengthPrefixChannel {
    fn send(&self, data: &str) -> Result<(), CommunicationError> {
        if self.disposed.load(Ordering::Acquire) {
            return Err(CommunicationError::Disposed);
        }
        let mut guard = self
            .writer
            .lock()
            .map_err(|_| CommunicationError::Disposed)?;
        let writer = guard.as_mut().ok_or(CommunicationError::Disposed)?;
        if let Err(err) = write_frame(writer, data) {
            warn!(err = %err, "send failed, invalidating channel");
            guard.take();
            return Err(err);
        }
        trace!(bytes = data.len(), "frame sent");
        Ok(())
    }

    fn set_message_received(&self, callback: Option<MessageCallback>) {
        if let Ok(mut on_message) = self.on_message.write() {
            *on_message = callback;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn frame_bytes(data: &str) -> Vec<u8> {
        let mut out = Vec::new();
        write_frame(&mut out, data).expect("write frame");
        out
    }

    #[test]
    fn short_messages_use_one_length_byte() {
        let bytes = frame_bytes("hello");
        assert_eq!(bytes[0], 5);
        assert_eq!(&bytes[1..], b"hello");
    }

    #[test]
    fn long_messages_use_continuation_bytes() {
        let text = "x".repeat(300);
        let bytes = frame_bytes(&text);
        assert_eq!(&bytes[..2], &[0xac, 0x02]);
        assert_eq!(bytes.len(), 302);
    }

    #[test]
    fn length_counts_utf8_bytes_not_chars() {
        let bytes = frame_bytes("é");
        assert_eq!(bytes[0], 2);
    }

    #[test]
    fn reads_consecutive_frames_then_clean_eof() {
        let mut stream = frame_bytes("one");
        stream.extend(frame_bytes(&"two".repeat(100)));
        let mut cursor = Cursor::new(stream);

        let first = read_frame(&mut cursor, DEFAULT_MAX_FRAME_BYTES).expect("first");
        assert_eq!(first.as_deref(), Some("one"));
        let second = read_frame(&mut cursor, DEFAULT_MAX_FRAME_BYTES).expect("second");
        assert_eq!(second, Some("two".repeat(100)));
        let end = read_frame(&mut cursor, DEFAULT_MAX_FRAME_BYTES).expect("eof");
        assert_eq!(end, None);
    }

    #[test]
    fn truncated_body_is_an_error() {
        let mut bytes = frame_bytes("hello");
        bytes.truncate(3);
        let err = read_frame(&mut Cursor::new(bytes), DEFAULT_MAX_FRAME_BYTES).unwrap_err();
        assert!(matches!(err, CommunicationError::Receive(_)));
    }

    #[test]
    fn oversized_frame_is_rejected_before_allocation() {
        let bytes = frame_bytes(&"y".repeat(64));
        let err = read_frame(&mut Cursor::new(bytes), 16).unwrap_err();
        assert!(matches!(err, CommunicationError::FrameTooLarge { size: 64, max: 16 }));
    }

    #[test]
    fn overflowing_prefix_is_rejected() {
        let bytes = vec![0xff, 0xff, 0xff, 0xff, 0x7f];
        let err = read_frame(&mut Cursor::new(bytes), usize::MAX).unwrap_err();
        assert!(matches!(err, CommunicationError::InvalidFrame(_)));
    }

    #[test]
    fn invalid_utf8_is_rejected() {
        let bytes = vec![2, 0xc3, 0x28];
        let err = read_frame(&mut Cursor::new(bytes), DEFAULT_MAX_FRAME_BYTES).unwrap_err();
        assert!(matches!(err, CommunicationError::InvalidFrame(_)));
    }

    #[test]
    fn channel_dispatches_to_subscriber_and_reports_peer_close() {
        let mut input = frame_bytes("first");
        input.extend(frame_bytes("second"));
        let channel = LengthPrefixChannel::new(Cursor::new(input), Vec::new(), DEFAULT_MAX_FRAME_BYTES);

        // Unsubscribed reads still consume frames.
        channel.notify_data_available().expect("unsubscribed read");

        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        channel.set_message_received(Some(Arc::new(move |data: &str| {
            sink.lock().expect("lock").push(data.to_string());
        })));
        channel.notify_data_available().expect("subscribed read");

        let err = channel.notify_data_available().unwrap_err();
        assert!(matches!(err, CommunicationError::PeerClosed));
        assert_eq!(*seen.lock().expect("lock"), vec!["second".to_string()]);
    }

    #[test]
    fn dispose_is_idempotent_and_blocks_further_use() {
        let channel = LengthPrefixChannel::new(Cursor::new(Vec::new()), Vec::new(), DEFAULT_MAX_FRAME_BYTES);
        channel.dispose();
        channel.dispose();
        assert!(matches!(channel.send("x"), Err(CommunicationError::Disposed)));
        assert!(matches!(channel.receive(), Err(CommunicationError::Disposed)));
    }

    struct FailingWriter;

    impl Write for FailingWriter {
        fn write(&mut self, _buf: &[u8]) -> io::Result<usize> {
            Err(io::Error::new(io::ErrorKind::BrokenPipe, "peer gone"))
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn failed_send_invalidates_writer() {
        let channel = LengthPrefixChannel::new(Cursor::new(Vec::new()), FailingWriter, DEFAULT_MAX_FRAME_BYTES);
        let err = channel.send("x").unwrap_err();
        assert!(matches!(err, CommunicationError::Send(_)));
        assert!(matches!(channel.send("x"), Err(CommunicationError::Disposed)));
    }
}
