//! Multipart framing for MJPEG over HTTP.

use bytes::{BufMut, Bytes, BytesMut};
use futures::Stream;

use crate::frame::EncodedFrame;
use crate::publish::Subscription;

pub const BOUNDARY: &str = "frame";

pub fn content_type() -> String {
    format!("multipart/x-mixed-replace; boundary={BOUNDARY}")
}

/// One boundary delimited part carrying a single JPEG.
pub fn part(frame: &EncodedFrame) -> Bytes {
    let header = format!(
        "--{BOUNDARY}\r\nContent-Type: image/jpeg\r\nContent-Length: {}\r\nX-Sequence: {}\r\n\r\n",
        frame.jpeg.len(),
        frame.sequence
    );
    let mut part = BytesMut::with_capacity(header.len() + frame.jpeg.len() + 2);
    part.put_slice(header.as_bytes());
    part.put_slice(&frame.jpeg);
    part.put_slice(b"\r\n");
    part.freeze()
}

/// Turns a subscription into an endless body stream. Ends when the
/// publisher drops the subscriber; the subscription detaches when the
/// stream is dropped, i.e. when the client goes away.
pub fn stream(
    mut subscription: Subscription,
) -> impl Stream<Item = Result<Bytes, std::convert::Infallible>> + Send + 'static {
    async_stream::stream! {
        while let Some(frame) = subscription.recv().await {
            yield Ok(part(&frame));
        }
        tracing::debug!("Preview stream for subscriber {} ended", subscription.id());
    }
}
