//! `Stream` adapters over [`Supervisor::next_chunk`](crate::Supervisor::next_chunk)'s
//! channel, backing `stream`/`stream_lines` (`spec.md §4.6`).

use std::collections::VecDeque;
use std::pin::Pin;
use std::task::{Context, Poll};

use tokio::sync::mpsc;
use tokio_stream::Stream;

use crate::chunk::{Chunk, Line, StreamItem, StreamTag};

fn decode_bytes(bytes: &[u8]) -> String {
    String::from_utf8_lossy(bytes).into_owned()
}

fn wrap_chunk(chunk: Chunk, decode: bool, include_stream_tag: bool) -> StreamItem {
    match (decode, include_stream_tag) {
        (false, false) => StreamItem::Bytes(chunk.bytes),
        (true, false) => StreamItem::Text(decode_bytes(&chunk.bytes)),
        (false, true) => StreamItem::TaggedBytes(chunk.tag, chunk.bytes),
        (true, true) => StreamItem::TaggedText(chunk.tag, decode_bytes(&chunk.bytes)),
    }
}

fn make_line(tag: StreamTag, bytes: Vec<u8>, decode: bool) -> Line {
    if decode {
        Line::Text(tag, decode_bytes(&bytes))
    } else {
        Line::Bytes(tag, bytes)
    }
}

/// The lazy, finite, non-restartable chunk sequence behind `stream`.
pub struct ChunkStream<'a> {
    rx: &'a mut mpsc::UnboundedReceiver<Chunk>,
    decode: bool,
    include_stream_tag: bool,
}

impl<'a> ChunkStream<'a> {
    pub(crate) fn new(
        rx: &'a mut mpsc::UnboundedReceiver<Chunk>,
        decode: bool,
        include_stream_tag: bool,
    ) -> Self {
        Self {
            rx,
            decode,
            include_stream_tag,
        }
    }
}

impl Stream for ChunkStream<'_> {
    type Item = StreamItem;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        this.rx
            .poll_recv(cx)
            .map(|chunk| chunk.map(|c| wrap_chunk(c, this.decode, this.include_stream_tag)))
    }
}

/// The lazy line sequence behind `stream_lines`. Coalesces partial reads
/// across chunks, buffering stdout and stderr independently so a line
/// never mixes bytes from the two streams, then emits each stream's
/// trailing partial once both readers have closed.
pub struct LineStream<'a> {
    rx: &'a mut mpsc::UnboundedReceiver<Chunk>,
    decode: bool,
    stdout_buf: Vec<u8>,
    stderr_buf: Vec<u8>,
    pending: VecDeque<Line>,
    closed: bool,
}

impl<'a> LineStream<'a> {
    pub(crate) fn new(rx: &'a mut mpsc::UnboundedReceiver<Chunk>, decode: bool) -> Self {
        Self {
            rx,
            decode,
            stdout_buf: Vec::new(),
            stderr_buf: Vec::new(),
            pending: VecDeque::new(),
            closed: false,
        }
    }

    fn buf_for(&mut self, tag: StreamTag) -> &mut Vec<u8> {
        match tag {
            StreamTag::Stdout => &mut self.stdout_buf,
            StreamTag::Stderr => &mut self.stderr_buf,
        }
    }

    fn ingest(&mut self, chunk: Chunk) {
        let tag = chunk.tag;
        self.buf_for(tag).extend_from_slice(&chunk.bytes);
        loop {
            let buf = self.buf_for(tag);
            let Some(newline_at) = buf.iter().position(|&b| b == b'\n') else {
                break;
            };
            let mut line = buf.drain(..=newline_at).collect::<Vec<u8>>();
            line.pop();
            self.pending.push_back(make_line(tag, line, self.decode));
        }
    }

    fn flush_trailing(&mut self) {
        for tag in [StreamTag::Stdout, StreamTag::Stderr] {
            let buf = std::mem::take(self.buf_for(tag));
            if !buf.is_empty() {
                self.pending.push_back(make_line(tag, buf, self.decode));
            }
        }
    }
}

impl Stream for LineStream<'_> {
    type Item = Line;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        loop {
            if let Some(line) = this.pending.pop_front() {
                return Poll::Ready(Some(line));
            }
            if this.closed {
                return Poll::Ready(None);
            }
            match this.rx.poll_recv(cx) {
                Poll::Ready(Some(chunk)) => this.ingest(chunk),
                Poll::Ready(None) => {
                    this.closed = true;
                    this.flush_trailing();
                }
                Poll::Pending => return Poll::Pending,
            }
        }
    }
}
