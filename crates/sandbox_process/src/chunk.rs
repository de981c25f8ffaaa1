/// Which underlying stream a chunk came from. In PTY mode every chunk is
/// tagged `Stdout` (`spec.md §4.6`: "all chunks are tagged stdout").
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamTag {
    Stdout,
    Stderr,
}

/// One read's worth of bytes from a single stream. Never split or merged
/// across stream-tag boundaries, so a chunk's `bytes` is always exactly
/// what one underlying `read()` returned.
#[derive(Debug, Clone)]
pub struct Chunk {
    pub tag: StreamTag,
    pub bytes: Vec<u8>,
}

/// An item from `Supervisor::stream`, shaped by its `decode`/
/// `include_stream_tag` arguments.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamItem {
    Bytes(Vec<u8>),
    Text(String),
    TaggedBytes(StreamTag, Vec<u8>),
    TaggedText(StreamTag, String),
}

/// A line from `Supervisor::stream_lines`, always tagged with its
/// originating stream: a line never spans a stream-tag boundary, so
/// dropping the tag would silently interleave stdout and stderr text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Line {
    Bytes(StreamTag, Vec<u8>),
    Text(StreamTag, String),
}
