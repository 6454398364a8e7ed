//! Canonical completion stream and the line pump shared by every adapter.

use futures::StreamExt;
use plugmyai_core::CompletionChunk;
use tokio::io::AsyncRead;
use tokio::sync::mpsc;
use tokio_util::codec::{AnyDelimiterCodec, AnyDelimiterCodecError, FramedRead};
use tokio_util::sync::{CancellationToken, DropGuard};
use tracing::debug;

/// Capacity of the queue between an adapter's pump and the consumer.
pub const STREAM_CAPACITY: usize = 32;

/// Longest backend output line accepted before the stream fails.
pub const MAX_LINE_BYTES: usize = 1024 * 1024;

/// Ordered chunks of one completion.
///
/// Yields zero or more deltas and then exactly one terminal chunk, after
/// which [`CompletionStream::next`] returns `None`. Dropping the stream
/// cancels the request.
pub struct CompletionStream {
    rx: mpsc::Receiver<CompletionChunk>,
    cancel: CancellationToken,
    finished: bool,
    _guard: DropGuard,
}

impl CompletionStream {
    /// Create a stream bound to a child of `parent`, plus the sender used by
    /// the producing pump.
    pub fn channel(parent: &CancellationToken) -> (ChunkSender, CompletionStream) {
        let cancel = parent.child_token();
        let (tx, rx) = mpsc::channel(STREAM_CAPACITY);
        let sender = ChunkSender {
            tx,
            cancel: cancel.clone(),
        };
        let stream = CompletionStream {
            rx,
            _guard: cancel.clone().drop_guard(),
            cancel,
            finished: false,
        };
        (sender, stream)
    }

    pub async fn next(&mut self) -> Option<CompletionChunk> {
        if self.finished {
            return None;
        }
        let chunk = match self.rx.recv().await {
            Some(chunk) => chunk,
            None if self.cancel.is_cancelled() => CompletionChunk::error("request cancelled"),
            None => CompletionChunk::error("backend stream ended without a terminal chunk"),
        };
        if chunk.is_terminal() {
            self.finished = true;
            self.rx.close();
        }
        Some(chunk)
    }

    /// Stop the backend. The next pull yields an error terminal unless one
    /// was already queued.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }
}

/// Producer half of a [`CompletionStream`].
pub struct ChunkSender {
    tx: mpsc::Sender<CompletionChunk>,
    cancel: CancellationToken,
}

impl ChunkSender {
    /// Queue a chunk, waiting for room. Returns `false` once the request is
    /// cancelled or the consumer is gone.
    pub async fn send(&self, chunk: CompletionChunk) -> bool {
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => false,
            res = self.tx.send(chunk) => res.is_ok(),
        }
    }

    pub async fn cancelled(&self) {
        self.cancel.cancelled().await
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

/// Result of decoding one backend line.
#[derive(Debug, PartialEq)]
pub enum Parsed {
    Chunk(CompletionChunk),
    /// Recognised but carries nothing to emit.
    Empty,
    /// Unparsable or of an unknown kind.
    Skipped,
}

/// How a [`pump_lines`] run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PumpEnd {
    /// A terminal chunk was queued.
    Terminal,
    /// Input ended without a terminal.
    Eof,
    Cancelled,
}

/// Read `reader` line by line, feed non-empty lines to `parse` and forward
/// what it produces until a terminal, EOF or cancellation.
///
/// Lines that are not UTF-8 are skipped like any other unparsable line.
/// Over-long lines and read errors are reported as an error terminal.
pub async fn pump_lines<R, F>(reader: R, sender: &ChunkSender, label: &str, mut parse: F) -> PumpEnd
where
    R: AsyncRead + Unpin,
    F: FnMut(&str) -> Parsed,
{
    let codec = AnyDelimiterCodec::new_with_max_length(b"\n".to_vec(), Vec::new(), MAX_LINE_BYTES);
    let mut lines = FramedRead::new(reader, codec);
    let mut skipped = 0usize;
    let end = loop {
        let next = tokio::select! {
            biased;
            _ = sender.cancelled() => break PumpEnd::Cancelled,
            next = lines.next() => next,
        };
        let line = match next {
            None => break PumpEnd::Eof,
            Some(Ok(line)) => line,
            Some(Err(err)) => {
                let message = match err {
                    AnyDelimiterCodecError::MaxChunkLengthExceeded => {
                        format!("{label}: output line exceeds {MAX_LINE_BYTES} bytes")
                    }
                    AnyDelimiterCodecError::Io(e) => format!("{label}: read failed: {e}"),
                };
                if sender.send(CompletionChunk::error(message)).await {
                    break PumpEnd::Terminal;
                }
                break PumpEnd::Cancelled;
            }
        };
        let Ok(line) = std::str::from_utf8(&line) else {
            skipped += 1;
            continue;
        };
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        match parse(line) {
            Parsed::Chunk(chunk) => {
                let terminal = chunk.is_terminal();
                if !sender.send(chunk).await {
                    break PumpEnd::Cancelled;
                }
                if terminal {
                    break PumpEnd::Terminal;
                }
            }
            Parsed::Empty => {}
            Parsed::Skipped => skipped += 1,
        }
    };
    if skipped > 0 {
        debug!(provider = label, skipped, "skipped unrecognised backend lines");
    }
    end
}

#[cfg(test)]
mod tests {
    use super::*;
    use plugmyai_core::Usage;

    fn parse_plain(line: &str) -> Parsed {
        match line {
            "end" => Parsed::Chunk(CompletionChunk::done(Some(Usage::new(1, 1)))),
            "noise" => Parsed::Skipped,
            "nothing" => Parsed::Empty,
            text => Parsed::Chunk(CompletionChunk::delta(text)),
        }
    }

    #[tokio::test]
    async fn pump_forwards_until_terminal() {
        let root = CancellationToken::new();
        let (tx, mut stream) = CompletionStream::channel(&root);
        let input: &[u8] = b"a\n\nnoise\nnothing\nb\nend\nafter\n";
        let end = pump_lines(input, &tx, "test", parse_plain).await;
        assert_eq!(end, PumpEnd::Terminal);
        drop(tx);

        assert_eq!(stream.next().await, Some(CompletionChunk::delta("a")));
        assert_eq!(stream.next().await, Some(CompletionChunk::delta("b")));
        assert!(matches!(stream.next().await, Some(CompletionChunk::Done { .. })));
        assert_eq!(stream.next().await, None);
    }

    #[tokio::test]
    async fn closed_channel_without_terminal_yields_one_error() {
        let root = CancellationToken::new();
        let (tx, mut stream) = CompletionStream::channel(&root);
        let end = pump_lines(&b"a\n"[..], &tx, "test", parse_plain).await;
        assert_eq!(end, PumpEnd::Eof);
        drop(tx);

        assert_eq!(stream.next().await, Some(CompletionChunk::delta("a")));
        assert_eq!(
            stream.next().await,
            Some(CompletionChunk::error("backend stream ended without a terminal chunk"))
        );
        assert_eq!(stream.next().await, None);
    }

    #[tokio::test]
    async fn overlong_line_is_an_error_terminal() {
        let root = CancellationToken::new();
        let (tx, mut stream) = CompletionStream::channel(&root);
        let mut input = vec![b'x'; MAX_LINE_BYTES + 10];
        input.push(b'\n');
        let end = pump_lines(&input[..], &tx, "test", parse_plain).await;
        assert_eq!(end, PumpEnd::Terminal);
        match stream.next().await {
            Some(CompletionChunk::Error { message }) => assert!(message.contains("exceeds")),
            other => panic!("unexpected chunk: {other:?}"),
        }
    }

    #[tokio::test]
    async fn non_utf8_lines_are_skipped() {
        let root = CancellationToken::new();
        let (tx, mut stream) = CompletionStream::channel(&root);
        let input: &[u8] = b"\xff\xfe garbage\na\r\nend\n";
        let end = pump_lines(input, &tx, "test", parse_plain).await;
        assert_eq!(end, PumpEnd::Terminal);
        assert_eq!(stream.next().await, Some(CompletionChunk::delta("a")));
        assert!(matches!(stream.next().await, Some(CompletionChunk::Done { .. })));
    }

    #[tokio::test]
    async fn dropping_stream_cancels_sender_only() {
        let root = CancellationToken::new();
        let (tx, stream) = CompletionStream::channel(&root);
        assert!(!tx.is_cancelled());
        drop(stream);
        assert!(tx.is_cancelled());
        assert!(!root.is_cancelled());
        assert!(!tx.send(CompletionChunk::delta("late")).await);
    }

    #[tokio::test]
    async fn parent_cancellation_reaches_consumer() {
        let root = CancellationToken::new();
        let (tx, mut stream) = CompletionStream::channel(&root);
        root.cancel();
        assert!(!tx.send(CompletionChunk::delta("x")).await);
        drop(tx);
        assert_eq!(
            stream.next().await,
            Some(CompletionChunk::error("request cancelled"))
        );
    }
}
