//! Relaying of the child's output to our own standard streams.

use std::io::Write;

/// Writes chunks of output to a sink, inserting a prefix at the start of every line. Chunks
/// need not be line-aligned.
pub(crate) struct LinePrefixer<W: Write> {
    prefix: Vec<u8>,
    at_line_start: bool,
    sink: W,
}

impl<W: Write> LinePrefixer<W> {
    pub fn new(prefix: impl Into<Vec<u8>>, sink: W) -> Self {
        Self {
            prefix: prefix.into(),
            at_line_start: true,
            sink,
        }
    }

    /// Writes one chunk, then flushes the sink.
    pub fn write_chunk(&mut self, bytes: &[u8]) -> std::io::Result<()> {
        if self.prefix.is_empty() {
            self.sink.write_all(bytes)?;
            return self.sink.flush();
        }

        for line in bytes.split_inclusive(|b| *b == b'\n') {
            if self.at_line_start {
                self.sink.write_all(&self.prefix)?;
            }
            self.sink.write_all(line)?;
            self.at_line_start = line.ends_with(b"\n");
        }

        self.sink.flush()
    }

    #[cfg(test)]
    fn into_inner(self) -> W {
        self.sink
    }
}

/// Builds an output callback relaying to `sink` with the given line prefix. Write failures
/// (typically a closed pipe on our side) are logged once and further output is dropped.
pub(crate) fn relay<W>(prefix: &str, sink: W, stream: &'static str) -> procpipe_core::OutputCallback
where
    W: Write + Send + 'static,
{
    let mut prefixer = LinePrefixer::new(prefix, sink);
    let mut failed = false;

    Box::new(move |bytes: &[u8]| {
        if failed {
            return;
        }
        if let Err(e) = prefixer.write_chunk(bytes) {
            tracing::warn!("failed to relay child {stream}: {e}");
            failed = true;
        }
    })
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn prefixed(prefix: &str, chunks: &[&str]) -> String {
        let mut prefixer = LinePrefixer::new(prefix, Vec::new());
        for chunk in chunks {
            prefixer.write_chunk(chunk.as_bytes()).unwrap();
        }
        String::from_utf8(prefixer.into_inner()).unwrap()
    }

    #[test]
    fn empty_prefix_passes_through() {
        assert_eq!(prefixed("", &["a\nb", "c\n"]), "a\nbc\n");
    }

    #[test]
    fn prefix_every_line() {
        assert_eq!(prefixed("> ", &["one\ntwo\n"]), "> one\n> two\n");
    }

    #[test]
    fn prefix_survives_chunk_boundaries() {
        assert_eq!(
            prefixed("| ", &["par", "tial\nnext", "\n", "\nlast"]),
            "| partial\n| next\n| \n| last"
        );
    }

    #[test]
    fn empty_chunk_writes_nothing() {
        assert_eq!(prefixed("> ", &[""]), "");
    }
}
