use super::{Chunks, ChunksError};

#[derive(Debug, PartialEq, Eq)]
pub enum Error {
    ChunksError(ChunksError),
    InvalidPayload,
}

/// A type for reading server-sent events from a chunk stream.
pub struct Sse {
    // Raw bytes are buffered, since a multi-byte character may be split
    // across two chunks.
    buf: Vec<u8>,
    chunks: Chunks,
}

impl Sse {
    #[inline]
    pub fn new(chunks: Chunks) -> Self {
        Self {
            buf: Vec::new(),
            chunks,
        }
    }

    /// Returns the data of the next event, or `None` once the stream ends.
    pub async fn next_event(&mut self) -> Result<Option<String>, Error> {
        loop {
            // Drain complete events in the buffer before reading more.
            if let Some(event) = self.try_parse_event()? {
                return Ok(Some(event));
            }

            let Some(bytes) =
                self.chunks.next_chunk().await.map_err(Error::ChunksError)?
            else {
                return Ok(None);
            };
            self.buf.extend_from_slice(&bytes);
        }
    }

    fn try_parse_event(&mut self) -> Result<Option<String>, Error> {
        loop {
            // For `end-of-line`, we handle line feed and carriage return
            // followed by line feed. Only `data` fields and comments are
            // meaningful to us, other fields are skipped.
            //
            // event         = *( comment / field ) end-of-line
            // comment       = colon *any-char end-of-line
            // field         = 1*name-char [ colon [ space ] *any-char ] end-of-line
            let Some((end, sep_len)) = find_event_end(&self.buf) else {
                return Ok(None);
            };
            let block: Vec<u8> = self.buf.drain(0..end + sep_len).collect();
            let Ok(block) = str::from_utf8(&block[..end]) else {
                return Err(Error::InvalidPayload);
            };

            let mut data: Option<String> = None;
            for line in block.lines() {
                if line.starts_with(':') {
                    continue;
                }
                let Some((name, value)) = line.split_once(':') else {
                    return Err(Error::InvalidPayload);
                };
                let value = value.strip_prefix(' ').unwrap_or(value);
                match name {
                    "data" => {
                        let data = data.get_or_insert_default();
                        if !data.is_empty() {
                            data.push('\n');
                        }
                        data.push_str(value);
                    }
                    "event" | "id" | "retry" => {}
                    _ => return Err(Error::InvalidPayload),
                }
            }

            // A block of comments only (keep-alive), try the next one.
            if let Some(data) = data {
                return Ok(Some(data));
            }
        }
    }
}

fn find_event_end(buf: &[u8]) -> Option<(usize, usize)> {
    let lf = buf.windows(2).position(|w| w == b"\n\n").map(|i| (i, 2));
    let crlf = buf
        .windows(4)
        .position(|w| w == b"\r\n\r\n")
        .map(|i| (i, 4));
    match (lf, crlf) {
        (Some(a), Some(b)) => Some(if a.0 <= b.0 { a } else { b }),
        (a, b) => a.or(b),
    }
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;

    use super::*;

    #[tokio::test]
    async fn test_normal_events() {
        let chunks = Chunks::from_vec_deque(
            vec![
                Bytes::from_static(b"data: hello\n\n"),
                Bytes::from_static(b"data: bye\n\n"),
            ]
            .into(),
        );
        let mut sse = Sse::new(chunks);
        assert_eq!(sse.next_event().await.unwrap().unwrap(), "hello");
        assert_eq!(sse.next_event().await.unwrap().unwrap(), "bye");
        assert_eq!(sse.next_event().await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_quirk_streaming() {
        let chunks = Chunks::from_vec_deque(
            vec![
                Bytes::from_static(b"data:"),
                Bytes::from_static(b" hello\n"),
                Bytes::from_static(b"\n"),
            ]
            .into(),
        );
        let mut sse = Sse::new(chunks);
        assert_eq!(sse.next_event().await.unwrap().unwrap(), "hello");
        assert_eq!(sse.next_event().await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_split_multibyte_character() {
        let text = "data: 你好\n\n".as_bytes();
        let chunks = Chunks::from_vec_deque(
            vec![
                Bytes::copy_from_slice(&text[..8]),
                Bytes::copy_from_slice(&text[8..]),
            ]
            .into(),
        );
        let mut sse = Sse::new(chunks);
        assert_eq!(sse.next_event().await.unwrap().unwrap(), "你好");
    }

    #[tokio::test]
    async fn test_keep_alive_and_crlf() {
        let chunks = Chunks::from_vec_deque(
            vec![
                Bytes::from_static(b": keep-alive\n\n"),
                Bytes::from_static(b"event: message\r\ndata: hi\r\n\r\n"),
            ]
            .into(),
        );
        let mut sse = Sse::new(chunks);
        assert_eq!(sse.next_event().await.unwrap().unwrap(), "hi");
        assert_eq!(sse.next_event().await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_invalid_data() {
        let chunks = Chunks::from_vec_deque(
            vec![Bytes::from_static(b"xxxxxx\n\n")].into(),
        );
        let mut sse = Sse::new(chunks);
        assert_eq!(sse.next_event().await.unwrap_err(), Error::InvalidPayload);

        let chunks = Chunks::from_vec_deque(
            vec![Bytes::from_static(b"xxxxxx\n")].into(),
        );
        let mut sse = Sse::new(chunks);
        assert_eq!(sse.next_event().await.unwrap(), None);

        let chunks = Chunks::from_vec_deque(
            vec![
                Bytes::from_static(b"data: hello\n"),
                Bytes::from_static(b"data: bye\n"),
            ]
            .into(),
        );
        let mut sse = Sse::new(chunks);
        assert_eq!(sse.next_event().await.unwrap(), None);
    }
}
