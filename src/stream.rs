use futures::{Stream, StreamExt};
use thiserror::Error;

/// Sentinel payload closing a stream cleanly.
const DONE_SENTINEL: &str = "[DONE]";
/// Sentinel prefix for a mid-stream failure; the detail follows the prefix
/// and one space, so 8 characters are skipped when extracting it.
const ERROR_SENTINEL: &str = "[ERROR]";

const DATA_PREFIX: &str = "data: ";
const FRAME_SEPARATOR: &str = "\n\n";

#[derive(Debug, Error)]
pub enum StreamError {
    #[error("could not reach the backend: {0}")]
    Connect(#[source] reqwest::Error),
    #[error("backend refused the stream: HTTP {0}")]
    Status(reqwest::StatusCode),
    #[error("stream failed: {0}")]
    Protocol(String),
    #[error("connection dropped mid-stream: {0}")]
    Transport(#[source] reqwest::Error),
}

/// One decoded protocol unit extracted from the byte stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamEvent {
    /// Content token, newline escapes already resolved.
    Token(String),
    Done,
    Error(String),
}

/// Incremental frame decoder. Raw bytes go in, complete events come out;
/// partial multi-byte characters and the trailing incomplete frame are held
/// over to the next call, so arbitrary chunk boundaries are safe.
#[derive(Debug, Default)]
pub struct FrameDecoder {
    carry: Vec<u8>,
    text: String,
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, chunk: &[u8]) -> Vec<StreamEvent> {
        self.carry.extend_from_slice(chunk);
        self.decode_carry();
        self.drain_frames()
    }

    /// Moves the maximal decodable prefix of `carry` into `text`. A partial
    /// multi-byte sequence at the tail stays in `carry`; invalid bytes in
    /// the middle become replacement characters.
    fn decode_carry(&mut self) {
        let mut consumed = 0;
        loop {
            match std::str::from_utf8(&self.carry[consumed..]) {
                Ok(valid) => {
                    self.text.push_str(valid);
                    consumed = self.carry.len();
                    break;
                }
                Err(err) => {
                    let valid_up_to = err.valid_up_to();
                    if let Ok(valid) =
                        std::str::from_utf8(&self.carry[consumed..consumed + valid_up_to])
                    {
                        self.text.push_str(valid);
                    }
                    consumed += valid_up_to;
                    match err.error_len() {
                        // Incomplete sequence at the tail: wait for more bytes.
                        None => break,
                        Some(invalid) => {
                            self.text.push(char::REPLACEMENT_CHARACTER);
                            consumed += invalid;
                        }
                    }
                }
            }
        }
        self.carry.drain(..consumed);
    }

    /// Splits off every complete blank-line-delimited frame; the last,
    /// possibly incomplete segment stays buffered.
    fn drain_frames(&mut self) -> Vec<StreamEvent> {
        let mut events = Vec::new();
        while let Some(pos) = self.text.find(FRAME_SEPARATOR) {
            let frame = self.text[..pos].to_owned();
            self.text.replace_range(..pos + FRAME_SEPARATOR.len(), "");
            for line in frame.lines() {
                if let Some(payload) = line.strip_prefix(DATA_PREFIX) {
                    events.push(classify(payload));
                }
            }
        }
        events
    }
}

fn classify(payload: &str) -> StreamEvent {
    if payload == DONE_SENTINEL {
        StreamEvent::Done
    } else if payload.starts_with(ERROR_SENTINEL) {
        let detail = payload.get(ERROR_SENTINEL.len() + 1..).unwrap_or_default();
        StreamEvent::Error(detail.to_string())
    } else {
        StreamEvent::Token(payload.replace("\\n", "\n"))
    }
}

/// Terminal state of one reduced stream. `complete` is true only when the
/// done sentinel was observed; a plain transport EOF leaves it false and
/// the partial answer stands.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamEnd {
    pub answer: String,
    pub complete: bool,
}

/// Drives the read loop over a chunked byte stream, growing the answer one
/// token at a time. `on_update` observes the full accumulated text after
/// every token, in arrival order. Returns at the first terminal event; no
/// further chunks are read after it.
pub async fn reduce<S, B>(
    mut chunks: S,
    mut on_update: impl FnMut(&str),
) -> Result<StreamEnd, StreamError>
where
    S: Stream<Item = Result<B, reqwest::Error>> + Unpin,
    B: AsRef<[u8]>,
{
    let mut decoder = FrameDecoder::new();
    let mut accumulated = String::new();
    while let Some(chunk) = chunks.next().await {
        let chunk = chunk.map_err(StreamError::Transport)?;
        for event in decoder.push(chunk.as_ref()) {
            match event {
                StreamEvent::Token(token) => {
                    accumulated.push_str(&token);
                    on_update(&accumulated);
                }
                StreamEvent::Done => {
                    return Ok(StreamEnd { answer: accumulated, complete: true });
                }
                StreamEvent::Error(detail) => return Err(StreamError::Protocol(detail)),
            }
        }
    }
    Ok(StreamEnd { answer: accumulated, complete: false })
}
