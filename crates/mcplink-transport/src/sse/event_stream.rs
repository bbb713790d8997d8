//! [`Stream`] adapter turning byte chunks into [`SseEvent`]s.

use std::pin::Pin;
use std::task::{Context, Poll, ready};
use std::time::Duration;

use bytes::{Buf, BufMut, BytesMut};
use futures::Stream;

use super::parser::{self, BOM, FieldName, LF, Line};
use super::{MESSAGE_EVENT, SseError, SseEvent};

/// Default upper bound on the size of one record.
pub const DEFAULT_MAX_RECORD_SIZE: usize = 16 * 1024 * 1024;

#[derive(Debug, Default)]
struct RecordBuilder {
    event: Option<String>,
    data: Option<String>,
    id: Option<String>,
    retry: Option<Duration>,
    touched: bool,
}

impl RecordBuilder {
    fn add(&mut self, name: FieldName, value: &[u8], max: usize) -> Result<(), String> {
        if name == FieldName::Ignored {
            return Ok(());
        }
        let value = std::str::from_utf8(value).map_err(|e| format!("invalid UTF-8: {e}"))?;
        self.touched = true;
        match name {
            FieldName::Event => self.event = Some(value.to_owned()),
            FieldName::Data => {
                let len = self.data.as_ref().map_or(0, |d| d.len() + 1);
                if len + value.len() > max {
                    return Err(format!("record exceeds {max} bytes"));
                }
                match &mut self.data {
                    Some(data) => {
                        data.push('\n');
                        data.push_str(value);
                    }
                    None => self.data = Some(value.to_owned()),
                }
            }
            FieldName::Id => {
                if !value.contains('\0') {
                    self.id = Some(value.to_owned());
                }
            }
            FieldName::Retry => {
                if let Ok(ms) = value.parse::<u64>() {
                    self.retry = Some(Duration::from_millis(ms));
                }
            }
            FieldName::Ignored => {}
        }
        Ok(())
    }

    /// Finish the record. Records without data lines dispatch nothing but
    /// may still move the last event ID.
    fn dispatch(&mut self, last_event_id: &mut Option<String>) -> Option<SseEvent> {
        let record = std::mem::take(self);
        let id = record.id.filter(|id| !id.is_empty());
        if let Some(id) = &id {
            *last_event_id = Some(id.clone());
        }
        let data = record.data?;
        Some(SseEvent {
            id,
            event: record
                .event
                .filter(|e| !e.is_empty())
                .unwrap_or_else(|| MESSAGE_EVENT.to_owned()),
            data,
            retry: record.retry,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ReadState {
    NotStarted,
    Started,
    /// The byte source ended; buffered records are still being dispatched.
    Draining,
    /// Nothing more is yielded.
    Done,
}

pin_project_lite::pin_project! {
    /// A [`Stream`] of SSE records over a stream of byte chunks.
    ///
    /// Handles BOM detection, LF / CR / CRLF line endings, comments, multi-line
    /// data and the default `message` event name.
    ///
    /// A malformed record (invalid UTF-8, oversized, or unterminated when the
    /// byte source ends) yields one [`SseError::Malformed`] and the reader
    /// moves on to the next record. A failure of the byte source yields
    /// [`SseError::Transport`] and ends the stream.
    #[derive(Debug)]
    pub struct EventStream<S> {
        #[pin]
        stream: S,
        buffer: BytesMut,
        builder: RecordBuilder,
        state: ReadState,
        skipping: bool,
        last_event_id: Option<String>,
        max_record_size: usize,
    }
}

impl<S> EventStream<S> {
    /// Wrap a byte stream.
    pub fn new(stream: S) -> Self {
        Self {
            stream,
            buffer: BytesMut::new(),
            builder: RecordBuilder::default(),
            state: ReadState::NotStarted,
            skipping: false,
            last_event_id: None,
            max_record_size: DEFAULT_MAX_RECORD_SIZE,
        }
    }

    /// Seed the last event ID, e.g. when this stream resumes an earlier one.
    #[must_use]
    pub fn with_last_event_id(mut self, id: Option<String>) -> Self {
        self.last_event_id = id;
        self
    }

    /// Bound the size of a single record.
    #[must_use]
    pub fn with_max_record_size(mut self, max: usize) -> Self {
        self.max_record_size = max;
        self
    }

    /// The most recent non-empty event ID seen on this stream.
    #[must_use]
    pub fn last_event_id(&self) -> Option<&str> {
        self.last_event_id.as_deref()
    }
}

/// Parse complete lines out of `buffer` until a record is ready.
fn drain(
    buffer: &mut BytesMut,
    builder: &mut RecordBuilder,
    skipping: &mut bool,
    last_event_id: &mut Option<String>,
    max: usize,
) -> Option<Result<SseEvent, String>> {
    while let Some(line) = parser::next_line(buffer) {
        match parser::classify(&line) {
            Line::Empty => {
                if std::mem::take(skipping) {
                    *builder = RecordBuilder::default();
                } else if let Some(event) = builder.dispatch(last_event_id) {
                    return Some(Ok(event));
                }
            }
            _ if *skipping => {}
            Line::Comment => {}
            Line::Field { name, value } => {
                if let Err(reason) = builder.add(name, value, max) {
                    *skipping = true;
                    *builder = RecordBuilder::default();
                    return Some(Err(reason));
                }
            }
        }
    }
    // A line longer than the limit would otherwise grow the buffer forever.
    if buffer.len() > max {
        buffer.clear();
        if !*skipping {
            *skipping = true;
            *builder = RecordBuilder::default();
            return Some(Err(format!("record exceeds {max} bytes")));
        }
    }
    None
}

impl<S, E, B> Stream for EventStream<S>
where
    S: Stream<Item = Result<B, E>>,
    B: AsRef<[u8]>,
{
    type Item = Result<SseEvent, SseError<E>>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let mut this = self.project();

        loop {
            if *this.state != ReadState::NotStarted {
                if let Some(item) = drain(
                    this.buffer,
                    this.builder,
                    this.skipping,
                    this.last_event_id,
                    *this.max_record_size,
                ) {
                    return Poll::Ready(Some(item.map_err(|reason| SseError::Malformed { reason })));
                }
            }

            match *this.state {
                ReadState::Done => return Poll::Ready(None),
                ReadState::Draining => {
                    let unterminated = this.builder.touched && !*this.skipping;
                    *this.builder = RecordBuilder::default();
                    *this.skipping = false;
                    *this.state = ReadState::Done;
                    if unterminated {
                        return Poll::Ready(Some(Err(SseError::Malformed {
                            reason: "unterminated record at end of stream".to_string(),
                        })));
                    }
                    return Poll::Ready(None);
                }
                ReadState::NotStarted | ReadState::Started => {}
            }

            match ready!(this.stream.as_mut().poll_next(cx)) {
                Some(Ok(chunk)) => {
                    let chunk = chunk.as_ref();
                    if chunk.is_empty() {
                        continue;
                    }
                    this.buffer.extend_from_slice(chunk);
                    if *this.state == ReadState::NotStarted {
                        match parser::starts_with_bom(this.buffer) {
                            Some(true) => {
                                this.buffer.advance(BOM.len());
                                *this.state = ReadState::Started;
                            }
                            Some(false) => *this.state = ReadState::Started,
                            None => {}
                        }
                    }
                }
                Some(Err(e)) => {
                    *this.state = ReadState::Done;
                    this.buffer.clear();
                    *this.builder = RecordBuilder::default();
                    return Poll::Ready(Some(Err(SseError::Transport(e))));
                }
                None => {
                    *this.state = ReadState::Draining;
                    // The last line may lack a terminator, or end in a lone CR.
                    if !this.buffer.is_empty() {
                        this.buffer.put_u8(LF);
                    }
                }
            }
        }
    }
}
