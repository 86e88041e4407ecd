//! Bounded ingestion buffer between the audio producer and boundary detection.
//!
//! The buffer is a FIFO of chunks and end-of-utterance markers guarded by a
//! single mutex. Producers suspend on `writable` when the buffer is full (or
//! fail immediately in [`BackpressureMode::Reject`]); the single reader
//! suspends on `readable` when it is empty.

use crate::config::{AudioFormat, BackpressureMode, BufferConfig, PipelineConfig};
use crate::error::{Result, VoiceError};
use crate::pipeline::messages::{AudioChunk, TranscriptionHint};
use bytes::Bytes;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::Notify;
use tracing::{debug, warn};

/// Items handed to the boundary detector.
#[derive(Debug)]
pub(crate) enum BufferItem {
    Chunk(AudioChunk),
    EndOfUtterance,
}

#[derive(Debug, Default)]
struct BufferState {
    queue: VecDeque<BufferItem>,
    queued_chunks: usize,
    queued_bytes: u64,
    /// Next sequence number handed out by [`AudioChunkBuffer::push_audio`].
    next_seq: u64,
    /// An end marker was queued and no chunk has followed it yet.
    end_signalled: bool,
    closed: bool,
    reader_attached: bool,
}

/// Bounded, thread-safe audio chunk queue.
#[derive(Debug)]
pub struct AudioChunkBuffer {
    state: Mutex<BufferState>,
    readable: Notify,
    writable: Notify,
    capacity_chunks: usize,
    max_bytes: u64,
    mode: BackpressureMode,
}

enum Admission {
    Accepted,
    Full,
}

impl AudioChunkBuffer {
    /// Create a buffer with the given limits.
    pub fn new(config: &BufferConfig, format: &AudioFormat) -> Self {
        Self {
            state: Mutex::new(BufferState::default()),
            readable: Notify::new(),
            writable: Notify::new(),
            capacity_chunks: config.capacity_chunks.max(1),
            max_bytes: format.bytes_for(config.max_buffer_duration()).max(1),
            mode: config.backpressure,
        }
    }

    /// Append a chunk that carries its own sequence number.
    ///
    /// In [`BackpressureMode::Block`] this waits for space; in
    /// [`BackpressureMode::Reject`] it fails when full.
    ///
    /// # Errors
    ///
    /// [`VoiceError::BufferClosed`] after [`close`](Self::close), or
    /// [`VoiceError::BufferOverflow`] when full in reject mode.
    pub async fn push(&self, chunk: AudioChunk) -> Result<()> {
        let len = chunk.len();
        let mut pending = Some(chunk);
        self.admit_with_backpressure(len, |state| {
            if let Some(chunk) = pending.take() {
                state.next_seq = state.next_seq.max(chunk.seq().saturating_add(1));
                state.enqueue(chunk);
            }
        })
        .await
    }

    /// Append a chunk without waiting, regardless of the backpressure mode.
    ///
    /// # Errors
    ///
    /// [`VoiceError::BufferClosed`] or [`VoiceError::BufferOverflow`].
    pub fn try_push(&self, chunk: AudioChunk) -> Result<()> {
        let mut state = self.lock();
        match self.admit(&state, chunk.len())? {
            Admission::Accepted => {
                state.next_seq = state.next_seq.max(chunk.seq().saturating_add(1));
                state.enqueue(chunk);
                drop(state);
                self.readable.notify_one();
                Ok(())
            }
            Admission::Full => Err(self.overflow_error(&state)),
        }
    }

    /// Append raw audio, assigning the next sequence number under the lock so
    /// concurrent producers never interleave out of order.
    ///
    /// Returns the assigned sequence number.
    ///
    /// # Errors
    ///
    /// Same as [`push`](Self::push).
    pub async fn push_audio(&self, data: Bytes, hint: Option<TranscriptionHint>) -> Result<u64> {
        let len = data.len();
        let mut pending = Some((data, hint));
        let mut assigned = 0;
        self.admit_with_backpressure(len, |state| {
            let Some((data, hint)) = pending.take() else {
                return;
            };
            assigned = state.next_seq;
            state.next_seq = state.next_seq.saturating_add(1);
            let chunk = AudioChunk::new(assigned, data);
            state.enqueue(match hint {
                Some(hint) => chunk.with_hint(hint),
                None => chunk,
            });
        })
        .await?;
        Ok(assigned)
    }

    /// Non-blocking variant of [`push_audio`](Self::push_audio).
    ///
    /// # Errors
    ///
    /// [`VoiceError::BufferClosed`] or [`VoiceError::BufferOverflow`].
    pub fn try_push_audio(&self, data: Bytes, hint: Option<TranscriptionHint>) -> Result<u64> {
        let mut state = self.lock();
        match self.admit(&state, data.len())? {
            Admission::Accepted => {
                let seq = state.next_seq;
                state.next_seq = seq.saturating_add(1);
                let chunk = AudioChunk::new(seq, data);
                state.enqueue(match hint {
                    Some(hint) => chunk.with_hint(hint),
                    None => chunk,
                });
                drop(state);
                self.readable.notify_one();
                Ok(seq)
            }
            Admission::Full => Err(self.overflow_error(&state)),
        }
    }

    /// Mark the current utterance as finished. Repeated calls without an
    /// intervening chunk are no-ops.
    ///
    /// # Errors
    ///
    /// [`VoiceError::BufferClosed`] after [`close`](Self::close).
    pub fn signal_end(&self) -> Result<()> {
        let mut state = self.lock();
        if state.closed {
            return Err(VoiceError::BufferClosed);
        }
        if state.end_signalled {
            debug!("end of utterance already signalled");
            return Ok(());
        }
        state.end_signalled = true;
        state.queue.push_back(BufferItem::EndOfUtterance);
        drop(state);
        self.readable.notify_one();
        Ok(())
    }

    /// Close the buffer permanently. Queued items are still delivered.
    pub fn close(&self) {
        let mut state = self.lock();
        if state.closed {
            return;
        }
        state.closed = true;
        drop(state);
        debug!("audio buffer closed");
        self.readable.notify_one();
        self.writable.notify_waiters();
    }

    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }

    /// Number of queued chunks (end markers excluded).
    pub fn len(&self) -> usize {
        self.lock().queued_chunks
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Queued payload bytes.
    pub fn queued_bytes(&self) -> u64 {
        self.lock().queued_bytes
    }

    /// Claim the single reader slot.
    pub(crate) fn attach_reader(&self) -> Result<()> {
        let mut state = self.lock();
        if state.reader_attached {
            return Err(VoiceError::Pipeline(
                "audio input is already attached to a run".into(),
            ));
        }
        state.reader_attached = true;
        Ok(())
    }

    /// Wait for the next item. Returns `None` once closed and drained.
    pub(crate) async fn next_item(&self) -> Option<BufferItem> {
        loop {
            let readable = self.readable.notified();
            tokio::pin!(readable);
            readable.as_mut().enable();

            {
                let mut state = self.lock();
                if let Some(item) = state.dequeue() {
                    drop(state);
                    self.writable.notify_waiters();
                    return Some(item);
                }
                if state.closed {
                    return None;
                }
            }

            readable.await;
        }
    }

    async fn admit_with_backpressure(
        &self,
        len: usize,
        mut insert: impl FnMut(&mut BufferState),
    ) -> Result<()> {
        loop {
            let writable = self.writable.notified();
            tokio::pin!(writable);
            writable.as_mut().enable();

            {
                let mut state = self.lock();
                match self.admit(&state, len)? {
                    Admission::Accepted => {
                        insert(&mut state);
                        drop(state);
                        self.readable.notify_one();
                        return Ok(());
                    }
                    Admission::Full if self.mode == BackpressureMode::Reject => {
                        return Err(self.overflow_error(&state));
                    }
                    Admission::Full => {}
                }
            }

            writable.await;
        }
    }

    fn admit(&self, state: &BufferState, len: usize) -> Result<Admission> {
        if state.closed {
            return Err(VoiceError::BufferClosed);
        }
        if state.queued_chunks >= self.capacity_chunks {
            return Ok(Admission::Full);
        }
        // A single oversized chunk is admitted into an empty buffer so the
        // producer can never wedge itself.
        let fits = state.queued_bytes.saturating_add(len as u64) <= self.max_bytes;
        if fits || state.queued_chunks == 0 {
            Ok(Admission::Accepted)
        } else {
            Ok(Admission::Full)
        }
    }

    fn overflow_error(&self, state: &BufferState) -> VoiceError {
        warn!(
            queued_chunks = state.queued_chunks,
            queued_bytes = state.queued_bytes,
            "audio buffer full, rejecting chunk"
        );
        VoiceError::BufferOverflow {
            capacity: format!(
                "{} chunks / {} bytes",
                self.capacity_chunks, self.max_bytes
            ),
        }
    }

    fn lock(&self) -> MutexGuard<'_, BufferState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl BufferState {
    fn enqueue(&mut self, chunk: AudioChunk) {
        self.end_signalled = false;
        self.queued_chunks += 1;
        self.queued_bytes = self.queued_bytes.saturating_add(chunk.len() as u64);
        self.queue.push_back(BufferItem::Chunk(chunk));
    }

    fn dequeue(&mut self) -> Option<BufferItem> {
        let item = self.queue.pop_front()?;
        if let BufferItem::Chunk(chunk) = &item {
            self.queued_chunks = self.queued_chunks.saturating_sub(1);
            self.queued_bytes = self.queued_bytes.saturating_sub(chunk.len() as u64);
        }
        Some(item)
    }
}

/// Producer handle for live audio (`run_streamed`).
///
/// Cheap to clone; every clone feeds the same buffer.
#[derive(Debug, Clone)]
pub struct StreamedAudioInput {
    buffer: Arc<AudioChunkBuffer>,
}

impl StreamedAudioInput {
    /// Create an input sized from the pipeline configuration.
    pub fn new(config: &PipelineConfig) -> Self {
        Self::from_buffer(Arc::new(AudioChunkBuffer::new(
            &config.buffer,
            &config.audio,
        )))
    }

    pub fn from_buffer(buffer: Arc<AudioChunkBuffer>) -> Self {
        Self { buffer }
    }

    /// Push captured audio with an optional transcription hint. Waits for
    /// space when the buffer is full in blocking mode.
    ///
    /// Returns the sequence number assigned to the chunk.
    ///
    /// # Errors
    ///
    /// [`VoiceError::BufferClosed`] or [`VoiceError::BufferOverflow`].
    pub async fn push_chunk(
        &self,
        data: impl Into<Bytes>,
        hint: Option<TranscriptionHint>,
    ) -> Result<u64> {
        self.buffer.push_audio(data.into(), hint).await
    }

    /// Push without waiting.
    ///
    /// # Errors
    ///
    /// [`VoiceError::BufferClosed`] or [`VoiceError::BufferOverflow`].
    pub fn try_push_chunk(
        &self,
        data: impl Into<Bytes>,
        hint: Option<TranscriptionHint>,
    ) -> Result<u64> {
        self.buffer.try_push_audio(data.into(), hint)
    }

    /// The user stopped speaking.
    ///
    /// # Errors
    ///
    /// [`VoiceError::BufferClosed`] after [`close`](Self::close).
    pub fn end(&self) -> Result<()> {
        self.buffer.signal_end()
    }

    /// No more audio will ever arrive.
    pub fn close(&self) {
        self.buffer.close();
    }

    pub fn buffer(&self) -> &Arc<AudioChunkBuffer> {
        &self.buffer
    }
}
