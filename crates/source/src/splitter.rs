//! Splits one ordered record stream into consecutive window batches.

use tb_core::{Amount, EntityId, PipelineError, Record, WindowClock, WindowIndex};
use tracing::trace;

use crate::{RecordSource, SourceCursor};

/// All `(entity, amount)` pairs of one source that fall into one window.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WindowBatch {
    pub window: WindowIndex,
    pub entries: Vec<(EntityId, Amount)>,
}

impl WindowBatch {
    pub fn empty(window: WindowIndex) -> Self {
        Self {
            window,
            entries: Vec::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Streams window batches out of a [`RecordSource`], holding at most one
/// look-ahead record: the first record past the current boundary.
///
/// Every window up to the last one is emitted, empty ones included, so batches
/// from different sources stay aligned by index. Once the source runs dry the
/// window in progress is emitted if it holds anything; after that the splitter
/// either stops (no last window configured) or has to account for the windows
/// still owed up to `last_window`.
pub struct WindowSplitter<S> {
    source: S,
    clock: WindowClock,
    window: WindowIndex,
    last_window: Option<WindowIndex>,
    allow_incomplete: bool,
    pending: Option<Record>,
    exhausted: bool,
    read: u64,
    emitted: u64,
}

impl<S: RecordSource> WindowSplitter<S> {
    pub fn new(
        source: S,
        clock: WindowClock,
        first_window: WindowIndex,
        last_window: Option<WindowIndex>,
        allow_incomplete: bool,
    ) -> Self {
        Self {
            source,
            clock,
            window: first_window,
            last_window,
            allow_incomplete,
            pending: None,
            exhausted: false,
            read: 0,
            emitted: 0,
        }
    }

    pub fn name(&self) -> &str {
        self.source.name()
    }

    pub fn source_mut(&mut self) -> &mut S {
        &mut self.source
    }

    /// Index of the next window this splitter will emit.
    pub fn next_window(&self) -> WindowIndex {
        self.window
    }

    pub fn next_batch(&mut self) -> Result<Option<WindowBatch>, PipelineError> {
        if self.last_window.is_some_and(|last| self.window > last) {
            return Ok(None);
        }
        let window = self.window;
        let boundary = self.clock.boundary(window);
        // window 0 also takes everything dated before the start
        let floor = window.checked_sub(1).map(|prev| self.clock.boundary(prev));
        let mut entries = Vec::new();

        if let Some(record) = self.pending.take() {
            if record.date > boundary {
                self.pending = Some(record);
                return Ok(Some(self.close(window, entries)));
            }
            entries.push((record.entity, record.amount));
        }

        while !self.exhausted {
            match self.source.next_record()? {
                Some(record) => {
                    self.read += 1;
                    if floor.is_some_and(|floor| record.date <= floor) {
                        return Err(PipelineError::LateRecord {
                            source_name: self.source.name().to_string(),
                            date: record.date,
                            window,
                        });
                    }
                    if record.date > boundary {
                        self.pending = Some(record);
                        return Ok(Some(self.close(window, entries)));
                    }
                    entries.push((record.entity, record.amount));
                }
                None => self.exhausted = true,
            }
        }

        if !entries.is_empty() {
            return Ok(Some(self.close(window, entries)));
        }
        match self.last_window {
            None => Ok(None),
            Some(_) if self.allow_incomplete => Ok(Some(self.close(window, entries))),
            Some(last_window) => Err(PipelineError::IncompleteSource {
                source_name: self.source.name().to_string(),
                window,
                last_window,
            }),
        }
    }

    fn close(&mut self, window: WindowIndex, entries: Vec<(EntityId, Amount)>) -> WindowBatch {
        trace!(source = %self.source.name(), window, records = entries.len(), "window closed");
        self.emitted += entries.len() as u64;
        self.window += 1;
        WindowBatch { window, entries }
    }

    /// Resume position matching the batches emitted so far.
    pub fn cursor(&self) -> Option<SourceCursor> {
        self.source.cursor(self.pending.is_some())
    }

    pub fn records_read(&self) -> u64 {
        self.read
    }

    pub fn records_emitted(&self) -> u64 {
        self.emitted
    }

    pub fn pending(&self) -> u64 {
        u64::from(self.pending.is_some())
    }

    /// Every record read was emitted exactly once or is still held as look-ahead.
    pub fn check_conservation(&self) -> Result<(), PipelineError> {
        if self.read == self.emitted + self.pending() {
            return Ok(());
        }
        Err(PipelineError::RecordConservation {
            source_name: self.source.name().to_string(),
            read: self.read,
            emitted: self.emitted,
            pending: self.pending(),
        })
    }
}
