use log::{debug, info};

use crate::error::HubError;

pub const DEFAULT_RESPONSE_CAPACITY: usize = 15_000;

/// Fixed-capacity receive buffer for a single in-flight response.
///
/// At most `capacity - 1` body bytes are ever stored, so the byte after the
/// body is always a NUL terminator.
#[derive(Debug)]
pub struct ResponseBuffer {
    data: Box<[u8]>,
    len: usize,
}

impl Default for ResponseBuffer {
    fn default() -> Self {
        Self::with_capacity(DEFAULT_RESPONSE_CAPACITY)
    }
}

impl ResponseBuffer {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            data: vec![0_u8; capacity.max(1)].into_boxed_slice(),
            len: 0,
        }
    }

    pub fn capacity(&self) -> usize {
        self.data.len()
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.data[..self.len]
    }

    /// Body bytes followed by the terminating NUL.
    pub fn as_bytes_with_nul(&self) -> &[u8] {
        &self.data[..=self.len]
    }

    pub fn reset(&mut self) {
        self.data.fill(0);
        self.len = 0;
    }

    fn remaining(&self) -> usize {
        self.capacity() - 1 - self.len
    }

    fn append(&mut self, chunk: &[u8]) -> usize {
        let copy_len = chunk.len().min(self.remaining());
        self.data[self.len..self.len + copy_len].copy_from_slice(&chunk[..copy_len]);
        self.len += copy_len;
        copy_len
    }
}

enum Sink<'a> {
    Fixed(&'a mut ResponseBuffer),
    Dynamic {
        data: Option<Vec<u8>>,
        declared: usize,
    },
}

/// Accumulates the data events of one response into either a borrowed
/// [`ResponseBuffer`] or a buffer sized to the declared content length.
pub struct BodyAccumulator<'a> {
    sink: Sink<'a>,
    offset: usize,
    started: bool,
}

impl<'a> BodyAccumulator<'a> {
    /// Starts a new response in `buffer`. The stored body is emptied now; the
    /// full zeroing happens on the first data event.
    pub fn fixed(buffer: &'a mut ResponseBuffer) -> Self {
        buffer.len = 0;
        buffer.data[0] = 0;
        Self {
            sink: Sink::Fixed(buffer),
            offset: 0,
            started: false,
        }
    }

    pub fn dynamic() -> Self {
        Self {
            sink: Sink::Dynamic {
                data: None,
                declared: 0,
            },
            offset: 0,
            started: false,
        }
    }

    pub fn offset(&self) -> usize {
        self.offset
    }

    pub fn is_dynamic(&self) -> bool {
        matches!(self.sink, Sink::Dynamic { .. })
    }

    pub fn holds_allocation(&self) -> bool {
        matches!(self.sink, Sink::Dynamic { data: Some(_), .. })
    }

    /// Copies as much of `chunk` as fits and returns the number of bytes kept.
    pub fn accept(&mut self, chunk: &[u8], declared: Option<u64>) -> Result<usize, HubError> {
        if !self.started {
            self.begin(declared)?;
            self.started = true;
        }

        let copied = match &mut self.sink {
            Sink::Fixed(buffer) => buffer.append(chunk),
            Sink::Dynamic { data, declared } => {
                let Some(data) = data.as_mut() else {
                    return Err(HubError::AllocationFailure {
                        declared: Some(*declared as u64),
                    });
                };
                let copy_len = chunk.len().min(declared.saturating_sub(self.offset));
                data[self.offset..self.offset + copy_len].copy_from_slice(&chunk[..copy_len]);
                copy_len
            }
        };

        if copied < chunk.len() {
            debug!(
                "response truncated: dropped {} of {} bytes at offset {}",
                chunk.len() - copied,
                chunk.len(),
                self.offset
            );
        }
        self.offset += copied;
        Ok(copied)
    }

    fn begin(&mut self, declared: Option<u64>) -> Result<(), HubError> {
        match &mut self.sink {
            Sink::Fixed(buffer) => {
                buffer.reset();
                Ok(())
            }
            Sink::Dynamic { data, declared: size } => {
                let failure = HubError::AllocationFailure { declared };
                let Some(content_len) = declared.and_then(|value| usize::try_from(value).ok())
                else {
                    return Err(failure);
                };
                let Some(alloc_len) = content_len.checked_add(1) else {
                    return Err(failure);
                };

                info!("allocating {alloc_len} bytes for response body");
                let mut buffer = Vec::new();
                if buffer.try_reserve_exact(alloc_len).is_err() {
                    return Err(failure);
                }
                buffer.resize(alloc_len, 0);
                *data = Some(buffer);
                *size = content_len;
                Ok(())
            }
        }
    }

    /// Ends a successful response. A dynamic body is handed to the caller so
    /// nothing stays allocated here.
    pub fn finish(&mut self) -> Option<Vec<u8>> {
        let body = match &mut self.sink {
            Sink::Fixed(_) => None,
            Sink::Dynamic { data, declared } => {
                *declared = 0;
                data.take().map(|mut body| {
                    body.truncate(self.offset);
                    body
                })
            }
        };
        self.offset = 0;
        self.started = false;
        body
    }

    /// Ends a failed response: drops any dynamic allocation and clears the
    /// fixed buffer.
    pub fn abort(&mut self) {
        match &mut self.sink {
            Sink::Fixed(buffer) => buffer.reset(),
            Sink::Dynamic { data, declared } => {
                *data = None;
                *declared = 0;
            }
        }
        self.offset = 0;
        self.started = false;
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn short_body_is_exact_and_terminated() {
        let mut buffer = ResponseBuffer::with_capacity(32);
        {
            let mut acc = BodyAccumulator::fixed(&mut buffer);
            acc.accept(b"a much longer previous body", None).unwrap();
            assert!(acc.finish().is_none());
        }
        {
            let mut acc = BodyAccumulator::fixed(&mut buffer);
            acc.accept(b"[]", None).unwrap();
            acc.finish();
        }

        assert_eq!(buffer.as_bytes(), b"[]");
        assert_eq!(buffer.as_bytes_with_nul(), b"[]\0");
        assert!(buffer.data[2..].iter().all(|byte| *byte == 0));
    }

    #[test]
    fn oversized_body_is_truncated_before_terminator() {
        let mut buffer = ResponseBuffer::with_capacity(8);
        let mut acc = BodyAccumulator::fixed(&mut buffer);

        assert_eq!(acc.accept(b"01234", None).unwrap(), 5);
        assert_eq!(acc.accept(b"56789", None).unwrap(), 2);
        assert_eq!(acc.accept(b"abc", None).unwrap(), 0);
        assert_eq!(acc.offset(), 7);
        acc.finish();

        assert_eq!(buffer.as_bytes(), b"0123456");
        assert_eq!(buffer.as_bytes_with_nul().last(), Some(&0));
    }

    #[test]
    fn abort_clears_fixed_buffer() {
        let mut buffer = ResponseBuffer::with_capacity(16);
        let mut acc = BodyAccumulator::fixed(&mut buffer);
        acc.accept(b"partial", None).unwrap();
        acc.abort();

        assert!(buffer.is_empty());
        assert!(buffer.as_bytes_with_nul().iter().all(|byte| *byte == 0));
    }

    #[test]
    fn dynamic_body_is_sized_to_content_length() {
        let mut acc = BodyAccumulator::dynamic();
        assert_eq!(acc.accept(b"hel", Some(5)).unwrap(), 3);
        assert_eq!(acc.accept(b"lo, world", Some(5)).unwrap(), 2);
        assert!(acc.holds_allocation());

        let body = acc.finish().unwrap();
        assert_eq!(body, b"hello".to_vec());
        assert!(!acc.holds_allocation());
        assert_eq!(acc.offset(), 0);
    }

    #[test]
    fn dynamic_body_without_content_length_fails() {
        let mut acc = BodyAccumulator::dynamic();
        let err = acc.accept(b"{}", None).unwrap_err();

        assert!(matches!(err, HubError::AllocationFailure { declared: None }));
        assert!(!acc.holds_allocation());
    }

    #[test]
    fn dynamic_body_with_impossible_length_fails() {
        let mut acc = BodyAccumulator::dynamic();
        let err = acc.accept(b"{}", Some(u64::MAX)).unwrap_err();

        assert!(matches!(err, HubError::AllocationFailure { declared: Some(u64::MAX) }));
    }

    #[test]
    fn abort_releases_dynamic_allocation() {
        let mut acc = BodyAccumulator::dynamic();
        acc.accept(b"abc", Some(10)).unwrap();
        acc.abort();

        assert!(!acc.holds_allocation());
        assert!(acc.finish().is_none());
    }
}
