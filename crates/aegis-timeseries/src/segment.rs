//! Aegis Time Series Segment
//!
//! Compact, bounded container for the samples of one series. A segment holds
//! samples whose timestamps are millisecond offsets from the baseline in its
//! key, plus running statistics over its live samples. Samples are encoded
//! Gorilla style: delta-of-delta timestamps and XOR-compressed values.
//!
//! Layout (little endian):
//! - header: values u16, entries u32, live u32, payload bits u32,
//!   last offset i32, last delta i32
//! - per value: first, last, min, max, sum as f64 and count as u32
//! - per value: previous value bits u64, leading zeros u8, trailing zeros u8
//! - bit payload, one record per sample: timestamp, status bit, tag, values
//!
//! @version 0.1.0
//! @author AutomataNexus Development Team

use aegis_common::{AegisError, Result};
use serde::{Deserialize, Serialize};

// =============================================================================
// Constants
// =============================================================================

/// Hard capacity of an encoded segment.
pub const MAX_SEGMENT_SIZE: usize = 2048;

/// Widest sample a segment stores.
pub const MAX_NUMBER_OF_VALUES: usize = 32;

/// Longest tag a sample may carry.
pub const MAX_TAG_LENGTH: usize = 255;

const HEADER_SIZE: usize = 2 + 4 + 4 + 4 + 4 + 4;
const SUMMARY_SIZE: usize = 5 * 8 + 4;
const STATE_SIZE: usize = 8 + 1 + 1;
const NO_WINDOW: u8 = u8::MAX;

// =============================================================================
// Entry Types
// =============================================================================

/// Whether a stored sample is visible to readers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum EntryStatus {
    #[default]
    Live,
    Dead,
}

/// One decoded sample of a segment.
#[derive(Debug, Clone, PartialEq)]
pub struct SegmentEntry {
    pub offset_ms: i64,
    pub values: Vec<f64>,
    pub tag: Option<Vec<u8>>,
    pub status: EntryStatus,
}

impl SegmentEntry {
    pub fn is_live(&self) -> bool {
        self.status == EntryStatus::Live
    }
}

/// Running statistics of one value column over live, non-NaN samples.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ValueSummary {
    pub first: f64,
    pub last: f64,
    pub min: f64,
    pub max: f64,
    pub sum: f64,
    pub count: u32,
}

impl Default for ValueSummary {
    fn default() -> Self {
        Self {
            first: f64::NAN,
            last: f64::NAN,
            min: f64::NAN,
            max: f64::NAN,
            sum: 0.0,
            count: 0,
        }
    }
}

impl ValueSummary {
    fn observe(&mut self, value: f64) {
        if value.is_nan() {
            return;
        }
        if self.count == 0 {
            self.first = value;
            self.min = value;
            self.max = value;
        } else {
            self.min = self.min.min(value);
            self.max = self.max.max(value);
        }
        self.last = value;
        self.sum += value;
        self.count += 1;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct ValueState {
    prev_bits: u64,
    leading: u8,
    trailing: u8,
}

impl Default for ValueState {
    fn default() -> Self {
        Self {
            prev_bits: 0,
            leading: NO_WINDOW,
            trailing: 0,
        }
    }
}

impl ValueState {
    fn reuses_window(&self, leading: u8, trailing: u8) -> bool {
        self.leading != NO_WINDOW && leading >= self.leading && trailing >= self.trailing
    }

    fn encoded_bits(&self, bits: u64) -> usize {
        let xor = self.prev_bits ^ bits;
        if xor == 0 {
            return 1;
        }
        let leading = xor.leading_zeros() as u8;
        let trailing = xor.trailing_zeros() as u8;
        if self.reuses_window(leading, trailing) {
            2 + (64 - self.leading - self.trailing) as usize
        } else {
            2 + 6 + 6 + (64 - leading - trailing) as usize
        }
    }
}

// =============================================================================
// Bit Writer / Reader
// =============================================================================

/// Bit-level writer appending to an existing payload.
#[derive(Debug, Clone, Default)]
struct BitWriter {
    buffer: Vec<u8>,
    bit_len: usize,
}

impl BitWriter {
    fn write_bit(&mut self, bit: bool) {
        let position = self.bit_len % 8;
        if position == 0 {
            self.buffer.push(0);
        }
        if bit {
            if let Some(byte) = self.buffer.last_mut() {
                *byte |= 1 << (7 - position);
            }
        }
        self.bit_len += 1;
    }

    fn write_bits(&mut self, value: u64, num_bits: u8) {
        for i in (0..num_bits).rev() {
            self.write_bit((value >> i) & 1 == 1);
        }
    }
}

/// Bit-level reader bounded by the payload's bit length.
struct BitReader<'a> {
    data: &'a [u8],
    bit_len: usize,
    position: usize,
}

impl<'a> BitReader<'a> {
    fn new(data: &'a [u8], bit_len: usize) -> Self {
        Self {
            data,
            bit_len,
            position: 0,
        }
    }

    fn read_bit(&mut self) -> Option<bool> {
        if self.position >= self.bit_len {
            return None;
        }
        let byte = *self.data.get(self.position / 8)?;
        let bit = (byte >> (7 - self.position % 8)) & 1 == 1;
        self.position += 1;
        Some(bit)
    }

    fn read_bits(&mut self, num_bits: u8) -> Option<u64> {
        let mut value = 0u64;
        for _ in 0..num_bits {
            value = (value << 1) | (self.read_bit()? as u64);
        }
        Some(value)
    }
}

fn timestamp_bits(delta_of_delta: i64) -> usize {
    match delta_of_delta {
        0 => 1,
        -63..=64 => 2 + 7,
        -255..=256 => 3 + 9,
        -2047..=2048 => 4 + 12,
        _ => 4 + 32,
    }
}

// =============================================================================
// Segment
// =============================================================================

/// A bounded run of samples sharing one baseline.
#[derive(Debug, Clone)]
pub struct TimeSeriesSegment {
    number_of_values: usize,
    number_of_entries: u32,
    live_entries: u32,
    last_offset: i64,
    last_delta: i64,
    summary: Vec<ValueSummary>,
    states: Vec<ValueState>,
    payload: BitWriter,
}

impl TimeSeriesSegment {
    /// Create an empty segment for samples of the given width.
    pub fn initialize(number_of_values: usize) -> Result<Self> {
        if number_of_values == 0 || number_of_values > MAX_NUMBER_OF_VALUES {
            return Err(AegisError::InvalidArgument(format!(
                "a segment holds between 1 and {} values, got {}",
                MAX_NUMBER_OF_VALUES, number_of_values
            )));
        }
        let segment = Self {
            number_of_values,
            number_of_entries: 0,
            live_entries: 0,
            last_offset: 0,
            last_delta: 0,
            summary: vec![ValueSummary::default(); number_of_values],
            states: vec![ValueState::default(); number_of_values],
            payload: BitWriter::default(),
        };
        if segment.size_in_bytes() > MAX_SEGMENT_SIZE {
            return Err(AegisError::SegmentTooLarge(segment.size_in_bytes()));
        }
        Ok(segment)
    }

    pub fn number_of_values(&self) -> usize {
        self.number_of_values
    }

    pub fn number_of_entries(&self) -> u32 {
        self.number_of_entries
    }

    pub fn number_of_live_entries(&self) -> u32 {
        self.live_entries
    }

    pub fn is_empty(&self) -> bool {
        self.number_of_entries == 0
    }

    pub fn summary(&self) -> &[ValueSummary] {
        &self.summary
    }

    /// Offset of the last stored sample.
    pub fn last_offset(&self) -> i64 {
        self.last_offset
    }

    /// Timestamp (ms) of the last stored sample.
    pub fn last_timestamp(&self, baseline_ms: i64) -> i64 {
        baseline_ms + self.last_offset
    }

    /// Bytes the encoded segment occupies.
    pub fn size_in_bytes(&self) -> usize {
        HEADER_SIZE
            + self.number_of_values * (SUMMARY_SIZE + STATE_SIZE)
            + self.payload.bit_len.div_ceil(8)
    }

    /// Whether the sample fits on its own into a fresh segment of its width.
    /// A sample that does not can never be stored.
    pub fn fits_alone(values: &[f64], tag: Option<&[u8]>) -> bool {
        Self::initialize(values.len())
            .map(|mut segment| segment.append(0, values, tag, EntryStatus::Live))
            .unwrap_or(false)
    }

    // -------------------------------------------------------------------------
    // Append
    // -------------------------------------------------------------------------

    /// Append one sample. Returns false, leaving the segment untouched, when
    /// the sample does not fit.
    pub fn append(
        &mut self,
        offset_ms: i64,
        values: &[f64],
        tag: Option<&[u8]>,
        status: EntryStatus,
    ) -> bool {
        if values.len() > self.number_of_values
            || offset_ms < 0
            || offset_ms >= i32::MAX as i64
            || tag.map_or(false, |t| t.len() > MAX_TAG_LENGTH)
        {
            return false;
        }
        if self.number_of_entries > 0 && offset_ms < self.last_offset {
            return false;
        }

        let padded: Vec<u64> = (0..self.number_of_values)
            .map(|i| values.get(i).copied().unwrap_or(f64::NAN).to_bits())
            .collect();

        let delta = offset_ms - self.last_offset;
        let delta_of_delta = delta - self.last_delta;

        let mut needed = timestamp_bits(delta_of_delta) + 1 + 1;
        if let Some(tag) = tag {
            needed += 8 + tag.len() * 8;
        }
        needed += self
            .states
            .iter()
            .zip(&padded)
            .map(|(state, bits)| state.encoded_bits(*bits))
            .sum::<usize>();

        let fixed = HEADER_SIZE + self.number_of_values * (SUMMARY_SIZE + STATE_SIZE);
        if fixed + (self.payload.bit_len + needed).div_ceil(8) > MAX_SEGMENT_SIZE {
            return false;
        }

        self.write_timestamp(delta_of_delta);
        self.payload.write_bit(status == EntryStatus::Dead);
        match tag {
            Some(tag) => {
                self.payload.write_bit(true);
                self.payload.write_bits(tag.len() as u64, 8);
                for byte in tag {
                    self.payload.write_bits(*byte as u64, 8);
                }
            }
            None => self.payload.write_bit(false),
        }
        for (i, bits) in padded.iter().enumerate() {
            self.write_value(i, *bits);
        }

        self.last_offset = offset_ms;
        self.last_delta = delta;
        self.number_of_entries += 1;
        if status == EntryStatus::Live {
            self.live_entries += 1;
            for (summary, bits) in self.summary.iter_mut().zip(&padded) {
                summary.observe(f64::from_bits(*bits));
            }
        }
        true
    }

    fn write_timestamp(&mut self, delta_of_delta: i64) {
        let w = &mut self.payload;
        match delta_of_delta {
            0 => w.write_bit(false),
            -63..=64 => {
                w.write_bits(0b10, 2);
                w.write_bits((delta_of_delta + 63) as u64, 7);
            }
            -255..=256 => {
                w.write_bits(0b110, 3);
                w.write_bits((delta_of_delta + 255) as u64, 9);
            }
            -2047..=2048 => {
                w.write_bits(0b1110, 4);
                w.write_bits((delta_of_delta + 2047) as u64, 12);
            }
            _ => {
                w.write_bits(0b1111, 4);
                w.write_bits(delta_of_delta as i32 as u32 as u64, 32);
            }
        }
    }

    fn write_value(&mut self, index: usize, bits: u64) {
        let state = &mut self.states[index];
        let w = &mut self.payload;
        let xor = state.prev_bits ^ bits;
        state.prev_bits = bits;

        if xor == 0 {
            w.write_bit(false);
            return;
        }
        w.write_bit(true);

        let leading = xor.leading_zeros() as u8;
        let trailing = xor.trailing_zeros() as u8;
        if state.reuses_window(leading, trailing) {
            w.write_bit(false);
            let meaningful = 64 - state.leading - state.trailing;
            w.write_bits(xor >> state.trailing, meaningful);
        } else {
            w.write_bit(true);
            let meaningful = 64 - leading - trailing;
            w.write_bits(leading as u64, 6);
            // 1..=64 meaningful bits stored as 0..=63
            w.write_bits((meaningful - 1) as u64, 6);
            w.write_bits(xor >> trailing, meaningful);
            state.leading = leading;
            state.trailing = trailing;
        }
    }

    // -------------------------------------------------------------------------
    // Read
    // -------------------------------------------------------------------------

    /// Decode all samples in stored order. Each call starts from the beginning.
    pub fn enumerate(&self) -> SegmentEnumerator<'_> {
        SegmentEnumerator {
            reader: BitReader::new(&self.payload.buffer, self.payload.bit_len),
            states: vec![ValueState::default(); self.number_of_values],
            remaining: self.number_of_entries,
            last_offset: 0,
            last_delta: 0,
        }
    }

    /// Decode all samples into a vector.
    pub fn entries(&self) -> Result<Vec<SegmentEntry>> {
        self.enumerate().collect()
    }

    // -------------------------------------------------------------------------
    // Serialization
    // -------------------------------------------------------------------------

    /// Encode into the persisted byte layout.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.size_in_bytes());
        out.extend_from_slice(&(self.number_of_values as u16).to_le_bytes());
        out.extend_from_slice(&self.number_of_entries.to_le_bytes());
        out.extend_from_slice(&self.live_entries.to_le_bytes());
        out.extend_from_slice(&(self.payload.bit_len as u32).to_le_bytes());
        out.extend_from_slice(&(self.last_offset as i32).to_le_bytes());
        out.extend_from_slice(&(self.last_delta as i32).to_le_bytes());
        for s in &self.summary {
            for v in [s.first, s.last, s.min, s.max, s.sum] {
                out.extend_from_slice(&v.to_le_bytes());
            }
            out.extend_from_slice(&s.count.to_le_bytes());
        }
        for st in &self.states {
            out.extend_from_slice(&st.prev_bits.to_le_bytes());
            out.push(st.leading);
            out.push(st.trailing);
        }
        out.extend_from_slice(&self.payload.buffer);
        out
    }

    /// Decode from the persisted byte layout.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.len() > MAX_SEGMENT_SIZE {
            return Err(AegisError::SegmentTooLarge(bytes.len()));
        }
        let mut cursor = ByteCursor { bytes, position: 0 };

        let number_of_values = cursor.u16()? as usize;
        if number_of_values == 0 || number_of_values > MAX_NUMBER_OF_VALUES {
            return Err(AegisError::Corruption(format!(
                "segment declares {} values",
                number_of_values
            )));
        }
        let number_of_entries = cursor.u32()?;
        let live_entries = cursor.u32()?;
        let bit_len = cursor.u32()? as usize;
        let last_offset = cursor.i32()? as i64;
        let last_delta = cursor.i32()? as i64;
        if live_entries > number_of_entries {
            return Err(AegisError::Corruption(
                "segment has more live entries than entries".to_string(),
            ));
        }

        let mut summary = Vec::with_capacity(number_of_values);
        for _ in 0..number_of_values {
            summary.push(ValueSummary {
                first: cursor.f64()?,
                last: cursor.f64()?,
                min: cursor.f64()?,
                max: cursor.f64()?,
                sum: cursor.f64()?,
                count: cursor.u32()?,
            });
        }
        let mut states = Vec::with_capacity(number_of_values);
        for _ in 0..number_of_values {
            states.push(ValueState {
                prev_bits: cursor.u64()?,
                leading: cursor.u8()?,
                trailing: cursor.u8()?,
            });
        }

        let buffer = cursor.rest().to_vec();
        if buffer.len() != bit_len.div_ceil(8) {
            return Err(AegisError::Corruption(format!(
                "segment payload is {} bytes but declares {} bits",
                buffer.len(),
                bit_len
            )));
        }

        Ok(Self {
            number_of_values,
            number_of_entries,
            live_entries,
            last_offset,
            last_delta,
            summary,
            states,
            payload: BitWriter { buffer, bit_len },
        })
    }
}

// =============================================================================
// Enumerator
// =============================================================================

/// Streaming decoder over a segment's samples.
pub struct SegmentEnumerator<'a> {
    reader: BitReader<'a>,
    states: Vec<ValueState>,
    remaining: u32,
    last_offset: i64,
    last_delta: i64,
}

impl SegmentEnumerator<'_> {
    fn read_entry(&mut self) -> Option<SegmentEntry> {
        let r = &mut self.reader;
        let delta_of_delta = if !r.read_bit()? {
            0i64
        } else if !r.read_bit()? {
            r.read_bits(7)? as i64 - 63
        } else if !r.read_bit()? {
            r.read_bits(9)? as i64 - 255
        } else if !r.read_bit()? {
            r.read_bits(12)? as i64 - 2047
        } else {
            r.read_bits(32)? as u32 as i32 as i64
        };
        self.last_delta += delta_of_delta;
        self.last_offset += self.last_delta;

        let status = if r.read_bit()? {
            EntryStatus::Dead
        } else {
            EntryStatus::Live
        };

        let tag = if r.read_bit()? {
            let len = r.read_bits(8)? as usize;
            let mut tag = Vec::with_capacity(len);
            for _ in 0..len {
                tag.push(r.read_bits(8)? as u8);
            }
            Some(tag)
        } else {
            None
        };

        let mut values = Vec::with_capacity(self.states.len());
        for state in self.states.iter_mut() {
            let bits = if !r.read_bit()? {
                state.prev_bits
            } else if !r.read_bit()? {
                let meaningful = 64 - state.leading - state.trailing;
                state.prev_bits ^ (r.read_bits(meaningful)? << state.trailing)
            } else {
                let leading = r.read_bits(6)? as u8;
                let meaningful = r.read_bits(6)? as u8 + 1;
                let trailing = 64u8.checked_sub(leading + meaningful)?;
                state.leading = leading;
                state.trailing = trailing;
                state.prev_bits ^ (r.read_bits(meaningful)? << trailing)
            };
            state.prev_bits = bits;
            values.push(f64::from_bits(bits));
        }

        Some(SegmentEntry {
            offset_ms: self.last_offset,
            values,
            tag,
            status,
        })
    }
}

impl Iterator for SegmentEnumerator<'_> {
    type Item = Result<SegmentEntry>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.remaining == 0 {
            return None;
        }
        self.remaining -= 1;
        match self.read_entry() {
            Some(entry) => Some(Ok(entry)),
            None => {
                self.remaining = 0;
                Some(Err(AegisError::Corruption(
                    "segment payload ended early".to_string(),
                )))
            }
        }
    }
}

// =============================================================================
// Byte Cursor
// =============================================================================

struct ByteCursor<'a> {
    bytes: &'a [u8],
    position: usize,
}

impl<'a> ByteCursor<'a> {
    fn take<const N: usize>(&mut self) -> Result<[u8; N]> {
        let end = self.position + N;
        let slice = self
            .bytes
            .get(self.position..end)
            .ok_or_else(|| AegisError::Corruption("segment header truncated".to_string()))?;
        self.position = end;
        let mut out = [0u8; N];
        out.copy_from_slice(slice);
        Ok(out)
    }

    fn u8(&mut self) -> Result<u8> {
        Ok(self.take::<1>()?[0])
    }

    fn u16(&mut self) -> Result<u16> {
        Ok(u16::from_le_bytes(self.take()?))
    }

    fn u32(&mut self) -> Result<u32> {
        Ok(u32::from_le_bytes(self.take()?))
    }

    fn i32(&mut self) -> Result<i32> {
        Ok(i32::from_le_bytes(self.take()?))
    }

    fn u64(&mut self) -> Result<u64> {
        Ok(u64::from_le_bytes(self.take()?))
    }

    fn f64(&mut self) -> Result<f64> {
        Ok(f64::from_le_bytes(self.take()?))
    }

    fn rest(&self) -> &'a [u8] {
        &self.bytes[self.position.min(self.bytes.len())..]
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn live(segment: &mut TimeSeriesSegment, offset: i64, values: &[f64]) -> bool {
        segment.append(offset, values, None, EntryStatus::Live)
    }

    #[test]
    fn test_append_and_enumerate() {
        let mut segment = TimeSeriesSegment::initialize(2).expect("initialize");
        assert!(live(&mut segment, 0, &[1.0, 10.0]));
        assert!(segment.append(1000, &[2.0, 20.0], Some(b"watches/fitbit"), EntryStatus::Live));
        assert!(live(&mut segment, 2000, &[3.0]));

        let entries = segment.entries().expect("decode");
        assert_eq!(entries.len(), 3);
        assert_eq!(entries[1].offset_ms, 1000);
        assert_eq!(entries[1].tag.as_deref(), Some(b"watches/fitbit".as_slice()));
        assert_eq!(entries[2].values[0], 3.0);
        assert!(entries[2].values[1].is_nan());

        assert_eq!(segment.last_timestamp(5_000), 7_000);
        assert_eq!(segment.number_of_live_entries(), 3);
    }

    #[test]
    fn test_summary_ignores_dead_and_nan() {
        let mut segment = TimeSeriesSegment::initialize(1).expect("initialize");
        live(&mut segment, 0, &[5.0]);
        segment.append(1, &[100.0], None, EntryStatus::Dead);
        live(&mut segment, 2, &[f64::NAN]);
        live(&mut segment, 3, &[-1.0]);

        let summary = segment.summary()[0];
        assert_eq!(summary.first, 5.0);
        assert_eq!(summary.last, -1.0);
        assert_eq!(summary.min, -1.0);
        assert_eq!(summary.max, 5.0);
        assert_eq!(summary.sum, 4.0);
        assert_eq!(summary.count, 2);
        assert_eq!(segment.number_of_entries(), 4);
        assert_eq!(segment.number_of_live_entries(), 3);
    }

    #[test]
    fn test_rejected_appends_leave_segment_untouched() {
        let mut segment = TimeSeriesSegment::initialize(1).expect("initialize");
        assert!(live(&mut segment, 100, &[1.0]));
        let before = segment.to_bytes();

        assert!(!live(&mut segment, 50, &[1.0]));
        assert!(!live(&mut segment, 200, &[1.0, 2.0]));
        assert!(!live(&mut segment, i32::MAX as i64, &[1.0]));
        let long_tag = vec![b'x'; MAX_TAG_LENGTH + 1];
        assert!(!segment.append(300, &[1.0], Some(&long_tag), EntryStatus::Live));

        assert_eq!(segment.to_bytes(), before);
    }

    #[test]
    fn test_segment_fills_up() {
        let mut segment = TimeSeriesSegment::initialize(1).expect("initialize");
        let mut appended = 0;
        while segment.append(appended * 7, &[(appended as f64).sin()], None, EntryStatus::Live) {
            appended += 1;
        }
        assert!(appended > 10);
        assert!(segment.size_in_bytes() <= MAX_SEGMENT_SIZE);
        assert_eq!(segment.entries().expect("decode").len(), appended as usize);
    }

    #[test]
    fn test_large_timestamp_jumps() {
        let mut segment = TimeSeriesSegment::initialize(1).expect("initialize");
        let offsets = [0i64, 1, 1, 5_000, 5_001, 2_000_000_000, 2_000_000_000];
        for offset in offsets {
            assert!(live(&mut segment, offset, &[1.0]));
        }
        let decoded: Vec<i64> = segment
            .entries()
            .expect("decode")
            .iter()
            .map(|e| e.offset_ms)
            .collect();
        assert_eq!(decoded, offsets);
    }

    #[test]
    fn test_widths() {
        assert!(TimeSeriesSegment::initialize(0).is_err());
        assert!(TimeSeriesSegment::initialize(MAX_NUMBER_OF_VALUES + 1).is_err());
        let wide = TimeSeriesSegment::initialize(MAX_NUMBER_OF_VALUES).expect("initialize");
        assert!(wide.size_in_bytes() < MAX_SEGMENT_SIZE);
    }

    fn incompressible(width: usize) -> Vec<f64> {
        (0..width)
            .map(|i| f64::from_bits((2.0 + i as f64).to_bits() | 1))
            .collect()
    }

    #[test]
    fn test_fits_alone_at_the_width_boundary() {
        assert!(TimeSeriesSegment::fits_alone(&[0.0; MAX_NUMBER_OF_VALUES], None));
        assert!(TimeSeriesSegment::fits_alone(&incompressible(31), None));
        assert!(!TimeSeriesSegment::fits_alone(&incompressible(32), None));

        let tag = vec![b'x'; MAX_TAG_LENGTH];
        assert!(TimeSeriesSegment::fits_alone(&incompressible(27), Some(&tag)));
        assert!(!TimeSeriesSegment::fits_alone(&incompressible(28), Some(&tag)));

        assert!(!TimeSeriesSegment::fits_alone(&[], None));
        assert!(!TimeSeriesSegment::fits_alone(&[0.0; MAX_NUMBER_OF_VALUES + 1], None));
    }

    #[test]
    fn test_from_bytes_rejects_corruption() {
        let mut segment = TimeSeriesSegment::initialize(1).expect("initialize");
        live(&mut segment, 0, &[1.0]);
        let bytes = segment.to_bytes();

        assert!(matches!(
            TimeSeriesSegment::from_bytes(&bytes[..bytes.len() - 1]),
            Err(AegisError::Corruption(_))
        ));
        assert!(TimeSeriesSegment::from_bytes(&[0, 0]).is_err());

        let restored = TimeSeriesSegment::from_bytes(&bytes).expect("decode");
        assert_eq!(restored.entries().expect("entries"), segment.entries().expect("entries"));
    }

    proptest! {
        #[test]
        fn prop_appended_samples_decode_in_order(
            samples in prop::collection::vec((0i64..100_000, -1e6f64..1e6, any::<bool>()), 1..200)
        ) {
            let mut segment = TimeSeriesSegment::initialize(2).expect("initialize");
            let mut offset = 0i64;
            let mut expected = Vec::new();
            for (gap, value, dead) in samples {
                offset += gap;
                let status = if dead { EntryStatus::Dead } else { EntryStatus::Live };
                if !segment.append(offset, &[value, value / 2.0], None, status) {
                    break;
                }
                expected.push((offset, value, status));
            }

            let entries = segment.entries().expect("decode");
            prop_assert_eq!(entries.len(), expected.len());
            for (entry, (offset, value, status)) in entries.iter().zip(&expected) {
                prop_assert_eq!(entry.offset_ms, *offset);
                prop_assert_eq!(entry.values[0], *value);
                prop_assert_eq!(entry.status, *status);
            }

            let live_count = expected.iter().filter(|e| e.2 == EntryStatus::Live).count();
            prop_assert_eq!(segment.number_of_live_entries() as usize, live_count);
            prop_assert_eq!(segment.summary()[0].count as usize, live_count);
        }
    }
}
