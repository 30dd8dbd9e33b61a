//! H.264 Annex-B access unit parser
//!
//! Reassembles access units from an elementary stream that arrives in
//! arbitrary chunks. A NAL unit is only complete once the next start code
//! has been seen, so an access unit is emitted when the first NAL of the
//! following unit arrives (or on `flush`).

use bytes::{Buf, Bytes, BytesMut};
use tracing::{debug, trace};

/// Annex-B start code emitted in front of every NAL of an access unit
const START_CODE: [u8; 4] = [0, 0, 0, 1];

/// Length of the short start code searched for in the stream
const SHORT_START_CODE_LEN: usize = 3;

const NAL_TYPE_MASK: u8 = 0x1F;
const FORBIDDEN_ZERO_BIT: u8 = 0x80;

const NAL_SEI: u8 = 6;
const NAL_SPS: u8 = 7;
const NAL_PPS: u8 = 8;
const NAL_AUD: u8 = 9;
const NAL_END_OF_SEQUENCE: u8 = 10;
const NAL_END_OF_STREAM: u8 = 11;

fn is_slice(nal_type: u8) -> bool {
    (1..=5).contains(&nal_type)
}

/// NAL types that may only appear before the first slice of an access unit
fn opens_access_unit(nal_type: u8) -> bool {
    matches!(nal_type, NAL_SEI | NAL_SPS | NAL_PPS | NAL_AUD | 14..=18)
}

/// `first_mb_in_slice` is ue(v) coded, so a value of 0 is a single set bit
fn is_first_slice(payload: &[u8]) -> bool {
    payload.get(1).is_some_and(|b| b & 0x80 != 0)
}

/// Finds the next `00 00 01` at or after `from`
fn find_start_code(buf: &[u8], from: usize) -> Option<usize> {
    if buf.len() < SHORT_START_CODE_LEN {
        return None;
    }
    (from..buf.len() - 2).find(|&i| buf[i] == 0 && buf[i + 1] == 0 && buf[i + 2] == 1)
}

fn trim_trailing_zeros(payload: &[u8]) -> &[u8] {
    let end = payload
        .iter()
        .rposition(|&b| b != 0)
        .map_or(0, |last| last + 1);
    &payload[..end]
}

/// Stateful access unit parser
#[derive(Debug, Default)]
pub struct AccessUnitParser {
    /// Unsplit bytes; begins with a start code once `synced`
    pending: BytesMut,
    /// Offset in `pending` where the next start code search resumes
    scan_from: usize,
    synced: bool,
    /// NAL units of the access unit under construction
    current: BytesMut,
    current_has_slice: bool,
    nal_units: u64,
    dropped_bytes: u64,
    dropped_nal_units: u64,
}

impl AccessUnitParser {
    /// Creates a new parser
    pub fn new() -> Self {
        Self::default()
    }

    /// Feeds a chunk of the elementary stream and returns every access unit
    /// completed by it
    pub fn feed(&mut self, data: &[u8]) -> Vec<Bytes> {
        self.pending.extend_from_slice(data);
        let mut units = Vec::new();

        if !self.synced && !self.sync() {
            return units;
        }

        while let Some(next) = find_start_code(&self.pending, self.scan_from) {
            let nal = self.pending.split_to(next).freeze();
            self.scan_from = SHORT_START_CODE_LEN;
            self.push_nal(&nal[SHORT_START_CODE_LEN..], &mut units);
        }

        // The unit is complete as soon as the next one announces itself
        if let Some(header) = self
            .pending
            .get(SHORT_START_CODE_LEN..SHORT_START_CODE_LEN + 2)
        {
            if self.starts_new_unit(header) {
                self.emit(&mut units);
            }
        }

        // A start code may straddle the end of this chunk
        self.scan_from = self
            .pending
            .len()
            .saturating_sub(SHORT_START_CODE_LEN - 1)
            .max(SHORT_START_CODE_LEN);

        units
    }

    /// Emits everything still buffered, including an unterminated last NAL
    pub fn flush(&mut self) -> Vec<Bytes> {
        let mut units = Vec::new();

        if self.synced && self.pending.len() > SHORT_START_CODE_LEN {
            let nal = self.pending.split().freeze();
            self.push_nal(&nal[SHORT_START_CODE_LEN..], &mut units);
        }
        self.pending.clear();
        self.scan_from = SHORT_START_CODE_LEN;
        self.synced = false;

        self.emit(&mut units);
        units
    }

    /// Discards all buffered state
    pub fn reset(&mut self) {
        self.pending.clear();
        self.current.clear();
        self.current_has_slice = false;
        self.scan_from = 0;
        self.synced = false;
    }

    /// Total NAL units accepted into access units
    pub fn nal_units(&self) -> u64 {
        self.nal_units
    }

    /// Bytes discarded before the first start code
    pub fn dropped_bytes(&self) -> u64 {
        self.dropped_bytes
    }

    /// Malformed NAL units discarded
    pub fn dropped_nal_units(&self) -> u64 {
        self.dropped_nal_units
    }

    /// Aligns `pending` on the first start code, discarding what precedes it
    fn sync(&mut self) -> bool {
        match find_start_code(&self.pending, 0) {
            Some(pos) => {
                // Zeros right before the start code belong to a 4-byte code
                let garbage = trim_trailing_zeros(&self.pending[..pos]).len();
                if garbage > 0 {
                    debug!("Dropped {} bytes before first start code", garbage);
                    self.dropped_bytes += garbage as u64;
                }
                self.pending.advance(pos);
                self.synced = true;
                self.scan_from = SHORT_START_CODE_LEN;
                true
            }
            None => {
                // Keep a possible partial start code
                let keep = SHORT_START_CODE_LEN - 1;
                if self.pending.len() > keep {
                    let drop = self.pending.len() - keep;
                    self.dropped_bytes += trim_trailing_zeros(&self.pending[..drop]).len() as u64;
                    self.pending.advance(drop);
                }
                false
            }
        }
    }

    fn push_nal(&mut self, payload: &[u8], units: &mut Vec<Bytes>) {
        let payload = trim_trailing_zeros(payload);
        let Some(&header) = payload.first() else {
            return;
        };

        if header & FORBIDDEN_ZERO_BIT != 0 {
            debug!("Dropped malformed NAL unit ({} bytes)", payload.len());
            self.dropped_nal_units += 1;
            return;
        }

        let nal_type = header & NAL_TYPE_MASK;
        if self.starts_new_unit(payload) {
            self.emit(units);
        }

        trace!("NAL type {} ({} bytes)", nal_type, payload.len());
        self.current.extend_from_slice(&START_CODE);
        self.current.extend_from_slice(payload);
        self.nal_units += 1;
        if is_slice(nal_type) {
            self.current_has_slice = true;
        }

        if matches!(nal_type, NAL_END_OF_SEQUENCE | NAL_END_OF_STREAM) {
            self.emit(units);
        }
    }

    /// Whether a NAL starting with `payload` opens the next access unit
    fn starts_new_unit(&self, payload: &[u8]) -> bool {
        let Some(&header) = payload.first() else {
            return false;
        };
        if !self.current_has_slice || header & FORBIDDEN_ZERO_BIT != 0 {
            return false;
        }
        let nal_type = header & NAL_TYPE_MASK;
        opens_access_unit(nal_type) || (is_slice(nal_type) && is_first_slice(payload))
    }

    fn emit(&mut self, units: &mut Vec<Bytes>) {
        if !self.current.is_empty() {
            units.push(self.current.split().freeze());
        }
        self.current_has_slice = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn nal(payload: &[u8]) -> Vec<u8> {
        let mut out = START_CODE.to_vec();
        out.extend_from_slice(payload);
        out
    }

    fn sps() -> Vec<u8> {
        nal(&[0x67, 0x42, 0xC0, 0x1F])
    }

    fn pps() -> Vec<u8> {
        nal(&[0x68, 0xCE, 0x3C, 0x80])
    }

    fn idr(tag: u8) -> Vec<u8> {
        nal(&[0x65, 0x88, tag, 0x84])
    }

    fn slice(tag: u8) -> Vec<u8> {
        nal(&[0x41, 0x9A, tag, 0x21])
    }

    /// Second slice of a picture: first_mb_in_slice != 0
    fn continuation_slice(tag: u8) -> Vec<u8> {
        nal(&[0x41, 0x4A, tag, 0x21])
    }

    fn stream(parts: &[Vec<u8>]) -> Vec<u8> {
        parts.concat()
    }

    #[test]
    fn test_groups_parameter_sets_with_first_picture() {
        let mut parser = AccessUnitParser::new();
        let data = stream(&[sps(), pps(), idr(1), slice(2)]);

        let units = parser.feed(&data);
        assert_eq!(units.len(), 1);
        assert_eq!(units[0].as_ref(), stream(&[sps(), pps(), idr(1)]).as_slice());

        let tail = parser.flush();
        assert_eq!(tail.len(), 1);
        assert_eq!(tail[0].as_ref(), slice(2).as_slice());
    }

    #[test]
    fn test_byte_by_byte_matches_single_chunk() {
        let data = stream(&[sps(), pps(), idr(1), slice(2), slice(3), slice(4)]);

        let mut whole = AccessUnitParser::new();
        let mut expected = whole.feed(&data);
        expected.extend(whole.flush());

        let mut split = AccessUnitParser::new();
        let mut actual = Vec::new();
        for byte in &data {
            actual.extend(split.feed(std::slice::from_ref(byte)));
        }
        actual.extend(split.flush());

        assert_eq!(expected.len(), 4);
        assert_eq!(expected, actual);
    }

    #[test]
    fn test_multi_slice_picture_stays_together() {
        let mut parser = AccessUnitParser::new();
        let data = stream(&[slice(1), continuation_slice(2), slice(3)]);

        let units = parser.feed(&data);
        assert_eq!(units.len(), 1);
        assert_eq!(
            units[0].as_ref(),
            stream(&[slice(1), continuation_slice(2)]).as_slice()
        );
    }

    #[test]
    fn test_drops_garbage_before_first_start_code() {
        let mut parser = AccessUnitParser::new();
        let mut data = vec![0xAB, 0xCD, 0xEF];
        data.extend(stream(&[idr(1), slice(2)]));

        let units = parser.feed(&data);
        assert_eq!(units.len(), 1);
        assert_eq!(units[0].as_ref(), idr(1).as_slice());
        assert_eq!(parser.dropped_bytes(), 3);
    }

    #[test]
    fn test_drops_nal_with_forbidden_bit() {
        let mut parser = AccessUnitParser::new();
        let data = stream(&[idr(1), nal(&[0xE5, 0x01, 0x02]), slice(2)]);

        let mut units = parser.feed(&data);
        units.extend(parser.flush());

        assert_eq!(units.len(), 2);
        assert_eq!(units[0].as_ref(), idr(1).as_slice());
        assert_eq!(parser.dropped_nal_units(), 1);
    }

    #[test]
    fn test_three_byte_start_codes_are_normalized() {
        let mut parser = AccessUnitParser::new();
        let data = [
            0x00, 0x00, 0x01, 0x65, 0x88, 0x01, 0x84, //
            0x00, 0x00, 0x01, 0x41, 0x9A, 0x02, 0x21,
        ];

        let units = parser.feed(&data);
        assert_eq!(units.len(), 1);
        assert_eq!(units[0].as_ref(), idr(1).as_slice());
        assert_eq!(parser.dropped_bytes(), 0);
    }

    #[test]
    fn test_end_of_stream_closes_unit() {
        let mut parser = AccessUnitParser::new();
        let data = stream(&[idr(1), nal(&[0x0B]), nal(&[0x09, 0xF0])]);

        let units = parser.feed(&data);
        assert_eq!(units.len(), 1);
        assert_eq!(units[0].as_ref(), stream(&[idr(1), nal(&[0x0B])]).as_slice());
    }

    #[test]
    fn test_no_start_code_keeps_waiting() {
        let mut parser = AccessUnitParser::new();
        assert!(parser.feed(&[0x12, 0x34, 0x00]).is_empty());
        assert!(parser.feed(&[0x00]).is_empty());

        let units = parser.feed(&[0x01, 0x65, 0x88, 0x01, 0x84]);
        assert!(units.is_empty());

        let units = parser.flush();
        assert_eq!(units.len(), 1);
        assert_eq!(units[0].as_ref(), idr(1).as_slice());
        assert_eq!(parser.nal_units(), 1);
    }
}
