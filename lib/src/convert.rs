use std::sync::atomic::{AtomicBool, Ordering};

use anyhow::Result;

use crate::format::rip::RipModel;

/// Serializes dump conversions: at most one runs at a time.
///
/// Decoding a dump is comparatively expensive, so captures that arrive while
/// a conversion is still in flight are dropped rather than queued; the
/// caller keeps whatever model it already has and waits for the next
/// capture.
#[derive(Default)]
pub struct RipConverter {
    in_flight: AtomicBool,
}

impl RipConverter {
    pub fn new() -> Self { Self::default() }

    /// Parses `data` unless a conversion is already running, in which case
    /// the capture is dropped and `Ok(None)` is returned. The in-flight
    /// flag is cleared before returning, on success and failure alike.
    pub fn try_convert(&self, data: &[u8]) -> Result<Option<RipModel>> {
        if self.in_flight.swap(true, Ordering::Acquire) {
            log::warn!("Conversion already in flight, dropping capture ({} bytes)", data.len());
            return Ok(None);
        }
        let result = RipModel::parse(data);
        self.in_flight.store(false, Ordering::Release);
        result.map(Some)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::format::rip::{K_DUMP_HEADER_SIZE, K_DUMP_MAGIC};

    fn empty_dump() -> Vec<u8> {
        let mut data = K_DUMP_MAGIC.to_vec();
        data.resize(K_DUMP_HEADER_SIZE, 0);
        data
    }

    #[test]
    fn sequential_conversions_succeed() {
        let converter = RipConverter::new();
        assert!(converter.try_convert(&empty_dump()).unwrap().is_some());
        assert!(converter.try_convert(&empty_dump()).unwrap().is_some());
    }

    #[test]
    fn busy_converter_drops_capture() {
        let converter = RipConverter::new();
        converter.in_flight.store(true, Ordering::Relaxed);
        assert!(converter.try_convert(&empty_dump()).unwrap().is_none());
    }

    #[test]
    fn flag_clears_after_failed_conversion() {
        let converter = RipConverter::new();
        assert!(converter.try_convert(b"not a dump at all, nope").is_err());
        assert!(converter.try_convert(&empty_dump()).unwrap().is_some());
    }
}
