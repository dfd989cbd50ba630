use std::fmt;
use std::thread;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

pub struct HexSlice<T>(pub T)
where
    T: AsRef<[u8]>;

impl<T: AsRef<[u8]>> fmt::Debug for HexSlice<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in self.0.as_ref() {
            write!(f, "{:02X}", byte)?;
        }
        Ok(())
    }
}

/// Wall-clock time in whole seconds.
pub fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

/// Returns a timestamp aligned to a second boundary.
///
/// Samples `t1`, waits until at least one second has passed, and accepts the
/// result only when the wait took no more than one second. Rate samplers use
/// this so a loop started just before a second rollover does not report after
/// a fraction of its interval.
pub fn second_sync() -> u64 {
    loop {
        let t1 = now_secs();
        let mut t2 = now_secs();
        while t2 - t1 < 1 {
            thread::sleep(Duration::from_millis(5));
            t2 = now_secs();
        }
        if t2 - t1 <= 1 {
            return t2;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hex_slice_formats_contiguously() {
        assert_eq!(format!("{:?}", HexSlice([0x0A, 0xFF, 0x00])), "0AFF00");
    }
}
