use crate::result::*;

/// A checked cast from u64 to usize
///
/// Declared sizes come straight out of archive headers,
/// so on 32-bit targets they can exceed what we can buffer.
pub fn usize<I: Into<u64>>(i: I) -> IngestResult<usize> {
    let i: u64 = i.into();
    if cfg!(target_pointer_width = "64") {
        Ok(i as usize)
    } else if i > usize::MAX as u64 {
        Err(IngestError::InsufficientAddressSpace)
    } else {
        Ok(i as usize)
    }
}

/// Rounds `size` up to the next multiple of `block`.
pub fn round_up(size: u64, block: u64) -> u64 {
    match size % block {
        0 => size,
        rem => size.saturating_add(block - rem),
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_round_up() {
        assert_eq!(round_up(0, 512), 0);
        assert_eq!(round_up(1, 512), 512);
        assert_eq!(round_up(512, 512), 512);
        assert_eq!(round_up(2000, 512), 2048);
    }
}
