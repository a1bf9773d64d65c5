/// Round up `n` to the nearest multiple of `to`
pub const fn round_up(n: usize, to: usize) -> usize {
    to * ((n + to - 1) / to)
}

/// [`round_up()`], but `None` instead of wrapping when `n` is close to
/// `usize::MAX`
pub const fn checked_round_up(n: usize, to: usize) -> Option<usize> {
    match n.checked_add(to - 1) {
        Some(n) => Some(to * (n / to)),
        None => None,
    }
}

/// Test if `addr` is a multiple of `align`
pub const fn aligned_to(addr: usize, align: usize) -> bool {
    addr % align == 0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    pub fn round_up_computes_correctly() {
        assert_eq!(round_up(0, 16), 0);
        assert_eq!(round_up(1, 16), 16);
        assert_eq!(round_up(16, 16), 16);
        assert_eq!(round_up(17, 16), 32);
        assert_eq!(round_up(24, 32), 32);
    }

    #[test]
    pub fn checked_round_up_reports_overflow() {
        assert_eq!(checked_round_up(17, 16), Some(32));
        assert_eq!(checked_round_up(usize::MAX - 3, 16), None);
        assert_eq!(checked_round_up(usize::MAX - 15, 16), Some(usize::MAX - 15));
    }

    #[test]
    pub fn aligned_to_checks_multiples() {
        assert!(aligned_to(4096, 4096));
        assert!(aligned_to(0, 64));
        assert!(!aligned_to(4104, 16));
    }
}
