use crate::testcase::TestCase;

use super::{percent_of, StrategyStats};

/// 4-byte little-endian `i32::MIN / 2`-ish edge value AFL's interesting-ints
/// table favors: maximal high bit plus a near-saturated low byte, chosen to
/// provoke sign and boundary errors in arithmetic on the input.
const INTERESTING_WORD: [u8; 4] = [0xFF, 0xFF, 0xFF, 0x7F];

/// Slides a 4-byte window across the buffer, overwriting it with
/// [`INTERESTING_WORD`] at each position.
///
/// Inputs shorter than 4 bytes have no valid window and exhaust immediately.
/// Has no resume marker: always starts at offset 0.
#[derive(Debug)]
pub struct InterestingStrategy {
    seed: TestCase,
    pos: usize,
    len: usize,
}

impl InterestingStrategy {
    pub fn new(seed: TestCase) -> Self {
        let len = seed.data.len();
        Self { seed, pos: 0, len }
    }

    fn last_valid_pos(&self) -> Option<usize> {
        self.len.checked_sub(4)
    }

    pub fn gen_test(&mut self) -> Option<TestCase> {
        let last = self.last_valid_pos()?;
        if self.pos > last {
            return None;
        }

        let mut data = self.seed.data.clone();
        data[self.pos..self.pos + 4].copy_from_slice(&INTERESTING_WORD);
        let mut case = self.seed.derive(format!("interesting at {}", self.pos));
        case.data = data;

        self.pos += 1;
        Some(case)
    }

    pub fn stats(&self) -> StrategyStats {
        match self.last_valid_pos() {
            None => StrategyStats {
                name: "interesting",
                percent_complete: 100,
            },
            Some(last) => StrategyStats {
                name: "interesting",
                percent_complete: percent_of(self.pos.min(last + 1), last + 1),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn slides_the_window_across_the_buffer() {
        let seed = TestCase::new(vec![0u8; 6], "seed");
        let mut strategy = InterestingStrategy::new(seed);

        let first = strategy.gen_test().unwrap();
        assert_eq!(&first.data[0..4], &INTERESTING_WORD);
        assert_eq!(&first.data[4..6], &[0, 0]);

        let second = strategy.gen_test().unwrap();
        assert_eq!(&second.data[1..5], &INTERESTING_WORD);

        let third = strategy.gen_test().unwrap();
        assert_eq!(&third.data[2..6], &INTERESTING_WORD);

        assert!(strategy.gen_test().is_none());
    }

    #[test]
    fn shorter_than_four_bytes_exhausts_immediately() {
        for len in 0..4 {
            let mut strategy = InterestingStrategy::new(TestCase::new(vec![0u8; len], "seed"));
            assert!(strategy.gen_test().is_none());
            assert_eq!(strategy.stats().percent_complete, 100);
        }
    }

    #[test]
    fn exactly_four_bytes_yields_one_case() {
        let mut strategy = InterestingStrategy::new(TestCase::new(vec![0u8; 4], "seed"));
        assert!(strategy.gen_test().is_some());
        assert!(strategy.gen_test().is_none());
    }

    #[test]
    fn ignores_resume_markers() {
        let mut seed = TestCase::new(vec![0u8; 8], "seed");
        seed.start_byte_pos = Some(5);
        let mut strategy = InterestingStrategy::new(seed);
        let first = strategy.gen_test().unwrap();
        assert_eq!(&first.data[0..4], &INTERESTING_WORD);
    }
}
