use crate::testcase::TestCase;

use super::{percent_of, StrategyStats};

/// At each start position, grows a run of `0xFF` bytes of increasing length
/// (1, 2, 3, ...) until the run would cross the end of the buffer, then
/// advances to the next start position and resets the run length to 1.
///
/// Has no resume marker: always starts at position 0.
#[derive(Debug)]
pub struct RunsStrategy {
    seed: TestCase,
    pos: usize,
    run_len: usize,
    len: usize,
}

impl RunsStrategy {
    pub fn new(seed: TestCase) -> Self {
        let len = seed.data.len();
        Self {
            seed,
            pos: 0,
            run_len: 1,
            len,
        }
    }

    pub fn gen_test(&mut self) -> Option<TestCase> {
        loop {
            if self.pos >= self.len {
                return None;
            }
            if self.pos + self.run_len > self.len {
                self.pos += 1;
                self.run_len = 1;
                continue;
            }

            let mut data = self.seed.data.clone();
            for byte in &mut data[self.pos..self.pos + self.run_len] {
                *byte = 0xFF;
            }
            let mut case = self
                .seed
                .derive(format!("runs at {} len {}", self.pos, self.run_len));
            case.data = data;

            self.run_len += 1;
            return Some(case);
        }
    }

    pub fn stats(&self) -> StrategyStats {
        // Total number of (pos, run_len) pairs with pos + run_len <= len is
        // sum_{p=0}^{len-1} (len - p) == len * (len + 1) / 2.
        let total = self.len * (self.len + 1) / 2;
        // Pairs already emitted: every run_len for positions before `pos`,
        // plus `run_len - 1` completed run lengths at the current position.
        let done = self.pos * self.len - self.pos * (self.pos.saturating_sub(1)) / 2
            + self.run_len.saturating_sub(1);
        StrategyStats {
            name: "runs",
            percent_complete: percent_of(done, total),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn grows_the_run_until_it_would_cross_the_end() {
        let seed = TestCase::new(vec![0u8; 3], "seed");
        let mut strategy = RunsStrategy::new(seed);

        let first = strategy.gen_test().unwrap();
        assert_eq!(first.data, vec![0xFF, 0, 0]);

        let second = strategy.gen_test().unwrap();
        assert_eq!(second.data, vec![0xFF, 0xFF, 0]);

        let third = strategy.gen_test().unwrap();
        assert_eq!(third.data, vec![0xFF, 0xFF, 0xFF]);

        // Run length 4 would cross the end of a 3-byte buffer from pos 0;
        // advance to pos 1.
        let fourth = strategy.gen_test().unwrap();
        assert_eq!(fourth.data, vec![0, 0xFF, 0]);

        let fifth = strategy.gen_test().unwrap();
        assert_eq!(fifth.data, vec![0, 0xFF, 0xFF]);

        let sixth = strategy.gen_test().unwrap();
        assert_eq!(sixth.data, vec![0, 0, 0xFF]);

        assert!(strategy.gen_test().is_none());
    }

    #[test]
    fn empty_seed_exhausts_immediately() {
        let mut strategy = RunsStrategy::new(TestCase::new(vec![], "seed"));
        assert!(strategy.gen_test().is_none());
    }

    #[test]
    fn single_byte_seed_yields_one_case() {
        let mut strategy = RunsStrategy::new(TestCase::new(vec![0u8], "seed"));
        let only = strategy.gen_test().unwrap();
        assert_eq!(only.data, vec![0xFF]);
        assert!(strategy.gen_test().is_none());
    }

    #[test]
    fn reaches_100_percent_on_exhaustion() {
        let mut strategy = RunsStrategy::new(TestCase::new(vec![0u8; 4], "seed"));
        while strategy.gen_test().is_some() {}
        assert_eq!(strategy.stats().percent_complete, 100);
    }

    #[test]
    fn ignores_resume_markers() {
        let mut seed = TestCase::new(vec![0u8; 4], "seed");
        seed.start_byte_pos = Some(2);
        let mut strategy = RunsStrategy::new(seed);
        let first = strategy.gen_test().unwrap();
        assert_eq!(first.data, vec![0xFF, 0, 0, 0]);
    }
}
