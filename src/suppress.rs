use crate::error::Direction;

/// Per-instance "already printed this error" bookkeeping.
///
/// With `suppress_repeats` off every error is reported. With it on, only the
/// first error of a run is reported for each direction; a successful transfer
/// in that direction ends the run.
#[derive(Debug, Default, Clone)]
pub struct ErrorSuppression {
    suppress_repeats: bool,
    read_reported: bool,
    write_reported: bool,
    diagnostics: [u64; 2],
}

impl ErrorSuppression {
    pub fn new(suppress_repeats: bool) -> Self {
        Self {
            suppress_repeats,
            ..Self::default()
        }
    }

    /// Record an error and decide whether it should be surfaced.
    pub fn should_report(&mut self, direction: Direction) -> bool {
        let suppress = self.suppress_repeats;
        let reported = self.flag(direction);
        let report = !(suppress && *reported);
        *reported = true;
        if report {
            self.diagnostics[direction as usize] += 1;
        }
        report
    }

    /// A transfer in `direction` succeeded.
    pub fn reset(&mut self, direction: Direction) {
        *self.flag(direction) = false;
    }

    pub fn is_reported(&self, direction: Direction) -> bool {
        match direction {
            Direction::Read => self.read_reported,
            Direction::Write => self.write_reported,
        }
    }

    /// Number of diagnostics surfaced so far in `direction`.
    pub fn diagnostics(&self, direction: Direction) -> u64 {
        self.diagnostics[direction as usize]
    }

    fn flag(&mut self, direction: Direction) -> &mut bool {
        match direction {
            Direction::Read => &mut self.read_reported,
            Direction::Write => &mut self.write_reported,
        }
    }
}
