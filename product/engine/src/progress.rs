/// Decides which progress samples of a single run get applied.
///
/// Samples below the last applied value are dropped, and once 100 has been
/// applied further 100s are dropped too. A fresh gate starts at 0, so every
/// new run begins from zero regardless of what the previous run reached.
#[derive(Debug, Clone, Default)]
pub struct ProgressGate {
    last: f64,
    reached_full: bool,
}

impl ProgressGate {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns true if `percent` should be applied.
    pub fn accept(&mut self, percent: f64) -> bool {
        if !percent.is_finite() {
            return false;
        }
        let percent = percent.clamp(0.0, 100.0);
        if percent < self.last {
            return false;
        }
        if self.reached_full && percent >= 100.0 {
            return false;
        }

        self.last = percent;
        if percent >= 100.0 {
            self.reached_full = true;
        }
        true
    }
}
