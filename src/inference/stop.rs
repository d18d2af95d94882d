//! Stop-string ("anti-prompt") filtering
//!
//! Generated pieces pass through a [`StopFilter`] before they reach the
//! consumer. Text that could still turn out to be the beginning of a stop
//! string is held back until the next piece settles it, so a stop string is
//! never partially emitted.

/// Result of feeding one piece into the filter
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Filtered {
    /// Text that is now safe to emit (may be empty)
    pub text: String,
    /// A stop string matched; generation must end
    pub stopped: bool,
}

/// Incremental stop-string matcher over the accumulated output
#[derive(Debug, Clone)]
pub struct StopFilter {
    stops: Vec<String>,
    pending: String,
    stopped: bool,
}

impl StopFilter {
    pub fn new(stops: &[String]) -> Self {
        Self {
            stops: stops.iter().filter(|s| !s.is_empty()).cloned().collect(),
            pending: String::new(),
            stopped: false,
        }
    }

    /// Feeds the next generated piece.
    ///
    /// Once a stop string has matched every further call returns an empty,
    /// stopped result.
    pub fn push(&mut self, piece: &str) -> Filtered {
        if self.stopped {
            return Filtered {
                text: String::new(),
                stopped: true,
            };
        }
        if self.stops.is_empty() {
            return Filtered {
                text: piece.to_string(),
                stopped: false,
            };
        }

        self.pending.push_str(piece);

        if let Some(at) = self.earliest_match() {
            self.pending.truncate(at);
            self.stopped = true;
            return Filtered {
                text: std::mem::take(&mut self.pending),
                stopped: true,
            };
        }

        let keep = self.held_back_len();
        let release = self.pending.len() - keep;
        let rest = self.pending.split_off(release);
        let text = std::mem::replace(&mut self.pending, rest);
        Filtered {
            text,
            stopped: false,
        }
    }

    /// Releases whatever is still held back once the model has finished on
    /// its own.
    pub fn finish(&mut self) -> String {
        std::mem::take(&mut self.pending)
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped
    }

    fn earliest_match(&self) -> Option<usize> {
        self.stops
            .iter()
            .filter_map(|stop| self.pending.find(stop.as_str()))
            .min()
    }

    /// Length of the longest suffix of `pending` that is a proper prefix of a
    /// stop string
    fn held_back_len(&self) -> usize {
        let mut longest = 0;
        for stop in &self.stops {
            for k in (1..stop.len()).rev() {
                if k <= longest {
                    break;
                }
                if stop.is_char_boundary(k) && self.pending.ends_with(&stop[..k]) {
                    longest = k;
                    break;
                }
            }
        }
        longest
    }
}
