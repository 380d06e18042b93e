//! Scheduler configuration: plain fields, `Default`, chainable setters
//! consuming and returning `Self`.

#[derive(Clone, Debug)]
pub struct SchedulerConfig {
    max_events_per_tick: usize,
    poll_capacity: usize,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_events_per_tick: 1024,
            poll_capacity: 1024,
        }
    }
}

impl SchedulerConfig {
    pub fn max_events_per_tick(mut self, n: usize) -> Self {
        self.max_events_per_tick = n;
        self
    }

    pub fn poll_capacity(mut self, n: usize) -> Self {
        self.poll_capacity = n;
        self
    }

    pub(crate) fn max_events(&self) -> usize {
        self.max_events_per_tick
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_matches_teacher_style_defaults() {
        let cfg = SchedulerConfig::default();
        assert_eq!(cfg.max_events(), 1024);
    }

    #[test]
    fn setters_chain() {
        let cfg = SchedulerConfig::default().max_events_per_tick(64).poll_capacity(64);
        assert_eq!(cfg.max_events(), 64);
    }
}
