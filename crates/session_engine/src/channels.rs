use tracing::warn;

use crate::participant::ChannelId;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChannelCounts {
    counts: Vec<u32>,
}

impl ChannelCounts {
    pub fn new(channel_count: usize) -> Self {
        Self {
            counts: vec![0; channel_count],
        }
    }

    pub fn from_counts(counts: Vec<u32>) -> Self {
        Self { counts }
    }

    pub fn len(&self) -> usize {
        self.counts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.counts.is_empty()
    }

    pub fn get(&self, channel: ChannelId) -> u32 {
        self.counts.get(channel.index()).copied().unwrap_or(0)
    }

    pub fn as_slice(&self) -> &[u32] {
        &self.counts
    }

    pub fn total(&self) -> u64 {
        self.counts.iter().map(|count| u64::from(*count)).sum()
    }

    /// Moves one occupant from `from` to `to` in a single step and returns the
    /// `(channel, new_count)` pairs that changed. Either side may be `None`
    /// for joins and leaves.
    pub(crate) fn transfer(
        &mut self,
        from: Option<ChannelId>,
        to: Option<ChannelId>,
    ) -> Vec<(usize, u32)> {
        if from == to {
            return Vec::new();
        }
        let mut changed = Vec::with_capacity(2);
        if let Some(channel) = from {
            let index = channel.index();
            self.ensure_len(index + 1);
            if self.counts[index] == 0 {
                warn!(channel = index, "channel_count_underflow_clamped");
            }
            self.counts[index] = self.counts[index].saturating_sub(1);
            changed.push((index, self.counts[index]));
        }
        if let Some(channel) = to {
            let index = channel.index();
            self.ensure_len(index + 1);
            self.counts[index] = self.counts[index].saturating_add(1);
            changed.push((index, self.counts[index]));
        }
        changed
    }

    fn ensure_len(&mut self, len: usize) {
        if self.counts.len() < len {
            self.counts.resize(len, 0);
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChannelBalancer {
    capacity: u32,
    strict_mode: bool,
}

impl ChannelBalancer {
    pub fn new(capacity: u32, strict_mode: bool) -> Self {
        Self {
            capacity,
            strict_mode,
        }
    }

    pub fn capacity(&self) -> u32 {
        self.capacity
    }

    pub fn strict_mode(&self) -> bool {
        self.strict_mode
    }

    pub fn set_strict_mode(&mut self, strict_mode: bool) {
        self.strict_mode = strict_mode;
    }

    pub fn best_channel(&self, counts: &ChannelCounts) -> ChannelId {
        if self.strict_mode || counts.is_empty() {
            return ChannelId(0);
        }
        let slice = counts.as_slice();
        if let Some(index) = slice.iter().position(|count| *count < self.capacity) {
            return ChannelId(index as u16);
        }
        let mut best = 0usize;
        for (index, count) in slice.iter().enumerate() {
            if *count < slice[best] {
                best = index;
            }
        }
        ChannelId(best as u16)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_fit_skips_full_channels() {
        let balancer = ChannelBalancer::new(15, false);
        let counts = ChannelCounts::from_counts(vec![15, 3, 0]);
        assert_eq!(balancer.best_channel(&counts), ChannelId(1));
    }

    #[test]
    fn first_fit_prefers_lowest_index_even_if_busier() {
        let balancer = ChannelBalancer::new(15, false);
        let counts = ChannelCounts::from_counts(vec![14, 0]);
        assert_eq!(balancer.best_channel(&counts), ChannelId(0));
    }

    #[test]
    fn all_full_picks_minimum_with_lowest_index_tie_break() {
        let balancer = ChannelBalancer::new(2, false);
        let counts = ChannelCounts::from_counts(vec![4, 3, 3, 5]);
        assert_eq!(balancer.best_channel(&counts), ChannelId(1));
    }

    #[test]
    fn strict_mode_uses_single_shard() {
        let balancer = ChannelBalancer::new(1, true);
        let counts = ChannelCounts::from_counts(vec![9, 0]);
        assert_eq!(balancer.best_channel(&counts), ChannelId(0));
    }

    #[test]
    fn transfer_moves_in_one_step() {
        let mut counts = ChannelCounts::from_counts(vec![2, 1]);
        let changed = counts.transfer(Some(ChannelId(0)), Some(ChannelId(1)));
        assert_eq!(changed, vec![(0, 1), (1, 2)]);
        assert_eq!(counts.total(), 3);
    }

    #[test]
    fn transfer_same_channel_is_noop() {
        let mut counts = ChannelCounts::from_counts(vec![2]);
        assert!(counts
            .transfer(Some(ChannelId(0)), Some(ChannelId(0)))
            .is_empty());
        assert_eq!(counts.as_slice(), &[2]);
    }

    #[test]
    fn transfer_grows_for_unknown_channel_and_clamps_underflow() {
        let mut counts = ChannelCounts::new(1);
        counts.transfer(None, Some(ChannelId(3)));
        assert_eq!(counts.as_slice(), &[0, 0, 0, 1]);
        counts.transfer(Some(ChannelId(0)), None);
        assert_eq!(counts.get(ChannelId(0)), 0);
    }
}
