//! Per-page outbound link budget.

use linkweave_shared::PlannerConfig;

/// `clamp(round(word_count / words_per_link), min_budget, max_budget)`,
/// rounding halves up. Identical for every page role.
pub fn link_budget(word_count: usize, config: &PlannerConfig) -> usize {
    let per_link = config.words_per_link.max(1);
    let raw = (word_count + per_link / 2) / per_link;
    raw.clamp(config.min_budget, config.max_budget.max(config.min_budget))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn budget_rounds_and_clamps() {
        let cfg = PlannerConfig::default();
        assert_eq!(link_budget(0, &cfg), 3);
        assert_eq!(link_budget(900, &cfg), 4);
        assert_eq!(link_budget(1_124, &cfg), 4);
        assert_eq!(link_budget(1_125, &cfg), 5);
        assert_eq!(link_budget(10_000, &cfg), 5);
    }

    #[test]
    fn budget_follows_configured_bounds() {
        let cfg = PlannerConfig {
            min_budget: 1,
            max_budget: 8,
            words_per_link: 100,
            ..PlannerConfig::default()
        };
        assert_eq!(link_budget(40, &cfg), 1);
        assert_eq!(link_budget(650, &cfg), 7);
    }
}
