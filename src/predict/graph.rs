//! Navigation history and next-screen prediction sets.
//!
//! The graph is plain data: every method takes the current time, so it can be
//! driven deterministically from tests. [`super::preloader::SmartPreloader`]
//! wraps it with a lock and a clock.

use std::collections::{HashMap, VecDeque};
use std::time::Duration;

use tracing::debug;

use crate::clock::{hour_of_day, Timestamp};
use crate::config::PredictorConfig;

pub struct NavigationGraph {
    config: PredictorConfig,
    history: VecDeque<String>,
    frequency: HashMap<String, u64>,
    /// Source screen -> candidates in insertion order, without duplicates.
    predictions: HashMap<String, Vec<String>>,
    last_visit: HashMap<String, Timestamp>,
}

impl NavigationGraph {
    pub fn new(config: PredictorConfig) -> Self {
        Self {
            history: VecDeque::with_capacity(config.history_capacity),
            config,
            frequency: HashMap::new(),
            predictions: HashMap::new(),
            last_visit: HashMap::new(),
        }
    }

    /// Record a visit to `screen`. Returns the screen whose predictions were
    /// recomputed (the previous one in history), if any.
    pub fn track(&mut self, screen: &str, now: Timestamp) -> Option<String> {
        self.history.push_back(screen.to_string());
        while self.history.len() > self.config.history_capacity.max(1) {
            self.history.pop_front();
        }
        *self.frequency.entry(screen.to_string()).or_insert(0) += 1;
        self.last_visit.insert(screen.to_string(), now);

        if self.history.len() < 2 {
            return None;
        }
        let previous = self.history[self.history.len() - 2].clone();
        let candidates = self.candidates_for(&previous, now);
        debug!(screen = %previous, candidates = candidates.len(), "Recomputed predictions");
        self.predictions.insert(previous.clone(), candidates);
        Some(previous)
    }

    fn candidates_for(&self, source: &str, now: Timestamp) -> Vec<String> {
        let mut out: Vec<String> = Vec::new();
        let mut push = |candidate: &str| {
            if candidate == source && !self.config.allow_self_prediction {
                return;
            }
            if !out.iter().any(|c| c == candidate) {
                out.push(candidate.to_string());
            }
        };

        // Screens that directly followed `source`, most recent first.
        let history: Vec<&String> = self.history.iter().collect();
        for pair in history.windows(2).rev() {
            if pair[0] == source {
                push(pair[1]);
            }
        }

        for candidate in self.frequent_not_recent() {
            push(&candidate);
        }

        let hour = hour_of_day(now, self.config.utc_offset_minutes);
        for bucket in self.config.time_buckets.values() {
            if bucket.hours.contains(hour) {
                for candidate in &bucket.screens {
                    push(candidate);
                }
            }
        }

        out
    }

    /// The top-N most visited screens that are not among the last few visits.
    /// Ties go to the alphabetically first screen.
    fn frequent_not_recent(&self) -> Vec<String> {
        let recent: Vec<&String> = self
            .history
            .iter()
            .rev()
            .take(self.config.recent_window)
            .collect();

        let mut ranked: Vec<(&String, u64)> = self
            .frequency
            .iter()
            .filter(|(screen, _)| !recent.contains(screen))
            .map(|(screen, count)| (screen, *count))
            .collect();
        ranked.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(b.0)));
        ranked
            .into_iter()
            .take(self.config.frequency_top_n)
            .map(|(screen, _)| screen.clone())
            .collect()
    }

    /// Predicted next screens for `screen`, best first. Empty if unknown.
    pub fn predictions(&self, screen: &str) -> &[String] {
        self.predictions.get(screen).map_or(&[], Vec::as_slice)
    }

    /// Forget screens not visited within the retention window. Returns how
    /// many screens were forgotten.
    pub fn purge(&mut self, now: Timestamp) -> usize {
        let retention = self.config.retention().as_millis() as u64;
        let expired: Vec<String> = self
            .last_visit
            .iter()
            .filter(|(_, at)| now.saturating_sub(**at) > retention)
            .map(|(screen, _)| screen.clone())
            .collect();

        for screen in &expired {
            self.last_visit.remove(screen);
            self.frequency.remove(screen);
            self.predictions.remove(screen);
        }
        if !expired.is_empty() {
            for candidates in self.predictions.values_mut() {
                candidates.retain(|c| !expired.contains(c));
            }
        }
        expired.len()
    }

    pub fn history(&self) -> impl Iterator<Item = &str> {
        self.history.iter().map(String::as_str)
    }

    pub fn visits(&self, screen: &str) -> u64 {
        self.frequency.get(screen).copied().unwrap_or(0)
    }

    /// Screens currently tracked.
    pub fn len(&self) -> usize {
        self.last_visit.len()
    }

    pub fn is_empty(&self) -> bool {
        self.last_visit.is_empty()
    }

    pub fn retention(&self) -> Duration {
        self.config.retention()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// 1970-01-01T08:00Z, inside the default morning bucket.
    const MORNING: Timestamp = 8 * 3_600_000;

    fn graph() -> NavigationGraph {
        NavigationGraph::new(PredictorConfig::default())
    }

    fn walk(graph: &mut NavigationGraph, screens: &[&str], start: Timestamp) {
        for (i, s) in screens.iter().enumerate() {
            graph.track(s, start + i as u64 * 1_000);
        }
    }

    #[test]
    fn test_single_visit_predicts_nothing() {
        let mut g = graph();
        assert_eq!(g.track("A", MORNING), None);
        assert!(g.predictions("A").is_empty());
        assert!(g.predictions("never-seen").is_empty());
    }

    #[test]
    fn test_alternating_walk() {
        let mut g = graph();
        walk(&mut g, &["A", "B", "A", "B", "C"], MORNING);

        assert_eq!(g.predictions("A").first().map(String::as_str), Some("B"));

        // B was followed by C and then A; the morning table adds home and trending.
        let b = g.predictions("B");
        assert_eq!(b, ["C", "A", "home", "trending"]);
    }

    #[test]
    fn test_frequency_skips_recent_screens() {
        let mut g = graph();
        walk(&mut g, &["feed", "feed", "feed", "X"], MORNING);
        // Push "feed" out of the last five visits.
        walk(&mut g, &["p1", "p2", "p3", "p4", "p5"], MORNING + 10_000);

        let p4 = g.predictions("p4");
        assert_eq!(p4[0], "p5");
        assert_eq!(p4[1], "feed");
        assert!(p4.contains(&"X".to_string()));
    }

    #[test]
    fn test_self_prediction_filtered_by_default() {
        let mut g = graph();
        walk(&mut g, &["home", "home"], MORNING);
        assert!(!g.predictions("home").contains(&"home".to_string()));

        let mut allowed = NavigationGraph::new(PredictorConfig {
            allow_self_prediction: true,
            ..Default::default()
        });
        walk(&mut allowed, &["home", "home"], MORNING);
        assert_eq!(allowed.predictions("home")[0], "home");
    }

    #[test]
    fn test_history_is_bounded() {
        let mut g = graph();
        for i in 0..50 {
            g.track(&format!("s{i}"), MORNING + i);
        }
        assert_eq!(g.history().count(), 20);
        assert_eq!(g.history().next(), Some("s30"));
    }

    #[test]
    fn test_purge_forgets_idle_screens() {
        let mut g = graph();
        walk(&mut g, &["A", "B"], MORNING);
        g.track("C", MORNING + 4 * 60_000);

        // A and B were last seen more than five minutes ago; C was not.
        let purged = g.purge(MORNING + 6 * 60_000);
        assert_eq!(purged, 2);
        assert_eq!(g.visits("A"), 0);
        assert!(g.predictions("A").is_empty());
        assert!(g.predictions("B").is_empty());
        assert_eq!(g.visits("C"), 1);
        assert_eq!(g.len(), 1);
    }
}
