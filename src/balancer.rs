//! Group item selection. Items arrive pre-sorted by (priority asc,
//! insertion order); the balancer picks a starting item and, on failure,
//! yields the next candidate under the group's policy. Everything is
//! stateless across requests except the round-robin cursor, which is
//! process-wide per group and advanced atomically.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use rand::Rng;

use crate::store::{BalanceMode, Group, GroupItem};

#[derive(Default)]
pub struct BalancerRegistry {
    cursors: std::sync::Mutex<HashMap<i64, Arc<AtomicUsize>>>,
}

impl BalancerRegistry {
    pub fn rotation(&self, group: &Group) -> Rotation {
        let cursor = match group.mode {
            BalanceMode::RoundRobin => {
                let mut cursors = self.cursors.lock().expect("cursor lock poisoned");
                Some(cursors.entry(group.id).or_default().clone())
            }
            _ => None,
        };
        Rotation {
            mode: group.mode,
            cursor,
            tried: Vec::new(),
        }
    }
}

pub struct Rotation {
    mode: BalanceMode,
    /// Shared round-robin cursor; advanced atomically on every `select`.
    cursor: Option<Arc<AtomicUsize>>,
    tried: Vec<usize>,
}

impl Rotation {
    /// The first candidate of a round.
    pub fn select(&mut self, items: &[GroupItem]) -> Option<usize> {
        if items.is_empty() {
            return None;
        }
        self.tried.clear();
        let index = match self.mode {
            BalanceMode::Priority => 0,
            BalanceMode::RoundRobin => {
                let cursor = self.cursor.as_ref()?;
                cursor.fetch_add(1, Ordering::Relaxed) % items.len()
            }
            BalanceMode::Weighted => draw_weighted(items, &[])?,
            BalanceMode::Random => rand::rng().random_range(0..items.len()),
        };
        self.tried.push(index);
        Some(index)
    }

    /// The candidate after `current` within the same round, excluding
    /// everything already tried for the weighted and random policies.
    pub fn next(&mut self, items: &[GroupItem], current: usize) -> Option<usize> {
        if items.is_empty() {
            return None;
        }
        let index = match self.mode {
            BalanceMode::Priority => {
                let next = current + 1;
                (next < items.len()).then_some(next)
            }
            BalanceMode::RoundRobin => Some((current + 1) % items.len()),
            BalanceMode::Weighted => draw_weighted(items, &self.tried),
            BalanceMode::Random => {
                let remaining: Vec<usize> = (0..items.len())
                    .filter(|index| !self.tried.contains(index))
                    .collect();
                if remaining.is_empty() {
                    None
                } else {
                    Some(remaining[rand::rng().random_range(0..remaining.len())])
                }
            }
        }?;
        self.tried.push(index);
        Some(index)
    }
}

fn draw_weighted(items: &[GroupItem], exclude: &[usize]) -> Option<usize> {
    let candidates: Vec<usize> = (0..items.len())
        .filter(|index| !exclude.contains(index))
        .filter(|index| items[*index].weight > 0)
        .collect();
    if candidates.is_empty() {
        // All weights zero (or everything tried): fall back to the first
        // untried item so a misconfigured group stays routable.
        return (0..items.len()).find(|index| !exclude.contains(index));
    }
    let total: i64 = candidates.iter().map(|index| items[*index].weight).sum();
    let mut pick = rand::rng().random_range(0..total);
    for index in candidates {
        let weight = items[index].weight;
        if pick < weight {
            return Some(index);
        }
        pick -= weight;
    }
    None
}
