use std::cmp::Ordering;
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::str::FromStr;

use anyhow::{anyhow, Error};
use serde::Serialize;

use crate::detect::Detection;

/// Priority class of a label.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Tier {
    Primary,
    Secondary,
    Tertiary,
}

impl Tier {
    pub const ALL: [Tier; 3] = [Tier::Primary, Tier::Secondary, Tier::Tertiary];

    pub fn name(self) -> &'static str {
        match self {
            Tier::Primary => "primary",
            Tier::Secondary => "secondary",
            Tier::Tertiary => "tertiary",
        }
    }
}

impl fmt::Display for Tier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Tier {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "primary" => Ok(Tier::Primary),
            "secondary" => Ok(Tier::Secondary),
            "tertiary" => Ok(Tier::Tertiary),
            other => Err(anyhow!("unknown tier '{}'", other)),
        }
    }
}

/// Label → tier membership and the priority order used for tie-breaking.
#[derive(Clone, Debug, Default)]
pub struct LabelTiers {
    primary: HashSet<String>,
    secondary: HashSet<String>,
    tertiary: HashSet<String>,
    rank: HashMap<String, usize>,
}

/// Detections split by tier. `unassigned` holds labels in no tier.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Partition {
    pub primary: Vec<Detection>,
    pub secondary: Vec<Detection>,
    pub tertiary: Vec<Detection>,
    pub unassigned: Vec<Detection>,
}

fn label_set<I, S>(labels: I) -> HashSet<String>
where
    I: IntoIterator<Item = S>,
    S: Into<String>,
{
    labels.into_iter().map(Into::into).collect()
}

impl LabelTiers {
    pub fn new<I, S>(primary: I, secondary: I, tertiary: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            primary: label_set(primary),
            secondary: label_set(secondary),
            tertiary: label_set(tertiary),
            rank: HashMap::new(),
        }
    }

    /// Set the priority order. Earlier labels win; repeats keep their first position.
    pub fn with_priority<I, S>(mut self, priority: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.rank.clear();
        for (index, label) in priority.into_iter().map(Into::into).enumerate() {
            self.rank.entry(label).or_insert(index);
        }
        self
    }

    /// Tier of `label`. A label listed in several tiers takes the highest one.
    pub fn tier_of(&self, label: &str) -> Option<Tier> {
        if self.primary.contains(label) {
            Some(Tier::Primary)
        } else if self.secondary.contains(label) {
            Some(Tier::Secondary)
        } else if self.tertiary.contains(label) {
            Some(Tier::Tertiary)
        } else {
            None
        }
    }

    pub fn labels(&self, tier: Tier) -> &HashSet<String> {
        match tier {
            Tier::Primary => &self.primary,
            Tier::Secondary => &self.secondary,
            Tier::Tertiary => &self.tertiary,
        }
    }

    pub fn priority_rank(&self, label: &str) -> Option<usize> {
        self.rank.get(label).copied()
    }

    /// Labels that appear in more than one tier, sorted.
    pub fn overlapping_labels(&self) -> Vec<String> {
        let mut overlaps: Vec<String> = self
            .primary
            .iter()
            .chain(self.secondary.iter())
            .chain(self.tertiary.iter())
            .filter(|label| {
                Tier::ALL
                    .iter()
                    .filter(|tier| self.labels(**tier).contains(*label))
                    .count()
                    > 1
            })
            .cloned()
            .collect();
        overlaps.sort();
        overlaps.dedup();
        overlaps
    }

    /// Order by priority rank, then confidence descending.
    ///
    /// Unranked labels go last and keep their input order.
    pub fn sort_by_priority(&self, detections: &mut [Detection]) {
        detections.sort_by(|a, b| {
            match (self.priority_rank(&a.label), self.priority_rank(&b.label)) {
                (Some(ra), Some(rb)) => ra
                    .cmp(&rb)
                    .then_with(|| b.confidence.total_cmp(&a.confidence)),
                (Some(_), None) => Ordering::Less,
                (None, Some(_)) => Ordering::Greater,
                (None, None) => Ordering::Equal,
            }
        });
    }

    /// Split detections by tier, each tier in priority order.
    pub fn partition(&self, detections: Vec<Detection>) -> Partition {
        let mut out = Partition::default();
        for detection in detections {
            match self.tier_of(&detection.label) {
                Some(Tier::Primary) => out.primary.push(detection),
                Some(Tier::Secondary) => out.secondary.push(detection),
                Some(Tier::Tertiary) => out.tertiary.push(detection),
                None => out.unassigned.push(detection),
            }
        }
        self.sort_by_priority(&mut out.primary);
        self.sort_by_priority(&mut out.secondary);
        self.sort_by_priority(&mut out.tertiary);
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detect::BoundingBox;

    fn det(label: &str, confidence: f32) -> Detection {
        Detection::new(label, 0, confidence, BoundingBox::new(0.0, 0.0, 10.0, 10.0))
    }

    fn labels(detections: &[Detection]) -> Vec<(&str, f32)> {
        detections
            .iter()
            .map(|d| (d.label.as_str(), d.confidence))
            .collect()
    }

    #[test]
    fn scenario_b_partition() {
        let tiers = LabelTiers::new(vec!["door"], vec!["item"], vec![]);
        let part = tiers.partition(vec![det("door", 0.7), det("item", 0.6)]);
        assert_eq!(labels(&part.primary), vec![("door", 0.7)]);
        assert_eq!(labels(&part.secondary), vec![("item", 0.6)]);
        assert!(part.tertiary.is_empty());
        assert!(part.unassigned.is_empty());
    }

    #[test]
    fn partition_is_total_and_disjoint() {
        let tiers = LabelTiers::new(vec!["door", "key"], vec!["item"], vec!["chest"]);
        let input = vec![
            det("door", 0.9),
            det("crate", 0.4),
            det("item", 0.6),
            det("chest", 0.5),
            det("key", 0.8),
            det("item", 0.3),
        ];
        let part = tiers.partition(input.clone());
        let total = part.primary.len()
            + part.secondary.len()
            + part.tertiary.len()
            + part.unassigned.len();
        assert_eq!(total, input.len());
        for d in &input {
            let homes = [
                &part.primary,
                &part.secondary,
                &part.tertiary,
                &part.unassigned,
            ]
            .iter()
            .filter(|list| list.contains(d))
            .count();
            assert_eq!(homes, 1, "{} placed in {} lists", d.label, homes);
        }
    }

    #[test]
    fn priority_then_confidence_with_unlisted_last_in_input_order() {
        let tiers = LabelTiers::new(vec!["a", "b", "x", "y"], vec![], vec![])
            .with_priority(vec!["b", "a"]);
        let mut dets = vec![
            det("y", 0.2),
            det("a", 0.9),
            det("x", 0.95),
            det("b", 0.3),
            det("a", 0.99),
            det("b", 0.6),
        ];
        tiers.sort_by_priority(&mut dets);
        assert_eq!(
            labels(&dets),
            vec![
                ("b", 0.6),
                ("b", 0.3),
                ("a", 0.99),
                ("a", 0.9),
                ("y", 0.2),
                ("x", 0.95),
            ]
        );
    }

    #[test]
    fn overlapping_labels_are_reported() {
        let tiers = LabelTiers::new(vec!["door", "key"], vec!["key"], vec!["door", "x"]);
        assert_eq!(tiers.overlapping_labels(), vec!["door", "key"]);
        assert_eq!(tiers.tier_of("key"), Some(Tier::Primary));
    }

    #[test]
    fn tier_names_parse() -> anyhow::Result<()> {
        assert_eq!("Secondary".parse::<Tier>()?, Tier::Secondary);
        assert!("fourth".parse::<Tier>().is_err());
        Ok(())
    }
}
