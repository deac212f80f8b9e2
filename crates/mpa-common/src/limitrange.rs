//! Namespace LimitRange aggregation
//!
//! A namespace may carry several LimitRange objects, each with several
//! items. The recommendation must satisfy all of them at once, so the
//! per-resource aggregate takes the largest `min` and the smallest `max`
//! across every container-type item.

use std::cmp::Ordering;

use k8s_openapi::api::core::v1::LimitRange;

use crate::crd::ResourceList;
use crate::quantity;
use crate::stores::LimitRangeStore;

/// Resources the aggregate tracks bounds for
const BOUNDED_RESOURCES: [&str; 2] = ["cpu", "memory"];

/// Aggregated container limits for one namespace
#[derive(Clone, Debug, Default, PartialEq)]
pub struct AggregatedLimits {
    /// Largest lower bound across all items
    pub min: ResourceList,
    /// Smallest upper bound across all items
    pub max: ResourceList,
    /// Default limit applied to containers that declare none
    pub default: ResourceList,
}

impl AggregatedLimits {
    /// True when no item constrained anything
    pub fn is_empty(&self) -> bool {
        self.min.is_empty() && self.max.is_empty() && self.default.is_empty()
    }
}

/// Union all container-type LimitRange items of a namespace into a single
/// constraint; `None` when nothing constrains containers
pub fn aggregate_container_limits(ranges: &[LimitRange]) -> Option<AggregatedLimits> {
    let mut aggregate = AggregatedLimits::default();

    for range in ranges {
        let Some(spec) = range.spec.as_ref() else {
            continue;
        };
        for item in &spec.limits {
            if item.type_ != "Container" {
                continue;
            }
            if item.min.is_none() && item.max.is_none() && item.default.is_none() {
                continue;
            }
            if let Some(default) = &item.default {
                aggregate.default = default.clone();
            }
            for resource in BOUNDED_RESOURCES {
                if let Some(min) = item.min.as_ref().and_then(|m| m.get(resource)) {
                    merge_bound(&mut aggregate.min, resource, min, Ordering::Greater);
                }
                if let Some(max) = item.max.as_ref().and_then(|m| m.get(resource)) {
                    merge_bound(&mut aggregate.max, resource, max, Ordering::Less);
                }
            }
        }
    }

    (!aggregate.is_empty()).then_some(aggregate)
}

/// Keep the stricter of the existing and incoming bound: `Greater` keeps
/// the larger quantity (lower bounds), `Less` the smaller (upper bounds)
fn merge_bound(
    bounds: &mut ResourceList,
    resource: &str,
    incoming: &k8s_openapi::apimachinery::pkg::api::resource::Quantity,
    keep_when: Ordering,
) {
    match bounds.get(resource) {
        None => {
            bounds.insert(resource.to_string(), incoming.clone());
        }
        Some(current) => {
            if quantity::cmp(incoming, current).map(|o| o == keep_when).unwrap_or(false) {
                bounds.insert(resource.to_string(), incoming.clone());
            }
        }
    }
}

/// Look up the aggregated container limits for a namespace from the
/// watch-backed store
pub fn container_limits_for(store: &LimitRangeStore, namespace: &str) -> Option<AggregatedLimits> {
    let ranges: Vec<LimitRange> = store
        .in_namespace(namespace)
        .into_iter()
        .map(|r| (*r).clone())
        .collect();
    aggregate_container_limits(&ranges)
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::core::v1::{LimitRangeItem, LimitRangeSpec};
    use k8s_openapi::apimachinery::pkg::api::resource::Quantity;

    fn item(
        type_: &str,
        min: Option<&[(&str, &str)]>,
        max: Option<&[(&str, &str)]>,
        default: Option<&[(&str, &str)]>,
    ) -> LimitRangeItem {
        let to_map = |entries: &[(&str, &str)]| {
            entries
                .iter()
                .map(|(k, v)| (k.to_string(), Quantity(v.to_string())))
                .collect()
        };
        LimitRangeItem {
            type_: type_.to_string(),
            min: min.map(to_map),
            max: max.map(to_map),
            default: default.map(to_map),
            ..Default::default()
        }
    }

    fn range(items: Vec<LimitRangeItem>) -> LimitRange {
        LimitRange {
            spec: Some(LimitRangeSpec { limits: items }),
            ..Default::default()
        }
    }

    #[test]
    fn takes_largest_min_and_smallest_max() {
        let ranges = vec![
            range(vec![item(
                "Container",
                Some(&[("cpu", "100m")]),
                Some(&[("cpu", "2")]),
                None,
            )]),
            range(vec![item(
                "Container",
                Some(&[("cpu", "200m")]),
                Some(&[("cpu", "1500m")]),
                None,
            )]),
        ];
        let agg = aggregate_container_limits(&ranges).unwrap();
        assert_eq!(agg.min.get("cpu").unwrap().0, "200m");
        assert_eq!(agg.max.get("cpu").unwrap().0, "1500m");
    }

    #[test]
    fn pod_type_items_are_ignored() {
        let ranges = vec![range(vec![item(
            "Pod",
            Some(&[("cpu", "4")]),
            None,
            None,
        )])];
        assert!(aggregate_container_limits(&ranges).is_none());
    }

    #[test]
    fn default_limit_comes_from_the_last_item() {
        let ranges = vec![
            range(vec![item("Container", None, None, Some(&[("cpu", "500m")]))]),
            range(vec![item("Container", None, None, Some(&[("cpu", "1")]))]),
        ];
        let agg = aggregate_container_limits(&ranges).unwrap();
        assert_eq!(agg.default.get("cpu").unwrap().0, "1");
    }

    #[test]
    fn memory_bounds_are_tracked_independently() {
        let ranges = vec![range(vec![item(
            "Container",
            Some(&[("cpu", "100m"), ("memory", "64Mi")]),
            Some(&[("memory", "512Mi")]),
            None,
        )])];
        let agg = aggregate_container_limits(&ranges).unwrap();
        assert_eq!(agg.min.get("memory").unwrap().0, "64Mi");
        assert_eq!(agg.max.get("memory").unwrap().0, "512Mi");
        assert!(agg.max.get("cpu").is_none());
    }

    #[test]
    fn empty_items_yield_nothing() {
        assert!(aggregate_container_limits(&[]).is_none());
        assert!(aggregate_container_limits(&[range(vec![])]).is_none());
    }
}
