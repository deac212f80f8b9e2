//! Proportional request:limit scaling
//!
//! When admission rewrites a container's requests to the recommended
//! target, the limit follows so that the original request:limit ratio is
//! preserved. The arithmetic runs in 128-bit milli-units and saturates at
//! `i64::MAX` milli rather than overflowing.

use k8s_openapi::apimachinery::pkg::api::resource::Quantity;

use crate::crd::ResourceList;
use crate::quantity::{format_milli, parse_milli};

/// Resources carried through the proportional computation
const SCALED_RESOURCES: [&str; 2] = ["cpu", "memory"];

/// Requests and limits computed for one container
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ContainerResources {
    /// New `resources.requests`
    pub requests: ResourceList,
    /// New `resources.limits`
    pub limits: ResourceList,
}

/// Compute the limit that keeps the original request:limit ratio once
/// requests become `recommended_request`.
///
/// Returns `None` when no resource produced a limit; the caller then sets
/// the limit equal to the request. Annotations record saturation events.
pub fn proportional_limit(
    original_limit: Option<&ResourceList>,
    original_request: Option<&ResourceList>,
    recommended_request: &ResourceList,
    default_limit: Option<&ResourceList>,
) -> (Option<ResourceList>, Vec<String>) {
    let mut result = ResourceList::new();
    let mut annotations = Vec::new();

    for resource in SCALED_RESOURCES {
        let scaled = proportional_resource_limit(
            resource,
            original_limit.and_then(|l| l.get(resource)),
            original_request.and_then(|r| r.get(resource)),
            recommended_request.get(resource),
            default_limit.and_then(|d| d.get(resource)),
        );
        if let Some((limit, overflowed)) = scaled {
            if overflowed {
                annotations.push(format!(
                    "{resource}: failed to keep limit proportional to request; capping limit to int64"
                ));
            }
            result.insert(resource.to_string(), limit);
        }
    }

    if result.is_empty() {
        (None, annotations)
    } else {
        (Some(result), annotations)
    }
}

/// Per-resource proportional limit; returns the quantity and whether the
/// multiplication saturated
fn proportional_resource_limit(
    resource: &str,
    original_limit: Option<&Quantity>,
    original_request: Option<&Quantity>,
    recommended_request: Option<&Quantity>,
    default_limit: Option<&Quantity>,
) -> Option<(Quantity, bool)> {
    let milli = |q: Option<&Quantity>| q.and_then(|q| parse_milli(q).ok()).unwrap_or(0);

    let mut limit = milli(original_limit);
    // An unset limit falls back to the namespace default
    if limit == 0 {
        limit = milli(default_limit);
    }
    if limit == 0 {
        return None;
    }

    let recommended = milli(recommended_request);
    if recommended == 0 {
        return None;
    }

    let request = milli(original_request);
    // No original request, or request == limit: the ratio is 1:1
    if request == 0 || request == limit {
        return Some((format_milli(recommended), false));
    }

    let scaled = (limit as i128) * (recommended as i128) / (request as i128);
    if scaled > i64::MAX as i128 {
        tracing::warn!(
            resource,
            limit,
            request,
            recommended,
            "proportional limit overflows int64 milli-units, saturating"
        );
        Some((format_milli(i64::MAX), true))
    } else {
        Some((format_milli(scaled as i64), false))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn list(entries: &[(&str, &str)]) -> ResourceList {
        entries
            .iter()
            .map(|(k, v)| (k.to_string(), Quantity(v.to_string())))
            .collect()
    }

    /// requests.cpu=100m, limits.cpu=200m, target 150m -> limit 300m
    #[test]
    fn limit_scales_with_the_request_ratio() {
        let (limit, annotations) = proportional_limit(
            Some(&list(&[("cpu", "200m")])),
            Some(&list(&[("cpu", "100m")])),
            &list(&[("cpu", "150m")]),
            None,
        );
        assert_eq!(limit.unwrap().get("cpu").unwrap().0, "300m");
        assert!(annotations.is_empty());
    }

    #[test]
    fn equal_request_and_limit_yield_the_target() {
        let (limit, _) = proportional_limit(
            Some(&list(&[("cpu", "100m")])),
            Some(&list(&[("cpu", "100m")])),
            &list(&[("cpu", "1500m")]),
            None,
        );
        assert_eq!(limit.unwrap().get("cpu").unwrap().0, "1500m");
    }

    #[test]
    fn missing_request_yields_the_target() {
        let (limit, _) = proportional_limit(
            Some(&list(&[("cpu", "2")])),
            None,
            &list(&[("cpu", "750m")]),
            None,
        );
        assert_eq!(limit.unwrap().get("cpu").unwrap().0, "750m");
    }

    #[test]
    fn missing_limit_falls_back_to_the_namespace_default() {
        let (limit, _) = proportional_limit(
            None,
            Some(&list(&[("cpu", "100m")])),
            &list(&[("cpu", "200m")]),
            Some(&list(&[("cpu", "400m")])),
        );
        // default 400m with request 100m: ratio 4 -> 800m
        assert_eq!(limit.unwrap().get("cpu").unwrap().0, "800m");
    }

    #[test]
    fn no_limit_and_no_default_yields_none() {
        let (limit, _) = proportional_limit(
            None,
            Some(&list(&[("cpu", "100m")])),
            &list(&[("cpu", "200m")]),
            None,
        );
        assert!(limit.is_none());
    }

    #[test]
    fn zero_target_yields_none() {
        let (limit, _) = proportional_limit(
            Some(&list(&[("cpu", "200m")])),
            Some(&list(&[("cpu", "100m")])),
            &list(&[("cpu", "0")]),
            None,
        );
        assert!(limit.is_none());
    }

    #[test]
    fn overflow_saturates_and_annotates() {
        let huge = format!("{}m", i64::MAX / 2);
        let (limit, annotations) = proportional_limit(
            Some(&list(&[("cpu", &huge)])),
            Some(&list(&[("cpu", "1m")])),
            &list(&[("cpu", "1000m")]),
            None,
        );
        assert_eq!(
            limit.unwrap().get("cpu").unwrap().0,
            format!("{}m", i64::MAX)
        );
        assert_eq!(annotations.len(), 1);
        assert!(annotations[0].contains("cpu"));
    }

    #[test]
    fn memory_is_scaled_alongside_cpu() {
        let (limit, _) = proportional_limit(
            Some(&list(&[("cpu", "200m"), ("memory", "256Mi")])),
            Some(&list(&[("cpu", "100m"), ("memory", "128Mi")])),
            &list(&[("cpu", "150m"), ("memory", "192Mi")]),
            None,
        );
        let limit = limit.unwrap();
        assert_eq!(limit.get("cpu").unwrap().0, "300m");
        // 256Mi / 128Mi ratio doubles the 192Mi recommendation
        assert_eq!(
            parse_milli(limit.get("memory").unwrap()).unwrap(),
            2 * parse_milli(&Quantity("192Mi".into())).unwrap()
        );
    }
}
