//! Grouping keys for REQ multiplexing.
//!
//! Two queries may share a wire subscription only when their filters have the
//! same shape: the same fields in the same positions, the same time window and
//! the same close-on-EOSE intent. The fingerprint captures exactly that.

use crate::Filter;

const CLOSE_ON_EOSE_MARKER: char = '+';

pub type FilterFingerprint = String;

/// Compute the grouping key for `filters`. Returns `None` for an empty list,
/// which has nothing to group on.
///
/// Field order within a filter does not matter, filter order within the list
/// does.
pub fn fingerprint(filters: &[Filter], close_on_eose: bool) -> Option<FilterFingerprint> {
    if filters.is_empty() {
        return None;
    }

    let shape = filters
        .iter()
        .map(|filter| {
            let mut names = filter.field_names();
            names.sort();
            names.join("-")
        })
        .collect::<Vec<_>>()
        .join("|");

    Some(if close_on_eose {
        format!("{CLOSE_ON_EOSE_MARKER}{shape}")
    } else {
        shape
    })
}

/// Merge a list of same-shaped filters. Filters carrying a `limit` are kept
/// verbatim since a limit cannot be combined; everything else is folded into
/// a single filter appended after them.
pub fn merge_filters(filters: &[Filter]) -> Vec<Filter> {
    let mut merged = Vec::new();
    let mut folded: Option<Filter> = None;

    for filter in filters {
        if filter.has_limit() {
            merged.push(filter.clone());
            continue;
        }

        match &mut folded {
            Some(folded) => folded.absorb(filter),
            None => folded = Some(filter.clone()),
        }
    }

    merged.extend(folded);
    merged
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn parse(json: &str) -> Filter {
        serde_json::from_str(json).expect("filter json")
    }

    // ==== fingerprint tests ====

    #[test]
    fn fingerprint_ignores_field_order() {
        let a = parse(r#"{"kinds":[1],"authors":["a"]}"#);
        let b = parse(r#"{"authors":["b","c"],"kinds":[7]}"#);

        assert_eq!(fingerprint(&[a], false), fingerprint(&[b], false));
    }

    #[test]
    fn fingerprint_has_expected_shape() {
        let filters = [
            Filter::new().kinds([1]).authors(["a"]),
            Filter::new().tag('e', ["x"]).since(5),
        ];
        assert_eq!(
            fingerprint(&filters, false).as_deref(),
            Some("authors-kinds|#e-since:5")
        );
        assert_eq!(
            fingerprint(&filters, true).as_deref(),
            Some("+authors-kinds|#e-since:5")
        );
    }

    #[test]
    fn fingerprint_distinguishes_time_window() {
        let a = Filter::new().kinds([1]).since(100);
        let b = Filter::new().kinds([1]).since(200);
        let c = Filter::new().kinds([1]).since(100);

        assert_ne!(fingerprint(&[a.clone()], false), fingerprint(&[b], false));
        assert_eq!(fingerprint(&[a], false), fingerprint(&[c], false));
    }

    #[test]
    fn fingerprint_distinguishes_close_on_eose() {
        let f = Filter::new().kinds([1]);
        assert_ne!(
            fingerprint(std::slice::from_ref(&f), true),
            fingerprint(std::slice::from_ref(&f), false)
        );
    }

    #[test]
    fn fingerprint_of_nothing_is_none() {
        assert_eq!(fingerprint(&[], false), None);
    }

    // ==== merge tests ====

    #[test]
    fn merge_unions_kinds() {
        let merged = merge_filters(&[Filter::new().kinds([1]), Filter::new().kinds([2])]);
        assert_eq!(merged, vec![Filter::new().kinds([1, 2])]);
    }

    #[test]
    fn merge_keeps_limited_filters_apart() {
        let merged = merge_filters(&[
            Filter::new().kinds([1]).limit(10),
            Filter::new().kinds([2]),
            Filter::new().kinds([3]),
        ]);
        assert_eq!(
            merged,
            vec![
                Filter::new().kinds([1]).limit(10),
                Filter::new().kinds([2, 3]),
            ]
        );
    }

    #[test]
    fn merge_single_filter_is_identity() {
        let f = Filter::new().authors(["a"]).tag('t', ["rust"]);
        assert_eq!(merge_filters(std::slice::from_ref(&f)), vec![f]);
    }
}
