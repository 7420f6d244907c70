use std::collections::BTreeMap;

use aws_sdk_elasticloadbalancingv2::types::Tag;

use crate::error::Result;

/// Set-difference between the tags a resource carries and the tags it should.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TagDiff {
    pub add: BTreeMap<String, String>,
    pub remove: Vec<String>,
}

impl TagDiff {
    pub fn is_empty(&self) -> bool {
        self.add.is_empty() && self.remove.is_empty()
    }
}

pub fn diff_tags(current: &BTreeMap<String, String>, desired: &BTreeMap<String, String>) -> TagDiff {
    let add = desired
        .iter()
        .filter(|(k, v)| current.get(*k) != Some(*v))
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect();
    let remove = current
        .keys()
        .filter(|k| !desired.contains_key(*k))
        .cloned()
        .collect();
    TagDiff { add, remove }
}

/// Applies a diff with at most one AddTags and one RemoveTags call.
pub async fn reconcile_tags(
    elbv2: &aws_sdk_elasticloadbalancingv2::Client,
    arn: &str,
    diff: &TagDiff,
) -> Result<bool> {
    if diff.is_empty() {
        return Ok(false);
    }
    if !diff.add.is_empty() {
        let tags: Vec<Tag> = diff
            .add
            .iter()
            .map(|(k, v)| Tag::builder().key(k).value(v).build())
            .collect();
        elbv2
            .add_tags()
            .resource_arns(arn)
            .set_tags(Some(tags))
            .send()
            .await
            .map_err(aws_sdk_elasticloadbalancingv2::Error::from)?;
    }
    if !diff.remove.is_empty() {
        elbv2
            .remove_tags()
            .resource_arns(arn)
            .set_tag_keys(Some(diff.remove.clone()))
            .send()
            .await
            .map_err(aws_sdk_elasticloadbalancingv2::Error::from)?;
    }
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn map(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn diff_is_set_difference_in_both_directions() {
        let current = map(&[("keep", "same"), ("stale", "x"), ("change", "old")]);
        let desired = map(&[("keep", "same"), ("change", "new"), ("fresh", "y")]);
        let diff = diff_tags(&current, &desired);
        assert_eq!(diff.add, map(&[("change", "new"), ("fresh", "y")]));
        assert_eq!(diff.remove, vec!["stale".to_string()]);
    }

    #[test]
    fn identical_tag_sets_diff_empty() {
        let tags = map(&[("a", "1"), ("b", "2")]);
        assert!(diff_tags(&tags, &tags).is_empty());
    }
}
