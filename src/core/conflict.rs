use crate::core::rule::{Protocol, RuleId};
use crate::core::store::{RuleFilter, RuleStore, StoreError};

/// True iff an enabled rule other than `exclude` occupies `(host_port, protocol)`.
///
/// Advisory only. The store's uniqueness constraint decides at commit time.
pub async fn has_conflict<S: RuleStore>(
    store: &S,
    host_port: u16,
    protocol: Protocol,
    exclude: Option<RuleId>,
) -> Result<bool, StoreError> {
    // At most one enabled rule can hold a slot, so two rows are enough to see
    // past the excluded one.
    let (rules, _) = store
        .list(&RuleFilter::slot(host_port, protocol), 0, 2)
        .await?;
    Ok(rules.iter().any(|rule| Some(rule.id) != exclude))
}
