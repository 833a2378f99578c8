//! Stream name construction.

use rill_core::AggregateId;

use crate::store::StreamName;

/// Builds stream names as `<prefix><camelCasedKind>-<id hex>` and category
/// streams as `$ce-<prefix><camelCasedKind>`. The prefix is a configured
/// constant and may be empty.
#[derive(Debug, Clone, Default)]
pub struct StreamNameBuilder {
    prefix: String,
}

impl StreamNameBuilder {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self { prefix: prefix.into() }
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// Stream of one aggregate instance.
    pub fn stream_for(&self, kind: &str, id: AggregateId) -> StreamName {
        StreamName::new(format!(
            "{}{}-{}",
            self.prefix,
            camel_case(kind),
            id.to_simple_string()
        ))
    }

    /// Category stream aggregating every instance of the kind.
    pub fn category_for(&self, kind: &str) -> StreamName {
        StreamName::new(format!("$ce-{}{}", self.prefix, camel_case(kind)))
    }
}

fn camel_case(kind: &str) -> String {
    let mut chars = kind.chars();
    match chars.next() {
        Some(first) => first.to_lowercase().chain(chars).collect(),
        None => String::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    #[test]
    fn builds_instance_and_category_names() {
        let id = AggregateId::from_str("00000000-0000-0000-0000-000000000011").unwrap();
        let builder = StreamNameBuilder::new("");

        assert_eq!(
            builder.stream_for("Group", id).as_str(),
            "group-00000000000000000000000000000011"
        );
        assert_eq!(builder.category_for("Group").as_str(), "$ce-group");
    }

    #[test]
    fn prefix_is_prepended_to_both_forms() {
        let id = AggregateId::new();
        let builder = StreamNameBuilder::new("test_");

        assert!(builder.stream_for("PolicyUser", id).as_str().starts_with("test_policyUser-"));
        assert_eq!(builder.category_for("PolicyUser").as_str(), "$ce-test_policyUser");
    }
}
