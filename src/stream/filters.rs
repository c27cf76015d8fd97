//! Subscription filters and query string construction.

use std::collections::BTreeMap;

use url::Url;

use crate::stream::proto::Severity;

/// Query parameter names, in serialization order.
pub const SEVERITY_PARAM: &str = "severity";
pub const RULES_PARAM: &str = "rules";
pub const VM_IDS_PARAM: &str = "vmIds";

/// Independent filter dimensions narrowing which events the server pushes.
///
/// An empty dimension places no restriction and is omitted from the query.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SubscriptionFilters {
    pub severity: Vec<Severity>,
    pub rules: Vec<String>,
    pub vm_ids: Vec<u64>,
    /// Additional dimensions keyed by query parameter name.
    pub extra: BTreeMap<String, Vec<String>>,
}

impl SubscriptionFilters {
    /// Filters with no restriction on any dimension.
    pub fn all() -> Self {
        Self::default()
    }

    pub fn with_severity(mut self, levels: impl IntoIterator<Item = Severity>) -> Self {
        self.severity = dedup(levels);
        self
    }

    pub fn with_rules<S>(mut self, rules: impl IntoIterator<Item = S>) -> Self
    where
        S: Into<String>,
    {
        self.rules = dedup(rules.into_iter().map(Into::into));
        self
    }

    pub fn with_vm_ids(mut self, vm_ids: impl IntoIterator<Item = u64>) -> Self {
        self.vm_ids = dedup(vm_ids);
        self
    }

    /// Adds or replaces an extra dimension.
    pub fn with_dimension<K, S>(mut self, name: K, values: impl IntoIterator<Item = S>) -> Self
    where
        K: Into<String>,
        S: Into<String>,
    {
        self.extra
            .insert(name.into(), dedup(values.into_iter().map(Into::into)));
        self
    }

    /// True when no dimension restricts the subscription.
    pub fn is_unrestricted(&self) -> bool {
        self.to_query().is_empty()
    }

    /// Serializes the filters into a query string without the leading `?`.
    ///
    /// Dimension order is fixed; each value is percent-encoded on its own and
    /// joined with literal commas.
    pub fn to_query(&self) -> String {
        let mut params: Vec<String> = Vec::new();

        push_param(
            &mut params,
            SEVERITY_PARAM,
            self.severity.iter().map(|level| level.as_str().to_string()),
        );
        push_param(&mut params, RULES_PARAM, self.rules.iter().cloned());
        push_param(
            &mut params,
            VM_IDS_PARAM,
            self.vm_ids.iter().map(u64::to_string),
        );
        for (name, values) in &self.extra {
            if is_reserved(name) {
                continue;
            }
            push_param(&mut params, name, values.iter().cloned());
        }

        params.join("&")
    }

    /// Returns `endpoint` with these filters appended to its query.
    ///
    /// Any query already present on `endpoint` is kept in front.
    pub fn apply_to(&self, endpoint: &Url) -> Url {
        let mut url = endpoint.clone();
        let filters = self.to_query();
        let query = match endpoint.query().filter(|base| !base.is_empty()) {
            Some(base) if filters.is_empty() => base.to_string(),
            Some(base) => format!("{base}&{filters}"),
            None => filters,
        };
        url.set_query((!query.is_empty()).then_some(query.as_str()));
        url
    }
}

fn is_reserved(name: &str) -> bool {
    name.is_empty() || name == SEVERITY_PARAM || name == RULES_PARAM || name == VM_IDS_PARAM
}

fn push_param(params: &mut Vec<String>, name: &str, values: impl Iterator<Item = String>) {
    let encoded: Vec<String> = values
        .filter(|value| !value.is_empty())
        .map(|value| urlencoding::encode(&value).into_owned())
        .collect();
    if encoded.is_empty() {
        return;
    }
    params.push(format!(
        "{}={}",
        urlencoding::encode(name),
        encoded.join(",")
    ));
}

fn dedup<T: PartialEq>(values: impl IntoIterator<Item = T>) -> Vec<T> {
    let mut out: Vec<T> = Vec::new();
    for value in values {
        if !out.contains(&value) {
            out.push(value);
        }
    }
    out
}
