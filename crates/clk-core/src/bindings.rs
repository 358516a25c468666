//! Runtime binding map: learned identifiers keyed by uppercase symbolic names.
//!
//! Keys are synonymous across a fixed alias set (planners and learners emit
//! both spellings in the wild), and values proposed by anything other than a
//! direct CLI output must pass the per-key shape predicate before being
//! accepted.

use serde_json::Value;
use std::collections::BTreeMap;

/// Reserved key: index of the next command to run after the last success.
pub const LAST_SUCCESS_KEY: &str = "CHECKPOINT_LAST_SUCCESS_INDEX";
/// Reserved key: index of the last hard-failed command, or `""`.
pub const LAST_FAILURE_KEY: &str = "CHECKPOINT_LAST_FAILURE_INDEX";

/// Equivalence groups. Setting any member fills the empty others.
const ALIAS_GROUPS: &[&[&str]] = &[
    &["SG_ALB_ID", "ALB_SG_ID"],
    &["SG_APP_ID", "APP_SG_ID"],
    &["SG_RDS_ID", "RDS_SG_ID"],
    &["SG_DB_ID", "DB_SG_ID"],
    &["SUB_PUB_1_ID", "SUBNET_PUB_1_ID"],
    &["SUB_PUB_2_ID", "SUBNET_PUB_2_ID"],
    &["SUB_PRIV_1_ID", "SUBNET_PRIV_1_ID"],
    &["SUB_PRIV_2_ID", "SUBNET_PRIV_2_ID"],
    &["TG_ARN", "TARGET_GROUP_ARN"],
    &["ALB_ARN", "LB_ARN"],
    &["ALB_DNS", "LB_DNS"],
    &["ECR_URI", "ECR_REPO_URI"],
];

/// Aliases of `key`, excluding `key` itself.
pub fn aliases_of(key: &str) -> impl Iterator<Item = &'static str> {
    ALIAS_GROUPS
        .iter()
        .filter(move |group| group.contains(&key))
        .flat_map(|group| group.iter().copied())
        .filter(move |k| *k != key)
        .collect::<Vec<_>>()
        .into_iter()
}

/// Shape predicate for externally proposed values (LLM inference, discovery,
/// agentic fixes). CLI outputs bypass this: the provider is the authority on
/// its own identifiers.
pub fn key_accepts(key: &str, value: &str) -> bool {
    if value.is_empty() || value.contains(|c: char| c == ';' || c == '|' || c == '\n') {
        return false;
    }
    if key == "TG_ARN" || key == "TARGET_GROUP_ARN" {
        return value.starts_with("arn:") && value.contains(":targetgroup/");
    }
    if key.ends_with("_ARN") {
        return value.starts_with("arn:");
    }
    if key == "INSTANCE_ID" {
        return value.starts_with("i-");
    }
    if key == "AMI_ID" {
        return value.starts_with("ami-");
    }
    if key == "ACCOUNT_ID" {
        return value.len() == 12 && value.bytes().all(|b| b.is_ascii_digit());
    }
    if key.contains("SG") && key.ends_with("_ID") {
        return value.starts_with("sg-");
    }
    if (key.starts_with("SUBNET") || key.starts_with("SUB_")) && key.ends_with("_ID") {
        return value.starts_with("subnet-");
    }
    if key.starts_with("VPC") && key.ends_with("_ID") {
        return value.starts_with("vpc-");
    }
    if key.starts_with("IGW") {
        return value.starts_with("igw-");
    }
    true
}

/// Flat, mutable map from symbolic key to learned string value.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BindingMap {
    inner: BTreeMap<String, String>,
}

impl BindingMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_map(map: BTreeMap<String, String>) -> Self {
        Self { inner: map }
    }

    /// Direct or alias lookup; empty values count as unset.
    pub fn get(&self, key: &str) -> Option<&str> {
        if let Some(v) = self.inner.get(key).filter(|v| !v.is_empty()) {
            return Some(v.as_str());
        }
        for alias in aliases_of(key) {
            if let Some(v) = self.inner.get(alias).filter(|v| !v.is_empty()) {
                return Some(v.as_str());
            }
        }
        None
    }

    /// Set `key`, and fill any alias that is currently unset. An alias that
    /// already holds a non-empty value is left alone.
    pub fn set(&mut self, key: &str, value: impl Into<String>) {
        let value = value.into();
        for alias in aliases_of(key) {
            if self.inner.get(alias).map(String::is_empty).unwrap_or(true) {
                self.inner.insert(alias.to_string(), value.clone());
            }
        }
        self.inner.insert(key.to_string(), value);
    }

    /// Set only when the key (or an alias) is currently unset.
    pub fn set_if_empty(&mut self, key: &str, value: impl Into<String>) {
        if self.get(key).is_none() {
            self.set(key, value);
        }
    }

    /// Overwrite unconditionally, aliases included. Used by glue that has
    /// discovered the live identifier is different from a stale binding.
    pub fn overwrite(&mut self, key: &str, value: impl Into<String>) {
        let value = value.into();
        for alias in aliases_of(key) {
            self.inner.insert(alias.to_string(), value.clone());
        }
        self.inner.insert(key.to_string(), value);
    }

    /// Seed from `other` without clobbering anything already present.
    pub fn merge_missing(&mut self, other: &BTreeMap<String, String>) {
        for (k, v) in other {
            if !v.is_empty() {
                self.set_if_empty(k, v.clone());
            }
        }
    }

    pub fn contains(&self, key: &str) -> bool {
        self.get(key).is_some()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &String)> {
        self.inner.iter()
    }

    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }

    /// Full snapshot, reserved progress keys included (checkpoint format).
    pub fn snapshot(&self) -> BTreeMap<String, String> {
        self.inner.clone()
    }

    /// Snapshot without reserved progress keys (caller-facing output).
    pub fn user_snapshot(&self) -> BTreeMap<String, String> {
        self.inner
            .iter()
            .filter(|(k, _)| k.as_str() != LAST_SUCCESS_KEY && k.as_str() != LAST_FAILURE_KEY)
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }

    /// Non-empty user bindings as a JSON object, for LLM prompts.
    pub fn to_prompt_json(&self) -> Value {
        let map: serde_json::Map<String, Value> = self
            .inner
            .iter()
            .filter(|(k, v)| {
                !v.is_empty()
                    && k.as_str() != LAST_SUCCESS_KEY
                    && k.as_str() != LAST_FAILURE_KEY
            })
            .map(|(k, v)| (k.clone(), Value::String(v.clone())))
            .collect();
        Value::Object(map)
    }
}

/// Loop progress, stored in the checkpoint through two reserved binding keys
/// but handled as its own value everywhere else.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Progress {
    /// Index of the next command to run (commands `< last_success` are done).
    pub last_success: usize,
    pub last_failure: Option<usize>,
}

impl Progress {
    pub fn load(bindings: &BindingMap) -> Self {
        let last_success = bindings
            .inner
            .get(LAST_SUCCESS_KEY)
            .and_then(|v| v.parse().ok())
            .unwrap_or(0);
        let last_failure = bindings
            .inner
            .get(LAST_FAILURE_KEY)
            .and_then(|v| v.parse().ok());
        Self {
            last_success,
            last_failure,
        }
    }

    /// Record a completed command and clear any failure marker.
    pub fn record_success(&mut self, index: usize, bindings: &mut BindingMap) {
        self.last_success = index + 1;
        self.last_failure = None;
        bindings
            .inner
            .insert(LAST_SUCCESS_KEY.to_string(), self.last_success.to_string());
        bindings.inner.insert(LAST_FAILURE_KEY.to_string(), String::new());
    }

    pub fn record_failure(&mut self, index: usize, bindings: &mut BindingMap) {
        self.last_failure = Some(index);
        bindings
            .inner
            .insert(LAST_FAILURE_KEY.to_string(), index.to_string());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn set_fills_empty_aliases() {
        let mut b = BindingMap::new();
        b.set("SG_ALB_ID", "sg-aaa");
        assert_eq!(b.get("ALB_SG_ID"), Some("sg-aaa"));
        assert_eq!(b.get("SG_ALB_ID"), Some("sg-aaa"));
    }

    #[test]
    fn set_does_not_clobber_nonempty_alias() {
        let mut b = BindingMap::new();
        b.set("ALB_SG_ID", "sg-old");
        b.set("SG_ALB_ID", "sg-new");
        assert_eq!(b.get("ALB_SG_ID"), Some("sg-old"));
        // direct key takes the new value
        assert_eq!(b.snapshot()["SG_ALB_ID"], "sg-new");
    }

    #[test]
    fn overwrite_replaces_aliases_too() {
        let mut b = BindingMap::new();
        b.set("TG_ARN", "arn:aws:elasticloadbalancing:us-east-1:1:targetgroup/a/b");
        b.overwrite("TG_ARN", "arn:aws:elasticloadbalancing:us-east-1:1:targetgroup/c/d");
        assert!(b.get("TARGET_GROUP_ARN").unwrap().ends_with("c/d"));
    }

    #[test]
    fn get_falls_back_to_alias() {
        let mut b = BindingMap::new();
        b.set("SUBNET_PUB_1_ID", "subnet-123");
        assert_eq!(b.get("SUB_PUB_1_ID"), Some("subnet-123"));
    }

    #[test]
    fn empty_value_counts_as_unset() {
        let mut b = BindingMap::new();
        b.set("VPC_ID", "");
        assert_eq!(b.get("VPC_ID"), None);
        b.set_if_empty("VPC_ID", "vpc-1");
        assert_eq!(b.get("VPC_ID"), Some("vpc-1"));
    }

    #[test]
    fn merge_missing_preserves_existing() {
        let mut b = BindingMap::new();
        b.set("VPC_ID", "vpc-live");
        let mut seed = BTreeMap::new();
        seed.insert("VPC_ID".to_string(), "vpc-stale".to_string());
        seed.insert("AMI_ID".to_string(), "ami-1".to_string());
        b.merge_missing(&seed);
        assert_eq!(b.get("VPC_ID"), Some("vpc-live"));
        assert_eq!(b.get("AMI_ID"), Some("ami-1"));
    }

    #[test]
    fn shape_predicate_arns() {
        assert!(key_accepts("ROLE_ARN", "arn:aws:iam::123456789012:role/r"));
        assert!(!key_accepts("ROLE_ARN", "role/r"));
        assert!(key_accepts(
            "TG_ARN",
            "arn:aws:elasticloadbalancing:us-east-1:1:targetgroup/a/b"
        ));
        assert!(!key_accepts("TG_ARN", "arn:aws:iam::1:role/r"));
    }

    #[test]
    fn shape_predicate_ids() {
        assert!(key_accepts("INSTANCE_ID", "i-0abc"));
        assert!(!key_accepts("INSTANCE_ID", "vpc-0abc"));
        assert!(key_accepts("SG_RDS_ID", "sg-bbb"));
        assert!(!key_accepts("SG_RDS_ID", "i-bbb"));
        assert!(key_accepts("SUBNET_PUB_1_ID", "subnet-1"));
        assert!(key_accepts("SUB_PRIV_2_ID", "subnet-2"));
        assert!(!key_accepts("SUB_PRIV_2_ID", "sg-2"));
        assert!(key_accepts("VPC_ID", "vpc-1"));
        assert!(!key_accepts("VPC_ID", "subnet-1"));
        assert!(key_accepts("ACCOUNT_ID", "123456789012"));
        assert!(!key_accepts("ACCOUNT_ID", "12345"));
    }

    #[test]
    fn shape_predicate_rejects_shell_metacharacters() {
        assert!(!key_accepts("APP_PORT", "80; rm -rf /"));
        assert!(key_accepts("APP_PORT", "8080"));
    }

    #[test]
    fn progress_round_trip() {
        let mut b = BindingMap::new();
        let mut p = Progress::load(&b);
        assert_eq!(p.last_success, 0);

        p.record_success(0, &mut b);
        p.record_success(1, &mut b);
        assert_eq!(Progress::load(&b).last_success, 2);
        assert_eq!(b.snapshot()[LAST_FAILURE_KEY], "");

        p.record_failure(2, &mut b);
        let loaded = Progress::load(&b);
        assert_eq!(loaded.last_success, 2);
        assert_eq!(loaded.last_failure, Some(2));
    }

    #[test]
    fn user_snapshot_hides_progress_keys() {
        let mut b = BindingMap::new();
        let mut p = Progress::load(&b);
        b.set("VPC_ID", "vpc-1");
        p.record_success(0, &mut b);
        let snap = b.user_snapshot();
        assert!(snap.contains_key("VPC_ID"));
        assert!(!snap.contains_key(LAST_SUCCESS_KEY));
    }
}
