// Copyright 2024 GarnetFS Team
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! The bucket replication configuration model and the rule matcher that
//! turns object attributes into the set of target ARNs to replicate to.

use garnetfs_filemeta::ReplicationType;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum RuleStatus {
    #[default]
    Enabled,
    Disabled,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DeleteMarkerReplication {
    pub status: RuleStatus,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DeleteReplication {
    pub status: RuleStatus,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExistingObjectReplication {
    pub status: RuleStatus,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ReplicaModifications {
    pub status: RuleStatus,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SourceSelectionCriteria {
    pub replica_modifications: ReplicaModifications,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Destination {
    /// Target ARN the rule routes to.
    pub bucket: String,
    pub storage_class: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Tag {
    pub key: String,
    pub value: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AndOperator {
    pub prefix: Option<String>,
    pub tags: Vec<Tag>,
}

/// Rule filter: a bare prefix, a bare tag, or an And of both.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Filter {
    pub prefix: Option<String>,
    pub tag: Option<Tag>,
    pub and: Option<AndOperator>,
}

impl Filter {
    pub fn prefix(&self) -> &str {
        if let Some(prefix) = &self.prefix {
            return prefix;
        }
        if let Some(and) = &self.and {
            if let Some(prefix) = &and.prefix {
                return prefix;
            }
        }
        ""
    }

    /// Matches the rule's tag constraints against an object's tag set.
    pub fn test_tags(&self, user_tags: &str) -> bool {
        let object_tags = decode_tags_to_map(user_tags);

        let wanted: Vec<&Tag> = if let Some(tag) = &self.tag {
            vec![tag]
        } else if let Some(and) = &self.and {
            and.tags.iter().collect()
        } else {
            return true;
        };

        wanted
            .iter()
            .all(|t| object_tags.get(&t.key).map(|v| v == &t.value).unwrap_or(false))
    }
}

/// Decodes `k1=v1&k2=v2` object tagging into a map.
pub fn decode_tags_to_map(user_tags: &str) -> HashMap<String, String> {
    let mut out = HashMap::new();
    for pair in user_tags.split('&') {
        if pair.is_empty() {
            continue;
        }
        let mut it = pair.splitn(2, '=');
        let k = it.next().unwrap_or_default();
        let v = it.next().unwrap_or_default();
        if !k.is_empty() {
            out.insert(k.to_string(), v.to_string());
        }
    }
    out
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Rule {
    pub id: String,
    pub status: RuleStatus,
    pub priority: i64,
    pub delete_marker_replication: DeleteMarkerReplication,
    pub delete_replication: DeleteReplication,
    pub destination: Destination,
    pub source_selection_criteria: SourceSelectionCriteria,
    pub filter: Filter,
    pub existing_object_replication: ExistingObjectReplication,
}

/// Attributes of one object the rule matcher sees.
#[derive(Debug, Clone, Default)]
pub struct ObjectOpts {
    pub name: String,
    pub user_tags: String,
    pub version_id: Option<Uuid>,
    pub delete_marker: bool,
    pub ssec: bool,
    pub op_type: ReplicationType,
    pub replica: bool,
    pub existing_object: bool,
    pub target_arn: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ReplicationConfiguration {
    /// Legacy single-target role ARN; empty for multi-target configs.
    pub role: String,
    pub rules: Vec<Rule>,
}

impl ReplicationConfiguration {
    /// Rules applicable to the object, highest priority first.
    pub fn filter_actionable_rules(&self, obj: &ObjectOpts) -> Vec<Rule> {
        if obj.name.is_empty() && !matches!(obj.op_type, ReplicationType::Resync | ReplicationType::All) {
            return Vec::new();
        }

        let mut rules: Vec<Rule> = Vec::new();
        for rule in &self.rules {
            if rule.status == RuleStatus::Disabled {
                continue;
            }

            if !obj.target_arn.is_empty() && rule.destination.bucket != obj.target_arn && self.role != obj.target_arn {
                continue;
            }

            if matches!(obj.op_type, ReplicationType::Resync | ReplicationType::All) {
                rules.push(rule.clone());
                continue;
            }

            if obj.existing_object && rule.existing_object_replication.status == RuleStatus::Disabled {
                continue;
            }

            if !obj.name.starts_with(rule.filter.prefix()) {
                continue;
            }

            if !rule.filter.test_tags(&obj.user_tags) {
                continue;
            }

            rules.push(rule.clone());
        }

        rules.sort_by(|a, b| {
            if a.priority == b.priority {
                a.destination.bucket.cmp(&b.destination.bucket)
            } else {
                b.priority.cmp(&a.priority)
            }
        });

        rules
    }

    /// Every distinct target ARN the object's rules route to. The legacy
    /// RoleArn short-circuits to a single target.
    pub fn filter_target_arns(&self, obj: &ObjectOpts) -> Vec<String> {
        let mut arns = Vec::new();
        let mut seen = HashSet::new();

        let rules = self.filter_actionable_rules(obj);
        for rule in rules {
            if rule.status == RuleStatus::Disabled {
                continue;
            }

            if !self.role.is_empty() {
                arns.push(self.role.clone());
                return arns;
            }

            if seen.insert(rule.destination.bucket.clone()) {
                arns.push(rule.destination.bucket.clone());
            }
        }

        arns
    }

    /// Whether the object qualifies for replication under any actionable
    /// rule.
    pub fn replicate(&self, obj: &ObjectOpts) -> bool {
        for rule in self.filter_actionable_rules(obj) {
            if rule.status == RuleStatus::Disabled {
                continue;
            }

            if obj.existing_object && rule.existing_object_replication.status == RuleStatus::Disabled {
                return false;
            }

            if obj.op_type == ReplicationType::Delete {
                return if obj.version_id.is_some() {
                    // Permanent delete of a specific version.
                    rule.delete_replication.status == RuleStatus::Enabled
                } else {
                    // Delete marker insertion.
                    rule.delete_marker_replication.status == RuleStatus::Enabled
                };
            }

            // Regular object or metadata replication.
            if !obj.replica {
                return true;
            }
            return rule.source_selection_criteria.replica_modifications.status == RuleStatus::Enabled;
        }
        false
    }

    pub fn has_active_rules(&self, prefix: &str, recursive: bool) -> bool {
        self.rules.iter().any(|rule| {
            if rule.status == RuleStatus::Disabled {
                return false;
            }
            let rule_prefix = rule.filter.prefix();
            if prefix.is_empty() || rule_prefix.is_empty() {
                return true;
            }
            if recursive {
                rule_prefix.starts_with(prefix) || prefix.starts_with(rule_prefix)
            } else {
                prefix.starts_with(rule_prefix)
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rule(arn: &str, prefix: &str, priority: i64) -> Rule {
        Rule {
            id: format!("rule-{arn}"),
            status: RuleStatus::Enabled,
            priority,
            destination: Destination {
                bucket: arn.to_string(),
                storage_class: String::new(),
            },
            filter: Filter {
                prefix: Some(prefix.to_string()),
                ..Default::default()
            },
            delete_marker_replication: DeleteMarkerReplication { status: RuleStatus::Enabled },
            delete_replication: DeleteReplication { status: RuleStatus::Enabled },
            existing_object_replication: ExistingObjectReplication { status: RuleStatus::Enabled },
            ..Default::default()
        }
    }

    fn obj(name: &str) -> ObjectOpts {
        ObjectOpts {
            name: name.to_string(),
            op_type: ReplicationType::Object,
            ..Default::default()
        }
    }

    #[test]
    fn test_prefix_filtering() {
        let cfg = ReplicationConfiguration {
            role: String::new(),
            rules: vec![rule("arn:a", "photos/", 1), rule("arn:b", "", 0)],
        };

        assert_eq!(cfg.filter_target_arns(&obj("photos/cat.jpg")), vec!["arn:a", "arn:b"]);
        assert_eq!(cfg.filter_target_arns(&obj("docs/report.pdf")), vec!["arn:b"]);
        assert!(cfg.replicate(&obj("docs/report.pdf")));
    }

    #[test]
    fn test_disabled_rule_is_skipped() {
        let mut r = rule("arn:a", "", 0);
        r.status = RuleStatus::Disabled;
        let cfg = ReplicationConfiguration {
            role: String::new(),
            rules: vec![r],
        };
        assert!(cfg.filter_target_arns(&obj("x")).is_empty());
        assert!(!cfg.replicate(&obj("x")));
    }

    #[test]
    fn test_tag_filtering() {
        let mut r = rule("arn:a", "", 0);
        r.filter.tag = Some(Tag {
            key: "class".to_string(),
            value: "hot".to_string(),
        });
        let cfg = ReplicationConfiguration {
            role: String::new(),
            rules: vec![r],
        };

        let mut o = obj("x");
        assert!(!cfg.replicate(&o));
        o.user_tags = "class=hot&other=1".to_string();
        assert!(cfg.replicate(&o));
    }

    #[test]
    fn test_replica_requires_modification_sync() {
        let cfg = ReplicationConfiguration {
            role: String::new(),
            rules: vec![rule("arn:a", "", 0)],
        };
        let mut o = obj("x");
        o.replica = true;
        assert!(!cfg.replicate(&o));
    }

    #[test]
    fn test_delete_rules() {
        let mut r = rule("arn:a", "", 0);
        r.delete_replication.status = RuleStatus::Disabled;
        let cfg = ReplicationConfiguration {
            role: String::new(),
            rules: vec![r],
        };

        let mut o = obj("x");
        o.op_type = ReplicationType::Delete;
        // Delete marker replication still enabled.
        assert!(cfg.replicate(&o));
        // Hard version delete disabled.
        o.version_id = Some(Uuid::new_v4());
        assert!(!cfg.replicate(&o));
    }

    #[test]
    fn test_legacy_role_short_circuits() {
        let cfg = ReplicationConfiguration {
            role: "arn:legacy".to_string(),
            rules: vec![rule("arn:a", "", 0), rule("arn:b", "", 1)],
        };
        assert_eq!(cfg.filter_target_arns(&obj("x")), vec!["arn:legacy"]);
    }
}
