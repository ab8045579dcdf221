// Diff-merge of freshly observed remote state into the previous snapshot.

use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, HashMap};

use crate::error::RemoteError;
use crate::models::{
    ContainerRecord, Degradation, EndpointId, IdentityKey, ImageRef, Presence, ResourceMetrics,
    Snapshot, StackId, StackRecord, StackStatus,
};
use crate::remote::{RemoteContainer, RemoteStack};

/// One container as seen by the current refresh (list entry merged with inspection data).
#[derive(Debug, Clone)]
pub(crate) struct Observed {
    pub container: RemoteContainer,
    pub started_at: Option<DateTime<Utc>>,
    pub metrics: Option<ResourceMetrics>,
}

/// Identity keys touched by a merge.
#[derive(Debug, Default, PartialEq)]
pub(crate) struct Changes {
    pub added: Vec<IdentityKey>,
    pub removed: Vec<IdentityKey>,
    pub changed: Vec<IdentityKey>,
}

impl Changes {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty() && self.changed.is_empty()
    }
}

fn record_from(
    endpoint_id: EndpointId,
    observed: Observed,
    stack_ids: &HashMap<String, StackId>,
    now: DateTime<Utc>,
) -> ContainerRecord {
    let Observed {
        container: c,
        started_at,
        metrics,
    } = observed;
    let stack = c.membership().map(|mut m| {
        m.stack_id = stack_ids.get(&m.project.to_lowercase()).copied();
        m
    });
    ContainerRecord {
        key: IdentityKey::new(stack.as_ref().map(|m| m.project.as_str()), &c.name),
        image: ImageRef::parse(&c.image),
        image_id: c.image_id,
        status: c.status,
        metrics,
        created_at: c.created_at,
        running_since: started_at,
        stack,
        presence: Presence::Present,
        observed_at: now,
        endpoint_id,
        name: c.name,
        id: c.id,
    }
}

/// Fields whose change is worth telling subscribers about. Metrics move on every cycle.
fn differs(prev: &ContainerRecord, next: &ContainerRecord) -> bool {
    prev.id != next.id
        || prev.status != next.status
        || prev.image != next.image
        || prev.image_id != next.image_id
        || prev.presence != next.presence
        || prev.stack != next.stack
}

/// Next presence of a container absent from the current refresh, `None` once it is purged.
fn age(presence: Presence, grace_cycles: u32) -> Option<Presence> {
    let cycles = match presence {
        Presence::Removed => return None,
        Presence::Present => 1,
        Presence::Missing { cycles } => cycles + 1,
    };
    if cycles > grace_cycles {
        Some(Presence::Removed)
    } else {
        Some(Presence::Missing { cycles })
    }
}

pub(crate) fn merge(
    prev: &Snapshot,
    observed: Vec<Observed>,
    stacks: &[RemoteStack],
    now: DateTime<Utc>,
    grace_cycles: u32,
) -> (Snapshot, Changes) {
    let endpoint_id = prev.endpoint_id;
    let stack_ids: HashMap<String, StackId> = stacks
        .iter()
        .filter(|s| s.endpoint_id == endpoint_id)
        .map(|s| (s.name.to_lowercase(), s.id))
        .collect();

    let mut next: BTreeMap<IdentityKey, ContainerRecord> = BTreeMap::new();
    for o in observed {
        let record = record_from(endpoint_id, o, &stack_ids, now);
        next.insert(record.key.clone(), record);
    }

    let mut changes = Changes::default();
    for record in next.values() {
        match prev.container(&record.key) {
            None => changes.added.push(record.key.clone()),
            Some(old) if old.presence == Presence::Removed => {
                changes.added.push(record.key.clone())
            }
            Some(old) if differs(old, record) => changes.changed.push(record.key.clone()),
            Some(_) => {}
        }
    }
    for old in &prev.containers {
        if next.contains_key(&old.key) {
            continue;
        }
        if let Some(presence) = age(old.presence, grace_cycles) {
            if presence == Presence::Removed {
                changes.removed.push(old.key.clone());
            } else {
                changes.changed.push(old.key.clone());
            }
            let mut kept = old.clone();
            kept.presence = presence;
            next.insert(kept.key.clone(), kept);
        }
    }

    let containers: Vec<ContainerRecord> = next.into_values().collect();
    let stacks = stack_records(endpoint_id, stacks, &containers);
    let snapshot = Snapshot {
        endpoint_id,
        version: prev.version + 1,
        refreshed_at: Some(now),
        containers,
        stacks,
        degraded: None,
    };
    (snapshot, changes)
}

/// Members are the containers seen in this refresh, ordered by service name.
fn stack_records(
    endpoint_id: EndpointId,
    stacks: &[RemoteStack],
    containers: &[ContainerRecord],
) -> Vec<StackRecord> {
    let mut records: Vec<StackRecord> = stacks
        .iter()
        .filter(|s| s.endpoint_id == endpoint_id)
        .map(|s| {
            let mut members: Vec<&ContainerRecord> = containers
                .iter()
                .filter(|c| c.presence == Presence::Present && c.stack_id() == Some(s.id))
                .collect();
            members.sort_by(|a, b| {
                a.service_name()
                    .cmp(&b.service_name())
                    .then_with(|| a.name.cmp(&b.name))
            });
            StackRecord {
                id: s.id,
                name: s.name.clone(),
                endpoint_id,
                status: StackStatus::aggregate(members.iter().map(|c| c.status)),
                members: members.into_iter().map(|c| c.id.clone()).collect(),
            }
        })
        .collect();
    records.sort_by_key(|s| s.id);
    records
}

/// Operator-facing text for a failed refresh.
pub(crate) fn failure_message(endpoint_id: EndpointId, err: &RemoteError) -> String {
    match err {
        RemoteError::NotFound(_) => format!(
            "endpoint {endpoint_id} does not exist on the management API; check the configured endpoint id ({err})"
        ),
        RemoteError::Auth(_) => {
            format!("credentials rejected by the management API; update the configured API key or password ({err})")
        }
        _ => err.to_string(),
    }
}

/// Retain the previous state, flagged with the failure.
pub(crate) fn degrade(prev: &Snapshot, err: &RemoteError, now: DateTime<Utc>) -> Snapshot {
    let (since, failures) = match &prev.degraded {
        Some(d) => (d.since, d.consecutive_failures + 1),
        None => (now, 1),
    };
    Snapshot {
        version: prev.version + 1,
        degraded: Some(Degradation {
            kind: err.kind(),
            message: failure_message(prev.endpoint_id, err),
            since,
            consecutive_failures: failures,
        }),
        ..prev.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::FailureKind;
    use crate::models::{COMPOSE_PROJECT_LABEL, COMPOSE_SERVICE_LABEL, ContainerStatus};

    fn container(id: &str, name: &str, project: Option<&str>, service: &str) -> Observed {
        let mut labels = HashMap::new();
        if let Some(p) = project {
            labels.insert(COMPOSE_PROJECT_LABEL.to_string(), p.to_string());
            labels.insert(COMPOSE_SERVICE_LABEL.to_string(), service.to_string());
        }
        Observed {
            container: RemoteContainer {
                id: id.into(),
                name: name.into(),
                image: "nginx:1.25".into(),
                image_id: None,
                status: ContainerStatus::Running,
                labels,
                created_at: None,
            },
            started_at: None,
            metrics: None,
        }
    }

    fn demo_stack() -> Vec<RemoteStack> {
        vec![RemoteStack {
            id: 7,
            name: "demo".into(),
            endpoint_id: 1,
            active: true,
        }]
    }

    #[test]
    fn identity_survives_recreation() {
        let now = Utc::now();
        let (first, _) = merge(
            &Snapshot::empty(1),
            vec![container("a1", "demo-web-1", Some("demo"), "web")],
            &demo_stack(),
            now,
            1,
        );
        let (second, changes) = merge(
            &first,
            vec![container("b2", "demo-web-1", Some("demo"), "web")],
            &demo_stack(),
            now,
            1,
        );
        assert_eq!(first.containers[0].key, second.containers[0].key);
        assert_eq!(second.containers[0].id, "b2");
        assert_eq!(changes.changed, vec![second.containers[0].key.clone()]);
        assert!(changes.added.is_empty());
    }

    #[test]
    fn absent_container_goes_missing_then_removed_then_purged() {
        let now = Utc::now();
        let (s1, _) = merge(
            &Snapshot::empty(1),
            vec![container("a1", "solo", None, "")],
            &[],
            now,
            1,
        );
        let (s2, c2) = merge(&s1, vec![], &[], now, 1);
        assert_eq!(s2.containers[0].presence, Presence::Missing { cycles: 1 });
        assert!(c2.removed.is_empty());

        let (s3, c3) = merge(&s2, vec![], &[], now, 1);
        assert_eq!(s3.containers[0].presence, Presence::Removed);
        assert_eq!(c3.removed.len(), 1);

        let (s4, _) = merge(&s3, vec![], &[], now, 1);
        assert!(s4.containers.is_empty());
    }

    #[test]
    fn zero_grace_removes_on_first_miss() {
        let now = Utc::now();
        let (s1, _) = merge(
            &Snapshot::empty(1),
            vec![container("a1", "solo", None, "")],
            &[],
            now,
            0,
        );
        let (s2, _) = merge(&s1, vec![], &[], now, 0);
        assert_eq!(s2.containers[0].presence, Presence::Removed);
    }

    #[test]
    fn stack_members_ordered_by_service() {
        let (s, _) = merge(
            &Snapshot::empty(1),
            vec![
                container("w", "demo-web-1", Some("Demo"), "web"),
                container("d", "demo-db-1", Some("demo"), "db"),
                container("x", "standalone", None, ""),
            ],
            &demo_stack(),
            Utc::now(),
            1,
        );
        let stack = s.stack(7).unwrap();
        assert_eq!(stack.members, vec!["d".to_string(), "w".to_string()]);
        assert_eq!(stack.status, StackStatus::Running);
        assert!(s.container_by_id("x").unwrap().stack.is_none());
    }

    #[test]
    fn degrade_keeps_state_and_counts_failures() {
        let now = Utc::now();
        let (s1, _) = merge(
            &Snapshot::empty(3),
            vec![container("a1", "solo", None, "")],
            &[],
            now,
            1,
        );
        let d1 = degrade(&s1, &RemoteError::Network("timeout".into()), now);
        let d2 = degrade(&d1, &RemoteError::NotFound("endpoint 3".into()), now);
        assert_eq!(d2.containers, s1.containers);
        let deg = d2.degraded.unwrap();
        assert_eq!(deg.kind, FailureKind::NotFound);
        assert_eq!(deg.consecutive_failures, 2);
        assert!(deg.message.contains("check the configured endpoint id"));
        assert_eq!(d2.version, s1.version + 2);
    }
}
