use std::collections::{BTreeMap, BTreeSet};

use crate::services::registry::{FetchDelta, RegistryEntry, RegistrySnapshot};

/// 本轮拉取应走的路径
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchPlan {
    UpToDate,
    Delta { since: u64 },
    Full,
    /// 远端版本低于本地：注册中心已重置，按远端版本重新全量拉取
    Resync { remote: u64 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeltaRejection {
    /// 增量起点与本地版本不一致，需要全量拉取
    Gap { local: Option<u64>, from: u64 },
    /// 增量比本地已应用的版本旧，丢弃
    Stale { local: u64, version: u64 },
}

/// 拉取任务持有的工作副本：已应用的版本号和按服务名分组的实例
#[derive(Debug, Clone, Default)]
pub struct FetchState {
    version: Option<u64>,
    entries: BTreeMap<String, RegistryEntry>,
}

impl FetchState {
    pub fn version(&self) -> Option<u64> {
        self.version
    }

    pub fn entry(&self, service_name: &str) -> Option<&RegistryEntry> {
        self.entries.get(service_name)
    }

    pub fn plan(&self, remote_version: u64) -> FetchPlan {
        match self.version {
            None => FetchPlan::Full,
            Some(local) if remote_version < local => FetchPlan::Resync { remote: remote_version },
            Some(local) if remote_version == local => FetchPlan::UpToDate,
            Some(local) if remote_version == local + 1 => FetchPlan::Delta { since: local },
            Some(_) => FetchPlan::Full,
        }
    }

    /// 用全量快照整体替换；快照比已应用版本旧时返回 None
    pub fn apply_full(&mut self, snapshot: RegistrySnapshot) -> Option<Vec<RegistryEntry>> {
        self.replace(snapshot, self.version)
    }

    /// 注册中心重置后的全量替换，只丢弃比本轮观察到的远端版本更旧的快照
    pub fn apply_resync(&mut self, snapshot: RegistrySnapshot, observed: u64) -> Option<Vec<RegistryEntry>> {
        self.replace(snapshot, Some(observed))
    }

    fn replace(&mut self, snapshot: RegistrySnapshot, floor: Option<u64>) -> Option<Vec<RegistryEntry>> {
        if floor.is_some_and(|floor| snapshot.version < floor) {
            return None;
        }

        let mut next: BTreeMap<String, RegistryEntry> = BTreeMap::new();
        for instance in snapshot.instances {
            next.entry(instance.service_name().to_string())
                .or_insert_with_key(|name| RegistryEntry::empty(name.clone()))
                .upsert(instance);
        }

        let names: BTreeSet<String> = self.entries.keys().chain(next.keys()).cloned().collect();
        let changed = names
            .into_iter()
            .filter_map(|name| match (self.entries.get(&name), next.get(&name)) {
                (Some(old), Some(new)) if old == new => None,
                (_, Some(new)) => Some(new.clone()),
                (Some(_), None) => Some(RegistryEntry::empty(name)),
                (None, None) => None,
            })
            .collect();

        self.entries = next;
        self.version = Some(snapshot.version);
        Some(changed)
    }

    /// 应用增量，返回实际发生变化的服务
    pub fn apply_delta(&mut self, delta: FetchDelta) -> Result<Vec<RegistryEntry>, DeltaRejection> {
        match self.version {
            Some(local) if delta.version <= local => {
                return Err(DeltaRejection::Stale {
                    local,
                    version: delta.version,
                });
            }
            Some(local) if delta.from_version == local => {}
            other => {
                return Err(DeltaRejection::Gap {
                    local: other,
                    from: delta.from_version,
                });
            }
        }

        // 只复制受影响的服务，按 新增 -> 变更 -> 删除 的顺序应用
        let mut touched: BTreeMap<String, RegistryEntry> = BTreeMap::new();
        for instance in delta.added {
            let name = instance.service_name().to_string();
            working_entry(&mut touched, &self.entries, &name).upsert(instance);
        }
        for instance in delta.changed {
            let name = instance.service_name().to_string();
            working_entry(&mut touched, &self.entries, &name).merge_change(instance);
        }
        for key in delta.removed {
            working_entry(&mut touched, &self.entries, &key.service_name).remove(&key.instance_id);
        }

        let mut changed = Vec::new();
        for (name, entry) in touched {
            let before = self.entries.get(&name);
            let unchanged = match before {
                Some(old) => *old == entry,
                None => entry.is_empty(),
            };
            if unchanged {
                continue;
            }
            if entry.is_empty() {
                self.entries.remove(&name);
            } else {
                self.entries.insert(name, entry.clone());
            }
            changed.push(entry);
        }

        self.version = Some(delta.version);
        Ok(changed)
    }
}

fn working_entry<'a>(
    touched: &'a mut BTreeMap<String, RegistryEntry>,
    entries: &BTreeMap<String, RegistryEntry>,
    name: &str,
) -> &'a mut RegistryEntry {
    touched.entry(name.to_string()).or_insert_with(|| {
        entries
            .get(name)
            .cloned()
            .unwrap_or_else(|| RegistryEntry::empty(name))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::instance::{InstanceDescriptor, InstanceKey, InstanceStatus};

    fn instance(service: &str, id: &str, status: InstanceStatus) -> InstanceDescriptor {
        InstanceDescriptor::builder(service, "10.0.0.1", 8080)
            .instance_id(id)
            .status(status)
            .last_updated(std::time::UNIX_EPOCH)
            .build()
            .unwrap()
    }

    fn full(version: u64, instances: Vec<InstanceDescriptor>) -> RegistrySnapshot {
        RegistrySnapshot { version, instances }
    }

    #[test]
    fn test_plan_selection() {
        let mut state = FetchState::default();
        assert_eq!(state.plan(5), FetchPlan::Full);
        state.apply_full(full(5, vec![])).unwrap();
        assert_eq!(state.plan(5), FetchPlan::UpToDate);
        assert_eq!(state.plan(4), FetchPlan::Resync { remote: 4 });
        assert_eq!(state.plan(6), FetchPlan::Delta { since: 5 });
        assert_eq!(state.plan(7), FetchPlan::Full);
    }

    #[test]
    fn test_delta_changes_and_removes() {
        let mut state = FetchState::default();
        state
            .apply_full(full(
                1,
                vec![
                    instance("svc", "A", InstanceStatus::Up),
                    instance("svc", "B", InstanceStatus::Up),
                ],
            ))
            .unwrap();

        let changed = state
            .apply_delta(FetchDelta {
                from_version: 1,
                version: 2,
                added: vec![],
                changed: vec![instance("svc", "A", InstanceStatus::Down)],
                removed: vec![InstanceKey::new("svc", "B")],
            })
            .unwrap();

        assert_eq!(changed.len(), 1);
        let entry = state.entry("svc").unwrap();
        assert_eq!(entry.len(), 1);
        assert_eq!(entry.instances[0].instance_id(), "A");
        assert_eq!(entry.instances[0].status(), InstanceStatus::Down);
        assert_eq!(state.version(), Some(2));
    }

    #[test]
    fn test_unchanged_full_fetch_reports_nothing() {
        let mut state = FetchState::default();
        let snapshot = full(1, vec![instance("svc", "A", InstanceStatus::Up)]);
        assert_eq!(state.apply_full(snapshot.clone()).unwrap().len(), 1);

        let mut same = snapshot;
        same.version = 3;
        assert!(state.apply_full(same).unwrap().is_empty());
    }

    #[test]
    fn test_removed_service_reported_as_empty_entry() {
        let mut state = FetchState::default();
        state
            .apply_full(full(1, vec![instance("gone", "A", InstanceStatus::Up)]))
            .unwrap();

        let changed = state.apply_full(full(2, vec![])).unwrap();
        assert_eq!(changed, vec![RegistryEntry::empty("gone")]);
        assert!(state.entry("gone").is_none());
    }

    #[test]
    fn test_stale_snapshot_and_delta_are_discarded() {
        let mut state = FetchState::default();
        state
            .apply_full(full(10, vec![instance("svc", "A", InstanceStatus::Down)]))
            .unwrap();

        // 网络乱序：旧版本的数据后到
        assert!(state
            .apply_full(full(9, vec![instance("svc", "A", InstanceStatus::Up)]))
            .is_none());
        assert_eq!(
            state.apply_delta(FetchDelta {
                from_version: 9,
                version: 10,
                changed: vec![instance("svc", "A", InstanceStatus::Up)],
                ..FetchDelta::default()
            }),
            Err(DeltaRejection::Stale { local: 10, version: 10 })
        );
        assert_eq!(state.entry("svc").unwrap().instances[0].status(), InstanceStatus::Down);
        assert_eq!(state.version(), Some(10));
    }

    #[test]
    fn test_delta_gap_is_rejected() {
        let mut state = FetchState::default();
        assert!(matches!(
            state.apply_delta(FetchDelta {
                from_version: 0,
                version: 1,
                ..FetchDelta::default()
            }),
            Err(DeltaRejection::Gap { local: None, .. })
        ));

        state.apply_full(full(3, vec![])).unwrap();
        assert_eq!(
            state.apply_delta(FetchDelta {
                from_version: 4,
                version: 5,
                ..FetchDelta::default()
            }),
            Err(DeltaRejection::Gap { local: Some(3), from: 4 })
        );
    }

    #[test]
    fn test_registry_reset_rebuilds_from_lower_version() {
        let mut state = FetchState::default();
        state
            .apply_full(full(
                10,
                vec![
                    instance("svc", "A", InstanceStatus::Up),
                    instance("old", "B", InstanceStatus::Up),
                ],
            ))
            .unwrap();

        // 注册中心重启后版本从头计数
        assert_eq!(state.plan(2), FetchPlan::Resync { remote: 2 });
        assert!(state
            .apply_resync(full(1, vec![instance("svc", "A", InstanceStatus::Down)]), 2)
            .is_none());
        assert_eq!(state.version(), Some(10));

        let changed = state
            .apply_resync(full(2, vec![instance("svc", "C", InstanceStatus::Up)]), 2)
            .unwrap();
        assert_eq!(changed.len(), 2);
        assert!(changed.contains(&RegistryEntry::empty("old")));
        assert_eq!(state.version(), Some(2));
        assert_eq!(state.entry("svc").unwrap().instances[0].instance_id(), "C");
        assert!(state.entry("old").is_none());

        // 重建后恢复正常的增量路径
        assert_eq!(state.plan(3), FetchPlan::Delta { since: 2 });
    }

    #[test]
    fn test_change_for_unknown_instance_is_added() {
        let mut state = FetchState::default();
        state.apply_full(full(1, vec![])).unwrap();
        let changed = state
            .apply_delta(FetchDelta {
                from_version: 1,
                version: 2,
                changed: vec![instance("new", "X", InstanceStatus::Up)],
                ..FetchDelta::default()
            })
            .unwrap();
        assert_eq!(changed.len(), 1);
        assert_eq!(state.entry("new").unwrap().len(), 1);
    }
}
