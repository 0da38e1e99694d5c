//! Background maintenance decisions: refresh, replicate, republish and expire.

use std::time::Instant;

use crate::common::{Id, RoutingTable};

use super::server::RecordStore;
use super::Timings;

/// Maintenance state
#[derive(Debug)]
pub struct Maintenance {
    timings: Timings,
    last_replicate: Instant,
}

/// What maintenance is due at a given instant.
#[derive(Debug, Default, PartialEq)]
pub struct MaintenanceDecisions {
    /// The routing table is empty, bootstrap again instead of refreshing.
    pub rejoin: bool,
    /// A random target in each stale bucket, to look up.
    pub refresh_targets: Vec<Id>,
    /// Keys to store again at the closest nodes, with every publisher but this node.
    pub replicate: Vec<Id>,
    /// Keys this node announced, due to be announced again.
    pub republish: Vec<Id>,
}

impl Maintenance {
    pub fn new(timings: Timings) -> Self {
        Self::new_at(timings, Instant::now())
    }

    fn new_at(timings: Timings, now: Instant) -> Self {
        Maintenance {
            timings,
            last_replicate: now,
        }
    }

    /// Determine what maintenance operations should be performed.
    ///
    /// Resets the replication timer when it elapses.
    pub fn decisions(
        &mut self,
        routing_table: &RoutingTable,
        records: &RecordStore,
    ) -> MaintenanceDecisions {
        self.decisions_at(Instant::now(), routing_table, records)
    }

    fn decisions_at(
        &mut self,
        now: Instant,
        routing_table: &RoutingTable,
        records: &RecordStore,
    ) -> MaintenanceDecisions {
        let stale = routing_table.stale_buckets_at(self.timings.refresh, now);

        let (rejoin, refresh_targets) = if routing_table.is_empty() {
            (!stale.is_empty(), vec![])
        } else {
            (
                false,
                stale
                    .into_iter()
                    .map(|index| routing_table.random_id_in_bucket(index))
                    .collect(),
            )
        };

        let replicate =
            if now.saturating_duration_since(self.last_replicate) >= self.timings.replicate {
                self.last_replicate = now;

                records.keys()
            } else {
                vec![]
            };

        MaintenanceDecisions {
            rejoin,
            refresh_targets,
            replicate,
            republish: records.due_for_republish(now),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::net::SocketAddrV4;
    use std::time::Duration;

    use crate::common::Node;

    use super::*;

    fn timings() -> Timings {
        Timings {
            expire: Duration::from_secs(1000),
            refresh: Duration::from_secs(100),
            replicate: Duration::from_secs(100),
            republish: Duration::from_secs(500),
            maintenance_interval: Duration::from_secs(1),
        }
    }

    fn publisher() -> Node {
        Node::new(Id::random(), SocketAddrV4::new([127, 0, 0, 1].into(), 3333))
    }

    #[test]
    fn nothing_due_at_start() {
        let now = Instant::now();
        let mut maintenance = Maintenance::new_at(timings(), now);

        let mut table = RoutingTable::new(Id::random());
        table.update_at(Node::random(), now);

        let records = RecordStore::new(timings().expire, timings().republish);

        assert_eq!(
            maintenance.decisions_at(now, &table, &records),
            MaintenanceDecisions::default()
        );
    }

    #[test]
    fn refresh_stale_buckets() {
        let now = Instant::now();
        let mut maintenance = Maintenance::new_at(timings(), now);

        let id = Id::random();
        let mut table = RoutingTable::new(id);
        table.update_at(Node::random(), now);

        let records = RecordStore::new(timings().expire, timings().republish);

        let decisions = maintenance.decisions_at(now + timings().refresh, &table, &records);

        assert!(!decisions.rejoin);
        assert_eq!(decisions.refresh_targets.len(), 1);
    }

    #[test]
    fn rejoin_when_empty() {
        let now = Instant::now();
        let mut maintenance = Maintenance::new_at(timings(), now);

        let table = RoutingTable::new(Id::random());
        let records = RecordStore::new(timings().expire, timings().republish);

        let decisions = maintenance.decisions_at(now + timings().refresh * 2, &table, &records);

        assert!(decisions.rejoin);
        assert!(decisions.refresh_targets.is_empty());
    }

    #[test]
    fn replicate_then_republish() {
        let now = Instant::now();
        let mut maintenance = Maintenance::new_at(timings(), now);

        let mut table = RoutingTable::new(Id::random());
        table.update_at(Node::random(), now + timings().republish);

        let mut records = RecordStore::new(timings().expire, timings().republish);

        let stored = Id::random();
        let announced = Id::random();
        records.insert_at(stored, publisher(), now);
        records.publish_at(announced, publisher(), now);

        let decisions = maintenance.decisions_at(now + timings().replicate, &table, &records);
        let mut replicate = decisions.replicate.clone();
        replicate.sort();
        let mut expected = vec![stored, announced];
        expected.sort();
        assert_eq!(replicate, expected);
        assert!(decisions.republish.is_empty());

        // Replication timer was reset.
        let decisions = maintenance.decisions_at(
            now + timings().replicate + Duration::from_secs(1),
            &table,
            &records,
        );
        assert!(decisions.replicate.is_empty());

        let decisions = maintenance.decisions_at(now + timings().republish, &table, &records);
        assert_eq!(decisions.republish, vec![announced]);
    }

    #[test]
    fn replicate_other_publishers_of_announced_keys() {
        let now = Instant::now();
        let mut maintenance = Maintenance::new_at(timings(), now);

        let table = RoutingTable::new(Id::random());
        let mut records = RecordStore::new(timings().expire, timings().republish);

        let key = Id::random();
        records.insert_at(key, publisher(), now);
        records.publish_at(key, publisher(), now);

        let decisions = maintenance.decisions_at(now + timings().replicate, &table, &records);

        assert_eq!(decisions.replicate, vec![key]);
        assert!(decisions.republish.is_empty());
    }
}
