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

pub mod config;
pub mod proxy;
pub mod replicate;
pub mod replication_pool;
pub mod replication_resyncer;
pub mod replication_stats;

pub use config::{ObjectOpts, ReplicationConfiguration};
pub use proxy::{proxy_get_to_replication_target, proxy_head_to_replication_target};
pub use replicate::{
    DeletedObjectReplicationInfo, MustReplicateOptions, ReplicateObjectInfo, check_replicate_delete, get_replication_action,
    must_replicate, replicate_delete, replicate_object,
};
pub use replication_pool::{
    ReplicationPool, ReplicationPoolOpts, ReplicationPriority, global_replication_pool, init_background_replication,
    schedule_replication, schedule_replication_delete,
};
pub use replication_resyncer::{
    BucketReplicationResyncStatus, ReplicationConfig, ReplicationResyncer, ResyncOpts, ResyncStatusType,
    TargetReplicationResyncStatus, get_heal_replicate_object_info, resync_target,
};
pub use replication_stats::{BucketReplicationStats, ReplicationStats, global_replication_stats};
