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

//! Notification boundary. The transport lives outside the core; callers
//! register a sink and every replication attempt and object mutation
//! reports through it. Events double as the audit trail for operators
//! diagnosing replication lag.

use crate::store_api::ObjectInfo;
use std::sync::{Arc, OnceLock, RwLock};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventName {
    ObjectCreatedPut,
    ObjectCreatedCompleteMultipartUpload,
    ObjectRemovedDelete,
    ObjectRemovedDeleteMarkerCreated,
    ObjectReplicationComplete,
    ObjectReplicationFailed,
    ObjectReplicationNotTracked,
    ObjectReplicationMissedThreshold,
}

impl AsRef<str> for EventName {
    fn as_ref(&self) -> &str {
        match self {
            EventName::ObjectCreatedPut => "s3:ObjectCreated:Put",
            EventName::ObjectCreatedCompleteMultipartUpload => "s3:ObjectCreated:CompleteMultipartUpload",
            EventName::ObjectRemovedDelete => "s3:ObjectRemoved:Delete",
            EventName::ObjectRemovedDeleteMarkerCreated => "s3:ObjectRemoved:DeleteMarkerCreated",
            EventName::ObjectReplicationComplete => "s3:Replication:OperationCompletedReplication",
            EventName::ObjectReplicationFailed => "s3:Replication:OperationFailedReplication",
            EventName::ObjectReplicationNotTracked => "s3:Replication:OperationNotTracked",
            EventName::ObjectReplicationMissedThreshold => "s3:Replication:OperationMissedThreshold",
        }
    }
}

#[derive(Debug, Default, Clone)]
pub struct EventArgs {
    pub event_name: String,
    pub bucket_name: String,
    pub object: ObjectInfo,
    pub user_agent: String,
    pub host: String,
}

/// Sink the excluded frontend wires in; tests install a recorder.
pub trait EventSink: Send + Sync {
    fn send(&self, args: EventArgs);
}

type SharedSink = Arc<dyn EventSink>;

static GLOBAL_EVENT_SINK: OnceLock<RwLock<Option<SharedSink>>> = OnceLock::new();

fn sink_cell() -> &'static RwLock<Option<SharedSink>> {
    GLOBAL_EVENT_SINK.get_or_init(|| RwLock::new(None))
}

pub fn register_event_sink(sink: SharedSink) {
    if let Ok(mut guard) = sink_cell().write() {
        *guard = Some(sink);
    }
}

/// Fire-and-forget; an unconfigured sink drops the event.
pub fn send_event(args: EventArgs) {
    if let Ok(guard) = sink_cell().read() {
        if let Some(sink) = guard.as_ref() {
            sink.send(args);
        }
    }
}
