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

//! Active-active read proxying. When the local site would 404 a GET/HEAD
//! and the bucket has online active-active peers, the request is answered
//! from the first peer that has the version. A proxy marker header breaks
//! request loops between sites.

use crate::bucket::metadata_sys;
use crate::bucket::replication::config::ObjectOpts;
use crate::bucket::target_sys::{BucketTargetSys, RemoteObjectInfo, StatObjectOptions, TargetClient};
use crate::store_api::{GetObjectReader, ObjectInfo, ObjectOptions};
use garnetfs_filemeta::ReplicationType;
use garnetfs_utils::http::GARNET_REPLICATION_PROXY_REQUEST;
use http::HeaderMap;
use std::sync::Arc;
use tracing::debug;
use uuid::Uuid;

/// Targets eligible to answer a proxied read for this object.
pub async fn get_proxy_targets(bucket: &str, object: &str, h: &HeaderMap) -> Vec<Arc<TargetClient>> {
    // A request already proxied by a peer must not be proxied again.
    if h.get(GARNET_REPLICATION_PROXY_REQUEST).is_some() {
        return Vec::new();
    }

    let Ok((cfg, _)) = metadata_sys::get_replication_config(bucket).await else {
        return Vec::new();
    };

    let arns = cfg.filter_target_arns(&ObjectOpts {
        name: object.to_string(),
        op_type: ReplicationType::All,
        ..Default::default()
    });

    let mut out = Vec::new();
    for arn in arns {
        let Some(client) = BucketTargetSys::get().get_remote_target_client(bucket, &arn).await else {
            continue;
        };
        if client.disable_proxy {
            continue;
        }
        if BucketTargetSys::get().is_offline(&client.to_url()).await {
            continue;
        }
        out.push(client);
    }
    out
}

/// Maps the remote metadata into the local ObjectInfo shape.
fn to_object_info(bucket: &str, object: &str, remote: &RemoteObjectInfo) -> ObjectInfo {
    ObjectInfo {
        bucket: bucket.to_string(),
        name: object.to_string(),
        etag: remote.etag.clone(),
        size: remote.size,
        actual_size: remote.size,
        mod_time: remote.last_modified,
        version_id: remote.version_id.as_deref().and_then(|v| Uuid::parse_str(v).ok()),
        delete_marker: remote.delete_marker,
        content_type: remote.content_type.clone(),
        user_defined: remote.metadata.clone(),
        user_tags: remote.user_tags.clone(),
        replication_status: remote.replication_status.clone(),
        ..Default::default()
    }
}

/// HEAD proxy: first online peer holding the version answers.
pub async fn proxy_head_to_replication_target(
    bucket: &str,
    object: &str,
    opts: &ObjectOptions,
    h: &HeaderMap,
) -> Option<(ObjectInfo, Arc<TargetClient>)> {
    let targets = get_proxy_targets(bucket, object, h).await;

    for target in targets {
        let sopts = StatObjectOptions {
            version_id: opts.version_id.clone().unwrap_or_default(),
            replication_proxy_request: true,
        };

        match target.api.head_object(&target.bucket, object, &sopts).await {
            Ok(remote) => {
                return Some((to_object_info(bucket, object, &remote), target));
            }
            Err(err) => {
                debug!("proxy head to {} failed for {}/{}: {}", target.arn, bucket, object, err);
            }
        }
    }

    None
}

/// GET proxy: streams the object back from the first peer that has it.
pub async fn proxy_get_to_replication_target(
    bucket: &str,
    object: &str,
    opts: &ObjectOptions,
    h: &HeaderMap,
) -> Option<GetObjectReader> {
    let targets = get_proxy_targets(bucket, object, h).await;

    for target in targets {
        let sopts = StatObjectOptions {
            version_id: opts.version_id.clone().unwrap_or_default(),
            replication_proxy_request: true,
        };

        match target.api.get_object(&target.bucket, object, &sopts).await {
            Ok((remote, body)) => {
                let object_info = to_object_info(bucket, object, &remote);
                return Some(GetObjectReader {
                    stream: Box::new(std::io::Cursor::new(body.to_vec())),
                    object_info,
                });
            }
            Err(err) => {
                debug!("proxy get to {} failed for {}/{}: {}", target.arn, bucket, object, err);
            }
        }
    }

    None
}
