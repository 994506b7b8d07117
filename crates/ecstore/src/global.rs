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

//! Process-wide registration points. Tests substitute collaborators by
//! simply not initializing the globals they do not need.

use crate::store::ECStore;
use std::sync::{Arc, OnceLock};
use uuid::Uuid;

static GLOBAL_OBJECT_API: OnceLock<Arc<ECStore>> = OnceLock::new();
static GLOBAL_DEPLOYMENT_ID: OnceLock<Uuid> = OnceLock::new();
static GLOBAL_LOCAL_NODE_NAME: OnceLock<String> = OnceLock::new();

pub fn set_object_layer(store: Arc<ECStore>) {
    let _ = GLOBAL_OBJECT_API.set(store);
}

/// The registered object layer, `None` until the pools finish booting.
pub fn new_object_layer_fn() -> Option<Arc<ECStore>> {
    GLOBAL_OBJECT_API.get().cloned()
}

pub fn set_global_deployment_id(id: Uuid) {
    let _ = GLOBAL_DEPLOYMENT_ID.set(id);
}

pub fn get_global_deployment_id() -> Option<Uuid> {
    GLOBAL_DEPLOYMENT_ID.get().copied()
}

pub fn set_global_local_node_name(name: String) {
    let _ = GLOBAL_LOCAL_NODE_NAME.set(name);
}

pub fn global_local_node_name() -> String {
    GLOBAL_LOCAL_NODE_NAME.get().cloned().unwrap_or_else(|| "localhost".to_string())
}
