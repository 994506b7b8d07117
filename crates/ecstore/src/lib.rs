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

//! GarnetFS erasure-coded storage engine and cross-site replication
//! pipeline: the disk abstraction, erasure sets, server pools, namespace
//! locking glue, and the replication decision/pool/resync/proxy stack.

pub mod bucket;
pub mod config;
pub mod disk;
pub mod erasure_coding;
pub mod error;
pub mod event_notification;
pub mod global;
pub mod set_disk;
pub mod sets;
pub mod store;
pub mod store_api;

pub use error::{Error, Result};
pub use global::{new_object_layer_fn, set_object_layer};
pub use set_disk::SetDisks;
pub use sets::Sets;
pub use store::ECStore;
pub use store_api::{ObjectIO, StorageAPI};
