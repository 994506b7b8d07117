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

//! System config files stored as regular objects under the meta bucket,
//! written with maximum parity so they outlive drive loss.

use crate::disk::GARNET_META_BUCKET;
use crate::error::{Error, Result, is_err_object_not_found};
use crate::store_api::{ObjectIO, ObjectOptions, PutObjReader, StorageAPI};
use http::HeaderMap;
use std::sync::Arc;

pub async fn read_config<S: StorageAPI>(api: Arc<S>, config_file: &str) -> Result<Vec<u8>> {
    let mut reader = match api
        .get_object_reader(GARNET_META_BUCKET, config_file, None, HeaderMap::new(), &ObjectOptions::default())
        .await
    {
        Ok(reader) => reader,
        Err(err) => {
            if is_err_object_not_found(&err) {
                return Err(Error::ConfigNotFound);
            }
            return Err(err);
        }
    };

    reader.read_all().await
}

pub async fn save_config<S: StorageAPI>(api: Arc<S>, config_file: &str, data: Vec<u8>) -> Result<()> {
    let mut reader = PutObjReader::from_vec(data);
    api.put_object(
        GARNET_META_BUCKET,
        config_file,
        &mut reader,
        &ObjectOptions {
            max_parity: true,
            ..Default::default()
        },
    )
    .await?;
    Ok(())
}

pub async fn delete_config<S: StorageAPI>(api: Arc<S>, config_file: &str) -> Result<()> {
    api.delete_object(
        GARNET_META_BUCKET,
        config_file,
        ObjectOptions {
            delete_prefix: true,
            ..Default::default()
        },
    )
    .await?;
    Ok(())
}
