// Copyright 2025 Kladograph Project
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

pub mod connection;
pub mod http;
pub mod memstore;
pub mod models;

pub use connection::{ArkeConnection, IndexMarker};
pub use memstore::MemStore;
pub use models::{
    entity_types, predicates, AdditiveUpdate, Entity, NewEntity, Relationship, SearchHit,
    LAYER_PROP,
};
