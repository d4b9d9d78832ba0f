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

//! Recursive hierarchical clustering coordinator for a knowledge-graph
//! construction pipeline. Entities cluster into leaders, leaders get
//! described, described leaders cluster again one layer up, until every
//! branch joins, dissolves, or hits the recursion cap.

pub mod arke;
pub mod cluster;
pub mod config;
pub mod describe;
pub mod handoff;
pub mod klados_log;
pub mod llm;
pub mod observer;
pub mod scatter;
pub mod workflow;

// Deterministic fixture exposed for integration tests.
pub mod sim;
